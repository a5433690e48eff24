//! Build script for df-stream
//!
//! With the `onnx` feature, fetches a prebuilt ONNX Runtime next to the crate
//! (the `ort` crate loads it dynamically at run time). The GPU variant is
//! fetched when `cuda` is enabled. Without `onnx` this does nothing.

use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

const ORT_VERSION: &str = "1.23.2";

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_ONNX");
    println!("cargo:rerun-if-env-changed=CARGO_FEATURE_CUDA");

    if env::var_os("CARGO_FEATURE_ONNX").is_none() {
        return;
    }

    let Some(manifest_dir) = env::var_os("CARGO_MANIFEST_DIR").map(PathBuf::from) else {
        return;
    };
    let target_os = env::var("CARGO_CFG_TARGET_OS").unwrap_or_else(|_| "linux".to_string());
    let target_arch = env::var("CARGO_CFG_TARGET_ARCH").unwrap_or_else(|_| "x86_64".to_string());
    let use_cuda = env::var_os("CARGO_FEATURE_CUDA").is_some();

    let Some((ort_folder, ort_url)) = ort_release(&target_os, &target_arch, use_cuda) else {
        println!("cargo:warning=No prebuilt ONNX Runtime for {}-{}", target_os, target_arch);
        return;
    };
    let ort_lib_dir = manifest_dir.join(&ort_folder).join("lib");

    if !ort_lib_dir.exists() {
        let variant = if use_cuda { "GPU" } else { "CPU" };
        println!("cargo:warning=ONNX Runtime {} not found, downloading v{}...", variant, ORT_VERSION);
        if let Err(e) = download_and_extract(&ort_url, &manifest_dir, &ort_folder) {
            println!("cargo:warning=Failed to download ONNX Runtime: {}", e);
            println!("cargo:warning=Please download manually from: {}", ort_url);
        }
    }

    println!("cargo:rustc-env=DF_STREAM_ORT_LIB_DIR={}", ort_lib_dir.display());
}

fn ort_release(target_os: &str, target_arch: &str, use_cuda: bool) -> Option<(String, String)> {
    let (platform, ext) = match (target_os, target_arch, use_cuda) {
        ("windows", "x86_64", true) => ("win-x64-gpu", "zip"),
        ("windows", "x86_64", false) => ("win-x64", "zip"),
        ("windows", "aarch64", _) => ("win-arm64", "zip"),
        ("linux", "x86_64", true) => ("linux-x64-gpu", "tgz"),
        ("linux", "x86_64", false) => ("linux-x64", "tgz"),
        ("linux", "aarch64", _) => ("linux-aarch64", "tgz"),
        ("macos", "x86_64", _) => ("osx-x64", "tgz"),
        ("macos", "aarch64", _) => ("osx-arm64", "tgz"),
        _ => return None,
    };
    let folder = format!("onnxruntime-{}-{}", platform, ORT_VERSION);
    let url = format!(
        "https://github.com/microsoft/onnxruntime/releases/download/v{}/{}.{}",
        ORT_VERSION, folder, ext
    );
    Some((folder, url))
}

fn run(cmd: &mut Command, what: &str) -> io::Result<()> {
    if cmd.status()?.success() {
        Ok(())
    } else {
        Err(io::Error::new(io::ErrorKind::Other, format!("{} failed", what)))
    }
}

fn download_and_extract(url: &str, dest_dir: &Path, folder_name: &str) -> io::Result<()> {
    let is_zip = url.ends_with(".zip");
    let archive = dest_dir.join(if is_zip { "onnxruntime.zip" } else { "onnxruntime.tgz" });

    // curl ships with Windows 10+, Linux and macOS
    run(Command::new("curl").arg("-L").arg("-o").arg(&archive).arg(url), "curl download")?;

    if is_zip && cfg!(target_os = "windows") {
        let script = format!(
            "Expand-Archive -Path '{}' -DestinationPath '{}' -Force",
            archive.display(),
            dest_dir.display()
        );
        run(Command::new("powershell").args(["-Command", &script]), "PowerShell extract")?;
    } else if is_zip {
        run(Command::new("unzip").arg("-o").arg(&archive).arg("-d").arg(dest_dir), "unzip")?;
    } else {
        run(Command::new("tar").arg("-xzf").arg(&archive).arg("-C").arg(dest_dir), "tar extract")?;
    }
    let _ = fs::remove_file(&archive);

    if !dest_dir.join(folder_name).exists() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Expected folder {} not found after extraction", folder_name),
        ));
    }
    println!("cargo:warning=ONNX Runtime {} ready", ORT_VERSION);
    Ok(())
}
