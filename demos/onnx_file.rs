//! Example: Enhance an audio file with exported DeepFilterNet ONNX models
//!
//! The model directory must contain `enc.onnx`, `erb_dec.onnx`, `df_dec.onnx`
//! and usually `config.ini`. Folders ending in `_h0` use the stateful encoder.
//!
//! Usage: cargo run --features onnx --example onnx_file -- input.wav output.wav [model_dir] [threads]

use df_stream::{DeepFilterProcessor, EnhancerConfig, OnnxBackend, TimedBackend, HOP_SIZE, SAMPLE_RATE};
use std::path::Path;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [model_dir] [threads]", args[0]);
        std::process::exit(1);
    }
    let model_dir = match args.get(3) {
        Some(dir) => Path::new(dir).to_path_buf(),
        None => Path::new(env!("CARGO_MANIFEST_DIR")).join("models/dfn3_h0"),
    };
    let threads: Option<usize> = args.get(4).map(|s| s.parse()).transpose()?;

    println!("Loading models from {:?}...", model_dir);
    let config = EnhancerConfig::from_model_dir(&model_dir)?;
    let onnx = OnnxBackend::open(&model_dir, &config, threads)?;
    // Keep inference off the processing thread so slow calls can be abandoned.
    let backend = TimedBackend::spawn(onnx, config.inference_timeout())?;
    let mut processor = DeepFilterProcessor::new(backend, config)?;
    processor.warmup()?;
    println!(
        "Inference mode: {}, latency {:.1}ms",
        if processor.config().stateful { "stateful (h0)" } else { "stateless" },
        processor.latency_ms()
    );

    let mut reader = hound::WavReader::open(&args[1])?;
    let spec = reader.spec();
    if spec.sample_rate != SAMPLE_RATE as u32 {
        eprintln!("Warning: Input sample rate {} != expected {}. Resample first!", spec.sample_rate, SAMPLE_RATE);
    }
    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader.samples::<f32>().collect::<Result<_, _>>()?,
        hound::SampleFormat::Int => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()?,
    };
    let mono: Vec<f32> = samples.chunks(spec.channels.max(1) as usize).map(|c| c[0]).collect();

    let start = std::time::Instant::now();
    let mut output = Vec::with_capacity(mono.len());
    let mut frame_out = vec![0.0f32; HOP_SIZE];
    for chunk in mono.chunks(HOP_SIZE) {
        let mut frame_in = chunk.to_vec();
        frame_in.resize(HOP_SIZE, 0.0);
        processor.process_frame(&frame_in, &mut frame_out);
        output.extend_from_slice(&frame_out[..chunk.len()]);
    }
    let elapsed = start.elapsed();
    let rtf = elapsed.as_secs_f32() / (mono.len() as f32 / SAMPLE_RATE as f32);
    println!("Done in {:.2}s (RTF: {:.3}x realtime)", elapsed.as_secs_f32(), rtf);
    println!("{:#?}", processor.diagnostics().snapshot());

    let out_spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&args[2], out_spec)?;
    for sample in &output {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;
    println!("Saved to {}", args[2]);
    Ok(())
}
