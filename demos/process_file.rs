//! Example: Process an audio file through the full pipeline with the simulated model
//!
//! The simulated backend applies a constant ERB mask and identity deep-filter
//! taps, so this exercises every stage (and its timing) without model weights.
//!
//! Usage: cargo run --example process_file -- input.wav output.wav [mask_gain]

use df_stream::{DeepFilterProcessor, EnhancerConfig, FrameOutcome, SimulatedBackend, HOP_SIZE, SAMPLE_RATE};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [mask_gain]", args[0]);
        std::process::exit(1);
    }
    let input_path = &args[1];
    let output_path = &args[2];
    let mask_gain: f32 = args.get(3).map(|s| s.parse()).transpose()?.unwrap_or(0.5);

    let config = EnhancerConfig::default();
    let backend = SimulatedBackend::from_config(&config).with_mask_gain(mask_gain);
    let mut processor = DeepFilterProcessor::new(backend, config)?;
    processor.warmup()?;
    println!("Latency: {:.1}ms, mask gain {}", processor.latency_ms(), mask_gain);

    let mono = read_mono(input_path)?;
    println!("Processing {} samples ({:.2}s)...", mono.len(), mono.len() as f32 / SAMPLE_RATE as f32);

    let start = std::time::Instant::now();
    let mut output = Vec::with_capacity(mono.len() + HOP_SIZE);
    let mut frame_out = vec![0.0f32; HOP_SIZE];
    let mut bypassed = 0;
    for chunk in mono.chunks(HOP_SIZE) {
        // Pad the final partial frame with zeros
        let mut frame_in = chunk.to_vec();
        frame_in.resize(HOP_SIZE, 0.0);
        if let FrameOutcome::Bypassed(reason) = processor.process_frame(&frame_in, &mut frame_out) {
            bypassed += 1;
            log::debug!("frame bypassed: {:?}", reason);
        }
        output.extend_from_slice(&frame_out[..chunk.len()]);
    }

    let elapsed = start.elapsed();
    let rtf = elapsed.as_secs_f32() / (mono.len() as f32 / SAMPLE_RATE as f32);
    println!("Done in {:.2}s (RTF: {:.3}x realtime), {} frames bypassed", elapsed.as_secs_f32(), rtf, bypassed);
    println!("{:#?}", processor.diagnostics().snapshot());

    write_mono(output_path, &output)?;
    println!("Saved to {}", output_path);
    Ok(())
}

fn read_mono(path: &str) -> Result<Vec<f32>, Box<dyn std::error::Error>> {
    let mut reader = hound::WavReader::open(path)?;
    let spec = reader.spec();
    println!("Input: {} Hz, {} channels, {:?}", spec.sample_rate, spec.channels, spec.sample_format);
    if spec.sample_rate != SAMPLE_RATE as u32 {
        eprintln!("Warning: Input sample rate {} != expected {}. Resample first!", spec.sample_rate, SAMPLE_RATE);
    }

    let samples: Vec<f32> = match (spec.sample_format, spec.bits_per_sample) {
        (hound::SampleFormat::Float, _) => reader.samples::<f32>().collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, 16) => reader
            .samples::<i16>()
            .map(|s| s.map(|v| v as f32 / 32768.0))
            .collect::<Result<_, _>>()?,
        (hound::SampleFormat::Int, 24 | 32) => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<Result<_, _>>()?
        }
        (_, bits) => return Err(format!("Unsupported bits per sample: {}", bits).into()),
    };

    // Take the first channel of multi-channel files
    Ok(samples.chunks(spec.channels.max(1) as usize).map(|c| c[0]).collect())
}

fn write_mono(path: &str, samples: &[f32]) -> Result<(), hound::Error> {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec)?;
    for sample in samples {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()
}
