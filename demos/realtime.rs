//! Example: Real-time session with paced capture/render callbacks
//!
//! A capture thread pushes 10ms chunks into the engine at wall-clock pace and
//! a render thread pulls them back out, as an audio driver would. The
//! processing thread sits in between. Backend latency can be injected to
//! watch bypass and underrun counters move.
//!
//! Usage: cargo run --example realtime -- input.wav output.wav [slow_every_n_frames]

use df_stream::backend::ENCODER;
use df_stream::{DeepFilterProcessor, EnhancerConfig, SimulatedBackend, StreamEngine, HOP_SIZE, SAMPLE_RATE};
use std::time::{Duration, Instant};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 3 {
        eprintln!("Usage: {} <input.wav> <output.wav> [slow_every_n_frames]", args[0]);
        std::process::exit(1);
    }
    let slow_every: Option<u64> = args.get(3).map(|s| s.parse()).transpose()?;

    let mut reader = hound::WavReader::open(&args[1])?;
    let channels = reader.spec().channels.max(1) as usize;
    let samples: Vec<f32> = reader
        .samples::<i16>()
        .map(|s| s.map(|v| v as f32 / 32768.0))
        .collect::<Result<_, _>>()?;
    let mono: Vec<f32> = samples.chunks(channels).map(|c| c[0]).collect();

    let config = EnhancerConfig::default();
    let mut backend = SimulatedBackend::from_config(&config).with_mask_gain(0.5);
    if let Some(n) = slow_every.filter(|&n| n > 0) {
        // Encoder calls 0..3 belong to warmup
        let total_frames = (mono.len() / HOP_SIZE) as u64;
        for call in (n..total_frames).step_by(n as usize) {
            backend = backend.delay_on_call(ENCODER, call + 3, config.inference_timeout() * 2);
        }
    }

    let mut processor = DeepFilterProcessor::new(backend, config)?;
    processor.warmup()?;
    let (engine, mut capture, mut render) = StreamEngine::new(processor);
    let handle = engine.spawn()?;

    let period = Duration::from_secs_f64(HOP_SIZE as f64 / SAMPLE_RATE as f64);
    let frames = mono.len() / HOP_SIZE;
    println!("Streaming {} frames at {:.1}ms per callback...", frames, period.as_secs_f64() * 1000.0);

    let input = mono.clone();
    let capture_thread = std::thread::spawn(move || {
        let start = Instant::now();
        for (i, chunk) in input.chunks_exact(HOP_SIZE).enumerate() {
            capture.push(chunk);
            let next = start + period * (i as u32 + 1);
            std::thread::sleep(next.saturating_duration_since(Instant::now()));
        }
    });

    // The render side starts one period late, the budget given to processing.
    std::thread::sleep(period);
    let mut output = Vec::with_capacity(frames * HOP_SIZE);
    let mut buf = vec![0.0f32; HOP_SIZE];
    let start = Instant::now();
    for i in 0..frames {
        render.pull(&mut buf);
        output.extend_from_slice(&buf);
        let next = start + period * (i as u32 + 1);
        std::thread::sleep(next.saturating_duration_since(Instant::now()));
    }

    if capture_thread.join().is_err() {
        return Err("capture thread panicked".into());
    }
    let snapshot = handle.snapshot();
    drop(handle);

    println!("{:#?}", snapshot);

    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: SAMPLE_RATE as u32,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(&args[2], spec)?;
    for sample in &output {
        writer.write_sample((sample.clamp(-1.0, 1.0) * 32767.0) as i16)?;
    }
    writer.finalize()?;
    println!("Saved to {}", args[2]);
    Ok(())
}
