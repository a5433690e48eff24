//! Processing context and the real-time endpoints around it.
//!
//! ```text
//! capture callback ─► CaptureEndpoint ─► [input ring] ─► StreamEngine ─► [output ring] ─► RenderEndpoint ─► render callback
//! ```
//!
//! The endpoints only touch their ring and never block, allocate or lock, so
//! they can be driven from a hardware audio callback. All processing happens
//! in [`StreamEngine`], either stepped manually with [`StreamEngine::run_once`]
//! or on its own thread via [`StreamEngine::spawn`].

use crate::backend::InferenceBackend;
use crate::diagnostics::{Diagnostics, DiagnosticsSnapshot};
use crate::processor::{DeepFilterProcessor, FrameOutcome};
use crate::ring::{self, RingConsumer, RingMonitor, RingProducer, RingStats};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const IDLE_POLL: Duration = Duration::from_millis(1);

/// Producer end for the capture callback.
pub struct CaptureEndpoint {
    producer: RingProducer,
}

impl CaptureEndpoint {
    /// Hand captured samples to the engine. Returns how many were accepted.
    pub fn push(&mut self, samples: &[f32]) -> usize {
        self.producer.write(samples)
    }

    pub fn stats(&self) -> RingStats {
        self.producer.stats()
    }
}

/// Consumer end for the render callback.
pub struct RenderEndpoint {
    consumer: RingConsumer,
}

impl RenderEndpoint {
    /// Fill `out` with enhanced audio, padding with silence on underrun.
    pub fn pull(&mut self, out: &mut [f32]) -> usize {
        self.consumer.read(out)
    }

    pub fn available(&self) -> usize {
        self.consumer.available()
    }

    pub fn stats(&self) -> RingStats {
        self.consumer.stats()
    }
}

/// Requests a stream reset from any thread.
///
/// The processing context applies it between two frames, so model state,
/// filter history and transforms are always reset together.
#[derive(Clone)]
pub struct ResetHandle {
    generation: Arc<AtomicU64>,
}

impl ResetHandle {
    pub fn request_reset(&self) {
        self.generation.fetch_add(1, Ordering::Release);
    }
}

/// Point-in-time view of a running stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub diagnostics: DiagnosticsSnapshot,
    pub capture: RingStats,
    pub render: RingStats,
}

pub struct StreamEngine<B> {
    processor: DeepFilterProcessor<B>,
    input: RingConsumer,
    output: RingProducer,
    reset_generation: Arc<AtomicU64>,
    applied_generation: u64,
    frame_in: Vec<f32>,
    frame_out: Vec<f32>,
}

impl<B: InferenceBackend> StreamEngine<B> {
    /// Wire `processor` between two new rings sized and configured from its
    /// configuration.
    pub fn new(processor: DeepFilterProcessor<B>) -> (Self, CaptureEndpoint, RenderEndpoint) {
        let cfg = processor.config();
        let hop = cfg.hop_size;
        let (capture_tx, capture_rx) = ring::channel(cfg.ring_capacity, cfg.capture_overflow);
        let (render_tx, render_rx) = ring::channel(cfg.ring_capacity, cfg.render_overflow);
        let engine = Self {
            processor,
            input: capture_rx,
            output: render_tx,
            reset_generation: Arc::new(AtomicU64::new(0)),
            applied_generation: 0,
            frame_in: vec![0.0; hop],
            frame_out: vec![0.0; hop],
        };
        (
            engine,
            CaptureEndpoint { producer: capture_tx },
            RenderEndpoint { consumer: render_rx },
        )
    }

    pub fn reset_handle(&self) -> ResetHandle {
        ResetHandle { generation: Arc::clone(&self.reset_generation) }
    }

    pub fn processor(&self) -> &DeepFilterProcessor<B> {
        &self.processor
    }

    pub fn processor_mut(&mut self) -> &mut DeepFilterProcessor<B> {
        &mut self.processor
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            diagnostics: self.processor.diagnostics().snapshot(),
            capture: self.input.stats(),
            render: self.output.stats(),
        }
    }

    /// Process one frame if a full one is waiting. Returns `None` otherwise.
    pub fn run_once(&mut self) -> Option<FrameOutcome> {
        let requested = self.reset_generation.load(Ordering::Acquire);
        if requested != self.applied_generation {
            self.applied_generation = requested;
            self.processor.reset();
        }

        if !self.input.read_exact(&mut self.frame_in) {
            return None;
        }
        let outcome = self.processor.process_frame(&self.frame_in, &mut self.frame_out);
        self.output.write(&self.frame_out);
        Some(outcome)
    }

    /// Process every full frame currently buffered. Returns the count.
    pub fn drain(&mut self) -> usize {
        let mut n = 0;
        while self.run_once().is_some() {
            n += 1;
        }
        n
    }
}

impl<B: InferenceBackend + Send + 'static> StreamEngine<B> {
    /// Move the engine onto a dedicated processing thread.
    pub fn spawn(self) -> std::io::Result<EngineHandle<B>> {
        let stop = Arc::new(AtomicBool::new(false));
        let diagnostics = self.processor.diagnostics();
        let capture = self.input.monitor();
        let render = self.output.monitor();
        let reset = self.reset_handle();

        let thread_stop = Arc::clone(&stop);
        let thread = std::thread::Builder::new()
            .name("df-processing".into())
            .spawn(move || {
                let mut engine = self;
                log::info!("processing thread started");
                while !thread_stop.load(Ordering::Acquire) {
                    if engine.run_once().is_none() {
                        std::thread::sleep(IDLE_POLL);
                    }
                }
                let drained = engine.drain();
                log::info!("processing thread stopped ({} frames drained)", drained);
                engine
            })?;

        Ok(EngineHandle {
            stop,
            thread: Some(thread),
            diagnostics,
            capture,
            render,
            reset,
        })
    }
}

/// Owner of a running processing thread. Dropping it stops the thread.
pub struct EngineHandle<B> {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<StreamEngine<B>>>,
    diagnostics: Arc<Diagnostics>,
    capture: RingMonitor,
    render: RingMonitor,
    reset: ResetHandle,
}

impl<B> EngineHandle<B> {
    /// Ask the processing thread to finish. Does not wait.
    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    /// Stop and wait for the thread, getting the engine back.
    pub fn join(mut self) -> std::thread::Result<StreamEngine<B>> {
        self.stop();
        match self.thread.take() {
            Some(thread) => thread.join(),
            None => Err(Box::new("processing thread already joined")),
        }
    }

    pub fn reset_handle(&self) -> ResetHandle {
        self.reset.clone()
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            diagnostics: self.diagnostics.snapshot(),
            capture: self.capture.stats(),
            render: self.render.stats(),
        }
    }
}

impl<B> Drop for EngineHandle<B> {
    fn drop(&mut self) {
        self.stop();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::warn!("processing thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::SimulatedBackend;
    use crate::config::HOP_SIZE;
    use crate::EnhancerConfig;
    use std::time::Instant;

    fn engine() -> (StreamEngine<SimulatedBackend>, CaptureEndpoint, RenderEndpoint) {
        let cfg = EnhancerConfig { enc_hidden_dim: 16, ..EnhancerConfig::default() };
        let sim = SimulatedBackend::from_config(&cfg);
        StreamEngine::new(DeepFilterProcessor::new(sim, cfg).unwrap())
    }

    #[test]
    fn test_silent_session_has_no_xruns() {
        let (mut engine, mut capture, mut render) = engine();
        let silence = vec![0.0f32; HOP_SIZE];
        let mut out = vec![1.0f32; HOP_SIZE];
        for _ in 0..1000 {
            assert_eq!(capture.push(&silence), HOP_SIZE);
            assert_eq!(engine.run_once(), Some(FrameOutcome::Enhanced));
            assert_eq!(render.pull(&mut out), HOP_SIZE);
            assert!(out.iter().all(|&x| x == 0.0));
        }
        assert_eq!(engine.run_once(), None);

        let snap = engine.snapshot();
        assert_eq!(snap.diagnostics.frames_bypassed, 0);
        assert_eq!(snap.diagnostics.frames_processed, 1000);
        for stats in [snap.capture, snap.render] {
            assert_eq!((stats.overruns, stats.underruns), (0, 0));
            assert_eq!((stats.written, stats.read), (1000 * HOP_SIZE as u64, 1000 * HOP_SIZE as u64));
        }
    }

    #[test]
    fn test_partial_frame_waits() {
        let (mut engine, mut capture, _render) = engine();
        capture.push(&[0.0; 100]);
        assert_eq!(engine.run_once(), None);
        capture.push(&vec![0.0; HOP_SIZE - 100]);
        assert!(engine.run_once().is_some());
    }

    #[test]
    fn test_reset_applied_between_frames() {
        let (mut engine, mut capture, _render) = engine();
        capture.push(&vec![0.1; 2 * HOP_SIZE]);
        engine.run_once();
        assert_eq!(engine.processor().model_state().steps(), 1);

        engine.reset_handle().request_reset();
        engine.run_once();
        // reset happens before the second frame is processed
        assert_eq!(engine.processor().model_state().steps(), 1);
        assert_eq!(engine.snapshot().diagnostics.resets, 1);
    }

    #[test]
    fn test_threaded_engine_stops_and_drains() {
        let (engine, mut capture, mut render) = engine();
        let handle = engine.spawn().unwrap();
        let frame = vec![0.0f32; HOP_SIZE];
        for _ in 0..5 {
            capture.push(&frame);
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while render.available() < 5 * HOP_SIZE && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(handle.snapshot().diagnostics.frames_processed, 5);

        let engine = handle.join().unwrap();
        assert_eq!(engine.snapshot().capture.available, 0);
        let mut out = vec![0.0f32; 5 * HOP_SIZE];
        assert_eq!(render.pull(&mut out), 5 * HOP_SIZE);
    }
}
