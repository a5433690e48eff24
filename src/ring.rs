//! Single-producer/single-consumer sample rings for the audio I/O paths.
//!
//! Each ring is an [`rtrb::RingBuffer`] with an overflow policy and xrun
//! counters on top. Neither [`RingProducer::write`] nor [`RingConsumer::read`]
//! blocks or allocates, so either end may live on a real-time callback.
//!
//! Under [`OverflowPolicy::Overwrite`] the producer evicts the oldest unread
//! samples through the consumer half, which sits behind a mutex that both
//! ends only ever `try_lock`. The lock is contended only when an eviction
//! races a read; the producer then truncates instead, and the consumer treats
//! the ring as empty for that call.

use parking_lot::Mutex;
use rtrb::{Consumer, Producer, RingBuffer};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What the producer does when the ring is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Keep the unread samples; the write is cut short.
    Truncate,
    /// Evict the oldest unread samples to make room.
    Overwrite,
}

struct Shared {
    consumer: Mutex<Consumer<f32>>,
    capacity: usize,
    policy: OverflowPolicy,
    // `written` is bumped before samples are published and `read`/`removed`
    // after they are taken out, so `read + removed <= written` at all times.
    written: AtomicU64,
    read: AtomicU64,
    removed: AtomicU64,
    overruns: AtomicU64,
    dropped: AtomicU64,
    underruns: AtomicU64,
    silence: AtomicU64,
}

impl Shared {
    fn stats(&self) -> RingStats {
        let read = self.read.load(Ordering::Acquire);
        let removed = self.removed.load(Ordering::Acquire);
        let written = self.written.load(Ordering::Acquire);
        RingStats {
            capacity: self.capacity,
            available: written.saturating_sub(read + removed) as usize,
            written,
            read,
            overruns: self.overruns.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            underruns: self.underruns.load(Ordering::Relaxed),
            silence_filled: self.silence.load(Ordering::Relaxed),
        }
    }
}

/// Counters of one ring. `written` and `read` count samples that crossed the
/// ring; `dropped` counts samples lost to overflow (truncated or evicted).
/// `available` may briefly include samples that are still being published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RingStats {
    pub capacity: usize,
    pub available: usize,
    pub written: u64,
    pub read: u64,
    pub overruns: u64,
    pub dropped: u64,
    pub underruns: u64,
    pub silence_filled: u64,
}

/// Create a ring holding `capacity` samples and split it into its two ends.
pub fn channel(capacity: usize, policy: OverflowPolicy) -> (RingProducer, RingConsumer) {
    let (producer, consumer) = RingBuffer::<f32>::new(capacity.max(1));
    let shared = Arc::new(Shared {
        capacity: producer.buffer().capacity(),
        consumer: Mutex::new(consumer),
        policy,
        written: AtomicU64::new(0),
        read: AtomicU64::new(0),
        removed: AtomicU64::new(0),
        overruns: AtomicU64::new(0),
        dropped: AtomicU64::new(0),
        underruns: AtomicU64::new(0),
        silence: AtomicU64::new(0),
    });
    (
        RingProducer { inner: producer, shared: Arc::clone(&shared) },
        RingConsumer { shared },
    )
}

// ─────────────────────── RingProducer ────────────────────────────

pub struct RingProducer {
    inner: Producer<f32>,
    shared: Arc<Shared>,
}

impl RingProducer {
    /// Write as many samples as the overflow policy allows and return how many
    /// were stored. Never blocks.
    pub fn write(&mut self, samples: &[f32]) -> usize {
        let policy = self.shared.policy;
        let (src, mut lost) = match policy {
            OverflowPolicy::Truncate => (samples, 0),
            OverflowPolicy::Overwrite => {
                let skip = samples.len().saturating_sub(self.shared.capacity);
                (&samples[skip..], skip)
            }
        };
        if policy == OverflowPolicy::Overwrite && src.len() > self.inner.slots() {
            lost += self.evict(src.len() - self.inner.slots());
        }

        let n = src.len().min(self.inner.slots());
        lost += src.len() - n;
        let stored = match self.inner.write_chunk_uninit(n) {
            Ok(chunk) => {
                self.shared.written.fetch_add(n as u64, Ordering::Release);
                chunk.fill_from_iter(src[..n].iter().copied())
            }
            Err(_) => {
                lost += n;
                0
            }
        };

        if lost > 0 {
            self.shared.overruns.fetch_add(1, Ordering::Relaxed);
            self.shared.dropped.fetch_add(lost as u64, Ordering::Relaxed);
        }
        stored
    }

    /// Discard up to `n` of the oldest unread samples. Returns how many went.
    fn evict(&self, n: usize) -> usize {
        let Some(mut consumer) = self.shared.consumer.try_lock() else {
            return 0;
        };
        let n = n.min(consumer.slots());
        match consumer.read_chunk(n) {
            Ok(chunk) => {
                chunk.commit_all();
                self.shared.removed.fetch_add(n as u64, Ordering::Release);
                n
            }
            Err(_) => 0,
        }
    }

    /// Free space before the next write overflows.
    pub fn free(&self) -> usize {
        self.inner.slots()
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor { shared: Arc::clone(&self.shared) }
    }
}

// ─────────────────────── RingConsumer ────────────────────────────

pub struct RingConsumer {
    shared: Arc<Shared>,
}

impl RingConsumer {
    /// Fill `out` from the ring; any deficit is filled with silence and counted
    /// as an underrun. Returns the number of real samples read. Never blocks.
    pub fn read(&mut self, out: &mut [f32]) -> usize {
        let n = self.pop(out, false);
        let deficit = out.len() - n;
        if deficit > 0 {
            out[n..].fill(0.0);
            let s = &*self.shared;
            s.underruns.fetch_add(1, Ordering::Relaxed);
            s.silence.fetch_add(deficit as u64, Ordering::Relaxed);
        }
        n
    }

    /// Read exactly `out.len()` samples if that many are available; otherwise
    /// leave the ring untouched and return `false`. Not an underrun.
    pub fn read_exact(&mut self, out: &mut [f32]) -> bool {
        let want = out.len();
        self.pop(out, true) == want
    }

    /// Copy up to `out.len()` samples and commit them. With `exact`, commits
    /// nothing unless the whole of `out` can be filled.
    fn pop(&mut self, out: &mut [f32], exact: bool) -> usize {
        let s = &*self.shared;
        let Some(mut consumer) = s.consumer.try_lock() else {
            return 0;
        };
        let readable = consumer.slots();
        if exact && readable < out.len() {
            return 0;
        }
        let n = readable.min(out.len());
        let Ok(chunk) = consumer.read_chunk(n) else {
            return 0;
        };
        let (first, second) = chunk.as_slices();
        out[..first.len()].copy_from_slice(first);
        out[first.len()..n].copy_from_slice(second);
        chunk.commit_all();
        s.read.fetch_add(n as u64, Ordering::Release);
        n
    }

    /// Drop everything currently readable. Returns the number discarded.
    pub fn clear(&mut self) -> usize {
        let s = &*self.shared;
        let Some(mut consumer) = s.consumer.try_lock() else {
            return 0;
        };
        let n = consumer.slots();
        match consumer.read_chunk(n) {
            Ok(chunk) => {
                chunk.commit_all();
                s.removed.fetch_add(n as u64, Ordering::Release);
                n
            }
            Err(_) => 0,
        }
    }

    /// Samples ready to read right now.
    pub fn available(&self) -> usize {
        self.shared.consumer.try_lock().map_or(0, |c| c.slots())
    }

    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor { shared: Arc::clone(&self.shared) }
    }
}

/// Read-only view of a ring's counters, usable from any thread.
#[derive(Clone)]
pub struct RingMonitor {
    shared: Arc<Shared>,
}

impl RingMonitor {
    pub fn stats(&self) -> RingStats {
        self.shared.stats()
    }
}
