use super::{BackendError, InferenceBackend, TensorMap};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, TrySendError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

enum Request {
    Load { seq: u64, graph: String },
    Run { seq: u64, graph: String, inputs: TensorMap },
}

struct Response {
    seq: u64,
    result: Result<TensorMap, BackendError>,
}

/// Runs a backend on its own worker thread so every call can be abandoned
/// at its deadline.
///
/// At most one request is in flight. A call that times out keeps running on
/// the worker; until its late response has come back, further calls fail
/// immediately with [`BackendError::Busy`] instead of queueing behind it.
pub struct TimedBackend {
    requests: Option<Sender<Request>>,
    responses: Receiver<Response>,
    next_seq: u64,
    /// Sequence number of an abandoned call still running on the worker.
    abandoned: Option<u64>,
    timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl TimedBackend {
    /// Move `backend` to a worker thread. `timeout` bounds plain [`run`](InferenceBackend::run) calls.
    pub fn spawn<B>(backend: B, timeout: Duration) -> Result<Self, BackendError>
    where
        B: InferenceBackend + Send + 'static,
    {
        let (req_tx, req_rx) = crossbeam_channel::bounded::<Request>(1);
        let (resp_tx, resp_rx) = crossbeam_channel::bounded::<Response>(1);

        let worker = std::thread::Builder::new()
            .name("df-inference".into())
            .spawn(move || {
                let mut backend = backend;
                for req in req_rx {
                    let resp = match req {
                        Request::Load { seq, graph } => Response {
                            seq,
                            result: backend.load_graph(&graph).map(|_| TensorMap::new()),
                        },
                        Request::Run { seq, graph, inputs } => Response {
                            seq,
                            result: backend.run(&graph, inputs),
                        },
                    };
                    if resp_tx.send(resp).is_err() {
                        break;
                    }
                }
                log::debug!("inference worker exiting");
            })
            .map_err(|e| BackendError::Unavailable(format!("failed to spawn inference worker: {}", e)))?;

        Ok(Self {
            requests: Some(req_tx),
            responses: resp_rx,
            next_seq: 0,
            abandoned: None,
            timeout,
            worker: Some(worker),
        })
    }

    /// `true` while an abandoned call still occupies the worker.
    pub fn is_busy(&mut self) -> bool {
        self.collect_abandoned();
        self.abandoned.is_some()
    }

    /// Swallow the late response of an abandoned call if it has arrived.
    fn collect_abandoned(&mut self) {
        while let Some(seq) = self.abandoned {
            match self.responses.try_recv() {
                Ok(resp) => {
                    log::debug!("discarding late response #{}", resp.seq);
                    if resp.seq == seq {
                        self.abandoned = None;
                    }
                }
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.abandoned = None;
                    return;
                }
            }
        }
    }

    /// Block until an abandoned call has finished.
    fn settle(&mut self) -> Result<(), BackendError> {
        while let Some(seq) = self.abandoned {
            let resp = self
                .responses
                .recv()
                .map_err(|_| BackendError::Unavailable("inference worker exited".into()))?;
            if resp.seq == seq {
                self.abandoned = None;
            }
        }
        Ok(())
    }

    fn submit(&mut self, make: impl FnOnce(u64) -> Request) -> Result<u64, BackendError> {
        let seq = self.next_seq;
        self.next_seq += 1;
        let stopped = || BackendError::Unavailable("inference worker stopped".into());
        let tx = self.requests.as_ref().ok_or_else(stopped)?;
        match tx.try_send(make(seq)) {
            Ok(()) => Ok(seq),
            // One request at a time is ever outstanding, so a full queue means
            // the worker has not yet picked up the previous one.
            Err(TrySendError::Full(_)) => Err(BackendError::Unavailable("inference queue full".into())),
            Err(TrySendError::Disconnected(_)) => Err(stopped()),
        }
    }

    fn wait(&mut self, graph: &str, seq: u64, timeout: Option<Duration>) -> Result<TensorMap, BackendError> {
        let deadline = timeout.map(|t| (Instant::now() + t, t));
        loop {
            let resp = match deadline {
                Some((at, timeout)) => {
                    let remaining = at.saturating_duration_since(Instant::now());
                    match self.responses.recv_timeout(remaining) {
                        Ok(resp) => resp,
                        Err(RecvTimeoutError::Timeout) => {
                            self.abandoned = Some(seq);
                            return Err(BackendError::Timeout { graph: graph.to_string(), timeout });
                        }
                        Err(RecvTimeoutError::Disconnected) => {
                            return Err(BackendError::Unavailable("inference worker exited".into()))
                        }
                    }
                }
                None => self
                    .responses
                    .recv()
                    .map_err(|_| BackendError::Unavailable("inference worker exited".into()))?,
            };
            if resp.seq == seq {
                return resp.result;
            }
            log::debug!("discarding late response #{} (waiting for #{})", resp.seq, seq);
        }
    }
}

impl InferenceBackend for TimedBackend {
    fn load_graph(&mut self, graph: &str) -> Result<(), BackendError> {
        self.settle()?;
        let name = graph.to_string();
        let seq = self.submit(|seq| Request::Load { seq, graph: name })?;
        self.wait(graph, seq, None).map(|_| ())
    }

    fn run(&mut self, graph: &str, inputs: TensorMap) -> Result<TensorMap, BackendError> {
        let timeout = self.timeout;
        self.run_with_deadline(graph, inputs, timeout)
    }

    fn run_with_deadline(
        &mut self,
        graph: &str,
        inputs: TensorMap,
        timeout: Duration,
    ) -> Result<TensorMap, BackendError> {
        if self.is_busy() {
            return Err(BackendError::Busy { graph: graph.to_string() });
        }
        let name = graph.to_string();
        let seq = self.submit(|seq| Request::Run { seq, graph: name, inputs })?;
        self.wait(graph, seq, Some(timeout))
    }
}

impl Drop for TimedBackend {
    fn drop(&mut self) {
        // Closing the request channel ends the worker loop.
        self.requests.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::warn!("inference worker panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{SimulatedBackend, Tensor, ENCODER, GRAPHS};

    fn inputs() -> TensorMap {
        let mut m = TensorMap::new();
        m.insert("feat_erb".into(), Tensor::zeros(vec![1, 1, 1, 32]));
        m.insert("feat_spec".into(), Tensor::zeros(vec![1, 2, 1, 96]));
        m
    }

    fn timed(sim: SimulatedBackend, timeout: Duration) -> TimedBackend {
        let mut b = TimedBackend::spawn(sim, timeout).unwrap();
        for g in GRAPHS {
            b.load_graph(g).unwrap();
        }
        b
    }

    #[test]
    fn test_passes_results_through() {
        let mut b = timed(SimulatedBackend::new(32, 96, 5, None), Duration::from_secs(5));
        let out = b.run(ENCODER, inputs()).unwrap();
        assert!(out.contains_key("lsnr"));
        assert!(matches!(b.load_graph("missing"), Err(BackendError::UnknownGraph(_))));
    }

    #[test]
    fn test_abandons_slow_call_and_discards_late_reply() {
        let sim = SimulatedBackend::new(32, 96, 5, None)
            .delay_on_call(ENCODER, 0, Duration::from_millis(150))
            .with_lsnr(-3.0);
        let mut b = timed(sim, Duration::from_secs(5));

        let start = Instant::now();
        let err = b.run_with_deadline(ENCODER, inputs(), Duration::from_millis(20)).unwrap_err();
        assert!(err.is_timeout(), "{}", err);
        assert!(start.elapsed() < Duration::from_millis(140));

        // Let the stale call finish; the next call must get its own reply.
        std::thread::sleep(Duration::from_millis(200));
        let out = b.run_with_deadline(ENCODER, inputs(), Duration::from_secs(5)).unwrap();
        assert_eq!(out["lsnr"].data(), &[-3.0]);
    }

    #[test]
    fn test_sustained_slowness_does_not_queue() {
        let slow = Duration::from_millis(60);
        let sim = SimulatedBackend::new(32, 96, 5, None)
            .delay_on_call(ENCODER, 0, slow)
            .delay_on_call(ENCODER, 1, slow)
            .delay_on_call(ENCODER, 2, slow)
            .with_lsnr(7.0);
        let mut b = timed(sim, Duration::from_secs(5));
        let deadline = Duration::from_millis(15);

        let mut timeouts = 0;
        let mut busy = 0;
        let started = Instant::now();
        let out = loop {
            assert!(started.elapsed() < Duration::from_secs(5), "backend never recovered");
            let call = Instant::now();
            match b.run_with_deadline(ENCODER, inputs(), deadline) {
                Ok(out) => break out,
                Err(BackendError::Busy { .. }) => {
                    busy += 1;
                    // Rejected without waiting on the stale call.
                    assert!(call.elapsed() < deadline);
                }
                Err(e) => {
                    assert!(e.is_timeout(), "{}", e);
                    assert!(call.elapsed() < deadline + Duration::from_millis(30));
                    timeouts += 1;
                }
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(timeouts, 3);
        assert!(busy > 0);
        assert_eq!(out["lsnr"].data(), &[7.0]);
        assert!(!b.is_busy());
    }

    #[test]
    fn test_load_waits_for_abandoned_call() {
        let sim = SimulatedBackend::new(32, 96, 5, None).delay_on_call(ENCODER, 0, Duration::from_millis(50));
        let mut b = timed(sim, Duration::from_secs(5));
        assert!(b.run_with_deadline(ENCODER, inputs(), Duration::from_millis(5)).is_err());
        assert!(b.is_busy());
        b.load_graph(ENCODER).unwrap();
        assert!(!b.is_busy());
        assert!(b.run(ENCODER, inputs()).is_ok());
    }

    #[test]
    fn test_errors_forwarded() {
        let sim = SimulatedBackend::new(32, 96, 5, None).fail_on_call(ENCODER, 0);
        let mut b = timed(sim, Duration::from_secs(5));
        assert!(matches!(b.run(ENCODER, inputs()), Err(BackendError::Runtime { .. })));
        assert!(b.run(ENCODER, inputs()).is_ok());
    }
}
