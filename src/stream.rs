//! Reference command stream
//!
//! A [`Stream`] is the asynchronous command queue device work is enqueued
//! on: a dedicated worker thread consumes jobs in FIFO order and signals
//! each job's [`Event`] when it finishes. Same-stream ordering is
//! guaranteed; no ordering exists between different streams, so
//! cross-stream hazards on the same memory must be resolved by the caller.
//!
//! A job that panics is caught on the worker and surfaces as
//! [`EventStatus::Failed`](crate::event::EventStatus::Failed) on its token;
//! the stream keeps running.

use crate::event::Event;
use std::sync::mpsc;
use std::thread::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

enum Command {
    Run { job: Job, event: Event },
    Shutdown,
}

/// Asynchronous command queue bound to one engine
pub struct Stream {
    engine_id: u64,
    sender: mpsc::Sender<Command>,
    worker: Option<JoinHandle<()>>,
}

impl Stream {
    pub(crate) fn new(engine_id: u64) -> Self {
        let (sender, receiver) = mpsc::channel::<Command>();

        let worker = std::thread::Builder::new()
            .name(format!("tessera-stream-{engine_id}"))
            .spawn(move || {
                while let Ok(command) = receiver.recv() {
                    match command {
                        Command::Run { job, event } => {
                            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(job));
                            match outcome {
                                Ok(()) => event.signal_complete(),
                                Err(_) => {
                                    tracing::warn!(engine = engine_id, "device task panicked on stream worker");
                                    event.signal_failed("device task panicked".to_string());
                                }
                            }
                        }
                        Command::Shutdown => break,
                    }
                }
            })
            .expect("failed to spawn stream worker thread");

        tracing::debug!(engine = engine_id, "stream created");

        Self {
            engine_id,
            sender,
            worker: Some(worker),
        }
    }

    /// Identity of the engine this stream was created from
    pub fn engine_id(&self) -> u64 {
        self.engine_id
    }

    /// Enqueue a job and hand back its completion token
    pub(crate) fn enqueue<F>(&self, job: F) -> Event
    where
        F: FnOnce() + Send + 'static,
    {
        let event = Event::pending();
        let command = Command::Run {
            job: Box::new(job),
            event: event.clone(),
        };
        if self.sender.send(command).is_err() {
            event.signal_failed("stream worker has shut down".to_string());
        }
        event
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Queued jobs drain before the worker observes the shutdown marker.
        let _ = self.sender.send(Command::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
        tracing::debug!(engine = self.engine_id, "stream shut down");
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("engine_id", &self.engine_id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventStatus;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_enqueue_runs_job() {
        let stream = Stream::new(0);
        let counter = Arc::new(AtomicUsize::new(0));

        let job_counter = Arc::clone(&counter);
        let event = stream.enqueue(move || {
            job_counter.fetch_add(1, Ordering::SeqCst);
        });

        event.wait().unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fifo_ordering() {
        let stream = Stream::new(0);
        let order = Arc::new(parking_lot::Mutex::new(Vec::new()));

        let mut last = None;
        for i in 0..8 {
            let order = Arc::clone(&order);
            last = Some(stream.enqueue(move || {
                order.lock().push(i);
            }));
        }

        last.unwrap().wait().unwrap();
        assert_eq!(*order.lock(), (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn test_panicking_job_fails_event() {
        let stream = Stream::new(0);

        let event = stream.enqueue(|| panic!("boom"));
        assert!(event.wait().is_err());
        assert!(matches!(event.status(), EventStatus::Failed(_)));

        // The worker survives a panicking job
        let event = stream.enqueue(|| {});
        event.wait().unwrap();
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let stream = Stream::new(0);
            for _ in 0..4 {
                let job_counter = Arc::clone(&counter);
                stream.enqueue(move || {
                    job_counter.fetch_add(1, Ordering::SeqCst);
                });
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }
}
