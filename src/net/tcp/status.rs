use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{Builder, JoinHandle};
use std::time::Duration;

use crate::net::tcp::BackendInner;
use crate::signal::Signal;

/// Backend wide byte totals.
#[derive(Default)]
pub(crate) struct TransferCounters {
    sent: AtomicU64,
    recv: AtomicU64,
}

impl TransferCounters {
    pub(crate) fn add_sent(&self, bytes: usize) {
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_recv(&self, bytes: usize) {
        self.recv.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// `(sent, received)`
    pub(crate) fn totals(&self) -> (u64, u64) {
        (
            self.sent.load(Ordering::Relaxed),
            self.recv.load(Ordering::Relaxed),
        )
    }
}

/// Periodic statistics thread.
pub(crate) struct StatusReporter {
    stop: Arc<Signal>,
    thread: Option<JoinHandle<()>>,
}

impl StatusReporter {
    pub(crate) fn start(backend: Weak<BackendInner>, interval: Duration) -> io::Result<Self> {
        let stop = Arc::new(Signal::new());
        let thread = Builder::new().name("mill-tcp-stat".to_string()).spawn({
            let stop = stop.clone();
            move || {
                let mut last = (0, 0);
                while !stop.wait_timeout(interval) {
                    let Some(backend) = backend.upgrade() else {
                        break;
                    };
                    last = backend.log_statistics(Some(last));
                }
            }
        })?;
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    pub(crate) fn stop(mut self) {
        self.stop.set();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters() {
        let counters = TransferCounters::default();
        counters.add_sent(104);
        counters.add_recv(8);
        counters.add_recv(96);
        assert_eq!(counters.totals(), (104, 104));
    }

    #[test]
    fn test_reporter_stops_without_backend() {
        let reporter = StatusReporter::start(Weak::new(), Duration::from_millis(10)).unwrap();
        std::thread::sleep(Duration::from_millis(30));
        reporter.stop();
    }
}
