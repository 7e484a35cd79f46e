use std::{
    io,
    sync::mpsc::{self, Receiver, Sender},
    thread::{Builder, JoinHandle},
};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Fixed set of named worker threads, each draining its own queue.
///
/// [`dispatch`](ThreadPool::dispatch) pins a key to one worker, so tasks
/// submitted under the same key run one after another in submission order.
pub struct ThreadPool {
    queues: Vec<Sender<Task>>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawns `capacity` workers named `{name}-{index}`. A zero capacity is
    /// bumped to one worker.
    pub fn new(capacity: usize, name: &str) -> io::Result<Self> {
        let capacity = capacity.max(1);
        let mut pool = Self {
            queues: Vec::with_capacity(capacity),
            threads: Vec::with_capacity(capacity),
        };

        for index in 0..capacity {
            let (tx, rx) = mpsc::channel();
            // On failure `pool` drops here and joins the workers spawned so far.
            let thread = Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || worker_loop(rx))?;
            pool.queues.push(tx);
            pool.threads.push(thread);
        }

        Ok(pool)
    }

    /// Queues `task` on the worker owning `key`.
    pub fn dispatch<F>(&self, key: usize, task: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        self.queues[key % self.queues.len()]
            .send(Box::new(task))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "thread pool worker stopped"))
    }

    pub fn workers_len(&self) -> usize {
        self.threads.len()
    }
}

fn worker_loop(rx: Receiver<Task>) {
    // Ends once the pool drops its sender and the queue is drained.
    while let Ok(task) = rx.recv() {
        task();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.queues.clear();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_zero_capacity_gets_one_worker() {
        assert_eq!(ThreadPool::new(0, "test-worker").unwrap().workers_len(), 1);
        assert_eq!(ThreadPool::new(3, "test-worker").unwrap().workers_len(), 3);
    }

    #[test]
    fn test_drop_runs_queued_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let pool = ThreadPool::new(2, "test-worker").unwrap();
            for key in 0..10 {
                let counter = counter.clone();
                pool.dispatch(key, move || {
                    std::thread::sleep(Duration::from_millis(5));
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::SeqCst), 10);
    }

    #[test]
    fn test_same_key_keeps_order_and_worker() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let pool = ThreadPool::new(4, "keyed-worker").unwrap();
            for i in 0..50 {
                let seen = seen.clone();
                pool.dispatch(7, move || {
                    let name = std::thread::current().name().map(str::to_string);
                    seen.lock().push((i, name));
                })
                .unwrap();
            }
        }
        let seen = seen.lock();
        assert_eq!(seen.len(), 50);
        assert!(seen.iter().enumerate().all(|(n, (i, _))| n == *i));
        assert!(seen
            .iter()
            .all(|(_, name)| name.as_deref() == Some("keyed-worker-3")));
    }
}
