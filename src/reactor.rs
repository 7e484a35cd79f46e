use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{Builder, JoinHandle},
};

use mio::{Events, Poll, Token, Waker};
use parking_lot::Mutex;

use crate::{
    event::ReadinessEvent,
    net::tcp::traits::{LogLevel, Logger},
    poll::PollHandle,
    thread_pool::ThreadPool,
};

pub const EVENTS_CAPACITY: usize = 1024;

/// Reserved for the shutdown waker; connection tokens start at 1.
pub const WAKE_TOKEN: Token = Token(0);

/// One poll thread that hands readiness events to a pool of workers.
///
/// ```text
/// poll thread ──▶ PollHandle::handler(token) ──▶ ThreadPool::dispatch(token) ──▶ EventHandler
/// ```
pub struct Reactor {
    handle: Arc<PollHandle>,
    waker: Waker,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Reactor {
    pub fn start(workers: usize, logger: Arc<dyn Logger>) -> io::Result<Self> {
        let poll = Poll::new()?;
        let handle = Arc::new(PollHandle::new(&poll)?);
        let waker = Waker::new(poll.registry(), WAKE_TOKEN)?;
        let pool = ThreadPool::new(workers, "mill-tcp-worker")?;
        let running = Arc::new(AtomicBool::new(true));

        let thread = Builder::new().name("mill-tcp-reactor".to_string()).spawn({
            let handle = handle.clone();
            let running = running.clone();
            move || run(poll, handle, pool, running, logger)
        })?;

        Ok(Self {
            handle,
            waker,
            running,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn handle(&self) -> &Arc<PollHandle> {
        &self.handle
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stops the poll thread, joins the workers and drops every registered
    /// handler.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.lock().take() {
            let _ = thread.join();
        }
        self.handle.clear();
    }
}

impl Drop for Reactor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run(
    mut poll: Poll,
    handle: Arc<PollHandle>,
    pool: ThreadPool,
    running: Arc<AtomicBool>,
    logger: Arc<dyn Logger>,
) {
    let mut events = Events::with_capacity(EVENTS_CAPACITY);

    while running.load(Ordering::SeqCst) {
        if let Err(e) = poll.poll(&mut events, None) {
            if e.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            logger.log(LogLevel::Error, &format!("Reactor poll failed ({e})"));
            break;
        }

        for event in events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }
            let Some(handler) = handle.handler(event.token()) else {
                continue;
            };
            let event = ReadinessEvent::from(event);
            if let Err(e) = pool.dispatch(event.token().0, move || handler.handle_event(&event)) {
                logger.log(
                    LogLevel::Error,
                    &format!("Failed to dispatch event for {:?} ({e})", event.token()),
                );
            }
        }
    }
}
