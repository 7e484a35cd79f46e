use crate::event::ReadinessEvent;

/// Receives readiness events dispatched by the [`Reactor`](crate::reactor::Reactor).
///
/// All events for one token run on the same worker, in the order they were
/// polled.
pub trait EventHandler: Send + Sync {
    fn handle_event(&self, event: &ReadinessEvent);
}
