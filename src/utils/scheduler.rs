//! Cooperative timer registry.
//!
//! Timers carry a [`TimerEvent`] instead of a callback. The node loop asks the
//! [`AlarmQueue`] for due events and routes each one to the connection or the
//! transaction cache it belongs to, so a timer never runs concurrently with
//! message handling.
//!
//! Cancelling is idempotent: unregistering a handle that already fired or was
//! already cancelled does nothing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::trace;

use crate::error::constants::ERR_TIMER_DELAY_OVERFLOW;
use crate::error::{RelayError, Result};
use crate::transport::ConnectionId;
use crate::utils::time::Clock;

/// What a timer does when it fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerEvent {
    /// Sweep expired short-id assignments from the transaction cache.
    ExpireShortIds,
    /// Send the next keepalive ping on a connection.
    SendPing(ConnectionId),
    /// A ping went unanswered for too long.
    PongTimeout(ConnectionId),
}

/// Cancellable handle returned by [`Scheduler::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// Capability to arm and cancel timers.
pub trait Scheduler: Send + Sync {
    /// Arm `event` to fire after `delay`.
    ///
    /// Fails with [`RelayError::Config`] when the deadline does not fit the
    /// clock's range.
    fn register(&self, delay: Duration, event: TimerEvent) -> Result<TimerHandle>;
    fn unregister(&self, handle: TimerHandle);
}

#[derive(Default)]
struct AlarmQueueInner {
    next_id: u64,
    alarms: BTreeMap<(Instant, u64), TimerEvent>,
    deadlines: HashMap<u64, Instant>,
}

/// Deadline-ordered alarm registry driven by a [`Clock`].
pub struct AlarmQueue {
    clock: Arc<dyn Clock>,
    inner: Mutex<AlarmQueueInner>,
}

impl AlarmQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Mutex::new(AlarmQueueInner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, AlarmQueueInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Remove and return every event whose deadline has passed, oldest first.
    pub fn fire_due(&self) -> Vec<TimerEvent> {
        let now = self.clock.now();
        let mut inner = self.lock();
        let mut fired = Vec::new();

        loop {
            let key = match inner.alarms.first_key_value() {
                Some((&key, _)) if key.0 <= now => key,
                _ => break,
            };
            if let Some(event) = inner.alarms.remove(&key) {
                inner.deadlines.remove(&key.1);
                fired.push(event);
            }
        }

        if !fired.is_empty() {
            trace!(count = fired.len(), "Fired alarms");
        }
        fired
    }

    /// Deadline of the nearest pending alarm.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock()
            .alarms
            .first_key_value()
            .map(|(&(deadline, _), _)| deadline)
    }

    pub fn is_registered(&self, handle: TimerHandle) -> bool {
        self.lock().deadlines.contains_key(&handle.0)
    }

    pub fn len(&self) -> usize {
        self.lock().alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Scheduler for AlarmQueue {
    fn register(&self, delay: Duration, event: TimerEvent) -> Result<TimerHandle> {
        let deadline = self.clock.now().checked_add(delay).ok_or_else(|| {
            RelayError::Config(format!(
                "{ERR_TIMER_DELAY_OVERFLOW}: {}ms for {event:?}",
                delay.as_millis()
            ))
        })?;
        let mut inner = self.lock();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.alarms.insert((deadline, id), event);
        inner.deadlines.insert(id, deadline);
        trace!(?event, delay_ms = delay.as_millis() as u64, "Registered alarm");
        Ok(TimerHandle(id))
    }

    fn unregister(&self, handle: TimerHandle) {
        let mut inner = self.lock();
        if let Some(deadline) = inner.deadlines.remove(&handle.0) {
            inner.alarms.remove(&(deadline, handle.0));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::time::ManualClock;

    fn queue() -> (ManualClock, AlarmQueue) {
        let clock = ManualClock::new();
        let queue = AlarmQueue::new(Arc::new(clock.clone()));
        (clock, queue)
    }

    #[test]
    fn test_alarms_fire_in_deadline_order() {
        let (clock, queue) = queue();
        queue
            .register(Duration::from_secs(20), TimerEvent::ExpireShortIds)
            .unwrap();
        queue
            .register(
                Duration::from_secs(10),
                TimerEvent::SendPing(ConnectionId(1)),
            )
            .unwrap();

        assert!(queue.fire_due().is_empty());

        clock.advance(Duration::from_secs(30));
        assert_eq!(
            queue.fire_due(),
            vec![
                TimerEvent::SendPing(ConnectionId(1)),
                TimerEvent::ExpireShortIds
            ]
        );
        assert!(queue.is_empty());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let (clock, queue) = queue();
        let handle = queue
            .register(
                Duration::from_secs(5),
                TimerEvent::PongTimeout(ConnectionId(7)),
            )
            .unwrap();
        assert!(queue.is_registered(handle));

        queue.unregister(handle);
        queue.unregister(handle);
        assert!(!queue.is_registered(handle));

        clock.advance(Duration::from_secs(10));
        assert!(queue.fire_due().is_empty());
    }

    #[test]
    fn test_unregister_after_fire_is_noop() {
        let (clock, queue) = queue();
        let fired = queue
            .register(Duration::from_secs(1), TimerEvent::ExpireShortIds)
            .unwrap();
        let pending = queue
            .register(Duration::from_secs(60), TimerEvent::ExpireShortIds)
            .unwrap();

        clock.advance(Duration::from_secs(2));
        assert_eq!(queue.fire_due().len(), 1);

        queue.unregister(fired);
        assert!(queue.is_registered(pending));
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_next_deadline() {
        let (clock, queue) = queue();
        assert!(queue.next_deadline().is_none());

        queue
            .register(Duration::from_secs(3), TimerEvent::ExpireShortIds)
            .unwrap();
        assert_eq!(
            queue.next_deadline(),
            Some(clock.now() + Duration::from_secs(3))
        );
    }

    #[test]
    fn test_overflowing_delay_is_config_error() {
        let (_clock, queue) = queue();
        let result = queue.register(Duration::MAX, TimerEvent::ExpireShortIds);

        assert!(matches!(result, Err(RelayError::Config(_))));
        assert!(queue.is_empty());
    }
}
