use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::trace;

/// A counting budget: `acquire` blocks while the budget is exhausted, and the
///  returned [`Reservation`] gives the units back when dropped. Used per-pipe
///  for inbound bytes/messages and messenger-wide for bytes awaiting
///  dispatch.
///
/// A request larger than the whole budget is admitted once the throttle is
///  empty, so oversized messages make progress instead of deadlocking.
pub struct Throttle {
    name: &'static str,
    max: u64,
    current: AtomicU64,
    released: Notify,
}

impl Throttle {
    pub fn new(name: &'static str, max: u64) -> Arc<Throttle> {
        Arc::new(Throttle {
            name,
            max,
            current: AtomicU64::new(0),
            released: Notify::new(),
        })
    }

    pub fn max(&self) -> u64 {
        self.max
    }

    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    pub async fn acquire(self: &Arc<Self>, amount: u64) -> Reservation {
        loop {
            let notified = self.released.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_take(amount) {
                trace!(
                    "throttle {}: took {} ({}/{})",
                    self.name,
                    amount,
                    self.current(),
                    self.max
                );
                return Reservation {
                    throttle: self.clone(),
                    amount,
                };
            }

            trace!(
                "throttle {}: waiting for {} ({}/{})",
                self.name,
                amount,
                self.current(),
                self.max
            );
            notified.await;
        }
    }

    fn try_take(&self, amount: u64) -> bool {
        self.current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if self.max == 0 || current == 0 || current + amount <= self.max {
                    Some(current + amount)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn release(&self, amount: u64) {
        let before = self.current.fetch_sub(amount, Ordering::AcqRel);
        debug_assert!(before >= amount, "throttle {} released more than taken", self.name);
        self.released.notify_waiters();
    }
}

/// Units taken from a [`Throttle`]; released exactly once, on drop. Inbound
///  messages carry their reservations through the dispatch queue so the
///  budget stays reserved until the consumer is done with them.
pub struct Reservation {
    throttle: Arc<Throttle>,
    amount: u64,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        self.throttle.release(self.amount);
    }
}

impl std::fmt::Debug for Reservation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "reservation({} of {})", self.amount, self.throttle.name)
    }
}
