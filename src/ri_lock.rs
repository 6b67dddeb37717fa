//! The reverse-integration serializer.
//!
//! All merges into a plan's target branch go through one process-wide
//! mutex. Two reasons:
//!
//! 1. The repository has a single index lock; concurrent stash/reset/
//!    checkout sequences on the same repo fail with lock contention.
//! 2. Two merges reading the same target tip would create divergent
//!    commits, and the second ref update would silently clobber the first.
//!
//! Poisoning is recovered on acquire: a panic inside one merge must not
//! deadlock (or error out) every later merge in the process.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Process-wide mutex serializing reverse-integration merges.
#[derive(Debug, Default)]
pub struct RiSerializer {
    lock: Mutex<()>,
}

impl RiSerializer {
    /// Create a serializer.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
        }
    }

    /// Block until this caller holds the reverse-integration slot. The
    /// returned guard spans the entire merge.
    #[must_use]
    pub fn acquire(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn merges_are_strictly_serialized() {
        let serializer = Arc::new(RiSerializer::new());
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let serializer = Arc::clone(&serializer);
                let in_flight = Arc::clone(&in_flight);
                let peak = Arc::clone(&peak);
                std::thread::spawn(move || {
                    let _guard = serializer.acquire();
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(std::time::Duration::from_millis(5));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panic_while_holding_does_not_poison_later_acquires() {
        let serializer = Arc::new(RiSerializer::new());
        let clone = Arc::clone(&serializer);
        let result = std::thread::spawn(move || {
            let _guard = clone.acquire();
            panic!("merge blew up");
        })
        .join();
        assert!(result.is_err());
        // Still acquirable.
        let _guard = serializer.acquire();
    }
}
