//! Per-connection session limiting.
//!
//! Every channel opened on a node (synchronous command, standing shell,
//! polled session) first takes a [`SessionPermit`] from the node's
//! [`SessionLimiter`]. The permit is released when it is dropped, so the
//! count stays correct on error and cancellation paths as well.
//!
//! Connection establishment is serialised by a separate lock so that only
//! one caller at a time rebuilds the transport.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard, OwnedSemaphorePermit, Semaphore, TryAcquireError};

use crate::error::{RemoteError, Result};

/// Counting semaphore plus connect lock for one connection.
#[derive(Debug)]
pub struct SessionLimiter {
    semaphore: Arc<Semaphore>,
    connect_lock: Mutex<()>,
    capacity: usize,
}

impl SessionLimiter {
    /// Create a limiter allowing `capacity` concurrently open channels.
    ///
    /// A zero capacity is raised to one so callers can never deadlock on an
    /// empty semaphore.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            connect_lock: Mutex::new(()),
            capacity,
        }
    }

    /// Wait for a free session slot.
    pub async fn acquire(&self) -> Result<SessionPermit> {
        let permit = Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map_err(|_| RemoteError::config("session limiter closed"))?;
        Ok(SessionPermit { permit })
    }

    /// Take a session slot if one is free right now.
    #[must_use]
    pub fn try_acquire(&self) -> Option<SessionPermit> {
        match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => Some(SessionPermit { permit }),
            Err(TryAcquireError::NoPermits | TryAcquireError::Closed) => None,
        }
    }

    /// Lock held while (re)establishing the connection.
    pub async fn connect_guard(&self) -> MutexGuard<'_, ()> {
        self.connect_lock.lock().await
    }

    /// Maximum concurrently open channels.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }

    /// Current usage snapshot.
    #[must_use]
    pub fn stats(&self) -> LimiterStats {
        let available = self.semaphore.available_permits();
        LimiterStats {
            capacity: self.capacity,
            available,
            in_use: self.capacity.saturating_sub(available),
        }
    }
}

/// Snapshot of limiter usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimiterStats {
    /// Configured maximum.
    pub capacity: usize,
    /// Free slots.
    pub available: usize,
    /// Slots held by open channels.
    pub in_use: usize,
}

impl LimiterStats {
    /// Check if no channel is open.
    #[must_use]
    pub const fn is_idle(&self) -> bool {
        self.in_use == 0
    }
}

/// One occupied session slot.
///
/// Dropping the permit frees the slot.
pub struct SessionPermit {
    permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for SessionPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionPermit")
            .field("count", &self.permit.num_permits())
            .finish()
    }
}

impl SessionPermit {
    /// Release the slot now.
    ///
    /// Equivalent to dropping the permit.
    pub fn release(self) {
        drop(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn permits_are_counted_and_released_on_drop() {
        let limiter = SessionLimiter::new(2);
        assert!(limiter.stats().is_idle());

        let a = limiter.acquire().await.unwrap();
        let b = limiter.acquire().await.unwrap();
        assert_eq!(limiter.stats().in_use, 2);
        assert!(limiter.try_acquire().is_none());

        drop(a);
        assert_eq!(limiter.stats().available, 1);
        b.release();
        assert!(limiter.stats().is_idle());
    }

    #[tokio::test]
    async fn acquire_waits_for_release() {
        let limiter = Arc::new(SessionLimiter::new(1));
        let held = limiter.acquire().await.unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.acquire().await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        drop(held);
        waiter.await.unwrap().unwrap();
    }

    #[test]
    fn zero_capacity_is_raised_to_one() {
        let limiter = SessionLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert!(limiter.try_acquire().is_some());
    }
}
