//! Bounded connection pool shared by all worker threads.
//!
//! Idle connections sit in a bounded channel. Checking one out receives from
//! the channel with a timeout; the [`PooledConnection`] guard sends it back
//! when dropped, on every exit path.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};

use crate::application::storage::StorageError;

/// A fixed-size set of reusable connections.
pub struct ConnectionPool<C> {
    idle_tx: Sender<C>,
    idle_rx: Receiver<C>,
    size: usize,
    checkout_timeout: Duration,
}

impl<C> ConnectionPool<C> {
    /// Opens `size` connections up front with `open`.
    ///
    /// # Errors
    ///
    /// Returns the first error produced by `open`.
    pub fn new<E>(
        size: usize,
        checkout_timeout: Duration,
        mut open: impl FnMut() -> Result<C, E>,
    ) -> Result<Self, E> {
        let (idle_tx, idle_rx) = crossbeam_channel::bounded(size);
        for _ in 0..size {
            let conn = open()?;
            // Cannot fail: the channel has room for `size` items and we hold
            // the receiver.
            let _ = idle_tx.try_send(conn);
        }
        Ok(Self {
            idle_tx,
            idle_rx,
            size,
            checkout_timeout,
        })
    }

    /// Waits up to the checkout timeout for an idle connection.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::PoolTimeout`] if none became free in time.
    pub fn checkout(&self) -> Result<PooledConnection<'_, C>, StorageError> {
        let conn = self
            .idle_rx
            .recv_timeout(self.checkout_timeout)
            .map_err(|_| StorageError::PoolTimeout(self.checkout_timeout))?;
        Ok(PooledConnection {
            conn: Some(conn),
            pool: self,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of connections currently checked in.
    pub fn idle(&self) -> usize {
        self.idle_rx.len()
    }
}

/// A checked-out connection, returned to its pool on drop.
pub struct PooledConnection<'a, C> {
    /// `Some` until the guard is dropped.
    conn: Option<C>,
    pool: &'a ConnectionPool<C>,
}

impl<C> Deref for PooledConnection<'_, C> {
    type Target = C;

    fn deref(&self) -> &C {
        self.conn.as_ref().expect("pooled connection taken before drop")
    }
}

impl<C> DerefMut for PooledConnection<'_, C> {
    fn deref_mut(&mut self) -> &mut C {
        self.conn.as_mut().expect("pooled connection taken before drop")
    }
}

impl<C> Drop for PooledConnection<'_, C> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            let _ = self.pool.idle_tx.try_send(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(size: usize) -> ConnectionPool<u32> {
        let mut next = 0;
        ConnectionPool::new(size, Duration::from_millis(20), || -> Result<u32, ()> {
            next += 1;
            Ok(next)
        })
        .unwrap()
    }

    #[test]
    fn test_checkout_and_return() {
        // Arrange
        let pool = pool(2);

        // Act
        let first = pool.checkout().unwrap();
        let second = pool.checkout().unwrap();

        // Assert
        assert_eq!(pool.idle(), 0);
        assert_ne!(*first, *second);
        drop(first);
        assert_eq!(pool.idle(), 1);
        drop(second);
        assert_eq!(pool.idle(), pool.size());
    }

    #[test]
    fn test_exhausted_pool_times_out() {
        let pool = pool(1);
        let _held = pool.checkout().unwrap();

        let result = pool.checkout();

        assert!(matches!(result, Err(StorageError::PoolTimeout(_))));
    }

    #[test]
    fn test_connection_returned_once_per_checkout() {
        let pool = pool(1);

        for _ in 0..3 {
            let mut conn = pool.checkout().unwrap();
            *conn += 10;
        }

        assert_eq!(pool.idle(), 1);
        assert_eq!(*pool.checkout().unwrap(), 31);
    }

    #[test]
    fn test_open_failure_is_propagated() {
        let result = ConnectionPool::<u32>::new(3, Duration::ZERO, || Err("no database"));
        assert!(matches!(result, Err("no database")));
    }

    #[test]
    fn test_waiting_checkout_receives_released_connection() {
        let pool = std::sync::Arc::new(pool(1));
        let held = pool.checkout().unwrap();
        let value = *held;

        let waiter = {
            let pool = std::sync::Arc::clone(&pool);
            std::thread::spawn(move || {
                // Longer than the test timeout would allow without the release.
                let deadline = std::time::Instant::now() + Duration::from_secs(2);
                loop {
                    if let Ok(conn) = pool.checkout() {
                        return *conn;
                    }
                    assert!(std::time::Instant::now() < deadline, "connection never returned");
                }
            })
        };
        drop(held);

        assert_eq!(waiter.join().unwrap(), value);
    }
}
