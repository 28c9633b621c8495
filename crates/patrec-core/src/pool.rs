//! Connection pool.
//!
//! Bounded membership set of live connections. `len() <= capacity` holds at
//! all times because [`ConnectionPool::add`] checks before inserting. The pool
//! is consulted twice per connection: once at admission and once at teardown.

use std::collections::HashSet;

use crate::error::PoolError;

/// Bounded set of live connection IDs.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    capacity: usize,
    members: HashSet<u64>,
}

impl ConnectionPool {
    /// Create an empty pool holding at most `capacity` connections.
    pub fn new(capacity: usize) -> Self {
        Self { capacity, members: HashSet::with_capacity(capacity.min(1024)) }
    }

    /// No further connection can be admitted.
    pub fn is_full(&self) -> bool {
        self.members.len() >= self.capacity
    }

    /// Track a new connection.
    ///
    /// Fails whenever the pool is full, even for an ID that is already
    /// tracked. Re-adding a tracked ID to a pool with room is a no-op.
    pub fn add(&mut self, connection_id: u64) -> Result<(), PoolError> {
        if self.is_full() {
            return Err(PoolError::CapacityExceeded { capacity: self.capacity });
        }
        self.members.insert(connection_id);
        Ok(())
    }

    /// Stop tracking a connection.
    pub fn remove(&mut self, connection_id: u64) -> Result<(), PoolError> {
        if self.members.remove(&connection_id) { Ok(()) } else { Err(PoolError::NotFound(connection_id)) }
    }

    /// Whether the connection is tracked.
    pub fn contains(&self, connection_id: u64) -> bool {
        self.members.contains(&connection_id)
    }

    /// Number of tracked connections.
    pub fn len(&self) -> usize {
        self.members.len()
    }

    /// No connection is tracked.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_until_full() {
        let mut pool = ConnectionPool::new(2);

        assert!(!pool.is_full());
        pool.add(1).unwrap();
        pool.add(2).unwrap();
        assert!(pool.is_full());

        assert_eq!(pool.add(3), Err(PoolError::CapacityExceeded { capacity: 2 }));
        assert_eq!(pool.len(), 2);
        assert!(!pool.contains(3));
    }

    #[test]
    fn remove_frees_a_slot() {
        let mut pool = ConnectionPool::new(1);
        pool.add(7).unwrap();

        pool.remove(7).unwrap();

        assert!(pool.is_empty());
        pool.add(8).unwrap();
        assert!(pool.contains(8));
    }

    #[test]
    fn remove_untracked_fails() {
        let mut pool = ConnectionPool::new(4);

        assert_eq!(pool.remove(9), Err(PoolError::NotFound(9)));

        pool.add(9).unwrap();
        pool.remove(9).unwrap();
        assert_eq!(pool.remove(9), Err(PoolError::NotFound(9)));
    }

    #[test]
    fn zero_capacity_is_always_full() {
        let mut pool = ConnectionPool::new(0);

        assert!(pool.is_full());
        assert!(pool.add(1).is_err());
    }

    #[test]
    fn re_adding_a_member_does_not_grow() {
        let mut pool = ConnectionPool::new(2);
        pool.add(1).unwrap();

        pool.add(1).unwrap();

        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn full_pool_rejects_even_a_tracked_id() {
        let mut pool = ConnectionPool::new(1);
        pool.add(1).unwrap();

        assert_eq!(pool.add(1), Err(PoolError::CapacityExceeded { capacity: 1 }));
        assert_eq!(pool.len(), 1);
        assert!(pool.contains(1));
    }
}
