//! Reusable RPC request objects.
//!
//! Requests are pooled by parameter slot count. Every request handed out is
//! in its reset state; every request returned is reset before it is stored.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::rpc::RpcRequest;

/// Default number of idle requests kept per slot count.
pub const DEFAULT_MAX_IDLE_PER_SIZE: usize = 8;

/// Pool of [`RpcRequest`] values keyed by parameter slot count.
#[derive(Debug)]
pub struct RpcRequestPool {
    idle: Mutex<HashMap<usize, Vec<RpcRequest>>>,
    max_idle_per_size: usize,
}

impl Default for RpcRequestPool {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_IDLE_PER_SIZE)
    }
}

impl RpcRequestPool {
    /// Create a pool keeping at most `max_idle_per_size` requests per count.
    #[must_use]
    pub fn new(max_idle_per_size: usize) -> Self {
        Self {
            idle: Mutex::new(HashMap::new()),
            max_idle_per_size,
        }
    }

    /// Take a reset request with exactly `slots` parameter slots.
    pub fn acquire(&self, slots: usize) -> RpcRequest {
        let reused = self.idle.lock().get_mut(&slots).and_then(Vec::pop);
        match reused {
            Some(request) => {
                tracing::trace!(slots, "reusing pooled RPC request");
                request
            }
            None => RpcRequest::with_capacity(slots),
        }
    }

    /// Return a request to the pool. It is reset before being stored.
    pub fn release(&self, mut request: RpcRequest) {
        request.reset();
        let slots = request.capacity();
        let mut idle = self.idle.lock();
        let bucket = idle.entry(slots).or_default();
        if bucket.len() < self.max_idle_per_size {
            bucket.push(request);
        }
    }

    /// Return several requests.
    pub fn release_all(&self, requests: impl IntoIterator<Item = RpcRequest>) {
        for request in requests {
            self.release(request);
        }
    }

    /// Number of idle requests stored for a slot count.
    #[must_use]
    pub fn idle_count(&self, slots: usize) -> usize {
        self.idle.lock().get(&slots).map_or(0, Vec::len)
    }

    /// Drop every idle request.
    pub fn clear(&self) {
        self.idle.lock().clear();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::param::Parameter;
    use crate::rpc::RpcOptionFlags;
    use crate::types::SqlDbType;

    #[test]
    fn test_acquire_new_is_reset() {
        let pool = RpcRequestPool::default();
        let rpc = pool.acquire(3);
        assert_eq!(rpc.capacity(), 3);
        assert!(rpc.is_reset());
    }

    #[test]
    fn test_release_resets_and_reuses() {
        let pool = RpcRequestPool::default();
        let mut rpc = pool.acquire(3);
        rpc.build_execute(9, &[Parameter::input("@a", SqlDbType::Int, 1)])
            .unwrap();
        rpc.set_options(RpcOptionFlags::NO_METADATA);
        rpc.records_affected = Some(2);
        pool.release(rpc);
        assert_eq!(pool.idle_count(3), 1);

        let again = pool.acquire(3);
        assert!(again.is_reset());
        assert_eq!(again.capacity(), 3);
        assert_eq!(pool.idle_count(3), 0);
    }

    #[test]
    fn test_keyed_by_slot_count() {
        let pool = RpcRequestPool::default();
        pool.release(RpcRequest::with_capacity(2));
        assert_eq!(pool.idle_count(2), 1);
        let other = pool.acquire(5);
        assert_eq!(other.capacity(), 5);
        assert_eq!(pool.idle_count(2), 1);
    }

    #[test]
    fn test_idle_limit() {
        let pool = RpcRequestPool::new(1);
        pool.release_all([RpcRequest::with_capacity(1), RpcRequest::with_capacity(1)]);
        assert_eq!(pool.idle_count(1), 1);
        pool.clear();
        assert_eq!(pool.idle_count(1), 0);
    }
}
