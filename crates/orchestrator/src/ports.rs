//! Shared port pool
//!
//! The one resource mutated across concurrent workers. A port is
//! reserved in the pool set *before* it is probed, so two concurrent
//! `acquire` calls can never hand out the same value.

use parking_lot::Mutex;
use std::collections::HashSet;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, trace};

use lingotest_common::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_millis(250);
// Lets a socket mid-release finish closing before we hand the port out
const SETTLE_DELAY: Duration = Duration::from_millis(50);
const SCAN_ATTEMPTS: usize = 3;
const SCAN_BACKOFF: Duration = Duration::from_millis(500);

/// Pool of candidate ports in a fixed numeric range
pub struct PortPool {
    start: u16,
    end: u16,
    taken: Mutex<HashSet<u16>>,
}

impl PortPool {
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            taken: Mutex::new(HashSet::new()),
        }
    }

    /// Acquire any free port from the range
    pub async fn acquire(&self) -> Result<u16> {
        let candidates: Vec<u16> = (self.start..=self.end).collect();
        self.acquire_one_of(&candidates).await
    }

    /// Acquire the first free port among the given candidates
    pub async fn acquire_one_of(&self, candidates: &[u16]) -> Result<u16> {
        for attempt in 0..SCAN_ATTEMPTS {
            if attempt > 0 {
                sleep(SCAN_BACKOFF * attempt as u32).await;
            }
            for &port in candidates {
                if !self.taken.lock().insert(port) {
                    continue; // reserved by another worker
                }
                if probe_free(port).await {
                    sleep(SETTLE_DELAY).await;
                    debug!(port, "acquired");
                    return Ok(port);
                }
                // Occupied by something outside the pool
                self.taken.lock().remove(&port);
            }
            trace!(attempt, "no free port, rescanning");
        }
        Err(Error::PortExhausted {
            start: self.start,
            end: self.end,
            attempts: SCAN_ATTEMPTS,
        })
    }

    /// Return a port to the pool; safe to call repeatedly
    pub fn release(&self, port: u16) {
        if self.taken.lock().remove(&port) {
            debug!(port, "released");
        }
    }

    pub fn in_use(&self) -> usize {
        self.taken.lock().len()
    }
}

/// Connect-probe liveness check
///
/// An established connection means something is listening. Only an
/// immediate connection-refused counts as free; a timeout or any
/// other failure is treated as occupied so a listener that bound but
/// is still initializing never reads as available.
async fn probe_free(port: u16) -> bool {
    match timeout(PROBE_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await {
        Ok(Ok(_stream)) => false,
        Ok(Err(e)) => e.kind() == ErrorKind::ConnectionRefused,
        Err(_elapsed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_concurrent_acquires_are_disjoint() {
        let pool = Arc::new(PortPool::new(42100, 42160));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.acquire().await.unwrap() }));
        }

        let mut ports = Vec::new();
        for handle in handles {
            ports.push(handle.await.unwrap());
        }
        let distinct: HashSet<u16> = ports.iter().copied().collect();
        assert_eq!(distinct.len(), ports.len());
        assert_eq!(pool.in_use(), 8);
    }

    #[tokio::test]
    async fn test_release_is_idempotent() {
        let pool = PortPool::new(42200, 42210);
        let port = pool.acquire().await.unwrap();
        pool.release(port);
        pool.release(port);
        assert_eq!(pool.in_use(), 0);
    }

    #[tokio::test]
    async fn test_listening_port_is_skipped() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = listener.local_addr().unwrap().port();

        let pool = PortPool::new(busy, busy);
        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, Error::PortExhausted { .. }));
        assert_eq!(pool.in_use(), 0);
        drop(listener);
    }

    #[tokio::test]
    async fn test_acquire_one_of_prefers_earlier_candidates() {
        let pool = PortPool::new(42300, 42310);
        let port = pool.acquire_one_of(&[42305, 42306]).await.unwrap();
        assert_eq!(port, 42305);
    }
}
