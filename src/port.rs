//! Per-session RTP port allocation
//!
//! Hands out one bindable UDP port per session. The shared cursor and the
//! set of currently-leased ports live behind one short-held mutex; the
//! bind/release probe for a candidate runs outside the lock so a slow probe
//! never serializes other callers.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Weak};

use tracing::{debug, warn};

use crate::{Error, Result};

/// Thread-safe allocator for per-session RTP ports
///
/// Ports are verified bindable with an actual bind/release cycle immediately
/// before issuance, never merely assumed. The cursor advances monotonically
/// and wraps from `max_port` back to `base_port`; probing is capped, and a
/// fully-occupied range surfaces as [`Error::PortsExhausted`].
pub struct PortAllocator {
    host: String,
    base_port: u16,
    max_port: u16,
    max_probes: u32,
    state: Mutex<AllocatorState>,
}

struct AllocatorState {
    /// Next candidate port
    cursor: u16,
    /// Ports currently held by a live lease
    leased: HashSet<u16>,
}

/// A reserved, exclusively-held port number
///
/// The port returns to the allocator when the lease is dropped, which the
/// session coordinator arranges to happen only once the owning session has
/// fully closed.
pub struct PortLease {
    port: u16,
    allocator: Weak<PortAllocator>,
}

impl PortLease {
    /// The leased port number
    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for PortLease {
    fn drop(&mut self) {
        if let Some(allocator) = self.allocator.upgrade() {
            allocator.release(self.port);
        }
    }
}

impl std::fmt::Debug for PortLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortLease").field("port", &self.port).finish()
    }
}

impl PortAllocator {
    /// Create a new allocator probing `host` over `base_port..=max_port`
    pub fn new(host: impl Into<String>, base_port: u16, max_port: u16, max_probes: u32) -> Self {
        Self {
            host: host.into(),
            base_port,
            max_port,
            max_probes,
            state: Mutex::new(AllocatorState {
                cursor: base_port,
                leased: HashSet::new(),
            }),
        }
    }

    /// Reserve the next bindable port
    ///
    /// Each candidate is tentatively marked leased under the lock, then
    /// bind-probed outside it; a candidate that fails to bind is unmarked
    /// and skipped. At most `max_probes` candidates are tried before
    /// [`Error::PortsExhausted`] is returned.
    pub fn reserve(self: &Arc<Self>) -> Result<PortLease> {
        for _ in 0..self.max_probes {
            let Some(candidate) = self.next_candidate() else {
                // Every port in range is leased to a live session.
                break;
            };

            match std::net::UdpSocket::bind((self.host.as_str(), candidate)) {
                Ok(probe) => {
                    // Release the probe socket; the pump re-binds the port.
                    drop(probe);
                    debug!(port = candidate, "reserved RTP port");
                    return Ok(PortLease {
                        port: candidate,
                        allocator: Arc::downgrade(self),
                    });
                }
                Err(e) => {
                    debug!(port = candidate, error = %e, "port unavailable, probing next");
                    self.release(candidate);
                }
            }
        }

        warn!(
            base = self.base_port,
            max = self.max_port,
            probes = self.max_probes,
            "port probing exhausted"
        );
        Err(Error::PortsExhausted {
            base: self.base_port,
            max: self.max_port,
            attempts: self.max_probes,
        })
    }

    /// Pick the next candidate not already leased and mark it leased
    ///
    /// Only the cursor read-and-advance happens under the lock; the probe
    /// itself does not.
    fn next_candidate(&self) -> Option<u16> {
        let range_len = u32::from(self.max_port - self.base_port) + 1;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for _ in 0..range_len {
            let port = state.cursor;
            state.cursor = if port >= self.max_port {
                self.base_port
            } else {
                port + 1
            };
            if state.leased.insert(port) {
                return Some(port);
            }
        }
        None
    }

    fn release(&self, port: u16) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.leased.remove(&port);
    }

    /// Number of ports currently held by live leases
    pub fn leased_count(&self) -> usize {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.leased.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Grab an OS-assigned free loopback port, returning the bound socket
    /// so the port stays occupied for as long as the test needs.
    fn occupied_port() -> (std::net::UdpSocket, u16) {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        (socket, port)
    }

    #[test]
    fn test_concurrent_reserves_are_distinct() {
        let allocator = Arc::new(PortAllocator::new("127.0.0.1", 18000, 18999, 128));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let allocator = Arc::clone(&allocator);
                std::thread::spawn(move || allocator.reserve().unwrap())
            })
            .collect();

        let leases: Vec<PortLease> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let mut ports: Vec<u16> = leases.iter().map(|l| l.port()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 8, "every session must get a distinct port");
        assert_eq!(allocator.leased_count(), 8);
    }

    #[test]
    fn test_exhaustion_is_typed() {
        let (_holder, port) = occupied_port();
        let allocator = Arc::new(PortAllocator::new("127.0.0.1", port, port, 4));

        // The only port in range is already bound by someone else.
        // (cursor wrap means the same port is probed until the cap hits)
        let err = allocator.reserve().unwrap_err();
        assert!(matches!(err, Error::PortsExhausted { attempts: 4, .. }));
        assert_eq!(allocator.leased_count(), 0);
    }

    #[test]
    fn test_lease_drop_releases_port() {
        let (holder, port) = occupied_port();
        drop(holder);
        let allocator = Arc::new(PortAllocator::new("127.0.0.1", port, port, 4));

        let lease = allocator.reserve().unwrap();
        assert_eq!(lease.port(), port);
        assert_eq!(allocator.leased_count(), 1);

        // While leased, the wrapped cursor cannot re-issue the same port.
        assert!(allocator.reserve().is_err());

        drop(lease);
        assert_eq!(allocator.leased_count(), 0);
        let lease = allocator.reserve().unwrap();
        assert_eq!(lease.port(), port);
    }

    #[test]
    fn test_cursor_skips_unbindable_port() {
        let (_holder, port) = occupied_port();
        // Range of two ports where the first is occupied; allocation must
        // skip to the next one. The neighbouring port may itself be busy on
        // a loaded machine, so only check we did not get the occupied one.
        let allocator = Arc::new(PortAllocator::new("127.0.0.1", port, port + 1, 8));
        if let Ok(lease) = allocator.reserve() {
            assert_ne!(lease.port(), port);
        }
    }

    #[test]
    fn test_lease_outliving_allocator_is_harmless() {
        let allocator = Arc::new(PortAllocator::new("127.0.0.1", 19000, 19999, 32));
        let lease = allocator.reserve().unwrap();
        drop(allocator);
        drop(lease); // must not panic with the allocator gone
    }
}
