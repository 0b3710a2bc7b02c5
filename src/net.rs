//!
//! Network helpers shared by the daemon: loopback classification and
//! best-effort reverse DNS, grounded in `original_source/util-net.c`.
//!
//! The platform resolver (`getnameinfo`/`gethostbyaddr`) is not guaranteed
//! reentrant, so `util-net.c` serializes every lookup behind a single
//! `hostentLock` pthread mutex. We do the same with a `std::sync::Mutex`
//! around the call.
//!

use std::net::{IpAddr, SocketAddr};
use std::sync::Mutex;

use log::debug;

static LOOKUP_LOCK: Mutex<()> = Mutex::new(());

/// True if `addr` can only be reached from this host, the gate CONNECT
/// requires before it will hand a client write access to a console.
pub fn is_loopback(addr: &SocketAddr) -> bool {
    match addr.ip() {
        IpAddr::V4(v4) => v4.is_loopback(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

/// Best-effort reverse lookup of `addr`'s IP into a host string. Returns
/// `None` on any failure; callers fall back to the IP's string form.
///
/// Serialized behind `LOOKUP_LOCK` because the underlying OS resolver call
/// is not safe to run concurrently from multiple threads (matching
/// `util-net.c`'s `hostentLock`).
pub fn resolve_peer_host(addr: &SocketAddr) -> Option<String> {
    let _guard = LOOKUP_LOCK.lock().expect("dns lookup mutex poisoned");
    match dns_lookup::lookup_addr(&addr.ip()) {
        Ok(host) => Some(host),
        Err(e) => {
            debug!("reverse lookup failed for {}: {}", addr.ip(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_v4_detected() {
        let addr: SocketAddr = "127.0.0.1:7890".parse().unwrap();
        assert!(is_loopback(&addr));
    }

    #[test]
    fn non_loopback_v4_rejected() {
        let addr: SocketAddr = "10.0.0.1:7890".parse().unwrap();
        assert!(!is_loopback(&addr));
    }

    #[test]
    fn loopback_v6_detected() {
        let addr: SocketAddr = "[::1]:7890".parse().unwrap();
        assert!(is_loopback(&addr));
    }
}
