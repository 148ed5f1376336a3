//! Backend channel table (spec §3): an ordered list of `(host, port)`
//! parsed from configuration, with the default and fallback-on-failure
//! indices mutable at runtime via the admin interface.

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

pub struct BackendTable {
    servers: Vec<(String, u16)>,
    default_channel: AtomicUsize,
    fallback_channel: AtomicUsize,
    /// Cached resolved addresses, refreshed lazily; `ArcSwap` lets
    /// readers (the acceptor) never block on the admin thread updating
    /// a channel index.
    resolved: ArcSwap<Vec<Option<SocketAddr>>>,
}

impl BackendTable {
    pub fn new(servers: Vec<(String, u16)>, default_channel: usize, fallback_channel: usize) -> Self {
        let resolved = servers.iter().map(|(host, port)| resolve_host(host, *port)).collect();
        BackendTable {
            servers,
            default_channel: AtomicUsize::new(default_channel),
            fallback_channel: AtomicUsize::new(fallback_channel),
            resolved: ArcSwap::from_pointee(resolved),
        }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn default_channel(&self) -> usize {
        self.default_channel.load(Ordering::Relaxed)
    }

    pub fn fallback_channel(&self) -> usize {
        self.fallback_channel.load(Ordering::Relaxed)
    }

    pub fn set_default_channel(&self, idx: usize) {
        self.default_channel.store(idx, Ordering::Relaxed);
    }

    pub fn set_fallback_channel(&self, idx: usize) {
        self.fallback_channel.store(idx, Ordering::Relaxed);
    }

    /// Clamps an out-of-range channel index to zero, matching "channel
    /// >= N => 0" in spec §4.4 step 5.
    pub fn clamp(&self, idx: usize) -> usize {
        if idx >= self.servers.len() {
            0
        } else {
            idx
        }
    }

    /// Opens an IPv4 TCP socket to the given channel with
    /// `SO_KEEPALIVE` set, per spec §6. Re-resolves the host if the
    /// cached address lookup previously failed.
    pub fn connect(&self, idx: usize) -> std::io::Result<TcpStream> {
        let idx = self.clamp(idx);
        let cached = self.resolved.load();
        let addr = match cached.get(idx).and_then(|a| *a) {
            Some(addr) => addr,
            None => {
                let (host, port) = &self.servers[idx];
                let addr = resolve_host(host, *port)
                    .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "unresolvable backend host"))?;
                let mut refreshed = (**cached).clone();
                refreshed[idx] = Some(addr);
                self.resolved.store(Arc::new(refreshed));
                addr
            }
        };

        let domain = if addr.is_ipv4() { Domain::IPV4 } else { Domain::IPV6 };
        let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))?;
        socket.set_keepalive(true)?;
        socket.connect_timeout(&addr.into(), Duration::from_secs(5))?;
        Ok(socket.into())
    }
}

fn resolve_host(host: &str, port: u16) -> Option<SocketAddr> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Some(SocketAddr::new(ip, port));
    }
    use std::net::ToSocketAddrs;
    let lookup = format!("{host}:{port}");
    match lookup.to_socket_addrs() {
        Ok(mut addrs) => addrs.next(),
        Err(e) => {
            debug!(host, port, error = %e, "backend host lookup failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clamp_wraps_out_of_range_to_zero() {
        let table = BackendTable::new(vec![("127.0.0.1".into(), 1), ("127.0.0.1".into(), 2)], 0, 0);
        assert_eq!(table.clamp(0), 0);
        assert_eq!(table.clamp(1), 1);
        assert_eq!(table.clamp(2), 0);
        assert_eq!(table.clamp(100), 0);
    }

    #[test]
    fn channel_indices_are_runtime_mutable() {
        let table = BackendTable::new(vec![("127.0.0.1".into(), 1), ("127.0.0.1".into(), 2)], 0, 0);
        table.set_default_channel(1);
        table.set_fallback_channel(1);
        assert_eq!(table.default_channel(), 1);
        assert_eq!(table.fallback_channel(), 1);
    }
}
