//! Address resolution and normalization helpers.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};

/// Resolves a host string to an IPv4 address.
///
/// Accepts a literal address or a DNS name; for names the first IPv4 result
/// wins, matching the behavior of the configuration loader.
pub fn resolve_ipv4(host: &str) -> Option<Ipv4Addr> {
    if let Ok(addr) = host.parse::<IpAddr>() {
        return match addr {
            IpAddr::V4(addr) => Some(addr),
            IpAddr::V6(_) => None,
        };
    }

    let candidates = (host, 0u16).to_socket_addrs().ok()?;
    for candidate in candidates {
        if let SocketAddr::V4(addr) = candidate {
            return Some(*addr.ip());
        }
    }
    None
}

/// Returns `true` when `ip` belongs to this machine.
///
/// Loopback is local by definition. For other addresses a throwaway UDP
/// socket is connected towards the address (no datagram leaves the host) and
/// the kernel-chosen source address is compared against it: routing towards
/// one of our own interfaces always selects that interface.
pub fn is_local_address(ip: IpAddr) -> bool {
    if ip.is_loopback() {
        return true;
    }

    let probe = match UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    if probe.connect((ip, 7)).is_err() {
        return false;
    }
    match probe.local_addr() {
        Ok(local) => local.ip() == ip,
        Err(_) => false,
    }
}

/// Rewrites a datagram sender that belongs to the local machine to the
/// loopback address, so replies never echo out of a public interface.
pub fn normalize_sender(sender: SocketAddr) -> SocketAddr {
    if is_local_address(sender.ip()) {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), sender.port())
    } else {
        sender
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_literal_ipv4() {
        assert_eq!(
            resolve_ipv4("192.168.1.10"),
            Some(Ipv4Addr::new(192, 168, 1, 10))
        );
    }

    #[test]
    fn rejects_ipv6_literal() {
        assert_eq!(resolve_ipv4("::1"), None);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(resolve_ipv4("not a host name"), None);
    }

    #[test]
    fn loopback_is_local() {
        assert!(is_local_address("127.0.0.1".parse().unwrap()));
    }

    #[test]
    fn loopback_sender_is_normalized() {
        let sender: SocketAddr = "127.0.0.1:14550".parse().unwrap();
        assert_eq!(normalize_sender(sender), sender);

        let remote: SocketAddr = "203.0.113.5:14550".parse().unwrap();
        assert_eq!(normalize_sender(remote), remote);
    }
}
