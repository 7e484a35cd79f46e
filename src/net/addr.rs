//! Local interface enumeration and remote name resolution.

use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs};

use crate::net::tcp::traits::{LogLevel, Logger};

/// Hosts that get the short loopback connect timeout.
pub fn is_loopback_name(host: &str) -> bool {
    host.eq_ignore_ascii_case("localhost") || host == "127.0.0.1"
}

/// Addresses to listen on when no bind address was given: every IPv4 address
/// of the machine that is neither loopback nor link-local, followed by
/// `127.0.0.1`.
pub fn local_listen_addresses(logger: &dyn Logger) -> Vec<String> {
    let mut out = Vec::new();
    match if_addrs::get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces {
                let IpAddr::V4(ip) = iface.ip() else {
                    continue;
                };
                if ip.is_loopback() || ip.is_link_local() || ip.is_unspecified() {
                    continue;
                }
                let ip = ip.to_string();
                if !out.contains(&ip) {
                    out.push(ip);
                }
            }
        }
        Err(e) => logger.log(
            LogLevel::Warn,
            &format!("Failed to enumerate network interfaces ({e})"),
        ),
    }
    out.push(Ipv4Addr::LOCALHOST.to_string());
    out
}

/// Resolves `host:port` to its IPv4 addresses, in resolver order.
pub fn resolve_remote(host: &str, port: u16) -> io::Result<Vec<SocketAddr>> {
    Ok((host, port)
        .to_socket_addrs()?
        .filter(SocketAddr::is_ipv4)
        .collect())
}

/// Resolves a listen address. Literal addresses skip the resolver.
pub fn resolve_listen(ip: &str, port: u16) -> io::Result<SocketAddr> {
    if let Ok(ip) = ip.parse::<Ipv4Addr>() {
        return Ok(SocketAddr::from((ip, port)));
    }
    resolve_remote(ip, port)?.into_iter().next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            format!("no IPv4 address for '{ip}'"),
        )
    })
}

/// Where to connect to wake a listener bound to `addr`.
pub fn wake_address(addr: SocketAddr) -> SocketAddr {
    if addr.ip().is_unspecified() {
        SocketAddr::from((Ipv4Addr::LOCALHOST, addr.port()))
    } else {
        addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::tcp::traits::NoOpLogger;

    #[test]
    fn test_loopback_names() {
        assert!(is_loopback_name("localhost"));
        assert!(is_loopback_name("LocalHost"));
        assert!(is_loopback_name("127.0.0.1"));
        assert!(!is_loopback_name("127.0.0.2"));
        assert!(!is_loopback_name("buildfarm-01"));
    }

    #[test]
    fn test_local_listen_addresses_end_with_loopback() {
        let addrs = local_listen_addresses(&NoOpLogger);
        assert_eq!(addrs.last().map(String::as_str), Some("127.0.0.1"));
        assert_eq!(addrs.iter().filter(|a| *a == "127.0.0.1").count(), 1);
        assert!(addrs.iter().all(|a| !a.starts_with("169.254.")));
    }

    #[test]
    fn test_resolve() {
        let addrs = resolve_remote("127.0.0.1", 1345).unwrap();
        assert_eq!(addrs, vec!["127.0.0.1:1345".parse().unwrap()]);
        assert_eq!(
            resolve_listen("0.0.0.0", 80).unwrap(),
            "0.0.0.0:80".parse().unwrap()
        );
    }

    #[test]
    fn test_wake_address_rewrites_any() {
        assert_eq!(
            wake_address("0.0.0.0:1345".parse().unwrap()),
            "127.0.0.1:1345".parse().unwrap()
        );
        assert_eq!(
            wake_address("10.1.2.3:1345".parse().unwrap()),
            "10.1.2.3:1345".parse().unwrap()
        );
    }
}
