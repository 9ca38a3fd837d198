use anyhow::Context;
use socket2::Protocol;
use std::net::SocketAddr;

/// How a listening UDP socket treats the address family.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum Family {
    /// IPv4 only. An unspecified host binds `0.0.0.0`.
    V4,
    /// IPv6 only, the socket is created with `IPV6_V6ONLY`.
    V6,
    /// Dual stack where the platform allows it.
    #[default]
    Any,
}

impl Family {
    pub fn from_scheme(scheme: &str) -> Family {
        if scheme.ends_with('4') {
            Family::V4
        } else if scheme.ends_with('6') {
            Family::V6
        } else {
            Family::Any
        }
    }
    pub fn accepts(&self, addr: &SocketAddr) -> bool {
        match self {
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
            Family::Any => true,
        }
    }
    /// Whether a socket of this family bound to `local` can send to `remote`.
    ///
    /// A `Family::Any` socket bound to the unspecified IPv6 address is dual
    /// stack and reaches both families.
    pub fn reaches(&self, local: &SocketAddr, remote: &SocketAddr) -> bool {
        match self {
            Family::V4 | Family::V6 => self.accepts(remote),
            Family::Any => match local {
                SocketAddr::V4(_) => remote.is_ipv4(),
                SocketAddr::V6(v6) => v6.ip().is_unspecified() || remote.is_ipv6(),
            },
        }
    }
}

pub(crate) fn bind_udp_ops(addr: SocketAddr, only_v6: bool) -> anyhow::Result<socket2::Socket> {
    let socket = if addr.is_ipv4() {
        socket2::Socket::new(
            socket2::Domain::IPV4,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?
    } else {
        let socket = socket2::Socket::new(
            socket2::Domain::IPV6,
            socket2::Type::DGRAM,
            Some(Protocol::UDP),
        )?;
        socket
            .set_only_v6(only_v6)
            .with_context(|| format!("set_only_v6 failed: {}", &addr))?;
        socket
    };
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket)
}

/// Bind a non-blocking UDP socket and hand it to tokio.
///
/// Must be called from within a tokio runtime.
pub fn bind_udp(addr: SocketAddr, family: Family) -> anyhow::Result<tokio::net::UdpSocket> {
    let socket = bind_udp_ops(addr, family == Family::V6)
        .with_context(|| format!("bind_udp {}", addr))?;
    let udp: std::net::UdpSocket = socket.into();
    tokio::net::UdpSocket::from_std(udp).with_context(|| format!("register udp {}", addr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn family_from_scheme() {
        assert_eq!(Family::from_scheme("quic"), Family::Any);
        assert_eq!(Family::from_scheme("quic4"), Family::V4);
        assert_eq!(Family::from_scheme("quic6"), Family::V6);
    }

    #[test]
    fn dual_stack_reaches_both_families() {
        let v4: SocketAddr = "192.0.2.1:3478".parse().unwrap();
        let v6: SocketAddr = "[2001:db8::1]:3478".parse().unwrap();
        let any6: SocketAddr = "[::]:22000".parse().unwrap();
        let any4: SocketAddr = "0.0.0.0:22000".parse().unwrap();
        let lo6: SocketAddr = "[::1]:22000".parse().unwrap();

        assert!(Family::Any.reaches(&any6, &v4));
        assert!(Family::Any.reaches(&any6, &v6));
        assert!(Family::Any.reaches(&any4, &v4));
        assert!(!Family::Any.reaches(&any4, &v6));
        assert!(!Family::Any.reaches(&lo6, &v4));
        assert!(!Family::V6.reaches(&any6, &v4));
        assert!(!Family::V4.reaches(&any4, &v6));
    }

    #[tokio::test]
    async fn bind_ephemeral_v4() {
        let udp = bind_udp("127.0.0.1:0".parse().unwrap(), Family::V4).unwrap();
        let addr = udp.local_addr().unwrap();
        assert!(addr.is_ipv4());
        assert_ne!(addr.port(), 0);
    }
}
