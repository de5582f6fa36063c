use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use anyhow::bail;

/// An (IPv4 address, port) pair with a total order, usable as a key in the per-peer
///  connection registry.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct EndPoint {
    pub ip: [u8; 4],
    pub port: u16,
}

impl EndPoint {
    pub fn new(ip: [u8; 4], port: u16) -> EndPoint {
        EndPoint { ip, port }
    }

    pub fn to_socket_addr(&self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(
            Ipv4Addr::new(self.ip[0], self.ip[1], self.ip[2], self.ip[3]),
            self.port,
        ))
    }

    pub fn try_from_socket_addr(addr: SocketAddr) -> anyhow::Result<EndPoint> {
        match addr {
            SocketAddr::V4(v4) => Ok(EndPoint {
                ip: v4.ip().octets(),
                port: v4.port(),
            }),
            SocketAddr::V6(_) => bail!("IPv6 peer address {} is not supported", addr),
        }
    }
}

impl From<SocketAddrV4> for EndPoint {
    fn from(addr: SocketAddrV4) -> Self {
        EndPoint {
            ip: addr.ip().octets(),
            port: addr.port(),
        }
    }
}

impl Display for EndPoint {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}.{}:{}", self.ip[0], self.ip[1], self.ip[2], self.ip[3], self.port)
    }
}


#[cfg(test)]
mod tests {
    use rstest::rstest;
    use super::*;

    #[rstest]
    #[case::localhost([127, 0, 0, 1], 2345, "127.0.0.1:2345")]
    #[case::any([0, 0, 0, 0], 80, "0.0.0.0:80")]
    fn test_display_and_roundtrip(#[case] ip: [u8; 4], #[case] port: u16, #[case] expected: &str) {
        let ep = EndPoint::new(ip, port);
        assert_eq!(format!("{}", ep), expected);

        let addr = ep.to_socket_addr();
        assert_eq!(EndPoint::try_from_socket_addr(addr).unwrap(), ep);
    }

    #[test]
    fn test_ipv6_rejected() {
        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        assert!(EndPoint::try_from_socket_addr(addr).is_err());
    }

    #[test]
    fn test_ordering() {
        let a = EndPoint::new([10, 0, 0, 1], 100);
        let b = EndPoint::new([10, 0, 0, 1], 200);
        let c = EndPoint::new([10, 0, 0, 2], 50);

        assert!(a < b);
        assert!(b < c);
    }
}
