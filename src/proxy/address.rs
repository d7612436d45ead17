use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::net::conn::BufferedConnection;

pub const SOCKS5_VERSION: u8 = 0x05;
pub const SOCKS5_RESERVED: u8 = 0x00;

pub const METHOD_NO_AUTH: u8 = 0x00;
pub const METHOD_NOT_ACCEPTABLE: u8 = 0xFF;

pub const CMD_CONNECT: u8 = 0x01;

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

// SOCKS5 reply codes (RFC 1928 §6)
pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CONNECTION_NOT_ALLOWED: u8 = 0x02;
pub const REPLY_HOST_UNREACHABLE: u8 = 0x04;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_TYPE_NOT_SUPPORTED: u8 = 0x08;

/// Destination address as carried in a request frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddressSpec {
    Ipv4(Ipv4Addr),
    Ipv6(Ipv6Addr),
    /// Raw hostname bytes, at most 255 of them.
    Domain(Vec<u8>),
}

impl AddressSpec {
    /// Decodes `ATYP` and the address that follows it.
    ///
    /// Returns `Ok(Err(atyp))` for an unknown address type, before anything
    /// past the type byte is consumed.
    pub async fn read_from<S>(
        conn: &mut BufferedConnection<S>,
    ) -> io::Result<Result<AddressSpec, u8>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let atyp = conn.read_u8().await?;
        let address = match atyp {
            ATYP_IPV4 => {
                let data = conn.read_exact_bytes(4).await?;
                AddressSpec::Ipv4(Ipv4Addr::new(data[0], data[1], data[2], data[3]))
            }
            ATYP_IPV6 => {
                let data = conn.read_exact_bytes(16).await?;
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&data);
                AddressSpec::Ipv6(Ipv6Addr::from(octets))
            }
            ATYP_DOMAIN => {
                let len = conn.read_u8().await? as usize;
                AddressSpec::Domain(conn.read_exact_bytes(len).await?)
            }
            other => return Ok(Err(other)),
        };
        Ok(Ok(address))
    }

    pub fn atyp(&self) -> u8 {
        match self {
            AddressSpec::Ipv4(_) => ATYP_IPV4,
            AddressSpec::Ipv6(_) => ATYP_IPV6,
            AddressSpec::Domain(_) => ATYP_DOMAIN,
        }
    }

    pub fn write_to(&self, buf: &mut Vec<u8>) {
        buf.push(self.atyp());
        match self {
            AddressSpec::Ipv4(ip) => buf.extend_from_slice(&ip.octets()),
            AddressSpec::Ipv6(ip) => buf.extend_from_slice(&ip.octets()),
            AddressSpec::Domain(host) => {
                buf.push(host.len() as u8);
                buf.extend_from_slice(host);
            }
        }
    }
}

impl fmt::Display for AddressSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressSpec::Ipv4(ip) => write!(f, "{}", ip),
            AddressSpec::Ipv6(ip) => write!(f, "{}", ip),
            AddressSpec::Domain(host) => write!(f, "{}", String::from_utf8_lossy(host)),
        }
    }
}

/// Looks `host` up with the system resolver and picks a single address,
/// the first IPv4 one when there is any.
pub async fn resolve_host(host: &str) -> io::Result<IpAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, 0)).await?.collect();
    addrs
        .iter()
        .find(|addr| addr.is_ipv4())
        .or_else(|| addrs.first())
        .map(|addr| addr.ip())
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses found"))
}

/// The reply sent once the upstream connection exists.
///
/// ```text
/// +----+-----+-------+------+----------+----------+
/// |VER | REP |  RSV  | ATYP | BND.ADDR | BND.PORT |
/// +----+-----+-------+------+----------+----------+
/// | 1  |  1  | X'00' |  1   | Variable |    2     |
/// +----+-----+-------+------+----------+----------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindReply {
    pub status: u8,
    pub address: AddressSpec,
    pub port: u16,
}

impl BindReply {
    /// Success reply for an upstream socket bound at `local` that was dialed
    /// for `requested`.
    ///
    /// An IPv4 (or IPv4-mapped) local address is reported as is. Otherwise
    /// the type is IPv6 but the address bytes are the requested
    /// destination's, not the local address. Clients that care about
    /// `BND.ADDR` rely on this exact shape.
    pub fn for_connection(local: SocketAddr, requested: IpAddr) -> Self {
        let local_v4 = match local.ip() {
            IpAddr::V4(ip) => Some(ip),
            IpAddr::V6(ip) => ip.to_ipv4_mapped(),
        };
        let address = match local_v4 {
            Some(ip) => AddressSpec::Ipv4(ip),
            None => match requested {
                IpAddr::V4(ip) => AddressSpec::Ipv6(ip.to_ipv6_mapped()),
                IpAddr::V6(ip) => AddressSpec::Ipv6(ip),
            },
        };
        BindReply {
            status: REPLY_SUCCEEDED,
            address,
            port: local.port(),
        }
    }

    pub fn failure(status: u8) -> Self {
        BindReply {
            status,
            address: AddressSpec::Ipv4(Ipv4Addr::UNSPECIFIED),
            port: 0,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(22);
        buf.extend_from_slice(&[SOCKS5_VERSION, self.status, SOCKS5_RESERVED]);
        self.address.write_to(&mut buf);
        buf.extend_from_slice(&self.port.to_be_bytes());
        buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    async fn decode(bytes: &[u8]) -> (io::Result<Result<AddressSpec, u8>>, usize) {
        let (mut peer, stream) = duplex(1024);
        peer.write_all(bytes).await.unwrap();
        drop(peer);
        let mut conn = BufferedConnection::new(stream, 1024);
        let result = AddressSpec::read_from(&mut conn).await;
        (result, conn.buffered())
    }

    #[tokio::test]
    async fn test_decode_then_encode_is_identity() {
        let frames: [&[u8]; 3] = [
            &[ATYP_IPV4, 192, 168, 1, 1],
            &[
                ATYP_IPV6, 0x20, 0x01, 0x0d, 0xb8, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1,
            ],
            b"\x03\x0bexample.com",
        ];
        for frame in frames {
            let (result, left) = decode(frame).await;
            let address = result.unwrap().unwrap();
            assert_eq!(left, 0);
            let mut encoded = Vec::new();
            address.write_to(&mut encoded);
            assert_eq!(encoded, frame);
        }
    }

    #[tokio::test]
    async fn test_domain_length_is_honoured() {
        let (result, left) = decode(b"\x03\x09localhost\x00\x50").await;
        assert_eq!(
            result.unwrap().unwrap(),
            AddressSpec::Domain(b"localhost".to_vec())
        );
        assert_eq!(left, 2);
    }

    #[tokio::test]
    async fn test_unknown_atyp_stops_at_type_byte() {
        let (result, left) = decode(&[0x02, 1, 2, 3, 4, 0, 80]).await;
        assert_eq!(result.unwrap(), Err(0x02));
        assert_eq!(left, 6);
    }

    #[tokio::test]
    async fn test_truncated_address_is_transport_error() {
        let (result, _) = decode(&[ATYP_IPV6, 0, 0, 0]).await;
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_reply_for_ipv4_local() {
        let local: SocketAddr = "10.0.0.2:40000".parse().unwrap();
        let reply = BindReply::for_connection(local, "93.184.216.34".parse().unwrap());
        assert_eq!(
            reply.encode(),
            vec![0x05, 0x00, 0x00, 0x01, 10, 0, 0, 2, 0x9c, 0x40]
        );
    }

    #[test]
    fn test_reply_for_mapped_local_is_ipv4() {
        let local: SocketAddr = "[::ffff:127.0.0.1]:8080".parse().unwrap();
        let reply = BindReply::for_connection(local, "127.0.0.1".parse().unwrap());
        assert_eq!(reply.address, AddressSpec::Ipv4(Ipv4Addr::LOCALHOST));
        assert_eq!(reply.port, 8080);
    }

    #[test]
    fn test_reply_for_ipv6_local_uses_requested_bytes() {
        let local: SocketAddr = "[fe80::1]:5000".parse().unwrap();
        let requested: IpAddr = "2001:db8::7".parse().unwrap();
        let reply = BindReply::for_connection(local, requested);
        assert_eq!(reply.address, AddressSpec::Ipv6("2001:db8::7".parse().unwrap()));

        let bytes = reply.encode();
        assert_eq!(bytes.len(), 3 + 1 + 16 + 2);
        assert_eq!(bytes[3], ATYP_IPV6);
        assert_eq!(&bytes[20..], &5000u16.to_be_bytes());
    }

    #[test]
    fn test_failure_reply() {
        assert_eq!(
            BindReply::failure(REPLY_CONNECTION_REFUSED).encode(),
            vec![0x05, 0x05, 0x00, 0x01, 0, 0, 0, 0, 0, 0]
        );
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let ip = resolve_host("localhost").await.unwrap();
        assert!(ip.is_loopback());
    }
}
