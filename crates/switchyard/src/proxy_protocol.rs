//! PROXY protocol
//!
//! Outbound: a v2 header written ahead of the client's bytes on TCP routes
//! that ask for it. Inbound: v1 or v2 headers from a load balancer in front of
//! the HTTP listeners, giving back the original client address.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use tokio::io::{AsyncRead, AsyncReadExt};

const V2_SIGNATURE: [u8; 12] = [
    0x0D, 0x0A, 0x0D, 0x0A, 0x00, 0x0D, 0x0A, 0x51, 0x55, 0x49, 0x54, 0x0A,
];
const V2_PROXY: u8 = 0x21;
const V2_LOCAL: u8 = 0x20;
const AF_INET_STREAM: u8 = 0x11;
const AF_INET6_STREAM: u8 = 0x21;

/// Longest v1 line including CRLF
const V1_MAX_LEN: usize = 107;

/// Encode a v2 PROXY header for a stream from `src` accepted on `dst`.
///
/// Mixed families are sent as IPv6 with the IPv4 side mapped.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr) -> Vec<u8> {
    let mut buf = Vec::with_capacity(52);
    buf.extend_from_slice(&V2_SIGNATURE);
    buf.push(V2_PROXY);

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            buf.push(AF_INET_STREAM);
            buf.extend_from_slice(&12u16.to_be_bytes());
            buf.extend_from_slice(&s.octets());
            buf.extend_from_slice(&d.octets());
        }
        (s, d) => {
            buf.push(AF_INET6_STREAM);
            buf.extend_from_slice(&36u16.to_be_bytes());
            buf.extend_from_slice(&to_v6(s).octets());
            buf.extend_from_slice(&to_v6(d).octets());
        }
    }
    buf.extend_from_slice(&src.port().to_be_bytes());
    buf.extend_from_slice(&dst.port().to_be_bytes());
    buf
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Read a v1 or v2 header from the start of a stream.
///
/// Consumes exactly the header bytes. Returns the original source address, or
/// `None` for `LOCAL` / `UNKNOWN` headers where the peer address stands.
pub async fn read_header<S>(stream: &mut S) -> io::Result<Option<SocketAddr>>
where
    S: AsyncRead + Unpin,
{
    let first = stream.read_u8().await?;
    match first {
        0x0D => read_v2(stream).await,
        b'P' => read_v1(stream).await,
        _ => Err(invalid("missing PROXY protocol header")),
    }
}

async fn read_v2<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Option<SocketAddr>> {
    let mut head = [0u8; 15];
    stream.read_exact(&mut head).await?;
    if head[..11] != V2_SIGNATURE[1..] {
        return Err(invalid("bad PROXY v2 signature"));
    }
    let command = head[11];
    let family = head[12];
    let len = u16::from_be_bytes([head[13], head[14]]) as usize;

    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await?;

    match command {
        V2_LOCAL => Ok(None),
        V2_PROXY => parse_v2_addresses(family, &body),
        _ => Err(invalid("unsupported PROXY v2 command")),
    }
}

fn parse_v2_addresses(family: u8, body: &[u8]) -> io::Result<Option<SocketAddr>> {
    match family {
        AF_INET_STREAM if body.len() >= 12 => {
            let ip = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
            let port = u16::from_be_bytes([body[8], body[9]]);
            Ok(Some(SocketAddr::new(IpAddr::V4(ip), port)))
        }
        AF_INET6_STREAM if body.len() >= 36 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&body[..16]);
            let port = u16::from_be_bytes([body[32], body[33]]);
            Ok(Some(SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)))
        }
        // UDP, unix sockets and AF_UNSPEC carry nothing usable here
        _ => Ok(None),
    }
}

async fn read_v1<S: AsyncRead + Unpin>(stream: &mut S) -> io::Result<Option<SocketAddr>> {
    let mut line = vec![b'P'];
    while !line.ends_with(b"\r\n") {
        if line.len() >= V1_MAX_LEN {
            return Err(invalid("PROXY v1 header too long"));
        }
        line.push(stream.read_u8().await?);
    }
    let line = std::str::from_utf8(&line[..line.len() - 2])
        .map_err(|_| invalid("PROXY v1 header is not ASCII"))?;
    parse_v1(line)
}

fn parse_v1(line: &str) -> io::Result<Option<SocketAddr>> {
    let mut parts = line.split(' ');
    if parts.next() != Some("PROXY") {
        return Err(invalid("bad PROXY v1 preamble"));
    }
    match parts.next() {
        Some("UNKNOWN") => Ok(None),
        Some("TCP4") | Some("TCP6") => {
            let src: IpAddr = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| invalid("bad PROXY v1 source address"))?;
            let _dst = parts.next();
            let port: u16 = parts
                .next()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| invalid("bad PROXY v1 source port"))?;
            Ok(Some(SocketAddr::new(src, port)))
        }
        _ => Err(invalid("unknown PROXY v1 protocol")),
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_v2_ipv4() {
        let src: SocketAddr = "192.168.1.1:12345".parse().unwrap();
        let dst: SocketAddr = "10.0.0.1:3000".parse().unwrap();
        let header = encode_v2(src, dst);
        assert_eq!(header.len(), 28);
        assert_eq!(header[13], AF_INET_STREAM);

        let mut input = header.clone();
        input.extend_from_slice(b"payload");
        let mut reader = input.as_slice();
        assert_eq!(read_header(&mut reader).await.unwrap(), Some(src));
        // Only the header was consumed
        assert_eq!(reader, b"payload");
    }

    #[tokio::test]
    async fn test_v2_mixed_family_maps_to_v6() {
        let src: SocketAddr = "192.168.1.1:1".parse().unwrap();
        let dst: SocketAddr = "[2001:db8::2]:443".parse().unwrap();
        let header = encode_v2(src, dst);
        assert_eq!(header.len(), 52);

        let mut reader = header.as_slice();
        let parsed = read_header(&mut reader).await.unwrap().unwrap();
        assert_eq!(parsed.port(), 1);
        assert_eq!(parsed.ip(), IpAddr::V6(Ipv4Addr::new(192, 168, 1, 1).to_ipv6_mapped()));
    }

    #[tokio::test]
    async fn test_v2_local() {
        let mut header = V2_SIGNATURE.to_vec();
        header.extend_from_slice(&[V2_LOCAL, 0x00, 0x00, 0x00]);
        let mut reader = header.as_slice();
        assert_eq!(read_header(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_v1() {
        let mut reader: &[u8] = b"PROXY TCP4 203.0.113.7 10.0.0.1 56324 443\r\nGET /";
        assert_eq!(
            read_header(&mut reader).await.unwrap(),
            Some("203.0.113.7:56324".parse().unwrap())
        );
        assert_eq!(reader, b"GET /");

        let mut reader: &[u8] = b"PROXY UNKNOWN\r\n";
        assert_eq!(read_header(&mut reader).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_rejects_plain_traffic() {
        let mut reader: &[u8] = b"GET / HTTP/1.1\r\n\r\n";
        assert!(read_header(&mut reader).await.is_err());

        let mut long = b"PROXY TCP4 ".to_vec();
        long.extend(std::iter::repeat(b'1').take(200));
        let mut reader = long.as_slice();
        assert!(read_header(&mut reader).await.is_err());
    }
}
