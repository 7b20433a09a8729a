//! PROXY protocol headers
//!
//! Written to a backend before any client bytes when the route asks for it,
//! so the backend learns the real client address (HAProxy `send-proxy` /
//! `send-proxy-v2`).

use bytes::{BufMut, Bytes, BytesMut};
use std::net::{IpAddr, SocketAddr};

use snimux_router::ProxyProtocol;

/// v2 signature, fixed by the protocol
const V2_SIGNATURE: [u8; 12] = *b"\r\n\r\n\0\r\nQUIT\n";
const V2_VERSION_PROXY: u8 = 0x21;
const V2_TCP_OVER_IPV4: u8 = 0x11;
const V2_TCP_OVER_IPV6: u8 = 0x21;

/// Encode the header for `version`, or `None` when disabled
pub fn encode(version: ProxyProtocol, client: SocketAddr, local: SocketAddr) -> Option<Bytes> {
    match version {
        ProxyProtocol::Off => None,
        ProxyProtocol::V1 => Some(encode_v1(client, local)),
        ProxyProtocol::V2 => Some(encode_v2(client, local)),
    }
}

/// `PROXY TCP4 <src> <dst> <sport> <dport>\r\n`
pub fn encode_v1(client: SocketAddr, local: SocketAddr) -> Bytes {
    let line = match (canonical(client.ip()), canonical(local.ip())) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => format!(
            "PROXY TCP4 {} {} {} {}\r\n",
            src,
            dst,
            client.port(),
            local.port()
        ),
        (IpAddr::V6(src), IpAddr::V6(dst)) => format!(
            "PROXY TCP6 {} {} {} {}\r\n",
            src,
            dst,
            client.port(),
            local.port()
        ),
        _ => "PROXY UNKNOWN\r\n".to_string(),
    };
    Bytes::from(line)
}

/// Binary v2 header with the PROXY command
pub fn encode_v2(client: SocketAddr, local: SocketAddr) -> Bytes {
    let mut buf = BytesMut::with_capacity(16 + 36);
    buf.put_slice(&V2_SIGNATURE);
    buf.put_u8(V2_VERSION_PROXY);

    match (canonical(client.ip()), canonical(local.ip())) {
        (IpAddr::V4(src), IpAddr::V4(dst)) => {
            buf.put_u8(V2_TCP_OVER_IPV4);
            buf.put_u16(12);
            buf.put_slice(&src.octets());
            buf.put_slice(&dst.octets());
        }
        (src, dst) => {
            // Mixed families are sent as IPv6 with v4-mapped addresses
            buf.put_u8(V2_TCP_OVER_IPV6);
            buf.put_u16(36);
            buf.put_slice(&to_v6(src).octets());
            buf.put_slice(&to_v6(dst).octets());
        }
    }

    buf.put_u16(client.port());
    buf.put_u16(local.port());
    buf.freeze()
}

fn canonical(ip: IpAddr) -> IpAddr {
    ip.to_canonical()
}

fn to_v6(ip: IpAddr) -> std::net::Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}
