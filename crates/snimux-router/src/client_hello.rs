//! TLS ClientHello inspection
//!
//! Reads just enough of the TLS record layer to find the `server_name`
//! extension. Nothing here decrypts or answers the handshake; the bytes are
//! inspected in place and later forwarded unmodified.
//!
//! A ClientHello may be fragmented across several handshake records. The
//! handshake header (type + 24-bit length) must sit in the first record,
//! which every real client does.

use std::borrow::Cow;
use thiserror::Error;
use tracing::trace;

use crate::table::normalize_hostname;

/// TLS record header: content type (1), legacy version (2), length (2)
pub const RECORD_HEADER_LEN: usize = 5;

/// Largest plaintext record payload allowed by TLS (2^14)
pub const MAX_RECORD_LEN: usize = 16384;

const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;
const HANDSHAKE_HEADER_LEN: usize = 4;
const EXT_SERVER_NAME: u16 = 0x0000;
const NAME_TYPE_HOST_NAME: u8 = 0x00;

/// ClientHello parsing errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ClientHelloError {
    #[error("Not a TLS handshake record (content type {0:#04x})")]
    NotHandshake(u8),

    #[error("Unsupported record version {0}.{1}")]
    UnsupportedVersion(u8, u8),

    #[error("Handshake message is not a ClientHello (type {0:#04x})")]
    NotClientHello(u8),

    #[error("ClientHello needs {needed} bytes, inspection limit is {limit}")]
    TooLarge { needed: usize, limit: usize },

    #[error("Truncated {0}")]
    Truncated(&'static str),

    #[error("Malformed ClientHello: {0}")]
    Malformed(&'static str),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// Result of probing a partially received byte stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloProbe {
    /// More bytes are required before the ClientHello is complete
    NeedMore,
    /// The ClientHello ends at this offset (end of its last record)
    Complete(usize),
}

/// Handshake records making up one ClientHello
struct HandshakeRecords<'a> {
    payloads: Vec<&'a [u8]>,
    message_len: usize,
    end: usize,
}

/// Check whether `buf` holds a complete ClientHello without exceeding `limit` bytes.
///
/// Errors are returned as soon as the bytes seen so far prove the stream is
/// not a ClientHello, or that it cannot fit within `limit`.
pub fn probe_client_hello(buf: &[u8], limit: usize) -> Result<HelloProbe, ClientHelloError> {
    Ok(match collect_records(buf, limit)? {
        Some(records) => HelloProbe::Complete(records.end),
        None => HelloProbe::NeedMore,
    })
}

/// Extract the SNI hostname from a buffered ClientHello.
///
/// Returns `Ok(None)` for a well-formed ClientHello without a `server_name`
/// extension. The hostname is normalized to lowercase without a trailing dot.
pub fn extract_sni(buf: &[u8]) -> Result<Option<String>, ClientHelloError> {
    let records = collect_records(buf, usize::MAX)?.ok_or(ClientHelloError::Truncated("record"))?;

    let message: Cow<'_, [u8]> = if records.payloads.len() == 1 {
        Cow::Borrowed(&records.payloads[0][..records.message_len])
    } else {
        let mut joined = records.payloads.concat();
        joined.truncate(records.message_len);
        Cow::Owned(joined)
    };

    let sni = parse_client_hello(&message)?;
    trace!("Extracted SNI hostname: {:?}", sni);
    Ok(sni)
}

fn collect_records(buf: &[u8], limit: usize) -> Result<Option<HandshakeRecords<'_>>, ClientHelloError> {
    let mut offset = 0;
    let mut payloads = Vec::new();
    let mut received = 0;
    let mut message_len = None;

    loop {
        let Some(header) = buf.get(offset..offset + RECORD_HEADER_LEN) else {
            check_limit(offset + RECORD_HEADER_LEN, limit)?;
            return Ok(None);
        };

        if header[0] != CONTENT_TYPE_HANDSHAKE {
            return Err(ClientHelloError::NotHandshake(header[0]));
        }
        if header[1] != 3 {
            return Err(ClientHelloError::UnsupportedVersion(header[1], header[2]));
        }

        let len = u16::from_be_bytes([header[3], header[4]]) as usize;
        if len == 0 {
            return Err(ClientHelloError::Malformed("empty handshake record"));
        }
        if len > MAX_RECORD_LEN {
            return Err(ClientHelloError::Malformed("record longer than 2^14 bytes"));
        }

        let end = offset + RECORD_HEADER_LEN + len;
        check_limit(end, limit)?;
        let Some(payload) = buf.get(offset + RECORD_HEADER_LEN..end) else {
            return Ok(None);
        };

        let needed = match message_len {
            Some(needed) => needed,
            None => {
                if payload.len() < HANDSHAKE_HEADER_LEN {
                    return Err(ClientHelloError::Malformed(
                        "handshake header split across records",
                    ));
                }
                if payload[0] != HANDSHAKE_CLIENT_HELLO {
                    return Err(ClientHelloError::NotClientHello(payload[0]));
                }
                let body_len = u32::from_be_bytes([0, payload[1], payload[2], payload[3]]) as usize;
                let needed = HANDSHAKE_HEADER_LEN + body_len;
                // Each extra record adds another header; this is a lower bound.
                check_limit(RECORD_HEADER_LEN + needed, limit)?;
                message_len = Some(needed);
                needed
            }
        };

        payloads.push(payload);
        received += payload.len();
        offset = end;

        if received >= needed {
            return Ok(Some(HandshakeRecords {
                payloads,
                message_len: needed,
                end,
            }));
        }
    }
}

fn check_limit(needed: usize, limit: usize) -> Result<(), ClientHelloError> {
    if needed > limit {
        return Err(ClientHelloError::TooLarge { needed, limit });
    }
    Ok(())
}

fn parse_client_hello(message: &[u8]) -> Result<Option<String>, ClientHelloError> {
    let mut reader = Reader::new(message);
    let msg_type = reader.u8("handshake type")?;
    if msg_type != HANDSHAKE_CLIENT_HELLO {
        return Err(ClientHelloError::NotClientHello(msg_type));
    }
    let body_len = reader.u24("handshake length")?;
    let body = reader.take(body_len, "ClientHello body")?;

    let mut reader = Reader::new(body);
    reader.take(2, "client version")?;
    reader.take(32, "random")?;

    let session_id = reader.vec8("session id")?;
    if session_id.len() > 32 {
        return Err(ClientHelloError::Malformed("session id longer than 32 bytes"));
    }

    let cipher_suites = reader.vec16("cipher suites")?;
    if cipher_suites.is_empty() || cipher_suites.len() % 2 != 0 {
        return Err(ClientHelloError::Malformed("bad cipher suite list"));
    }

    let compression = reader.vec8("compression methods")?;
    if compression.is_empty() {
        return Err(ClientHelloError::Malformed("empty compression method list"));
    }

    // Extensions are optional in pre-TLS 1.2 hellos
    if reader.remaining() == 0 {
        return Ok(None);
    }

    let extensions = reader.vec16("extensions")?;
    if reader.remaining() != 0 {
        return Err(ClientHelloError::Malformed("trailing bytes after extensions"));
    }

    let mut reader = Reader::new(extensions);
    while reader.remaining() > 0 {
        let ext_type = reader.u16("extension type")?;
        let data = reader.vec16("extension data")?;
        if ext_type == EXT_SERVER_NAME {
            return parse_server_name(data).map(Some);
        }
    }

    Ok(None)
}

/// Parse the server_name extension data
fn parse_server_name(data: &[u8]) -> Result<String, ClientHelloError> {
    let mut reader = Reader::new(data);
    let list = reader.vec16("server name list")?;
    if reader.remaining() != 0 {
        return Err(ClientHelloError::Malformed("trailing bytes after server name list"));
    }

    let mut reader = Reader::new(list);
    while reader.remaining() > 0 {
        let name_type = reader.u8("server name type")?;
        let name = reader.vec16("host name")?;
        if name_type != NAME_TYPE_HOST_NAME {
            continue;
        }

        let raw = std::str::from_utf8(name)
            .map_err(|_| ClientHelloError::InvalidServerName("not valid UTF-8".to_string()))?;
        return normalize_hostname(raw)
            .ok_or_else(|| ClientHelloError::InvalidServerName(raw.escape_default().to_string()));
    }

    Err(ClientHelloError::Malformed("server_name extension without host_name"))
}

/// Bounds-checked big-endian cursor over a byte slice
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, len: usize, what: &'static str) -> Result<&'a [u8], ClientHelloError> {
        if len > self.remaining() {
            return Err(ClientHelloError::Truncated(what));
        }
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn u8(&mut self, what: &'static str) -> Result<u8, ClientHelloError> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &'static str) -> Result<u16, ClientHelloError> {
        let bytes = self.take(2, what)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn u24(&mut self, what: &'static str) -> Result<usize, ClientHelloError> {
        let bytes = self.take(3, what)?;
        Ok(u32::from_be_bytes([0, bytes[0], bytes[1], bytes[2]]) as usize)
    }

    fn vec8(&mut self, what: &'static str) -> Result<&'a [u8], ClientHelloError> {
        let len = self.u8(what)? as usize;
        self.take(len, what)
    }

    fn vec16(&mut self, what: &'static str) -> Result<&'a [u8], ClientHelloError> {
        let len = self.u16(what)? as usize;
        self.take(len, what)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a ClientHello handshake message (no record header)
    fn handshake_message(server_name: Option<&str>, leading_extensions: usize) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0x5a; 32]); // random
        body.push(32); // session id
        body.extend_from_slice(&[0x11; 32]);
        body.extend_from_slice(&[0x00, 0x04, 0x13, 0x01, 0x13, 0x02]); // cipher suites
        body.extend_from_slice(&[0x01, 0x00]); // null compression

        let mut extensions = Vec::new();
        for i in 0..leading_extensions {
            // supported_groups-like filler extension
            extensions.extend_from_slice(&[0x00, 0x0a]);
            extensions.extend_from_slice(&[0x00, 0x04, 0x00, 0x02, 0x00, 0x1d + i as u8]);
        }
        if let Some(name) = server_name {
            let name = name.as_bytes();
            let list_len = 3 + name.len();
            extensions.extend_from_slice(&[0x00, 0x00]);
            extensions.extend_from_slice(&((list_len + 2) as u16).to_be_bytes());
            extensions.extend_from_slice(&(list_len as u16).to_be_bytes());
            extensions.push(0x00);
            extensions.extend_from_slice(&(name.len() as u16).to_be_bytes());
            extensions.extend_from_slice(name);
        }
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut message = vec![HANDSHAKE_CLIENT_HELLO];
        message.extend_from_slice(&(body.len() as u32).to_be_bytes()[1..]);
        message.extend_from_slice(&body);
        message
    }

    fn record(payload: &[u8]) -> Vec<u8> {
        let mut out = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn client_hello(server_name: Option<&str>) -> Vec<u8> {
        record(&handshake_message(server_name, 0))
    }

    #[test]
    fn test_extracts_sni() {
        let hello = client_hello(Some("example.test"));
        assert_eq!(extract_sni(&hello), Ok(Some("example.test".to_string())));
        assert_eq!(
            probe_client_hello(&hello, 16 * 1024),
            Ok(HelloProbe::Complete(hello.len()))
        );
    }

    #[test]
    fn test_sni_after_other_extensions_is_lowercased() {
        let hello = record(&handshake_message(Some("API.Example.COM."), 3));
        assert_eq!(extract_sni(&hello), Ok(Some("api.example.com".to_string())));
    }

    #[test]
    fn test_missing_sni_is_not_an_error() {
        let hello = record(&handshake_message(None, 2));
        assert_eq!(extract_sni(&hello), Ok(None));
    }

    #[test]
    fn test_fragmented_client_hello() {
        let message = handshake_message(Some("split.example.com"), 4);
        let (first, second) = message.split_at(20);
        let mut hello = record(first);
        let first_len = hello.len();
        hello.extend_from_slice(&record(second));

        assert_eq!(
            probe_client_hello(&hello[..first_len], 16 * 1024),
            Ok(HelloProbe::NeedMore)
        );
        assert_eq!(
            probe_client_hello(&hello, 16 * 1024),
            Ok(HelloProbe::Complete(hello.len()))
        );
        assert_eq!(extract_sni(&hello), Ok(Some("split.example.com".to_string())));
    }

    #[test]
    fn test_trailing_bytes_are_not_part_of_hello() {
        let mut hello = client_hello(Some("example.test"));
        let end = hello.len();
        hello.extend_from_slice(b"early data");
        assert_eq!(
            probe_client_hello(&hello, 16 * 1024),
            Ok(HelloProbe::Complete(end))
        );
    }

    #[test]
    fn test_every_prefix_needs_more() {
        let hello = client_hello(Some("prefix.example.com"));
        for len in 0..hello.len() {
            assert_eq!(
                probe_client_hello(&hello[..len], 16 * 1024),
                Ok(HelloProbe::NeedMore),
                "prefix of {} bytes",
                len
            );
            assert!(extract_sni(&hello[..len]).is_err());
        }
    }

    #[test]
    fn test_not_tls() {
        let request = b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n";
        assert_eq!(
            probe_client_hello(request, 16 * 1024),
            Err(ClientHelloError::NotHandshake(b'G'))
        );
        assert_eq!(
            extract_sni(request),
            Err(ClientHelloError::NotHandshake(b'G'))
        );
    }

    #[test]
    fn test_not_client_hello() {
        // ServerHello (type 2) in a handshake record
        let hello = record(&[0x02, 0x00, 0x00, 0x01, 0x00]);
        assert_eq!(
            probe_client_hello(&hello, 16 * 1024),
            Err(ClientHelloError::NotClientHello(0x02))
        );
    }

    #[test]
    fn test_too_large_is_rejected_from_header_alone() {
        // Declares a 16 KiB record; only the header has arrived
        let header = [CONTENT_TYPE_HANDSHAKE, 0x03, 0x01, 0x40, 0x00];
        assert_eq!(
            probe_client_hello(&header, 16 * 1024),
            Err(ClientHelloError::TooLarge {
                needed: RECORD_HEADER_LEN + 0x4000,
                limit: 16 * 1024
            })
        );
    }

    #[test]
    fn test_too_large_handshake_across_records() {
        // First record claims a 64 KiB ClientHello
        let hello = record(&[HANDSHAKE_CLIENT_HELLO, 0x01, 0x00, 0x00, 0x03, 0x03]);
        assert!(matches!(
            probe_client_hello(&hello, 16 * 1024),
            Err(ClientHelloError::TooLarge { .. })
        ));
    }

    #[test]
    fn test_corrupted_lengths_do_not_panic() {
        let hello = client_hello(Some("fuzz.example.com"));
        for index in RECORD_HEADER_LEN..hello.len() {
            for value in [0x00, 0x01, 0x7f, 0xff] {
                let mut corrupted = hello.clone();
                corrupted[index] = value;
                let _ = probe_client_hello(&corrupted, 16 * 1024);
                let _ = extract_sni(&corrupted);
            }
        }
    }

    #[test]
    fn test_invalid_hostname() {
        let hello = client_hello(Some("bad host.example.com"));
        assert!(matches!(
            extract_sni(&hello),
            Err(ClientHelloError::InvalidServerName(_))
        ));
    }
}
