//! Server stamps.
//!
//! An `sdns://` stamp packs everything needed to reach one upstream into a
//! single URI: protocol, address, provider identity and, for DoH, the
//! hostname and path. The payload is base64url without padding over a
//! small length-prefixed binary layout.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;

use cloakdns_crypto::KEY_SIZE;

use crate::error::{ProxyError, Result};

const SCHEME: &str = "sdns://";

const PROTO_DNSCRYPT: u8 = 0x01;
const PROTO_DOH: u8 = 0x02;

/// Upstream protocol encoded in a stamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StampProto {
    DnsCrypt,
    DoH,
}

/// Informal properties advertised by the operator.
pub mod props {
    pub const DNSSEC: u64 = 1;
    pub const NO_LOGS: u64 = 2;
    pub const NO_FILTERS: u64 = 4;
}

/// Decoded server stamp. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerStamp {
    pub proto: StampProto,
    pub props: u64,
    /// `host:port` of the server itself; may be empty for DoH stamps that
    /// rely on the hostname.
    pub addr: String,
    /// Provider long-term ed25519 public key (DNSCrypt only).
    pub provider_pk: Option<[u8; KEY_SIZE]>,
    /// Certificate provider name (DNSCrypt only).
    pub provider_name: Option<String>,
    /// TLS hostname, possibly with an explicit port (DoH only).
    pub hostname: Option<String>,
    /// HTTP path (DoH only).
    pub path: Option<String>,
}

struct Cursor<'a> {
    bin: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.bin.len() {
            return Err(ProxyError::Stamp("truncated stamp".into()));
        }
        let out = &self.bin[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// One length-prefixed field.
    fn lp(&mut self) -> Result<&'a [u8]> {
        let len = self.take(1)?[0] as usize;
        self.take(len)
    }

    /// A set of length-prefixed fields; the high bit of each length marks
    /// that more items follow.
    fn vlp(&mut self) -> Result<Vec<Vec<u8>>> {
        let mut items = Vec::new();
        loop {
            let len = self.take(1)?[0];
            let item = self.take((len & 0x7f) as usize)?;
            if !item.is_empty() {
                items.push(item.to_vec());
            }
            if len & 0x80 == 0 {
                return Ok(items);
            }
        }
    }
}

fn lp_string(field: &[u8]) -> Result<String> {
    String::from_utf8(field.to_vec()).map_err(|_| ProxyError::Stamp("invalid utf-8".into()))
}

impl ServerStamp {
    /// Parse an `sdns://` URI.
    pub fn parse(stamp: &str) -> Result<Self> {
        let encoded = stamp
            .strip_prefix(SCHEME)
            .ok_or_else(|| ProxyError::Stamp(format!("missing {SCHEME} scheme")))?;
        let bin = URL_SAFE_NO_PAD
            .decode(encoded)
            .map_err(|e| ProxyError::Stamp(format!("base64: {e}")))?;
        let mut cur = Cursor { bin: &bin, pos: 0 };

        let proto = cur.take(1)?[0];
        let props_bytes = cur.take(8)?;
        let props = u64::from_le_bytes(props_bytes.try_into().expect("8 bytes"));
        let addr = lp_string(cur.lp()?)?;

        match proto {
            PROTO_DNSCRYPT => {
                let pk = cur.lp()?;
                if pk.len() != KEY_SIZE {
                    return Err(ProxyError::Stamp(format!(
                        "provider key length {} (expected {KEY_SIZE})",
                        pk.len()
                    )));
                }
                let mut provider_pk = [0u8; KEY_SIZE];
                provider_pk.copy_from_slice(pk);
                let provider_name = lp_string(cur.lp()?)?;
                Ok(Self {
                    proto: StampProto::DnsCrypt,
                    props,
                    addr,
                    provider_pk: Some(provider_pk),
                    provider_name: Some(provider_name),
                    hostname: None,
                    path: None,
                })
            }
            PROTO_DOH => {
                let _hashes = cur.vlp()?;
                let hostname = lp_string(cur.lp()?)?;
                let path = lp_string(cur.lp()?)?;
                if hostname.is_empty() {
                    return Err(ProxyError::Stamp("empty DoH hostname".into()));
                }
                Ok(Self {
                    proto: StampProto::DoH,
                    props,
                    addr,
                    provider_pk: None,
                    provider_name: None,
                    hostname: Some(hostname),
                    path: Some(path),
                })
            }
            other => Err(ProxyError::Stamp(format!("unknown protocol 0x{other:02x}"))),
        }
    }

    /// Re-encode to the URI form, the inverse of [`ServerStamp::parse`].
    pub fn encode(&self) -> String {
        let mut bin = Vec::new();
        let push_lp = |bin: &mut Vec<u8>, field: &[u8]| {
            bin.push(field.len() as u8);
            bin.extend_from_slice(field);
        };
        match self.proto {
            StampProto::DnsCrypt => {
                bin.push(PROTO_DNSCRYPT);
                bin.extend_from_slice(&self.props.to_le_bytes());
                push_lp(&mut bin, self.addr.as_bytes());
                push_lp(&mut bin, self.provider_pk.as_ref().map_or(&[][..], |pk| pk));
                push_lp(
                    &mut bin,
                    self.provider_name.as_deref().unwrap_or_default().as_bytes(),
                );
            }
            StampProto::DoH => {
                bin.push(PROTO_DOH);
                bin.extend_from_slice(&self.props.to_le_bytes());
                push_lp(&mut bin, self.addr.as_bytes());
                bin.push(0); // no certificate hashes
                push_lp(
                    &mut bin,
                    self.hostname.as_deref().unwrap_or_default().as_bytes(),
                );
                push_lp(&mut bin, self.path.as_deref().unwrap_or_default().as_bytes());
            }
        }
        format!("{SCHEME}{}", URL_SAFE_NO_PAD.encode(bin))
    }

    /// The server address with the protocol default port appended when the
    /// stamp left it off.
    pub fn addr_with_default_port(&self) -> String {
        with_default_port(&self.addr, 443)
    }
}

/// Append `:port` unless the string already carries one. Bracketed IPv6
/// literals are handled; a bare IPv6 literal is bracketed on the way out.
pub fn with_default_port(addr: &str, port: u16) -> String {
    if addr.is_empty() {
        return addr.to_string();
    }
    if let Some(rest) = addr.strip_prefix('[') {
        if rest.contains("]:") {
            return addr.to_string();
        }
        return format!("{addr}:{port}");
    }
    match addr.matches(':').count() {
        0 => format!("{addr}:{port}"),
        1 => addr.to_string(),
        _ => format!("[{addr}]:{port}"), // bare IPv6
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dnscrypt_stamp() -> ServerStamp {
        ServerStamp {
            proto: StampProto::DnsCrypt,
            props: props::DNSSEC | props::NO_LOGS,
            addr: "192.0.2.17:8443".into(),
            provider_pk: Some([0xab; KEY_SIZE]),
            provider_name: Some("2.dnscrypt-cert.example.com".into()),
            hostname: None,
            path: None,
        }
    }

    #[test]
    fn dnscrypt_stamp_round_trip() {
        let stamp = dnscrypt_stamp();
        let parsed = ServerStamp::parse(&stamp.encode()).unwrap();
        assert_eq!(parsed, stamp);
        assert_eq!(parsed.props & props::DNSSEC, props::DNSSEC);
    }

    #[test]
    fn doh_stamp_round_trip() {
        let stamp = ServerStamp {
            proto: StampProto::DoH,
            props: 0,
            addr: String::new(),
            provider_pk: None,
            provider_name: None,
            hostname: Some("doh.example.net".into()),
            path: Some("/dns-query".into()),
        };
        let parsed = ServerStamp::parse(&stamp.encode()).unwrap();
        assert_eq!(parsed, stamp);
    }

    #[test]
    fn rejects_garbage() {
        assert!(ServerStamp::parse("dns://nope").is_err());
        assert!(ServerStamp::parse("sdns://!!!").is_err());
        // Valid base64 of a truncated payload.
        assert!(ServerStamp::parse("sdns://AQ").is_err());
    }

    #[test]
    fn rejects_bad_provider_key_length() {
        let mut stamp = dnscrypt_stamp();
        stamp.provider_pk = None; // encodes as an empty key field
        assert!(matches!(
            ServerStamp::parse(&stamp.encode()),
            Err(ProxyError::Stamp(_))
        ));
    }

    #[test]
    fn default_ports() {
        assert_eq!(with_default_port("192.0.2.1", 443), "192.0.2.1:443");
        assert_eq!(with_default_port("192.0.2.1:53", 443), "192.0.2.1:53");
        assert_eq!(with_default_port("[2001:db8::1]", 443), "[2001:db8::1]:443");
        assert_eq!(
            with_default_port("[2001:db8::1]:8443", 443),
            "[2001:db8::1]:8443"
        );
        assert_eq!(
            with_default_port("2001:db8::1", 443),
            "[2001:db8::1]:443"
        );
    }
}
