//! DNS-over-HTTPS client transport.
//!
//! Wire-format queries are POSTed over a per-exchange HTTP/1.1 connection.
//! The TLS configuration is shared; endpoint addresses are pinned in a
//! cache at refresh so retries do not depend on the system resolver, while
//! SNI and the Host header stay on the logical hostname.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::RwLock;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tracing::debug;
use url::Url;

use crate::catalog::ServerInfo;
use crate::dns::MAX_PACKET_SIZE;
use crate::error::{ProxyError, Result};
use crate::proxy::Proxy;
use crate::stamp::{with_default_port, ServerStamp};

const CONTENT_TYPE: &str = "application/dns-udpwireformat";
const USER_AGENT: &str = "dnscrypt-proxy";

/// Hostname to address pinning for DoH endpoints.
#[derive(Default)]
pub struct CachedIps {
    inner: RwLock<HashMap<String, IpAddr>>,
}

impl CachedIps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, host: &str) -> Option<IpAddr> {
        self.inner.read().get(host).copied()
    }

    pub fn insert(&self, host: &str, ip: IpAddr) {
        self.inner.write().insert(host.to_string(), ip);
    }
}

/// TLS client configuration shared by every DoH exchange.
pub fn tls_connector() -> TlsConnector {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    TlsConnector::from(Arc::new(config))
}

/// Build the DoH URL and logical hostname from a stamp.
pub fn url_from_stamp(stamp: &ServerStamp) -> Result<(Url, String)> {
    let hostname = stamp
        .hostname
        .as_deref()
        .ok_or_else(|| ProxyError::Stamp("missing DoH hostname".into()))?;
    let path = stamp.path.as_deref().unwrap_or("/dns-query");
    let url = Url::parse(&format!("https://{hostname}{path}"))
        .map_err(|e| ProxyError::Stamp(format!("DoH URL: {e}")))?;
    if url.scheme() != "https" {
        return Err(ProxyError::Stamp("DoH URL must use HTTPS".into()));
    }
    let host = url
        .host_str()
        .ok_or_else(|| ProxyError::Stamp("no host in DoH URL".into()))?
        .to_string();
    Ok((url, host))
}

/// POST one wire-format query and return the verbatim response body.
pub async fn exchange(proxy: &Proxy, server: &ServerInfo, query: &[u8]) -> Result<Vec<u8>> {
    let url = server.url.as_ref().ok_or(ProxyError::NoServers)?;
    let host = server.host.as_deref().ok_or(ProxyError::NoServers)?;
    post_wire_query(proxy, url, host, query).await
}

/// Probe a DoH endpoint: POST a well-formed query and require a parseable
/// response. Returns the measured round-trip time.
pub async fn probe(proxy: &Proxy, url: &Url, host: &str) -> Result<Duration> {
    let mut message = Message::new();
    message.set_id(rand::random());
    message.set_message_type(MessageType::Query);
    message.set_op_code(OpCode::Query);
    message.set_recursion_desired(true);
    message.add_query(Query::query(Name::root(), RecordType::NS));
    let query = message.to_bytes()?;

    let begin = Instant::now();
    let body = post_wire_query(proxy, url, host, &query).await?;
    Message::from_bytes(&body)?;
    Ok(begin.elapsed())
}

async fn post_wire_query(proxy: &Proxy, url: &Url, host: &str, query: &[u8]) -> Result<Vec<u8>> {
    let port = url.port().unwrap_or(443);
    let addr = dial_addr(proxy, host, port).await?;
    let query_timeout = proxy.timeout();

    let tcp = timeout(query_timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| ProxyError::Timeout)??;

    let server_name = ServerName::try_from(host.to_string())
        .map_err(|e| ProxyError::Tls(format!("invalid server name: {e}")))?;
    let mut tls = timeout(query_timeout, proxy.tls_connector().connect(server_name, tcp))
        .await
        .map_err(|_| ProxyError::Timeout)?
        .map_err(|e| ProxyError::Tls(e.to_string()))?;

    let head = build_post_request(host, url.path(), query.len());
    tls.write_all(head.as_bytes()).await?;
    tls.write_all(query).await?;

    let mut raw = Vec::new();
    timeout(query_timeout, tls.read_to_end(&mut raw))
        .await
        .map_err(|_| ProxyError::Timeout)??;

    parse_http_response(&raw)
}

/// Resolve the dial address for a DoH endpoint, preferring the pinned IP.
async fn dial_addr(proxy: &Proxy, host: &str, port: u16) -> Result<SocketAddr> {
    if let Some(ip) = proxy.cached_ips().get(host) {
        return Ok(SocketAddr::new(ip, port));
    }
    debug!("[{host}] address was not cached");
    let addr = lookup_host(with_default_port(host, port))
        .await?
        .next()
        .ok_or_else(|| ProxyError::Config(format!("cannot resolve [{host}]")))?;
    proxy.cached_ips().insert(host, addr.ip());
    Ok(SocketAddr::new(addr.ip(), port))
}

fn build_post_request(host: &str, path: &str, body_len: usize) -> String {
    format!(
        "POST {path} HTTP/1.1\r\n\
         Host: {host}\r\n\
         Accept: {CONTENT_TYPE}\r\n\
         Content-Type: {CONTENT_TYPE}\r\n\
         Content-Length: {body_len}\r\n\
         User-Agent: {USER_AGENT}\r\n\
         Connection: close\r\n\
         \r\n"
    )
}

/// Minimal HTTP/1.x response parsing: 2xx status, then the body, honoring
/// Content-Length and chunked transfer encoding.
fn parse_http_response(raw: &[u8]) -> Result<Vec<u8>> {
    let header_end = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| ProxyError::Http("missing header terminator".into()))?;
    let head = String::from_utf8_lossy(&raw[..header_end]);
    let mut lines = head.lines();
    let status_line = lines
        .next()
        .ok_or_else(|| ProxyError::Http("empty response".into()))?;
    let code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProxyError::Http(format!("bad status line: {status_line}")))?;
    if !(200..300).contains(&code) {
        return Err(ProxyError::Http(format!("status {code}")));
    }

    let mut content_length = None;
    let mut chunked = false;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        match name.trim().to_ascii_lowercase().as_str() {
            "content-length" => content_length = value.trim().parse::<usize>().ok(),
            "transfer-encoding" => {
                chunked = value.trim().eq_ignore_ascii_case("chunked");
            }
            _ => {}
        }
    }

    let body = &raw[header_end + 4..];
    let body = if chunked {
        decode_chunked(body)?
    } else if let Some(len) = content_length {
        if body.len() < len {
            return Err(ProxyError::Http("short body".into()));
        }
        body[..len].to_vec()
    } else {
        body.to_vec()
    };

    if body.len() > MAX_PACKET_SIZE {
        return Err(ProxyError::PacketSize(body.len()));
    }
    Ok(body)
}

fn decode_chunked(mut body: &[u8]) -> Result<Vec<u8>> {
    let mut decoded = Vec::new();
    loop {
        let line_end = body
            .windows(2)
            .position(|w| w == b"\r\n")
            .ok_or_else(|| ProxyError::Http("bad chunk header".into()))?;
        let size_str = String::from_utf8_lossy(&body[..line_end]);
        let size = usize::from_str_radix(size_str.trim().trim_end_matches(';'), 16)
            .map_err(|_| ProxyError::Http("bad chunk size".into()))?;
        body = &body[line_end + 2..];
        if size == 0 {
            return Ok(decoded);
        }
        if body.len() < size + 2 {
            return Err(ProxyError::Http("short chunk".into()));
        }
        decoded.extend_from_slice(&body[..size]);
        body = &body[size + 2..];
    }
}
