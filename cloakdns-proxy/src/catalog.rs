//! Upstream server catalog.
//!
//! Keeps the set of registered upstreams and their runtime state: resolved
//! addresses, active certificate material, RTT estimate and liveness.
//! Probing happens at refresh; queries only ever read snapshots.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tokio::net::lookup_host;
use tracing::{debug, info, warn};
use url::Url;

use cloakdns_crypto::{SharedKey, CLIENT_MAGIC_SIZE, KEY_SIZE};

use crate::dnscrypt;
use crate::doh;
use crate::error::{ProxyError, Result};
use crate::proxy::Proxy;
use crate::stamp::{ServerStamp, StampProto};

/// Consecutive failures before a server leaves the live set until the
/// next refresh.
pub const FAILURE_THRESHOLD: u32 = 5;

/// Penalty added to the RTT estimate on every failed exchange, so ailing
/// servers sink in the ordering before they go dead.
const FAILURE_RTT_PENALTY_MICROS: u64 = 100_000;

/// A configured upstream, before any probing. Immutable.
#[derive(Debug, Clone)]
pub struct RegisteredServer {
    pub name: String,
    pub stamp: ServerStamp,
}

/// Runtime record for one upstream. Address and key material are fixed at
/// refresh; RTT, failure count and liveness move under atomics.
pub struct ServerInfo {
    pub name: String,
    pub proto: StampProto,
    pub udp_addr: Option<SocketAddr>,
    pub tcp_addr: Option<SocketAddr>,
    pub url: Option<Url>,
    /// Logical DoH hostname, used for SNI and the Host header.
    pub host: Option<String>,
    pub client_magic: Option<[u8; CLIENT_MAGIC_SIZE]>,
    pub shared_key: Option<SharedKey>,
    pub timeout: Duration,
    rtt_micros: AtomicU64,
    failures: AtomicU32,
    live: AtomicBool,
    last_begin: Mutex<Option<Instant>>,
}

impl ServerInfo {
    pub(crate) fn new_dnscrypt(
        name: String,
        udp_addr: SocketAddr,
        tcp_addr: SocketAddr,
        client_magic: [u8; CLIENT_MAGIC_SIZE],
        shared_key: SharedKey,
        timeout: Duration,
        rtt: Duration,
    ) -> Self {
        Self {
            name,
            proto: StampProto::DnsCrypt,
            udp_addr: Some(udp_addr),
            tcp_addr: Some(tcp_addr),
            url: None,
            host: None,
            client_magic: Some(client_magic),
            shared_key: Some(shared_key),
            timeout,
            rtt_micros: AtomicU64::new(rtt.as_micros() as u64),
            failures: AtomicU32::new(0),
            live: AtomicBool::new(true),
            last_begin: Mutex::new(None),
        }
    }

    pub(crate) fn new_doh(name: String, url: Url, host: String, timeout: Duration, rtt: Duration) -> Self {
        Self {
            name,
            proto: StampProto::DoH,
            udp_addr: None,
            tcp_addr: None,
            url: Some(url),
            host: Some(host),
            client_magic: None,
            shared_key: None,
            timeout,
            rtt_micros: AtomicU64::new(rtt.as_micros() as u64),
            failures: AtomicU32::new(0),
            live: AtomicBool::new(true),
            last_begin: Mutex::new(None),
        }
    }

    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::Relaxed)
    }

    pub fn rtt(&self) -> Duration {
        Duration::from_micros(self.rtt_micros.load(Ordering::Relaxed))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.load(Ordering::Relaxed)
    }

    /// An exchange is about to start.
    pub fn notice_begin(&self) {
        *self.last_begin.lock() = Some(Instant::now());
    }

    /// The exchange completed and the client got an answer.
    pub fn notice_success(&self) {
        self.failures.store(0, Ordering::Relaxed);
        if let Some(begin) = self.last_begin.lock().take() {
            let sample = begin.elapsed().as_micros() as u64;
            // Exponential moving average, weighted toward history.
            let _ = self
                .rtt_micros
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |rtt| {
                    Some((rtt.saturating_mul(7).saturating_add(sample)) / 8)
                });
        }
    }

    /// The exchange failed; inflate the RTT estimate and count toward the
    /// liveness threshold.
    pub fn notice_failure(&self) {
        let _ = self
            .rtt_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |rtt| {
                Some(rtt.saturating_add(rtt / 2).saturating_add(FAILURE_RTT_PENALTY_MICROS))
            });
        let failures = self.failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures >= FAILURE_THRESHOLD && self.live.swap(false, Ordering::Relaxed) {
            warn!(
                "server [{}] dropped from the live set after {} consecutive failures",
                self.name, failures
            );
        }
    }
}

impl std::fmt::Debug for ServerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerInfo")
            .field("name", &self.name)
            .field("proto", &self.proto)
            .field("rtt", &self.rtt())
            .field("live", &self.is_live())
            .finish()
    }
}

/// The catalog itself: registered upstreams plus the probed live list,
/// sorted by RTT ascending.
#[derive(Default)]
pub struct ServersInfo {
    registered: RwLock<Vec<RegisteredServer>>,
    inner: RwLock<Vec<Arc<ServerInfo>>>,
}

impl ServersInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or re-stamp) an upstream. Entries are unique by name.
    pub fn register_server(&self, name: &str, stamp: ServerStamp) {
        let mut registered = self.registered.write();
        if let Some(existing) = registered.iter_mut().find(|r| r.name == name) {
            existing.stamp = stamp;
        } else {
            registered.push(RegisteredServer {
                name: name.to_string(),
                stamp,
            });
        }
    }

    pub fn registered_count(&self) -> usize {
        self.registered.read().len()
    }

    pub fn live_servers(&self) -> usize {
        self.inner.read().iter().filter(|s| s.is_live()).count()
    }

    /// Probe every registered server and swap in the fresh live list.
    /// Returns how many came up, plus the first probe error if any.
    pub async fn refresh(&self, proxy: &Proxy) -> (usize, Option<ProxyError>) {
        let registered: Vec<RegisteredServer> = self.registered.read().clone();
        let mut fresh: Vec<Arc<ServerInfo>> = Vec::with_capacity(registered.len());
        let mut first_err = None;

        for server in &registered {
            match probe_server(proxy, server).await {
                Ok(info) => {
                    debug!(
                        "server [{}] is up ({:?}, rtt {:?})",
                        info.name, info.proto, info.rtt()
                    );
                    fresh.push(Arc::new(info));
                }
                Err(e) => {
                    warn!("server [{}] unreachable: {}", server.name, e);
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
            }
        }

        fresh.sort_by_key(|s| s.rtt());
        let live = fresh.len();
        *self.inner.write() = fresh;
        if live > 0 {
            info!("{} server(s) are live", live);
        }
        (live, first_err)
    }

    /// The live server with the lowest RTT estimate; ties keep list order.
    pub fn get_one(&self) -> Option<Arc<ServerInfo>> {
        let inner = self.inner.read();
        inner
            .iter()
            .filter(|s| s.is_live())
            .fold(None, |best: Option<&Arc<ServerInfo>>, s| match best {
                Some(b) if b.rtt() <= s.rtt() => Some(b),
                _ => Some(s),
            })
            .cloned()
    }

    #[cfg(test)]
    pub(crate) fn install(&self, servers: Vec<Arc<ServerInfo>>) {
        *self.inner.write() = servers;
    }
}

async fn probe_server(proxy: &Proxy, server: &RegisteredServer) -> Result<ServerInfo> {
    match server.stamp.proto {
        StampProto::DnsCrypt => probe_dnscrypt(proxy, server).await,
        StampProto::DoH => probe_doh(proxy, server).await,
    }
}

async fn probe_dnscrypt(proxy: &Proxy, server: &RegisteredServer) -> Result<ServerInfo> {
    let stamp = &server.stamp;
    let provider_pk: &[u8; KEY_SIZE] = stamp
        .provider_pk
        .as_ref()
        .ok_or_else(|| ProxyError::Stamp("missing provider key".into()))?;
    let provider_name = stamp
        .provider_name
        .as_deref()
        .ok_or_else(|| ProxyError::Stamp("missing provider name".into()))?;

    let addr = resolve_addr(&stamp.addr_with_default_port()).await?;
    let (cert, rtt) = dnscrypt::fetch_certificate(
        provider_name,
        provider_pk,
        addr,
        proxy.timeout(),
        proxy.cert_ignore_timestamp(),
    )
    .await?;
    let shared_key = SharedKey::new(cert.encryption, &cert.resolver_pk, proxy.keys());

    Ok(ServerInfo::new_dnscrypt(
        server.name.clone(),
        addr,
        addr,
        cert.client_magic,
        shared_key,
        proxy.timeout(),
        rtt,
    ))
}

async fn probe_doh(proxy: &Proxy, server: &RegisteredServer) -> Result<ServerInfo> {
    let stamp = &server.stamp;
    let (url, host) = doh::url_from_stamp(stamp)?;

    // A stamp may pin the server address; seed the IP cache with it so the
    // first dial skips the system resolver.
    if !stamp.addr.is_empty() {
        if let Ok(addr) = resolve_addr(&stamp.addr_with_default_port()).await {
            proxy.cached_ips().insert(&host, addr.ip());
        }
    }

    let rtt = doh::probe(proxy, &url, &host).await?;
    Ok(ServerInfo::new_doh(
        server.name.clone(),
        url,
        host,
        proxy.timeout(),
        rtt,
    ))
}

async fn resolve_addr(addr: &str) -> Result<SocketAddr> {
    if let Ok(parsed) = addr.parse() {
        return Ok(parsed);
    }
    lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| ProxyError::Config(format!("cannot resolve [{addr}]")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloakdns_crypto::{EncryptionSystem, KeyPair};

    pub(crate) fn test_server(name: &str, rtt_millis: u64) -> Arc<ServerInfo> {
        let client = KeyPair::generate();
        let server = KeyPair::generate();
        Arc::new(ServerInfo::new_dnscrypt(
            name.to_string(),
            "127.0.0.1:8443".parse().unwrap(),
            "127.0.0.1:8443".parse().unwrap(),
            *b"testmgic",
            SharedKey::new(
                EncryptionSystem::XChaCha20Poly1305,
                &server.public_bytes(),
                &client,
            ),
            Duration::from_secs(2),
            Duration::from_millis(rtt_millis),
        ))
    }

    #[test]
    fn get_one_prefers_lowest_rtt() {
        let catalog = ServersInfo::new();
        catalog.install(vec![
            test_server("slow", 80),
            test_server("fast", 10),
            test_server("medium", 40),
        ]);
        assert_eq!(catalog.get_one().unwrap().name, "fast");
        assert_eq!(catalog.live_servers(), 3);
    }

    #[test]
    fn get_one_is_stable_under_ties() {
        let catalog = ServersInfo::new();
        catalog.install(vec![test_server("first", 10), test_server("second", 10)]);
        for _ in 0..8 {
            assert_eq!(catalog.get_one().unwrap().name, "first");
        }
    }

    #[test]
    fn failure_threshold_removes_server_until_refresh() {
        let catalog = ServersInfo::new();
        catalog.install(vec![test_server("only", 10)]);
        let server = catalog.get_one().unwrap();

        for _ in 0..FAILURE_THRESHOLD - 1 {
            server.notice_failure();
        }
        assert!(catalog.get_one().is_some());

        server.notice_failure();
        assert!(catalog.get_one().is_none());
        assert_eq!(catalog.live_servers(), 0);

        // A refresh swapping in a fresh probe restores service.
        catalog.install(vec![test_server("only", 10)]);
        assert!(catalog.get_one().is_some());
    }

    #[test]
    fn success_resets_failure_counter() {
        let server = test_server("s", 10);
        server.notice_begin();
        server.notice_failure();
        server.notice_failure();
        assert_eq!(server.consecutive_failures(), 2);
        server.notice_success();
        assert_eq!(server.consecutive_failures(), 0);
        assert!(server.is_live());
    }

    #[test]
    fn failures_inflate_rtt() {
        let server = test_server("s", 10);
        let before = server.rtt();
        server.notice_failure();
        assert!(server.rtt() > before);
    }

    #[test]
    fn register_is_unique_by_name() {
        let catalog = ServersInfo::new();
        let stamp = ServerStamp {
            proto: StampProto::DnsCrypt,
            props: 0,
            addr: "192.0.2.1:8443".into(),
            provider_pk: Some([1; KEY_SIZE]),
            provider_name: Some("2.dnscrypt-cert.example".into()),
            hostname: None,
            path: None,
        };
        catalog.register_server("a", stamp.clone());
        catalog.register_server("a", stamp.clone());
        catalog.register_server("b", stamp);
        assert_eq!(catalog.registered_count(), 2);
    }
}
