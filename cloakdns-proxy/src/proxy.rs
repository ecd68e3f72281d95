//! The query-service engine.
//!
//! One `Proxy` value is the root of everything: listeners feed client
//! packets through the plugin pipeline and an encrypted upstream exchange,
//! background loops rotate certificates and mirror sources. Constructed
//! explicitly and threaded into tasks as an `Arc`, never a global, so
//! tests run isolated instances side by side.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use cloakdns_crypto::{KeyPair, RESPONSE_OVERHEAD};

use crate::catalog::{ServerInfo, ServersInfo};
use crate::config::{Config, MainProto};
use crate::dns::{self, MAX_PACKET_SIZE, MAX_UDP_PACKET_SIZE, MIN_PACKET_SIZE};
use crate::dnscrypt;
use crate::doh::{self, CachedIps};
use crate::error::{ProxyError, Result};
use crate::estimator::SizeEstimator;
use crate::plugins::{ClientProto, PluginAction, PluginsGlobals, PluginsState};
use crate::prefetch::Prefetcher;
use crate::stamp::{ServerStamp, StampProto};

/// Where a reply goes back to.
pub(crate) enum ClientCtx {
    Udp {
        socket: Arc<UdpSocket>,
        peer: SocketAddr,
    },
    Tcp {
        stream: TcpStream,
        peer: SocketAddr,
    },
}

impl ClientCtx {
    fn proto(&self) -> ClientProto {
        match self {
            ClientCtx::Udp { .. } => ClientProto::Udp,
            ClientCtx::Tcp { .. } => ClientProto::Tcp,
        }
    }

    fn peer(&self) -> SocketAddr {
        match self {
            ClientCtx::Udp { peer, .. } | ClientCtx::Tcp { peer, .. } => *peer,
        }
    }
}

/// Process-wide proxy state. Immutable after `start` apart from atomics
/// and the locked structures inside.
pub struct Proxy {
    keys: KeyPair,
    estimator: SizeEstimator,
    pub(crate) servers: ServersInfo,
    plugins: PluginsGlobals,
    prefetcher: Option<Arc<Prefetcher>>,
    timeout: Duration,
    cert_refresh_delay: Duration,
    cert_refresh_delay_after_failure: Duration,
    cert_ignore_timestamp: bool,
    main_proto: MainProto,
    listen_addresses: Vec<SocketAddr>,
    max_clients: u32,
    clients_count: AtomicU32,
    tls: tokio_rustls::TlsConnector,
    cached_ips: CachedIps,
    shutdown: broadcast::Sender<()>,
    local_udp_addrs: Mutex<Vec<SocketAddr>>,
    local_tcp_addrs: Mutex<Vec<SocketAddr>>,
}

impl Proxy {
    /// Build a proxy from a validated configuration. Bad stamps and
    /// unreadable rule files are fatal here; nothing network-facing
    /// happens yet.
    pub fn new(config: Config) -> Result<Self> {
        config.validate().map_err(ProxyError::Config)?;

        let servers = ServersInfo::new();
        for static_server in &config.servers {
            let stamp = ServerStamp::parse(&static_server.stamp)?;
            servers.register_server(&static_server.name, stamp);
        }

        let plugins = PluginsGlobals::from_config(&config)?;
        let prefetcher = if config.sources.is_empty() {
            None
        } else {
            Some(Arc::new(Prefetcher::new(&config.sources, config.timeout)?))
        };

        let (shutdown, _) = broadcast::channel(1);

        Ok(Self {
            keys: KeyPair::generate(),
            estimator: SizeEstimator::new(),
            servers,
            plugins,
            prefetcher,
            timeout: config.timeout,
            cert_refresh_delay: config.cert_refresh_delay,
            cert_refresh_delay_after_failure: config.cert_refresh_delay_after_failure,
            cert_ignore_timestamp: config.cert_ignore_timestamp,
            main_proto: config.main_proto,
            listen_addresses: config.listen_addresses.clone(),
            max_clients: config.max_clients,
            clients_count: AtomicU32::new(0),
            tls: doh::tls_connector(),
            cached_ips: CachedIps::new(),
            shutdown,
            local_udp_addrs: Mutex::new(Vec::new()),
            local_tcp_addrs: Mutex::new(Vec::new()),
        })
    }

    /// Bind the listeners, run the first catalog refresh and spawn the
    /// background loops. Returns how many upstreams are live; zero is not
    /// an error, the refresh loop keeps trying.
    pub async fn start(self: Arc<Self>) -> Result<usize> {
        for addr in &self.listen_addresses {
            let udp = Arc::new(UdpSocket::bind(addr).await?);
            let tcp = TcpListener::bind(addr).await?;
            self.local_udp_addrs.lock().push(udp.local_addr()?);
            self.local_tcp_addrs.lock().push(tcp.local_addr()?);
            info!("now listening to {addr} [UDP]");
            info!("now listening to {addr} [TCP]");

            let proxy = self.clone();
            tokio::spawn(async move { proxy.udp_acceptor(udp).await });
            let proxy = self.clone();
            tokio::spawn(async move { proxy.tcp_acceptor(tcp).await });
        }

        let (live, err) = self.servers.refresh(&self).await;
        if live > 0 {
            info!("proxy is ready - live servers: {live}");
        } else {
            if let Some(e) = err {
                error!("{e}");
            }
            info!("waiting for at least one server to be reachable");
        }

        if let Some(prefetcher) = &self.prefetcher {
            prefetcher.clone().spawn(self.shutdown.subscribe());
        }
        let proxy = self.clone();
        tokio::spawn(async move { proxy.refresh_loop().await });

        Ok(live)
    }

    /// Signal every listener and background loop to wind down. In-flight
    /// queries finish within their deadlines.
    pub fn stop(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn live_servers(&self) -> usize {
        self.servers.live_servers()
    }

    /// Actual bound UDP addresses, useful with port 0 in tests.
    pub fn local_udp_addrs(&self) -> Vec<SocketAddr> {
        self.local_udp_addrs.lock().clone()
    }

    pub fn local_tcp_addrs(&self) -> Vec<SocketAddr> {
        self.local_tcp_addrs.lock().clone()
    }

    pub(crate) fn keys(&self) -> &KeyPair {
        &self.keys
    }

    pub(crate) fn timeout(&self) -> Duration {
        self.timeout
    }

    pub(crate) fn cert_ignore_timestamp(&self) -> bool {
        self.cert_ignore_timestamp
    }

    pub(crate) fn cached_ips(&self) -> &CachedIps {
        &self.cached_ips
    }

    pub(crate) fn tls_connector(&self) -> &tokio_rustls::TlsConnector {
        &self.tls
    }

    #[cfg(test)]
    pub(crate) fn clients_in_flight(&self) -> u32 {
        self.clients_count.load(Ordering::SeqCst)
    }

    /// Reserve one admission slot, or refuse when `max_clients` are
    /// already in flight. The slot releases itself on drop.
    pub(crate) fn try_reserve_client(&self) -> Option<ClientSlot<'_>> {
        self.clients_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                (count < self.max_clients).then(|| count + 1)
            })
            .ok()
            .map(|_| ClientSlot { proxy: self })
    }

    async fn udp_acceptor(self: Arc<Self>, socket: Arc<UdpSocket>) {
        let mut shutdown = self.shutdown.subscribe();
        // One byte short of the maximum so an oversized datagram shows up
        // as truncated instead of silently fitting.
        let mut buf = vec![0u8; MAX_PACKET_SIZE - 1];
        loop {
            tokio::select! {
                result = socket.recv_from(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(ok) => ok,
                        Err(e) => {
                            error!("UDP recv error: {e}");
                            return;
                        }
                    };
                    let packet = buf[..len].to_vec();
                    let proxy = self.clone();
                    let socket = socket.clone();
                    tokio::spawn(async move {
                        let Some(_slot) = proxy.try_reserve_client() else {
                            warn!("too many in-flight queries (max={})", proxy.max_clients);
                            return;
                        };
                        let server = proxy.servers.get_one();
                        let client = ClientCtx::Udp { socket, peer };
                        proxy
                            .process_query(server, client, proxy.main_proto, packet)
                            .await;
                    });
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn tcp_acceptor(self: Arc<Self>, listener: TcpListener) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => {
                    let (mut stream, peer) = match result {
                        Ok(ok) => ok,
                        Err(e) => {
                            debug!("TCP accept error: {e}");
                            continue;
                        }
                    };
                    let proxy = self.clone();
                    tokio::spawn(async move {
                        let Some(_slot) = proxy.try_reserve_client() else {
                            warn!("too many in-flight queries (max={})", proxy.max_clients);
                            return;
                        };
                        let packet = match timeout(proxy.timeout, dns::read_prefixed(&mut stream)).await {
                            Ok(Ok(packet)) => packet,
                            _ => return,
                        };
                        let server = proxy.servers.get_one();
                        let client = ClientCtx::Tcp { stream, peer };
                        proxy
                            .process_query(server, client, MainProto::Tcp, packet)
                            .await;
                    });
                }
                _ = shutdown.recv() => break,
            }
        }
    }

    async fn refresh_loop(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        loop {
            let delay = if self.servers.live_servers() == 0 {
                self.cert_refresh_delay_after_failure
            } else {
                self.cert_refresh_delay
            };
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => break,
            }
            let (live, err) = self.servers.refresh(&self).await;
            if live == 0 {
                if let Some(e) = err {
                    warn!("certificate refresh failed: {e}");
                }
            }
        }
    }

    /// The per-query state machine: validate, query plugins, exchange,
    /// response plugins, size policy, emit. Every failure past admission
    /// is silence toward the client; its own retry logic handles it.
    pub(crate) async fn process_query(
        &self,
        server: Option<Arc<ServerInfo>>,
        client: ClientCtx,
        server_proto: MainProto,
        packet: Vec<u8>,
    ) {
        if packet.len() < MIN_PACKET_SIZE {
            return;
        }
        let Some(server) = server else {
            debug!("dropping query: no live servers");
            return;
        };
        let mut state = match PluginsState::new(&packet, client.proto(), client.peer()) {
            Ok(state) => state,
            Err(_) => return, // malformed: drop silently
        };

        let mut packet = packet;
        self.plugins
            .apply_query_plugins(&mut state, &mut packet)
            .await;

        let mut response = match state.action {
            PluginAction::Drop => return,
            PluginAction::Synth => match state.synth.take() {
                Some(synth) => synth,
                None => return,
            },
            PluginAction::Forward => {
                let response = match server.proto {
                    StampProto::DnsCrypt => {
                        let (encrypted, client_nonce) = match dnscrypt::encrypt_query(
                            &self.keys,
                            &self.estimator,
                            &server,
                            &packet,
                            server_proto,
                        ) {
                            Ok(ok) => ok,
                            Err(e) => {
                                debug!("cannot encrypt query for [{}]: {e}", server.name);
                                return;
                            }
                        };
                        server.notice_begin();
                        let exchanged = match server_proto {
                            MainProto::Udp => {
                                dnscrypt::exchange_udp(&server, &encrypted, &client_nonce).await
                            }
                            MainProto::Tcp => {
                                dnscrypt::exchange_tcp(&server, encrypted, &client_nonce).await
                            }
                        };
                        match exchanged {
                            Ok(response) => response,
                            Err(e) => {
                                debug!("exchange with [{}] failed: {e}", server.name);
                                server.notice_failure();
                                return;
                            }
                        }
                    }
                    StampProto::DoH => {
                        server.notice_begin();
                        match doh::exchange(self, &server, &packet).await {
                            Ok(response) => response,
                            Err(e) => {
                                debug!("DoH exchange with [{}] failed: {e}", server.name);
                                server.notice_failure();
                                return;
                            }
                        }
                    }
                };

                let mut response = response;
                self.plugins
                    .apply_response_plugins(&mut state, &mut response)
                    .await;
                match state.action {
                    PluginAction::Drop => return,
                    PluginAction::Synth => match state.synth.take() {
                        Some(synth) => synth,
                        None => return,
                    },
                    PluginAction::Forward => response,
                }
            }
        };

        if response.len() < MIN_PACKET_SIZE || response.len() > MAX_PACKET_SIZE {
            server.notice_failure();
            return;
        }

        match client {
            ClientCtx::Udp { socket, peer } => {
                if response.len() > MAX_UDP_PACKET_SIZE {
                    response = match dns::truncated_shell(&response) {
                        Ok(shell) => shell,
                        Err(_) => return,
                    };
                }
                if socket.send_to(&response, peer).await.is_err() {
                    return;
                }
                if dns::has_tc_flag(&response) {
                    self.estimator.blind_adjust();
                } else {
                    self.estimator.adjust(RESPONSE_OVERHEAD + response.len());
                }
            }
            ClientCtx::Tcp { mut stream, .. } => {
                let framed = match dns::prefix_with_size(response) {
                    Ok(framed) => framed,
                    Err(_) => {
                        server.notice_failure();
                        return;
                    }
                };
                use tokio::io::AsyncWriteExt;
                if stream.write_all(&framed).await.is_err() {
                    return;
                }
            }
        }
        server.notice_success();
    }
}

/// RAII admission slot.
pub(crate) struct ClientSlot<'a> {
    proxy: &'a Proxy,
}

impl Drop for ClientSlot<'_> {
    fn drop(&mut self) {
        // Decrement-or-no-op: a zero count stays zero.
        let _ = self
            .proxy
            .clients_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |count| {
                count.checked_sub(1)
            });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_proxy(max_clients: u32) -> Arc<Proxy> {
        let config = Config {
            max_clients,
            ..Default::default()
        };
        Arc::new(Proxy::new(config).unwrap())
    }

    #[test]
    fn admission_is_bounded_and_releases_on_drop() {
        let proxy = test_proxy(2);

        let a = proxy.try_reserve_client().unwrap();
        let _b = proxy.try_reserve_client().unwrap();
        assert!(proxy.try_reserve_client().is_none());
        assert_eq!(proxy.clients_in_flight(), 2);

        drop(a);
        assert_eq!(proxy.clients_in_flight(), 1);
        assert!(proxy.try_reserve_client().is_some());
    }

    #[test]
    fn admission_counter_holds_under_contention() {
        let proxy = test_proxy(8);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let proxy = proxy.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    if let Some(slot) = proxy.try_reserve_client() {
                        assert!(proxy.clients_in_flight() <= 8);
                        drop(slot);
                    }
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(proxy.clients_in_flight(), 0);
    }

    #[test]
    fn bad_stamp_is_fatal_at_construction() {
        let config = Config {
            servers: vec![crate::config::StaticServer {
                name: "broken".into(),
                stamp: "sdns://not!valid".into(),
            }],
            ..Default::default()
        };
        assert!(matches!(Proxy::new(config), Err(ProxyError::Stamp(_))));
    }
}
