//! Plugin pipeline.
//!
//! Two ordered chains run around every forwarded query: one over the
//! question before any upstream work, one over the response before it is
//! sent back. A plugin may mutate the packet, terminate the query (drop
//! or synthesize) or pass through. Chain order is fixed at init:
//!
//! query side:    query log, block by name, block IPv6, cache lookup,
//!                forward rules
//! response side: block by response IP, cache store, NXDOMAIN log
//!
//! A plugin error is logged and treated as pass-through so a broken rule
//! file never turns into a denial of service.

mod block_ip;
mod block_ipv6;
mod block_name;
mod cache;
mod forward;
mod query_log;

pub use cache::DnsCache;
pub use query_log::EventLogger;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use hickory_proto::op::Message;
use hickory_proto::rr::{DNSClass, Name, RecordType};
use hickory_proto::serialize::binary::BinDecodable;
use tracing::warn;

use crate::config::Config;
use crate::error::{ProxyError, Result};

/// Protocol the client used to reach us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientProto {
    Udp,
    Tcp,
}

impl std::fmt::Display for ClientProto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientProto::Udp => write!(f, "udp"),
            ClientProto::Tcp => write!(f, "tcp"),
        }
    }
}

/// Terminal decision for a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginAction {
    /// Keep going: hand the packet to an upstream.
    Forward,
    /// Stop with no reply at all.
    Drop,
    /// Stop and answer from `synth`.
    Synth,
}

/// Per-query state threaded through both chains. Single-owner: one task,
/// one query, one state.
pub struct PluginsState {
    pub client_proto: ClientProto,
    pub client_addr: SocketAddr,
    /// Parsed question message.
    pub question: Message,
    /// Lowercased query name without the trailing dot.
    pub qname: String,
    pub qtype: RecordType,
    pub qclass: DNSClass,
    pub action: PluginAction,
    /// Wire bytes of a synthesized answer when `action` is `Synth`.
    pub synth: Option<Vec<u8>>,
}

impl PluginsState {
    /// Parse the client packet; a malformed or question-less packet is an
    /// error and the caller drops it silently.
    pub fn new(packet: &[u8], client_proto: ClientProto, client_addr: SocketAddr) -> Result<Self> {
        let question = Message::from_bytes(packet)?;
        let query = question
            .queries()
            .first()
            .ok_or_else(|| ProxyError::Protocol("packet carries no question".into()))?;
        let qname = normalize_qname(query.name());
        let qtype = query.query_type();
        let qclass = query.query_class();
        Ok(Self {
            client_proto,
            client_addr,
            question,
            qname,
            qtype,
            qclass,
            action: PluginAction::Forward,
            synth: None,
        })
    }
}

/// Lowercased name without the trailing root dot.
pub fn normalize_qname(name: &Name) -> String {
    let ascii = name.to_ascii().to_lowercase();
    ascii.strip_suffix('.').map(str::to_string).unwrap_or(ascii)
}

/// One stage of either chain.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &'static str;

    async fn apply(&self, state: &mut PluginsState, packet: &mut Vec<u8>) -> Result<()>;
}

/// Both chains, built once from the configuration and immutable
/// afterwards, so queries read them without synchronization.
pub struct PluginsGlobals {
    query_plugins: Vec<Box<dyn Plugin>>,
    response_plugins: Vec<Box<dyn Plugin>>,
}

impl PluginsGlobals {
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut query_plugins: Vec<Box<dyn Plugin>> = Vec::new();
        let mut response_plugins: Vec<Box<dyn Plugin>> = Vec::new();

        if let Some(path) = &config.query_log_file {
            query_plugins.push(Box::new(query_log::QueryLog::new(
                EventLogger::open(path, config.query_log_format)?,
                config.query_log_ignored_qtypes.clone(),
            )));
        }
        if let Some(path) = &config.block_name_file {
            let logger = config
                .block_name_log_file
                .as_ref()
                .map(|p| EventLogger::open(p, config.block_name_log_format))
                .transpose()?;
            query_plugins.push(Box::new(block_name::BlockName::load(path, logger)?));
        }
        if config.block_ipv6 {
            query_plugins.push(Box::new(block_ipv6::BlockIpv6));
        }

        let cache = config.cache.then(|| {
            Arc::new(DnsCache::new(
                config.cache_size,
                config.cache_min_ttl,
                config.cache_max_ttl,
                config.cache_neg_ttl,
            ))
        });
        if let Some(cache) = &cache {
            query_plugins.push(Box::new(cache::CacheLookup::new(cache.clone())));
        }
        if let Some(path) = &config.forward_file {
            query_plugins.push(Box::new(forward::Forward::load(path, config.timeout)?));
        }

        if let Some(path) = &config.block_ip_file {
            let logger = config
                .block_ip_log_file
                .as_ref()
                .map(|p| EventLogger::open(p, config.block_ip_log_format))
                .transpose()?;
            response_plugins.push(Box::new(block_ip::BlockIp::load(path, logger)?));
        }
        if let Some(cache) = &cache {
            response_plugins.push(Box::new(cache::CacheStore::new(cache.clone())));
        }
        if let Some(path) = &config.nx_log_file {
            response_plugins.push(Box::new(query_log::NxLog::new(EventLogger::open(
                path,
                config.nx_log_format,
            )?)));
        }

        Ok(Self {
            query_plugins,
            response_plugins,
        })
    }

    /// Run the query-side chain until a plugin terminates the query.
    pub async fn apply_query_plugins(&self, state: &mut PluginsState, packet: &mut Vec<u8>) {
        Self::apply_chain(&self.query_plugins, state, packet).await;
    }

    /// Run the response-side chain over the upstream answer.
    pub async fn apply_response_plugins(&self, state: &mut PluginsState, packet: &mut Vec<u8>) {
        Self::apply_chain(&self.response_plugins, state, packet).await;
    }

    async fn apply_chain(
        plugins: &[Box<dyn Plugin>],
        state: &mut PluginsState,
        packet: &mut Vec<u8>,
    ) {
        for plugin in plugins {
            if let Err(e) = plugin.apply(state, packet).await {
                warn!("plugin [{}] failed, passing through: {}", plugin.name(), e);
            }
            if state.action != PluginAction::Forward {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_proto::op::{MessageType, OpCode, Query};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::str::FromStr;

    pub(crate) fn query_packet(name: &str, qtype: RecordType) -> Vec<u8> {
        let mut message = Message::new();
        message.set_id(0x4242);
        message.set_message_type(MessageType::Query);
        message.set_op_code(OpCode::Query);
        message.set_recursion_desired(true);
        message.add_query(Query::query(Name::from_str(name).unwrap(), qtype));
        message.to_bytes().unwrap()
    }

    pub(crate) fn client_addr() -> SocketAddr {
        "127.0.0.1:53535".parse().unwrap()
    }

    #[test]
    fn state_extracts_normalized_question() {
        let packet = query_packet("WWW.Example.COM.", RecordType::A);
        let state = PluginsState::new(&packet, ClientProto::Udp, client_addr()).unwrap();
        assert_eq!(state.qname, "www.example.com");
        assert_eq!(state.qtype, RecordType::A);
        assert_eq!(state.action, PluginAction::Forward);
    }

    #[test]
    fn malformed_packet_is_an_error() {
        assert!(PluginsState::new(&[0u8; 5], ClientProto::Udp, client_addr()).is_err());
        // Valid header, no question section.
        let mut empty = Message::new();
        empty.set_id(1);
        let packet = empty.to_bytes().unwrap();
        assert!(PluginsState::new(&packet, ClientProto::Udp, client_addr()).is_err());
    }

    #[tokio::test]
    async fn chain_is_deterministic_and_short_circuits() {
        struct Tag(&'static str, PluginAction);

        #[async_trait]
        impl Plugin for Tag {
            fn name(&self) -> &'static str {
                self.0
            }
            async fn apply(&self, state: &mut PluginsState, packet: &mut Vec<u8>) -> Result<()> {
                packet.push(self.0.as_bytes()[0]);
                state.action = self.1;
                if self.1 == PluginAction::Synth {
                    state.synth = Some(vec![0xee]);
                }
                Ok(())
            }
        }

        let globals = PluginsGlobals {
            query_plugins: vec![
                Box::new(Tag("a", PluginAction::Forward)),
                Box::new(Tag("b", PluginAction::Synth)),
                Box::new(Tag("c", PluginAction::Forward)),
            ],
            response_plugins: vec![],
        };

        for _ in 0..3 {
            let query = query_packet("example.com.", RecordType::A);
            let mut state = PluginsState::new(&query, ClientProto::Udp, client_addr()).unwrap();
            let mut packet = query.clone();
            globals.apply_query_plugins(&mut state, &mut packet).await;
            assert_eq!(state.action, PluginAction::Synth);
            // "c" never ran.
            assert_eq!(&packet[packet.len() - 2..], b"ab");
        }
    }
}
