//! Suffix-based forwarding rules.
//!
//! Matched domains bypass the encrypted catalog entirely and are resolved
//! against an explicitly named plain-DNS upstream, typically a LAN
//! resolver that knows local names.

use std::net::SocketAddr;
use std::path::Path;

use async_trait::async_trait;
use rand::seq::SliceRandom;
use tokio::net::UdpSocket;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::dns::{self, MAX_PACKET_SIZE};
use crate::error::{ProxyError, Result};
use crate::plugins::{Plugin, PluginAction, PluginsState};

struct ForwardRule {
    suffix: String,
    resolvers: Vec<SocketAddr>,
}

/// Rule file: one `suffix addr[,addr...]` per line, port 53 implied.
pub struct Forward {
    rules: Vec<ForwardRule>,
    timeout: std::time::Duration,
}

impl Forward {
    pub fn load(path: &Path, query_timeout: std::time::Duration) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let forward = Self::parse(&content, query_timeout)?;
        info!(
            "{} forwarding rule(s) loaded from [{}]",
            forward.rules.len(),
            path.display()
        );
        Ok(forward)
    }

    pub(crate) fn parse(content: &str, query_timeout: std::time::Duration) -> Result<Self> {
        let mut rules = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let (suffix, resolvers) = line
                .split_once(char::is_whitespace)
                .ok_or_else(|| ProxyError::Config(format!("bad forwarding rule [{line}]")))?;
            let resolvers = resolvers
                .split(',')
                .map(|addr| {
                    let addr = addr.trim();
                    crate::stamp::with_default_port(addr, 53)
                        .parse()
                        .map_err(|_| {
                            ProxyError::Config(format!("bad forwarding resolver [{addr}]"))
                        })
                })
                .collect::<Result<Vec<SocketAddr>>>()?;
            rules.push(ForwardRule {
                suffix: suffix.trim_end_matches('.').to_lowercase(),
                resolvers,
            });
        }
        Ok(Self {
            rules,
            timeout: query_timeout,
        })
    }

    fn matching_resolvers(&self, qname: &str) -> Option<&[SocketAddr]> {
        self.rules
            .iter()
            .find(|rule| {
                qname == rule.suffix || qname.ends_with(&format!(".{}", rule.suffix))
            })
            .map(|rule| rule.resolvers.as_slice())
    }
}

#[async_trait]
impl Plugin for Forward {
    fn name(&self) -> &'static str {
        "forward"
    }

    async fn apply(&self, state: &mut PluginsState, packet: &mut Vec<u8>) -> Result<()> {
        let Some(resolvers) = self.matching_resolvers(&state.qname) else {
            return Ok(());
        };
        let resolver = *resolvers
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| ProxyError::Config("empty resolver list".into()))?;
        debug!("forwarding [{}] to {resolver}", state.qname);

        let bind_addr = if resolver.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(resolver).await?;
        socket.send(packet).await?;

        let mut buf = vec![0u8; MAX_PACKET_SIZE];
        let len = timeout(self.timeout, socket.recv(&mut buf))
            .await
            .map_err(|_| ProxyError::Timeout)??;
        let response = &buf[..len];
        if len < dns::MIN_PACKET_SIZE
            || dns::transaction_id(response) != dns::transaction_id(packet)
            || !dns::is_response(response)
        {
            return Err(ProxyError::Protocol("mismatched forwarded response".into()));
        }

        state.synth = Some(response.to_vec());
        state.action = PluginAction::Synth;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::tests::{client_addr, query_packet};
    use crate::plugins::ClientProto;
    use hickory_proto::rr::RecordType;
    use std::time::Duration;

    #[test]
    fn parses_rule_lines() {
        let forward = Forward::parse(
            "# lan names\nhome.arpa 192.168.1.1\ncorp.example 10.0.0.2:5353,10.0.0.3\n",
            Duration::from_secs(2),
        )
        .unwrap();
        assert!(forward.matching_resolvers("printer.home.arpa").is_some());
        assert!(forward.matching_resolvers("home.arpa").is_some());
        assert_eq!(
            forward.matching_resolvers("corp.example").unwrap().len(),
            2
        );
        assert!(forward.matching_resolvers("example.com").is_none());
        // Suffix match only applies at label boundaries.
        assert!(forward.matching_resolvers("myhome.arpa").is_none());
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(Forward::parse("justasuffix\n", Duration::from_secs(2)).is_err());
        assert!(Forward::parse("a.example not-an-addr\n", Duration::from_secs(2)).is_err());
    }

    #[tokio::test]
    async fn forwards_to_local_resolver() {
        // A tiny UDP resolver that echoes the query with QR set.
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_PACKET_SIZE];
            let (len, peer) = server.recv_from(&mut buf).await.unwrap();
            buf[2] |= 0x80;
            server.send_to(&buf[..len], peer).await.unwrap();
        });

        let forward = Forward::parse(
            &format!("lan.example {server_addr}\n"),
            Duration::from_secs(2),
        )
        .unwrap();
        let query = query_packet("nas.lan.example.", RecordType::A);
        let mut state = PluginsState::new(&query, ClientProto::Udp, client_addr()).unwrap();
        forward.apply(&mut state, &mut query.clone()).await.unwrap();

        assert_eq!(state.action, PluginAction::Synth);
        let synth = state.synth.unwrap();
        assert!(dns::is_response(&synth));
        assert_eq!(dns::transaction_id(&synth), 0x4242);
    }
}
