//! Response-IP blocklist.

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::Path;

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::RData;
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use ipnet::IpNet;
use tracing::info;

use crate::dns::synthetic_response;
use crate::error::Result;
use crate::plugins::{Plugin, PluginAction, PluginsState};
use crate::plugins::query_log::EventLogger;

/// Exact addresses and CIDR ranges, one per line; `#`/`//` comments.
pub struct IpRules {
    ips: HashSet<IpAddr>,
    nets: Vec<IpNet>,
}

impl IpRules {
    pub fn parse(content: &str) -> Self {
        let mut ips = HashSet::new();
        let mut nets = Vec::new();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            if let Ok(ip) = line.parse::<IpAddr>() {
                ips.insert(ip);
            } else if let Ok(net) = line.parse::<IpNet>() {
                nets.push(net);
            }
        }
        Self { ips, nets }
    }

    pub fn matches(&self, ip: &IpAddr) -> bool {
        self.ips.contains(ip) || self.nets.iter().any(|net| net.contains(ip))
    }
}

/// Rewrites responses resolving to a blocked address into an NXDOMAIN
/// synthetic answer.
pub struct BlockIp {
    rules: IpRules,
    logger: Option<EventLogger>,
}

impl BlockIp {
    pub fn load(path: &Path, logger: Option<EventLogger>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let rules = IpRules::parse(&content);
        info!(
            "IP blocklist loaded from [{}] ({} addresses, {} ranges)",
            path.display(),
            rules.ips.len(),
            rules.nets.len()
        );
        Ok(Self { rules, logger })
    }

    #[cfg(test)]
    pub(crate) fn from_rules(rules: IpRules) -> Self {
        Self {
            rules,
            logger: None,
        }
    }
}

#[async_trait]
impl Plugin for BlockIp {
    fn name(&self) -> &'static str {
        "block_ip"
    }

    async fn apply(&self, state: &mut PluginsState, packet: &mut Vec<u8>) -> Result<()> {
        let response = Message::from_bytes(packet)?;
        let blocked = response.answers().iter().find_map(|record| match record.data() {
            RData::A(a) => {
                let ip = IpAddr::V4(a.0);
                self.rules.matches(&ip).then_some(ip)
            }
            RData::AAAA(aaaa) => {
                let ip = IpAddr::V6(aaaa.0);
                self.rules.matches(&ip).then_some(ip)
            }
            _ => None,
        });
        let Some(ip) = blocked else {
            return Ok(());
        };

        let synth = synthetic_response(&response, ResponseCode::NXDomain);
        state.synth = Some(synth.to_bytes()?);
        state.action = PluginAction::Synth;
        if let Some(logger) = &self.logger {
            logger.log(
                &state.client_addr,
                &state.qname,
                &state.qtype.to_string(),
                &format!("blocked ip {ip}"),
            );
        }
        Ok(())
    }
}
