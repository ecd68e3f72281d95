//! Domain blocklist.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use hickory_proto::op::ResponseCode;
use hickory_proto::serialize::binary::BinEncodable;
use regex::Regex;
use tracing::info;

use crate::dns::synthetic_response;
use crate::error::Result;
use crate::plugins::{EventLogger, Plugin, PluginAction, PluginsState};

/// Compiled domain rules. Entry grammar, one per line:
/// `full:name` exact, `keyword:part` substring, `regex:`/`regexp:` pattern,
/// anything else a suffix match (leading `*.`, `+.` or `.` stripped).
/// `#` and `//` start comments.
pub struct DomainRules {
    exact: HashSet<String>,
    suffixes: Vec<String>,
    keywords: Vec<String>,
    regexes: Vec<Regex>,
}

impl DomainRules {
    pub fn parse(content: &str) -> Self {
        let mut rules = Self {
            exact: HashSet::new(),
            suffixes: Vec::new(),
            keywords: Vec::new(),
            regexes: Vec::new(),
        };
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }
            let entry = line.to_lowercase();
            if let Some(name) = entry.strip_prefix("full:") {
                rules.exact.insert(name.to_string());
            } else if let Some(keyword) = entry.strip_prefix("keyword:") {
                rules.keywords.push(keyword.to_string());
            } else if let Some(pattern) = entry
                .strip_prefix("regexp:")
                .or_else(|| entry.strip_prefix("regex:"))
            {
                match Regex::new(pattern) {
                    Ok(regex) => rules.regexes.push(regex),
                    Err(_) => {
                        rules.exact.insert(pattern.to_string());
                    }
                }
            } else {
                let suffix = entry
                    .trim_start_matches("*.")
                    .trim_start_matches("+.")
                    .trim_start_matches('.');
                rules.suffixes.push(suffix.to_string());
            }
        }
        rules
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
            && self.suffixes.is_empty()
            && self.keywords.is_empty()
            && self.regexes.is_empty()
    }

    pub fn matches(&self, qname: &str) -> bool {
        if self.exact.contains(qname) {
            return true;
        }
        if self
            .suffixes
            .iter()
            .any(|s| qname == s || qname.ends_with(&format!(".{s}")))
        {
            return true;
        }
        if self.keywords.iter().any(|k| qname.contains(k.as_str())) {
            return true;
        }
        self.regexes.iter().any(|r| r.is_match(qname))
    }
}

/// Answers blocked names with a synthetic NXDOMAIN, never contacting any
/// upstream.
pub struct BlockName {
    rules: DomainRules,
    logger: Option<EventLogger>,
}

impl BlockName {
    pub fn load(path: &Path, logger: Option<EventLogger>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let rules = DomainRules::parse(&content);
        info!(
            "domain blocklist loaded from [{}] ({} exact, {} suffix rules)",
            path.display(),
            rules.exact.len(),
            rules.suffixes.len()
        );
        Ok(Self { rules, logger })
    }

    #[cfg(test)]
    pub(crate) fn from_rules(rules: DomainRules) -> Self {
        Self {
            rules,
            logger: None,
        }
    }
}

#[async_trait]
impl Plugin for BlockName {
    fn name(&self) -> &'static str {
        "block_name"
    }

    async fn apply(&self, state: &mut PluginsState, _packet: &mut Vec<u8>) -> Result<()> {
        if !self.rules.matches(&state.qname) {
            return Ok(());
        }
        let synth = synthetic_response(&state.question, ResponseCode::NXDomain);
        state.synth = Some(synth.to_bytes()?);
        state.action = PluginAction::Synth;
        if let Some(logger) = &self.logger {
            logger.log(
                &state.client_addr,
                &state.qname,
                &state.qtype.to_string(),
                "blocked",
            );
        }
        Ok(())
    }
}
