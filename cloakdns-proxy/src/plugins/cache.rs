//! Shared response cache.
//!
//! Keyed on the normalized question; stores whole wire responses. TTLs
//! are clamped into the configured window on insert and rewritten to the
//! remaining lifetime on hit. Negative answers get their own, shorter
//! lifetime. Capacity-bounded with expired-entries-first eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::serialize::binary::{BinDecodable, BinEncodable};
use parking_lot::RwLock;
use tracing::trace;

use crate::dns;
use crate::error::Result;
use crate::plugins::{Plugin, PluginAction, PluginsState};

#[derive(Debug, Clone, Hash, PartialEq, Eq)]
struct CacheKey {
    qname: String,
    qtype: u16,
    qclass: u16,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    packet: Vec<u8>,
    inserted: Instant,
    ttl: u32,
}

impl CacheEntry {
    fn is_expired(&self) -> bool {
        self.inserted.elapsed() > Duration::from_secs(u64::from(self.ttl))
    }

    fn remaining_ttl(&self) -> u32 {
        self.ttl
            .saturating_sub(self.inserted.elapsed().as_secs() as u32)
    }
}

/// TTL-aware response cache.
pub struct DnsCache {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    max_size: usize,
    min_ttl: u32,
    max_ttl: u32,
    neg_ttl: u32,
}

impl DnsCache {
    pub fn new(max_size: usize, min_ttl: u32, max_ttl: u32, neg_ttl: u32) -> Self {
        Self {
            entries: RwLock::new(HashMap::with_capacity(max_size)),
            max_size,
            min_ttl,
            max_ttl,
            neg_ttl,
        }
    }

    /// Fetch a cached response, re-stamped with the query's transaction id
    /// and the remaining TTL.
    pub fn get(&self, qname: &str, qtype: u16, qclass: u16, id: u16) -> Option<Vec<u8>> {
        let key = CacheKey {
            qname: qname.to_string(),
            qtype,
            qclass,
        };
        let entry = {
            let entries = self.entries.read();
            let entry = entries.get(&key)?;
            if entry.is_expired() {
                return None;
            }
            entry.clone()
        };

        let mut message = Message::from_bytes(&entry.packet).ok()?;
        let remaining = entry.remaining_ttl().max(1);
        let answers: Vec<_> = message
            .take_answers()
            .into_iter()
            .map(|mut record| {
                record.set_ttl(remaining.min(record.ttl()));
                record
            })
            .collect();
        message.insert_answers(answers);
        let mut packet = message.to_bytes().ok()?;
        dns::set_transaction_id(&mut packet, id);
        trace!("cache hit: {qname}");
        Some(packet)
    }

    /// Store one wire response under its question.
    pub fn insert(&self, qname: &str, qtype: u16, qclass: u16, packet: Vec<u8>) {
        let Ok(message) = Message::from_bytes(&packet) else {
            return;
        };
        let negative = message.response_code() != ResponseCode::NoError
            || message.answers().is_empty();
        let ttl = if negative {
            self.neg_ttl
        } else {
            message
                .answers()
                .iter()
                .map(|r| r.ttl())
                .min()
                .unwrap_or(self.min_ttl)
                .clamp(self.min_ttl, self.max_ttl)
        };

        let key = CacheKey {
            qname: qname.to_string(),
            qtype,
            qclass,
        };
        let mut entries = self.entries.write();
        if entries.len() >= self.max_size && !entries.contains_key(&key) {
            Self::evict_one(&mut entries);
        }
        entries.insert(
            key,
            CacheEntry {
                packet,
                inserted: Instant::now(),
                ttl,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Drop an expired entry if there is one, else the entry closest to
    /// expiry.
    fn evict_one(entries: &mut HashMap<CacheKey, CacheEntry>) {
        let victim = entries
            .iter()
            .find(|(_, entry)| entry.is_expired())
            .map(|(key, _)| key.clone())
            .or_else(|| {
                entries
                    .iter()
                    .min_by_key(|(_, entry)| entry.remaining_ttl())
                    .map(|(key, _)| key.clone())
            });
        if let Some(key) = victim {
            entries.remove(&key);
        }
    }
}

/// Query-side half: answer from cache when possible.
pub struct CacheLookup {
    cache: Arc<DnsCache>,
}

impl CacheLookup {
    pub fn new(cache: Arc<DnsCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Plugin for CacheLookup {
    fn name(&self) -> &'static str {
        "cache_lookup"
    }

    async fn apply(&self, state: &mut PluginsState, _packet: &mut Vec<u8>) -> Result<()> {
        let id = state.question.id();
        if let Some(packet) = self.cache.get(
            &state.qname,
            u16::from(state.qtype),
            u16::from(state.qclass),
            id,
        ) {
            state.synth = Some(packet);
            state.action = PluginAction::Synth;
        }
        Ok(())
    }
}

/// Response-side half: remember what the upstream said.
pub struct CacheStore {
    cache: Arc<DnsCache>,
}

impl CacheStore {
    pub fn new(cache: Arc<DnsCache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl Plugin for CacheStore {
    fn name(&self) -> &'static str {
        "cache_store"
    }

    async fn apply(&self, state: &mut PluginsState, packet: &mut Vec<u8>) -> Result<()> {
        self.cache.insert(
            &state.qname,
            u16::from(state.qtype),
            u16::from(state.qclass),
            packet.clone(),
        );
        Ok(())
    }
}
