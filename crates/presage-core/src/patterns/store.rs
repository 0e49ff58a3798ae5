//! Sled-backed pattern store.
//!
//! Immutable rows, mutable metadata, and the symbol→pattern member index live
//! in separate trees, all keyed under `{kb_id}:` prefixes. A single `learn`
//! writes rows, metadata, and counters; any backend failure propagates, with
//! no read-through cache or silent fallback masking an outage.

use super::{pattern_id, Pattern, PatternMeta, PatternRow};
use crate::error::{EngineError, Result};
use crate::event::Event;
use crate::symbols::SymbolRegistry;
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Registry entry for a knowledge base. KBs are never created implicitly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KbRecord {
    pub kb_id: String,
    pub created_at_ms: i64,
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct PatternStore {
    kbs: Tree,
    rows: Tree,
    meta: Tree,
    members: Tree,
    registry: Arc<SymbolRegistry>,
}

impl PatternStore {
    pub fn open(db: &sled::Db, registry: Arc<SymbolRegistry>) -> Result<Self> {
        Ok(Self {
            kbs: db.open_tree("kbs")?,
            rows: db.open_tree("pattern_rows")?,
            meta: db.open_tree("pattern_meta")?,
            members: db.open_tree("pattern_members")?,
            registry,
        })
    }

    /// Creates the KB if absent. Identifiers are restricted to characters that
    /// keep the prefixed key layout unambiguous.
    pub fn create_kb(&self, kb_id: &str) -> Result<KbRecord> {
        if kb_id.is_empty()
            || !kb_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(EngineError::InvalidConfig {
                field: "kb_id",
                reason: format!(
                    "'{kb_id}' must be non-empty and contain only [A-Za-z0-9_-]"
                ),
            });
        }
        if let Some(existing) = self.kbs.get(kb_id.as_bytes())? {
            return Ok(serde_json::from_slice(&existing)?);
        }
        let record = KbRecord {
            kb_id: kb_id.to_string(),
            created_at_ms: now_ms(),
        };
        self.kbs
            .insert(kb_id.as_bytes(), serde_json::to_vec(&record)?)?;
        tracing::info!(target: "presage::store", kb_id, "knowledge base created");
        Ok(record)
    }

    pub fn kb_exists(&self, kb_id: &str) -> Result<bool> {
        Ok(self.kbs.get(kb_id.as_bytes())?.is_some())
    }

    pub fn require_kb(&self, kb_id: &str) -> Result<()> {
        if self.kb_exists(kb_id)? {
            Ok(())
        } else {
            Err(EngineError::KbNotFound(kb_id.to_string()))
        }
    }

    pub fn list_kbs(&self) -> Result<Vec<String>> {
        self.kbs
            .iter()
            .keys()
            .map(|k| {
                let k = k?;
                String::from_utf8(k.to_vec())
                    .map_err(|_| EngineError::StorageUnavailable("non-utf8 kb id".into()))
            })
            .collect()
    }

    fn row_key(kb_id: &str, pattern_id: &str) -> String {
        format!("{kb_id}:{pattern_id}")
    }

    /// Learns the sequence: inserts the row on first sight, bumps frequency
    /// and emotive rings on every learn. Row insertion is idempotent under
    /// concurrency (same digest); counters use the store's CAS primitives.
    pub fn learn(
        &self,
        kb_id: &str,
        events: &[Event],
        emotives: &BTreeMap<String, f64>,
        persistence: usize,
    ) -> Result<String> {
        self.require_kb(kb_id)?;
        let pid = pattern_id(events);
        let key = Self::row_key(kb_id, &pid);

        let row = PatternRow {
            pattern_id: pid.clone(),
            kb_id: kb_id.to_string(),
            events: events.to_vec(),
            length: events.len(),
        };
        let inserted = self
            .rows
            .compare_and_swap(
                key.as_bytes(),
                None::<&[u8]>,
                Some(serde_json::to_vec(&row)?),
            )?
            .is_ok();

        if inserted {
            let symbols: BTreeSet<String> = events
                .iter()
                .flat_map(|e| e.symbols().iter().cloned())
                .collect();
            for symbol in &symbols {
                self.members
                    .insert(format!("{kb_id}:{symbol}:{pid}").as_bytes(), pid.as_bytes())?;
            }
            self.registry.incr_pattern_members(kb_id, &symbols)?;
        }
        self.registry.note_learn(kb_id, inserted)?;

        // Read-modify-write loop on the metadata record; contention retries.
        loop {
            let current = self.meta.get(key.as_bytes())?;
            let mut meta: PatternMeta = match &current {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => PatternMeta::default(),
            };
            meta.apply_learn(emotives, persistence);
            let next = serde_json::to_vec(&meta)?;
            let swap = self.meta.compare_and_swap(
                key.as_bytes(),
                current.as_ref().map(|iv| iv.as_ref()),
                Some(next.as_slice()),
            )?;
            if swap.is_ok() {
                break;
            }
        }

        tracing::info!(
            target: "presage::store",
            kb_id,
            pattern_id = %pid,
            length = row.length,
            new = inserted,
            "pattern learned"
        );
        Ok(pid)
    }

    pub fn get(&self, kb_id: &str, pattern_id: &str) -> Result<Option<Pattern>> {
        let key = Self::row_key(kb_id, pattern_id);
        let Some(row_bytes) = self.rows.get(key.as_bytes())? else {
            return Ok(None);
        };
        let row: PatternRow = serde_json::from_slice(&row_bytes)?;
        let meta = self.meta(kb_id, pattern_id)?;
        Ok(Some(Pattern {
            pattern_id: row.pattern_id,
            kb_id: row.kb_id,
            events: row.events,
            length: row.length,
            frequency: meta.frequency,
            emotives: meta.emotives,
        }))
    }

    /// Metadata for a pattern known to exist; absence is an inconsistency.
    pub fn meta(&self, kb_id: &str, pattern_id: &str) -> Result<PatternMeta> {
        let key = Self::row_key(kb_id, pattern_id);
        let bytes = self.meta.get(key.as_bytes())?.ok_or_else(|| {
            EngineError::StorageUnavailable(format!(
                "missing metadata for pattern '{pattern_id}' in kb '{kb_id}'"
            ))
        })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub(super) fn row(&self, kb_id: &str, pattern_id: &str) -> Result<Option<PatternRow>> {
        let key = Self::row_key(kb_id, pattern_id);
        match self.rows.get(key.as_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Pattern ids in the member index for one symbol, in key order.
    pub(super) fn member_pattern_ids(&self, kb_id: &str, symbol: &str) -> Result<Vec<String>> {
        self.members
            .scan_prefix(format!("{kb_id}:{symbol}:").as_bytes())
            .values()
            .map(|v| {
                let v = v?;
                String::from_utf8(v.to_vec())
                    .map_err(|_| EngineError::StorageUnavailable("non-utf8 pattern id".into()))
            })
            .collect()
    }

    pub fn pattern_count(&self, kb_id: &str) -> Result<usize> {
        Ok(self
            .rows
            .scan_prefix(format!("{kb_id}:").as_bytes())
            .count())
    }

    /// Removes all patterns and symbol statistics for the KB. The KB record
    /// itself survives; sessions pointing at it keep working on empty memory.
    pub fn clear(&self, kb_id: &str) -> Result<()> {
        self.require_kb(kb_id)?;
        let prefix = format!("{kb_id}:");
        for tree in [&self.rows, &self.meta, &self.members] {
            let keys: Vec<_> = tree
                .scan_prefix(prefix.as_bytes())
                .keys()
                .collect::<std::result::Result<_, _>>()?;
            for key in keys {
                tree.remove(key)?;
            }
        }
        self.registry.clear_kb(kb_id)?;
        tracing::warn!(target: "presage::store", kb_id, "all memory cleared");
        Ok(())
    }
}
