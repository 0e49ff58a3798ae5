//! Symbol registry: per-KB symbol statistics under prefixed KV keys.
//!
//! Key layout inside the `symbol_stats` tree:
//! - `{kb_id}:symbol:freq:{symbol}`: events containing the symbol
//! - `{kb_id}:symbol:pmf:{symbol}`: distinct patterns containing the symbol
//! - `{kb_id}:total:symbol_freq` / `:unique_symbols` / `:pattern_freq` / `:patterns`
//!
//! Counters are u64 big-endian values mutated only through sled's CAS
//! primitives, so concurrent sessions increment atomically. The registry is
//! fail-fast: a storage outage surfaces as an error, never as a silent zero.

pub mod vectors;

pub use vectors::{VectorNamer, VECTOR_DIM, VECTOR_SYMBOL_PREFIX};

use crate::error::{EngineError, Result};
use crate::event::Event;
use sled::Tree;
use std::collections::{BTreeSet, HashMap};

/// KB-wide denominators used by the entropy, itfdf, and confluence metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KbStats {
    /// Sum of all per-symbol event frequencies.
    pub total_symbol_freq: u64,
    /// Number of distinct symbols ever observed in the KB.
    pub unique_symbols: u64,
    /// Sum of all pattern frequencies (every learn counts).
    pub total_pattern_freq: u64,
    /// Number of distinct patterns.
    pub total_patterns: u64,
}

/// Per-symbol counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SymbolStats {
    pub frequency: u64,
    pub pattern_member_frequency: u64,
}

pub struct SymbolRegistry {
    stats: Tree,
}

fn decode_u64(bytes: &[u8]) -> u64 {
    bytes
        .try_into()
        .map(u64::from_be_bytes)
        .unwrap_or_default()
}

impl SymbolRegistry {
    pub fn open(db: &sled::Db) -> Result<Self> {
        Ok(Self {
            stats: db.open_tree("symbol_stats")?,
        })
    }

    /// Atomically adds `by` to the counter at `key`; returns the previous value.
    fn incr(&self, key: &str, by: u64) -> Result<u64> {
        let prev = self.stats.fetch_and_update(key.as_bytes(), |old| {
            let cur = old.map(decode_u64).unwrap_or(0);
            Some(cur.saturating_add(by).to_be_bytes().to_vec())
        })?;
        Ok(prev.map(|iv| decode_u64(&iv)).unwrap_or(0))
    }

    fn read(&self, key: &str) -> Result<Option<u64>> {
        Ok(self.stats.get(key.as_bytes())?.map(|iv| decode_u64(&iv)))
    }

    /// Records one event's membership: each distinct symbol's `frequency`
    /// rises by one (once per event, however many times it appears).
    pub fn intern_event(&self, kb_id: &str, event: &Event) -> Result<()> {
        for symbol in event.symbols() {
            let prev = self.incr(&format!("{kb_id}:symbol:freq:{symbol}"), 1)?;
            if prev == 0 {
                self.incr(&format!("{kb_id}:total:unique_symbols"), 1)?;
            }
        }
        self.incr(
            &format!("{kb_id}:total:symbol_freq"),
            event.len() as u64,
        )?;
        Ok(())
    }

    /// Called once per *new* pattern for each distinct member symbol; never
    /// re-incremented on frequency bumps.
    pub fn incr_pattern_members(&self, kb_id: &str, symbols: &BTreeSet<String>) -> Result<()> {
        for symbol in symbols {
            self.incr(&format!("{kb_id}:symbol:pmf:{symbol}"), 1)?;
        }
        Ok(())
    }

    /// Records a learn: total pattern frequency always rises; the distinct
    /// pattern count only on first creation.
    pub fn note_learn(&self, kb_id: &str, new_pattern: bool) -> Result<()> {
        self.incr(&format!("{kb_id}:total:pattern_freq"), 1)?;
        if new_pattern {
            self.incr(&format!("{kb_id}:total:patterns"), 1)?;
        }
        Ok(())
    }

    pub fn symbol_frequency(&self, kb_id: &str, symbol: &str) -> Result<Option<u64>> {
        self.read(&format!("{kb_id}:symbol:freq:{symbol}"))
    }

    pub fn kb_stats(&self, kb_id: &str) -> Result<KbStats> {
        Ok(KbStats {
            total_symbol_freq: self.read(&format!("{kb_id}:total:symbol_freq"))?.unwrap_or(0),
            unique_symbols: self.read(&format!("{kb_id}:total:unique_symbols"))?.unwrap_or(0),
            total_pattern_freq: self.read(&format!("{kb_id}:total:pattern_freq"))?.unwrap_or(0),
            total_patterns: self.read(&format!("{kb_id}:total:patterns"))?.unwrap_or(0),
        })
    }

    /// Stats for every symbol in `symbols`. Missing or zeroed statistics are a
    /// backend inconsistency (learned patterns always intern their symbols)
    /// and propagate as failure rather than being substituted with defaults.
    pub fn stats_for<'a, I>(&self, kb_id: &str, symbols: I) -> Result<HashMap<String, SymbolStats>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut out = HashMap::new();
        for symbol in symbols {
            let frequency = self
                .symbol_frequency(kb_id, symbol)?
                .filter(|&f| f > 0)
                .ok_or_else(|| {
                    EngineError::StorageUnavailable(format!(
                        "missing frequency statistic for symbol '{symbol}' in kb '{kb_id}'"
                    ))
                })?;
            let pattern_member_frequency = self
                .read(&format!("{kb_id}:symbol:pmf:{symbol}"))?
                .unwrap_or(0);
            out.insert(
                symbol.to_string(),
                SymbolStats {
                    frequency,
                    pattern_member_frequency,
                },
            );
        }
        Ok(out)
    }

    /// Removes every statistic for the KB.
    pub fn clear_kb(&self, kb_id: &str) -> Result<()> {
        let prefix = format!("{kb_id}:");
        let keys: Vec<_> = self
            .stats
            .scan_prefix(prefix.as_bytes())
            .keys()
            .collect::<std::result::Result<_, _>>()?;
        for key in keys {
            self.stats.remove(key)?;
        }
        tracing::info!(target: "presage::symbols", kb_id, "symbol statistics cleared");
        Ok(())
    }
}
