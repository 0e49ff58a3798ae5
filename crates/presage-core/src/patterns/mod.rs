//! Learned patterns: immutable event sequences with content-addressed identity.
//!
//! `pattern_id = "PTRN|" + hex(SHA-1(canonical JSON of the events))`, so any
//! writer computing the digest of the same sequence converges on the same
//! identity; concurrent learns of one sequence are idempotent for the row.

pub mod retrieval;
pub mod store;

use crate::event::{canonical_json, Event};
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::collections::BTreeMap;

pub const PATTERN_ID_PREFIX: &str = "PTRN|";

pub(crate) fn sha1_hex(bytes: &[u8]) -> String {
    let digest = Sha1::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}

/// Content-addressed identity of an event sequence.
pub fn pattern_id(events: &[Event]) -> String {
    format!(
        "{PATTERN_ID_PREFIX}{}",
        sha1_hex(canonical_json(events).as_bytes())
    )
}

/// Immutable row in the pattern store: the sequence itself, with its length
/// denormalized for range filters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatternRow {
    pub pattern_id: String,
    pub kb_id: String,
    pub events: Vec<Event>,
    pub length: usize,
}

/// Mutable pattern metadata: the learn counter and per-emotive rolling
/// histories (latest `persistence` values, oldest evicted first).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PatternMeta {
    pub frequency: u64,
    #[serde(default)]
    pub emotives: BTreeMap<String, Vec<f64>>,
}

impl PatternMeta {
    /// Applies one learn: bump the counter and append each emotive value to
    /// its ring, evicting from the front past `persistence`.
    pub fn apply_learn(&mut self, emotives: &BTreeMap<String, f64>, persistence: usize) {
        self.frequency += 1;
        for (key, &value) in emotives {
            let ring = self.emotives.entry(key.clone()).or_default();
            ring.push(value);
            let excess = ring.len().saturating_sub(persistence);
            ring.drain(..excess);
        }
    }

    /// Latest value per emotive key, for prediction payloads.
    pub fn latest_emotives(&self) -> BTreeMap<String, f64> {
        self.emotives
            .iter()
            .filter_map(|(k, ring)| ring.last().map(|&v| (k.clone(), v)))
            .collect()
    }
}

/// A fully assembled pattern (row + metadata) as returned by `get`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pattern {
    pub pattern_id: String,
    pub kb_id: String,
    pub events: Vec<Event>,
    pub length: usize,
    pub frequency: u64,
    pub emotives: BTreeMap<String, Vec<f64>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(symbols: &[&str]) -> Event {
        Event::canonical(symbols.iter().copied(), true)
    }

    #[test]
    fn pattern_id_matches_known_digest() {
        // sha1 of `[["a","b"],["c"],["d","e"]]`
        let events = vec![ev(&["b", "a"]), ev(&["c"]), ev(&["e", "d"])];
        assert_eq!(
            pattern_id(&events),
            "PTRN|db44a704d9ef8e88781459125636a090f3275b5a"
        );
    }

    #[test]
    fn identity_ignores_member_order_within_events() {
        let a = pattern_id(&[ev(&["x", "y"]), ev(&["z"])]);
        let b = pattern_id(&[ev(&["y", "x", "y"]), ev(&["z"])]);
        assert_eq!(a, b);
    }

    #[test]
    fn emotive_ring_keeps_the_last_n_in_order() {
        let mut meta = PatternMeta::default();
        for i in 0..8 {
            let emotives = [("joy".to_string(), i as f64)].into_iter().collect();
            meta.apply_learn(&emotives, 5);
        }
        assert_eq!(meta.frequency, 8);
        assert_eq!(meta.emotives["joy"], vec![3.0, 4.0, 5.0, 6.0, 7.0]);
        assert_eq!(meta.latest_emotives()["joy"], 7.0);
    }

    #[test]
    fn emotive_keys_are_independent_rings() {
        let mut meta = PatternMeta::default();
        meta.apply_learn(
            &[("joy".to_string(), 0.8), ("fear".to_string(), 0.1)]
                .into_iter()
                .collect(),
            5,
        );
        meta.apply_learn(&[("joy".to_string(), 0.9)].into_iter().collect(), 5);
        assert_eq!(meta.emotives["joy"], vec![0.8, 0.9]);
        assert_eq!(meta.emotives["fear"], vec![0.1]);
    }
}
