//! Observations and canonical events.
//!
//! An event is the set of symbols observed together at one time step, stored
//! canonically (deduplicated, lexicographically sorted) so two events with the
//! same members always compare equal. The canonical JSON form of an event
//! sequence is also the digest input for content-addressed pattern identity.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};

/// Inbound observation payload: symbolic tokens plus optional dense vectors
/// and scalar emotive tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Observation {
    #[serde(default)]
    pub strings: Vec<String>,
    #[serde(default)]
    pub vectors: Vec<Vec<f64>>,
    #[serde(default)]
    pub emotives: BTreeMap<String, f64>,
}

impl Observation {
    /// An observation with no strings and no vectors is a no-op; it does not
    /// advance the STM (emotives alone carry nothing to observe).
    pub fn is_empty(&self) -> bool {
        self.strings.is_empty() && self.vectors.is_empty()
    }
}

/// A canonicalized set of symbols observed together.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Event(Vec<String>);

impl Event {
    /// Builds the canonical form: duplicates removed, symbols sorted.
    ///
    /// With `sort = false` the first-occurrence order is preserved instead.
    /// That breaks content-addressed identity and exists only because the
    /// `sort` config key can be disabled; callers should leave it on.
    pub fn canonical<I, S>(symbols: I, sort: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut out: Vec<String> = symbols
            .into_iter()
            .map(Into::into)
            .filter(|s| seen.insert(s.clone()))
            .collect();
        if sort {
            out.sort();
        }
        Self(out)
    }

    pub fn symbols(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Symbols of this event as a set, for overlap tests.
    pub fn symbol_set(&self) -> HashSet<&str> {
        self.0.iter().map(String::as_str).collect()
    }

    /// The event joined into one string, used by character-level similarity.
    pub fn joined(&self) -> String {
        self.0.concat()
    }
}

/// Canonical serialization of an event sequence: compact JSON of the nested
/// string arrays, e.g. `[["a","b"],["c"]]`. Events are already sorted, so the
/// output is deterministic and stable across runs.
pub fn canonical_json(events: &[Event]) -> String {
    serde_json::to_string(events).expect("event sequences always serialize")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_dedups_and_sorts() {
        let e = Event::canonical(["b", "a", "b", "c", "a"], true);
        assert_eq!(e.symbols(), ["a", "b", "c"]);
    }

    #[test]
    fn same_members_compare_equal() {
        let a = Event::canonical(["world", "hello"], true);
        let b = Event::canonical(["hello", "world", "hello"], true);
        assert_eq!(a, b);
    }

    #[test]
    fn unsorted_mode_keeps_first_occurrence_order() {
        let e = Event::canonical(["b", "a", "b"], false);
        assert_eq!(e.symbols(), ["b", "a"]);
    }

    #[test]
    fn canonical_json_is_compact_and_stable() {
        let events = vec![
            Event::canonical(["b", "a"], true),
            Event::canonical(["c"], true),
            Event::canonical(["e", "d"], true),
        ];
        assert_eq!(canonical_json(&events), r#"[["a","b"],["c"],["d","e"]]"#);
    }

    #[test]
    fn empty_observation_detection() {
        let obs = Observation {
            emotives: [("joy".to_string(), 0.8)].into_iter().collect(),
            ..Default::default()
        };
        assert!(obs.is_empty());
        let obs = Observation {
            strings: vec!["a".into()],
            ..Default::default()
        };
        assert!(!obs.is_empty());
    }
}
