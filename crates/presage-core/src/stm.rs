//! Short-term memory: a session-scoped ordered event buffer.
//!
//! All operations here are pure: state in, state out. The session manager owns
//! the only mutable copy and threads it through these functions under the
//! session lock.

use crate::config::{EngineDefaults, StmMode};
use crate::event::Event;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Ordered event buffer; index 0 is the oldest event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Stm(Vec<Event>);

impl Stm {
    pub fn events(&self) -> &[Event] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Distinct symbols across the whole buffer, in sorted order.
    pub fn distinct_symbols(&self) -> BTreeSet<String> {
        self.0
            .iter()
            .flat_map(|e| e.symbols().iter().cloned())
            .collect()
    }
}

/// Appends an already-canonicalized event.
pub fn observe(mut stm: Stm, event: Event) -> Stm {
    stm.0.push(event);
    stm
}

/// Empties the buffer.
pub fn clear(_stm: Stm) -> Stm {
    Stm::default()
}

/// True when auto-learn is enabled and the buffer has reached the trigger length.
pub fn should_auto_learn(stm: &Stm, cfg: &EngineDefaults) -> bool {
    cfg.max_pattern_length > 0 && stm.len() >= cfg.max_pattern_length
}

/// Post-learn residue: either empty the buffer or keep a sliding window of the
/// last `max_pattern_length - 1` events.
pub fn apply_post_learn(stm: Stm, cfg: &EngineDefaults) -> Stm {
    match cfg.stm_mode {
        StmMode::Clear => Stm::default(),
        StmMode::Rolling => {
            let keep = cfg.max_pattern_length.saturating_sub(1);
            let mut events = stm.0;
            let drop = events.len().saturating_sub(keep);
            events.drain(..drop);
            Stm(events)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(symbols: &[&str]) -> Event {
        Event::canonical(symbols.iter().copied(), true)
    }

    fn cfg(max_pattern_length: usize, stm_mode: StmMode) -> EngineDefaults {
        EngineDefaults {
            max_pattern_length,
            stm_mode,
            ..Default::default()
        }
    }

    #[test]
    fn observe_appends_in_order() {
        let stm = observe(Stm::default(), ev(&["a"]));
        let stm = observe(stm, ev(&["b"]));
        assert_eq!(stm.events(), &[ev(&["a"]), ev(&["b"])]);
    }

    #[test]
    fn clear_empties() {
        let stm = observe(Stm::default(), ev(&["a"]));
        assert!(clear(stm).is_empty());
    }

    #[test]
    fn auto_learn_fires_only_at_threshold() {
        let c = cfg(3, StmMode::Clear);
        let mut stm = Stm::default();
        for s in ["a", "b"] {
            stm = observe(stm, ev(&[s]));
            assert!(!should_auto_learn(&stm, &c));
        }
        stm = observe(stm, ev(&["c"]));
        assert!(should_auto_learn(&stm, &c));
    }

    #[test]
    fn manual_mode_never_auto_learns() {
        let c = cfg(0, StmMode::Clear);
        let mut stm = Stm::default();
        for i in 0..10 {
            stm = observe(stm, ev(&[&format!("s{i}")]));
        }
        assert!(!should_auto_learn(&stm, &c));
    }

    #[test]
    fn clear_mode_empties_after_learn() {
        let c = cfg(3, StmMode::Clear);
        let stm = observe(observe(Stm::default(), ev(&["a"])), ev(&["b"]));
        assert!(apply_post_learn(stm, &c).is_empty());
    }

    #[test]
    fn rolling_mode_keeps_tail_window() {
        let c = cfg(3, StmMode::Rolling);
        let mut stm = Stm::default();
        for s in ["a", "b", "c"] {
            stm = observe(stm, ev(&[s]));
        }
        let stm = apply_post_learn(stm, &c);
        assert_eq!(stm.events(), &[ev(&["b"]), ev(&["c"])]);
    }

    #[test]
    fn rolling_with_window_zero_stays_empty() {
        // max_pattern_length = 1 keeps a window of 0 events.
        let c = cfg(1, StmMode::Rolling);
        let stm = observe(Stm::default(), ev(&["a"]));
        assert!(apply_post_learn(stm, &c).is_empty());
    }

    #[test]
    fn distinct_symbols_are_sorted_and_unique() {
        let stm = observe(
            observe(Stm::default(), ev(&["b", "a"])),
            ev(&["c", "a"]),
        );
        let syms: Vec<_> = stm.distinct_symbols().into_iter().collect();
        assert_eq!(syms, ["a", "b", "c"]);
    }
}
