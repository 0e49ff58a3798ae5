//! Matcher: align candidate patterns to the STM, score them, and assemble
//! ranked prediction records.

pub mod metrics;

use crate::config::{EngineDefaults, RankMetric};
use crate::error::Result;
use crate::event::Event;
use crate::patterns::retrieval::Candidate;
use crate::patterns::store::PatternStore;
use crate::stm::Stm;
use crate::symbols::SymbolRegistry;
use self::metrics::{AlignmentView, MetricSet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// One ranked prediction. Carries every metric so callers can re-rank without
/// recomputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub pattern_id: String,
    pub past: Vec<Event>,
    pub present: Vec<Event>,
    pub future: Vec<Event>,
    /// Latest value per emotive key from the pattern's rolling histories.
    pub emotives: BTreeMap<String, f64>,
    pub similarity: f64,
    pub evidence: f64,
    pub frequency: u64,
    pub fragmentation: f64,
    pub snr: f64,
    pub confidence: f64,
    pub normalized_entropy: f64,
    pub global_normalized_entropy: f64,
    pub itfdf_similarity: f64,
    pub confluence: f64,
    pub predictive_information: f64,
    pub potential: f64,
}

/// Best contiguous alignment of a pattern against the STM.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Alignment {
    /// Pattern index where the aligned region starts (`past` is everything before).
    pub present_start: usize,
    /// Pattern index one past the aligned region (`future` is everything after).
    pub present_end: usize,
    /// STM index the aligned region starts at.
    pub stm_start: usize,
    pub similarity: f64,
}

fn join_events(events: &[Event]) -> String {
    events.iter().map(Event::joined).collect()
}

fn flatten_symbols<'a>(events: &'a [Event]) -> Vec<&'a str> {
    events
        .iter()
        .flat_map(|e| e.symbols().iter().map(String::as_str))
        .collect()
}

/// Sequence-matcher ratio over token lists: `2 * LCS / (len_a + len_b)`.
fn token_ratio(a: &[&str], b: &[&str]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let mut dp = vec![0usize; b.len() + 1];
    for &x in a {
        let mut prev = 0;
        for (j, &y) in b.iter().enumerate() {
            let up = dp[j + 1];
            dp[j + 1] = if x == y { prev + 1 } else { up.max(dp[j]) };
            prev = up;
        }
    }
    2.0 * dp[b.len()] as f64 / (a.len() + b.len()) as f64
}

/// Similarity of two aligned event runs, in [0, 1].
fn region_similarity(stm_slice: &[Event], pattern_slice: &[Event], token_mode: bool) -> f64 {
    if token_mode {
        token_ratio(&flatten_symbols(stm_slice), &flatten_symbols(pattern_slice))
    } else {
        strsim::normalized_levenshtein(&join_events(stm_slice), &join_events(pattern_slice))
    }
}

/// Slides the pattern across the STM and keeps the best-scoring contiguous
/// overlap. Ties prefer the longer overlap, then the smaller `past`.
pub fn align(stm: &[Event], pattern: &[Event], token_mode: bool) -> Option<Alignment> {
    let (m, n) = (stm.len(), pattern.len());
    if m == 0 || n == 0 {
        return None;
    }
    let mut best: Option<Alignment> = None;
    for shift in -(n as isize - 1)..=(m as isize - 1) {
        let start = shift.max(0) as usize; // stm index
        let p_start = (-shift).max(0) as usize; // pattern index
        let overlap = (m - start).min(n - p_start);
        if overlap == 0 {
            continue;
        }
        let candidate = Alignment {
            present_start: p_start,
            present_end: p_start + overlap,
            stm_start: start,
            similarity: region_similarity(
                &stm[start..start + overlap],
                &pattern[p_start..p_start + overlap],
                token_mode,
            ),
        };
        let better = match &best {
            None => true,
            Some(b) => {
                let len = candidate.present_end - candidate.present_start;
                let best_len = b.present_end - b.present_start;
                candidate.similarity > b.similarity
                    || (candidate.similarity == b.similarity && len > best_len)
                    || (candidate.similarity == b.similarity
                        && len == best_len
                        && candidate.present_start < b.present_start)
            }
        };
        if better {
            best = Some(candidate);
        }
    }
    best
}

/// The sort key for one prediction under the configured metric. Patterns with
/// nothing left to predict rank last under `predictive_information`.
fn rank_value(metric: RankMetric, p: &Prediction) -> f64 {
    match metric {
        RankMetric::Similarity => p.similarity,
        RankMetric::Evidence => p.evidence,
        RankMetric::Frequency => p.frequency as f64,
        RankMetric::Fragmentation => p.fragmentation,
        RankMetric::Snr => p.snr,
        RankMetric::Confidence => p.confidence,
        RankMetric::NormalizedEntropy => p.normalized_entropy,
        RankMetric::GlobalNormalizedEntropy => p.global_normalized_entropy,
        RankMetric::ItfdfSimilarity => p.itfdf_similarity,
        RankMetric::Confluence => p.confluence,
        RankMetric::PredictiveInformation => {
            if p.future.is_empty() {
                f64::NEG_INFINITY
            } else {
                p.predictive_information
            }
        }
        RankMetric::Potential => p.potential,
    }
}

/// Scores the candidate set against the STM and returns ranked predictions.
///
/// Candidates below `recall_threshold` are discarded; survivors carry the full
/// metric set; the list is sorted by the configured metric (descending), with
/// ties broken by descending frequency then ascending pattern id, and
/// truncated to `max_predictions`. Given identical KB contents, STM, and
/// configuration the result is byte-identical across runs.
pub fn predict(
    kb_id: &str,
    stm: &Stm,
    candidates: Vec<Candidate>,
    store: &PatternStore,
    registry: &SymbolRegistry,
    cfg: &EngineDefaults,
) -> Result<Vec<Prediction>> {
    if stm.is_empty() || candidates.is_empty() {
        return Ok(Vec::new());
    }
    let kb = registry.kb_stats(kb_id)?;
    let mut out = Vec::new();
    for candidate in candidates {
        let Some(alignment) = align(stm.events(), &candidate.events, cfg.use_token_matching)
        else {
            continue;
        };
        if alignment.similarity < cfg.recall_threshold {
            continue;
        }
        let meta = store.meta(kb_id, &candidate.pattern_id)?;
        let pattern_symbols: BTreeSet<&str> = candidate
            .events
            .iter()
            .flat_map(|e| e.symbols().iter().map(String::as_str))
            .collect();
        let stats = registry.stats_for(kb_id, pattern_symbols)?;

        let past = &candidate.events[..alignment.present_start];
        let present = &candidate.events[alignment.present_start..alignment.present_end];
        let future = &candidate.events[alignment.present_end..];
        let overlap = alignment.present_end - alignment.present_start;
        let aligned_stm = &stm.events()[alignment.stm_start..alignment.stm_start + overlap];

        let view = AlignmentView {
            similarity: alignment.similarity,
            stm_len: stm.len(),
            aligned_stm,
            past,
            present,
            future,
            pattern_len: candidate.length,
            frequency: meta.frequency,
        };
        let MetricSet {
            similarity,
            evidence,
            frequency,
            fragmentation,
            snr,
            confidence,
            normalized_entropy,
            global_normalized_entropy,
            itfdf_similarity,
            confluence,
            predictive_information,
            potential,
        } = metrics::compute(&view, &stats, &kb)?;

        out.push(Prediction {
            pattern_id: candidate.pattern_id,
            past: past.to_vec(),
            present: present.to_vec(),
            future: future.to_vec(),
            emotives: meta.latest_emotives(),
            similarity,
            evidence,
            frequency,
            fragmentation,
            snr,
            confidence,
            normalized_entropy,
            global_normalized_entropy,
            itfdf_similarity,
            confluence,
            predictive_information,
            potential,
        });
    }

    let metric = cfg.rank_sort_algo;
    out.sort_by(|a, b| {
        rank_value(metric, b)
            .total_cmp(&rank_value(metric, a))
            .then_with(|| b.frequency.cmp(&a.frequency))
            .then_with(|| a.pattern_id.cmp(&b.pattern_id))
    });
    out.truncate(cfg.max_predictions);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ev(symbols: &[&str]) -> Event {
        Event::canonical(symbols.iter().copied(), true)
    }

    #[test]
    fn align_splits_past_present_future() {
        let stm = [ev(&["y"])];
        let pattern = [ev(&["x"]), ev(&["y"]), ev(&["z"])];
        let a = align(&stm, &pattern, false).unwrap();
        assert_eq!(a.present_start, 1);
        assert_eq!(a.present_end, 2);
        assert_eq!(a.stm_start, 0);
        assert_eq!(a.similarity, 1.0);
    }

    #[test]
    fn align_prefers_the_best_offset() {
        let stm = [ev(&["b"]), ev(&["c"])];
        let pattern = [ev(&["a"]), ev(&["b"]), ev(&["c"]), ev(&["d"])];
        let a = align(&stm, &pattern, false).unwrap();
        assert_eq!(a.present_start, 1);
        assert_eq!(a.present_end, 3);
        assert_eq!(a.similarity, 1.0);
    }

    #[test]
    fn align_full_coverage_has_empty_past_and_future() {
        let stm = [ev(&["a"]), ev(&["b"]), ev(&["c"])];
        let pattern = [ev(&["a"]), ev(&["b"]), ev(&["c"])];
        let a = align(&stm, &pattern, false).unwrap();
        assert_eq!(a.present_start, 0);
        assert_eq!(a.present_end, 3);
        assert_eq!(a.similarity, 1.0);
    }

    #[test]
    fn empty_inputs_do_not_align() {
        assert!(align(&[], &[ev(&["a"])], false).is_none());
        assert!(align(&[ev(&["a"])], &[], false).is_none());
    }

    #[test]
    fn token_ratio_matches_sequence_ratio_semantics() {
        assert_eq!(token_ratio(&["a", "b"], &["a", "b"]), 1.0);
        assert_eq!(token_ratio(&["a"], &["b"]), 0.0);
        // 2 * 1 match / (1 + 2)
        let r = token_ratio(&["a"], &["a", "b"]);
        assert!((r - 2.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn token_and_char_modes_stay_close() {
        let stm = [ev(&["alpha", "beta"]), ev(&["gamma"])];
        let pattern = [ev(&["alpha", "beta"]), ev(&["gamma"]), ev(&["delta"])];
        let char_sim = align(&stm, &pattern, false).unwrap().similarity;
        let token_sim = align(&stm, &pattern, true).unwrap().similarity;
        assert!((char_sim - token_sim).abs() <= 0.03);
    }

    #[test]
    fn rank_value_sends_empty_future_last_under_pi() {
        let mut p = Prediction {
            pattern_id: "PTRN|x".into(),
            past: vec![],
            present: vec![ev(&["a"])],
            future: vec![],
            emotives: BTreeMap::new(),
            similarity: 1.0,
            evidence: 1.0,
            frequency: 1,
            fragmentation: 1.0,
            snr: 1.0,
            confidence: 1.0,
            normalized_entropy: 0.0,
            global_normalized_entropy: 0.5,
            itfdf_similarity: 1.0,
            confluence: 0.5,
            predictive_information: 0.0,
            potential: 1.0,
        };
        assert_eq!(
            rank_value(RankMetric::PredictiveInformation, &p),
            f64::NEG_INFINITY
        );
        p.future = vec![ev(&["z"])];
        p.predictive_information = 0.4;
        assert_eq!(rank_value(RankMetric::PredictiveInformation, &p), 0.4);
    }
}
