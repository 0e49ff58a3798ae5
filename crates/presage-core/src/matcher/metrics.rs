//! The ranking metric library.
//!
//! Every candidate gets the full metric set computed once (cheap next to the
//! alignment work); the sort key is then selected by enum, so re-ranking at
//! runtime needs no recomputation and no dynamic dispatch in the hot loop.
//!
//! Metrics with KB-wide denominators (the entropy pair, itfdf, confluence)
//! read symbol statistics from the registry. Zero or missing statistics are a
//! backend inconsistency and propagate as failure, never as a substituted
//! default.

use crate::error::{EngineError, Result};
use crate::event::Event;
use crate::symbols::{KbStats, SymbolStats};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// The matcher's view of one aligned candidate.
pub struct AlignmentView<'a> {
    pub similarity: f64,
    /// Full STM length, including events outside the aligned region.
    pub stm_len: usize,
    /// The STM slice overlapping `present` (same length as `present`).
    pub aligned_stm: &'a [Event],
    pub past: &'a [Event],
    pub present: &'a [Event],
    pub future: &'a [Event],
    pub pattern_len: usize,
    pub frequency: u64,
}

/// All twelve ranking metrics for one prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSet {
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

fn lookup<'a>(
    stats: &'a HashMap<String, SymbolStats>,
    symbol: &str,
) -> Result<&'a SymbolStats> {
    stats.get(symbol).ok_or_else(|| {
        EngineError::StorageUnavailable(format!("missing statistics for symbol '{symbol}'"))
    })
}

/// -log2 of the symbol's KB-wide probability.
fn surprise(stats: &SymbolStats, kb: &KbStats) -> Result<f64> {
    if kb.total_symbol_freq == 0 || stats.frequency == 0 {
        return Err(EngineError::StorageUnavailable(
            "zeroed symbol frequency statistics".into(),
        ));
    }
    Ok(-((stats.frequency as f64 / kb.total_symbol_freq as f64).log2()))
}

/// Mean surprise of `symbols`, normalized into roughly [0, 1] by the maximum
/// surprise any symbol in this KB can carry. Empty input yields 0.
fn normalized_information(
    symbols: &[&str],
    stats: &HashMap<String, SymbolStats>,
    kb: &KbStats,
) -> Result<f64> {
    if symbols.is_empty() {
        return Ok(0.0);
    }
    let mut total = 0.0;
    for symbol in symbols {
        total += surprise(lookup(stats, symbol)?, kb)?;
    }
    let denominator = (kb.unique_symbols.max(2) as f64).log2();
    Ok(total / symbols.len() as f64 / denominator)
}

fn flatten(events: &[Event]) -> Vec<&str> {
    events
        .iter()
        .flat_map(|e| e.symbols().iter().map(String::as_str))
        .collect()
}

/// Per-position overlap across the aligned region: total shared symbols,
/// total union size, and the number of contiguous matched runs.
fn region_overlap(aligned_stm: &[Event], present: &[Event]) -> (usize, usize, usize) {
    let mut shared_total = 0usize;
    let mut union_total = 0usize;
    let mut blocks = 0usize;
    let mut in_block = false;
    for (stm_event, pattern_event) in aligned_stm.iter().zip(present) {
        let stm_set = stm_event.symbol_set();
        let pattern_set = pattern_event.symbol_set();
        let shared = stm_set.intersection(&pattern_set).count();
        shared_total += shared;
        union_total += stm_set.union(&pattern_set).count();
        if shared > 0 {
            if !in_block {
                blocks += 1;
            }
            in_block = true;
        } else {
            in_block = false;
        }
    }
    (shared_total, union_total, blocks)
}

/// Computes the full metric set for one aligned candidate.
pub fn compute(
    view: &AlignmentView<'_>,
    stats: &HashMap<String, SymbolStats>,
    kb: &KbStats,
) -> Result<MetricSet> {
    let evidence = view.present.len() as f64 / view.pattern_len as f64;

    let (shared, union, blocks) = region_overlap(view.aligned_stm, view.present);
    let fragmentation = if blocks == 0 { 0.0 } else { 1.0 / blocks as f64 };
    let snr = if union == 0 {
        0.0
    } else {
        shared as f64 / union as f64
    };

    // Similarity discounted by the STM context the pattern does not explain.
    let confidence = view.similarity * view.aligned_stm.len() as f64 / view.stm_len.max(1) as f64;

    let future_symbols = flatten(view.future);
    let normalized_entropy = normalized_information(&future_symbols, stats, kb)?;

    let mut all_symbols = flatten(view.past);
    all_symbols.extend(flatten(view.present));
    all_symbols.extend(future_symbols);
    let global_normalized_entropy = normalized_information(&all_symbols, stats, kb)?;

    let itfdf_similarity = itfdf(view, stats, kb)?;
    let confluence = confluence(view, stats, kb)?;

    // Information the pattern supplies about what comes next, discounted by
    // how much of the pattern has actually been observed.
    let predictive_information = normalized_entropy * evidence;

    let potential = view.similarity
        * evidence
        * (1.0 + view.frequency as f64).ln()
        * (1.0 + confluence);

    Ok(MetricSet {
        similarity: view.similarity,
        evidence,
        frequency: view.frequency,
        fragmentation,
        snr,
        confidence,
        normalized_entropy,
        global_normalized_entropy,
        itfdf_similarity,
        confluence,
        predictive_information,
        potential,
    })
}

/// Similarity weighted by the inverse pattern-membership frequency of the
/// matched region's symbols (tf·idf-style): rare symbols carry more weight.
fn itfdf(
    view: &AlignmentView<'_>,
    stats: &HashMap<String, SymbolStats>,
    kb: &KbStats,
) -> Result<f64> {
    if kb.total_patterns == 0 {
        return Err(EngineError::StorageUnavailable(
            "zeroed pattern count statistics".into(),
        ));
    }
    let present_symbols = flatten(view.present);
    let mut idf_total = 0.0;
    for symbol in &present_symbols {
        let s = lookup(stats, symbol)?;
        if s.pattern_member_frequency == 0 {
            return Err(EngineError::StorageUnavailable(format!(
                "zeroed pattern-member statistic for symbol '{symbol}'"
            )));
        }
        idf_total += (1.0 + kb.total_patterns as f64 / s.pattern_member_frequency as f64).ln();
    }
    let mean_idf = idf_total / present_symbols.len() as f64;
    let max_idf = (1.0 + kb.total_patterns as f64).ln();
    Ok(view.similarity * mean_idf / max_idf)
}

/// Ratio of the pattern's observed probability to what independent symbol
/// co-occurrence would predict, squashed into (0, 1).
fn confluence(
    view: &AlignmentView<'_>,
    stats: &HashMap<String, SymbolStats>,
    kb: &KbStats,
) -> Result<f64> {
    if kb.total_pattern_freq == 0 || kb.total_symbol_freq == 0 {
        return Err(EngineError::StorageUnavailable(
            "zeroed KB-wide frequency statistics".into(),
        ));
    }
    let observed = view.frequency as f64 / kb.total_pattern_freq as f64;

    let distinct: BTreeSet<&str> = view
        .past
        .iter()
        .chain(view.present)
        .chain(view.future)
        .flat_map(|e| e.symbols().iter().map(String::as_str))
        .collect();
    // Log space: the independence product underflows for long patterns.
    let mut ln_expected = 0.0;
    for symbol in distinct {
        let s = lookup(stats, symbol)?;
        ln_expected += (s.frequency as f64 / kb.total_symbol_freq as f64).ln();
    }
    let expected = ln_expected.exp();
    Ok(observed / (observed + expected))
}
