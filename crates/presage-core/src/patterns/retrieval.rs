//! Candidate retrieval: from STM symbols to a small set of patterns worth
//! scoring, through a composable filter pipeline.
//!
//! The member index (symbol → pattern id) bounds the scan to patterns sharing
//! at least one STM symbol, so the candidate set scales with symbol overlap
//! rather than KB size. Filters compose; the pipeline is the single extension
//! point for narrowing retrieval further.

use super::store::PatternStore;
use super::PatternRow;
use crate::error::Result;
use crate::stm::Stm;
use std::collections::{BTreeSet, HashSet};

/// Inputs shared by all filters for one retrieval pass.
pub struct RetrievalContext {
    pub stm_symbols: HashSet<String>,
}

/// One stage of the retrieval pipeline. Returning `false` drops the row.
pub trait RowFilter: Send + Sync {
    fn keep(&self, row: &PatternRow, ctx: &RetrievalContext) -> bool;
}

/// Keeps patterns whose symbol set intersects the STM symbols at least
/// `min_shared` times.
pub struct SymbolOverlap {
    pub min_shared: usize,
}

impl RowFilter for SymbolOverlap {
    fn keep(&self, row: &PatternRow, ctx: &RetrievalContext) -> bool {
        let mut shared = 0usize;
        let mut seen: HashSet<&str> = HashSet::new();
        for event in &row.events {
            for symbol in event.symbols() {
                if ctx.stm_symbols.contains(symbol.as_str()) && seen.insert(symbol.as_str()) {
                    shared += 1;
                    if shared >= self.min_shared {
                        return true;
                    }
                }
            }
        }
        false
    }
}

/// Keeps patterns whose length falls in `[min, max]`. Available as a pipeline
/// stage but not part of the default pipeline: alignment similarity is scored
/// on the aligned region only, so a length cut can drop patterns that would
/// still clear the recall threshold.
pub struct LengthRange {
    pub min: usize,
    pub max: usize,
}

impl RowFilter for LengthRange {
    fn keep(&self, row: &PatternRow, _ctx: &RetrievalContext) -> bool {
        (self.min..=self.max).contains(&row.length)
    }
}

/// Lightweight candidate record handed to the matcher.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub pattern_id: String,
    pub events: Vec<crate::event::Event>,
    pub length: usize,
}

/// The default pipeline: any shared symbol makes a pattern worth scoring.
pub fn default_pipeline() -> Vec<Box<dyn RowFilter>> {
    vec![Box::new(SymbolOverlap { min_shared: 1 })]
}

impl PatternStore {
    /// Candidates for the current STM. An empty STM yields no candidates;
    /// STM symbols unknown to the member index yield no matches (not an
    /// error). Results are in pattern-id order, so retrieval is deterministic.
    pub fn candidates(
        &self,
        kb_id: &str,
        stm: &Stm,
        pipeline: &[Box<dyn RowFilter>],
    ) -> Result<Vec<Candidate>> {
        if stm.is_empty() {
            return Ok(Vec::new());
        }
        self.require_kb(kb_id)?;

        let symbols = stm.distinct_symbols();
        let mut ids: BTreeSet<String> = BTreeSet::new();
        for symbol in &symbols {
            ids.extend(self.member_pattern_ids(kb_id, symbol)?);
        }

        let ctx = RetrievalContext {
            stm_symbols: symbols.into_iter().collect(),
        };
        let mut out = Vec::new();
        for pid in ids {
            let Some(row) = self.row(kb_id, &pid)? else {
                // Member entry without a row: the row was cleared mid-scan.
                continue;
            };
            if pipeline.iter().all(|f| f.keep(&row, &ctx)) {
                out.push(Candidate {
                    pattern_id: row.pattern_id,
                    events: row.events,
                    length: row.length,
                });
            }
        }
        tracing::debug!(
            target: "presage::retrieval",
            kb_id,
            candidates = out.len(),
            "candidate retrieval complete"
        );
        Ok(out)
    }
}
