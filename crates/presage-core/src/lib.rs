//! presage-core: online pattern-learning and prediction engine.
//!
//! Clients stream observations (symbolic tokens plus optional 768-dim vectors
//! and scalar emotive tags); the engine maintains per-session short-term
//! memory, learns recurring event sequences as content-addressed patterns,
//! and returns ranked predictions of what is likely to precede, accompany, or
//! follow the current STM contents. Multiple isolated knowledge bases coexist
//! in one process, addressed by `kb_id`.

pub mod config;
pub mod error;
pub mod event;
pub mod matcher;
pub mod patterns;
pub mod processor;
pub mod sessions;
pub mod stm;
pub mod symbols;

// Configuration
pub use config::{CoreConfig, EngineDefaults, RankMetric, SessionOverlay, StmMode};

// Errors
pub use error::{EngineError, Result};

// Observations, events, STM
pub use event::{canonical_json, Event, Observation};
pub use stm::Stm;

// Patterns and retrieval
pub use patterns::retrieval::{Candidate, LengthRange, RowFilter, SymbolOverlap};
pub use patterns::store::{KbRecord, PatternStore};
pub use patterns::{pattern_id, Pattern, PatternMeta, PatternRow, PATTERN_ID_PREFIX};

// Matching
pub use matcher::{Alignment, Prediction};

// Symbols and vectors
pub use symbols::{
    KbStats, SymbolRegistry, SymbolStats, VectorNamer, VECTOR_DIM, VECTOR_SYMBOL_PREFIX,
};

// Sessions and orchestration
pub use processor::{ObserveOutcome, Processor, SequenceOptions, SequenceOutcome};
pub use sessions::{SessionManager, SessionState};
