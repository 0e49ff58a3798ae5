//! Processor orchestration: thin glue threading session state through the
//! pure STM operations, the pattern store, and the matcher.
//!
//! The processor holds no per-session state of its own (everything lives in
//! the session record), and its shared handles (storage trees, lock registry,
//! vector collections) are constructed exactly once in [`Processor::open`] and
//! shared by reference count from there.

use crate::config::{CoreConfig, EngineDefaults, SessionOverlay};
use crate::error::Result;
use crate::event::{Event, Observation};
use crate::matcher::{self, Prediction};
use crate::patterns::retrieval;
use crate::patterns::store::PatternStore;
use crate::sessions::{SessionManager, SessionState};
use crate::stm;
use crate::symbols::{SymbolRegistry, VectorNamer};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Result of a single observation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObserveOutcome {
    /// Identifier for this observation, for client-side correlation.
    pub unique_id: String,
    pub stm_length: usize,
    /// Set when the observation pushed the STM over the auto-learn threshold.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auto_learned_pattern: Option<String>,
}

/// Batch controls for `observe_sequence`.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SequenceOptions {
    #[serde(default)]
    pub learn_after_each: bool,
    #[serde(default)]
    pub learn_at_end: bool,
    #[serde(default)]
    pub clear_between: bool,
}

/// Result of an `observe_sequence` batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceOutcome {
    pub observed: usize,
    /// Every pattern learned during the batch (auto, per-event, and at-end),
    /// in learn order.
    pub learned_patterns: Vec<String>,
    pub stm_length: usize,
}

pub struct Processor {
    config: CoreConfig,
    registry: Arc<SymbolRegistry>,
    store: Arc<PatternStore>,
    vectors: Arc<VectorNamer>,
    sessions: Arc<SessionManager>,
}

impl Processor {
    /// Opens the storage backends and assembles the engine. Handles are
    /// initialized once here; all request paths share them through the
    /// returned `Arc`.
    pub fn open(config: CoreConfig) -> Result<Arc<Self>> {
        let db = sled::open(Path::new(&config.storage_path).join("presage_engine"))?;
        let registry = Arc::new(SymbolRegistry::open(&db)?);
        let store = Arc::new(PatternStore::open(&db, Arc::clone(&registry))?);
        let vectors = Arc::new(VectorNamer::open(&db)?);
        let sessions = Arc::new(SessionManager::open(
            &db,
            config.engine.clone(),
            Duration::from_secs(config.lock_timeout_secs),
        )?);
        tracing::info!(
            target: "presage::processor",
            storage_path = %config.storage_path,
            "engine opened"
        );
        Ok(Arc::new(Self {
            config,
            registry,
            store,
            vectors,
            sessions,
        }))
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    // ---- KB lifecycle -------------------------------------------------------

    pub fn create_kb(&self, kb_id: &str) -> Result<()> {
        self.store.create_kb(kb_id).map(|_| ())
    }

    pub fn list_kbs(&self) -> Result<Vec<String>> {
        self.store.list_kbs()
    }

    /// KB-scoped and destructive: drops patterns, symbol statistics, and the
    /// vector collection. Sessions pointing at the KB survive with their STM.
    pub fn clear_all_memory(&self, kb_id: &str) -> Result<()> {
        self.store.clear(kb_id)?;
        self.vectors.clear_kb(kb_id)?;
        Ok(())
    }

    // ---- Session lifecycle --------------------------------------------------

    pub fn create_session(
        &self,
        kb_id: &str,
        overlay: SessionOverlay,
        ttl_secs: Option<u64>,
    ) -> Result<SessionState> {
        self.store.require_kb(kb_id)?;
        self.sessions.create(kb_id, overlay, ttl_secs)
    }

    pub fn get_session(&self, session_id: &str) -> Result<SessionState> {
        self.sessions.get(session_id)
    }

    pub async fn update_session_config(
        &self,
        session_id: &str,
        overlay: SessionOverlay,
    ) -> Result<SessionState> {
        overlay.validate()?;
        self.sessions
            .with_exclusive(session_id, move |mut state, _| {
                state.overlay = state.overlay.merged_with(&overlay);
                let snapshot = state.clone();
                Ok((state, snapshot))
            })
            .await
    }

    pub fn delete_session(&self, session_id: &str) -> Result<()> {
        self.sessions.delete(session_id)
    }

    // ---- Per-session operations ---------------------------------------------

    /// Folds one observation into the session: vector naming, canonicalization,
    /// symbol interning, STM append, and the auto-learn check.
    fn fold_observation(
        &self,
        state: &mut SessionState,
        cfg: &EngineDefaults,
        observation: &Observation,
    ) -> Result<Option<String>> {
        if observation.is_empty() {
            return Ok(None);
        }
        let mut symbols = observation.strings.clone();
        symbols.extend(self.vectors.name_vectors(&state.kb_id, &observation.vectors)?);
        let event = Event::canonical(symbols, cfg.sort);
        self.registry.intern_event(&state.kb_id, &event)?;
        state.stm = stm::observe(std::mem::take(&mut state.stm), event);
        for (key, value) in &observation.emotives {
            state.pending_emotives.insert(key.clone(), *value);
        }
        if stm::should_auto_learn(&state.stm, cfg) {
            return Ok(Some(self.learn_now(state, cfg)?));
        }
        Ok(None)
    }

    /// Learns the current STM and applies the post-learn residue policy.
    fn learn_now(&self, state: &mut SessionState, cfg: &EngineDefaults) -> Result<String> {
        let pattern_id = self.store.learn(
            &state.kb_id,
            state.stm.events(),
            &state.pending_emotives,
            cfg.persistence,
        )?;
        state.stm = stm::apply_post_learn(std::mem::take(&mut state.stm), cfg);
        state.pending_emotives.clear();
        Ok(pattern_id)
    }

    pub async fn observe(
        &self,
        session_id: &str,
        observation: Observation,
    ) -> Result<ObserveOutcome> {
        self.sessions
            .with_exclusive(session_id, |mut state, defaults| {
                let cfg = state.effective_config(defaults);
                let auto_learned_pattern =
                    self.fold_observation(&mut state, &cfg, &observation)?;
                let outcome = ObserveOutcome {
                    unique_id: Uuid::new_v4().to_string(),
                    stm_length: state.stm.len(),
                    auto_learned_pattern,
                };
                Ok((state, outcome))
            })
            .await
    }

    /// Observes a batch under one lock acquisition. When `learn_after_each`
    /// and `clear_between` are combined, the learn runs first (consuming STM
    /// per `stm_mode`) and the clear follows.
    pub async fn observe_sequence(
        &self,
        session_id: &str,
        observations: Vec<Observation>,
        options: SequenceOptions,
    ) -> Result<SequenceOutcome> {
        self.sessions
            .with_exclusive(session_id, |mut state, defaults| {
                let cfg = state.effective_config(defaults);
                let mut learned_patterns = Vec::new();
                for observation in &observations {
                    learned_patterns
                        .extend(self.fold_observation(&mut state, &cfg, observation)?);
                    if options.learn_after_each && !state.stm.is_empty() {
                        learned_patterns.push(self.learn_now(&mut state, &cfg)?);
                    }
                    if options.clear_between {
                        state.stm = stm::clear(std::mem::take(&mut state.stm));
                        state.pending_emotives.clear();
                    }
                }
                if options.learn_at_end && !state.stm.is_empty() {
                    learned_patterns.push(self.learn_now(&mut state, &cfg)?);
                }
                let outcome = SequenceOutcome {
                    observed: observations.len(),
                    learned_patterns,
                    stm_length: state.stm.len(),
                };
                Ok((state, outcome))
            })
            .await
    }

    pub async fn get_stm(&self, session_id: &str) -> Result<Vec<Event>> {
        self.sessions
            .with_exclusive(session_id, |state, _| {
                let events = state.stm.events().to_vec();
                Ok((state, events))
            })
            .await
    }

    /// Manual learn. An empty STM is a no-op, not an error.
    pub async fn learn(&self, session_id: &str) -> Result<Option<String>> {
        self.sessions
            .with_exclusive(session_id, |mut state, defaults| {
                let cfg = state.effective_config(defaults);
                if state.stm.is_empty() {
                    return Ok((state, None));
                }
                let pattern_id = self.learn_now(&mut state, &cfg)?;
                Ok((state, Some(pattern_id)))
            })
            .await
    }

    pub async fn get_predictions(&self, session_id: &str) -> Result<Vec<Prediction>> {
        self.sessions
            .with_exclusive(session_id, |state, defaults| {
                let cfg = state.effective_config(defaults);
                if !cfg.process_predictions || state.stm.is_empty() {
                    return Ok((state, Vec::new()));
                }
                let candidates = self.store.candidates(
                    &state.kb_id,
                    &state.stm,
                    &retrieval::default_pipeline(),
                )?;
                let predictions = matcher::predict(
                    &state.kb_id,
                    &state.stm,
                    candidates,
                    &self.store,
                    &self.registry,
                    &cfg,
                )?;
                Ok((state, predictions))
            })
            .await
    }

    pub async fn clear_stm(&self, session_id: &str) -> Result<()> {
        self.sessions
            .with_exclusive(session_id, |mut state, _| {
                state.stm = stm::clear(std::mem::take(&mut state.stm));
                state.pending_emotives.clear();
                Ok((state, ()))
            })
            .await
    }
}
