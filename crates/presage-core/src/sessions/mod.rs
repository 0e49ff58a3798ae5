//! Session lifecycle and the concurrency discipline around per-session state.
//!
//! Session state is a plain serializable value in the KV store; every mutating
//! operation goes through [`SessionManager::with_exclusive`], which serializes
//! work per `session_id` while sessions proceed in parallel with no
//! cross-session blocking. State is written back exactly once, after the
//! closure returns, so a cancelled request can never leave a partial write:
//! dropping the future releases the lock and discards the in-flight value.

use crate::config::{EngineDefaults, SessionOverlay};
use crate::error::{EngineError, Result};
use crate::stm::Stm;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::Tree;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

const SESSION_KEY_PREFIX: &str = "session:";

/// Per-client state: STM, configuration overlay, emotives pending the next
/// learn, and the TTL bookkeeping.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    pub session_id: String,
    pub kb_id: String,
    #[serde(default)]
    pub stm: Stm,
    #[serde(default)]
    pub overlay: SessionOverlay,
    /// Latest observed value per emotive key since the last learn.
    #[serde(default)]
    pub pending_emotives: BTreeMap<String, f64>,
    pub created_at_ms: i64,
    pub last_access_ms: i64,
    pub ttl_secs: u64,
}

impl SessionState {
    /// A session at exactly its TTL boundary is already expired.
    pub fn expired_at(&self, now_ms: i64) -> bool {
        now_ms >= self.last_access_ms + (self.ttl_secs as i64) * 1000
    }

    /// Concrete config for this session: overlay over KB defaults.
    pub fn effective_config(&self, defaults: &EngineDefaults) -> EngineDefaults {
        self.overlay.resolve(defaults)
    }
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

pub struct SessionManager {
    sessions: Tree,
    /// Advisory lock registry keyed by `session_id`. A single process owns a
    /// KB, so in-process mutexes realize the per-session serialization.
    locks: DashMap<String, Arc<Mutex<()>>>,
    lock_timeout: Duration,
    defaults: EngineDefaults,
}

impl SessionManager {
    pub fn open(db: &sled::Db, defaults: EngineDefaults, lock_timeout: Duration) -> Result<Self> {
        Ok(Self {
            sessions: db.open_tree("sessions")?,
            locks: DashMap::new(),
            lock_timeout,
            defaults,
        })
    }

    fn key(session_id: &str) -> String {
        format!("{SESSION_KEY_PREFIX}{session_id}")
    }

    fn persist(&self, state: &SessionState) -> Result<()> {
        self.sessions.insert(
            Self::key(&state.session_id).as_bytes(),
            serde_json::to_vec(state)?,
        )?;
        Ok(())
    }

    /// Loads a live session; expired records are lazily removed and reported
    /// exactly like missing ones.
    fn load_live(&self, session_id: &str) -> Result<SessionState> {
        let bytes = self
            .sessions
            .get(Self::key(session_id).as_bytes())?
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        let state: SessionState = serde_json::from_slice(&bytes)?;
        if state.expired_at(now_ms()) {
            self.sessions.remove(Self::key(session_id).as_bytes())?;
            self.locks.remove(session_id);
            tracing::debug!(target: "presage::sessions", session_id, "expired session reaped");
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }
        Ok(state)
    }

    /// Allocates and persists a new session. Acquires no lock.
    pub fn create(
        &self,
        kb_id: &str,
        overlay: SessionOverlay,
        ttl_secs: Option<u64>,
    ) -> Result<SessionState> {
        overlay.validate()?;
        let now = now_ms();
        let effective = overlay.resolve(&self.defaults);
        let state = SessionState {
            session_id: Uuid::new_v4().to_string(),
            kb_id: kb_id.to_string(),
            stm: Stm::default(),
            overlay,
            pending_emotives: BTreeMap::new(),
            created_at_ms: now,
            last_access_ms: now,
            ttl_secs: ttl_secs.unwrap_or(effective.session_ttl),
        };
        self.persist(&state)?;
        tracing::info!(
            target: "presage::sessions",
            session_id = %state.session_id,
            kb_id,
            ttl_secs = state.ttl_secs,
            "session created"
        );
        Ok(state)
    }

    /// Reads a session. With auto-extend in effect, access refreshes the TTL.
    pub fn get(&self, session_id: &str) -> Result<SessionState> {
        let mut state = self.load_live(session_id)?;
        if state.effective_config(&self.defaults).session_auto_extend {
            state.last_access_ms = now_ms();
            self.persist(&state)?;
        }
        Ok(state)
    }

    /// Runs `f` with exclusive ownership of the session's state. The closure
    /// returns the successor state and a result; the successor is persisted in
    /// a single terminal write before the lock is released. Lock acquisition
    /// is bounded; on timeout the caller gets `SessionBusy`.
    pub async fn with_exclusive<T>(
        &self,
        session_id: &str,
        f: impl FnOnce(SessionState, &EngineDefaults) -> Result<(SessionState, T)>,
    ) -> Result<T> {
        let cell = self
            .locks
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();
        let _guard = tokio::time::timeout(self.lock_timeout, cell.lock())
            .await
            .map_err(|_| EngineError::SessionBusy(session_id.to_string()))?;

        let state = self.load_live(session_id)?;
        let auto_extend = state.effective_config(&self.defaults).session_auto_extend;
        let (mut next, out) = f(state, &self.defaults)?;
        if auto_extend {
            next.last_access_ms = now_ms();
        }
        self.persist(&next)?;
        Ok(out)
    }

    /// Removes the session state and its lock record.
    pub fn delete(&self, session_id: &str) -> Result<()> {
        let removed = self
            .sessions
            .remove(Self::key(session_id).as_bytes())?
            .is_some();
        self.locks.remove(session_id);
        if !removed {
            return Err(EngineError::SessionNotFound(session_id.to_string()));
        }
        tracing::info!(target: "presage::sessions", session_id, "session deleted");
        Ok(())
    }

    /// Live session count.
    pub fn count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Ids of all live sessions.
    pub fn list(&self) -> Result<Vec<String>> {
        let now = now_ms();
        let mut out = Vec::new();
        for item in self.sessions.scan_prefix(SESSION_KEY_PREFIX.as_bytes()) {
            let (_, value) = item?;
            let state: SessionState = serde_json::from_slice(&value)?;
            if !state.expired_at(now) {
                out.push(state.session_id);
            }
        }
        Ok(out)
    }

    /// Reaps expired session records. Correctness only needs lazy expiry; this
    /// keeps the tree from accumulating dead state.
    pub fn sweep_expired(&self) -> Result<usize> {
        let now = now_ms();
        let mut reaped = 0usize;
        for item in self.sessions.scan_prefix(SESSION_KEY_PREFIX.as_bytes()) {
            let (key, value) = item?;
            let state: SessionState = serde_json::from_slice(&value)?;
            if state.expired_at(now) {
                self.sessions.remove(key)?;
                self.locks.remove(&state.session_id);
                reaped += 1;
            }
        }
        if reaped > 0 {
            tracing::debug!(target: "presage::sessions", reaped, "expired sessions swept");
        }
        Ok(reaped)
    }
}
