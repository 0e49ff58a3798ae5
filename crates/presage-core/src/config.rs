//! Engine and gateway configuration. Load from TOML or env:
//! defaults, then an optional file, then `PRESAGE__`-prefixed env overrides.

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Post-learn STM behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StmMode {
    /// Empty the STM after a learn.
    #[default]
    #[serde(rename = "CLEAR")]
    Clear,
    /// Retain a sliding window of the last `max_pattern_length - 1` events.
    #[serde(rename = "ROLLING")]
    Rolling,
}

/// Which metric names the prediction sort key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RankMetric {
    Similarity,
    Evidence,
    Frequency,
    Fragmentation,
    Snr,
    Confidence,
    NormalizedEntropy,
    GlobalNormalizedEntropy,
    ItfdfSimilarity,
    Confluence,
    PredictiveInformation,
    #[default]
    Potential,
}

/// Per-KB engine defaults. A session overlay may override any of these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineDefaults {
    /// 0 = manual learn only; >0 = auto-learn when the STM reaches this length.
    #[serde(default)]
    pub max_pattern_length: usize,
    #[serde(default)]
    pub stm_mode: StmMode,
    /// Ring length for per-emotive history per pattern.
    #[serde(default = "default_persistence")]
    pub persistence: usize,
    /// Minimum alignment similarity for a prediction to be returned.
    #[serde(default = "default_recall_threshold")]
    pub recall_threshold: f64,
    /// Cap on the prediction result list.
    #[serde(default = "default_max_predictions")]
    pub max_predictions: usize,
    /// Sort symbols within events. Disabling breaks content-addressed identity.
    #[serde(default = "default_true")]
    pub sort: bool,
    /// Disable to run observation-only.
    #[serde(default = "default_true")]
    pub process_predictions: bool,
    /// Token-level (slower, exact) vs character-level similarity.
    #[serde(default)]
    pub use_token_matching: bool,
    #[serde(default)]
    pub rank_sort_algo: RankMetric,
    /// Session TTL in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl: u64,
    /// Refresh the TTL on each access.
    #[serde(default = "default_true")]
    pub session_auto_extend: bool,
}

fn default_persistence() -> usize {
    5
}
fn default_recall_threshold() -> f64 {
    0.1
}
fn default_max_predictions() -> usize {
    100
}
fn default_session_ttl() -> u64 {
    3600
}
fn default_true() -> bool {
    true
}

impl Default for EngineDefaults {
    fn default() -> Self {
        Self {
            max_pattern_length: 0,
            stm_mode: StmMode::Clear,
            persistence: default_persistence(),
            recall_threshold: default_recall_threshold(),
            max_predictions: default_max_predictions(),
            sort: true,
            process_predictions: true,
            use_token_matching: false,
            rank_sort_algo: RankMetric::Potential,
            session_ttl: default_session_ttl(),
            session_auto_extend: true,
        }
    }
}

/// Per-session configuration overlay. `None` means "inherit the KB default".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionOverlay {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_pattern_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stm_mode: Option<StmMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recall_threshold: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_predictions: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sort: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_predictions: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub use_token_matching: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rank_sort_algo: Option<RankMetric>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_ttl: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_auto_extend: Option<bool>,
}

impl SessionOverlay {
    /// Rejects out-of-range values with the offending field named.
    pub fn validate(&self) -> Result<()> {
        if let Some(t) = self.recall_threshold {
            if !(0.0..=1.0).contains(&t) || t.is_nan() {
                return Err(EngineError::InvalidConfig {
                    field: "recall_threshold",
                    reason: format!("must be within [0.0, 1.0], got {t}"),
                });
            }
        }
        if let Some(p) = self.persistence {
            if p == 0 {
                return Err(EngineError::InvalidConfig {
                    field: "persistence",
                    reason: "must be at least 1".into(),
                });
            }
        }
        if let Some(m) = self.max_predictions {
            if m == 0 {
                return Err(EngineError::InvalidConfig {
                    field: "max_predictions",
                    reason: "must be at least 1".into(),
                });
            }
        }
        if let Some(t) = self.session_ttl {
            if t == 0 {
                return Err(EngineError::InvalidConfig {
                    field: "session_ttl",
                    reason: "must be at least 1 second".into(),
                });
            }
        }
        Ok(())
    }

    /// Folds later overrides into this overlay (later wins per field).
    pub fn merged_with(&self, later: &SessionOverlay) -> SessionOverlay {
        macro_rules! pick {
            ($field:ident) => {
                later.$field.or(self.$field)
            };
        }
        SessionOverlay {
            max_pattern_length: pick!(max_pattern_length),
            stm_mode: pick!(stm_mode),
            persistence: pick!(persistence),
            recall_threshold: pick!(recall_threshold),
            max_predictions: pick!(max_predictions),
            sort: pick!(sort),
            process_predictions: pick!(process_predictions),
            use_token_matching: pick!(use_token_matching),
            rank_sort_algo: pick!(rank_sort_algo),
            session_ttl: pick!(session_ttl),
            session_auto_extend: pick!(session_auto_extend),
        }
    }

    /// Resolves the overlay against KB defaults into a concrete config.
    pub fn resolve(&self, defaults: &EngineDefaults) -> EngineDefaults {
        EngineDefaults {
            max_pattern_length: self.max_pattern_length.unwrap_or(defaults.max_pattern_length),
            stm_mode: self.stm_mode.unwrap_or(defaults.stm_mode),
            persistence: self.persistence.unwrap_or(defaults.persistence),
            recall_threshold: self.recall_threshold.unwrap_or(defaults.recall_threshold),
            max_predictions: self.max_predictions.unwrap_or(defaults.max_predictions),
            sort: self.sort.unwrap_or(defaults.sort),
            process_predictions: self
                .process_predictions
                .unwrap_or(defaults.process_predictions),
            use_token_matching: self
                .use_token_matching
                .unwrap_or(defaults.use_token_matching),
            rank_sort_algo: self.rank_sort_algo.unwrap_or(defaults.rank_sort_algo),
            session_ttl: self.session_ttl.unwrap_or(defaults.session_ttl),
            session_auto_extend: self
                .session_auto_extend
                .unwrap_or(defaults.session_auto_extend),
        }
    }
}

/// Process-wide configuration (gateway identity + storage + timeouts + engine defaults).
/// Immutable after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Application identity shown by `/v1/status`.
    pub app_name: String,
    /// HTTP port for the gateway.
    pub port: u16,
    /// Base directory for the sled database.
    pub storage_path: String,
    /// Per-session lock acquisition timeout; on expiry the caller gets `SessionBusy`.
    pub lock_timeout_secs: u64,
    /// End-to-end request timeout enforced by the transport layer.
    pub request_timeout_secs: u64,
    /// Per-KB engine defaults; sessions may overlay them.
    #[serde(default)]
    pub engine: EngineDefaults,
}

impl CoreConfig {
    /// Load config from file and environment.
    /// Precedence: env `PRESAGE_CONFIG` path > `config/presage.toml` > defaults.
    pub fn load() -> std::result::Result<Self, config::ConfigError> {
        let config_path =
            std::env::var("PRESAGE_CONFIG").unwrap_or_else(|_| "config/presage".to_string());
        let builder = config::Config::builder()
            .set_default("app_name", "Presage Gateway")?
            .set_default("port", 8420_i64)?
            .set_default("storage_path", "./data")?
            .set_default("lock_timeout_secs", 5_i64)?
            .set_default("request_timeout_secs", 30_i64)?;

        let path = Path::new(&config_path);
        let builder = if path.exists() {
            builder.add_source(config::File::from(path))
        } else {
            builder
        };

        let built = builder
            .add_source(config::Environment::with_prefix("PRESAGE").separator("__"))
            .build()?;

        built.try_deserialize()
    }
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            app_name: "Presage Gateway".to_string(),
            port: 8420,
            storage_path: "./data".to_string(),
            lock_timeout_secs: 5,
            request_timeout_secs: 30,
            engine: EngineDefaults::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_resolves_against_defaults() {
        let defaults = EngineDefaults::default();
        let overlay = SessionOverlay {
            max_pattern_length: Some(3),
            recall_threshold: Some(0.5),
            ..Default::default()
        };
        let cfg = overlay.resolve(&defaults);
        assert_eq!(cfg.max_pattern_length, 3);
        assert_eq!(cfg.recall_threshold, 0.5);
        assert_eq!(cfg.persistence, 5);
        assert_eq!(cfg.max_predictions, 100);
        assert_eq!(cfg.stm_mode, StmMode::Clear);
    }

    #[test]
    fn overlay_merge_is_last_writer_wins_per_field() {
        let first = SessionOverlay {
            persistence: Some(7),
            recall_threshold: Some(0.2),
            ..Default::default()
        };
        let second = SessionOverlay {
            recall_threshold: Some(0.9),
            ..Default::default()
        };
        let merged = first.merged_with(&second);
        assert_eq!(merged.persistence, Some(7));
        assert_eq!(merged.recall_threshold, Some(0.9));
    }

    #[test]
    fn out_of_range_overlay_values_are_rejected() {
        let bad = SessionOverlay {
            recall_threshold: Some(1.5),
            ..Default::default()
        };
        assert!(matches!(
            bad.validate(),
            Err(EngineError::InvalidConfig { field: "recall_threshold", .. })
        ));
        let bad = SessionOverlay {
            persistence: Some(0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
        let bad = SessionOverlay {
            session_ttl: Some(0),
            ..Default::default()
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn stm_mode_wire_names_are_upper_case() {
        assert_eq!(serde_json::to_string(&StmMode::Clear).unwrap(), "\"CLEAR\"");
        assert_eq!(
            serde_json::from_str::<StmMode>("\"ROLLING\"").unwrap(),
            StmMode::Rolling
        );
    }

    #[test]
    fn rank_metric_wire_names_are_snake_case() {
        assert_eq!(
            serde_json::to_string(&RankMetric::ItfdfSimilarity).unwrap(),
            "\"itfdf_similarity\""
        );
        assert_eq!(
            serde_json::from_str::<RankMetric>("\"predictive_information\"").unwrap(),
            RankMetric::PredictiveInformation
        );
    }
}
