//! # Pipeline Coordinator
//!
//! Turns a stream of camera frames into translated text without letting
//! work pile up behind a slow model.
//!
//! ## Admission:
//! - Frames are routed to a **lane** per target language
//! - `latest-wins`: a new frame supersedes whatever the lane still has in
//!   flight; `queue-all`: frames wait their turn
//! - Frames older than the lane's last admitted sequence are dropped
//!
//! ## Execution:
//! - At most one pass runs per lane, in admission order; lanes run
//!   concurrently
//! - Stage calls draw on one bounded worker pool shared by every pipeline
//!   built from the same [`PipelineServices`]
//! - Every pass has a deadline measured from lane entry
//!
//! ## Delivery:
//! - Outcomes reach the [`ResultSink`] strictly in admission order

pub mod coordinator;
pub mod pass;
pub mod sink;
pub mod stats;

pub use coordinator::{Admission, Pipeline};
pub use pass::{ErrorKind, PassContext, PassError, PassOutcome, PassState, Terminal};
pub use sink::{ChannelSink, ResultSink, SinkEvent};
pub use stats::{PipelineStats, PipelineStatsSnapshot};

use crate::cache::ResultCache;
use crate::language::{LanguageTag, SourceLanguage};
use crate::models::ModelRegistry;
use crate::stages::detection::DEFAULT_AMBIGUITY_MARGIN;
use crate::stages::{LanguageIdentifier, TextRecognizer, Translator};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AdmissionPolicy {
    #[default]
    LatestWins,
    QueueAll,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("pipeline must be created inside a Tokio runtime")]
    NoRuntime,

    #[error("invalid pipeline configuration: {0}")]
    InvalidConfig(String),
}

/// Per-pipeline settings.
///
/// Cache capacity and the stage worker pool belong to [`PipelineServices`]
/// and are sized once for the whole server, so they have no field here and
/// a document carrying them is refused.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PipelineConfig {
    pub target_language: LanguageTag,
    #[serde(default)]
    pub source_language: SourceLanguage,
    pub per_pass_timeout_ms: u64,
    #[serde(default)]
    pub admission_policy: AdmissionPolicy,
    pub ambiguity_margin: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            target_language: LanguageTag::parse("en").unwrap_or_else(|_| LanguageTag::undetermined()),
            source_language: SourceLanguage::Auto,
            per_pass_timeout_ms: 5_000,
            admission_policy: AdmissionPolicy::LatestWins,
            ambiguity_margin: DEFAULT_AMBIGUITY_MARGIN,
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), PipelineError> {
        if self.target_language.is_undetermined() {
            return Err(PipelineError::InvalidConfig(
                "target language must be a concrete language".to_string(),
            ));
        }
        if self.per_pass_timeout_ms == 0 {
            return Err(PipelineError::InvalidConfig(
                "per_pass_timeout_ms must be greater than 0".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ambiguity_margin) {
            return Err(PipelineError::InvalidConfig(
                "ambiguity_margin must be between 0.0 and 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn per_pass_timeout(&self) -> Duration {
        Duration::from_millis(self.per_pass_timeout_ms)
    }
}

/// Worker pool size: `requested`, or the available parallelism for 0, never below 2.
pub fn stage_worker_count(requested: usize) -> usize {
    let requested = match requested {
        0 => std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2),
        n => n,
    };
    requested.max(2)
}

/// Collaborators a pipeline runs against. Cheap to clone; every pipeline
/// built from the same services shares one registry, one cache and one
/// stage worker pool.
#[derive(Clone)]
pub struct PipelineServices {
    pub recognizer: Arc<dyn TextRecognizer>,
    pub identifier: Arc<dyn LanguageIdentifier>,
    pub translator: Arc<dyn Translator>,
    pub registry: ModelRegistry,
    pub cache: Arc<ResultCache>,
    pub workers: Arc<Semaphore>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.admission_policy, AdmissionPolicy::LatestWins);
        assert!(stage_worker_count(0) >= 2);
    }

    #[test]
    fn test_config_rejects_out_of_range_values() {
        let mut config = PipelineConfig::default();
        config.ambiguity_margin = 1.5;
        assert!(config.validate().is_err());

        let mut config = PipelineConfig::default();
        config.per_pass_timeout_ms = 0;
        assert!(config.validate().is_err());

        assert_eq!(stage_worker_count(1), 2);
        assert_eq!(stage_worker_count(6), 6);
    }

    #[test]
    fn test_server_wide_sizing_is_refused_per_pipeline() {
        let per_session = r#"{"target_language": "fr", "per_pass_timeout_ms": 800, "ambiguity_margin": 0.1}"#;
        let config: PipelineConfig = serde_json::from_str(per_session).unwrap();
        assert_eq!(config.target_language.as_str(), "fr");

        let with_cache = r#"{"target_language": "fr", "per_pass_timeout_ms": 800, "ambiguity_margin": 0.1, "max_cache_entries": 5}"#;
        assert!(serde_json::from_str::<PipelineConfig>(with_cache).is_err());

        let with_workers = r#"{"target_language": "fr", "per_pass_timeout_ms": 800, "ambiguity_margin": 0.1, "stage_workers": 8}"#;
        assert!(serde_json::from_str::<PipelineConfig>(with_workers).is_err());
    }

    #[test]
    fn test_admission_policy_wire_names() {
        assert_eq!(
            serde_json::to_string(&AdmissionPolicy::QueueAll).unwrap(),
            "\"queue-all\""
        );
        let policy: AdmissionPolicy = serde_json::from_str("\"latest-wins\"").unwrap();
        assert_eq!(policy, AdmissionPolicy::LatestWins);
    }
}
