//! # Configuration Management
//!
//! Application settings layered from several sources:
//! - Default values (built into the code)
//! - `config.toml` in the working directory
//! - Environment variables with the `APP_` prefix and `__` between levels
//!
//! ## Configuration Priority (highest to lowest):
//! 1. `HOST` / `PORT` (deployment platforms set these)
//! 2. Environment variables (`APP_SERVER__PORT`, `APP_PIPELINE__TARGET_LANGUAGE`, ...)
//! 3. Configuration file (`config.toml`)
//! 4. Default values (defined in the Default impl)

use crate::frame::ENVELOPE_HEADER_LEN;
use crate::language::{LanguageTag, SourceLanguage};
use crate::models::RegistryConfig;
use crate::pipeline::{stage_worker_count, AdmissionPolicy, PipelineConfig};
use crate::stages::detection::DEFAULT_AMBIGUITY_MARGIN;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub pipeline: PipelineSettings,
    pub models: ModelsConfig,
    pub cache: CacheConfig,
    pub performance: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Defaults for every camera session's pipeline.
///
/// Languages are kept as strings here so a bad value surfaces as a
/// validation error with context instead of a deserialization failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSettings {
    pub target_language: String,
    /// `"auto"` or a language tag
    pub source_language: String,
    /// Server-wide: one result cache serves every session
    pub max_cache_entries: usize,
    pub per_pass_timeout_ms: u64,
    pub admission_policy: AdmissionPolicy,
    pub ambiguity_margin: f32,
    /// Server-wide stage worker pool; 0 uses the available parallelism (minimum 2)
    pub stage_workers: usize,
}

/// Where translation models live and how much of them may stay resident.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsConfig {
    pub store_dir: String,
    /// Hugging Face repository holding `<src>-<tgt>.toml` phrasebooks; empty disables downloads
    pub remote_repo: String,
    pub allow_download: bool,
    pub memory_budget_mb: usize,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// JSON snapshot of the result cache; empty keeps the cache memory-only
    pub snapshot_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub max_concurrent_sessions: usize,
    /// Largest accepted frame envelope, header included
    pub max_frame_bytes: usize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8080,
            },
            pipeline: PipelineSettings {
                target_language: "en".to_string(),
                source_language: "auto".to_string(),
                max_cache_entries: 500,
                per_pass_timeout_ms: 5_000,
                admission_policy: AdmissionPolicy::LatestWins,
                ambiguity_margin: DEFAULT_AMBIGUITY_MARGIN,
                stage_workers: 0,
            },
            models: ModelsConfig {
                store_dir: "models".to_string(),
                remote_repo: String::new(),
                allow_download: false,
                memory_budget_mb: 512,
                max_consecutive_failures: 3,
            },
            cache: CacheConfig {
                snapshot_path: "data/cache.json".to_string(),
            },
            performance: PerformanceConfig {
                max_concurrent_sessions: 10,
                max_frame_bytes: 8 * 1024 * 1024,
            },
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }
        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings
            .build()?
            .try_deserialize()
            .context("invalid configuration")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("Server port cannot be 0"));
        }

        self.pipeline_config()?;
        if self.pipeline.max_cache_entries == 0 {
            return Err(anyhow::anyhow!("max_cache_entries must be greater than 0"));
        }

        if self.models.memory_budget_mb == 0 {
            return Err(anyhow::anyhow!("Model memory budget must be greater than 0"));
        }
        if self.models.max_consecutive_failures == 0 {
            return Err(anyhow::anyhow!("max_consecutive_failures must be greater than 0"));
        }
        if self.performance.max_concurrent_sessions == 0 {
            return Err(anyhow::anyhow!("Max concurrent sessions must be greater than 0"));
        }
        if self.performance.max_frame_bytes <= ENVELOPE_HEADER_LEN {
            return Err(anyhow::anyhow!(
                "max_frame_bytes must exceed the {}-byte frame header",
                ENVELOPE_HEADER_LEN
            ));
        }

        Ok(())
    }

    /// The core pipeline configuration these settings describe.
    pub fn pipeline_config(&self) -> Result<PipelineConfig> {
        let settings = &self.pipeline;
        let target_language = LanguageTag::parse(&settings.target_language)
            .with_context(|| format!("invalid target language '{}'", settings.target_language))?;
        let source_language: SourceLanguage = settings
            .source_language
            .parse()
            .with_context(|| format!("invalid source language '{}'", settings.source_language))?;

        let config = PipelineConfig {
            target_language,
            source_language,
            per_pass_timeout_ms: settings.per_pass_timeout_ms,
            admission_policy: settings.admission_policy,
            ambiguity_margin: settings.ambiguity_margin,
        };
        config.validate()?;
        Ok(config)
    }

    /// Size of the stage worker pool shared by every session.
    pub fn stage_workers(&self) -> usize {
        stage_worker_count(self.pipeline.stage_workers)
    }

    pub fn registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            memory_budget_bytes: self.models.memory_budget_mb * 1024 * 1024,
            max_consecutive_failures: self.models.max_consecutive_failures,
        }
    }

    pub fn snapshot_path(&self) -> Option<PathBuf> {
        let path = self.cache.snapshot_path.trim();
        (!path.is_empty()).then(|| PathBuf::from(path))
    }

    /// Apply a partial JSON update such as `{"pipeline": {"target_language": "de"}}`.
    ///
    /// Settings read only at startup (store location, cache size, snapshot
    /// path) can be changed here but take effect on the next restart.
    pub fn update_from_json(&mut self, json_str: &str) -> Result<()> {
        let partial: serde_json::Value = serde_json::from_str(json_str)?;

        if let Some(server) = partial.get("server") {
            if let Some(host) = server.get("host").and_then(|v| v.as_str()) {
                self.server.host = host.to_string();
            }
            if let Some(port) = server.get("port").and_then(|v| v.as_u64()) {
                self.server.port = u16::try_from(port).context("port out of range")?;
            }
        }

        if let Some(pipeline) = partial.get("pipeline") {
            let settings = &mut self.pipeline;
            if let Some(target) = pipeline.get("target_language").and_then(|v| v.as_str()) {
                settings.target_language = target.to_string();
            }
            if let Some(source) = pipeline.get("source_language").and_then(|v| v.as_str()) {
                settings.source_language = source.to_string();
            }
            if let Some(entries) = pipeline.get("max_cache_entries").and_then(|v| v.as_u64()) {
                settings.max_cache_entries = entries as usize;
            }
            if let Some(timeout) = pipeline.get("per_pass_timeout_ms").and_then(|v| v.as_u64()) {
                settings.per_pass_timeout_ms = timeout;
            }
            if let Some(policy) = pipeline.get("admission_policy") {
                settings.admission_policy = serde_json::from_value(policy.clone())?;
            }
            if let Some(margin) = pipeline.get("ambiguity_margin").and_then(|v| v.as_f64()) {
                settings.ambiguity_margin = margin as f32;
            }
            if let Some(workers) = pipeline.get("stage_workers").and_then(|v| v.as_u64()) {
                settings.stage_workers = workers as usize;
            }
        }

        if let Some(models) = partial.get("models") {
            if let Some(dir) = models.get("store_dir").and_then(|v| v.as_str()) {
                self.models.store_dir = dir.to_string();
            }
            if let Some(repo) = models.get("remote_repo").and_then(|v| v.as_str()) {
                self.models.remote_repo = repo.to_string();
            }
            if let Some(allow) = models.get("allow_download").and_then(|v| v.as_bool()) {
                self.models.allow_download = allow;
            }
            if let Some(budget) = models.get("memory_budget_mb").and_then(|v| v.as_u64()) {
                self.models.memory_budget_mb = budget as usize;
            }
            if let Some(failures) = models.get("max_consecutive_failures").and_then(|v| v.as_u64()) {
                self.models.max_consecutive_failures = failures as u32;
            }
        }

        if let Some(path) = partial
            .get("cache")
            .and_then(|c| c.get("snapshot_path"))
            .and_then(|v| v.as_str())
        {
            self.cache.snapshot_path = path.to_string();
        }

        if let Some(performance) = partial.get("performance") {
            if let Some(sessions) = performance.get("max_concurrent_sessions").and_then(|v| v.as_u64()) {
                self.performance.max_concurrent_sessions = sessions as usize;
            }
            if let Some(bytes) = performance.get("max_frame_bytes").and_then(|v| v.as_u64()) {
                self.performance.max_frame_bytes = bytes as usize;
            }
        }

        self.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 8080);
        assert!(config.validate().is_ok());

        let pipeline = config.pipeline_config().unwrap();
        assert_eq!(pipeline.target_language.as_str(), "en");
        assert_eq!(pipeline.source_language, SourceLanguage::Auto);
        assert_eq!(config.registry_config().memory_budget_bytes, 512 * 1024 * 1024);
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.server.port = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.target_language = "not a tag".to_string();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.ambiguity_margin = -0.1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.performance.max_frame_bytes = 10;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.pipeline.max_cache_entries = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_update() {
        let mut config = AppConfig::default();
        let json = r#"{"server": {"port": 9090}, "pipeline": {"target_language": "fr_ca", "admission_policy": "queue-all"}}"#;
        assert!(config.update_from_json(json).is_ok());
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "127.0.0.1");

        let pipeline = config.pipeline_config().unwrap();
        assert_eq!(pipeline.target_language.as_str(), "fr-CA");
        assert_eq!(pipeline.admission_policy, AdmissionPolicy::QueueAll);
    }

    #[test]
    fn test_rejected_update_reports_error() {
        let mut config = AppConfig::default();
        let json = r#"{"pipeline": {"per_pass_timeout_ms": 0}}"#;
        assert!(config.update_from_json(json).is_err());
    }

    #[test]
    fn test_empty_snapshot_path_disables_persistence() {
        let mut config = AppConfig::default();
        assert_eq!(config.snapshot_path(), Some(PathBuf::from("data/cache.json")));
        config.cache.snapshot_path = "  ".to_string();
        assert_eq!(config.snapshot_path(), None);
    }
}
