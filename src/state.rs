//! # Application State Management
//!
//! State shared by every HTTP handler and WebSocket actor:
//!
//! - the live configuration (replaceable at runtime through `PUT /api/v1/config`)
//! - per-endpoint HTTP metrics recorded by the metrics middleware
//! - the camera [`SessionManager`] and, through it, the capability
//!   providers, model registry and result cache every session shares
//! - a text pipeline serving one-shot `POST /api/v1/translate` requests
//! - the optional cache snapshot store
//!
//! A snapshot that cannot be read at startup is moved aside; if that fails
//! too, the snapshot is left alone and not overwritten on shutdown.
//!
//! ## Locking:
//! `parking_lot` locks never poison, so readers take the lock, clone what
//! they need and release it before doing any I/O.

use crate::cache::{JsonFileStore, ResultCache};
use crate::config::AppConfig;
use crate::models::{ModelRegistry, PhrasebookProvisioner, PhrasebookTranslator};
use crate::pipeline::{PassError, Pipeline, PipelineServices, ResultSink};
use crate::session::SessionManager;
use crate::stages::{ScriptLanguageIdentifier, TextLayerRecognizer, TranslationResult};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RwLock<AppConfig>>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
    pub sessions: Arc<SessionManager>,
    /// Pipeline behind the JSON translate endpoint; it never receives frames
    pub text_pipeline: Arc<Pipeline>,
    pub snapshot_store: Option<Arc<JsonFileStore>>,
    /// Cleared when an unreadable snapshot could not be moved aside
    persist_snapshot: Arc<AtomicBool>,
}

/// HTTP request metrics collected by the metrics middleware.
#[derive(Debug, Default, Clone, Serialize)]
pub struct AppMetrics {
    pub request_count: u64,
    pub error_count: u64,
    /// Keyed by `"<METHOD> <route pattern>"`, e.g. `"GET /api/v1/models"`
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub max_duration_ms: u64,
    pub error_count: u64,
}

/// Sink of the text pipeline. Frames never reach it, so there is nothing to forward.
struct DiscardSink;

impl ResultSink for DiscardSink {
    fn on_result(&self, frame_sequence: u64, _result: TranslationResult) {
        tracing::debug!(frame = frame_sequence, "Text pipeline published a frame result");
    }

    fn on_error(&self, error: PassError) {
        tracing::debug!(kind = %error.kind, "Text pipeline reported an error");
    }
}

impl AppState {
    /// Build the shared services from `config`. Must run inside the Tokio runtime.
    pub fn new(config: AppConfig) -> Result<Self> {
        let pipeline_config = config.pipeline_config()?;

        let mut provisioner = PhrasebookProvisioner::new(&config.models.store_dir);
        let remote_repo = config.models.remote_repo.trim();
        if !remote_repo.is_empty() {
            let token = std::env::var("HF_TOKEN").ok();
            provisioner = provisioner.with_remote(remote_repo, token);
        }
        let provisioner = provisioner.allow_download(config.models.allow_download);

        let services = PipelineServices {
            recognizer: Arc::new(TextLayerRecognizer),
            identifier: Arc::new(ScriptLanguageIdentifier),
            translator: Arc::new(PhrasebookTranslator),
            registry: ModelRegistry::new(Arc::new(provisioner), config.registry_config()),
            cache: Arc::new(ResultCache::new(config.pipeline.max_cache_entries)),
            workers: Arc::new(Semaphore::new(config.stage_workers())),
        };

        let text_pipeline = Pipeline::new(pipeline_config, services.clone(), Arc::new(DiscardSink))
            .context("failed to start the text pipeline")?;
        let sessions = SessionManager::new(config.performance.max_concurrent_sessions, services);
        let snapshot_store = config
            .snapshot_path()
            .map(|path| Arc::new(JsonFileStore::new(path)));

        Ok(Self {
            config: Arc::new(RwLock::new(config)),
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
            sessions: Arc::new(sessions),
            text_pipeline: Arc::new(text_pipeline),
            snapshot_store,
            persist_snapshot: Arc::new(AtomicBool::new(true)),
        })
    }

    pub fn services(&self) -> &PipelineServices {
        self.sessions.services()
    }

    pub fn get_config(&self) -> AppConfig {
        self.config.read().clone()
    }

    /// Replace the configuration after validating it.
    ///
    /// Only the session limit applies immediately; pipeline defaults apply
    /// to sessions started afterwards.
    pub fn update_config(&self, new_config: AppConfig) -> Result<()> {
        new_config.validate()?;
        self.sessions
            .set_max_sessions(new_config.performance.max_concurrent_sessions);
        *self.config.write() = new_config;
        Ok(())
    }

    /// Load the cache snapshot, if persistence is configured.
    ///
    /// On failure the unreadable file is moved aside before the error is
    /// returned, so the service can start cold without losing it.
    pub async fn restore_cache(&self) -> Result<usize> {
        let Some(store) = &self.snapshot_store else {
            return Ok(0);
        };

        let err = match self.services().cache.load_from(store.as_ref()).await {
            Ok(restored) => {
                tracing::info!(entries = restored, path = %store.path().display(), "Result cache restored");
                return Ok(restored);
            }
            Err(err) => err,
        };

        match store.set_aside().await {
            Ok(Some(aside)) => tracing::warn!(
                path = %store.path().display(),
                moved_to = %aside.display(),
                "Unreadable cache snapshot moved aside"
            ),
            Ok(None) => {}
            Err(e) => {
                self.persist_snapshot.store(false, Ordering::SeqCst);
                tracing::error!(error = %e, "Cannot move unreadable cache snapshot; it will not be overwritten");
            }
        }
        Err(anyhow::Error::new(err)
            .context(format!("failed to load cache snapshot {}", store.path().display())))
    }

    /// End every session and write the cache snapshot.
    pub async fn shutdown(&self) -> Result<()> {
        self.sessions.end_all().await;
        self.text_pipeline.shutdown().await;

        if let Some(store) = &self.snapshot_store {
            if !self.persist_snapshot.load(Ordering::SeqCst) {
                tracing::warn!(path = %store.path().display(), "Skipping cache persist to keep the unreadable snapshot");
                return Ok(());
            }
            let persisted = self
                .services()
                .cache
                .persist_to(store.as_ref())
                .await
                .with_context(|| format!("failed to persist cache snapshot {}", store.path().display()))?;
            tracing::info!(entries = persisted, path = %store.path().display(), "Result cache persisted");
        }
        Ok(())
    }

    pub fn increment_request_count(&self) {
        self.metrics.write().request_count += 1;
    }

    pub fn increment_error_count(&self) {
        self.metrics.write().error_count += 1;
    }

    pub fn record_endpoint_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics.write();
        let metric = metrics
            .endpoint_metrics
            .entry(endpoint.to_string())
            .or_default();

        metric.request_count += 1;
        metric.total_duration_ms += duration_ms;
        metric.max_duration_ms = metric.max_duration_ms.max(duration_ms);
        if is_error {
            metric.error_count += 1;
        }
    }

    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics.read().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    /// Fraction of requests that failed, 0.0 to 1.0.
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::SourceLanguage;
    use crate::testkit::tag;

    fn test_config(dir: &std::path::Path) -> AppConfig {
        let mut config = AppConfig::default();
        config.models.store_dir = dir.join("models").display().to_string();
        config.cache.snapshot_path = dir.join("cache.json").display().to_string();
        config
    }

    fn write_phrasebook(dir: &std::path::Path) {
        let models = dir.join("models");
        std::fs::create_dir_all(&models).unwrap();
        std::fs::write(
            models.join("en-fr.toml"),
            "version = \"test-1\"\n\n[phrases]\nhello = \"bonjour\"\n",
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_endpoint_metrics() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path())).unwrap();

        state.record_endpoint_request("GET /health", 10, false);
        state.record_endpoint_request("GET /health", 30, true);

        let metrics = state.get_metrics_snapshot();
        let health = &metrics.endpoint_metrics["GET /health"];
        assert_eq!(health.request_count, 2);
        assert_eq!(health.max_duration_ms, 30);
        assert_eq!(health.average_duration_ms(), 20.0);
        assert_eq!(health.error_rate(), 0.5);
    }

    #[tokio::test]
    async fn test_config_update_adjusts_session_limit() {
        let dir = tempfile::tempdir().unwrap();
        let state = AppState::new(test_config(dir.path())).unwrap();

        let mut config = state.get_config();
        config.performance.max_concurrent_sessions = 3;
        state.update_config(config).unwrap();
        assert_eq!(state.sessions.summary().max_sessions, 3);

        let mut invalid = state.get_config();
        invalid.performance.max_concurrent_sessions = 0;
        assert!(state.update_config(invalid).is_err());
        assert_eq!(state.get_config().performance.max_concurrent_sessions, 3);
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        write_phrasebook(dir.path());

        let state = AppState::new(test_config(dir.path())).unwrap();
        let result = state
            .text_pipeline
            .translate_text("hello", SourceLanguage::Tag(tag("en")), tag("fr"))
            .await
            .unwrap();
        assert_eq!(result.translated_text, "bonjour");
        state.shutdown().await.unwrap();

        let restarted = AppState::new(test_config(dir.path())).unwrap();
        assert_eq!(restarted.restore_cache().await.unwrap(), 1);
        assert_eq!(restarted.services().cache.len(), 1);
    }

    #[tokio::test]
    async fn test_unreadable_snapshot_is_kept_aside() {
        let dir = tempfile::tempdir().unwrap();
        write_phrasebook(dir.path());
        let snapshot = dir.path().join("cache.json");
        std::fs::write(&snapshot, "{\"version\": 99, \"saved_at\": \"2024-01-01T00:00:00Z\", \"entries\": []}").unwrap();

        let state = AppState::new(test_config(dir.path())).unwrap();
        assert!(state.restore_cache().await.is_err());
        assert!(!snapshot.exists());

        let kept: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("cache.json.rejected-"))
            .collect();
        assert_eq!(kept.len(), 1);

        // The cold cache still persists to the normal location on shutdown.
        state
            .text_pipeline
            .translate_text("hello", SourceLanguage::Tag(tag("en")), tag("fr"))
            .await
            .unwrap();
        state.shutdown().await.unwrap();
        let restarted = AppState::new(test_config(dir.path())).unwrap();
        assert_eq!(restarted.restore_cache().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_server_wide_sizing_comes_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.pipeline.max_cache_entries = 7;
        config.pipeline.stage_workers = 3;

        let state = AppState::new(config).unwrap();
        assert_eq!(state.services().cache.stats().capacity, 7);
        assert_eq!(state.services().workers.available_permits(), 3);
    }
}
