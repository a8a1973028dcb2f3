//! # Camera Session Management
//!
//! One session per connected camera client. A session owns its own
//! [`Pipeline`] (admission lanes, remembered source language, displayed
//! result) while the model registry, result cache and capability providers
//! are shared by every session through [`PipelineServices`].
//!
//! ## Session Lifecycle:
//! 1. **Active**: frames are being admitted
//! 2. **AwaitingLanguage**: detection was ambiguous; frames still flow but
//!    the client should answer with a source language
//! 3. **Ended**: pipeline shut down, counters folded into the manager totals

use crate::frame::Frame;
use crate::language::{LanguageTag, SourceLanguage};
use crate::pipeline::{
    Admission, Pipeline, PipelineConfig, PipelineError, PipelineServices, PipelineStatsSnapshot,
    ResultSink,
};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    AwaitingLanguage,
    Ended,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Active => "active",
            SessionStatus::AwaitingLanguage => "awaiting_language",
            SessionStatus::Ended => "ended",
        }
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("maximum concurrent sessions ({0}) reached")]
    LimitReached(usize),

    #[error("session id '{0}' already exists")]
    DuplicateId(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub struct CameraSession {
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pipeline: Pipeline,
    status: RwLock<SessionStatus>,
    frames_received: AtomicU64,
    bytes_received: AtomicU64,
    rejected_frames: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub status: SessionStatus,
    pub target_language: LanguageTag,
    pub source_language: SourceLanguage,
    pub created_at: DateTime<Utc>,
    pub duration_seconds: f64,
    pub frames_received: u64,
    pub bytes_received: u64,
    pub rejected_frames: u64,
    pub pipeline: PipelineStatsSnapshot,
}

impl CameraSession {
    fn new(session_id: String, pipeline: Pipeline) -> Self {
        Self {
            session_id,
            created_at: Utc::now(),
            pipeline,
            status: RwLock::new(SessionStatus::Active),
            frames_received: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            rejected_frames: AtomicU64::new(0),
        }
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.read()
    }

    pub fn set_status(&self, status: SessionStatus) {
        let mut current = self.status.write();
        if *current != SessionStatus::Ended {
            *current = status;
        }
    }

    /// Hand a decoded frame to the pipeline.
    pub fn submit(&self, frame: Frame, envelope_bytes: usize) -> Admission {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(envelope_bytes as u64, Ordering::Relaxed);
        self.pipeline.submit(frame)
    }

    /// Count a frame that never reached the pipeline (bad envelope, oversized).
    pub fn record_rejected(&self, envelope_bytes: usize) {
        self.rejected_frames.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(envelope_bytes as u64, Ordering::Relaxed);
    }

    /// Answer an ambiguous-detection prompt. Applies to every target the
    /// session translates into.
    pub fn resolve_language(&self, source: LanguageTag) {
        self.pipeline.resolve_source_language(source);
        self.set_status(SessionStatus::Active);
    }

    pub fn duration_seconds(&self) -> f64 {
        let duration = Utc::now().signed_duration_since(self.created_at);
        duration.num_milliseconds() as f64 / 1000.0
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id.clone(),
            status: self.status(),
            target_language: self.pipeline.target_language(),
            source_language: self.pipeline.source_language(),
            created_at: self.created_at,
            duration_seconds: self.duration_seconds(),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            rejected_frames: self.rejected_frames.load(Ordering::Relaxed),
            pipeline: self.pipeline.stats(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionManagerSummary {
    pub total_sessions: usize,
    pub max_sessions: usize,
    pub status_counts: HashMap<String, usize>,
    pub sessions: Vec<SessionSummary>,
}

/// Tracks live camera sessions and enforces the concurrency limit.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<CameraSession>>>,
    max_concurrent_sessions: AtomicUsize,
    services: PipelineServices,
    /// Counters of sessions that already ended
    retired: Mutex<PipelineStatsSnapshot>,
}

impl SessionManager {
    pub fn new(max_concurrent_sessions: usize, services: PipelineServices) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_concurrent_sessions: AtomicUsize::new(max_concurrent_sessions),
            services,
            retired: Mutex::new(PipelineStatsSnapshot::default()),
        }
    }

    pub fn services(&self) -> &PipelineServices {
        &self.services
    }

    pub fn set_max_sessions(&self, max: usize) {
        self.max_concurrent_sessions.store(max, Ordering::Relaxed);
    }

    /// Start a session with its own pipeline. Must run inside the Tokio runtime.
    pub fn create_session(
        &self,
        session_id: Option<String>,
        config: PipelineConfig,
        sink: Arc<dyn ResultSink>,
    ) -> Result<Arc<CameraSession>, SessionError> {
        let mut sessions = self.sessions.write();

        let max = self.max_concurrent_sessions.load(Ordering::Relaxed);
        if sessions.len() >= max {
            return Err(SessionError::LimitReached(max));
        }

        let session_id = session_id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        if sessions.contains_key(&session_id) {
            return Err(SessionError::DuplicateId(session_id));
        }

        let pipeline = Pipeline::new(config, self.services.clone(), sink)?;
        let session = Arc::new(CameraSession::new(session_id.clone(), pipeline));
        sessions.insert(session_id.clone(), session.clone());

        tracing::info!(session = %session_id, active = sessions.len(), "Camera session started");
        Ok(session)
    }

    pub fn get_session(&self, session_id: &str) -> Option<Arc<CameraSession>> {
        self.sessions.read().get(session_id).cloned()
    }

    /// Remove a session, drain its pipeline and keep its counters.
    pub async fn end_session(&self, session_id: &str) -> bool {
        let removed = self.sessions.write().remove(session_id);
        let Some(session) = removed else {
            return false;
        };

        session.set_status(SessionStatus::Ended);
        session.pipeline.shutdown().await;
        self.retired.lock().merge(&session.pipeline.stats());
        *session.status.write() = SessionStatus::Ended;

        tracing::info!(
            session = %session_id,
            duration_seconds = session.duration_seconds(),
            "Camera session ended"
        );
        true
    }

    pub async fn end_all(&self) {
        let ids = self.active_session_ids();
        for id in ids {
            self.end_session(&id).await;
        }
    }

    pub fn active_session_count(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn active_session_ids(&self) -> Vec<String> {
        self.sessions.read().keys().cloned().collect()
    }

    /// Pipeline counters across ended and live sessions.
    pub fn pipeline_totals(&self) -> PipelineStatsSnapshot {
        let mut totals = self.retired.lock().clone();
        for session in self.sessions.read().values() {
            totals.merge(&session.pipeline.stats());
        }
        totals
    }

    pub fn summary(&self) -> SessionManagerSummary {
        let sessions = self.sessions.read();
        let mut status_counts = HashMap::new();
        let mut summaries = Vec::with_capacity(sessions.len());

        for session in sessions.values() {
            let summary = session.summary();
            *status_counts
                .entry(summary.status.as_str().to_string())
                .or_insert(0) += 1;
            summaries.push(summary);
        }
        summaries.sort_by(|a, b| a.created_at.cmp(&b.created_at));

        SessionManagerSummary {
            total_sessions: sessions.len(),
            max_sessions: self.max_concurrent_sessions.load(Ordering::Relaxed),
            status_counts,
            sessions: summaries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ChannelSink, SinkEvent, Terminal};
    use crate::testkit::{builtin_services, events_through, fr_config, text_frame, CountingProvisioner};

    fn manager(max: usize) -> SessionManager {
        SessionManager::new(max, builtin_services(Arc::new(CountingProvisioner::new())))
    }

    fn sink() -> (Arc<dyn ResultSink>, tokio::sync::mpsc::UnboundedReceiver<SinkEvent>) {
        let (sink, rx) = ChannelSink::new();
        (Arc::new(sink), rx)
    }

    #[tokio::test]
    async fn test_session_limit_and_duplicates() {
        let manager = manager(2);

        let first = manager
            .create_session(Some("cam-1".into()), fr_config(), sink().0)
            .unwrap();
        assert_eq!(first.session_id, "cam-1");
        assert!(matches!(
            manager.create_session(Some("cam-1".into()), fr_config(), sink().0),
            Err(SessionError::DuplicateId(_))
        ));

        let generated = manager.create_session(None, fr_config(), sink().0).unwrap();
        assert_eq!(generated.session_id.len(), 36);
        assert!(matches!(
            manager.create_session(None, fr_config(), sink().0),
            Err(SessionError::LimitReached(2))
        ));

        assert!(manager.end_session("cam-1").await);
        assert!(!manager.end_session("cam-1").await);
        assert_eq!(manager.active_session_count(), 1);
        assert_eq!(first.status(), SessionStatus::Ended);
    }

    #[tokio::test]
    async fn test_sessions_share_cache_and_keep_totals() {
        let manager = manager(4);
        let (sink_a, mut rx_a) = sink();
        let (sink_b, mut rx_b) = sink();
        let a = manager.create_session(None, fr_config(), sink_a).unwrap();
        let b = manager.create_session(None, fr_config(), sink_b).unwrap();

        a.submit(text_frame(1, "HELLO"), 64);
        let events = events_through(&mut rx_a, 1).await;
        assert!(events.contains(&SinkEvent::Terminal {
            frame_sequence: 1,
            terminal: Terminal::Published
        }));

        b.submit(text_frame(1, "HELLO"), 64);
        events_through(&mut rx_b, 1).await;
        assert_eq!(b.pipeline().stats().cache_hits, 1);

        manager.end_session(&a.session_id).await;
        let totals = manager.pipeline_totals();
        assert_eq!(totals.published, 2);
        assert_eq!(totals.cache_misses, 1);
        assert_eq!(manager.summary().total_sessions, 1);
        assert_eq!(a.summary().frames_received, 1);
    }
}
