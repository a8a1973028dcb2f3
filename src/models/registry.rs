//! # Model Registry
//!
//! Single owner of every loaded capability model. Stages borrow models
//! through reference-counted [`ModelHandle`]s and never load or free them
//! directly.
//!
//! ## Guarantees:
//! - **Single-flight loads**: at most one load per [`ModelKey`] is in
//!   flight; concurrent acquirers await that same load and see the same
//!   outcome, success or failure
//! - **Budgeted residency**: when resident models exceed the memory budget,
//!   idle models (zero references) are evicted least-recently-released first
//! - **In-use models stay**: a model with live handles is never evicted
//! - **Failed loads leave no trace** except a failure record; after
//!   `max_consecutive_failures` the key is reported as a standing condition
//!
//! ## State Transitions:
//! (absent) → Loading → Resident ⇄ Idle → (evicted)
//! Loading → (absent) on failure.

use crate::language::LanguagePair;
use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use serde::Serialize;
use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Abstract ML service a model provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    TextRecognition,
    LanguageId,
    Translation,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Capability::TextRecognition => "text_recognition",
            Capability::LanguageId => "language_id",
            Capability::Translation => "translation",
        };
        f.write_str(name)
    }
}

/// Identity of a loadable model: a capability, plus a language pair for
/// pair-specific capabilities such as translation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct ModelKey {
    pub capability: Capability,
    pub pair: Option<LanguagePair>,
}

impl ModelKey {
    pub fn translation(pair: LanguagePair) -> Self {
        Self {
            capability: Capability::Translation,
            pair: Some(pair),
        }
    }

    pub fn shared(capability: Capability) -> Self {
        Self {
            capability,
            pair: None,
        }
    }
}

impl fmt::Display for ModelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.pair {
            Some(pair) => write!(f, "{}:{}", self.capability, pair),
            None => write!(f, "{}", self.capability),
        }
    }
}

/// A model instance produced by a provisioner.
pub struct LoadedModel {
    pub version: String,
    pub footprint_bytes: usize,
    pub instance: Arc<dyn Any + Send + Sync>,
}

impl LoadedModel {
    pub fn new<T: Any + Send + Sync>(version: impl Into<String>, footprint_bytes: usize, instance: T) -> Self {
        Self {
            version: version.into(),
            footprint_bytes,
            instance: Arc::new(instance),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProvisionError {
    #[error("download failed: {0}")]
    Download(String),

    #[error("model not available offline: {0}")]
    NotDownloaded(String),

    #[error("model file is corrupt: {0}")]
    Corrupt(String),

    #[error("unsupported model: {0}")]
    Unsupported(String),
}

/// Download/storage collaborator the registry loads models through.
#[async_trait]
pub trait ModelProvisioner: Send + Sync {
    /// Make sure the model's files are present locally.
    async fn ensure_downloaded(&self, key: &ModelKey) -> Result<(), ProvisionError>;

    /// Load a downloaded model into memory.
    async fn load_into_memory(&self, key: &ModelKey) -> Result<LoadedModel, ProvisionError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("model {key} unavailable: {reason}")]
    ModelUnavailable {
        key: ModelKey,
        reason: String,
        /// The key has failed `max_consecutive_failures` loads in a row
        standing: bool,
    },
}

impl RegistryError {
    pub fn is_standing(&self) -> bool {
        match self {
            RegistryError::ModelUnavailable { standing, .. } => *standing,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RegistryConfig {
    pub memory_budget_bytes: usize,
    pub max_consecutive_failures: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            memory_budget_bytes: 512 * 1024 * 1024,
            max_consecutive_failures: 3,
        }
    }
}

/// Current status of a model in the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ModelStatus {
    /// A load is in flight
    Loading,

    /// Resident in memory
    Loaded {
        version: String,
        loaded_at: u64,
        memory_usage_bytes: usize,
        references: usize,
    },

    /// Last load failed; the next acquire retries
    Error {
        message: String,
        consecutive_failures: u32,
        error_at: u64,
    },

    /// Loads keep failing; reported as a standing condition
    Unavailable {
        message: String,
        consecutive_failures: u32,
        error_at: u64,
    },
}

impl ModelStatus {
    pub fn is_loaded(&self) -> bool {
        matches!(self, ModelStatus::Loaded { .. })
    }

    pub fn is_preparing(&self) -> bool {
        matches!(self, ModelStatus::Loading)
    }

    pub fn description(&self) -> String {
        match self {
            ModelStatus::Loading => "Loading into memory".to_string(),
            ModelStatus::Loaded { references: 0, .. } => "Resident (idle)".to_string(),
            ModelStatus::Loaded { references, .. } => format!("In use by {} pass(es)", references),
            ModelStatus::Error { message, .. } => format!("Error: {}", message),
            ModelStatus::Unavailable { message, .. } => format!("Unavailable: {}", message),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ModelEntry {
    pub key: ModelKey,
    pub status: ModelStatus,
    pub total_acquisitions: u64,
    pub last_released_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrySummary {
    pub resident_models: usize,
    pub loading_models: usize,
    pub in_use_models: usize,
    pub unavailable_models: usize,
    pub total_memory_usage_bytes: usize,
    pub memory_limit_bytes: usize,
    pub loads: u64,
    pub load_failures: u64,
    pub evictions: u64,
}

type SharedLoad = Shared<BoxFuture<'static, Result<(), RegistryError>>>;

struct Resident {
    version: String,
    instance: Arc<dyn Any + Send + Sync>,
    footprint_bytes: usize,
    refs: usize,
    loaded_at: u64,
    last_released_at: Option<u64>,
    acquisitions: u64,
}

enum Slot {
    Loading(SharedLoad),
    Resident(Resident),
}

#[derive(Debug, Default)]
struct FailureRecord {
    consecutive: u32,
    message: String,
    at: u64,
}

#[derive(Debug, Default)]
struct Counters {
    loads: u64,
    load_failures: u64,
    evictions: u64,
}

struct RegistryState {
    slots: HashMap<ModelKey, Slot>,
    /// Resident keys with zero references, least recently released first
    idle: LruCache<ModelKey, ()>,
    resident_bytes: usize,
    failures: HashMap<ModelKey, FailureRecord>,
    counters: Counters,
}

impl RegistryState {
    fn evict_over_budget(&mut self, budget: usize) {
        while self.resident_bytes > budget {
            let Some((victim, ())) = self.idle.pop_lru() else {
                break;
            };

            let evictable = matches!(self.slots.get(&victim), Some(Slot::Resident(r)) if r.refs == 0);
            if !evictable {
                continue;
            }

            if let Some(Slot::Resident(resident)) = self.slots.remove(&victim) {
                self.resident_bytes = self.resident_bytes.saturating_sub(resident.footprint_bytes);
                self.counters.evictions += 1;
                tracing::info!(
                    model = %victim,
                    freed_bytes = resident.footprint_bytes,
                    resident_bytes = self.resident_bytes,
                    "Evicted idle model"
                );
            }
        }
    }
}

struct RegistryInner {
    provisioner: Arc<dyn ModelProvisioner>,
    config: RegistryConfig,
    state: Mutex<RegistryState>,
}

impl RegistryInner {
    /// Start a load on its own task so it completes even if every waiter
    /// goes away (a pass timing out, for instance).
    fn spawn_load(self: &Arc<Self>, key: ModelKey) -> SharedLoad {
        let inner = Arc::clone(self);
        let task_key = key.clone();
        let task = tokio::spawn(async move { inner.load(task_key).await });

        let inner = Arc::clone(self);
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    let mut state = inner.state.lock();
                    if matches!(state.slots.get(&key), Some(Slot::Loading(_))) {
                        state.slots.remove(&key);
                    }
                    Err(RegistryError::ModelUnavailable {
                        key,
                        reason: format!("load task aborted: {}", join_error),
                        standing: false,
                    })
                }
            }
        }
        .boxed()
        .shared()
    }

    async fn load(&self, key: ModelKey) -> Result<(), RegistryError> {
        let started = Instant::now();
        tracing::info!(model = %key, "Loading model");

        let provisioned = match self.provisioner.ensure_downloaded(&key).await {
            Ok(()) => self.provisioner.load_into_memory(&key).await,
            Err(e) => Err(e),
        };

        let mut guard = self.state.lock();
        let state = &mut *guard;

        match provisioned {
            Ok(model) => {
                state.failures.remove(&key);
                state.counters.loads += 1;
                state.resident_bytes += model.footprint_bytes;

                tracing::info!(
                    model = %key,
                    version = %model.version,
                    footprint_bytes = model.footprint_bytes,
                    duration_ms = started.elapsed().as_millis() as u64,
                    "Model resident"
                );

                state.slots.insert(
                    key.clone(),
                    Slot::Resident(Resident {
                        version: model.version,
                        instance: model.instance,
                        footprint_bytes: model.footprint_bytes,
                        refs: 0,
                        loaded_at: current_timestamp(),
                        last_released_at: None,
                        acquisitions: 0,
                    }),
                );

                // Evict before the new model joins the idle set so it survives
                // until its waiters pick it up.
                state.evict_over_budget(self.config.memory_budget_bytes);
                state.idle.push(key, ());
                Ok(())
            }
            Err(e) => {
                state.slots.remove(&key);
                state.counters.load_failures += 1;

                let record = state.failures.entry(key.clone()).or_default();
                record.consecutive += 1;
                record.message = e.to_string();
                record.at = current_timestamp();
                let standing = record.consecutive >= self.config.max_consecutive_failures;

                tracing::warn!(
                    model = %key,
                    error = %e,
                    consecutive_failures = record.consecutive,
                    standing,
                    "Model load failed"
                );

                Err(RegistryError::ModelUnavailable {
                    key,
                    reason: e.to_string(),
                    standing,
                })
            }
        }
    }

    fn release(&self, key: &ModelKey) {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if let Some(Slot::Resident(resident)) = state.slots.get_mut(key) {
            resident.refs = resident.refs.saturating_sub(1);
            resident.last_released_at = Some(current_timestamp());
            if resident.refs == 0 {
                state.idle.push(key.clone(), ());
                state.evict_over_budget(self.config.memory_budget_bytes);
            }
        }
    }
}

/// Shared, cloneable registry of capability models.
#[derive(Clone)]
pub struct ModelRegistry {
    inner: Arc<RegistryInner>,
}

impl ModelRegistry {
    pub fn new(provisioner: Arc<dyn ModelProvisioner>, config: RegistryConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                provisioner,
                config,
                state: Mutex::new(RegistryState {
                    slots: HashMap::new(),
                    idle: LruCache::unbounded(),
                    resident_bytes: 0,
                    failures: HashMap::new(),
                    counters: Counters::default(),
                }),
            }),
        }
    }

    /// Borrow the model for `key`, loading it first if needed.
    ///
    /// Suspends while a load is in flight. Every acquirer waiting on the
    /// same load receives the same error if it fails.
    pub async fn acquire(&self, key: ModelKey) -> Result<ModelHandle, RegistryError> {
        loop {
            let pending = {
                let mut guard = self.inner.state.lock();
                let state = &mut *guard;

                match state.slots.get_mut(&key) {
                    Some(Slot::Resident(resident)) => {
                        resident.refs += 1;
                        resident.acquisitions += 1;
                        let handle = ModelHandle {
                            version: resident.version.clone(),
                            instance: Arc::clone(&resident.instance),
                            registry: Arc::clone(&self.inner),
                            key: key.clone(),
                        };
                        state.idle.pop(&key);
                        return Ok(handle);
                    }
                    Some(Slot::Loading(load)) => load.clone(),
                    None => {
                        let load = self.inner.spawn_load(key.clone());
                        state.slots.insert(key.clone(), Slot::Loading(load.clone()));
                        load
                    }
                }
            };

            // A model evicted between load completion and this retry is
            // simply loaded again.
            pending.await?;
        }
    }

    /// Give a handle back. Equivalent to dropping it.
    pub fn release(&self, handle: ModelHandle) {
        drop(handle);
    }

    pub fn is_resident(&self, key: &ModelKey) -> bool {
        matches!(self.inner.state.lock().slots.get(key), Some(Slot::Resident(_)))
    }

    /// Keys whose loads keep failing.
    pub fn standing_unavailable(&self) -> Vec<ModelKey> {
        let state = self.inner.state.lock();
        state
            .failures
            .iter()
            .filter(|(_, record)| record.consecutive >= self.inner.config.max_consecutive_failures)
            .map(|(key, _)| key.clone())
            .collect()
    }

    pub fn entries(&self) -> Vec<ModelEntry> {
        let state = self.inner.state.lock();
        let max_failures = self.inner.config.max_consecutive_failures;

        let mut entries: Vec<ModelEntry> = state
            .slots
            .iter()
            .map(|(key, slot)| match slot {
                Slot::Loading(_) => ModelEntry {
                    key: key.clone(),
                    status: ModelStatus::Loading,
                    total_acquisitions: 0,
                    last_released_at: None,
                },
                Slot::Resident(resident) => ModelEntry {
                    key: key.clone(),
                    status: ModelStatus::Loaded {
                        version: resident.version.clone(),
                        loaded_at: resident.loaded_at,
                        memory_usage_bytes: resident.footprint_bytes,
                        references: resident.refs,
                    },
                    total_acquisitions: resident.acquisitions,
                    last_released_at: resident.last_released_at,
                },
            })
            .collect();

        for (key, record) in state.failures.iter().filter(|(key, _)| !state.slots.contains_key(*key)) {
            let message = record.message.clone();
            let status = if record.consecutive >= max_failures {
                ModelStatus::Unavailable {
                    message,
                    consecutive_failures: record.consecutive,
                    error_at: record.at,
                }
            } else {
                ModelStatus::Error {
                    message,
                    consecutive_failures: record.consecutive,
                    error_at: record.at,
                }
            };
            entries.push(ModelEntry {
                key: key.clone(),
                status,
                total_acquisitions: 0,
                last_released_at: None,
            });
        }

        entries.sort_by_key(|entry| entry.key.to_string());
        entries
    }

    pub fn summary(&self) -> RegistrySummary {
        let state = self.inner.state.lock();
        let max_failures = self.inner.config.max_consecutive_failures;

        let mut resident_models = 0;
        let mut loading_models = 0;
        let mut in_use_models = 0;
        for slot in state.slots.values() {
            match slot {
                Slot::Loading(_) => loading_models += 1,
                Slot::Resident(resident) => {
                    resident_models += 1;
                    if resident.refs > 0 {
                        in_use_models += 1;
                    }
                }
            }
        }

        RegistrySummary {
            resident_models,
            loading_models,
            in_use_models,
            unavailable_models: state
                .failures
                .values()
                .filter(|record| record.consecutive >= max_failures)
                .count(),
            total_memory_usage_bytes: state.resident_bytes,
            memory_limit_bytes: self.inner.config.memory_budget_bytes,
            loads: state.counters.loads,
            load_failures: state.counters.load_failures,
            evictions: state.counters.evictions,
        }
    }
}

/// A borrowed, reference-counted model. Dropping it releases the reference.
pub struct ModelHandle {
    key: ModelKey,
    version: String,
    instance: Arc<dyn Any + Send + Sync>,
    registry: Arc<RegistryInner>,
}

impl ModelHandle {
    pub fn key(&self) -> &ModelKey {
        &self.key
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// The loaded instance, if it is a `T`.
    pub fn instance<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.instance).downcast::<T>().ok()
    }
}

impl fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelHandle")
            .field("key", &self.key)
            .field("version", &self.version)
            .finish()
    }
}

impl Drop for ModelHandle {
    fn drop(&mut self) {
        self.registry.release(&self.key);
    }
}

/// Current Unix timestamp in seconds.
pub(crate) fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageTag;
    use crate::models::Phrasebook;
    use crate::testkit::CountingProvisioner;
    use futures_util::future::join_all;

    fn key(source: &str, target: &str) -> ModelKey {
        ModelKey::translation(LanguagePair::new(
            &LanguageTag::parse(source).unwrap(),
            &LanguageTag::parse(target).unwrap(),
        ))
    }

    fn registry(provisioner: Arc<CountingProvisioner>, budget: usize, max_failures: u32) -> ModelRegistry {
        ModelRegistry::new(
            provisioner,
            RegistryConfig {
                memory_budget_bytes: budget,
                max_consecutive_failures: max_failures,
            },
        )
    }

    #[test]
    fn test_model_status() {
        let loaded = ModelStatus::Loaded {
            version: "1".into(),
            loaded_at: 12345,
            memory_usage_bytes: 1000,
            references: 2,
        };
        assert!(loaded.is_loaded());
        assert_eq!(loaded.description(), "In use by 2 pass(es)");
        assert!(ModelStatus::Loading.is_preparing());
        assert_eq!(key("en", "fr").to_string(), "translation:en-fr");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_acquires_share_one_load() {
        let provisioner = Arc::new(CountingProvisioner::new());
        let registry = registry(provisioner.clone(), 1 << 20, 3);

        let handles = join_all((0..16).map(|_| registry.acquire(key("en", "fr")))).await;
        let handles: Vec<ModelHandle> = handles.into_iter().map(|h| h.unwrap()).collect();

        assert_eq!(provisioner.attempts(), 1);
        assert_eq!(provisioner.loads(), 1);

        let first = handles[0].instance::<Phrasebook>().unwrap();
        for handle in &handles {
            assert!(Arc::ptr_eq(&first, &handle.instance::<Phrasebook>().unwrap()));
        }
        assert_eq!(registry.summary().in_use_models, 1);

        drop(handles);
        let summary = registry.summary();
        assert_eq!(summary.in_use_models, 0);
        assert_eq!(summary.resident_models, 1);
        assert_eq!(summary.loads, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_failed_load_reaches_every_waiter() {
        let provisioner = Arc::new(CountingProvisioner::new());
        provisioner.fail_with(ProvisionError::Download("network unreachable".into()));
        let registry = registry(provisioner.clone(), 1 << 20, 2);

        let results = join_all((0..5).map(|_| registry.acquire(key("en", "fr")))).await;
        let errors: Vec<RegistryError> = results.into_iter().map(|r| r.unwrap_err()).collect();

        assert_eq!(provisioner.attempts(), 1);
        assert!(errors.iter().all(|e| e == &errors[0]));
        assert!(!errors[0].is_standing());
        assert!(!registry.is_resident(&key("en", "fr")));
        assert!(registry.entries().iter().all(|e| !e.status.is_loaded()));

        // Second consecutive failure makes it a standing condition.
        let err = registry.acquire(key("en", "fr")).await.unwrap_err();
        assert!(err.is_standing());
        assert_eq!(registry.standing_unavailable(), vec![key("en", "fr")]);
        assert!(matches!(registry.entries()[0].status, ModelStatus::Unavailable { .. }));

        // Recovery clears the record.
        provisioner.succeed();
        assert!(registry.acquire(key("en", "fr")).await.is_ok());
        assert!(registry.standing_unavailable().is_empty());
        assert_eq!(registry.summary().load_failures, 2);
    }

    #[tokio::test]
    async fn test_evicts_least_recently_released_idle_model() {
        let provisioner = Arc::new(CountingProvisioner::new().with_footprint(40));
        let registry = registry(provisioner.clone(), 100, 3);

        let fr = registry.acquire(key("en", "fr")).await.unwrap();
        let de = registry.acquire(key("en", "de")).await.unwrap();
        drop(fr);
        drop(de);

        let _es = registry.acquire(key("en", "es")).await.unwrap();

        assert!(!registry.is_resident(&key("en", "fr")));
        assert!(registry.is_resident(&key("en", "de")));
        assert!(registry.is_resident(&key("en", "es")));
        assert_eq!(registry.summary().evictions, 1);
        assert_eq!(registry.summary().total_memory_usage_bytes, 80);

        // Re-acquiring an evicted model loads it again.
        let _fr = registry.acquire(key("en", "fr")).await.unwrap();
        assert_eq!(provisioner.loads(), 4);
    }

    #[tokio::test]
    async fn test_in_use_models_are_never_evicted() {
        let provisioner = Arc::new(CountingProvisioner::new().with_footprint(40));
        let registry = registry(provisioner, 50, 3);

        let fr = registry.acquire(key("en", "fr")).await.unwrap();
        let de = registry.acquire(key("en", "de")).await.unwrap();

        // Over budget, but nothing is idle.
        assert!(registry.is_resident(&key("en", "fr")));
        assert!(registry.is_resident(&key("en", "de")));

        registry.release(fr);
        assert!(!registry.is_resident(&key("en", "fr")));
        assert!(registry.is_resident(&key("en", "de")));
        drop(de);
        assert!(registry.is_resident(&key("en", "de")));
    }
}
