//! Durable snapshots of the result cache.
//!
//! Loaded once at startup and written on shutdown. Running without a store
//! is valid: the cache is then memory-only and starts cold.

use crate::stages::translation::TranslationResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

const SNAPSHOT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CacheStoreError {
    #[error("snapshot I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("snapshot at {path} is malformed: {source}")]
    Malformed {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("snapshot format version {0} is not supported")]
    UnsupportedVersion(u32),
}

/// Persistence collaborator for the result cache.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Results ordered least to most recently used. Empty if none saved.
    async fn load_snapshot(&self) -> Result<Vec<TranslationResult>, CacheStoreError>;

    async fn persist_snapshot(&self, entries: &[TranslationResult]) -> Result<(), CacheStoreError>;
}

#[derive(Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    saved_at: DateTime<Utc>,
    entries: Vec<TranslationResult>,
}

/// Stores the snapshot as one JSON document, replaced atomically.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Move the snapshot file aside so the next persist cannot overwrite
    /// it. Returns the new location, or `None` if there was no file.
    pub async fn set_aside(&self) -> Result<Option<PathBuf>, CacheStoreError> {
        let file_name = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "snapshot".to_string());
        let aside = self.path.with_file_name(format!(
            "{}.rejected-{}",
            file_name,
            Utc::now().format("%Y%m%dT%H%M%S")
        ));

        match tokio::fs::rename(&self.path, &aside).await {
            Ok(()) => Ok(Some(aside)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(self.io_error(e)),
        }
    }

    fn io_error(&self, source: std::io::Error) -> CacheStoreError {
        CacheStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load_snapshot(&self) -> Result<Vec<TranslationResult>, CacheStoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %self.path.display(), "No cache snapshot yet");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_error(e)),
        };

        let file: SnapshotFile =
            serde_json::from_slice(&data).map_err(|source| CacheStoreError::Malformed {
                path: self.path.clone(),
                source,
            })?;

        if file.version != SNAPSHOT_FORMAT_VERSION {
            return Err(CacheStoreError::UnsupportedVersion(file.version));
        }

        Ok(file.entries)
    }

    async fn persist_snapshot(&self, entries: &[TranslationResult]) -> Result<(), CacheStoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(e))?;
        }

        let file = SnapshotFile {
            version: SNAPSHOT_FORMAT_VERSION,
            saved_at: Utc::now(),
            entries: entries.to_vec(),
        };
        let json = serde_json::to_vec_pretty(&file).map_err(|source| CacheStoreError::Malformed {
            path: self.path.clone(),
            source,
        })?;

        // Write beside the target, then rename over it.
        let staging = self.path.with_extension("json.tmp");
        tokio::fs::write(&staging, json)
            .await
            .map_err(|e| self.io_error(e))?;
        tokio::fs::rename(&staging, &self.path)
            .await
            .map_err(|e| self.io_error(e))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::ResultCache;
    use crate::language::{LanguageTag, SourceLanguage};
    use crate::stages::translation::TranslationRequest;

    fn result(text: &str, translated: &str) -> TranslationResult {
        let en = LanguageTag::parse("en").unwrap();
        TranslationResult {
            request: TranslationRequest::new(text, SourceLanguage::Tag(en.clone()), LanguageTag::parse("fr").unwrap()),
            translated_text: translated.to_string(),
            source_language_resolved: en,
            produced_at: Utc::now(),
            model_version: Some("t1".into()),
        }
    }

    #[tokio::test]
    async fn test_missing_snapshot_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("cache.json"));
        assert!(store.load_snapshot().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cache_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("nested").join("cache.json"));

        let cache = ResultCache::new(10);
        for (text, translated) in [("hello", "bonjour"), ("exit", "sortie")] {
            let r = result(text, translated);
            cache.insert(&r.request.clone(), r);
        }
        assert_eq!(cache.persist_to(&store).await.unwrap(), 2);
        assert!(!dir.path().join("nested").join("cache.json.tmp").exists());

        let warmed = ResultCache::new(10);
        assert_eq!(warmed.load_from(&store).await.unwrap(), 2);
        let hit = warmed.lookup(&result("HELLO", "").request).unwrap();
        assert_eq!(hit.translated_text, "bonjour");
    }

    #[tokio::test]
    async fn test_malformed_snapshot_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        std::fs::write(&path, "{ nope").unwrap();

        let err = JsonFileStore::new(&path).load_snapshot().await.unwrap_err();
        assert!(matches!(err, CacheStoreError::Malformed { .. }));
    }

    #[tokio::test]
    async fn test_set_aside_keeps_rejected_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.json");
        let store = JsonFileStore::new(&path);
        assert_eq!(store.set_aside().await.unwrap(), None);

        std::fs::write(&path, "{ nope").unwrap();
        let aside = store.set_aside().await.unwrap().unwrap();
        assert!(!path.exists());
        assert!(aside
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("cache.json.rejected-"));
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "{ nope");
    }
}
