//! # Phrasebook Translation Models
//!
//! The built-in translation capability. A language-pair model is a TOML
//! phrasebook stored as `<store_dir>/<source>-<target>.toml`:
//!
//! ```toml
//! version = "2024.1"
//!
//! [phrases]
//! "hello" = "bonjour"
//! "emergency exit" = "sortie de secours"
//! ```
//!
//! Missing phrasebooks are fetched from a Hugging Face repository through
//! `hf-hub` when downloads are allowed. Translation is deterministic:
//! longest phrase match first, unknown words kept verbatim, source casing
//! (all-caps or capitalized) carried onto the translation.

use crate::language::LanguagePair;
use crate::models::registry::{Capability, LoadedModel, ModelHandle, ModelKey, ModelProvisioner, ProvisionError};
use crate::stages::translation::{TranslationError, Translator};
use async_trait::async_trait;
use hf_hub::api::tokio::ApiBuilder;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

/// Per-entry bookkeeping overhead counted into a phrasebook's footprint.
const ENTRY_OVERHEAD_BYTES: usize = 64;

#[derive(Debug, Deserialize)]
struct PhrasebookFile {
    version: String,
    #[serde(default)]
    phrases: BTreeMap<String, String>,
}

/// An in-memory phrase table for one language pair.
#[derive(Debug, Clone)]
pub struct Phrasebook {
    version: String,
    phrases: HashMap<String, String>,
    longest_phrase: usize,
}

impl Phrasebook {
    pub fn new<K, V>(version: impl Into<String>, phrases: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: AsRef<str>,
        V: Into<String>,
    {
        let phrases: HashMap<String, String> = phrases
            .into_iter()
            .filter_map(|(source, target)| {
                let key = phrase_key(source.as_ref());
                (!key.is_empty()).then(|| (key, target.into()))
            })
            .collect();
        let longest_phrase = phrases
            .keys()
            .map(|key| key.split(' ').count())
            .max()
            .unwrap_or(0);

        Self {
            version: version.into(),
            phrases,
            longest_phrase,
        }
    }

    pub fn from_toml(text: &str) -> Result<Self, ProvisionError> {
        let file: PhrasebookFile =
            toml::from_str(text).map_err(|e| ProvisionError::Corrupt(e.to_string()))?;
        Ok(Self::new(file.version, file.phrases))
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn len(&self) -> usize {
        self.phrases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phrases.is_empty()
    }

    pub fn footprint_bytes(&self) -> usize {
        self.phrases
            .iter()
            .map(|(k, v)| k.len() + v.len() + ENTRY_OVERHEAD_BYTES)
            .sum()
    }

    /// Translate line by line, keeping line breaks.
    pub fn translate(&self, text: &str) -> String {
        text.split('\n')
            .map(|line| self.translate_line(line))
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn translate_line(&self, line: &str) -> String {
        let (leading, words) = split_words(line);
        let mut out = leading;
        let mut i = 0;

        'words: while i < words.len() {
            let longest = self.longest_phrase.min(words.len() - i);
            for n in (1..=longest).rev() {
                let window = &words[i..i + n];
                // A phrase never spans punctuation.
                let spans_punctuation = window[..n - 1]
                    .iter()
                    .any(|word| !word.trailing.chars().all(char::is_whitespace));
                if spans_punctuation {
                    continue;
                }

                let key = window
                    .iter()
                    .map(|word| word.text.to_lowercase())
                    .collect::<Vec<_>>()
                    .join(" ");
                if let Some(target) = self.phrases.get(&key) {
                    out.push_str(&carry_case(window, target));
                    out.push_str(&window[n - 1].trailing);
                    i += n;
                    continue 'words;
                }
            }

            out.push_str(&words[i].text);
            out.push_str(&words[i].trailing);
            i += 1;
        }

        out
    }
}

struct Word {
    text: String,
    /// Non-word characters between this word and the next
    trailing: String,
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '\''
}

fn split_words(line: &str) -> (String, Vec<Word>) {
    let mut leading = String::new();
    let mut words: Vec<Word> = Vec::new();

    for c in line.chars() {
        if is_word_char(c) {
            match words.last_mut() {
                Some(word) if word.trailing.is_empty() => word.text.push(c),
                _ => words.push(Word {
                    text: c.to_string(),
                    trailing: String::new(),
                }),
            }
        } else {
            match words.last_mut() {
                Some(word) => word.trailing.push(c),
                None => leading.push(c),
            }
        }
    }

    (leading, words)
}

fn phrase_key(phrase: &str) -> String {
    phrase
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Apply the source window's casing to the translation.
fn carry_case(window: &[Word], target: &str) -> String {
    let letters: Vec<char> = window
        .iter()
        .flat_map(|word| word.text.chars())
        .filter(|c| c.is_alphabetic())
        .collect();

    let all_caps = letters.len() > 1 && letters.iter().all(|c| c.is_uppercase());
    if all_caps {
        return target.to_uppercase();
    }

    let capitalized = letters.first().is_some_and(|c| c.is_uppercase());
    if capitalized {
        let mut chars = target.chars();
        if let Some(first) = chars.next() {
            return first.to_uppercase().chain(chars).collect();
        }
    }

    target.to_string()
}

/// Translator backed by [`Phrasebook`] models.
#[derive(Debug, Default, Clone)]
pub struct PhrasebookTranslator;

#[async_trait]
impl Translator for PhrasebookTranslator {
    fn name(&self) -> &str {
        "phrasebook"
    }

    async fn translate(
        &self,
        text: &str,
        pair: &LanguagePair,
        model: &ModelHandle,
    ) -> Result<String, TranslationError> {
        let phrasebook = model
            .instance::<Phrasebook>()
            .ok_or_else(|| TranslationError::IncompatibleModel {
                model: model.key().to_string(),
                pair: pair.to_string(),
            })?;

        Ok(phrasebook.translate(text))
    }
}

/// Provisions phrasebooks from a local store, downloading missing ones.
///
/// Capabilities other than translation are compiled in and need no files.
#[derive(Debug, Clone)]
pub struct PhrasebookProvisioner {
    store_dir: PathBuf,
    remote_repo: Option<String>,
    allow_download: bool,
    hf_token: Option<String>,
}

impl PhrasebookProvisioner {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            remote_repo: None,
            allow_download: false,
            hf_token: None,
        }
    }

    /// Fetch missing phrasebooks from `repo` on the Hugging Face hub.
    pub fn with_remote(mut self, repo: impl Into<String>, token: Option<String>) -> Self {
        self.remote_repo = Some(repo.into());
        self.hf_token = token;
        self.allow_download = true;
        self
    }

    pub fn allow_download(mut self, allow: bool) -> Self {
        self.allow_download = allow;
        self
    }

    pub fn store_dir(&self) -> &Path {
        &self.store_dir
    }

    pub fn file_name(pair: &LanguagePair) -> String {
        format!("{}.toml", pair)
    }

    pub fn path_for(&self, pair: &LanguagePair) -> PathBuf {
        self.store_dir.join(Self::file_name(pair))
    }

    fn translation_pair(key: &ModelKey) -> Result<Option<&LanguagePair>, ProvisionError> {
        match (key.capability, &key.pair) {
            (Capability::Translation, Some(pair)) => Ok(Some(pair)),
            (Capability::Translation, None) => Err(ProvisionError::Unsupported(
                "translation model without a language pair".to_string(),
            )),
            _ => Ok(None),
        }
    }

    async fn download(&self, repo: &str, file_name: &str, destination: &Path) -> Result<(), ProvisionError> {
        tracing::info!(repo, file = file_name, "Downloading phrasebook");

        let api = ApiBuilder::new()
            .with_token(self.hf_token.clone())
            .with_cache_dir(self.store_dir.join(".hf-cache"))
            .with_progress(false)
            .build()
            .map_err(|e| ProvisionError::Download(format!("hub client: {}", e)))?;

        let fetched = api
            .model(repo.to_string())
            .get(file_name)
            .await
            .map_err(|e| ProvisionError::Download(format!("{}/{}: {}", repo, file_name, e)))?;

        tokio::fs::create_dir_all(&self.store_dir)
            .await
            .map_err(|e| ProvisionError::Download(e.to_string()))?;
        tokio::fs::copy(&fetched, destination)
            .await
            .map_err(|e| ProvisionError::Download(e.to_string()))?;

        tracing::info!(path = %destination.display(), "Phrasebook stored");
        Ok(())
    }
}

#[async_trait]
impl ModelProvisioner for PhrasebookProvisioner {
    async fn ensure_downloaded(&self, key: &ModelKey) -> Result<(), ProvisionError> {
        let Some(pair) = Self::translation_pair(key)? else {
            return Ok(());
        };

        let path = self.path_for(pair);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }

        let file_name = Self::file_name(pair);
        match (&self.remote_repo, self.allow_download) {
            (Some(repo), true) => self.download(repo, &file_name, &path).await,
            (None, _) => Err(ProvisionError::NotDownloaded(format!(
                "{} is not in {} and no remote repository is configured",
                file_name,
                self.store_dir.display()
            ))),
            (Some(_), false) => Err(ProvisionError::NotDownloaded(format!(
                "{} is not in {} and downloads are disabled",
                file_name,
                self.store_dir.display()
            ))),
        }
    }

    async fn load_into_memory(&self, key: &ModelKey) -> Result<LoadedModel, ProvisionError> {
        let Some(pair) = Self::translation_pair(key)? else {
            return Ok(LoadedModel::new("builtin", 0, ()));
        };

        let path = self.path_for(pair);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| ProvisionError::NotDownloaded(format!("{}: {}", path.display(), e)))?;
        let phrasebook = Phrasebook::from_toml(&text)?;

        tracing::debug!(
            pair = %pair,
            version = phrasebook.version(),
            phrases = phrasebook.len(),
            "Parsed phrasebook"
        );

        Ok(LoadedModel::new(
            phrasebook.version().to_string(),
            phrasebook.footprint_bytes(),
            phrasebook,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::language::LanguageTag;
    use crate::models::registry::{ModelRegistry, RegistryConfig};
    use std::sync::Arc;

    fn en_fr() -> LanguagePair {
        LanguagePair::new(&LanguageTag::parse("en").unwrap(), &LanguageTag::parse("fr").unwrap())
    }

    fn sample() -> Phrasebook {
        Phrasebook::new(
            "t1",
            [
                ("hello", "bonjour"),
                ("exit", "sortie"),
                ("emergency exit", "sortie de secours"),
                ("thank  you", "merci"),
            ],
        )
    }

    #[test]
    fn test_longest_match_and_casing() {
        let book = sample();
        assert_eq!(book.translate("HELLO"), "BONJOUR");
        assert_eq!(book.translate("Emergency exit"), "Sortie de secours");
        assert_eq!(book.translate("exit, thank you!"), "sortie, merci!");
        assert_eq!(book.translate("Hello Bob\nEXIT"), "Bonjour Bob\nSORTIE");
    }

    #[test]
    fn test_phrase_never_spans_punctuation() {
        let book = sample();
        assert_eq!(book.translate("emergency. exit"), "emergency. sortie");
    }

    #[test]
    fn test_translation_is_deterministic() {
        let book = sample();
        let text = "  Hello, emergency exit ahead  ";
        assert_eq!(book.translate(text), book.translate(text));
        assert_eq!(book.translate(text), "  Bonjour, sortie de secours ahead  ");
    }

    #[test]
    fn test_parses_toml() {
        let book = Phrasebook::from_toml("version = \"9\"\n[phrases]\n\"good morning\" = \"bonjour\"\n").unwrap();
        assert_eq!(book.version(), "9");
        assert_eq!(book.translate("Good morning"), "Bonjour");
        assert!(matches!(Phrasebook::from_toml("phrases = 3"), Err(ProvisionError::Corrupt(_))));
    }

    #[tokio::test]
    async fn test_provisioner_reads_local_store() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("en-fr.toml"),
            "version = \"2\"\n[phrases]\nhello = \"bonjour\"\n",
        )
        .unwrap();

        let registry = ModelRegistry::new(
            Arc::new(PhrasebookProvisioner::new(dir.path())),
            RegistryConfig::default(),
        );
        let handle = registry.acquire(ModelKey::translation(en_fr())).await.unwrap();
        assert_eq!(handle.version(), "2");

        let translated = PhrasebookTranslator.translate("HELLO", &en_fr(), &handle).await.unwrap();
        assert_eq!(translated, "BONJOUR");
    }

    #[tokio::test]
    async fn test_missing_phrasebook_without_downloads() {
        let dir = tempfile::tempdir().unwrap();
        let provisioner = PhrasebookProvisioner::new(dir.path())
            .with_remote("example/phrasebooks", None)
            .allow_download(false);

        let result = provisioner.ensure_downloaded(&ModelKey::translation(en_fr())).await;
        assert!(matches!(result, Err(ProvisionError::NotDownloaded(_))));

        let builtin = ModelKey::shared(Capability::LanguageId);
        assert!(provisioner.ensure_downloaded(&builtin).await.is_ok());
    }
}
