//! # Language Tags
//!
//! Normalized BCP-47-like language identifiers, language pairs used to key
//! translation models, and the catalog of languages the service ships with.
//!
//! ## Normalization Rules:
//! - `_` separators become `-`
//! - primary subtag is lowercase (`EN` → `en`)
//! - 4-letter script subtags are titlecase (`hant` → `Hant`)
//! - 2-letter or 3-digit region subtags are uppercase (`us` → `US`)
//!
//! Two tags are equal when their normalized forms are equal, so `en_us`,
//! `EN-US` and `en-US` all compare equal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Errors produced while parsing a language tag.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LanguageTagError {
    #[error("language tag is empty")]
    Empty,

    #[error("invalid primary language subtag '{0}'")]
    InvalidPrimary(String),

    #[error("invalid subtag '{subtag}' in '{tag}'")]
    InvalidSubtag { tag: String, subtag: String },
}

/// A normalized language code such as `en`, `fr-CA` or `zh-Hant-TW`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct LanguageTag(String);

impl LanguageTag {
    /// Code returned by identifiers that could not settle on a language.
    pub const UNDETERMINED: &'static str = "und";

    /// Parse and normalize a tag.
    pub fn parse(raw: &str) -> Result<Self, LanguageTagError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(LanguageTagError::Empty);
        }

        let mut subtags = trimmed.split(|c| c == '-' || c == '_');
        let primary = subtags.next().unwrap_or_default();
        let primary_ok = (2..=3).contains(&primary.len())
            && primary.chars().all(|c| c.is_ascii_alphabetic());
        if !primary_ok {
            return Err(LanguageTagError::InvalidPrimary(primary.to_string()));
        }

        let mut normalized = primary.to_ascii_lowercase();
        for subtag in subtags {
            let part = match subtag.len() {
                4 if subtag.chars().all(|c| c.is_ascii_alphabetic()) => {
                    let mut chars = subtag.chars();
                    let first = chars.next().map(|c| c.to_ascii_uppercase());
                    first
                        .into_iter()
                        .chain(chars.map(|c| c.to_ascii_lowercase()))
                        .collect::<String>()
                }
                2 if subtag.chars().all(|c| c.is_ascii_alphabetic()) => subtag.to_ascii_uppercase(),
                3 if subtag.chars().all(|c| c.is_ascii_digit()) => subtag.to_string(),
                5..=8 if subtag.chars().all(|c| c.is_ascii_alphanumeric()) => {
                    subtag.to_ascii_lowercase()
                }
                _ => {
                    return Err(LanguageTagError::InvalidSubtag {
                        tag: trimmed.to_string(),
                        subtag: subtag.to_string(),
                    })
                }
            };
            normalized.push('-');
            normalized.push_str(&part);
        }

        Ok(Self(normalized))
    }

    /// The `und` tag.
    pub fn undetermined() -> Self {
        Self(Self::UNDETERMINED.to_string())
    }

    /// The normalized tag text.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Primary language subtag (`fr` for `fr-CA`).
    pub fn primary(&self) -> &str {
        self.0.split('-').next().unwrap_or(&self.0)
    }

    /// Tag reduced to its primary subtag.
    pub fn base(&self) -> LanguageTag {
        LanguageTag(self.primary().to_string())
    }

    /// True when both tags name the same language regardless of region or script.
    pub fn same_language(&self, other: &LanguageTag) -> bool {
        self.primary() == other.primary()
    }

    pub fn is_undetermined(&self) -> bool {
        self.primary() == Self::UNDETERMINED
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for LanguageTag {
    type Err = LanguageTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for LanguageTag {
    type Error = LanguageTagError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<LanguageTag> for String {
    fn from(tag: LanguageTag) -> Self {
        tag.0
    }
}

/// Source language of a translation request: explicit, or detected per frame.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum SourceLanguage {
    #[default]
    Auto,
    Tag(LanguageTag),
}

impl SourceLanguage {
    pub fn tag(&self) -> Option<&LanguageTag> {
        match self {
            SourceLanguage::Auto => None,
            SourceLanguage::Tag(tag) => Some(tag),
        }
    }
}

impl fmt::Display for SourceLanguage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceLanguage::Auto => f.write_str("auto"),
            SourceLanguage::Tag(tag) => tag.fmt(f),
        }
    }
}

impl FromStr for SourceLanguage {
    type Err = LanguageTagError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("auto") {
            Ok(SourceLanguage::Auto)
        } else {
            LanguageTag::parse(s).map(SourceLanguage::Tag)
        }
    }
}

impl Serialize for SourceLanguage {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SourceLanguage {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// An ordered (source, target) combination identifying a translation model.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LanguagePair {
    pub source: LanguageTag,
    pub target: LanguageTag,
}

impl LanguagePair {
    /// Build a pair keyed on primary subtags only; translation models are
    /// per language, not per regional variant.
    pub fn new(source: &LanguageTag, target: &LanguageTag) -> Self {
        Self {
            source: source.base(),
            target: target.base(),
        }
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.source, self.target)
    }
}

/// A language the service knows how to present.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct SupportedLanguage {
    pub code: &'static str,
    pub name: &'static str,
    pub native_name: &'static str,
    pub supports_voice: bool,
    pub supports_camera: bool,
}

const fn lang(
    code: &'static str,
    name: &'static str,
    native_name: &'static str,
    supports_voice: bool,
    supports_camera: bool,
) -> SupportedLanguage {
    SupportedLanguage {
        code,
        name,
        native_name,
        supports_voice,
        supports_camera,
    }
}

static SUPPORTED_LANGUAGES: [SupportedLanguage; 24] = [
    lang("en", "English", "English", true, true),
    lang("vi", "Vietnamese", "Tiếng Việt", true, true),
    lang("es", "Spanish", "Español", true, true),
    lang("fr", "French", "Français", true, true),
    lang("de", "German", "Deutsch", true, true),
    lang("it", "Italian", "Italiano", true, true),
    lang("pt", "Portuguese", "Português", true, true),
    lang("ru", "Russian", "Русский", true, true),
    lang("zh", "Chinese", "中文", true, true),
    lang("ja", "Japanese", "日本語", true, true),
    lang("ko", "Korean", "한국어", true, true),
    lang("th", "Thai", "ไทย", false, true),
    lang("hi", "Hindi", "हिन्दी", false, true),
    lang("nl", "Dutch", "Nederlands", false, false),
    lang("sv", "Swedish", "Svenska", false, false),
    lang("da", "Danish", "Dansk", false, false),
    lang("no", "Norwegian", "Norsk", false, false),
    lang("fi", "Finnish", "Suomi", false, false),
    lang("pl", "Polish", "Polski", false, false),
    lang("cs", "Czech", "Čeština", false, false),
    lang("hu", "Hungarian", "Magyar", false, false),
    lang("ar", "Arabic", "العربية", false, false),
    lang("tr", "Turkish", "Türkçe", false, false),
    lang("af", "Afrikaans", "Afrikaans", false, false),
];

/// All languages in the catalog.
pub fn supported_languages() -> &'static [SupportedLanguage] {
    &SUPPORTED_LANGUAGES
}

/// Look up a catalog entry by tag (matching on the primary subtag).
pub fn find_supported(tag: &LanguageTag) -> Option<&'static SupportedLanguage> {
    SUPPORTED_LANGUAGES
        .iter()
        .find(|language| language.code == tag.primary())
}
