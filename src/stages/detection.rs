//! # Language Detection Stage
//!
//! Infers the source language of recognized text. A provider ranks
//! candidate languages; the stage turns that ranking into a decision.
//!
//! ## Ambiguity Policy:
//! The stage answers `Ambiguous` instead of guessing when
//! - the provider returns no candidates,
//! - the top candidate is the undetermined tag (`und`), or
//! - the top two confidences differ by less than the configured margin.
//!
//! Refusing to guess keeps mixed-script signage from flip-flopping
//! between translations on consecutive frames.

use crate::language::LanguageTag;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

/// Default minimum gap between the two best candidates.
pub const DEFAULT_AMBIGUITY_MARGIN: f32 = 0.15;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionError {
    #[error("language identifier failed: {0}")]
    Provider(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LanguageCandidate {
    pub tag: LanguageTag,
    pub confidence: f32,
}

impl LanguageCandidate {
    pub fn new(tag: LanguageTag, confidence: f32) -> Self {
        Self {
            tag,
            confidence: confidence.clamp(0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DetectionOutcome {
    Detected { tag: LanguageTag, confidence: f32 },
    Ambiguous { candidates: Vec<LanguageCandidate> },
}

/// Language-identification capability provider.
#[async_trait]
pub trait LanguageIdentifier: Send + Sync {
    fn name(&self) -> &str;

    /// Candidate languages for `text`, in any order.
    async fn identify(&self, text: &str) -> Result<Vec<LanguageCandidate>, DetectionError>;
}

pub struct DetectionStage {
    identifier: Arc<dyn LanguageIdentifier>,
    margin: f32,
}

impl DetectionStage {
    pub fn new(identifier: Arc<dyn LanguageIdentifier>, margin: f32) -> Self {
        Self {
            identifier,
            margin: margin.clamp(0.0, 1.0),
        }
    }

    pub fn margin(&self) -> f32 {
        self.margin
    }

    pub async fn detect(&self, text: &str) -> Result<DetectionOutcome, DetectionError> {
        let mut candidates = self.identifier.identify(text).await?;
        candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

        let outcome = decide(candidates, self.margin);
        tracing::debug!(provider = self.identifier.name(), ?outcome, "Language detection");
        Ok(outcome)
    }
}

/// Apply the ambiguity policy to candidates sorted by descending confidence.
fn decide(candidates: Vec<LanguageCandidate>, margin: f32) -> DetectionOutcome {
    let Some(top) = candidates.first() else {
        return DetectionOutcome::Ambiguous { candidates };
    };

    if top.tag.is_undetermined() {
        return DetectionOutcome::Ambiguous { candidates };
    }

    if let Some(runner_up) = candidates.get(1) {
        // A gap equal to the margin is decisive; f32 subtraction can land a hair below it.
        let gap = top.confidence - runner_up.confidence;
        if margin - gap > f32::EPSILON {
            return DetectionOutcome::Ambiguous { candidates };
        }
    }

    DetectionOutcome::Detected {
        tag: top.tag.clone(),
        confidence: top.confidence,
    }
}

/// Language implied by a character's Unicode script, for scripts that
/// identify a language on their own.
fn script_language(c: char) -> Option<&'static str> {
    match c {
        '\u{0400}'..='\u{04FF}' => Some("ru"),
        '\u{0600}'..='\u{06FF}' => Some("ar"),
        '\u{0900}'..='\u{097F}' => Some("hi"),
        '\u{0E00}'..='\u{0E7F}' => Some("th"),
        '\u{AC00}'..='\u{D7AF}' | '\u{1100}'..='\u{11FF}' => Some("ko"),
        '\u{3040}'..='\u{30FF}' => Some("ja"),
        '\u{4E00}'..='\u{9FFF}' => Some("zh"),
        _ => None,
    }
}

/// Latin-script languages with their common words and telltale letters.
const LATIN_EVIDENCE: &[(&str, &[&str], &str)] = &[
    (
        "en",
        &[
            "the", "and", "is", "of", "to", "in", "for", "with", "hello", "exit", "welcome",
            "open", "closed", "push", "pull", "please", "thank", "you", "no", "entrance",
        ],
        "",
    ),
    (
        "fr",
        &[
            "le", "la", "les", "et", "est", "des", "une", "du", "pour", "bonjour", "sortie",
            "bienvenue", "ouvert", "fermé", "merci", "entrée", "poussez", "tirez",
        ],
        "çàâèêëîïôûœ",
    ),
    (
        "es",
        &[
            "el", "los", "las", "y", "es", "del", "una", "por", "hola", "salida", "bienvenido",
            "abierto", "cerrado", "gracias", "entrada", "empuje",
        ],
        "ñ¿¡",
    ),
    (
        "de",
        &[
            "der", "die", "das", "und", "ist", "nicht", "mit", "hallo", "ausgang", "willkommen",
            "geöffnet", "geschlossen", "danke", "eingang", "drücken", "ziehen",
        ],
        "äöüß",
    ),
    (
        "it",
        &[
            "il", "gli", "di", "che", "è", "per", "ciao", "uscita", "benvenuto", "aperto",
            "chiuso", "grazie", "ingresso", "spingere", "tirare",
        ],
        "ìò",
    ),
    (
        "pt",
        &[
            "o", "os", "as", "e", "não", "uma", "olá", "saída", "bem-vindo", "aberto",
            "fechado", "obrigado", "entrada", "empurre", "puxe",
        ],
        "ãõ",
    ),
    (
        "nl",
        &[
            "de", "het", "een", "en", "is", "niet", "hallo", "uitgang", "welkom", "open",
            "gesloten", "dank", "ingang", "duwen", "trekken",
        ],
        "",
    ),
    (
        "vi",
        &["và", "là", "của", "không", "xin", "chào", "lối", "ra", "cảm", "ơn", "mở", "đóng"],
        "ăđơưạảấầẩẫậắằẳẵặẹẻẽếềểễệỉịọỏốồổỗộớờởỡợụủứừửữựỳỵỷỹ",
    ),
];

/// Built-in identifier using Unicode script ranges plus stop-word and
/// diacritic evidence for Latin-script languages.
///
/// Text with no usable evidence yields a single `und` candidate.
#[derive(Debug, Default, Clone)]
pub struct ScriptLanguageIdentifier;

impl ScriptLanguageIdentifier {
    fn rank(text: &str) -> Vec<LanguageCandidate> {
        let mut script_counts: HashMap<&'static str, usize> = HashMap::new();
        let mut latin_letters = 0usize;
        let mut letters = 0usize;

        for c in text.chars().filter(|c| c.is_alphabetic()) {
            letters += 1;
            if c.is_ascii_alphabetic() || matches!(c, '\u{00C0}'..='\u{024F}' | '\u{1E00}'..='\u{1EFF}') {
                latin_letters += 1;
            } else if let Some(code) = script_language(c) {
                *script_counts.entry(code).or_default() += 1;
            }
        }

        if letters == 0 {
            return vec![undetermined()];
        }

        // Kana anywhere means Japanese, even when kanji dominate.
        if let Some(kana) = script_counts.get("ja").copied() {
            if kana > 0 {
                let han = script_counts.remove("zh").unwrap_or(0);
                *script_counts.entry("ja").or_default() += han;
            }
        }

        let mut candidates: Vec<LanguageCandidate> = script_counts
            .into_iter()
            .filter_map(|(code, count)| {
                let tag = LanguageTag::parse(code).ok()?;
                Some(LanguageCandidate::new(tag, count as f32 / letters as f32))
            })
            .collect();

        if latin_letters > 0 {
            let latin_share = latin_letters as f32 / letters as f32;
            candidates.extend(Self::rank_latin(text, latin_share));
        }

        if candidates.is_empty() {
            return vec![undetermined()];
        }
        candidates
    }

    fn rank_latin(text: &str, share: f32) -> Vec<LanguageCandidate> {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !(c.is_alphabetic() || c == '-'))
            .filter(|w| !w.is_empty())
            .collect();

        let hits: Vec<(&str, usize)> = LATIN_EVIDENCE
            .iter()
            .map(|(code, stopwords, marks)| {
                let word_hits = words.iter().filter(|w| stopwords.contains(*w)).count();
                let mark_hits = lowered.chars().filter(|c| marks.contains(*c)).count();
                (*code, word_hits + mark_hits)
            })
            .filter(|(_, count)| *count > 0)
            .collect();

        let total: usize = hits.iter().map(|(_, count)| count).sum();
        if total == 0 {
            return Vec::new();
        }

        hits.into_iter()
            .filter_map(|(code, count)| {
                let tag = LanguageTag::parse(code).ok()?;
                Some(LanguageCandidate::new(tag, share * count as f32 / total as f32))
            })
            .collect()
    }
}

fn undetermined() -> LanguageCandidate {
    LanguageCandidate::new(LanguageTag::undetermined(), 1.0)
}

#[async_trait]
impl LanguageIdentifier for ScriptLanguageIdentifier {
    fn name(&self) -> &str {
        "script-heuristic"
    }

    async fn identify(&self, text: &str) -> Result<Vec<LanguageCandidate>, DetectionError> {
        Ok(Self::rank(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tag(code: &str) -> LanguageTag {
        LanguageTag::parse(code).unwrap()
    }

    struct Fixed(Vec<LanguageCandidate>);

    #[async_trait]
    impl LanguageIdentifier for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn identify(&self, _text: &str) -> Result<Vec<LanguageCandidate>, DetectionError> {
            Ok(self.0.clone())
        }
    }

    fn stage_with(candidates: Vec<(&str, f32)>) -> DetectionStage {
        let candidates = candidates
            .into_iter()
            .map(|(code, conf)| LanguageCandidate::new(tag(code), conf))
            .collect();
        DetectionStage::new(Arc::new(Fixed(candidates)), DEFAULT_AMBIGUITY_MARGIN)
    }

    #[tokio::test]
    async fn test_small_gap_is_ambiguous() {
        let stage = stage_with(vec![("fr", 0.40), ("en", 0.45)]);
        let outcome = stage.detect("chat").await.unwrap();
        match outcome {
            DetectionOutcome::Ambiguous { candidates } => {
                assert_eq!(candidates[0].tag, tag("en"));
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("expected ambiguous, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clear_winner_is_detected() {
        let stage = stage_with(vec![("en", 0.95), ("fr", 0.03)]);
        assert_eq!(
            stage.detect("HELLO").await.unwrap(),
            DetectionOutcome::Detected {
                tag: tag("en"),
                confidence: 0.95
            }
        );

        let empty = stage_with(vec![]);
        assert!(matches!(empty.detect("").await.unwrap(), DetectionOutcome::Ambiguous { .. }));
    }

    fn candidates(ranked: &[(&str, f32)]) -> Vec<LanguageCandidate> {
        ranked
            .iter()
            .map(|(code, conf)| LanguageCandidate::new(tag(code), *conf))
            .collect()
    }

    #[test]
    fn test_gap_equal_to_margin_is_decisive() {
        for ranked in [[("en", 0.95), ("fr", 0.80)], [("en", 0.65), ("fr", 0.50)]] {
            assert!(
                matches!(
                    decide(candidates(&ranked), DEFAULT_AMBIGUITY_MARGIN),
                    DetectionOutcome::Detected { .. }
                ),
                "{:?}",
                ranked
            );
        }

        assert!(matches!(
            decide(candidates(&[("en", 0.95), ("fr", 0.81)]), DEFAULT_AMBIGUITY_MARGIN),
            DetectionOutcome::Ambiguous { .. }
        ));
        assert!(matches!(
            decide(candidates(&[("en", 0.50), ("fr", 0.50)]), 0.0),
            DetectionOutcome::Detected { .. }
        ));
    }

    #[tokio::test]
    async fn test_undetermined_maps_to_ambiguous() {
        let stage = DetectionStage::new(Arc::new(ScriptLanguageIdentifier), DEFAULT_AMBIGUITY_MARGIN);
        assert!(matches!(
            stage.detect("1234 !!").await.unwrap(),
            DetectionOutcome::Ambiguous { .. }
        ));
        assert!(matches!(
            stage.detect("xyzzy").await.unwrap(),
            DetectionOutcome::Ambiguous { .. }
        ));
    }

    #[tokio::test]
    async fn test_script_identifier() {
        let stage = DetectionStage::new(Arc::new(ScriptLanguageIdentifier), DEFAULT_AMBIGUITY_MARGIN);

        let cases = [
            ("HELLO", "en"),
            ("Bienvenue, sortie à gauche", "fr"),
            ("Выход", "ru"),
            ("出口はこちらです", "ja"),
            ("出口", "zh"),
            ("비상구", "ko"),
            ("Xin chào và cảm ơn", "vi"),
        ];

        for (text, expected) in cases {
            match stage.detect(text).await.unwrap() {
                DetectionOutcome::Detected { tag: detected, .. } => {
                    assert_eq!(detected, tag(expected), "text: {}", text)
                }
                other => panic!("{} was {:?}", text, other),
            }
        }
    }
}
