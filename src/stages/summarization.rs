//! # Summarization Stage
//!
//! Extractive summaries of longer recognized text (menus, notices, page
//! photos). Sentences are scored by position, length and discourse
//! keywords; the best ones are kept in their original order.
//!
//! ## Modes:
//! - **brief**: the two best sentences
//! - **detailed**: up to five sentences
//! - **bullet_points**: up to four sentences, one `• ` line each
//! - **key_phrases**: the most frequent longer words
//!
//! The stage only condenses. Translating the summary is left to the
//! pipeline, which runs it through the translation stage and cache like any
//! other text.

use crate::language::LanguageTag;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Shortest text worth summarizing, in characters.
pub const MIN_SUMMARY_INPUT: usize = 100;
/// Longest text accepted for summarization, in characters.
pub const MAX_SUMMARY_INPUT: usize = 10_000;

/// Sentences of this many characters or fewer are treated as fragments.
const MIN_SENTENCE_CHARS: usize = 10;
const MAX_KEY_PHRASES: usize = 8;

const KEYWORDS: &[&str] = &[
    "important", "significant", "key", "main", "primary", "essential", "critical", "major",
    "fundamental", "crucial", "vital", "notable", "first", "second", "third", "finally",
    "conclusion", "result", "because", "therefore", "however", "although", "moreover",
];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SummaryMode {
    #[default]
    Brief,
    Detailed,
    BulletPoints,
    KeyPhrases,
}

impl SummaryMode {
    fn sentence_budget(&self) -> usize {
        match self {
            SummaryMode::Brief => 2,
            SummaryMode::Detailed => 5,
            SummaryMode::BulletPoints => 4,
            SummaryMode::KeyPhrases => 0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SummaryMode::Brief => "brief",
            SummaryMode::Detailed => "detailed",
            SummaryMode::BulletPoints => "bullet_points",
            SummaryMode::KeyPhrases => "key_phrases",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SummarizationError {
    #[error("text is {length} characters; summaries need between {min} and {max}", min = MIN_SUMMARY_INPUT, max = MAX_SUMMARY_INPUT)]
    InputLength { length: usize },

    #[error("text has no complete sentences to summarize")]
    NothingToSummarize,
}

/// A summary, translated when a model for the pair was available.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Summary {
    pub mode: SummaryMode,
    /// Summary in the target language, or the untranslated summary
    pub text: String,
    /// Summary before translation
    pub original: String,
    pub target_language: LanguageTag,
    pub translated: bool,
    /// Why translation was skipped, when it failed
    pub translation_error: Option<String>,
}

impl Summary {
    pub fn untranslated(mode: SummaryMode, original: String, target_language: LanguageTag) -> Self {
        Self {
            mode,
            text: original.clone(),
            original,
            target_language,
            translated: false,
            translation_error: None,
        }
    }
}

/// Condense `text` according to `mode`.
pub fn summarize(text: &str, mode: SummaryMode) -> Result<String, SummarizationError> {
    let text = text.trim();
    let length = text.chars().count();
    if !(MIN_SUMMARY_INPUT..=MAX_SUMMARY_INPUT).contains(&length) {
        return Err(SummarizationError::InputLength { length });
    }

    let summary = match mode {
        SummaryMode::KeyPhrases => key_phrases(text),
        SummaryMode::BulletPoints => important_sentences(text, mode.sentence_budget())
            .iter()
            .map(|sentence| format!("• {}", sentence))
            .collect::<Vec<_>>()
            .join("\n"),
        SummaryMode::Brief | SummaryMode::Detailed => {
            important_sentences(text, mode.sentence_budget()).join(" ")
        }
    };

    if summary.is_empty() {
        return Err(SummarizationError::NothingToSummarize);
    }
    tracing::debug!(mode = mode.as_str(), input_chars = length, summary_chars = summary.chars().count(), "Summarized text");
    Ok(summary)
}

/// Sentences with their terminating punctuation, fragments dropped.
fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        current.push(c);
        if matches!(c, '.' | '!' | '?') {
            while let Some(&next) = chars.peek() {
                if !matches!(next, '.' | '!' | '?') {
                    break;
                }
                current.push(next);
                chars.next();
            }
            sentences.push(std::mem::take(&mut current));
        }
    }
    sentences.push(current);

    sentences
        .into_iter()
        .map(|sentence| sentence.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|sentence| {
            let body = sentence.trim_end_matches(['.', '!', '?']);
            body.chars().count() > MIN_SENTENCE_CHARS
        })
        .collect()
}

fn sentence_score(sentence: &str, index: usize, count: usize) -> f64 {
    let position = if index == 0 {
        3.0
    } else if index == count - 1 {
        2.0
    } else if (index as f64) < count as f64 * 0.3 {
        1.5
    } else {
        1.0
    };

    let length = match sentence.chars().count() {
        n if n < 50 => 0.5,
        n if n > 200 => 0.7,
        _ => 1.0,
    };

    let lowered = sentence.to_lowercase();
    let keywords = KEYWORDS.iter().filter(|k| lowered.contains(*k)).count();

    position * length * (1.0 + keywords as f64 * 0.1)
}

/// The `budget` best-scoring sentences, in reading order.
fn important_sentences(text: &str, budget: usize) -> Vec<String> {
    let sentences = split_sentences(text);
    if sentences.len() <= budget {
        return sentences;
    }

    let count = sentences.len();
    let mut scored: Vec<(usize, f64)> = sentences
        .iter()
        .enumerate()
        .map(|(index, sentence)| (index, sentence_score(sentence, index, count)))
        .collect();
    // Stable: equal scores keep reading order.
    scored.sort_by(|a, b| b.1.total_cmp(&a.1));
    scored.truncate(budget);
    scored.sort_by_key(|(index, _)| *index);

    scored
        .into_iter()
        .map(|(index, _)| sentences[index].clone())
        .collect()
}

/// Most frequent words longer than three letters; ties go to the earlier word.
fn key_phrases(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();

    for (position, word) in lowered
        .split(|c: char| !c.is_alphabetic())
        .filter(|word| word.chars().count() > 3)
        .enumerate()
    {
        counts.entry(word).or_insert((0, position)).0 += 1;
    }

    let mut ranked: Vec<(&str, usize, usize)> = counts
        .into_iter()
        .map(|(word, (count, first))| (word, count, first))
        .collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

    if ranked.is_empty() {
        return String::new();
    }
    let terms: Vec<&str> = ranked
        .into_iter()
        .take(MAX_KEY_PHRASES)
        .map(|(word, _, _)| word)
        .collect();
    format!("Key terms: {}", terms.join(", "))
}
