//! Core domain model and text canonicalization for Pulse.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "pulse-core";

/// Sentiment class shared by both classifier capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SentimentClass {
    Positive,
    Negative,
    Neutral,
}

impl SentimentClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            SentimentClass::Positive => "POSITIVE",
            SentimentClass::Negative => "NEGATIVE",
            SentimentClass::Neutral => "NEUTRAL",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "POSITIVE" => Some(SentimentClass::Positive),
            "NEGATIVE" => Some(SentimentClass::Negative),
            "NEUTRAL" => Some(SentimentClass::Neutral),
            _ => None,
        }
    }
}

/// One classifier verdict: a class plus the classifier's confidence score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SentimentLabel {
    pub class: SentimentClass,
    pub score: f64,
}

/// A stored post. `id` is assigned by the remote source and is the primary
/// key; `inserted_at` is stamped by the store at first persistence and never
/// changes afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub raw_text: String,
    pub normalized_text: String,
    pub label_a: Option<SentimentLabel>,
    pub label_b: Option<SentimentLabel>,
    pub inserted_at: DateTime<Utc>,
}

impl Record {
    pub fn is_fully_labeled(&self) -> bool {
        self.label_a.is_some() && self.label_b.is_some()
    }
}

/// Insert shape handed to the store. Labels are absent by construction and
/// `inserted_at` does not exist yet, so a freshly ingested record always
/// starts its lifecycle unlabeled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecord {
    pub id: String,
    pub query: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub raw_text: String,
    pub normalized_text: String,
}

impl NewRecord {
    pub fn into_record(self, inserted_at: DateTime<Utc>) -> Record {
        Record {
            id: self.id,
            query: self.query,
            timestamp: self.timestamp,
            author: self.author,
            raw_text: self.raw_text,
            normalized_text: self.normalized_text,
            label_a: None,
            label_b: None,
            inserted_at,
        }
    }
}

/// Fixed stop-word set applied by [`normalize`].
const STOP_WORDS: &[&str] = &[
    "a", "about", "after", "all", "an", "and", "any", "are", "as", "at", "be",
    "because", "been", "but", "by", "can", "could", "did", "do", "does", "for",
    "from", "had", "has", "have", "he", "her", "his", "how", "i", "if", "in",
    "into", "is", "it", "its", "just", "me", "more", "most", "my", "no", "not",
    "of", "on", "or", "our", "out", "she", "so", "some", "such", "than",
    "that", "the", "their", "them", "then", "there", "these", "they", "this",
    "to", "up", "was", "we", "were", "what", "when", "which", "who", "will",
    "with", "would", "you", "your",
];

fn is_stop_word(token: &str) -> bool {
    STOP_WORDS.contains(&token)
}

fn is_url_token(token: &str) -> bool {
    token.starts_with("http://") || token.starts_with("https://") || token.starts_with("www.")
}

/// Canonicalize raw post text into classifier input.
///
/// Pure and total: the same input always yields the same output, and any
/// input (including empty or non-text garbage) yields a valid string. URL
/// and `@mention` tokens are dropped, `#` markers stripped, everything
/// outside ASCII alphanumerics (pictographs included) becomes whitespace,
/// whitespace collapses to single spaces, the result is lowercased and
/// stop words are removed.
pub fn normalize(raw: &str) -> String {
    let kept = raw
        .split_whitespace()
        .filter(|token| !is_url_token(token) && !token.starts_with('@'))
        .map(|token| token.trim_start_matches('#'))
        .collect::<Vec<_>>()
        .join(" ");

    let ascii = kept
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                ' '
            }
        })
        .collect::<String>();

    ascii
        .split_whitespace()
        .filter(|token| !is_stop_word(token))
        .collect::<Vec<_>>()
        .join(" ")
}
