//! Downstream scorer abstraction.
//!
//! A [`Scorer`] turns a [`Batch`] of records into [`ScoredRecord`]s ready to
//! persist into the corpus tables. The variant is chosen by configuration
//! (`pipeline.scorer`) and instantiated through [`create_scorer`]:
//!
//! - **[`TermFrequencyScorer`]**: tokenizes summary, description and
//!   comments and counts terms per record.
//! - **[`DisabledScorer`]**: registers documents without terms.
//!
//! ```rust
//! # use ticket_corpus::scorer::{create_scorer, ScorerKind};
//! let scorer = create_scorer(ScorerKind::default());
//! assert_eq!(scorer.kind(), ScorerKind::TermFrequency);
//! ```

use std::collections::HashMap;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::models::{Batch, Record, ScoredRecord};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScorerKind {
    #[default]
    TermFrequency,
    Disabled,
}

impl ScorerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ScorerKind::TermFrequency => "term_frequency",
            ScorerKind::Disabled => "disabled",
        }
    }
}

pub trait Scorer: Send + Sync {
    fn kind(&self) -> ScorerKind;

    /// Score every record of `batch`, preserving order.
    fn score_batch(&self, batch: &Batch) -> Result<Vec<ScoredRecord>>;
}

pub fn create_scorer(kind: ScorerKind) -> Box<dyn Scorer> {
    match kind {
        ScorerKind::TermFrequency => Box::new(TermFrequencyScorer::default()),
        ScorerKind::Disabled => Box::new(DisabledScorer),
    }
}

// ============ Term frequency ============

const STOP_WORDS: &[&str] = &[
    "an", "and", "are", "as", "at", "be", "but", "by", "for", "from", "has", "have", "if", "in",
    "into", "is", "it", "its", "not", "of", "on", "or", "so", "that", "the", "then", "there",
    "this", "to", "was", "were", "when", "with",
];

pub struct TermFrequencyScorer {
    min_len: usize,
    max_len: usize,
}

impl Default for TermFrequencyScorer {
    fn default() -> Self {
        Self {
            min_len: 2,
            max_len: 40,
        }
    }
}

impl TermFrequencyScorer {
    /// Split `text` into lower-case alphanumeric terms, dropping stop words,
    /// purely numeric tokens and tokens outside the length bounds.
    pub fn tokenize<'a>(&'a self, text: &'a str) -> impl Iterator<Item = String> + 'a {
        text.split(|c: char| !c.is_alphanumeric())
            .filter(move |t| {
                let len = t.chars().count();
                len >= self.min_len && len <= self.max_len
            })
            .filter(|t| !t.chars().all(|c| c.is_numeric()))
            .map(|t| t.to_lowercase())
            .filter(|t| !STOP_WORDS.contains(&t.as_str()))
    }

    pub fn score_record(&self, record: &Record) -> ScoredRecord {
        let mut counts: HashMap<String, u32> = HashMap::new();
        let mut token_count = 0u64;
        for field in record.text_fields() {
            for term in self.tokenize(field) {
                token_count += 1;
                *counts.entry(term).or_insert(0) += 1;
            }
        }

        let mut terms: Vec<(String, u32)> = counts.into_iter().collect();
        terms.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));

        ScoredRecord {
            key: record.key.clone(),
            token_count,
            terms,
        }
    }
}

impl Scorer for TermFrequencyScorer {
    fn kind(&self) -> ScorerKind {
        ScorerKind::TermFrequency
    }

    fn score_batch(&self, batch: &Batch) -> Result<Vec<ScoredRecord>> {
        Ok(batch.records.iter().map(|r| self.score_record(r)).collect())
    }
}

// ============ Disabled ============

/// Registers every record as a corpus document with no terms.
pub struct DisabledScorer;

impl Scorer for DisabledScorer {
    fn kind(&self) -> ScorerKind {
        ScorerKind::Disabled
    }

    fn score_batch(&self, batch: &Batch) -> Result<Vec<ScoredRecord>> {
        Ok(batch
            .records
            .iter()
            .map(|r| ScoredRecord {
                key: r.key.clone(),
                token_count: 0,
                terms: Vec::new(),
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenizer_filters_noise() {
        let scorer = TermFrequencyScorer::default();
        let terms: Vec<String> = scorer
            .tokenize("The Login page crashes on IE11, see 404 and x; retry-LOGIN")
            .collect();
        assert_eq!(
            terms,
            vec!["login", "page", "crashes", "ie11", "see", "retry", "login"]
        );
    }

    #[test]
    fn tokenizer_drops_overlong_tokens() {
        let scorer = TermFrequencyScorer::default();
        let long = "a".repeat(41);
        let text = format!("{long} ok");
        let terms: Vec<String> = scorer.tokenize(&text).collect();
        assert_eq!(terms, vec!["ok"]);
    }

    #[test]
    fn counts_terms_across_text_fields() {
        let record = Record::new("T-1", "Crash in exporter")
            .with_description("Exporter crash when saving");
        let scored = TermFrequencyScorer::default().score_record(&record);
        assert_eq!(scored.key, "T-1");
        // "in" is a stop word
        assert_eq!(scored.token_count, 5);
        assert_eq!(scored.terms[0], ("crash".to_string(), 2));
        assert_eq!(scored.terms[1], ("exporter".to_string(), 2));
        assert!(scored.terms.contains(&("saving".to_string(), 1)));
    }

    #[test]
    fn batch_order_is_preserved() {
        let batch = Batch {
            index: 1,
            records: vec![Record::new("B", "beta"), Record::new("A", "alpha")],
        };
        let scored = create_scorer(ScorerKind::TermFrequency)
            .score_batch(&batch)
            .unwrap();
        let keys: Vec<&str> = scored.iter().map(|s| s.key.as_str()).collect();
        assert_eq!(keys, vec!["B", "A"]);
    }

    #[test]
    fn disabled_scorer_keeps_documents_without_terms() {
        let batch = Batch {
            index: 1,
            records: vec![Record::new("A", "alpha beta")],
        };
        let scorer = create_scorer(ScorerKind::Disabled);
        assert_eq!(scorer.kind(), ScorerKind::Disabled);
        let scored = scorer.score_batch(&batch).unwrap();
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].token_count, 0);
        assert!(scored[0].terms.is_empty());
    }
}
