//! Core data models used throughout the corpus pipeline.
//!
//! These types represent the records, groups, batches, and scored output that
//! flow from the store through grouping and scoring back into the corpus.

use serde::Serialize;

/// One issue-tracker record as loaded from the `records` table.
///
/// Relation fields (`urls`, `artifacts`, `pages`) hold raw comma- or
/// semicolon-delimited text; grouping sanitizes them into relation values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub key: String,
    pub summary: String,
    pub description: Option<String>,
    pub comments: Option<String>,
    pub urls: Option<String>,
    pub artifacts: Option<String>,
    pub pages: Option<String>,
}

impl Record {
    /// A record with a summary and no other fields.
    pub fn new(key: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            summary: summary.into(),
            description: None,
            comments: None,
            urls: None,
            artifacts: None,
            pages: None,
        }
    }

    pub fn with_urls(mut self, urls: impl Into<String>) -> Self {
        self.urls = Some(urls.into());
        self
    }

    pub fn with_artifacts(mut self, artifacts: impl Into<String>) -> Self {
        self.artifacts = Some(artifacts.into());
        self
    }

    pub fn with_pages(mut self, pages: impl Into<String>) -> Self {
        self.pages = Some(pages.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Raw relation fields, in a fixed order.
    pub fn relation_fields(&self) -> [Option<&str>; 3] {
        [
            self.urls.as_deref(),
            self.artifacts.as_deref(),
            self.pages.as_deref(),
        ]
    }

    /// Free-text fields handed to the scorer.
    pub fn text_fields(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.summary.as_str())
            .chain(self.description.as_deref())
            .chain(self.comments.as_deref())
    }
}

/// A maximal set of records connected through shared relation values.
/// Keys are kept in discovery order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Group {
    pub keys: Vec<String>,
}

impl Group {
    pub fn singleton(key: impl Into<String>) -> Self {
        Self {
            keys: vec![key.into()],
        }
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

/// A size-bounded, group-preserving chunk of records for the scorer.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Position of this batch in the run, starting at 1.
    pub index: usize,
    pub records: Vec<Record>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn last_key(&self) -> Option<&str> {
        self.records.last().map(|r| r.key.as_str())
    }
}

/// Scorer output for one record: its term counts, ready to persist.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoredRecord {
    pub key: String,
    pub token_count: u64,
    pub terms: Vec<(String, u32)>,
}

/// Anything processed item-by-item under recovery needs a stable key for
/// error attribution.
pub trait WorkItem {
    fn item_key(&self) -> &str;
}

impl WorkItem for Record {
    fn item_key(&self) -> &str {
        &self.key
    }
}

impl WorkItem for ScoredRecord {
    fn item_key(&self) -> &str {
        &self.key
    }
}
