//! Enrichment capability boundary.
//!
//! The pipeline treats enrichment as an opaque call mapping an article to
//! cleaned fields, a normalized date and entity spans. `BasicEnricher` is the
//! built-in implementation: rule-based cleaning with no entity model.

use std::collections::{BTreeMap, HashSet};
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::NaiveDate;
use regex::Regex;
use serde_json::Value;

use crate::article::{ArticleInput, CleaningOptions};
use crate::error::Result;
use crate::record::Entity;

static HTML_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"<[^>]*?>").expect("invalid HTML tag pattern"));
static WHITESPACE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("invalid whitespace pattern"));
static SPECIAL_CHARS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\w\s.,?!\-]").expect("invalid special character pattern")
});

/// Values produced by an enrichment call, used to build a `Record`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EnrichedFields {
    pub cleaned_text: String,
    pub temporal_metadata: Option<String>,
    pub entities: Vec<Entity>,
    pub title: Option<String>,
    pub excerpt: Option<String>,
    pub author: Option<String>,
    pub publication_date: Option<NaiveDate>,
    pub revision_date: Option<NaiveDate>,
    pub source_url: Option<String>,
    pub categories: Option<Vec<String>>,
    pub tags: Option<Vec<String>>,
    pub media_asset_urls: Option<Vec<String>>,
    pub geographical_data: Option<BTreeMap<String, Value>>,
    pub embargo_date: Option<NaiveDate>,
    pub sentiment: Option<String>,
    pub word_count: Option<i32>,
    pub publisher: Option<String>,
    pub additional_metadata: Option<BTreeMap<String, Value>>,
}

/// External enrichment capability.
///
/// Any error returned here fails the current attempt and drives task-level
/// retry.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn enrich(
        &self,
        article: &ArticleInput,
        options: &CleaningOptions,
    ) -> Result<EnrichedFields>;
}

/// Rule-based text cleaner.
#[derive(Debug, Clone, Default)]
pub struct TextCleaner {
    options: CleaningOptions,
}

impl TextCleaner {
    pub fn new(options: CleaningOptions) -> Self {
        Self { options }
    }

    /// Cleans a body of text according to the configured options.
    pub fn clean(&self, text: &str) -> String {
        let mut cleaned = text.to_string();
        if self.options.remove_html {
            cleaned = HTML_TAG.replace_all(&cleaned, "").into_owned();
        }
        if self.options.normalize_whitespace {
            cleaned = WHITESPACE.replace_all(&cleaned, " ").trim().to_string();
        }
        if self.options.strip_special_chars {
            cleaned = SPECIAL_CHARS.replace_all(&cleaned, "").into_owned();
        }
        if self.options.lowercase {
            cleaned = cleaned.to_lowercase();
        }
        cleaned
    }

    /// Cleans a short metadata string; blank results become `None`.
    pub fn clean_field(&self, value: Option<&str>) -> Option<String> {
        let value = value?;
        let mut cleaned = HTML_TAG.replace_all(value, "").into_owned();
        cleaned = WHITESPACE.replace_all(&cleaned, " ").trim().to_string();
        (!cleaned.is_empty()).then_some(cleaned)
    }

    /// Cleans a list of labels, dropping blanks and duplicates in order.
    pub fn clean_list(&self, values: Option<&[String]>) -> Option<Vec<String>> {
        let values = values?;
        let mut seen = HashSet::new();
        let cleaned: Vec<String> = values
            .iter()
            .filter_map(|v| self.clean_field(Some(v)))
            .filter(|v| seen.insert(v.to_lowercase()))
            .collect();
        Some(cleaned)
    }
}

/// Built-in enricher: cleaning plus date normalization, no entity tagging.
#[derive(Debug, Clone, Default)]
pub struct BasicEnricher;

impl BasicEnricher {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Enricher for BasicEnricher {
    async fn enrich(
        &self,
        article: &ArticleInput,
        options: &CleaningOptions,
    ) -> Result<EnrichedFields> {
        let cleaner = TextCleaner::new(options.clone());
        let cleaned_text = cleaner.clean(&article.text);

        let word_count = article
            .word_count
            .or_else(|| i32::try_from(cleaned_text.split_whitespace().count()).ok());

        let media_asset_urls = article.media_asset_urls.as_ref().map(|urls| {
            urls.iter()
                .map(|u| u.trim().to_string())
                .filter(|u| !u.is_empty())
                .collect()
        });

        Ok(EnrichedFields {
            temporal_metadata: article
                .publication_date
                .map(|d| d.format("%Y-%m-%d").to_string()),
            entities: Vec::new(),
            title: cleaner.clean_field(article.title.as_deref()),
            excerpt: cleaner.clean_field(article.excerpt.as_deref()),
            author: cleaner.clean_field(article.author.as_deref()),
            publication_date: article.publication_date,
            revision_date: article.revision_date,
            source_url: article.source_url.as_ref().map(|u| u.trim().to_string()),
            categories: cleaner.clean_list(article.categories.as_deref()),
            tags: cleaner.clean_list(article.tags.as_deref()),
            media_asset_urls,
            geographical_data: article.geographical_data.clone(),
            embargo_date: article.embargo_date,
            sentiment: cleaner
                .clean_field(article.sentiment.as_deref())
                .map(|s| s.to_lowercase()),
            word_count,
            publisher: cleaner.clean_field(article.publisher.as_deref()),
            additional_metadata: article.additional_metadata.clone(),
            cleaned_text,
        })
    }
}
