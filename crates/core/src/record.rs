//! Canonical enriched-document record passed to every storage backend.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::enrichment::EnrichedFields;
use crate::error::{Error, Result};

/// Schema version stamped on every record.
pub const SCHEMA_VERSION: &str = "1.0";

/// A named entity span over the cleaned text.
///
/// `start_char` and `end_char` are character offsets; `end_char` is exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub text: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    pub start_char: usize,
    pub end_char: usize,
}

impl Entity {
    pub fn new(
        text: impl Into<String>,
        entity_type: impl Into<String>,
        start_char: usize,
        end_char: usize,
    ) -> Self {
        Self {
            text: text.into(),
            entity_type: entity_type.into(),
            start_char,
            end_char,
        }
    }
}

/// Enriched document, keyed by `document_id` in every backend.
///
/// Built once per execution attempt and never modified afterwards; backends
/// only ever receive shared references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub document_id: String,
    pub version: String,
    pub original_text: String,
    pub cleaned_text: String,
    pub cleaned_title: Option<String>,
    pub cleaned_excerpt: Option<String>,
    pub cleaned_author: Option<String>,
    pub cleaned_publication_date: Option<NaiveDate>,
    pub cleaned_revision_date: Option<NaiveDate>,
    pub cleaned_source_url: Option<String>,
    pub cleaned_categories: Option<Vec<String>>,
    pub cleaned_tags: Option<Vec<String>>,
    pub cleaned_media_asset_urls: Option<Vec<String>>,
    pub cleaned_geographical_data: Option<BTreeMap<String, Value>>,
    pub cleaned_embargo_date: Option<NaiveDate>,
    pub cleaned_sentiment: Option<String>,
    pub cleaned_word_count: Option<i32>,
    pub cleaned_publisher: Option<String>,
    /// Normalized `YYYY-MM-DD` date, if one was found.
    pub temporal_metadata: Option<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    pub cleaned_additional_metadata: Option<BTreeMap<String, Value>>,
}

impl Record {
    /// Builds a record from the enrichment output.
    ///
    /// Rejects entity spans that are inverted or fall outside the cleaned text.
    pub fn from_enriched(
        document_id: impl Into<String>,
        original_text: impl Into<String>,
        fields: EnrichedFields,
    ) -> Result<Self> {
        let document_id = document_id.into();
        if document_id.trim().is_empty() {
            return Err(Error::validation("document_id must not be empty"));
        }

        let text_len = fields.cleaned_text.chars().count();
        for entity in &fields.entities {
            if entity.start_char > entity.end_char {
                return Err(Error::enrichment(format!(
                    "entity '{}' has start_char {} > end_char {}",
                    entity.text, entity.start_char, entity.end_char
                )));
            }
            if entity.end_char > text_len {
                return Err(Error::enrichment(format!(
                    "entity '{}' ends at {} beyond cleaned text length {}",
                    entity.text, entity.end_char, text_len
                )));
            }
        }

        Ok(Self {
            document_id,
            version: SCHEMA_VERSION.to_string(),
            original_text: original_text.into(),
            cleaned_text: fields.cleaned_text,
            cleaned_title: fields.title,
            cleaned_excerpt: fields.excerpt,
            cleaned_author: fields.author,
            cleaned_publication_date: fields.publication_date,
            cleaned_revision_date: fields.revision_date,
            cleaned_source_url: fields.source_url,
            cleaned_categories: fields.categories,
            cleaned_tags: fields.tags,
            cleaned_media_asset_urls: fields.media_asset_urls,
            cleaned_geographical_data: fields.geographical_data,
            cleaned_embargo_date: fields.embargo_date,
            cleaned_sentiment: fields.sentiment,
            cleaned_word_count: fields.word_count,
            cleaned_publisher: fields.publisher,
            temporal_metadata: fields.temporal_metadata,
            entities: fields.entities,
            cleaned_additional_metadata: fields.additional_metadata,
        })
    }

    /// Minimal record with only the required text fields set.
    pub fn minimal(
        document_id: impl Into<String>,
        original_text: impl Into<String>,
        cleaned_text: impl Into<String>,
    ) -> Self {
        Self {
            document_id: document_id.into(),
            version: SCHEMA_VERSION.to_string(),
            original_text: original_text.into(),
            cleaned_text: cleaned_text.into(),
            cleaned_title: None,
            cleaned_excerpt: None,
            cleaned_author: None,
            cleaned_publication_date: None,
            cleaned_revision_date: None,
            cleaned_source_url: None,
            cleaned_categories: None,
            cleaned_tags: None,
            cleaned_media_asset_urls: None,
            cleaned_geographical_data: None,
            cleaned_embargo_date: None,
            cleaned_sentiment: None,
            cleaned_word_count: None,
            cleaned_publisher: None,
            temporal_metadata: None,
            entities: Vec::new(),
            cleaned_additional_metadata: None,
        }
    }

    /// Serializes the record as a single JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}
