//! Raw article input accepted by the pipeline.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validator::Validate;

use crate::error::{Error, Result};

/// Maximum document id length (matches the relational primary key column).
pub const MAX_DOCUMENT_ID_LEN: u64 = 255;

/// A structured article submitted for enrichment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct ArticleInput {
    /// Upstream identifier, used as the storage key.
    #[validate(length(min = 1, max = 255))]
    pub document_id: String,
    /// Raw, unstructured text content.
    #[validate(length(min = 1))]
    pub text: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub excerpt: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub publication_date: Option<NaiveDate>,
    #[serde(default)]
    pub revision_date: Option<NaiveDate>,
    #[serde(default)]
    #[validate(url)]
    pub source_url: Option<String>,
    #[serde(default)]
    pub categories: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    #[serde(default)]
    pub media_asset_urls: Option<Vec<String>>,
    #[serde(default)]
    pub geographical_data: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub embargo_date: Option<NaiveDate>,
    #[serde(default)]
    pub sentiment: Option<String>,
    #[serde(default)]
    #[validate(range(min = 0))]
    pub word_count: Option<i32>,
    #[serde(default)]
    pub publisher: Option<String>,
    #[serde(default)]
    pub additional_metadata: Option<BTreeMap<String, Value>>,
}

impl ArticleInput {
    /// Article with only the required fields.
    pub fn new(document_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            document_id: document_id.into(),
            text: text.into(),
            title: None,
            excerpt: None,
            author: None,
            publication_date: None,
            revision_date: None,
            source_url: None,
            categories: None,
            tags: None,
            media_asset_urls: None,
            geographical_data: None,
            embargo_date: None,
            sentiment: None,
            word_count: None,
            publisher: None,
            additional_metadata: None,
        }
    }

    /// Parses and validates an article from a raw JSON payload.
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let article: ArticleInput = serde_json::from_value(payload.clone())
            .map_err(|e| Error::validation(format!("invalid article payload: {}", e)))?;
        article.check()?;
        Ok(article)
    }

    /// Runs field validation, flattening validator output into one message.
    pub fn check(&self) -> Result<()> {
        self.validate()
            .map_err(|e| Error::validation(e.to_string().replace('\n', "; ")))?;
        if self.text.trim().is_empty() {
            return Err(Error::validation("text must not be blank"));
        }
        Ok(())
    }
}

/// Text cleaning switches passed to the enrichment capability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleaningOptions {
    pub remove_html: bool,
    pub normalize_whitespace: bool,
    pub strip_special_chars: bool,
    pub lowercase: bool,
}

impl Default for CleaningOptions {
    fn default() -> Self {
        Self {
            remove_html: true,
            normalize_whitespace: true,
            strip_special_chars: true,
            lowercase: false,
        }
    }
}
