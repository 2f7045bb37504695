//! Core domain model, normalization and deduplication for Job Radar.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "jobradar-core";

/// Unvalidated record as extracted from a listing page. Discarded after
/// normalization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawRecord {
    pub title: Option<String>,
    pub company: Option<String>,
    /// Apply link as found in the markup; may be relative to the page.
    pub href: Option<String>,
}

/// Normalized posting that has passed validation but is not yet persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewJob {
    pub title: String,
    pub company: Option<String>,
    /// Canonical absolute URL; the natural key across all postings.
    pub url: String,
}

/// Durable posting. `id` is assigned by storage on insert and stable for
/// the record's lifetime; `url` is unique across all postings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosting {
    pub id: i64,
    pub title: String,
    pub company: Option<String>,
    pub url: String,
}

fn text_or_none(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Canonicalize one raw record against the base URL of the page it was
/// extracted from. Returns `None` when the record lacks a non-empty title
/// or a resolvable URL; such records never reach storage.
pub fn normalize(raw: RawRecord, base: &Url) -> Option<NewJob> {
    let title = raw.title.as_deref().and_then(text_or_none)?;
    let href = raw.href.as_deref().and_then(text_or_none)?;
    let url = base.join(&href).ok()?;
    Some(NewJob {
        title,
        company: raw.company.as_deref().and_then(text_or_none),
        url: url.to_string(),
    })
}

/// Collapse a batch to one record per canonical URL, keeping the first
/// occurrence. Output order is the order of first appearance, which feeds
/// the newest-first cache ordering once storage assigns insertion order.
pub fn dedupe_by_url(jobs: Vec<NewJob>) -> Vec<NewJob> {
    let mut seen = HashSet::with_capacity(jobs.len());
    jobs.into_iter()
        .filter(|job| seen.insert(job.url.clone()))
        .collect()
}
