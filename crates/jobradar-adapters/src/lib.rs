//! Source adapter contract + markup-specific listing extractors.
//!
//! Each adapter owns one external board: how to fetch its listing page and
//! how to read its repeating markup. Everything downstream of the adapter
//! sees only [`RawRecord`]s, so boards can be added or removed without
//! touching normalization, dedup or storage.

use std::time::Duration;

use async_trait::async_trait;
use jobradar_core::RawRecord;
use jobradar_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobradar-adapters";

/// Cap on listing elements consumed from one page.
pub const MAX_LISTINGS_PER_PAGE: usize = 100;

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid selector {selector}: {message}")]
    Selector { selector: String, message: String },
}

/// Shape of the repeating listing markup a board serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMarkup {
    /// Card grid: `div.card` with `h2.title` / `h3.company` and footer
    /// apply links.
    Cards,
    /// Table rows: `tr.job` with `h2` / `.company` and a `data-url`
    /// attribute on the row.
    Rows,
}

/// One external listing source. Adapters are stateless between runs and
/// never assume another adapter has run.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;

    /// Base URL against which relative apply links resolve.
    fn base_url(&self) -> &Url;

    /// GET the listing page within this source's timeout.
    async fn fetch(&self, http: &HttpFetcher, run_id: Uuid) -> Result<String, FetchError>;

    /// Read the repeating listing elements. An element missing a title or
    /// an extractable link contributes no record.
    fn extract(&self, html: &str) -> Result<Vec<RawRecord>, ExtractError>;
}

fn parse_selector(selector: &str) -> Result<Selector, ExtractError> {
    Selector::parse(selector).map_err(|err| ExtractError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn first_text(scope: ElementRef<'_>, selector: &Selector) -> Option<String> {
    scope
        .select(selector)
        .next()
        .and_then(|node| text_or_none(node.text().collect::<String>()))
}

/// The apply link among a card's footer links: prefer the one labeled
/// "Apply", fall back to the last link carrying an href.
fn card_apply_link(card: ElementRef<'_>, footer_links: &Selector) -> Option<String> {
    let mut last_href = None;
    for link in card.select(footer_links) {
        let href = link.value().attr("href");
        if link.text().collect::<String>().contains("Apply") {
            if let Some(href) = href {
                return Some(href.to_string());
            }
        }
        if let Some(href) = href {
            last_href = Some(href.to_string());
        }
    }
    last_href
}

fn extract_cards(html: &str) -> Result<Vec<RawRecord>, ExtractError> {
    let document = Html::parse_document(html);
    let cards = parse_selector("div.card")?;
    let title_sel = parse_selector("h2.title")?;
    let company_sel = parse_selector("h3.company")?;
    let footer_links = parse_selector("a.card-footer-item")?;

    let mut records = Vec::new();
    for card in document.select(&cards).take(MAX_LISTINGS_PER_PAGE) {
        let title = first_text(card, &title_sel);
        let href = card_apply_link(card, &footer_links);
        if title.is_none() || href.is_none() {
            continue;
        }
        records.push(RawRecord {
            title,
            company: first_text(card, &company_sel),
            href,
        });
    }
    Ok(records)
}

fn extract_rows(html: &str) -> Result<Vec<RawRecord>, ExtractError> {
    let document = Html::parse_document(html);
    let rows = parse_selector("tr.job")?;
    let title_sel = parse_selector("h2")?;
    let company_sel = parse_selector(".company")?;

    let mut records = Vec::new();
    for row in document.select(&rows).take(MAX_LISTINGS_PER_PAGE) {
        let title = first_text(row, &title_sel);
        let href = row
            .value()
            .attr("data-url")
            .and_then(|href| text_or_none(href.to_string()));
        if title.is_none() || href.is_none() {
            continue;
        }
        records.push(RawRecord {
            title,
            company: first_text(row, &company_sel),
            href,
        });
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct CardListingAdapter {
    source_id: String,
    listing_url: Url,
    timeout: Duration,
}

impl CardListingAdapter {
    pub fn new(source_id: impl Into<String>, listing_url: Url, timeout: Duration) -> Self {
        Self {
            source_id: source_id.into(),
            listing_url,
            timeout,
        }
    }
}

#[async_trait]
impl SourceAdapter for CardListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn base_url(&self) -> &Url {
        &self.listing_url
    }

    async fn fetch(&self, http: &HttpFetcher, run_id: Uuid) -> Result<String, FetchError> {
        http.fetch_text(
            run_id,
            &self.source_id,
            self.listing_url.as_str(),
            Some(self.timeout),
        )
        .await
    }

    fn extract(&self, html: &str) -> Result<Vec<RawRecord>, ExtractError> {
        extract_cards(html)
    }
}

#[derive(Debug, Clone)]
pub struct RowListingAdapter {
    source_id: String,
    listing_url: Url,
    timeout: Duration,
}

impl RowListingAdapter {
    pub fn new(source_id: impl Into<String>, listing_url: Url, timeout: Duration) -> Self {
        Self {
            source_id: source_id.into(),
            listing_url,
            timeout,
        }
    }
}

#[async_trait]
impl SourceAdapter for RowListingAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn base_url(&self) -> &Url {
        &self.listing_url
    }

    async fn fetch(&self, http: &HttpFetcher, run_id: Uuid) -> Result<String, FetchError> {
        http.fetch_text(
            run_id,
            &self.source_id,
            self.listing_url.as_str(),
            Some(self.timeout),
        )
        .await
    }

    fn extract(&self, html: &str) -> Result<Vec<RawRecord>, ExtractError> {
        extract_rows(html)
    }
}

pub fn adapter_for_markup(
    markup: SourceMarkup,
    source_id: &str,
    listing_url: Url,
    timeout: Duration,
) -> Box<dyn SourceAdapter> {
    match markup {
        SourceMarkup::Cards => Box::new(CardListingAdapter::new(source_id, listing_url, timeout)),
        SourceMarkup::Rows => Box::new(RowListingAdapter::new(source_id, listing_url, timeout)),
    }
}
