use super::fetcher::{FetchError, Fetcher};
use super::parser::{parse_feed, Dialect, FeedDocument, ParseError, RawArticle};
use crate::util::{normalize, truncate_content, UrlValidator};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Display;
use thiserror::Error;

/// Articles included in a preview.
pub const PREVIEW_ARTICLE_LIMIT: usize = 10;

/// Characters of article text kept in a preview, before the ellipsis.
pub const PREVIEW_CONTENT_CHARS: usize = 200;

/// Failure while fetching or parsing a feed outside the scheduler.
#[derive(Debug, Error)]
pub enum PreviewError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("Failed to parse feed: {0}")]
    Parse(#[from] ParseError),
}

/// `{valid, error?}` result of checking a URL against the security policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ValidationOutcome {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn failed(error: impl Display) -> Self {
        Self {
            valid: false,
            error: Some(error.to_string()),
        }
    }
}

/// Channel metadata, normalized to plain text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedInfo {
    pub dialect: Dialect,
    pub title: String,
    pub description: String,
    pub link: String,
    pub category: String,
}

impl From<&FeedDocument> for FeedInfo {
    fn from(doc: &FeedDocument) -> Self {
        Self {
            dialect: doc.dialect,
            title: normalize(&doc.title),
            description: normalize(&doc.description),
            link: doc.link.trim().to_owned(),
            category: normalize(&doc.category),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewArticle {
    pub title: String,
    pub content: String,
    pub url: String,
    pub published_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

impl From<&RawArticle> for PreviewArticle {
    fn from(raw: &RawArticle) -> Self {
        Self {
            title: normalize(&raw.title),
            content: truncate_content(&normalize(&raw.content), PREVIEW_CONTENT_CHARS).into_owned(),
            url: raw.url.clone(),
            published_at: raw.published_at,
            image_url: raw.image_url.clone(),
        }
    }
}

/// What a user sees before subscribing. Failures are reported in-band.
#[derive(Debug, Clone, Serialize)]
pub struct FeedPreview {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub feed: Option<FeedInfo>,
    pub articles: Vec<PreviewArticle>,
}

impl FeedPreview {
    fn failed(error: impl Display) -> Self {
        Self {
            valid: false,
            error: Some(error.to_string()),
            feed: None,
            articles: Vec::new(),
        }
    }
}

/// Checks a URL against the validator's policy without fetching it.
pub async fn validate_feed_url(validator: &UrlValidator, url: &str) -> ValidationOutcome {
    match validator.validate(url).await {
        Ok(_) => ValidationOutcome::ok(),
        Err(e) => ValidationOutcome::failed(e),
    }
}

/// Validates, fetches and parses a feed without persisting anything.
pub async fn fetch_document(fetcher: &Fetcher, url: &str) -> Result<FeedDocument, PreviewError> {
    let bytes = fetcher.fetch_feed(url).await?;
    Ok(parse_feed(&bytes)?)
}

/// Fetches a feed and summarizes its first [`PREVIEW_ARTICLE_LIMIT`] articles.
///
/// Never fails: security, network and parse errors come back as
/// `valid: false` with the error message.
pub async fn preview_feed(fetcher: &Fetcher, url: &str) -> FeedPreview {
    match fetch_document(fetcher, url).await {
        Ok(doc) => FeedPreview {
            valid: true,
            error: None,
            feed: Some(FeedInfo::from(&doc)),
            articles: doc
                .articles
                .iter()
                .take(PREVIEW_ARTICLE_LIMIT)
                .map(PreviewArticle::from)
                .collect(),
        },
        Err(e) => {
            tracing::debug!(url = %url, error = %e, "Feed preview failed");
            FeedPreview::failed(e)
        }
    }
}
