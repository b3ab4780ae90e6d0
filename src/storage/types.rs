use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

// ============================================================================
// Error Types
// ============================================================================

/// Store failures. Surfaced to the scheduler as a persistence error for the
/// affected source, or as a fatal error when sources cannot be listed.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Another process holds a lock on the database file
    #[error("Database is locked by another process. Close it and try again.")]
    InstanceLocked,

    /// Migration failed
    #[error("Database migration failed: {0}")]
    Migration(String),

    /// A source with this URL is already registered
    #[error("Source already registered: {0}")]
    DuplicateSource(String),

    /// Generic database error
    #[error("Database error: {0}")]
    Other(#[from] sqlx::Error),
}

/// A batch insert that stopped partway. Chunks committed before the failing
/// one stay committed and are counted in `inserted`.
#[derive(Debug, Error)]
#[error("{source} ({inserted} rows committed before the failure)")]
pub struct BatchInsertError {
    pub inserted: usize,
    #[source]
    pub source: DatabaseError,
}

impl DatabaseError {
    /// Check if a sqlx error indicates database locking
    pub(crate) fn from_sqlx(err: sqlx::Error) -> Self {
        let error_string = err.to_string().to_lowercase();

        // SQLITE_BUSY (5), SQLITE_LOCKED (6), SQLITE_CANTOPEN (14)
        if error_string.contains("database is locked")
            || error_string.contains("database table is locked")
            || error_string.contains("sqlite_busy")
            || error_string.contains("sqlite_locked")
            || error_string.contains("unable to open database file")
        {
            return DatabaseError::InstanceLocked;
        }

        DatabaseError::Other(err)
    }
}

// ============================================================================
// Row Types
// ============================================================================

/// Internal row type for source queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct SourceRow {
    pub id: i64,
    pub collection_id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub last_fetched_at: Option<i64>,
    pub created_at: i64,
}

impl SourceRow {
    pub(crate) fn into_source(self) -> Source {
        Source {
            id: self.id,
            collection_id: self.collection_id,
            url: self.url,
            title: self.title,
            description: self.description,
            category: self.category,
            last_fetched_at: self.last_fetched_at.and_then(from_unix),
            created_at: from_unix(self.created_at).unwrap_or_default(),
        }
    }
}

/// Internal row type for article queries
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct ArticleRow {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub content: String,
    pub url: String,
    pub image_url: Option<String>,
    pub published_at: i64,
    pub created_at: i64,
}

impl ArticleRow {
    pub(crate) fn into_article(self) -> Article {
        Article {
            id: self.id,
            source_id: self.source_id,
            title: self.title,
            content: self.content,
            url: self.url,
            image_url: self.image_url,
            published_at: from_unix(self.published_at).unwrap_or_default(),
            created_at: from_unix(self.created_at).unwrap_or_default(),
        }
    }
}

fn from_unix(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

// ============================================================================
// Data Structures
// ============================================================================

/// A registered feed URL belonging to a collection.
///
/// `last_fetched_at` is only written by the ingestion scheduler after a
/// successful pass over the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Source {
    pub id: i64,
    pub collection_id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub last_fetched_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Registration data for a new source
#[derive(Debug, Clone, Default)]
pub struct NewSource {
    pub collection_id: String,
    pub url: String,
    pub title: String,
    pub description: String,
    pub category: String,
}

/// A normalized, deduplicated article ready to be persisted.
///
/// `url` is the global deduplication key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewArticle {
    pub source_id: i64,
    pub title: String,
    pub content: String,
    pub url: String,
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
}

/// A persisted article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Article {
    pub id: i64,
    pub source_id: i64,
    pub title: String,
    pub content: String,
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub published_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}
