use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{BatchInsertError, DatabaseError, NewArticle, Source};

/// Read access to registered sources plus the freshness stamp the scheduler writes.
#[async_trait]
pub trait SourceRepository: Send + Sync {
    async fn list_all(&self) -> Result<Vec<Source>, DatabaseError>;

    async fn update_freshness(
        &self,
        source_id: i64,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;
}

/// Article store keyed by URL.
#[async_trait]
pub trait ArticleRepository: Send + Sync {
    async fn exists_by_url(&self, url: &str) -> Result<bool, DatabaseError>;

    /// Persists articles, chunking to the store's batch ceiling. Returns the
    /// number of rows written; URLs that already exist are not written. On
    /// failure the error still carries the rows committed before it.
    async fn batch_insert(&self, articles: &[NewArticle]) -> Result<usize, BatchInsertError>;
}

#[async_trait]
impl SourceRepository for Database {
    async fn list_all(&self) -> Result<Vec<Source>, DatabaseError> {
        self.list_sources().await
    }

    async fn update_freshness(
        &self,
        source_id: i64,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.update_source_freshness(source_id, fetched_at).await
    }
}

#[async_trait]
impl ArticleRepository for Database {
    async fn exists_by_url(&self, url: &str) -> Result<bool, DatabaseError> {
        self.article_exists(url).await
    }

    async fn batch_insert(&self, articles: &[NewArticle]) -> Result<usize, BatchInsertError> {
        self.insert_articles(articles).await
    }
}
