use sqlx::QueryBuilder;

use super::schema::Database;
use super::types::{Article, ArticleRow, BatchInsertError, DatabaseError, NewArticle};

/// Rows written per transaction by [`Database::insert_articles`].
pub const ARTICLE_BATCH_SIZE: usize = 25;

/// Maximum number of articles to return from any single query (OOM protection)
const MAX_ARTICLES: i64 = 2000;

impl Database {
    // ========================================================================
    // Article Operations
    // ========================================================================

    /// Whether an article with this exact URL exists, from any source.
    pub async fn article_exists(&self, url: &str) -> Result<bool, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT EXISTS(SELECT 1 FROM articles WHERE url = ?)")
            .bind(url)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0 != 0)
    }

    /// Inserts articles, returning how many rows were actually written.
    ///
    /// Rows go in chunks of [`ARTICLE_BATCH_SIZE`], one transaction per
    /// chunk, using `INSERT OR IGNORE` against the URL uniqueness
    /// constraint. A URL that appeared since the caller's existence check is
    /// silently skipped.
    ///
    /// # Errors
    ///
    /// [`BatchInsertError`] when a chunk fails. Chunks already committed
    /// stay committed and their row count is carried in the error.
    pub async fn insert_articles(
        &self,
        articles: &[NewArticle],
    ) -> Result<usize, BatchInsertError> {
        let now = chrono::Utc::now().timestamp();
        let mut inserted = 0;

        for chunk in articles.chunks(ARTICLE_BATCH_SIZE) {
            match self.insert_chunk(chunk, now).await {
                Ok(n) => inserted += n,
                Err(source) => return Err(BatchInsertError { inserted, source }),
            }
        }

        Ok(inserted)
    }

    async fn insert_chunk(&self, chunk: &[NewArticle], now: i64) -> Result<usize, DatabaseError> {
        let mut tx = self.pool.begin().await?;

        let mut builder: QueryBuilder<sqlx::Sqlite> = QueryBuilder::new(
            "INSERT OR IGNORE INTO articles (source_id, title, content, url, image_url, published_at, created_at) ",
        );
        builder.push_values(chunk, |mut b, article| {
            b.push_bind(article.source_id)
                .push_bind(&article.title)
                .push_bind(&article.content)
                .push_bind(&article.url)
                .push_bind(&article.image_url)
                .push_bind(article.published_at.timestamp())
                .push_bind(now);
        });
        builder.build().execute(&mut *tx).await?;

        // changes() counts only rows the OR IGNORE actually inserted
        let changes: (i64,) = sqlx::query_as("SELECT changes()")
            .fetch_one(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(changes.0 as usize)
    }

    // ========================================================================
    // Article Queries
    // ========================================================================

    /// Articles for a source, newest first.
    pub async fn get_articles_for_source(
        &self,
        source_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<Article>, DatabaseError> {
        let limit = limit.unwrap_or(500).min(MAX_ARTICLES);

        let rows = sqlx::query_as::<_, ArticleRow>(
            r#"
            SELECT id, source_id, title, content, url, image_url, published_at, created_at
            FROM articles
            WHERE source_id = ?
            ORDER BY published_at DESC, id DESC
            LIMIT ?
        "#,
        )
        .bind(source_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(ArticleRow::into_article).collect())
    }

    pub async fn count_articles(&self) -> Result<i64, DatabaseError> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM articles")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}
