use chrono::{DateTime, Utc};

use super::schema::Database;
use super::types::{DatabaseError, NewSource, Source, SourceRow};

impl Database {
    // ========================================================================
    // Source Operations
    // ========================================================================

    /// Registers a new source.
    ///
    /// # Errors
    ///
    /// `DatabaseError::DuplicateSource` if the URL is already registered.
    pub async fn insert_source(&self, source: &NewSource) -> Result<Source, DatabaseError> {
        let now = Utc::now().timestamp();
        let row = sqlx::query_as::<_, SourceRow>(
            r#"
            INSERT INTO sources (collection_id, url, title, description, category, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            RETURNING id, collection_id, url, title, description, category,
                      last_fetched_at, created_at
        "#,
        )
        .bind(&source.collection_id)
        .bind(&source.url)
        .bind(&source.title)
        .bind(&source.description)
        .bind(&source.category)
        .bind(now)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                DatabaseError::DuplicateSource(source.url.clone())
            }
            other => DatabaseError::from_sqlx(other),
        })?;

        Ok(row.into_source())
    }

    /// All registered sources, oldest first.
    pub async fn list_sources(&self) -> Result<Vec<Source>, DatabaseError> {
        let rows = sqlx::query_as::<_, SourceRow>(
            r#"
            SELECT id, collection_id, url, title, description, category,
                   last_fetched_at, created_at
            FROM sources
            ORDER BY id
        "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(SourceRow::into_source).collect())
    }

    pub async fn get_source(&self, source_id: i64) -> Result<Option<Source>, DatabaseError> {
        let row = sqlx::query_as::<_, SourceRow>(
            r#"
            SELECT id, collection_id, url, title, description, category,
                   last_fetched_at, created_at
            FROM sources
            WHERE id = ?
        "#,
        )
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(SourceRow::into_source))
    }

    /// Sets `last_fetched_at` for a source.
    pub async fn update_source_freshness(
        &self,
        source_id: i64,
        fetched_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        sqlx::query("UPDATE sources SET last_fetched_at = ? WHERE id = ?")
            .bind(fetched_at.timestamp())
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
