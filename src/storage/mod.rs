//! SQLite persistence for sources and articles.
//!
//! [`Database`] implements the [`SourceRepository`] and [`ArticleRepository`]
//! traits the ingestion scheduler is written against.

mod articles;
mod repository;
mod schema;
mod sources;
mod types;

pub use articles::ARTICLE_BATCH_SIZE;
pub use repository::{ArticleRepository, SourceRepository};
pub use schema::Database;
pub use types::{Article, BatchInsertError, DatabaseError, NewArticle, NewSource, Source};
