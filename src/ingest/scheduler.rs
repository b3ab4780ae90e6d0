use crate::feed::{parse_feed_at, FetchError, Fetcher, ParseError, RawArticle};
use crate::storage::{
    ArticleRepository, BatchInsertError, DatabaseError, NewArticle, Source, SourceRepository,
};
use crate::util::normalize;
use chrono::Utc;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Pause between consecutive sources in a run.
pub const DEFAULT_POLITENESS_DELAY: Duration = Duration::from_millis(500);

/// Errors that abort a whole run.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Failed to list sources: {0}")]
    ListSources(#[source] DatabaseError),
}

/// Why a single source failed. Counted and logged, never propagated.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("fetch failed: {0}")]
    Fetch(#[from] FetchError),
    #[error("parse failed: {0}")]
    Parse(#[from] ParseError),
    #[error("persistence failed: {0}")]
    Persistence(#[from] DatabaseError),
    /// Some chunks were committed before the store failed
    #[error("persistence failed: {0}")]
    PartialInsert(#[from] BatchInsertError),
    #[error("cancelled")]
    Cancelled,
}

/// Aggregate outcome of one run, suitable for logging or alerting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestionReport {
    /// Sources attempted, successful or not
    pub processed: usize,
    pub new_articles: usize,
    /// Sources whose fetch, parse or persistence failed
    pub errors: usize,
    /// Articles dropped because their URL was already known
    pub skipped_duplicates: usize,
    /// Entries dropped for missing required fields or a URL
    pub skipped_invalid: usize,
    /// The run stopped early on cancellation
    pub cancelled: bool,
}

#[derive(Debug, Default)]
struct SourceOutcome {
    inserted: usize,
    duplicates: usize,
    invalid: usize,
}

/// Drives fetch → parse → normalize → deduplicate → persist over every source.
///
/// Sources are processed one at a time with a fixed pause between them.
/// A failing source is counted and skipped; only failing to list sources
/// aborts a run.
pub struct Scheduler {
    fetcher: Fetcher,
    sources: Arc<dyn SourceRepository>,
    articles: Arc<dyn ArticleRepository>,
    politeness_delay: Duration,
}

impl Scheduler {
    pub fn new(
        fetcher: Fetcher,
        sources: Arc<dyn SourceRepository>,
        articles: Arc<dyn ArticleRepository>,
    ) -> Self {
        Self {
            fetcher,
            sources,
            articles,
            politeness_delay: DEFAULT_POLITENESS_DELAY,
        }
    }

    pub fn with_politeness_delay(mut self, delay: Duration) -> Self {
        self.politeness_delay = delay;
        self
    }

    /// One pass over a snapshot of all sources.
    ///
    /// Cancellation is honoured between sources, during the politeness
    /// pause and while a fetch is in flight. Writes of sources that already
    /// completed stay committed.
    ///
    /// # Errors
    ///
    /// [`IngestError::ListSources`] when the source list cannot be read.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<IngestionReport, IngestError> {
        let started = Instant::now();
        let sources = self
            .sources
            .list_all()
            .await
            .map_err(IngestError::ListSources)?;

        tracing::info!(sources = sources.len(), "Starting ingestion run");
        let mut report = IngestionReport::default();

        for (index, source) in sources.iter().enumerate() {
            if index > 0 {
                tokio::select! {
                    _ = cancel.cancelled() => {}
                    _ = tokio::time::sleep(self.politeness_delay) => {}
                }
            }
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }

            match self.ingest_source(source, cancel).await {
                Ok(outcome) => {
                    report.processed += 1;
                    report.new_articles += outcome.inserted;
                    report.skipped_duplicates += outcome.duplicates;
                    report.skipped_invalid += outcome.invalid;
                    if outcome.inserted == 0 {
                        tracing::info!(
                            source_id = source.id,
                            url = %source.url,
                            duplicates = outcome.duplicates,
                            "No new articles"
                        );
                    } else {
                        tracing::info!(
                            source_id = source.id,
                            url = %source.url,
                            new_articles = outcome.inserted,
                            duplicates = outcome.duplicates,
                            "Source ingested"
                        );
                    }
                }
                Err(SourceError::Cancelled) => {
                    report.cancelled = true;
                    break;
                }
                Err(e) => {
                    report.processed += 1;
                    report.errors += 1;
                    if let SourceError::PartialInsert(partial) = &e {
                        report.new_articles += partial.inserted;
                    }
                    tracing::warn!(
                        source_id = source.id,
                        url = %source.url,
                        error = %e,
                        "Source ingestion failed"
                    );
                }
            }
        }

        if report.cancelled {
            tracing::info!(processed = report.processed, "Ingestion run cancelled");
        }
        tracing::info!(
            processed = report.processed,
            new_articles = report.new_articles,
            errors = report.errors,
            skipped_duplicates = report.skipped_duplicates,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Ingestion run complete"
        );
        Ok(report)
    }

    /// Runs [`Self::run_once`] every `interval` until cancelled. The first
    /// run starts immediately.
    pub async fn run_forever(&self, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.run_once(&cancel).await {
                tracing::error!(error = %e, "Ingestion run aborted");
            }
        }
        tracing::info!("Scheduler stopped");
    }

    async fn ingest_source(
        &self,
        source: &Source,
        cancel: &CancellationToken,
    ) -> Result<SourceOutcome, SourceError> {
        let fetched_at = Utc::now();
        let bytes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(SourceError::Cancelled),
            result = self.fetcher.fetch_feed(&source.url) => result?,
        };
        let document = parse_feed_at(&bytes, fetched_at)?;

        let mut outcome = SourceOutcome {
            invalid: document.skipped.len(),
            ..SourceOutcome::default()
        };
        let mut batch_urls = HashSet::new();
        let mut fresh = Vec::new();

        for raw in document.articles {
            let url = raw.url.trim();
            // No URL, no dedup key
            if url.is_empty() {
                outcome.invalid += 1;
                continue;
            }
            if !batch_urls.insert(url.to_owned()) || self.articles.exists_by_url(url).await? {
                outcome.duplicates += 1;
                continue;
            }
            fresh.push(canonicalize(source.id, raw));
        }

        if !fresh.is_empty() {
            outcome.inserted = self.articles.batch_insert(&fresh).await?;
            // Rows the store ignored were inserted by someone else since the check
            outcome.duplicates += fresh.len().saturating_sub(outcome.inserted);
        }

        if let Err(e) = self.sources.update_freshness(source.id, fetched_at).await {
            tracing::warn!(
                source_id = source.id,
                error = %e,
                "Failed to update source freshness"
            );
        }

        Ok(outcome)
    }
}

fn canonicalize(source_id: i64, raw: RawArticle) -> NewArticle {
    NewArticle {
        source_id,
        title: normalize(&raw.title),
        content: normalize(&raw.content),
        url: raw.url.trim().to_owned(),
        image_url: raw.image_url,
        published_at: raw.published_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::FetchConfig;
    use crate::storage::{Database, ARTICLE_BATCH_SIZE};
    use crate::util::{SecurityPolicy, StaticResolver, UrlValidator};
    use async_trait::async_trait;
    use chrono::DateTime;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    // ========================================================================
    // In-memory repositories
    // ========================================================================

    #[derive(Default)]
    struct MemorySources {
        sources: Vec<Source>,
        fail_listing: bool,
        fail_freshness: bool,
        freshness: Mutex<Vec<i64>>,
    }

    #[async_trait]
    impl SourceRepository for MemorySources {
        async fn list_all(&self) -> Result<Vec<Source>, DatabaseError> {
            if self.fail_listing {
                return Err(DatabaseError::Other(sqlx::Error::PoolClosed));
            }
            Ok(self.sources.clone())
        }

        async fn update_freshness(
            &self,
            source_id: i64,
            _fetched_at: DateTime<Utc>,
        ) -> Result<(), DatabaseError> {
            if self.fail_freshness {
                return Err(DatabaseError::Other(sqlx::Error::PoolClosed));
            }
            self.freshness.lock().unwrap().push(source_id);
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryArticles {
        stored: Mutex<Vec<NewArticle>>,
        /// Store this many rows, then fail
        fail_after: Option<usize>,
    }

    impl MemoryArticles {
        fn urls(&self) -> Vec<String> {
            self.stored
                .lock()
                .unwrap()
                .iter()
                .map(|a| a.url.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ArticleRepository for MemoryArticles {
        async fn exists_by_url(&self, url: &str) -> Result<bool, DatabaseError> {
            Ok(self.stored.lock().unwrap().iter().any(|a| a.url == url))
        }

        async fn batch_insert(&self, articles: &[NewArticle]) -> Result<usize, BatchInsertError> {
            match self.fail_after {
                Some(limit) if limit < articles.len() => {
                    self.stored
                        .lock()
                        .unwrap()
                        .extend_from_slice(&articles[..limit]);
                    Err(BatchInsertError {
                        inserted: limit,
                        source: DatabaseError::Other(sqlx::Error::PoolClosed),
                    })
                }
                _ => {
                    self.stored.lock().unwrap().extend_from_slice(articles);
                    Ok(articles.len())
                }
            }
        }
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn source(id: i64, url: String) -> Source {
        Source {
            id,
            collection_id: "c1".to_string(),
            url,
            title: format!("Source {}", id),
            description: String::new(),
            category: String::new(),
            last_fetched_at: None,
            created_at: Utc::now(),
        }
    }

    fn fetcher(timeout: Duration) -> Fetcher {
        // Mock servers bind to 127.0.0.1
        let policy = SecurityPolicy {
            blocked_hosts: Vec::new(),
            blocked_networks: Vec::new(),
            ..SecurityPolicy::default()
        };
        let validator = UrlValidator::new(policy, Arc::new(StaticResolver::new()));
        let config = FetchConfig {
            timeout,
            ..FetchConfig::default()
        };
        Fetcher::new(validator, config).unwrap()
    }

    fn scheduler(sources: Arc<MemorySources>, articles: Arc<MemoryArticles>) -> Scheduler {
        Scheduler::new(fetcher(Duration::from_secs(5)), sources, articles)
            .with_politeness_delay(Duration::ZERO)
    }

    fn rss(links: &[&str]) -> String {
        let items: String = links
            .iter()
            .map(|l| format!("<item><title>Post {l}</title><link>{l}</link><description>&lt;p&gt;Body&lt;/p&gt;</description></item>"))
            .collect();
        format!("<rss version=\"2.0\"><channel><title>T</title>{items}</channel></rss>")
    }

    async fn serve(server: &MockServer, route: &str, body: String) {
        Mock::given(method("GET"))
            .and(path(route))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(server)
            .await;
    }

    // ========================================================================
    // Tests
    // ========================================================================

    #[tokio::test]
    async fn test_failed_source_does_not_abort_run() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;
        serve(
            &server,
            "/b",
            rss(&["https://b.example/1", "https://b.example/2", "https://b.example/3"]),
        )
        .await;

        let sources = Arc::new(MemorySources {
            sources: vec![
                source(1, format!("{}/a", server.uri())),
                source(2, format!("{}/b", server.uri())),
            ],
            ..MemorySources::default()
        });
        let articles = Arc::new(MemoryArticles::default());
        let scheduler = Scheduler::new(
            fetcher(Duration::from_millis(300)),
            sources.clone(),
            articles.clone(),
        )
        .with_politeness_delay(Duration::ZERO);

        let report = scheduler.run_once(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(report.new_articles, 3);
        assert_eq!(report.errors, 1);
        // Only the successful source is marked fresh
        assert_eq!(*sources.freshness.lock().unwrap(), vec![2]);
    }

    #[tokio::test]
    async fn test_second_run_is_idempotent() {
        let server = MockServer::start().await;
        serve(&server, "/feed", rss(&["https://x.example/1", "https://x.example/2"])).await;

        let sources = Arc::new(MemorySources {
            sources: vec![source(1, format!("{}/feed", server.uri()))],
            ..MemorySources::default()
        });
        let articles = Arc::new(MemoryArticles::default());
        let scheduler = scheduler(sources.clone(), articles.clone());
        let cancel = CancellationToken::new();

        let first = scheduler.run_once(&cancel).await.unwrap();
        assert_eq!(first.new_articles, 2);

        let second = scheduler.run_once(&cancel).await.unwrap();
        assert_eq!(
            second,
            IngestionReport {
                processed: 1,
                new_articles: 0,
                errors: 0,
                skipped_duplicates: 2,
                skipped_invalid: 0,
                cancelled: false,
            }
        );
        // A no-op pass still counts as fresh
        assert_eq!(*sources.freshness.lock().unwrap(), vec![1, 1]);
    }

    #[tokio::test]
    async fn test_url_seen_in_another_source_is_dropped() {
        // First-seen-wins is global: the second source loses its copy even
        // though it is a different feed.
        let server = MockServer::start().await;
        serve(&server, "/one", rss(&["https://shared.example/story"])).await;
        serve(
            &server,
            "/two",
            rss(&["https://shared.example/story", "https://two.example/own"]),
        )
        .await;

        let sources = Arc::new(MemorySources {
            sources: vec![
                source(1, format!("{}/one", server.uri())),
                source(2, format!("{}/two", server.uri())),
            ],
            ..MemorySources::default()
        });
        let articles = Arc::new(MemoryArticles::default());
        let report = scheduler(sources, articles.clone())
            .run_once(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.new_articles, 2);
        assert_eq!(report.skipped_duplicates, 1);
        let stored = articles.stored.lock().unwrap();
        let shared = stored
            .iter()
            .find(|a| a.url == "https://shared.example/story")
            .unwrap();
        assert_eq!(shared.source_id, 1);
    }

    #[tokio::test]
    async fn test_articles_are_normalized_and_deduplicated_within_feed() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/feed",
            rss(&["https://x.example/1", "https://x.example/1", ""]),
        )
        .await;

        let sources = Arc::new(MemorySources {
            sources: vec![source(7, format!("{}/feed", server.uri()))],
            ..MemorySources::default()
        });
        let articles = Arc::new(MemoryArticles::default());
        let report = scheduler(sources, articles.clone())
            .run_once(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.new_articles, 1);
        assert_eq!(report.skipped_duplicates, 1);
        assert_eq!(report.skipped_invalid, 1);

        let stored = articles.stored.lock().unwrap();
        assert_eq!(stored[0].content, "Body");
        assert_eq!(stored[0].source_id, 7);
    }

    #[tokio::test]
    async fn test_parse_failure_is_counted() {
        let server = MockServer::start().await;
        serve(&server, "/feed", "<html>not a feed</html>".to_string()).await;

        let sources = Arc::new(MemorySources {
            sources: vec![source(1, format!("{}/feed", server.uri()))],
            ..MemorySources::default()
        });
        let report = scheduler(sources.clone(), Arc::new(MemoryArticles::default()))
            .run_once(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.errors, 1);
        assert!(sources.freshness.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_persistence_failure_is_counted_without_freshness() {
        let server = MockServer::start().await;
        serve(&server, "/feed", rss(&["https://x.example/1"])).await;

        let sources = Arc::new(MemorySources {
            sources: vec![source(1, format!("{}/feed", server.uri()))],
            ..MemorySources::default()
        });
        let articles = Arc::new(MemoryArticles {
            fail_after: Some(0),
            ..MemoryArticles::default()
        });
        let report = scheduler(sources.clone(), articles.clone())
            .run_once(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.errors, 1);
        assert_eq!(report.new_articles, 0);
        assert!(sources.freshness.lock().unwrap().is_empty());
        assert!(articles.urls().is_empty());
    }

    #[tokio::test]
    async fn test_partial_persistence_counts_committed_articles() {
        let server = MockServer::start().await;
        let links: Vec<String> = (0..30).map(|i| format!("https://x.example/{i}")).collect();
        let links: Vec<&str> = links.iter().map(String::as_str).collect();
        serve(&server, "/feed", rss(&links)).await;

        let sources = Arc::new(MemorySources {
            sources: vec![source(1, format!("{}/feed", server.uri()))],
            ..MemorySources::default()
        });
        let db = Database::open(":memory:").await.unwrap();
        sqlx::query(
            "CREATE TRIGGER reject_28th BEFORE INSERT ON articles \
             WHEN NEW.url = 'https://x.example/27' \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&db.pool)
        .await
        .unwrap();

        let report = Scheduler::new(
            fetcher(Duration::from_secs(5)),
            sources.clone(),
            Arc::new(db.clone()),
        )
        .with_politeness_delay(Duration::ZERO)
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.errors, 1);
        // The first chunk committed before the 28th row was rejected
        assert_eq!(report.new_articles, ARTICLE_BATCH_SIZE);
        assert_eq!(db.count_articles().await.unwrap(), 25);
        assert!(sources.freshness.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_freshness_failure_keeps_source_successful() {
        let server = MockServer::start().await;
        serve(&server, "/feed", rss(&["https://x.example/1", "https://x.example/2"])).await;

        let sources = Arc::new(MemorySources {
            sources: vec![source(1, format!("{}/feed", server.uri()))],
            fail_freshness: true,
            ..MemorySources::default()
        });
        let articles = Arc::new(MemoryArticles::default());
        let report = scheduler(sources, articles.clone())
            .run_once(&CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.errors, 0);
        assert_eq!(report.new_articles, 2);
        assert_eq!(
            articles.urls(),
            vec!["https://x.example/1", "https://x.example/2"]
        );
    }

    #[tokio::test]
    async fn test_cancel_interrupts_in_flight_fetch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/slow"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(10)))
            .mount(&server)
            .await;

        let sources = Arc::new(MemorySources {
            sources: vec![source(1, format!("{}/slow", server.uri()))],
            ..MemorySources::default()
        });
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let started = Instant::now();
        let report = scheduler(sources.clone(), Arc::new(MemoryArticles::default()))
            .run_once(&cancel)
            .await
            .unwrap();

        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
        assert_eq!(report.errors, 0);
        // Well before the 5s fetch timeout
        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(sources.freshness.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_run() {
        let sources = Arc::new(MemorySources {
            fail_listing: true,
            ..MemorySources::default()
        });
        let result = scheduler(sources, Arc::new(MemoryArticles::default()))
            .run_once(&CancellationToken::new())
            .await;
        assert!(matches!(result, Err(IngestError::ListSources(_))));
    }

    #[tokio::test]
    async fn test_cancelled_before_start_processes_nothing() {
        let sources = Arc::new(MemorySources {
            sources: vec![source(1, "http://10.0.0.1/feed".to_string())],
            ..MemorySources::default()
        });
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = scheduler(sources, Arc::new(MemoryArticles::default()))
            .run_once(&cancel)
            .await
            .unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_politeness_delay_between_sources_only() {
        // Private addresses fail validation instantly, without network I/O
        let sources = Arc::new(MemorySources {
            sources: (1..=3)
                .map(|i| source(i, format!("http://10.0.0.{}/feed", i)))
                .collect(),
            ..MemorySources::default()
        });
        let scheduler = Scheduler::new(
            Fetcher::new(
                UrlValidator::new(SecurityPolicy::default(), Arc::new(StaticResolver::new())),
                FetchConfig::default(),
            )
            .unwrap(),
            sources,
            Arc::new(MemoryArticles::default()),
        )
        .with_politeness_delay(Duration::from_millis(500));

        let started = Instant::now();
        let report = scheduler.run_once(&CancellationToken::new()).await.unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.errors, 3);
        // Two pauses for three sources
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(1000), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(1500), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_pause_stops_between_sources() {
        let sources = Arc::new(MemorySources {
            sources: (1..=3)
                .map(|i| source(i, format!("http://10.0.0.{}/feed", i)))
                .collect(),
            ..MemorySources::default()
        });
        let scheduler = Scheduler::new(
            Fetcher::new(
                UrlValidator::new(SecurityPolicy::default(), Arc::new(StaticResolver::new())),
                FetchConfig::default(),
            )
            .unwrap(),
            sources,
            Arc::new(MemoryArticles::default()),
        )
        .with_politeness_delay(Duration::from_secs(60));

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            trigger.cancel();
        });

        let report = scheduler.run_once(&cancel).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.processed, 1);
    }

    #[tokio::test]
    async fn test_run_forever_stops_on_cancel() {
        let sources = Arc::new(MemorySources::default());
        let scheduler = scheduler(sources, Arc::new(MemoryArticles::default()));
        let cancel = CancellationToken::new();
        cancel.cancel();

        tokio::time::timeout(
            Duration::from_secs(1),
            scheduler.run_forever(Duration::from_secs(3600), cancel),
        )
        .await
        .unwrap();
    }
}
