//! Feed acquisition: bounded fetching, multi-dialect parsing and previews.
//!
//! - **Fetching**: HTTP retrieval of untrusted URLs under the [`SecurityPolicy`](crate::util::SecurityPolicy),
//!   with per-hop redirect validation, an overall timeout, a per-read timeout and a body size ceiling
//! - **Parsing**: RSS 2.0, Atom and RDF documents into [`RawArticle`]s plus channel metadata
//! - **Preview**: fetch + parse without persistence, reported as `{valid, error?}`
//!
//! # Architecture
//!
//! - [`fetcher`] - `reqwest` client with automatic redirects disabled; every hop is re-validated
//! - [`parser`] - `quick-xml` event reader building a small element tree, entry-level error tolerance
//! - [`preview`] - user-facing preview and URL validation results
//!
//! # Example
//!
//! ```no_run
//! use feedbower::feed::{preview_feed, FetchConfig, Fetcher};
//! use feedbower::util::{SecurityPolicy, UrlValidator};
//!
//! # async fn demo() -> anyhow::Result<()> {
//! let validator = UrlValidator::with_system_resolver(SecurityPolicy::default());
//! let fetcher = Fetcher::new(validator, FetchConfig::default())?;
//! let preview = preview_feed(&fetcher, "https://blog.rust-lang.org/feed.xml").await;
//! println!("{}", serde_json::to_string_pretty(&preview)?);
//! # Ok(())
//! # }
//! ```

pub mod fetcher;
pub mod parser;
pub mod preview;

pub use fetcher::{
    validate_headers, BoundedBody, FetchConfig, FetchError, FetchResponse, Fetcher,
    DEFAULT_READ_TIMEOUT, DEFAULT_TIMEOUT, DEFAULT_USER_AGENT, MAX_FEED_SIZE,
};
pub use parser::{
    parse_date, parse_feed, parse_feed_at, sniff_dialect, Dialect, EntryError, FeedDocument,
    ParseError, RawArticle,
};
pub use preview::{
    fetch_document, preview_feed, validate_feed_url, FeedInfo, FeedPreview, PreviewArticle,
    PreviewError, ValidationOutcome,
};
