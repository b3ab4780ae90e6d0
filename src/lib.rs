//! Secure feed acquisition and ingestion.
//!
//! Turns untrusted, user-supplied feed URLs into normalized, deduplicated
//! article records:
//!
//! - [`util`] - URL security validation and content normalization
//! - [`feed`] - bounded fetching, RSS/Atom/RDF parsing, previews
//! - [`ingest`] - the sequential ingestion scheduler
//! - [`storage`] - SQLite source and article repositories
//! - [`config`] - TOML configuration

pub mod config;
pub mod feed;
pub mod ingest;
pub mod storage;
pub mod util;
