use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use feedbower::config::Config;
use feedbower::feed::{fetch_document, preview_feed, validate_feed_url, FeedInfo, Fetcher};
use feedbower::ingest::Scheduler;
use feedbower::storage::{Database, NewSource};
use feedbower::util::UrlValidator;

/// Get the config directory path (~/.config/feedbower/)
fn get_config_dir() -> Result<PathBuf> {
    let home = std::env::var("HOME").context("HOME environment variable not set")?;
    Ok(PathBuf::from(home).join(".config").join("feedbower"))
}

#[derive(Parser, Debug)]
#[command(name = "feedbower", about = "Secure RSS/Atom feed ingestion")]
struct Args {
    /// Config file (default: ~/.config/feedbower/config.toml)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run one ingestion pass over all sources and print the report
    Run,
    /// Run ingestion passes on the configured interval until Ctrl-C
    Serve,
    /// Validate, preview and register a new source
    Add {
        url: String,
        /// Owning collection
        #[arg(long, default_value = "default")]
        collection: String,
    },
    /// Check a URL against the security policy
    Validate { url: String },
    /// Fetch and parse a feed without storing anything
    Preview { url: String },
}

/// Everything a subcommand may need, built once from the config.
struct Runtime {
    config: Config,
    config_dir: PathBuf,
    fetcher: Fetcher,
}

impl Runtime {
    fn load(args: &Args) -> Result<Self> {
        let config_dir = get_config_dir()?;
        let config_path = args
            .config
            .clone()
            .unwrap_or_else(|| config_dir.join("config.toml"));
        let config = Config::load(&config_path)
            .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

        let validator = UrlValidator::with_system_resolver(config.security_policy()?);
        let fetcher = Fetcher::new(validator, config.fetch_config())
            .context("Failed to build HTTP client")?;

        Ok(Self {
            config,
            config_dir,
            fetcher,
        })
    }

    async fn open_database(&self) -> Result<Database> {
        let db_path = self.config.database_path_or(&self.config_dir);
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create database directory {}", parent.display())
                })?;
            }
        }
        let db_path = db_path
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid UTF-8 in database path"))?;
        Ok(Database::open(db_path).await?)
    }

    async fn scheduler(&self) -> Result<Scheduler> {
        let db = Arc::new(self.open_database().await?);
        Ok(
            Scheduler::new(self.fetcher.clone(), db.clone(), db)
                .with_politeness_delay(self.config.politeness_delay()),
        )
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancels the token on Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
            return;
        }
        tracing::info!("Shutdown requested, stopping after the current source");
        trigger.cancel();
    });
    cancel
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let runtime = Runtime::load(&args)?;

    match args.command {
        Command::Run => {
            let scheduler = runtime.scheduler().await?;
            let report = scheduler.run_once(&cancel_on_ctrl_c()).await?;
            print_json(&report)?;
        }
        Command::Serve => {
            let scheduler = runtime.scheduler().await?;
            let interval = runtime.config.run_interval();
            tracing::info!(interval_secs = interval.as_secs(), "Starting scheduler");
            scheduler.run_forever(interval, cancel_on_ctrl_c()).await;
        }
        Command::Add { url, collection } => {
            let outcome = validate_feed_url(runtime.fetcher.validator(), &url).await;
            if !outcome.valid {
                anyhow::bail!(
                    "URL rejected: {}",
                    outcome.error.unwrap_or_else(|| "unknown reason".to_string())
                );
            }
            let document = fetch_document(&runtime.fetcher, &url)
                .await
                .with_context(|| format!("Failed to preview {}", url))?;
            let info = FeedInfo::from(&document);

            let db = runtime.open_database().await?;
            let source = db
                .insert_source(&NewSource {
                    collection_id: collection,
                    url,
                    title: info.title,
                    description: info.description,
                    category: info.category,
                })
                .await?;
            print_json(&source)?;
        }
        Command::Validate { url } => {
            print_json(&validate_feed_url(runtime.fetcher.validator(), &url).await)?;
        }
        Command::Preview { url } => {
            print_json(&preview_feed(&runtime.fetcher, &url).await)?;
        }
    }

    Ok(())
}
