//! Ingestion: the scheduled pass over every registered source.

mod scheduler;

pub use scheduler::{
    IngestError, IngestionReport, Scheduler, SourceError, DEFAULT_POLITENESS_DELAY,
};
