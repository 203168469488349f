//! BELB - Biomedical Entity Linking Benchmark builder
//!
//! Fetches biomedical knowledge bases and annotated corpora, parses their
//! native formats, and stores them under one schema so that every corpus
//! mention points at an identifier that is current in its knowledge base.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │  belb CLI: kbs build | kbs lookup | kbs resolve | corpora build │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Fetcher  (raw/{kbs|corpora}/{name}, retries, extraction)      │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   KB parsers ──► Normalizer ──► KbStore (sqlite | postgres)     │
//! │                                   manifest.json + status.json   │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   KbReader (lookup, history resolution, aliases, homonyms)      │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │   Corpus readers ──► Aligner ──► sentences ──► {split}.json     │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use belb::{BelbConfig, KbBuilder, KbBuildOptions, KbReader};
//!
//! let config = BelbConfig::from_file("config/belb.yaml")?;
//! let builder = KbBuilder::new("/data/belb", config.clone(), KbBuildOptions::default());
//! builder.build("ncbi_gene").await?;
//!
//! let reader = KbReader::open(Path::new("/data/belb"), "ncbi_gene", &config).await?;
//! let resolution = reader.resolve("100").await?;
//! ```

pub mod build;
pub mod config;
pub mod corpora;
pub mod error;
pub mod fetch;
pub mod kbs;
pub mod normalize;
pub mod reader;
pub mod resources;
pub mod schema;
pub mod store;

// Re-export main types
pub use build::{BuildSummary, KbBuildOptions, KbBuilder};
pub use config::{Backend, BelbConfig, FetchConfig, ParserConfig, ReaderConfig, StoreConfig};
pub use corpora::{CorpusBuildOptions, CorpusBuilder, CorpusSummary, Document, QaqcStats, Split};
pub use error::{
    BelbError, ConfigError, DataIntegrityError, FetchError, FormatError, NormalizationError,
    ParseError, StoreError,
};
pub use fetch::Fetcher;
pub use reader::{EntityCursor, KbReader, Resolution};
pub use resources::{Resource, ResourceKind};
pub use schema::{
    AliasEntry, Category, CitationEntry, EntityRecord, ForeignNameHomonym, HistoryEntry, Homonym,
    IdentifierHomonym, TableSet,
};
pub use store::{open_store, KbStore, Manifest, MemoryKbStore, SqlKbStore, StatusMarker};
