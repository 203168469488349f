//! Error taxonomy
//!
//! Each pipeline stage has its own error type. Record-level errors
//! (`FormatError`, `NormalizationError`) are recovered where they occur;
//! the others abort the build of the resource that raised them.

use std::path::PathBuf;

/// Network or storage failure while mirroring raw files
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("Download of {url} failed after {attempts} attempts: {message}")]
    Exhausted {
        url: String,
        attempts: u32,
        message: String,
    },
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
    #[error("Invalid source URL `{url}`: {message}")]
    InvalidUrl { url: String, message: String },
    #[error("Resource `{resource}` cannot be downloaded: {hint}")]
    LocalOnly { resource: String, hint: String },
    #[error("Cannot extract {}: {message}", path.display())]
    Extract { path: PathBuf, message: String },
    #[error("HTTP client error: {0}")]
    Client(String),
    #[error("File task failed: {0}")]
    Task(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A single raw record that violates its resource's structural contract
#[derive(Debug, Clone, thiserror::Error)]
#[error("{resource}: {file}:{line}: {message}")]
pub struct FormatError {
    pub resource: String,
    pub file: String,
    pub line: u64,
    pub message: String,
}

impl FormatError {
    pub fn new(
        resource: impl Into<String>,
        file: impl Into<String>,
        line: u64,
        message: impl Into<String>,
    ) -> Self {
        Self {
            resource: resource.into(),
            file: file.into(),
            line,
            message: message.into(),
        }
    }
}

/// Failure while reading a raw resource
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    #[error(transparent)]
    Format(#[from] FormatError),
    #[error(
        "{resource}: {malformed} of {seen} records are malformed (threshold {threshold}), source looks corrupted"
    )]
    TooManyMalformed {
        resource: String,
        malformed: usize,
        seen: usize,
        threshold: f64,
    },
    #[error("{resource}: missing input {}", path.display())]
    MissingInput { resource: String, path: PathBuf },
    #[error("{resource}: {message}")]
    Xml { resource: String, message: String },
    #[error("{resource}: {}: {message}", path.display())]
    Table {
        resource: String,
        path: PathBuf,
        message: String,
    },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Schema mapping violation for one record
#[derive(Debug, Clone, thiserror::Error)]
pub enum NormalizationError {
    #[error("{resource}: record without identifier")]
    EmptyIdentifier { resource: String },
    #[error("{resource}: `{identifier}` has category `{found}`, expected one of [{expected}]")]
    CategoryMismatch {
        resource: String,
        identifier: String,
        found: String,
        expected: String,
    },
    #[error("{resource}: `{identifier}` has no usable name")]
    NoNames {
        resource: String,
        identifier: String,
    },
}

/// History mapping is inconsistent: the source or the resolver is broken
#[derive(Debug, Clone, thiserror::Error)]
pub enum DataIntegrityError {
    #[error("History cycle in `{kb}`: {}", path.join(" -> "))]
    Cycle { kb: String, path: Vec<String> },
    #[error("History of `{identifier}` in `{kb}` exceeds {limit} hops")]
    HopLimit {
        kb: String,
        identifier: String,
        limit: usize,
    },
    #[error("History of `{from}` in `{kb}` points to unknown identifier `{to}`")]
    MissingReferent { kb: String, from: String, to: String },
}

/// Backend read/write failure
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Identifier `{identifier}` not found in `{kb}`")]
    NotFound { kb: String, identifier: String },
    #[error("Knowledge base `{0}` is not built (missing success marker)")]
    NotBuilt(String),
    #[error("Invalid table set name `{0}`")]
    InvalidName(String),
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Manifest error: {0}")]
    Manifest(#[from] serde_json::Error),
    #[error("Table export failed: {0}")]
    Export(#[from] csv::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Configuration could not be loaded
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Crate-level error
#[derive(Debug, thiserror::Error)]
pub enum BelbError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Normalization(#[from] NormalizationError),
    #[error(transparent)]
    DataIntegrity(#[from] DataIntegrityError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("Unknown resource `{name}` (available: {available})")]
    UnknownResource { name: String, available: String },
}

impl BelbError {
    /// True for a point lookup miss
    pub fn is_not_found(&self) -> bool {
        matches!(self, BelbError::Store(StoreError::NotFound { .. }))
    }
}

pub type Result<T, E = BelbError> = std::result::Result<T, E>;
