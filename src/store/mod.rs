//! Backing store
//!
//! A knowledge base is persisted as five tables (see [`Table`]). Writers
//! replace the whole table set atomically; readers see either the previous
//! or the new contents. Two implementations share the [`KbStore`] seam:
//!
//! - [`SqlKbStore`]: SQLite file per KB or a shared PostgreSQL database,
//!   one SQL code path through the sqlx `Any` driver
//! - [`MemoryKbStore`]: in-process maps for tests and dry runs

pub mod manifest;
pub mod memory;
pub mod sql;

use std::path::Path;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use regex::Regex;

use crate::config::{Backend, StoreConfig};
use crate::error::{BelbError, StoreError};
use crate::schema::{EntityRecord, HistoryEntry, Homonym, TableSet};

pub use manifest::{Manifest, StatusMarker};
pub use memory::MemoryKbStore;
pub use sql::SqlKbStore;

/// File name of the SQLite database inside `processed/kbs/{kb}/`
pub const SQLITE_FILE: &str = "kb.db";

/// Persistence for normalized knowledge bases.
///
/// `kb` is the table set name and must match `^[a-z][a-z0-9_]*$`.
#[async_trait]
pub trait KbStore: Send + Sync {
    /// Backend name recorded in the manifest
    fn backend(&self) -> &'static str;

    // ── Writer ──

    /// Create or replace the table set for `kb`
    async fn write_table_set(&self, kb: &str, tables: &TableSet) -> Result<(), StoreError>;

    // ── Entities ──

    async fn lookup(&self, kb: &str, identifier: &str) -> Result<Option<EntityRecord>, StoreError>;

    /// Up to `limit` records with identifier strictly greater than `after`,
    /// ordered by identifier (byte order)
    async fn entities_after(
        &self,
        kb: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EntityRecord>, StoreError>;

    async fn count(&self, kb: &str) -> Result<u64, StoreError>;

    // ── History / aliases ──

    /// History entry whose source is `identifier`, if any
    async fn history(&self, kb: &str, identifier: &str) -> Result<Option<HistoryEntry>, StoreError>;

    /// Primary identifier for a secondary one
    async fn alias(&self, kb: &str, alias: &str) -> Result<Option<String>, StoreError>;

    // ── Supplementary queries ──

    async fn citations(&self, kb: &str, identifier: &str) -> Result<Vec<String>, StoreError>;

    /// Names shared by more than one identifier, ordered by name
    async fn name_homonyms(&self, kb: &str, limit: usize) -> Result<Vec<Homonym>, StoreError>;
}

/// Reject table set names that could not be used verbatim in SQL
pub fn validate_kb_name(kb: &str) -> Result<(), StoreError> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    let valid = PATTERN
        .get_or_init(|| Regex::new(r"^[a-z][a-z0-9_]*$").ok())
        .as_ref()
        .map(|re| re.is_match(kb))
        .unwrap_or(false);
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidName(kb.to_string()))
    }
}

/// Open the configured store for a knowledge base directory.
///
/// SQLite stores live in `{kb_dir}/kb.db`; PostgreSQL ignores `kb_dir`.
pub async fn open_store(config: &StoreConfig, kb_dir: &Path) -> Result<Arc<dyn KbStore>, BelbError> {
    let store = match config.backend {
        Backend::Sqlite => {
            std::fs::create_dir_all(kb_dir).map_err(StoreError::Io)?;
            SqlKbStore::connect_sqlite(&kb_dir.join(SQLITE_FILE), config).await?
        }
        Backend::Postgres => SqlKbStore::connect(&config.postgres_url()?, config).await?,
    };
    Ok(Arc::new(store))
}
