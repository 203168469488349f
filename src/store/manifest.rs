//! Build manifest and success marker
//!
//! `manifest.json` describes a finished build; `status.json` is written last
//! and is what readers check before opening a knowledge base.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, Utc};
use flate2::{Compression, GzBuilder};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::schema::{Category, Table, TableSet};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const STATUS_FILE: &str = "status.json";
pub const TABLES_DIR: &str = "tables";

/// Description of one knowledge base build
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub resource: String,
    pub categories: Vec<Category>,
    /// Newest modification date among the raw files
    pub snapshot: Option<NaiveDate>,
    pub built_at: DateTime<Utc>,
    pub backend: String,
    /// Rows per table
    pub counts: BTreeMap<String, u64>,
    /// BLAKE3 digest of the normalized tables
    pub checksum: String,
    /// SHA-256 of each raw file, keyed by file name
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
}

impl Manifest {
    /// Atomically write `manifest.json` into `dir`
    pub fn write(&self, dir: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_vec_pretty(self)?;
        write_atomic(dir, MANIFEST_FILE, &content)
    }

    pub fn read(dir: &Path) -> Result<Self, StoreError> {
        let content = std::fs::read(dir.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&content)?)
    }
}

/// Success marker, `{"status":"up"}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMarker {
    pub status: String,
}

impl StatusMarker {
    const UP: &'static str = "up";

    pub fn up() -> Self {
        Self {
            status: Self::UP.to_string(),
        }
    }

    pub fn write(dir: &Path) -> Result<(), StoreError> {
        let content = serde_json::to_vec(&Self::up())?;
        write_atomic(dir, STATUS_FILE, &content)
    }

    /// True if `dir` holds a completed build
    pub fn is_up(dir: &Path) -> bool {
        std::fs::read(dir.join(STATUS_FILE))
            .ok()
            .and_then(|c| serde_json::from_slice::<StatusMarker>(&c).ok())
            .map(|m| m.status == Self::UP)
            .unwrap_or(false)
    }

    pub fn remove(dir: &Path) -> Result<(), StoreError> {
        match std::fs::remove_file(dir.join(STATUS_FILE)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Write through a temporary file in the same directory, then rename
pub fn write_atomic(dir: &Path, name: &str, content: &[u8]) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    tmp.persist(dir.join(name)).map_err(|e| StoreError::Io(e.error))?;
    Ok(())
}

/// Export every table as `tables/{table}.tsv.gz`.
///
/// The gzip header carries no timestamp so identical tables give identical files.
pub fn export_tables(dir: &Path, tables: &TableSet) -> Result<Vec<PathBuf>, StoreError> {
    let out = dir.join(TABLES_DIR);
    std::fs::create_dir_all(&out)?;

    let mut written = Vec::with_capacity(Table::ALL.len());
    for table in Table::ALL {
        let tsv = tables.to_tsv(table)?;
        let path = out.join(format!("{}.tsv.gz", table.suffix()));
        let mut tmp = tempfile::NamedTempFile::new_in(&out)?;
        {
            let mut encoder = GzBuilder::new()
                .mtime(0)
                .write(tmp.as_file_mut(), Compression::default());
            encoder.write_all(&tsv)?;
            encoder.finish()?;
        }
        tmp.persist(&path).map_err(|e| StoreError::Io(e.error))?;
        written.push(path);
    }
    Ok(written)
}

/// Newest modification date of the files directly inside `dir`
pub fn snapshot_date(dir: &Path) -> Option<NaiveDate> {
    std::fs::read_dir(dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .filter_map(|m| m.modified().ok())
        .max()
        .map(|t| DateTime::<Utc>::from(t).date_naive())
}

/// Raw bytes of an exported table
pub fn read_export(dir: &Path, table: Table) -> Result<Vec<u8>, StoreError> {
    let path = dir.join(TABLES_DIR).join(format!("{}.tsv.gz", table.suffix()));
    Ok(std::fs::read(path)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::EntityRecord;

    fn manifest() -> Manifest {
        Manifest {
            resource: "ncbi_gene".into(),
            categories: vec![Category::Gene],
            snapshot: NaiveDate::from_ymd_opt(2024, 1, 31),
            built_at: Utc::now(),
            backend: "sqlite".into(),
            counts: BTreeMap::from([("entities".to_string(), 3)]),
            checksum: "abc".into(),
            sources: BTreeMap::new(),
        }
    }

    #[test]
    fn test_manifest_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let written = manifest();
        written.write(dir.path()).unwrap();
        assert_eq!(Manifest::read(dir.path()).unwrap(), written);
    }

    #[test]
    fn test_status_marker() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!StatusMarker::is_up(dir.path()));
        StatusMarker::write(dir.path()).unwrap();
        assert!(StatusMarker::is_up(dir.path()));
        assert_eq!(
            std::fs::read_to_string(dir.path().join(STATUS_FILE)).unwrap(),
            r#"{"status":"up"}"#
        );
        StatusMarker::remove(dir.path()).unwrap();
        StatusMarker::remove(dir.path()).unwrap();
        assert!(!StatusMarker::is_up(dir.path()));
    }

    #[test]
    fn test_exports_are_deterministic() {
        let tables = TableSet {
            entities: vec![EntityRecord::new("1", Category::Gene, "A1BG")],
            ..TableSet::default()
        };
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        export_tables(first.path(), &tables).unwrap();
        export_tables(second.path(), &tables).unwrap();

        for table in Table::ALL {
            assert_eq!(
                read_export(first.path(), table).unwrap(),
                read_export(second.path(), table).unwrap()
            );
        }
    }
}
