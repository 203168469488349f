//! Knowledge base build orchestration
//!
//! ```text
//! raw/kbs/{kb}/ ──► KbParser ──► MalformedGuard ──► Normalizer ──► TableSet
//!                                                                    │
//!      processed/kbs/{kb}/ ◄── status.json ◄── manifest.json ◄── KbStore + tables/*.tsv.gz
//! ```
//!
//! One resource is built sequentially. `build_all` runs independent
//! resources concurrently, bounded by a semaphore; a failure is reported
//! for its resource and never touches the others.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use crate::config::BelbConfig;
use crate::fetch::{locate_local, sha256_file_async, Fetcher};
use crate::kbs::{parser_for, MalformedGuard};
use crate::normalize::{normalize_records, NormalizeStats};
use crate::resources::{self, Resource, ResourceKind};
use crate::schema::TableSet;
use crate::store::manifest::{export_tables, snapshot_date};
use crate::store::{open_store, KbStore, Manifest, StatusMarker};

/// Per-invocation build options
#[derive(Debug, Clone, Default)]
pub struct KbBuildOptions {
    /// Re-download files already present
    pub overwrite: bool,
    /// Use whatever is in `raw/` without network access
    pub offline: bool,
    /// UMLS `META` directory
    pub umls_dir: Option<PathBuf>,
    /// Directory holding the dbSNP JSON dumps
    pub dbsnp_dir: Option<PathBuf>,
}

impl KbBuildOptions {
    fn local_dir(&self, resource: &str) -> Option<&Path> {
        match resource {
            "umls" => self.umls_dir.as_deref(),
            "dbsnp" => self.dbsnp_dir.as_deref(),
            _ => None,
        }
    }
}

/// Outcome of one successful build
#[derive(Debug, Clone, Serialize)]
pub struct BuildSummary {
    pub resource: String,
    pub dir: PathBuf,
    pub counts: BTreeMap<String, u64>,
    pub checksum: String,
    pub stats: NormalizeStats,
    pub malformed: usize,
    pub elapsed_ms: u64,
}

/// Builds knowledge bases below a data directory
#[derive(Debug, Clone)]
pub struct KbBuilder {
    root: PathBuf,
    config: BelbConfig,
    options: KbBuildOptions,
}

impl KbBuilder {
    pub fn new(root: impl Into<PathBuf>, config: BelbConfig, options: KbBuildOptions) -> Self {
        Self {
            root: root.into(),
            config,
            options,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Build one knowledge base into the configured store
    pub async fn build(&self, name: &str) -> Result<BuildSummary> {
        let resource = resources::get(name, ResourceKind::Kb)?;
        let dir = resource.processed_dir(&self.root);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let store = open_store(&self.config.store, &dir)
            .await
            .with_context(|| format!("Failed to open {} store for `{name}`", self.config.store.backend.as_str()))?;
        self.build_into(resource, store).await
    }

    /// Build one knowledge base into an already opened store
    pub async fn build_with_store(&self, name: &str, store: Arc<dyn KbStore>) -> Result<BuildSummary> {
        let resource = resources::get(name, ResourceKind::Kb)?;
        self.build_into(resource, store).await
    }

    async fn build_into(&self, resource: &'static Resource, store: Arc<dyn KbStore>) -> Result<BuildSummary> {
        let started = Instant::now();
        let name = resource.name;
        info!(resource = name, backend = store.backend(), "Building knowledge base");

        let (raw_dir, sources) = self.raw_inputs(resource).await?;

        let parser_config = self.config.parser.clone();
        let input = raw_dir.clone();
        let (tables, stats, malformed) = tokio::task::spawn_blocking(move || {
            parse_and_normalize(resource, &input, &parser_config)
        })
        .await
        .context("Parser task panicked")??;

        let checksum = tables
            .checksum()
            .with_context(|| format!("Failed to serialize tables of `{name}`"))?;
        let counts = tables.counts();

        let dir = resource.processed_dir(&self.root);
        store
            .write_table_set(name, &tables)
            .await
            .with_context(|| format!("Failed to write tables of `{name}`"))?;

        // from here on the live tables belong to this build
        let finished = async {
            export_tables(&dir, &tables).context("Failed to export tables")?;
            Manifest {
                resource: name.to_string(),
                categories: resource.categories.to_vec(),
                snapshot: snapshot_date(&raw_dir),
                built_at: Utc::now(),
                backend: store.backend().to_string(),
                counts: counts.clone(),
                checksum: checksum.clone(),
                sources,
            }
            .write(&dir)
            .context("Failed to write manifest")?;
            StatusMarker::write(&dir).context("Failed to write success marker")?;
            anyhow::Ok(())
        }
        .await;

        if let Err(e) = finished {
            if let Err(remove) = StatusMarker::remove(&dir) {
                warn!(resource = name, error = %remove, "Could not remove success marker");
            }
            return Err(e.context(format!("Build of `{name}` left incomplete")));
        }

        let elapsed_ms = started.elapsed().as_millis() as u64;
        info!(
            resource = name,
            entities = counts.get("entities").copied().unwrap_or(0),
            history = counts.get("history").copied().unwrap_or(0),
            skipped = stats.skipped,
            malformed,
            checksum = %checksum,
            elapsed_ms,
            "Knowledge base ready"
        );

        Ok(BuildSummary {
            resource: name.to_string(),
            dir,
            counts,
            checksum,
            stats,
            malformed,
            elapsed_ms,
        })
    }

    /// Locate or download raw files; returns the input directory and the
    /// SHA-256 of each mirrored file
    async fn raw_inputs(&self, resource: &Resource) -> Result<(PathBuf, BTreeMap<String, String>)> {
        if resource.local {
            let dir = locate_local(resource, self.options.local_dir(resource.name))?;
            return Ok((dir, BTreeMap::new()));
        }

        let dir = resource.raw_dir(&self.root);
        if self.options.offline {
            let mut sources = BTreeMap::new();
            for name in resource.files {
                let path = dir.join(name);
                if path.exists() {
                    sources.insert(name.to_string(), sha256_file_async(path).await?);
                }
            }
            return Ok((dir, sources));
        }

        let fetcher = Fetcher::new(self.config.fetch.clone())?;
        let report = fetcher
            .fetch(resource, &dir, self.options.overwrite)
            .await
            .with_context(|| format!("Failed to fetch `{}`", resource.name))?;
        let sources = report
            .files
            .into_iter()
            .map(|f| (f.name, f.sha256))
            .collect();
        Ok((dir, sources))
    }

    /// Build several resources, at most `workers` at a time.
    ///
    /// Results are returned in input order.
    pub async fn build_all(&self, names: &[String], workers: usize) -> Vec<(String, Result<BuildSummary>)> {
        let semaphore = Arc::new(Semaphore::new(workers.max(1)));
        let mut handles = Vec::with_capacity(names.len());

        for name in names {
            let builder = self.clone();
            let semaphore = semaphore.clone();
            let name = name.clone();
            handles.push(tokio::spawn(async move {
                let _permit = semaphore
                    .acquire_owned()
                    .await
                    .context("Worker pool closed")?;
                builder.build(&name).await
            }));
        }

        let mut results = Vec::with_capacity(names.len());
        for (name, handle) in names.iter().zip(handles) {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(anyhow::anyhow!("Build task for `{name}` failed: {e}")),
            };
            if let Err(e) = &result {
                error!(resource = %name, error = %format!("{e:#}"), "Build failed");
            }
            results.push((name.clone(), result));
        }
        results
    }
}

/// Expand `all` into every KB name, otherwise validate the given names.
///
/// Under `all`, a local resource is kept only when its data directory is set.
pub fn expand_names(requested: &[String], options: &KbBuildOptions) -> Result<Vec<String>> {
    if requested.iter().any(|n| n == "all") {
        let mut names = Vec::new();
        for resource in resources::registry().iter().filter(|r| r.kind == ResourceKind::Kb) {
            if resource.local && options.local_dir(resource.name).is_none() {
                warn!(resource = resource.name, hint = resource.hint, "Skipping local resource");
                continue;
            }
            names.push(resource.name.to_string());
        }
        return Ok(names);
    }
    for name in requested {
        resources::get(name, ResourceKind::Kb)?;
    }
    Ok(requested.to_vec())
}

fn parse_and_normalize(
    resource: &Resource,
    input: &Path,
    config: &crate::config::ParserConfig,
) -> Result<(TableSet, NormalizeStats, usize)> {
    let parser = parser_for(resource.name)?;
    let records = parser
        .records(input)
        .with_context(|| format!("Failed to open raw input of `{}` in {}", resource.name, input.display()))?;
    let mut guarded = MalformedGuard::new(records, resource.name, config);
    let (tables, stats) = normalize_records(resource.name, resource.categories, &mut guarded)
        .with_context(|| format!("Failed to parse `{}`", resource.name))?;
    Ok((tables, stats, guarded.malformed()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryKbStore;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const CTD_DISEASES: &str = "\
# CTD diseases
Asthma\tMESH:D001249\t\t\t\tC08.127\t\tAsthmas\t
Gout\tMESH:D006073\tMESH:D000001\t\t\t\t\tGouts|Podagra\t
";

    fn write_raw(root: &Path) {
        let dir = root.join("raw/kbs/ctd_diseases");
        std::fs::create_dir_all(&dir).unwrap();
        let mut encoder = GzEncoder::new(
            std::fs::File::create(dir.join("CTD_diseases.tsv.gz")).unwrap(),
            Compression::default(),
        );
        encoder.write_all(CTD_DISEASES.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    fn builder(root: &Path) -> KbBuilder {
        KbBuilder::new(
            root,
            BelbConfig::default(),
            KbBuildOptions {
                offline: true,
                ..KbBuildOptions::default()
            },
        )
    }

    #[tokio::test]
    async fn test_build_into_memory_store() {
        let root = tempfile::tempdir().unwrap();
        write_raw(root.path());

        let store = Arc::new(MemoryKbStore::new());
        let summary = builder(root.path())
            .build_with_store("ctd_diseases", store.clone())
            .await
            .unwrap();

        assert_eq!(summary.counts["entities"], 2);
        assert_eq!(summary.counts["aliases"], 1);
        let dir = root.path().join("processed/kbs/ctd_diseases");
        assert!(StatusMarker::is_up(&dir));

        let manifest = Manifest::read(&dir).unwrap();
        assert_eq!(manifest.backend, "memory");
        assert_eq!(manifest.checksum, summary.checksum);
        assert!(manifest.sources.contains_key("CTD_diseases.tsv.gz"));
        assert_eq!(store.count("ctd_diseases").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_raw_input_leaves_no_marker() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKbStore::new());
        let result = builder(root.path()).build_with_store("ctd_diseases", store).await;

        assert!(result.is_err());
        assert!(!StatusMarker::is_up(&root.path().join("processed/kbs/ctd_diseases")));
    }

    #[tokio::test]
    async fn test_local_resource_without_directory_fails() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryKbStore::new());
        let err = builder(root.path())
            .build_with_store("umls", store)
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("--umls"));
    }

    #[test]
    fn test_expand_names() {
        let all = expand_names(&["all".to_string()], &KbBuildOptions::default()).unwrap();
        assert!(all.contains(&"ncbi_gene".to_string()));
        assert!(!all.contains(&"umls".to_string()));
        assert!(!all.contains(&"dbsnp".to_string()));
        assert!(expand_names(&["nope".to_string()], &KbBuildOptions::default()).is_err());

        let options = KbBuildOptions {
            umls_dir: Some(PathBuf::from("/data/umls/META")),
            ..KbBuildOptions::default()
        };
        let all = expand_names(&["all".to_string()], &options).unwrap();
        assert!(all.contains(&"umls".to_string()));
        assert!(!all.contains(&"dbsnp".to_string()));
        // registry order is kept
        let umls = all.iter().position(|n| n == "umls").unwrap();
        let gene = all.iter().position(|n| n == "ncbi_gene").unwrap();
        assert!(umls < gene);

        // explicit names are never filtered
        let explicit = expand_names(&["dbsnp".to_string()], &KbBuildOptions::default()).unwrap();
        assert_eq!(explicit, vec!["dbsnp".to_string()]);
    }
}
