//! Corpus build orchestration
//!
//! Each corpus is fetched once, parsed once per split, and aligned once per
//! category it annotates. Outputs live under a directory named by a digest
//! of the alignment options so differently configured builds coexist.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use super::{definition, AlignOptions, Aligner, Document, QaqcStats, RawDocument, Split};
use crate::config::BelbConfig;
use crate::fetch::{sha256_file_async, Fetcher};
use crate::reader::KbReader;
use crate::resources::{self, kb_for_category, Resource, ResourceKind};
use crate::schema::Category;
use crate::store::manifest::write_atomic;
use crate::store::StatusMarker;

pub const QAQC_FILE: &str = "qaqc_stats.json";

#[derive(Debug, Clone, Default)]
pub struct CorpusBuildOptions {
    pub sentences: bool,
    /// Use whatever is in `raw/` without network access
    pub offline: bool,
    pub overwrite: bool,
}

impl CorpusBuildOptions {
    pub fn align_options(&self) -> AlignOptions {
        AlignOptions {
            sentences: self.sentences,
        }
    }
}

/// Description of one processed corpus, written as `manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusManifest {
    pub corpus: String,
    pub category: Category,
    /// Knowledge base the identifiers were resolved against
    pub kb: String,
    pub options: AlignOptions,
    pub digest: String,
    pub built_at: DateTime<Utc>,
    /// Documents per split
    pub documents: BTreeMap<String, u64>,
    /// SHA-256 of each raw file, keyed by file name
    #[serde(default)]
    pub sources: BTreeMap<String, String>,
}

/// Outcome of aligning one corpus for one category
#[derive(Debug, Clone, Serialize)]
pub struct CorpusSummary {
    pub corpus: String,
    pub category: Category,
    pub dir: PathBuf,
    pub digest: String,
    pub stats: BTreeMap<String, QaqcStats>,
    pub elapsed_ms: u64,
}

/// First 16 hex digits of the SHA-256 of the serialized options
pub fn options_digest(options: &AlignOptions) -> String {
    let bytes = serde_json::to_vec(options).unwrap_or_default();
    let digest = hex::encode(Sha256::digest(&bytes));
    digest[..16].to_string()
}

/// `{name}` for single-category corpora, `{name}-{category}` otherwise
pub fn output_name(resource: &Resource, category: Category) -> String {
    if resource.categories.len() > 1 {
        format!("{}-{}", resource.name, category)
    } else {
        resource.name.to_string()
    }
}

pub fn output_dir(root: &Path, resource: &Resource, category: Category, digest: &str) -> PathBuf {
    root.join("processed")
        .join(ResourceKind::Corpus.dir_name())
        .join(output_name(resource, category))
        .join(digest)
}

/// Read one processed split
pub fn read_split(dir: &Path, split: Split) -> Result<Vec<Document>> {
    let path = dir.join(format!("{split}.json"));
    let content = std::fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_slice(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Builds corpora below a data directory
#[derive(Debug, Clone)]
pub struct CorpusBuilder {
    root: PathBuf,
    config: BelbConfig,
    options: CorpusBuildOptions,
}

impl CorpusBuilder {
    pub fn new(root: impl Into<PathBuf>, config: BelbConfig, options: CorpusBuildOptions) -> Self {
        Self {
            root: root.into(),
            config,
            options,
        }
    }

    /// Build a corpus against the knowledge bases built under the data directory
    pub async fn build(&self, name: &str) -> Result<Vec<CorpusSummary>> {
        let resource = resources::get(name, ResourceKind::Corpus)?;
        let mut readers = Vec::with_capacity(resource.categories.len());
        for &category in resource.categories {
            let kb = kb_for_category(category);
            let reader = KbReader::open(&self.root, kb, &self.config)
                .await
                .with_context(|| format!("Corpus `{name}` needs knowledge base `{kb}`"))?;
            readers.push((category, reader));
        }
        self.build_with_readers(name, readers).await
    }

    /// Build a corpus with already opened readers, one per category
    pub async fn build_with_readers(
        &self,
        name: &str,
        readers: Vec<(Category, KbReader)>,
    ) -> Result<Vec<CorpusSummary>> {
        let resource = resources::get(name, ResourceKind::Corpus)?;
        let definition = definition(name)?;
        info!(corpus = name, sentences = self.options.sentences, "Building corpus");

        let (raw_dir, sources) = self.raw_inputs(resource).await?;
        let splits = tokio::task::spawn_blocking(move || {
            Split::ALL
                .iter()
                .map(|&split| -> Result<(Split, Vec<RawDocument>)> {
                    Ok((split, definition.load_split(&raw_dir, split)?))
                })
                .collect::<Result<Vec<_>>>()
        })
        .await
        .context("Corpus parser task panicked")?
        .with_context(|| format!("Failed to parse corpus `{name}`"))?;

        let options = self.options.align_options();
        let digest = options_digest(&options);
        let mut summaries = Vec::with_capacity(readers.len());

        for (category, reader) in readers {
            let started = Instant::now();
            let kb = reader.kb().to_string();
            let dir = output_dir(&self.root, resource, category, &digest);
            std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
            // a rebuild invalidates the previous output first
            StatusMarker::remove(&dir).context("Failed to clear success marker")?;

            let mut aligner = Aligner::new(definition, category, reader, options.clone());
            let written = async {
                let mut stats = BTreeMap::new();
                let mut documents = BTreeMap::new();
                for (split, raw) in &splits {
                    let mut split_stats = QaqcStats::default();
                    let mut aligned = Vec::with_capacity(raw.len());
                    for document in raw.iter().cloned() {
                        aligned.push(aligner.align(document, &mut split_stats).await?);
                    }
                    write_atomic(&dir, &format!("{split}.json"), &serde_json::to_vec(&aligned)?)?;
                    info!(
                        corpus = name,
                        category = %category,
                        split = %split,
                        documents = aligned.len(),
                        annotations = split_stats.annotations_out,
                        dropped = split_stats.annotations_in - split_stats.annotations_out,
                        "Split aligned"
                    );
                    documents.insert(split.to_string(), aligned.len() as u64);
                    stats.insert(split.to_string(), split_stats);
                }

                write_atomic(&dir, QAQC_FILE, &serde_json::to_vec_pretty(&stats)?)?;
                let manifest = CorpusManifest {
                    corpus: name.to_string(),
                    category,
                    kb: kb.clone(),
                    options: options.clone(),
                    digest: digest.clone(),
                    built_at: Utc::now(),
                    documents,
                    sources: sources.clone(),
                };
                write_atomic(&dir, crate::store::manifest::MANIFEST_FILE, &serde_json::to_vec_pretty(&manifest)?)?;
                StatusMarker::write(&dir)?;
                anyhow::Ok(stats)
            }
            .await;

            let stats = match written {
                Ok(stats) => stats,
                Err(e) => {
                    if let Err(remove) = StatusMarker::remove(&dir) {
                        warn!(corpus = name, error = %remove, "Could not remove success marker");
                    }
                    return Err(e.context(format!("Alignment of `{name}` ({category}) against `{kb}` failed")));
                }
            };

            let elapsed_ms = started.elapsed().as_millis() as u64;
            info!(corpus = name, category = %category, dir = %dir.display(), elapsed_ms, "Corpus ready");
            summaries.push(CorpusSummary {
                corpus: name.to_string(),
                category,
                dir,
                digest: digest.clone(),
                stats,
                elapsed_ms,
            });
        }
        Ok(summaries)
    }

    async fn raw_inputs(&self, resource: &Resource) -> Result<(PathBuf, BTreeMap<String, String>)> {
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
        Ok((dir, report.files.into_iter().map(|f| (f.name, f.sha256)).collect()))
    }

    /// Build several corpora, at most `workers` at a time, results in input order
    pub async fn build_all(
        &self,
        names: &[String],
        workers: usize,
    ) -> Vec<(String, Result<Vec<CorpusSummary>>)> {
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
                error!(corpus = %name, error = %format!("{e:#}"), "Corpus build failed");
            }
            results.push((name.clone(), result));
        }
        results
    }
}

/// Expand `all` into every corpus name, otherwise validate the given names
pub fn expand_names(requested: &[String]) -> Result<Vec<String>> {
    if requested.iter().any(|n| n == "all") {
        return Ok(resources::names(ResourceKind::Corpus)
            .into_iter()
            .map(str::to_string)
            .collect());
    }
    for name in requested {
        resources::get(name, ResourceKind::Corpus)?;
    }
    Ok(requested.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderConfig;
    use crate::schema::{EntityRecord, HistoryEntry, TableSet};
    use crate::store::{KbStore, MemoryKbStore};

    const TRAIN: &str = "\
1|t|BRCA1 and TP53.
1|a|The BRCA1 gene is mutated. Old ids persist.
1\t0\t5\tBRCA1\tGene\t672(Tax:9606)
1\t10\t14\tTP53\tGene\t7157
1\t20\t25\tBRCA1\tGene\t100
1\t40\t44\tXYZ1\tGene\t672

";

    fn write_corpus(root: &Path) {
        let dir = root.join("raw/corpora/gnormplus/GNormPlusCorpus");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("BC2GNtrain.PubTator.txt"), TRAIN).unwrap();
        std::fs::write(dir.join("NLMIAT.PubTator.txt"), "").unwrap();
        std::fs::write(dir.join("BC2GNtest.PubTator.txt"), "").unwrap();
    }

    async fn gene_reader() -> KbReader {
        let store = MemoryKbStore::new();
        let tables = TableSet {
            entities: vec![
                EntityRecord::new("672", Category::Gene, "BRCA1"),
                EntityRecord::new("7157", Category::Gene, "TP53"),
            ],
            history: vec![HistoryEntry::replaced("100", "672")],
            ..TableSet::default()
        };
        store.write_table_set("ncbi_gene", &tables).await.unwrap();
        KbReader::new(Arc::new(store), "ncbi_gene", ReaderConfig::default())
    }

    fn builder(root: &Path, sentences: bool) -> CorpusBuilder {
        CorpusBuilder::new(
            root,
            BelbConfig::default(),
            CorpusBuildOptions {
                sentences,
                offline: true,
                overwrite: false,
            },
        )
    }

    #[test]
    fn test_options_digest() {
        let plain = options_digest(&AlignOptions { sentences: false });
        let sentences = options_digest(&AlignOptions { sentences: true });
        assert_eq!(plain.len(), 16);
        assert_ne!(plain, sentences);
        assert_eq!(plain, options_digest(&AlignOptions::default()));
    }

    #[test]
    fn test_output_name() {
        let bc5cdr = resources::get("bc5cdr", ResourceKind::Corpus).unwrap();
        let gnormplus = resources::get("gnormplus", ResourceKind::Corpus).unwrap();
        assert_eq!(output_name(bc5cdr, Category::Chemical), "bc5cdr-chemical");
        assert_eq!(output_name(gnormplus, Category::Gene), "gnormplus");
    }

    #[tokio::test]
    async fn test_build_writes_splits_stats_and_marker() {
        let root = tempfile::tempdir().unwrap();
        write_corpus(root.path());

        let summaries = builder(root.path(), true)
            .build_with_readers("gnormplus", vec![(Category::Gene, gene_reader().await)])
            .await
            .unwrap();
        assert_eq!(summaries.len(), 1);

        let summary = &summaries[0];
        assert!(StatusMarker::is_up(&summary.dir));
        let train = &summary.stats["train"];
        assert_eq!(train.documents, 1);
        assert_eq!(train.annotations_in, 4);
        assert_eq!(train.offsets, 1);
        assert_eq!(train.ann_identifier_replaced, 1);
        assert_eq!(train.annotations_out, 3);

        let documents = read_split(&summary.dir, Split::Train).unwrap();
        assert!(documents[0].sentences);
        assert!(documents[0].offset_errors().is_empty());
        assert!(read_split(&summary.dir, Split::Test).unwrap().is_empty());

        let stats: BTreeMap<String, QaqcStats> =
            serde_json::from_slice(&std::fs::read(summary.dir.join(QAQC_FILE)).unwrap()).unwrap();
        assert_eq!(&stats["train"], train);
    }

    #[tokio::test]
    async fn test_missing_split_leaves_no_marker() {
        let root = tempfile::tempdir().unwrap();
        let result = builder(root.path(), false)
            .build_with_readers("gnormplus", vec![(Category::Gene, gene_reader().await)])
            .await;
        assert!(result.is_err());

        let digest = options_digest(&AlignOptions::default());
        let resource = resources::get("gnormplus", ResourceKind::Corpus).unwrap();
        assert!(!StatusMarker::is_up(&output_dir(root.path(), resource, Category::Gene, &digest)));
    }

    #[tokio::test]
    async fn test_unbuilt_kb_is_refused() {
        let root = tempfile::tempdir().unwrap();
        write_corpus(root.path());
        let err = builder(root.path(), false).build("gnormplus").await.unwrap_err();
        assert!(format!("{err:#}").contains("ncbi_gene"));
    }
}
