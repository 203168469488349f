//! Resource registry
//!
//! Process-wide, read-only description of every knowledge base and corpus
//! the pipeline knows how to fetch and build. Initialized once on first use.

use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use crate::error::BelbError;
use crate::schema::Category;

/// Knowledge base or corpus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Kb,
    Corpus,
}

impl ResourceKind {
    /// Directory name under `raw/` and `processed/`
    pub fn dir_name(&self) -> &'static str {
        match self {
            ResourceKind::Kb => "kbs",
            ResourceKind::Corpus => "corpora",
        }
    }
}

/// Static description of one resource
#[derive(Debug, Clone)]
pub struct Resource {
    pub name: &'static str,
    pub kind: ResourceKind,
    /// Remote directory; `None` for local-only (licensed) resources
    pub base_url: Option<&'static str>,
    /// Files fetched relative to `base_url`
    pub files: &'static [&'static str],
    /// Unpack archives after download
    pub extract: bool,
    /// Data must be supplied by the user
    pub local: bool,
    pub categories: &'static [Category],
    /// Shown when a local resource has no data directory, or the user must add files
    pub hint: &'static str,
}

impl Resource {
    /// `raw/{kbs|corpora}/{name}` below the data directory
    pub fn raw_dir(&self, root: &Path) -> PathBuf {
        root.join("raw").join(self.kind.dir_name()).join(self.name)
    }

    /// `processed/{kbs|corpora}/{name}` below the data directory
    pub fn processed_dir(&self, root: &Path) -> PathBuf {
        root.join("processed").join(self.kind.dir_name()).join(self.name)
    }

    pub fn has_category(&self, category: Category) -> bool {
        self.categories.contains(&category)
    }
}

static REGISTRY: OnceLock<Vec<Resource>> = OnceLock::new();

fn build_registry() -> Vec<Resource> {
    vec![
        // ── Knowledge bases, in build order ──
        Resource {
            name: "ctd_diseases",
            kind: ResourceKind::Kb,
            base_url: Some("https://ctdbase.org/reports/"),
            files: &["CTD_diseases.tsv.gz"],
            extract: false,
            local: false,
            categories: &[Category::Disease],
            hint: "",
        },
        Resource {
            name: "ctd_chemicals",
            kind: ResourceKind::Kb,
            base_url: Some("http://ctdbase.org/reports/"),
            files: &["CTD_chemicals.tsv.gz"],
            extract: false,
            local: false,
            categories: &[Category::Chemical],
            hint: "",
        },
        Resource {
            name: "ncbi_taxonomy",
            kind: ResourceKind::Kb,
            base_url: Some("https://ftp.ncbi.nlm.nih.gov/pub/taxonomy/"),
            files: &["taxdump.tar.gz"],
            extract: true,
            local: false,
            categories: &[Category::Species],
            hint: "",
        },
        Resource {
            name: "cellosaurus",
            kind: ResourceKind::Kb,
            base_url: Some("https://ftp.expasy.org/databases/cellosaurus/"),
            files: &["cellosaurus.txt", "cellosaurus_deleted_ACs.txt"],
            extract: false,
            local: false,
            categories: &[Category::CellLine],
            hint: "",
        },
        Resource {
            name: "umls",
            kind: ResourceKind::Kb,
            base_url: None,
            files: &["MRCONSO.RRF", "MRCUI.RRF"],
            extract: false,
            local: true,
            categories: &[Category::Concept],
            hint: "UMLS is licensed: download the Metathesaurus and pass its META directory with --umls",
        },
        Resource {
            name: "ncbi_gene",
            kind: ResourceKind::Kb,
            base_url: Some("https://ftp.ncbi.nih.gov/gene/DATA/"),
            files: &["gene_info.gz", "gene_history.gz"],
            extract: false,
            local: false,
            categories: &[Category::Gene],
            hint: "",
        },
        Resource {
            name: "dbsnp",
            kind: ResourceKind::Kb,
            base_url: None,
            files: &[],
            extract: false,
            local: true,
            categories: &[Category::Variant],
            hint: "dbSNP JSON dumps are too large to mirror: download refsnp-chr*.json.bz2 and pass the directory with --dbsnp",
        },
        // ── Corpora ──
        Resource {
            name: "ncbi_disease",
            kind: ResourceKind::Corpus,
            base_url: Some("https://www.ncbi.nlm.nih.gov/CBBresearch/Dogan/DISEASE/"),
            files: &[
                "NCBItrainset_corpus.zip",
                "NCBIdevelopset_corpus.zip",
                "NCBItestset_corpus.zip",
            ],
            extract: true,
            local: false,
            categories: &[Category::Disease],
            hint: "",
        },
        Resource {
            name: "bc5cdr",
            kind: ResourceKind::Corpus,
            base_url: Some("https://biocreative.bioinformatics.udel.edu/media/store/files/2016/"),
            files: &["CDR_Data.zip"],
            extract: true,
            local: false,
            categories: &[Category::Disease, Category::Chemical],
            hint: "",
        },
        Resource {
            name: "gnormplus",
            kind: ResourceKind::Corpus,
            base_url: Some(
                "https://www.ncbi.nlm.nih.gov/CBBresearch/Lu/Demo/tmTools/download/GNormPlus/",
            ),
            files: &["GNormPlusCorpus.zip"],
            extract: true,
            local: false,
            categories: &[Category::Gene],
            hint: "",
        },
        Resource {
            name: "nlm_chem",
            kind: ResourceKind::Corpus,
            base_url: Some("https://ftp.ncbi.nlm.nih.gov/pub/lu/BC7-NLM-Chem-track/"),
            files: &["BC7T2-NLMChem-corpus_v2.BioC.xml.gz"],
            extract: true,
            local: false,
            categories: &[Category::Chemical],
            hint: "",
        },
        Resource {
            name: "nlm_gene",
            kind: ResourceKind::Corpus,
            base_url: Some("https://zenodo.org/record/5089049/files/"),
            files: &["NLM-Gene-Corpus.zip"],
            extract: true,
            local: false,
            categories: &[Category::Gene],
            hint: SPLITS_HINT,
        },
        Resource {
            name: "s800",
            kind: ResourceKind::Corpus,
            base_url: Some("https://species.jensenlab.org/files/"),
            files: &["S800-1.0.tar.gz"],
            extract: true,
            local: false,
            categories: &[Category::Species],
            hint: SPLITS_HINT,
        },
        Resource {
            name: "linnaeus",
            kind: ResourceKind::Corpus,
            base_url: Some("https://sourceforge.net/projects/linnaeus/files/Corpora/"),
            files: &["manual-corpus-species-1.1.tar.gz"],
            extract: true,
            local: false,
            categories: &[Category::Species],
            hint: SPLITS_HINT,
        },
        Resource {
            name: "bioid",
            kind: ResourceKind::Corpus,
            base_url: Some("https://biocreative.bioinformatics.udel.edu/media/store/files/2017/"),
            files: &["BioIDtraining_2.tar.gz"],
            extract: true,
            local: false,
            categories: &[Category::CellLine],
            hint: SPLITS_HINT,
        },
        Resource {
            name: "medmentions",
            kind: ResourceKind::Corpus,
            base_url: Some("https://github.com/chanzuckerberg/MedMentions/archive/refs/heads/"),
            files: &["master.zip"],
            extract: true,
            local: false,
            categories: &[Category::Concept],
            hint: "",
        },
    ]
}

/// Corpora without official splits read their document ids from `splits.json`
const SPLITS_HINT: &str = "place splits.json ({\"train\": [ids], \"dev\": [..], \"test\": [..]}) in the raw corpus directory";

/// All registered resources
pub fn registry() -> &'static [Resource] {
    REGISTRY.get_or_init(build_registry)
}

/// Names of all resources of a kind, in build order
pub fn names(kind: ResourceKind) -> Vec<&'static str> {
    registry()
        .iter()
        .filter(|r| r.kind == kind)
        .map(|r| r.name)
        .collect()
}

/// Look up a resource by name and kind
pub fn get(name: &str, kind: ResourceKind) -> Result<&'static Resource, BelbError> {
    registry()
        .iter()
        .find(|r| r.kind == kind && r.name == name)
        .ok_or_else(|| BelbError::UnknownResource {
            name: name.to_string(),
            available: names(kind).join(", "),
        })
}

/// Knowledge base used to resolve corpus annotations of a category
pub fn kb_for_category(category: Category) -> &'static str {
    match category {
        Category::Gene => "ncbi_gene",
        Category::Disease => "ctd_diseases",
        Category::Chemical => "ctd_chemicals",
        Category::Species => "ncbi_taxonomy",
        Category::Variant => "dbsnp",
        Category::CellLine => "cellosaurus",
        Category::Concept => "umls",
    }
}
