//! Annotated corpora
//!
//! ```text
//! raw/corpora/{name}/ ──► pubtator | bioc | standoff | captions ──► RawDocument
//!                                                │
//!                             Aligner (offsets, identifiers via KbReader)
//!                                                │
//!                               segment (optional sentences)
//!                                                │
//!            processed/corpora/{name}[-{category}]/{digest}/{split}.json
//! ```

pub mod align;
pub mod bioc;
pub mod build;
pub mod captions;
pub mod pubtator;
pub mod segment;
pub mod standoff;

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{BelbError, ParseError};
use crate::kbs::io::LossyLines;
use crate::schema::Category;

pub use align::{AlignOptions, Aligner, QaqcStats};
pub use build::{CorpusBuildOptions, CorpusBuilder, CorpusSummary};

/// Annotation flag: the enclosing sentence was merged across a boundary
pub const FLAG_CROSSING_SENTENCE: &str = "crossing_sentence";
/// Document flag: sentence splitting was abandoned
pub const FLAG_SEGMENTATION_FAILED: &str = "segmentation_failed";
/// Annotation flag: offsets were repaired
pub const FLAG_OFFSETS_FIXED: &str = "offsets_fixed";
/// Annotation flag: at least one identifier was replaced through history
pub const FLAG_IDENTIFIER_REPLACED: &str = "identifier_replaced";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Split {
    Train,
    Dev,
    Test,
}

impl Split {
    pub const ALL: [Split; 3] = [Split::Train, Split::Dev, Split::Test];

    pub fn as_str(&self) -> &'static str {
        match self {
            Split::Train => "train",
            Split::Dev => "dev",
            Split::Test => "test",
        }
    }
}

impl fmt::Display for Split {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Split {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "train" => Ok(Split::Train),
            "dev" => Ok(Split::Dev),
            "test" => Ok(Split::Test),
            _ => Err(format!("unknown split `{s}`")),
        }
    }
}

// ============================================================================
// Raw documents (as parsed)
// ============================================================================

/// Mention as written in the source file, before any checks
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAnnotation {
    /// Character offsets in the document text (passages joined by one space)
    pub start: usize,
    pub end: usize,
    pub text: String,
    /// Source entity type (`Disease`, `SpecificDisease`, `Gene`, ...)
    pub entity_type: String,
    /// Identifier field, unparsed
    pub identifiers: String,
    /// Spread over several locations; `start..end` covers all of them
    pub discontinuous: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawPassage {
    pub kind: String,
    pub text: String,
    pub annotations: Vec<RawAnnotation>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawDocument {
    pub id: String,
    pub passages: Vec<RawPassage>,
}

impl RawDocument {
    /// Passage texts joined by a single space
    pub fn text(&self) -> String {
        self.passages
            .iter()
            .map(|p| p.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Attach each annotation to the passage holding its start offset
pub(crate) fn attach_annotations(passages: &mut [RawPassage], annotations: Vec<RawAnnotation>) {
    let mut bounds = Vec::with_capacity(passages.len());
    let mut offset = 0;
    for passage in passages.iter() {
        let len = passage.text.chars().count();
        bounds.push((offset, offset + len));
        offset += len + 1;
    }
    for annotation in annotations {
        let index = bounds
            .iter()
            .position(|(start, end)| annotation.start >= *start && annotation.start <= *end)
            .unwrap_or(bounds.len().saturating_sub(1));
        if let Some(passage) = passages.get_mut(index) {
            passage.annotations.push(annotation);
        }
    }
}

// ============================================================================
// Processed documents
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Annotation {
    /// Unique within the document, assigned by start offset
    pub id: String,
    /// Character offsets, `[start, end)`. Absolute in the document unless
    /// the document was split into sentences, then relative to the passage.
    pub start: usize,
    pub end: usize,
    pub text: String,
    pub category: Category,
    pub identifiers: Vec<String>,
    /// Identifier string as found in the source
    pub original_identifiers: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Passage {
    pub id: usize,
    /// `title`, `abstract`, `paragraph`, ...
    pub kind: String,
    /// Character offset of the passage in the document text
    pub offset: usize,
    pub text: String,
    pub annotations: Vec<Annotation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub passages: Vec<Passage>,
    /// Annotation offsets are relative to their passage (sentence)
    #[serde(default)]
    pub sentences: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<String>,
}

impl Document {
    pub fn annotations(&self) -> impl Iterator<Item = &Annotation> {
        self.passages.iter().flat_map(|p| p.annotations.iter())
    }

    pub fn annotation_count(&self) -> usize {
        self.passages.iter().map(|p| p.annotations.len()).sum()
    }

    /// Annotations whose text does not match the text under their offsets
    pub fn offset_errors(&self) -> Vec<&Annotation> {
        let mut errors = Vec::new();
        if self.sentences {
            for passage in &self.passages {
                let chars: Vec<char> = passage.text.chars().collect();
                errors.extend(
                    passage
                        .annotations
                        .iter()
                        .filter(|a| !span_matches(&chars, a.start, a.end, &a.text)),
                );
            }
        } else {
            let text = self
                .passages
                .iter()
                .map(|p| p.text.as_str())
                .collect::<Vec<_>>()
                .join(" ");
            let chars: Vec<char> = text.chars().collect();
            errors.extend(
                self.annotations()
                    .filter(|a| !span_matches(&chars, a.start, a.end, &a.text)),
            );
        }
        errors
    }
}

/// True if `chars[start..end]` spells `text`
pub fn span_matches(chars: &[char], start: usize, end: usize, text: &str) -> bool {
    start <= end
        && chars
            .get(start..end)
            .map(|span| span.iter().copied().eq(text.chars()))
            .unwrap_or(false)
}

// ============================================================================
// Corpus definitions
// ============================================================================

/// Where the document ids of each split are listed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SplitIds {
    /// `{"train": [..], "dev": [..], "test": [..]}`
    Json(&'static str),
    /// One id per line, one file per split
    Lists([(Split, &'static str); 3]),
}

impl SplitIds {
    /// Document ids of `split`, in file order
    pub fn read(&self, corpus: &str, dir: &Path, split: Split) -> Result<Vec<String>, ParseError> {
        match self {
            SplitIds::Json(file) => {
                let path = require(corpus, dir, file)?;
                let content = std::fs::read(&path)?;
                let splits: BTreeMap<String, Vec<serde_json::Value>> = serde_json::from_slice(&content)
                    .map_err(|e| ParseError::Table {
                        resource: corpus.to_string(),
                        path: path.clone(),
                        message: e.to_string(),
                    })?;
                let ids = splits.get(split.as_str()).ok_or_else(|| ParseError::Table {
                    resource: corpus.to_string(),
                    path: path.clone(),
                    message: format!("no `{split}` split"),
                })?;
                Ok(ids
                    .iter()
                    .map(|id| match id {
                        serde_json::Value::String(s) => s.clone(),
                        other => other.to_string(),
                    })
                    .collect())
            }
            SplitIds::Lists(files) => {
                let file = files
                    .iter()
                    .find(|(s, _)| *s == split)
                    .map(|(_, file)| *file)
                    .unwrap_or_default();
                let path = require(corpus, dir, file)?;
                let mut ids = Vec::new();
                for line in LossyLines::open(&path)? {
                    let (_, line) = line?;
                    let id = line.trim();
                    if !id.is_empty() {
                        ids.push(id.to_string());
                    }
                }
                Ok(ids)
            }
        }
    }
}

/// `dir/file`, or `ParseError::MissingInput`
pub(crate) fn require(corpus: &str, dir: &Path, file: &str) -> Result<std::path::PathBuf, ParseError> {
    let path = dir.join(file);
    if path.exists() {
        Ok(path)
    } else {
        Err(ParseError::MissingInput {
            resource: corpus.to_string(),
            path,
        })
    }
}

/// Raw file layout of a corpus
#[derive(Debug, Clone, Copy)]
pub enum CorpusLayout {
    /// One PubTator file per split
    PubTator([(Split, &'static str); 3]),
    /// One BioC collection per split
    BioC([(Split, &'static str); 3]),
    /// One PubTator file holding every split
    PubTatorCollection { file: &'static str, splits: SplitIds },
    /// One BioC collection per document, `{dir}/{id}{suffix}`
    BioCPerDocument {
        dir: &'static str,
        suffix: &'static str,
        splits: SplitIds,
    },
    /// Plain text per document with a tab-separated annotation table
    Standoff(standoff::StandoffLayout),
    /// Figure captions per article with a CSV annotation table
    Captions(captions::CaptionLayout),
}

/// How a raw identifier field is turned into identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentifierRule {
    pub separators: &'static [char],
    /// Values meaning "no identifier"
    pub invalid: &'static [&'static str],
    /// Removed from the front of every identifier
    pub strip_prefix: Option<&'static str>,
    /// Prefix added to every identifier not already carrying one of `keep_prefixes`
    pub prefix: Option<&'static str>,
    pub keep_prefixes: &'static [&'static str],
    /// Drop a trailing `(Tax:9606)` qualifier
    pub strip_taxon: bool,
}

impl IdentifierRule {
    /// Split a raw identifier field; `None` marks an invalid entry
    pub fn parse(&self, raw: &str) -> Vec<Option<String>> {
        raw.trim()
            .split(|c| self.separators.contains(&c))
            .filter(|part| !(self.separators.contains(&' ') && part.is_empty()))
            .map(|part| {
                let mut part = part.trim();
                if self.strip_taxon && part.to_ascii_lowercase().contains("tax:") {
                    part = part.split('(').next().unwrap_or("").trim();
                }
                if let Some(stripped) = self.strip_prefix.and_then(|p| part.strip_prefix(p)) {
                    part = stripped;
                }
                if part.is_empty() || self.invalid.contains(&part) {
                    return None;
                }
                match self.prefix {
                    Some(prefix) if !self.keep_prefixes.iter().any(|p| part.starts_with(p)) => {
                        Some(format!("{prefix}{part}"))
                    }
                    _ => Some(part.to_string()),
                }
            })
            .collect()
    }
}

/// Source entity type matching every type not listed explicitly
pub const ANY_ENTITY_TYPE: &str = "*";

/// Static description of how to read one corpus
#[derive(Debug, Clone)]
pub struct CorpusDefinition {
    pub name: &'static str,
    pub layout: CorpusLayout,
    pub identifiers: IdentifierRule,
    /// Source entity type to category
    pub entity_types: &'static [(&'static str, Category)],
    /// Source entity types that are not text mentions
    pub skip_types: &'static [&'static str],
}

impl CorpusDefinition {
    /// Category of a source entity type, `None` if the corpus does not link it
    pub fn category_of(&self, entity_type: &str) -> Option<Category> {
        let lookup = |wanted: &str| {
            self.entity_types
                .iter()
                .find(|(name, _)| *name == wanted)
                .map(|(_, category)| *category)
        };
        lookup(entity_type).or_else(|| lookup(ANY_ENTITY_TYPE))
    }

    /// Read one split, dropping documents whose id was already seen
    pub fn load_split(&self, dir: &Path, split: Split) -> Result<Vec<RawDocument>, ParseError> {
        let in_split = |file: &[(Split, &'static str); 3]| {
            file.iter()
                .find(|(s, _)| *s == split)
                .map(|(_, file)| *file)
                .unwrap_or_default()
        };
        let documents = match &self.layout {
            CorpusLayout::PubTator(files) => {
                pubtator::read_file(self.name, &require(self.name, dir, in_split(files))?)?
            }
            CorpusLayout::BioC(files) => {
                bioc::read_file(self.name, &require(self.name, dir, in_split(files))?, self.skip_types)?
            }
            CorpusLayout::PubTatorCollection { file, splits } => {
                let ids = splits.read(self.name, dir, split)?;
                let mut by_id: BTreeMap<String, RawDocument> =
                    pubtator::read_file(self.name, &require(self.name, dir, file)?)?
                        .into_iter()
                        .map(|d| (d.id.clone(), d))
                        .collect();
                select(self.name, split, ids, |id| by_id.remove(id))
            }
            CorpusLayout::BioCPerDocument { dir: documents, suffix, splits } => {
                let mut loaded = Vec::new();
                for id in splits.read(self.name, dir, split)? {
                    let path = require(self.name, &dir.join(documents), &format!("{id}{suffix}"))?;
                    loaded.extend(bioc::read_file(self.name, &path, self.skip_types)?);
                }
                loaded
            }
            CorpusLayout::Standoff(layout) => {
                let ids = layout.splits.read(self.name, dir, split)?;
                layout.load(self.name, dir, &ids)?
            }
            CorpusLayout::Captions(layout) => {
                let ids = layout.splits.read(self.name, dir, split)?;
                layout.load(self.name, dir, &ids)?
            }
        };

        let mut seen = HashSet::new();
        let mut unique = Vec::with_capacity(documents.len());
        for document in documents {
            if seen.insert(document.id.clone()) {
                unique.push(document);
            } else {
                warn!(corpus = self.name, split = %split, document = %document.id, "Duplicate document dropped");
            }
        }
        Ok(unique)
    }
}

/// Documents listed for a split, in list order
fn select<F>(corpus: &str, split: Split, ids: Vec<String>, mut take: F) -> Vec<RawDocument>
where
    F: FnMut(&str) -> Option<RawDocument>,
{
    let mut documents = Vec::with_capacity(ids.len());
    for id in ids {
        match take(&id) {
            Some(document) => documents.push(document),
            None => warn!(corpus, split = %split, document = %id, "Listed document not found"),
        }
    }
    documents
}

const NCBI_DISEASE: CorpusDefinition = CorpusDefinition {
    name: "ncbi_disease",
    layout: CorpusLayout::PubTator([
        (Split::Train, "NCBItrainset_corpus.txt"),
        (Split::Dev, "NCBIdevelopset_corpus.txt"),
        (Split::Test, "NCBItestset_corpus.txt"),
    ]),
    identifiers: IdentifierRule {
        separators: &['|', '+'],
        invalid: &[],
        strip_prefix: None,
        prefix: Some("MESH:"),
        keep_prefixes: &["MESH:", "OMIM:"],
        strip_taxon: false,
    },
    entity_types: &[
        ("SpecificDisease", Category::Disease),
        ("DiseaseClass", Category::Disease),
        ("Modifier", Category::Disease),
        ("CompositeMention", Category::Disease),
    ],
    skip_types: &[],
};

const BC5CDR: CorpusDefinition = CorpusDefinition {
    name: "bc5cdr",
    layout: CorpusLayout::PubTator([
        (Split::Train, "CDR_Data/CDR.Corpus.v010516/CDR_TrainingSet.PubTator.txt"),
        (Split::Dev, "CDR_Data/CDR.Corpus.v010516/CDR_DevelopmentSet.PubTator.txt"),
        (Split::Test, "CDR_Data/CDR.Corpus.v010516/CDR_TestSet.PubTator.txt"),
    ]),
    identifiers: IdentifierRule {
        separators: &['|'],
        invalid: &["-1"],
        strip_prefix: None,
        prefix: Some("MESH:"),
        keep_prefixes: &[],
        strip_taxon: false,
    },
    entity_types: &[("Disease", Category::Disease), ("Chemical", Category::Chemical)],
    skip_types: &[],
};

const GNORMPLUS: CorpusDefinition = CorpusDefinition {
    name: "gnormplus",
    layout: CorpusLayout::PubTator([
        (Split::Train, "GNormPlusCorpus/BC2GNtrain.PubTator.txt"),
        (Split::Dev, "GNormPlusCorpus/NLMIAT.PubTator.txt"),
        (Split::Test, "GNormPlusCorpus/BC2GNtest.PubTator.txt"),
    ]),
    identifiers: IdentifierRule {
        separators: &[','],
        invalid: &["-1"],
        strip_prefix: None,
        prefix: None,
        keep_prefixes: &[],
        strip_taxon: true,
    },
    entity_types: &[("Gene", Category::Gene)],
    skip_types: &[],
};

const NLM_CHEM: CorpusDefinition = CorpusDefinition {
    name: "nlm_chem",
    layout: CorpusLayout::BioC([
        (Split::Train, "BC7T2-NLMChem-corpus-train.BioC.xml"),
        (Split::Dev, "BC7T2-NLMChem-corpus-dev.BioC.xml"),
        (Split::Test, "BC7T2-NLMChem-corpus-test.BioC.xml"),
    ]),
    identifiers: IdentifierRule {
        separators: &[','],
        invalid: &["-"],
        strip_prefix: None,
        prefix: None,
        keep_prefixes: &[],
        strip_taxon: false,
    },
    entity_types: &[("Chemical", Category::Chemical)],
    skip_types: &["MeSH_Indexing_Chemical", "OTHER"],
};

/// Split ids shipped next to the raw files of corpora without official splits
pub const SPLITS_FILE: &str = "splits.json";

const NLM_GENE: CorpusDefinition = CorpusDefinition {
    name: "nlm_gene",
    layout: CorpusLayout::BioCPerDocument {
        dir: "Corpus/FINAL",
        suffix: ".BioC.XML",
        splits: SplitIds::Json(SPLITS_FILE),
    },
    identifiers: IdentifierRule {
        separators: &[',', ';', '|'],
        invalid: &["-1", "-"],
        strip_prefix: None,
        prefix: None,
        keep_prefixes: &[],
        strip_taxon: false,
    },
    entity_types: &[("Gene", Category::Gene), ("GENERIF", Category::Gene), ("STARGENE", Category::Gene)],
    skip_types: &["Domain", "Other"],
};

const S800: CorpusDefinition = CorpusDefinition {
    name: "s800",
    layout: CorpusLayout::Standoff(standoff::StandoffLayout {
        texts: "abstracts",
        annotations: "S800.tsv",
        header: false,
        columns: standoff::Columns {
            identifier: 0,
            document: 1,
            start: 2,
            end: 3,
            text: 4,
        },
        inclusive_end: true,
        ids: standoff::DocumentIds::FileAndPmid,
        paragraphs: false,
        entity_type: "Species",
        splits: SplitIds::Json(SPLITS_FILE),
    }),
    identifiers: IdentifierRule {
        separators: &[' ', '\t'],
        invalid: &[],
        strip_prefix: None,
        prefix: None,
        keep_prefixes: &[],
        strip_taxon: false,
    },
    entity_types: &[("Species", Category::Species)],
    skip_types: &[],
};

const LINNAEUS: CorpusDefinition = CorpusDefinition {
    name: "linnaeus",
    layout: CorpusLayout::Standoff(standoff::StandoffLayout {
        texts: "manual-corpus-species-1.1/txt",
        annotations: "manual-corpus-species-1.1/tags.tsv",
        header: true,
        columns: standoff::Columns {
            identifier: 0,
            document: 1,
            start: 2,
            end: 3,
            text: 4,
        },
        inclusive_end: false,
        ids: standoff::DocumentIds::StripPrefix("pmcA"),
        paragraphs: true,
        entity_type: "Species",
        splits: SplitIds::Json(SPLITS_FILE),
    }),
    identifiers: IdentifierRule {
        separators: &[' ', '|'],
        invalid: &["0"],
        strip_prefix: Some("species:ncbi:"),
        prefix: None,
        keep_prefixes: &[],
        strip_taxon: false,
    },
    entity_types: &[("Species", Category::Species)],
    skip_types: &[],
};

const BIOID: CorpusDefinition = CorpusDefinition {
    name: "bioid",
    layout: CorpusLayout::Captions(captions::CaptionLayout {
        captions: "BioIDtraining_2/caption_bioc",
        annotations: "BioIDtraining_2/annotations.csv",
        splits: SplitIds::Json(SPLITS_FILE),
    }),
    identifiers: IdentifierRule {
        separators: &['|'],
        invalid: &[],
        strip_prefix: None,
        prefix: None,
        keep_prefixes: &[],
        strip_taxon: false,
    },
    entity_types: &[(captions::CELLOSAURUS_TYPE, Category::CellLine)],
    skip_types: &[],
};

const MEDMENTIONS: CorpusDefinition = CorpusDefinition {
    name: "medmentions",
    layout: CorpusLayout::PubTatorCollection {
        file: "MedMentions-master/st21pv/data/corpus_pubtator.txt.gz",
        splits: SplitIds::Lists([
            (Split::Train, "MedMentions-master/full/data/corpus_pubtator_pmids_trng.txt"),
            (Split::Dev, "MedMentions-master/full/data/corpus_pubtator_pmids_dev.txt"),
            (Split::Test, "MedMentions-master/full/data/corpus_pubtator_pmids_test.txt"),
        ]),
    },
    identifiers: IdentifierRule {
        separators: &[','],
        invalid: &[],
        strip_prefix: Some("UMLS:"),
        prefix: None,
        keep_prefixes: &[],
        strip_taxon: false,
    },
    // semantic type ids (T047, ...)
    entity_types: &[(ANY_ENTITY_TYPE, Category::Concept)],
    skip_types: &[],
};

/// Every supported corpus
pub fn definitions() -> &'static [CorpusDefinition] {
    static DEFINITIONS: [CorpusDefinition; 9] = [
        NCBI_DISEASE,
        BC5CDR,
        GNORMPLUS,
        NLM_CHEM,
        NLM_GENE,
        S800,
        LINNAEUS,
        BIOID,
        MEDMENTIONS,
    ];
    &DEFINITIONS
}

pub fn definition(name: &str) -> Result<&'static CorpusDefinition, BelbError> {
    definitions()
        .iter()
        .find(|d| d.name == name)
        .ok_or_else(|| BelbError::UnknownResource {
            name: name.to_string(),
            available: definitions()
                .iter()
                .map(|d| d.name)
                .collect::<Vec<_>>()
                .join(", "),
        })
}
