//! Unified knowledge base schema
//!
//! Every resource-specific parser converges onto these types. The on-disk
//! and query contract is the `TableSet`: entities (one row per
//! identifier and name), cross-references, history, aliases and citations.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Raw marker for a discontinued/withdrawn identifier
pub const REMOVED_MARKER: &str = "-1";

/// Raw marker for a missing value
pub const MISSING_VALUE: &str = "-";

/// Separator used when several identifiers are packed in one field
pub const IDENTIFIERS_CONNECTOR: char = ';';

// ─── Categories ─────────────────────────────────────────────────────────────

/// Entity type of a knowledge base record
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Gene,
    Disease,
    Chemical,
    Species,
    Variant,
    CellLine,
    /// General ontology concept (UMLS)
    Concept,
}

impl Category {
    pub const ALL: [Category; 7] = [
        Category::Gene,
        Category::Disease,
        Category::Chemical,
        Category::Species,
        Category::Variant,
        Category::CellLine,
        Category::Concept,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Gene => "gene",
            Category::Disease => "disease",
            Category::Chemical => "chemical",
            Category::Species => "species",
            Category::Variant => "variant",
            Category::CellLine => "cell_line",
            Category::Concept => "concept",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    /// Accepts snake_case and the spellings used by corpora (`CellLine`, `Cell Line`)
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_lowercase();
        match key.as_str() {
            "gene" => Ok(Category::Gene),
            "disease" => Ok(Category::Disease),
            "chemical" => Ok(Category::Chemical),
            "species" => Ok(Category::Species),
            "variant" => Ok(Category::Variant),
            "cellline" => Ok(Category::CellLine),
            "concept" | "umls" => Ok(Category::Concept),
            _ => Err(format!("unknown category `{s}`")),
        }
    }
}

// ─── Records ────────────────────────────────────────────────────────────────

/// One knowledge base entry, materialized from the store on read
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRecord {
    pub identifier: String,
    pub category: Category,
    /// Canonical (preferred) name
    pub name: String,
    /// Other names, case-sensitive set
    pub synonyms: BTreeSet<String>,
    /// Identifiers of the same entity in other resources (`NCBI_TaxID:9606`)
    pub cross_references: BTreeSet<String>,
    pub is_obsolete: bool,
    /// Weak reference to the identifier superseding this one
    pub replaced_by: Option<String>,
    /// Short disambiguating text (`chr:17`, `disease:Breast carcinoma`)
    pub attribute: Option<String>,
}

impl EntityRecord {
    pub fn new(identifier: impl Into<String>, category: Category, name: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            category,
            name: name.into(),
            synonyms: BTreeSet::new(),
            cross_references: BTreeSet::new(),
            is_obsolete: false,
            replaced_by: None,
            attribute: None,
        }
    }

    pub fn with_synonyms<I, S>(mut self, synonyms: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.synonyms.extend(synonyms.into_iter().map(Into::into));
        self
    }

    /// NCBI Taxonomy id of the species, from the `NCBI_TaxID:` cross-reference
    pub fn taxon(&self) -> Option<&str> {
        self.cross_references
            .iter()
            .find_map(|x| x.strip_prefix(TAXON_XREF_PREFIX))
    }

    /// Canonical name and synonyms
    pub fn names(&self) -> BTreeSet<&str> {
        std::iter::once(self.name.as_str())
            .chain(self.synonyms.iter().map(String::as_str))
            .collect()
    }

    /// Flattened rows for the entities table: the canonical name first,
    /// then synonyms in order
    pub fn rows(&self) -> Vec<EntityRow> {
        let row = |synonym: &str, is_preferred: bool| EntityRow {
            identifier: self.identifier.clone(),
            category: self.category,
            name: self.name.clone(),
            synonym: synonym.to_string(),
            is_preferred,
            is_obsolete: self.is_obsolete,
            replaced_by: self.replaced_by.clone(),
            attribute: self.attribute.clone(),
        };

        std::iter::once(row(&self.name, true))
            .chain(self.synonyms.iter().map(|s| row(s, false)))
            .collect()
    }

    /// Rebuild records from entity rows grouped by identifier.
    ///
    /// Rows must be ordered so that all rows of one identifier are adjacent.
    pub fn from_rows(rows: Vec<EntityRow>) -> Vec<EntityRecord> {
        let mut records: Vec<EntityRecord> = Vec::new();

        for row in rows {
            let same = records
                .last()
                .map(|r| r.identifier == row.identifier)
                .unwrap_or(false);
            if !same {
                let mut record = EntityRecord::new(&row.identifier, row.category, &row.name);
                record.is_obsolete = row.is_obsolete;
                record.replaced_by = row.replaced_by.clone();
                record.attribute = row.attribute.clone();
                records.push(record);
            }
            if let Some(record) = records.last_mut() {
                if !row.is_preferred {
                    record.synonyms.insert(row.synonym);
                }
            }
        }

        records
    }
}

/// One row of the entities table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRow {
    pub identifier: String,
    pub category: Category,
    pub name: String,
    pub synonym: String,
    pub is_preferred: bool,
    pub is_obsolete: bool,
    pub replaced_by: Option<String>,
    pub attribute: Option<String>,
}

/// Obsolete identifier remapping. `identifier_to = None` means removed.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub identifier_from: String,
    pub identifier_to: Option<String>,
}

impl HistoryEntry {
    pub fn replaced(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            identifier_from: from.into(),
            identifier_to: Some(to.into()),
        }
    }

    pub fn removed(from: impl Into<String>) -> Self {
        Self {
            identifier_from: from.into(),
            identifier_to: None,
        }
    }

    /// Build from raw fields where `-1` or `-` mark a removal
    pub fn from_raw(from: &str, to: &str) -> Self {
        let to = to.trim();
        if to.is_empty() || to == REMOVED_MARKER || to == MISSING_VALUE {
            Self::removed(from.trim())
        } else {
            Self::replaced(from.trim(), to)
        }
    }
}

/// Secondary identifier denoting the same entity as a primary one
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct AliasEntry {
    pub alias: String,
    pub identifier: String,
}

/// Publication citing an entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CitationEntry {
    pub identifier: String,
    pub pmid: String,
}

/// Cross-reference prefix naming the species of an entity
pub const TAXON_XREF_PREFIX: &str = "NCBI_TaxID:";

/// A name shared by several identifiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Homonym {
    pub name: String,
    pub identifiers: Vec<String>,
}

/// An identifier indistinguishable from another one: same names, same
/// attribute, same species. `homonym` maps onto `identifier`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IdentifierHomonym {
    pub homonym: String,
    pub identifier: String,
}

/// A name used by entities of different species
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignNameHomonym {
    pub name: String,
    /// `(identifier, taxon)` of every entity carrying the name
    pub members: Vec<(String, Option<String>)>,
}

// ─── Tables ─────────────────────────────────────────────────────────────────

/// Tables making up one knowledge base
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Table {
    Entities,
    Xrefs,
    History,
    Aliases,
    Citations,
}

impl Table {
    pub const ALL: [Table; 5] = [
        Table::Entities,
        Table::Xrefs,
        Table::History,
        Table::Aliases,
        Table::Citations,
    ];

    pub fn suffix(&self) -> &'static str {
        match self {
            Table::Entities => "entities",
            Table::Xrefs => "xrefs",
            Table::History => "history",
            Table::Aliases => "aliases",
            Table::Citations => "citations",
        }
    }

    /// Live table name for a knowledge base
    pub fn name(&self, kb: &str) -> String {
        format!("{kb}_{}", self.suffix())
    }

    /// Staging table name used while a build is in progress
    pub fn staging_name(&self, kb: &str) -> String {
        format!("{kb}__staging_{}", self.suffix())
    }

    /// Column names, in storage order
    pub fn columns(&self) -> &'static [&'static str] {
        match self {
            Table::Entities => &[
                "identifier",
                "category",
                "name",
                "synonym",
                "is_preferred",
                "is_obsolete",
                "replaced_by",
                "attribute",
            ],
            Table::Xrefs => &["identifier", "xref"],
            Table::History => &["identifier_from", "identifier_to"],
            Table::Aliases => &["alias", "identifier"],
            Table::Citations => &["identifier", "pmid"],
        }
    }

    /// Column carrying the lookup index
    pub fn key_column(&self) -> &'static str {
        match self {
            Table::History => "identifier_from",
            Table::Aliases => "alias",
            _ => "identifier",
        }
    }
}

/// Normalized contents of one knowledge base, sorted and deduplicated
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TableSet {
    pub entities: Vec<EntityRecord>,
    pub history: Vec<HistoryEntry>,
    pub aliases: Vec<AliasEntry>,
    pub citations: Vec<CitationEntry>,
}

impl TableSet {
    /// Every table as rows of optional text fields, in storage order
    pub fn text_rows(&self, table: Table) -> Vec<Vec<Option<String>>> {
        let flag = |b: bool| Some(if b { "1" } else { "0" }.to_string());
        match table {
            Table::Entities => self
                .entities
                .iter()
                .flat_map(|e| e.rows())
                .map(|r| {
                    vec![
                        Some(r.identifier),
                        Some(r.category.to_string()),
                        Some(r.name),
                        Some(r.synonym),
                        flag(r.is_preferred),
                        flag(r.is_obsolete),
                        r.replaced_by,
                        r.attribute,
                    ]
                })
                .collect(),
            Table::Xrefs => self
                .entities
                .iter()
                .flat_map(|e| {
                    e.cross_references
                        .iter()
                        .map(|x| vec![Some(e.identifier.clone()), Some(x.clone())])
                })
                .collect(),
            Table::History => self
                .history
                .iter()
                .map(|h| vec![Some(h.identifier_from.clone()), h.identifier_to.clone()])
                .collect(),
            Table::Aliases => self
                .aliases
                .iter()
                .map(|a| vec![Some(a.alias.clone()), Some(a.identifier.clone())])
                .collect(),
            Table::Citations => self
                .citations
                .iter()
                .map(|c| vec![Some(c.identifier.clone()), Some(c.pmid.clone())])
                .collect(),
        }
    }

    /// Tab-separated rendering of one table (header + rows). NULL is written as empty.
    pub fn to_tsv(&self, table: Table) -> Result<Vec<u8>, csv::Error> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Necessary)
            .from_writer(Vec::new());
        writer.write_record(table.columns())?;
        for row in self.text_rows(table) {
            writer.write_record(row.iter().map(|v| v.as_deref().unwrap_or("")))?;
        }
        writer
            .into_inner()
            .map_err(|e| csv::Error::from(e.into_error()))
    }

    /// BLAKE3 digest over the TSV rendering of every table
    pub fn checksum(&self) -> Result<String, csv::Error> {
        let mut hasher = blake3::Hasher::new();
        for table in Table::ALL {
            hasher.update(table.suffix().as_bytes());
            hasher.update(&self.to_tsv(table)?);
        }
        Ok(hasher.finalize().to_hex().to_string())
    }

    /// Row count per table
    pub fn counts(&self) -> BTreeMap<String, u64> {
        Table::ALL
            .iter()
            .map(|t| (t.suffix().to_string(), self.text_rows(*t).len() as u64))
            .collect()
    }
}
