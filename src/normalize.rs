//! Schema normalizer
//!
//! Merges the raw records of one resource into a sorted, deduplicated
//! [`TableSet`]. Invalid records are logged and skipped; the table set is
//! identical for identical input regardless of record order within an
//! identifier's raw names.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::error::{NormalizationError, ParseError};
use crate::kbs::{ParsedRecord, RawEntity, RawName};
use crate::schema::{AliasEntry, Category, CitationEntry, EntityRecord, HistoryEntry, TableSet};

/// Counters reported after normalization
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizeStats {
    pub records: u64,
    pub skipped: u64,
    pub entities: u64,
    pub history: u64,
    pub aliases: u64,
    pub citations: u64,
    /// History entries whose target was unknown, stored as removals
    pub dangling_history: u64,
    /// History cycles broken by turning one entry into a removal
    pub cyclic_history: u64,
}

#[derive(Debug)]
struct Merged {
    category: Category,
    names: Vec<RawName>,
    cross_references: BTreeSet<String>,
    attribute: Option<String>,
}

/// Accumulates raw records for one resource
#[derive(Debug)]
pub struct Normalizer {
    resource: String,
    categories: Vec<Category>,
    entities: BTreeMap<String, Merged>,
    history: BTreeMap<String, Option<String>>,
    aliases: BTreeMap<String, String>,
    citations: BTreeSet<(String, String)>,
    stats: NormalizeStats,
}

impl Normalizer {
    pub fn new(resource: impl Into<String>, categories: &[Category]) -> Self {
        Self {
            resource: resource.into(),
            categories: categories.to_vec(),
            entities: BTreeMap::new(),
            history: BTreeMap::new(),
            aliases: BTreeMap::new(),
            citations: BTreeSet::new(),
            stats: NormalizeStats::default(),
        }
    }

    /// Add one record. An invalid record is rejected and leaves the state unchanged.
    pub fn push(&mut self, record: ParsedRecord) -> Result<(), NormalizationError> {
        self.stats.records += 1;
        match record {
            ParsedRecord::Entity(entity) => self.push_entity(entity),
            ParsedRecord::History(entry) => self.push_history(entry),
        }
    }

    /// Like [`Normalizer::push`] but logs and counts rejected records
    pub fn push_or_skip(&mut self, record: ParsedRecord) {
        if let Err(e) = self.push(record) {
            self.stats.skipped += 1;
            tracing::warn!(resource = %self.resource, error = %e, "Skipping record");
        }
    }

    fn push_entity(&mut self, raw: RawEntity) -> Result<(), NormalizationError> {
        let identifier = raw.identifier.trim().to_string();
        if identifier.is_empty() {
            return Err(NormalizationError::EmptyIdentifier {
                resource: self.resource.clone(),
            });
        }
        if !self.categories.contains(&raw.category) {
            return Err(self.category_mismatch(&identifier, raw.category));
        }
        if let Some(existing) = self.entities.get(&identifier) {
            if existing.category != raw.category {
                return Err(self.category_mismatch(&identifier, raw.category));
            }
        }

        for alias in raw.aliases {
            let alias = alias.trim().to_string();
            if !alias.is_empty() {
                self.aliases.entry(alias).or_insert_with(|| identifier.clone());
            }
        }
        for pmid in raw.citations {
            let pmid = pmid.trim().to_string();
            if !pmid.is_empty() {
                self.citations.insert((identifier.clone(), pmid));
            }
        }

        let merged = self.entities.entry(identifier).or_insert_with(|| Merged {
            category: raw.category,
            names: Vec::new(),
            cross_references: BTreeSet::new(),
            attribute: None,
        });
        merged.names.extend(
            raw.names
                .into_iter()
                .map(|n| RawName {
                    text: n.text.trim().to_string(),
                    preferred: n.preferred,
                })
                .filter(|n| !n.text.is_empty()),
        );
        merged.cross_references.extend(
            raw.cross_references
                .into_iter()
                .map(|x| x.trim().to_string())
                .filter(|x| !x.is_empty()),
        );
        if merged.attribute.is_none() {
            merged.attribute = raw.attribute.filter(|a| !a.trim().is_empty());
        }
        Ok(())
    }

    fn push_history(&mut self, entry: HistoryEntry) -> Result<(), NormalizationError> {
        let from = entry.identifier_from.trim().to_string();
        if from.is_empty() {
            return Err(NormalizationError::EmptyIdentifier {
                resource: self.resource.clone(),
            });
        }
        let to = entry
            .identifier_to
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());
        if to.as_deref() == Some(from.as_str()) {
            tracing::debug!(resource = %self.resource, identifier = %from, "Ignoring self-referencing history entry");
            return Ok(());
        }
        self.history.entry(from).or_insert(to);
        Ok(())
    }

    fn category_mismatch(&self, identifier: &str, found: Category) -> NormalizationError {
        NormalizationError::CategoryMismatch {
            resource: self.resource.clone(),
            identifier: identifier.to_string(),
            found: found.to_string(),
            expected: self
                .categories
                .iter()
                .map(|c| c.as_str())
                .collect::<Vec<_>>()
                .join(", "),
        }
    }

    /// Canonical name: first preferred, else shortest (lexicographic tie-break)
    fn canonical_name(names: &[RawName]) -> Option<&str> {
        names
            .iter()
            .find(|n| n.preferred)
            .or_else(|| {
                names.iter().min_by(|a, b| {
                    a.text
                        .chars()
                        .count()
                        .cmp(&b.text.chars().count())
                        .then_with(|| a.text.cmp(&b.text))
                })
            })
            .map(|n| n.text.as_str())
    }

    /// Make every history chain end at a kept identifier or a removal.
    ///
    /// Targets that are neither kept entities nor history sources become
    /// removals. In each cycle the smallest source becomes a removal.
    /// Returns `(dangling, cycles)`.
    fn close_history(&mut self, kept: &BTreeSet<String>) -> (u64, u64) {
        let mut dangling = 0;
        let unknown: Vec<String> = self
            .history
            .iter()
            .filter_map(|(from, to)| {
                let to = to.as_ref()?;
                (!kept.contains(to) && !self.history.contains_key(to)).then(|| from.clone())
            })
            .collect();
        for from in unknown {
            if let Some(to) = self.history.insert(from.clone(), None).flatten() {
                tracing::debug!(resource = %self.resource, identifier = %from, target = %to, "History target unknown, stored as removal");
                dangling += 1;
            }
        }

        let mut cycles = 0;
        let mut closed: BTreeSet<String> = BTreeSet::new();
        let sources: Vec<String> = self.history.keys().cloned().collect();
        for source in sources {
            let mut path: Vec<String> = Vec::new();
            let mut current = source;
            loop {
                if closed.contains(&current) {
                    break;
                }
                if let Some(position) = path.iter().position(|p| *p == current) {
                    if let Some(smallest) = path[position..].iter().min().cloned() {
                        tracing::debug!(resource = %self.resource, cycle = ?&path[position..], "History cycle, stored as removal");
                        self.history.insert(smallest, None);
                        cycles += 1;
                    }
                    break;
                }
                path.push(current.clone());
                match self.history.get(&current) {
                    Some(Some(next)) => current = next.clone(),
                    _ => break,
                }
            }
            closed.extend(path);
        }

        (dangling, cycles)
    }

    /// Produce the table set and counters
    pub fn finish(mut self) -> (TableSet, NormalizeStats) {
        let mut entities = Vec::with_capacity(self.entities.len());

        for (identifier, merged) in &self.entities {
            let Some(name) = Self::canonical_name(&merged.names) else {
                let e = NormalizationError::NoNames {
                    resource: self.resource.clone(),
                    identifier: identifier.clone(),
                };
                tracing::warn!(resource = %self.resource, error = %e, "Skipping record");
                self.stats.skipped += 1;
                continue;
            };

            let mut record = EntityRecord::new(identifier, merged.category, name);
            record.synonyms = merged
                .names
                .iter()
                .filter(|n| n.text != name)
                .map(|n| n.text.clone())
                .collect();
            record.cross_references = merged.cross_references.clone();
            record.attribute = merged.attribute.clone();
            entities.push(record);
        }

        let kept: BTreeSet<String> = entities.iter().map(|e| e.identifier.clone()).collect();

        let (dangling, cycles) = self.close_history(&kept);
        if dangling > 0 || cycles > 0 {
            tracing::warn!(
                resource = %self.resource,
                dangling,
                cycles,
                "History entries without a current target stored as removals"
            );
        }
        for record in &mut entities {
            if let Some(target) = self.history.get(&record.identifier) {
                record.is_obsolete = true;
                record.replaced_by = target.clone();
            }
        }

        let aliases: Vec<AliasEntry> = self
            .aliases
            .iter()
            .filter(|(alias, target)| alias != target && !kept.contains(*alias) && kept.contains(*target))
            .map(|(alias, target)| AliasEntry {
                alias: alias.clone(),
                identifier: target.clone(),
            })
            .collect();

        let citations: Vec<CitationEntry> = self
            .citations
            .iter()
            .filter(|(identifier, _)| kept.contains(identifier))
            .map(|(identifier, pmid)| CitationEntry {
                identifier: identifier.clone(),
                pmid: pmid.clone(),
            })
            .collect();

        let history: Vec<HistoryEntry> = self
            .history
            .iter()
            .map(|(from, to)| HistoryEntry {
                identifier_from: from.clone(),
                identifier_to: to.clone(),
            })
            .collect();

        self.stats.entities = entities.len() as u64;
        self.stats.history = history.len() as u64;
        self.stats.aliases = aliases.len() as u64;
        self.stats.citations = citations.len() as u64;
        self.stats.dangling_history = dangling;
        self.stats.cyclic_history = cycles;

        tracing::info!(
            resource = %self.resource,
            entities = self.stats.entities,
            history = self.stats.history,
            aliases = self.stats.aliases,
            skipped = self.stats.skipped,
            "Normalized resource"
        );

        (
            TableSet {
                entities,
                history,
                aliases,
                citations,
            },
            self.stats,
        )
    }
}

/// Drain a (guarded) record stream into a table set.
///
/// Normalization errors are per record; parse errors abort.
pub fn normalize_records<I>(
    resource: &str,
    categories: &[Category],
    records: I,
) -> Result<(TableSet, NormalizeStats), ParseError>
where
    I: IntoIterator<Item = Result<ParsedRecord, ParseError>>,
{
    let mut normalizer = Normalizer::new(resource, categories);
    for record in records {
        normalizer.push_or_skip(record?);
    }
    Ok(normalizer.finish())
}
