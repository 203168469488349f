//! Query side of a built knowledge base
//!
//! `KbReader` wraps a [`KbStore`] for one knowledge base and adds identifier
//! resolution on top of the raw table queries: aliases first, then the
//! history chain until a current identifier or a removal.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

use crate::config::{BelbConfig, ReaderConfig};
use crate::error::{BelbError, DataIntegrityError, StoreError};
use crate::resources::{self, ResourceKind};
use crate::schema::{EntityRecord, ForeignNameHomonym, Homonym, IdentifierHomonym};
use crate::store::{open_store, validate_kb_name, KbStore, StatusMarker};

/// Outcome of resolving an identifier against the current KB state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "identifier", rename_all = "snake_case")]
pub enum Resolution {
    /// Identifier in use, possibly after following history links
    Current(String),
    /// Discontinued or withdrawn
    Removed,
    /// Neither an entity nor a history source
    Unknown,
}

impl Resolution {
    pub fn current(&self) -> Option<&str> {
        match self {
            Resolution::Current(identifier) => Some(identifier),
            _ => None,
        }
    }
}

/// Read-only view of one knowledge base
#[derive(Clone)]
pub struct KbReader {
    store: Arc<dyn KbStore>,
    kb: String,
    config: ReaderConfig,
}

impl std::fmt::Debug for KbReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KbReader")
            .field("kb", &self.kb)
            .field("backend", &self.store.backend())
            .finish()
    }
}

impl KbReader {
    /// Reader over an already opened store
    pub fn new(store: Arc<dyn KbStore>, kb: impl Into<String>, config: ReaderConfig) -> Self {
        Self {
            store,
            kb: kb.into(),
            config,
        }
    }

    /// Open `processed/kbs/{kb}` below `root`.
    ///
    /// Fails with `StoreError::NotBuilt` unless the build left its success marker.
    pub async fn open(root: &Path, kb: &str, config: &BelbConfig) -> Result<Self, BelbError> {
        validate_kb_name(kb)?;
        let resource = resources::get(kb, ResourceKind::Kb)?;
        let kb_dir = resource.processed_dir(root);
        if !StatusMarker::is_up(&kb_dir) {
            return Err(StoreError::NotBuilt(kb.to_string()).into());
        }
        let store = open_store(&config.store, &kb_dir).await?;
        debug!(kb, backend = store.backend(), "Opened knowledge base");
        Ok(Self::new(store, kb, config.reader.clone()))
    }

    pub fn kb(&self) -> &str {
        &self.kb
    }

    /// Entity record by identifier, `StoreError::NotFound` if absent
    pub async fn lookup(&self, identifier: &str) -> Result<EntityRecord, BelbError> {
        self.store
            .lookup(&self.kb, identifier)
            .await?
            .ok_or_else(|| {
                StoreError::NotFound {
                    kb: self.kb.clone(),
                    identifier: identifier.to_string(),
                }
                .into()
            })
    }

    /// Cursor over all entity records in identifier order
    pub fn iter(&self, batch_size: usize) -> EntityCursor {
        EntityCursor {
            store: Arc::clone(&self.store),
            kb: self.kb.clone(),
            batch_size: batch_size.max(1),
            after: None,
            exhausted: false,
        }
    }

    /// Cursor with the configured page size
    pub fn entities(&self) -> EntityCursor {
        self.iter(self.config.batch_size)
    }

    pub async fn count(&self) -> Result<u64, BelbError> {
        Ok(self.store.count(&self.kb).await?)
    }

    /// Follow history links from `identifier`.
    ///
    /// A current identifier resolves to itself. Chains that revisit an
    /// identifier, exceed `max_history_hops`, or point at an identifier
    /// that is neither current nor in history are data integrity errors.
    pub async fn resolve_history(&self, identifier: &str) -> Result<Resolution, BelbError> {
        let mut current = identifier.to_string();
        let mut visited: Vec<String> = Vec::new();

        loop {
            let entity = self.store.lookup(&self.kb, &current).await?;
            if matches!(&entity, Some(e) if !e.is_obsolete) {
                return Ok(Resolution::Current(current));
            }

            let Some(entry) = self.store.history(&self.kb, &current).await? else {
                if entity.is_some() {
                    // obsolete flag without a history row
                    return Ok(Resolution::Current(current));
                }
                return match visited.last() {
                    None => Ok(Resolution::Unknown),
                    Some(from) => Err(DataIntegrityError::MissingReferent {
                        kb: self.kb.clone(),
                        from: from.clone(),
                        to: current,
                    }
                    .into()),
                };
            };

            visited.push(current);
            let Some(next) = entry.identifier_to else {
                return Ok(Resolution::Removed);
            };

            if visited.contains(&next) {
                let mut path = visited;
                path.push(next);
                return Err(DataIntegrityError::Cycle {
                    kb: self.kb.clone(),
                    path,
                }
                .into());
            }
            if visited.len() > self.config.max_history_hops {
                return Err(DataIntegrityError::HopLimit {
                    kb: self.kb.clone(),
                    identifier: identifier.to_string(),
                    limit: self.config.max_history_hops,
                }
                .into());
            }
            current = next;
        }
    }

    /// Resolve a possibly secondary identifier: alias table first, then history
    pub async fn resolve(&self, identifier: &str) -> Result<Resolution, BelbError> {
        match self.store.alias(&self.kb, identifier).await? {
            Some(primary) => self.resolve_history(&primary).await,
            None => self.resolve_history(identifier).await,
        }
    }

    pub async fn name_homonyms(&self, limit: usize) -> Result<Vec<Homonym>, BelbError> {
        Ok(self.store.name_homonyms(&self.kb, limit).await?)
    }

    /// Current identifiers sharing every name, the attribute and the species
    /// with a lower identifier, optionally only within `taxa`
    pub async fn identifier_homonyms(&self, taxa: Option<&[&str]>) -> Result<Vec<IdentifierHomonym>, BelbError> {
        type Key = (Option<String>, Option<String>, BTreeSet<String>);
        let mut groups: BTreeMap<Key, Vec<String>> = BTreeMap::new();

        let mut cursor = self.entities();
        while let Some(batch) = cursor.next_batch().await? {
            for record in batch.into_iter().filter(|r| !r.is_obsolete) {
                let taxon = record.taxon().map(str::to_string);
                if let Some(taxa) = taxa {
                    if !taxon.as_deref().is_some_and(|t| taxa.contains(&t)) {
                        continue;
                    }
                }
                let names = record.names().into_iter().map(str::to_string).collect();
                groups
                    .entry((record.attribute.clone(), taxon, names))
                    .or_default()
                    .push(record.identifier);
            }
        }

        let mut homonyms: Vec<IdentifierHomonym> = groups
            .into_values()
            .filter(|identifiers| identifiers.len() > 1)
            .flat_map(|identifiers| {
                let (first, rest) = identifiers.split_at(1);
                let target = first[0].clone();
                rest.iter()
                    .map(|homonym| IdentifierHomonym {
                        homonym: homonym.clone(),
                        identifier: target.clone(),
                    })
                    .collect::<Vec<_>>()
            })
            .collect();
        homonyms.sort();
        debug!(kb = %self.kb, homonyms = homonyms.len(), "Identifier homonyms");
        Ok(homonyms)
    }

    /// Names carried by current entities of more than one species
    pub async fn foreign_name_homonyms(&self) -> Result<Vec<ForeignNameHomonym>, BelbError> {
        let mut by_name: BTreeMap<String, Vec<(String, Option<String>)>> = BTreeMap::new();

        let mut cursor = self.entities();
        while let Some(batch) = cursor.next_batch().await? {
            for record in batch.iter().filter(|r| !r.is_obsolete) {
                let taxon = record.taxon().map(str::to_string);
                for name in record.names() {
                    by_name
                        .entry(name.to_string())
                        .or_default()
                        .push((record.identifier.clone(), taxon.clone()));
                }
            }
        }

        Ok(by_name
            .into_iter()
            .filter(|(_, members)| {
                let taxa: BTreeSet<_> = members.iter().filter_map(|(_, t)| t.as_deref()).collect();
                members.len() > 1 && taxa.len() > 1
            })
            .map(|(name, members)| ForeignNameHomonym { name, members })
            .collect())
    }

    /// PubMed ids citing `identifier`
    pub async fn citations(&self, identifier: &str) -> Result<Vec<String>, BelbError> {
        Ok(self.store.citations(&self.kb, identifier).await?)
    }
}

/// Keyset-paginated scan over the entity table.
///
/// Restartable: [`EntityCursor::restart`] begins again from the first identifier.
pub struct EntityCursor {
    store: Arc<dyn KbStore>,
    kb: String,
    batch_size: usize,
    after: Option<String>,
    exhausted: bool,
}

impl EntityCursor {
    /// Next page, `None` once every record was returned
    pub async fn next_batch(&mut self) -> Result<Option<Vec<EntityRecord>>, BelbError> {
        if self.exhausted {
            return Ok(None);
        }
        let batch = self
            .store
            .entities_after(&self.kb, self.after.as_deref(), self.batch_size)
            .await?;
        if batch.len() < self.batch_size {
            self.exhausted = true;
        }
        match batch.last() {
            Some(last) => {
                self.after = Some(last.identifier.clone());
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }

    pub fn restart(&mut self) {
        self.after = None;
        self.exhausted = false;
    }

    /// Drain the remaining pages
    pub async fn collect_all(mut self) -> Result<Vec<EntityRecord>, BelbError> {
        let mut all = Vec::new();
        while let Some(batch) = self.next_batch().await? {
            all.extend(batch);
        }
        Ok(all)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AliasEntry, Category, HistoryEntry, TableSet};
    use crate::store::MemoryKbStore;

    async fn reader(tables: TableSet) -> KbReader {
        let store = MemoryKbStore::new();
        store.write_table_set("ncbi_gene", &tables).await.unwrap();
        KbReader::new(Arc::new(store), "ncbi_gene", ReaderConfig::default())
    }

    fn gene(identifier: &str) -> EntityRecord {
        EntityRecord::new(identifier, Category::Gene, format!("GENE{identifier}"))
    }

    fn obsolete(identifier: &str, replaced_by: Option<&str>) -> EntityRecord {
        let mut record = gene(identifier);
        record.is_obsolete = true;
        record.replaced_by = replaced_by.map(str::to_string);
        record
    }

    #[tokio::test]
    async fn test_lookup_missing_is_not_found() {
        let reader = reader(TableSet {
            entities: vec![gene("1")],
            ..TableSet::default()
        })
        .await;
        assert_eq!(reader.lookup("1").await.unwrap().name, "GENE1");
        assert!(reader.lookup("2").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_resolution_paths() {
        let reader = reader(TableSet {
            entities: vec![gene("1"), obsolete("2", Some("1")), gene("5")],
            history: vec![
                HistoryEntry::replaced("2", "1"),
                HistoryEntry::replaced("3", "2"),
                HistoryEntry::removed("4"),
            ],
            aliases: vec![AliasEntry {
                alias: "OLD:5".into(),
                identifier: "5".into(),
            }],
            ..TableSet::default()
        })
        .await;

        assert_eq!(reader.resolve_history("1").await.unwrap(), Resolution::Current("1".into()));
        assert_eq!(reader.resolve_history("3").await.unwrap(), Resolution::Current("1".into()));
        assert_eq!(reader.resolve_history("4").await.unwrap(), Resolution::Removed);
        assert_eq!(reader.resolve_history("9").await.unwrap(), Resolution::Unknown);
        assert_eq!(reader.resolve_history("OLD:5").await.unwrap(), Resolution::Unknown);
        assert_eq!(reader.resolve("OLD:5").await.unwrap(), Resolution::Current("5".into()));
    }

    #[tokio::test]
    async fn test_missing_referent() {
        let reader = reader(TableSet {
            entities: vec![gene("1")],
            history: vec![HistoryEntry::replaced("2", "8")],
            ..TableSet::default()
        })
        .await;
        assert!(matches!(
            reader.resolve_history("2").await,
            Err(BelbError::DataIntegrity(DataIntegrityError::MissingReferent { .. }))
        ));
    }

    #[tokio::test]
    async fn test_three_node_cycle() {
        let reader = reader(TableSet {
            history: vec![
                HistoryEntry::replaced("a", "b"),
                HistoryEntry::replaced("b", "c"),
                HistoryEntry::replaced("c", "a"),
            ],
            ..TableSet::default()
        })
        .await;
        match reader.resolve_history("a").await {
            Err(BelbError::DataIntegrity(DataIntegrityError::Cycle { path, .. })) => {
                assert_eq!(path, vec!["a", "b", "c", "a"]);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cursor_pages_and_restarts() {
        let entities: Vec<_> = (10..35).map(|i| gene(&i.to_string())).collect();
        let reader = reader(TableSet {
            entities: entities.clone(),
            ..TableSet::default()
        })
        .await;

        let mut cursor = reader.iter(10);
        let mut sizes = Vec::new();
        while let Some(batch) = cursor.next_batch().await.unwrap() {
            sizes.push(batch.len());
        }
        assert_eq!(sizes, vec![10, 10, 5]);

        cursor.restart();
        assert_eq!(cursor.collect_all().await.unwrap(), entities);
        assert_eq!(reader.count().await.unwrap(), 25);
    }

    fn taxon_gene(identifier: &str, taxon: &str, names: &[&str]) -> EntityRecord {
        let mut record = EntityRecord::new(identifier, Category::Gene, names[0]).with_synonyms(names[1..].iter().copied());
        record.cross_references.insert(format!("NCBI_TaxID:{taxon}"));
        record
    }

    #[tokio::test]
    async fn test_identifier_homonyms() {
        let mut attributed = taxon_gene("40", "9606", &["TRNA", "tRNA-Leu"]);
        attributed.attribute = Some("chr:1".into());
        let reader = reader(TableSet {
            entities: vec![
                taxon_gene("10", "9606", &["TRNA", "tRNA-Leu"]),
                taxon_gene("20", "9606", &["TRNA", "tRNA-Leu"]),
                taxon_gene("30", "10090", &["TRNA", "tRNA-Leu"]),
                attributed,
                taxon_gene("50", "9606", &["TRNA"]),
                taxon_gene("60", "10090", &["TRNA", "tRNA-Leu"]),
            ],
            ..TableSet::default()
        })
        .await;

        let all = reader.identifier_homonyms(None).await.unwrap();
        assert_eq!(
            all,
            vec![
                IdentifierHomonym {
                    homonym: "20".into(),
                    identifier: "10".into()
                },
                IdentifierHomonym {
                    homonym: "60".into(),
                    identifier: "30".into()
                },
            ]
        );

        let human = reader.identifier_homonyms(Some(&["9606"])).await.unwrap();
        assert_eq!(human.len(), 1);
        assert_eq!(human[0].homonym, "20");
    }

    #[tokio::test]
    async fn test_foreign_name_homonyms() {
        let reader = reader(TableSet {
            entities: vec![
                taxon_gene("1", "9606", &["TP53", "p53"]),
                taxon_gene("2", "10090", &["Trp53", "p53"]),
                taxon_gene("3", "9606", &["TP53-AS1"]),
                taxon_gene("4", "9606", &["TP53-AS1"]),
            ],
            ..TableSet::default()
        })
        .await;

        let homonyms = reader.foreign_name_homonyms().await.unwrap();
        assert_eq!(homonyms.len(), 1);
        assert_eq!(homonyms[0].name, "p53");
        assert_eq!(
            homonyms[0].members,
            vec![
                ("1".to_string(), Some("9606".to_string())),
                ("2".to_string(), Some("10090".to_string())),
            ]
        );
    }

    mod proptests {
        use super::*;
        use proptest::prelude::*;

        fn block_on<F: std::future::Future>(future: F) -> F::Output {
            tokio::runtime::Builder::new_current_thread()
                .build()
                .unwrap()
                .block_on(future)
        }

        /// Linear chain `h0 -> h1 -> ... -> h{n-1} -> end`, end either current or removed
        fn chain(length: usize, removed: bool) -> TableSet {
            let mut tables = TableSet::default();
            for i in 0..length {
                let to = format!("h{}", i + 1);
                if i + 1 == length && removed {
                    tables.history.push(HistoryEntry::removed(format!("h{i}")));
                } else {
                    tables.history.push(HistoryEntry::replaced(format!("h{i}"), to));
                }
            }
            if !removed {
                tables.entities.push(gene(&format!("h{length}")));
            }
            tables
        }

        proptest! {
            #[test]
            fn resolution_is_idempotent(length in 1usize..20, removed in any::<bool>()) {
                block_on(async {
                    let reader = reader(chain(length, removed)).await;
                    let first = reader.resolve_history("h0").await.unwrap();
                    match &first {
                        Resolution::Current(id) => {
                            prop_assert_eq!(id.clone(), format!("h{length}"));
                            prop_assert_eq!(reader.resolve_history(id).await.unwrap(), first.clone());
                        }
                        other => prop_assert_eq!(other, &Resolution::Removed),
                    }
                    Ok(())
                })?;
            }

            #[test]
            fn hop_bound_is_enforced(length in 1usize..64) {
                block_on(async {
                    let reader = reader(chain(length, false)).await;
                    let result = reader.resolve_history("h0").await;
                    if length <= ReaderConfig::default().max_history_hops {
                        prop_assert!(result.is_ok());
                    } else {
                        let is_hop_limit = matches!(
                            result,
                            Err(BelbError::DataIntegrity(DataIntegrityError::HopLimit { .. }))
                        );
                        prop_assert!(is_hop_limit);
                    }
                    Ok(())
                })?;
            }
        }
    }
}
