//! In-memory store for tests and dry runs

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{validate_kb_name, KbStore};
use crate::error::StoreError;
use crate::schema::{EntityRecord, HistoryEntry, Homonym, TableSet};

/// Indexed contents of one knowledge base
#[derive(Debug, Default)]
struct MemoryKb {
    entities: BTreeMap<String, EntityRecord>,
    history: HashMap<String, Option<String>>,
    aliases: HashMap<String, String>,
    citations: BTreeMap<String, Vec<String>>,
}

impl MemoryKb {
    fn from_tables(tables: &TableSet) -> Self {
        let mut kb = MemoryKb::default();
        for entity in &tables.entities {
            kb.entities.insert(entity.identifier.clone(), entity.clone());
        }
        for entry in &tables.history {
            kb.history
                .insert(entry.identifier_from.clone(), entry.identifier_to.clone());
        }
        for alias in &tables.aliases {
            kb.aliases.insert(alias.alias.clone(), alias.identifier.clone());
        }
        for citation in &tables.citations {
            kb.citations
                .entry(citation.identifier.clone())
                .or_default()
                .push(citation.pmid.clone());
        }
        for pmids in kb.citations.values_mut() {
            pmids.sort();
        }
        kb
    }
}

/// Knowledge bases held in process memory, keyed by name
#[derive(Debug, Default)]
pub struct MemoryKbStore {
    kbs: RwLock<HashMap<String, MemoryKb>>,
}

impl MemoryKbStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names of the stored knowledge bases
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.kbs.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

fn not_built(kb: &str) -> StoreError {
    StoreError::NotBuilt(kb.to_string())
}

#[async_trait]
impl KbStore for MemoryKbStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn write_table_set(&self, kb: &str, tables: &TableSet) -> Result<(), StoreError> {
        validate_kb_name(kb)?;
        let built = MemoryKb::from_tables(tables);
        self.kbs.write().await.insert(kb.to_string(), built);
        Ok(())
    }

    async fn lookup(&self, kb: &str, identifier: &str) -> Result<Option<EntityRecord>, StoreError> {
        let kbs = self.kbs.read().await;
        let stored = kbs.get(kb).ok_or_else(|| not_built(kb))?;
        Ok(stored.entities.get(identifier).cloned())
    }

    async fn entities_after(
        &self,
        kb: &str,
        after: Option<&str>,
        limit: usize,
    ) -> Result<Vec<EntityRecord>, StoreError> {
        use std::ops::Bound;

        let kbs = self.kbs.read().await;
        let stored = kbs.get(kb).ok_or_else(|| not_built(kb))?;
        let lower = match after {
            Some(after) => Bound::Excluded(after.to_string()),
            None => Bound::Unbounded,
        };
        Ok(stored
            .entities
            .range((lower, Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect())
    }

    async fn count(&self, kb: &str) -> Result<u64, StoreError> {
        let kbs = self.kbs.read().await;
        let stored = kbs.get(kb).ok_or_else(|| not_built(kb))?;
        Ok(stored.entities.len() as u64)
    }

    async fn history(&self, kb: &str, identifier: &str) -> Result<Option<HistoryEntry>, StoreError> {
        let kbs = self.kbs.read().await;
        let stored = kbs.get(kb).ok_or_else(|| not_built(kb))?;
        Ok(stored.history.get(identifier).map(|to| HistoryEntry {
            identifier_from: identifier.to_string(),
            identifier_to: to.clone(),
        }))
    }

    async fn alias(&self, kb: &str, alias: &str) -> Result<Option<String>, StoreError> {
        let kbs = self.kbs.read().await;
        let stored = kbs.get(kb).ok_or_else(|| not_built(kb))?;
        Ok(stored.aliases.get(alias).cloned())
    }

    async fn citations(&self, kb: &str, identifier: &str) -> Result<Vec<String>, StoreError> {
        let kbs = self.kbs.read().await;
        let stored = kbs.get(kb).ok_or_else(|| not_built(kb))?;
        Ok(stored.citations.get(identifier).cloned().unwrap_or_default())
    }

    async fn name_homonyms(&self, kb: &str, limit: usize) -> Result<Vec<Homonym>, StoreError> {
        let kbs = self.kbs.read().await;
        let stored = kbs.get(kb).ok_or_else(|| not_built(kb))?;

        let mut by_name: BTreeMap<&str, Vec<String>> = BTreeMap::new();
        for entity in stored.entities.values() {
            let names = std::iter::once(entity.name.as_str())
                .chain(entity.synonyms.iter().map(String::as_str));
            for name in names {
                let identifiers = by_name.entry(name).or_default();
                if identifiers.last() != Some(&entity.identifier) {
                    identifiers.push(entity.identifier.clone());
                }
            }
        }

        Ok(by_name
            .into_iter()
            .filter(|(_, ids)| ids.len() > 1)
            .take(limit)
            .map(|(name, identifiers)| Homonym {
                name: name.to_string(),
                identifiers,
            })
            .collect())
    }
}
