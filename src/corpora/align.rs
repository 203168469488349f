//! Corpus aligner
//!
//! Turns parsed documents into linked documents: offsets are checked against
//! the text (and repaired when a nearby exact match exists), raw identifier
//! strings are parsed and resolved against the current state of the
//! knowledge base, duplicates are dropped and ids assigned. Every fix and
//! drop is counted in [`QaqcStats`].

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::segment::segment_document;
use super::{
    span_matches, Annotation, CorpusDefinition, Document, Passage, RawAnnotation, RawDocument,
    FLAG_CROSSING_SENTENCE, FLAG_IDENTIFIER_REPLACED, FLAG_OFFSETS_FIXED, FLAG_SEGMENTATION_FAILED,
};
use crate::error::BelbError;
use crate::reader::{KbReader, Resolution};
use crate::schema::Category;

/// Characters searched on each side of a wrong offset for the mention text
pub const OFFSET_WINDOW: usize = 32;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignOptions {
    /// Split passages into sentences
    pub sentences: bool,
}

/// Per-split counters of annotation fixes and drops
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QaqcStats {
    pub documents: u64,
    pub annotations_in: u64,
    pub annotations_out: u64,
    /// Dropped: text not found at or near the offsets
    pub offsets: u64,
    /// Dropped: mention spread over several locations
    pub discontinuous: u64,
    /// Repaired from byte offsets or a nearby match
    pub offsets_fixed: u64,
    /// Invalid entries in the raw identifier field
    pub identifiers_na_pre_kb: u64,
    pub ann_identifier_replaced: u64,
    pub ann_identifier_discontinued: u64,
    pub ann_identifier_na: u64,
    /// Dropped: no identifier left after resolution
    pub ann_without_identifiers: u64,
    pub duplicates: u64,
    pub crossing_sentence: u64,
    pub segmentation_failed: u64,
}

impl QaqcStats {
    pub fn merge(&mut self, other: &QaqcStats) {
        self.documents += other.documents;
        self.annotations_in += other.annotations_in;
        self.annotations_out += other.annotations_out;
        self.offsets += other.offsets;
        self.discontinuous += other.discontinuous;
        self.offsets_fixed += other.offsets_fixed;
        self.identifiers_na_pre_kb += other.identifiers_na_pre_kb;
        self.ann_identifier_replaced += other.ann_identifier_replaced;
        self.ann_identifier_discontinued += other.ann_identifier_discontinued;
        self.ann_identifier_na += other.ann_identifier_na;
        self.ann_without_identifiers += other.ann_without_identifiers;
        self.duplicates += other.duplicates;
        self.crossing_sentence += other.crossing_sentence;
        self.segmentation_failed += other.segmentation_failed;
    }
}

/// Locate `text` in the document.
///
/// Returns the character span and whether it differs from the given offsets.
pub fn locate_mention(
    doc: &str,
    chars: &[char],
    start: usize,
    end: usize,
    text: &str,
) -> Option<((usize, usize), bool)> {
    if span_matches(chars, start, end, text) {
        return Some(((start, end), false));
    }

    let len = text.chars().count();
    if len == 0 {
        return None;
    }

    // offsets given in UTF-8 bytes
    if doc.get(start..end) == Some(text) {
        let char_start = doc[..start].chars().count();
        return Some(((char_start, char_start + len), true));
    }

    for distance in 1..=OFFSET_WINDOW {
        let candidates = [start.checked_sub(distance), start.checked_add(distance)];
        for candidate in candidates.into_iter().flatten() {
            let Some(candidate_end) = candidate.checked_add(len) else {
                continue;
            };
            if span_matches(chars, candidate, candidate_end, text) {
                return Some(((candidate, candidate_end), true));
            }
        }
    }
    None
}

/// Links the documents of one corpus and category against one KB
pub struct Aligner<'a> {
    definition: &'a CorpusDefinition,
    category: Category,
    kb: KbReader,
    options: AlignOptions,
    cache: HashMap<String, Resolution>,
}

impl<'a> Aligner<'a> {
    pub fn new(definition: &'a CorpusDefinition, category: Category, kb: KbReader, options: AlignOptions) -> Self {
        Self {
            definition,
            category,
            kb,
            options,
            cache: HashMap::new(),
        }
    }

    async fn resolve(&mut self, identifier: &str) -> Result<Resolution, BelbError> {
        if let Some(cached) = self.cache.get(identifier) {
            return Ok(cached.clone());
        }
        let resolution = self.kb.resolve(identifier).await?;
        self.cache.insert(identifier.to_string(), resolution.clone());
        Ok(resolution)
    }

    /// Align one document, adding its counters to `stats`
    pub async fn align(&mut self, raw: RawDocument, stats: &mut QaqcStats) -> Result<Document, BelbError> {
        stats.documents += 1;
        let doc = raw.text();
        let chars: Vec<char> = doc.chars().collect();

        let mut passages = Vec::with_capacity(raw.passages.len());
        let mut raw_annotations = Vec::new();
        let mut offset = 0;
        for (id, passage) in raw.passages.into_iter().enumerate() {
            let len = passage.text.chars().count();
            raw_annotations.extend(passage.annotations);
            passages.push(Passage {
                id,
                kind: passage.kind,
                offset,
                text: passage.text,
                annotations: Vec::new(),
                flags: Vec::new(),
            });
            offset += len + 1;
        }

        let mut annotations = Vec::new();
        for raw_annotation in raw_annotations {
            if self.definition.category_of(&raw_annotation.entity_type) != Some(self.category) {
                continue;
            }
            stats.annotations_in += 1;
            if let Some(annotation) = self.link(&raw.id, &doc, &chars, raw_annotation, stats).await? {
                annotations.push(annotation);
            }
        }

        // exact duplicates, then ids by position
        annotations.sort_by(|a, b| {
            (a.start, a.end, &a.text, &a.identifiers).cmp(&(b.start, b.end, &b.text, &b.identifiers))
        });
        let before = annotations.len();
        annotations.dedup_by(|a, b| {
            a.start == b.start && a.end == b.end && a.text == b.text && a.identifiers == b.identifiers
        });
        stats.duplicates += (before - annotations.len()) as u64;

        for (index, mut annotation) in annotations.into_iter().enumerate() {
            annotation.id = index.to_string();
            let target = passages
                .iter()
                .rposition(|p| p.offset <= annotation.start)
                .unwrap_or(0);
            if let Some(passage) = passages.get_mut(target) {
                passage.annotations.push(annotation);
            }
        }

        let mut document = Document {
            id: raw.id,
            passages,
            sentences: false,
            flags: Vec::new(),
        };

        if self.options.sentences {
            document = segment_document(document);
            if document.flags.iter().any(|f| f == FLAG_SEGMENTATION_FAILED) {
                stats.segmentation_failed += 1;
                debug!(document = %document.id, "Sentence splitting failed, keeping passages");
            }
            stats.crossing_sentence += document
                .annotations()
                .filter(|a| a.flags.iter().any(|f| f == FLAG_CROSSING_SENTENCE))
                .count() as u64;
        }

        stats.annotations_out += document.annotation_count() as u64;
        Ok(document)
    }

    async fn link(
        &mut self,
        document: &str,
        doc: &str,
        chars: &[char],
        raw: RawAnnotation,
        stats: &mut QaqcStats,
    ) -> Result<Option<Annotation>, BelbError> {
        if raw.discontinuous {
            stats.discontinuous += 1;
            debug!(document, start = raw.start, end = raw.end, text = %raw.text, "Discontinuous mention, dropped");
            return Ok(None);
        }
        let Some(((start, end), fixed)) = locate_mention(doc, chars, raw.start, raw.end, &raw.text) else {
            stats.offsets += 1;
            debug!(document, start = raw.start, end = raw.end, text = %raw.text, "Offsets do not match text, dropped");
            return Ok(None);
        };
        let mut flags = Vec::new();
        if fixed {
            stats.offsets_fixed += 1;
            flags.push(FLAG_OFFSETS_FIXED.to_string());
        }

        let parsed = self.definition.identifiers.parse(&raw.identifiers);
        stats.identifiers_na_pre_kb += parsed.iter().filter(|i| i.is_none()).count() as u64;

        // counted once per annotation
        let (mut replaced, mut discontinued, mut unknown) = (false, false, false);
        let mut identifiers: Vec<String> = Vec::new();
        let mut seen = BTreeSet::new();
        for identifier in parsed.into_iter().flatten() {
            match self.resolve(&identifier).await? {
                Resolution::Current(current) => {
                    if current != identifier {
                        replaced = true;
                    }
                    if seen.insert(current.clone()) {
                        identifiers.push(current);
                    }
                }
                Resolution::Removed => discontinued = true,
                Resolution::Unknown => unknown = true,
            }
        }
        stats.ann_identifier_replaced += replaced as u64;
        stats.ann_identifier_discontinued += discontinued as u64;
        stats.ann_identifier_na += unknown as u64;

        if identifiers.is_empty() {
            stats.ann_without_identifiers += 1;
            debug!(document, text = %raw.text, identifiers = %raw.identifiers, "No valid identifier left, dropped");
            return Ok(None);
        }
        if replaced {
            flags.push(FLAG_IDENTIFIER_REPLACED.to_string());
        }

        Ok(Some(Annotation {
            id: String::new(),
            start,
            end,
            text: raw.text,
            category: self.category,
            identifiers,
            original_identifiers: raw.identifiers,
            flags,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReaderConfig;
    use crate::corpora::{definition, RawPassage};
    use crate::schema::{EntityRecord, HistoryEntry, TableSet};
    use crate::store::{KbStore, MemoryKbStore};
    use std::sync::Arc;

    async fn gene_kb() -> KbReader {
        let store = MemoryKbStore::new();
        let tables = TableSet {
            entities: vec![
                EntityRecord::new("672", Category::Gene, "BRCA1"),
                EntityRecord::new("G1", Category::Gene, "BRCA1"),
            ],
            history: vec![HistoryEntry::replaced("100", "672"), HistoryEntry::removed("200")],
            ..TableSet::default()
        };
        store.write_table_set("ncbi_gene", &tables).await.unwrap();
        KbReader::new(Arc::new(store), "ncbi_gene", ReaderConfig::default())
    }

    fn raw(text: &str, annotations: Vec<RawAnnotation>) -> RawDocument {
        RawDocument {
            id: "1".into(),
            passages: vec![RawPassage {
                kind: "abstract".into(),
                text: text.into(),
                annotations,
            }],
        }
    }

    fn mention(start: usize, end: usize, text: &str, identifiers: &str) -> RawAnnotation {
        RawAnnotation {
            start,
            end,
            text: text.into(),
            entity_type: "Gene".into(),
            identifiers: identifiers.into(),
            discontinuous: false,
        }
    }

    #[test]
    fn test_locate_mention() {
        let doc = "Größe BRCA1 gene";
        let chars: Vec<char> = doc.chars().collect();
        // exact
        assert_eq!(locate_mention(doc, &chars, 6, 11, "BRCA1"), Some(((6, 11), false)));
        // byte offsets (ö and ß are two bytes each)
        assert_eq!(locate_mention(doc, &chars, 8, 13, "BRCA1"), Some(((6, 11), true)));
        // nearby
        assert_eq!(locate_mention(doc, &chars, 2, 7, "BRCA1"), Some(((6, 11), true)));
        // absent
        assert_eq!(locate_mention(doc, &chars, 6, 11, "TP53"), None);
    }

    #[tokio::test]
    async fn test_identifier_resolution_counters() {
        let definition = definition("gnormplus").unwrap();
        let mut aligner = Aligner::new(definition, Category::Gene, gene_kb().await, AlignOptions::default());
        let text = "BRCA1 and BRCA1 and TP53 and XYZ and ABC";
        let document = raw(
            text,
            vec![
                mention(0, 5, "BRCA1", "100(Tax:9606)"),
                mention(10, 15, "BRCA1", "672,-1"),
                mention(20, 24, "TP53", "200"),
                mention(29, 32, "XYZ", "999"),
                mention(37, 40, "ABC", "672"),
                mention(37, 40, "ABC", "672"),
            ],
        );

        let mut stats = QaqcStats::default();
        let aligned = aligner.align(document, &mut stats).await.unwrap();

        assert_eq!(stats.annotations_in, 6);
        assert_eq!(stats.ann_identifier_replaced, 1);
        assert_eq!(stats.ann_identifier_discontinued, 1);
        assert_eq!(stats.ann_identifier_na, 1);
        assert_eq!(stats.identifiers_na_pre_kb, 1);
        assert_eq!(stats.ann_without_identifiers, 2);
        assert_eq!(stats.duplicates, 1);
        assert_eq!(stats.annotations_out, 3);

        let annotations: Vec<_> = aligned.annotations().collect();
        assert_eq!(annotations[0].identifiers, vec!["672"]);
        assert_eq!(annotations[0].original_identifiers, "100(Tax:9606)");
        assert_eq!(annotations[0].flags, vec![FLAG_IDENTIFIER_REPLACED]);
        let ids: Vec<_> = annotations.iter().map(|a| a.id.as_str()).collect();
        assert_eq!(ids, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_wrong_offsets_are_dropped() {
        let definition = definition("gnormplus").unwrap();
        let mut aligner = Aligner::new(definition, Category::Gene, gene_kb().await, AlignOptions::default());
        let document = raw("Nothing to see here", vec![mention(0, 5, "BRCA1", "672")]);

        let mut stats = QaqcStats::default();
        let aligned = aligner.align(document, &mut stats).await.unwrap();
        assert_eq!(stats.offsets, 1);
        assert_eq!(aligned.annotation_count(), 0);
    }

    #[test]
    fn test_offsets_near_usize_max() {
        let doc = "BRCA1 gene";
        let chars: Vec<char> = doc.chars().collect();
        assert_eq!(locate_mention(doc, &chars, usize::MAX - 3, usize::MAX, "BRCA1"), None);
        assert_eq!(locate_mention(doc, &chars, usize::MAX, usize::MAX, "BRCA1"), None);
    }

    #[tokio::test]
    async fn test_out_of_range_and_discontinuous_mentions_are_counted() {
        let definition = definition("gnormplus").unwrap();
        let mut aligner = Aligner::new(definition, Category::Gene, gene_kb().await, AlignOptions::default());
        let mut split = mention(0, 9, "BRCA1", "672");
        split.discontinuous = true;
        let document = raw(
            "BRCA1 and BRCA1",
            vec![
                mention(usize::MAX - 3, usize::MAX, "BRCA1", "672"),
                split,
                mention(10, 15, "BRCA1", "672"),
            ],
        );

        let mut stats = QaqcStats::default();
        let aligned = aligner.align(document, &mut stats).await.unwrap();
        assert_eq!(stats.offsets, 1);
        assert_eq!(stats.discontinuous, 1);
        assert_eq!(aligned.annotation_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_history_target_in_built_kb() {
        use crate::kbs::{ParsedRecord, RawEntity, RawName};
        use crate::normalize::normalize_records;

        let records = vec![
            Ok(ParsedRecord::Entity(
                RawEntity::new("672", Category::Gene).with_name(RawName::preferred("BRCA1")),
            )),
            Ok(ParsedRecord::History(HistoryEntry::replaced("100", "555"))),
        ];
        let (tables, stats) = normalize_records("ncbi_gene", &[Category::Gene], records).unwrap();
        assert_eq!(stats.dangling_history, 1);

        let store = MemoryKbStore::new();
        store.write_table_set("ncbi_gene", &tables).await.unwrap();
        let kb = KbReader::new(Arc::new(store), "ncbi_gene", ReaderConfig::default());
        assert_eq!(kb.resolve("100").await.unwrap(), Resolution::Removed);

        let definition = definition("gnormplus").unwrap();
        let mut aligner = Aligner::new(definition, Category::Gene, kb, AlignOptions::default());
        let document = raw(
            "BRCA1 and BRCA1",
            vec![mention(0, 5, "BRCA1", "672"), mention(10, 15, "BRCA1", "100")],
        );

        let mut stats = QaqcStats::default();
        let aligned = aligner.align(document, &mut stats).await.unwrap();
        assert_eq!(stats.ann_identifier_discontinued, 1);
        assert_eq!(stats.ann_without_identifiers, 1);
        let annotations: Vec<_> = aligned.annotations().collect();
        assert_eq!(annotations.len(), 1);
        assert_eq!(annotations[0].identifiers, vec!["672"]);
    }

    #[tokio::test]
    async fn test_single_sentence_document() {
        let definition = definition("gnormplus").unwrap();
        let options = AlignOptions { sentences: true };
        let mut aligner = Aligner::new(definition, Category::Gene, gene_kb().await, options);
        let document = raw(
            "The BRCA1 gene is linked to cancer.",
            vec![mention(4, 9, "BRCA1", "G1")],
        );

        let mut stats = QaqcStats::default();
        let aligned = aligner.align(document, &mut stats).await.unwrap();

        assert!(aligned.sentences);
        assert_eq!(aligned.passages.len(), 1);
        let a = &aligned.passages[0].annotations[0];
        assert_eq!((a.start, a.end), (4, 9));
        assert_eq!(a.identifiers, vec!["G1"]);
        assert_eq!(stats.segmentation_failed, 0);
    }
}
