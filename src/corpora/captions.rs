//! Figure captions in BioC with a separate CSV annotation table
//!
//! Every article is a BioC collection holding one document per figure.
//! The annotations inside the BioC files are ignored; `annotations.csv`
//! carries the curated ones with offsets relative to each caption:
//!
//! ```text
//! don_article,figure,first left,last right,text,obj
//! 3868508,Figure_1,12,17,HeLa,CVCL_0030
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use csv::ReaderBuilder;
use serde::Deserialize;
use tracing::warn;

use super::{bioc, require, RawAnnotation, RawDocument, RawPassage, SplitIds};
use crate::error::ParseError;
use crate::kbs::io::display_name;

/// Entity type of annotations whose `obj` names no database
pub const CELLOSAURUS_TYPE: &str = "Cellosaurus";

#[derive(Debug, Clone, Copy)]
pub struct CaptionLayout {
    /// Directory of `{article}.xml`
    pub captions: &'static str,
    pub annotations: &'static str,
    pub splits: SplitIds,
}

#[derive(Debug, Deserialize)]
struct CaptionRow {
    don_article: String,
    figure: String,
    #[serde(rename = "first left")]
    start: usize,
    #[serde(rename = "last right")]
    end: usize,
    text: String,
    obj: String,
}

/// Annotations by article and figure label
type CaptionIndex = BTreeMap<(String, String), Vec<CaptionRow>>;

/// Hyphen and minus sign become `-`
fn clean(text: &str) -> String {
    text.replace(['\u{2010}', '\u{2212}'], "-")
}

/// `(entity type, identifiers)` of an `obj` value
fn entity_of(obj: &str) -> (&str, &str) {
    if obj.starts_with("CVCL_6412|CL") {
        return (CELLOSAURUS_TYPE, "CVCL_6412");
    }
    match obj.split_once(':') {
        Some((database, identifiers)) => (database, identifiers),
        None => (CELLOSAURUS_TYPE, obj),
    }
}

impl CaptionLayout {
    /// One document per article in `ids`, one passage per figure
    pub fn load(&self, corpus: &str, dir: &Path, ids: &[String]) -> Result<Vec<RawDocument>, ParseError> {
        let mut index = self.read_annotations(corpus, dir)?;
        let captions = dir.join(self.captions);

        let mut documents = Vec::with_capacity(ids.len());
        for id in ids {
            let path = require(corpus, &captions, &format!("{id}.xml"))?;
            let figures = bioc::read_documents(corpus, &path, &[])?;
            let article = figures
                .iter()
                .find_map(|f| f.infons.get("pmc_id").cloned())
                .unwrap_or_else(|| id.clone());

            let mut passages = Vec::with_capacity(figures.len());
            let mut offset = 0usize;
            for figure in figures {
                let label = figure.infons.get("figure").cloned().unwrap_or_default();
                let text = clean(&figure.document.text());
                let len = text.chars().count();

                let mut annotations = Vec::new();
                for row in index.remove(&(article.clone(), label.clone())).unwrap_or_default() {
                    let (Some(start), Some(end)) = (offset.checked_add(row.start), offset.checked_add(row.end)) else {
                        warn!(corpus, article = %article, figure = %label, "Annotation offset out of range, skipped");
                        continue;
                    };
                    let (entity_type, identifiers) = entity_of(row.obj.trim());
                    annotations.push(RawAnnotation {
                        start,
                        end,
                        text: clean(&row.text),
                        entity_type: entity_type.to_string(),
                        identifiers: identifiers.to_string(),
                        discontinuous: false,
                    });
                }

                passages.push(RawPassage {
                    kind: label,
                    text,
                    annotations,
                });
                offset = offset.saturating_add(len + 1);
            }

            documents.push(RawDocument {
                id: article,
                passages,
            });
        }
        Ok(documents)
    }

    fn read_annotations(&self, corpus: &str, dir: &Path) -> Result<CaptionIndex, ParseError> {
        let path = require(corpus, dir, self.annotations)?;
        let file = display_name(&path);
        let mut reader = ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_path(&path)
            .map_err(|e| ParseError::Table {
                resource: corpus.to_string(),
                path: path.clone(),
                message: e.to_string(),
            })?;

        let mut index = CaptionIndex::new();
        for (row, result) in reader.deserialize::<CaptionRow>().enumerate() {
            match result {
                Ok(mut annotation) => {
                    annotation.figure = annotation.figure.replace('_', " ");
                    index
                        .entry((annotation.don_article.trim().to_string(), annotation.figure.clone()))
                        .or_default()
                        .push(annotation);
                }
                Err(e) => warn!(corpus, file = %file, row = row + 2, error = %e, "Malformed annotation row, skipped"),
            }
        }
        Ok(index)
    }
}
