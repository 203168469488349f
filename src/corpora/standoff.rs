//! Plain text documents with a tab-separated annotation table
//!
//! ```text
//! #species id          document     start  end   text
//! species:ncbi:9606    pmcA1313771  283    288   human
//! ```
//!
//! Each document is `{texts}/{stem}.txt`. Offsets are character offsets
//! into that file.

use std::collections::BTreeMap;
use std::path::Path;

use csv::ReaderBuilder;
use tracing::{debug, warn};

use super::{attach_annotations, require, RawAnnotation, RawDocument, RawPassage, SplitIds};
use crate::error::ParseError;
use crate::kbs::io::{display_name, open_reader};

/// Lines up to this many characters are merged into the following passage
const SHORT_LINE: usize = 100;

/// Column indices of the annotation table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Columns {
    pub identifier: usize,
    pub document: usize,
    pub start: usize,
    pub end: usize,
    pub text: usize,
}

/// How the document column maps to a text file stem and a document id
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentIds {
    /// `stem:pmid`
    FileAndPmid,
    /// The stem is the column value, the id drops this prefix
    StripPrefix(&'static str),
}

impl DocumentIds {
    /// `(stem, id)` of a document column value
    fn split<'a>(&self, value: &'a str) -> Option<(&'a str, &'a str)> {
        match self {
            DocumentIds::FileAndPmid => value.split_once(':').filter(|(stem, id)| !stem.is_empty() && !id.is_empty()),
            DocumentIds::StripPrefix(prefix) => Some((value, value.strip_prefix(prefix).unwrap_or(value))),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StandoffLayout {
    pub texts: &'static str,
    pub annotations: &'static str,
    pub header: bool,
    pub columns: Columns,
    /// The end column points at the last character
    pub inclusive_end: bool,
    pub ids: DocumentIds,
    /// Cut the text into title and paragraphs instead of one passage
    pub paragraphs: bool,
    pub entity_type: &'static str,
    pub splits: SplitIds,
}

struct Annotated {
    stem: String,
    annotations: Vec<RawAnnotation>,
}

impl StandoffLayout {
    /// Annotated documents among `ids`, in `ids` order
    pub fn load(&self, corpus: &str, dir: &Path, ids: &[String]) -> Result<Vec<RawDocument>, ParseError> {
        let mut annotated = self.read_annotations(corpus, dir)?;
        let texts = dir.join(self.texts);

        let mut documents = Vec::new();
        for id in ids {
            let Some(Annotated { stem, annotations }) = annotated.remove(id) else {
                debug!(corpus, document = %id, "No annotations, document skipped");
                continue;
            };
            let path = require(corpus, &texts, &format!("{stem}.txt"))?;
            let text = String::from_utf8_lossy(&std::fs::read(&path)?).into_owned();
            let mut passages = if self.paragraphs {
                paragraphs(&text)
            } else {
                vec![RawPassage {
                    kind: "abstract".to_string(),
                    text,
                    annotations: Vec::new(),
                }]
            };
            attach_annotations(&mut passages, annotations);
            documents.push(RawDocument {
                id: id.clone(),
                passages,
            });
        }
        Ok(documents)
    }

    fn read_annotations(&self, corpus: &str, dir: &Path) -> Result<BTreeMap<String, Annotated>, ParseError> {
        let path = require(corpus, dir, self.annotations)?;
        let file = display_name(&path);
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .flexible(true)
            .has_headers(self.header)
            .from_reader(open_reader(&path)?);

        let mut annotated: BTreeMap<String, Annotated> = BTreeMap::new();
        for (index, record) in reader.byte_records().enumerate() {
            let record = record.map_err(|e| ParseError::Table {
                resource: corpus.to_string(),
                path: path.clone(),
                message: e.to_string(),
            })?;
            let field = |i: usize| record.get(i).map(|f| String::from_utf8_lossy(f).into_owned());
            let row = index + 1 + usize::from(self.header);

            let parsed = (|| {
                let document = field(self.columns.document)?;
                let (stem, id) = self.ids.split(document.trim())?;
                let start: usize = field(self.columns.start)?.trim().parse().ok()?;
                let mut end: usize = field(self.columns.end)?.trim().parse().ok()?;
                if self.inclusive_end {
                    end = end.checked_add(1)?;
                }
                if end < start {
                    return None;
                }
                let annotation = RawAnnotation {
                    start,
                    end,
                    text: field(self.columns.text)?,
                    entity_type: self.entity_type.to_string(),
                    identifiers: field(self.columns.identifier)?,
                    discontinuous: false,
                };
                Some((stem.to_string(), id.to_string(), annotation))
            })();

            match parsed {
                Some((stem, id, annotation)) => annotated
                    .entry(id)
                    .or_insert_with(|| Annotated {
                        stem,
                        annotations: Vec::new(),
                    })
                    .annotations
                    .push(annotation),
                None => warn!(corpus, file = %file, row, "Malformed annotation row, skipped"),
            }
        }
        Ok(annotated)
    }
}

/// Cut a text at line breaks into a title followed by paragraphs
///
/// Every line break becomes one space between passages, so offsets into
/// the file stay valid in the joined document text. Short lines (section
/// headings) are merged into the line that follows them.
pub fn paragraphs(text: &str) -> Vec<RawPassage> {
    let mut lines = text.split('\n');
    let mut passages = vec![RawPassage {
        kind: "title".to_string(),
        text: lines.next().unwrap_or_default().to_string(),
        annotations: Vec::new(),
    }];

    let mut group: Vec<&str> = Vec::new();
    for line in lines {
        group.push(line);
        if line.chars().count() > SHORT_LINE {
            flush(&mut group, &mut passages);
        }
    }
    if group.iter().any(|line| !line.trim().is_empty()) {
        flush(&mut group, &mut passages);
    }
    passages
}

fn flush(group: &mut Vec<&str>, passages: &mut Vec<RawPassage>) {
    let kind = if passages.len() == 1 { "abstract" } else { "paragraph" };
    passages.push(RawPassage {
        kind: kind.to_string(),
        text: group.join(" "),
        annotations: Vec::new(),
    });
    group.clear();
}
