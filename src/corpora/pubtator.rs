//! PubTator reader
//!
//! ```text
//! 10021369|t|Title text
//! 10021369|a|Abstract text
//! 10021369\t0\t5\tTitle\tDisease\tD000001
//! 10021369\tCID\tD000001\tD000002          (relation, ignored)
//!
//! ```

use std::path::Path;

use tracing::warn;

use super::{attach_annotations, RawAnnotation, RawDocument, RawPassage};
use crate::error::{FormatError, ParseError};
use crate::kbs::io::{display_name, LossyLines};

/// Columns of an annotation line
const ANNOTATION_COLUMNS: usize = 6;

pub fn read_file(corpus: &str, path: &Path) -> Result<Vec<RawDocument>, ParseError> {
    let lines = LossyLines::open(path)?;
    parse(corpus, &display_name(path), lines)
}

/// Parse numbered lines into documents; malformed annotation lines are skipped
pub fn parse<I>(corpus: &str, file: &str, lines: I) -> Result<Vec<RawDocument>, ParseError>
where
    I: IntoIterator<Item = std::io::Result<(u64, String)>>,
{
    let mut documents = Vec::new();
    let mut current: Option<Builder> = None;

    for line in lines {
        let (number, line) = line?;
        let line = line.trim_end_matches(['\r', '\n']);

        if line.trim().is_empty() {
            if let Some(builder) = current.take() {
                documents.push(builder.finish());
            }
            continue;
        }

        match parse_line(line) {
            Some(Line::Text { pmid, kind, text }) => {
                if current.as_ref().map_or(true, |b| b.id != pmid) {
                    if let Some(done) = current.take() {
                        documents.push(done.finish());
                    }
                    current = Some(Builder::new(pmid));
                }
                if let Some(builder) = current.as_mut() {
                    builder.passages.push(RawPassage {
                        kind: kind.to_string(),
                        text: text.to_string(),
                        annotations: Vec::new(),
                    });
                }
            }
            Some(Line::Annotation(fields)) => {
                let Some(builder) = current.as_mut() else {
                    warn!(corpus, file, line = number, "Annotation before any text, skipped");
                    continue;
                };
                match annotation(&fields) {
                    Ok(a) => builder.annotations.push(a),
                    Err(message) => {
                        let error = FormatError::new(corpus, file, number, message);
                        warn!(error = %error, "Malformed annotation skipped");
                    }
                }
            }
            None => {}
        }
    }
    if let Some(builder) = current.take() {
        documents.push(builder.finish());
    }
    Ok(documents)
}

enum Line<'a> {
    Text {
        pmid: String,
        kind: &'a str,
        text: &'a str,
    },
    Annotation(Vec<&'a str>),
}

fn parse_line(line: &str) -> Option<Line<'_>> {
    let mut parts = line.splitn(3, '|');
    if let (Some(pmid), Some(kind @ ("t" | "a")), Some(text)) = (parts.next(), parts.next(), parts.next()) {
        if !pmid.contains('\t') {
            let kind = if kind == "t" { "title" } else { "abstract" };
            return Some(Line::Text {
                pmid: pmid.to_string(),
                kind,
                text,
            });
        }
    }
    let fields: Vec<&str> = line.split('\t').collect();
    // relations have fewer columns
    (fields.len() >= ANNOTATION_COLUMNS - 1).then_some(Line::Annotation(fields))
}

fn annotation(fields: &[&str]) -> Result<RawAnnotation, String> {
    let offset = |i: usize| {
        fields[i]
            .trim()
            .parse::<usize>()
            .map_err(|_| format!("invalid offset `{}`", fields[i]))
    };
    let start = offset(1)?;
    let end = offset(2)?;
    if end < start {
        return Err(format!("end {end} before start {start}"));
    }
    Ok(RawAnnotation {
        start,
        end,
        text: fields[3].to_string(),
        entity_type: fields[4].trim().to_string(),
        identifiers: fields.get(5).map(|s| s.trim().to_string()).unwrap_or_default(),
        discontinuous: false,
    })
}

struct Builder {
    id: String,
    passages: Vec<RawPassage>,
    annotations: Vec<RawAnnotation>,
}

impl Builder {
    fn new(id: String) -> Self {
        Self {
            id,
            passages: Vec::new(),
            annotations: Vec::new(),
        }
    }

    fn finish(mut self) -> RawDocument {
        attach_annotations(&mut self.passages, self.annotations);
        RawDocument {
            id: self.id,
            passages: self.passages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(text: &str) -> Vec<std::io::Result<(u64, String)>> {
        text.lines()
            .enumerate()
            .map(|(i, l)| Ok((i as u64 + 1, l.to_string())))
            .collect()
    }

    const SAMPLE: &str = "\
100|t|BRCA1 in cancer.
100|a|Mutations of BRCA1 cause breast cancer.
100\t0\t5\tBRCA1\tGene\t672
100\t42\t55\tbreast cancer\tDisease\tD001943
100\tCID\tD001943\tD000001

200|t|Second
200|a|
200\tx\t3\tSec\tDisease\tD1
";

    #[test]
    fn test_parse_documents() {
        let docs = parse("bc5cdr", "sample.txt", lines(SAMPLE)).unwrap();
        assert_eq!(docs.len(), 2);

        let first = &docs[0];
        assert_eq!(first.id, "100");
        assert_eq!(first.passages.len(), 2);
        assert_eq!(first.passages[0].kind, "title");
        assert_eq!(first.passages[0].annotations.len(), 1);
        assert_eq!(first.passages[1].annotations.len(), 1);
        assert_eq!(first.passages[1].annotations[0].identifiers, "D001943");

        let text: Vec<char> = first.text().chars().collect();
        let a = &first.passages[1].annotations[0];
        assert_eq!(text[a.start..a.end].iter().collect::<String>(), "breast cancer");

        // malformed annotation skipped, empty abstract kept
        assert_eq!(docs[1].passages.len(), 2);
        assert!(docs[1].passages.iter().all(|p| p.annotations.is_empty()));
    }
}
