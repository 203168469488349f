//! BioC XML reader
//!
//! Passages carry absolute offsets into the original article. They are
//! rebased so that the document text is the passage texts joined by one
//! space, and annotation offsets follow.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tracing::warn;

use super::{RawAnnotation, RawDocument, RawPassage};
use crate::error::ParseError;

pub fn read_file(corpus: &str, path: &Path, skip_types: &[&str]) -> Result<Vec<RawDocument>, ParseError> {
    let reader = BufReader::new(File::open(path)?);
    parse(corpus, reader, skip_types)
}

/// A BioC document with its document-level infons
#[derive(Debug, Clone)]
pub struct BiocDocument {
    pub infons: BTreeMap<String, String>,
    pub document: RawDocument,
}

pub fn read_documents(corpus: &str, path: &Path, skip_types: &[&str]) -> Result<Vec<BiocDocument>, ParseError> {
    let reader = BufReader::new(File::open(path)?);
    parse_documents(corpus, reader, skip_types)
}

#[derive(Default)]
struct PassageState {
    kind: String,
    offset: usize,
    text: String,
    annotations: Vec<AnnotationState>,
}

#[derive(Default)]
struct AnnotationState {
    entity_type: String,
    identifiers: String,
    /// `(offset, length)` per location
    locations: Vec<(usize, usize)>,
    text: String,
}

/// Parse a BioC collection
pub fn parse<R: std::io::BufRead>(
    corpus: &str,
    source: R,
    skip_types: &[&str],
) -> Result<Vec<RawDocument>, ParseError> {
    Ok(parse_documents(corpus, source, skip_types)?
        .into_iter()
        .map(|d| d.document)
        .collect())
}

pub fn parse_documents<R: std::io::BufRead>(
    corpus: &str,
    source: R,
    skip_types: &[&str],
) -> Result<Vec<BiocDocument>, ParseError> {
    let xml_error = |message: String| ParseError::Xml {
        resource: corpus.to_string(),
        message,
    };

    let mut reader = Reader::from_reader(source);
    let mut buf = Vec::new();

    let mut documents = Vec::new();
    let mut document_id: Option<String> = None;
    let mut document_infons: BTreeMap<String, String> = BTreeMap::new();
    let mut passages: Vec<PassageState> = Vec::new();
    let mut passage: Option<PassageState> = None;
    let mut annotation: Option<AnnotationState> = None;
    let mut in_document = false;
    let mut infon_key: Option<String> = None;
    let mut text = String::new();

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| xml_error(format!("at byte {}: {e}", reader.buffer_position())))?;
        match event {
            Event::Start(e) => {
                text.clear();
                match e.name().as_ref() {
                    b"document" => {
                        in_document = true;
                        document_id = None;
                        document_infons.clear();
                        passages.clear();
                    }
                    b"passage" => passage = Some(PassageState::default()),
                    b"annotation" => annotation = Some(AnnotationState::default()),
                    b"infon" => infon_key = attribute(&e, b"key"),
                    b"location" => {
                        if let Some(a) = annotation.as_mut() {
                            a.locations.push(location(&e).map_err(xml_error)?);
                        }
                    }
                    _ => {}
                }
            }
            Event::Empty(e) => {
                if e.name().as_ref() == b"location" {
                    if let Some(a) = annotation.as_mut() {
                        a.locations.push(location(&e).map_err(xml_error)?);
                    }
                }
            }
            Event::Text(e) => {
                let unescaped = e.unescape().map_err(|e| xml_error(e.to_string()))?;
                text.push_str(&unescaped);
            }
            Event::CData(e) => {
                text.push_str(&String::from_utf8_lossy(&e.into_inner()));
            }
            Event::End(e) => {
                match e.name().as_ref() {
                    b"id" if in_document && passage.is_none() => {
                        document_id = Some(text.trim().to_string());
                    }
                    b"infon" => {
                        let key = infon_key.take().unwrap_or_default();
                        if let Some(a) = annotation.as_mut() {
                            match key.as_str() {
                                "type" => a.entity_type = text.trim().to_string(),
                                "identifier" | "MESH" | "NCBI Gene identifier" => {
                                    a.identifiers = text.trim().to_string()
                                }
                                _ => {}
                            }
                        } else if let Some(p) = passage.as_mut() {
                            if key == "type" {
                                p.kind = text.trim().to_string();
                            }
                        } else if in_document {
                            document_infons.insert(key, text.trim().to_string());
                        }
                    }
                    b"offset" => {
                        if let (Some(p), None) = (passage.as_mut(), annotation.as_ref()) {
                            p.offset = text
                                .trim()
                                .parse()
                                .map_err(|_| xml_error(format!("invalid passage offset `{}`", text.trim())))?;
                        }
                    }
                    b"text" => {
                        if let Some(a) = annotation.as_mut() {
                            a.text = text.clone();
                        } else if let Some(p) = passage.as_mut() {
                            p.text = text.clone();
                        }
                    }
                    b"annotation" => {
                        if let (Some(a), Some(p)) = (annotation.take(), passage.as_mut()) {
                            p.annotations.push(a);
                        }
                    }
                    b"passage" => {
                        if let Some(p) = passage.take() {
                            passages.push(p);
                        }
                    }
                    b"document" => {
                        in_document = false;
                        let id = document_id
                            .take()
                            .ok_or_else(|| xml_error("document without id".to_string()))?;
                        documents.push(BiocDocument {
                            infons: std::mem::take(&mut document_infons),
                            document: rebase(corpus, id, std::mem::take(&mut passages), skip_types),
                        });
                    }
                    _ => {}
                }
                text.clear();
            }
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }

    Ok(documents)
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.as_ref() == key)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

fn location(e: &BytesStart<'_>) -> Result<(usize, usize), String> {
    let number = |key: &[u8]| -> Result<usize, String> {
        let value = attribute(e, key).ok_or_else(|| {
            format!("location without `{}`", String::from_utf8_lossy(key))
        })?;
        value
            .parse()
            .map_err(|_| format!("invalid location value `{value}`"))
    };
    Ok((number(b"offset")?, number(b"length")?))
}

/// Shift passage and annotation offsets so passages are separated by one space.
///
/// An annotation with several locations spans from the first to the last
/// one and is marked discontinuous.
fn rebase(corpus: &str, id: String, passages: Vec<PassageState>, skip_types: &[&str]) -> RawDocument {
    let mut rebased = Vec::with_capacity(passages.len());
    let mut consumed = 0usize;

    for passage in passages {
        // original offset to position in the joined text
        let shift = |offset: usize| {
            offset
                .checked_add(consumed)
                .map(|o| o.saturating_sub(passage.offset))
        };
        let annotations = passage
            .annotations
            .into_iter()
            .filter(|a| !skip_types.contains(&a.entity_type.as_str()))
            .filter_map(|a| {
                let span = a
                    .locations
                    .iter()
                    .map(|(o, l)| Some((*o, o.checked_add(*l)?)))
                    .collect::<Option<Vec<_>>>()
                    .and_then(|spans| {
                        let start = spans.iter().map(|(s, _)| *s).min()?;
                        let end = spans.iter().map(|(_, e)| *e).max()?;
                        Some((shift(start)?, shift(end)?))
                    });
                let Some((start, end)) = span else {
                    if !a.locations.is_empty() {
                        warn!(corpus, document = %id, text = %a.text, "Annotation location out of range, skipped");
                    }
                    return None;
                };
                Some(RawAnnotation {
                    start,
                    end,
                    discontinuous: a.locations.len() > 1,
                    text: a.text,
                    entity_type: a.entity_type,
                    identifiers: a.identifiers,
                })
            })
            .collect();

        consumed += passage.text.chars().count() + 1;
        rebased.push(RawPassage {
            kind: passage.kind,
            text: passage.text,
            annotations,
        });
    }

    RawDocument { id, passages: rebased }
}
