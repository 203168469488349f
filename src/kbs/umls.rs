//! UMLS Metathesaurus (`MRCONSO.RRF`, `MRCUI.RRF`)
//!
//! Licensed data, supplied from a local META directory. Both files are
//! `|`-separated with a trailing separator.

use std::path::Path;

use super::io::{display_name, find_input, find_optional, LossyLines};
use super::{KbParser, ParsedRecord, RawEntity, RawName, RecordIter};
use crate::error::{FormatError, ParseError};
use crate::schema::{Category, HistoryEntry};

const RESOURCE: &str = "umls";

// MRCONSO.RRF columns
const CUI: usize = 0;
const LAT: usize = 1;
const SAB: usize = 11;
const TTY: usize = 12;
const CODE: usize = 13;
const STR: usize = 14;
const MRCONSO_MIN_FIELDS: usize = 15;

// MRCUI.RRF columns
const CUI1: usize = 0;
const REL: usize = 2;
const CUI2: usize = 5;

/// Term type of the preferred name
const PREFERRED_TTY: &str = "PN";
const LANGUAGE: &str = "ENG";

#[derive(Debug, Default, Clone, Copy)]
pub struct UmlsParser;

impl KbParser for UmlsParser {
    fn resource(&self) -> &'static str {
        RESOURCE
    }

    fn records(&self, input: &Path) -> Result<RecordIter, ParseError> {
        let conso = find_input(RESOURCE, input, "MRCONSO.RRF")?;
        let conso_file = display_name(&conso);
        let entities = LossyLines::open(&conso)?.filter_map(move |item| match item {
            Err(e) => Some(Err(ParseError::Io(e))),
            Ok((number, line)) => parse_concept(&conso_file, number, &line).transpose(),
        });

        let history: RecordIter = match find_optional(input, "MRCUI.RRF") {
            Some(path) => {
                let file = display_name(&path);
                Box::new(LossyLines::open(&path)?.filter_map(move |item| match item {
                    Err(e) => Some(Err(ParseError::Io(e))),
                    Ok((number, line)) => parse_retired(&file, number, &line).transpose(),
                }))
            }
            None => {
                tracing::warn!(resource = RESOURCE, "MRCUI.RRF not found, building without history");
                Box::new(std::iter::empty())
            }
        };

        Ok(Box::new(entities.chain(history)))
    }
}

fn parse_concept(file: &str, number: u64, line: &str) -> Result<Option<ParsedRecord>, ParseError> {
    if line.is_empty() {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() < MRCONSO_MIN_FIELDS {
        return Err(FormatError::new(
            RESOURCE,
            file,
            number,
            format!("expected at least {MRCONSO_MIN_FIELDS} fields, found {}", fields.len()),
        )
        .into());
    }
    if fields[LAT] != LANGUAGE {
        return Ok(None);
    }

    let name = fields[STR].trim();
    if name.is_empty() {
        return Ok(None);
    }
    let raw_name = if fields[TTY] == PREFERRED_TTY {
        RawName::preferred(name)
    } else {
        RawName::synonym(name)
    };

    let mut entity = RawEntity::new(fields[CUI], Category::Concept).with_name(raw_name);
    let code = fields[CODE];
    if !code.is_empty() && code != "NOCODE" {
        entity.cross_references.push(format!("{}:{code}", fields[SAB]));
    }
    Ok(Some(ParsedRecord::Entity(entity)))
}

fn parse_retired(file: &str, number: u64, line: &str) -> Result<Option<ParsedRecord>, ParseError> {
    if line.is_empty() {
        return Ok(None);
    }
    let fields: Vec<&str> = line.split('|').collect();
    if fields.len() <= CUI2 {
        return Err(FormatError::new(
            RESOURCE,
            file,
            number,
            format!("expected at least {} fields, found {}", CUI2 + 1, fields.len()),
        )
        .into());
    }
    let entry = match fields[REL] {
        "SY" => HistoryEntry::replaced(fields[CUI1], fields[CUI2]),
        "DEL" => HistoryEntry::removed(fields[CUI1]),
        _ => return Ok(None),
    };
    Ok(Some(ParsedRecord::History(entry)))
}
