//! Comparative Toxicogenomics Database vocabularies
//!
//! `CTD_diseases.tsv.gz` and `CTD_chemicals.tsv.gz` share a layout:
//! `#` comment lines, then one tab-separated row per term with the symbol
//! in column 0, the `MESH:`-prefixed identifier in column 1 and
//! `|`-separated synonyms in column 7.

use std::path::Path;

use super::io::{display_name, find_input, LossyLines};
use super::{KbParser, ParsedRecord, RawEntity, RawName, RecordIter};
use crate::error::{FormatError, ParseError};
use crate::schema::Category;

const SYMBOL: usize = 0;
const IDENTIFIER: usize = 1;
/// Diseases only: `|`-separated alternative identifiers
const ALT_IDENTIFIERS: usize = 2;
const SYNONYMS: usize = 7;

/// Identifier of a disease row with no content
const EMPTY_DISEASE: &str = "MESH:C";
/// Chemical once in MeSH, kept by CTD for reference only
const RETIRED_CHEMICAL: &str = "MESH:D013749";

#[derive(Debug, Clone, Copy)]
struct CtdLayout {
    resource: &'static str,
    file: &'static str,
    category: Category,
    columns: usize,
    has_alternatives: bool,
}

const DISEASES: CtdLayout = CtdLayout {
    resource: "ctd_diseases",
    file: "CTD_diseases.tsv.gz",
    category: Category::Disease,
    columns: 9,
    has_alternatives: true,
};

const CHEMICALS: CtdLayout = CtdLayout {
    resource: "ctd_chemicals",
    file: "CTD_chemicals.tsv.gz",
    category: Category::Chemical,
    columns: 8,
    has_alternatives: false,
};

/// CTD disease vocabulary (MEDIC)
#[derive(Debug, Default, Clone, Copy)]
pub struct CtdDiseasesParser;

/// CTD chemical vocabulary
#[derive(Debug, Default, Clone, Copy)]
pub struct CtdChemicalsParser;

impl KbParser for CtdDiseasesParser {
    fn resource(&self) -> &'static str {
        DISEASES.resource
    }

    fn records(&self, input: &Path) -> Result<RecordIter, ParseError> {
        open(DISEASES, input)
    }
}

impl KbParser for CtdChemicalsParser {
    fn resource(&self) -> &'static str {
        CHEMICALS.resource
    }

    fn records(&self, input: &Path) -> Result<RecordIter, ParseError> {
        open(CHEMICALS, input)
    }
}

fn open(layout: CtdLayout, input: &Path) -> Result<RecordIter, ParseError> {
    let path = find_input(layout.resource, input, layout.file)?;
    let file = display_name(&path);
    let lines = LossyLines::open(&path)?;

    let iter = lines.filter_map(move |item| match item {
        Err(e) => Some(Err(ParseError::Io(e))),
        Ok((_, line)) if line.starts_with('#') || line.trim().is_empty() => None,
        Ok((number, line)) => parse_line(layout, &file, number, &line).transpose(),
    });
    Ok(Box::new(iter))
}

fn parse_line(
    layout: CtdLayout,
    file: &str,
    number: u64,
    line: &str,
) -> Result<Option<ParsedRecord>, ParseError> {
    let fields: Vec<&str> = line.split('\t').collect();
    if fields.len() < 2 || fields.len() > layout.columns {
        return Err(FormatError::new(
            layout.resource,
            file,
            number,
            format!(
                "expected up to {} tab-separated columns, found {}",
                layout.columns,
                fields.len()
            ),
        )
        .into());
    }

    let identifier = fields[IDENTIFIER].trim();
    let symbol = fields[SYMBOL].trim();

    if layout.has_alternatives && identifier == EMPTY_DISEASE {
        return Ok(None);
    }
    if !layout.has_alternatives && identifier == RETIRED_CHEMICAL {
        return Ok(None);
    }

    let mut entity = RawEntity::new(identifier, layout.category);
    if !symbol.is_empty() {
        entity.names.push(RawName::preferred(symbol));
    }

    let synonyms = fields.get(SYNONYMS).copied().unwrap_or("");
    entity.names.extend(
        synonyms
            .split('|')
            .map(str::trim)
            .filter(|s| !s.is_empty() && *s != symbol)
            .map(RawName::synonym),
    );

    if layout.has_alternatives {
        let alternatives = fields.get(ALT_IDENTIFIERS).copied().unwrap_or("");
        for alt in alternatives.split('|').map(str::trim).filter(|s| !s.is_empty()) {
            entity.aliases.push(alt.to_string());
            entity.cross_references.push(alt.to_string());
        }
    }

    Ok(Some(ParsedRecord::Entity(entity)))
}
