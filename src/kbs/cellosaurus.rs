//! Cellosaurus line-record format (`cellosaurus.txt`)
//!
//! Each record is a block of `XX   value` lines closed by `//`. The file
//! starts with a free-text header that ends at the first `ID` line.
//! `cellosaurus_deleted_ACs.txt` lists withdrawn accessions.

use std::path::Path;

use super::io::{display_name, find_input, find_optional, LossyLines};
use super::{KbParser, ParsedRecord, RawEntity, RawName, RecordIter};
use crate::error::{FormatError, ParseError};
use crate::schema::{Category, HistoryEntry};

const RESOURCE: &str = "cellosaurus";
const TERMINATOR: &str = "//";
const ACCESSION_PREFIX: &str = "CVCL_";

#[derive(Debug, Default, Clone, Copy)]
pub struct CellosaurusParser;

impl KbParser for CellosaurusParser {
    fn resource(&self) -> &'static str {
        RESOURCE
    }

    fn records(&self, input: &Path) -> Result<RecordIter, ParseError> {
        let path = find_input(RESOURCE, input, "cellosaurus.txt")?;
        let entries = CellosaurusRecords {
            file: display_name(&path),
            lines: LossyLines::open(&path)?,
            in_body: false,
        };

        let history: RecordIter = match find_optional(input, "cellosaurus_deleted_ACs.txt") {
            Some(path) => Box::new(LossyLines::open(&path)?.filter_map(|item| match item {
                Err(e) => Some(Err(ParseError::Io(e))),
                Ok((_, line)) => line
                    .split_whitespace()
                    .next()
                    .filter(|token| token.starts_with(ACCESSION_PREFIX))
                    .map(|ac| Ok(ParsedRecord::History(HistoryEntry::removed(ac)))),
            })),
            None => {
                tracing::warn!(resource = RESOURCE, "deleted accessions list not found");
                Box::new(std::iter::empty())
            }
        };

        Ok(Box::new(entries.chain(history)))
    }
}

/// Fields collected for one record
#[derive(Debug, Default)]
struct Block {
    start_line: u64,
    name: Option<String>,
    accession: Option<String>,
    secondary: Vec<String>,
    synonyms: Vec<String>,
    species: Vec<String>,
    pmids: Vec<String>,
    diseases: Vec<String>,
    category: Option<String>,
    error: Option<(u64, String)>,
}

impl Block {
    fn add(&mut self, key: &str, value: &str) {
        let split = |v: &str| -> Vec<String> {
            v.split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect()
        };
        match key {
            "ID" => self.name = Some(value.trim().to_string()),
            "AC" => self.accession = Some(value.trim().to_string()),
            "AS" => self.secondary.extend(split(value)),
            "SY" => self.synonyms.extend(split(value)),
            // NCBI_TaxID=9606; ! Homo sapiens
            "OX" => {
                if let Some(tax_id) = value
                    .split(';')
                    .next()
                    .and_then(|s| s.trim().strip_prefix("NCBI_TaxID="))
                {
                    self.species.push(format!("NCBI_TaxID:{tax_id}"));
                }
            }
            // PubMed=12345; DOI=...
            "RX" => self.pmids.extend(
                split(value)
                    .into_iter()
                    .filter_map(|r| r.strip_prefix("PubMed=").map(String::from)),
            ),
            // NCIt; C4872; Breast carcinoma
            "DI" => {
                if let Some(name) = value.rsplit(';').next().map(str::trim) {
                    if !name.is_empty() {
                        self.diseases.push(name.to_string());
                    }
                }
            }
            "CA" => self.category = Some(value.trim().to_string()),
            _ => {}
        }
    }

    fn attribute(&self) -> Option<String> {
        let disease = self
            .diseases
            .iter()
            .min_by(|a, b| a.chars().count().cmp(&b.chars().count()).then_with(|| a.cmp(b)));
        match (disease, &self.category) {
            (Some(d), _) => Some(format!("disease:{d}")),
            (None, Some(c)) => Some(format!("category:{c}")),
            (None, None) => None,
        }
    }

    fn finish(self, file: &str) -> Result<ParsedRecord, ParseError> {
        if let Some((line, message)) = self.error {
            return Err(FormatError::new(RESOURCE, file, line, message).into());
        }
        let attribute = self.attribute();
        let (Some(name), Some(accession)) = (self.name, self.accession) else {
            return Err(FormatError::new(
                RESOURCE,
                file,
                self.start_line,
                "record without ID or AC line",
            )
            .into());
        };

        let mut entity = RawEntity::new(accession, Category::CellLine);
        entity.names.push(RawName::preferred(name));
        entity.names.extend(self.synonyms.into_iter().map(RawName::synonym));
        entity.aliases = self.secondary;
        entity.cross_references = self.species;
        entity.citations = self.pmids;
        entity.attribute = attribute;
        Ok(ParsedRecord::Entity(entity))
    }
}

struct CellosaurusRecords {
    file: String,
    lines: LossyLines,
    in_body: bool,
}

impl Iterator for CellosaurusRecords {
    type Item = Result<ParsedRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut block: Option<Block> = None;

        loop {
            let (number, line) = match self.lines.next() {
                None => {
                    // unterminated trailing record
                    return block.map(|b| b.finish(&self.file));
                }
                Some(Err(e)) => return Some(Err(ParseError::Io(e))),
                Some(Ok(item)) => item,
            };

            if !self.in_body {
                if !line.starts_with("ID   ") {
                    continue;
                }
                self.in_body = true;
            }

            let line = line.trim_end();
            if line.is_empty() {
                continue;
            }
            if line == TERMINATOR {
                match block.take() {
                    Some(b) => return Some(b.finish(&self.file)),
                    None => continue,
                }
            }

            let current = block.get_or_insert_with(|| Block {
                start_line: number,
                ..Block::default()
            });
            match (line.get(..2), line.get(2..5), line.get(5..)) {
                (Some(key), Some("   "), Some(value)) => current.add(key, value),
                _ => {
                    if current.error.is_none() {
                        current.error = Some((number, format!("malformed line `{line}`")));
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CELLOSAURUS: &str = "\
 ----------------------------------------
        CELLOSAURUS
 Description: Cellosaurus: a controlled vocabulary of cell lines
 ----------------------------------------
ID   MCF-7
AC   CVCL_0031
AS   CVCL_J1ND; CVCL_A1B2
SY   MCF7; Michigan Cancer Foundation-7
DR   ATCC; HTB-22
RX   PubMed=4357757;
RX   DOI=10.1000/x; PubMed=23000000;
DI   NCIt; C4872; Breast carcinoma
DI   ORDO; Orphanet_180250; Invasive ductal breast carcinoma
OX   NCBI_TaxID=9606; ! Homo sapiens (Human)
CA   Cancer cell line
//
ID   HEK293
AC   CVCL_0045
OX   NCBI_TaxID=9606; ! Homo sapiens (Human)
CA   Transformed cell line
//
AC   CVCL_9999
broken line
//
";

    #[test]
    fn test_parse_records_and_deleted() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("cellosaurus.txt"), CELLOSAURUS).unwrap();
        std::fs::write(
            dir.path().join("cellosaurus_deleted_ACs.txt"),
            "Deleted accessions\n\nCVCL_1111  HeLa-X\nCVCL_2222  Foo\n",
        )
        .unwrap();

        let records: Vec<_> = CellosaurusParser.records(dir.path()).unwrap().collect();
        assert_eq!(records.len(), 5);

        let ParsedRecord::Entity(mcf7) = records[0].as_ref().unwrap() else {
            panic!("expected entity");
        };
        assert_eq!(mcf7.identifier, "CVCL_0031");
        assert_eq!(mcf7.names[0], RawName::preferred("MCF-7"));
        assert_eq!(mcf7.names.len(), 3);
        assert_eq!(mcf7.aliases, vec!["CVCL_J1ND", "CVCL_A1B2"]);
        assert_eq!(mcf7.cross_references, vec!["NCBI_TaxID:9606"]);
        assert_eq!(mcf7.citations, vec!["4357757", "23000000"]);
        assert_eq!(mcf7.attribute.as_deref(), Some("disease:Breast carcinoma"));

        let ParsedRecord::Entity(hek) = records[1].as_ref().unwrap() else {
            panic!("expected entity");
        };
        assert_eq!(hek.attribute.as_deref(), Some("category:Transformed cell line"));

        // block without ID and with a broken line
        assert!(matches!(records[2], Err(ParseError::Format(_))));

        assert_eq!(
            records[3].as_ref().unwrap(),
            &ParsedRecord::History(HistoryEntry::removed("CVCL_1111"))
        );
    }
}
