//! NCBI Gene (`gene_info.gz`, `gene_history.gz`)
//!
//! Both files are tab-separated with a `#tax_id` header line. Columns are
//! looked up by header name; `-` marks a missing value.

use std::collections::HashMap;
use std::path::Path;

use csv::{ByteRecord, ReaderBuilder};

use super::io::{display_name, find_input, find_optional, open_reader};
use super::{KbParser, ParsedRecord, RawEntity, RawName, RecordIter};
use crate::error::{FormatError, ParseError};
use crate::schema::{Category, HistoryEntry, MISSING_VALUE};

const RESOURCE: &str = "ncbi_gene";

/// Name columns, in the order names are collected after the symbol
const SYNONYM_COLUMNS: [&str; 5] = [
    "Symbol_from_nomenclature_authority",
    "Full_name_from_nomenclature_authority",
    "description",
    "Synonyms",
    "Other_designations",
];

/// Attribute sources by priority, with their prefix
const ATTRIBUTE_COLUMNS: [(&str, &str); 4] = [
    ("map_location", "loc"),
    ("LocusTag", "locus"),
    ("chromosome", "chr"),
    ("type_of_gene", "type"),
];

/// Placeholder texts NCBI uses instead of a real name
const PLACEHOLDER_TEXTS: [&str; 2] = [
    "when different from all specified ones in Gene.",
    "Record to support submission of GeneRIFs for a gene not in Gene",
];

#[derive(Debug, Default, Clone, Copy)]
pub struct NcbiGeneParser;

impl KbParser for NcbiGeneParser {
    fn resource(&self) -> &'static str {
        RESOURCE
    }

    fn records(&self, input: &Path) -> Result<RecordIter, ParseError> {
        let info_path = find_input(RESOURCE, input, "gene_info.gz")?;
        let info = TsvTable::open(&info_path, &["#tax_id", "GeneID", "Symbol"])?;
        let entities = info.filter_map(|row| row.and_then(|r| parse_gene(&r)).transpose());

        let history: RecordIter = match find_optional(input, "gene_history.gz") {
            Some(path) => {
                let table = TsvTable::open(&path, &["GeneID", "Discontinued_GeneID"])?;
                Box::new(table.map(|row| row.and_then(|r| parse_history(&r))))
            }
            None => {
                tracing::warn!(resource = RESOURCE, "gene_history not found, building without history");
                Box::new(std::iter::empty())
            }
        };

        Ok(Box::new(entities.chain(history)))
    }
}

/// One data row with its columns addressable by header name
struct TsvRow {
    file: String,
    line: u64,
    columns: std::sync::Arc<HashMap<String, usize>>,
    record: ByteRecord,
}

impl TsvRow {
    /// Lossily decoded, trimmed value; `None` for absent columns
    fn get(&self, column: &str) -> Option<String> {
        let index = *self.columns.get(column)?;
        self.record
            .get(index)
            .map(|v| String::from_utf8_lossy(v).trim().to_string())
    }

    /// Value unless it is missing or the `-` marker
    fn value(&self, column: &str) -> Option<String> {
        self.get(column).filter(|v| !v.is_empty() && v != MISSING_VALUE)
    }

    fn format_error(&self, message: impl Into<String>) -> ParseError {
        FormatError::new(RESOURCE, self.file.clone(), self.line, message).into()
    }
}

/// Header-indexed tab-separated file
struct TsvTable {
    file: String,
    columns: std::sync::Arc<HashMap<String, usize>>,
    records: csv::ByteRecordsIntoIter<Box<dyn std::io::BufRead + Send>>,
}

impl TsvTable {
    fn open(path: &Path, required: &[&str]) -> Result<Self, ParseError> {
        let file = display_name(path);
        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .has_headers(true)
            .from_reader(open_reader(path)?);

        let headers = reader
            .byte_headers()
            .map_err(|e| FormatError::new(RESOURCE, file.clone(), 1, e.to_string()))?;
        let columns: HashMap<String, usize> = headers
            .iter()
            .enumerate()
            .map(|(i, h)| (String::from_utf8_lossy(h).trim().to_string(), i))
            .collect();

        if let Some(missing) = required.iter().find(|c| !columns.contains_key(**c)) {
            return Err(
                FormatError::new(RESOURCE, file, 1, format!("missing column `{missing}`")).into(),
            );
        }

        Ok(Self {
            file,
            columns: std::sync::Arc::new(columns),
            records: reader.into_byte_records(),
        })
    }
}

impl Iterator for TsvTable {
    type Item = Result<TsvRow, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.records.next()?;
        Some(match item {
            Ok(record) => Ok(TsvRow {
                file: self.file.clone(),
                line: record.position().map(|p| p.line()).unwrap_or(0),
                columns: self.columns.clone(),
                record,
            }),
            Err(e) => {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                if e.is_io_error() {
                    Err(ParseError::Io(std::io::Error::other(e.to_string())))
                } else {
                    Err(FormatError::new(RESOURCE, self.file.clone(), line, e.to_string()).into())
                }
            }
        })
    }
}

fn is_invalid_name(name: &str) -> bool {
    name.is_empty() || name == "NEWENTRY" || PLACEHOLDER_TEXTS.iter().any(|p| name.contains(p))
}

/// Names packed in one `|`-separated column, quotes removed
fn split_names(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split('|')
        .map(|n| n.replace('\'', "").trim().to_string())
        .filter(|n| !is_invalid_name(n))
}

fn parse_gene(row: &TsvRow) -> Result<Option<ParsedRecord>, ParseError> {
    let identifier = row
        .value("GeneID")
        .ok_or_else(|| row.format_error("missing GeneID"))?;
    let symbol = row.get("Symbol").unwrap_or_default();
    if is_invalid_name(&symbol) {
        return Ok(None);
    }

    let mut entity = RawEntity::new(identifier, Category::Gene).with_name(RawName::preferred(&symbol));
    for column in SYNONYM_COLUMNS {
        if let Some(value) = row.value(column) {
            entity
                .names
                .extend(split_names(&value).filter(|n| *n != symbol).map(RawName::synonym));
        }
    }

    if let Some(tax_id) = row.value("#tax_id") {
        entity.cross_references.push(format!("NCBI_TaxID:{tax_id}"));
    }

    entity.attribute = ATTRIBUTE_COLUMNS
        .iter()
        .find_map(|(column, prefix)| row.value(column).map(|v| format!("{prefix}:{v}")));

    Ok(Some(ParsedRecord::Entity(entity)))
}

fn parse_history(row: &TsvRow) -> Result<ParsedRecord, ParseError> {
    let discontinued = row
        .value("Discontinued_GeneID")
        .ok_or_else(|| row.format_error("missing Discontinued_GeneID"))?;
    let current = row.get("GeneID").unwrap_or_default();
    Ok(ParsedRecord::History(HistoryEntry::from_raw(&discontinued, &current)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Write;

    const GENE_INFO: &str = "#tax_id\tGeneID\tSymbol\tLocusTag\tSynonyms\tdbXrefs\tchromosome\tmap_location\tdescription\ttype_of_gene\tSymbol_from_nomenclature_authority\tFull_name_from_nomenclature_authority\tNomenclature_status\tOther_designations\tModification_date\tFeature_type\n\
9606\t672\tBRCA1\t-\tBRCAI|BRCC1|'FANCS'\tMIM:113705\t17\t17q21.31\tBRCA1 DNA repair associated\tprotein-coding\tBRCA1\tBRCA1 DNA repair associated\tO\tbreast cancer type 1 susceptibility protein|NEWENTRY\t20240101\t-\n\
9606\t999\tNEWENTRY\t-\t-\t-\t-\t-\t-\tother\t-\t-\t-\t-\t20240101\t-\n\
9606\t1000\tABC\t-\t-\t-\t-\t-\t-\tother\t-\t-\t-\t-\t20240101\t-\n";

    const GENE_HISTORY: &str = "#tax_id\tGeneID\tDiscontinued_GeneID\tDiscontinued_Symbol\tDiscontinue_Date\n\
9606\t672\t100\tOLD1\t20200101\n\
9606\t-\t101\tOLD2\t20200101\n";

    fn write_gz(dir: &Path, name: &str, content: &str) {
        let file = std::fs::File::create(dir.join(name)).unwrap();
        let mut encoder = GzEncoder::new(file, Compression::default());
        encoder.write_all(content.as_bytes()).unwrap();
        encoder.finish().unwrap();
    }

    #[test]
    fn test_parse_gene_info_and_history() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(dir.path(), "gene_info.gz", GENE_INFO);
        write_gz(dir.path(), "gene_history.gz", GENE_HISTORY);

        let records: Vec<ParsedRecord> = NcbiGeneParser
            .records(dir.path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(records.len(), 4);

        let ParsedRecord::Entity(brca1) = &records[0] else {
            panic!("expected entity");
        };
        assert_eq!(brca1.identifier, "672");
        assert_eq!(brca1.names[0], RawName::preferred("BRCA1"));
        let names: Vec<&str> = brca1.names.iter().map(|n| n.text.as_str()).collect();
        assert!(names.contains(&"FANCS"));
        assert!(names.contains(&"BRCA1 DNA repair associated"));
        assert!(!names.contains(&"NEWENTRY"));
        assert_eq!(brca1.cross_references, vec!["NCBI_TaxID:9606"]);
        assert_eq!(brca1.attribute.as_deref(), Some("loc:17q21.31"));

        let ParsedRecord::Entity(abc) = &records[1] else {
            panic!("expected entity");
        };
        assert_eq!(abc.attribute.as_deref(), Some("type:other"));

        assert_eq!(records[2], ParsedRecord::History(HistoryEntry::replaced("100", "672")));
        assert_eq!(records[3], ParsedRecord::History(HistoryEntry::removed("101")));
    }

    #[test]
    fn test_missing_history_is_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(dir.path(), "gene_info.gz", GENE_INFO);

        let count = NcbiGeneParser.records(dir.path()).unwrap().count();
        assert_eq!(count, 2);
    }

    #[test]
    fn test_missing_column_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_gz(dir.path(), "gene_info.gz", "#tax_id\tSymbol\n9606\tBRCA1\n");

        assert!(matches!(
            NcbiGeneParser.records(dir.path()),
            Err(ParseError::Format(_))
        ));
    }
}
