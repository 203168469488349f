//! NCBI Taxonomy dump (`taxdump.tar.gz`)
//!
//! Reads `names.dmp` for entities and `delnodes.dmp` / `merged.dmp` for
//! history. Fields are separated by `\t|\t`; every line ends with `\t|`.

use std::ffi::OsStr;
use std::io::{BufRead, Cursor, Read};
use std::path::Path;

use flate2::read::GzDecoder;

use super::io::{display_name, find_optional, open_reader, LossyLines};
use super::{KbParser, ParsedRecord, RawEntity, RawName, RecordIter};
use crate::error::{FormatError, ParseError};
use crate::schema::{Category, HistoryEntry};

const RESOURCE: &str = "ncbi_taxonomy";
const ARCHIVE: &str = "taxdump.tar.gz";

/// Name class carrying the canonical name
const CANONICAL_CLASS: &str = "scientific name";

/// Every name class found in `names.dmp`
const NAME_CLASSES: [&str; 14] = [
    "genbank common name",
    "common name",
    "scientific name",
    "equivalent name",
    "synonym",
    "acronym",
    "blast name",
    "genbank",
    "genbank synonym",
    "genbank acronym",
    "includes",
    "type material",
    "authority",
    "in-part",
];

/// Placeholder names of the tree root
const ROOT_NAMES: [&str; 2] = ["all", "root"];

#[derive(Debug, Default, Clone, Copy)]
pub struct NcbiTaxonomyParser;

impl KbParser for NcbiTaxonomyParser {
    fn resource(&self) -> &'static str {
        RESOURCE
    }

    fn records(&self, input: &Path) -> Result<RecordIter, ParseError> {
        let names = LossyLines::new(open_dump(input, "names.dmp")?);
        let delnodes = LossyLines::new(open_dump(input, "delnodes.dmp")?);
        let merged = LossyLines::new(open_dump(input, "merged.dmp")?);

        let entities = names.filter_map(|item| match item {
            Err(e) => Some(Err(ParseError::Io(e))),
            Ok((number, line)) => parse_name(number, &line).transpose(),
        });
        let history = delnodes
            .map(|item| item.map(|l| ("delnodes.dmp", l)))
            .chain(merged.map(|item| item.map(|l| ("merged.dmp", l))))
            .filter_map(|item| match item {
                Err(e) => Some(Err(ParseError::Io(e))),
                Ok((file, (number, line))) => parse_history(file, number, &line).transpose(),
            });

        Ok(Box::new(entities.chain(history)))
    }
}

/// Open an extracted dump file, falling back to reading it from the archive
fn open_dump(input: &Path, name: &str) -> Result<Box<dyn BufRead + Send>, ParseError> {
    if let Some(path) = find_optional(input, name) {
        return Ok(open_reader(&path)?);
    }

    let archive_path = input.join(ARCHIVE);
    if !archive_path.is_file() {
        return Err(ParseError::MissingInput {
            resource: RESOURCE.to_string(),
            path: input.join(name),
        });
    }

    tracing::debug!(archive = %display_name(&archive_path), member = name, "Reading dump from archive");
    let mut archive = tar::Archive::new(GzDecoder::new(std::fs::File::open(&archive_path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.file_name() == Some(OsStr::new(name)) {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(Box::new(Cursor::new(content)));
        }
    }

    Err(ParseError::MissingInput {
        resource: RESOURCE.to_string(),
        path: archive_path.join(name),
    })
}

/// Split a `.dmp` line into trimmed fields, dropping the trailing terminator
fn dmp_fields(line: &str) -> Vec<&str> {
    let line = line.trim_end().trim_end_matches('|');
    line.split('|').map(str::trim).collect()
}

fn parse_name(number: u64, line: &str) -> Result<Option<ParsedRecord>, ParseError> {
    if line.trim().is_empty() {
        return Ok(None);
    }
    let fields = dmp_fields(line);
    if fields.len() < 4 || fields[0].is_empty() {
        return Err(FormatError::new(
            RESOURCE,
            "names.dmp",
            number,
            format!("expected 4 fields, found {}", fields.len()),
        )
        .into());
    }

    let (identifier, name, unique_name, class) = (fields[0], fields[1], fields[2], fields[3]);
    let name = if unique_name.is_empty() { name } else { unique_name };

    if ROOT_NAMES.contains(&name) {
        return Ok(None);
    }
    if !NAME_CLASSES.contains(&class) {
        return Err(FormatError::new(
            RESOURCE,
            "names.dmp",
            number,
            format!("unknown name class `{class}`"),
        )
        .into());
    }

    let raw_name = if class == CANONICAL_CLASS {
        RawName::preferred(name)
    } else {
        RawName::synonym(name)
    };
    Ok(Some(ParsedRecord::Entity(
        RawEntity::new(identifier, Category::Species).with_name(raw_name),
    )))
}

fn parse_history(file: &str, number: u64, line: &str) -> Result<Option<ParsedRecord>, ParseError> {
    let fields: Vec<&str> = dmp_fields(line).into_iter().filter(|f| !f.is_empty()).collect();
    match fields.as_slice() {
        [] => Ok(None),
        [old] => Ok(Some(ParsedRecord::History(HistoryEntry::removed(*old)))),
        [old, new] => Ok(Some(ParsedRecord::History(HistoryEntry::replaced(*old, *new)))),
        _ => Err(FormatError::new(
            RESOURCE,
            file,
            number,
            format!("expected 1 or 2 fields, found {}", fields.len()),
        )
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;

    const NAMES: &str = "1\t|\troot\t|\t\t|\tscientific name\t|\n\
9606\t|\tHomo sapiens\t|\t\t|\tscientific name\t|\n\
9606\t|\thuman\t|\t\t|\tgenbank common name\t|\n\
9606\t|\tHomo sapiens Linnaeus, 1758\t|\t\t|\tauthority\t|\n\
10090\t|\tMus\t|\tMus <mouse, genus>\t|\tscientific name\t|\n";

    fn build_archive(dir: &Path, names: &str) {
        let file = std::fs::File::create(dir.join(ARCHIVE)).unwrap();
        let mut builder = tar::Builder::new(GzEncoder::new(file, Compression::default()));
        for (name, content) in [
            ("names.dmp", names),
            ("delnodes.dmp", "3\t|\n"),
            ("merged.dmp", "12\t|\t74109\t|\n"),
        ] {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, content.as_bytes()).unwrap();
        }
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn test_parse_from_archive() {
        let dir = tempfile::tempdir().unwrap();
        build_archive(dir.path(), NAMES);

        let records: Vec<ParsedRecord> = NcbiTaxonomyParser
            .records(dir.path())
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();

        assert_eq!(records.len(), 6);
        assert_eq!(
            records[0],
            ParsedRecord::Entity(
                RawEntity::new("9606", Category::Species)
                    .with_name(RawName::preferred("Homo sapiens"))
            )
        );
        // unique name wins over the plain name
        assert_eq!(
            records[3],
            ParsedRecord::Entity(
                RawEntity::new("10090", Category::Species)
                    .with_name(RawName::preferred("Mus <mouse, genus>"))
            )
        );
        assert_eq!(records[4], ParsedRecord::History(HistoryEntry::removed("3")));
        assert_eq!(
            records[5],
            ParsedRecord::History(HistoryEntry::replaced("12", "74109"))
        );
    }

    #[test]
    fn test_unknown_class_is_format_error() {
        let result = parse_name(7, "9606\t|\tHomo\t|\t\t|\tnickname\t|");
        assert!(matches!(result, Err(ParseError::Format(e)) if e.line == 7));
    }
}
