//! dbSNP JSON dumps
//!
//! One JSON document per line, chunked per chromosome
//! (`refsnp-chr{1..22,X,Y,MT}.json.bz2`). History comes from
//! `refsnp-merged`, `refsnp-unsupported` and `refsnp-withdrawn`, all optional.

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use regex::Regex;
use serde::Deserialize;

use super::io::{display_name, LossyLines};
use super::{KbParser, ParsedRecord, RawEntity, RawName, RecordIter};
use crate::error::{FormatError, ParseError};
use crate::schema::{Category, HistoryEntry};

const RESOURCE: &str = "dbsnp";

/// RefSeq prefixes of automatically derived (model) sequences
const SKIPPED_REFSEQ: [&str; 5] = ["XM_", "XR_", "XP_", "GPC_", "YP_"];

const MAX_NAME_LEN: usize = 255;

const CHROMOSOMES: [&str; 25] = [
    "1", "2", "3", "4", "5", "6", "7", "8", "9", "10", "11", "12", "13", "14", "15", "16", "17",
    "18", "19", "20", "21", "22", "X", "Y", "MT",
];

// ─── JSON model ─────────────────────────────────────────────────────────────

/// Identifier serialized either as a number or as a string
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
enum JsonId {
    Number(u64),
    Text(String),
}

impl fmt::Display for JsonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonId::Number(n) => write!(f, "{n}"),
            JsonId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RefSnp {
    refsnp_id: JsonId,
    #[serde(default)]
    citations: Vec<JsonId>,
    #[serde(default)]
    primary_snapshot_data: Option<PrimarySnapshot>,
    #[serde(default)]
    merged_snapshot_data: Option<MergedSnapshot>,
    #[serde(default)]
    dbsnp1_merges: Vec<Dbsnp1Merge>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PrimarySnapshot {
    placements_with_allele: Vec<Placement>,
    allele_annotations: Vec<AlleleAnnotation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Placement {
    alleles: Vec<PlacedAllele>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct PlacedAllele {
    allele: AlleleDetail,
    hgvs: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlleleDetail {
    spdi: Option<Spdi>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Spdi {
    deleted_sequence: String,
    inserted_sequence: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AlleleAnnotation {
    assembly_annotation: Vec<AssemblyAnnotation>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct AssemblyAnnotation {
    genes: Vec<GeneRef>,
}

#[derive(Debug, Deserialize)]
struct GeneRef {
    id: JsonId,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct MergedSnapshot {
    merged_into: Vec<JsonId>,
}

#[derive(Debug, Deserialize)]
struct Dbsnp1Merge {
    merged_rsid: JsonId,
}

// ─── Parser ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Clone, Copy)]
pub struct DbsnpParser;

impl KbParser for DbsnpParser {
    fn resource(&self) -> &'static str {
        RESOURCE
    }

    fn records(&self, input: &Path) -> Result<RecordIter, ParseError> {
        let chunks = chromosome_files(input)?;
        tracing::info!(resource = RESOURCE, files = chunks.len(), "Found dbSNP chunks");

        let entities = json_lines(chunks).map(|item| {
            let (file, number, line) = item?;
            parse_refsnp(&file, number, &line).map(ParsedRecord::Entity)
        });

        let mut history_files = Vec::new();
        for stem in ["refsnp-merged", "refsnp-unsupported", "refsnp-withdrawn"] {
            match find_chunk(input, stem) {
                Some(path) => history_files.push(path),
                None => tracing::warn!(resource = RESOURCE, file = stem, "History file not found"),
            }
        }
        let history = json_lines(history_files).flat_map(|item| {
            let records: Vec<Result<ParsedRecord, ParseError>> = match item {
                Ok((file, number, line)) => match parse_history(&file, number, &line) {
                    Ok(entries) => entries.into_iter().map(|e| Ok(ParsedRecord::History(e))).collect(),
                    Err(e) => vec![Err(e)],
                },
                Err(e) => vec![Err(e)],
            };
            records
        });

        Ok(Box::new(entities.chain(history)))
    }
}

fn chunk_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^refsnp-chr([0-9]{1,2}|X|Y|MT)\.json(\.gz|\.bz2)?$").expect("valid regex")
    })
}

/// Chromosome chunks present in `input`, in chromosome order
fn chromosome_files(input: &Path) -> Result<Vec<PathBuf>, ParseError> {
    let mut found: Vec<(usize, PathBuf)> = Vec::new();
    for entry in std::fs::read_dir(input)? {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if let Some(captures) = chunk_pattern().captures(name) {
            if let Some(rank) = CHROMOSOMES.iter().position(|c| *c == &captures[1]) {
                found.push((rank, path));
            }
        }
    }
    if found.is_empty() {
        return Err(ParseError::MissingInput {
            resource: RESOURCE.to_string(),
            path: input.join("refsnp-chr*.json.bz2"),
        });
    }
    found.sort();
    Ok(found.into_iter().map(|(_, p)| p).collect())
}

fn find_chunk(input: &Path, stem: &str) -> Option<PathBuf> {
    ["json.bz2", "json.gz", "json"]
        .iter()
        .map(|ext| input.join(format!("{stem}.{ext}")))
        .find(|p| p.is_file())
}

/// Lines of several files in sequence, each opened on demand
fn json_lines(
    files: Vec<PathBuf>,
) -> impl Iterator<Item = Result<(String, u64, String), ParseError>> + Send {
    files.into_iter().flat_map(|path| {
        let file = display_name(&path);
        tracing::info!(resource = RESOURCE, file = %file, "Parsing file");
        let lines: Box<dyn Iterator<Item = Result<(String, u64, String), ParseError>> + Send> =
            match LossyLines::open(&path) {
                Ok(lines) => Box::new(lines.filter_map(move |item| match item {
                    Ok((_, line)) if line.trim().is_empty() => None,
                    Ok((number, line)) => Some(Ok((file.clone(), number, line))),
                    Err(e) => Some(Err(ParseError::Io(e))),
                })),
                Err(e) => Box::new(std::iter::once(Err(ParseError::Io(e)))),
            };
        lines
    })
}

fn decode(file: &str, number: u64, line: &str) -> Result<RefSnp, ParseError> {
    serde_json::from_str(line)
        .map_err(|e| FormatError::new(RESOURCE, file, number, format!("invalid JSON: {e}")).into())
}

/// HGVS names of placements whose alleles actually change the sequence
fn hgvs_names(rsid: &str, snapshot: &PrimarySnapshot) -> BTreeSet<String> {
    let mut names = BTreeSet::new();
    for allele in snapshot.placements_with_allele.iter().flat_map(|p| &p.alleles) {
        let changed = match &allele.allele.spdi {
            Some(spdi) => spdi.deleted_sequence != spdi.inserted_sequence,
            None => true,
        };
        let Some(hgvs) = allele.hgvs.as_deref().filter(|h| changed && *h != "not_yet_implemented")
        else {
            continue;
        };

        let parts: Vec<&str> = hgvs.split(':').collect();
        let [refseq, name] = parts.as_slice() else {
            tracing::warn!(resource = RESOURCE, rsid, hgvs, "Cannot split HGVS into sequence and name");
            continue;
        };
        if SKIPPED_REFSEQ.iter().any(|p| refseq.starts_with(p)) {
            continue;
        }
        names.insert(name.to_string());
    }

    let short: BTreeSet<String> = names.iter().filter(|n| n.len() <= MAX_NAME_LEN).cloned().collect();
    if short.is_empty() {
        names
    } else {
        short
    }
}

fn parse_refsnp(file: &str, number: u64, line: &str) -> Result<RawEntity, ParseError> {
    let snp = decode(file, number, line)?;
    let rsid = snp.refsnp_id.to_string();
    let snapshot = snp.primary_snapshot_data.unwrap_or_default();

    let mut entity = RawEntity::new(&rsid, Category::Variant)
        .with_name(RawName::preferred(format!("rs{rsid}")));
    entity
        .names
        .extend(hgvs_names(&rsid, &snapshot).into_iter().map(RawName::synonym));

    let genes: BTreeSet<String> = snapshot
        .allele_annotations
        .iter()
        .flat_map(|a| &a.assembly_annotation)
        .flat_map(|a| &a.genes)
        .map(|g| format!("NCBIGene:{}", g.id))
        .collect();
    entity.cross_references = genes.into_iter().collect();
    entity.citations = snp.citations.iter().map(|c| c.to_string()).collect();

    Ok(entity)
}

fn parse_history(file: &str, number: u64, line: &str) -> Result<Vec<HistoryEntry>, ParseError> {
    let snp = decode(file, number, line)?;
    let target = snp
        .merged_snapshot_data
        .as_ref()
        .and_then(|m| m.merged_into.first())
        .map(|id| id.to_string());

    let entry = |from: String| match &target {
        Some(to) => HistoryEntry::replaced(from, to.clone()),
        None => HistoryEntry::removed(from),
    };

    let mut entries = vec![entry(snp.refsnp_id.to_string())];
    entries.extend(snp.dbsnp1_merges.iter().map(|m| entry(m.merged_rsid.to_string())));
    Ok(entries)
}
