//! Knowledge base format parsers
//!
//! One [`KbParser`] per resource turns the raw directory into a lazy stream
//! of [`ParsedRecord`]s. Streams are restartable (call `records` again) and
//! deterministic for identical input.
//!
//! ```text
//! raw/kbs/{name}/ ──► KbParser::records ──► MalformedGuard ──► Normalizer
//!                     (Entity | History)    (skip + threshold)
//! ```

pub mod cellosaurus;
pub mod ctd;
pub mod dbsnp;
pub mod io;
pub mod ncbi_gene;
pub mod ncbi_taxonomy;
pub mod umls;

use std::path::Path;

use crate::config::ParserConfig;
use crate::error::{BelbError, ParseError};
use crate::schema::{Category, HistoryEntry};

pub use cellosaurus::CellosaurusParser;
pub use ctd::{CtdChemicalsParser, CtdDiseasesParser};
pub use dbsnp::DbsnpParser;
pub use ncbi_gene::NcbiGeneParser;
pub use ncbi_taxonomy::NcbiTaxonomyParser;
pub use umls::UmlsParser;

/// A name as found in the raw data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawName {
    pub text: String,
    /// The source marks this name as canonical
    pub preferred: bool,
}

impl RawName {
    pub fn preferred(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            preferred: true,
        }
    }

    pub fn synonym(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            preferred: false,
        }
    }
}

/// Intermediate entity record, before merging and validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntity {
    pub identifier: String,
    pub category: Category,
    pub names: Vec<RawName>,
    pub cross_references: Vec<String>,
    /// Secondary identifiers pointing at `identifier`
    pub aliases: Vec<String>,
    /// PubMed ids
    pub citations: Vec<String>,
    pub attribute: Option<String>,
}

impl RawEntity {
    pub fn new(identifier: impl Into<String>, category: Category) -> Self {
        Self {
            identifier: identifier.into(),
            category,
            names: Vec::new(),
            cross_references: Vec::new(),
            aliases: Vec::new(),
            citations: Vec::new(),
            attribute: None,
        }
    }

    pub fn with_name(mut self, name: RawName) -> Self {
        self.names.push(name);
        self
    }
}

/// One item of a parsed resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedRecord {
    Entity(RawEntity),
    History(HistoryEntry),
}

/// Boxed lazy record stream
pub type RecordIter = Box<dyn Iterator<Item = Result<ParsedRecord, ParseError>> + Send>;

/// Reads one resource's native format
pub trait KbParser: Send + Sync {
    /// Resource name, as registered
    fn resource(&self) -> &'static str;

    /// Open the raw directory and stream its records.
    ///
    /// A structurally broken record is yielded as `Err(ParseError::Format)`;
    /// any other error is fatal.
    fn records(&self, input: &Path) -> Result<RecordIter, ParseError>;
}

/// Parser registered for a KB resource
pub fn parser_for(name: &str) -> Result<Box<dyn KbParser>, BelbError> {
    let parser: Box<dyn KbParser> = match name {
        "ctd_diseases" => Box::new(CtdDiseasesParser),
        "ctd_chemicals" => Box::new(CtdChemicalsParser),
        "ncbi_taxonomy" => Box::new(NcbiTaxonomyParser),
        "ncbi_gene" => Box::new(NcbiGeneParser),
        "cellosaurus" => Box::new(CellosaurusParser),
        "umls" => Box::new(UmlsParser),
        "dbsnp" => Box::new(DbsnpParser),
        _ => {
            return Err(BelbError::UnknownResource {
                name: name.to_string(),
                available: crate::resources::names(crate::resources::ResourceKind::Kb).join(", "),
            })
        }
    };
    Ok(parser)
}

// ─── Malformed record policy ────────────────────────────────────────────────

/// Skips malformed records and fails once too many have been seen.
///
/// The fraction is checked after `min_records` records and again at end of
/// input. The stream is fused after the first fatal error.
pub struct MalformedGuard {
    inner: RecordIter,
    resource: String,
    threshold: f64,
    min_records: usize,
    seen: usize,
    malformed: usize,
    finished: bool,
}

impl MalformedGuard {
    pub fn new(inner: RecordIter, resource: impl Into<String>, config: &ParserConfig) -> Self {
        Self {
            inner,
            resource: resource.into(),
            threshold: config.malformed_threshold,
            min_records: config.min_records_for_threshold,
            seen: 0,
            malformed: 0,
            finished: false,
        }
    }

    pub fn seen(&self) -> usize {
        self.seen
    }

    pub fn malformed(&self) -> usize {
        self.malformed
    }

    fn over_threshold(&self) -> bool {
        self.seen > 0 && (self.malformed as f64 / self.seen as f64) > self.threshold
    }

    fn fail(&mut self) -> ParseError {
        self.finished = true;
        ParseError::TooManyMalformed {
            resource: self.resource.clone(),
            malformed: self.malformed,
            seen: self.seen,
            threshold: self.threshold,
        }
    }
}

impl Iterator for MalformedGuard {
    type Item = Result<ParsedRecord, ParseError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        loop {
            match self.inner.next() {
                Some(Ok(record)) => {
                    self.seen += 1;
                    if self.seen >= self.min_records && self.over_threshold() {
                        return Some(Err(self.fail()));
                    }
                    return Some(Ok(record));
                }
                Some(Err(ParseError::Format(e))) => {
                    self.seen += 1;
                    self.malformed += 1;
                    tracing::warn!(
                        resource = %self.resource,
                        file = %e.file,
                        line = e.line,
                        "Skipping malformed record: {}",
                        e.message
                    );
                    if self.seen >= self.min_records && self.over_threshold() {
                        return Some(Err(self.fail()));
                    }
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Some(Err(e));
                }
                None => {
                    self.finished = true;
                    if self.over_threshold() {
                        return Some(Err(self.fail()));
                    }
                    if self.malformed > 0 {
                        tracing::info!(
                            resource = %self.resource,
                            malformed = self.malformed,
                            seen = self.seen,
                            "Parsed with skipped records"
                        );
                    }
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FormatError;

    fn stream(pattern: &str) -> RecordIter {
        let items: Vec<Result<ParsedRecord, ParseError>> = pattern
            .chars()
            .enumerate()
            .map(|(i, c)| match c {
                'o' => Ok(ParsedRecord::History(HistoryEntry::removed(i.to_string()))),
                'x' => Err(FormatError::new("test", "f", i as u64, "bad").into()),
                _ => Err(ParseError::Io(std::io::Error::other("boom"))),
            })
            .collect();
        Box::new(items.into_iter())
    }

    fn config(threshold: f64, min_records: usize) -> ParserConfig {
        ParserConfig {
            malformed_threshold: threshold,
            min_records_for_threshold: min_records,
        }
    }

    #[test]
    fn test_skips_below_threshold() {
        let guard = MalformedGuard::new(stream("ooooxooooo"), "test", &config(0.2, 5));
        let results: Vec<_> = guard.collect();
        assert_eq!(results.len(), 9);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[test]
    fn test_fails_at_end_of_short_input() {
        let guard = MalformedGuard::new(stream("oxx"), "test", &config(0.1, 100));
        let results: Vec<_> = guard.collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(
            results.last(),
            Some(Err(ParseError::TooManyMalformed {
                malformed: 2,
                seen: 3,
                ..
            }))
        ));
    }

    #[test]
    fn test_fails_mid_stream_and_fuses() {
        let guard = MalformedGuard::new(stream("xxxxooooooooo"), "test", &config(0.1, 4));
        let results: Vec<_> = guard.collect();
        assert_eq!(results.len(), 1);
        assert!(results[0].is_err());
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let guard = MalformedGuard::new(stream("o!oo"), "test", &config(0.5, 1));
        let results: Vec<_> = guard.collect();
        assert_eq!(results.len(), 2);
        assert!(matches!(results[1], Err(ParseError::Io(_))));
    }

    #[test]
    fn test_parser_for_unknown() {
        assert!(parser_for("ncbi_gene").is_ok());
        assert!(parser_for("hgnc").is_err());
    }
}
