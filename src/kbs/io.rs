//! Raw file access shared by the KB parsers
//!
//! Compression is picked from the file extension (`.gz`, `.bz2`, plain).
//! Lines are decoded lossily so a stray Latin-1 byte never aborts a parse.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use bzip2::read::MultiBzDecoder;
use flate2::read::MultiGzDecoder;

use crate::error::ParseError;

/// Open a raw file, transparently decompressing it
pub fn open_reader(path: &Path) -> io::Result<Box<dyn BufRead + Send>> {
    let file = File::open(path)?;
    let reader: Box<dyn Read + Send> = match path.extension().and_then(|e| e.to_str()) {
        Some("gz") => Box::new(MultiGzDecoder::new(file)),
        Some("bz2") => Box::new(MultiBzDecoder::new(file)),
        _ => Box::new(file),
    };
    Ok(Box::new(BufReader::with_capacity(1 << 16, reader)))
}

/// Find `name` in `dir`, also accepting a `.gz` or `.bz2` variant
pub fn find_input(resource: &str, dir: &Path, name: &str) -> Result<PathBuf, ParseError> {
    let candidates = [
        dir.join(name),
        dir.join(format!("{name}.gz")),
        dir.join(format!("{name}.bz2")),
    ];
    if let Some(stem) = name.strip_suffix(".gz") {
        // extracted copy of a downloaded archive
        let plain = dir.join(stem);
        if plain.is_file() {
            return Ok(plain);
        }
    }
    candidates
        .into_iter()
        .find(|p| p.is_file())
        .ok_or_else(|| ParseError::MissingInput {
            resource: resource.to_string(),
            path: dir.join(name),
        })
}

/// Like [`find_input`] but a missing file is not an error
pub fn find_optional(dir: &Path, name: &str) -> Option<PathBuf> {
    find_input("", dir, name).ok()
}

/// Line iterator yielding `(line_number, text)` with lossy UTF-8 decoding.
///
/// Line numbers start at 1. Trailing `\n` / `\r\n` are stripped.
pub struct LossyLines {
    reader: Box<dyn BufRead + Send>,
    buf: Vec<u8>,
    line: u64,
    done: bool,
}

impl LossyLines {
    pub fn new(reader: Box<dyn BufRead + Send>) -> Self {
        Self {
            reader,
            buf: Vec::with_capacity(1024),
            line: 0,
            done: false,
        }
    }

    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self::new(open_reader(path)?))
    }
}

impl Iterator for LossyLines {
    type Item = io::Result<(u64, String)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        self.buf.clear();
        match self.reader.read_until(b'\n', &mut self.buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(_) => {
                self.line += 1;
                while matches!(self.buf.last(), Some(b'\n') | Some(b'\r')) {
                    self.buf.pop();
                }
                Some(Ok((self.line, String::from_utf8_lossy(&self.buf).into_owned())))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// File name for error messages
pub fn display_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
