//! Source fetcher
//!
//! Mirrors the raw files of a resource into `raw/{kbs|corpora}/{name}/`.
//! Files already present are kept unless `overwrite` is set. Downloads are
//! streamed into a temporary file in the destination directory and renamed
//! into place, so an interrupted download never leaves a partial file under
//! the final name.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use flate2::read::MultiGzDecoder;
use reqwest::{Client, StatusCode};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::time::sleep;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::FetchConfig;
use crate::error::FetchError;
use crate::resources::Resource;

/// Marker left next to an archive once it has been unpacked
const EXTRACTED_SUFFIX: &str = ".extracted";

/// Offset of the `ustar` magic in a tar header
const TAR_MAGIC_OFFSET: usize = 257;

/// One raw file of a resource
#[derive(Debug, Clone, Serialize)]
pub struct FetchedFile {
    pub name: String,
    pub path: PathBuf,
    pub sha256: String,
    /// False when the file was already present
    pub downloaded: bool,
}

/// Result of mirroring one resource
#[derive(Debug, Clone, Serialize)]
pub struct FetchReport {
    pub resource: String,
    pub dir: PathBuf,
    pub files: Vec<FetchedFile>,
}

/// HTTP mirror with bounded retries
pub struct Fetcher {
    client: Client,
    config: FetchConfig,
}

impl Fetcher {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Download every file of `resource` into `dest`, then unpack archives
    /// if the resource asks for it
    pub async fn fetch(
        &self,
        resource: &Resource,
        dest: &Path,
        overwrite: bool,
    ) -> Result<FetchReport, FetchError> {
        let Some(base_url) = resource.base_url else {
            return Err(FetchError::LocalOnly {
                resource: resource.name.to_string(),
                hint: resource.hint.to_string(),
            });
        };
        let base = Url::parse(base_url).map_err(|e| FetchError::InvalidUrl {
            url: base_url.to_string(),
            message: e.to_string(),
        })?;
        std::fs::create_dir_all(dest)?;

        let mut files = Vec::with_capacity(resource.files.len());
        for name in resource.files {
            let path = dest.join(name);
            let downloaded = if path.exists() && !overwrite {
                debug!(resource = resource.name, file = %name, "Already present, skipping");
                false
            } else {
                let url = base.join(name).map_err(|e| FetchError::InvalidUrl {
                    url: format!("{base_url}{name}"),
                    message: e.to_string(),
                })?;
                self.download_with_retry(&url, &path).await?;
                true
            };
            let (archive, dir) = (path.clone(), dest.to_path_buf());
            let (unpack, force) = (resource.extract, overwrite || downloaded);
            let sha256 = blocking(move || {
                let sha256 = sha256_file(&archive)?;
                if unpack {
                    extract(&archive, &dir, force)?;
                }
                Ok(sha256)
            })
            .await?;
            files.push(FetchedFile {
                name: name.to_string(),
                path,
                sha256,
                downloaded,
            });
        }

        info!(
            resource = resource.name,
            files = files.len(),
            downloaded = files.iter().filter(|f| f.downloaded).count(),
            "Raw files ready"
        );
        Ok(FetchReport {
            resource: resource.name.to_string(),
            dir: dest.to_path_buf(),
            files,
        })
    }

    async fn download_with_retry(&self, url: &Url, path: &Path) -> Result<(), FetchError> {
        let attempts = self.config.max_retries + 1;
        let mut delay = Duration::from_millis(self.config.backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.download(url, path).await {
                Ok(bytes) => {
                    info!(url = %url, bytes, "Downloaded");
                    return Ok(());
                }
                // client errors will not go away on retry
                Err(FetchError::Status { url, status }) if (400..500).contains(&status) => {
                    return Err(FetchError::Status { url, status });
                }
                Err(e) => {
                    last_error = e.to_string();
                    if attempt < attempts {
                        warn!(url = %url, attempt, error = %e, "Download failed, retrying in {:?}", delay);
                        sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        Err(FetchError::Exhausted {
            url: url.to_string(),
            attempts,
            message: last_error,
        })
    }

    /// Single attempt: stream the body into a temp file, then rename
    async fn download(&self, url: &Url, path: &Path) -> Result<u64, FetchError> {
        let mut response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| FetchError::Client(e.to_string()))?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| FetchError::Client(e.to_string()))?
        {
            tmp.write_all(&chunk)?;
            written += chunk.len() as u64;
        }
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| FetchError::Io(e.error))?;
        Ok(written)
    }
}

/// Check a user-supplied directory for a local-only resource
pub fn locate_local(resource: &Resource, dir: Option<&Path>) -> Result<PathBuf, FetchError> {
    let Some(dir) = dir else {
        return Err(FetchError::LocalOnly {
            resource: resource.name.to_string(),
            hint: resource.hint.to_string(),
        });
    };
    if !dir.is_dir() {
        return Err(FetchError::Io(io::Error::new(
            io::ErrorKind::NotFound,
            format!("{} is not a directory", dir.display()),
        )));
    }
    Ok(dir.to_path_buf())
}

/// Run file work on the blocking pool
async fn blocking<T, F>(f: F) -> Result<T, FetchError>
where
    F: FnOnce() -> Result<T, FetchError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| FetchError::Task(e.to_string()))?
}

/// [`sha256_file`] off the async worker threads
pub async fn sha256_file_async(path: PathBuf) -> Result<String, FetchError> {
    blocking(move || sha256_file(&path)).await
}

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String, FetchError> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

// ============================================================================
// Archive extraction
// ============================================================================

/// Unpack `archive` into `dest`.
///
/// `.zip` and `.tar.gz`/`.tgz` are unpacked as-is; a plain `.gz` is
/// decompressed next to the archive, or untarred if its payload is a tar.
/// Anything else is left alone. A `{archive}.extracted` marker makes the
/// call a no-op until `force` is set.
pub fn extract(archive: &Path, dest: &Path, force: bool) -> Result<bool, FetchError> {
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let marker = dest.join(format!("{name}{EXTRACTED_SUFFIX}"));
    if marker.exists() && !force {
        return Ok(false);
    }

    let failed = |message: String| FetchError::Extract {
        path: archive.to_path_buf(),
        message,
    };

    if name.ends_with(".zip") {
        let file = File::open(archive)?;
        let mut zip = zip::ZipArchive::new(file).map_err(|e| failed(e.to_string()))?;
        zip.extract(dest).map_err(|e| failed(e.to_string()))?;
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        untar(MultiGzDecoder::new(File::open(archive)?), dest).map_err(|e| failed(e.to_string()))?;
    } else if let Some(stem) = name.strip_suffix(".gz") {
        if gz_holds_tar(archive)? {
            untar(MultiGzDecoder::new(File::open(archive)?), dest)
                .map_err(|e| failed(e.to_string()))?;
        } else {
            let mut decoder = MultiGzDecoder::new(File::open(archive)?);
            let mut tmp = tempfile::NamedTempFile::new_in(dest)?;
            io::copy(&mut decoder, &mut tmp).map_err(|e| failed(e.to_string()))?;
            tmp.persist(dest.join(stem)).map_err(|e| FetchError::Io(e.error))?;
        }
    } else {
        return Ok(false);
    }

    File::create(&marker)?;
    debug!(archive = %archive.display(), "Extracted");
    Ok(true)
}

fn untar<R: Read>(reader: R, dest: &Path) -> io::Result<()> {
    tar::Archive::new(reader).unpack(dest)
}

/// Peek at the decompressed header for the `ustar` magic
fn gz_holds_tar(archive: &Path) -> Result<bool, FetchError> {
    let mut header = Vec::with_capacity(TAR_MAGIC_OFFSET + 5);
    MultiGzDecoder::new(File::open(archive)?)
        .take((TAR_MAGIC_OFFSET + 5) as u64)
        .read_to_end(&mut header)
        .map_err(|e| FetchError::Extract {
            path: archive.to_path_buf(),
            message: e.to_string(),
        })?;
    Ok(header.get(TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5) == Some(b"ustar".as_slice()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{self, ResourceKind};
    use flate2::write::GzEncoder;
    use flate2::Compression;

    fn gzip(path: &Path, content: &[u8]) {
        let mut encoder = GzEncoder::new(File::create(path).unwrap(), Compression::default());
        encoder.write_all(content).unwrap();
        encoder.finish().unwrap();
    }

    fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[test]
    fn test_extract_plain_gz() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("gene_info.gz");
        gzip(&archive, b"#tax_id\tGeneID\n");

        assert!(extract(&archive, dir.path(), false).unwrap());
        assert_eq!(
            std::fs::read(dir.path().join("gene_info")).unwrap(),
            b"#tax_id\tGeneID\n"
        );
        // marker makes the second call a no-op
        assert!(!extract(&archive, dir.path(), false).unwrap());
    }

    #[test]
    fn test_extract_gz_holding_tar() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("corpus.BioC.xml.gz");
        gzip(&archive, &tar_bytes(&[("train.BioC.xml", b"<collection/>")]));

        assert!(extract(&archive, dir.path(), false).unwrap());
        assert!(dir.path().join("train.BioC.xml").exists());
        assert!(!dir.path().join("corpus.BioC.xml").exists());
    }

    #[test]
    fn test_extract_zip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("corpus.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
            zip.start_file("NCBItestset_corpus.txt", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"1|t|Title\n").unwrap();
            zip.finish().unwrap();
        }
        assert!(extract(&archive, dir.path(), false).unwrap());
        assert!(dir.path().join("NCBItestset_corpus.txt").exists());
    }

    #[test]
    fn test_sha256_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        File::create(&path).unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[tokio::test]
    async fn test_present_archive_is_hashed_and_extracted() {
        let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
        let gnormplus = resources::get("gnormplus", ResourceKind::Corpus).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("GNormPlusCorpus.zip");
        {
            let mut zip = zip::ZipWriter::new(File::create(&archive).unwrap());
            zip.start_file("GNormPlusCorpus/BC2GNtest.PubTator.txt", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"1|t|Title\n").unwrap();
            zip.finish().unwrap();
        }

        let report = fetcher.fetch(gnormplus, dir.path(), false).await.unwrap();
        assert_eq!(report.files[0].sha256, sha256_file(&archive).unwrap());
        assert_eq!(sha256_file_async(archive).await.unwrap(), report.files[0].sha256);
        assert!(dir.path().join("GNormPlusCorpus/BC2GNtest.PubTator.txt").exists());
    }

    #[test]
    fn test_local_resource_needs_directory() {
        let umls = resources::get("umls", ResourceKind::Kb).unwrap();
        assert!(matches!(
            locate_local(umls, None),
            Err(FetchError::LocalOnly { .. })
        ));
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(locate_local(umls, Some(dir.path())).unwrap(), dir.path());
    }

    #[tokio::test]
    async fn test_fetch_refuses_local_only() {
        let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
        let dbsnp = resources::get("dbsnp", ResourceKind::Kb).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            fetcher.fetch(dbsnp, dir.path(), false).await,
            Err(FetchError::LocalOnly { .. })
        ));
    }

    #[tokio::test]
    async fn test_present_files_are_not_downloaded() {
        let fetcher = Fetcher::new(FetchConfig::default()).unwrap();
        let cellosaurus = resources::get("cellosaurus", ResourceKind::Kb).unwrap();
        let dir = tempfile::tempdir().unwrap();
        for name in cellosaurus.files {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let report = fetcher.fetch(cellosaurus, dir.path(), false).await.unwrap();
        assert_eq!(report.files.len(), 2);
        assert!(report.files.iter().all(|f| !f.downloaded));
    }
}
