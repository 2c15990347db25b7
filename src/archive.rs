//! Validated extraction of deployment archives
//!
//! Uploads arrive as a sequential tar stream. Every regular-file entry must
//! be listed in the deployment manifest with the same size and a safe
//! relative path. Entries are streamed to storage one at a time, without
//! buffering whole files, under `<prefix><path>`.

use anyhow::anyhow;
use futures::stream;
use hyper::body::Bytes;
use std::collections::{HashMap, HashSet};
use std::io::{self, Read};
use std::sync::Arc;
use tar::EntryType;
use tokio::io::AsyncRead;
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio_util::io::SyncIoBridge;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{Error, Result};
use crate::models::FileEntry;
use crate::storage::{ByteStream, ObjectStorage};

/// Size of the chunks forwarded to storage
const CHUNK_SIZE: usize = 64 * 1024;

/// Chunks buffered between the archive reader and a storage upload
const CHANNEL_DEPTH: usize = 4;

/// Archive content that does not match the deployment
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ArchiveError {
    #[error("file '{0}' is not in the deployment manifest")]
    UnexpectedFile(String),
    #[error("invalid file path '{0}'")]
    InvalidPath(String),
    #[error("duplicate file '{0}' in archive")]
    DuplicateFile(String),
    #[error("unsupported entry type for '{0}'")]
    UnsupportedEntry(String),
    #[error("file '{path}' has {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
    #[error("file '{0}' is missing from archive")]
    MissingFile(String),
}

/// A relative path made only of normal components
pub fn is_safe_path(path: &str) -> bool {
    !path.is_empty()
        && !path.contains('\\')
        && !path.contains('\0')
        && path
            .split('/')
            .all(|part| !part.is_empty() && part != "." && part != "..")
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub bytes: u64,
}

/// Extract `reader` into storage, validating against `files`.
///
/// Dropping the returned future stops extraction at the next chunk.
pub async fn extract_files<R>(
    reader: R,
    files: &[FileEntry],
    prefix: &str,
    storage: Arc<dyn ObjectStorage>,
) -> Result<ExtractSummary>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let extractor = Extractor {
        manifest: files.iter().map(|f| (f.path.clone(), f.size)).collect(),
        prefix: prefix.to_string(),
        storage,
        handle: Handle::current(),
        cancel: CancellationToken::new(),
    };
    let _cancel_on_drop = extractor.cancel.clone().drop_guard();
    let reader = SyncIoBridge::new(reader);

    tokio::task::spawn_blocking(move || extractor.run(reader))
        .await
        .map_err(|e| Error::Internal(anyhow!("archive extraction task failed: {e}")))?
}

struct Extractor {
    manifest: HashMap<String, u64>,
    prefix: String,
    storage: Arc<dyn ObjectStorage>,
    handle: Handle,
    cancel: CancellationToken,
}

fn read_error(err: io::Error) -> Error {
    Error::Internal(anyhow::Error::new(err).context("failed to read deployment archive"))
}

impl Extractor {
    fn run<R: Read>(self, reader: R) -> Result<ExtractSummary> {
        let mut archive = tar::Archive::new(reader);
        let mut seen = HashSet::new();
        let mut summary = ExtractSummary::default();

        for entry in archive.entries().map_err(read_error)? {
            self.check_cancelled()?;
            let mut entry = entry.map_err(read_error)?;

            let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let path = raw_path.strip_prefix("./").unwrap_or(&raw_path).to_string();

            match entry.header().entry_type() {
                EntryType::Directory
                | EntryType::XGlobalHeader
                | EntryType::XHeader
                | EntryType::GNULongName
                | EntryType::GNULongLink => continue,
                EntryType::Regular | EntryType::Continuous => {}
                _ => return Err(ArchiveError::UnsupportedEntry(path).into()),
            }

            if !is_safe_path(&path) {
                return Err(ArchiveError::InvalidPath(path).into());
            }
            let expected = *self
                .manifest
                .get(&path)
                .ok_or_else(|| ArchiveError::UnexpectedFile(path.clone()))?;
            if !seen.insert(path.clone()) {
                return Err(ArchiveError::DuplicateFile(path).into());
            }
            let actual = entry.size();
            if actual != expected {
                return Err(ArchiveError::SizeMismatch {
                    path,
                    expected,
                    actual,
                }
                .into());
            }

            let key = format!("{}{}", self.prefix, path);
            let written = self.stream_entry(&mut entry, &key, expected)?;
            debug!(key = %key, bytes = written, "Extracted deployment file");

            summary.files += 1;
            summary.bytes += written;
        }

        let mut missing: Vec<&String> = self.manifest.keys().filter(|p| !seen.contains(*p)).collect();
        missing.sort();
        if let Some(path) = missing.first() {
            return Err(ArchiveError::MissingFile((*path).clone()).into());
        }

        Ok(summary)
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Internal(anyhow!("upload cancelled")));
        }
        Ok(())
    }

    /// Forward one entry to a concurrent storage upload
    fn stream_entry(&self, entry: &mut impl Read, key: &str, size: u64) -> Result<u64> {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(CHANNEL_DEPTH);
        let body: ByteStream = Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        }));

        let storage = Arc::clone(&self.storage);
        let upload_key = key.to_string();
        let upload = self
            .handle
            .spawn(async move { storage.upload(&upload_key, body).await });

        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        let copied: io::Result<()> = loop {
            if self.cancel.is_cancelled() {
                break Err(io::Error::other("upload cancelled"));
            }
            match entry.read(&mut buf) {
                Ok(0) if total < size => {
                    break Err(io::Error::new(io::ErrorKind::UnexpectedEof, "archive entry truncated"));
                }
                Ok(0) => break Ok(()),
                Ok(n) => {
                    total += n as u64;
                    // Receiver gone means the upload failed; its error is reported below
                    if tx.blocking_send(Ok(Bytes::copy_from_slice(&buf[..n]))).is_err() {
                        break Ok(());
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = &copied {
            // Fail the upload so the partial object is never committed
            let _ = tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
        }
        drop(tx);

        let uploaded = self
            .handle
            .block_on(upload)
            .map_err(|e| Error::Internal(anyhow!("storage upload task failed: {e}")))?;
        copied.map_err(read_error)?;
        Ok(uploaded?)
    }
}
