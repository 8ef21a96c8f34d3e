//! Content digests for evidence files and ledger payloads.
//!
//! All digests are SHA-256 rendered as 64 lowercase hex characters.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read as _};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use sha2::{Digest as _, Sha256};

use crate::error::{CustodyError, Result};

const READ_CHUNK: usize = 64 * 1024;

/// What to hash: raw bytes or a file on disk.
#[derive(Debug, Clone, Copy)]
pub enum DigestSource<'a> {
    Bytes(&'a [u8]),
    Path(&'a Path),
}

impl<'a> DigestSource<'a> {
    /// Build a source from optional parts as they arrive from a request layer.
    /// Bytes win when both are given; neither is `InvalidInput`.
    pub fn from_parts(bytes: Option<&'a [u8]>, path: Option<&'a Path>) -> Result<Self> {
        match (bytes, path) {
            (Some(b), _) => Ok(Self::Bytes(b)),
            (None, Some(p)) => Ok(Self::Path(p)),
            (None, None) => Err(CustodyError::InvalidInput(
                "digest request needs either bytes or a readable path".into(),
            )),
        }
    }
}

pub fn sha256(data: &[u8]) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(data);
    h.finalize().into()
}

/// Hex digest of an in-memory payload.
pub fn digest(data: &[u8]) -> String {
    hex::encode(sha256(data))
}

pub fn digest_source(source: DigestSource<'_>) -> Result<String> {
    match source {
        DigestSource::Bytes(b) => Ok(digest(b)),
        DigestSource::Path(p) => digest_file(p),
    }
}

/// Streamed hex digest of a file.
///
/// A missing file is reported as [`CustodyError::FileMissing`]; every other
/// I/O failure as [`CustodyError::FileAccess`].
pub fn digest_file(path: &Path) -> Result<String> {
    stream_digest(path, None)
}

/// Streamed digest that gives up between chunks once `cancel` is set.
fn stream_digest(path: &Path, cancel: Option<&AtomicBool>) -> Result<String> {
    let file = File::open(path).map_err(|e| io_error(path, e))?;
    let mut reader = BufReader::with_capacity(READ_CHUNK, file);
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        if cancel.is_some_and(|c| c.load(Ordering::Relaxed)) {
            return Err(CustodyError::Other(format!(
                "digest of {} cancelled",
                path.display()
            )));
        }
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(io_error(path, e)),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// [`digest_file`] bounded by a wall-clock timeout.
///
/// The read runs on a worker thread; on timeout the caller gets
/// [`CustodyError::FileReadTimeout`] and the worker stops at its next chunk.
pub fn digest_file_with_timeout(path: &Path, timeout: Duration) -> Result<String> {
    let (tx, rx) = mpsc::sync_channel(1);
    let owned: PathBuf = path.to_path_buf();
    let cancel = Arc::new(AtomicBool::new(false));
    let worker_cancel = Arc::clone(&cancel);
    std::thread::Builder::new()
        .name("digest-file".into())
        .spawn(move || {
            let _ = tx.send(stream_digest(&owned, Some(&worker_cancel)));
        })
        .map_err(|e| CustodyError::Other(format!("spawn digest worker: {e}")))?;

    match rx.recv_timeout(timeout) {
        Ok(res) => res,
        Err(mpsc::RecvTimeoutError::Timeout) => {
            cancel.store(true, Ordering::Relaxed);
            Err(CustodyError::FileReadTimeout {
                path: path.to_path_buf(),
                timeout_ms: timeout.as_millis() as u64,
            })
        }
        Err(mpsc::RecvTimeoutError::Disconnected) => Err(CustodyError::Other(format!(
            "digest worker for {} exited without a result",
            path.display()
        ))),
    }
}

fn io_error(path: &Path, e: std::io::Error) -> CustodyError {
    if e.kind() == ErrorKind::NotFound {
        CustodyError::FileMissing(path.to_path_buf())
    } else {
        CustodyError::FileAccess {
            path: path.to_path_buf(),
            source: e,
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
