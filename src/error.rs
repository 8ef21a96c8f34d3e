//! Structured error types for the custody core.
//!
//! Every public library function returns [`Result<T>`] which carries a
//! domain-specific [`CustodyError`].  Mirror failures and file problems have
//! their own variants because callers treat them differently: the former are
//! downgraded to warnings on record paths, the latter become anomaly findings
//! during detection.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Primary error enum
// ---------------------------------------------------------------------------

/// Domain-specific error type for the custody core.
#[derive(Error, Debug)]
pub enum CustodyError {
    /// Malformed payload, digest or identifier. Raised before any write.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Persisted ledger content cannot be read back. Never auto-repaired.
    #[error("storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("chain {chain_id} compromised at block {broken_at}")]
    ChainCompromised { chain_id: String, broken_at: u64 },

    #[error("mirror write failed: {0}")]
    MirrorWriteFailed(String),

    #[error("mirror timed out: {0}")]
    MirrorTimeout(String),

    #[error("file missing: {}", .0.display())]
    FileMissing(PathBuf),

    #[error("file access error on {}: {source}", path.display())]
    FileAccess {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file read timed out after {timeout_ms} ms: {}", path.display())]
    FileReadTimeout { path: PathBuf, timeout_ms: u64 },

    #[error("ledger: {0}")]
    Ledger(String),

    #[error("mirror: {0}")]
    Mirror(String),

    #[error("config: {0}")]
    Config(String),

    #[error("report: {0}")]
    Report(String),

    /// Direct database errors (auto-converted via `?` in the storage modules).
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    /// Catch-all for errors that do not fit a specific domain.
    #[error("{0}")]
    Other(String),
}

impl CustodyError {
    /// True for the I/O category (missing, unreadable or slow file).
    pub fn is_file_error(&self) -> bool {
        matches!(
            self,
            Self::FileMissing(_) | Self::FileAccess { .. } | Self::FileReadTimeout { .. }
        )
    }

    /// True for mirror-side failures, which never invalidate a ledger write.
    pub fn is_mirror_error(&self) -> bool {
        matches!(self, Self::MirrorWriteFailed(_) | Self::MirrorTimeout(_))
    }
}

/// Convenience alias used throughout the library.
pub type Result<T> = std::result::Result<T, CustodyError>;

// ---------------------------------------------------------------------------
// Context extension trait
// ---------------------------------------------------------------------------

/// Extension trait that adds domain-specific context to any `Result<T, E>`.
///
/// Usage mirrors `anyhow::Context` but tags the error with the originating
/// subsystem so callers can categorise failures.
///
/// ```ignore
/// conn.execute_batch(SCHEMA).ctx_ledger("create tables")?;
/// ```
pub trait ResultExt<T> {
    fn ctx_ledger(self, msg: &str) -> Result<T>;
    fn ctx_corrupt(self, msg: &str) -> Result<T>;
    fn ctx_mirror(self, msg: &str) -> Result<T>;
    fn ctx_report(self, msg: &str) -> Result<T>;
    fn ctx_config(self, msg: &str) -> Result<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for std::result::Result<T, E> {
    fn ctx_ledger(self, msg: &str) -> Result<T> {
        self.map_err(|e| CustodyError::Ledger(format!("{msg}: {e}")))
    }
    fn ctx_corrupt(self, msg: &str) -> Result<T> {
        self.map_err(|e| CustodyError::StorageCorrupt(format!("{msg}: {e}")))
    }
    fn ctx_mirror(self, msg: &str) -> Result<T> {
        self.map_err(|e| CustodyError::Mirror(format!("{msg}: {e}")))
    }
    fn ctx_report(self, msg: &str) -> Result<T> {
        self.map_err(|e| CustodyError::Report(format!("{msg}: {e}")))
    }
    fn ctx_config(self, msg: &str) -> Result<T> {
        self.map_err(|e| CustodyError::Config(format!("{msg}: {e}")))
    }
}

/// Same as [`ResultExt`] but for `Option<T>` (converts `None` into an error).
pub trait OptionExt<T> {
    fn required_input(self, msg: &str) -> Result<T>;
    fn required_ledger(self, msg: &str) -> Result<T>;
}

impl<T> OptionExt<T> for Option<T> {
    fn required_input(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| CustodyError::InvalidInput(msg.to_string()))
    }
    fn required_ledger(self, msg: &str) -> Result<T> {
        self.ok_or_else(|| CustodyError::Ledger(msg.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_errors_are_categorised() {
        assert!(CustodyError::FileMissing(PathBuf::from("x")).is_file_error());
        assert!(CustodyError::FileReadTimeout {
            path: PathBuf::from("x"),
            timeout_ms: 10
        }
        .is_file_error());
        assert!(!CustodyError::InvalidInput("x".into()).is_file_error());
    }

    #[test]
    fn context_tags_subsystem() {
        let r: std::result::Result<(), &str> = Err("boom");
        let err = r.ctx_corrupt("parse payload").unwrap_err();
        assert!(matches!(err, CustodyError::StorageCorrupt(_)));
        assert_eq!(err.to_string(), "storage corrupt: parse payload: boom");
    }

    #[test]
    fn none_becomes_invalid_input() {
        let err = None::<u8>.required_input("missing case id").unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));
    }
}
