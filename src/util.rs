//! Time helpers, encoding utilities, and input validation.

use std::path::{Path, PathBuf};

use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::error::{CustodyError, Result};

// ---------------------------------------------------------------------------
// Time
// ---------------------------------------------------------------------------

pub fn now_utc() -> OffsetDateTime {
    OffsetDateTime::now_utc()
}

pub fn format_rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339)
        .unwrap_or_else(|_| "1970-01-01T00:00:00Z".to_string())
}

pub fn now_utc_rfc3339() -> String {
    format_rfc3339(now_utc())
}

pub fn parse_rfc3339(s: &str) -> Result<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .map_err(|e| CustodyError::InvalidInput(format!("invalid RFC 3339 timestamp '{s}': {e}")))
}

/// Signed milliseconds from `earlier` to `later`.
pub fn millis_between(earlier: OffsetDateTime, later: OffsetDateTime) -> i64 {
    let ms = (later - earlier).whole_milliseconds();
    ms.clamp(i64::MIN as i128, i64::MAX as i128) as i64
}

// ---------------------------------------------------------------------------
// Validation helpers
// ---------------------------------------------------------------------------

/// Identifiers (case ids, user ids, evidence ids): start with an alphanumeric,
/// then up to 127 alphanumeric / hyphen / dot / underscore / colon / at-sign.
static IDENT_RE: std::sync::LazyLock<regex::Regex> = std::sync::LazyLock::new(|| {
    regex::Regex::new(r"^[A-Za-z0-9][A-Za-z0-9\-_.:@]{0,127}$").unwrap()
});

static DIGEST_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"^[0-9a-f]{64}$").unwrap());

/// Validate an opaque identifier coming from the relational store or CLI.
pub fn validate_identifier(value: &str, label: &str) -> Result<()> {
    if value.is_empty() {
        return Err(CustodyError::InvalidInput(format!("{label} must not be empty")));
    }
    if !IDENT_RE.is_match(value) {
        return Err(CustodyError::InvalidInput(format!(
            "invalid {label} '{value}': 1-128 chars, alphanumeric/hyphen/dot/underscore/colon/at"
        )));
    }
    Ok(())
}

/// Validate a SHA-256 hex digest (64 lowercase hex characters).
pub fn validate_digest(digest: &str) -> Result<()> {
    if !DIGEST_RE.is_match(digest) {
        return Err(CustodyError::InvalidInput(format!(
            "digest must be 64 lowercase hex characters, got '{digest}'"
        )));
    }
    Ok(())
}

/// Validate free-text fields that end up in the ledger (reason, notes, ...).
pub fn validate_text(value: &str, label: &str, max_len: usize) -> Result<()> {
    if value.len() > max_len {
        return Err(CustodyError::InvalidInput(format!(
            "{label} exceeds {max_len} bytes"
        )));
    }
    if value.contains('\0') {
        return Err(CustodyError::InvalidInput(format!("{label} contains null byte")));
    }
    Ok(())
}

/// Validate that a path is not empty and does not contain null bytes.
pub fn validate_path(p: &Path, label: &str) -> Result<()> {
    let s = p.to_string_lossy();
    if s.is_empty() {
        return Err(CustodyError::InvalidInput(format!("{label} path is empty")));
    }
    if s.contains('\0') {
        return Err(CustodyError::InvalidInput(format!(
            "{label} path contains null byte"
        )));
    }
    Ok(())
}

/// Canonicalize a path if it exists, otherwise return it unchanged.
pub fn canonicalize_if_exists(p: &Path, label: &str) -> Result<PathBuf> {
    validate_path(p, label)?;
    if p.exists() {
        std::fs::canonicalize(p).map_err(|e| {
            CustodyError::InvalidInput(format!("{label} path invalid: {e}"))
        })
    } else {
        Ok(p.to_path_buf())
    }
}

/// Maximum number of rows allowed in CSV inputs.
pub const MAX_CSV_ROWS: usize = 10_000;

/// Maximum length of free-text ledger fields.
pub const MAX_TEXT_LEN: usize = 4096;

// ---------------------------------------------------------------------------
// Version constants (set by build.rs)
// ---------------------------------------------------------------------------

pub const GIT_HASH: &str = env!("CUSTODY_GIT_HASH");
pub const BUILD_TS: &str = env!("CUSTODY_BUILD_TS");
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// One-line version string for display.
pub fn version_string() -> String {
    format!("custody v{VERSION} (git {GIT_HASH}, built {BUILD_TS})")
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
