//! Ledger payload types: evidence registrations, custody transfers and seal
//! checkpoints.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::error::{CustodyError, Result};

// ---------------------------------------------------------------------------
// Block kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockKind {
    EvidenceRecord,
    CustodyTransfer,
    Sealed,
}

impl BlockKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EvidenceRecord => "evidence_record",
            Self::CustodyTransfer => "custody_transfer",
            Self::Sealed => "sealed",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "evidence_record" => Ok(Self::EvidenceRecord),
            "custody_transfer" => Ok(Self::CustodyTransfer),
            "sealed" => Ok(Self::Sealed),
            other => Err(CustodyError::StorageCorrupt(format!(
                "unknown block kind '{other}'"
            ))),
        }
    }
}

impl std::fmt::Display for BlockKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Payloads
// ---------------------------------------------------------------------------

/// Descriptive metadata captured when evidence is registered.
///
/// `extra` holds caller-defined string attributes (camera serial, seal tag
/// number, ...). Values are strings so the canonical serialization used for
/// linkage stays byte-stable across a storage round trip.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceMetadata {
    pub file_size: u64,
    pub mime_type: String,
    pub description: String,
    pub evidence_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    /// Where the evidence file lives; the anomaly detector re-hashes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub evidence_id: String,
    pub evidence_digest: String,
    pub case_id: String,
    pub submitted_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub collected_at: OffsetDateTime,
    pub metadata: EvidenceMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustodyTransfer {
    pub evidence_id: String,
    pub from_user: String,
    pub to_user: String,
    #[serde(with = "time::serde::rfc3339")]
    pub transferred_at: OffsetDateTime,
    pub transfer_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// Checkpoint written by `seal`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealMarker {
    #[serde(with = "time::serde::rfc3339")]
    pub sealed_at: OffsetDateTime,
    /// Last sequence number covered by this checkpoint; `None` on an empty chain.
    pub sealed_through: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    EvidenceRecord(EvidenceRecord),
    CustodyTransfer(CustodyTransfer),
    Sealed(SealMarker),
}

impl Payload {
    pub fn kind(&self) -> BlockKind {
        match self {
            Self::EvidenceRecord(_) => BlockKind::EvidenceRecord,
            Self::CustodyTransfer(_) => BlockKind::CustodyTransfer,
            Self::Sealed(_) => BlockKind::Sealed,
        }
    }

    /// Business id the payload belongs to (none for seal checkpoints).
    pub fn evidence_id(&self) -> Option<&str> {
        match self {
            Self::EvidenceRecord(r) => Some(&r.evidence_id),
            Self::CustodyTransfer(t) => Some(&t.evidence_id),
            Self::Sealed(_) => None,
        }
    }

    pub fn as_evidence(&self) -> Option<&EvidenceRecord> {
        match self {
            Self::EvidenceRecord(r) => Some(r),
            _ => None,
        }
    }

    pub fn as_transfer(&self) -> Option<&CustodyTransfer> {
        match self {
            Self::CustodyTransfer(t) => Some(t),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|e| CustodyError::Ledger(format!("serialize payload: {e}")))
    }
}
