//! Chain and evidence verification. Read-only: nothing here mutates a ledger.

use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::{CustodyError, Result};
use crate::hasher;
use crate::ledger::{ChainRole, Ledger, LedgerStore};
use crate::mirror::MirrorStore;
use crate::model::CustodyTransfer;
use crate::util;

// ---------------------------------------------------------------------------
// Chain verifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakReason {
    /// `sequence_number` differs from the block's position.
    SequenceGap,
    /// Stored linkage id no longer matches the block's content.
    ContentAltered,
    /// `previous_linkage_id` does not point at the preceding block.
    LinkageMismatch,
    /// Linkage id does not meet the chain's sealing cost.
    SealingCostUnmet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub intact: bool,
    pub broken_at: Option<u64>,
    pub reason: Option<BreakReason>,
}

impl ChainVerification {
    fn intact() -> Self {
        Self {
            intact: true,
            broken_at: None,
            reason: None,
        }
    }

    fn broken(at: usize, reason: BreakReason) -> Self {
        Self {
            intact: false,
            broken_at: Some(at as u64),
            reason: Some(reason),
        }
    }

    /// Turn a failed verification into [`CustodyError::ChainCompromised`] for
    /// callers whose policy is to refuse a compromised chain.
    pub fn into_result(self, chain_id: &str) -> Result<()> {
        match self.broken_at {
            None => Ok(()),
            Some(broken_at) => Err(CustodyError::ChainCompromised {
                chain_id: chain_id.to_string(),
                broken_at,
            }),
        }
    }
}

/// Walk a chain and report the first block that breaks it.
pub fn verify_chain(ledger: &Ledger) -> ChainVerification {
    for (i, block) in ledger.blocks.iter().enumerate() {
        if block.sequence_number != i as u64 {
            return ChainVerification::broken(i, BreakReason::SequenceGap);
        }
        match block.recompute_linkage(&ledger.chain_id) {
            Ok(ref recomputed) if *recomputed == block.linkage_id => {}
            _ => return ChainVerification::broken(i, BreakReason::ContentAltered),
        }
        let expected_prev = i
            .checked_sub(1)
            .map(|p| ledger.blocks[p].linkage_id.as_str());
        if block.previous_linkage_id.as_deref() != expected_prev {
            return ChainVerification::broken(i, BreakReason::LinkageMismatch);
        }
        if !ledger.sealing.is_satisfied_by(&block.linkage_id) {
            return ChainVerification::broken(i, BreakReason::SealingCostUnmet);
        }
    }
    ChainVerification::intact()
}

/// Health summary of one chain, suitable for a status display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub chain_id: String,
    pub role: ChainRole,
    pub block_count: usize,
    pub last_sequence_number: Option<u64>,
    pub intact: bool,
    pub broken_at: Option<u64>,
}

pub fn chain_status(ledger: &Ledger) -> ChainStatus {
    let v = verify_chain(ledger);
    if !v.intact {
        warn!(
            chain_id = %ledger.chain_id,
            broken_at = ?v.broken_at,
            reason = ?v.reason,
            "chain verification failed"
        );
    }
    ChainStatus {
        chain_id: ledger.chain_id.clone(),
        role: ledger.role,
        block_count: ledger.len(),
        last_sequence_number: ledger.last().map(|b| b.sequence_number),
        intact: v.intact,
        broken_at: v.broken_at,
    }
}

// ---------------------------------------------------------------------------
// Evidence verifier
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_valid: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broken_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub linkage_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
    #[serde(
        default,
        with = "time::serde::rfc3339::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub recorded_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub custody_timeline: Vec<CustodyTransfer>,
    #[serde(default)]
    pub timeline_source: TimelineSource,
}

/// Where `custody_timeline` was read from. `Ledger` means the relational
/// store could not be read and the result is degraded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimelineSource {
    #[default]
    Mirror,
    Ledger,
}

impl VerificationResult {
    fn not_found() -> Self {
        Self {
            exists: false,
            chain_valid: None,
            broken_at: None,
            evidence_id: None,
            case_id: None,
            linkage_id: None,
            sequence_number: None,
            recorded_at: None,
            custody_timeline: Vec::new(),
            timeline_source: TimelineSource::default(),
        }
    }
}

/// Locate the ledger entry for a claimed digest, verify the evidence chain,
/// and attach the custody timeline from the relational store, or from the
/// custody chain when the relational store cannot be read.
pub fn verify_evidence<M>(
    ledgers: &LedgerStore,
    mirror: &M,
    claimed_digest: &str,
) -> Result<VerificationResult>
where
    M: MirrorStore + ?Sized,
{
    util::validate_digest(claimed_digest)?;

    // One snapshot serves both the lookup and the chain walk.
    let ledger = ledgers.load_role(ChainRole::Evidence)?;
    let Some((block, record)) = ledger.blocks.iter().find_map(|b| {
        b.payload
            .as_evidence()
            .filter(|r| r.evidence_digest == claimed_digest)
            .map(|r| (b, r))
    }) else {
        info!(digest = %claimed_digest, "no ledger entry for digest");
        return Ok(VerificationResult::not_found());
    };

    let chain = verify_chain(&ledger);
    let (custody_timeline, timeline_source) = match mirror.custody_timeline(&record.evidence_id) {
        Ok(t) => (t, TimelineSource::Mirror),
        Err(e) => {
            warn!(evidence_id = %record.evidence_id, error = %e, "mirror timeline unavailable; reading custody chain");
            (ledgers.custody_timeline(&record.evidence_id)?, TimelineSource::Ledger)
        }
    };

    info!(
        evidence_id = %record.evidence_id,
        seq = block.sequence_number,
        chain_valid = chain.intact,
        transfers = custody_timeline.len(),
        source = ?timeline_source,
        "evidence verified"
    );

    Ok(VerificationResult {
        exists: true,
        chain_valid: Some(chain.intact),
        broken_at: chain.broken_at,
        evidence_id: Some(record.evidence_id.clone()),
        case_id: Some(record.case_id.clone()),
        linkage_id: Some(block.linkage_id.clone()),
        sequence_number: Some(block.sequence_number),
        recorded_at: Some(block.created_at),
        custody_timeline,
        timeline_source,
    })
}

/// Hash a file and verify the resulting digest. A missing or unreadable file
/// is an error here; a modified file simply does not match any entry.
pub fn verify_evidence_file<M>(
    ledgers: &LedgerStore,
    mirror: &M,
    path: &Path,
) -> Result<VerificationResult>
where
    M: MirrorStore + ?Sized,
{
    util::validate_path(path, "evidence file")?;
    let digest = hasher::digest_file(path)?;
    verify_evidence(ledgers, mirror, &digest)
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
