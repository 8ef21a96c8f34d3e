//! Transaction recorder: validate, append to the ledger, mirror.
//!
//! The ledger append is the commit point. Whatever happens to the mirror
//! afterwards is reported as a warning on the outcome, never as an error.

use std::path::Path;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{CustodyError, Result};
use crate::hasher;
use crate::ledger::{Block, ChainRole, LedgerStore};
use crate::mirror::{MirrorRecord, MirrorStore};
use crate::model::{CustodyTransfer, EvidenceMetadata, EvidenceRecord, Payload};
use crate::util;

/// Caller-supplied fields for an evidence registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvidenceSubmission {
    pub evidence_digest: String,
    pub case_id: String,
    pub submitted_by: String,
    /// Defaults to the recording time.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub collected_at: Option<OffsetDateTime>,
    pub metadata: EvidenceMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferRequest {
    pub evidence_id: String,
    pub from_user: String,
    pub to_user: String,
    /// Defaults to the recording time.
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub transferred_at: Option<OffsetDateTime>,
    pub transfer_type: String,
    #[serde(default)]
    pub from_location: Option<String>,
    #[serde(default)]
    pub to_location: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

/// Mirror failure carried alongside a committed block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorWarning {
    /// True when the store stayed busy past its timeout.
    pub timed_out: bool,
    pub message: String,
}

impl MirrorWarning {
    fn from_error(e: CustodyError) -> Self {
        let e = if e.is_mirror_error() {
            e
        } else {
            CustodyError::MirrorWriteFailed(e.to_string())
        };
        Self {
            timed_out: matches!(e, CustodyError::MirrorTimeout(_)),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub block: Block,
    pub mirror_record: MirrorRecord,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<MirrorWarning>,
}

pub struct TransactionRecorder<'a, M: MirrorStore + ?Sized> {
    ledgers: &'a LedgerStore,
    mirror: &'a M,
}

impl<'a, M: MirrorStore + ?Sized> TransactionRecorder<'a, M> {
    pub fn new(ledgers: &'a LedgerStore, mirror: &'a M) -> Self {
        Self { ledgers, mirror }
    }

    /// Register a new evidence item on the evidence chain. The evidence id
    /// is assigned here.
    pub fn record_evidence(&self, submission: EvidenceSubmission) -> Result<RecordOutcome> {
        util::validate_digest(&submission.evidence_digest)?;
        util::validate_identifier(&submission.case_id, "case id")?;
        util::validate_identifier(&submission.submitted_by, "submitted_by")?;
        validate_metadata(&submission.metadata)?;

        let record = EvidenceRecord {
            evidence_id: Uuid::new_v4().to_string(),
            evidence_digest: submission.evidence_digest,
            case_id: submission.case_id,
            submitted_by: submission.submitted_by,
            collected_at: submission.collected_at.unwrap_or_else(util::now_utc),
            metadata: submission.metadata,
        };
        let evidence_id = record.evidence_id.clone();
        let block = self
            .ledgers
            .append_to(ChainRole::Evidence, Payload::EvidenceRecord(record))?;
        info!(
            evidence_id = %evidence_id,
            seq = block.sequence_number,
            linkage_id = %block.linkage_id,
            "evidence registered"
        );
        self.mirror_block(ChainRole::Evidence, block)
    }

    /// Hash a file and register it. File size, name and storage path are
    /// filled in from the file itself.
    pub fn record_evidence_file(
        &self,
        path: &Path,
        case_id: &str,
        submitted_by: &str,
        mut metadata: EvidenceMetadata,
    ) -> Result<RecordOutcome> {
        let path = util::canonicalize_if_exists(path, "evidence file")?;
        let evidence_digest = hasher::digest_file(&path)?;
        let file_size = std::fs::metadata(&path)
            .map_err(|e| CustodyError::FileAccess {
                path: path.clone(),
                source: e,
            })?
            .len();
        metadata.file_size = file_size;
        if metadata.file_name.is_none() {
            metadata.file_name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        }
        metadata.storage_path = Some(path.to_string_lossy().into_owned());

        self.record_evidence(EvidenceSubmission {
            evidence_digest,
            case_id: case_id.to_string(),
            submitted_by: submitted_by.to_string(),
            collected_at: None,
            metadata,
        })
    }

    pub fn record_custody_transfer(&self, request: TransferRequest) -> Result<RecordOutcome> {
        util::validate_identifier(&request.evidence_id, "evidence id")?;
        util::validate_identifier(&request.from_user, "from_user")?;
        util::validate_identifier(&request.to_user, "to_user")?;
        if request.from_user == request.to_user {
            return Err(CustodyError::InvalidInput(format!(
                "custody cannot be transferred from '{}' to itself",
                request.from_user
            )));
        }
        validate_required_text(&request.transfer_type, "transfer type")?;
        for (value, label) in [
            (&request.from_location, "from_location"),
            (&request.to_location, "to_location"),
            (&request.reason, "reason"),
            (&request.notes, "notes"),
        ] {
            if let Some(v) = value {
                util::validate_text(v, label, util::MAX_TEXT_LEN)?;
            }
        }
        if self.ledgers.evidence_record(&request.evidence_id)?.is_none() {
            return Err(CustodyError::InvalidInput(format!(
                "evidence '{}' is not registered on the evidence chain",
                request.evidence_id
            )));
        }

        let transfer = CustodyTransfer {
            evidence_id: request.evidence_id,
            from_user: request.from_user,
            to_user: request.to_user,
            transferred_at: request.transferred_at.unwrap_or_else(util::now_utc),
            transfer_type: request.transfer_type,
            from_location: request.from_location,
            to_location: request.to_location,
            reason: request.reason,
            notes: request.notes,
        };
        let block = self
            .ledgers
            .append_to(ChainRole::Custody, Payload::CustodyTransfer(transfer))?;
        if let Some(t) = block.payload.as_transfer() {
            info!(
                evidence_id = %t.evidence_id,
                from = %t.from_user,
                to = %t.to_user,
                seq = block.sequence_number,
                "custody transfer recorded"
            );
        }
        self.mirror_block(ChainRole::Custody, block)
    }

    fn mirror_block(&self, role: ChainRole, block: Block) -> Result<RecordOutcome> {
        let mirror_record = MirrorRecord::from_block(self.ledgers.chain_id(role), &block)?;
        let warning = match self.mirror.apply_block(&mirror_record, &block) {
            Ok(()) => None,
            Err(e) => {
                warn!(
                    linkage_id = %block.linkage_id,
                    error = %e,
                    "ledger append committed but mirror write failed"
                );
                Some(MirrorWarning::from_error(e))
            }
        };
        Ok(RecordOutcome {
            block,
            mirror_record,
            warning,
        })
    }

    /// Drop every derived mirror row and re-derive it from both chains.
    /// Anomaly findings and their resolution history are kept.
    pub fn rebuild_mirror_from_ledger(&self) -> Result<usize> {
        let mut entries = Vec::new();
        for role in ChainRole::ALL {
            let ledger = self.ledgers.load_role(role)?;
            for block in ledger.blocks {
                let record = MirrorRecord::from_block(&ledger.chain_id, &block)?;
                entries.push((record, block));
            }
        }
        let count = self.mirror.rebuild(&entries)?;
        info!(blocks = count, "mirror rebuilt from ledger");
        Ok(count)
    }
}

fn validate_required_text(value: &str, label: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(CustodyError::InvalidInput(format!("{label} must not be empty")));
    }
    util::validate_text(value, label, util::MAX_TEXT_LEN)
}

fn validate_metadata(m: &EvidenceMetadata) -> Result<()> {
    validate_required_text(&m.mime_type, "mime type")?;
    validate_required_text(&m.evidence_type, "evidence type")?;
    util::validate_text(&m.description, "description", util::MAX_TEXT_LEN)?;
    if let Some(ref name) = m.file_name {
        util::validate_text(name, "file name", util::MAX_TEXT_LEN)?;
    }
    if let Some(ref p) = m.storage_path {
        util::validate_path(Path::new(p), "storage")?;
    }
    for (k, v) in &m.extra {
        util::validate_identifier(k, "metadata key")?;
        util::validate_text(v, k, util::MAX_TEXT_LEN)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anomaly::{Anomaly, Resolution};
    use crate::ledger::LedgerOptions;
    use crate::mirror::SqliteMirror;

    /// Mirror whose writes always fail; reads return nothing.
    struct BusyMirror;

    impl MirrorStore for BusyMirror {
        fn apply_block(&self, _: &MirrorRecord, _: &Block) -> Result<()> {
            Err(CustodyError::MirrorTimeout("database is locked".into()))
        }
        fn transaction_summary(&self, _: &str) -> Result<Option<MirrorRecord>> {
            Ok(None)
        }
        fn transaction_summaries(&self, _: &str) -> Result<Vec<MirrorRecord>> {
            Ok(Vec::new())
        }
        fn evidence(&self, _: &str) -> Result<Option<EvidenceRecord>> {
            Ok(None)
        }
        fn custody_timeline(&self, _: &str) -> Result<Vec<CustodyTransfer>> {
            Ok(Vec::new())
        }
        fn rebuild(&self, _: &[(MirrorRecord, Block)]) -> Result<usize> {
            Err(CustodyError::MirrorWriteFailed("read-only".into()))
        }
        fn replace_anomalies(&self, _: &str, a: &[Anomaly]) -> Result<Vec<Anomaly>> {
            Ok(a.to_vec())
        }
        fn anomalies(&self, _: &str, _: Option<bool>) -> Result<Vec<Anomaly>> {
            Ok(Vec::new())
        }
        fn anomaly(&self, _: &str) -> Result<Option<Anomaly>> {
            Ok(None)
        }
        fn resolve_anomaly(&self, _: &str, _: &Resolution) -> Result<bool> {
            Ok(false)
        }
    }

    fn submission(digest: &str) -> EvidenceSubmission {
        EvidenceSubmission {
            evidence_digest: digest.to_string(),
            case_id: "CASE-2025-031".into(),
            submitted_by: "officer.diaz".into(),
            collected_at: None,
            metadata: EvidenceMetadata {
                file_size: 12,
                mime_type: "image/jpeg".into(),
                description: "scene photo".into(),
                evidence_type: "photo".into(),
                ..EvidenceMetadata::default()
            },
        }
    }

    fn transfer(evidence_id: &str, from: &str, to: &str) -> TransferRequest {
        TransferRequest {
            evidence_id: evidence_id.to_string(),
            from_user: from.into(),
            to_user: to.into(),
            transferred_at: None,
            transfer_type: "handoff".into(),
            from_location: None,
            to_location: None,
            reason: None,
            notes: None,
        }
    }

    fn store(dir: &tempfile::TempDir) -> LedgerStore {
        LedgerStore::create_new(&dir.path().join("ledger.db"), None, &LedgerOptions::default())
            .unwrap()
    }

    #[test]
    fn evidence_then_transfer_lands_in_both_stores() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers = store(&dir);
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let rec = TransactionRecorder::new(&ledgers, &mirror);

        let ev = rec.record_evidence(submission(&hasher::digest(b"photo"))).unwrap();
        assert!(ev.warning.is_none());
        let evidence_id = ev.mirror_record.evidence_id.clone().unwrap();
        assert!(Uuid::parse_str(&evidence_id).is_ok());

        let tr = rec
            .record_custody_transfer(transfer(&evidence_id, "officer.diaz", "lab.kim"))
            .unwrap();
        assert_eq!(tr.block.sequence_number, 0);
        assert_eq!(mirror.custody_timeline(&evidence_id).unwrap().len(), 1);
        assert!(mirror.evidence(&evidence_id).unwrap().is_some());
    }

    #[test]
    fn invalid_input_rejected_before_write() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers = store(&dir);
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let rec = TransactionRecorder::new(&ledgers, &mirror);

        let err = rec.record_evidence(submission("ABC")).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));

        let err = rec
            .record_custody_transfer(transfer("no-such-item", "a", "b"))
            .unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));

        let ev = rec.record_evidence(submission(&hasher::digest(b"x"))).unwrap();
        let id = ev.mirror_record.evidence_id.unwrap();
        let err = rec.record_custody_transfer(transfer(&id, "a", "a")).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));

        assert!(ledgers.load_role(ChainRole::Custody).unwrap().is_empty());
        assert_eq!(ledgers.load_role(ChainRole::Evidence).unwrap().len(), 1);
    }

    #[test]
    fn mirror_failure_is_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers = store(&dir);
        let rec = TransactionRecorder::new(&ledgers, &BusyMirror);

        let out = rec.record_evidence(submission(&hasher::digest(b"clip"))).unwrap();
        let warning = out.warning.unwrap();
        assert!(warning.timed_out);
        assert_eq!(ledgers.load_role(ChainRole::Evidence).unwrap().len(), 1);
    }

    #[test]
    fn non_mirror_errors_become_write_failures() {
        let w = MirrorWarning::from_error(CustodyError::Mirror("no such table: evidence".into()));
        assert!(!w.timed_out);
        assert!(w.message.starts_with("mirror write failed"));

        let w = MirrorWarning::from_error(CustodyError::MirrorTimeout("database is locked".into()));
        assert!(w.timed_out);
        assert!(w.message.starts_with("mirror timed out"));
    }

    #[test]
    fn rebuild_restores_derived_rows() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers = store(&dir);
        {
            let rec = TransactionRecorder::new(&ledgers, &BusyMirror);
            let ev = rec.record_evidence(submission(&hasher::digest(b"doc"))).unwrap();
            let id = ev.mirror_record.evidence_id.unwrap();
            rec.record_custody_transfer(transfer(&id, "a", "b")).unwrap();
        }
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let rec = TransactionRecorder::new(&ledgers, &mirror);
        assert_eq!(rec.rebuild_mirror_from_ledger().unwrap(), 2);
        let (_, record) = ledgers
            .find_evidence_block(&hasher::digest(b"doc"))
            .unwrap()
            .and_then(|b| b.payload.as_evidence().cloned().map(|r| (b, r)))
            .unwrap();
        assert_eq!(mirror.custody_timeline(&record.evidence_id).unwrap().len(), 1);
    }

    #[test]
    fn record_file_fills_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let ledgers = store(&dir);
        let mirror = SqliteMirror::open_in_memory().unwrap();
        let rec = TransactionRecorder::new(&ledgers, &mirror);
        let file = dir.path().join("dashcam.mp4");
        std::fs::write(&file, b"frames").unwrap();

        let out = rec
            .record_evidence_file(
                &file,
                "CASE-7",
                "officer.diaz",
                EvidenceMetadata {
                    mime_type: "video/mp4".into(),
                    evidence_type: "video".into(),
                    ..EvidenceMetadata::default()
                },
            )
            .unwrap();
        let record = out.block.payload.as_evidence().unwrap();
        assert_eq!(record.evidence_digest, hasher::digest(b"frames"));
        assert_eq!(record.metadata.file_size, 6);
        assert_eq!(record.metadata.file_name.as_deref(), Some("dashcam.mp4"));
        assert!(record.metadata.storage_path.is_some());
    }
}
