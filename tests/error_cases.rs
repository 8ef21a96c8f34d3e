use std::time::Duration;

use anyhow::Result;
use secrecy::SecretString;
use tempfile::tempdir;

use custody_core::{
    error::CustodyError,
    hasher,
    ledger::{ChainRole, LedgerOptions, LedgerStore},
    mirror::SqliteMirror,
    model::{CustodyTransfer, EvidenceMetadata, Payload},
    recorder::{EvidenceSubmission, TransactionRecorder, TransferRequest},
    verify::{self, TimelineSource},
};

#[test]
fn corrupt_db_rejected() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("corrupt.db");
    std::fs::write(&db_path, b"not-a-sqlite-db")?;

    let err = LedgerStore::open_existing(&db_path, None).unwrap_err();
    assert!(err.to_string().contains("database") || err.to_string().contains("ledger"));
    Ok(())
}

#[test]
fn missing_ledger_is_not_created_on_open() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("absent.db");
    assert!(LedgerStore::open_existing(&db_path, None).is_err());
    assert!(!db_path.exists());
    Ok(())
}

#[test]
fn encryption_key_without_sqlcipher_fails_loudly() -> Result<()> {
    let dir = tempdir()?;
    let key = SecretString::new("correct horse battery staple".into());
    let res = LedgerStore::create_new(
        &dir.path().join("enc.db"),
        Some(&key),
        &LedgerOptions::default(),
    );
    assert!(res.is_err());
    Ok(())
}

#[test]
fn unknown_chain_is_invalid_input() -> Result<()> {
    let dir = tempdir()?;
    let store = LedgerStore::create_new(&dir.path().join("l.db"), None, &LedgerOptions::default())?;
    assert!(matches!(
        store.load("no-such-chain").unwrap_err(),
        CustodyError::InvalidInput(_)
    ));
    assert!(matches!(
        store.seal("no-such-chain", None).unwrap_err(),
        CustodyError::InvalidInput(_)
    ));
    Ok(())
}

#[test]
fn custody_payload_refused_on_evidence_chain() -> Result<()> {
    let dir = tempdir()?;
    let store = LedgerStore::create_new(&dir.path().join("l.db"), None, &LedgerOptions::default())?;
    let payload = Payload::CustodyTransfer(CustodyTransfer {
        evidence_id: "EV-1".into(),
        from_user: "a".into(),
        to_user: "b".into(),
        transferred_at: custody_core::util::now_utc(),
        transfer_type: "handoff".into(),
        from_location: None,
        to_location: None,
        reason: None,
        notes: None,
    });
    let evidence_chain = store.chain_id(ChainRole::Evidence).to_string();
    assert!(store.append(&evidence_chain, payload).is_err());
    assert!(store.load(&evidence_chain)?.is_empty());
    Ok(())
}

#[test]
fn malformed_digests_rejected() -> Result<()> {
    let dir = tempdir()?;
    let store = LedgerStore::create_new(&dir.path().join("l.db"), None, &LedgerOptions::default())?;
    let mirror = SqliteMirror::open_in_memory()?;
    let inputs = [
        String::new(),
        "abc".to_string(),
        "G".repeat(64),
        "A".repeat(64),
        "a".repeat(65),
    ];
    for bad in &inputs {
        let err = verify::verify_evidence(&store, &mirror, bad).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)), "accepted {bad:?}");
    }
    Ok(())
}

#[test]
fn direct_file_verification_surfaces_io_errors() -> Result<()> {
    let dir = tempdir()?;
    let store = LedgerStore::create_new(&dir.path().join("l.db"), None, &LedgerOptions::default())?;
    let mirror = SqliteMirror::open_in_memory()?;

    let missing = verify::verify_evidence_file(&store, &mirror, &dir.path().join("gone.bin"))
        .unwrap_err();
    assert!(matches!(missing, CustodyError::FileMissing(_)));

    let unreadable = verify::verify_evidence_file(&store, &mirror, dir.path()).unwrap_err();
    assert!(unreadable.is_file_error());
    Ok(())
}

#[test]
fn file_hash_timeout_is_reported() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("big.bin");
    std::fs::write(&path, vec![7u8; 4 * 1024 * 1024])?;
    match hasher::digest_file_with_timeout(&path, Duration::ZERO) {
        Err(CustodyError::FileReadTimeout { timeout_ms, .. }) => assert_eq!(timeout_ms, 0),
        // A very fast disk may still beat a zero timeout.
        Ok(d) => assert_eq!(d, hasher::digest(&vec![7u8; 4 * 1024 * 1024])),
        Err(other) => panic!("unexpected error: {other}"),
    }
    Ok(())
}

#[test]
fn import_rejects_tampered_backup() -> Result<()> {
    let dir = tempdir()?;
    let store = LedgerStore::create_new(&dir.path().join("l.db"), None, &LedgerOptions::default())?;
    let chain = store.chain_id(ChainRole::Custody).to_string();
    store.seal(&chain, Some("first".into()))?;
    store.seal(&chain, Some("second".into()))?;

    let backup = dir.path().join("backup.json");
    custody_core::ledger::export_ledger_json(&store, &backup)?;
    let text = std::fs::read_to_string(&backup)?.replace("\"second\"", "\"altered\"");
    std::fs::write(&backup, text)?;

    let restored = dir.path().join("restored.db");
    let err = custody_core::ledger::import_ledger_json(&backup, &restored, None).unwrap_err();
    assert!(matches!(err, CustodyError::ChainCompromised { broken_at: 1, .. }));
    assert!(!restored.exists());
    Ok(())
}

#[test]
fn failed_import_leaves_target_free_for_retry() -> Result<()> {
    let dir = tempdir()?;
    let store = LedgerStore::create_new(&dir.path().join("l.db"), None, &LedgerOptions::default())?;
    let chain = store.chain_id(ChainRole::Evidence).to_string();
    store.seal(&chain, Some("intake closed".into()))?;
    let backup = dir.path().join("backup.json");
    custody_core::ledger::export_ledger_json(&store, &backup)?;

    // A key on a plain SQLite build fails after the target file is created.
    let restored = dir.path().join("restored.db");
    let key = SecretString::new("passphrase".into());
    assert!(custody_core::ledger::import_ledger_json(&backup, &restored, Some(&key)).is_err());
    assert!(!restored.exists());

    let imported = custody_core::ledger::import_ledger_json(&backup, &restored, None)?;
    assert_eq!(imported.load_role(ChainRole::Evidence)?.len(), 1);
    Ok(())
}

#[test]
fn evidence_verification_survives_unreadable_mirror() -> Result<()> {
    let dir = tempdir()?;
    let store = LedgerStore::create_new(&dir.path().join("l.db"), None, &LedgerOptions::default())?;
    let mirror_path = dir.path().join("mirror.db");
    let mirror = SqliteMirror::open(&mirror_path, Duration::from_secs(2))?;
    let recorder = TransactionRecorder::new(&store, &mirror);

    let digest = hasher::digest(b"dashcam export");
    let evidence_id = recorder
        .record_evidence(EvidenceSubmission {
            evidence_digest: digest.clone(),
            case_id: "CASE-51".into(),
            submitted_by: "officer.brandt".into(),
            collected_at: None,
            metadata: EvidenceMetadata {
                mime_type: "video/mp4".into(),
                evidence_type: "video".into(),
                ..EvidenceMetadata::default()
            },
        })?
        .mirror_record
        .evidence_id
        .expect("evidence id");
    recorder.record_custody_transfer(TransferRequest {
        evidence_id: evidence_id.clone(),
        from_user: "officer.brandt".into(),
        to_user: "lab.quinn".into(),
        transferred_at: None,
        transfer_type: "handoff".into(),
        from_location: None,
        to_location: None,
        reason: None,
        notes: None,
    })?;
    assert_eq!(
        verify::verify_evidence(&store, &mirror, &digest)?.timeline_source,
        TimelineSource::Mirror
    );

    let conn = rusqlite::Connection::open(&mirror_path)?;
    conn.execute_batch("DROP TABLE custody_transfers;")?;
    drop(conn);

    let result = verify::verify_evidence(&store, &mirror, &digest)?;
    assert!(result.exists);
    assert_eq!(result.chain_valid, Some(true));
    assert_eq!(result.timeline_source, TimelineSource::Ledger);
    assert_eq!(result.custody_timeline.len(), 1);
    assert_eq!(result.custody_timeline[0].to_user, "lab.quinn");
    Ok(())
}
