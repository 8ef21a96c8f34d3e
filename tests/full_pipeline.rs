use std::path::Path;
use std::process::{Command, Output};

use anyhow::Result;
use tempfile::tempdir;

use custody_core::{
    anomaly::{AnomalyEngine, AnomalyType, RiskStatus},
    ledger::{self, ChainRole, LedgerOptions, LedgerStore},
    mirror::{MirrorStore as _, SqliteMirror},
    model::EvidenceMetadata,
    recorder::{TransactionRecorder, TransferRequest},
    report, util, verify,
};

#[test]
fn full_pipeline_smoke() -> Result<()> {
    let dir = tempdir()?;
    let db_path = dir.path().join("ledger.db");
    let out_dir = dir.path().join("audit-pack");
    let evidence_file = dir.path().join("interview.wav");
    std::fs::write(&evidence_file, b"RIFF....WAVEfmt ")?;

    let store = LedgerStore::create_new(&db_path, None, &LedgerOptions::default())?;
    let mirror = SqliteMirror::open(&dir.path().join("mirror.db"), std::time::Duration::from_secs(2))?;
    let recorder = TransactionRecorder::new(&store, &mirror);

    let registered = recorder.record_evidence_file(
        &evidence_file,
        "CASE-2025-0207",
        "det.harlow",
        EvidenceMetadata {
            mime_type: "audio/wav".into(),
            evidence_type: "audio".into(),
            description: "suspect interview".into(),
            ..EvidenceMetadata::default()
        },
    )?;
    let evidence_id = registered.mirror_record.evidence_id.clone().expect("evidence id");

    let t0 = util::parse_rfc3339("2025-02-07T10:00:00Z")?;
    let hops = [
        ("det.harlow", "lab.intake", 0, Some("Precinct 4"), Some("Lab Intake")),
        ("lab.intake", "analyst.wu", 20, Some("Lab Intake"), Some("Audio Lab")),
        ("analyst.wu", "lab.intake", 26 * 60, Some("Audio Lab"), Some("Lab Intake")),
    ];
    for (from, to, minutes, from_loc, to_loc) in hops {
        recorder.record_custody_transfer(TransferRequest {
            evidence_id: evidence_id.clone(),
            from_user: from.into(),
            to_user: to.into(),
            transferred_at: Some(t0 + time::Duration::minutes(minutes)),
            transfer_type: "handoff".into(),
            from_location: from_loc.map(str::to_string),
            to_location: to_loc.map(str::to_string),
            reason: None,
            notes: None,
        })?;
    }
    store.seal(store.chain_id(ChainRole::Custody), Some("case closed".into()))?;

    // Circular return to the lab after a 25h40m gap.
    let engine = AnomalyEngine::default();
    let analysis = engine.run(&store, &mirror, &evidence_id)?;
    let mut found: Vec<AnomalyType> = analysis.anomalies.iter().map(|a| a.anomaly_type).collect();
    found.sort();
    assert_eq!(found, vec![AnomalyType::CircularTransfer, AnomalyType::TimeGap]);
    assert_eq!(analysis.risk_score, 30);
    assert_eq!(analysis.status, RiskStatus::Elevated);

    let gap = analysis
        .anomalies
        .iter()
        .find(|a| a.anomaly_type == AnomalyType::TimeGap)
        .expect("gap finding");
    assert!(engine.resolve(&mirror, &gap.id, "sgt.ortiz", "weekend lab closure")?);

    let verification = verify::verify_evidence_file(&store, &mirror, &evidence_file)?;
    assert!(verification.exists);
    assert_eq!(verification.chain_valid, Some(true));
    assert_eq!(verification.custody_timeline.len(), 3);

    let pack = report::collect_audit_pack(&store, &mirror, &evidence_id)?;
    assert_eq!(pack.manifest.transfer_count, 3);
    assert_eq!(pack.manifest.unresolved_count, 1);
    // Registration plus three transfers; the seal names no evidence item.
    assert_eq!(pack.transactions.len(), 4);
    assert!(pack.transactions.iter().all(|t| t.evidence_id.as_deref() == Some(evidence_id.as_str())));
    assert!(pack.manifest.chains_intact());
    report::write_audit_pack(&out_dir, &pack)?;
    for name in [
        "manifest.json",
        "evidence_record.json",
        "custody_timeline.json",
        "anomaly_report.json",
        "ledger_transactions.json",
        "audit_report.tex",
        "audit_report.pdf",
        "audit_report.xmp",
    ] {
        assert!(out_dir.join(name).exists(), "missing {name}");
    }
    let manifest: serde_json::Value =
        serde_json::from_slice(&std::fs::read(out_dir.join("manifest.json"))?)?;
    assert_eq!(manifest["evidence_id"], evidence_id.as_str());
    assert_eq!(manifest["format"], report::AUDIT_PACK_FORMAT);

    // Backup and restore reproduce both chains block for block.
    let backup = dir.path().join("backup.json");
    ledger::export_ledger_json(&store, &backup)?;
    let restored = ledger::import_ledger_json(&backup, &dir.path().join("restored.db"), None)?;
    for role in ChainRole::ALL {
        assert_eq!(store.load_role(role)?, restored.load_role(role)?);
    }
    assert_eq!(restored.meta().ledger_id, store.meta().ledger_id);

    // A fresh mirror rebuilt from the restored ledger serves the same timeline.
    let fresh = SqliteMirror::open_in_memory()?;
    let rebuilt = TransactionRecorder::new(&restored, &fresh).rebuild_mirror_from_ledger()?;
    assert_eq!(rebuilt, 5);
    assert_eq!(
        fresh.custody_timeline(&evidence_id)?,
        mirror.custody_timeline(&evidence_id)?
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

fn custody(dir: &Path, args: &[&str]) -> Result<Output> {
    Ok(Command::new(env!("CARGO_BIN_EXE_custody"))
        .arg("--db")
        .arg(dir.join("ledger.db"))
        .arg("--mirror-db")
        .arg(dir.join("mirror.db"))
        .args(args)
        .env_remove("CUSTODY_DB_KEY")
        .env("RUST_LOG", "warn")
        .output()?)
}

fn stdout_json(out: &Output) -> Result<serde_json::Value> {
    assert!(
        out.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    Ok(serde_json::from_slice(&out.stdout)?)
}

#[test]
fn cli_records_and_imports_transfers() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    stdout_json(&custody(root, &["init"])?)?;

    let digest = custody_core::hasher::digest(b"bodycam footage");
    let recorded = stdout_json(&custody(
        root,
        &[
            "record-evidence",
            "--digest",
            &digest,
            "--case-id",
            "CASE-CLI-1",
            "--submitted-by",
            "officer.lane",
            "--meta",
            "camera_serial=BC-2231",
        ],
    )?)?;
    let evidence_id = recorded["mirror_record"]["evidence_id"]
        .as_str()
        .expect("evidence id")
        .to_string();

    let csv_path = root.join("transfers.csv");
    std::fs::write(
        &csv_path,
        format!(
            "evidence_id,from_user,to_user,transfer_type,transferred_at,to_location\n\
             {evidence_id},officer.lane,lab.ito,submission,2025-04-01T08:00:00Z,Lab\n\
             {evidence_id},lab.ito,vault.1,storage,2025-04-01T12:00:00Z,\n"
        ),
    )?;
    let summary = stdout_json(&custody(root, &["import-transfers", "--csv", csv_path.to_str().expect("utf-8 path")])?)?;
    assert_eq!(summary["recorded"], 2);
    assert_eq!(summary["mirror_warnings"], 0);

    let verified = stdout_json(&custody(root, &["verify-evidence", "--digest", &digest])?)?;
    assert_eq!(verified["exists"], true);
    assert_eq!(verified["custody_timeline"].as_array().map(Vec::len), Some(2));

    let status = stdout_json(&custody(root, &["verify-chain"])?)?;
    assert!(status.as_object().expect("map").values().all(|v| v["intact"] == true));
    Ok(())
}

#[test]
fn cli_rejects_csv_without_required_headers() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    stdout_json(&custody(root, &["init"])?)?;
    let csv_path = root.join("bad.csv");
    std::fs::write(&csv_path, "evidence,who\nEV-1,someone\n")?;

    let out = custody(root, &["import-transfers", "--csv", csv_path.to_str().expect("utf-8 path")])?;
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("missing required header"));
    Ok(())
}

#[test]
fn cli_init_applies_sealing_difficulty_flag() -> Result<()> {
    let dir = tempdir()?;
    let root = dir.path();
    stdout_json(&custody(root, &["init", "--sealing-difficulty", "1"])?)?;

    let sealed = stdout_json(&custody(root, &["seal", "--chain", "custody", "--note", "shift change"])?)?;
    assert!(sealed["linkage_id"].as_str().expect("linkage id").starts_with('0'));

    let store = LedgerStore::open_existing(&root.join("ledger.db"), None)?;
    for role in ChainRole::ALL {
        assert_eq!(store.load_role(role)?.sealing.difficulty, 1);
    }
    Ok(())
}
