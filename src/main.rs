use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use custody_core::{
    anomaly::AnomalyEngine,
    config::{CustodyConfig, LoggingConfig},
    ledger::{self, ChainRole, LedgerStore, SealingPolicy},
    mirror::{MirrorStore as _, SqliteMirror},
    model::EvidenceMetadata,
    recorder::{EvidenceSubmission, TransactionRecorder, TransferRequest},
    report, util, verify,
};

// ---------------------------------------------------------------------------
// CLI definition
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "custody",
    version = util::VERSION,
    about = "Tamper-evident chain-of-custody ledger for digital evidence"
)]
struct Cli {
    /// Path to the ledger database (SQLite / SQLCipher).
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Path to the relational mirror database.
    #[arg(long, global = true)]
    mirror_db: Option<PathBuf>,

    /// Read the DB encryption key from this environment variable.
    #[arg(long, global = true, default_value = "CUSTODY_DB_KEY")]
    db_key_env: String,

    /// Path to a TOML config file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a new, empty ledger (evidence and custody chains).
    Init {
        /// Leading zero hex digits required of each linkage id.
        #[arg(long)]
        sealing_difficulty: Option<u32>,
    },

    /// Register an evidence item, from a file or a precomputed digest.
    RecordEvidence {
        #[arg(long, conflicts_with = "digest", required_unless_present = "digest")]
        file: Option<PathBuf>,
        #[arg(long)]
        digest: Option<String>,
        #[arg(long)]
        case_id: String,
        #[arg(long)]
        submitted_by: String,
        #[arg(long, default_value = "application/octet-stream")]
        mime_type: String,
        #[arg(long, default_value = "")]
        description: String,
        #[arg(long, default_value = "digital")]
        evidence_type: String,
        /// Collection time (RFC 3339); defaults to now.
        #[arg(long)]
        collected_at: Option<String>,
        /// Extra metadata as key=value; repeatable.
        #[arg(long = "meta", value_parser = parse_key_value)]
        meta: Vec<(String, String)>,
    },

    /// Record a custody transfer for a registered evidence item.
    Transfer {
        #[arg(long)]
        evidence_id: String,
        #[arg(long)]
        from: String,
        #[arg(long)]
        to: String,
        #[arg(long, default_value = "handoff")]
        transfer_type: String,
        /// Transfer time (RFC 3339); defaults to now.
        #[arg(long)]
        at: Option<String>,
        #[arg(long)]
        from_location: Option<String>,
        #[arg(long)]
        to_location: Option<String>,
        #[arg(long)]
        reason: Option<String>,
        #[arg(long)]
        notes: Option<String>,
    },

    /// Bulk-record custody transfers from a CSV file.
    ImportTransfers {
        #[arg(long)]
        csv: PathBuf,
    },

    /// Append a checkpoint block to a chain.
    Seal {
        /// `evidence`, `custody`, or a chain id.
        #[arg(long)]
        chain: String,
        #[arg(long)]
        note: Option<String>,
    },

    /// Verify chain linkage. Both chains unless one is named.
    VerifyChain {
        #[arg(long)]
        chain: Option<String>,
    },

    /// Look up an evidence item by digest or by hashing a file.
    VerifyEvidence {
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        digest: Option<String>,
        #[arg(long)]
        file: Option<PathBuf>,
    },

    /// Run anomaly detection for one evidence item and store the findings.
    Detect {
        #[arg(long)]
        evidence_id: String,
        /// Emit a zero-confidence marker when no rule fires.
        #[arg(long)]
        supplemental: bool,
    },

    /// List stored anomaly findings.
    Anomalies {
        #[arg(long)]
        evidence_id: String,
        #[arg(long, conflicts_with = "unresolved")]
        resolved: bool,
        #[arg(long)]
        unresolved: bool,
    },

    /// Resolve an anomaly finding.
    Resolve {
        #[arg(long)]
        anomaly_id: String,
        #[arg(long)]
        by: String,
        #[arg(long)]
        note: String,
    },

    /// Show block counts and integrity of both chains.
    Status,

    /// Re-derive the relational mirror from the ledger.
    RebuildMirror,

    /// Export the ledger to a JSON backup file.
    ExportLedger {
        #[arg(long)]
        out: PathBuf,
    },

    /// Import a ledger from a JSON backup into a new database.
    ImportLedger {
        #[arg(long)]
        json: PathBuf,
        /// Path for the new database (must not already exist).
        #[arg(long)]
        target_db: PathBuf,
    },

    /// Write the audit pack (JSON + LaTeX + PDF) for one evidence item.
    Report {
        #[arg(long)]
        evidence_id: String,
        #[arg(long)]
        out_dir: Option<PathBuf>,
    },

    /// Print version information.
    Version,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut cfg = CustodyConfig::load(cli.config.as_deref()).context("load config")?;
    cfg.apply_env();

    init_logging(&cfg.logging)?;

    let db_path = cli.db.unwrap_or(cfg.paths.ledger_db.clone());
    util::validate_path(&db_path, "db")?;
    let mirror_path = cli.mirror_db.unwrap_or(cfg.paths.mirror_db.clone());
    util::validate_path(&mirror_path, "mirror db")?;
    let db_key = std::env::var(&cli.db_key_env)
        .ok()
        .or(cfg.security.db_key.clone())
        .map(|s| SecretString::new(s.into()));

    let open_ledger = || -> Result<LedgerStore> {
        let opts = cfg.ledger_options().context("ledger options")?;
        LedgerStore::open_existing_with(&db_path, db_key.as_ref(), &opts).context("open ledger")
    };
    let open_mirror = || -> Result<SqliteMirror> {
        SqliteMirror::open(&mirror_path, cfg.mirror_busy_timeout()).context("open mirror")
    };

    match cli.cmd {
        Commands::Init { sealing_difficulty } => {
            let mut opts = cfg.ledger_options()?;
            if let Some(difficulty) = sealing_difficulty {
                opts.sealing = SealingPolicy::new(difficulty)?;
            }
            let store = LedgerStore::create_new(&db_path, db_key.as_ref(), &opts)
                .context("create ledger")?;
            info!(ledger_id = %store.meta().ledger_id, "ledger initialized");
            print_json(&store.status()?)?;
        }

        Commands::RecordEvidence {
            file,
            digest,
            case_id,
            submitted_by,
            mime_type,
            description,
            evidence_type,
            collected_at,
            meta,
        } => {
            let store = open_ledger()?;
            let mirror = open_mirror()?;
            let recorder = TransactionRecorder::new(&store, &mirror);
            let metadata = EvidenceMetadata {
                file_size: 0,
                mime_type,
                description,
                evidence_type,
                file_name: None,
                storage_path: None,
                extra: meta.into_iter().collect::<BTreeMap<_, _>>(),
            };
            let outcome = match (file, digest) {
                (Some(file), _) => recorder
                    .record_evidence_file(&file, &case_id, &submitted_by, metadata)
                    .context("record evidence file")?,
                (None, Some(digest)) => recorder
                    .record_evidence(EvidenceSubmission {
                        evidence_digest: digest,
                        case_id,
                        submitted_by,
                        collected_at: collected_at
                            .as_deref()
                            .map(util::parse_rfc3339)
                            .transpose()?,
                        metadata,
                    })
                    .context("record evidence")?,
                (None, None) => anyhow::bail!("either --file or --digest is required"),
            };
            print_json(&outcome)?;
        }

        Commands::Transfer {
            evidence_id,
            from,
            to,
            transfer_type,
            at,
            from_location,
            to_location,
            reason,
            notes,
        } => {
            let store = open_ledger()?;
            let mirror = open_mirror()?;
            let outcome = TransactionRecorder::new(&store, &mirror)
                .record_custody_transfer(TransferRequest {
                    evidence_id,
                    from_user: from,
                    to_user: to,
                    transferred_at: at.as_deref().map(util::parse_rfc3339).transpose()?,
                    transfer_type,
                    from_location,
                    to_location,
                    reason,
                    notes,
                })
                .context("record custody transfer")?;
            print_json(&outcome)?;
        }

        Commands::ImportTransfers { csv } => {
            util::validate_path(&csv, "csv")?;
            let csv = util::canonicalize_if_exists(&csv, "csv")?;
            let store = open_ledger()?;
            let mirror = open_mirror()?;
            let recorder = TransactionRecorder::new(&store, &mirror);
            let summary = import_transfers(&recorder, &csv)?;
            print_json(&summary)?;
        }

        Commands::Seal { chain, note } => {
            let store = open_ledger()?;
            let chain_id = store.resolve_chain_id(&chain)?;
            let block = store.seal(&chain_id, note).context("seal chain")?;
            print_json(&block)?;
        }

        Commands::VerifyChain { chain } => {
            let store = open_ledger()?;
            let chain_ids = match chain {
                Some(name) => vec![store.resolve_chain_id(&name)?],
                None => ChainRole::ALL
                    .iter()
                    .map(|r| store.chain_id(*r).to_string())
                    .collect(),
            };
            let mut results = BTreeMap::new();
            for id in chain_ids {
                let ledger = store.load(&id).context("load chain")?;
                results.insert(id, verify::verify_chain(&ledger));
            }
            print_json(&results)?;
            if let Some((id, v)) = results.iter().find(|(_, v)| !v.intact) {
                v.into_result(id).context("chain verification failed")?;
            }
            info!("ledger verification passed");
        }

        Commands::VerifyEvidence { digest, file } => {
            let store = open_ledger()?;
            let mirror = open_mirror()?;
            let result = match (digest, file) {
                (Some(d), _) => verify::verify_evidence(&store, &mirror, &d),
                (None, Some(f)) => verify::verify_evidence_file(&store, &mirror, &f),
                (None, None) => anyhow::bail!("either --digest or --file is required"),
            }
            .context("verify evidence")?;
            print_json(&result)?;
        }

        Commands::Detect {
            evidence_id,
            supplemental,
        } => {
            let store = open_ledger()?;
            let mirror = open_mirror()?;
            let mut options = cfg.detection_options();
            options.enable_supplemental_checks |= supplemental;
            let engine = AnomalyEngine::new(options);
            let report = engine
                .run(&store, &mirror, &evidence_id)
                .context("run anomaly detection")?;
            if !report.persisted {
                warn!(evidence_id = %evidence_id, "findings were not stored");
            }
            print_json(&report)?;
        }

        Commands::Anomalies {
            evidence_id,
            resolved,
            unresolved,
        } => {
            let mirror = open_mirror()?;
            let filter = match (resolved, unresolved) {
                (true, _) => Some(true),
                (_, true) => Some(false),
                _ => None,
            };
            let found = mirror
                .anomalies(&evidence_id, filter)
                .context("query anomalies")?;
            print_json(&found)?;
        }

        Commands::Resolve {
            anomaly_id,
            by,
            note,
        } => {
            let mirror = open_mirror()?;
            let engine = AnomalyEngine::new(cfg.detection_options());
            let changed = engine
                .resolve(&mirror, &anomaly_id, &by, &note)
                .context("resolve anomaly")?;
            if !changed {
                info!(anomaly_id = %anomaly_id, "anomaly was already resolved");
            }
            print_json(&mirror.anomaly(&anomaly_id)?)?;
        }

        Commands::Status => {
            let store = open_ledger()?;
            print_json(&store.status().context("chain status")?)?;
        }

        Commands::RebuildMirror => {
            let store = open_ledger()?;
            let mirror = open_mirror()?;
            let count = TransactionRecorder::new(&store, &mirror)
                .rebuild_mirror_from_ledger()
                .context("rebuild mirror")?;
            print_json(&serde_json::json!({ "blocks_mirrored": count }))?;
        }

        Commands::ExportLedger { out } => {
            let store = open_ledger()?;
            ledger::export_ledger_json(&store, &out).context("export ledger")?;
            info!(out = %out.display(), "ledger exported");
        }

        Commands::ImportLedger { json, target_db } => {
            anyhow::ensure!(
                !target_db.exists(),
                "target database {} already exists -- will not overwrite",
                target_db.display()
            );
            let imported = ledger::import_ledger_json(&json, &target_db, db_key.as_ref())
                .context("import ledger")?;
            info!(
                ledger_id = %imported.meta().ledger_id,
                "ledger imported to {}",
                target_db.display()
            );
            print_json(&imported.status()?)?;
        }

        Commands::Report {
            evidence_id,
            out_dir,
        } => {
            let store = open_ledger()?;
            let mirror = open_mirror()?;
            let out = out_dir.unwrap_or_else(|| cfg.paths.report_out_dir.join(&evidence_id));
            let pack = report::collect_audit_pack(&store, &mirror, &evidence_id)
                .context("collect audit pack")?;
            report::write_audit_pack(&out, &pack).context("write audit pack")?;
            print_json(&pack.manifest)?;
        }

        Commands::Version => {
            println!("{}", util::version_string());
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// CSV import
// ---------------------------------------------------------------------------

const REQUIRED_CSV_HEADERS: [&str; 4] = ["evidence_id", "from_user", "to_user", "transfer_type"];

#[derive(Debug, Deserialize)]
struct TransferRow {
    evidence_id: String,
    from_user: String,
    to_user: String,
    transfer_type: String,
    #[serde(default)]
    transferred_at: Option<String>,
    #[serde(default)]
    from_location: Option<String>,
    #[serde(default)]
    to_location: Option<String>,
    #[serde(default)]
    reason: Option<String>,
    #[serde(default)]
    notes: Option<String>,
}

#[derive(Debug, Default, Serialize)]
struct ImportSummary {
    recorded: usize,
    mirror_warnings: usize,
}

fn import_transfers(recorder: &TransactionRecorder<'_, SqliteMirror>, csv: &Path) -> Result<ImportSummary> {
    let mut rdr =
        csv::Reader::from_path(csv).with_context(|| format!("open csv: {}", csv.display()))?;
    let headers = rdr.headers().context("read csv headers")?.clone();
    for required in REQUIRED_CSV_HEADERS {
        if !headers.iter().any(|h| h == required) {
            anyhow::bail!("csv missing required header '{required}'");
        }
    }

    let mut summary = ImportSummary::default();
    for (i, rec) in rdr.deserialize::<TransferRow>().enumerate() {
        let line = i + 2;
        if i >= util::MAX_CSV_ROWS {
            anyhow::bail!("csv exceeds maximum row limit of {}", util::MAX_CSV_ROWS);
        }
        let row = rec.with_context(|| format!("parse csv row {line}"))?;
        let transferred_at = non_empty(row.transferred_at)
            .as_deref()
            .map(util::parse_rfc3339)
            .transpose()
            .with_context(|| format!("csv row {line}"))?;
        let outcome = recorder
            .record_custody_transfer(TransferRequest {
                evidence_id: row.evidence_id,
                from_user: row.from_user,
                to_user: row.to_user,
                transferred_at,
                transfer_type: row.transfer_type,
                from_location: non_empty(row.from_location),
                to_location: non_empty(row.to_location),
                reason: non_empty(row.reason),
                notes: non_empty(row.notes),
            })
            .with_context(|| format!("record csv row {line}"))?;
        summary.recorded += 1;
        if outcome.warning.is_some() {
            summary.mirror_warnings += 1;
        }
    }
    info!(recorded = summary.recorded, warnings = summary.mirror_warnings, "transfers imported");
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    s.split_once('=')
        .map(|(k, v)| (k.trim().to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{s}'"))
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}

fn init_logging(cfg: &LoggingConfig) -> Result<()> {
    use tracing_subscriber::prelude::*;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.level));

    let registry = tracing_subscriber::registry().with(filter);

    if cfg.json_stdout {
        // JSON output to stdout for container / SIEM pipelines.
        let json_layer = tracing_subscriber::fmt::layer().json();
        registry.with(json_layer).init();
    } else if !cfg.json_log_file.is_empty() {
        // JSON-lines output to file for SIEM integration.
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&cfg.json_log_file)
            .with_context(|| format!("open json log file {}", cfg.json_log_file))?;
        let file_layer = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::sync::Mutex::new(log_file));
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(file_layer).with(console_layer).init();
    } else {
        // Default: human-readable output to stderr; stdout carries results.
        let console_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);
        registry.with(console_layer).init();
    }
    Ok(())
}
