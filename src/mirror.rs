//! Relational mirror of the ledger.
//!
//! The ledger is the source of truth; the mirror is a queryable, rebuildable
//! index of it (evidence rows, custody rows, per-block summaries) plus the
//! anomaly findings, which are not derived from the ledger and survive a
//! rebuild. [`MirrorStore`] is the seam to whatever relational store the
//! request layer uses; [`SqliteMirror`] is the bundled implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rusqlite::{params, Connection, ErrorCode, OptionalExtension as _, Row, TransactionBehavior};
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, info};

use crate::anomaly::{Anomaly, AnomalyType, Resolution, Severity};
use crate::error::{CustodyError, Result, ResultExt as _};
use crate::ledger::Block;
use crate::model::{BlockKind, CustodyTransfer, EvidenceMetadata, EvidenceRecord, Payload};
use crate::util;

// ---------------------------------------------------------------------------
// Mirror rows
// ---------------------------------------------------------------------------

/// Denormalized summary of one ledger block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorRecord {
    pub linkage_id: String,
    pub chain_id: String,
    pub sequence_number: u64,
    pub evidence_id: Option<String>,
    pub case_id: Option<String>,
    pub kind: BlockKind,
    pub payload_digest: String,
    #[serde(with = "time::serde::rfc3339")]
    pub recorded_at: OffsetDateTime,
    pub verified: bool,
}

impl MirrorRecord {
    pub fn from_block(chain_id: &str, block: &Block) -> Result<Self> {
        Ok(Self {
            linkage_id: block.linkage_id.clone(),
            chain_id: chain_id.to_string(),
            sequence_number: block.sequence_number,
            evidence_id: block.payload.evidence_id().map(str::to_string),
            case_id: block.payload.as_evidence().map(|r| r.case_id.clone()),
            kind: block.kind,
            payload_digest: block.payload_digest()?,
            recorded_at: block.created_at,
            verified: true,
        })
    }
}

// ---------------------------------------------------------------------------
// Store boundary
// ---------------------------------------------------------------------------

pub trait MirrorStore: Send + Sync {
    /// Write the summary row and the business row (evidence or custody) for
    /// one appended block. Idempotent per linkage id.
    fn apply_block(&self, record: &MirrorRecord, block: &Block) -> Result<()>;

    fn transaction_summary(&self, linkage_id: &str) -> Result<Option<MirrorRecord>>;

    fn transaction_summaries(&self, evidence_id: &str) -> Result<Vec<MirrorRecord>>;

    fn evidence(&self, evidence_id: &str) -> Result<Option<EvidenceRecord>>;

    /// Custody timeline as the relational store sees it, ascending by time.
    fn custody_timeline(&self, evidence_id: &str) -> Result<Vec<CustodyTransfer>>;

    /// Drop every derived row and re-insert `entries`, atomically.
    fn rebuild(&self, entries: &[(MirrorRecord, Block)]) -> Result<usize>;

    /// Replace the stored findings for one evidence item in a single
    /// transaction, re-attaching resolutions recorded against matching
    /// fingerprints. Returns the findings as stored.
    fn replace_anomalies(&self, evidence_id: &str, anomalies: &[Anomaly]) -> Result<Vec<Anomaly>>;

    fn anomalies(&self, evidence_id: &str, resolved: Option<bool>) -> Result<Vec<Anomaly>>;

    fn anomaly(&self, anomaly_id: &str) -> Result<Option<Anomaly>>;

    /// Resolve a finding. `Ok(false)` when it was already resolved.
    fn resolve_anomaly(&self, anomaly_id: &str, resolution: &Resolution) -> Result<bool>;
}

// ---------------------------------------------------------------------------
// SQLite implementation
// ---------------------------------------------------------------------------

const MIRROR_SCHEMA_SQL: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=NORMAL;

    CREATE TABLE IF NOT EXISTS ledger_transactions(
      linkage_id TEXT PRIMARY KEY,
      chain_id TEXT NOT NULL,
      seq INTEGER NOT NULL,
      evidence_id TEXT,
      case_id TEXT,
      kind TEXT NOT NULL,
      payload_digest TEXT NOT NULL,
      recorded_at TEXT NOT NULL,
      verified INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_tx_evidence ON ledger_transactions(evidence_id);
    CREATE INDEX IF NOT EXISTS idx_tx_chain_seq ON ledger_transactions(chain_id, seq);

    CREATE TABLE IF NOT EXISTS evidence(
      evidence_id TEXT PRIMARY KEY,
      case_id TEXT NOT NULL,
      evidence_digest TEXT NOT NULL,
      submitted_by TEXT NOT NULL,
      collected_at TEXT NOT NULL,
      metadata_json TEXT NOT NULL,
      linkage_id TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_evidence_digest ON evidence(evidence_digest);

    CREATE TABLE IF NOT EXISTS custody_transfers(
      linkage_id TEXT PRIMARY KEY,
      evidence_id TEXT NOT NULL,
      from_user TEXT NOT NULL,
      to_user TEXT NOT NULL,
      transferred_at TEXT NOT NULL,
      transfer_type TEXT NOT NULL,
      from_location TEXT,
      to_location TEXT,
      reason TEXT,
      notes TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_custody_evidence ON custody_transfers(evidence_id);

    CREATE TABLE IF NOT EXISTS anomalies(
      id TEXT PRIMARY KEY,
      evidence_id TEXT NOT NULL,
      fingerprint TEXT NOT NULL,
      anomaly_type TEXT NOT NULL,
      severity TEXT NOT NULL,
      confidence REAL NOT NULL,
      title TEXT NOT NULL,
      description TEXT NOT NULL,
      details_json TEXT NOT NULL,
      detected_at TEXT NOT NULL,
      resolved_by TEXT,
      resolved_at TEXT,
      resolution TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_anomalies_evidence ON anomalies(evidence_id);

    CREATE TABLE IF NOT EXISTS anomaly_resolutions(
      fingerprint TEXT PRIMARY KEY,
      evidence_id TEXT NOT NULL,
      resolved_by TEXT NOT NULL,
      resolved_at TEXT NOT NULL,
      resolution TEXT NOT NULL
    );
"#;

const ANOMALY_COLUMNS: &str = "id, evidence_id, fingerprint, anomaly_type, severity, confidence, \
     title, description, details_json, detected_at, resolved_by, resolved_at, resolution";

pub struct SqliteMirror {
    conn: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteMirror {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMirror").finish_non_exhaustive()
    }
}

impl SqliteMirror {
    pub fn open(db_path: &Path, busy_timeout: Duration) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CustodyError::Mirror(format!("create mirror dir {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(db_path).map_err(|e| {
            CustodyError::Mirror(format!("open mirror db {}: {e}", db_path.display()))
        })?;
        Self::init(conn, busy_timeout)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .ctx_mirror("open in-memory mirror")?;
        Self::init(conn, Duration::from_secs(1))
    }

    fn init(conn: Connection, busy_timeout: Duration) -> Result<Self> {
        conn.busy_timeout(busy_timeout)
            .map_err(|e| mirror_err("set busy timeout", e))?;
        conn.execute_batch(MIRROR_SCHEMA_SQL)
            .map_err(|e| mirror_err("create mirror tables", e))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CustodyError::Mirror("mirror lock poisoned".into()))
    }
}

/// Busy/locked means the store stayed unavailable past its timeout.
fn is_busy(e: &rusqlite::Error) -> bool {
    matches!(
        e.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
    )
}

fn write_err(msg: &str, e: rusqlite::Error) -> CustodyError {
    if is_busy(&e) {
        CustodyError::MirrorTimeout(format!("{msg}: {e}"))
    } else {
        CustodyError::MirrorWriteFailed(format!("{msg}: {e}"))
    }
}

fn mirror_err(msg: &str, e: rusqlite::Error) -> CustodyError {
    if is_busy(&e) {
        CustodyError::MirrorTimeout(format!("{msg}: {e}"))
    } else {
        CustodyError::Mirror(format!("{msg}: {e}"))
    }
}

fn insert_block_rows(tx: &Connection, record: &MirrorRecord, block: &Block) -> rusqlite::Result<()> {
    tx.execute(
        r#"
        INSERT OR REPLACE INTO ledger_transactions(
          linkage_id, chain_id, seq, evidence_id, case_id, kind, payload_digest, recorded_at, verified
        ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)
        "#,
        params![
            record.linkage_id,
            record.chain_id,
            record.sequence_number as i64,
            record.evidence_id,
            record.case_id,
            record.kind.as_str(),
            record.payload_digest,
            util::format_rfc3339(record.recorded_at),
            record.verified,
        ],
    )?;

    match &block.payload {
        Payload::EvidenceRecord(r) => {
            let metadata_json = serde_json::to_string(&r.metadata)
                .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
            tx.execute(
                r#"
                INSERT OR REPLACE INTO evidence(
                  evidence_id, case_id, evidence_digest, submitted_by, collected_at, metadata_json, linkage_id
                ) VALUES (?1,?2,?3,?4,?5,?6,?7)
                "#,
                params![
                    r.evidence_id,
                    r.case_id,
                    r.evidence_digest,
                    r.submitted_by,
                    util::format_rfc3339(r.collected_at),
                    metadata_json,
                    block.linkage_id,
                ],
            )?;
        }
        Payload::CustodyTransfer(t) => {
            tx.execute(
                r#"
                INSERT OR REPLACE INTO custody_transfers(
                  linkage_id, evidence_id, from_user, to_user, transferred_at, transfer_type,
                  from_location, to_location, reason, notes
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)
                "#,
                params![
                    block.linkage_id,
                    t.evidence_id,
                    t.from_user,
                    t.to_user,
                    util::format_rfc3339(t.transferred_at),
                    t.transfer_type,
                    t.from_location,
                    t.to_location,
                    t.reason,
                    t.notes,
                ],
            )?;
        }
        Payload::Sealed(_) => {}
    }
    Ok(())
}

fn record_from_row(row: &Row<'_>) -> Result<MirrorRecord> {
    let get = |e: rusqlite::Error| CustodyError::Mirror(format!("read summary row: {e}"));
    let seq: i64 = row.get(2).map_err(get)?;
    let kind: String = row.get(5).map_err(get)?;
    let recorded_at: String = row.get(7).map_err(get)?;
    Ok(MirrorRecord {
        linkage_id: row.get(0).map_err(get)?,
        chain_id: row.get(1).map_err(get)?,
        sequence_number: u64::try_from(seq)
            .map_err(|_| CustodyError::Mirror(format!("negative seq {seq} in mirror")))?,
        evidence_id: row.get(3).map_err(get)?,
        case_id: row.get(4).map_err(get)?,
        kind: BlockKind::parse(&kind).map_err(|e| CustodyError::Mirror(e.to_string()))?,
        payload_digest: row.get(6).map_err(get)?,
        recorded_at: util::parse_rfc3339(&recorded_at)?,
        verified: row.get(8).map_err(get)?,
    })
}

fn transfer_from_row(row: &Row<'_>) -> Result<CustodyTransfer> {
    let get = |e: rusqlite::Error| CustodyError::Mirror(format!("read custody row: {e}"));
    let transferred_at: String = row.get(3).map_err(get)?;
    Ok(CustodyTransfer {
        evidence_id: row.get(0).map_err(get)?,
        from_user: row.get(1).map_err(get)?,
        to_user: row.get(2).map_err(get)?,
        transferred_at: util::parse_rfc3339(&transferred_at)?,
        transfer_type: row.get(4).map_err(get)?,
        from_location: row.get(5).map_err(get)?,
        to_location: row.get(6).map_err(get)?,
        reason: row.get(7).map_err(get)?,
        notes: row.get(8).map_err(get)?,
    })
}

fn anomaly_from_row(row: &Row<'_>) -> Result<Anomaly> {
    let get = |e: rusqlite::Error| CustodyError::Mirror(format!("read anomaly row: {e}"));
    let anomaly_type: String = row.get(3).map_err(get)?;
    let severity: String = row.get(4).map_err(get)?;
    let details_json: String = row.get(8).map_err(get)?;
    let detected_at: String = row.get(9).map_err(get)?;
    let resolved_by: Option<String> = row.get(10).map_err(get)?;
    let resolved_at: Option<String> = row.get(11).map_err(get)?;
    let note: Option<String> = row.get(12).map_err(get)?;

    let resolution = match (resolved_by, resolved_at, note) {
        (Some(resolved_by), Some(resolved_at), Some(note)) => Some(Resolution {
            resolved_by,
            resolved_at: util::parse_rfc3339(&resolved_at)?,
            note,
        }),
        (None, None, None) => None,
        _ => {
            return Err(CustodyError::Mirror(
                "anomaly row has partial resolution fields".into(),
            ))
        }
    };

    Ok(Anomaly {
        id: row.get(0).map_err(get)?,
        evidence_id: row.get(1).map_err(get)?,
        fingerprint: row.get(2).map_err(get)?,
        anomaly_type: AnomalyType::parse(&anomaly_type)?,
        severity: Severity::parse(&severity)?,
        confidence: row.get(5).map_err(get)?,
        title: row.get(6).map_err(get)?,
        description: row.get(7).map_err(get)?,
        details: serde_json::from_str(&details_json).ctx_mirror("parse anomaly details")?,
        detected_at: util::parse_rfc3339(&detected_at)?,
        resolution,
    })
}

fn collect_rows<T>(
    rows: &mut rusqlite::Rows<'_>,
    map: impl Fn(&Row<'_>) -> Result<T>,
) -> Result<Vec<T>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next().map_err(|e| mirror_err("next row", e))? {
        out.push(map(row)?);
    }
    Ok(out)
}

impl MirrorStore for SqliteMirror {
    fn apply_block(&self, record: &MirrorRecord, block: &Block) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| write_err("begin mirror tx", e))?;
        insert_block_rows(&tx, record, block).map_err(|e| write_err("write mirror rows", e))?;
        tx.commit().map_err(|e| write_err("commit mirror tx", e))?;
        debug!(linkage_id = %record.linkage_id, kind = %record.kind, "mirror updated");
        Ok(())
    }

    fn transaction_summary(&self, linkage_id: &str) -> Result<Option<MirrorRecord>> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                r#"
                SELECT linkage_id, chain_id, seq, evidence_id, case_id, kind, payload_digest, recorded_at, verified
                FROM ledger_transactions WHERE linkage_id=?1
                "#,
                params![linkage_id],
                |row| Ok(record_from_row(row)),
            )
            .optional()
            .map_err(|e| mirror_err("query summary", e))?;
        found.transpose()
    }

    fn transaction_summaries(&self, evidence_id: &str) -> Result<Vec<MirrorRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT linkage_id, chain_id, seq, evidence_id, case_id, kind, payload_digest, recorded_at, verified
                FROM ledger_transactions WHERE evidence_id=?1
                ORDER BY recorded_at ASC, chain_id ASC, seq ASC
                "#,
            )
            .map_err(|e| mirror_err("prepare summaries", e))?;
        let mut rows = stmt
            .query(params![evidence_id])
            .map_err(|e| mirror_err("query summaries", e))?;
        collect_rows(&mut rows, record_from_row)
    }

    fn evidence(&self, evidence_id: &str) -> Result<Option<EvidenceRecord>> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                r#"
                SELECT evidence_id, evidence_digest, case_id, submitted_by, collected_at, metadata_json
                FROM evidence WHERE evidence_id=?1
                "#,
                params![evidence_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                },
            )
            .optional()
            .map_err(|e| mirror_err("query evidence", e))?;

        let Some((evidence_id, evidence_digest, case_id, submitted_by, collected_at, metadata_json)) =
            found
        else {
            return Ok(None);
        };
        let metadata: EvidenceMetadata =
            serde_json::from_str(&metadata_json).ctx_mirror("parse evidence metadata")?;
        Ok(Some(EvidenceRecord {
            evidence_id,
            evidence_digest,
            case_id,
            submitted_by,
            collected_at: util::parse_rfc3339(&collected_at)?,
            metadata,
        }))
    }

    fn custody_timeline(&self, evidence_id: &str) -> Result<Vec<CustodyTransfer>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT evidence_id, from_user, to_user, transferred_at, transfer_type,
                       from_location, to_location, reason, notes
                FROM custody_transfers WHERE evidence_id=?1
                ORDER BY rowid ASC
                "#,
            )
            .map_err(|e| mirror_err("prepare timeline", e))?;
        let mut rows = stmt
            .query(params![evidence_id])
            .map_err(|e| mirror_err("query timeline", e))?;
        let mut timeline = collect_rows(&mut rows, transfer_from_row)?;
        // Text timestamps do not sort chronologically; order on the parsed value.
        timeline.sort_by_key(|t| t.transferred_at);
        Ok(timeline)
    }

    fn rebuild(&self, entries: &[(MirrorRecord, Block)]) -> Result<usize> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| write_err("begin rebuild tx", e))?;
        tx.execute_batch(
            r#"
            DELETE FROM ledger_transactions;
            DELETE FROM evidence;
            DELETE FROM custody_transfers;
            "#,
        )
        .map_err(|e| write_err("clear derived rows", e))?;
        for (record, block) in entries {
            insert_block_rows(&tx, record, block).map_err(|e| write_err("rebuild rows", e))?;
        }
        tx.commit().map_err(|e| write_err("commit rebuild tx", e))?;
        info!(rows = entries.len(), "mirror rebuilt from ledger");
        Ok(entries.len())
    }

    fn replace_anomalies(&self, evidence_id: &str, anomalies: &[Anomaly]) -> Result<Vec<Anomaly>> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| write_err("begin anomaly tx", e))?;
        tx.execute("DELETE FROM anomalies WHERE evidence_id=?1", params![evidence_id])
            .map_err(|e| write_err("clear anomalies", e))?;

        let mut stored = Vec::with_capacity(anomalies.len());
        for a in anomalies {
            let prior: Option<(String, String, String)> = tx
                .query_row(
                    "SELECT resolved_by, resolved_at, resolution FROM anomaly_resolutions WHERE fingerprint=?1",
                    params![a.fingerprint],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )
                .optional()
                .map_err(|e| mirror_err("read resolution history", e))?;
            let mut a = a.clone();
            if let Some((resolved_by, resolved_at, note)) = prior {
                a.resolution = Some(Resolution {
                    resolved_by,
                    resolved_at: util::parse_rfc3339(&resolved_at)?,
                    note,
                });
            }
            let details_json = serde_json::to_string(&a.details)
                .map_err(|e| CustodyError::MirrorWriteFailed(format!("serialize details: {e}")))?;
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO anomalies({ANOMALY_COLUMNS}) \
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)"
                ),
                params![
                    a.id,
                    a.evidence_id,
                    a.fingerprint,
                    a.anomaly_type.as_str(),
                    a.severity.as_str(),
                    a.confidence,
                    a.title,
                    a.description,
                    details_json,
                    util::format_rfc3339(a.detected_at),
                    a.resolution.as_ref().map(|r| r.resolved_by.clone()),
                    a.resolution.as_ref().map(|r| util::format_rfc3339(r.resolved_at)),
                    a.resolution.as_ref().map(|r| r.note.clone()),
                ],
            )
            .map_err(|e| write_err("insert anomaly", e))?;
            stored.push(a);
        }
        tx.commit().map_err(|e| write_err("commit anomaly tx", e))?;
        Ok(stored)
    }

    fn anomalies(&self, evidence_id: &str, resolved: Option<bool>) -> Result<Vec<Anomaly>> {
        let conn = self.lock()?;
        let filter = match resolved {
            None => "",
            Some(true) => " AND resolved_at IS NOT NULL",
            Some(false) => " AND resolved_at IS NULL",
        };
        let sql = format!(
            "SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE evidence_id=?1{filter} \
             ORDER BY detected_at ASC, id ASC"
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| mirror_err("prepare anomalies", e))?;
        let mut rows = stmt
            .query(params![evidence_id])
            .map_err(|e| mirror_err("query anomalies", e))?;
        collect_rows(&mut rows, anomaly_from_row)
    }

    fn anomaly(&self, anomaly_id: &str) -> Result<Option<Anomaly>> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                &format!("SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE id=?1"),
                params![anomaly_id],
                |row| Ok(anomaly_from_row(row)),
            )
            .optional()
            .map_err(|e| mirror_err("query anomaly", e))?;
        found.transpose()
    }

    fn resolve_anomaly(&self, anomaly_id: &str, resolution: &Resolution) -> Result<bool> {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| write_err("begin resolve tx", e))?;
        let current: Option<(String, String, Option<String>)> = tx
            .query_row(
                "SELECT evidence_id, fingerprint, resolved_at FROM anomalies WHERE id=?1",
                params![anomaly_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(|e| mirror_err("read anomaly", e))?;

        let Some((evidence_id, fingerprint, resolved_at)) = current else {
            return Err(CustodyError::InvalidInput(format!(
                "unknown anomaly id '{anomaly_id}'"
            )));
        };
        if resolved_at.is_some() {
            return Ok(false);
        }

        let resolved_at = util::format_rfc3339(resolution.resolved_at);
        tx.execute(
            "UPDATE anomalies SET resolved_by=?1, resolved_at=?2, resolution=?3 WHERE id=?4",
            params![resolution.resolved_by, resolved_at, resolution.note, anomaly_id],
        )
        .map_err(|e| write_err("resolve anomaly", e))?;
        tx.execute(
            r#"
            INSERT OR REPLACE INTO anomaly_resolutions(fingerprint, evidence_id, resolved_by, resolved_at, resolution)
            VALUES (?1,?2,?3,?4,?5)
            "#,
            params![fingerprint, evidence_id, resolution.resolved_by, resolved_at, resolution.note],
        )
        .map_err(|e| write_err("record resolution history", e))?;
        tx.commit().map_err(|e| write_err("commit resolve tx", e))?;
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
