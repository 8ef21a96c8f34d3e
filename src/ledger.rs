//! Tamper-evident, hash-linked, append-only SQLite ledger.
//!
//! One database holds two independent chains, one for evidence registrations
//! and one for custody transfers. Each chain owns its own connection behind a
//! mutex, so appends to the same chain are serialized while the two chains
//! proceed independently.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use pbkdf2::pbkdf2_hmac;
use rusqlite::{params, Connection, OptionalExtension as _, Row, TransactionBehavior};
use secrecy::{ExposeSecret as _, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{CustodyError, OptionExt as _, Result, ResultExt as _};
use crate::hasher;
use crate::model::{BlockKind, CustodyTransfer, EvidenceRecord, Payload, SealMarker};
use crate::util;
use crate::verify::{self, ChainStatus};

pub const LEDGER_SCHEMA_VERSION: i64 = 1;

/// Upper bound on the sealing-cost difficulty (leading zero hex digits).
pub const MAX_SEALING_DIFFICULTY: u32 = 6;

const SCHEMA_SQL: &str = r#"
    PRAGMA journal_mode=WAL;
    PRAGMA synchronous=FULL;
    PRAGMA foreign_keys=ON;

    CREATE TABLE IF NOT EXISTS meta(
      k TEXT PRIMARY KEY,
      v TEXT NOT NULL
    );

    CREATE TABLE IF NOT EXISTS chains(
      chain_id TEXT PRIMARY KEY,
      role TEXT NOT NULL UNIQUE,
      created_at_utc TEXT NOT NULL,
      sealing_difficulty INTEGER NOT NULL DEFAULT 0
    );

    CREATE TABLE IF NOT EXISTS blocks(
      chain_id TEXT NOT NULL REFERENCES chains(chain_id),
      seq INTEGER NOT NULL,
      created_at TEXT NOT NULL,
      kind TEXT NOT NULL,
      payload_json TEXT NOT NULL,
      linkage_id TEXT NOT NULL,
      previous_linkage_id TEXT,
      nonce INTEGER NOT NULL DEFAULT 0,
      PRIMARY KEY(chain_id, seq)
    );

    CREATE INDEX IF NOT EXISTS idx_blocks_linkage ON blocks(chain_id, linkage_id);
"#;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainRole {
    Evidence,
    Custody,
}

impl ChainRole {
    pub const ALL: [ChainRole; 2] = [ChainRole::Evidence, ChainRole::Custody];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evidence => "evidence",
            Self::Custody => "custody",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "evidence" => Ok(Self::Evidence),
            "custody" => Ok(Self::Custody),
            other => Err(CustodyError::InvalidInput(format!(
                "unknown chain role '{other}' (expected evidence or custody)"
            ))),
        }
    }

    /// Which payload kinds a chain of this role accepts.
    fn accepts(&self, kind: BlockKind) -> bool {
        matches!(
            (self, kind),
            (_, BlockKind::Sealed)
                | (Self::Evidence, BlockKind::EvidenceRecord)
                | (Self::Custody, BlockKind::CustodyTransfer)
        )
    }
}

impl std::fmt::Display for ChainRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional proof-of-work style cost applied when linking a block: the
/// linkage id must start with `difficulty` zero hex digits. `0` disables it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealingPolicy {
    pub difficulty: u32,
}

impl SealingPolicy {
    pub const DISABLED: SealingPolicy = SealingPolicy { difficulty: 0 };

    pub fn new(difficulty: u32) -> Result<Self> {
        if difficulty > MAX_SEALING_DIFFICULTY {
            return Err(CustodyError::InvalidInput(format!(
                "sealing difficulty {difficulty} exceeds maximum {MAX_SEALING_DIFFICULTY}"
            )));
        }
        Ok(Self { difficulty })
    }

    pub fn is_satisfied_by(&self, linkage_id: &str) -> bool {
        let n = self.difficulty as usize;
        linkage_id.len() >= n && linkage_id.bytes().take(n).all(|b| b == b'0')
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub sequence_number: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    pub kind: BlockKind,
    pub payload: Payload,
    pub linkage_id: String,
    pub previous_linkage_id: Option<String>,
    #[serde(default)]
    pub nonce: u64,
}

/// Canonical preimage of a linkage id: the whole block minus the linkage id.
#[derive(Serialize)]
struct LinkagePreimage<'a> {
    chain_id: &'a str,
    sequence_number: u64,
    created_at: String,
    kind: BlockKind,
    payload: &'a Payload,
    previous_linkage_id: Option<&'a str>,
    nonce: u64,
}

pub fn compute_linkage(
    chain_id: &str,
    sequence_number: u64,
    created_at: OffsetDateTime,
    payload: &Payload,
    previous_linkage_id: Option<&str>,
    nonce: u64,
) -> Result<String> {
    let preimage = LinkagePreimage {
        chain_id,
        sequence_number,
        created_at: util::format_rfc3339(created_at),
        kind: payload.kind(),
        payload,
        previous_linkage_id,
        nonce,
    };
    let bytes = serde_json::to_vec(&preimage).ctx_ledger("serialize linkage preimage")?;
    Ok(hasher::digest(&bytes))
}

impl Block {
    /// Recompute this block's linkage id from its stored fields.
    pub fn recompute_linkage(&self, chain_id: &str) -> Result<String> {
        compute_linkage(
            chain_id,
            self.sequence_number,
            self.created_at,
            &self.payload,
            self.previous_linkage_id.as_deref(),
            self.nonce,
        )
    }

    /// Digest of the serialized payload alone, as mirrored to the store.
    pub fn payload_digest(&self) -> Result<String> {
        Ok(hasher::digest(self.payload.to_json()?.as_bytes()))
    }
}

/// A snapshot of one chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ledger {
    pub chain_id: String,
    pub role: ChainRole,
    pub sealing: SealingPolicy,
    pub blocks: Vec<Block>,
}

impl Ledger {
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn last(&self) -> Option<&Block> {
        self.blocks.last()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerMeta {
    pub ledger_id: Uuid,
    pub created_at_utc: String,
    pub schema_version: i64,
    pub sqlcipher_cipher_version: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    /// Sealing cost applied to both chains of a newly created ledger.
    pub sealing: SealingPolicy,
    /// How long a writer waits on a locked database before giving up.
    pub busy_timeout: Duration,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            sealing: SealingPolicy::DISABLED,
            busy_timeout: Duration::from_secs(5),
        }
    }
}

// ---------------------------------------------------------------------------
// Chain handle
// ---------------------------------------------------------------------------

struct Chain {
    chain_id: String,
    role: ChainRole,
    sealing: SealingPolicy,
    conn: Mutex<Connection>,
}

impl Chain {
    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| CustodyError::Ledger(format!("chain {} lock poisoned", self.chain_id)))
    }

    /// Append under the chain lock. `build` receives the current last
    /// sequence number so seal markers can reference it.
    fn append_with<F>(&self, build: F) -> Result<Block>
    where
        F: FnOnce(Option<u64>) -> Payload,
    {
        let mut conn = self.lock()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .ctx_ledger("begin tx")?;

        let last: Option<(i64, String)> = tx
            .query_row(
                "SELECT seq, linkage_id FROM blocks WHERE chain_id=?1 ORDER BY seq DESC LIMIT 1",
                params![self.chain_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let (last_seq, previous_linkage_id) = match last {
            Some((seq, linkage)) => (
                Some(u64::try_from(seq).ctx_corrupt("negative sequence number")?),
                Some(linkage),
            ),
            None => (None, None),
        };
        let sequence_number = last_seq.map_or(0, |s| s + 1);

        let payload = build(last_seq);
        let kind = payload.kind();
        if !self.role.accepts(kind) {
            return Err(CustodyError::InvalidInput(format!(
                "{kind} payload cannot be appended to the {} chain",
                self.role
            )));
        }

        let created_at = util::now_utc();
        let (nonce, linkage_id) = solve_linkage(
            &self.chain_id,
            sequence_number,
            created_at,
            &payload,
            previous_linkage_id.as_deref(),
            self.sealing,
        )?;
        let payload_json = payload.to_json()?;

        tx.execute(
            r#"
            INSERT INTO blocks(
              chain_id, seq, created_at, kind, payload_json, linkage_id, previous_linkage_id, nonce
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
            "#,
            params![
                self.chain_id,
                sequence_number as i64,
                util::format_rfc3339(created_at),
                kind.as_str(),
                payload_json,
                linkage_id,
                previous_linkage_id,
                nonce as i64,
            ],
        )
        .ctx_ledger("insert block")?;

        tx.commit().ctx_ledger("commit tx")?;

        debug!(
            chain_id = %self.chain_id,
            seq = sequence_number,
            kind = %kind,
            linkage_id = %linkage_id,
            "block appended"
        );

        Ok(Block {
            sequence_number,
            created_at,
            kind,
            payload,
            linkage_id,
            previous_linkage_id,
            nonce,
        })
    }

    fn load(&self) -> Result<Ledger> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().ctx_ledger("begin read tx")?;
        let blocks = {
            let mut stmt = tx
                .prepare(
                    r#"
                    SELECT seq, created_at, kind, payload_json, linkage_id, previous_linkage_id, nonce
                    FROM blocks
                    WHERE chain_id=?1
                    ORDER BY seq ASC
                    "#,
                )
                .ctx_ledger("prepare select blocks")?;
            let mut rows = stmt.query(params![self.chain_id]).ctx_ledger("query blocks")?;
            let mut out = Vec::new();
            while let Some(row) = rows.next().ctx_corrupt("next block row")? {
                out.push(block_from_row(row)?);
            }
            out
        };
        tx.commit().ctx_ledger("end read tx")?;

        Ok(Ledger {
            chain_id: self.chain_id.clone(),
            role: self.role,
            sealing: self.sealing,
            blocks,
        })
    }

    fn find_by_linkage(&self, linkage_id: &str) -> Result<Option<Block>> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                r#"
                SELECT seq, created_at, kind, payload_json, linkage_id, previous_linkage_id, nonce
                FROM blocks WHERE chain_id=?1 AND linkage_id=?2
                "#,
                params![self.chain_id, linkage_id],
                |row| Ok(block_from_row(row)),
            )
            .optional()?;
        found.transpose()
    }

    fn block_at(&self, seq: u64) -> Result<Option<Block>> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                r#"
                SELECT seq, created_at, kind, payload_json, linkage_id, previous_linkage_id, nonce
                FROM blocks WHERE chain_id=?1 AND seq=?2
                "#,
                params![self.chain_id, seq as i64],
                |row| Ok(block_from_row(row)),
            )
            .optional()?;
        found.transpose()
    }
}

fn block_from_row(row: &Row<'_>) -> Result<Block> {
    let seq: i64 = row.get(0).ctx_corrupt("read seq")?;
    let created_at: String = row.get(1).ctx_corrupt("read created_at")?;
    let kind: String = row.get(2).ctx_corrupt("read kind")?;
    let payload_json: String = row.get(3).ctx_corrupt("read payload_json")?;
    let linkage_id: String = row.get(4).ctx_corrupt("read linkage_id")?;
    let previous_linkage_id: Option<String> = row.get(5).ctx_corrupt("read previous_linkage_id")?;
    let nonce: i64 = row.get(6).ctx_corrupt("read nonce")?;

    let kind = BlockKind::parse(&kind)?;
    let payload: Payload =
        serde_json::from_str(&payload_json).ctx_corrupt(&format!("parse payload at seq {seq}"))?;
    if payload.kind() != kind {
        return Err(CustodyError::StorageCorrupt(format!(
            "block {seq}: kind column '{kind}' disagrees with payload '{}'",
            payload.kind()
        )));
    }

    Ok(Block {
        sequence_number: u64::try_from(seq).ctx_corrupt("negative sequence number")?,
        created_at: util::parse_rfc3339(&created_at)
            .ctx_corrupt(&format!("parse created_at at seq {seq}"))?,
        kind,
        payload,
        linkage_id,
        previous_linkage_id,
        nonce: u64::try_from(nonce).ctx_corrupt("negative nonce")?,
    })
}

/// Find the first nonce whose linkage id satisfies the sealing policy.
fn solve_linkage(
    chain_id: &str,
    seq: u64,
    created_at: OffsetDateTime,
    payload: &Payload,
    previous: Option<&str>,
    policy: SealingPolicy,
) -> Result<(u64, String)> {
    let mut nonce = 0u64;
    loop {
        let linkage = compute_linkage(chain_id, seq, created_at, payload, previous, nonce)?;
        if policy.is_satisfied_by(&linkage) {
            return Ok((nonce, linkage));
        }
        nonce = nonce.checked_add(1).required_ledger("sealing nonce space exhausted")?;
    }
}

// ---------------------------------------------------------------------------
// Ledger store
// ---------------------------------------------------------------------------

pub struct LedgerStore {
    path: PathBuf,
    meta: LedgerMeta,
    evidence: Chain,
    custody: Chain,
}

impl std::fmt::Debug for LedgerStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerStore")
            .field("path", &self.path)
            .field("meta", &self.meta)
            .field("evidence_chain", &self.evidence.chain_id)
            .field("custody_chain", &self.custody.chain_id)
            .finish_non_exhaustive()
    }
}

impl LedgerStore {
    pub fn create_new(
        db_path: &Path,
        db_key: Option<&SecretString>,
        options: &LedgerOptions,
    ) -> Result<Self> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                CustodyError::Ledger(format!("create db parent dir {}: {e}", parent.display()))
            })?;
        }

        let conn = Connection::open(db_path)
            .map_err(|e| CustodyError::Ledger(format!("open db {}: {e}", db_path.display())))?;
        // For new encrypted databases, generate a single per-database salt and use it
        // consistently for both key derivation and persistence.
        let new_salt = db_key.map(|_| generate_db_salt());
        let cipher_version =
            apply_sqlcipher_key_and_probe(&conn, db_key, new_salt.as_ref().map(|s| s.as_slice()))?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch(SCHEMA_SQL).ctx_ledger("create tables")?;

        let existing: Option<String> = conn
            .query_row("SELECT v FROM meta WHERE k='ledger_id'", [], |row| row.get(0))
            .optional()?;
        if existing.is_some() {
            return Err(CustodyError::Ledger(format!(
                "ledger already initialized at {}",
                db_path.display()
            )));
        }

        let meta = LedgerMeta {
            ledger_id: Uuid::new_v4(),
            created_at_utc: util::now_utc_rfc3339(),
            schema_version: LEDGER_SCHEMA_VERSION,
            sqlcipher_cipher_version: cipher_version.clone(),
        };
        write_meta(&conn, &meta)?;
        if let Some(salt) = new_salt {
            conn.execute(
                "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
                params!["db_salt", hex::encode(salt)],
            )?;
        }

        let short = meta.ledger_id.simple().to_string();
        for role in ChainRole::ALL {
            conn.execute(
                "INSERT INTO chains(chain_id, role, created_at_utc, sealing_difficulty) VALUES (?1,?2,?3,?4)",
                params![
                    format!("{}-{}", role.as_str(), &short[..12]),
                    role.as_str(),
                    &meta.created_at_utc,
                    options.sealing.difficulty as i64,
                ],
            )
            .ctx_ledger("register chain")?;
        }
        drop(conn);

        info!(ledger_id = %meta.ledger_id, path = %db_path.display(), "ledger created");
        Self::open_existing_with(db_path, db_key, options)
    }

    pub fn open_existing(db_path: &Path, db_key: Option<&SecretString>) -> Result<Self> {
        Self::open_existing_with(db_path, db_key, &LedgerOptions::default())
    }

    pub fn open_existing_with(
        db_path: &Path,
        db_key: Option<&SecretString>,
        options: &LedgerOptions,
    ) -> Result<Self> {
        if !db_path.exists() {
            return Err(CustodyError::Ledger(format!(
                "ledger database {} does not exist",
                db_path.display()
            )));
        }
        let (conn, meta) = open_connection(db_path, db_key, options.busy_timeout)?;
        let evidence = open_chain(conn, ChainRole::Evidence)?;
        let (conn, _) = open_connection(db_path, db_key, options.busy_timeout)?;
        let custody = open_chain(conn, ChainRole::Custody)?;
        Ok(Self {
            path: db_path.to_path_buf(),
            meta,
            evidence,
            custody,
        })
    }

    pub fn meta(&self) -> &LedgerMeta {
        &self.meta
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chain_id(&self, role: ChainRole) -> &str {
        &self.chain(role).chain_id
    }

    fn chain(&self, role: ChainRole) -> &Chain {
        match role {
            ChainRole::Evidence => &self.evidence,
            ChainRole::Custody => &self.custody,
        }
    }

    fn chain_by_id(&self, chain_id: &str) -> Result<&Chain> {
        ChainRole::ALL
            .iter()
            .map(|r| self.chain(*r))
            .find(|c| c.chain_id == chain_id)
            .ok_or_else(|| CustodyError::InvalidInput(format!("unknown chain id '{chain_id}'")))
    }

    /// Resolve a role name (`evidence` / `custody`) or a literal chain id.
    pub fn resolve_chain_id(&self, name: &str) -> Result<String> {
        match ChainRole::parse(name) {
            Ok(role) => Ok(self.chain_id(role).to_string()),
            Err(_) => self.chain_by_id(name).map(|c| c.chain_id.clone()),
        }
    }

    /// Append a payload to the named chain.
    pub fn append(&self, chain_id: &str, payload: Payload) -> Result<Block> {
        self.chain_by_id(chain_id)?.append_with(|_| payload)
    }

    pub fn append_to(&self, role: ChainRole, payload: Payload) -> Result<Block> {
        self.chain(role).append_with(|_| payload)
    }

    /// Append a checkpoint block. Valid on an empty chain.
    pub fn seal(&self, chain_id: &str, note: Option<String>) -> Result<Block> {
        let chain = self.chain_by_id(chain_id)?;
        if let Some(ref n) = note {
            util::validate_text(n, "seal note", util::MAX_TEXT_LEN)?;
        }
        let block = chain.append_with(|last| {
            Payload::Sealed(SealMarker {
                sealed_at: util::now_utc(),
                sealed_through: last,
                note,
            })
        })?;
        info!(chain_id = %chain_id, seq = block.sequence_number, "chain sealed");
        Ok(block)
    }

    /// Snapshot of the full ordered block list of one chain.
    pub fn load(&self, chain_id: &str) -> Result<Ledger> {
        self.chain_by_id(chain_id)?.load()
    }

    pub fn load_role(&self, role: ChainRole) -> Result<Ledger> {
        self.chain(role).load()
    }

    pub fn find_by_linkage(&self, chain_id: &str, linkage_id: &str) -> Result<Option<Block>> {
        self.chain_by_id(chain_id)?.find_by_linkage(linkage_id)
    }

    pub fn block_at(&self, chain_id: &str, sequence_number: u64) -> Result<Option<Block>> {
        self.chain_by_id(chain_id)?.block_at(sequence_number)
    }

    /// First evidence registration whose digest matches.
    pub fn find_evidence_block(&self, evidence_digest: &str) -> Result<Option<Block>> {
        let ledger = self.evidence.load()?;
        Ok(ledger.blocks.into_iter().find(|b| {
            b.payload
                .as_evidence()
                .is_some_and(|r| r.evidence_digest == evidence_digest)
        }))
    }

    pub fn evidence_record(&self, evidence_id: &str) -> Result<Option<(Block, EvidenceRecord)>> {
        let ledger = self.evidence.load()?;
        Ok(ledger.blocks.into_iter().find_map(|b| {
            let rec = b.payload.as_evidence()?.clone();
            (rec.evidence_id == evidence_id).then_some((b, rec))
        }))
    }

    /// Custody timeline for one evidence item, read from the custody chain and
    /// ordered by transfer time (ties keep ledger order).
    pub fn custody_timeline(&self, evidence_id: &str) -> Result<Vec<CustodyTransfer>> {
        let ledger = self.custody.load()?;
        let mut timeline: Vec<CustodyTransfer> = ledger
            .blocks
            .into_iter()
            .filter_map(|b| match b.payload {
                Payload::CustodyTransfer(t) if t.evidence_id == evidence_id => Some(t),
                _ => None,
            })
            .collect();
        timeline.sort_by_key(|t| t.transferred_at);
        Ok(timeline)
    }

    /// Health summary for both chains.
    pub fn status(&self) -> Result<Vec<ChainStatus>> {
        ChainRole::ALL
            .iter()
            .map(|role| {
                let ledger = self.chain(*role).load()?;
                Ok(verify::chain_status(&ledger))
            })
            .collect()
    }
}

fn write_meta(conn: &Connection, meta: &LedgerMeta) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
        params!["ledger_id", meta.ledger_id.to_string()],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
        params!["created_at_utc", &meta.created_at_utc],
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
        params!["schema_version", meta.schema_version.to_string()],
    )?;
    if let Some(ref cv) = meta.sqlcipher_cipher_version {
        conn.execute(
            "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
            params!["sqlcipher_cipher_version", cv],
        )?;
    }
    Ok(())
}

fn open_connection(
    db_path: &Path,
    db_key: Option<&SecretString>,
    busy_timeout: Duration,
) -> Result<(Connection, LedgerMeta)> {
    let conn = Connection::open(db_path)
        .map_err(|e| CustodyError::Ledger(format!("open db {}: {e}", db_path.display())))?;
    // Try to read the stored salt; legacy databases may not have one.
    let stored_salt = read_db_salt(&conn);
    let cipher_version = apply_sqlcipher_key_and_probe(&conn, db_key, stored_salt.as_deref())?;
    conn.busy_timeout(busy_timeout)?;

    let ledger_id: String = conn
        .query_row("SELECT v FROM meta WHERE k='ledger_id'", [], |row| row.get(0))
        .ctx_ledger("read ledger_id")?;
    let created_at_utc: String = conn
        .query_row("SELECT v FROM meta WHERE k='created_at_utc'", [], |row| row.get(0))
        .ctx_ledger("read created_at_utc")?;
    let schema_version: i64 = conn
        .query_row("SELECT v FROM meta WHERE k='schema_version'", [], |row| {
            row.get::<_, String>(0)
        })
        .ctx_ledger("read schema_version")?
        .parse()
        .ctx_ledger("parse schema_version")?;

    if schema_version != LEDGER_SCHEMA_VERSION {
        return Err(CustodyError::Ledger(format!(
            "unsupported schema_version {schema_version} (expected {LEDGER_SCHEMA_VERSION})"
        )));
    }

    let stored_cipher: Option<String> = conn
        .query_row("SELECT v FROM meta WHERE k='sqlcipher_cipher_version'", [], |row| {
            row.get(0)
        })
        .optional()?;

    let meta = LedgerMeta {
        ledger_id: Uuid::parse_str(&ledger_id).ctx_ledger("parse ledger_id uuid")?,
        created_at_utc,
        schema_version,
        sqlcipher_cipher_version: cipher_version.or(stored_cipher),
    };
    Ok((conn, meta))
}

fn open_chain(conn: Connection, role: ChainRole) -> Result<Chain> {
    let (chain_id, difficulty): (String, i64) = conn
        .query_row(
            "SELECT chain_id, sealing_difficulty FROM chains WHERE role=?1",
            params![role.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .ctx_ledger(&format!("read {role} chain registration"))?;
    let difficulty = u32::try_from(difficulty).ctx_corrupt("sealing difficulty out of range")?;
    Ok(Chain {
        chain_id,
        role,
        sealing: SealingPolicy::new(difficulty)
            .map_err(|e| CustodyError::StorageCorrupt(e.to_string()))?,
        conn: Mutex::new(conn),
    })
}

// ---------------------------------------------------------------------------
// Backup / restore
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
struct LedgerExport {
    format: String,
    exported_at_utc: String,
    meta: LedgerMeta,
    chains: Vec<Ledger>,
}

const EXPORT_FORMAT: &str = "custody-ledger-backup-v1";

/// Export both chains (meta + blocks) to a JSON file for backup.
pub fn export_ledger_json(store: &LedgerStore, out_path: &Path) -> Result<()> {
    let chains = ChainRole::ALL
        .iter()
        .map(|r| store.load_role(*r))
        .collect::<Result<Vec<_>>>()?;
    let block_count: usize = chains.iter().map(Ledger::len).sum();
    let export = LedgerExport {
        format: EXPORT_FORMAT.to_string(),
        exported_at_utc: util::now_utc_rfc3339(),
        meta: store.meta().clone(),
        chains,
    };
    let json = serde_json::to_vec_pretty(&export).ctx_ledger("serialize ledger export")?;
    std::fs::write(out_path, json)
        .map_err(|e| CustodyError::Ledger(format!("write export {}: {e}", out_path.display())))?;
    info!(path = %out_path.display(), blocks = block_count, "ledger exported");
    Ok(())
}

/// Import a ledger from a JSON backup into a new database.
///
/// Replays every block verbatim (original linkage ids and nonces). Both
/// chains are verified before anything is written and again after reopening;
/// on any failure the partially written database is removed.
pub fn import_ledger_json(
    json_path: &Path,
    db_path: &Path,
    db_key: Option<&SecretString>,
) -> Result<LedgerStore> {
    let json_bytes = std::fs::read(json_path)
        .map_err(|e| CustodyError::Ledger(format!("read import {}: {e}", json_path.display())))?;
    let export: LedgerExport =
        serde_json::from_slice(&json_bytes).ctx_corrupt("parse ledger backup")?;
    if export.format != EXPORT_FORMAT {
        return Err(CustodyError::InvalidInput(format!(
            "unsupported backup format '{}'",
            export.format
        )));
    }
    for ledger in &export.chains {
        verify::verify_chain(ledger).into_result(&ledger.chain_id)?;
    }
    if db_path.exists() {
        return Err(CustodyError::InvalidInput(format!(
            "target database {} already exists",
            db_path.display()
        )));
    }
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| CustodyError::Ledger(format!("create dir {}: {e}", parent.display())))?;
    }

    let imported = replay_export(&export, db_path, db_key).and_then(|()| {
        let store = LedgerStore::open_existing(db_path, db_key)?;
        for role in ChainRole::ALL {
            let ledger = store.load_role(role)?;
            verify::verify_chain(&ledger).into_result(&ledger.chain_id)?;
        }
        Ok(store)
    });
    match imported {
        Ok(store) => {
            info!(ledger_id = %store.meta().ledger_id, "ledger imported and verified");
            Ok(store)
        }
        Err(e) => {
            remove_database_files(db_path);
            warn!(path = %db_path.display(), error = %e, "ledger import rejected");
            Err(e)
        }
    }
}

fn replay_export(export: &LedgerExport, db_path: &Path, db_key: Option<&SecretString>) -> Result<()> {
    let mut conn = Connection::open(db_path)
        .map_err(|e| CustodyError::Ledger(format!("open db {}: {e}", db_path.display())))?;
    let new_salt = db_key.map(|_| generate_db_salt());
    let cipher_version =
        apply_sqlcipher_key_and_probe(&conn, db_key, new_salt.as_ref().map(|s| s.as_slice()))?;
    conn.execute_batch(SCHEMA_SQL).ctx_ledger("create tables for import")?;

    let meta = LedgerMeta {
        sqlcipher_cipher_version: cipher_version,
        ..export.meta.clone()
    };
    write_meta(&conn, &meta)?;
    if let Some(salt) = new_salt {
        conn.execute(
            "INSERT OR REPLACE INTO meta(k,v) VALUES (?1,?2)",
            params!["db_salt", hex::encode(salt)],
        )?;
    }

    let tx = conn.transaction().ctx_ledger("begin import tx")?;
    for ledger in &export.chains {
        tx.execute(
            "INSERT INTO chains(chain_id, role, created_at_utc, sealing_difficulty) VALUES (?1,?2,?3,?4)",
            params![
                ledger.chain_id,
                ledger.role.as_str(),
                &meta.created_at_utc,
                ledger.sealing.difficulty as i64,
            ],
        )
        .ctx_ledger("register imported chain")?;
        for b in &ledger.blocks {
            tx.execute(
                r#"
                INSERT INTO blocks(
                  chain_id, seq, created_at, kind, payload_json, linkage_id, previous_linkage_id, nonce
                ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8)
                "#,
                params![
                    ledger.chain_id,
                    b.sequence_number as i64,
                    util::format_rfc3339(b.created_at),
                    b.kind.as_str(),
                    b.payload.to_json()?,
                    b.linkage_id,
                    b.previous_linkage_id,
                    b.nonce as i64,
                ],
            )
            .ctx_ledger("insert imported block")?;
        }
    }
    tx.commit().ctx_ledger("commit import tx")
}

/// Remove a database file and its WAL/SHM companions, ignoring absent ones.
fn remove_database_files(db_path: &Path) {
    let mut paths = vec![db_path.to_path_buf()];
    for suffix in ["-wal", "-shm"] {
        let mut name = db_path.as_os_str().to_owned();
        name.push(suffix);
        paths.push(PathBuf::from(name));
    }
    for p in paths {
        if let Err(e) = std::fs::remove_file(&p) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %p.display(), error = %e, "could not remove rejected import");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// SQLCipher helpers
// ---------------------------------------------------------------------------

fn apply_sqlcipher_key_and_probe(
    conn: &Connection,
    db_key: Option<&SecretString>,
    stored_salt: Option<&[u8]>,
) -> Result<Option<String>> {
    if let Some(key) = db_key {
        let salt = stored_salt
            .required_ledger("missing db_salt for encrypted database")?
            .to_vec();
        let derived = derive_db_key(key.expose_secret(), &salt);
        let pragma_key = format!("x'{}'", hex::encode(derived));
        let _ = conn.execute("PRAGMA key = ?1;", params![pragma_key]);
        let _ = conn.execute_batch(
            r#"
            PRAGMA cipher_compatibility = 4;
            PRAGMA cipher_memory_security = ON;
            "#,
        );
    }

    let cipher_version: Option<String> = conn
        .query_row("PRAGMA cipher_version;", [], |row| row.get(0))
        .optional()
        .unwrap_or(None);

    if db_key.is_some() && cipher_version.is_none() {
        return Err(CustodyError::Ledger(
            "database key provided but SQLCipher not active (cipher_version probe failed)".into(),
        ));
    }
    if let Some(ref cv) = cipher_version {
        info!(sqlcipher_cipher_version = %cv, "SQLCipher detected");
    }

    Ok(cipher_version)
}

/// Read the per-database salt from the meta table.  Returns `None` if not present.
fn read_db_salt(conn: &Connection) -> Option<Vec<u8>> {
    conn.query_row("SELECT v FROM meta WHERE k='db_salt'", [], |row| {
        let hex_str: String = row.get(0)?;
        Ok(hex::decode(&hex_str).ok())
    })
    .optional()
    .ok()
    .flatten()
    .flatten()
}

const DB_SALT_LEN: usize = 16;

fn derive_db_key(passphrase: &str, salt: &[u8]) -> [u8; 32] {
    const ITERATIONS: u32 = 100_000;
    let mut out = [0u8; 32];
    pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, ITERATIONS, &mut out);
    out
}

fn generate_db_salt() -> [u8; DB_SALT_LEN] {
    use rand::RngCore as _;
    let mut salt = [0u8; DB_SALT_LEN];
    rand::rng().fill_bytes(&mut salt);
    salt
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EvidenceMetadata, EvidenceRecord};
    use tempfile::tempdir;
    use time::macros::datetime;

    fn evidence(n: u32) -> Payload {
        Payload::EvidenceRecord(EvidenceRecord {
            evidence_id: format!("EV-{n}"),
            evidence_digest: hasher::digest(format!("file-{n}").as_bytes()),
            case_id: "CASE-1".into(),
            submitted_by: "officer.a".into(),
            collected_at: datetime!(2025-01-01 08:00:00 UTC),
            metadata: EvidenceMetadata::default(),
        })
    }

    fn transfer(n: u32) -> Payload {
        Payload::CustodyTransfer(CustodyTransfer {
            evidence_id: "EV-1".into(),
            from_user: format!("user-{n}"),
            to_user: format!("user-{}", n + 1),
            transferred_at: datetime!(2025-01-01 09:00:00 UTC),
            transfer_type: "handoff".into(),
            from_location: None,
            to_location: None,
            reason: None,
            notes: None,
        })
    }

    #[test]
    fn create_and_open_ledger() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        let store = LedgerStore::create_new(&db, None, &LedgerOptions::default()).unwrap();
        let meta = store.meta().clone();
        let evidence_id = store.chain_id(ChainRole::Evidence).to_string();
        drop(store);

        let reopened = LedgerStore::open_existing(&db, None).unwrap();
        assert_eq!(reopened.meta().ledger_id, meta.ledger_id);
        assert_eq!(reopened.chain_id(ChainRole::Evidence), evidence_id);
        assert_ne!(
            reopened.chain_id(ChainRole::Evidence),
            reopened.chain_id(ChainRole::Custody)
        );
    }

    #[test]
    fn create_twice_is_rejected() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("test.db");
        drop(LedgerStore::create_new(&db, None, &LedgerOptions::default()).unwrap());
        assert!(LedgerStore::create_new(&db, None, &LedgerOptions::default()).is_err());
    }

    #[test]
    fn append_links_blocks() {
        let dir = tempdir().unwrap();
        let store =
            LedgerStore::create_new(&dir.path().join("t.db"), None, &LedgerOptions::default())
                .unwrap();
        let b0 = store.append_to(ChainRole::Evidence, evidence(1)).unwrap();
        let b1 = store.append_to(ChainRole::Evidence, evidence(2)).unwrap();
        assert_eq!(b0.sequence_number, 0);
        assert_eq!(b0.previous_linkage_id, None);
        assert_eq!(b1.sequence_number, 1);
        assert_eq!(b1.previous_linkage_id.as_deref(), Some(b0.linkage_id.as_str()));
        assert_eq!(
            b1.recompute_linkage(store.chain_id(ChainRole::Evidence)).unwrap(),
            b1.linkage_id
        );
    }

    #[test]
    fn chains_are_independent() {
        let dir = tempdir().unwrap();
        let store =
            LedgerStore::create_new(&dir.path().join("t.db"), None, &LedgerOptions::default())
                .unwrap();
        store.append_to(ChainRole::Evidence, evidence(1)).unwrap();
        store.append_to(ChainRole::Evidence, evidence(2)).unwrap();
        let c0 = store.append_to(ChainRole::Custody, transfer(1)).unwrap();
        assert_eq!(c0.sequence_number, 0);
        assert_eq!(c0.previous_linkage_id, None);
    }

    #[test]
    fn wrong_payload_for_chain_is_rejected() {
        let dir = tempdir().unwrap();
        let store =
            LedgerStore::create_new(&dir.path().join("t.db"), None, &LedgerOptions::default())
                .unwrap();
        let err = store.append_to(ChainRole::Evidence, transfer(1)).unwrap_err();
        assert!(matches!(err, CustodyError::InvalidInput(_)));
        assert!(store.load_role(ChainRole::Evidence).unwrap().is_empty());
    }

    #[test]
    fn seal_empty_chain_produces_first_block() {
        let dir = tempdir().unwrap();
        let store =
            LedgerStore::create_new(&dir.path().join("t.db"), None, &LedgerOptions::default())
                .unwrap();
        let chain_id = store.chain_id(ChainRole::Custody).to_string();
        let b = store.seal(&chain_id, None).unwrap();
        assert_eq!(b.sequence_number, 0);
        assert_eq!(b.kind, BlockKind::Sealed);
        match b.payload {
            Payload::Sealed(ref m) => assert_eq!(m.sealed_through, None),
            _ => panic!("expected seal marker"),
        }
        store.append(&chain_id, transfer(1)).unwrap();
        let s = store.seal(&chain_id, Some("end of shift".into())).unwrap();
        match s.payload {
            Payload::Sealed(ref m) => assert_eq!(m.sealed_through, Some(1)),
            _ => panic!("expected seal marker"),
        }
    }

    #[test]
    fn unknown_chain_is_invalid_input() {
        let dir = tempdir().unwrap();
        let store =
            LedgerStore::create_new(&dir.path().join("t.db"), None, &LedgerOptions::default())
                .unwrap();
        assert!(matches!(
            store.load("nope").unwrap_err(),
            CustodyError::InvalidInput(_)
        ));
    }

    #[test]
    fn sealing_cost_is_honoured() {
        let dir = tempdir().unwrap();
        let opts = LedgerOptions {
            sealing: SealingPolicy::new(2).unwrap(),
            ..LedgerOptions::default()
        };
        let store = LedgerStore::create_new(&dir.path().join("t.db"), None, &opts).unwrap();
        let b = store.append_to(ChainRole::Evidence, evidence(1)).unwrap();
        assert!(b.linkage_id.starts_with("00"));
        assert!(SealingPolicy::new(MAX_SEALING_DIFFICULTY + 1).is_err());
    }

    #[test]
    fn lookups_by_linkage_and_seq() {
        let dir = tempdir().unwrap();
        let store =
            LedgerStore::create_new(&dir.path().join("t.db"), None, &LedgerOptions::default())
                .unwrap();
        let chain = store.chain_id(ChainRole::Evidence).to_string();
        let b = store.append(&chain, evidence(7)).unwrap();
        assert_eq!(store.find_by_linkage(&chain, &b.linkage_id).unwrap(), Some(b.clone()));
        assert_eq!(store.block_at(&chain, 0).unwrap(), Some(b));
        assert_eq!(store.block_at(&chain, 1).unwrap(), None);
    }

    #[test]
    fn corrupt_payload_is_storage_corrupt() {
        let dir = tempdir().unwrap();
        let db = dir.path().join("t.db");
        let store = LedgerStore::create_new(&db, None, &LedgerOptions::default()).unwrap();
        store.append_to(ChainRole::Evidence, evidence(1)).unwrap();

        let conn = Connection::open(&db).unwrap();
        conn.execute("UPDATE blocks SET payload_json='{not json' WHERE seq=0", [])
            .unwrap();

        let err = store.load_role(ChainRole::Evidence).unwrap_err();
        assert!(matches!(err, CustodyError::StorageCorrupt(_)));
    }
}
