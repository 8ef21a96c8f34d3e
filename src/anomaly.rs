//! Rule-based custody anomaly detection and risk scoring.
//!
//! [`AnomalyDetector`] is a pure pass over one custody timeline plus an
//! optional live re-hash of the evidence file. [`AnomalyEngine`] wires it to
//! the ledger (authoritative timeline), the relational mirror (divergence
//! check, persistence) and serializes runs per evidence item.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tracing::{info, warn};

use crate::error::{CustodyError, OptionExt as _, Result};
use crate::hasher;
use crate::ledger::LedgerStore;
use crate::mirror::MirrorStore;
use crate::model::CustodyTransfer;
use crate::util;

/// Severity weights summed into the risk score.
const WEIGHT_HIGH: u32 = 30;
const WEIGHT_MEDIUM: u32 = 15;
const WEIGHT_LOW: u32 = 5;
const MAX_RISK_SCORE: u32 = 100;

/// Below this interval a rapid transfer is high severity.
const RAPID_HIGH_SEVERITY_MS: i64 = 30_000;
/// Above this many hours a time gap is high severity.
const GAP_HIGH_SEVERITY_HOURS: f64 = 72.0;

const MS_PER_HOUR: f64 = 3_600_000.0;

// ---------------------------------------------------------------------------
// Finding types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AnomalyType {
    RapidTransfer,
    HashMismatch,
    FileMissing,
    FileAccessError,
    CircularTransfer,
    ExcessiveTransfers,
    TimeGap,
    LocationMismatch,
    /// Ledger custody chain and relational copy disagree.
    MirrorDivergence,
    /// Zero-confidence marker: supplemental checks ran and found nothing.
    SupplementalCheck,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RapidTransfer => "rapid_transfer",
            Self::HashMismatch => "hash_mismatch",
            Self::FileMissing => "file_missing",
            Self::FileAccessError => "file_access_error",
            Self::CircularTransfer => "circular_transfer",
            Self::ExcessiveTransfers => "excessive_transfers",
            Self::TimeGap => "time_gap",
            Self::LocationMismatch => "location_mismatch",
            Self::MirrorDivergence => "mirror_divergence",
            Self::SupplementalCheck => "supplemental_check",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        Ok(match s {
            "rapid_transfer" => Self::RapidTransfer,
            "hash_mismatch" => Self::HashMismatch,
            "file_missing" => Self::FileMissing,
            "file_access_error" => Self::FileAccessError,
            "circular_transfer" => Self::CircularTransfer,
            "excessive_transfers" => Self::ExcessiveTransfers,
            "time_gap" => Self::TimeGap,
            "location_mismatch" => Self::LocationMismatch,
            "mirror_divergence" => Self::MirrorDivergence,
            "supplemental_check" => Self::SupplementalCheck,
            other => {
                return Err(CustodyError::Mirror(format!("unknown anomaly type '{other}'")))
            }
        })
    }
}

impl std::fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
}

impl Severity {
    pub fn weight(&self) -> u32 {
        match self {
            Self::Low => WEIGHT_LOW,
            Self::Medium => WEIGHT_MEDIUM,
            Self::High => WEIGHT_HIGH,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            other => Err(CustodyError::Mirror(format!("unknown severity '{other}'"))),
        }
    }
}

/// Who closed a finding, when, and why. Present entirely or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_by: String,
    #[serde(with = "time::serde::rfc3339")]
    pub resolved_at: OffsetDateTime,
    pub note: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: String,
    pub evidence_id: String,
    /// Stable identity: type, evidence id and the transfer indices involved.
    pub fingerprint: String,
    #[serde(rename = "type")]
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub confidence: f64,
    pub title: String,
    pub description: String,
    pub details: serde_json::Value,
    #[serde(with = "time::serde::rfc3339")]
    pub detected_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
}

impl Anomaly {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Findings with zero confidence are informational and do not score.
    pub fn scores(&self) -> bool {
        self.confidence > 0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskStatus {
    Clean,
    Low,
    Elevated,
    Critical,
}

impl RiskStatus {
    pub fn from_score(score: u32) -> Self {
        match score {
            0 => Self::Clean,
            1..=29 => Self::Low,
            30..=59 => Self::Elevated,
            _ => Self::Critical,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyReport {
    pub evidence_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub analyzed_at: OffsetDateTime,
    pub transfer_count: usize,
    pub anomalies: Vec<Anomaly>,
    pub risk_score: u32,
    pub status: RiskStatus,
    /// False when the findings could not be written to the store.
    pub persisted: bool,
}

/// Sum of severity weights (high 30, medium 15, low 5), capped at 100.
///
/// Zero-confidence findings are left out: the supplemental marker records
/// that extra checks ran, not that anything was wrong.
pub fn risk_score(anomalies: &[Anomaly]) -> u32 {
    anomalies
        .iter()
        .filter(|a| a.scores())
        .map(|a| a.severity.weight())
        .sum::<u32>()
        .min(MAX_RISK_SCORE)
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct DetectionOptions {
    pub min_transfer_interval_ms: i64,
    pub max_gap_hours: f64,
    pub enable_supplemental_checks: bool,
    /// Consecutive transfers closer than this must agree on location.
    pub location_window_ms: i64,
    /// More transfers than this is excessive.
    pub excessive_transfer_threshold: usize,
    pub file_read_timeout: Duration,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            min_transfer_interval_ms: 60_000,
            max_gap_hours: 24.0,
            enable_supplemental_checks: false,
            location_window_ms: 5 * 60_000,
            excessive_transfer_threshold: 10,
            file_read_timeout: Duration::from_secs(30),
        }
    }
}

/// The evidence file to re-hash and the digest recorded at registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileReference {
    pub path: PathBuf,
    pub recorded_digest: String,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectionInput<'a> {
    pub evidence_id: &'a str,
    /// Authoritative custody timeline, ascending by transfer time.
    pub timeline: &'a [CustodyTransfer],
    pub file: Option<&'a FileReference>,
    /// The relational store's copy of the timeline, when available.
    pub mirror_timeline: Option<&'a [CustodyTransfer]>,
}

struct Finding {
    anomaly_type: AnomalyType,
    severity: Severity,
    confidence: f64,
    title: String,
    description: String,
    details: serde_json::Value,
    indices: Vec<usize>,
}

impl Finding {
    fn into_anomaly(self, evidence_id: &str, detected_at: OffsetDateTime) -> Anomaly {
        let indices: Vec<String> = self.indices.iter().map(usize::to_string).collect();
        let fingerprint = format!("{}:{}:{}", self.anomaly_type, evidence_id, indices.join(","));
        let id = hasher::digest(fingerprint.as_bytes())[..32].to_string();
        Anomaly {
            id,
            evidence_id: evidence_id.to_string(),
            fingerprint,
            anomaly_type: self.anomaly_type,
            severity: self.severity,
            confidence: self.confidence,
            title: self.title,
            description: self.description,
            details: self.details,
            detected_at,
            resolution: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    options: DetectionOptions,
}

impl AnomalyDetector {
    pub fn new(options: DetectionOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &DetectionOptions {
        &self.options
    }

    /// Run every check over the input. Each check is isolated: one that
    /// fails is logged and skipped, the rest still run.
    pub fn detect(&self, input: &DetectionInput<'_>, detected_at: OffsetDateTime) -> AnomalyReport {
        let mut timeline = input.timeline.to_vec();
        timeline.sort_by_key(|t| t.transferred_at);

        let mut findings = Vec::new();
        findings.extend(self.rapid_transfers(&timeline));
        match self.file_integrity(input.file) {
            Ok(f) => findings.extend(f),
            Err(e) => warn!(evidence_id = %input.evidence_id, error = %e, "file integrity check skipped"),
        }
        findings.extend(self.circular_transfers(&timeline));
        findings.extend(self.excessive_transfers(&timeline));
        findings.extend(self.time_gaps(&timeline));
        findings.extend(self.location_mismatches(&timeline));
        if let Some(mirror) = input.mirror_timeline {
            findings.extend(self.mirror_divergence(&timeline, mirror));
        }
        if self.options.enable_supplemental_checks && findings.is_empty() {
            findings.push(supplemental_placeholder(timeline.len()));
        }

        let anomalies: Vec<Anomaly> = findings
            .into_iter()
            .map(|f| f.into_anomaly(input.evidence_id, detected_at))
            .collect();
        let score = risk_score(&anomalies);
        AnomalyReport {
            evidence_id: input.evidence_id.to_string(),
            analyzed_at: detected_at,
            transfer_count: timeline.len(),
            anomalies,
            risk_score: score,
            status: RiskStatus::from_score(score),
            persisted: false,
        }
    }

    fn rapid_transfers(&self, t: &[CustodyTransfer]) -> Vec<Finding> {
        let mut out = Vec::new();
        for i in 1..t.len() {
            let dt = util::millis_between(t[i - 1].transferred_at, t[i].transferred_at);
            if dt >= self.options.min_transfer_interval_ms {
                continue;
            }
            let severity = if dt < RAPID_HIGH_SEVERITY_MS {
                Severity::High
            } else {
                Severity::Medium
            };
            out.push(Finding {
                anomaly_type: AnomalyType::RapidTransfer,
                severity,
                confidence: 0.95,
                title: "Rapid custody transfer".into(),
                description: format!(
                    "Custody moved from {} to {} only {:.1} s after the previous transfer",
                    t[i].from_user,
                    t[i].to_user,
                    dt as f64 / 1000.0
                ),
                details: json!({
                    "interval_ms": dt,
                    "threshold_ms": self.options.min_transfer_interval_ms,
                    "previous_transfer_index": i - 1,
                    "transfer_index": i,
                }),
                indices: vec![i - 1, i],
            });
        }
        out
    }

    fn file_integrity(&self, file: Option<&FileReference>) -> Result<Vec<Finding>> {
        let Some(file) = file else {
            return Ok(Vec::new());
        };
        let path = file.path.display().to_string();
        let finding = match hasher::digest_file_with_timeout(&file.path, self.options.file_read_timeout)
        {
            Ok(actual) if actual == file.recorded_digest => return Ok(Vec::new()),
            Ok(actual) => Finding {
                anomaly_type: AnomalyType::HashMismatch,
                severity: Severity::High,
                confidence: 1.0,
                title: "Evidence file digest mismatch".into(),
                description: "The evidence file no longer matches the digest recorded at registration"
                    .into(),
                details: json!({
                    "path": path,
                    "expected_digest": file.recorded_digest,
                    "actual_digest": actual,
                }),
                indices: Vec::new(),
            },
            Err(CustodyError::FileMissing(_)) => Finding {
                anomaly_type: AnomalyType::FileMissing,
                severity: Severity::High,
                confidence: 1.0,
                title: "Evidence file missing".into(),
                description: "The referenced evidence file does not exist".into(),
                details: json!({ "path": path }),
                indices: Vec::new(),
            },
            Err(e) if e.is_file_error() => Finding {
                anomaly_type: AnomalyType::FileAccessError,
                severity: Severity::Medium,
                confidence: 0.8,
                title: "Evidence file unreadable".into(),
                description: "The referenced evidence file could not be read for verification".into(),
                details: json!({ "path": path, "error": e.to_string() }),
                indices: Vec::new(),
            },
            Err(e) => return Err(e),
        };
        Ok(vec![finding])
    }

    fn circular_transfers(&self, t: &[CustodyTransfer]) -> Vec<Finding> {
        let mut out = Vec::new();
        for i in 2..t.len() {
            if t[i].to_user == t[i - 2].to_user && t[i].to_user != t[i - 1].to_user {
                out.push(Finding {
                    anomaly_type: AnomalyType::CircularTransfer,
                    severity: Severity::Medium,
                    confidence: 0.85,
                    title: "Circular custody transfer".into(),
                    description: format!(
                        "Custody returned to {} after passing through {}",
                        t[i].to_user,
                        t[i - 1].to_user
                    ),
                    details: json!({
                        "returned_to": t[i].to_user,
                        "via": t[i - 1].to_user,
                        "transfer_indices": [i - 2, i - 1, i],
                    }),
                    indices: vec![i - 2, i - 1, i],
                });
            }
        }
        out
    }

    fn excessive_transfers(&self, t: &[CustodyTransfer]) -> Vec<Finding> {
        if t.len() <= self.options.excessive_transfer_threshold {
            return Vec::new();
        }
        let (first, last) = (&t[0], &t[t.len() - 1]);
        let span_ms = util::millis_between(first.transferred_at, last.transferred_at);
        let span_hours = span_ms as f64 / MS_PER_HOUR;
        let mean_interval_hours = span_hours / (t.len() - 1) as f64;
        vec![Finding {
            anomaly_type: AnomalyType::ExcessiveTransfers,
            severity: Severity::Medium,
            confidence: 0.75,
            title: "Excessive custody transfers".into(),
            description: format!(
                "{} transfers recorded (threshold {})",
                t.len(),
                self.options.excessive_transfer_threshold
            ),
            details: json!({
                "transfer_count": t.len(),
                "threshold": self.options.excessive_transfer_threshold,
                "total_span_hours": span_hours,
                "mean_interval_hours": mean_interval_hours,
            }),
            indices: Vec::new(),
        }]
    }

    fn time_gaps(&self, t: &[CustodyTransfer]) -> Vec<Finding> {
        let mut out = Vec::new();
        for i in 1..t.len() {
            let dt = util::millis_between(t[i - 1].transferred_at, t[i].transferred_at);
            let hours = dt as f64 / MS_PER_HOUR;
            if hours <= self.options.max_gap_hours {
                continue;
            }
            let severity = if hours > GAP_HIGH_SEVERITY_HOURS {
                Severity::High
            } else {
                Severity::Medium
            };
            out.push(Finding {
                anomaly_type: AnomalyType::TimeGap,
                severity,
                confidence: 0.9,
                title: "Unaccounted custody gap".into(),
                description: format!(
                    "{hours:.1} h passed between transfers while held by {}",
                    t[i - 1].to_user
                ),
                details: json!({
                    "gap_hours": hours,
                    "threshold_hours": self.options.max_gap_hours,
                    "holder": t[i - 1].to_user,
                    "transfer_index": i,
                }),
                indices: vec![i - 1, i],
            });
        }
        out
    }

    fn location_mismatches(&self, t: &[CustodyTransfer]) -> Vec<Finding> {
        let mut out = Vec::new();
        for i in 1..t.len() {
            let dt = util::millis_between(t[i - 1].transferred_at, t[i].transferred_at);
            if dt >= self.options.location_window_ms {
                continue;
            }
            let arrived = t[i - 1].to_location.as_deref();
            let departed = t[i].from_location.as_deref();
            if arrived == departed {
                continue;
            }
            out.push(Finding {
                anomaly_type: AnomalyType::LocationMismatch,
                severity: Severity::Medium,
                confidence: 0.8,
                title: "Custody location mismatch".into(),
                description: format!(
                    "Item delivered to {} left from {} {:.0} s later",
                    arrived.unwrap_or("an unrecorded location"),
                    departed.unwrap_or("an unrecorded location"),
                    dt as f64 / 1000.0
                ),
                details: json!({
                    "previous_to_location": arrived,
                    "from_location": departed,
                    "interval_ms": dt,
                    "transfer_index": i,
                }),
                indices: vec![i - 1, i],
            });
        }
        out
    }

    fn mirror_divergence(&self, ledger: &[CustodyTransfer], mirror: &[CustodyTransfer]) -> Vec<Finding> {
        let mut mirror = mirror.to_vec();
        mirror.sort_by_key(|t| t.transferred_at);
        let first_difference = ledger
            .iter()
            .zip(mirror.iter())
            .position(|(a, b)| a != b)
            .or_else(|| (ledger.len() != mirror.len()).then(|| ledger.len().min(mirror.len())));
        let Some(index) = first_difference else {
            return Vec::new();
        };
        vec![Finding {
            anomaly_type: AnomalyType::MirrorDivergence,
            severity: Severity::High,
            confidence: 1.0,
            title: "Relational custody record diverges from ledger".into(),
            description: format!(
                "Ledger holds {} transfers, relational store {}; first difference at index {index}",
                ledger.len(),
                mirror.len()
            ),
            details: json!({
                "ledger_count": ledger.len(),
                "mirror_count": mirror.len(),
                "first_difference_index": index,
            }),
            indices: vec![index],
        }]
    }
}

fn supplemental_placeholder(transfer_count: usize) -> Finding {
    Finding {
        anomaly_type: AnomalyType::SupplementalCheck,
        severity: Severity::Low,
        confidence: 0.0,
        title: "Supplemental analysis: nothing found".into(),
        description: "Rule-based checks ran and raised no findings".into(),
        details: json!({ "transfer_count": transfer_count }),
        indices: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Runs detection against live stores and persists the results.
#[derive(Debug, Default)]
pub struct AnomalyEngine {
    detector: AnomalyDetector,
    in_flight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl AnomalyEngine {
    pub fn new(options: DetectionOptions) -> Self {
        Self {
            detector: AnomalyDetector::new(options),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    fn evidence_lock(&self, evidence_id: &str) -> Result<Arc<Mutex<()>>> {
        let mut map = self
            .in_flight
            .lock()
            .map_err(|_| CustodyError::Other("detection lock registry poisoned".into()))?;
        Ok(map.entry(evidence_id.to_string()).or_default().clone())
    }

    fn release_lock(&self, evidence_id: &str) {
        if let Ok(mut map) = self.in_flight.lock() {
            // Only the map itself still holds it: no run is waiting.
            if map.get(evidence_id).is_some_and(|l| Arc::strong_count(l) == 1) {
                map.remove(evidence_id);
            }
        }
    }

    /// Detect anomalies for one evidence item and replace its stored
    /// findings. Runs for the same evidence id are serialized.
    pub fn run<M>(&self, ledgers: &LedgerStore, mirror: &M, evidence_id: &str) -> Result<AnomalyReport>
    where
        M: MirrorStore + ?Sized,
    {
        util::validate_identifier(evidence_id, "evidence id")?;
        let lock = self.evidence_lock(evidence_id)?;
        let report = {
            let _guard = lock
                .lock()
                .map_err(|_| CustodyError::Other("detection lock poisoned".into()))?;
            self.run_locked(ledgers, mirror, evidence_id)
        };
        drop(lock);
        self.release_lock(evidence_id);
        report
    }

    fn run_locked<M>(&self, ledgers: &LedgerStore, mirror: &M, evidence_id: &str) -> Result<AnomalyReport>
    where
        M: MirrorStore + ?Sized,
    {
        let (_, record) = ledgers
            .evidence_record(evidence_id)?
            .required_input(&format!("evidence '{evidence_id}' is not on the ledger"))?;
        let timeline = ledgers.custody_timeline(evidence_id)?;
        let mirror_timeline = match mirror.custody_timeline(evidence_id) {
            Ok(t) => Some(t),
            Err(e) => {
                warn!(evidence_id = %evidence_id, error = %e, "mirror timeline unavailable; divergence check skipped");
                None
            }
        };
        let file = record.metadata.storage_path.as_ref().map(|p| FileReference {
            path: PathBuf::from(p),
            recorded_digest: record.evidence_digest.clone(),
        });

        let input = DetectionInput {
            evidence_id,
            timeline: &timeline,
            file: file.as_ref(),
            mirror_timeline: mirror_timeline.as_deref(),
        };
        let mut report = self.detector.detect(&input, util::now_utc());

        match mirror.replace_anomalies(evidence_id, &report.anomalies) {
            Ok(stored) => {
                report.anomalies = stored;
                report.persisted = true;
            }
            Err(e) => {
                warn!(evidence_id = %evidence_id, error = %e, "anomaly findings not persisted");
            }
        }

        info!(
            evidence_id = %evidence_id,
            findings = report.anomalies.len(),
            risk_score = report.risk_score,
            status = ?report.status,
            "custody analysis complete"
        );
        Ok(report)
    }

    /// Resolve a stored finding. Idempotent: returns `false` if it was
    /// already resolved.
    pub fn resolve<M>(&self, mirror: &M, anomaly_id: &str, resolved_by: &str, note: &str) -> Result<bool>
    where
        M: MirrorStore + ?Sized,
    {
        util::validate_identifier(resolved_by, "resolved_by")?;
        if note.trim().is_empty() {
            return Err(CustodyError::InvalidInput("resolution note must not be empty".into()));
        }
        util::validate_text(note, "resolution note", util::MAX_TEXT_LEN)?;
        let changed = mirror.resolve_anomaly(
            anomaly_id,
            &Resolution {
                resolved_by: resolved_by.to_string(),
                resolved_at: util::now_utc(),
                note: note.to_string(),
            },
        )?;
        if changed {
            info!(anomaly_id = %anomaly_id, resolved_by = %resolved_by, "anomaly resolved");
        }
        Ok(changed)
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn at(minutes: i64) -> OffsetDateTime {
        datetime!(2025-06-01 08:00:00 UTC) + time::Duration::minutes(minutes)
    }

    fn hop(from: &str, to: &str, when: OffsetDateTime) -> CustodyTransfer {
        CustodyTransfer {
            evidence_id: "EV-9".into(),
            from_user: from.into(),
            to_user: to.into(),
            transferred_at: when,
            transfer_type: "handoff".into(),
            from_location: None,
            to_location: None,
            reason: None,
            notes: None,
        }
    }

    fn run(t: &[CustodyTransfer]) -> AnomalyReport {
        AnomalyDetector::default().detect(
            &DetectionInput {
                evidence_id: "EV-9",
                timeline: t,
                file: None,
                mirror_timeline: None,
            },
            at(0),
        )
    }

    fn types(r: &AnomalyReport) -> Vec<AnomalyType> {
        r.anomalies.iter().map(|a| a.anomaly_type).collect()
    }

    #[test]
    fn rapid_transfer_medium_between_30s_and_interval() {
        let t = [hop("a", "b", at(0)), hop("b", "c", at(0) + time::Duration::seconds(45))];
        let r = run(&t);
        assert_eq!(types(&r), vec![AnomalyType::RapidTransfer]);
        assert_eq!(r.anomalies[0].severity, Severity::Medium);
        assert_eq!(r.risk_score, 15);
    }

    #[test]
    fn circular_transfer_detected() {
        let t = [
            hop("desk", "lab", at(0)),
            hop("lab", "analyst", at(60)),
            hop("analyst", "lab", at(120)),
        ];
        let r = run(&t);
        assert_eq!(types(&r), vec![AnomalyType::CircularTransfer]);
        assert!((r.anomalies[0].confidence - 0.85).abs() < f64::EPSILON);
    }

    #[test]
    fn location_mismatch_when_either_side_differs() {
        let mut a = hop("desk", "lab", at(0));
        let mut b = hop("lab", "court", at(2));
        let r = run(&[a.clone(), b.clone()]);
        assert!(!types(&r).contains(&AnomalyType::LocationMismatch));

        // Delivered to a known room, departure origin unrecorded.
        a.to_location = Some("Lab Intake".into());
        let r = run(&[a.clone(), b.clone()]);
        assert_eq!(types(&r), vec![AnomalyType::LocationMismatch]);
        assert_eq!(r.anomalies[0].details["previous_to_location"], "Lab Intake");
        assert!(r.anomalies[0].details["from_location"].is_null());

        b.from_location = Some("Evidence Locker 2".into());
        let r = run(&[a.clone(), b.clone()]);
        assert_eq!(types(&r), vec![AnomalyType::LocationMismatch]);

        b.from_location = Some("Lab Intake".into());
        assert!(run(&[a, b]).anomalies.is_empty());
    }

    #[test]
    fn location_mismatch_ignored_outside_window() {
        let mut a = hop("desk", "lab", at(0));
        let mut b = hop("lab", "court", at(10));
        a.to_location = Some("Lab Intake".into());
        b.from_location = Some("Evidence Locker 2".into());
        assert!(run(&[a, b]).anomalies.is_empty());
    }

    #[test]
    fn score_is_capped() {
        // Five transfers ten seconds apart: four high rapid transfers.
        let t: Vec<_> = (0..5)
            .map(|i| hop(&format!("u{i}"), &format!("u{}", i + 1), at(0) + time::Duration::seconds(10 * i)))
            .collect();
        let r = run(&t);
        assert_eq!(r.anomalies.len(), 4);
        assert_eq!(r.risk_score, 100);
        assert_eq!(r.status, RiskStatus::Critical);
    }

    #[test]
    fn unsorted_input_is_ordered_first() {
        let t = [hop("b", "c", at(120)), hop("a", "b", at(0))];
        assert!(run(&t).anomalies.is_empty());
    }

    #[test]
    fn supplemental_placeholder_only_when_clean() {
        let det = AnomalyDetector::new(DetectionOptions {
            enable_supplemental_checks: true,
            ..DetectionOptions::default()
        });
        let input = DetectionInput {
            evidence_id: "EV-9",
            timeline: &[],
            file: None,
            mirror_timeline: None,
        };
        let r = det.detect(&input, at(0));
        assert_eq!(types(&r), vec![AnomalyType::SupplementalCheck]);
        assert_eq!(r.anomalies[0].confidence, 0.0);
        assert_eq!(r.risk_score, 0);
        assert_eq!(r.status, RiskStatus::Clean);

        let t = [hop("a", "b", at(0)), hop("b", "c", at(0) + time::Duration::seconds(5))];
        let r = det.detect(
            &DetectionInput {
                timeline: &t,
                ..input
            },
            at(0),
        );
        assert_eq!(types(&r), vec![AnomalyType::RapidTransfer]);
    }

    #[test]
    fn mirror_divergence_flags_missing_row() {
        let t = [hop("a", "b", at(0)), hop("b", "c", at(120))];
        let r = AnomalyDetector::default().detect(
            &DetectionInput {
                evidence_id: "EV-9",
                timeline: &t,
                file: None,
                mirror_timeline: Some(&t[..1]),
            },
            at(0),
        );
        assert_eq!(types(&r), vec![AnomalyType::MirrorDivergence]);
        assert_eq!(r.anomalies[0].details["first_difference_index"], 1);
    }

    #[test]
    fn ids_are_stable_fingerprints() {
        let t = [hop("a", "b", at(0)), hop("b", "c", at(0) + time::Duration::seconds(10))];
        let a = run(&t);
        let b = run(&t);
        assert_eq!(a, b);
        assert_eq!(a.anomalies[0].fingerprint, "rapid_transfer:EV-9:0,1");
        assert_eq!(a.anomalies[0].id.len(), 32);
    }

    #[test]
    fn file_checks_map_to_findings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"original footage").unwrap();
        let det = AnomalyDetector::default();

        let intact = FileReference {
            path: path.clone(),
            recorded_digest: hasher::digest(b"original footage"),
        };
        assert!(det.file_integrity(Some(&intact)).unwrap().is_empty());

        std::fs::write(&path, b"edited footage").unwrap();
        let f = det.file_integrity(Some(&intact)).unwrap();
        assert_eq!(f[0].anomaly_type, AnomalyType::HashMismatch);

        std::fs::remove_file(&path).unwrap();
        let f = det.file_integrity(Some(&intact)).unwrap();
        assert_eq!(f[0].anomaly_type, AnomalyType::FileMissing);

        let dir_ref = FileReference {
            path: dir.path().to_path_buf(),
            recorded_digest: intact.recorded_digest.clone(),
        };
        let f = det.file_integrity(Some(&dir_ref)).unwrap();
        assert_eq!(f[0].anomaly_type, AnomalyType::FileAccessError);
        assert_eq!(f[0].severity, Severity::Medium);
    }

    #[test]
    fn status_thresholds() {
        assert_eq!(RiskStatus::from_score(0), RiskStatus::Clean);
        assert_eq!(RiskStatus::from_score(15), RiskStatus::Low);
        assert_eq!(RiskStatus::from_score(30), RiskStatus::Elevated);
        assert_eq!(RiskStatus::from_score(60), RiskStatus::Critical);
    }
}
