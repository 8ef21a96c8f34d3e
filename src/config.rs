//! TOML configuration file support.
//!
//! Loads from (in order):
//! 1. An explicit `--config` path
//! 2. `custody.toml` next to the executable
//! 3. `$HOME/.config/custody/config.toml` (`%LOCALAPPDATA%\Custody\config.toml` on Windows)
//! 4. Environment variable overrides (e.g. `CUSTODY_DB_KEY`)
//!
//! CLI arguments always take precedence over config file values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::anomaly::DetectionOptions;
use crate::error::{Result, ResultExt as _};
use crate::ledger::{LedgerOptions, SealingPolicy};

// ---------------------------------------------------------------------------
// Config structs (map 1-to-1 with the TOML sections)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustodyConfig {
    pub paths: PathsConfig,
    pub detection: DetectionConfig,
    pub ledger: LedgerConfig,
    pub timeouts: TimeoutsConfig,
    pub logging: LoggingConfig,
    pub security: SecurityConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub ledger_db: PathBuf,
    pub mirror_db: PathBuf,
    pub report_out_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub min_transfer_interval_ms: i64,
    pub max_gap_hours: f64,
    pub enable_supplemental_checks: bool,
    pub location_window_ms: i64,
    pub excessive_transfer_threshold: usize,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Leading zero hex digits required of every linkage id; applied when a
    /// ledger is created. 0 disables the sealing cost.
    pub sealing_difficulty: u32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    pub mirror_busy_timeout_ms: u64,
    pub file_read_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Path to a JSON-lines structured log file for SIEM integration.
    /// Empty string means no file logging.
    pub json_log_file: String,
    /// Whether to also output JSON to stdout (for container/SIEM pipelines).
    pub json_stdout: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub db_key: Option<String>,
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            ledger_db: PathBuf::from("custody-ledger.db"),
            mirror_db: PathBuf::from("custody-mirror.db"),
            report_out_dir: PathBuf::from("custody-reports"),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let d = DetectionOptions::default();
        Self {
            min_transfer_interval_ms: d.min_transfer_interval_ms,
            max_gap_hours: d.max_gap_hours,
            enable_supplemental_checks: d.enable_supplemental_checks,
            location_window_ms: d.location_window_ms,
            excessive_transfer_threshold: d.excessive_transfer_threshold,
        }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            mirror_busy_timeout_ms: 5_000,
            file_read_timeout_ms: 30_000,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_log_file: String::new(),
            json_stdout: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Loading
// ---------------------------------------------------------------------------

impl CustodyConfig {
    /// Try to load from a specific path.  Returns `Ok(default)` if the file
    /// does not exist; returns `Err` if the file exists but is malformed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .ctx_config(&format!("read config file {}", path.display()))?;
        let cfg: CustodyConfig = toml::from_str(&text).ctx_config("parse config TOML")?;
        Ok(cfg)
    }

    /// Load config using the standard search order, falling back to
    /// built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(p) = explicit {
            return Self::load_from(p);
        }

        if let Ok(exe) = std::env::current_exe() {
            let candidate = exe.with_file_name("custody.toml");
            if candidate.exists() {
                return Self::load_from(&candidate);
            }
        }

        #[cfg(windows)]
        {
            if let Ok(local) = std::env::var("LOCALAPPDATA") {
                let candidate = PathBuf::from(local).join("Custody").join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        #[cfg(not(windows))]
        {
            if let Some(home) = std::env::var_os("HOME") {
                let candidate = PathBuf::from(home)
                    .join(".config")
                    .join("custody")
                    .join("config.toml");
                if candidate.exists() {
                    return Self::load_from(&candidate);
                }
            }
        }

        Ok(Self::default())
    }

    /// Apply environment variable overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|k| std::env::var(k).ok());
    }

    fn apply_overrides(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(key) = get("CUSTODY_DB_KEY") {
            self.security.db_key = Some(key);
        }
        if let Some(db) = get("CUSTODY_LEDGER_DB") {
            self.paths.ledger_db = PathBuf::from(db);
        }
        if let Some(db) = get("CUSTODY_MIRROR_DB") {
            self.paths.mirror_db = PathBuf::from(db);
        }
        if let Some(level) = get("CUSTODY_LOG_LEVEL") {
            self.logging.level = level;
        }
    }

    pub fn detection_options(&self) -> DetectionOptions {
        let d = &self.detection;
        DetectionOptions {
            min_transfer_interval_ms: d.min_transfer_interval_ms,
            max_gap_hours: d.max_gap_hours,
            enable_supplemental_checks: d.enable_supplemental_checks,
            location_window_ms: d.location_window_ms,
            excessive_transfer_threshold: d.excessive_transfer_threshold,
            file_read_timeout: Duration::from_millis(self.timeouts.file_read_timeout_ms),
        }
    }

    /// Ledger options; fails if the configured sealing difficulty is out of range.
    pub fn ledger_options(&self) -> Result<LedgerOptions> {
        Ok(LedgerOptions {
            sealing: SealingPolicy::new(self.ledger.sealing_difficulty)?,
            busy_timeout: self.mirror_busy_timeout(),
        })
    }

    pub fn mirror_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.mirror_busy_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_values() {
        let cfg = CustodyConfig::default();
        assert_eq!(cfg.detection.min_transfer_interval_ms, 60_000);
        assert_eq!(cfg.detection.excessive_transfer_threshold, 10);
        assert_eq!(cfg.paths.ledger_db, PathBuf::from("custody-ledger.db"));
        assert_eq!(cfg.logging.level, "info");
        assert_eq!(cfg.ledger.sealing_difficulty, 0);
    }

    #[test]
    fn load_missing_file_returns_default() {
        let cfg = CustodyConfig::load_from(Path::new("nonexistent_file_xyz.toml")).unwrap();
        assert!((cfg.detection.max_gap_hours - 24.0).abs() < f64::EPSILON);
    }

    #[test]
    fn parse_partial_toml() {
        let toml_str = r#"
[detection]
max_gap_hours = 12.5
enable_supplemental_checks = true

[timeouts]
file_read_timeout_ms = 500
"#;
        let cfg: CustodyConfig = toml::from_str(toml_str).unwrap();
        let opts = cfg.detection_options();
        assert!((opts.max_gap_hours - 12.5).abs() < f64::EPSILON);
        assert!(opts.enable_supplemental_checks);
        assert_eq!(opts.min_transfer_interval_ms, 60_000);
        assert_eq!(opts.file_read_timeout, Duration::from_millis(500));
        assert_eq!(cfg.paths.mirror_db, PathBuf::from("custody-mirror.db"));
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("custody.toml");
        std::fs::write(&path, "[ledger]\nsealing_difficulty = \"high\"\n").unwrap();
        let err = CustodyConfig::load_from(&path).unwrap_err();
        assert!(matches!(err, crate::error::CustodyError::Config(_)));
    }

    #[test]
    fn overrides_replace_file_values() {
        let mut cfg = CustodyConfig::default();
        cfg.apply_overrides(|k| match k {
            "CUSTODY_LEDGER_DB" => Some("/srv/custody/ledger.db".into()),
            "CUSTODY_LOG_LEVEL" => Some("debug".into()),
            _ => None,
        });
        assert_eq!(cfg.paths.ledger_db, PathBuf::from("/srv/custody/ledger.db"));
        assert_eq!(cfg.logging.level, "debug");
        assert!(cfg.security.db_key.is_none());
    }

    #[test]
    fn sealing_difficulty_is_range_checked() {
        let mut cfg = CustodyConfig::default();
        cfg.ledger.sealing_difficulty = 9;
        assert!(cfg.ledger_options().is_err());
        cfg.ledger.sealing_difficulty = 2;
        assert_eq!(cfg.ledger_options().unwrap().sealing.difficulty, 2);
    }
}
