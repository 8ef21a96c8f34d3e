//! Digital evidence chain-of-custody ledger.
//!
//! This crate provides:
//! - Two tamper-evident, hash-linked SQLite ledgers (evidence registrations
//!   and custody transfers), SQLCipher-compatible
//! - Chain verification and digest-based evidence verification
//! - A relational mirror of the ledger that can be rebuilt from it
//! - Rule-based custody anomaly detection with risk scoring and
//!   resolution tracking
//! - Per-evidence audit packs (JSON + LaTeX + PDF)
//!
//! The CLI wrapper lives in `src/main.rs`.

#![deny(unsafe_code)]

pub mod error;
pub mod config;

pub mod anomaly;
pub mod hasher;
pub mod ledger;
pub mod mirror;
pub mod model;
pub mod recorder;
pub mod report;
pub mod util;
pub mod verify;
