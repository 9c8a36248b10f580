//! Verifiable step ledger for proof-carrying training runs.
//!
//! Each optimizer step is proved by a pluggable zero-knowledge backend and
//! appended to a hash-chained, Merkle-accumulated ledger. Finalized runs are
//! anchored to an external append-only authority under a gapless per-run
//! counter, and proving keys sit behind an attestation-gated secret broker
//! whose release decisions form their own auditable hash chain.
//!
//! Applications typically depend on [`config::RunnerConfig`] to bootstrap a
//! run, [`runner::run_setup`] and [`runner::execute_run`] to drive it, and
//! [`auditor::Auditor`] to verify the published artifacts after the fact.

pub mod anchor;
pub mod artifacts;
pub mod auditor;
pub mod backend;
pub mod broker;
pub mod config;
pub mod crypto;
pub mod errors;
pub mod ledger;
pub mod merkle;
pub mod runner;
pub mod trainer;
pub mod types;

pub use errors::{ChainError, ChainResult};
