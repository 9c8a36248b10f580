//! Post-run verification of published artifacts.
//!
//! The auditor consumes only what a run publishes: the step log, the proof
//! artifacts, the Merkle root, the manifest and the broker decision log,
//! plus public key material. It samples `k` steps for proof verification,
//! checks the hash chain and inclusion paths for those steps, and
//! cross-checks the root against the anchor authority. Verification is
//! read-only; nothing is ever auto-corrected.

use std::fmt;
use std::sync::Arc;
use std::thread;

use rand::rngs::{OsRng, StdRng};
use rand::SeedableRng;
use tracing::{debug, info};

use crate::anchor::AnchorAuthority;
use crate::artifacts::RunStore;
use crate::backend::{CompiledCircuit, ProofBackend, VerifyingKey};
use crate::broker::{find_decision_anomalies, DecisionLog};
use crate::crypto::Digest32;
use crate::errors::{ChainError, ChainResult};
use crate::merkle::MerkleAccumulator;
use crate::types::{RunId, StepRecord};

/// One failed check. `step_index` is `None` for run-level findings.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuditFailure {
    pub step_index: Option<u64>,
    pub reason: String,
}

impl AuditFailure {
    fn step(step_index: u64, reason: impl Into<String>) -> Self {
        AuditFailure {
            step_index: Some(step_index),
            reason: reason.into(),
        }
    }

    fn run(reason: impl Into<String>) -> Self {
        AuditFailure {
            step_index: None,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for AuditFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.step_index {
            Some(step) => write!(f, "step {step}: {}", self.reason),
            None => f.write_str(&self.reason),
        }
    }
}

/// Outcome of one audit pass. The verdict is binary; the failures carry
/// the diagnosis.
#[derive(Clone, Debug)]
pub struct AuditReport {
    pub run_id: RunId,
    pub total_steps: u64,
    pub sampled: Vec<u64>,
    pub failures: Vec<AuditFailure>,
}

impl AuditReport {
    pub fn passed(&self) -> bool {
        self.failures.is_empty()
    }

    /// Distinct failing step indices, ascending.
    pub fn failing_steps(&self) -> Vec<u64> {
        let mut steps: Vec<u64> = self.failures.iter().filter_map(|f| f.step_index).collect();
        steps.sort_unstable();
        steps.dedup();
        steps
    }
}

/// Uniform sample of `sample_size` distinct indices from `[0, total)`,
/// ascending. A seed makes the selection reproducible; `sample_size`
/// larger than `total` selects everything.
pub fn sample_indices(total: u64, sample_size: usize, seed: Option<u64>) -> Vec<u64> {
    let total = total as usize;
    let amount = sample_size.min(total);
    let picked = match seed {
        Some(seed) => {
            let mut rng = StdRng::seed_from_u64(seed);
            rand::seq::index::sample(&mut rng, total, amount)
        }
        None => rand::seq::index::sample(&mut OsRng, total, amount),
    };
    let mut indices: Vec<u64> = picked.into_iter().map(|index| index as u64).collect();
    indices.sort_unstable();
    indices
}

pub struct Auditor {
    backend: Arc<dyn ProofBackend>,
    circuit: CompiledCircuit,
    verifying_key: VerifyingKey,
}

impl Auditor {
    pub fn new(
        backend: Arc<dyn ProofBackend>,
        circuit: CompiledCircuit,
        verifying_key: VerifyingKey,
    ) -> Self {
        Auditor {
            backend,
            circuit,
            verifying_key,
        }
    }

    /// Audit one published run. Sampled steps are verified on parallel
    /// threads; run-level checks (root, anchor, decision log) always run.
    pub fn audit_run(
        &self,
        store: &RunStore,
        authority: &dyn AnchorAuthority,
        sample_size: usize,
        seed: Option<u64>,
    ) -> ChainResult<AuditReport> {
        let manifest = store.load_manifest()?;
        let records = store.load_records()?;
        let published_root = store.load_root()?;
        let run_id = manifest.run_id.clone();
        let run_seed = run_id.seed();

        let tree =
            MerkleAccumulator::from_leaves(records.iter().map(|r| r.record_digest).collect());
        let sampled = sample_indices(records.len() as u64, sample_size, seed);
        info!(
            %run_id,
            steps = records.len(),
            sampled = sampled.len(),
            "auditing run"
        );

        let mut failures = Vec::new();

        if tree.root() != published_root {
            failures.push(AuditFailure::run(format!(
                "recomputed merkle root {} does not match the published root {published_root}",
                tree.root()
            )));
        }
        if manifest.merkle_root != published_root {
            failures.push(AuditFailure::run(format!(
                "manifest root {} does not match the published root {published_root}",
                manifest.merkle_root
            )));
        }
        if manifest.num_steps != records.len() as u64 {
            failures.push(AuditFailure::run(format!(
                "manifest claims {} steps but the step log holds {}",
                manifest.num_steps,
                records.len()
            )));
        }

        match (&manifest.anchor, records.is_empty()) {
            (Some(stamp), _) => match authority.anchor_at(&run_id, stamp.counter)? {
                Some(anchor) if anchor.digest == published_root => {
                    debug!(counter = stamp.counter, "anchor record matches the published root");
                }
                Some(anchor) => failures.push(AuditFailure::run(format!(
                    "anchored digest {} at counter {} does not match the published root",
                    anchor.digest, stamp.counter
                ))),
                None => failures.push(AuditFailure::run(format!(
                    "authority holds no anchor record for counter {}",
                    stamp.counter
                ))),
            },
            // Empty runs are never anchored; there is no tail proof to attach.
            (None, true) => {}
            (None, false) => {
                failures.push(AuditFailure::run("run has steps but was never anchored"));
            }
        }

        let decision_path = store.decision_log_path();
        match DecisionLog::verify_chain(&decision_path) {
            Ok(()) => {
                let decisions = DecisionLog::load_records(&decision_path)?;
                for anomaly in find_decision_anomalies(&decisions) {
                    failures.push(AuditFailure::run(format!(
                        "secret released for claim {} at decision {} after rejection at decision {}",
                        anomaly.claim_fingerprint, anomaly.accepted_index, anomaly.rejected_index
                    )));
                }
            }
            Err(err) => failures.push(AuditFailure::run(format!("decision log: {err}"))),
        }

        let step_results: Vec<ChainResult<Vec<AuditFailure>>> = thread::scope(|scope| {
            let handles: Vec<_> = sampled
                .iter()
                .map(|&step_index| {
                    let records = &records;
                    let tree = &tree;
                    scope.spawn(move || {
                        self.check_step(store, records, tree, published_root, run_seed, step_index)
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| -> ChainResult<Vec<AuditFailure>> {
                    handle
                        .join()
                        .map_err(|_| ChainError::Config("audit worker panicked".to_string()))?
                })
                .collect()
        });
        for result in step_results {
            failures.extend(result?);
        }

        let report = AuditReport {
            run_id,
            total_steps: records.len() as u64,
            sampled,
            failures,
        };
        if report.passed() {
            info!(run_id = %report.run_id, "audit passed");
        } else {
            info!(run_id = %report.run_id, failures = report.failures.len(), "audit rejected");
        }
        Ok(report)
    }

    /// Ordered checks for one sampled step: record digest, chain link,
    /// inclusion path, proof artifact, proof verification. All findings
    /// for the step are collected rather than stopping at the first.
    fn check_step(
        &self,
        store: &RunStore,
        records: &[StepRecord],
        tree: &MerkleAccumulator,
        published_root: Digest32,
        run_seed: Digest32,
        step_index: u64,
    ) -> ChainResult<Vec<AuditFailure>> {
        let mut failures = Vec::new();
        let record = &records[step_index as usize];

        if record.step_index != step_index {
            failures.push(AuditFailure::step(
                step_index,
                format!("step log entry carries index {}", record.step_index),
            ));
        }
        if !record.digest_consistent() {
            failures.push(AuditFailure::step(
                step_index,
                "record digest does not match the record contents",
            ));
        }

        let expected_link = if step_index == 0 {
            run_seed
        } else {
            records[step_index as usize - 1].link_digest()
        };
        if record.prev_link != expected_link {
            let source = if step_index == 0 {
                "the run seed"
            } else {
                "the predecessor's link digest"
            };
            failures.push(AuditFailure::step(
                step_index,
                format!("prev_link does not match {source}"),
            ));
        }

        match tree.path(step_index) {
            Ok(path) if path.resolves_to(&published_root) => {}
            Ok(_) => failures.push(AuditFailure::step(
                step_index,
                "inclusion path does not resolve to the published root",
            )),
            Err(err) => failures.push(AuditFailure::step(step_index, err.to_string())),
        }

        let proof = match store.load_proof(step_index) {
            Ok(proof) => proof,
            Err(err) => {
                failures.push(AuditFailure::step(step_index, err.to_string()));
                return Ok(failures);
            }
        };
        if proof.digest() != record.proof_hash {
            failures.push(AuditFailure::step(
                step_index,
                "proof artifact digest does not match the recorded proof_hash",
            ));
            return Ok(failures);
        }
        match self.backend.verify(
            &self.circuit,
            &self.verifying_key,
            &proof,
            &record.public_inputs,
        ) {
            Ok(true) => {}
            Ok(false) => {
                failures.push(AuditFailure::step(step_index, "proof failed verification"));
            }
            Err(ChainError::ProofRejected(reason)) => {
                failures.push(AuditFailure::step(step_index, reason));
            }
            Err(err) => return Err(err),
        }
        Ok(failures)
    }
}
