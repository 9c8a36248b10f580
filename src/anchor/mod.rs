//! Anchoring: publishing the run digest to an external authority.
//!
//! The authority keeps one gapless counter per run, starting at 1. Writes go
//! through a compare-and-swap: a submission names the counter it expects the
//! authority to be at, and the authority accepts only if that still holds.
//! This is the single point where two processes can race; everything else in
//! the pipeline is process-local.

use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backend::{CompiledCircuit, ProofBackend, ProofBytes, VerifyingKey};
use crate::crypto::Digest32;
use crate::errors::{ChainError, ChainResult};
use crate::types::{now_ms, AnchorStamp, PublicInputs, RunId};

mod file;
mod memory;
mod remote;

pub use file::FileAuthority;
pub use memory::InMemoryAuthority;
pub use remote::RemoteAuthority;

/// One conditional write against the authority.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorSubmission {
    pub run_id: RunId,
    /// Counter the submitter believes the authority is at.
    pub expected_prev_counter: u64,
    /// Counter this anchor claims; must be `expected_prev_counter + 1`.
    pub counter: u64,
    pub digest: Digest32,
    pub proof: ProofBytes,
    pub public_inputs: PublicInputs,
}

/// Anchor as stored by the authority.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnchorRecord {
    pub run_id: RunId,
    pub counter: u64,
    pub digest: Digest32,
    pub proof: ProofBytes,
    pub public_inputs: PublicInputs,
    pub accepted_at_ms: u64,
}

impl AnchorRecord {
    fn from_submission(submission: &AnchorSubmission, accepted_at_ms: u64) -> Self {
        AnchorRecord {
            run_id: submission.run_id.clone(),
            counter: submission.counter,
            digest: submission.digest,
            proof: submission.proof.clone(),
            public_inputs: submission.public_inputs.clone(),
            accepted_at_ms,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PutOutcome {
    /// The counter advanced and the anchor was stored.
    Accepted,
    /// An identical anchor already sits at this counter; nothing changed.
    AlreadyAccepted,
    /// Another writer advanced the counter first.
    Conflict { current: u64 },
}

/// Reject submissions whose counter does not extend the expected one.
/// Gaplessness is the authority's own invariant, so it is enforced on the
/// authority side of every adapter, not only in the client.
pub(crate) fn validate_submission(submission: &AnchorSubmission) -> ChainResult<()> {
    if submission.expected_prev_counter.checked_add(1) != Some(submission.counter) {
        return Err(ChainError::Config(format!(
            "anchor counter {} must be exactly one past the expected counter {}",
            submission.counter, submission.expected_prev_counter
        )));
    }
    Ok(())
}

/// Per-run authority state shared by the local adapters.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct RunAnchorState {
    pub(crate) counter: u64,
    pub(crate) anchors: Vec<AnchorRecord>,
}

impl RunAnchorState {
    /// Apply one validated submission. Accepts when the stored counter still
    /// matches the expectation; recognizes a byte-identical repeat of an
    /// already stored anchor; reports a conflict otherwise.
    pub(crate) fn apply(&mut self, submission: &AnchorSubmission, accepted_at_ms: u64) -> PutOutcome {
        if self.counter == submission.expected_prev_counter {
            self.anchors
                .push(AnchorRecord::from_submission(submission, accepted_at_ms));
            self.counter = submission.counter;
            return PutOutcome::Accepted;
        }
        let repeat = self.anchors.iter().any(|anchor| {
            anchor.counter == submission.counter && anchor.digest == submission.digest
        });
        if repeat {
            PutOutcome::AlreadyAccepted
        } else {
            PutOutcome::Conflict {
                current: self.counter,
            }
        }
    }

    pub(crate) fn anchor_at(&self, counter: u64) -> Option<&AnchorRecord> {
        self.anchors.iter().find(|anchor| anchor.counter == counter)
    }
}

/// Storage backend the anchor client writes to.
pub trait AnchorAuthority: Send + Sync {
    /// Short human-readable description for logs.
    fn describe(&self) -> String;

    /// True when the authority verifies submitted proofs itself before
    /// accepting them; the client then skips its own verification pass.
    fn verifies_inline(&self) -> bool {
        false
    }

    /// Counter of the latest accepted anchor for `run_id`, 0 if none.
    fn current_counter(&self, run_id: &RunId) -> ChainResult<u64>;

    fn conditional_put(&self, submission: &AnchorSubmission) -> ChainResult<PutOutcome>;

    fn anchor_at(&self, run_id: &RunId, counter: u64) -> ChainResult<Option<AnchorRecord>>;
}

impl fmt::Debug for dyn AnchorAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Retry schedule for transport failures. Non-transport errors are never
/// retried: the CAS arguments would be stale.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(250),
        }
    }
}

/// Client side of anchoring: verifies the tail proof, drives the CAS and
/// retries transient transport failures with exponential backoff.
pub struct AnchorClient {
    authority: Arc<dyn AnchorAuthority>,
    backend: Arc<dyn ProofBackend>,
    circuit: CompiledCircuit,
    verifying_key: VerifyingKey,
    retry: RetryPolicy,
}

impl AnchorClient {
    pub fn new(
        authority: Arc<dyn AnchorAuthority>,
        backend: Arc<dyn ProofBackend>,
        circuit: CompiledCircuit,
        verifying_key: VerifyingKey,
    ) -> Self {
        AnchorClient {
            authority,
            backend,
            circuit,
            verifying_key,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn authority(&self) -> &Arc<dyn AnchorAuthority> {
        &self.authority
    }

    /// Counter the next anchor for `run_id` should claim.
    pub fn next_counter(&self, run_id: &RunId) -> ChainResult<u64> {
        Ok(self.authority.current_counter(run_id)?.saturating_add(1))
    }

    /// Anchor `digest` at `counter`. Accepted repeats count as success; a
    /// counter conflict is terminal and surfaces as
    /// [`ChainError::AnchorNonMonotonic`].
    pub fn anchor(
        &self,
        run_id: &RunId,
        counter: u64,
        digest: Digest32,
        proof: &ProofBytes,
        public_inputs: &PublicInputs,
    ) -> ChainResult<AnchorStamp> {
        if counter == 0 {
            return Err(ChainError::Config("anchor counters start at 1".to_string()));
        }
        if self.authority.verifies_inline() {
            info!(authority = %self.authority.describe(), "authority verifies inline; skipping local verification");
        } else {
            let verified =
                self.backend
                    .verify(&self.circuit, &self.verifying_key, proof, public_inputs)?;
            if !verified {
                return Err(ChainError::ProofRejected(
                    "anchor proof failed verification".to_string(),
                ));
            }
        }

        let submission = AnchorSubmission {
            run_id: run_id.clone(),
            expected_prev_counter: counter - 1,
            counter,
            digest,
            proof: proof.clone(),
            public_inputs: public_inputs.clone(),
        };
        match self.submit_with_retry(&submission)? {
            PutOutcome::Accepted => {
                info!(%run_id, counter, digest = %digest, "anchor accepted");
            }
            PutOutcome::AlreadyAccepted => {
                info!(%run_id, counter, "anchor already present; treating as success");
            }
            PutOutcome::Conflict { current } => {
                return Err(ChainError::AnchorNonMonotonic {
                    run_id: run_id.to_string(),
                    submitted: counter,
                    current,
                });
            }
        }

        let record = self.authority.anchor_at(run_id, counter)?.ok_or_else(|| {
            ChainError::Transport(
                "authority accepted the anchor but does not return it".to_string(),
            )
        })?;
        Ok(AnchorStamp {
            counter: record.counter,
            accepted_at_ms: record.accepted_at_ms,
        })
    }

    fn submit_with_retry(&self, submission: &AnchorSubmission) -> ChainResult<PutOutcome> {
        let mut delay = self.retry.base_delay;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.authority.conditional_put(submission) {
                Ok(outcome) => return Ok(outcome),
                Err(err) if err.is_retryable() && attempt < self.retry.attempts => {
                    warn!(
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "anchor submission failed; retrying"
                    );
                    thread::sleep(delay);
                    delay = delay.saturating_mul(2);
                }
                Err(err) => return Err(err),
            }
        }
    }
}

pub(crate) fn timestamp() -> u64 {
    now_ms()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(expected_prev: u64, counter: u64) -> AnchorSubmission {
        AnchorSubmission {
            run_id: RunId::from("run-validate"),
            expected_prev_counter: expected_prev,
            counter,
            digest: Digest32::of(b"root"),
            proof: ProofBytes(vec![1, 2, 3]),
            public_inputs: PublicInputs::default(),
        }
    }

    #[test]
    fn submissions_must_extend_the_expected_counter() {
        assert!(validate_submission(&submission(0, 1)).is_ok());
        assert!(validate_submission(&submission(4, 5)).is_ok());
        assert!(validate_submission(&submission(0, 2)).is_err());
        assert!(validate_submission(&submission(3, 3)).is_err());
        assert!(validate_submission(&submission(u64::MAX, 0)).is_err());
    }

    #[test]
    fn state_accepts_repeats_and_reports_conflicts() {
        let mut state = RunAnchorState::default();
        let first = submission(0, 1);
        assert_eq!(state.apply(&first, 1), PutOutcome::Accepted);
        assert_eq!(state.apply(&first, 2), PutOutcome::AlreadyAccepted);

        let mut different = submission(0, 1);
        different.digest = Digest32::of(b"other-root");
        assert_eq!(
            state.apply(&different, 3),
            PutOutcome::Conflict { current: 1 }
        );

        assert_eq!(state.apply(&submission(1, 2), 4), PutOutcome::Accepted);
        assert_eq!(state.counter, 2);
        assert_eq!(state.anchor_at(1).map(|anchor| anchor.counter), Some(1));
        assert!(state.anchor_at(3).is_none());
    }
}
