//! Append-only ledger for one training run.
//!
//! All mutation goes through a single mutex held only for validation and
//! insertion. Proving never happens under the lock: workers lease a slot
//! with [`RunLedger::begin_step`], prove outside the lock, then call
//! [`RunLedger::append`], which re-validates the slot against the actual
//! tail. A worker that lost the race gets [`ChainError::LedgerOutOfOrder`]
//! and leases again.

use parking_lot::Mutex;

use crate::backend::ProofBytes;
use crate::crypto::Digest32;
use crate::errors::{ChainError, ChainResult};
use crate::merkle::{MerkleAccumulator, MerklePath};
use crate::types::{PublicInputs, RunId, StepRecord};

/// Lease for the next append. Advisory: the index is only authoritative if
/// no other append lands first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StepSlot {
    pub step_index: u64,
    pub prev_link: Digest32,
}

struct LedgerInner {
    records: Vec<StepRecord>,
    accumulator: MerkleAccumulator,
    finalized: Option<Digest32>,
}

impl LedgerInner {
    fn next_link(&self, seed: &Digest32) -> Digest32 {
        match self.records.last() {
            Some(tail) => tail.link_digest(),
            None => *seed,
        }
    }
}

pub struct RunLedger {
    run_id: RunId,
    seed: Digest32,
    inner: Mutex<LedgerInner>,
}

impl RunLedger {
    pub fn new(run_id: RunId) -> Self {
        let seed = run_id.seed();
        RunLedger {
            run_id,
            seed,
            inner: Mutex::new(LedgerInner {
                records: Vec::new(),
                accumulator: MerkleAccumulator::new(),
                finalized: None,
            }),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// `prev_link` of step 0.
    pub fn seed(&self) -> Digest32 {
        self.seed
    }

    /// Lease the next slot. The caller proves against `prev_link` outside
    /// the lock and then appends; a stale lease fails the append cleanly.
    pub fn begin_step(&self) -> ChainResult<StepSlot> {
        let inner = self.inner.lock();
        if inner.finalized.is_some() {
            return Err(ChainError::LedgerFinalized);
        }
        Ok(StepSlot {
            step_index: inner.records.len() as u64,
            prev_link: inner.next_link(&self.seed),
        })
    }

    /// Append step `step_index`. Validation, digest computation and
    /// insertion all happen under one lock acquisition, so records are
    /// chained in exactly the order they land.
    pub fn append(
        &self,
        step_index: u64,
        public_inputs: PublicInputs,
        proof: &ProofBytes,
    ) -> ChainResult<StepRecord> {
        let mut inner = self.inner.lock();
        if inner.finalized.is_some() {
            return Err(ChainError::LedgerFinalized);
        }
        let expected = inner.records.len() as u64;
        if step_index != expected {
            return Err(ChainError::LedgerOutOfOrder {
                expected,
                actual: step_index,
            });
        }
        let prev_link = inner.next_link(&self.seed);
        let record = StepRecord::build(step_index, public_inputs, proof.digest(), prev_link);
        inner.accumulator.push(record.record_digest);
        inner.records.push(record.clone());
        Ok(record)
    }

    /// Freeze the ledger and return the run digest. Idempotent: repeated
    /// calls return the digest frozen by the first.
    pub fn finalize(&self) -> Digest32 {
        let mut inner = self.inner.lock();
        if let Some(root) = inner.finalized {
            return root;
        }
        let root = inner.accumulator.root();
        inner.finalized = Some(root);
        root
    }

    pub fn is_finalized(&self) -> bool {
        self.inner.lock().finalized.is_some()
    }

    /// Root over the records appended so far. Matches [`Self::finalize`]
    /// once the ledger is frozen.
    pub fn merkle_root(&self) -> Digest32 {
        let inner = self.inner.lock();
        match inner.finalized {
            Some(root) => root,
            None => inner.accumulator.root(),
        }
    }

    pub fn inclusion_proof(&self, step_index: u64) -> ChainResult<MerklePath> {
        let inner = self.inner.lock();
        Ok(inner.accumulator.path(step_index)?)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().records.is_empty()
    }

    pub fn record(&self, step_index: u64) -> Option<StepRecord> {
        self.inner.lock().records.get(step_index as usize).cloned()
    }

    /// Snapshot of every record in append order.
    pub fn records(&self) -> Vec<StepRecord> {
        self.inner.lock().records.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{circuit_id, hyper_commitment, StepPublicInputs};

    fn inputs_for(step_index: u64) -> PublicInputs {
        StepPublicInputs {
            weights_commitment: Digest32::of(format!("w{step_index}").as_bytes()),
            gradient_commitment: Digest32::of(format!("g{step_index}").as_bytes()),
            hyper_commitment: hyper_commitment(1_000, 900_000, 999_000, 10),
            step_index,
            circuit_id: circuit_id("adam"),
        }
        .to_vector()
    }

    fn proof_for(step_index: u64) -> ProofBytes {
        ProofBytes(format!("proof-{step_index}").into_bytes())
    }

    #[test]
    fn appends_chain_records_back_to_the_seed() {
        let ledger = RunLedger::new(RunId::from("run-chain"));
        for step in 0..3 {
            ledger
                .append(step, inputs_for(step), &proof_for(step))
                .expect("append");
        }
        let records = ledger.records();
        assert_eq!(records[0].prev_link, ledger.seed());
        assert_eq!(records[1].prev_link, records[0].link_digest());
        assert_eq!(records[2].prev_link, records[1].link_digest());
        assert!(records.iter().all(StepRecord::digest_consistent));
    }

    #[test]
    fn out_of_order_append_is_rejected() {
        let ledger = RunLedger::new(RunId::from("run-order"));
        ledger
            .append(0, inputs_for(0), &proof_for(0))
            .expect("append step 0");
        let err = ledger
            .append(2, inputs_for(2), &proof_for(2))
            .expect_err("step 1 is missing");
        assert!(matches!(
            err,
            ChainError::LedgerOutOfOrder {
                expected: 1,
                actual: 2
            }
        ));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn finalize_is_idempotent_and_freezes_the_ledger() {
        let ledger = RunLedger::new(RunId::from("run-final"));
        for step in 0..2 {
            ledger
                .append(step, inputs_for(step), &proof_for(step))
                .expect("append");
        }
        let first = ledger.finalize();
        let second = ledger.finalize();
        assert_eq!(first, second);
        assert_eq!(ledger.merkle_root(), first);

        let err = ledger
            .append(2, inputs_for(2), &proof_for(2))
            .expect_err("ledger is frozen");
        assert!(matches!(err, ChainError::LedgerFinalized));
        let err = ledger.begin_step().expect_err("no leases after finalize");
        assert!(matches!(err, ChainError::LedgerFinalized));
    }

    #[test]
    fn inclusion_proofs_resolve_to_the_root() {
        let ledger = RunLedger::new(RunId::from("run-proofs"));
        for step in 0..5 {
            ledger
                .append(step, inputs_for(step), &proof_for(step))
                .expect("append");
        }
        let root = ledger.finalize();
        for step in 0..5 {
            let record = ledger.record(step).expect("record exists");
            let path = ledger.inclusion_proof(step).expect("inclusion proof");
            assert_eq!(path.leaf, record.record_digest);
            assert!(path.resolves_to(&root));
        }
        assert!(matches!(
            ledger.inclusion_proof(5),
            Err(ChainError::Merkle(_))
        ));
    }

    #[test]
    fn stale_lease_fails_and_a_fresh_lease_succeeds() {
        let ledger = RunLedger::new(RunId::from("run-lease"));
        let first = ledger.begin_step().expect("lease");
        let second = ledger.begin_step().expect("competing lease");
        assert_eq!(first.step_index, second.step_index);

        ledger
            .append(first.step_index, inputs_for(0), &proof_for(0))
            .expect("winner appends");
        let err = ledger
            .append(second.step_index, inputs_for(0), &proof_for(0))
            .expect_err("stale lease");
        assert!(matches!(
            err,
            ChainError::LedgerOutOfOrder {
                expected: 1,
                actual: 0
            }
        ));

        let retry = ledger.begin_step().expect("fresh lease");
        assert_eq!(retry.step_index, 1);
        assert_eq!(
            retry.prev_link,
            ledger.record(0).expect("record 0").link_digest()
        );
        ledger
            .append(retry.step_index, inputs_for(1), &proof_for(1))
            .expect("retry lands");
    }

    #[test]
    fn concurrent_appends_keep_the_chain_contiguous() {
        let ledger = RunLedger::new(RunId::from("run-threads"));
        std::thread::scope(|scope| {
            for worker in 0..4u64 {
                let ledger = &ledger;
                scope.spawn(move || {
                    for _ in 0..5 {
                        loop {
                            let slot = ledger.begin_step().expect("lease");
                            let result = ledger.append(
                                slot.step_index,
                                inputs_for(worker),
                                &proof_for(worker),
                            );
                            match result {
                                Ok(_) => break,
                                Err(ChainError::LedgerOutOfOrder { .. }) => continue,
                                Err(err) => panic!("unexpected error: {err}"),
                            }
                        }
                    }
                });
            }
        });
        let records = ledger.records();
        assert_eq!(records.len(), 20);
        let mut link = ledger.seed();
        for (index, record) in records.iter().enumerate() {
            assert_eq!(record.step_index, index as u64);
            assert_eq!(record.prev_link, link);
            link = record.link_digest();
        }
    }
}
