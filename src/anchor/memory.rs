//! In-process anchor authority, used by tests and single-process runs.

use std::collections::HashMap;

use parking_lot::Mutex;

use crate::errors::ChainResult;
use crate::types::RunId;

use super::{
    timestamp, validate_submission, AnchorAuthority, AnchorRecord, AnchorSubmission, PutOutcome,
    RunAnchorState,
};

#[derive(Default)]
pub struct InMemoryAuthority {
    runs: Mutex<HashMap<RunId, RunAnchorState>>,
}

impl InMemoryAuthority {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AnchorAuthority for InMemoryAuthority {
    fn describe(&self) -> String {
        "in-memory anchor authority".to_string()
    }

    fn current_counter(&self, run_id: &RunId) -> ChainResult<u64> {
        Ok(self
            .runs
            .lock()
            .get(run_id)
            .map(|state| state.counter)
            .unwrap_or(0))
    }

    fn conditional_put(&self, submission: &AnchorSubmission) -> ChainResult<PutOutcome> {
        validate_submission(submission)?;
        let mut runs = self.runs.lock();
        let state = runs.entry(submission.run_id.clone()).or_default();
        Ok(state.apply(submission, timestamp()))
    }

    fn anchor_at(&self, run_id: &RunId, counter: u64) -> ChainResult<Option<AnchorRecord>> {
        Ok(self
            .runs
            .lock()
            .get(run_id)
            .and_then(|state| state.anchor_at(counter))
            .cloned())
    }
}
