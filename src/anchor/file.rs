//! File-backed anchor authority.
//!
//! State is one JSON document holding every run's counter and anchors.
//! Writes go to a temp file in the same directory and are renamed over the
//! live path, so readers never observe a half-written document. The mutex
//! serializes writers within this process; across processes the CAS check
//! itself resolves races, because every put re-reads the file first.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::errors::{ChainError, ChainResult};
use crate::types::RunId;

use super::{
    timestamp, validate_submission, AnchorAuthority, AnchorRecord, AnchorSubmission, PutOutcome,
    RunAnchorState,
};

pub struct FileAuthority {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileAuthority {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        FileAuthority {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> ChainResult<HashMap<RunId, RunAnchorState>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(HashMap::new()),
            Err(err) => Err(err.into()),
        }
    }

    fn store(&self, runs: &HashMap<RunId, RunAnchorState>) -> ChainResult<()> {
        let parent = match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let mut file = NamedTempFile::new_in(&parent)?;
        file.write_all(&serde_json::to_vec_pretty(runs)?)?;
        file.persist(&self.path)
            .map_err(|err| ChainError::Io(err.error))?;
        Ok(())
    }
}

impl AnchorAuthority for FileAuthority {
    fn describe(&self) -> String {
        format!("file anchor authority at {}", self.path.display())
    }

    fn current_counter(&self, run_id: &RunId) -> ChainResult<u64> {
        Ok(self
            .load()?
            .get(run_id)
            .map(|state| state.counter)
            .unwrap_or(0))
    }

    fn conditional_put(&self, submission: &AnchorSubmission) -> ChainResult<PutOutcome> {
        validate_submission(submission)?;
        let _guard = self.write_lock.lock();
        let mut runs = self.load()?;
        let state = runs.entry(submission.run_id.clone()).or_default();
        let outcome = state.apply(submission, timestamp());
        if outcome == PutOutcome::Accepted {
            self.store(&runs)?;
        }
        Ok(outcome)
    }

    fn anchor_at(&self, run_id: &RunId, counter: u64) -> ChainResult<Option<AnchorRecord>> {
        Ok(self
            .load()?
            .get(run_id)
            .and_then(|state| state.anchor_at(counter))
            .cloned())
    }
}
