//! On-disk layout of a run's published artifacts.
//!
//! Each run owns one directory under the artifact root:
//!
//!   <artifacts>/<run_id>/steps.jsonl        step records, one JSON per line
//!   <artifacts>/<run_id>/proofs/            step_000000.proof, ...
//!   <artifacts>/<run_id>/merkle_root.txt    hex run digest
//!   <artifacts>/<run_id>/run_manifest.json  summary incl. anchor stamp
//!   <artifacts>/<run_id>/decisions.jsonl    broker decision log
//!
//! This is the complete bundle a verifier needs, alongside the verifying
//! key, to audit the run offline.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::backend::ProofBytes;
use crate::crypto::Digest32;
use crate::errors::{ChainError, ChainResult};
use crate::types::{RunId, RunManifest, StepRecord};

pub const STEPS_FILE: &str = "steps.jsonl";
pub const PROOFS_DIR: &str = "proofs";
pub const ROOT_FILE: &str = "merkle_root.txt";
pub const MANIFEST_FILE: &str = "run_manifest.json";
pub const DECISIONS_FILE: &str = "decisions.jsonl";

#[derive(Debug)]
pub struct RunStore {
    run_id: RunId,
    root: PathBuf,
}

impl RunStore {
    /// Create the directory skeleton for a fresh run. The step log is part
    /// of the published bundle even when no step is ever recorded, so it is
    /// materialized here rather than on first append.
    pub fn create(artifact_dir: &Path, run_id: &RunId) -> ChainResult<Self> {
        let root = artifact_dir.join(run_id.as_str());
        fs::create_dir_all(root.join(PROOFS_DIR))?;
        let store = RunStore {
            run_id: run_id.clone(),
            root,
        };
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(store.steps_path())?;
        Ok(store)
    }

    /// Open an existing run's artifacts.
    pub fn open(artifact_dir: &Path, run_id: &RunId) -> ChainResult<Self> {
        let root = artifact_dir.join(run_id.as_str());
        if !root.is_dir() {
            return Err(ChainError::Config(format!(
                "run directory {} not found",
                root.display()
            )));
        }
        Ok(RunStore {
            run_id: run_id.clone(),
            root,
        })
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn steps_path(&self) -> PathBuf {
        self.root.join(STEPS_FILE)
    }

    pub fn decision_log_path(&self) -> PathBuf {
        self.root.join(DECISIONS_FILE)
    }

    pub fn proof_path(&self, step_index: u64) -> PathBuf {
        self.root.join(PROOFS_DIR).join(format!("step_{step_index:06}.proof"))
    }

    pub fn append_record(&self, record: &StepRecord) -> ChainResult<()> {
        let json = serde_json::to_vec(record)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.steps_path())?;
        file.write_all(&json)?;
        file.write_all(b"\n")?;
        Ok(())
    }

    pub fn load_records(&self) -> ChainResult<Vec<StepRecord>> {
        let file = File::open(self.steps_path()).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ChainError::Config(format!(
                    "run {} has no step log; was the run executed?",
                    self.run_id
                ))
            } else {
                err.into()
            }
        })?;
        let mut records = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            records.push(serde_json::from_str(&line)?);
        }
        Ok(records)
    }

    pub fn write_proof(&self, step_index: u64, proof: &ProofBytes) -> ChainResult<()> {
        fs::write(self.proof_path(step_index), proof.as_slice())?;
        Ok(())
    }

    pub fn load_proof(&self, step_index: u64) -> ChainResult<ProofBytes> {
        let path = self.proof_path(step_index);
        let bytes = fs::read(&path).map_err(|err| {
            if err.kind() == std::io::ErrorKind::NotFound {
                ChainError::Config(format!("proof artifact {} not found", path.display()))
            } else {
                err.into()
            }
        })?;
        Ok(ProofBytes(bytes))
    }

    pub fn write_root(&self, root: &Digest32) -> ChainResult<()> {
        fs::write(self.root.join(ROOT_FILE), format!("{}\n", root.to_hex()))?;
        Ok(())
    }

    pub fn load_root(&self) -> ChainResult<Digest32> {
        let raw = fs::read_to_string(self.root.join(ROOT_FILE))?;
        Digest32::from_hex(raw.trim())
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> ChainResult<()> {
        fs::write(
            self.root.join(MANIFEST_FILE),
            serde_json::to_vec_pretty(manifest)?,
        )?;
        Ok(())
    }

    pub fn load_manifest(&self) -> ChainResult<RunManifest> {
        let bytes = fs::read(self.root.join(MANIFEST_FILE))?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
