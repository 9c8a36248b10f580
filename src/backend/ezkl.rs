//! Adapter around an external `ezkl`-style prover binary.
//!
//! The engine is driven entirely through subprocess invocations against a
//! key directory produced by `setup`. The proving key is never assumed to be
//! on disk: callers hand over the broker-released key bytes and this adapter
//! materializes them only inside a per-call scratch directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde_json::json;
use tempfile::TempDir;
use tracing::debug;

use crate::errors::{ChainError, ChainResult};
use crate::types::PublicInputs;

use super::{
    wrong_backend, BackendKind, CircuitArtifact, CircuitSpec, CompiledCircuit, ProofBackend,
    ProofBytes, ProvingKey, StepWitness, VerifyingKey, WitnessBytes,
};

const SETTINGS_FILE: &str = "settings.json";
const COMPILED_FILE: &str = "compiled.ezkl";
const PK_FILE: &str = "pk.key";
const VK_FILE: &str = "vk.key";
const SRS_FILE: &str = "kzg.srs";

pub struct EzklCliBackend {
    binary: PathBuf,
    key_dir: PathBuf,
}

impl EzklCliBackend {
    pub fn new(binary: impl Into<PathBuf>, key_dir: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            key_dir: key_dir.into(),
        }
    }

    fn model_path(&self, circuit_name: &str) -> PathBuf {
        self.key_dir.join(format!("{circuit_name}_step.onnx"))
    }

    fn artifact_dir<'a>(&self, circuit: &'a CompiledCircuit) -> ChainResult<&'a Path> {
        match &circuit.artifact {
            CircuitArtifact::Directory(path) => Ok(path),
            CircuitArtifact::Inline(_) => Err(ChainError::Config(
                "compiled circuit artifact is inline; this backend expects a key directory"
                    .to_string(),
            )),
        }
    }

    fn ensure_artifacts(dir: &Path, names: &[&str]) -> ChainResult<()> {
        for name in names {
            let path = dir.join(name);
            if !path.exists() {
                return Err(ChainError::Config(format!(
                    "missing prover artifact {}; run setup first",
                    path.display()
                )));
            }
        }
        Ok(())
    }

    fn run_tool(&self, operation: &str, args: &[&str]) -> ChainResult<std::process::Output> {
        debug!(binary = %self.binary.display(), operation, "invoking prover tool");
        Command::new(&self.binary).args(args).output().map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ChainError::Config(format!(
                    "prover binary '{}' not found; install it or switch the prover backend to 'mock'",
                    self.binary.display()
                ))
            } else {
                ChainError::Io(err)
            }
        })
    }

    fn run_checked(&self, operation: &str, args: &[&str]) -> ChainResult<()> {
        let output = self.run_tool(operation, args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ChainError::ProofRejected(format!(
                "{operation} failed: {}",
                stderr.trim()
            )));
        }
        Ok(())
    }

    fn scratch() -> ChainResult<TempDir> {
        tempfile::Builder::new()
            .prefix("stepchain-prover-")
            .tempdir()
            .map_err(ChainError::Io)
    }

    fn write_input_json(witness: &StepWitness, path: &Path) -> ChainResult<()> {
        let input = json!({
            "input_data": [
                witness.weights,
                witness.gradients,
                witness.first_moments,
                witness.second_moments,
                [witness.learning_rate_micros],
                [witness.beta1_micros],
                [witness.beta2_micros],
                [witness.epsilon_nanos],
                [witness.step],
            ]
        });
        fs::write(path, serde_json::to_vec(&input)?)?;
        Ok(())
    }
}

impl ProofBackend for EzklCliBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::EzklCli
    }

    fn compile(&self, spec: &CircuitSpec) -> ChainResult<CompiledCircuit> {
        fs::create_dir_all(&self.key_dir)?;
        let model = self.model_path(&spec.name);
        if !model.exists() {
            return Err(ChainError::Config(format!(
                "circuit model {} missing; export the step graph before setup",
                model.display()
            )));
        }
        let settings = self.key_dir.join(SETTINGS_FILE);
        let compiled = self.key_dir.join(COMPILED_FILE);
        let srs = self.key_dir.join(SRS_FILE);
        let logrows = spec.logrows.to_string();

        self.run_checked(
            "gen-settings",
            &[
                "gen-settings",
                "--model",
                &model.to_string_lossy(),
                "--settings-path",
                &settings.to_string_lossy(),
                "--logrows",
                &logrows,
            ],
        )?;
        self.run_checked(
            "compile-circuit",
            &[
                "compile-circuit",
                "--model",
                &model.to_string_lossy(),
                "--settings-path",
                &settings.to_string_lossy(),
                "--compiled-circuit",
                &compiled.to_string_lossy(),
            ],
        )?;
        self.run_checked(
            "get-srs",
            &[
                "get-srs",
                "--settings-path",
                &settings.to_string_lossy(),
                "--srs-path",
                &srs.to_string_lossy(),
            ],
        )?;

        Ok(CompiledCircuit {
            spec: spec.clone(),
            backend: BackendKind::EzklCli,
            artifact: CircuitArtifact::Directory(self.key_dir.clone()),
        })
    }

    fn keygen(&self, circuit: &CompiledCircuit) -> ChainResult<(ProvingKey, VerifyingKey)> {
        if circuit.backend != BackendKind::EzklCli {
            return Err(wrong_backend(BackendKind::EzklCli, circuit.backend));
        }
        let dir = self.artifact_dir(circuit)?;
        Self::ensure_artifacts(dir, &[COMPILED_FILE, SRS_FILE])?;
        let pk_path = dir.join(PK_FILE);
        let vk_path = dir.join(VK_FILE);
        self.run_checked(
            "setup",
            &[
                "setup",
                "--compiled-circuit",
                &dir.join(COMPILED_FILE).to_string_lossy(),
                "--srs-path",
                &dir.join(SRS_FILE).to_string_lossy(),
                "--pk-path",
                &pk_path.to_string_lossy(),
                "--vk-path",
                &vk_path.to_string_lossy(),
            ],
        )
        .map_err(|err| match err {
            ChainError::ProofRejected(message) => ChainError::Config(message),
            other => other,
        })?;
        Ok((ProvingKey(fs::read(&pk_path)?), VerifyingKey(fs::read(&vk_path)?)))
    }

    fn prove(
        &self,
        circuit: &CompiledCircuit,
        key: &ProvingKey,
        witness: &WitnessBytes,
        _public_inputs: &PublicInputs,
    ) -> ChainResult<ProofBytes> {
        if circuit.backend != BackendKind::EzklCli {
            return Err(wrong_backend(BackendKind::EzklCli, circuit.backend));
        }
        let dir = self.artifact_dir(circuit)?;
        Self::ensure_artifacts(dir, &[SETTINGS_FILE, COMPILED_FILE, SRS_FILE])?;
        let (_, step_witness) = witness.decode::<StepWitness>()?;

        let scratch = Self::scratch()?;
        let input_path = scratch.path().join("input.json");
        let witness_path = scratch.path().join("witness.json");
        let proof_path = scratch.path().join("proof.pf");
        let pk_path = scratch.path().join(PK_FILE);
        Self::write_input_json(&step_witness, &input_path)?;
        fs::write(&pk_path, key.as_slice())?;

        self.run_checked(
            "gen-witness",
            &[
                "gen-witness",
                "--data",
                &input_path.to_string_lossy(),
                "--compiled-circuit",
                &dir.join(COMPILED_FILE).to_string_lossy(),
                "--output",
                &witness_path.to_string_lossy(),
            ],
        )?;
        self.run_checked(
            "prove",
            &[
                "prove",
                "--witness",
                &witness_path.to_string_lossy(),
                "--compiled-circuit",
                &dir.join(COMPILED_FILE).to_string_lossy(),
                "--pk-path",
                &pk_path.to_string_lossy(),
                "--proof-path",
                &proof_path.to_string_lossy(),
                "--srs-path",
                &dir.join(SRS_FILE).to_string_lossy(),
            ],
        )?;
        Ok(ProofBytes(fs::read(&proof_path)?))
    }

    /// Public inputs are embedded in the proof instances by the external
    /// tool; the vector passed here is bound by the ledger digests rather
    /// than re-checked against the tool's instance encoding.
    fn verify(
        &self,
        circuit: &CompiledCircuit,
        key: &VerifyingKey,
        proof: &ProofBytes,
        _public_inputs: &PublicInputs,
    ) -> ChainResult<bool> {
        if circuit.backend != BackendKind::EzklCli {
            return Err(wrong_backend(BackendKind::EzklCli, circuit.backend));
        }
        let dir = self.artifact_dir(circuit)?;
        Self::ensure_artifacts(dir, &[SETTINGS_FILE, SRS_FILE])?;

        let scratch = Self::scratch()?;
        let proof_path = scratch.path().join("proof.pf");
        let vk_path = scratch.path().join(VK_FILE);
        fs::write(&proof_path, proof.as_slice())?;
        fs::write(&vk_path, key.as_slice())?;

        let output = self.run_tool(
            "verify",
            &[
                "verify",
                "--settings-path",
                &dir.join(SETTINGS_FILE).to_string_lossy(),
                "--proof-path",
                &proof_path.to_string_lossy(),
                "--vk-path",
                &vk_path.to_string_lossy(),
                "--srs-path",
                &dir.join(SRS_FILE).to_string_lossy(),
            ],
        )?;
        Ok(output.status.success())
    }

    fn aggregate(
        &self,
        circuit: &CompiledCircuit,
        _key: &ProvingKey,
        proofs: &[ProofBytes],
        _public_inputs: &PublicInputs,
    ) -> ChainResult<ProofBytes> {
        if circuit.backend != BackendKind::EzklCli {
            return Err(wrong_backend(BackendKind::EzklCli, circuit.backend));
        }
        if proofs.is_empty() {
            return Err(ChainError::ProofRejected(
                "aggregate requires at least one chunk proof".to_string(),
            ));
        }
        let dir = self.artifact_dir(circuit)?;
        Self::ensure_artifacts(dir, &[SETTINGS_FILE, SRS_FILE])?;

        let scratch = Self::scratch()?;
        let mut args: Vec<String> = vec!["aggregate".to_string()];
        for (index, proof) in proofs.iter().enumerate() {
            let path = scratch.path().join(format!("chunk_{index:03}.pf"));
            fs::write(&path, proof.as_slice())?;
            args.push("--proof-paths".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        let aggregated = scratch.path().join("aggregated.pf");
        args.push("--aggregated-proof-path".to_string());
        args.push(aggregated.to_string_lossy().into_owned());
        args.push("--srs-path".to_string());
        args.push(dir.join(SRS_FILE).to_string_lossy().into_owned());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run_checked("aggregate", &arg_refs)?;
        Ok(ProofBytes(fs::read(&aggregated)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn witness_bytes() -> WitnessBytes {
        StepWitness {
            weights: vec![1, 2],
            gradients: vec![3, 4],
            first_moments: vec![0, 0],
            second_moments: vec![1, 1],
            learning_rate_micros: 1_000,
            beta1_micros: 900_000,
            beta2_micros: 999_000,
            epsilon_nanos: 10,
            step: 1,
            chunk_index: 0,
            chunk_count: 1,
        }
        .encode(BackendKind::EzklCli, "adam")
        .expect("encode witness")
    }

    fn compiled_in(dir: &Path) -> CompiledCircuit {
        for name in [SETTINGS_FILE, COMPILED_FILE, SRS_FILE] {
            std::fs::write(dir.join(name), b"artifact").expect("write artifact");
        }
        CompiledCircuit {
            spec: CircuitSpec::new("adam", 2, 12),
            backend: BackendKind::EzklCli,
            artifact: CircuitArtifact::Directory(dir.to_path_buf()),
        }
    }

    #[test]
    fn missing_binary_reports_configuration_error() {
        let temp = TempDir::new().expect("tempdir");
        let circuit = compiled_in(temp.path());
        let backend = EzklCliBackend::new("stepchain-missing-prover", temp.path());
        let err = backend
            .prove(&circuit, &ProvingKey(vec![0u8; 8]), &witness_bytes(), &PublicInputs::default())
            .expect_err("binary is absent");
        assert!(matches!(err, ChainError::Config(_)));
        assert!(err.to_string().contains("stepchain-missing-prover"));
    }

    #[test]
    fn missing_artifacts_report_configuration_error() {
        let temp = TempDir::new().expect("tempdir");
        let circuit = CompiledCircuit {
            spec: CircuitSpec::new("adam", 2, 12),
            backend: BackendKind::EzklCli,
            artifact: CircuitArtifact::Directory(temp.path().to_path_buf()),
        };
        let backend = EzklCliBackend::new("stepchain-missing-prover", temp.path());
        let err = backend
            .verify(
                &circuit,
                &VerifyingKey(vec![0u8; 8]),
                &ProofBytes(vec![1, 2, 3]),
                &PublicInputs::default(),
            )
            .expect_err("artifacts are absent");
        assert!(err.to_string().contains("run setup first"));
    }

    #[test]
    fn inline_artifacts_are_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let circuit = CompiledCircuit {
            spec: CircuitSpec::new("adam", 2, 12),
            backend: BackendKind::EzklCli,
            artifact: CircuitArtifact::Inline(vec![1]),
        };
        let backend = EzklCliBackend::new("stepchain-missing-prover", temp.path());
        let err = backend
            .keygen(&circuit)
            .expect_err("inline artifact cannot drive the CLI");
        assert!(matches!(err, ChainError::Config(_)));
    }
}
