use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::anchor::RetryPolicy;
use crate::backend::{BackendKind, CircuitSpec};
use crate::crypto::Digest32;
use crate::errors::{ChainError, ChainResult};
use crate::trainer::HyperParams;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub artifact_dir: PathBuf,
    pub key_dir: PathBuf,
    #[serde(default = "default_steps")]
    pub steps: u64,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
    /// Record and prove every n-th optimizer step; intermediate steps still
    /// train but leave no ledger entry.
    #[serde(default = "default_prove_every_n")]
    pub prove_every_n: u64,
    /// Witness chunks per proven step; above 1 the chunk proofs are
    /// aggregated into the step's single ledger proof.
    #[serde(default = "default_chunks")]
    pub chunks: usize,
    #[serde(default = "default_trainer_seed")]
    pub trainer_seed: u64,
    #[serde(default)]
    pub hyper: HyperParams,
    #[serde(default)]
    pub prover: ProverConfig,
    #[serde(default)]
    pub anchor: AnchorConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
}

fn default_steps() -> u64 {
    50
}

fn default_dimension() -> usize {
    16
}

fn default_prove_every_n() -> u64 {
    1
}

fn default_chunks() -> usize {
    1
}

fn default_trainer_seed() -> u64 {
    42
}

impl RunnerConfig {
    pub fn load(path: &Path) -> ChainResult<Self> {
        let content = fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|err| ChainError::Config(format!("unable to parse config: {err}")))
    }

    pub fn save(&self, path: &Path) -> ChainResult<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let encoded = toml::to_string_pretty(self)
            .map_err(|err| ChainError::Config(format!("unable to encode config: {err}")))?;
        fs::write(path, encoded)?;
        Ok(())
    }

    pub fn ensure_directories(&self) -> ChainResult<()> {
        fs::create_dir_all(&self.artifact_dir)?;
        fs::create_dir_all(&self.key_dir)?;
        Ok(())
    }

    pub fn circuit_spec(&self) -> CircuitSpec {
        CircuitSpec::new(self.prover.circuit.clone(), self.dimension, self.prover.logrows)
    }

    /// Ed25519 keypair of the attestation authority.
    pub fn authority_key_path(&self) -> PathBuf {
        self.key_dir.join("attestation_authority.toml")
    }

    /// X25519 keypair the trainer presents as its sealing identity.
    pub fn sealing_key_path(&self) -> PathBuf {
        self.key_dir.join("trainer_sealing.toml")
    }

    /// Proving key custody file; matches the name the external prover
    /// backend writes, so both backends read the same location.
    pub fn proving_key_path(&self) -> PathBuf {
        self.key_dir.join("pk.key")
    }

    pub fn verifying_key_path(&self) -> PathBuf {
        self.key_dir.join("vk.key")
    }
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            artifact_dir: PathBuf::from("./artifacts"),
            key_dir: PathBuf::from("./keys"),
            steps: default_steps(),
            dimension: default_dimension(),
            prove_every_n: default_prove_every_n(),
            chunks: default_chunks(),
            trainer_seed: default_trainer_seed(),
            hyper: HyperParams::default(),
            prover: ProverConfig::default(),
            anchor: AnchorConfig::default(),
            broker: BrokerConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ProverConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    #[serde(default = "default_circuit_name")]
    pub circuit: String,
    #[serde(default = "default_logrows")]
    pub logrows: u32,
    /// External prover binary; ignored by the mock backend.
    #[serde(default = "default_prover_binary")]
    pub binary: PathBuf,
}

fn default_backend() -> BackendKind {
    BackendKind::Mock
}

fn default_circuit_name() -> String {
    "adam".to_string()
}

fn default_logrows() -> u32 {
    17
}

fn default_prover_binary() -> PathBuf {
    PathBuf::from("ezkl")
}

impl Default for ProverConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            circuit: default_circuit_name(),
            logrows: default_logrows(),
            binary: default_prover_binary(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AnchorMode {
    Memory,
    File,
    Remote,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnchorConfig {
    #[serde(default = "default_anchor_mode")]
    pub mode: AnchorMode,
    /// State file for the file-backed authority.
    #[serde(default = "default_anchor_state_path")]
    pub state_path: PathBuf,
    /// Base URL of the remote authority; required in remote mode.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// True when the remote gateway verifies proofs before accepting them;
    /// the client then skips its own verification pass.
    #[serde(default)]
    pub gateway_verifies: bool,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
}

fn default_anchor_mode() -> AnchorMode {
    AnchorMode::File
}

fn default_anchor_state_path() -> PathBuf {
    PathBuf::from("./anchors.json")
}

fn default_retry_attempts() -> u32 {
    4
}

fn default_retry_base_delay_ms() -> u64 {
    250
}

impl AnchorConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
        }
    }
}

impl Default for AnchorConfig {
    fn default() -> Self {
        Self {
            mode: default_anchor_mode(),
            state_path: default_anchor_state_path(),
            endpoint: None,
            gateway_verifies: false,
            retry_attempts: default_retry_attempts(),
            retry_base_delay_ms: default_retry_base_delay_ms(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_policy_path")]
    pub policy_path: PathBuf,
    /// Hex measurement the local trainer reports in its claim. Setup puts
    /// it on the allowlist; a production deployment would pin real image
    /// measurements instead.
    #[serde(default = "default_measurement")]
    pub measurement: String,
}

fn default_policy_path() -> PathBuf {
    PathBuf::from("./keys/broker_policy.toml")
}

fn default_measurement() -> String {
    Digest32::of(b"stepchain-dev-trainer").to_hex()
}

impl BrokerConfig {
    pub fn measurement_digest(&self) -> ChainResult<Digest32> {
        Digest32::from_hex(&self.measurement)
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            policy_path: default_policy_path(),
            measurement: default_measurement(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_survive_a_save_load_round_trip() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("runner.toml");
        let config = RunnerConfig::default();
        config.save(&path).expect("save");

        let loaded = RunnerConfig::load(&path).expect("load");
        assert_eq!(loaded.steps, config.steps);
        assert_eq!(loaded.prover.backend, BackendKind::Mock);
        assert_eq!(loaded.anchor.mode, AnchorMode::File);
        assert_eq!(loaded.hyper, HyperParams::default());
    }

    #[test]
    fn minimal_config_fills_in_defaults() {
        let parsed: RunnerConfig = toml::from_str(
            r#"
            artifact_dir = "/tmp/artifacts"
            key_dir = "/tmp/keys"
            steps = 5

            [prover]
            backend = "ezkl-cli"

            [anchor]
            mode = "remote"
            endpoint = "http://127.0.0.1:8080"
            gateway_verifies = true
            "#,
        )
        .expect("parse");

        assert_eq!(parsed.steps, 5);
        assert_eq!(parsed.dimension, default_dimension());
        assert_eq!(parsed.prove_every_n, 1);
        assert_eq!(parsed.prover.backend, BackendKind::EzklCli);
        assert_eq!(parsed.prover.circuit, "adam");
        assert_eq!(parsed.anchor.mode, AnchorMode::Remote);
        assert!(parsed.anchor.gateway_verifies);
        assert_eq!(
            parsed.anchor.endpoint.as_deref(),
            Some("http://127.0.0.1:8080")
        );
        assert_eq!(parsed.broker.measurement, default_measurement());
    }

    #[test]
    fn key_paths_hang_off_the_key_dir() {
        let config = RunnerConfig {
            key_dir: PathBuf::from("/var/lib/stepchain/keys"),
            ..RunnerConfig::default()
        };
        assert_eq!(
            config.proving_key_path(),
            PathBuf::from("/var/lib/stepchain/keys/pk.key")
        );
        assert_eq!(
            config.authority_key_path(),
            PathBuf::from("/var/lib/stepchain/keys/attestation_authority.toml")
        );
    }
}
