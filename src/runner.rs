//! Orchestration: one-time setup and the end-to-end training run.
//!
//! A run wires the pieces together in a fixed order: attested key release
//! through the broker, then train-prove-append per step, finalize, and
//! anchor the run digest with the tail proof attached. Any failure aborts
//! the run; whatever prefix of artifacts landed on disk stays verifiable,
//! and a rerun starts over under a fresh run id.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{debug, info, warn};
use x25519_dalek::PublicKey as SealingPublicKey;
use zeroize::Zeroizing;

use crate::anchor::{
    AnchorAuthority, AnchorClient, FileAuthority, InMemoryAuthority, RemoteAuthority,
};
use crate::artifacts::{RunStore, PROOFS_DIR, STEPS_FILE};
use crate::backend::{
    backend_for, prove_step, CompiledCircuit, ProofBackend, ProofBytes, ProvingKey, VerifyingKey,
};
use crate::broker::{issue_claim, BrokerPolicy, DecisionLog, SecretBroker};
use crate::config::{AnchorMode, RunnerConfig};
use crate::crypto::{load_keypair, load_or_generate_keypair, load_or_generate_sealing_keypair, load_sealing_keypair, Digest32};
use crate::errors::{ChainError, ChainResult};
use crate::ledger::RunLedger;
use crate::trainer::{public_inputs_for, SyntheticTrainer};
use crate::types::{now_ms, AnchorStamp, PublicInputs, RunId, RunManifest};

const CIRCUIT_FILE: &str = "circuit.json";

/// Everything a run or an audit needs beyond the config itself.
#[derive(Debug)]
pub struct RunContext {
    pub backend: Arc<dyn ProofBackend>,
    pub circuit: CompiledCircuit,
    pub verifying_key: VerifyingKey,
    pub authority: Arc<dyn AnchorAuthority>,
}

/// Summary of a completed run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub run_id: RunId,
    pub steps_recorded: u64,
    pub merkle_root: Digest32,
    pub anchor: Option<AnchorStamp>,
    pub artifact_dir: PathBuf,
}

fn circuit_descriptor_path(config: &RunnerConfig) -> PathBuf {
    config.key_dir.join(CIRCUIT_FILE)
}

/// One-time preparation: compile the circuit, derive the key pair, put the
/// proving key under broker custody, and generate the attestation authority
/// and sealing identities plus the release policy.
pub fn run_setup(config: &RunnerConfig) -> ChainResult<()> {
    config.ensure_directories()?;
    let backend = backend_for(config.prover.backend, &config.prover.binary, &config.key_dir);
    let spec = config.circuit_spec();
    info!(circuit = %spec.name, backend = %backend.kind(), "compiling circuit");
    let circuit = backend.compile(&spec)?;
    fs::write(
        circuit_descriptor_path(config),
        serde_json::to_vec_pretty(&circuit)?,
    )?;

    let (proving_key, verifying_key) = backend.keygen(&circuit)?;
    fs::write(config.proving_key_path(), proving_key.as_slice())?;
    fs::write(config.verifying_key_path(), verifying_key.as_slice())?;

    let authority = load_or_generate_keypair(&config.authority_key_path())?;
    load_or_generate_sealing_keypair(&config.sealing_key_path())?;

    let policy = BrokerPolicy::new(
        hex::encode(authority.verifying_key().as_bytes()),
        vec![config.broker.measurement.clone()],
    );
    policy.save(&config.broker.policy_path)?;
    info!(
        key_dir = %config.key_dir.display(),
        policy = %config.broker.policy_path.display(),
        "setup complete"
    );
    Ok(())
}

/// Load the artifacts `run_setup` produced, plus the configured anchor
/// authority.
pub fn load_context(config: &RunnerConfig) -> ChainResult<RunContext> {
    let backend = backend_for(config.prover.backend, &config.prover.binary, &config.key_dir);
    let circuit_path = circuit_descriptor_path(config);
    let circuit_bytes = fs::read(&circuit_path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ChainError::Config(format!(
                "circuit descriptor {} not found; run setup first",
                circuit_path.display()
            ))
        } else {
            err.into()
        }
    })?;
    let circuit: CompiledCircuit = serde_json::from_slice(&circuit_bytes)?;
    let verifying_key = VerifyingKey(fs::read(config.verifying_key_path()).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ChainError::Config("verifying key not found; run setup first".to_string())
        } else {
            err.into()
        }
    })?);
    let authority = make_authority(config)?;
    Ok(RunContext {
        backend,
        circuit,
        verifying_key,
        authority,
    })
}

pub fn make_authority(config: &RunnerConfig) -> ChainResult<Arc<dyn AnchorAuthority>> {
    Ok(match config.anchor.mode {
        AnchorMode::Memory => Arc::new(InMemoryAuthority::new()),
        AnchorMode::File => Arc::new(FileAuthority::new(&config.anchor.state_path)),
        AnchorMode::Remote => {
            let endpoint = config.anchor.endpoint.as_deref().ok_or_else(|| {
                ChainError::Config("anchor.endpoint is required in remote mode".to_string())
            })?;
            Arc::new(RemoteAuthority::new(endpoint, config.anchor.gateway_verifies)?)
        }
    })
}

/// Execute a full training run and return its summary.
pub fn execute_run(config: &RunnerConfig, context: &RunContext) -> ChainResult<RunOutcome> {
    config.ensure_directories()?;
    let run_id = RunId::generate();
    let store = RunStore::create(&config.artifact_dir, &run_id)?;
    info!(%run_id, steps = config.steps, backend = %context.backend.kind(), "starting training run");

    // Key release happens before any training so a rejected attestation
    // aborts the run before any step is proved or recorded.
    let proving_key = obtain_proving_key(config, &store)?;

    let ledger = RunLedger::new(run_id.clone());
    let mut trainer = SyntheticTrainer::new(config.dimension, config.trainer_seed, config.hyper);
    let circuit_digest = context.circuit.circuit_id();
    let prove_every = config.prove_every_n.max(1);

    let mut tail: Option<(ProofBytes, PublicInputs)> = None;
    for step in 1..=config.steps {
        let witness = trainer.next_witness();
        if step % prove_every != 0 {
            continue;
        }
        let slot = ledger.begin_step()?;
        // The public inputs carry the ledger position, which only diverges
        // from the optimizer's step count when prove_every_n > 1.
        let mut inputs = public_inputs_for(&witness, circuit_digest);
        inputs.step_index = slot.step_index;
        let vector = inputs.to_vector();
        let proof = prove_step(
            context.backend.as_ref(),
            &context.circuit,
            &proving_key,
            &witness,
            &vector,
            config.chunks,
        )?;
        let record = ledger.append(slot.step_index, vector.clone(), &proof)?;
        store.append_record(&record)?;
        store.write_proof(record.step_index, &proof)?;
        debug!(
            step = record.step_index,
            digest = %record.record_digest,
            "step proved and recorded"
        );
        tail = Some((proof, vector));
    }

    let root = ledger.finalize();
    store.write_root(&root)?;
    info!(%run_id, steps = ledger.len(), root = %root, "run finalized");

    let anchor = match tail {
        Some((proof, inputs)) => {
            let client = AnchorClient::new(
                context.authority.clone(),
                context.backend.clone(),
                context.circuit.clone(),
                context.verifying_key.clone(),
            )
            .with_retry(config.anchor.retry_policy());
            let counter = client.next_counter(&run_id)?;
            Some(client.anchor(&run_id, counter, root, &proof, &inputs)?)
        }
        None => {
            warn!(%run_id, "no steps were recorded; skipping anchoring");
            None
        }
    };

    let manifest = RunManifest {
        run_id: run_id.clone(),
        num_steps: ledger.len() as u64,
        merkle_root: root,
        created_at_ms: now_ms(),
        steps_file: STEPS_FILE.to_string(),
        proofs_dir: PROOFS_DIR.to_string(),
        anchor: anchor.clone(),
    };
    store.write_manifest(&manifest)?;

    Ok(RunOutcome {
        run_id,
        steps_recorded: ledger.len() as u64,
        merkle_root: root,
        anchor,
        artifact_dir: config.artifact_dir.clone(),
    })
}

/// Attested key release: present a claim for the configured measurement,
/// let the broker record its verdict in the run's decision log, and open
/// the sealed proving key with the trainer's sealing secret.
fn obtain_proving_key(config: &RunnerConfig, store: &RunStore) -> ChainResult<ProvingKey> {
    let authority = load_keypair(&config.authority_key_path())?;
    let sealing = load_sealing_keypair(&config.sealing_key_path())?;
    let policy = BrokerPolicy::load(&config.broker.policy_path)?;
    let secret = Zeroizing::new(fs::read(config.proving_key_path()).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            ChainError::Config("proving key not found; run setup first".to_string())
        } else {
            err.into()
        }
    })?);
    let decisions = DecisionLog::open(store.decision_log_path())?;
    let broker = SecretBroker::new(policy, secret, decisions)?;

    let measurement = config.broker.measurement_digest()?;
    let claim = issue_claim(&authority, measurement, &SealingPublicKey::from(&sealing));
    let sealed = broker.request_secret(&claim)?;
    let plaintext = sealed.unseal(&sealing)?;
    Ok(ProvingKey(plaintext.to_vec()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config_in(temp: &TempDir) -> RunnerConfig {
        let mut config = RunnerConfig::default();
        config.artifact_dir = temp.path().join("artifacts");
        config.key_dir = temp.path().join("keys");
        config.anchor.mode = AnchorMode::Memory;
        config.anchor.state_path = temp.path().join("anchors.json");
        config.broker.policy_path = temp.path().join("keys").join("broker_policy.toml");
        config.steps = 4;
        config.dimension = 6;
        config
    }

    #[test]
    fn context_loading_requires_setup_artifacts() {
        let temp = TempDir::new().expect("tempdir");
        let err = load_context(&config_in(&temp)).expect_err("setup never ran");
        assert!(err.to_string().contains("run setup first"));
    }

    #[test]
    fn remote_mode_requires_an_endpoint() {
        let temp = TempDir::new().expect("tempdir");
        let mut config = config_in(&temp);
        config.anchor.mode = AnchorMode::Remote;
        config.anchor.endpoint = None;
        let err = make_authority(&config).expect_err("endpoint missing");
        assert!(matches!(err, ChainError::Config(_)));
    }

    #[test]
    fn prove_every_n_records_a_subset_of_steps() {
        let temp = TempDir::new().expect("tempdir");
        let mut config = config_in(&temp);
        config.prove_every_n = 2;
        run_setup(&config).expect("setup");
        let context = load_context(&config).expect("context");

        let outcome = execute_run(&config, &context).expect("run");
        assert_eq!(outcome.steps_recorded, 2);
        assert!(outcome.anchor.is_some());

        let store = RunStore::open(&config.artifact_dir, &outcome.run_id).expect("open store");
        let records = store.load_records().expect("records");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].step_index, 0);
        assert_eq!(records[1].step_index, 1);
        assert_eq!(store.load_root().expect("root"), outcome.merkle_root);
        let manifest = store.load_manifest().expect("manifest");
        assert_eq!(manifest.anchor, outcome.anchor);
    }

    #[test]
    fn setup_is_idempotent_for_key_material() {
        let temp = TempDir::new().expect("tempdir");
        let config = config_in(&temp);
        run_setup(&config).expect("first setup");
        let authority_before =
            fs::read(config.authority_key_path()).expect("authority key exists");
        run_setup(&config).expect("second setup");
        let authority_after = fs::read(config.authority_key_path()).expect("still there");
        assert_eq!(authority_before, authority_after);
    }
}
