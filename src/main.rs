use std::path::PathBuf;

use anyhow::{Result, anyhow};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use stepchain::anchor::AnchorClient;
use stepchain::artifacts::RunStore;
use stepchain::auditor::Auditor;
use stepchain::config::RunnerConfig;
use stepchain::crypto::{
    generate_keypair, generate_sealing_keypair, save_keypair, save_sealing_keypair,
};
use stepchain::runner;
use stepchain::types::RunId;

#[derive(Parser)]
#[command(author, version, about = "Verifiable step ledger for proof-carrying training runs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile the circuit, generate key material and the broker policy
    Setup {
        #[arg(short, long, default_value = "config/runner.toml")]
        config: PathBuf,
    },
    /// Generate a default runner configuration file
    GenerateConfig {
        #[arg(short, long, default_value = "config/runner.toml")]
        path: PathBuf,
    },
    /// Generate fresh attestation authority and sealing keypairs
    Keygen {
        #[arg(short, long, default_value = "keys/attestation_authority.toml")]
        path: PathBuf,
        #[arg(long, default_value = "keys/trainer_sealing.toml")]
        sealing_path: PathBuf,
    },
    /// Execute a training run: prove each step, publish artifacts, anchor
    Run {
        #[arg(short, long, default_value = "config/runner.toml")]
        config: PathBuf,
    },
    /// Anchor an already-published run whose anchoring did not complete
    Anchor {
        #[arg(short, long, default_value = "config/runner.toml")]
        config: PathBuf,
        #[arg(long)]
        run_id: String,
    },
    /// Verify a published run; exits non-zero and prints failing steps on rejection
    Audit {
        #[arg(short, long, default_value = "config/runner.toml")]
        config: PathBuf,
        #[arg(long)]
        run_id: String,
        #[arg(long, default_value_t = 10)]
        sample_size: usize,
        /// Seed for reproducible sampling; omitted means a fresh random sample
        #[arg(long)]
        seed: Option<u64>,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Setup { config } => setup(config)?,
        Commands::GenerateConfig { path } => generate_config(path)?,
        Commands::Keygen { path, sealing_path } => keygen(path, sealing_path)?,
        Commands::Run { config } => run(config)?,
        Commands::Anchor { config, run_id } => anchor_run(config, run_id)?,
        Commands::Audit {
            config,
            run_id,
            sample_size,
            seed,
        } => audit(config, run_id, sample_size, seed)?,
    }

    Ok(())
}

fn load_config(path: &PathBuf) -> Result<RunnerConfig> {
    if path.exists() {
        Ok(RunnerConfig::load(path)?)
    } else {
        let config = RunnerConfig::default();
        config.save(path)?;
        Ok(config)
    }
}

fn setup(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    runner::run_setup(&config)?;
    Ok(())
}

fn generate_config(path: PathBuf) -> Result<()> {
    let config = RunnerConfig::default();
    config.ensure_directories()?;
    config.save(&path)?;
    info!(?path, "wrote default configuration");
    Ok(())
}

fn keygen(path: PathBuf, sealing_path: PathBuf) -> Result<()> {
    let keypair = generate_keypair();
    save_keypair(&path, &keypair)?;
    let sealing = generate_sealing_keypair();
    save_sealing_keypair(&sealing_path, &sealing)?;
    info!(?path, ?sealing_path, "generated authority and sealing keypairs");
    Ok(())
}

fn run(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    let context = runner::load_context(&config)?;
    let outcome = runner::execute_run(&config, &context)?;
    info!(
        run_id = %outcome.run_id,
        steps = outcome.steps_recorded,
        root = %outcome.merkle_root,
        "run complete"
    );
    println!("{}", outcome.run_id);
    Ok(())
}

fn anchor_run(config_path: PathBuf, run_id: String) -> Result<()> {
    let config = load_config(&config_path)?;
    let context = runner::load_context(&config)?;
    let run_id = RunId::new(run_id);
    let store = RunStore::open(&config.artifact_dir, &run_id)?;
    let mut manifest = store.load_manifest()?;
    let records = store.load_records()?;
    let root = store.load_root()?;
    let Some(tail) = records.last() else {
        return Err(anyhow!("run {run_id} has no recorded steps; nothing to anchor"));
    };

    let client = AnchorClient::new(
        context.authority.clone(),
        context.backend.clone(),
        context.circuit.clone(),
        context.verifying_key.clone(),
    )
    .with_retry(config.anchor.retry_policy());

    if let Some(stamp) = &manifest.anchor {
        if let Some(existing) = client.authority().anchor_at(&run_id, stamp.counter)? {
            if existing.digest == root {
                info!(%run_id, counter = stamp.counter, "run already anchored");
                return Ok(());
            }
        }
    }

    let proof = store.load_proof(tail.step_index)?;
    let counter = client.next_counter(&run_id)?;
    let stamp = client.anchor(&run_id, counter, root, &proof, &tail.public_inputs)?;
    info!(%run_id, counter = stamp.counter, "run anchored");
    manifest.anchor = Some(stamp);
    store.write_manifest(&manifest)?;
    Ok(())
}

fn audit(
    config_path: PathBuf,
    run_id: String,
    sample_size: usize,
    seed: Option<u64>,
) -> Result<()> {
    let config = load_config(&config_path)?;
    let context = runner::load_context(&config)?;
    let run_id = RunId::new(run_id);
    let store = RunStore::open(&config.artifact_dir, &run_id)?;
    let auditor = Auditor::new(
        context.backend.clone(),
        context.circuit.clone(),
        context.verifying_key.clone(),
    );
    let report = auditor.audit_run(&store, context.authority.as_ref(), sample_size, seed)?;
    if report.passed() {
        info!(%run_id, sampled = report.sampled.len(), "audit passed");
        return Ok(());
    }
    for failure in &report.failures {
        eprintln!("{failure}");
    }
    std::process::exit(1);
}
