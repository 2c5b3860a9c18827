//! Minimal driver for the TI-Toolbox simulation orchestration core.
//!
//! Interactive CLI dispatchers and a GUI front-end are out of scope here
//! — they're the layer that translates user input into the core's
//! inputs. This binary is the thinnest possible stand-in: it resolves
//! the project from the environment, loads (or creates) a simulation
//! config, loads a subject's stored montages for the configured EEG net,
//! and runs the batch.

use anyhow::Context;
use std::path::PathBuf;
use ti_toolbox_core::config::SimulationConfig;
use ti_toolbox_core::montage::{Montage, MontageStore};
use ti_toolbox_core::path::PathManager;
use ti_toolbox_core::runner::RunnerOptions;
use ti_toolbox_core::{collaborators::Collaborators, run_batch, TiError};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ti_toolbox_core::init_logging();

    tracing::info!("TI-Toolbox simulation orchestration core v{}", env!("CARGO_PKG_VERSION"));

    let paths = PathManager::resolve()?;
    tracing::info!("project root: {}", paths.project_dir().display());

    let config_path = std::env::var("TI_TOOLBOX_SIM_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| paths.montage_config_dir().join("sim_config.toml"));
    let config = SimulationConfig::load(&config_path)
        .with_context(|| format!("loading simulation config from {}", config_path.display()))?;

    if config.subject_id.is_empty() {
        return Err(TiError::Config(format!(
            "{} has no subject_id set; populate it before running",
            config_path.display()
        ))
        .into());
    }

    let store = MontageStore::new(paths.clone(), false);
    let (uni, multi) = store.load(&config.eeg_net)?;
    let montages: Vec<Montage> = uni
        .into_iter()
        .chain(multi)
        .map(|(name, pairs)| Montage {
            name,
            electrode_pairs: pairs,
            is_xyz: false,
            eeg_net: Some(config.eeg_net.clone()),
        })
        .collect();

    if montages.is_empty() {
        tracing::warn!(
            "no montages found for net {:?}; nothing to run",
            config.eeg_net
        );
        return Ok(());
    }

    let solver_executable = std::env::var("TI_TOOLBOX_SOLVER").unwrap_or_else(|_| "simnibs-tdcs".into());
    let collaborators = Collaborators::fallbacks(solver_executable);

    let (results, manifest_path) = run_batch(paths, config, montages, collaborators, RunnerOptions::default()).await?;

    let completed = results.iter().filter(|r| r.status == ti_toolbox_core::runner::SimStatus::Completed).count();
    tracing::info!(
        "run finished: {completed}/{} montages completed; manifest at {}",
        results.len(),
        manifest_path.display()
    );

    Ok(())
}
