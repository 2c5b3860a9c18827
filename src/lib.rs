//! TI-Toolbox simulation orchestration core.
//!
//! Given a subject, a simulation configuration, and a set of electrode
//! montages, this crate builds per-montage work units, executes them with
//! bounded parallelism, post-processes solver output into a canonical
//! on-disk layout, and emits a machine-readable completion manifest.
//!
//! # Components
//!
//! - [`path`] — BIDS-style path resolution and subject/artifact listing.
//! - [`config`] — typed simulation configuration (intensities, electrode
//!   geometry, conductivity, parallelism policy).
//! - [`montage`] — the montage model, its on-disk store, and flex-search
//!   derivation.
//! - [`session`] — assembles a solver-ready session description for one
//!   montage.
//! - [`kernel`] — the pure TI/mTI numeric kernel (Grossman et al. 2017).
//! - [`postprocess`] — TI/mTI field computation, tissue extraction,
//!   mesh→NIfTI conversion, and output-tree organization.
//! - [`runner`] — schedules montages sequentially or across a worker
//!   pool, with cancellation, per-worker logging, and progress reporting.
//! - [`manifest`] — the completion manifest written once per run.
//! - [`collaborators`] — capability interfaces for the solver and its
//!   satellite tools (field extraction, NIfTI conversion, visualization,
//!   label mapping), each with a built-in fallback.
//!
//! This crate does not perform numerical field solving, atlas statistics,
//! or figure rendering, and does not supervise upstream preprocessing
//! (DICOM→NIfTI, segmentation, `recon-all`); those remain external
//! collaborators.

pub mod collaborators;
pub mod config;
pub mod error;
pub mod kernel;
pub mod manifest;
pub mod montage;
pub mod path;
pub mod postprocess;
pub mod runner;
pub mod session;

pub use collaborators::Collaborators;
pub use config::SimulationConfig;
pub use error::{TiError, TiResult};
pub use manifest::CompletionManifest;
pub use montage::{Montage, MontageStore};
pub use path::PathManager;
pub use runner::{CancelToken, Progress, RunnerOptions, SimResult, SimulationRunner};

/// Initializes logging with default settings (`RUST_LOG` or `info`).
pub fn init_logging() {
    init_logging_with_level("info");
}

/// Initializes logging with an explicit default level, overridable via
/// `RUST_LOG`.
pub fn init_logging_with_level(level: &str) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let env_filter = std::env::var("RUST_LOG").unwrap_or_else(|_| format!("ti_toolbox_core={level}"));

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| env_filter.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false),
        )
        .init();
}

/// Runs a full batch for one subject: resolves paths, loads the
/// requested montages (store and/or flex-derived), schedules them, and
/// writes the completion manifest. The thin orchestration a front-end
/// dispatcher calls into.
pub async fn run_batch(
    paths: PathManager,
    config: SimulationConfig,
    montages: Vec<Montage>,
    collaborators: Collaborators,
    options: RunnerOptions,
) -> TiResult<(Vec<SimResult>, std::path::PathBuf)> {
    if let Some(warning) = config.parallel.memory_warning() {
        tracing::warn!("{warning}");
    }

    let subject = config.subject_id.clone();
    let project_dir = paths.project_dir().to_path_buf();
    let simulation_dir = paths.simulation_dir(&subject, None);

    let runner = SimulationRunner::new(paths.clone(), config, collaborators, options);
    let results = runner.run(montages).await?;

    let completed: Vec<SimResult> = results
        .iter()
        .filter(|r| r.status == runner::SimStatus::Completed)
        .cloned()
        .collect();
    let failed: Vec<SimResult> = results
        .iter()
        .filter(|r| r.status == runner::SimStatus::Failed)
        .cloned()
        .collect();

    let timestamp = chrono::Utc::now().timestamp();
    let manifest = CompletionManifest::new(subject, project_dir, simulation_dir, completed, failed, timestamp);
    let manifest_path = manifest.write(&paths.derivatives_dir())?;

    Ok((results, manifest_path))
}
