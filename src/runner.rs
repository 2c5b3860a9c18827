//! Schedules montages sequentially or across a bounded worker pool,
//! drives the session builder and post-processor for each, and reports
//! progress.
//!
//! Concurrency-limited dispatch via a semaphore-bounded task pool, with
//! progress tracked through an atomic completed-count. The collaborator
//! that actually needs process isolation is the
//! [`crate::collaborators::Solver`] itself (it already shells out), so
//! worker concurrency is modeled with bounded `tokio` blocking tasks
//! rather than forking this binary per unit — see DESIGN.md for the
//! tradeoff.

use crate::collaborators::Collaborators;
use crate::config::{SimulationConfig, SimulationMode};
use crate::error::{TiError, TiResult};
use crate::montage::Montage;
use crate::path::PathManager;
use crate::postprocess::DirectorySchema;
use crate::session::SessionBuilder;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

const DEFAULT_UNIT_DEADLINE: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SimStatus {
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimResult {
    pub montage_name: String,
    pub montage_type: String,
    pub status: SimStatus,
    pub output_mesh: Option<PathBuf>,
    pub error: Option<String>,
}

impl SimResult {
    fn completed(montage_name: String, montage_type: &'static str, output_mesh: PathBuf) -> Self {
        Self {
            montage_name,
            montage_type: montage_type.into(),
            status: SimStatus::Completed,
            output_mesh: Some(output_mesh),
            error: None,
        }
    }

    fn failed(montage_name: String, montage_type: &'static str, error: String) -> Self {
        Self {
            montage_name,
            montage_type: montage_type.into(),
            status: SimStatus::Failed,
            output_mesh: None,
            error: Some(error),
        }
    }
}

/// Progress reported during a run. Sequential mode reports before each
/// unit starts; parallel mode reports a monotonically increasing
/// completed-count as units finish, in completion order (which need not
/// match submission order).
#[derive(Debug, Clone)]
pub enum Progress {
    Started { index: usize, total: usize, montage_name: String },
    Completed { completed: usize, total: usize, montage_name: String },
}

pub type ProgressCallback = Arc<dyn Fn(Progress) + Send + Sync>;

/// Cooperative cancellation: pending units are never started once set;
/// running units are left to finish, since partial solver output cannot
/// be made consistent from the outside.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// `documentation/config.json`: the full config + montage snapshot a
/// downstream report generator reads back.
#[derive(Debug, Clone, Serialize)]
struct ConfigSnapshot<'a> {
    subject: &'a str,
    simulation_name: &'a str,
    simulation_mode: &'static str,
    eeg_net: Option<&'a str>,
    conductivity_type: &'a str,
    is_xyz: bool,
    intensities_ma: [f64; 4],
    electrode: &'a crate::config::ElectrodeConfig,
    map_to_surf: bool,
    map_to_vol: bool,
    map_to_mni: bool,
    map_to_fsavg: bool,
    created_at: i64,
    toolbox_version: &'static str,
}

pub struct RunnerOptions {
    pub unit_deadline: Duration,
    pub world_writable_montage_store: bool,
    pub progress: Option<ProgressCallback>,
    pub cancel: CancelToken,
    /// Injected for deterministic tests; real callers leave this `None`
    /// and get wall-clock time.
    pub now: Option<i64>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            unit_deadline: DEFAULT_UNIT_DEADLINE,
            world_writable_montage_store: false,
            progress: None,
            cancel: CancelToken::new(),
            now: None,
        }
    }
}

pub struct SimulationRunner {
    paths: PathManager,
    config: SimulationConfig,
    collaborators: Arc<Collaborators>,
    options: RunnerOptions,
}

impl SimulationRunner {
    pub fn new(paths: PathManager, config: SimulationConfig, collaborators: Collaborators, options: RunnerOptions) -> Self {
        Self {
            paths,
            config,
            collaborators: Arc::new(collaborators),
            options,
        }
    }

    /// `true` iff parallel execution is selected for this batch: enabled
    /// in config, more than one montage submitted, and more than one
    /// effective worker resolved.
    fn should_run_parallel(&self, montage_count: usize) -> bool {
        self.config.parallel.enabled
            && montage_count > 1
            && self.config.parallel.effective_workers() > 1
    }

    pub async fn run(&self, montages: Vec<Montage>) -> TiResult<Vec<SimResult>> {
        if montages.is_empty() {
            return Ok(Vec::new());
        }

        if self.should_run_parallel(montages.len()) {
            self.run_parallel(montages).await
        } else {
            self.run_sequential(montages).await
        }
    }

    async fn run_sequential(&self, montages: Vec<Montage>) -> TiResult<Vec<SimResult>> {
        let total = montages.len();
        let mut results = Vec::with_capacity(total);

        for (index, montage) in montages.into_iter().enumerate() {
            if self.options.cancel.is_cancelled() {
                break;
            }
            self.report(Progress::Started {
                index,
                total,
                montage_name: montage.name.clone(),
            });

            let result = self.run_unit_with_deadline(montage).await;
            results.push(result);
        }

        Ok(results)
    }

    async fn run_parallel(&self, montages: Vec<Montage>) -> TiResult<Vec<SimResult>> {
        let total = montages.len();
        let workers = self.config.parallel.effective_workers();
        let semaphore = Arc::new(tokio::sync::Semaphore::new(workers));
        let completed_counter = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::with_capacity(total);
        for (index, montage) in montages.into_iter().enumerate() {
            if self.options.cancel.is_cancelled() {
                break;
            }
            let semaphore = semaphore.clone();
            let paths = self.paths.clone();
            let config = self.config.clone();
            let collaborators = self.collaborators.clone();
            let deadline = self.options.unit_deadline;
            let cancel = self.options.cancel.clone();
            let progress = self.options.progress.clone();
            let completed_counter = completed_counter.clone();
            let now = self.options.now;
            let montage_name = montage.name.clone();

            let handle = tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                if cancel.is_cancelled() {
                    return (index, SimResult::failed(montage_name, "unknown", "cancelled before start".into()));
                }

                let unit = run_montage_worker(paths, config, collaborators, montage, now);
                let result = match tokio::time::timeout(deadline, unit).await {
                    Ok(result) => result,
                    Err(_) => SimResult::failed(montage_name.clone(), "unknown", format!("unit exceeded {:?} deadline", deadline)),
                };

                let completed = completed_counter.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(cb) = &progress {
                    cb(Progress::Completed {
                        completed,
                        total,
                        montage_name: result.montage_name.clone(),
                    });
                }
                (index, result)
            });
            handles.push(handle);
        }

        let mut indexed_results: Vec<(usize, SimResult)> = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(pair) => indexed_results.push(pair),
                Err(join_err) => {
                    tracing::error!("worker task panicked: {join_err}");
                }
            }
        }

        // Completion manifest stability: sorted back to submission order,
        // even though workers finish out of order.
        indexed_results.sort_by_key(|(index, _)| *index);
        Ok(indexed_results.into_iter().map(|(_, r)| r).collect())
    }

    async fn run_unit_with_deadline(&self, montage: Montage) -> SimResult {
        let paths = self.paths.clone();
        let config = self.config.clone();
        let collaborators = self.collaborators.clone();
        let deadline = self.options.unit_deadline;
        let now = self.options.now;
        let montage_name = montage.name.clone();

        match tokio::time::timeout(deadline, run_montage_worker(paths, config, collaborators, montage, now)).await {
            Ok(result) => result,
            Err(_) => SimResult::failed(montage_name, "unknown", format!("unit exceeded {:?} deadline", deadline)),
        }
    }

    fn report(&self, event: Progress) {
        if let Some(cb) = &self.options.progress {
            cb(event);
        }
    }
}

/// Private, per-worker log file under `derivatives/tit/logs/sub-<S>/` —
/// each montage gets its own dedicated file rather than sharing stdout
/// across workers, so this writer is the isolation boundary: nothing
/// else in the unit of work touches tracing's global subscriber.
struct WorkerLog {
    file: std::fs::File,
}

impl WorkerLog {
    fn open(paths: &PathManager, subject: &str, montage_name: &str) -> TiResult<Self> {
        let dir = paths.logs_dir(subject);
        std::fs::create_dir_all(&dir).map_err(|e| TiError::io(&dir, e))?;
        let path = dir.join(format!("{montage_name}.log"));
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| TiError::io(&path, e))?;
        Ok(Self { file })
    }

    fn line(&mut self, message: &str) {
        let _ = writeln!(self.file, "[{}] {message}", chrono::Utc::now().to_rfc3339());
    }
}

/// The unit of work shared by sequential and parallel execution:
/// directory schema, config snapshot, visualization, session build,
/// solve, post-process.
async fn run_montage_worker(
    paths: PathManager,
    config: SimulationConfig,
    collaborators: Arc<Collaborators>,
    montage: Montage,
    now_override: Option<i64>,
) -> SimResult {
    let montage_name = montage.name.clone();
    tokio::task::spawn_blocking(move || {
        run_montage_unit(&paths, &config, &collaborators, &montage, now_override)
            .unwrap_or_else(|e| {
                let mode_str = montage.simulation_mode().map(mode_label).unwrap_or("unknown");
                SimResult::failed(montage.name.clone(), mode_str, e.to_string())
            })
    })
    .await
    .unwrap_or_else(|join_err| SimResult::failed(montage_name, "unknown", format!("worker panicked: {join_err}")))
}

fn mode_label(mode: SimulationMode) -> &'static str {
    match mode {
        SimulationMode::Ti => "TI",
        SimulationMode::Mti => "mTI",
    }
}

fn run_montage_unit(
    paths: &PathManager,
    config: &SimulationConfig,
    collaborators: &Collaborators,
    montage: &Montage,
    now_override: Option<i64>,
) -> TiResult<SimResult> {
    let mode = montage.simulation_mode()?;
    let mode_str = mode_label(mode);
    let subject = &config.subject_id;

    let mut log = WorkerLog::open(paths, subject, &montage.name)?;
    log.line(&format!("starting {mode_str} montage {}", montage.name));

    let montage_dir = paths.simulation_dir(subject, Some(montage.name.as_str()));
    let schema = DirectorySchema::build(&montage_dir, mode)?;

    write_config_snapshot(&schema.documentation_dir, config, montage, mode_str, now_override)?;

    if should_visualize(montage) {
        let labels = electrode_label_pairs(montage);
        if let Err(e) = collaborators
            .visualizer
            .visualize(&montage.name, &labels, &schema.ti_montage_imgs_dir)
        {
            log.line(&format!("visualization failed (non-fatal): {e}"));
        }
    } else {
        log.line("skipping visualization: freehand/flex_mode sentinel with no label pairs");
    }

    let builder = SessionBuilder::new(config, paths);
    let hf_dir = montage_dir.join("high_Frequency");
    std::fs::create_dir_all(&hf_dir).map_err(|e| TiError::io(&hf_dir, e))?;
    let session = builder.build(montage, &hf_dir)?;

    log.line("invoking solver");
    collaborators.solver.run(&session)?;

    let post = crate::postprocess::PostProcessor::new(
        subject.clone(),
        config.conductivity_type,
        paths.m2m_dir(subject),
        collaborators,
    );

    let output_mesh = match mode {
        SimulationMode::Ti => post.process_ti_results(&hf_dir, &schema, &montage.name)?,
        SimulationMode::Mti => post.process_mti_results(&hf_dir, &schema, &montage.name)?,
    };

    log.line(&format!("completed: {}", output_mesh.display()));
    Ok(SimResult::completed(montage.name.clone(), mode_str, output_mesh))
}

/// Skip visualization iff the EEG cap is the synthetic
/// `freehand`/`flex_mode` sentinel *and* no label pairs are known
/// through the montage itself.
fn should_visualize(montage: &Montage) -> bool {
    let is_sentinel_net = matches!(montage.eeg_net.as_deref(), Some("freehand") | Some("flex_mode"));
    !(is_sentinel_net && !montage.has_label_pairs())
}

fn electrode_label_pairs(montage: &Montage) -> Vec<(String, String)> {
    montage
        .electrode_pairs
        .iter()
        .filter_map(|(a, b)| match (a, b) {
            (crate::montage::Electrode::Label(a), crate::montage::Electrode::Label(b)) => {
                Some((a.clone(), b.clone()))
            }
            _ => None,
        })
        .collect()
}

fn write_config_snapshot(
    documentation_dir: &std::path::Path,
    config: &SimulationConfig,
    montage: &Montage,
    mode_str: &'static str,
    now_override: Option<i64>,
) -> TiResult<()> {
    let snapshot = ConfigSnapshot {
        subject: &config.subject_id,
        simulation_name: &montage.name,
        simulation_mode: mode_str,
        eeg_net: montage.eeg_net.as_deref().or(Some(config.eeg_net.as_str())),
        conductivity_type: config.conductivity_type.as_str(),
        is_xyz: montage.is_xyz,
        intensities_ma: config.intensities.as_array(),
        electrode: &config.electrode,
        map_to_surf: config.map_to_surf,
        map_to_vol: config.map_to_vol,
        map_to_mni: config.map_to_mni,
        map_to_fsavg: config.map_to_fsavg,
        created_at: now_override.unwrap_or_else(|| chrono::Utc::now().timestamp()),
        toolbox_version: env!("CARGO_PKG_VERSION"),
    };

    let path = documentation_dir.join("config.json");
    let json = serde_json::to_string_pretty(&snapshot)?;
    std::fs::write(&path, json).map_err(|e| TiError::io(&path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConductivityType, IntensityConfig, SimulationConfig};
    use crate::montage::{Electrode, Montage};
    use tempfile::tempdir;

    fn base_config(subject: &str) -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.subject_id = subject.into();
        config.conductivity_type = ConductivityType::Scalar;
        config
    }

    fn ti_montage() -> Montage {
        Montage::new(
            "bipolar",
            vec![
                (Electrode::Label("E1".into()), Electrode::Label("E2".into())),
                (Electrode::Label("E3".into()), Electrode::Label("E4".into())),
            ],
        )
    }

    #[test]
    fn sequential_chosen_when_parallel_disabled() {
        let paths = PathManager::from_root("/tmp/proj");
        let config = base_config("101");
        let runner = SimulationRunner::new(paths, config, Collaborators::fallbacks("solver"), RunnerOptions::default());
        assert!(!runner.should_run_parallel(3));
    }

    #[test]
    fn sequential_chosen_for_single_montage_even_if_parallel_enabled() {
        let paths = PathManager::from_root("/tmp/proj");
        let mut config = base_config("101");
        config.parallel.enabled = true;
        config.parallel.max_workers = 4;
        let runner = SimulationRunner::new(paths, config, Collaborators::fallbacks("solver"), RunnerOptions::default());
        assert!(!runner.should_run_parallel(1));
    }

    #[test]
    fn parallel_chosen_when_enabled_with_multiple_workers_and_montages() {
        let paths = PathManager::from_root("/tmp/proj");
        let mut config = base_config("101");
        config.parallel.enabled = true;
        config.parallel.max_workers = 4;
        let runner = SimulationRunner::new(paths, config, Collaborators::fallbacks("solver"), RunnerOptions::default());
        assert!(runner.should_run_parallel(3));
    }

    #[test]
    fn visualization_skipped_only_for_sentinel_net_without_labels() {
        let mut montage = ti_montage();
        montage.eeg_net = Some("freehand".into());
        assert!(!should_visualize(&montage));

        let mut with_labels = ti_montage();
        with_labels.eeg_net = Some("flex_mode".into());
        assert!(should_visualize(&with_labels), "label pairs are known, so visualization should proceed");

        let mut real_net = ti_montage();
        real_net.eeg_net = Some("GSN-HydroCel-185.csv".into());
        assert!(should_visualize(&real_net));
    }

    #[tokio::test]
    async fn empty_montage_list_yields_empty_results() {
        let paths = PathManager::from_root("/tmp/proj");
        let config = base_config("101");
        let runner = SimulationRunner::new(paths, config, Collaborators::fallbacks("solver"), RunnerOptions::default());
        let results = runner.run(Vec::new()).await.unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn manifest_totality_holds_across_mixed_results() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("derivatives/SimNIBS/sub-101/m2m_101/eeg_positions")).unwrap();

        let paths = PathManager::from_root(root);
        let mut config = base_config("101");
        config.intensities = IntensityConfig::from_string("2.0,1.5").unwrap();
        let runner = SimulationRunner::new(paths, config, Collaborators::fallbacks("nonexistent-solver-binary"), RunnerOptions::default());

        let montages = vec![ti_montage()];
        let results = runner.run(montages).await.unwrap();
        assert_eq!(results.len(), 1);
        // The fallback solver executable doesn't exist on disk, so the unit
        // is expected to fail; the important invariant is that it's
        // recorded, not silently dropped.
        assert_eq!(results[0].status, SimStatus::Failed);
    }
}
