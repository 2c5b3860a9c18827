//! BIDS-style path resolution for a TI-Toolbox project.
//!
//! A project root is expected to look like:
//!
//! ```text
//! <root>/sub-<S>/...
//! <root>/derivatives/SimNIBS/sub-<S>/m2m_<S>/...
//! <root>/derivatives/SimNIBS/sub-<S>/m2m_<S>/Simulations/<montage>/...
//! <root>/derivatives/ti-toolbox/flex_search/sub-<S>/<run>/electrode_positions.json
//! ```
//!
//! Listing operations never fail on a missing directory — an absent root
//! just contributes nothing to the listing. Only resolving the project
//! root itself can fail, and it fails with [`TiError::Config`].

use crate::error::{TiError, TiResult};
use std::env;
use std::path::{Path, PathBuf};

const PROJECT_DIR_ENV: &str = "PROJECT_DIR";
const PROJECT_DIR_NAME_ENV: &str = "PROJECT_DIR_NAME";
const PROJECTS_BASE_ENV: &str = "TI_TOOLBOX_PROJECTS_DIR";
const DEFAULT_PROJECTS_BASE: &str = "/mnt/projects";

#[derive(Debug, Clone)]
pub struct PathManager {
    root: PathBuf,
}

impl PathManager {
    /// Resolve the project root from the environment.
    ///
    /// `PROJECT_DIR` takes precedence as an absolute path to the project.
    /// Otherwise `PROJECT_DIR_NAME` is joined onto `TI_TOOLBOX_PROJECTS_DIR`
    /// (defaulting to `/mnt/projects`), mirroring the bind-mount convention
    /// the toolbox's container entrypoints use.
    pub fn resolve() -> TiResult<Self> {
        if let Ok(dir) = env::var(PROJECT_DIR_ENV) {
            let root = PathBuf::from(dir);
            if root.as_os_str().is_empty() {
                return Err(TiError::Config(format!("{PROJECT_DIR_ENV} is empty")));
            }
            return Ok(Self { root });
        }

        if let Ok(name) = env::var(PROJECT_DIR_NAME_ENV) {
            if name.trim().is_empty() {
                return Err(TiError::Config(format!("{PROJECT_DIR_NAME_ENV} is empty")));
            }
            let base = env::var(PROJECTS_BASE_ENV).unwrap_or_else(|_| DEFAULT_PROJECTS_BASE.into());
            return Ok(Self {
                root: PathBuf::from(base).join(name),
            });
        }

        Err(TiError::Config(format!(
            "neither {PROJECT_DIR_ENV} nor {PROJECT_DIR_NAME_ENV} is set"
        )))
    }

    pub fn from_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn project_dir(&self) -> &Path {
        &self.root
    }

    pub fn derivatives_dir(&self) -> PathBuf {
        self.root.join("derivatives")
    }

    fn simnibs_derivatives_dir(&self) -> PathBuf {
        self.derivatives_dir().join("SimNIBS")
    }

    fn ti_toolbox_derivatives_dir(&self) -> PathBuf {
        self.derivatives_dir().join("ti-toolbox")
    }

    fn flex_search_root(&self) -> PathBuf {
        self.ti_toolbox_derivatives_dir().join("flex_search")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.derivatives_dir().join("reports")
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.derivatives_dir().join("temp")
    }

    pub fn logs_dir(&self, subject: &str) -> PathBuf {
        self.derivatives_dir()
            .join("tit")
            .join("logs")
            .join(sub_dirname(subject))
    }

    pub fn subject_dir(&self, subject: &str) -> PathBuf {
        self.root.join(sub_dirname(subject))
    }

    pub fn m2m_dir(&self, subject: &str) -> PathBuf {
        self.simnibs_derivatives_dir()
            .join(sub_dirname(subject))
            .join(format!("m2m_{subject}"))
    }

    pub fn head_mesh_path(&self, subject: &str) -> PathBuf {
        self.m2m_dir(subject).join(format!("{subject}.msh"))
    }

    pub fn dti_tensor_path(&self, subject: &str) -> PathBuf {
        self.m2m_dir(subject).join("DTI_coregT1_tensor.nii.gz")
    }

    pub fn eeg_positions_dir(&self, subject: &str) -> PathBuf {
        self.m2m_dir(subject).join("eeg_positions")
    }

    pub fn leadfield_dir(&self, subject: &str) -> PathBuf {
        self.m2m_dir(subject).join("leadfield")
    }

    pub fn montage_config_dir(&self) -> PathBuf {
        self.root.join("code").join("ti-toolbox").join("config")
    }

    pub fn montage_list_path(&self) -> PathBuf {
        self.montage_config_dir().join("montage_list.json")
    }

    /// Root of a montage's output tree, or the subject's `Simulations` dir
    /// when `name` is absent.
    pub fn simulation_dir(&self, subject: &str, name: Option<&str>) -> PathBuf {
        let base = self.m2m_dir(subject).join("Simulations");
        match name {
            Some(name) => base.join(name),
            None => base,
        }
    }

    pub fn flex_search_dir(&self, subject: &str, run: Option<&str>) -> PathBuf {
        let base = self.flex_search_root().join(sub_dirname(subject));
        match run {
            Some(run) => base.join(run),
            None => base,
        }
    }

    pub fn flex_electrode_positions_path(&self, subject: &str, run: &str) -> PathBuf {
        self.flex_search_dir(subject, Some(run))
            .join("electrode_positions.json")
    }

    /// Path of the cached label-mapping result for `eeg_net` within a flex
    /// run, e.g. `electrode_mapping_GSN-HydroCel-185.json`.
    pub fn flex_electrode_mapping_path(&self, subject: &str, run: &str, eeg_net: &str) -> PathBuf {
        let stem = eeg_net.trim_end_matches(".csv");
        self.flex_search_dir(subject, Some(run))
            .join(format!("electrode_mapping_{stem}.json"))
    }

    pub fn get_analysis_output_dir(&self, subject: &str, montage_name: &str) -> PathBuf {
        self.simulation_dir(subject, Some(montage_name))
            .join("high_Frequency")
            .join("analysis")
    }

    /// Subjects discovered under the project root, `derivatives/SimNIBS`,
    /// and `derivatives/ti-toolbox/flex_search`. Naturally sorted,
    /// deduplicated, `sub-` prefix stripped. Missing roots contribute
    /// nothing rather than erroring.
    pub fn list_subjects(&self) -> Vec<String> {
        let mut found = Vec::new();
        for root in [
            self.root.clone(),
            self.simnibs_derivatives_dir(),
            self.flex_search_root(),
        ] {
            found.extend(list_sub_dirs(&root));
        }
        found.sort_by(|a, b| natural_cmp(a, b));
        found.dedup();
        found
    }

    pub fn list_eeg_caps(&self, subject: &str) -> Vec<String> {
        let dir = self.eeg_positions_dir(subject);
        let mut names = list_file_names(&dir, |p| {
            p.extension().map(|e| e == "csv").unwrap_or(false)
        });
        names.sort_by(|a, b| natural_cmp(a, b));
        names
    }

    pub fn list_simulations(&self, subject: &str) -> Vec<String> {
        let dir = self.simulation_dir(subject, None);
        let mut names = list_subdir_names(&dir);
        names.sort_by(|a, b| natural_cmp(a, b));
        names
    }

    pub fn list_flex_search_runs(&self, subject: &str) -> Vec<String> {
        let dir = self.flex_search_dir(subject, None);
        let mut names = list_subdir_names(&dir);
        names.sort_by(|a, b| natural_cmp(a, b));
        names
    }
}

fn sub_dirname(subject: &str) -> String {
    if let Some(stripped) = subject.strip_prefix("sub-") {
        format!("sub-{stripped}")
    } else {
        format!("sub-{subject}")
    }
}

fn list_sub_dirs(root: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(root) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .filter_map(|name| name.strip_prefix("sub-").map(String::from))
        .collect()
}

fn list_subdir_names(dir: &Path) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir())
        .filter_map(|e| e.file_name().into_string().ok())
        .collect()
}

fn list_file_names(dir: &Path, predicate: impl Fn(&Path) -> bool) -> Vec<String> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_file() && predicate(p))
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()).map(String::from))
        .collect()
}

/// Compares strings the way a human expects filenames to sort: runs of
/// digits compare by numeric value rather than lexicographically, so
/// `sub-2` sorts before `sub-10`.
fn natural_cmp(a: &str, b: &str) -> std::cmp::Ordering {
    let mut ai = a.chars().peekable();
    let mut bi = b.chars().peekable();
    loop {
        match (ai.peek(), bi.peek()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(ca), Some(cb)) => {
                if ca.is_ascii_digit() && cb.is_ascii_digit() {
                    let na = take_number(&mut ai);
                    let nb = take_number(&mut bi);
                    match na.cmp(&nb) {
                        std::cmp::Ordering::Equal => continue,
                        other => return other,
                    }
                } else {
                    match ca.cmp(cb) {
                        std::cmp::Ordering::Equal => {
                            ai.next();
                            bi.next();
                            continue;
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn take_number(iter: &mut std::iter::Peekable<std::str::Chars>) -> u64 {
    let mut value: u64 = 0;
    while let Some(c) = iter.peek() {
        if let Some(d) = c.to_digit(10) {
            value = value.saturating_mul(10).saturating_add(d as u64);
            iter.next();
        } else {
            break;
        }
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn resolve_requires_env() {
        std::env::remove_var(PROJECT_DIR_ENV);
        std::env::remove_var(PROJECT_DIR_NAME_ENV);
        assert!(PathManager::resolve().is_err());
    }

    #[test]
    fn layout_is_deterministic() {
        let pm = PathManager::from_root("/data/project");
        assert_eq!(pm.m2m_dir("101"), PathBuf::from("/data/project/derivatives/SimNIBS/sub-101/m2m_101"));
        assert_eq!(
            pm.simulation_dir("101", Some("bipolar")),
            PathBuf::from("/data/project/derivatives/SimNIBS/sub-101/m2m_101/Simulations/bipolar")
        );
        assert_eq!(
            pm.montage_list_path(),
            PathBuf::from("/data/project/code/ti-toolbox/config/montage_list.json")
        );
    }

    #[test]
    fn list_subjects_never_errors_on_missing_roots() {
        let pm = PathManager::from_root("/does/not/exist");
        assert!(pm.list_subjects().is_empty());
    }

    #[test]
    fn list_subjects_dedups_and_sorts_naturally() {
        let dir = tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub-10")).unwrap();
        std::fs::create_dir_all(root.join("sub-2")).unwrap();
        std::fs::create_dir_all(root.join("derivatives/SimNIBS/sub-2")).unwrap();
        let pm = PathManager::from_root(root);
        assert_eq!(pm.list_subjects(), vec!["2".to_string(), "10".to_string()]);
    }
}
