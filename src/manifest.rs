//! Completion manifest: one JSON file per run under `derivatives/temp/`,
//! written exactly once regardless of how many montages failed.

use crate::error::{TiError, TiResult};
use crate::runner::SimResult;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionManifest {
    pub session_id: Option<String>,
    pub subject_id: String,
    pub project_dir: PathBuf,
    pub simulation_dir: PathBuf,
    pub completed_simulations: Vec<SimResult>,
    pub failed_simulations: Vec<SimResult>,
    pub timestamp: i64,
    pub total_simulations: usize,
    pub success_count: usize,
    pub error_count: usize,
}

impl CompletionManifest {
    pub fn new(
        subject_id: impl Into<String>,
        project_dir: PathBuf,
        simulation_dir: PathBuf,
        completed: Vec<SimResult>,
        failed: Vec<SimResult>,
        timestamp: i64,
    ) -> Self {
        let success_count = completed.len();
        let error_count = failed.len();
        Self {
            session_id: Some(
                std::env::var("SIMULATION_SESSION_ID").unwrap_or_else(|_| uuid::Uuid::new_v4().to_string()),
            ),
            subject_id: subject_id.into(),
            project_dir,
            simulation_dir,
            total_simulations: success_count + error_count,
            completed_simulations: completed,
            failed_simulations: failed,
            timestamp,
            success_count,
            error_count,
        }
    }

    /// Writes the manifest under `derivatives/temp/`, named with the
    /// subject and a monotonically increasing run timestamp.
    pub fn write(&self, derivatives_dir: &std::path::Path) -> TiResult<PathBuf> {
        let temp_dir = derivatives_dir.join("temp");
        std::fs::create_dir_all(&temp_dir).map_err(|e| TiError::io(&temp_dir, e))?;
        let path = temp_dir.join(format!(
            "simulation_completion_{}_{}.json",
            self.subject_id, self.timestamp
        ));
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| TiError::io(&path, e))?;
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::SimStatus;
    use tempfile::tempdir;

    #[test]
    fn totals_cover_all_submitted_units() {
        let completed = vec![SimResult {
            montage_name: "a".into(),
            montage_type: "TI".into(),
            status: SimStatus::Completed,
            output_mesh: Some(PathBuf::from("/out/a_TI.msh")),
            error: None,
        }];
        let failed = vec![SimResult {
            montage_name: "b".into(),
            montage_type: "TI".into(),
            status: SimStatus::Failed,
            output_mesh: None,
            error: Some("boom".into()),
        }];
        let manifest = CompletionManifest::new("101", PathBuf::from("/proj"), PathBuf::from("/proj/sim"), completed, failed, 1000);
        assert_eq!(manifest.total_simulations, manifest.success_count + manifest.error_count);
        assert_eq!(manifest.total_simulations, 2);
    }

    #[test]
    fn write_creates_file_under_derivatives_temp() {
        let dir = tempdir().unwrap();
        let manifest = CompletionManifest::new("101", PathBuf::from("/proj"), PathBuf::from("/proj/sim"), Vec::new(), Vec::new(), 42);
        let path = manifest.write(dir.path()).unwrap();
        assert!(path.exists());
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "simulation_completion_101_42.json");
    }
}
