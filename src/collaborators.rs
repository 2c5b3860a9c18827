//! External collaborator interfaces: capability traits injected at
//! [`crate::runner::SimulationRunner`] construction rather than looked up
//! ambiently, each with a built-in default fallback.
//!
//! A collaborator that shells out to an external tool is a thin
//! `std::process::Command` wrapper keyed by executable name, with a
//! structured error on non-zero exit.

use crate::error::{TiError, TiResult};
use crate::postprocess::mesh::Mesh;
use crate::session::SessionDescription;
use std::path::Path;
use std::process::Command;

/// Runs the field solver for one assembled session. Implementations own
/// process isolation — the built-in fallback invokes an external
/// executable, one OS process per solve.
pub trait Solver: Send + Sync {
    fn run(&self, session: &SessionDescription) -> TiResult<()>;
}

/// Splits a combined field mesh into grey/white matter meshes.
pub trait FieldExtractor: Send + Sync {
    fn extract(&self, mesh: &Mesh, gm_out: &Path, wm_out: &Path) -> TiResult<()>;
}

/// Converts mesh-space fields into MNI + subject-space NIfTI volumes.
pub trait MeshToNiftiConverter: Send + Sync {
    fn convert(&self, mesh_dir: &Path, out_dir: &Path) -> TiResult<()>;
}

/// Registers a subject's T1 into MNI space.
pub trait T1ToMniConverter: Send + Sync {
    fn convert(&self, t1_path: &Path, m2m_dir: &Path, subject_id: &str) -> TiResult<()>;
}

/// Renders a montage preview image. Non-fatal on failure.
pub trait MontageVisualizer: Send + Sync {
    fn visualize(&self, montage_name: &str, electrode_labels: &[(String, String)], out_dir: &Path) -> TiResult<()>;
}

/// Maps flex-search optimized electrode positions onto the nearest
/// labels in an EEG cap. Implementations write the mapping JSON
/// (`mapped_labels`/`mapped_positions`) to `output_path` and return the
/// mapped labels in the same order as the optimized positions.
pub trait LabelMapper: Send + Sync {
    fn map(&self, electrode_positions: &Path, eeg_cap: &Path, output_path: &Path) -> TiResult<Vec<String>>;
}

/// Shells out to a named external executable using `--flag value` pairs,
/// failing with a structured error on non-zero exit.
fn run_external(program: &str, args: &[(&str, String)]) -> TiResult<()> {
    let mut command = Command::new(program);
    for (flag, value) in args {
        command.arg(flag).arg(value);
    }
    let output = command
        .output()
        .map_err(|e| TiError::Solver(format!("failed to launch {program}: {e}")))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TiError::Solver(format!("{program} exited with failure: {stderr}")));
    }
    Ok(())
}

pub struct ExternalSolver {
    pub executable: String,
}

impl Solver for ExternalSolver {
    fn run(&self, session: &SessionDescription) -> TiResult<()> {
        run_external(
            &self.executable,
            &[
                ("--subject", session.subject_id.clone()),
                ("--output-dir", session.output_dir.display().to_string()),
            ],
        )
    }
}

/// Crops the combined field mesh directly: tag `2` is grey matter, tag `1`
/// is white matter. Documented as a convention, not a guarantee — it may
/// not match every head model's tissue tag numbering. Only used when no
/// external extractor is injected.
pub struct FallbackFieldExtractor;

impl FieldExtractor for FallbackFieldExtractor {
    fn extract(&self, mesh: &Mesh, gm_out: &Path, wm_out: &Path) -> TiResult<()> {
        const GREY_MATTER_TAG: i32 = 2;
        const WHITE_MATTER_TAG: i32 = 1;
        mesh.crop_mesh(&[GREY_MATTER_TAG]).write_msh(gm_out)?;
        mesh.crop_mesh(&[WHITE_MATTER_TAG]).write_msh(wm_out)?;
        Ok(())
    }
}

pub struct ExternalMeshToNiftiConverter {
    pub script: String,
}

impl MeshToNiftiConverter for ExternalMeshToNiftiConverter {
    fn convert(&self, mesh_dir: &Path, out_dir: &Path) -> TiResult<()> {
        run_external(
            &self.script,
            &[
                ("--mesh-dir", mesh_dir.display().to_string()),
                ("--out-dir", out_dir.display().to_string()),
            ],
        )
    }
}

/// Fallback NIfTI conversion: skips any mesh whose name contains
/// "normal" (surface-normal overlays have no volumetric meaning) and logs
/// a warning per mesh it cannot convert, rather than failing the run.
pub struct FallbackMeshToNiftiConverter;

impl MeshToNiftiConverter for FallbackMeshToNiftiConverter {
    fn convert(&self, mesh_dir: &Path, out_dir: &Path) -> TiResult<()> {
        std::fs::create_dir_all(out_dir).map_err(|e| TiError::io(out_dir, e))?;
        let Ok(entries) = std::fs::read_dir(mesh_dir) else {
            return Ok(());
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            if path.extension().map(|e| e != "msh").unwrap_or(true) {
                continue;
            }
            if stem.contains("normal") {
                tracing::debug!("skipping NIfTI conversion for surface-normal mesh {stem}");
                continue;
            }
            if let Err(e) = run_external(
                "subject2mni",
                &[
                    ("-i", path.display().to_string()),
                    ("-o", out_dir.join(format!("{stem}_MNI.nii.gz")).display().to_string()),
                ],
            ) {
                tracing::warn!("NIfTI conversion failed for {stem}: {e}");
            }
        }
        Ok(())
    }
}

pub struct ExternalT1ToMniConverter {
    pub executable: String,
}

impl T1ToMniConverter for ExternalT1ToMniConverter {
    fn convert(&self, t1_path: &Path, m2m_dir: &Path, subject_id: &str) -> TiResult<()> {
        run_external(
            &self.executable,
            &[
                ("-i", t1_path.display().to_string()),
                ("-m", m2m_dir.display().to_string()),
                ("-o", format!("T1_{subject_id}")),
            ],
        )
    }
}

pub struct FallbackT1ToMniConverter;

impl T1ToMniConverter for FallbackT1ToMniConverter {
    fn convert(&self, t1_path: &Path, m2m_dir: &Path, subject_id: &str) -> TiResult<()> {
        if !t1_path.exists() {
            return Ok(());
        }
        let target = m2m_dir.join(format!("T1_{subject_id}_MNI.nii.gz"));
        if target.exists() {
            return Ok(());
        }
        run_external(
            "subject2mni",
            &[
                ("-i", t1_path.display().to_string()),
                ("-m", m2m_dir.display().to_string()),
                ("-o", format!("T1_{subject_id}")),
            ],
        )
    }
}

pub struct ExternalMontageVisualizer {
    pub script: String,
}

impl MontageVisualizer for ExternalMontageVisualizer {
    fn visualize(&self, montage_name: &str, electrode_labels: &[(String, String)], out_dir: &Path) -> TiResult<()> {
        let labels = electrode_labels
            .iter()
            .map(|(a, b)| format!("{a}:{b}"))
            .collect::<Vec<_>>()
            .join(",");
        run_external(
            &self.script,
            &[
                ("--montage", montage_name.to_string()),
                ("--pairs", labels),
                ("--out-dir", out_dir.display().to_string()),
            ],
        )
    }
}

/// No-op visualizer used when no front-end preview is wired in; never
/// fails, since visualization is explicitly non-fatal.
pub struct NullMontageVisualizer;

impl MontageVisualizer for NullMontageVisualizer {
    fn visualize(&self, _montage_name: &str, _electrode_labels: &[(String, String)], _out_dir: &Path) -> TiResult<()> {
        Ok(())
    }
}

/// Shells out to a label-mapping script that writes its result to
/// `output_path` (the same mapping-file shape `MontageStore` reads back:
/// `mapped_labels`/`mapped_positions`), then reads it back for the caller.
pub struct ExternalLabelMapper {
    pub script: String,
}

impl LabelMapper for ExternalLabelMapper {
    fn map(&self, electrode_positions: &Path, eeg_cap: &Path, output_path: &Path) -> TiResult<Vec<String>> {
        run_external(
            &self.script,
            &[
                ("-i", electrode_positions.display().to_string()),
                ("-n", eeg_cap.display().to_string()),
                ("-o", output_path.display().to_string()),
            ],
        )?;
        let contents = std::fs::read_to_string(output_path).map_err(|e| TiError::io(output_path, e))?;
        let parsed: serde_json::Value =
            serde_json::from_str(&contents).map_err(|e| TiError::Config(e.to_string()))?;
        Ok(parsed
            .get("mapped_labels")
            .and_then(|v| v.as_array())
            .map(|labels| labels.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .unwrap_or_default())
    }
}

pub struct NullLabelMapper;

impl LabelMapper for NullLabelMapper {
    fn map(&self, _electrode_positions: &Path, _eeg_cap: &Path, _output_path: &Path) -> TiResult<Vec<String>> {
        Ok(Vec::new())
    }
}

/// Bundles the six collaborator implementations a runner needs, injected
/// at construction time rather than looked up through ambient state.
pub struct Collaborators {
    pub solver: Box<dyn Solver>,
    pub field_extractor: Box<dyn FieldExtractor>,
    pub mesh_to_nifti: Box<dyn MeshToNiftiConverter>,
    pub t1_to_mni: Box<dyn T1ToMniConverter>,
    pub visualizer: Box<dyn MontageVisualizer>,
    pub label_mapper: Box<dyn LabelMapper>,
}

impl Collaborators {
    /// A complete set of built-in fallbacks, suitable for environments
    /// with no external tool wired in yet.
    pub fn fallbacks(solver_executable: impl Into<String>) -> Self {
        Self {
            solver: Box::new(ExternalSolver {
                executable: solver_executable.into(),
            }),
            field_extractor: Box::new(FallbackFieldExtractor),
            mesh_to_nifti: Box::new(FallbackMeshToNiftiConverter),
            t1_to_mni: Box::new(FallbackT1ToMniConverter),
            visualizer: Box::new(NullMontageVisualizer),
            label_mapper: Box::new(NullLabelMapper),
        }
    }
}
