//! Post-simulation processing: TI/mTI field calculation, field extraction,
//! NIfTI conversion, and on-disk file organization.
//!
//! Structured as a struct that drives injected [`crate::collaborators`]
//! traits rather than hardcoded subprocess calls, so the numeric core
//! stays testable without any external tool installed.

pub mod mesh;

use crate::collaborators::Collaborators;
use crate::config::ConductivityType;
use crate::error::{TiError, TiResult};
use crate::kernel::{field_magnitude, mti_vectors, ti_vectors};
use mesh::Mesh;
use ndarray::Array2;
use std::path::{Path, PathBuf};

/// Physical tags kept when cropping a solver mesh down to the head
/// volume + its outer surface (`1..99` volumes, `1001..1099` surfaces).
fn tags_keep() -> Vec<i32> {
    (1..100).chain(1001..1100).collect()
}

/// The fixed per-montage output directory layout.
pub struct DirectorySchema {
    pub hf_mesh_dir: PathBuf,
    pub hf_nifti_dir: PathBuf,
    pub hf_analysis_dir: PathBuf,
    pub ti_mesh_dir: PathBuf,
    pub ti_nifti_dir: PathBuf,
    pub ti_surface_overlays_dir: PathBuf,
    pub ti_montage_imgs_dir: PathBuf,
    pub mti_mesh_dir: Option<PathBuf>,
    pub mti_nifti_dir: Option<PathBuf>,
    pub mti_montage_imgs_dir: Option<PathBuf>,
    pub documentation_dir: PathBuf,
}

impl DirectorySchema {
    pub fn build(montage_dir: &Path, mode: crate::config::SimulationMode) -> TiResult<Self> {
        let hf_mesh_dir = montage_dir.join("high_Frequency").join("mesh");
        let hf_nifti_dir = montage_dir.join("high_Frequency").join("niftis");
        let hf_analysis_dir = montage_dir.join("high_Frequency").join("analysis");
        let ti_mesh_dir = montage_dir.join("TI").join("mesh");
        let ti_nifti_dir = montage_dir.join("TI").join("niftis");
        let ti_surface_overlays_dir = montage_dir.join("TI").join("surface_overlays");
        let ti_montage_imgs_dir = montage_dir.join("TI").join("montage_imgs");
        let documentation_dir = montage_dir.join("documentation");

        let (mti_mesh_dir, mti_nifti_dir, mti_montage_imgs_dir) = match mode {
            crate::config::SimulationMode::Mti => (
                Some(montage_dir.join("mTI").join("mesh")),
                Some(montage_dir.join("mTI").join("niftis")),
                Some(montage_dir.join("mTI").join("montage_imgs")),
            ),
            crate::config::SimulationMode::Ti => (None, None, None),
        };

        for dir in [
            &hf_mesh_dir,
            &hf_nifti_dir,
            &hf_analysis_dir,
            &ti_mesh_dir,
            &ti_nifti_dir,
            &ti_surface_overlays_dir,
            &ti_montage_imgs_dir,
            &documentation_dir,
        ]
        .into_iter()
        .chain(mti_mesh_dir.iter())
        .chain(mti_nifti_dir.iter())
        .chain(mti_montage_imgs_dir.iter())
        {
            std::fs::create_dir_all(dir).map_err(|e| TiError::io(dir, e))?;
        }

        Ok(Self {
            hf_mesh_dir,
            hf_nifti_dir,
            hf_analysis_dir,
            ti_mesh_dir,
            ti_nifti_dir,
            ti_surface_overlays_dir,
            ti_montage_imgs_dir,
            mti_mesh_dir,
            mti_nifti_dir,
            mti_montage_imgs_dir,
            documentation_dir,
        })
    }
}

pub struct PostProcessor<'a> {
    pub subject_id: String,
    pub conductivity_type: ConductivityType,
    pub m2m_dir: PathBuf,
    collaborators: &'a Collaborators,
}

impl<'a> PostProcessor<'a> {
    pub fn new(subject_id: impl Into<String>, conductivity_type: ConductivityType, m2m_dir: PathBuf, collaborators: &'a Collaborators) -> Self {
        Self {
            subject_id: subject_id.into(),
            conductivity_type,
            m2m_dir,
            collaborators,
        }
    }

    fn hf_mesh_path(&self, hf_dir: &Path, pair_index: usize) -> PathBuf {
        hf_dir.join(format!(
            "{}_TDCS_{}_{}.msh",
            self.subject_id,
            pair_index,
            self.conductivity_type.as_str()
        ))
    }

    /// 2-pair TI pipeline.
    pub fn process_ti_results(&self, hf_dir: &Path, schema: &DirectorySchema, montage_name: &str) -> TiResult<PathBuf> {
        let m1_path = self.hf_mesh_path(hf_dir, 1);
        let m2_path = self.hf_mesh_path(hf_dir, 2);
        let m1 = Mesh::read_msh(&m1_path)?;
        let m2 = Mesh::read_msh(&m2_path)?;
        let m1 = m1.crop_mesh(&tags_keep());
        let m2 = m2.crop_mesh(&tags_keep());

        let e1 = field(&m1, "E")?;
        let e2 = field(&m2, "E")?;
        let ti = ti_vectors(&e1, &e2)?;
        let ti_max = field_magnitude(&ti);

        let mut out_mesh = m1.clone();
        out_mesh.element_fields.clear();
        out_mesh.add_element_field("TI_max", column_vector(&ti_max));
        let ti_path = schema.ti_mesh_dir.join(format!("{montage_name}_TI.msh"));
        out_mesh.write_msh(&ti_path)?;
        out_mesh.write_opt(&ti_path.with_extension("msh.opt"), &[1002, 1006], &["TI_max"])?;

        self.process_ti_normal(hf_dir, &schema.ti_surface_overlays_dir, montage_name)?;

        self.extract_fields(&out_mesh, &schema.hf_analysis_dir, montage_name)?;
        if let Err(e) = self.collaborators.mesh_to_nifti.convert(&schema.ti_mesh_dir, &schema.ti_nifti_dir) {
            tracing::warn!("NIfTI conversion failed for {montage_name}: {e}");
        }

        self.organize_ti_files(hf_dir, schema)?;
        self.convert_t1_to_mni()?;

        Ok(ti_path)
    }

    /// Surface-normal TI overlay. Skipped (debug-logged) when no central
    /// surface overlays exist for either pair.
    fn process_ti_normal(&self, hf_dir: &Path, surface_overlays_dir: &Path, montage_name: &str) -> TiResult<()> {
        let overlays_dir = hf_dir.join("subject_overlays");
        let c1 = overlays_dir.join(format!("{}_TDCS_1_{}_central.msh", self.subject_id, self.conductivity_type.as_str()));
        let c2 = overlays_dir.join(format!("{}_TDCS_2_{}_central.msh", self.subject_id, self.conductivity_type.as_str()));
        if !c1.exists() || !c2.exists() {
            tracing::debug!("no surface overlays for {montage_name}; skipping TI_normal");
            return Ok(());
        }

        let m1 = Mesh::read_msh(&c1)?;
        let m2 = Mesh::read_msh(&c2)?;
        let e1 = field(&m1, "E")?;
        let e2 = field(&m2, "E")?;
        let normals = m1
            .node_fields
            .get("normals")
            .cloned()
            .unwrap_or_else(|| Array2::zeros((m1.node_ids.len(), 3)));

        let ti = ti_vectors(&e1, &e2)?;
        let projected = project_onto_normals(&ti, &normals);

        let mut out_mesh = m1.clone();
        out_mesh.node_fields.clear();
        out_mesh.add_node_field("TI_normal", projected);
        let out_path = surface_overlays_dir.join(format!("{montage_name}_normal.msh"));
        out_mesh.write_msh(&out_path)
    }

    fn extract_fields(&self, mesh: &Mesh, analysis_dir: &Path, base_name: &str) -> TiResult<()> {
        let gm = analysis_dir.join(format!("grey_{base_name}.msh"));
        let wm = analysis_dir.join(format!("white_{base_name}.msh"));
        self.collaborators.field_extractor.extract(mesh, &gm, &wm)
    }

    fn convert_t1_to_mni(&self) -> TiResult<()> {
        let t1 = self.m2m_dir.join("T1.nii.gz");
        if let Err(e) = self.collaborators.t1_to_mni.convert(&t1, &self.m2m_dir, &self.subject_id) {
            tracing::warn!("T1->MNI conversion failed: {e}");
        }
        Ok(())
    }

    /// 4-pair mTI pipeline.
    pub fn process_mti_results(&self, hf_dir: &Path, schema: &DirectorySchema, montage_name: &str) -> TiResult<PathBuf> {
        let mti_mesh_dir = schema
            .mti_mesh_dir
            .as_ref()
            .ok_or_else(|| TiError::Postprocess("mTI directory schema missing mTI dirs".into()))?;
        let mti_nifti_dir = schema
            .mti_nifti_dir
            .as_ref()
            .ok_or_else(|| TiError::Postprocess("mTI directory schema missing mTI dirs".into()))?;

        let meshes: Vec<Mesh> = (1..=4)
            .map(|i| {
                let path = self.hf_mesh_path(hf_dir, i);
                Mesh::read_msh(&path).map(|m| m.crop_mesh(&tags_keep()))
            })
            .collect::<TiResult<Vec<_>>>()?;

        let e1 = field(&meshes[0], "E")?;
        let e2 = field(&meshes[1], "E")?;
        let e3 = field(&meshes[2], "E")?;
        let e4 = field(&meshes[3], "E")?;

        let ti_ab = ti_vectors(&e1, &e2)?;
        let ti_cd = ti_vectors(&e3, &e4)?;

        let mut ab_mesh = meshes[0].clone();
        ab_mesh.element_fields.clear();
        ab_mesh.add_element_field("TI_vectors", ti_ab.clone());
        ab_mesh.write_msh(&mti_mesh_dir.join(format!("{montage_name}_TI_AB.msh")))?;

        let mut cd_mesh = meshes[2].clone();
        cd_mesh.element_fields.clear();
        cd_mesh.add_element_field("TI_vectors", ti_cd.clone());
        cd_mesh.write_msh(&mti_mesh_dir.join(format!("{montage_name}_TI_CD.msh")))?;

        let mti_field = mti_vectors(&e1, &e2, &e3, &e4)?;
        let mti_max = field_magnitude(&mti_field);

        let mut out_mesh = meshes[0].clone();
        out_mesh.element_fields.clear();
        out_mesh.add_element_field("TI_Max", column_vector(&mti_max));
        let mti_path = mti_mesh_dir.join(format!("{montage_name}_mTI.msh"));
        out_mesh.write_msh(&mti_path)?;
        out_mesh.write_opt(&mti_path.with_extension("msh.opt"), &[1002, 1006], &["TI_Max"])?;

        self.extract_fields(&out_mesh, &schema.hf_analysis_dir, montage_name)?;
        self.extract_fields(&ab_mesh, &schema.hf_analysis_dir, &format!("{montage_name}_AB"))?;
        self.extract_fields(&cd_mesh, &schema.hf_analysis_dir, &format!("{montage_name}_CD"))?;

        if let Err(e) = self.collaborators.mesh_to_nifti.convert(mti_mesh_dir, mti_nifti_dir) {
            tracing::warn!("NIfTI conversion failed for {montage_name}: {e}");
        }

        self.organize_mti_files(hf_dir, schema)?;
        self.convert_t1_to_mni()?;

        Ok(mti_path)
    }

    /// Relocates the raw solver output into the canonical layout.
    /// Idempotent: missing sources are skipped, emptied directories are
    /// removed, nothing here raises on a partially-relocated retry.
    pub fn organize_ti_files(&self, hf_dir: &Path, schema: &DirectorySchema) -> TiResult<()> {
        for i in [1, 2] {
            for ext in ["geo", "msh", "msh.opt"] {
                safe_move(
                    &hf_dir.join(format!("{}_TDCS_{}_{}.{ext}", self.subject_id, i, self.conductivity_type.as_str())),
                    &schema.hf_mesh_dir,
                );
            }
        }
        relocate_dir_contents(&hf_dir.join("subject_volumes"), &schema.hf_nifti_dir);
        relocate_dir_contents(&hf_dir.join("subject_overlays"), &schema.ti_surface_overlays_dir);
        safe_move(&hf_dir.join("fields_summary.txt"), &schema.hf_analysis_dir);
        for entry in glob_prefix(hf_dir, "simnibs_simulation_") {
            safe_move(&entry, &schema.documentation_dir);
        }
        Ok(())
    }

    fn organize_mti_files(&self, hf_dir: &Path, schema: &DirectorySchema) -> TiResult<()> {
        let letters = [(1, 'A'), (2, 'B'), (3, 'C'), (4, 'D')];
        for (num, letter) in letters {
            for ext in ["geo", "msh", "msh.opt"] {
                let src = hf_dir.join(format!("{}_TDCS_{}_{}.{ext}", self.subject_id, num, self.conductivity_type.as_str()));
                let dest_name = format!("{}_TDCS_{}_{}.{ext}", self.subject_id, letter, self.conductivity_type.as_str());
                if src.exists() {
                    let _ = std::fs::rename(&src, hf_dir.join(&dest_name));
                }
                safe_move(&hf_dir.join(&dest_name), &schema.hf_mesh_dir);
            }
        }
        let volumes = hf_dir.join("subject_volumes");
        if volumes.exists() {
            let _ = std::fs::remove_dir_all(&volumes);
        }
        safe_move(&hf_dir.join("fields_summary.txt"), &schema.hf_analysis_dir);
        for entry in glob_prefix(hf_dir, "simnibs_simulation_") {
            safe_move(&entry, &schema.documentation_dir);
        }
        Ok(())
    }
}

fn field(mesh: &Mesh, name: &str) -> TiResult<Array2<f64>> {
    mesh.element_fields
        .get(name)
        .cloned()
        .ok_or_else(|| TiError::Postprocess(format!("mesh is missing field {name:?}")))
}

fn column_vector(values: &ndarray::Array1<f64>) -> Array2<f64> {
    Array2::from_shape_vec((values.len(), 1), values.to_vec()).expect("shape matches length")
}

fn project_onto_normals(vectors: &Array2<f64>, normals: &Array2<f64>) -> Array2<f64> {
    let n = vectors.nrows().min(normals.nrows());
    let mut out = Array2::<f64>::zeros((n, 1));
    for i in 0..n {
        let dot: f64 = (0..3).map(|c| vectors[[i, c]] * normals[[i, c]]).sum();
        out[[i, 0]] = dot;
    }
    out
}

/// Moves `src` into `dest_dir` if it exists; silently no-ops otherwise and
/// logs failures instead of raising.
fn safe_move(src: &Path, dest_dir: &Path) {
    if !src.exists() {
        return;
    }
    let Some(name) = src.file_name() else { return };
    if let Err(e) = std::fs::create_dir_all(dest_dir) {
        tracing::warn!("could not create {dest_dir:?}: {e}");
        return;
    }
    if let Err(e) = std::fs::rename(src, dest_dir.join(name)) {
        tracing::warn!("could not move {src:?} to {dest_dir:?}: {e}");
    }
}

fn relocate_dir_contents(src_dir: &Path, dest_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(src_dir) else {
        return;
    };
    let entries: Vec<_> = entries.filter_map(|e| e.ok()).collect();
    for entry in &entries {
        safe_move(&entry.path(), dest_dir);
    }
    safe_rmdir(src_dir);
}

/// Removes a directory only if it's now empty; swallows errors.
fn safe_rmdir(dir: &Path) {
    if let Ok(mut entries) = std::fs::read_dir(dir) {
        if entries.next().is_none() {
            let _ = std::fs::remove_dir(dir);
        }
    }
}

fn glob_prefix(dir: &Path, prefix: &str) -> Vec<PathBuf> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };
    entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(prefix))
                .unwrap_or(false)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::Collaborators;
    use tempfile::tempdir;

    #[test]
    fn directory_schema_creates_ti_tree() {
        let dir = tempdir().unwrap();
        let schema = DirectorySchema::build(dir.path(), crate::config::SimulationMode::Ti).unwrap();
        assert!(schema.ti_mesh_dir.exists());
        assert!(schema.hf_analysis_dir.exists());
        assert!(schema.mti_mesh_dir.is_none());
    }

    #[test]
    fn directory_schema_creates_mti_tree() {
        let dir = tempdir().unwrap();
        let schema = DirectorySchema::build(dir.path(), crate::config::SimulationMode::Mti).unwrap();
        assert!(schema.mti_mesh_dir.as_ref().unwrap().exists());
    }

    #[test]
    fn safe_move_tolerates_missing_source() {
        let dir = tempdir().unwrap();
        safe_move(&dir.path().join("nope.txt"), &dir.path().join("dest"));
    }

    #[test]
    fn postprocessor_construction() {
        let collaborators = Collaborators::fallbacks("solver");
        let _pp = PostProcessor::new("101", ConductivityType::Scalar, PathBuf::from("/m2m"), &collaborators);
    }
}
