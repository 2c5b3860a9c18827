//! Assembles a solver-ready session description for one montage.
//!
//! Resolves anisotropy/mesh/EEG-cap/DTI paths from the path manager, then
//! adds 2 (TI) or up to 4 (mTI) electrode pairs with currents converted
//! from milliamps to amps.

use crate::config::{ConductivityType, SimulationConfig};
use crate::error::{TiError, TiResult};
use crate::montage::{Electrode, Montage};
use crate::path::PathManager;
use std::path::PathBuf;

#[derive(Debug, Clone, PartialEq)]
pub struct ElectrodeGeometry {
    pub position: Electrode,
    pub shape: crate::config::ElectrodeShape,
    pub dimensions: [f64; 2],
    /// `[gel_thickness_mm, sponge_thickness_mm]`.
    pub thickness: [f64; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionPair {
    /// `[+current, -current]` in amperes.
    pub currents_amperes: [f64; 2],
    pub electrodes: [ElectrodeGeometry; 2],
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionDescription {
    pub subject_id: String,
    pub head_mesh_path: PathBuf,
    pub subpath: PathBuf,
    pub anisotropy_type: ConductivityType,
    pub output_dir: PathBuf,
    pub eeg_cap: Option<PathBuf>,
    pub dti_tensor_path: Option<PathBuf>,
    pub map_to_surf: bool,
    pub map_to_vol: bool,
    pub map_to_mni: bool,
    pub map_to_fsavg: bool,
    pub tissues_in_niftis: String,
    /// `(tissue_index, conductivity)` overrides from `TISSUE_COND_<i>`
    /// (1-indexed by tissue), applied uniformly to every pair's tdcslist.
    pub tissue_conductivity_overrides: Vec<(usize, f64)>,
    pub pairs: Vec<SessionPair>,
}

pub struct SessionBuilder<'a> {
    config: &'a SimulationConfig,
    paths: &'a PathManager,
}

impl<'a> SessionBuilder<'a> {
    pub fn new(config: &'a SimulationConfig, paths: &'a PathManager) -> Self {
        Self { config, paths }
    }

    pub fn build(&self, montage: &Montage, output_dir: &std::path::Path) -> TiResult<SessionDescription> {
        let subject = &self.config.subject_id;
        let m2m_dir = self.paths.m2m_dir(subject);

        let eeg_cap = if !montage.is_xyz {
            let net = montage.eeg_net.clone().unwrap_or_else(|| self.config.eeg_net.clone());
            Some(self.paths.eeg_positions_dir(subject).join(net))
        } else {
            None
        };

        let tensor_file = self.paths.dti_tensor_path(subject);
        let dti_tensor_path = tensor_file.exists().then_some(tensor_file);

        let mut description = SessionDescription {
            subject_id: subject.clone(),
            head_mesh_path: self.paths.head_mesh_path(subject),
            subpath: m2m_dir,
            anisotropy_type: self.config.conductivity_type,
            output_dir: output_dir.to_path_buf(),
            eeg_cap,
            dti_tensor_path,
            map_to_surf: self.config.map_to_surf,
            map_to_vol: self.config.map_to_vol,
            map_to_mni: self.config.map_to_mni,
            map_to_fsavg: self.config.map_to_fsavg,
            tissues_in_niftis: self.config.tissues_in_niftis.clone(),
            tissue_conductivity_overrides: tissue_conductivity_overrides(),
            pairs: Vec::new(),
        };

        match montage.simulation_mode()? {
            crate::config::SimulationMode::Ti => self.add_ti_pairs(&mut description, montage)?,
            crate::config::SimulationMode::Mti => self.add_mti_pairs(&mut description, montage)?,
        }

        Ok(description)
    }

    fn add_ti_pairs(&self, session: &mut SessionDescription, montage: &Montage) -> TiResult<()> {
        let intensities = self.config.intensities;
        let currents_ma = [intensities.pair1, intensities.pair2];

        for (pair_idx, current_ma) in currents_ma.iter().enumerate() {
            let (a, b) = montage
                .electrode_pairs
                .get(pair_idx)
                .ok_or_else(|| TiError::Config(format!("montage {:?} is missing pair {pair_idx}", montage.name)))?
                .clone();
            let current_a = current_ma / 1000.0;
            session.pairs.push(SessionPair {
                currents_amperes: [current_a, -current_a],
                electrodes: [self.electrode_geometry(a), self.electrode_geometry(b)],
            });
        }
        Ok(())
    }

    fn add_mti_pairs(&self, session: &mut SessionDescription, montage: &Montage) -> TiResult<()> {
        let intensities = self.config.intensities.as_array();
        let num_pairs = montage.electrode_pairs.len().min(4);

        for pair_idx in 0..num_pairs {
            let (a, b) = montage.electrode_pairs[pair_idx].clone();
            let current_a = intensities[pair_idx] / 1000.0;
            session.pairs.push(SessionPair {
                currents_amperes: [current_a, -current_a],
                electrodes: [self.electrode_geometry(a), self.electrode_geometry(b)],
            });
        }
        Ok(())
    }

    fn electrode_geometry(&self, position: Electrode) -> ElectrodeGeometry {
        let electrode = &self.config.electrode;
        ElectrodeGeometry {
            position,
            shape: electrode.shape,
            dimensions: electrode.dimensions,
            thickness: [electrode.gel_thickness_mm, electrode.sponge_thickness_mm],
        }
    }
}

/// Reads every set `TISSUE_COND_<i>` variable as a per-tissue conductivity
/// override (`i` 1-indexed into the head model's tissue list), applied to
/// every pair's tdcslist alike. Invalid values are silently ignored.
fn tissue_conductivity_overrides() -> Vec<(usize, f64)> {
    let mut overrides: Vec<(usize, f64)> = std::env::vars()
        .filter_map(|(key, value)| {
            let idx: usize = key.strip_prefix("TISSUE_COND_")?.parse().ok()?;
            let value: f64 = value.parse().ok()?;
            Some((idx, value))
        })
        .collect();
    overrides.sort_by_key(|(idx, _)| *idx);
    overrides
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::montage::Montage;

    fn montage_ti() -> Montage {
        Montage::new(
            "bipolar",
            vec![
                (Electrode::Label("E1".into()), Electrode::Label("E2".into())),
                (Electrode::Label("E3".into()), Electrode::Label("E4".into())),
            ],
        )
    }

    #[test]
    fn ti_session_has_two_pairs_with_symmetric_currents() {
        let mut config = SimulationConfig::default();
        config.subject_id = "101".into();
        config.intensities = crate::config::IntensityConfig::from_string("2.0,1.5").unwrap();
        let paths = PathManager::from_root("/data/project");
        let builder = SessionBuilder::new(&config, &paths);

        let session = builder.build(&montage_ti(), std::path::Path::new("/out")).unwrap();
        assert_eq!(session.pairs.len(), 2);
        assert_eq!(session.pairs[0].currents_amperes, [0.002, -0.002]);
        assert_eq!(session.pairs[1].currents_amperes, [0.0015, -0.0015]);
        assert!(session.eeg_cap.is_some());
    }

    #[test]
    fn xyz_montage_has_no_eeg_cap() {
        let mut config = SimulationConfig::default();
        config.subject_id = "101".into();
        let paths = PathManager::from_root("/data/project");
        let builder = SessionBuilder::new(&config, &paths);

        let montage = Montage {
            name: "freehand".into(),
            electrode_pairs: vec![
                (Electrode::Xyz([1.0, 2.0, 3.0]), Electrode::Xyz([4.0, 5.0, 6.0])),
                (Electrode::Xyz([7.0, 8.0, 9.0]), Electrode::Xyz([1.0, 1.0, 1.0])),
            ],
            is_xyz: true,
            eeg_net: None,
        };
        let session = builder.build(&montage, std::path::Path::new("/out")).unwrap();
        assert!(session.eeg_cap.is_none());
    }

    #[test]
    fn mti_session_uses_up_to_four_pairs_ignoring_excess() {
        let mut config = SimulationConfig::default();
        config.subject_id = "101".into();
        config.intensities = crate::config::IntensityConfig::from_string("2.0,1.5,1.0,0.5").unwrap();
        let paths = PathManager::from_root("/data/project");
        let builder = SessionBuilder::new(&config, &paths);

        let montage = Montage::new(
            "mti",
            vec![
                (Electrode::Label("E1".into()), Electrode::Label("E2".into())),
                (Electrode::Label("E3".into()), Electrode::Label("E4".into())),
                (Electrode::Label("E5".into()), Electrode::Label("E6".into())),
                (Electrode::Label("E7".into()), Electrode::Label("E8".into())),
                (Electrode::Label("E9".into()), Electrode::Label("E10".into())),
            ],
        );
        let session = builder.build(&montage, std::path::Path::new("/out")).unwrap();
        assert_eq!(session.pairs.len(), 4);
        assert_eq!(session.pairs[3].currents_amperes, [0.0005, -0.0005]);
    }

    #[test]
    fn tissue_conductivity_overrides_apply_uniformly_across_pairs() {
        std::env::set_var("TISSUE_COND_1", "0.33");
        std::env::set_var("TISSUE_COND_3", "0.01");
        std::env::set_var("TISSUE_COND_9", "not-a-number");

        let mut config = SimulationConfig::default();
        config.subject_id = "101".into();
        config.intensities = crate::config::IntensityConfig::from_string("2.0,1.5").unwrap();
        let paths = PathManager::from_root("/data/project");
        let builder = SessionBuilder::new(&config, &paths);

        let session = builder.build(&montage_ti(), std::path::Path::new("/out")).unwrap();
        assert_eq!(session.tissue_conductivity_overrides, vec![(1, 0.33), (3, 0.01)]);

        std::env::remove_var("TISSUE_COND_1");
        std::env::remove_var("TISSUE_COND_3");
        std::env::remove_var("TISSUE_COND_9");
    }
}
