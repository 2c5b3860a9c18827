//! Montage definitions and the on-disk montage store.

mod flex;
mod store;

pub use flex::{derive_flex_name, parse_flex_record, FlexElectrodeType, FlexRecord};
pub use store::MontageStore;

use crate::config::SimulationMode;
use crate::error::TiResult;
use serde::{Deserialize, Serialize};

/// One electrode position: a named cap label, or an explicit xyz coordinate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Electrode {
    Label(String),
    Xyz([f64; 3]),
}

pub type ElectrodePair = (Electrode, Electrode);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Montage {
    pub name: String,
    pub electrode_pairs: Vec<ElectrodePair>,
    #[serde(default)]
    pub is_xyz: bool,
    #[serde(default)]
    pub eeg_net: Option<String>,
}

impl Montage {
    pub fn new(name: impl Into<String>, electrode_pairs: Vec<ElectrodePair>) -> Self {
        Self {
            name: name.into(),
            electrode_pairs,
            is_xyz: false,
            eeg_net: None,
        }
    }

    pub fn simulation_mode(&self) -> TiResult<SimulationMode> {
        SimulationMode::from_pair_count(self.electrode_pairs.len())
    }

    pub fn num_pairs(&self) -> usize {
        self.electrode_pairs.len()
    }

    /// `true` when every electrode in this montage is a named cap label
    /// (not an xyz coordinate) — used to decide whether a visualization
    /// collaborator has enough information to run.
    pub fn has_label_pairs(&self) -> bool {
        !self.is_xyz
            && self
                .electrode_pairs
                .iter()
                .all(|(a, b)| matches!(a, Electrode::Label(_)) && matches!(b, Electrode::Label(_)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_pair_count() {
        let ti = Montage::new(
            "m",
            vec![
                (Electrode::Label("E1".into()), Electrode::Label("E2".into())),
                (Electrode::Label("E3".into()), Electrode::Label("E4".into())),
            ],
        );
        assert_eq!(ti.simulation_mode().unwrap(), SimulationMode::Ti);
    }

    #[test]
    fn label_detection() {
        let xyz = Montage {
            name: "m".into(),
            electrode_pairs: vec![(Electrode::Xyz([0.0, 0.0, 0.0]), Electrode::Xyz([1.0, 1.0, 1.0]))],
            is_xyz: true,
            eeg_net: None,
        };
        assert!(!xyz.has_label_pairs());
    }
}
