//! Flex-search record parsing and the flex-derived montage naming contract.

use super::{Electrode, ElectrodePair};
use crate::error::{TiError, TiResult};
use serde::Deserialize;

/// The flex-search run record shapes a run's `electrode_positions.json`
/// can take. Unknown `type` values are rejected.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type")]
pub enum FlexRecord {
    #[serde(rename = "flex_mapped")]
    Mapped {
        pairs: Vec<[String; 2]>,
        #[serde(default)]
        eeg_net: Option<String>,
    },
    #[serde(rename = "flex_optimized")]
    Optimized { electrode_positions: Vec<[f64; 3]> },
    #[serde(rename = "freehand_xyz")]
    FreehandXyz { electrode_positions: Vec<[f64; 3]> },
}

/// Parses a flex-search record into exactly two electrode pairs, built
/// from elements `(0,1)` and `(2,3)` of the pairs/positions list.
pub fn parse_flex_record(record: &FlexRecord) -> TiResult<(Vec<ElectrodePair>, bool, Option<String>)> {
    match record {
        FlexRecord::Mapped { pairs, eeg_net } => {
            if pairs.len() < 2 {
                return Err(TiError::Config(
                    "flex_mapped record needs at least 2 electrode pairs".into(),
                ));
            }
            let electrode_pairs = vec![
                (
                    Electrode::Label(pairs[0][0].clone()),
                    Electrode::Label(pairs[0][1].clone()),
                ),
                (
                    Electrode::Label(pairs[1][0].clone()),
                    Electrode::Label(pairs[1][1].clone()),
                ),
            ];
            Ok((electrode_pairs, false, eeg_net.clone()))
        }
        FlexRecord::Optimized { electrode_positions } | FlexRecord::FreehandXyz { electrode_positions } => {
            if electrode_positions.len() < 4 {
                return Err(TiError::Config(
                    "flex_optimized/freehand_xyz record needs at least 4 electrode positions".into(),
                ));
            }
            let ep = electrode_positions;
            let electrode_pairs = vec![
                (Electrode::Xyz(ep[0]), Electrode::Xyz(ep[1])),
                (Electrode::Xyz(ep[2]), Electrode::Xyz(ep[3])),
            ];
            Ok((electrode_pairs, true, None))
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlexElectrodeType {
    Mapped,
    Optimized,
}

impl FlexElectrodeType {
    fn suffix(self) -> &'static str {
        match self {
            FlexElectrodeType::Mapped => "mapped",
            FlexElectrodeType::Optimized => "optimized",
        }
    }
}

/// Derives a montage name from a flex-search run name and the requested
/// electrode type. Pure function of its two inputs.
///
/// The run-name prefix selects a hemisphere/region tag:
/// - `sphere_<rest>` → `spherical_<rest>`
/// - `subcortical_<rest>` → `subcortical_<rest>`
/// - `lh_<rest>` / `rh_<rest>` → `lh_<rest>` / `rh_<rest>`
/// - legacy `lh.<rest>` / `rh.<rest>` → `lh_<rest>` / `rh_<rest>`
/// - anything else → `spherical_<run_name>` (unstripped fallback)
///
/// The result always starts with `flex_`.
pub fn derive_flex_name(run_name: &str, electrode_type: FlexElectrodeType) -> TiResult<String> {
    let (hemisphere, remainder) = if let Some(rest) = run_name.strip_prefix("sphere_") {
        ("spherical", rest.to_string())
    } else if let Some(rest) = run_name.strip_prefix("subcortical_") {
        ("subcortical", rest.to_string())
    } else if let Some(rest) = run_name.strip_prefix("lh_") {
        ("lh", rest.to_string())
    } else if let Some(rest) = run_name.strip_prefix("rh_") {
        ("rh", rest.to_string())
    } else if let Some(rest) = run_name.strip_prefix("lh.") {
        ("lh", rest.to_string())
    } else if let Some(rest) = run_name.strip_prefix("rh.") {
        ("rh", rest.to_string())
    } else {
        ("spherical", run_name.to_string())
    };

    if remainder.is_empty() {
        return Err(TiError::Config(format!(
            "flex run name {run_name:?} has no region/goal component after its prefix"
        )));
    }

    let name = format!("flex_{hemisphere}_{remainder}_{}", electrode_type.suffix());
    debug_assert!(name.starts_with("flex_"));
    Ok(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapped_atlas_name() {
        let name = derive_flex_name("lh_DK40_14_mean_maxTI", FlexElectrodeType::Mapped).unwrap();
        assert_eq!(name, "flex_lh_DK40_14_mean_maxTI_mapped");
    }

    #[test]
    fn spherical_optimized_name() {
        let name = derive_flex_name("sphere_x10y-5z20r5_mean_maxTI", FlexElectrodeType::Optimized).unwrap();
        assert_eq!(name, "flex_spherical_x10y-5z20r5_mean_maxTI_optimized");
    }

    #[test]
    fn unrecognized_prefix_falls_back_to_spherical_unstripped() {
        let name = derive_flex_name("custom_run_42", FlexElectrodeType::Mapped).unwrap();
        assert_eq!(name, "flex_spherical_custom_run_42_mapped");
    }

    #[test]
    fn names_always_start_with_flex() {
        for run in ["sphere_a", "subcortical_b", "lh_c", "rh_d", "lh.e", "rh.f", "g"] {
            let name = derive_flex_name(run, FlexElectrodeType::Optimized).unwrap();
            assert!(name.starts_with("flex_"));
        }
    }

    #[test]
    fn parses_mapped_pairs_from_first_two_entries() {
        let record = FlexRecord::Mapped {
            pairs: vec![
                ["E1".into(), "E2".into()],
                ["E3".into(), "E4".into()],
                ["E5".into(), "E6".into()],
            ],
            eeg_net: Some("GSN-HydroCel-185.csv".into()),
        };
        let (pairs, is_xyz, eeg_net) = parse_flex_record(&record).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(!is_xyz);
        assert_eq!(eeg_net.as_deref(), Some("GSN-HydroCel-185.csv"));
    }

    #[test]
    fn parses_optimized_positions_from_first_four_entries() {
        let record = FlexRecord::Optimized {
            electrode_positions: vec![
                [0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0],
                [0.0, 1.0, 0.0],
                [0.0, 0.0, 1.0],
                [9.0, 9.0, 9.0],
            ],
        };
        let (pairs, is_xyz, _) = parse_flex_record(&record).unwrap();
        assert_eq!(pairs.len(), 2);
        assert!(is_xyz);
        assert_eq!(pairs[0].0, Electrode::Xyz([0.0, 0.0, 0.0]));
        assert_eq!(pairs[1].1, Electrode::Xyz([0.0, 0.0, 1.0]));
    }
}
