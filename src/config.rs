//! Simulation configuration: conductivity, electrode geometry, intensities,
//! and parallel-execution tuning.
//!
//! Typed, `serde`-backed, with `Default` impls for every knob, loaded from
//! and saved back to a TOML file the same way a runtime settings tree
//! round-trips, just aimed at simulation parameters instead of service
//! configuration.

use crate::error::{TiError, TiResult};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConductivityType {
    Scalar,
    Vn,
    Dir,
    Mc,
}

impl Default for ConductivityType {
    fn default() -> Self {
        ConductivityType::Scalar
    }
}

impl ConductivityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConductivityType::Scalar => "scalar",
            ConductivityType::Vn => "vn",
            ConductivityType::Dir => "dir",
            ConductivityType::Mc => "mc",
        }
    }
}

/// Derived purely from a montage's pair count; never stored directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SimulationMode {
    Ti,
    Mti,
}

impl SimulationMode {
    pub fn from_pair_count(count: usize) -> TiResult<Self> {
        match count {
            2 => Ok(SimulationMode::Ti),
            n if n >= 4 => Ok(SimulationMode::Mti),
            n => Err(TiError::Config(format!(
                "montage has {n} electrode pairs; need 2 (TI) or at least 4 (mTI)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ElectrodeShape {
    Rect,
    Ellipse,
}

impl Default for ElectrodeShape {
    fn default() -> Self {
        ElectrodeShape::Ellipse
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectrodeConfig {
    pub shape: ElectrodeShape,
    pub dimensions: [f64; 2],
    pub gel_thickness_mm: f64,
    pub sponge_thickness_mm: f64,
}

impl Default for ElectrodeConfig {
    fn default() -> Self {
        Self {
            shape: ElectrodeShape::Ellipse,
            dimensions: [8.0, 8.0],
            gel_thickness_mm: 4.0,
            sponge_thickness_mm: 2.0,
        }
    }
}

/// Stimulation intensities in milliamps. Converted to amps only when a
/// [`crate::session::SessionBuilder`] assembles a solver-ready session.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct IntensityConfig {
    pub pair1: f64,
    pub pair2: f64,
    pub pair3: f64,
    pub pair4: f64,
}

impl Default for IntensityConfig {
    fn default() -> Self {
        Self {
            pair1: 1.0,
            pair2: 1.0,
            pair3: 1.0,
            pair4: 1.0,
        }
    }
}

impl IntensityConfig {
    /// Parses `"a"`, `"a,b"`, or `"a,b,c,d"` (milliamps).
    ///
    /// - 1 value: all four pairs equal.
    /// - 2 values: `pair1`/`pair2` set, `pair3`/`pair4` default to `1.0`.
    /// - 4 values: all pairs set explicitly.
    /// - any other count: [`TiError::Config`].
    pub fn from_string(s: &str) -> TiResult<Self> {
        let values = s
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|_| TiError::Config(format!("invalid intensity value: {part:?}")))
            })
            .collect::<TiResult<Vec<f64>>>()?;

        match values.as_slice() {
            [v] => Ok(Self {
                pair1: *v,
                pair2: *v,
                pair3: *v,
                pair4: *v,
            }),
            [p1, p2] => Ok(Self {
                pair1: *p1,
                pair2: *p2,
                pair3: 1.0,
                pair4: 1.0,
            }),
            [p1, p2, p3, p4] => Ok(Self {
                pair1: *p1,
                pair2: *p2,
                pair3: *p3,
                pair4: *p4,
            }),
            other => Err(TiError::Config(format!(
                "intensity string must have 1, 2, or 4 comma-separated values, got {}",
                other.len()
            ))),
        }
    }

    pub fn as_array(&self) -> [f64; 4] {
        [self.pair1, self.pair2, self.pair3, self.pair4]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub enabled: bool,
    pub max_workers: i64,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_workers: 0,
        }
    }
}

impl ParallelConfig {
    /// `max_workers <= 0` resolves to `min(4, max(1, cpu_count / 2))`.
    /// `cpu_count` falls back to `4` when it cannot be detected.
    pub fn effective_workers(&self) -> usize {
        if self.max_workers > 0 {
            return self.max_workers as usize;
        }
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cpu_count / 2).max(1).min(4)
    }

    /// Non-fatal heads-up for configs likely to exhaust memory. Only
    /// fires when parallel execution is actually enabled.
    pub fn memory_warning(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }
        if self.effective_workers() > 2 {
            Some(format!(
                "running {} parallel workers may use significant memory; consider lowering max_workers",
                self.effective_workers()
            ))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub subject_id: String,
    pub conductivity_type: ConductivityType,
    pub intensities: IntensityConfig,
    pub electrode: ElectrodeConfig,
    pub eeg_net: String,
    pub map_to_surf: bool,
    pub map_to_vol: bool,
    pub map_to_mni: bool,
    pub map_to_fsavg: bool,
    pub tissues_in_niftis: String,
    pub open_in_gmsh: bool,
    pub parallel: ParallelConfig,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            subject_id: String::new(),
            conductivity_type: ConductivityType::default(),
            intensities: IntensityConfig::default(),
            electrode: ElectrodeConfig::default(),
            eeg_net: "GSN-HydroCel-185.csv".into(),
            map_to_surf: true,
            map_to_vol: true,
            map_to_mni: true,
            map_to_fsavg: false,
            tissues_in_niftis: "all".into(),
            open_in_gmsh: false,
            parallel: ParallelConfig::default(),
        }
    }
}

impl SimulationConfig {
    /// Loads from a TOML file, writing out a default file if none exists —
    /// the same load-or-create pattern this codebase's settings loader uses.
    pub fn load(path: &std::path::Path) -> TiResult<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path).map_err(|e| TiError::io(path, e))?;
            toml::from_str(&contents).map_err(|e| TiError::Config(e.to_string()))
        } else {
            let default = Self::default();
            default.save(path)?;
            Ok(default)
        }
    }

    pub fn save(&self, path: &std::path::Path) -> TiResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| TiError::io(parent, e))?;
        }
        let contents = toml::to_string_pretty(self).map_err(|e| TiError::Config(e.to_string()))?;
        std::fs::write(path, contents).map_err(|e| TiError::io(path, e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_value_sets_all_pairs() {
        let intensities = IntensityConfig::from_string("2.0").unwrap();
        assert_eq!(intensities, IntensityConfig { pair1: 2.0, pair2: 2.0, pair3: 2.0, pair4: 2.0 });
    }

    #[test]
    fn double_value_defaults_trailing_pairs_to_one() {
        let intensities = IntensityConfig::from_string("2.0,1.5").unwrap();
        assert_eq!(intensities, IntensityConfig { pair1: 2.0, pair2: 1.5, pair3: 1.0, pair4: 1.0 });
    }

    #[test]
    fn quad_value_sets_each_pair() {
        let intensities = IntensityConfig::from_string("2.0,1.5,1.0,0.5").unwrap();
        assert_eq!(intensities, IntensityConfig { pair1: 2.0, pair2: 1.5, pair3: 1.0, pair4: 0.5 });
    }

    #[test]
    fn other_cardinalities_are_rejected() {
        assert!(IntensityConfig::from_string("1.0,2.0,3.0").is_err());
        assert!(IntensityConfig::from_string("").is_err());
    }

    #[test]
    fn worker_resolution_is_bounded() {
        let cfg = ParallelConfig { enabled: true, max_workers: 0 };
        let workers = cfg.effective_workers();
        assert!(workers >= 1 && workers <= 4);

        let explicit = ParallelConfig { enabled: true, max_workers: 9 };
        assert_eq!(explicit.effective_workers(), 9);
    }

    #[test]
    fn mode_dispatch_by_pair_count() {
        assert_eq!(SimulationMode::from_pair_count(2).unwrap(), SimulationMode::Ti);
        assert_eq!(SimulationMode::from_pair_count(4).unwrap(), SimulationMode::Mti);
        assert!(SimulationMode::from_pair_count(3).is_err());
    }
}
