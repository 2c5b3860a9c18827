//! On-disk montage persistence: `code/ti-toolbox/config/montage_list.json`,
//! and derivation of montages from flex-search run output.

use super::flex::{derive_flex_name, parse_flex_record, FlexElectrodeType, FlexRecord};
use super::{Electrode, ElectrodePair, Montage};
use crate::collaborators::LabelMapper;
use crate::error::{TiError, TiResult};
use crate::path::PathManager;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;

const DEFAULT_NET: &str = "EEG10-10_UI_Jurak_2007.csv";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MontageKind {
    UniPolar,
    MultiPolar,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct MontageListFile {
    #[serde(default)]
    nets: HashMap<String, NetMontages>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct NetMontages {
    #[serde(default)]
    uni_polar_montages: HashMap<String, Vec<[Electrode; 2]>>,
    #[serde(default)]
    multi_polar_montages: HashMap<String, Vec<[Electrode; 2]>>,
}

impl NetMontages {
    fn montages_of(&self, kind: MontageKind) -> &HashMap<String, Vec<[Electrode; 2]>> {
        match kind {
            MontageKind::UniPolar => &self.uni_polar_montages,
            MontageKind::MultiPolar => &self.multi_polar_montages,
        }
    }

    fn montages_of_mut(&mut self, kind: MontageKind) -> &mut HashMap<String, Vec<[Electrode; 2]>> {
        match kind {
            MontageKind::UniPolar => &mut self.uni_polar_montages,
            MontageKind::MultiPolar => &mut self.multi_polar_montages,
        }
    }
}

/// On-disk shape of a flex-search run's `electrode_positions.json`: a flat
/// list of optimized `[x, y, z]` positions, with the search's channel-array
/// bookkeeping carried alongside but otherwise unused here.
#[derive(Debug, Default, Deserialize)]
struct FlexPositionsFile {
    #[serde(default)]
    optimized_positions: Vec<[f64; 3]>,
    #[serde(default)]
    #[allow(dead_code)]
    channel_array_indices: Option<Vec<i64>>,
}

/// On-disk shape of a flex run's cached label-mapping result
/// (`electrode_mapping_<net>.json`), produced by the label-mapping
/// collaborator and read back on subsequent derivations.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MappingFile {
    #[serde(default)]
    mapped_labels: Vec<String>,
    #[serde(default)]
    mapped_positions: Vec<[f64; 3]>,
    #[serde(default)]
    eeg_net: Option<String>,
}

pub struct MontageStore {
    paths: PathManager,
    world_writable: bool,
}

impl MontageStore {
    /// `world_writable` controls whether the store loosens permissions on
    /// `montage_list.json` after writing it; callers default to `false`.
    pub fn new(paths: PathManager, world_writable: bool) -> Self {
        Self {
            paths,
            world_writable,
        }
    }

    pub fn ensure_montage_file(&self) -> TiResult<()> {
        let dir = self.paths.montage_config_dir();
        let path = self.paths.montage_list_path();
        std::fs::create_dir_all(&dir).map_err(|e| TiError::io(&dir, e))?;

        if !path.exists() {
            let mut skeleton = MontageListFile::default();
            skeleton.nets.insert(DEFAULT_NET.to_string(), NetMontages::default());
            self.write_file(&path, &skeleton)?;
        }

        if self.world_writable {
            best_effort_chmod(&dir);
            best_effort_chmod(&path);
        }
        Ok(())
    }

    fn read_file(&self) -> TiResult<MontageListFile> {
        self.ensure_montage_file()?;
        let path = self.paths.montage_list_path();
        let contents = std::fs::read_to_string(&path).map_err(|e| TiError::io(&path, e))?;
        Ok(serde_json::from_str(&contents).unwrap_or_default())
    }

    fn write_file(&self, path: &std::path::Path, data: &MontageListFile) -> TiResult<()> {
        write_json_atomic(path, data)?;
        if self.world_writable {
            best_effort_chmod(path);
        }
        Ok(())
    }

    /// Loads a net's montages. A missing net yields empty structures, not
    /// an error.
    pub fn load(&self, net: &str) -> TiResult<(HashMap<String, Vec<ElectrodePair>>, HashMap<String, Vec<ElectrodePair>>)> {
        let file = self.read_file()?;
        let Some(entry) = file.nets.get(net) else {
            return Ok((HashMap::new(), HashMap::new()));
        };
        Ok((
            to_pair_map(&entry.uni_polar_montages),
            to_pair_map(&entry.multi_polar_montages),
        ))
    }

    pub fn upsert(
        &self,
        net: &str,
        montage_name: &str,
        kind: MontageKind,
        pairs: &[ElectrodePair],
    ) -> TiResult<()> {
        let mut file = self.read_file()?;
        let entry = file.nets.entry(net.to_string()).or_default();
        let stored: Vec<[Electrode; 2]> = pairs
            .iter()
            .map(|(a, b)| [a.clone(), b.clone()])
            .collect();
        entry.montages_of_mut(kind).insert(montage_name.to_string(), stored);
        self.write_file(&self.paths.montage_list_path(), &file)
    }

    pub fn list_names(&self, net: &str, kind: MontageKind) -> TiResult<Vec<String>> {
        let file = self.read_file()?;
        let Some(entry) = file.nets.get(net) else {
            return Ok(Vec::new());
        };
        let mut names: Vec<String> = entry.montages_of(kind).keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Parses a single flex-search record into a named montage.
    pub fn parse_flex(&self, name: &str, record: &FlexRecord) -> TiResult<Montage> {
        let (electrode_pairs, is_xyz, eeg_net) = parse_flex_record(record)?;
        Ok(Montage {
            name: name.to_string(),
            electrode_pairs,
            is_xyz,
            eeg_net,
        })
    }

    /// Reads a flex-search run's electrode positions and derives up to two
    /// montages (mapped / optimized), named per [`derive_flex_name`].
    ///
    /// At least one of `use_mapped`/`use_optimized` must be requested.
    /// `eeg_net` selects the target cap for the mapped variant and is
    /// required whenever `use_mapped` is set. Missing or unnameable
    /// representations are skipped, not fatal: a failed mapping attempt
    /// skips that montage with a warning rather than failing the whole
    /// call.
    pub fn derive_from_flex_search(
        &self,
        subject: &str,
        run_name: &str,
        use_mapped: bool,
        use_optimized: bool,
        eeg_net: Option<&str>,
        label_mapper: &dyn LabelMapper,
    ) -> TiResult<Vec<Montage>> {
        if !use_mapped && !use_optimized {
            return Err(TiError::Config(
                "derive_from_flex_search requires use_mapped and/or use_optimized".into(),
            ));
        }

        let positions_path = self.paths.flex_electrode_positions_path(subject, run_name);
        let contents = std::fs::read_to_string(&positions_path).map_err(|e| TiError::io(&positions_path, e))?;
        let file: FlexPositionsFile =
            serde_json::from_str(&contents).map_err(|e| TiError::Config(e.to_string()))?;

        let mut montages = Vec::new();

        if use_optimized {
            if file.optimized_positions.len() >= 4 {
                match derive_flex_name(run_name, FlexElectrodeType::Optimized) {
                    Ok(name) => {
                        let ep = &file.optimized_positions;
                        montages.push(Montage {
                            name,
                            electrode_pairs: vec![
                                (Electrode::Xyz(ep[0]), Electrode::Xyz(ep[1])),
                                (Electrode::Xyz(ep[2]), Electrode::Xyz(ep[3])),
                            ],
                            is_xyz: true,
                            eeg_net: Some("flex_mode".to_string()),
                        });
                    }
                    Err(e) => tracing::warn!("skipping optimized flex montage for {run_name}: {e}"),
                }
            } else {
                tracing::warn!("flex run {run_name} has fewer than 4 optimized positions; skipping");
            }
        }

        if use_mapped {
            match self.derive_mapped_montage(subject, run_name, eeg_net, label_mapper) {
                Ok(Some(montage)) => montages.push(montage),
                Ok(None) => {}
                Err(e) => tracing::warn!("skipping mapped flex montage for {run_name}: {e}"),
            }
        }

        for montage in &montages {
            if !montage.name.starts_with("flex_") {
                return Err(TiError::Config(format!(
                    "derived flex montage name {:?} does not start with flex_",
                    montage.name
                )));
            }
        }

        Ok(montages)
    }

    /// Derives the mapped-variant flex montage, triggering the label-mapping
    /// collaborator when no cached mapping file exists yet. Returns `None`
    /// (rather than erroring) for conditions the caller should treat as
    /// "skip this montage, warn, keep going": no `eeg_net` given, the target
    /// cap missing on disk, or fewer than 4 mapped labels once resolved.
    fn derive_mapped_montage(
        &self,
        subject: &str,
        run_name: &str,
        eeg_net: Option<&str>,
        label_mapper: &dyn LabelMapper,
    ) -> TiResult<Option<Montage>> {
        let Some(eeg_net) = eeg_net else {
            tracing::warn!("flex run {run_name} requested a mapped montage without an eeg_net");
            return Ok(None);
        };

        let cap_path = self.paths.eeg_positions_dir(subject).join(eeg_net);
        if !cap_path.exists() {
            tracing::warn!("EEG cap {} not found for flex run {run_name}", cap_path.display());
            return Ok(None);
        }

        let positions_path = self.paths.flex_electrode_positions_path(subject, run_name);
        let mapping_path = self.paths.flex_electrode_mapping_path(subject, run_name, eeg_net);

        let mapping = if mapping_path.exists() {
            let contents = std::fs::read_to_string(&mapping_path).map_err(|e| TiError::io(&mapping_path, e))?;
            serde_json::from_str::<MappingFile>(&contents).map_err(|e| TiError::Config(e.to_string()))?
        } else {
            let mapped_labels = label_mapper.map(&positions_path, &cap_path, &mapping_path)?;
            if mapping_path.exists() {
                let contents = std::fs::read_to_string(&mapping_path).map_err(|e| TiError::io(&mapping_path, e))?;
                serde_json::from_str::<MappingFile>(&contents).map_err(|e| TiError::Config(e.to_string()))?
            } else {
                let mapping = MappingFile {
                    mapped_labels,
                    mapped_positions: Vec::new(),
                    eeg_net: Some(eeg_net.to_string()),
                };
                write_json_atomic(&mapping_path, &mapping)?;
                mapping
            }
        };

        if mapping.mapped_labels.len() < 4 {
            tracing::warn!("flex run {run_name} has fewer than 4 mapped labels; skipping");
            return Ok(None);
        }

        match derive_flex_name(run_name, FlexElectrodeType::Mapped) {
            Ok(name) => Ok(Some(Montage {
                name,
                electrode_pairs: vec![
                    (
                        Electrode::Label(mapping.mapped_labels[0].clone()),
                        Electrode::Label(mapping.mapped_labels[1].clone()),
                    ),
                    (
                        Electrode::Label(mapping.mapped_labels[2].clone()),
                        Electrode::Label(mapping.mapped_labels[3].clone()),
                    ),
                ],
                is_xyz: false,
                eeg_net: Some(eeg_net.to_string()),
            })),
            Err(e) => {
                tracing::warn!("skipping mapped flex montage for {run_name}: {e}");
                Ok(None)
            }
        }
    }
}

/// Atomically writes `data` as pretty JSON: write to a `.tmp` sibling,
/// `fsync`, then rename over `path`.
fn write_json_atomic<T: Serialize>(path: &std::path::Path, data: &T) -> TiResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| TiError::io(parent, e))?;
    }
    let json = serde_json::to_string_pretty(data)?;
    let tmp_path = path.with_extension("json.tmp");
    {
        let mut tmp = std::fs::File::create(&tmp_path).map_err(|e| TiError::io(&tmp_path, e))?;
        tmp.write_all(json.as_bytes()).map_err(|e| TiError::io(&tmp_path, e))?;
        tmp.sync_all().map_err(|e| TiError::io(&tmp_path, e))?;
    }
    std::fs::rename(&tmp_path, path).map_err(|e| TiError::io(path, e))
}

fn to_pair_map(map: &HashMap<String, Vec<[Electrode; 2]>>) -> HashMap<String, Vec<ElectrodePair>> {
    map.iter()
        .map(|(name, pairs)| {
            let pairs = pairs
                .iter()
                .map(|[a, b]| (a.clone(), b.clone()))
                .collect();
            (name.clone(), pairs)
        })
        .collect()
}

fn best_effort_chmod(path: &std::path::Path) {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = std::fs::metadata(path) {
            let mut perms = meta.permissions();
            perms.set_mode(0o777);
            let _ = std::fs::set_permissions(path, perms);
        }
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store_in(root: &std::path::Path) -> MontageStore {
        MontageStore::new(PathManager::from_root(root), false)
    }

    #[test]
    fn ensure_creates_skeleton() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        store.ensure_montage_file().unwrap();
        assert!(dir.path().join("code/ti-toolbox/config/montage_list.json").exists());
    }

    #[test]
    fn load_missing_net_is_empty_not_error() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let (uni, multi) = store.load("nonexistent-net.csv").unwrap();
        assert!(uni.is_empty());
        assert!(multi.is_empty());
    }

    #[test]
    fn upsert_then_load_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let pairs = vec![(
            Electrode::Label("E1".into()),
            Electrode::Label("E2".into()),
        )];
        store
            .upsert("net.csv", "bipolar", MontageKind::UniPolar, &pairs)
            .unwrap();
        let (uni, _) = store.load("net.csv").unwrap();
        assert_eq!(uni.get("bipolar"), Some(&pairs));
    }

    #[test]
    fn derive_from_flex_search_requires_a_flag() {
        use crate::collaborators::NullLabelMapper;

        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let err = store
            .derive_from_flex_search("101", "lh_DK40_14_mean_maxTI", false, false, None, &NullLabelMapper)
            .unwrap_err();
        assert!(matches!(err, TiError::Config(_)));
    }

    #[test]
    fn derive_from_flex_search_reads_optimized_positions_at_top_level() {
        use crate::collaborators::NullLabelMapper;

        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let positions_path = PathManager::from_root(dir.path()).flex_electrode_positions_path("101", "run1");
        std::fs::create_dir_all(positions_path.parent().unwrap()).unwrap();
        std::fs::write(
            &positions_path,
            r#"{"optimized_positions":[[1.0,2.0,3.0],[4.0,5.0,6.0],[7.0,8.0,9.0],[10.0,11.0,12.0]],"channel_array_indices":[0,1,2,3]}"#,
        )
        .unwrap();

        let montages = store
            .derive_from_flex_search("101", "run1", false, true, None, &NullLabelMapper)
            .unwrap();
        assert_eq!(montages.len(), 1);
        assert!(montages[0].is_xyz);
        assert_eq!(montages[0].eeg_net.as_deref(), Some("flex_mode"));
        assert_eq!(montages[0].electrode_pairs[0].0, Electrode::Xyz([1.0, 2.0, 3.0]));
    }

    #[test]
    fn derive_from_flex_search_mapped_without_eeg_net_is_skipped_not_fatal() {
        use crate::collaborators::NullLabelMapper;

        let dir = tempdir().unwrap();
        let store = store_in(dir.path());
        let positions_path = PathManager::from_root(dir.path()).flex_electrode_positions_path("101", "run1");
        std::fs::create_dir_all(positions_path.parent().unwrap()).unwrap();
        std::fs::write(&positions_path, r#"{"optimized_positions":[]}"#).unwrap();

        let montages = store
            .derive_from_flex_search("101", "run1", true, false, None, &NullLabelMapper)
            .unwrap();
        assert!(montages.is_empty());
    }
}
