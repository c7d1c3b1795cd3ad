//! Configuration shared by the fetcher, backends, audit log and controller.
//!
//! Loaded from YAML; every field has a default so a partial file is fine:
//!
//! ```yaml
//! legacy_prefixes: [BEND, LGPS]
//! audit_dir: /var/log/lem
//! enabled_regions: [L2, L3]
//! matching_quads:
//!   L2: [Q11401, Q11501]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::data::device::{Region, RegionSet};
use crate::data::trim::{PrefixClassifier, TrimSource};
use crate::error::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrimConfig {
    /// Device-name prefixes driven through the legacy magnet service.
    pub legacy_prefixes: Vec<String>,
    /// Channel suffix of the per-device set point, e.g. `QUAD:LI11:201:BDES`.
    pub set_point_suffix: String,
    /// Directory receiving one audit CSV per trim.
    pub audit_dir: PathBuf,
    /// Pub/sub channel the reference profile is published on.
    pub profile_channel: String,
    /// Regions enabled at startup.
    pub enabled_regions: RegionSet,
    pub trim_source: TrimSource,
    /// Deviation tolerance in percent.
    pub tolerance_pct: f64,
    /// Regions reported as excluded in deviation summaries.
    pub excluded_regions: Vec<Region>,
    /// Matching-quad element labels per region (excluded from summaries).
    pub matching_quads: BTreeMap<Region, Vec<String>>,
    /// Upper bound for one backend `apply`; unbounded when absent.
    pub actuation_deadline_ms: Option<u64>,
}

impl Default for TrimConfig {
    fn default() -> Self {
        Self {
            legacy_prefixes: vec!["BEND".to_string()],
            set_point_suffix: "BDES".to_string(),
            audit_dir: PathBuf::from("lem_audit"),
            profile_channel: "LEM:SYS0:1:REF_PROFILE".to_string(),
            enabled_regions: [Region::L2, Region::L3].into_iter().collect(),
            trim_source: TrimSource::Extant,
            tolerance_pct: 2.0,
            excluded_regions: vec![Region::L0, Region::L1],
            matching_quads: BTreeMap::new(),
            actuation_deadline_ms: None,
        }
    }
}

impl TrimConfig {
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&text)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn classifier(&self) -> PrefixClassifier {
        PrefixClassifier::new(self.legacy_prefixes.iter().cloned())
    }

    pub fn actuation_deadline(&self) -> Option<Duration> {
        self.actuation_deadline_ms.map(Duration::from_millis)
    }

    /// Whether a device is left out of deviation statistics.
    pub fn is_excluded(&self, region: Region, element: &str) -> bool {
        self.excluded_regions.contains(&region)
            || self
                .matching_quads
                .get(&region)
                .is_some_and(|quads| quads.iter().any(|q| q == element))
    }
}
