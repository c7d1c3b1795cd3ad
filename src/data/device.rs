//! Device records, regions and the immutable dataset snapshot.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrimError};

/// Linac region. The declaration order is the beamline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Region {
    L0,
    L1,
    L2,
    L3,
}

impl Region {
    pub const ALL: [Region; 4] = [Region::L0, Region::L1, Region::L2, Region::L3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Region::L0 => "L0",
            Region::L1 => "L1",
            Region::L2 => "L2",
            Region::L3 => "L3",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = TrimError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "L0" => Ok(Region::L0),
            "L1" => Ok(Region::L1),
            "L2" => Ok(Region::L2),
            "L3" => Ok(Region::L3),
            other => Err(TrimError::unavailable(format!("unknown region '{other}'"))),
        }
    }
}

/// Regions the operator has enabled for trimming.
pub type RegionSet = BTreeSet<Region>;

/// Commanded set points keyed by device name.
///
/// Keyed rather than positional so that comparisons and undo restores never
/// depend on the ordering of a particular snapshot.
pub type SetPoints = BTreeMap<String, f64>;

/// One controllable magnet as delivered by the energy-matching service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub device_name: String,
    pub region: Region,
    /// Lattice element label (display only).
    pub element: String,
    pub reference_energy: f64,
    pub actual_energy: f64,
    pub energy_error: f64,
    pub design_set_point: f64,
    pub extant_set_point: f64,
    pub commanded_set_point: f64,
    pub s_position: f64,
    pub z_position: f64,
    pub length: f64,
}

/// Immutable, timestamped collection of device records.
#[derive(Debug, Clone)]
pub struct DatasetSnapshot {
    fetched_at: DateTime<Local>,
    devices: Vec<DeviceRecord>,
    index: HashMap<String, usize>,
}

impl DatasetSnapshot {
    /// Build a snapshot, rejecting duplicate device names.
    pub fn from_records(devices: Vec<DeviceRecord>, fetched_at: DateTime<Local>) -> Result<Self> {
        let mut index = HashMap::with_capacity(devices.len());
        for (i, dev) in devices.iter().enumerate() {
            if index.insert(dev.device_name.clone(), i).is_some() {
                return Err(TrimError::unavailable(format!(
                    "duplicate device name '{}' in dataset",
                    dev.device_name
                )));
            }
        }
        Ok(Self {
            fetched_at,
            devices,
            index,
        })
    }

    pub fn fetched_at(&self) -> DateTime<Local> {
        self.fetched_at
    }

    pub fn devices(&self) -> &[DeviceRecord] {
        &self.devices
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn get(&self, device_name: &str) -> Option<&DeviceRecord> {
        self.index.get(device_name).map(|&i| &self.devices[i])
    }

    /// Devices of the given regions, in snapshot order.
    pub fn in_regions<'a>(
        &'a self,
        regions: &'a RegionSet,
    ) -> impl Iterator<Item = &'a DeviceRecord> + 'a {
        self.devices.iter().filter(move |d| regions.contains(&d.region))
    }

    /// Commanded set point of every device, keyed by name.
    pub fn commanded(&self) -> SetPoints {
        self.devices
            .iter()
            .map(|d| (d.device_name.clone(), d.commanded_set_point))
            .collect()
    }
}

#[cfg(test)]
pub(crate) fn record(name: &str, region: Region, commanded: f64) -> DeviceRecord {
    DeviceRecord {
        device_name: name.to_string(),
        region,
        element: name.replace(':', "_"),
        reference_energy: 1.0,
        actual_energy: 1.0,
        energy_error: 0.0,
        design_set_point: commanded,
        extant_set_point: commanded,
        commanded_set_point: commanded,
        s_position: 0.0,
        z_position: 0.0,
        length: 1.0,
    }
}
