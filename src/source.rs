//! Live data fetcher: pulls the energy-matching table and the commanded set
//! points, and turns them into a validated [`DatasetSnapshot`].

use std::collections::HashSet;

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::data::device::{DatasetSnapshot, DeviceRecord, Region};
use crate::error::{Result, TrimError};

/// Column-wise energy-matching table as served by the remote service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LemTable {
    pub device_name: Vec<String>,
    pub region: Vec<String>,
    pub element: Vec<String>,
    pub eref: Vec<f64>,
    pub eact: Vec<f64>,
    pub eerr: Vec<f64>,
    pub bdes_design: Vec<f64>,
    pub bdes_extant: Vec<f64>,
    pub s: Vec<f64>,
    pub z: Vec<f64>,
    pub length: Vec<f64>,
}

impl LemTable {
    /// Row count, or an error naming the first column whose length differs.
    pub fn row_count(&self) -> Result<usize> {
        let n = self.device_name.len();
        let lens = [
            ("region", self.region.len()),
            ("element", self.element.len()),
            ("eref", self.eref.len()),
            ("eact", self.eact.len()),
            ("eerr", self.eerr.len()),
            ("bdes_design", self.bdes_design.len()),
            ("bdes_extant", self.bdes_extant.len()),
            ("s", self.s.len()),
            ("z", self.z.len()),
            ("length", self.length.len()),
        ];
        for (column, len) in lens {
            if len != n {
                return Err(TrimError::unavailable(format!(
                    "column '{column}' has {len} rows, expected {n}"
                )));
            }
        }
        Ok(n)
    }
}

/// Remote energy-matching data channel.
pub trait LiveDataSource: Send {
    fn fetch_table(&mut self) -> Result<LemTable>;

    /// Live momentum per lattice element.
    fn fetch_live_momentum(&mut self) -> Result<Vec<f64>>;
}

/// Scalar process-variable channel access (get/put by channel name).
pub trait PvChannel: Send {
    fn get(&mut self, channel: &str) -> Result<f64>;
    fn put(&mut self, channel: &str, value: f64) -> Result<()>;
}

/// Anything that can produce a validated snapshot. The controller owns one.
pub trait SnapshotSource: Send {
    fn fetch(&mut self) -> Result<DatasetSnapshot>;
}

/// `"{device}:{suffix}"`
pub fn set_point_channel(device_name: &str, suffix: &str) -> String {
    format!("{device_name}:{suffix}")
}

pub struct Fetcher<S, C> {
    source: S,
    channel: C,
    suffix: String,
}

impl<S: LiveDataSource, C: PvChannel> Fetcher<S, C> {
    pub fn new(source: S, channel: C, set_point_suffix: impl Into<String>) -> Self {
        Self {
            source,
            channel,
            suffix: set_point_suffix.into(),
        }
    }

    /// Fetch and validate a fresh snapshot. No retries.
    pub fn fetch(&mut self) -> Result<DatasetSnapshot> {
        let table = self.source.fetch_table()?;
        let rows = table.row_count()?;

        let mut seen = HashSet::with_capacity(rows);
        let mut devices = Vec::with_capacity(rows);
        for i in 0..rows {
            let name = table.device_name[i].trim();
            // Markers and drifts carry no controllable device.
            if name.is_empty() {
                continue;
            }
            if !seen.insert(name.to_string()) {
                return Err(TrimError::unavailable(format!(
                    "duplicate device name '{name}' in table"
                )));
            }
            let region: Region = table.region[i].parse()?;
            let commanded = self
                .channel
                .get(&set_point_channel(name, &self.suffix))
                .map_err(|e| {
                    TrimError::unavailable(format!("cannot read set point of '{name}': {e}"))
                })?;
            devices.push(DeviceRecord {
                device_name: name.to_string(),
                region,
                element: table.element[i].clone(),
                reference_energy: table.eref[i],
                actual_energy: table.eact[i],
                energy_error: table.eerr[i],
                design_set_point: table.bdes_design[i],
                extant_set_point: table.bdes_extant[i],
                commanded_set_point: commanded,
                s_position: table.s[i],
                z_position: table.z[i],
                length: table.length[i],
            });
        }
        debug!(devices = devices.len(), skipped = rows - devices.len(), "fetched LEM table");
        DatasetSnapshot::from_records(devices, Local::now())
    }

    pub fn fetch_live_momentum(&mut self) -> Result<Vec<f64>> {
        self.source.fetch_live_momentum()
    }
}

impl<S: LiveDataSource, C: PvChannel> SnapshotSource for Fetcher<S, C> {
    fn fetch(&mut self) -> Result<DatasetSnapshot> {
        Fetcher::fetch(self)
    }
}
