//! In-memory beamline: one shared state behind every remote interface.
//!
//! `SimulatedBeamline` is cheap to clone; all clones see the same lattice, set
//! points and fault injection. The demo binary and the integration tests wire
//! a full controller against it.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::backends::MagnetService;
use crate::data::device::{DeviceRecord, Region};
use crate::error::{Result, TrimError};
use crate::source::{set_point_channel, LemTable, LiveDataSource, PvChannel};

#[derive(Debug, Default)]
struct SimState {
    /// Lattice rows in beamline order; markers have an empty device name.
    rows: Vec<DeviceRecord>,
    suffix: String,
    pvs: HashMap<String, f64>,
    failing: HashSet<String>,
    data_offline: bool,
    service_offline: bool,
    puts: usize,
    batches: usize,
}

#[derive(Debug, Clone)]
pub struct SimulatedBeamline {
    state: Arc<Mutex<SimState>>,
}

impl SimulatedBeamline {
    /// Seed set-point channels from each row's commanded value.
    pub fn new(rows: Vec<DeviceRecord>, set_point_suffix: &str) -> Self {
        let pvs = rows
            .iter()
            .filter(|r| !r.device_name.is_empty())
            .map(|r| {
                (
                    set_point_channel(&r.device_name, set_point_suffix),
                    r.commanded_set_point,
                )
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                rows,
                suffix: set_point_suffix.to_string(),
                pvs,
                ..SimState::default()
            })),
        }
    }

    /// A small four-region linac with quads, legacy bends and one marker.
    /// Every device sits slightly off its extant set point.
    pub fn demo(set_point_suffix: &str) -> Self {
        let layout: [(&str, Region, f64); 9] = [
            ("QUAD:IN20:361", Region::L0, 0.135),
            ("QUAD:LI21:201", Region::L1, 0.25),
            ("QUAD:LI21:271", Region::L1, 0.42),
            ("QUAD:LI24:201", Region::L2, 4.5),
            ("BEND:LI24:301", Region::L2, 1.2),
            ("", Region::L2, 0.0),
            ("QUAD:LI26:201", Region::L3, 13.75),
            ("BEND:LI28:301", Region::L3, 2.6),
            ("QUAD:LI30:201", Region::L3, 13.9),
        ];
        let rows = layout
            .iter()
            .enumerate()
            .map(|(i, (name, region, extant))| {
                let s = 10.0 + 120.0 * i as f64;
                let reference = 135.0 + 1500.0 * i as f64;
                DeviceRecord {
                    device_name: name.to_string(),
                    region: *region,
                    element: if name.is_empty() {
                        format!("MRK{i}")
                    } else {
                        name.replace(':', "")
                    },
                    reference_energy: reference,
                    actual_energy: reference * 1.004,
                    energy_error: reference * 0.004,
                    design_set_point: extant * 1.01,
                    extant_set_point: *extant,
                    commanded_set_point: extant * 0.97,
                    s_position: s,
                    z_position: s * 0.999,
                    length: 0.108,
                }
            })
            .collect();
        Self::new(rows, set_point_suffix)
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current set point of a device.
    pub fn set_point(&self, device_name: &str) -> Option<f64> {
        let st = self.lock();
        st.pvs
            .get(&set_point_channel(device_name, &st.suffix))
            .copied()
    }

    /// Device names in beamline order, markers excluded.
    pub fn device_names(&self) -> Vec<String> {
        self.lock()
            .rows
            .iter()
            .filter(|r| !r.device_name.is_empty())
            .map(|r| r.device_name.clone())
            .collect()
    }

    /// Make every write to this device fail. Reads still succeed.
    pub fn fail_device(&self, device_name: &str) {
        self.lock().failing.insert(device_name.to_string());
    }

    pub fn heal_device(&self, device_name: &str) {
        self.lock().failing.remove(device_name);
    }

    pub fn set_data_offline(&self, offline: bool) {
        self.lock().data_offline = offline;
    }

    /// Make the legacy magnet service reject whole batches.
    pub fn set_service_offline(&self, offline: bool) {
        self.lock().service_offline = offline;
    }

    /// Number of successful channel puts so far.
    pub fn put_count(&self) -> usize {
        self.lock().puts
    }

    /// Number of batches accepted by the magnet service so far.
    pub fn batch_count(&self) -> usize {
        self.lock().batches
    }

    /// Writes of any kind that reached the machine.
    pub fn write_count(&self) -> usize {
        let st = self.lock();
        st.puts + st.batches
    }
}

fn device_of<'a>(channel: &'a str, suffix: &str) -> &'a str {
    channel
        .strip_suffix(suffix)
        .and_then(|c| c.strip_suffix(':'))
        .unwrap_or(channel)
}

impl LiveDataSource for SimulatedBeamline {
    fn fetch_table(&mut self) -> Result<LemTable> {
        let st = self.lock();
        if st.data_offline {
            return Err(TrimError::unavailable("LEM service not responding"));
        }
        let mut t = LemTable::default();
        for r in &st.rows {
            t.device_name.push(r.device_name.clone());
            t.region.push(r.region.to_string());
            t.element.push(r.element.clone());
            t.eref.push(r.reference_energy);
            t.eact.push(r.actual_energy);
            t.eerr.push(r.energy_error);
            t.bdes_design.push(r.design_set_point);
            t.bdes_extant.push(r.extant_set_point);
            t.s.push(r.s_position);
            t.z.push(r.z_position);
            t.length.push(r.length);
        }
        Ok(t)
    }

    fn fetch_live_momentum(&mut self) -> Result<Vec<f64>> {
        let st = self.lock();
        if st.data_offline {
            return Err(TrimError::unavailable("LEM service not responding"));
        }
        Ok(st.rows.iter().map(|r| r.actual_energy).collect())
    }
}

impl PvChannel for SimulatedBeamline {
    fn get(&mut self, channel: &str) -> Result<f64> {
        self.lock()
            .pvs
            .get(channel)
            .copied()
            .ok_or_else(|| TrimError::unavailable(format!("{channel}: no such channel")))
    }

    fn put(&mut self, channel: &str, value: f64) -> Result<()> {
        let mut st = self.lock();
        if st.failing.contains(device_of(channel, &st.suffix)) {
            return Err(TrimError::unavailable(format!("{channel}: write timeout")));
        }
        match st.pvs.get_mut(channel) {
            Some(v) => *v = value,
            None => {
                return Err(TrimError::unavailable(format!("{channel}: no such channel")));
            }
        }
        st.puts += 1;
        Ok(())
    }
}

impl MagnetService for SimulatedBeamline {
    fn set_points(
        &mut self,
        devices: &[String],
        values: &[f64],
    ) -> Result<Vec<std::result::Result<(), String>>> {
        let mut st = self.lock();
        if st.service_offline {
            return Err(TrimError::unavailable("magnet service offline"));
        }
        if devices.len() != values.len() {
            return Err(TrimError::configuration(format!(
                "{} devices but {} values",
                devices.len(),
                values.len()
            )));
        }
        st.batches += 1;
        let suffix = st.suffix.clone();
        let statuses = devices
            .iter()
            .zip(values)
            .map(|(name, value)| {
                if st.failing.contains(name.as_str()) {
                    return Err(format!("{name}: not responding"));
                }
                match st.pvs.get_mut(&set_point_channel(name, &suffix)) {
                    Some(v) => {
                        *v = *value;
                        Ok(())
                    }
                    None => Err(format!("{name}: unknown device")),
                }
            })
            .collect();
        Ok(statuses)
    }
}
