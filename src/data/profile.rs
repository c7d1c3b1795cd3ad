//! Reference momentum profile tracker.
//!
//! The profile holds one entry per device of the latest snapshot, in that
//! snapshot's order. Entries of disabled regions are carried across
//! recomputes by device name, never by position.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::data::device::{DatasetSnapshot, RegionSet};
use crate::error::{Result, TrimError};

/// Ordered `(device_name, reference value)` entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReferenceProfile {
    entries: Vec<(String, f64)>,
}

impl ReferenceProfile {
    pub fn entries(&self) -> &[(String, f64)] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, device_name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(name, _)| name == device_name)
            .map(|(_, v)| *v)
    }

    /// Plain value vector, as pushed to the pub/sub channel.
    pub fn values(&self) -> Vec<f64> {
        self.entries.iter().map(|(_, v)| *v).collect()
    }
}

impl FromIterator<(String, f64)> for ReferenceProfile {
    fn from_iter<I: IntoIterator<Item = (String, f64)>>(iter: I) -> Self {
        Self {
            entries: iter.into_iter().collect(),
        }
    }
}

/// Owns the operator-visible reference profile.
#[derive(Debug, Default)]
pub struct ProfileTracker {
    profile: Option<ReferenceProfile>,
}

impl ProfileTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.profile.is_some()
    }

    pub fn profile(&self) -> Option<&ReferenceProfile> {
        self.profile.as_ref()
    }

    /// Seed the profile from the snapshot's reference energies. Valid once.
    pub fn initialize(&mut self, snapshot: &DatasetSnapshot) -> Result<&ReferenceProfile> {
        if self.profile.is_some() {
            return Err(TrimError::configuration(
                "reference profile is already initialized",
            ));
        }
        let profile = snapshot
            .devices()
            .iter()
            .map(|d| (d.device_name.clone(), d.reference_energy))
            .collect();
        Ok(&*self.profile.insert(profile))
    }

    /// Replace enabled-region entries with the live actual energy and carry
    /// every other entry over unchanged. The profile is untouched on error.
    pub fn recompute(
        &mut self,
        snapshot: &DatasetSnapshot,
        enabled: &RegionSet,
    ) -> Result<&ReferenceProfile> {
        let prior = self
            .profile
            .as_ref()
            .ok_or_else(|| TrimError::configuration("reference profile is not initialized"))?;
        let by_name: HashMap<&str, f64> = prior
            .entries
            .iter()
            .map(|(name, v)| (name.as_str(), *v))
            .collect();

        let mut entries = Vec::with_capacity(snapshot.len());
        for dev in snapshot.devices() {
            let value = if enabled.contains(&dev.region) {
                dev.actual_energy
            } else {
                *by_name.get(dev.device_name.as_str()).ok_or_else(|| {
                    TrimError::unavailable(format!(
                        "device '{}' has no prior reference value",
                        dev.device_name
                    ))
                })?
            };
            entries.push((dev.device_name.clone(), value));
        }
        Ok(&*self.profile.insert(ReferenceProfile { entries }))
    }

    /// Put a previously saved profile back, e.g. on undo.
    pub fn restore(&mut self, profile: ReferenceProfile) {
        self.profile = Some(profile);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::device::{record, Region};
    use chrono::Local;

    fn snapshot(rows: &[(&str, Region, f64, f64)]) -> DatasetSnapshot {
        let records = rows
            .iter()
            .map(|(name, region, eref, eact)| {
                let mut r = record(name, *region, 0.5);
                r.reference_energy = *eref;
                r.actual_energy = *eact;
                r
            })
            .collect();
        DatasetSnapshot::from_records(records, Local::now()).unwrap()
    }

    #[test]
    fn initialize_only_once() {
        let snap = snapshot(&[("Q1", Region::L2, 100.0, 101.0)]);
        let mut tracker = ProfileTracker::new();
        assert_eq!(tracker.initialize(&snap).unwrap().values(), vec![100.0]);
        assert!(matches!(
            tracker.initialize(&snap),
            Err(TrimError::Configuration(_))
        ));
    }

    #[test]
    fn disabled_regions_stay_frozen() {
        let first = snapshot(&[
            ("Q1", Region::L2, 100.0, 101.0),
            ("Q2", Region::L3, 0.1 + 0.2, 999.0),
        ]);
        let mut tracker = ProfileTracker::new();
        tracker.initialize(&first).unwrap();

        let second = snapshot(&[
            ("Q1", Region::L2, 100.0, 102.5),
            ("Q2", Region::L3, 7.0, 555.0),
        ]);
        let enabled: RegionSet = [Region::L2].into_iter().collect();
        let profile = tracker.recompute(&second, &enabled).unwrap();
        assert_eq!(profile.get("Q1"), Some(102.5));
        assert_eq!(
            profile.get("Q2").unwrap().to_bits(),
            (0.1f64 + 0.2).to_bits()
        );
    }

    #[test]
    fn recompute_joins_on_name_not_position() {
        let first = snapshot(&[
            ("Q1", Region::L3, 1.0, 10.0),
            ("Q2", Region::L3, 2.0, 20.0),
        ]);
        let mut tracker = ProfileTracker::new();
        tracker.initialize(&first).unwrap();

        // Same devices, reversed order.
        let second = snapshot(&[
            ("Q2", Region::L3, 2.0, 20.0),
            ("Q1", Region::L3, 1.0, 10.0),
        ]);
        let profile = tracker.recompute(&second, &RegionSet::new()).unwrap();
        assert_eq!(
            profile.entries(),
            &[("Q2".to_string(), 2.0), ("Q1".to_string(), 1.0)]
        );
    }

    #[test]
    fn unknown_frozen_device_is_a_mismatch() {
        let first = snapshot(&[("Q1", Region::L3, 1.0, 10.0)]);
        let mut tracker = ProfileTracker::new();
        tracker.initialize(&first).unwrap();

        let second = snapshot(&[
            ("Q1", Region::L3, 1.0, 10.0),
            ("Q9", Region::L3, 9.0, 90.0),
        ]);
        let res = tracker.recompute(&second, &RegionSet::new());
        assert!(matches!(res, Err(TrimError::Unavailable(_))));
        assert_eq!(tracker.profile().unwrap().values(), vec![1.0]);
    }
}
