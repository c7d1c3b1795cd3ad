//! Set-point and energy deviation summaries shown next to the trim controls.
//!
//! Matching quads and the injector regions are reported separately as
//! "excluded": the energy-matching service does not scale them.

use std::collections::BTreeMap;

use crate::config::TrimConfig;
use crate::data::device::{DatasetSnapshot, Region};
use crate::data::trim::TrimSource;
use crate::error::{Result, TrimError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviationClass {
    WithinTolerance,
    OutOfTolerance,
    Excluded,
    /// No percentage: the base value is zero.
    Undefined,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeviationPoint {
    pub device_name: String,
    pub s_position: f64,
    /// Relative error in percent; `None` when the commanded value is zero.
    pub error_pct: Option<f64>,
    pub class: DeviationClass,
}

/// Per-region set-point deviation between the LEM value and the commanded value.
#[derive(Debug, Clone, Default)]
pub struct DeviationSummary {
    pub regions: BTreeMap<Region, Vec<DeviationPoint>>,
}

impl DeviationSummary {
    pub fn compute(snapshot: &DatasetSnapshot, source: TrimSource, config: &TrimConfig) -> Self {
        let mut regions: BTreeMap<Region, Vec<DeviationPoint>> = BTreeMap::new();
        for dev in snapshot.devices() {
            let lem = match source {
                TrimSource::Design => dev.design_set_point,
                TrimSource::Extant => dev.extant_set_point,
            };
            let error_pct = relative_error_pct(lem, dev.commanded_set_point);
            let class = if config.is_excluded(dev.region, &dev.element) {
                DeviationClass::Excluded
            } else {
                classify(error_pct, config.tolerance_pct)
            };
            regions.entry(dev.region).or_default().push(DeviationPoint {
                device_name: dev.device_name.clone(),
                s_position: dev.s_position,
                error_pct,
                class,
            });
        }
        Self { regions }
    }

    pub fn count(&self, class: DeviationClass) -> usize {
        self.regions
            .values()
            .flatten()
            .filter(|p| p.class == class)
            .count()
    }

    pub fn out_of_tolerance(&self) -> impl Iterator<Item = &DeviationPoint> {
        self.regions
            .values()
            .flatten()
            .filter(|p| p.class == DeviationClass::OutOfTolerance)
    }
}

/// `100 * (value - base) / base`, or `None` for a zero base.
pub fn relative_error_pct(value: f64, base: f64) -> Option<f64> {
    if base == 0.0 {
        None
    } else {
        Some(100.0 * (value - base) / base)
    }
}

fn classify(error_pct: Option<f64>, tolerance_pct: f64) -> DeviationClass {
    match error_pct {
        Some(e) if e.abs() < tolerance_pct => DeviationClass::WithinTolerance,
        Some(_) => DeviationClass::OutOfTolerance,
        None => DeviationClass::Undefined,
    }
}

/// Relative energy error of the live momentum profile against design, per element.
pub fn energy_error_pct(live: &[f64], design: &[f64]) -> Result<Vec<Option<f64>>> {
    if live.len() != design.len() {
        return Err(TrimError::unavailable(format!(
            "live momentum has {} elements, design has {}",
            live.len(),
            design.len()
        )));
    }
    Ok(live
        .iter()
        .zip(design)
        .map(|(l, d)| relative_error_pct(*l, *d))
        .collect())
}

/// Classify energy errors against the configured tolerance.
pub fn classify_energy_errors(errors: &[Option<f64>], tolerance_pct: f64) -> Vec<DeviationClass> {
    errors.iter().map(|e| classify(*e, tolerance_pct)).collect()
}
