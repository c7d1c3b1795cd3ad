//! Snapshot/audit log: one CSV file per trim event, written before any
//! actuation.
//!
//! The in-memory undo snapshot is the source of truth for undo; these files
//! exist for operator inspection and for recovery after a restart.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::data::device::DatasetSnapshot;
use crate::data::profile::ReferenceProfile;
use crate::error::{Result, TrimError};

/// Locates a persisted audit record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditHandle(pub PathBuf);

impl AuditHandle {
    pub fn path(&self) -> &Path {
        &self.0
    }
}

impl std::fmt::Display for AuditHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// One device row of an audit record. Field order is the file's column order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRow {
    pub device_name: String,
    pub reference: f64,
    pub profile_value: f64,
    pub actual: f64,
    pub error: f64,
    pub design_set_point: f64,
    pub extant_set_point: f64,
    pub commanded_value: f64,
    pub s: f64,
    pub z: f64,
    pub length: f64,
}

pub trait AuditStore: Send {
    /// Persist the full per-device state; must succeed before a trim proceeds.
    fn write(
        &mut self,
        snapshot: &DatasetSnapshot,
        profile: &ReferenceProfile,
    ) -> Result<AuditHandle>;

    fn read(&self, handle: &AuditHandle) -> Result<Vec<AuditRow>>;
}

/// Build the rows of an audit record. Devices absent from the profile are
/// recorded with their reference energy as profile value.
pub fn audit_rows(snapshot: &DatasetSnapshot, profile: &ReferenceProfile) -> Vec<AuditRow> {
    snapshot
        .devices()
        .iter()
        .map(|d| AuditRow {
            device_name: d.device_name.clone(),
            reference: d.reference_energy,
            profile_value: profile.get(&d.device_name).unwrap_or(d.reference_energy),
            actual: d.actual_energy,
            error: d.energy_error,
            design_set_point: d.design_set_point,
            extant_set_point: d.extant_set_point,
            commanded_value: d.commanded_set_point,
            s: d.s_position,
            z: d.z_position,
            length: d.length,
        })
        .collect()
}

/// Append-only directory of timestamped CSV files.
#[derive(Debug, Clone)]
pub struct CsvAuditLog {
    dir: PathBuf,
}

impl CsvAuditLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create a file that did not exist before, suffixing `_1`, `_2`, ...
    /// when several trims land in the same second.
    fn create_new_file(&self) -> std::io::Result<(PathBuf, std::fs::File)> {
        std::fs::create_dir_all(&self.dir)?;
        let stamp = Local::now().format("%Y-%m-%d_%H%M%S");
        let mut n = 0u32;
        loop {
            let name = if n == 0 {
                format!("lem_trim_{stamp}.csv")
            } else {
                format!("lem_trim_{stamp}_{n}.csv")
            };
            let path = self.dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == ErrorKind::AlreadyExists => n += 1,
                Err(e) => return Err(e),
            }
        }
    }
}

impl AuditStore for CsvAuditLog {
    fn write(
        &mut self,
        snapshot: &DatasetSnapshot,
        profile: &ReferenceProfile,
    ) -> Result<AuditHandle> {
        let (path, file) = self
            .create_new_file()
            .map_err(|e| TrimError::Audit(format!("cannot create audit file: {e}")))?;
        let mut writer = csv::Writer::from_writer(file);
        for row in audit_rows(snapshot, profile) {
            writer
                .serialize(row)
                .map_err(|e| TrimError::Audit(format!("{}: {e}", path.display())))?;
        }
        writer
            .into_inner()
            .map_err(|e| TrimError::Audit(format!("{}: {e}", path.display())))?
            .sync_all()
            .map_err(|e| TrimError::Audit(format!("{}: {e}", path.display())))?;
        info!(path = %path.display(), devices = snapshot.len(), "audit record written");
        Ok(AuditHandle(path))
    }

    fn read(&self, handle: &AuditHandle) -> Result<Vec<AuditRow>> {
        let mut reader = csv::Reader::from_path(handle.path())
            .map_err(|e| TrimError::Audit(format!("{handle}: {e}")))?;
        reader
            .deserialize()
            .collect::<std::result::Result<Vec<AuditRow>, _>>()
            .map_err(|e| TrimError::Audit(format!("{handle}: {e}")))
    }
}
