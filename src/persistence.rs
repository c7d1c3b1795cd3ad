//! Session persistence: save and load the operator's selections to/from JSON.
//!
//! Only selections and the reference profile are stored. The undo snapshot is
//! not; after a restart the audit files record what was trimmed.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::audit::AuditHandle;
use crate::data::device::RegionSet;
use crate::data::profile::ReferenceProfile;
use crate::data::trim::TrimSource;
use crate::error::Result;

/// Serializable operator session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionState {
    pub enabled_regions: RegionSet,
    pub trim_source: TrimSource,
    /// Audit record of the most recent trim, if any.
    pub last_audit: Option<AuditHandle>,
    pub reference_profile: Option<ReferenceProfile>,
}

/// Serialize the session as pretty JSON.
pub fn state_to_json(state: &SessionState) -> Result<String> {
    Ok(serde_json::to_string_pretty(state)?)
}

pub fn state_from_json(json: &str) -> Result<SessionState> {
    Ok(serde_json::from_str(json)?)
}

/// Save the session to a JSON file at the given path.
pub fn save_state_to_path(state: &SessionState, path: &Path) -> Result<()> {
    let txt = state_to_json(state)?;
    std::fs::write(path, txt)?;
    Ok(())
}

/// Load a session from a JSON file at the given path.
pub fn load_state_from_path(path: &Path) -> Result<SessionState> {
    let txt = std::fs::read_to_string(path)?;
    state_from_json(&txt)
}
