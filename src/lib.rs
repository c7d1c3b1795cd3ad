//! lemtrim crate root: re-exports and module wiring.
//!
//! Linac energy-management (LEM) trim/undo core: fetch the live energy
//! profile, scale magnet set points of the enabled regions to it, and
//! revert the most recent trim on request.
//!
//! Modules:
//! - `source`: live data fetcher and the remote read interfaces
//! - `data`: devices and snapshots, reference profile, trim requests, deviation statistics
//! - `backends`: modern (per-channel) and legacy (batched service) actuators
//! - `audit`: CSV audit record written before every trim
//! - `controller`: the trim/undo state machine
//! - `sink`: reference-profile publishing
//! - `status`: operator status channel
//! - `config`: YAML beamline configuration
//! - `persistence`: JSON session save/load
//! - `sim`: in-memory beamline behind every remote interface

pub mod audit;
pub mod backends;
pub mod config;
pub mod controller;
pub mod data;
pub mod error;
pub mod persistence;
pub mod sim;
pub mod sink;
pub mod source;
pub mod status;

// Public re-exports for a compact external API
pub use audit::{AuditHandle, AuditStore, CsvAuditLog};
pub use backends::{Actuator, AppliedResult, DeadlineActuator, LegacyBackend, MagnetService, ModernBackend};
pub use config::TrimConfig;
pub use controller::{ControllerState, SharedController, TrimController, TrimOutcome, UndoOutcome};
pub use data::device::{DatasetSnapshot, DeviceRecord, Region, RegionSet};
pub use data::trim::{BackendId, TrimSource};
pub use error::{Result, TrimError};
pub use sink::{channel_profile, ProfileCommand, ProfilePublisher, ProfileSink};
pub use source::{Fetcher, LiveDataSource, PvChannel};
pub use status::{StatusChannel, StatusFilter, StatusKind, StatusMessage};
