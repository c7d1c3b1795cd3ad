//! Trim/undo controller: the only component holding cross-call state.
//!
//! State machine:
//!
//! ```text
//!   Idle ──trim()──▶ TrimInProgress ──▶ Trimmed ──undo()──▶ UndoInProgress ──▶ Idle
//!                                        │  ▲
//!                                        └──┘ trim() again overwrites the undo snapshot
//! ```
//!
//! Every destructive action is preceded by an audit record and an in-memory
//! undo snapshot. Remote failures never escape as panics: each call site
//! reports to the [`StatusChannel`] and either returns an error (state
//! unchanged) or completes the transition with per-device failures recorded.

use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::audit::{AuditHandle, AuditStore, CsvAuditLog};
use crate::backends::{Actuator, AppliedResult, DeadlineActuator, DeviceOutcome};
use crate::config::TrimConfig;
use crate::data::device::{DatasetSnapshot, Region, RegionSet, SetPoints};
use crate::data::profile::{ProfileTracker, ReferenceProfile};
use crate::data::trim::{build_request, BackendClassifier, TrimRequest, TrimSource, ValueSource};
use crate::error::{Result, TrimError};
use crate::persistence::SessionState;
use crate::sink::ProfilePublisher;
use crate::source::SnapshotSource;
use crate::status::{StatusChannel, StatusKind, StatusMessage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Idle,
    TrimInProgress,
    /// Undo available.
    Trimmed,
    UndoInProgress,
}

/// Single most-recent backup, captured right before a trim is applied.
#[derive(Debug, Clone)]
pub struct UndoSnapshot {
    /// Commanded set points of every device before the trim.
    pub commanded: SetPoints,
    /// Reference profile before the trim.
    pub profile: ReferenceProfile,
    pub audit: AuditHandle,
    /// Dataset and region selection the trim was built from; undo rebuilds
    /// against these so it touches exactly the trimmed devices.
    pub dataset: DatasetSnapshot,
    pub enabled: RegionSet,
}

/// Outcome of one actuation across both backends.
#[derive(Debug, Clone, PartialEq)]
pub struct ActuationReport {
    pub modern: AppliedResult,
    pub legacy: AppliedResult,
}

impl ActuationReport {
    pub fn outcomes(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.modern.outcomes.iter().chain(self.legacy.outcomes.iter())
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes().filter(|o| o.result.is_err())
    }

    pub fn is_complete(&self) -> bool {
        self.modern.is_complete() && self.legacy.is_complete()
    }

    /// `prior` with every successfully written value applied.
    pub fn achieved(&self, prior: &SetPoints) -> SetPoints {
        let mut next = prior.clone();
        for o in self.outcomes().filter(|o| o.result.is_ok()) {
            next.insert(o.device_name.clone(), o.value);
        }
        next
    }
}

#[derive(Debug, Clone)]
pub enum TrimOutcome {
    /// Nothing to do: the machine already holds the requested set points.
    AlreadySet,
    /// Applied, possibly with per-device failures listed in the report.
    Applied {
        report: ActuationReport,
        audit: AuditHandle,
    },
}

#[derive(Debug, Clone)]
pub enum UndoOutcome {
    /// Every device restored; the undo snapshot is gone.
    Restored(ActuationReport),
    /// Some devices failed; the undo snapshot is kept so undo can be retried.
    Incomplete(ActuationReport),
}

pub struct TrimController {
    fetcher: Box<dyn SnapshotSource>,
    modern: Box<dyn Actuator>,
    legacy: Box<dyn Actuator>,
    audit: Box<dyn AuditStore>,
    publisher: Box<dyn ProfilePublisher>,
    classifier: Box<dyn BackendClassifier>,
    status: StatusChannel,

    state: ControllerState,
    enabled: RegionSet,
    source: TrimSource,
    snapshot: Option<DatasetSnapshot>,
    tracker: ProfileTracker,
    undo: Option<UndoSnapshot>,
    last_applied: Option<SetPoints>,
    last_audit: Option<AuditHandle>,
}

impl TrimController {
    pub fn new(
        fetcher: impl SnapshotSource + 'static,
        modern: impl Actuator + 'static,
        legacy: impl Actuator + 'static,
        audit: impl AuditStore + 'static,
        publisher: impl ProfilePublisher + 'static,
        classifier: impl BackendClassifier + 'static,
    ) -> Self {
        Self {
            fetcher: Box::new(fetcher),
            modern: Box::new(modern),
            legacy: Box::new(legacy),
            audit: Box::new(audit),
            publisher: Box::new(publisher),
            classifier: Box::new(classifier),
            status: StatusChannel::new(),
            state: ControllerState::Idle,
            enabled: RegionSet::new(),
            source: TrimSource::default(),
            snapshot: None,
            tracker: ProfileTracker::new(),
            undo: None,
            last_applied: None,
            last_audit: None,
        }
    }

    /// Wire a controller from configuration: CSV audit log in `audit_dir`,
    /// prefix classifier, optional actuation deadline, startup selections.
    pub fn from_config<M, L>(
        config: &TrimConfig,
        fetcher: impl SnapshotSource + 'static,
        modern: M,
        legacy: L,
        publisher: impl ProfilePublisher + 'static,
    ) -> Self
    where
        M: Actuator + 'static,
        L: Actuator + 'static,
    {
        let audit = CsvAuditLog::new(config.audit_dir.clone());
        let mut ctrl = match config.actuation_deadline() {
            Some(deadline) => Self::new(
                fetcher,
                DeadlineActuator::new(modern, deadline),
                DeadlineActuator::new(legacy, deadline),
                audit,
                publisher,
                config.classifier(),
            ),
            None => Self::new(fetcher, modern, legacy, audit, publisher, config.classifier()),
        };
        ctrl.enabled = config.enabled_regions.clone();
        ctrl.source = config.trim_source;
        ctrl
    }

    pub fn with_status(mut self, status: StatusChannel) -> Self {
        self.status = status;
        self
    }

    pub fn with_enabled_regions(mut self, enabled: RegionSet) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_trim_source(mut self, source: TrimSource) -> Self {
        self.source = source;
        self
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn status(&self) -> &StatusChannel {
        &self.status
    }

    pub fn snapshot(&self) -> Option<&DatasetSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn reference_profile(&self) -> Option<&ReferenceProfile> {
        self.tracker.profile()
    }

    pub fn undo_snapshot(&self) -> Option<&UndoSnapshot> {
        self.undo.as_ref()
    }

    pub fn can_undo(&self) -> bool {
        self.state == ControllerState::Trimmed && self.undo.is_some()
    }

    pub fn last_applied(&self) -> Option<&SetPoints> {
        self.last_applied.as_ref()
    }

    pub fn last_audit(&self) -> Option<&AuditHandle> {
        self.last_audit.as_ref()
    }

    pub fn enabled_regions(&self) -> &RegionSet {
        &self.enabled
    }

    pub fn trim_source(&self) -> TrimSource {
        self.source
    }

    // ── Operator selections ─────────────────────────────────────────────

    pub fn set_region_enabled(&mut self, region: Region, enabled: bool) {
        if enabled {
            self.enabled.insert(region);
        } else {
            self.enabled.remove(&region);
        }
    }

    pub fn set_enabled_regions(&mut self, enabled: RegionSet) {
        self.enabled = enabled;
    }

    pub fn set_trim_source(&mut self, source: TrimSource) {
        self.source = source;
    }

    pub fn session_state(&self) -> SessionState {
        SessionState {
            enabled_regions: self.enabled.clone(),
            trim_source: self.source,
            last_audit: self.last_audit.clone(),
            reference_profile: self.tracker.profile().cloned(),
        }
    }

    /// Apply a saved session. Only valid while idle; a stored profile
    /// replaces the current one and is published.
    pub fn restore_session(&mut self, session: SessionState) -> Result<()> {
        if self.state != ControllerState::Idle {
            return Err(self.fail(
                StatusKind::CONFIGURATION,
                TrimError::configuration("session can only be restored while idle"),
            ));
        }
        self.enabled = session.enabled_regions;
        self.source = session.trim_source;
        self.last_audit = session.last_audit;
        if let Some(profile) = session.reference_profile {
            self.tracker.restore(profile);
            self.publish_current(StatusKind::REFERENCE);
        }
        Ok(())
    }

    // ── Operations ──────────────────────────────────────────────────────

    /// Fetch a fresh snapshot. The first successful fetch seeds the
    /// reference profile.
    pub fn refresh(&mut self) -> Result<&DatasetSnapshot> {
        let snapshot = self.fetch(StatusKind::FETCH)?;
        self.seed(&snapshot)?;
        Ok(&*self.snapshot.insert(snapshot))
    }

    /// Explicit recompute of the reference profile from the current snapshot
    /// (fetching one if none is held yet), then publish it.
    pub fn recompute_reference(&mut self) -> Result<&ReferenceProfile> {
        if self.snapshot.is_none() {
            self.refresh()?;
        }
        let Some(snapshot) = self.snapshot.as_ref() else {
            return Err(TrimError::unavailable("no dataset snapshot"));
        };
        if let Some(e) = self.tracker.recompute(snapshot, &self.enabled).err() {
            return Err(self.fail(StatusKind::REFERENCE | kind_of(&e), e));
        }
        self.status.post(
            StatusKind::REFERENCE,
            format!("reference profile recomputed for {}", region_list(&self.enabled)),
        );
        self.publish_current(StatusKind::REFERENCE);
        self.tracker
            .profile()
            .ok_or_else(|| TrimError::configuration("reference profile is not initialized"))
    }

    /// Trim the enabled regions to the selected scale source.
    pub fn trim(&mut self) -> Result<TrimOutcome> {
        self.ensure_settled(StatusKind::TRIM)?;
        let settled = self.state;

        let snapshot = self.fetch(StatusKind::TRIM)?;
        self.seed(&snapshot)?;

        let request = build_request(
            &snapshot,
            &self.enabled,
            ValueSource::from(self.source),
            &*self.classifier,
        )
        .map_err(|e| self.fail(StatusKind::TRIM | kind_of(&e), e))?;

        if request.is_empty() {
            self.snapshot = Some(snapshot);
            return Err(self.fail(
                StatusKind::TRIM | StatusKind::CONFIGURATION,
                TrimError::configuration(format!(
                    "no devices selected in {}",
                    region_list(&self.enabled)
                )),
            ));
        }

        let pre_trim = snapshot.commanded();
        if self.is_already_set(&pre_trim) {
            self.status.post(StatusKind::ALREADY_SET, "already set");
            self.snapshot = Some(snapshot);
            return Ok(TrimOutcome::AlreadySet);
        }

        self.state = ControllerState::TrimInProgress;
        let profile_before = self.tracker.profile().cloned().unwrap_or_default();
        let handle = match self.audit.write(&snapshot, &profile_before) {
            Ok(handle) => handle,
            Err(e) => {
                self.state = settled;
                let e = match e {
                    TrimError::Audit(msg) => TrimError::Audit(msg),
                    other => TrimError::Audit(other.to_string()),
                };
                return Err(self.fail(StatusKind::TRIM | StatusKind::AUDIT_FAILURE, e));
            }
        };
        self.last_audit = Some(handle.clone());
        self.status.post(
            StatusKind::AUDIT_WRITTEN,
            format!("pre-trim snapshot saved to {handle}"),
        );

        self.undo = Some(UndoSnapshot {
            commanded: pre_trim.clone(),
            profile: profile_before,
            audit: handle.clone(),
            dataset: snapshot.clone(),
            enabled: self.enabled.clone(),
        });

        let report = self.actuate(&request, StatusKind::TRIM);

        if let Some(e) = self.tracker.recompute(&snapshot, &self.enabled).err() {
            self.fail(StatusKind::TRIM | kind_of(&e), e);
        }
        self.publish_current(StatusKind::TRIM);

        self.last_applied = Some(report.achieved(&pre_trim));
        self.snapshot = Some(snapshot);
        self.state = ControllerState::Trimmed;

        let failed = report.failures().count();
        let mut kinds = StatusKind::TRIM;
        if failed > 0 {
            kinds |= StatusKind::ACTUATION_FAILURE;
        }
        self.status.post(
            kinds,
            format!(
                "trimmed {} devices in {} ({} failed); undo available",
                request.len(),
                region_list(&self.enabled),
                failed
            ),
        );
        Ok(TrimOutcome::Applied {
            report,
            audit: handle,
        })
    }

    /// Revert the most recent trim.
    pub fn undo(&mut self) -> Result<UndoOutcome> {
        self.ensure_settled(StatusKind::UNDO)?;
        let undo = match self.undo.take() {
            Some(undo) if self.state == ControllerState::Trimmed => undo,
            other => {
                self.undo = other;
                return Err(self.fail(
                    StatusKind::UNDO | StatusKind::CONFIGURATION,
                    TrimError::configuration("nothing to undo: no trim has been applied"),
                ));
            }
        };

        let request = match build_request(
            &undo.dataset,
            &undo.enabled,
            ValueSource::Undo(Some(&undo.commanded)),
            &*self.classifier,
        ) {
            Ok(request) => request,
            Err(e) => {
                self.undo = Some(undo);
                return Err(self.fail(StatusKind::UNDO | kind_of(&e), e));
            }
        };

        self.state = ControllerState::UndoInProgress;
        let report = self.actuate(&request, StatusKind::UNDO);

        if !report.is_complete() {
            let failed = report.failures().count();
            self.undo = Some(undo);
            self.state = ControllerState::Trimmed;
            self.status.post(
                StatusKind::UNDO | StatusKind::ACTUATION_FAILURE,
                format!("undo incomplete: {failed} devices failed; undo still available"),
            );
            return Ok(UndoOutcome::Incomplete(report));
        }

        self.tracker.restore(undo.profile.clone());
        self.publish_values(&undo.profile.values(), StatusKind::UNDO);
        // Nothing trimmed is left on the machine.
        self.last_applied = None;
        self.state = ControllerState::Idle;
        self.status.post(
            StatusKind::UNDO,
            format!(
                "restored {} devices from trim recorded in {}",
                request.len(),
                undo.audit
            ),
        );
        Ok(UndoOutcome::Restored(report))
    }

    // ── Internals ───────────────────────────────────────────────────────

    fn ensure_settled(&self, kind: StatusKind) -> Result<()> {
        match self.state {
            ControllerState::Idle | ControllerState::Trimmed => Ok(()),
            busy => Err(self.fail(
                kind | StatusKind::CONFIGURATION,
                TrimError::configuration(format!("controller is busy ({busy:?})")),
            )),
        }
    }

    fn fetch(&mut self, kind: StatusKind) -> Result<DatasetSnapshot> {
        match self.fetcher.fetch() {
            Ok(snapshot) => {
                debug!(devices = snapshot.len(), "dataset fetched");
                Ok(snapshot)
            }
            Err(e) => Err(self.fail(kind | kind_of(&e), e)),
        }
    }

    fn seed(&mut self, snapshot: &DatasetSnapshot) -> Result<()> {
        if !self.tracker.is_initialized() {
            self.tracker.initialize(snapshot)?;
            self.publish_current(StatusKind::REFERENCE);
        }
        Ok(())
    }

    /// The machine still holds exactly what the last trim left on it.
    fn is_already_set(&self, fresh: &SetPoints) -> bool {
        self.last_applied.as_ref().is_some_and(|last| last == fresh)
    }

    /// Modern first, then legacy. One status entry per failed device.
    fn actuate(&mut self, request: &TrimRequest, kind: StatusKind) -> ActuationReport {
        info!(
            modern = request.modern.len(),
            legacy = request.legacy.len(),
            "dispatching set points"
        );
        let modern = self.modern.apply(&request.modern);
        let legacy = self.legacy.apply(&request.legacy);
        let report = ActuationReport { modern, legacy };
        for (backend, outcome) in [&report.modern, &report.legacy]
            .into_iter()
            .flat_map(|r| r.failures().map(move |o| (r.backend, o)))
        {
            let reason = outcome.result.as_ref().err().map(String::as_str).unwrap_or("");
            self.status.emit(
                StatusMessage::new(
                    kind | StatusKind::ACTUATION_FAILURE,
                    format!(
                        "{} failed to set {} = {}: {}",
                        backend, outcome.device_name, outcome.value, reason
                    ),
                )
                .for_device(outcome.device_name.clone(), backend),
            );
        }
        report
    }

    fn publish_current(&mut self, kind: StatusKind) {
        if let Some(values) = self.tracker.profile().map(ReferenceProfile::values) {
            self.publish_values(&values, kind);
        }
    }

    fn publish_values(&mut self, values: &[f64], kind: StatusKind) {
        match self.publisher.publish(values) {
            Ok(()) => self.status.post(
                kind | StatusKind::PUBLISHED,
                format!("reference profile published ({} devices)", values.len()),
            ),
            Err(e) => {
                self.fail(kind | StatusKind::PUBLISH_FAILURE, e);
            }
        }
    }

    fn fail(&self, kinds: StatusKind, err: TrimError) -> TrimError {
        self.status.post(kinds, err.to_string());
        err
    }
}

fn kind_of(err: &TrimError) -> StatusKind {
    match err {
        TrimError::Unavailable(_) => StatusKind::UNAVAILABLE,
        TrimError::Audit(_) => StatusKind::AUDIT_FAILURE,
        TrimError::Publish(_) => StatusKind::PUBLISH_FAILURE,
        _ => StatusKind::CONFIGURATION,
    }
}

fn region_list(regions: &RegionSet) -> String {
    if regions.is_empty() {
        return "no regions".to_string();
    }
    regions
        .iter()
        .map(Region::as_str)
        .collect::<Vec<_>>()
        .join(",")
}

/// A controller shared between threads. All operations run inside one
/// exclusive section, so the undo snapshot and the reference profile are
/// always observed and updated together.
#[derive(Clone)]
pub struct SharedController {
    inner: Arc<Mutex<TrimController>>,
}

impl SharedController {
    pub fn new(controller: TrimController) -> Self {
        Self {
            inner: Arc::new(Mutex::new(controller)),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, TrimController>> {
        self.inner
            .lock()
            .map_err(|_| TrimError::configuration("controller lock poisoned"))
    }

    pub fn trim(&self) -> Result<TrimOutcome> {
        self.lock()?.trim()
    }

    pub fn undo(&self) -> Result<UndoOutcome> {
        self.lock()?.undo()
    }

    pub fn refresh(&self) -> Result<()> {
        self.lock()?.refresh().map(|_| ())
    }

    pub fn state(&self) -> Result<ControllerState> {
        Ok(self.lock()?.state())
    }

    /// Run `f` with exclusive access to the controller.
    pub fn with<R>(&self, f: impl FnOnce(&mut TrimController) -> R) -> Result<R> {
        Ok(f(&mut *self.lock()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditRow;
    use crate::data::device::{record, DeviceRecord};
    use crate::data::trim::BackendId;
    use chrono::Local;
    use std::collections::HashSet;

    #[derive(Default)]
    struct MachineState {
        devices: Vec<DeviceRecord>,
        failing: HashSet<String>,
        applies: usize,
        audits: usize,
        published: Vec<Vec<f64>>,
        audit_broken: bool,
    }

    #[derive(Clone, Default)]
    struct Machine(Arc<Mutex<MachineState>>);

    impl Machine {
        fn new(devices: Vec<DeviceRecord>) -> Self {
            let m = Self::default();
            m.0.lock().unwrap().devices = devices;
            m
        }

        fn state(&self) -> MutexGuard<'_, MachineState> {
            self.0.lock().unwrap()
        }

        fn commanded(&self, name: &str) -> f64 {
            self.state()
                .devices
                .iter()
                .find(|d| d.device_name == name)
                .map(|d| d.commanded_set_point)
                .unwrap()
        }
    }

    impl SnapshotSource for Machine {
        fn fetch(&mut self) -> Result<DatasetSnapshot> {
            DatasetSnapshot::from_records(self.state().devices.clone(), Local::now())
        }
    }

    struct Backend(Machine, BackendId);

    impl Actuator for Backend {
        fn backend(&self) -> BackendId {
            self.1
        }

        fn apply(&mut self, device_values: &[(String, f64)]) -> AppliedResult {
            let mut st = self.0.state();
            if !device_values.is_empty() {
                st.applies += 1;
            }
            let mut applied = AppliedResult::new(self.1);
            for (name, value) in device_values {
                let result = if st.failing.contains(name) {
                    Err("timeout".to_string())
                } else {
                    if let Some(d) = st.devices.iter_mut().find(|d| &d.device_name == name) {
                        d.commanded_set_point = *value;
                    }
                    Ok(())
                };
                applied.outcomes.push(DeviceOutcome {
                    device_name: name.clone(),
                    value: *value,
                    result,
                });
            }
            applied
        }
    }

    impl AuditStore for Machine {
        fn write(&mut self, _: &DatasetSnapshot, _: &ReferenceProfile) -> Result<AuditHandle> {
            let mut st = self.state();
            if st.audit_broken {
                return Err(TrimError::Audit("disk full".into()));
            }
            st.audits += 1;
            Ok(AuditHandle(format!("audit_{}.csv", st.audits).into()))
        }

        fn read(&self, _: &AuditHandle) -> Result<Vec<AuditRow>> {
            Ok(vec![])
        }
    }

    impl ProfilePublisher for Machine {
        fn publish(&mut self, values: &[f64]) -> Result<()> {
            self.state().published.push(values.to_vec());
            Ok(())
        }
    }

    fn machine() -> Machine {
        let mut quad = record("QUAD:A", Region::L2, 0.10);
        quad.extant_set_point = 0.15;
        quad.reference_energy = 4.0;
        let mut bend = record("BEND:B", Region::L2, 0.20);
        bend.extant_set_point = 0.25;
        bend.reference_energy = 5.0;
        let mut other = record("QUAD:C", Region::L3, 0.30);
        other.extant_set_point = 0.35;
        other.reference_energy = 10.0;
        Machine::new(vec![quad, bend, other])
    }

    fn controller(m: &Machine) -> TrimController {
        let classifier = |name: &str| {
            if name.starts_with("BEND") {
                BackendId::Legacy
            } else {
                BackendId::Modern
            }
        };
        TrimController::new(
            m.clone(),
            Backend(m.clone(), BackendId::Modern),
            Backend(m.clone(), BackendId::Legacy),
            m.clone(),
            m.clone(),
            classifier,
        )
        .with_enabled_regions([Region::L2].into_iter().collect())
    }

    #[test]
    fn trim_applies_extant_to_enabled_regions_only() {
        let m = machine();
        let mut ctrl = controller(&m);
        let outcome = ctrl.trim().unwrap();
        let TrimOutcome::Applied { report, .. } = outcome else {
            panic!("expected an applied trim");
        };
        assert_eq!(report.modern.outcomes.len(), 1);
        assert_eq!(report.legacy.outcomes.len(), 1);
        assert!(report.is_complete());
        assert_eq!(m.commanded("QUAD:A"), 0.15);
        assert_eq!(m.commanded("BEND:B"), 0.25);
        assert_eq!(m.commanded("QUAD:C"), 0.30);
        assert_eq!(ctrl.state(), ControllerState::Trimmed);
        assert!(ctrl.can_undo());
        let undo = ctrl.undo_snapshot().unwrap();
        assert_eq!(undo.commanded["QUAD:A"], 0.10);
        assert_eq!(m.state().audits, 1);
    }

    #[test]
    fn undo_restores_set_points_and_profile() {
        let m = machine();
        let mut ctrl = controller(&m);
        ctrl.refresh().unwrap();
        let before = ctrl.reference_profile().cloned().unwrap();
        ctrl.trim().unwrap();

        let outcome = ctrl.undo().unwrap();
        assert!(matches!(outcome, UndoOutcome::Restored(_)));
        assert_eq!(m.commanded("QUAD:A"), 0.10);
        assert_eq!(m.commanded("BEND:B"), 0.20);
        assert_eq!(ctrl.reference_profile(), Some(&before));
        assert_eq!(m.state().published.last(), Some(&before.values()));
        assert_eq!(ctrl.state(), ControllerState::Idle);
        assert!(ctrl.undo_snapshot().is_none());
    }

    #[test]
    fn undo_without_trim_is_rejected_without_actuation() {
        let m = machine();
        let mut ctrl = controller(&m);
        assert!(matches!(ctrl.undo(), Err(TrimError::Configuration(_))));
        assert_eq!(m.state().applies, 0);
        let last = ctrl.status().latest().unwrap();
        assert!(last.kinds.contains(StatusKind::CONFIGURATION));
    }

    #[test]
    fn second_trim_is_already_set() {
        let m = machine();
        let mut ctrl = controller(&m);
        ctrl.trim().unwrap();
        let applies = m.state().applies;

        assert!(matches!(ctrl.trim().unwrap(), TrimOutcome::AlreadySet));
        assert_eq!(m.state().applies, applies);
        assert_eq!(m.state().audits, 1);
        assert_eq!(ctrl.status().latest().unwrap().text, "already set");
    }

    #[test]
    fn partial_failure_is_reported_per_device() {
        let m = machine();
        m.state().failing.insert("QUAD:A".into());
        let mut ctrl = controller(&m);
        let failures = ctrl
            .status()
            .subscribe(crate::status::StatusFilter::only(StatusKind::ACTUATION_FAILURE));

        let TrimOutcome::Applied { report, .. } = ctrl.trim().unwrap() else {
            panic!("expected an applied trim");
        };
        assert_eq!(report.failures().count(), 1);
        assert_eq!(m.commanded("QUAD:A"), 0.10);
        assert_eq!(m.commanded("BEND:B"), 0.25);
        assert_eq!(ctrl.state(), ControllerState::Trimmed);
        assert_eq!(ctrl.undo_snapshot().unwrap().commanded["QUAD:A"], 0.10);
        assert_eq!(ctrl.last_applied().unwrap()["QUAD:A"], 0.10);

        let per_device: Vec<_> = failures.try_iter().filter(|m| m.device.is_some()).collect();
        assert_eq!(per_device.len(), 1);
        assert_eq!(per_device[0].device.as_deref(), Some("QUAD:A"));
        assert_eq!(per_device[0].backend, Some(BackendId::Modern));
    }

    #[test]
    fn failed_undo_keeps_snapshot_for_retry() {
        let m = machine();
        let mut ctrl = controller(&m);
        ctrl.trim().unwrap();
        m.state().failing.insert("BEND:B".into());

        assert!(matches!(ctrl.undo().unwrap(), UndoOutcome::Incomplete(_)));
        assert_eq!(ctrl.state(), ControllerState::Trimmed);
        assert!(ctrl.can_undo());

        m.state().failing.clear();
        assert!(matches!(ctrl.undo().unwrap(), UndoOutcome::Restored(_)));
        assert_eq!(m.commanded("BEND:B"), 0.20);
    }

    #[test]
    fn audit_failure_aborts_before_actuation() {
        let m = machine();
        m.state().audit_broken = true;
        let mut ctrl = controller(&m);
        assert!(matches!(ctrl.trim(), Err(TrimError::Audit(_))));
        assert_eq!(m.state().applies, 0);
        assert_eq!(ctrl.state(), ControllerState::Idle);
        assert!(ctrl.undo_snapshot().is_none());
        assert_eq!(m.commanded("QUAD:A"), 0.10);
    }

    #[test]
    fn retrim_overwrites_undo_snapshot() {
        let m = machine();
        let mut ctrl = controller(&m);
        ctrl.trim().unwrap();
        // Someone moves QUAD:C behind the controller's back.
        m.state().devices[2].commanded_set_point = 0.32;
        ctrl.set_region_enabled(Region::L3, true);
        ctrl.trim().unwrap();
        let undo = ctrl.undo_snapshot().unwrap();
        assert_eq!(undo.commanded["QUAD:A"], 0.15);
        assert_eq!(undo.commanded["QUAD:C"], 0.32);
        assert_eq!(m.state().audits, 2);
    }

    #[test]
    fn unchanged_machine_is_already_set_even_with_new_regions() {
        let m = machine();
        let mut ctrl = controller(&m);
        ctrl.trim().unwrap();
        let (applies, audits) = (m.state().applies, m.state().audits);

        ctrl.set_region_enabled(Region::L3, true);
        assert!(matches!(ctrl.trim().unwrap(), TrimOutcome::AlreadySet));
        assert_eq!((m.state().applies, m.state().audits), (applies, audits));
        assert_eq!(m.commanded("QUAD:C"), 0.30);
    }

    #[test]
    fn trim_after_undo_is_allowed() {
        let m = machine();
        let mut ctrl = controller(&m);
        ctrl.trim().unwrap();
        ctrl.undo().unwrap();
        assert!(ctrl.last_applied().is_none());
        assert!(matches!(ctrl.trim().unwrap(), TrimOutcome::Applied { .. }));
        assert_eq!(m.commanded("QUAD:A"), 0.15);
    }

    #[test]
    fn empty_selection_keeps_previous_undo() {
        let m = machine();
        let mut ctrl = controller(&m);
        ctrl.trim().unwrap();
        let audits = m.state().audits;
        m.state().devices[2].commanded_set_point = 0.32;

        ctrl.set_enabled_regions(RegionSet::new());
        assert!(matches!(ctrl.trim(), Err(TrimError::Configuration(_))));
        assert_eq!(m.state().audits, audits);
        assert_eq!(ctrl.state(), ControllerState::Trimmed);
        assert_eq!(ctrl.undo_snapshot().unwrap().commanded["QUAD:A"], 0.10);
    }

    #[test]
    fn session_round_trips_through_controller() {
        let m = machine();
        let mut ctrl = controller(&m);
        ctrl.set_trim_source(TrimSource::Design);
        ctrl.trim().unwrap();
        let session = ctrl.session_state();
        assert_eq!(session.last_audit.as_ref(), ctrl.last_audit());
        assert!(matches!(
            ctrl.restore_session(session.clone()),
            Err(TrimError::Configuration(_))
        ));

        let mut fresh = controller(&m);
        fresh.restore_session(session.clone()).unwrap();
        assert_eq!(fresh.trim_source(), TrimSource::Design);
        assert_eq!(fresh.reference_profile(), session.reference_profile.as_ref());
        assert!(fresh.refresh().is_ok());
        assert_eq!(fresh.reference_profile(), session.reference_profile.as_ref());
    }

    #[test]
    fn shared_controller_serializes_operations() {
        let m = machine();
        let shared = SharedController::new(controller(&m));
        let other = shared.clone();
        let handle = std::thread::spawn(move || other.trim().map(|_| ()));
        handle.join().unwrap().unwrap();
        assert_eq!(shared.state().unwrap(), ControllerState::Trimmed);
        shared.undo().unwrap();
        assert_eq!(shared.with(|c| c.state()).unwrap(), ControllerState::Idle);
    }
}
