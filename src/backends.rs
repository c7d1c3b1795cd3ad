//! Backend actuators: one capability ("set a named device to a value"),
//! realized by per-device channel writes and by a batched legacy service call.
//!
//! An actuator always attempts every entry and reports each device's outcome;
//! a failing device never aborts the rest of the batch.

use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::warn;

use crate::data::trim::BackendId;
use crate::error::Result;
use crate::source::{set_point_channel, PvChannel};

/// Outcome of one device write.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceOutcome {
    pub device_name: String,
    pub value: f64,
    pub result: std::result::Result<(), String>,
}

/// Per-device outcomes of one `apply` call, in request order.
#[derive(Debug, Clone, PartialEq)]
pub struct AppliedResult {
    pub backend: BackendId,
    pub outcomes: Vec<DeviceOutcome>,
}

impl AppliedResult {
    pub fn new(backend: BackendId) -> Self {
        Self {
            backend,
            outcomes: Vec::new(),
        }
    }

    /// Every entry failed with the same reason.
    pub fn all_failed(backend: BackendId, device_values: &[(String, f64)], reason: &str) -> Self {
        Self {
            backend,
            outcomes: device_values
                .iter()
                .map(|(name, value)| DeviceOutcome {
                    device_name: name.clone(),
                    value: *value,
                    result: Err(reason.to_string()),
                })
                .collect(),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_err())
    }

    pub fn succeeded(&self) -> impl Iterator<Item = &DeviceOutcome> {
        self.outcomes.iter().filter(|o| o.result.is_ok())
    }

    pub fn is_complete(&self) -> bool {
        self.failures().next().is_none()
    }
}

pub trait Actuator: Send {
    fn backend(&self) -> BackendId;

    fn apply(&mut self, device_values: &[(String, f64)]) -> AppliedResult;
}

impl<A: Actuator + ?Sized> Actuator for Box<A> {
    fn backend(&self) -> BackendId {
        (**self).backend()
    }

    fn apply(&mut self, device_values: &[(String, f64)]) -> AppliedResult {
        (**self).apply(device_values)
    }
}

/// Channel-based point writes, one `put` per device.
pub struct ModernBackend<C> {
    channel: C,
    suffix: String,
}

impl<C: PvChannel> ModernBackend<C> {
    pub fn new(channel: C, set_point_suffix: impl Into<String>) -> Self {
        Self {
            channel,
            suffix: set_point_suffix.into(),
        }
    }
}

impl<C: PvChannel> Actuator for ModernBackend<C> {
    fn backend(&self) -> BackendId {
        BackendId::Modern
    }

    fn apply(&mut self, device_values: &[(String, f64)]) -> AppliedResult {
        let mut applied = AppliedResult::new(BackendId::Modern);
        for (name, value) in device_values {
            let result = self
                .channel
                .put(&set_point_channel(name, &self.suffix), *value)
                .map_err(|e| e.to_string());
            applied.outcomes.push(DeviceOutcome {
                device_name: name.clone(),
                value: *value,
                result,
            });
        }
        applied
    }
}

/// External magnet-control service taking parallel name/value lists.
///
/// Returns one status per device in request order; a call-level `Err` means
/// the batch was not accepted at all.
pub trait MagnetService: Send {
    fn set_points(
        &mut self,
        devices: &[String],
        values: &[f64],
    ) -> Result<Vec<std::result::Result<(), String>>>;
}

pub struct LegacyBackend<S> {
    service: S,
}

impl<S: MagnetService> LegacyBackend<S> {
    pub fn new(service: S) -> Self {
        Self { service }
    }
}

impl<S: MagnetService> Actuator for LegacyBackend<S> {
    fn backend(&self) -> BackendId {
        BackendId::Legacy
    }

    fn apply(&mut self, device_values: &[(String, f64)]) -> AppliedResult {
        if device_values.is_empty() {
            return AppliedResult::new(BackendId::Legacy);
        }
        let (devices, values): (Vec<String>, Vec<f64>) = device_values.iter().cloned().unzip();
        let statuses = match self.service.set_points(&devices, &values) {
            Ok(statuses) => statuses,
            Err(e) => {
                warn!(error = %e, devices = devices.len(), "legacy magnet service rejected batch");
                return AppliedResult::all_failed(BackendId::Legacy, device_values, &e.to_string());
            }
        };
        let mut statuses = statuses.into_iter();
        let outcomes = device_values
            .iter()
            .map(|(name, value)| DeviceOutcome {
                device_name: name.clone(),
                value: *value,
                result: statuses
                    .next()
                    .unwrap_or_else(|| Err("no status returned by magnet service".to_string())),
            })
            .collect();
        AppliedResult {
            backend: BackendId::Legacy,
            outcomes,
        }
    }
}

/// Bounds each `apply` with a deadline. The call runs on a worker thread;
/// on expiry every device of the batch is reported failed. The dispatched
/// call itself is not cancelled and may still complete later.
pub struct DeadlineActuator<A> {
    inner: Arc<Mutex<A>>,
    backend: BackendId,
    deadline: Duration,
}

impl<A: Actuator + 'static> DeadlineActuator<A> {
    pub fn new(inner: A, deadline: Duration) -> Self {
        let backend = inner.backend();
        Self {
            inner: Arc::new(Mutex::new(inner)),
            backend,
            deadline,
        }
    }
}

impl<A: Actuator + 'static> Actuator for DeadlineActuator<A> {
    fn backend(&self) -> BackendId {
        self.backend
    }

    fn apply(&mut self, device_values: &[(String, f64)]) -> AppliedResult {
        let (tx, rx) = mpsc::channel();
        let inner = Arc::clone(&self.inner);
        let batch = device_values.to_vec();
        let backend = self.backend;
        std::thread::spawn(move || {
            let applied = match inner.lock() {
                Ok(mut actuator) => actuator.apply(&batch),
                Err(_) => AppliedResult::all_failed(
                    backend,
                    &batch,
                    "actuator poisoned by an earlier panic",
                ),
            };
            let _ = tx.send(applied);
        });
        match rx.recv_timeout(self.deadline) {
            Ok(applied) => applied,
            Err(_) => {
                warn!(
                    backend = %self.backend,
                    deadline_ms = self.deadline.as_millis() as u64,
                    "actuation deadline exceeded"
                );
                AppliedResult::all_failed(self.backend, device_values, "deadline exceeded")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TrimError;
    use std::collections::HashMap;

    #[derive(Default)]
    struct Pvs {
        values: HashMap<String, f64>,
        broken: Vec<String>,
        puts: usize,
    }

    impl PvChannel for Pvs {
        fn get(&mut self, channel: &str) -> Result<f64> {
            self.values
                .get(channel)
                .copied()
                .ok_or_else(|| TrimError::unavailable(channel.to_string()))
        }

        fn put(&mut self, channel: &str, value: f64) -> Result<()> {
            self.puts += 1;
            if self.broken.iter().any(|b| b == channel) {
                return Err(TrimError::unavailable(format!("{channel} timed out")));
            }
            self.values.insert(channel.to_string(), value);
            Ok(())
        }
    }

    fn batch(entries: &[(&str, f64)]) -> Vec<(String, f64)> {
        entries.iter().map(|(n, v)| (n.to_string(), *v)).collect()
    }

    #[test]
    fn modern_attempts_every_entry() {
        let pvs = Pvs {
            broken: vec!["QUAD:D1:BDES".to_string()],
            ..Default::default()
        };
        let mut backend = ModernBackend::new(pvs, "BDES");
        let applied = backend.apply(&batch(&[("QUAD:D1", 1.0), ("QUAD:D2", 2.0)]));
        assert_eq!(applied.outcomes.len(), 2);
        let failed: Vec<_> = applied.failures().map(|o| o.device_name.as_str()).collect();
        assert_eq!(failed, vec!["QUAD:D1"]);
        assert_eq!(backend.channel.puts, 2);
        assert_eq!(backend.channel.values["QUAD:D2:BDES"], 2.0);
    }

    #[test]
    fn modern_reissues_identical_writes() {
        let mut backend = ModernBackend::new(Pvs::default(), "BDES");
        let b = batch(&[("QUAD:D1", 1.0)]);
        backend.apply(&b);
        backend.apply(&b);
        assert_eq!(backend.channel.puts, 2);
    }

    struct Service {
        reply: Option<Vec<std::result::Result<(), String>>>,
        calls: Vec<(Vec<String>, Vec<f64>)>,
    }

    impl MagnetService for Service {
        fn set_points(
            &mut self,
            devices: &[String],
            values: &[f64],
        ) -> Result<Vec<std::result::Result<(), String>>> {
            self.calls.push((devices.to_vec(), values.to_vec()));
            self.reply
                .clone()
                .ok_or_else(|| TrimError::unavailable("magnet service offline"))
        }
    }

    #[test]
    fn legacy_sends_one_parallel_batch() {
        let mut backend = LegacyBackend::new(Service {
            reply: Some(vec![Ok(()), Err("out of range".to_string())]),
            calls: vec![],
        });
        let applied = backend.apply(&batch(&[("BEND:A", 1.0), ("BEND:B", 9.0)]));
        assert_eq!(backend.service.calls.len(), 1);
        assert_eq!(backend.service.calls[0].1, vec![1.0, 9.0]);
        assert_eq!(applied.failures().count(), 1);
        assert_eq!(applied.succeeded().next().unwrap().device_name, "BEND:A");
    }

    #[test]
    fn legacy_call_failure_marks_every_device() {
        let mut backend = LegacyBackend::new(Service {
            reply: None,
            calls: vec![],
        });
        let applied = backend.apply(&batch(&[("BEND:A", 1.0), ("BEND:B", 2.0)]));
        assert_eq!(applied.failures().count(), 2);
    }

    #[test]
    fn legacy_short_status_list_marks_missing_devices() {
        let mut backend = LegacyBackend::new(Service {
            reply: Some(vec![Ok(())]),
            calls: vec![],
        });
        let applied = backend.apply(&batch(&[("BEND:A", 1.0), ("BEND:B", 2.0)]));
        let failed: Vec<_> = applied.failures().map(|o| o.device_name.as_str()).collect();
        assert_eq!(failed, vec!["BEND:B"]);
    }

    struct Slow(Duration);

    impl Actuator for Slow {
        fn backend(&self) -> BackendId {
            BackendId::Legacy
        }

        fn apply(&mut self, device_values: &[(String, f64)]) -> AppliedResult {
            std::thread::sleep(self.0);
            let mut applied = AppliedResult::new(BackendId::Legacy);
            for (name, value) in device_values {
                applied.outcomes.push(DeviceOutcome {
                    device_name: name.clone(),
                    value: *value,
                    result: Ok(()),
                });
            }
            applied
        }
    }

    #[test]
    fn deadline_expiry_is_a_partial_failure() {
        let mut slow =
            DeadlineActuator::new(Slow(Duration::from_millis(500)), Duration::from_millis(20));
        let applied = slow.apply(&batch(&[("BEND:A", 1.0)]));
        assert_eq!(applied.backend, BackendId::Legacy);
        assert_eq!(
            applied.outcomes[0].result,
            Err("deadline exceeded".to_string())
        );

        let mut fast = DeadlineActuator::new(Slow(Duration::ZERO), Duration::from_secs(5));
        assert!(fast.apply(&batch(&[("BEND:A", 1.0)])).is_complete());
    }
}
