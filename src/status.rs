//! Operator status channel.
//!
//! Every outcome of the controller (successes, rejections and failures of
//! remote calls) ends up here as a timestamped [`StatusMessage`]. Each message
//! carries a set of [`StatusKind`] flags so one message can match several
//! categories (an undo failure is both `UNDO` and `ACTUATION_FAILURE`).
//! Subscribers pick categories with a [`StatusFilter`], an OR mask.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use tracing::{info, warn};

use crate::data::trim::BackendId;

// ─────────────────────────────────────────────────────────────────────────────
// StatusKind – bitflags
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatusKind(pub u32);

impl StatusKind {
    // ── Transitions ─────────────────────────────────────────────────────
    /// A trim was applied (possibly partially).
    pub const TRIM: Self = Self(1 << 0);
    /// An undo was applied (possibly partially).
    pub const UNDO: Self = Self(1 << 1);
    /// Trim skipped because the set points are already at the target.
    pub const ALREADY_SET: Self = Self(1 << 2);
    /// The reference profile was recomputed.
    pub const REFERENCE: Self = Self(1 << 3);
    /// A fresh dataset was fetched.
    pub const FETCH: Self = Self(1 << 4);
    /// An audit record was written.
    pub const AUDIT_WRITTEN: Self = Self(1 << 5);
    /// The reference profile was published.
    pub const PUBLISHED: Self = Self(1 << 6);

    // ── Failures ────────────────────────────────────────────────────────
    /// Remote data channel unreachable or malformed.
    pub const UNAVAILABLE: Self = Self(1 << 8);
    /// Audit record could not be written; trim aborted.
    pub const AUDIT_FAILURE: Self = Self(1 << 9);
    /// Request rejected before any actuation.
    pub const CONFIGURATION: Self = Self(1 << 10);
    /// One device failed to apply.
    pub const ACTUATION_FAILURE: Self = Self(1 << 11);
    /// Publishing the reference profile failed.
    pub const PUBLISH_FAILURE: Self = Self(1 << 12);

    /// Every failure category.
    pub const FAILURES: Self = Self(
        Self::UNAVAILABLE.0
            | Self::AUDIT_FAILURE.0
            | Self::CONFIGURATION.0
            | Self::ACTUATION_FAILURE.0
            | Self::PUBLISH_FAILURE.0,
    );

    pub const ALL: Self = Self(u32::MAX);

    #[inline]
    pub const fn contains(self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }

    #[inline]
    pub const fn intersects(self, other: Self) -> bool {
        (self.0 & other.0) != 0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn is_failure(self) -> bool {
        self.intersects(Self::FAILURES)
    }
}

impl std::ops::BitOr for StatusKind {
    type Output = Self;
    #[inline]
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for StatusKind {
    #[inline]
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl std::fmt::Display for StatusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "EMPTY");
        }
        if *self == StatusKind::ALL {
            return write!(f, "ALL");
        }
        let pairs: &[(StatusKind, &str)] = &[
            (StatusKind::TRIM, "TRIM"),
            (StatusKind::UNDO, "UNDO"),
            (StatusKind::ALREADY_SET, "ALREADY_SET"),
            (StatusKind::REFERENCE, "REFERENCE"),
            (StatusKind::FETCH, "FETCH"),
            (StatusKind::AUDIT_WRITTEN, "AUDIT_WRITTEN"),
            (StatusKind::PUBLISHED, "PUBLISHED"),
            (StatusKind::UNAVAILABLE, "UNAVAILABLE"),
            (StatusKind::AUDIT_FAILURE, "AUDIT_FAILURE"),
            (StatusKind::CONFIGURATION, "CONFIGURATION"),
            (StatusKind::ACTUATION_FAILURE, "ACTUATION_FAILURE"),
            (StatusKind::PUBLISH_FAILURE, "PUBLISH_FAILURE"),
        ];
        let mut names = Vec::new();
        let mut known_bits = 0u32;
        for (kind, name) in pairs {
            known_bits |= kind.0;
            if self.contains(*kind) {
                names.push((*name).to_string());
            }
        }
        let extra = self.0 & !known_bits;
        if extra != 0 {
            names.push(format!("0x{:x}", extra));
        }
        write!(f, "{}", names.join("|"))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StatusMessage / StatusFilter
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct StatusMessage {
    pub kinds: StatusKind,
    /// Set by the channel on emit.
    pub timestamp: DateTime<Local>,
    pub text: String,
    /// Device the message is about, for per-device failures.
    pub device: Option<String>,
    pub backend: Option<BackendId>,
}

impl StatusMessage {
    pub fn new(kinds: StatusKind, text: impl Into<String>) -> Self {
        Self {
            kinds,
            timestamp: Local::now(),
            text: text.into(),
            device: None,
            backend: None,
        }
    }

    pub fn for_device(mut self, device: impl Into<String>, backend: BackendId) -> Self {
        self.device = Some(device.into());
        self.backend = Some(backend);
        self
    }

    /// `"[HH:MM:SS] text"`, the form shown in the operator's status box.
    pub fn line(&self) -> String {
        format!("[{}] {}", self.timestamp.format("%H:%M:%S"), self.text)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StatusFilter {
    pub mask: StatusKind,
}

impl StatusFilter {
    pub const fn all() -> Self {
        Self {
            mask: StatusKind::ALL,
        }
    }

    pub const fn only(mask: StatusKind) -> Self {
        Self { mask }
    }

    #[inline]
    pub fn matches(&self, message: &StatusMessage) -> bool {
        message.kinds.intersects(self.mask)
    }
}

impl Default for StatusFilter {
    fn default() -> Self {
        Self::all()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// StatusChannel
// ─────────────────────────────────────────────────────────────────────────────

struct Subscriber {
    filter: StatusFilter,
    sender: Sender<StatusMessage>,
}

struct StatusInner {
    subscribers: Vec<Subscriber>,
    history: VecDeque<StatusMessage>,
    capacity: usize,
}

/// Distributes status messages to subscribers and keeps a bounded history.
#[derive(Clone)]
pub struct StatusChannel {
    inner: Arc<Mutex<StatusInner>>,
}

impl StatusChannel {
    pub const DEFAULT_CAPACITY: usize = 500;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StatusInner {
                subscribers: Vec::new(),
                history: VecDeque::new(),
                capacity: capacity.max(1),
            })),
        }
    }

    // A panicking subscriber must not take the status channel down with it.
    fn lock(&self) -> MutexGuard<'_, StatusInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn subscribe(&self, filter: StatusFilter) -> Receiver<StatusMessage> {
        let (tx, rx) = std::sync::mpsc::channel();
        self.lock().subscribers.push(Subscriber { filter, sender: tx });
        rx
    }

    pub fn subscribe_all(&self) -> Receiver<StatusMessage> {
        self.subscribe(StatusFilter::all())
    }

    /// Timestamp, log, record and fan out a message.
    pub fn emit(&self, mut message: StatusMessage) {
        message.timestamp = Local::now();
        if message.kinds.is_failure() {
            warn!(kinds = %message.kinds, device = ?message.device, "{}", message.text);
        } else {
            info!(kinds = %message.kinds, "{}", message.text);
        }
        let mut inner = self.lock();
        inner.subscribers.retain(|sub| {
            if sub.filter.matches(&message) {
                sub.sender.send(message.clone()).is_ok()
            } else {
                true
            }
        });
        if inner.history.len() == inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(message);
    }

    pub fn post(&self, kinds: StatusKind, text: impl Into<String>) {
        self.emit(StatusMessage::new(kinds, text));
    }

    /// Recorded messages, oldest first.
    pub fn history(&self) -> Vec<StatusMessage> {
        self.lock().history.iter().cloned().collect()
    }

    pub fn latest(&self) -> Option<StatusMessage> {
        self.lock().history.back().cloned()
    }
}

impl Default for StatusChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_combine_and_classify() {
        let k = StatusKind::UNDO | StatusKind::ACTUATION_FAILURE;
        assert!(k.contains(StatusKind::UNDO));
        assert!(k.is_failure());
        assert!(!StatusKind::TRIM.is_failure());
        assert_eq!(format!("{k}"), "UNDO|ACTUATION_FAILURE");
        assert_eq!(format!("{}", StatusKind::ALL), "ALL");
        assert!(format!("{}", StatusKind(1 << 30)).starts_with("0x"));
    }

    #[test]
    fn filtered_subscribers_receive_matching_messages() {
        let status = StatusChannel::new();
        let all = status.subscribe_all();
        let failures = status.subscribe(StatusFilter::only(StatusKind::FAILURES));

        status.post(StatusKind::TRIM, "trim applied");
        status.emit(
            StatusMessage::new(StatusKind::TRIM | StatusKind::ACTUATION_FAILURE, "D1 failed")
                .for_device("D1", BackendId::Modern),
        );

        assert_eq!(all.try_iter().count(), 2);
        let got: Vec<_> = failures.try_iter().collect();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].device.as_deref(), Some("D1"));
    }

    #[test]
    fn history_is_bounded() {
        let status = StatusChannel::with_capacity(2);
        status.post(StatusKind::FETCH, "one");
        status.post(StatusKind::FETCH, "two");
        status.post(StatusKind::FETCH, "three");
        let texts: Vec<_> = status.history().into_iter().map(|m| m.text).collect();
        assert_eq!(texts, vec!["two", "three"]);
        assert!(status.latest().unwrap().line().ends_with("] three"));
    }

    #[test]
    fn dropped_receiver_is_pruned() {
        let status = StatusChannel::new();
        let rx1 = status.subscribe_all();
        let rx2 = status.subscribe_all();
        drop(rx1);
        status.post(StatusKind::FETCH, "a");
        status.post(StatusKind::FETCH, "b");
        assert_eq!(rx2.try_iter().count(), 2);
        assert_eq!(status.lock().subscribers.len(), 1);
    }
}
