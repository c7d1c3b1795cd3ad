//! Trim request construction and backend classification.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::data::device::{DatasetSnapshot, RegionSet, SetPoints};
use crate::error::{Result, TrimError};

/// Which actuation path a device is driven through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackendId {
    /// Per-device channel writes.
    Modern,
    /// Batched call to the external magnet-control service.
    Legacy,
}

impl fmt::Display for BackendId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendId::Modern => f.write_str("modern"),
            BackendId::Legacy => f.write_str("legacy"),
        }
    }
}

/// Routes a device name to a backend. Implementations must be pure: the
/// same name always yields the same backend.
pub trait BackendClassifier: Send {
    fn classify(&self, device_name: &str) -> BackendId;
}

impl<F> BackendClassifier for F
where
    F: Fn(&str) -> BackendId + Send,
{
    fn classify(&self, device_name: &str) -> BackendId {
        self(device_name)
    }
}

/// Names starting with any of the legacy prefixes go to the legacy backend.
#[derive(Debug, Clone)]
pub struct PrefixClassifier {
    legacy_prefixes: Vec<String>,
}

impl PrefixClassifier {
    pub fn new<I, S>(legacy_prefixes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            legacy_prefixes: legacy_prefixes.into_iter().map(Into::into).collect(),
        }
    }
}

impl BackendClassifier for PrefixClassifier {
    fn classify(&self, device_name: &str) -> BackendId {
        if self
            .legacy_prefixes
            .iter()
            .any(|p| device_name.starts_with(p.as_str()))
        {
            BackendId::Legacy
        } else {
            BackendId::Modern
        }
    }
}

/// Operator's scale-source selection for a trim.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrimSource {
    /// Scale to the design momentum profile.
    Design,
    /// Scale to the extant (live) momentum profile.
    #[default]
    Extant,
}

/// Where per-device values come from when building a request.
#[derive(Debug, Clone, Copy)]
pub enum ValueSource<'a> {
    Design,
    Extant,
    /// Restore from a backup vector; `None` means no backup exists.
    Undo(Option<&'a SetPoints>),
}

impl From<TrimSource> for ValueSource<'_> {
    fn from(src: TrimSource) -> Self {
        match src {
            TrimSource::Design => ValueSource::Design,
            TrimSource::Extant => ValueSource::Extant,
        }
    }
}

/// Two disjoint, ordered command lists, one per backend.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrimRequest {
    pub modern: Vec<(String, f64)>,
    pub legacy: Vec<(String, f64)>,
}

impl TrimRequest {
    pub fn len(&self) -> usize {
        self.modern.len() + self.legacy.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modern.is_empty() && self.legacy.is_empty()
    }

    pub fn for_backend(&self, backend: BackendId) -> &[(String, f64)] {
        match backend {
            BackendId::Modern => &self.modern,
            BackendId::Legacy => &self.legacy,
        }
    }

    /// All entries, modern first.
    pub fn iter(&self) -> impl Iterator<Item = &(String, f64)> {
        self.modern.iter().chain(self.legacy.iter())
    }

    /// The commanded vector that results from applying this request on top
    /// of `prior`.
    pub fn commanded_after(&self, prior: &SetPoints) -> SetPoints {
        let mut next = prior.clone();
        for (name, value) in self.iter() {
            next.insert(name.clone(), *value);
        }
        next
    }
}

/// Build the trim request for every device in an enabled region.
pub fn build_request(
    snapshot: &DatasetSnapshot,
    enabled: &RegionSet,
    source: ValueSource<'_>,
    classifier: &dyn BackendClassifier,
) -> Result<TrimRequest> {
    if let ValueSource::Undo(None) = source {
        return Err(TrimError::configuration(
            "undo requested but no backup set points exist",
        ));
    }

    let mut request = TrimRequest::default();
    for dev in snapshot.in_regions(enabled) {
        let value = match source {
            ValueSource::Design => dev.design_set_point,
            ValueSource::Extant => dev.extant_set_point,
            ValueSource::Undo(Some(backup)) => {
                *backup.get(&dev.device_name).ok_or_else(|| {
                    TrimError::unavailable(format!(
                        "backup has no set point for '{}'",
                        dev.device_name
                    ))
                })?
            }
            ValueSource::Undo(None) => unreachable!("rejected above"),
        };
        let entry = (dev.device_name.clone(), value);
        match classifier.classify(&dev.device_name) {
            BackendId::Modern => request.modern.push(entry),
            BackendId::Legacy => request.legacy.push(entry),
        }
    }
    Ok(request)
}
