//! Reference-profile publishing.
//!
//! The controller pushes every finalized reference profile through a
//! [`ProfilePublisher`]. [`ProfileSink`] is the in-process realization: a
//! cloneable sender feeding [`ProfileCommand`]s to whoever serves the shared
//! pub/sub channel (a PV server, a display, a test).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{Receiver, Sender};

use chrono::{DateTime, Local};

use crate::error::{Result, TrimError};

/// Sequence number assigned to each published profile.
pub type PublishSeq = u64;

/// A reference profile as seen by downstream consumers.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedProfile {
    pub seq: PublishSeq,
    pub channel: String,
    pub published_at: DateTime<Local>,
    pub values: Vec<f64>,
}

/// Messages delivered to the pub/sub server side.
#[derive(Debug, Clone)]
pub enum ProfileCommand {
    /// Replace the channel's value with a new profile vector.
    Publish(PublishedProfile),
    /// The publisher is going away; consumers should mark the channel stale.
    Disconnect { channel: String },
}

/// Pushes a finalized reference-profile vector to a shared channel.
pub trait ProfilePublisher: Send {
    fn publish(&mut self, values: &[f64]) -> Result<()>;
}

/// Convenience sender for the reference-profile channel.
#[derive(Clone)]
pub struct ProfileSink {
    channel: String,
    tx: Sender<ProfileCommand>,
}

impl ProfileSink {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Send a profile vector; fails once the receiving side is gone.
    pub fn send_profile<I>(&self, values: I) -> Result<PublishSeq>
    where
        I: Into<Vec<f64>>,
    {
        static NEXT_SEQ: AtomicU64 = AtomicU64::new(1);
        let seq = NEXT_SEQ.fetch_add(1, Ordering::Relaxed);
        self.tx
            .send(ProfileCommand::Publish(PublishedProfile {
                seq,
                channel: self.channel.clone(),
                published_at: Local::now(),
                values: values.into(),
            }))
            .map_err(|_| TrimError::Publish(format!("no subscriber on '{}'", self.channel)))?;
        Ok(seq)
    }

    pub fn disconnect(&self) {
        let _ = self.tx.send(ProfileCommand::Disconnect {
            channel: self.channel.clone(),
        });
    }
}

impl ProfilePublisher for ProfileSink {
    fn publish(&mut self, values: &[f64]) -> Result<()> {
        self.send_profile(values).map(|_| ())
    }
}

/// Create a new channel pair for profile publishing: `(ProfileSink, Receiver<ProfileCommand>)`.
pub fn channel_profile(channel: impl Into<String>) -> (ProfileSink, Receiver<ProfileCommand>) {
    let (tx, rx) = std::sync::mpsc::channel();
    (
        ProfileSink {
            channel: channel.into(),
            tx,
        },
        rx,
    )
}

/// Drain the receiver and return the most recent published profile.
pub fn latest_profile(rx: &Receiver<ProfileCommand>) -> Option<PublishedProfile> {
    rx.try_iter()
        .filter_map(|cmd| match cmd {
            ProfileCommand::Publish(p) => Some(p),
            ProfileCommand::Disconnect { .. } => None,
        })
        .last()
}
