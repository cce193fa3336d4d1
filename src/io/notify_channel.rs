//! Notification boundary towards the UI collaborator
//!
//! The poll loop never registers global observers. It reports through an
//! injected `Notifier`, and every notification happens after the diff pass it
//! describes. The bounded channel implementation never blocks the poll loop.

use crate::domain::types::{Badge, ColorClass, HangRecord, Warning};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Messages emitted by the poll loop
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Notification {
    /// New badge value and its colour
    Badge { visible_badge: Badge, color_class: ColorClass },
    /// Full contents of the recent hang history, oldest first
    RecentHangs { recent_hangs: Vec<HangRecord> },
    /// Smallest qualifying bucket lower bound; `None` until data qualifies
    ComputedThreshold { computed_threshold: Option<u64> },
    /// Current warning banner, `None` clears it
    Warning { warning: Option<Warning> },
    /// Counter and history were reset
    StateReset,
    /// Audible notification for a badge increase
    Blip { delta: u64 },
}

impl Notification {
    pub fn badge(badge: Badge) -> Self {
        Notification::Badge { visible_badge: badge, color_class: badge.color() }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Non-blocking notifier backed by a bounded mpsc channel
///
/// Clone this to share across producers. If the channel is full the
/// notification is dropped with a warning.
#[derive(Clone)]
pub struct ChannelNotifier {
    tx: mpsc::Sender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: mpsc::Sender<Notification>) -> Self {
        Self { tx }
    }
}

impl Notifier for ChannelNotifier {
    fn notify(&self, notification: Notification) {
        if let Err(e) = self.tx.try_send(notification) {
            warn!(error = %e, "notification_dropped");
        }
    }
}

/// Create a notification channel pair
pub fn create_notify_channel(buffer_size: usize) -> (ChannelNotifier, mpsc::Receiver<Notification>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (ChannelNotifier::new(tx), rx)
}

/// Clipboard collaborator for the copy command
pub trait Clipboard: Send + Sync {
    fn set_text(&self, text: &str) -> anyhow::Result<()>;
}

/// Clipboard that keeps the last copied text in memory
#[derive(Default)]
pub struct MemoryClipboard {
    contents: Mutex<Option<String>>,
}

impl MemoryClipboard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> Option<String> {
        self.contents.lock().clone()
    }
}

impl Clipboard for MemoryClipboard {
    fn set_text(&self, text: &str) -> anyhow::Result<()> {
        info!(bytes = %text.len(), "clipboard_set");
        *self.contents.lock() = Some(text.to_string());
        Ok(())
    }
}
