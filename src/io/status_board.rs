//! Latest-value view of the notification stream
//!
//! Stands in for the UI collaborator: keeps the most recent badge, history,
//! computed threshold and warning so the control server can serve them.

use crate::domain::types::{Badge, ColorClass, HangRecord, Warning};
use crate::io::notify_channel::{Notification, Notifier};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info};

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub visible_badge: Badge,
    pub color_class: ColorClass,
    pub recent_hangs: Vec<HangRecord>,
    pub computed_threshold: Option<u64>,
    pub warning: Option<Warning>,
    pub resets: u64,
    pub blips: u64,
    pub last_blip_delta: Option<u64>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            visible_badge: Badge::Unknown,
            color_class: Badge::Unknown.color(),
            recent_hangs: Vec::new(),
            computed_threshold: None,
            warning: None,
            resets: 0,
            blips: 0,
            last_blip_delta: None,
            updated_at: None,
        }
    }
}

#[derive(Default)]
pub struct StatusBoard {
    state: RwLock<StatusSnapshot>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.state.read().clone()
    }
}

impl Notifier for StatusBoard {
    fn notify(&self, notification: Notification) {
        let mut state = self.state.write();
        state.updated_at = Some(Utc::now());

        match notification {
            Notification::Badge { visible_badge, color_class } => {
                debug!(badge = %visible_badge, "status_badge");
                state.visible_badge = visible_badge;
                state.color_class = color_class;
            }
            Notification::RecentHangs { recent_hangs } => {
                state.recent_hangs = recent_hangs;
            }
            Notification::ComputedThreshold { computed_threshold } => {
                state.computed_threshold = computed_threshold;
            }
            Notification::Warning { warning } => {
                state.warning = warning;
            }
            Notification::StateReset => {
                state.resets += 1;
            }
            Notification::Blip { delta } => {
                info!(delta = %delta, "hang_blip");
                state.blips += 1;
                state.last_blip_delta = Some(delta);
            }
        }
    }
}
