//! IO modules - boundaries to the host and the user
//!
//! - `source` - Histogram source trait and the scriptable in-memory source
//! - `snapshot_source` - File-backed source (main snapshot + subordinate bundles)
//! - `notify_channel` - Notifications, notifier implementations, clipboard
//! - `status_board` - Latest-value view of the notification stream
//! - `control_server` - HTTP status, commands and Prometheus metrics

pub mod control_server;
pub mod notify_channel;
pub mod snapshot_source;
pub mod source;
pub mod status_board;

// Re-export commonly used types
pub use control_server::{start_control_server, ControlContext};
pub use notify_channel::{
    create_notify_channel, ChannelNotifier, Clipboard, MemoryClipboard, Notification,
    Notifier,
};
pub use snapshot_source::SnapshotSource;
pub use source::{HistogramSource, InMemorySource};
pub use status_board::{StatusBoard, StatusSnapshot};
