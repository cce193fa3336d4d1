//! Services - hang detection state and orchestration
//!
//! - `threshold` - Qualifying counts and the monotonic running total
//! - `hang_diff` - Per-stack diffing into a bounded recent-hang history
//! - `counter` - Visible badge with clear baseline and observed correction
//! - `liveness` - Expiry of subordinate producers that stopped reporting
//! - `subordinate_cache` - Short-lived cache for subordinate bundles
//! - `poll_loop` - Self-scheduling pass driver and command handling

pub mod counter;
pub mod hang_diff;
pub mod liveness;
pub mod poll_loop;
pub mod subordinate_cache;
pub mod threshold;

// Re-export commonly used types
pub use counter::{CounterStateMachine, CounterUpdate};
pub use hang_diff::{DiffPass, HangDiffEngine, DEFAULT_HISTORY_CAPACITY};
pub use liveness::{Liveness, ABSENT_PASSES_BEFORE_EXPIRY};
pub use poll_loop::{command_channel, Command, EngineHandle, PollLoop, PollOutcome, PollState, Settings};
pub use subordinate_cache::SubordinateCache;
pub use threshold::{compute_qualifying, Observation, Qualifying, QualifyingTotals};
