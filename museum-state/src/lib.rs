//! # museum-state
//!
//! Runtime bookkeeping that sits beside the show engine but never drives it:
//!
//! - [`DeviceRegistry`] tracks which field devices are alive, based on the
//!   `devices/<id>/status` stream and a staleness window.
//! - [`FeedbackTracker`] correlates published commands with the device
//!   acknowledgements that should follow them and counts timeouts.
//!
//! Both are safe to share across tasks. Time is always passed in explicitly as
//! a `tokio::time::Instant` so both components can be driven from paused-time
//! tests; the [`Sweeper`] runs their periodic expiry in the background.

pub mod config;
pub mod devices;
pub mod error;
pub mod feedback;
pub mod sweeper;

pub use config::{RegistryConfig, TrackerConfig};
pub use devices::{
    Device, DeviceRegistry, DeviceSummary, PresenceChange, PresenceReason, PresenceStatus,
};
pub use error::{Result, StateError};
pub use feedback::{
    FeedbackOutcome, FeedbackResolution, FeedbackStats, FeedbackTimeout, FeedbackTracker,
    PendingFeedback,
};
pub use sweeper::Sweeper;
