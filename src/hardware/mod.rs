//! Bench hardware: serial transport, device controllers and simulated devices.
//!
//! Every controller owns a [`PortConfig`](transport::PortConfig) and a shared
//! [`Transport`](transport::Transport). A controller never keeps a link open between
//! operations; each operation opens its own session and the session closes when it is
//! dropped.

pub mod camera;
pub mod capabilities;
pub mod filter_wheel;
pub mod mock;
pub mod monochromator;
pub mod picoammeter;
pub mod shutter;
pub mod transport;

pub use camera::CommandCamera;
pub use capabilities::Camera;
pub use filter_wheel::{which_filter, FilterBreakpointTable, FilterWheelController};
pub use monochromator::{MonochromatorController, MonochromatorState};
pub use picoammeter::{PhotodiodeSample, PhotodiodeSeries, PicoammeterSampler};
pub use shutter::{ShutterController, ShutterState};
pub use transport::{PortConfig, SerialSession, SerialTransport, Transport};

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded polling for device status loops.
///
/// The instruments never time out on their own, so every loop that waits for a
/// status transition is capped at `max_attempts` polls spaced `interval` apart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PollPolicy {
    /// Delay before each poll
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// Maximum number of polls before giving up
    pub max_attempts: u32,
}

impl PollPolicy {
    /// Create a policy with the given spacing and attempt cap.
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts,
        }
    }

    /// A policy with no delay between polls, used with simulated devices.
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(Duration::ZERO, max_attempts)
    }
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            max_attempts: 600,
        }
    }
}

/// Sleep for `duration`, skipping the timer entirely when it is zero.
pub(crate) async fn pause(duration: Duration) {
    if !duration.is_zero() {
        tokio::time::sleep(duration).await;
    }
}
