//! Uniblitz VCM-D1 shutter driver.
//!
//! The driver takes single ASCII bytes over serial (`@` opens, `A` closes) and never
//! answers, so the controller only knows the state it last commanded.

use crate::error::AppResult;
use crate::hardware::transport::{PortConfig, Transport};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

const OPEN: &[u8] = b"@";
const CLOSE: &[u8] = b"A";

/// Last commanded shutter state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShutterState {
    /// No command sent yet
    Unknown,
    /// Open was the last command
    Open,
    /// Close was the last command
    Closed,
}

impl fmt::Display for ShutterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutterState::Unknown => write!(f, "Unknown"),
            ShutterState::Open => write!(f, "Open"),
            ShutterState::Closed => write!(f, "Closed"),
        }
    }
}

/// Driver for the VCM-D1 shutter controller.
pub struct ShutterController {
    transport: Arc<dyn Transport>,
    port: PortConfig,
    state: ShutterState,
}

impl ShutterController {
    /// Create a controller. No port is opened until the first command.
    pub fn new(transport: Arc<dyn Transport>, port: PortConfig) -> Self {
        Self {
            transport,
            port,
            state: ShutterState::Unknown,
        }
    }

    /// Last commanded state
    pub fn state(&self) -> ShutterState {
        self.state
    }

    /// Open the shutter
    pub async fn open(&mut self) -> AppResult<()> {
        self.command(OPEN).await?;
        self.state = ShutterState::Open;
        debug!(port = %self.port.port, "shutter open");
        Ok(())
    }

    /// Close the shutter
    pub async fn close(&mut self) -> AppResult<()> {
        self.command(CLOSE).await?;
        self.state = ShutterState::Closed;
        debug!(port = %self.port.port, "shutter closed");
        Ok(())
    }

    async fn command(&self, byte: &[u8]) -> AppResult<()> {
        let mut session = self.transport.open(&self.port).await?;
        session.write(byte).await
    }
}
