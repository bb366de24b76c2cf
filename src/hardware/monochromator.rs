//! McPherson 789A-4 scan controller driver
//!
//! Reference: McPherson 789A-4 Digital Scan Controller manual
//!
//! Protocol Overview:
//! - Format: single-letter ASCII commands followed by `" \r"`
//! - Baud: 9600, 8N1, XON/XOFF
//! - Replies: echoed command plus value, terminated by LF
//! - Motion: relative microstep moves (`+N` / `-N`), 9000 microsteps per nm
//! - Status: `]` limit switch status, `^` movement status
//!
//! # Homing
//!
//! The grating position is only known relative to a mechanical home flag at
//! 631.26 nm. Homing runs a coarse constant-velocity approach until the limit switch
//! reports the carriage above home, then removes backlash (down 3 revolutions, up 2)
//! and finds the flag edge with the high accuracy circuit enabled.
//!
//! # Important Notes
//!
//! - Absolute moves always go through home. `go_to_from` trusts the caller's idea of
//!   the current wavelength and does not re-verify it with the hardware.
//! - A limit or movement status of 999 means the reply could not be read. The
//!   controller stops and the operation fails with [`BenchError::DeviceStatus`].
//!
//! # Example Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use spectral_bench::hardware::monochromator::{MonochromatorController, MonochromatorTiming};
//! use spectral_bench::hardware::transport::{PortConfig, SerialTransport};
//!
//! # async fn demo() -> spectral_bench::error::AppResult<()> {
//! let mut mono = MonochromatorController::new(
//!     Arc::new(SerialTransport),
//!     PortConfig::mcpherson("/dev/ttyUSB0"),
//!     MonochromatorTiming::default(),
//! );
//! mono.go_to_from_home(250.0).await?;
//! mono.go_to_from(250.0, 260.0).await?;
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, BenchError};
use crate::hardware::transport::{query_line, PortConfig, Transport};
use crate::hardware::{pause, PollPolicy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Wavelength of the home flag
pub const HOME_WAVELENGTH_NM: f64 = 631.26;

/// Microsteps per nanometre of grating travel
pub const MICROSTEPS_PER_NM: f64 = 9000.0;

/// Range accepted for moves on this bench
pub const SAFE_RANGE_NM: RangeInclusive<f64> = 100.0..=900.0;

/// Mechanical range of the scan controller
pub const DEVICE_RANGE_NM: RangeInclusive<f64> = 0.1..=999.9;

/// Linear dispersion of the monochromator at the exit slit, nm per mm
pub const DISPERSION_NM_PER_MM: f64 = 1.24;

/// Status value reported when a status reply cannot be read
pub const STATUS_UNREADABLE: u32 = 999;

const KICK: &str = "+72000 \r";
const BACKLASH_DOWN: &str = "-108000 \r";
const BACKLASH_UP: &str = "+72000 \r";
const ENABLE_HOME_CIRCUIT: &str = "A8 \r";
const HIGH_ACCURACY_CIRCUIT: &str = "A24 \r";
const DISABLE_HOME_CIRCUIT: &str = "A0 \r";
const COARSE_APPROACH: &str = "m+23000 \r";
const FIND_EDGE: &str = "F4500,0 \r";
const STOP: &str = "@ \r";
const LIMIT_STATUS: &str = "] \r";
const MOVEMENT_STATUS: &str = "^ \r";

/// Controller lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonochromatorState {
    /// Homed and stopped at the home flag
    AtHome,
    /// A relative move is in progress
    Moving,
    /// Stopped at a known wavelength
    Idle,
    /// Homing sequence running
    Homing,
    /// Last operation failed; position is unknown
    Error,
}

impl fmt::Display for MonochromatorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MonochromatorState::AtHome => write!(f, "AtHome"),
            MonochromatorState::Moving => write!(f, "Moving"),
            MonochromatorState::Idle => write!(f, "Idle"),
            MonochromatorState::Homing => write!(f, "Homing"),
            MonochromatorState::Error => write!(f, "Error"),
        }
    }
}

/// Limit switch status reported by `]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitStatus {
    /// 0: carriage above home
    AboveHome,
    /// 2: above home and moving
    AboveHomeMoving,
    /// 32: carriage below home
    BelowHome,
    /// 34: below home and moving
    BelowHomeMoving,
    /// 999: status could not be read
    Unreadable,
    /// Any other code
    Other(u32),
}

impl LimitStatus {
    /// Decode a raw status code
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => LimitStatus::AboveHome,
            2 => LimitStatus::AboveHomeMoving,
            32 => LimitStatus::BelowHome,
            34 => LimitStatus::BelowHomeMoving,
            STATUS_UNREADABLE => LimitStatus::Unreadable,
            other => LimitStatus::Other(other),
        }
    }

    /// Raw status code
    pub fn code(&self) -> u32 {
        match self {
            LimitStatus::AboveHome => 0,
            LimitStatus::AboveHomeMoving => 2,
            LimitStatus::BelowHome => 32,
            LimitStatus::BelowHomeMoving => 34,
            LimitStatus::Unreadable => STATUS_UNREADABLE,
            LimitStatus::Other(code) => *code,
        }
    }

    /// Codes below 32 mean the carriage has passed the home flag.
    pub fn is_above_home(&self) -> bool {
        self.code() < 32
    }
}

/// Movement status reported by `^`.
///
/// 0 means stopped; 1, 2, 16 and 33 are the motion codes the controller uses
/// (moving, high constant velocity, slewing ramp complete, moving).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MovementStatus {
    /// 0: no motion
    Stopped,
    /// Any non-zero motion code
    Moving(u32),
    /// 999: status could not be read
    Unreadable,
}

impl MovementStatus {
    /// Decode a raw status code
    pub fn from_code(code: u32) -> Self {
        match code {
            0 => MovementStatus::Stopped,
            STATUS_UNREADABLE => MovementStatus::Unreadable,
            other => MovementStatus::Moving(other),
        }
    }
}

/// Delays used by the homing and move sequences.
///
/// Defaults are the settle times the controller needs on the bench; tests use
/// [`MonochromatorTiming::immediate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonochromatorTiming {
    /// Spacing and cap for limit and movement status polls
    #[serde(default)]
    pub poll: PollPolicy,
    /// Pause after stopping at the home flag
    #[serde(default = "default_stop_settle", with = "humantime_serde")]
    pub stop_settle: Duration,
    /// Pause after the downward backlash move
    #[serde(default = "default_backlash_settle", with = "humantime_serde")]
    pub backlash_settle: Duration,
    /// Pause after the upward return move
    #[serde(default = "default_return_settle", with = "humantime_serde")]
    pub return_settle: Duration,
    /// Time allowed for the edge-find pass
    #[serde(default = "default_edge_find", with = "humantime_serde")]
    pub edge_find: Duration,
}

fn default_stop_settle() -> Duration {
    Duration::from_millis(800)
}

fn default_backlash_settle() -> Duration {
    Duration::from_secs(3)
}

fn default_return_settle() -> Duration {
    Duration::from_secs(2)
}

fn default_edge_find() -> Duration {
    Duration::from_secs(12)
}

impl Default for MonochromatorTiming {
    fn default() -> Self {
        Self {
            poll: PollPolicy::default(),
            stop_settle: default_stop_settle(),
            backlash_settle: default_backlash_settle(),
            return_settle: default_return_settle(),
            edge_find: default_edge_find(),
        }
    }
}

impl MonochromatorTiming {
    /// No delays, `max_attempts` polls. For simulated hardware.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            poll: PollPolicy::immediate(max_attempts),
            stop_settle: Duration::ZERO,
            backlash_settle: Duration::ZERO,
            return_settle: Duration::ZERO,
            edge_find: Duration::ZERO,
        }
    }
}

/// Convert a wavelength difference to a whole number of microsteps.
///
/// Halves round to the nearest even step.
pub fn microsteps_for(delta_nm: f64) -> i64 {
    (delta_nm * MICROSTEPS_PER_NM).round_ties_even() as i64
}

/// Wavelength difference covered by `steps` microsteps
pub fn wavelength_for(steps: i64) -> f64 {
    steps as f64 / MICROSTEPS_PER_NM
}

/// Relative move command. Positive counts carry an explicit `+`.
pub fn step_command(steps: i64) -> String {
    if steps > 0 {
        format!("+{steps} \r")
    } else {
        format!("{steps} \r")
    }
}

/// Reject wavelengths outside the bench's safe range.
pub fn validate_wavelength(wavelength_nm: f64) -> AppResult<()> {
    if !wavelength_nm.is_finite() || !SAFE_RANGE_NM.contains(&wavelength_nm) {
        return Err(BenchError::Range(format!(
            "wavelength {wavelength_nm} nm is outside {}-{} nm",
            SAFE_RANGE_NM.start(),
            SAFE_RANGE_NM.end()
        )));
    }
    Ok(())
}

/// Slit width in mm that gives `bandpass_nm` of spectral bandpass.
pub fn slit_width_for_bandpass(bandpass_nm: f64) -> f64 {
    bandpass_nm / DISPERSION_NM_PER_MM
}

/// Parse a status reply such as `"]    0"` into its numeric code.
///
/// The controller echoes the command character before the value.
fn parse_status(reply: &str, echo: char) -> Option<u32> {
    reply.trim().trim_start_matches(echo).trim().parse().ok()
}

/// Driver for the 789A-4 scan controller.
pub struct MonochromatorController {
    transport: Arc<dyn Transport>,
    port: PortConfig,
    timing: MonochromatorTiming,
    state: MonochromatorState,
    wavelength: Option<f64>,
}

impl MonochromatorController {
    /// Create a controller. No port is opened until the first operation.
    pub fn new(transport: Arc<dyn Transport>, port: PortConfig, timing: MonochromatorTiming) -> Self {
        Self {
            transport,
            port,
            timing,
            state: MonochromatorState::Idle,
            wavelength: None,
        }
    }

    /// Current controller state
    pub fn state(&self) -> MonochromatorState {
        self.state
    }

    /// Last wavelength reached by a completed move or homing, if any
    pub fn wavelength(&self) -> Option<f64> {
        self.wavelength
    }

    /// Port settings
    pub fn port(&self) -> &PortConfig {
        &self.port
    }

    /// Send a command that the controller does not answer.
    async fn send(&self, command: &str) -> AppResult<()> {
        let mut session = self.transport.open(&self.port).await?;
        session.write(command.as_bytes()).await
    }

    /// Send a command and read back its echo line.
    async fn exchange(&self, command: &str) -> AppResult<String> {
        let mut session = self.transport.open(&self.port).await?;
        query_line(session.as_mut(), command.as_bytes(), b'\n').await
    }

    /// Read the limit switch status.
    ///
    /// A reply that does not parse is reported as [`LimitStatus::Unreadable`].
    pub async fn limit_status(&self) -> AppResult<LimitStatus> {
        pause(self.timing.poll.interval).await;
        let reply = self.exchange(LIMIT_STATUS).await?;
        let status = match parse_status(&reply, ']') {
            Some(code) => LimitStatus::from_code(code),
            None => {
                warn!(port = %self.port.port, reply = %reply, "limit status could not be read");
                LimitStatus::Unreadable
            }
        };
        debug!(?status, "limit status");
        Ok(status)
    }

    /// Read the movement status.
    pub async fn movement_status(&self) -> AppResult<MovementStatus> {
        pause(self.timing.poll.interval).await;
        let reply = self.exchange(MOVEMENT_STATUS).await?;
        let status = match parse_status(&reply, '^') {
            Some(code) => MovementStatus::from_code(code),
            None => {
                warn!(port = %self.port.port, reply = %reply, "movement status could not be read");
                MovementStatus::Unreadable
            }
        };
        debug!(?status, "movement status");
        Ok(status)
    }

    /// Stop all motion.
    pub async fn stop(&self) -> AppResult<()> {
        self.exchange(STOP).await.map(|_| ())
    }

    fn unreadable(&self, operation: &str) -> BenchError {
        BenchError::DeviceStatus {
            port: self.port.port.clone(),
            operation: operation.to_string(),
            status: format!("status {STATUS_UNREADABLE} (unreadable)"),
        }
    }

    fn poll_limit(&self, operation: &str) -> BenchError {
        BenchError::PollLimitExceeded {
            port: self.port.port.clone(),
            operation: operation.to_string(),
            attempts: self.timing.poll.max_attempts,
        }
    }

    /// Drive the grating to the home flag.
    ///
    /// On success the controller is [`MonochromatorState::AtHome`] at
    /// [`HOME_WAVELENGTH_NM`]; on failure it is [`MonochromatorState::Error`].
    #[instrument(skip(self), fields(port = %self.port.port))]
    pub async fn home(&mut self) -> AppResult<()> {
        self.state = MonochromatorState::Homing;
        self.wavelength = None;
        match self.run_home_sequence().await {
            Ok(()) => {
                self.state = MonochromatorState::AtHome;
                self.wavelength = Some(HOME_WAVELENGTH_NM);
                info!("homing complete");
                Ok(())
            }
            Err(e) => {
                self.state = MonochromatorState::Error;
                Err(e)
            }
        }
    }

    async fn run_home_sequence(&self) -> AppResult<()> {
        // Two revolutions up first; starting exactly on the flag otherwise never
        // produces a status transition.
        self.exchange(KICK).await?;
        self.send(ENABLE_HOME_CIRCUIT).await?;

        match self.limit_status().await? {
            LimitStatus::Unreadable => return Err(self.unreadable("home")),
            status if status.is_above_home() => {
                debug!(code = status.code(), "already above home, skipping coarse approach");
            }
            status => {
                debug!(code = status.code(), "below home, starting coarse approach");
                self.coarse_approach().await?;
            }
        }

        pause(self.timing.stop_settle).await;
        self.exchange(BACKLASH_DOWN).await?;
        pause(self.timing.backlash_settle).await;
        self.exchange(BACKLASH_UP).await?;
        pause(self.timing.return_settle).await;
        self.exchange(HIGH_ACCURACY_CIRCUIT).await?;
        self.exchange(FIND_EDGE).await?;
        pause(self.timing.edge_find).await;
        self.stop().await?;
        self.exchange(DISABLE_HOME_CIRCUIT).await?;
        Ok(())
    }

    async fn coarse_approach(&self) -> AppResult<()> {
        self.exchange(COARSE_APPROACH).await?;
        for attempt in 1..=self.timing.poll.max_attempts {
            match self.limit_status().await? {
                LimitStatus::Unreadable => {
                    self.stop_best_effort().await;
                    return Err(self.unreadable("home"));
                }
                status if status.is_above_home() => {
                    debug!(attempt, "passed home flag");
                    return self.stop().await;
                }
                _ => {}
            }
        }
        self.stop_best_effort().await;
        Err(self.poll_limit("home coarse approach"))
    }

    async fn stop_best_effort(&self) {
        if let Err(e) = self.stop().await {
            warn!(error = %e, "stop command failed");
        }
    }

    /// Home, then move to `wavelength_nm`.
    #[instrument(skip(self), fields(port = %self.port.port))]
    pub async fn go_to_from_home(&mut self, wavelength_nm: f64) -> AppResult<()> {
        validate_wavelength(wavelength_nm)?;
        self.home().await?;
        self.move_relative(HOME_WAVELENGTH_NM, wavelength_nm).await
    }

    /// Move from `start_nm` to `end_nm` without homing.
    ///
    /// `start_nm` must be where the grating actually is. It is not checked against the
    /// hardware; pass the wavelength of the last completed move.
    #[instrument(skip(self), fields(port = %self.port.port))]
    pub async fn go_to_from(&mut self, start_nm: f64, end_nm: f64) -> AppResult<()> {
        validate_wavelength(end_nm)?;
        self.move_relative(start_nm, end_nm).await
    }

    async fn move_relative(&mut self, start_nm: f64, end_nm: f64) -> AppResult<()> {
        let steps = microsteps_for(end_nm - start_nm);
        info!(start_nm, end_nm, steps, "moving grating");

        self.state = MonochromatorState::Moving;
        self.wavelength = None;
        if let Err(e) = self.send(&step_command(steps)).await {
            self.state = MonochromatorState::Error;
            return Err(e);
        }

        match self.wait_for_stop().await {
            Ok(()) => {
                self.state = MonochromatorState::Idle;
                self.wavelength = Some(end_nm);
                Ok(())
            }
            Err(e) => {
                self.state = MonochromatorState::Error;
                Err(e)
            }
        }
    }

    async fn wait_for_stop(&self) -> AppResult<()> {
        for attempt in 1..=self.timing.poll.max_attempts {
            match self.movement_status().await? {
                MovementStatus::Stopped => {
                    debug!(attempt, "movement complete");
                    // Explicit stop as a safeguard before the next command.
                    return self.stop().await;
                }
                MovementStatus::Unreadable => {
                    self.stop_best_effort().await;
                    return Err(self.unreadable("move"));
                }
                MovementStatus::Moving(code) => debug!(attempt, code, "still moving"),
            }
        }
        self.stop_best_effort().await;
        Err(self.poll_limit("move"))
    }

    /// Wake the controller's command interpreter (bare carriage return).
    pub async fn initialize(&self) -> AppResult<String> {
        self.exchange(" \r").await
    }

    /// Ramp speed, start velocity and scan velocity as reported by `X`
    pub async fn parameters(&self) -> AppResult<String> {
        self.exchange("X \r").await
    }

    /// Set the ramp speed (`K`)
    pub async fn set_ramp_speed(&self, value: u32) -> AppResult<String> {
        self.exchange(&format!("K{value}\r")).await
    }

    /// Set the starting velocity in steps/s (`I`)
    pub async fn set_start_velocity(&self, value: u32) -> AppResult<String> {
        self.exchange(&format!("I{value}\r")).await
    }

    /// Set the scanning velocity in steps/s (`V`)
    pub async fn set_scan_velocity(&self, value: u32) -> AppResult<String> {
        self.exchange(&format!("V{value}\r")).await
    }

    /// Store the current parameters in non-volatile memory (`S`)
    pub async fn store(&self) -> AppResult<String> {
        self.exchange("S \r").await
    }

    /// Clear the stored program (`C1`)
    pub async fn clear(&self) -> AppResult<String> {
        self.exchange("C1 \r").await
    }

    /// Reset the controller (`^C`)
    pub async fn reset(&mut self) -> AppResult<String> {
        let reply = self.exchange("^C \r").await?;
        self.state = MonochromatorState::Idle;
        self.wavelength = None;
        Ok(reply)
    }

    /// Leave program mode (`P`)
    pub async fn exit_program(&self) -> AppResult<String> {
        self.exchange("P \r").await
    }

    /// Start continuous motion at `speed` steps/s (sign gives direction).
    ///
    /// Motion continues until [`MonochromatorController::stop`] is sent; the position is
    /// unknown afterwards.
    pub async fn move_continuous(&mut self, speed: i32) -> AppResult<String> {
        warn!(speed, "continuous motion started; send stop to end it");
        let reply = self.exchange(&format!("M{speed}\r")).await?;
        self.state = MonochromatorState::Moving;
        self.wavelength = None;
        Ok(reply)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_command_carries_sign_in_syntax() {
        assert_eq!(step_command(90000), "+90000 \r");
        assert_eq!(step_command(-4769340), "-4769340 \r");
        assert_eq!(step_command(0), "0 \r");
    }

    #[test]
    fn microsteps_round_to_nearest() {
        assert_eq!(microsteps_for(10.0), 90000);
        assert_eq!(microsteps_for(-531.26), -4781340);
        assert_eq!(microsteps_for(0.00005), 0);
        assert_eq!(microsteps_for(0.0004), 4);
        assert_eq!(microsteps_for(-0.0004), -4);
    }

    #[test]
    fn status_replies_parse_past_the_echo() {
        assert_eq!(parse_status("]    0\r\n", ']'), Some(0));
        assert_eq!(parse_status("]   32", ']'), Some(32));
        assert_eq!(parse_status("^    1", '^'), Some(1));
        assert_eq!(parse_status("garbage", ']'), None);
    }

    #[test]
    fn limit_status_codes() {
        assert!(LimitStatus::from_code(0).is_above_home());
        assert!(LimitStatus::from_code(2).is_above_home());
        assert!(!LimitStatus::from_code(32).is_above_home());
        assert!(!LimitStatus::from_code(34).is_above_home());
        assert_eq!(LimitStatus::from_code(999), LimitStatus::Unreadable);
        assert!(!LimitStatus::Unreadable.is_above_home());
    }

    #[test]
    fn wavelength_bounds_are_inclusive() {
        assert!(validate_wavelength(100.0).is_ok());
        assert!(validate_wavelength(900.0).is_ok());
        assert!(matches!(validate_wavelength(99.9), Err(BenchError::Range(_))));
        assert!(matches!(validate_wavelength(900.1), Err(BenchError::Range(_))));
        assert!(validate_wavelength(f64::NAN).is_err());
    }

    #[test]
    fn slit_width_uses_dispersion() {
        assert!((slit_width_for_bandpass(1.24) - 1.0).abs() < 1e-12);
        assert!((slit_width_for_bandpass(0.62) - 0.5).abs() < 1e-12);
    }
}
