//! Mock Hardware Implementations
//!
//! Simulated bench hardware for tests and for `--simulate` runs without instruments.
//!
//! # Available Mocks
//!
//! - `MockTransport` - in-memory [`Transport`] that routes each port to a simulated device
//! - `SimulatedScanController` - 789A-4 echo, limit and movement status replies
//! - `SimulatedFilterWheel` - 747 enquiry/acknowledge framing and slot position
//! - `SimulatedShutter` - VCM-D1 open/close bytes
//! - `SimulatedPicoammeter` - 6482 SCPI replies
//! - `MockCamera` - [`Camera`] with an image counter and a call log
//!
//! Simulated devices answer immediately. Controllers should be built with their
//! `immediate` timing so tests never sleep.

use crate::error::{AppResult, BenchError};
use crate::hardware::capabilities::Camera;
use crate::hardware::filter_wheel::{ACKNOWLEDGE, ENQUIRY, ETX, SLOT_COUNT, SOH, STX};
use crate::hardware::monochromator::STATUS_UNREADABLE;
use crate::hardware::pause;
use crate::hardware::transport::{PortConfig, SerialSession, Transport};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::trace;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// =============================================================================
// MockTransport - In-Memory Serial Ports
// =============================================================================

/// A device behind a simulated serial port.
///
/// `respond` sees every write in full and returns the bytes the device sends back.
pub trait SimulatedDevice: Send {
    /// React to one write
    fn respond(&mut self, written: &[u8]) -> Vec<u8>;
}

struct DeviceSlot {
    device: Box<dyn SimulatedDevice>,
    pending: VecDeque<u8>,
}

#[derive(Default)]
struct Shared {
    devices: Mutex<HashMap<String, DeviceSlot>>,
    writes: Mutex<Vec<(String, Vec<u8>)>>,
    failing: Mutex<HashSet<String>>,
    opens: AtomicUsize,
    closes: AtomicUsize,
}

/// In-memory transport.
///
/// Tracks every open and close and keeps a log of every write, per port.
/// Output a device produced but nobody read is discarded when the port is reopened.
#[derive(Clone, Default)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl MockTransport {
    /// Transport with no devices attached
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `device` at `port`, replacing any device already there
    pub fn attach(&self, port: impl Into<String>, device: impl SimulatedDevice + 'static) {
        lock(&self.shared.devices).insert(
            port.into(),
            DeviceSlot {
                device: Box::new(device),
                pending: VecDeque::new(),
            },
        );
    }

    /// Builder form of [`MockTransport::attach`]
    pub fn with_device(self, port: impl Into<String>, device: impl SimulatedDevice + 'static) -> Self {
        self.attach(port, device);
        self
    }

    /// Make every open of `port` fail as if the adapter were unplugged
    pub fn fail_open(&self, port: impl Into<String>) {
        lock(&self.shared.failing).insert(port.into());
    }

    /// Undo [`MockTransport::fail_open`]
    pub fn restore(&self, port: &str) {
        lock(&self.shared.failing).remove(port);
    }

    /// Sessions opened so far
    pub fn open_count(&self) -> usize {
        self.shared.opens.load(Ordering::SeqCst)
    }

    /// Sessions closed (dropped) so far
    pub fn close_count(&self) -> usize {
        self.shared.closes.load(Ordering::SeqCst)
    }

    /// Every write to `port`, in order
    pub fn writes(&self, port: &str) -> Vec<Vec<u8>> {
        lock(&self.shared.writes)
            .iter()
            .filter(|(p, _)| p == port)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    /// Writes to `port` as lossy text
    pub fn written_text(&self, port: &str) -> Vec<String> {
        self.writes(port)
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect()
    }

    /// Total number of writes on all ports
    pub fn write_count(&self) -> usize {
        lock(&self.shared.writes).len()
    }

    /// Forget the write log
    pub fn clear_writes(&self) {
        lock(&self.shared.writes).clear();
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&self, config: &PortConfig) -> AppResult<Box<dyn SerialSession>> {
        if lock(&self.shared.failing).contains(&config.port) {
            return Err(BenchError::communication(
                config.port.clone(),
                io::Error::new(io::ErrorKind::NotFound, "device not connected"),
            ));
        }
        {
            let mut devices = lock(&self.shared.devices);
            let slot = devices.get_mut(&config.port).ok_or_else(|| {
                BenchError::communication(
                    config.port.clone(),
                    io::Error::new(io::ErrorKind::NotFound, "no such port"),
                )
            })?;
            slot.pending.clear();
        }
        self.shared.opens.fetch_add(1, Ordering::SeqCst);
        trace!(port = %config.port, "mock port opened");
        Ok(Box::new(MockSession {
            port: config.port.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct MockSession {
    port: String,
    shared: Arc<Shared>,
}

impl MockSession {
    fn no_response(&self) -> BenchError {
        BenchError::communication(
            self.port.clone(),
            io::Error::new(io::ErrorKind::UnexpectedEof, "device sent no response"),
        )
    }

    fn detached(&self) -> BenchError {
        BenchError::communication(
            self.port.clone(),
            io::Error::new(io::ErrorKind::NotFound, "device detached"),
        )
    }
}

impl Drop for MockSession {
    fn drop(&mut self) {
        self.shared.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl SerialSession for MockSession {
    fn port(&self) -> &str {
        &self.port
    }

    async fn write(&mut self, bytes: &[u8]) -> AppResult<()> {
        {
            let mut devices = lock(&self.shared.devices);
            let slot = devices.get_mut(&self.port).ok_or_else(|| self.detached())?;
            let reply = slot.device.respond(bytes);
            slot.pending.extend(reply);
        }
        lock(&self.shared.writes).push((self.port.clone(), bytes.to_vec()));
        Ok(())
    }

    async fn read_until(&mut self, terminator: u8) -> AppResult<Vec<u8>> {
        let mut devices = lock(&self.shared.devices);
        let slot = devices.get_mut(&self.port).ok_or_else(|| self.detached())?;
        let end = slot
            .pending
            .iter()
            .position(|&b| b == terminator)
            .ok_or_else(|| self.no_response())?;
        Ok(slot.pending.drain(..=end).collect())
    }

    async fn read_exact(&mut self, len: usize) -> AppResult<Vec<u8>> {
        let mut devices = lock(&self.shared.devices);
        let slot = devices.get_mut(&self.port).ok_or_else(|| self.detached())?;
        if slot.pending.len() < len {
            return Err(self.no_response());
        }
        Ok(slot.pending.drain(..len).collect())
    }
}

// =============================================================================
// SimulatedScanController - McPherson 789A-4
// =============================================================================

/// Simulated 789A-4 scan controller.
///
/// Every command is echoed back as a line. `]` answers from the limit script (then the
/// default code), `^` reports moving for a fixed number of polls after each step command.
#[derive(Debug, Clone)]
pub struct SimulatedScanController {
    limit_script: VecDeque<u32>,
    limit_default: u32,
    moving_polls: u32,
    moving_remaining: u32,
    movement_override: Option<u32>,
    position_steps: Arc<AtomicI64>,
}

impl Default for SimulatedScanController {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedScanController {
    /// Controller that reports above home and stops moving after one poll
    pub fn new() -> Self {
        Self {
            limit_script: VecDeque::new(),
            limit_default: 0,
            moving_polls: 1,
            moving_remaining: 0,
            movement_override: None,
            position_steps: Arc::new(AtomicI64::new(0)),
        }
    }

    /// Limit status codes to report in order before falling back to the default
    pub fn with_limit_sequence(mut self, codes: impl IntoIterator<Item = u32>) -> Self {
        self.limit_script = codes.into_iter().collect();
        self
    }

    /// Limit status reported once the script is exhausted
    pub fn with_limit_default(mut self, code: u32) -> Self {
        self.limit_default = code;
        self
    }

    /// Movement polls that report moving after each step command
    pub fn with_moving_polls(mut self, polls: u32) -> Self {
        self.moving_polls = polls;
        self
    }

    /// Report the unreadable sentinel for every movement status
    pub fn with_unreadable_movement(mut self) -> Self {
        self.movement_override = Some(STATUS_UNREADABLE);
        self
    }

    /// Report this movement code forever (a controller that never stops)
    pub fn with_stuck_movement(mut self, code: u32) -> Self {
        self.movement_override = Some(code);
        self
    }

    /// Net microsteps commanded by relative moves
    pub fn position_handle(&self) -> Arc<AtomicI64> {
        Arc::clone(&self.position_steps)
    }

    fn is_step_command(command: &str) -> bool {
        let digits = command.trim_start_matches(['+', '-']);
        !digits.is_empty()
            && digits.len() < command.len()
            && digits.chars().all(|c| c.is_ascii_digit())
    }
}

impl SimulatedDevice for SimulatedScanController {
    fn respond(&mut self, written: &[u8]) -> Vec<u8> {
        let command = String::from_utf8_lossy(written).trim().to_string();
        match command.as_str() {
            "]" => {
                let code = self.limit_script.pop_front().unwrap_or(self.limit_default);
                format!("] {code:>4}\r\n").into_bytes()
            }
            "^" => {
                let code = match self.movement_override {
                    Some(code) => code,
                    None if self.moving_remaining > 0 => {
                        self.moving_remaining -= 1;
                        1
                    }
                    None => 0,
                };
                format!("^ {code:>4}\r\n").into_bytes()
            }
            _ => {
                if Self::is_step_command(&command) {
                    if let Ok(steps) = command.parse::<i64>() {
                        self.position_steps.fetch_add(steps, Ordering::SeqCst);
                    }
                    self.moving_remaining = self.moving_polls;
                }
                format!("{command}\r\n").into_bytes()
            }
        }
    }
}

// =============================================================================
// SimulatedFilterWheel - McPherson 747
// =============================================================================

/// Simulated 747 filter wheel.
///
/// Answers enquiries with ACK, position reads with a data frame and advances one slot
/// (wrapping 5 to 1) per increment data block.
#[derive(Debug, Clone)]
pub struct SimulatedFilterWheel {
    position: Arc<AtomicU8>,
    nak: Arc<AtomicBool>,
    stuck: bool,
    increments: Arc<AtomicUsize>,
}

impl SimulatedFilterWheel {
    /// Wheel sitting at `position`
    pub fn new(position: u8) -> Self {
        Self {
            position: Arc::new(AtomicU8::new(position)),
            nak: Arc::new(AtomicBool::new(false)),
            stuck: false,
            increments: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A wheel whose increments never move it
    pub fn stuck(mut self) -> Self {
        self.stuck = true;
        self
    }

    /// Current slot
    pub fn position(&self) -> u8 {
        self.position.load(Ordering::SeqCst)
    }

    /// Increment blocks received
    pub fn increment_count(&self) -> usize {
        self.increments.load(Ordering::SeqCst)
    }

    /// Answer enquiries with NAK instead of ACK
    pub fn set_nak(&self, nak: bool) {
        self.nak.store(nak, Ordering::SeqCst);
    }

    fn acknowledge(&self) -> Vec<u8> {
        if self.nak.load(Ordering::SeqCst) {
            b"N!\x15".to_vec()
        } else {
            ACKNOWLEDGE.to_vec()
        }
    }
}

impl SimulatedDevice for SimulatedFilterWheel {
    fn respond(&mut self, written: &[u8]) -> Vec<u8> {
        match written.first() {
            _ if written == ENQUIRY => self.acknowledge(),
            Some(&SOH) => match written.get(3) {
                Some(b'0') => {
                    let mut frame = vec![STX];
                    frame.extend_from_slice(format!("010{:02}", self.position()).as_bytes());
                    frame.push(ETX);
                    frame
                }
                _ => self.acknowledge(),
            },
            Some(&STX) => {
                self.increments.fetch_add(1, Ordering::SeqCst);
                if !self.stuck {
                    let next = self.position() % SLOT_COUNT + 1;
                    self.position.store(next, Ordering::SeqCst);
                }
                self.acknowledge()
            }
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// SimulatedShutter - VCM-D1
// =============================================================================

/// Simulated VCM-D1 shutter driver. Never answers.
#[derive(Debug, Clone, Default)]
pub struct SimulatedShutter {
    open: Arc<AtomicBool>,
    commands: Arc<AtomicUsize>,
}

impl SimulatedShutter {
    /// Closed shutter
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the last command opened the shutter
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Commands received
    pub fn command_count(&self) -> usize {
        self.commands.load(Ordering::SeqCst)
    }
}

impl SimulatedDevice for SimulatedShutter {
    fn respond(&mut self, written: &[u8]) -> Vec<u8> {
        self.commands.fetch_add(1, Ordering::SeqCst);
        match written {
            b"@" => self.open.store(true, Ordering::SeqCst),
            b"A" => self.open.store(false, Ordering::SeqCst),
            _ => {}
        }
        Vec::new()
    }
}

// =============================================================================
// SimulatedPicoammeter - Keithley 6482
// =============================================================================

/// Simulated 6482 picoammeter.
///
/// `:READ?` returns both channel currents; with faults enabled it returns a SCPI error
/// string that does not parse as a reading.
#[derive(Debug, Clone)]
pub struct SimulatedPicoammeter {
    currents: (f64, f64),
    busy_polls: u32,
    faulty: Arc<AtomicBool>,
    reads: Arc<AtomicUsize>,
}

impl Default for SimulatedPicoammeter {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPicoammeter {
    /// Meter reading 1 nA and 2 nA
    pub fn new() -> Self {
        Self {
            currents: (1.0e-9, 2.0e-9),
            busy_polls: 0,
            faulty: Arc::new(AtomicBool::new(false)),
            reads: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Fixed channel currents
    pub fn with_currents(mut self, ch1: f64, ch2: f64) -> Self {
        self.currents = (ch1, ch2);
        self
    }

    /// `*OPC?` answers 0 this many times before 1
    pub fn with_busy_polls(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    /// Make `:READ?` fail
    pub fn set_faulty(&self, faulty: bool) {
        self.faulty.store(faulty, Ordering::SeqCst);
    }

    /// `:READ?` queries received
    pub fn read_count(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

impl SimulatedDevice for SimulatedPicoammeter {
    fn respond(&mut self, written: &[u8]) -> Vec<u8> {
        let command = String::from_utf8_lossy(written).trim().to_string();
        match command.as_str() {
            "*IDN?" => b"KEITHLEY INSTRUMENTS INC.,MODEL 6482,0000000,SIM\r".to_vec(),
            "*OPC?" => {
                if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    b"0\r".to_vec()
                } else {
                    b"1\r".to_vec()
                }
            }
            ":READ?" => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                if self.faulty.load(Ordering::SeqCst) {
                    b"-113,\"Undefined header\"\r".to_vec()
                } else {
                    format!("{:E},{:E}\r", self.currents.0, self.currents.1).into_bytes()
                }
            }
            _ => Vec::new(),
        }
    }
}

// =============================================================================
// MockCamera - Simulated Camera
// =============================================================================

/// Simulated camera.
///
/// Image numbers advance by one per frame. Every call is logged by name, e.g.
/// `"bias"`, `"expose 2.5 x3"`.
#[derive(Debug, Default)]
pub struct MockCamera {
    path: String,
    next_image: AtomicU64,
    delay: Duration,
    fail_on: Option<String>,
    calls: Mutex<Vec<String>>,
}

impl MockCamera {
    /// Camera writing into `path`, starting at image 1
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            next_image: AtomicU64::new(1),
            ..Self::default()
        }
    }

    /// Make each acquisition take `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every call whose log entry starts with `operation`
    pub fn failing_on(mut self, operation: impl Into<String>) -> Self {
        self.fail_on = Some(operation.into());
        self
    }

    /// Calls made so far
    pub fn calls(&self) -> Vec<String> {
        lock(&self.calls).clone()
    }

    async fn acquire(&self, call: String, frames: u32) -> AppResult<()> {
        let fails = self
            .fail_on
            .as_deref()
            .is_some_and(|operation| call.starts_with(operation));
        lock(&self.calls).push(call.clone());
        if fails {
            return Err(BenchError::Camera(format!("simulated failure in {call}")));
        }
        pause(self.delay).await;
        self.next_image.fetch_add(u64::from(frames), Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl Camera for MockCamera {
    async fn path(&self) -> AppResult<String> {
        Ok(self.path.clone())
    }

    async fn image_number(&self) -> AppResult<u64> {
        Ok(self.next_image.load(Ordering::SeqCst))
    }

    async fn bias(&self) -> AppResult<()> {
        self.acquire("bias".to_string(), 1).await
    }

    async fn dark(&self, exposure_s: f64) -> AppResult<()> {
        self.acquire(format!("dark {exposure_s}"), 1).await
    }

    async fn exposure_burst(&self, exposure_s: f64, count: u32) -> AppResult<()> {
        self.acquire(format!("expose {exposure_s} x{count}"), count).await
    }

    async fn dark_burst(&self, exposure_s: f64, count: u32) -> AppResult<()> {
        self.acquire(format!("dark {exposure_s} x{count}"), count).await
    }
}
