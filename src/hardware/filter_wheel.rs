//! McPherson 747 filter wheel driver
//!
//! Protocol Overview:
//! - Baud: 9600, 8N1, XON/XOFF
//! - Every exchange opens with an enquiry (`N!` ENQ) that the controller acknowledges
//!   with `N!` ACK, and closes with a second enquiry followed by EOT.
//! - Requests are binary-framed headers: SOH, address, operation (`0` read, `8` write),
//!   data type, memory address, data length, host address, ETB, then an XOR checksum
//!   over the bytes between SOH and ETB written as two lowercase hex characters.
//! - Writes follow the header with a data block framed by STX/ETX plus its own checksum.
//!
//! The wheel has five slots and can only advance one slot at a time, so selecting a
//! filter means reading the position and incrementing until it matches.
//!
//! Filter selection for a wavelength comes from a [`FilterBreakpointTable`].

use crate::error::{AppResult, BenchError};
use crate::hardware::pause;
use crate::hardware::transport::{PortConfig, SerialSession, Transport};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Start of header
pub const SOH: u8 = 0x01;
/// Start of text
pub const STX: u8 = 0x02;
/// End of text
pub const ETX: u8 = 0x03;
/// End of transmission
pub const EOT: u8 = 0x04;
/// End of transmission block (end of header)
pub const ETB: u8 = 0x17;

/// Enquiry sent at the start and end of every exchange
pub const ENQUIRY: &[u8; 3] = b"N!\x05";
/// Expected reply to [`ENQUIRY`]
pub const ACKNOWLEDGE: &[u8; 3] = b"N!\x06";

/// Number of filter slots
pub const SLOT_COUNT: u8 = 5;

/// XOR of all bytes
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |acc, b| acc ^ b)
}

fn header(operation: u8, address_msb: &[u8; 2], address_lsb: &[u8; 2]) -> Vec<u8> {
    let mut body = Vec::with_capacity(14);
    body.extend_from_slice(b"01"); // controller address
    body.push(operation);
    body.push(b'1'); // data type: V-memory
    body.extend_from_slice(address_msb);
    body.extend_from_slice(address_lsb);
    body.extend_from_slice(b"00"); // complete data blocks
    body.extend_from_slice(b"04"); // partial data block length
    body.extend_from_slice(b"01"); // host address

    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.push(SOH);
    frame.extend_from_slice(&body);
    frame.push(ETB);
    frame.extend_from_slice(format!("{:02x}", checksum(&body)).as_bytes());
    frame
}

/// Header requesting the current wheel position
pub fn read_position_header() -> Vec<u8> {
    header(b'0', b"04", b"A1")
}

/// Header announcing a write to the increment register
pub fn increment_header() -> Vec<u8> {
    header(b'8', b"41", b"81")
}

/// Data block that advances the wheel by one slot
pub fn increment_data() -> Vec<u8> {
    let data = b"0100";
    let mut frame = Vec::with_capacity(8);
    frame.push(STX);
    frame.extend_from_slice(data);
    frame.push(ETX);
    frame.extend_from_slice(format!("{:02x}", checksum(data)).as_bytes());
    frame
}

/// Decode the position from a read response frame.
///
/// The slot number is the two ASCII digits at offset 4.
pub fn decode_position(frame: &[u8], port: &str) -> AppResult<u8> {
    let digits = frame.get(4..6).ok_or_else(|| {
        BenchError::protocol(port, format!("position response too short: {frame:02x?}"))
    })?;
    let position = std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<u8>().ok())
        .ok_or_else(|| {
            BenchError::protocol(port, format!("position field is not numeric: {digits:02x?}"))
        })?;
    if !(1..=SLOT_COUNT).contains(&position) {
        return Err(BenchError::protocol(
            port,
            format!("wheel reported position {position}"),
        ));
    }
    Ok(position)
}

/// One row of the filter change map.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FilterBreakpoint {
    /// Filter slot, 1-5
    #[serde(rename = "filternum")]
    pub filter: u8,
    /// Longest wavelength this filter is used for, nm
    #[serde(rename = "Change_Wavelength")]
    pub cutoff_nm: f64,
}

/// Ordered wavelength cutoffs mapping wavelengths to filter slots.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterBreakpointTable {
    entries: Vec<FilterBreakpoint>,
    low_nm: f64,
    high_nm: f64,
}

/// Default cutoffs for filters 1-5
pub const DEFAULT_CUTOFFS_NM: [f64; 5] = [240.0, 350.0, 500.0, 605.0, 700.0];

impl Default for FilterBreakpointTable {
    fn default() -> Self {
        Self {
            entries: DEFAULT_CUTOFFS_NM
                .iter()
                .zip(1u8..)
                .map(|(&cutoff_nm, filter)| FilterBreakpoint { filter, cutoff_nm })
                .collect(),
            low_nm: 100.0,
            high_nm: 700.0,
        }
    }
}

impl FilterBreakpointTable {
    /// Build and validate a table covering the scan range `[low_nm, high_nm]`.
    pub fn new(entries: Vec<FilterBreakpoint>, low_nm: f64, high_nm: f64) -> AppResult<Self> {
        let table = Self {
            entries,
            low_nm,
            high_nm,
        };
        table.validate()?;
        Ok(table)
    }

    /// Build from cutoffs for filters 1, 2, ... in order.
    pub fn from_cutoffs(cutoffs_nm: &[f64], low_nm: f64, high_nm: f64) -> AppResult<Self> {
        let entries = cutoffs_nm
            .iter()
            .zip(1u8..)
            .map(|(&cutoff_nm, filter)| FilterBreakpoint { filter, cutoff_nm })
            .collect();
        Self::new(entries, low_nm, high_nm)
    }

    fn validate(&self) -> AppResult<()> {
        let last = self
            .entries
            .last()
            .ok_or_else(|| BenchError::Configuration("filter table is empty".to_string()))?;
        if !(self.low_nm < self.high_nm) {
            return Err(BenchError::Configuration(format!(
                "filter table range {}-{} nm is empty",
                self.low_nm, self.high_nm
            )));
        }
        for entry in &self.entries {
            if !(1..=SLOT_COUNT).contains(&entry.filter) {
                return Err(BenchError::Configuration(format!(
                    "filter index {} is outside 1-{SLOT_COUNT}",
                    entry.filter
                )));
            }
        }
        for pair in self.entries.windows(2) {
            if !(pair[0].cutoff_nm < pair[1].cutoff_nm) {
                return Err(BenchError::Configuration(format!(
                    "filter cutoffs must increase: {} nm then {} nm",
                    pair[0].cutoff_nm, pair[1].cutoff_nm
                )));
            }
        }
        if self.high_nm > last.cutoff_nm {
            return Err(BenchError::Configuration(format!(
                "scan range ends at {} nm but the last filter cutoff is {} nm",
                self.high_nm, last.cutoff_nm
            )));
        }
        Ok(())
    }

    /// Table rows in cutoff order
    pub fn entries(&self) -> &[FilterBreakpoint] {
        &self.entries
    }

    /// Lower end of the scan range
    pub fn low_nm(&self) -> f64 {
        self.low_nm
    }

    /// Upper end of the scan range
    pub fn high_nm(&self) -> f64 {
        self.high_nm
    }

    /// Filter for `wavelength_nm`. See [`which_filter`].
    pub fn filter_for(&self, wavelength_nm: f64) -> u8 {
        which_filter(wavelength_nm, self)
    }

    /// Load a filter change map CSV (`filternum`, `Change_Wavelength`).
    pub fn load_csv(path: impl AsRef<Path>, low_nm: f64, high_nm: f64) -> AppResult<Self> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let entries = reader
            .deserialize::<FilterBreakpoint>()
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(entries, low_nm, high_nm)
    }

    /// Write the table as a filter change map CSV.
    pub fn save_csv(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Filter slot to use at `wavelength_nm`.
///
/// Outside the table's scan range this is filter 1. Inside it, the first filter whose
/// cutoff is at or above the wavelength, so a wavelength exactly on a cutoff uses the
/// lower filter.
pub fn which_filter(wavelength_nm: f64, table: &FilterBreakpointTable) -> u8 {
    if !wavelength_nm.is_finite()
        || wavelength_nm < table.low_nm
        || wavelength_nm > table.high_nm
    {
        debug!(wavelength_nm, "outside filter table range, using filter 1");
        return 1;
    }
    table
        .entries
        .iter()
        .find(|entry| wavelength_nm <= entry.cutoff_nm)
        .or(table.entries.last())
        .map_or(1, |entry| entry.filter)
}

/// Delays and limits for wheel moves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterWheelTiming {
    /// Pause between sending a header and reading the reply
    #[serde(default = "default_response_delay", with = "humantime_serde")]
    pub response_delay: Duration,
    /// Pause after each increment and position read while selecting a filter
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
    /// Increments allowed before giving up on a stuck wheel
    #[serde(default = "default_max_increments")]
    pub max_increments: u32,
}

fn default_response_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_settle() -> Duration {
    Duration::from_secs(3)
}

fn default_max_increments() -> u32 {
    SLOT_COUNT as u32
}

impl Default for FilterWheelTiming {
    fn default() -> Self {
        Self {
            response_delay: default_response_delay(),
            settle: default_settle(),
            max_increments: default_max_increments(),
        }
    }
}

impl FilterWheelTiming {
    /// No delays. For simulated hardware.
    pub fn immediate() -> Self {
        Self {
            response_delay: Duration::ZERO,
            settle: Duration::ZERO,
            max_increments: default_max_increments(),
        }
    }
}

/// Driver for the 747 filter wheel.
pub struct FilterWheelController {
    transport: Arc<dyn Transport>,
    port: PortConfig,
    timing: FilterWheelTiming,
    position: Option<u8>,
}

impl FilterWheelController {
    /// Create a controller. No port is opened until the first operation.
    pub fn new(transport: Arc<dyn Transport>, port: PortConfig, timing: FilterWheelTiming) -> Self {
        Self {
            transport,
            port,
            timing,
            position: None,
        }
    }

    /// Position seen by the last read, if any
    pub fn last_position(&self) -> Option<u8> {
        self.position
    }

    async fn enquire(&self, session: &mut dyn SerialSession) -> AppResult<()> {
        session.write(ENQUIRY).await?;
        self.expect_ack(session).await
    }

    async fn expect_ack(&self, session: &mut dyn SerialSession) -> AppResult<()> {
        let reply = session.read_exact(ACKNOWLEDGE.len()).await?;
        if reply.as_slice() != ACKNOWLEDGE {
            return Err(BenchError::protocol(
                self.port.port.clone(),
                format!("expected ACK, got {reply:02x?}"),
            ));
        }
        Ok(())
    }

    /// Read the current wheel position.
    pub async fn position(&mut self) -> AppResult<u8> {
        let mut session = self.transport.open(&self.port).await?;
        self.enquire(session.as_mut()).await?;
        session.write(&read_position_header()).await?;
        pause(self.timing.response_delay).await;
        let frame = session.read_until(ETX).await?;
        self.enquire(session.as_mut()).await?;
        session.write(&[EOT]).await?;
        drop(session);

        let position = decode_position(&frame, &self.port.port)?;
        debug!(position, "filter wheel position");
        self.position = Some(position);
        Ok(position)
    }

    /// Advance the wheel by one slot.
    pub async fn increment(&mut self) -> AppResult<()> {
        self.position = None;
        let mut session = self.transport.open(&self.port).await?;
        self.enquire(session.as_mut()).await?;
        session.write(&increment_header()).await?;
        pause(self.timing.response_delay).await;
        self.expect_ack(session.as_mut()).await?;
        session.write(&increment_data()).await?;
        pause(self.timing.response_delay).await;
        self.expect_ack(session.as_mut()).await?;
        session.write(&[EOT]).await
    }

    /// Rotate to `target` (1-5). Returns the number of increments issued.
    ///
    /// Already being at `target` costs one position read and no increments.
    #[instrument(skip(self), fields(port = %self.port.port))]
    pub async fn set_position(&mut self, target: u8) -> AppResult<u32> {
        if !(1..=SLOT_COUNT).contains(&target) {
            return Err(BenchError::Range(format!(
                "filter {target} is outside 1-{SLOT_COUNT}"
            )));
        }

        let mut current = self.position().await?;
        pause(self.timing.settle).await;
        let mut increments = 0;
        while current != target {
            if increments >= self.timing.max_increments {
                warn!(current, target, increments, "filter wheel did not reach target");
                return Err(BenchError::PollLimitExceeded {
                    port: self.port.port.clone(),
                    operation: format!("select filter {target}"),
                    attempts: increments,
                });
            }
            self.increment().await?;
            increments += 1;
            pause(self.timing.settle).await;
            current = self.position().await?;
            debug!(current, target, "filter wheel advanced");
        }
        info!(filter = target, increments, "filter selected");
        Ok(increments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_header_checksum() {
        let frame = read_position_header();
        assert_eq!(frame[0], SOH);
        assert_eq!(&frame[1..15], b"010104A1000401");
        assert_eq!(frame[15], ETB);
        assert_eq!(&frame[16..], b"71");
    }

    #[test]
    fn increment_frames() {
        let header = increment_header();
        assert_eq!(&header[1..15], b"01814181000401");
        assert_eq!(&header[16..], b"01");
        assert_eq!(increment_data(), b"\x020100\x0301".to_vec());
    }

    #[test]
    fn decodes_position_digits() {
        assert_eq!(decode_position(b"\x0201003\x03", "FW").unwrap(), 3);
        assert!(decode_position(b"\x02010", "FW").is_err());
        assert!(decode_position(b"\x0201009\x03", "FW").is_err());
        assert!(decode_position(b"\x020100x\x03", "FW").is_err());
    }

    #[test]
    fn default_table_matches_change_map() {
        let table = FilterBreakpointTable::default();
        assert_eq!(table.entries().len(), 5);
        assert_eq!(which_filter(240.0, &table), 1);
        assert_eq!(which_filter(240.1, &table), 2);
        assert_eq!(which_filter(605.0, &table), 4);
        assert_eq!(which_filter(700.0, &table), 5);
        assert_eq!(which_filter(99.0, &table), 1);
        assert_eq!(which_filter(701.0, &table), 1);
        assert_eq!(which_filter(f64::NAN, &table), 1);
    }

    #[test]
    fn rejects_bad_tables() {
        assert!(FilterBreakpointTable::from_cutoffs(&[], 100.0, 700.0).is_err());
        assert!(FilterBreakpointTable::from_cutoffs(&[300.0, 200.0], 100.0, 200.0).is_err());
        assert!(FilterBreakpointTable::from_cutoffs(&[240.0, 350.0], 100.0, 400.0).is_err());
        assert!(FilterBreakpointTable::from_cutoffs(&[1.0; 6], 0.5, 1.0).is_err());
        assert!(FilterBreakpointTable::new(
            vec![FilterBreakpoint {
                filter: 7,
                cutoff_nm: 500.0
            }],
            100.0,
            500.0
        )
        .is_err());
    }

    #[test]
    fn change_map_csv_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Filter_change_map.csv");
        let table = FilterBreakpointTable::default();
        table.save_csv(&path).unwrap();

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("filternum,Change_Wavelength"));

        let loaded = FilterBreakpointTable::load_csv(&path, 100.0, 700.0).unwrap();
        assert_eq!(loaded, table);
    }
}
