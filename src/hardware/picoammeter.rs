//! Keithley 6482 dual-channel picoammeter
//!
//! Protocol Overview:
//! - Format: SCPI over RS-232
//! - Baud: 9600, 8N1, no flow control
//! - Terminator: CR on both commands and replies
//! - `:READ?` returns one comma-separated current per enabled channel
//!
//! The sampler measures the photodiode current that normalises each camera exposure.
//! Sampling is as fast as the query round trip allows; the configured interval is
//! recorded but not enforced.

use crate::error::{AppResult, BenchError};
use crate::hardware::transport::{query_line, PortConfig, SerialSession, Transport};
use crate::hardware::{pause, PollPolicy};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

const TERMINATOR: u8 = b'\r';

/// Per-channel measurement settings
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ChannelSettings {
    /// Whether the channel is measured
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Upper auto-range limit, A
    #[serde(default = "default_upper_limit")]
    pub upper_limit: f64,
    /// Lower auto-range limit, A
    #[serde(default = "default_lower_limit")]
    pub lower_limit: f64,
    /// Integration time in power-line cycles
    #[serde(default = "default_nplc")]
    pub nplc: f64,
    /// Bias voltage applied by the channel source, V
    #[serde(default)]
    pub source_voltage: f64,
}

fn default_enabled() -> bool {
    true
}

fn default_upper_limit() -> f64 {
    0.01
}

fn default_lower_limit() -> f64 {
    1e-7
}

fn default_nplc() -> f64 {
    1.0
}

impl Default for ChannelSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            upper_limit: default_upper_limit(),
            lower_limit: default_lower_limit(),
            nplc: default_nplc(),
            source_voltage: 0.0,
        }
    }
}

/// Picoammeter configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PicoammeterConfig {
    /// Channel 1 settings
    #[serde(default)]
    pub channel1: ChannelSettings,
    /// Channel 2 settings
    #[serde(default)]
    pub channel2: ChannelSettings,
    /// Nominal spacing between samples (not enforced)
    #[serde(default = "default_interval", with = "humantime_serde")]
    pub interval: Duration,
    /// Samples per standalone measurement
    #[serde(default = "default_samples")]
    pub samples: usize,
    /// Polling of `*OPC?` after reset
    #[serde(default = "default_opc_poll")]
    pub opc_poll: PollPolicy,
}

fn default_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_samples() -> usize {
    50
}

fn default_opc_poll() -> PollPolicy {
    PollPolicy::new(Duration::ZERO, 100)
}

impl Default for PicoammeterConfig {
    fn default() -> Self {
        Self {
            channel1: ChannelSettings::default(),
            channel2: ChannelSettings::default(),
            interval: default_interval(),
            samples: default_samples(),
            opc_poll: default_opc_poll(),
        }
    }
}

impl PicoammeterConfig {
    /// Enabled channels as (number, settings)
    pub fn enabled_channels(&self) -> Vec<(u8, ChannelSettings)> {
        [(1, self.channel1), (2, self.channel2)]
            .into_iter()
            .filter(|(_, settings)| settings.enabled)
            .collect()
    }
}

/// One `:READ?` result
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PhotodiodeSample {
    /// Channel 1 current, A
    #[serde(rename = "Ch1")]
    pub ch1: Option<f64>,
    /// Channel 2 current, A
    #[serde(rename = "Ch2")]
    pub ch2: Option<f64>,
    /// Seconds since the first sample of the series
    #[serde(rename = "Elapsed_time")]
    pub elapsed_s: f64,
}

/// Ordered photodiode samples for one acquisition
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PhotodiodeSeries {
    samples: Vec<PhotodiodeSample>,
}

impl PhotodiodeSeries {
    /// Empty series
    pub fn new() -> Self {
        Self::default()
    }

    /// Samples in acquisition order
    pub fn samples(&self) -> &[PhotodiodeSample] {
        &self.samples
    }

    /// Number of samples
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    /// Whether the series is empty
    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Append one sample
    pub fn push(&mut self, sample: PhotodiodeSample) {
        self.samples.push(sample);
    }

    /// Append all samples of `other`
    pub fn extend(&mut self, other: PhotodiodeSeries) {
        self.samples.extend(other.samples);
    }

    /// Mean of channel 1, ignoring missing readings
    pub fn mean_ch1(&self) -> Option<f64> {
        mean(self.samples.iter().filter_map(|s| s.ch1))
    }

    /// Mean of channel 2, ignoring missing readings
    pub fn mean_ch2(&self) -> Option<f64> {
        mean(self.samples.iter().filter_map(|s| s.ch2))
    }

    /// Write the series as CSV (`Ch1`, `Ch2`, `Elapsed_time`).
    pub fn write_csv(&self, path: impl AsRef<Path>) -> AppResult<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for sample in &self.samples {
            writer.serialize(sample)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, count) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    (count > 0).then(|| sum / count as f64)
}

/// Parse a `:READ?` reply into per-channel currents.
///
/// Values are assigned to the enabled channels in order.
pub fn parse_reading(reply: &str, channels: &[u8], port: &str) -> AppResult<(Option<f64>, Option<f64>)> {
    let values = reply
        .trim()
        .split(',')
        .map(|field| field.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| BenchError::protocol(port, format!("unparseable reading '{}'", reply.trim())))?;
    if values.len() < channels.len() {
        return Err(BenchError::protocol(
            port,
            format!(
                "expected {} readings, got '{}'",
                channels.len(),
                reply.trim()
            ),
        ));
    }

    let mut ch1 = None;
    let mut ch2 = None;
    for (&channel, value) in channels.iter().zip(values) {
        match channel {
            1 => ch1 = Some(value),
            _ => ch2 = Some(value),
        }
    }
    Ok((ch1, ch2))
}

/// Driver for the 6482 picoammeter.
pub struct PicoammeterSampler {
    transport: Arc<dyn Transport>,
    port: PortConfig,
    config: PicoammeterConfig,
    identity: Option<String>,
}

impl PicoammeterSampler {
    /// Create a sampler. No port is opened until [`PicoammeterSampler::initialize`].
    pub fn new(transport: Arc<dyn Transport>, port: PortConfig, config: PicoammeterConfig) -> Self {
        Self {
            transport,
            port,
            config,
            identity: None,
        }
    }

    /// Configuration in use
    pub fn config(&self) -> &PicoammeterConfig {
        &self.config
    }

    /// `*IDN?` reply from the last initialisation
    pub fn identity(&self) -> Option<&str> {
        self.identity.as_deref()
    }

    async fn send(&self, session: &mut dyn SerialSession, command: &str) -> AppResult<()> {
        session.write(format!("{command}\r").as_bytes()).await
    }

    async fn request(&self, session: &mut dyn SerialSession, command: &str) -> AppResult<String> {
        query_line(session, format!("{command}\r").as_bytes(), TERMINATOR).await
    }

    /// Reset the instrument and configure every enabled channel.
    ///
    /// Fails with a configuration error, without touching the port, when no channel
    /// is enabled.
    #[instrument(skip(self), fields(port = %self.port.port))]
    pub async fn initialize(&mut self) -> AppResult<()> {
        let channels = self.config.enabled_channels();
        if channels.is_empty() {
            return Err(BenchError::Configuration(
                "picoammeter needs at least one enabled channel".to_string(),
            ));
        }

        let mut session = self.transport.open(&self.port).await?;
        let identity = self.request(session.as_mut(), "*IDN?").await?;
        info!(identity = %identity, "picoammeter connected");
        self.identity = Some(identity);

        self.send(session.as_mut(), "*RST").await?;
        self.wait_for_operation_complete(session.as_mut()).await?;

        for (n, settings) in channels {
            let commands = [
                format!(":SENS{n}:CURR:RANG:AUTO ON"),
                format!(":SENS{n}:CURR:RANG:AUTO:ULIM {}", settings.upper_limit),
                format!(":SENS{n}:CURR:RANG:AUTO:LLIM {}", settings.lower_limit),
                format!(":SENS{n}:CURR:NPLC {}", settings.nplc),
                format!(":SOUR{n}:VOLT:RANGE:AUTO 1"),
                format!(":SOUR{n}:VOLT {}", settings.source_voltage),
                format!("OUTP{n} ON"),
            ];
            for command in &commands {
                self.send(session.as_mut(), command).await?;
            }
            debug!(channel = n, "channel configured");
        }
        Ok(())
    }

    async fn wait_for_operation_complete(&self, session: &mut dyn SerialSession) -> AppResult<()> {
        let policy = self.config.opc_poll;
        for attempt in 1..=policy.max_attempts {
            pause(policy.interval).await;
            let reply = self.request(session, "*OPC?").await?;
            if reply.trim().parse::<i32>().ok() == Some(1) {
                debug!(attempt, "reset complete");
                return Ok(());
            }
        }
        Err(BenchError::PollLimitExceeded {
            port: self.port.port.clone(),
            operation: "reset (*OPC?)".to_string(),
            attempts: policy.max_attempts,
        })
    }

    /// Take `count` readings back to back.
    ///
    /// `interval` is the nominal spacing; no delay is inserted between queries.
    pub async fn sample(&mut self, count: usize, interval: Duration) -> AppResult<PhotodiodeSeries> {
        self.sample_from(count, interval, Instant::now()).await
    }

    /// Like [`PicoammeterSampler::sample`], with elapsed times measured from `origin`.
    ///
    /// Used to stitch several batches into one continuous series.
    pub async fn sample_from(
        &mut self,
        count: usize,
        interval: Duration,
        origin: Instant,
    ) -> AppResult<PhotodiodeSeries> {
        let channels: Vec<u8> = self
            .config
            .enabled_channels()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        debug!(count, interval_ms = interval.as_millis() as u64, "sampling photodiode");

        let mut session = self.transport.open(&self.port).await?;
        let mut series = PhotodiodeSeries::new();
        for _ in 0..count {
            let reply = self.request(session.as_mut(), ":READ?").await?;
            let elapsed_s = origin.elapsed().as_secs_f64();
            let (ch1, ch2) = parse_reading(&reply, &channels, &self.port.port)?;
            series.push(PhotodiodeSample { ch1, ch2, elapsed_s });
        }
        Ok(series)
    }

    /// Take the configured number of samples.
    pub async fn measure(&mut self) -> AppResult<PhotodiodeSeries> {
        let (count, interval) = (self.config.samples, self.config.interval);
        self.sample(count, interval).await
    }
}
