//! Bench configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/bench.toml` (or a path given on the command line)
//! 2. Environment variables prefixed with `SPECTRAL_BENCH_`, nested keys separated by
//!    `__`, e.g. `SPECTRAL_BENCH_PORTS__MONOCHROMATOR=/dev/ttyUSB4`
//!
//! Every section has defaults, so an empty file is a valid (if not very useful)
//! configuration.
//!
//! # Example
//! ```no_run
//! use spectral_bench::config::BenchConfig;
//!
//! # fn main() -> spectral_bench::error::AppResult<()> {
//! let config = BenchConfig::load()?;
//! config.validate()?;
//! println!("Monochromator on {}", config.ports.monochromator);
//! # Ok(())
//! # }
//! ```

use crate::error::{AppResult, BenchError};
use crate::experiment::plan::{ScanPlan, ScanPlanConfig};
use crate::hardware::camera::CameraConfig;
use crate::hardware::filter_wheel::{FilterBreakpointTable, FilterWheelTiming, DEFAULT_CUTOFFS_NM};
use crate::hardware::monochromator::MonochromatorTiming;
use crate::hardware::picoammeter::PicoammeterConfig;
use crate::hardware::transport::PortConfig;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "config/bench.toml";

/// Environment variable prefix
pub const ENV_PREFIX: &str = "SPECTRAL_BENCH_";

/// Top-level bench configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BenchConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Serial port assignments
    #[serde(default)]
    pub ports: PortsConfig,
    /// Scan controller timing
    #[serde(default)]
    pub monochromator: MonochromatorTiming,
    /// Filter wheel timing and change map
    #[serde(default)]
    pub filter_wheel: FilterWheelConfig,
    /// Picoammeter channels and sampling
    #[serde(default)]
    pub picoammeter: PicoammeterConfig,
    /// Camera client
    #[serde(default)]
    pub camera: CameraConfig,
    /// Output locations
    #[serde(default)]
    pub storage: StorageConfig,
    /// Scan parameters for the `scan` command
    #[serde(default)]
    pub scan: Option<ScanPlanConfig>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    #[serde(default = "default_name")]
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Log span open/close events
    #[serde(default)]
    pub log_spans: bool,
    /// Prefix events with source file and line
    #[serde(default)]
    pub log_source: bool,
    /// Colour pretty output
    #[serde(default = "default_true")]
    pub log_color: bool,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: default_name(),
            log_level: default_log_level(),
            log_format: default_log_format(),
            log_spans: false,
            log_source: false,
            log_color: true,
        }
    }
}

/// Device paths for each instrument.
///
/// When `database` is set, aliases found there (`MCPort`, `FWPort`, `ShutPort`,
/// `PicoPort`) override the paths given here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    /// Port database CSV (`Port_Alias`, `Port_SN`, `Port_Name`)
    #[serde(default)]
    pub database: Option<PathBuf>,
    /// Scan controller device path
    #[serde(default = "default_monochromator_port")]
    pub monochromator: String,
    /// Filter wheel device path
    #[serde(default = "default_filter_wheel_port")]
    pub filter_wheel: String,
    /// Shutter driver device path
    #[serde(default = "default_shutter_port")]
    pub shutter: String,
    /// Picoammeter device path
    #[serde(default = "default_picoammeter_port")]
    pub picoammeter: String,
    /// Read timeout applied to every port. Absent means reads block.
    #[serde(default, with = "humantime_serde")]
    pub read_timeout: Option<Duration>,
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            database: None,
            monochromator: default_monochromator_port(),
            filter_wheel: default_filter_wheel_port(),
            shutter: default_shutter_port(),
            picoammeter: default_picoammeter_port(),
            read_timeout: None,
        }
    }
}

impl PortsConfig {
    /// Scan controller link settings
    pub fn monochromator_port(&self) -> PortConfig {
        PortConfig::mcpherson(&self.monochromator).with_read_timeout(self.read_timeout)
    }

    /// Filter wheel link settings
    pub fn filter_wheel_port(&self) -> PortConfig {
        PortConfig::mcpherson(&self.filter_wheel).with_read_timeout(self.read_timeout)
    }

    /// Shutter link settings
    pub fn shutter_port(&self) -> PortConfig {
        PortConfig::mcpherson(&self.shutter).with_read_timeout(self.read_timeout)
    }

    /// Picoammeter link settings
    pub fn picoammeter_port(&self) -> PortConfig {
        PortConfig::keithley(&self.picoammeter).with_read_timeout(self.read_timeout)
    }

    /// Replace device paths with the ones recorded in `database`.
    pub fn apply_database(&mut self, database: &PortDatabase) {
        let slots = [
            (MONOCHROMATOR_ALIAS, &mut self.monochromator),
            (FILTER_WHEEL_ALIAS, &mut self.filter_wheel),
            (SHUTTER_ALIAS, &mut self.shutter),
            (PICOAMMETER_ALIAS, &mut self.picoammeter),
        ];
        for (alias, slot) in slots {
            match database.lookup(alias) {
                Some(entry) => {
                    debug!(alias, port = %entry.name, "port from database");
                    *slot = entry.name.clone();
                }
                None => warn!(alias, "alias missing from port database, keeping {}", slot),
            }
        }
    }
}

/// Filter wheel section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterWheelConfig {
    /// Move timing
    #[serde(default)]
    pub timing: FilterWheelTiming,
    /// Cutoffs for filters 1-5 when no change map file is given, nm
    #[serde(default = "default_cutoffs")]
    pub cutoffs: Vec<f64>,
    /// Lower end of the range where the table applies, nm
    #[serde(default = "default_table_low")]
    pub low_nm: f64,
    /// Upper end of the range where the table applies, nm
    #[serde(default = "default_table_high")]
    pub high_nm: f64,
    /// Filter change map CSV (`filternum`, `Change_Wavelength`)
    #[serde(default)]
    pub change_map: Option<PathBuf>,
}

impl Default for FilterWheelConfig {
    fn default() -> Self {
        Self {
            timing: FilterWheelTiming::default(),
            cutoffs: default_cutoffs(),
            low_nm: default_table_low(),
            high_nm: default_table_high(),
            change_map: None,
        }
    }
}

impl FilterWheelConfig {
    /// Build the breakpoint table from the change map file, or from `cutoffs`.
    pub fn table(&self) -> AppResult<FilterBreakpointTable> {
        match &self.change_map {
            Some(path) => FilterBreakpointTable::load_csv(path, self.low_nm, self.high_nm),
            None => FilterBreakpointTable::from_cutoffs(&self.cutoffs, self.low_nm, self.high_nm),
        }
    }
}

/// Output locations
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Output directory. Absent means the camera's own data directory.
    #[serde(default)]
    pub output_dir: Option<PathBuf>,
    /// Create a dated experiment folder under the output directory for each scan
    #[serde(default)]
    pub experiment_folders: bool,
    /// Scan log file name
    #[serde(default = "default_scan_log")]
    pub scan_log: String,
    /// Write a photodiode CSV for every acquisition
    #[serde(default = "default_true")]
    pub save_photodiode: bool,
    /// Write a JSON run summary at the end of each scan
    #[serde(default = "default_true")]
    pub save_summary: bool,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            output_dir: None,
            experiment_folders: false,
            scan_log: default_scan_log(),
            save_photodiode: true,
            save_summary: true,
        }
    }
}

// Default value functions
fn default_name() -> String {
    "Spectral Bench".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_monochromator_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_filter_wheel_port() -> String {
    "/dev/ttyUSB1".to_string()
}

fn default_shutter_port() -> String {
    "/dev/ttyUSB2".to_string()
}

fn default_picoammeter_port() -> String {
    "/dev/ttyUSB3".to_string()
}

fn default_cutoffs() -> Vec<f64> {
    DEFAULT_CUTOFFS_NM.to_vec()
}

fn default_table_low() -> f64 {
    100.0
}

fn default_table_high() -> f64 {
    700.0
}

fn default_scan_log() -> String {
    "scan_log.csv".to_string()
}

fn default_true() -> bool {
    true
}

impl BenchConfig {
    /// Load configuration from `config/bench.toml` and environment variables
    pub fn load() -> AppResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment overrides still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        info!(path = %path.as_ref().display(), "configuration loaded");
        Ok(config)
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(BenchError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        let ports = [
            ("monochromator", &self.ports.monochromator),
            ("filter_wheel", &self.ports.filter_wheel),
            ("shutter", &self.ports.shutter),
            ("picoammeter", &self.ports.picoammeter),
        ];
        for (name, port) in ports {
            if port.trim().is_empty() {
                return Err(BenchError::Configuration(format!("ports.{name} is empty")));
            }
        }

        if self.picoammeter.enabled_channels().is_empty() {
            return Err(BenchError::Configuration(
                "picoammeter needs at least one enabled channel".to_string(),
            ));
        }
        if self.picoammeter.samples == 0 {
            return Err(BenchError::Configuration(
                "picoammeter.samples must be at least 1".to_string(),
            ));
        }
        if self.monochromator.poll.max_attempts == 0 {
            return Err(BenchError::Configuration(
                "monochromator.poll.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.storage.scan_log.trim().is_empty() {
            return Err(BenchError::Configuration("storage.scan_log is empty".to_string()));
        }

        let table = self.filter_wheel.table()?;
        if let Some(scan) = &self.scan {
            if self.storage.experiment_folders && scan.slit_um.is_none() {
                return Err(BenchError::Configuration(
                    "storage.experiment_folders needs scan.slit_um for the folder name".to_string(),
                ));
            }
            ScanPlan::new(scan.clone(), table)?;
        }

        Ok(())
    }

    /// Validated scan plan from the `[scan]` section
    pub fn scan_plan(&self) -> AppResult<ScanPlan> {
        let scan = self.scan.clone().ok_or_else(|| {
            BenchError::Configuration("no [scan] section in the configuration".to_string())
        })?;
        ScanPlan::new(scan, self.filter_wheel.table()?)
    }

    /// Render the effective configuration as TOML
    pub fn to_toml(&self) -> AppResult<String> {
        toml::to_string_pretty(self).map_err(|e| BenchError::Configuration(e.to_string()))
    }
}

// =============================================================================
// Port database
// =============================================================================

/// Alias of the scan controller in the port database
pub const MONOCHROMATOR_ALIAS: &str = "MCPort";
/// Alias of the filter wheel in the port database
pub const FILTER_WHEEL_ALIAS: &str = "FWPort";
/// Alias of the shutter driver in the port database
pub const SHUTTER_ALIAS: &str = "ShutPort";
/// Alias of the picoammeter in the port database
pub const PICOAMMETER_ALIAS: &str = "PicoPort";

/// One row of the port database
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    /// Logical device name
    #[serde(rename = "Port_Alias")]
    pub alias: String,
    /// USB serial number of the adapter
    #[serde(rename = "Port_SN")]
    pub serial_number: String,
    /// OS device path
    #[serde(rename = "Port_Name")]
    pub name: String,
}

/// A port visible on this machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AvailablePort {
    /// OS device path
    pub name: String,
    /// USB serial number, when the adapter reports one
    pub serial_number: Option<String>,
}

/// Mapping from device aliases to physical ports
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortDatabase {
    entries: Vec<PortEntry>,
}

impl PortDatabase {
    /// Database from rows
    pub fn new(entries: Vec<PortEntry>) -> Self {
        Self { entries }
    }

    /// Load the port database CSV
    pub fn load_csv(path: impl AsRef<Path>) -> AppResult<Self> {
        let mut reader = csv::Reader::from_path(path.as_ref())?;
        let entries = reader
            .deserialize::<PortEntry>()
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// Write the port database CSV
    pub fn save_csv(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        for entry in &self.entries {
            writer.serialize(entry)?;
        }
        writer.flush()?;
        Ok(())
    }

    /// Rows in file order
    pub fn entries(&self) -> &[PortEntry] {
        &self.entries
    }

    /// Row for `alias`
    pub fn lookup(&self, alias: &str) -> Option<&PortEntry> {
        self.entries.iter().find(|entry| entry.alias == alias)
    }

    /// Update device paths from the ports currently connected, matching on serial
    /// number. Returns the number of entries whose path changed.
    pub fn refresh_from(&mut self, available: &[AvailablePort]) -> usize {
        let mut changed = 0;
        for entry in &mut self.entries {
            let found = available
                .iter()
                .find(|port| port.serial_number.as_deref() == Some(entry.serial_number.as_str()));
            match found {
                Some(port) if port.name != entry.name => {
                    info!(alias = %entry.alias, from = %entry.name, to = %port.name, "port moved");
                    entry.name = port.name.clone();
                    changed += 1;
                }
                Some(_) => {}
                None => warn!(alias = %entry.alias, sn = %entry.serial_number, "adapter not connected"),
            }
        }
        changed
    }
}

/// USB serial ports currently connected.
#[cfg(feature = "instrument_serial")]
pub fn discover_usb_ports() -> AppResult<Vec<AvailablePort>> {
    use tokio_serial::SerialPortType;

    let ports = tokio_serial::available_ports()
        .map_err(|e| BenchError::communication("port scan", std::io::Error::from(e)))?;
    Ok(ports
        .into_iter()
        .filter_map(|port| match port.port_type {
            SerialPortType::UsbPort(info) => Some(AvailablePort {
                name: port.port_name,
                serial_number: info.serial_number,
            }),
            _ => None,
        })
        .collect())
}

/// USB serial ports currently connected.
#[cfg(not(feature = "instrument_serial"))]
pub fn discover_usb_ports() -> AppResult<Vec<AvailablePort>> {
    Err(BenchError::SerialFeatureDisabled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn defaults_validate() {
        let config = BenchConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.storage.scan_log, "scan_log.csv");
        assert!(config.scan.is_none());
    }

    #[test]
    fn loads_toml_sections() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "bench.toml",
                r#"
[application]
log_level = "debug"
log_spans = true

[ports]
monochromator = "/dev/ttyUSB7"
read_timeout = "5s"

[monochromator.poll]
interval = "250ms"
max_attempts = 40

[filter_wheel.timing]
settle = "1s"

[scan]
start_wl = 100.0
end_wl = 110.0
step = 5.0
lamp = "D2"
exposure_time = 2.0
dark_cadence = 10
"#,
            )?;

            let config = BenchConfig::load_from("bench.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.application.log_level, "debug");
            assert!(config.application.log_spans);
            assert!(config.application.log_color);
            assert_eq!(config.ports.monochromator, "/dev/ttyUSB7");
            assert_eq!(config.ports.read_timeout, Some(Duration::from_secs(5)));
            assert_eq!(config.monochromator.poll.interval, Duration::from_millis(250));
            assert_eq!(config.monochromator.poll.max_attempts, 40);
            assert_eq!(config.filter_wheel.timing.settle, Duration::from_secs(1));
            assert_eq!(config.filter_wheel.timing.max_increments, 5);
            assert!(config.validate().is_ok());

            let plan = config.scan_plan().map_err(|e| e.to_string())?;
            assert_eq!(plan.points().len(), 3);
            assert_eq!(plan.burst(), 1);
            Ok(())
        });
    }

    #[test]
    fn environment_overrides_file() {
        Jail::expect_with(|jail| {
            jail.create_file("bench.toml", "[camera]\nprogram = \"cam_comm\"\n")?;
            jail.set_env("SPECTRAL_BENCH_CAMERA__PROGRAM", "/opt/nuvu/cam_comm");
            jail.set_env("SPECTRAL_BENCH_APPLICATION__LOG_FORMAT", "json");

            let config = BenchConfig::load_from("bench.toml").map_err(|e| e.to_string())?;
            assert_eq!(config.camera.program, PathBuf::from("/opt/nuvu/cam_comm"));
            assert_eq!(config.application.log_format, "json");
            Ok(())
        });
    }

    #[test]
    fn invalid_log_level_rejected() {
        let mut config = BenchConfig::default();
        config.application.log_level = "verbose".to_string();
        assert!(matches!(config.validate(), Err(BenchError::Configuration(_))));
    }

    #[test]
    fn no_picoammeter_channel_rejected() {
        let mut config = BenchConfig::default();
        config.picoammeter.channel1.enabled = false;
        config.picoammeter.channel2.enabled = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn experiment_folders_need_slit() {
        let mut config = BenchConfig::default();
        config.storage.experiment_folders = true;
        config.scan = Some(ScanPlanConfig::new(100.0, 110.0, 5.0, "D2", 1.0));
        assert!(config.validate().is_err());
        if let Some(scan) = config.scan.as_mut() {
            scan.slit_um = Some(1500.0);
        }
        assert!(config.validate().is_ok());
    }

    #[test]
    fn change_map_file_replaces_cutoffs() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("filters.csv");
        fs::write(
            &path,
            "filternum,Change_Wavelength\n1,300\n2,400\n3,500\n4,600\n5,800\n",
        )
        .unwrap();
        let mut config = BenchConfig::default();
        config.filter_wheel.change_map = Some(path);
        config.filter_wheel.high_nm = 800.0;
        let table = config.filter_wheel.table().unwrap();
        assert_eq!(table.filter_for(350.0), 2);
        assert_eq!(table.filter_for(750.0), 5);
    }

    #[test]
    fn port_database_round_trip_and_lookup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ports.csv");
        fs::write(
            &path,
            "Port_Alias,Port_SN,Port_Name\nMCPort,FT1,/dev/ttyUSB0\nFWPort,FT2,/dev/ttyUSB1\n",
        )
        .unwrap();
        let db = PortDatabase::load_csv(&path).unwrap();
        assert_eq!(db.lookup("FWPort").unwrap().name, "/dev/ttyUSB1");
        assert!(db.lookup("PicoPort").is_none());

        let mut ports = PortsConfig::default();
        ports.apply_database(&db);
        assert_eq!(ports.monochromator, "/dev/ttyUSB0");
        assert_eq!(ports.filter_wheel, "/dev/ttyUSB1");
        assert_eq!(ports.picoammeter, default_picoammeter_port());

        let out = dir.path().join("ports_out.csv");
        db.save_csv(&out).unwrap();
        assert_eq!(PortDatabase::load_csv(&out).unwrap(), db);
    }

    #[test]
    fn refresh_matches_serial_numbers() {
        let mut db = PortDatabase::new(vec![
            PortEntry {
                alias: "MCPort".into(),
                serial_number: "FT1".into(),
                name: "/dev/ttyUSB0".into(),
            },
            PortEntry {
                alias: "ShutPort".into(),
                serial_number: "FT3".into(),
                name: "/dev/ttyUSB2".into(),
            },
        ]);
        let available = vec![
            AvailablePort {
                name: "/dev/ttyUSB5".into(),
                serial_number: Some("FT1".into()),
            },
            AvailablePort {
                name: "/dev/ttyS0".into(),
                serial_number: None,
            },
        ];
        assert_eq!(db.refresh_from(&available), 1);
        assert_eq!(db.lookup("MCPort").unwrap().name, "/dev/ttyUSB5");
        assert_eq!(db.lookup("ShutPort").unwrap().name, "/dev/ttyUSB2");
    }

    #[test]
    fn effective_config_renders_as_toml() {
        let text = BenchConfig::default().to_toml().unwrap();
        assert!(text.contains("[ports]"));
        assert!(text.contains("monochromator = \"/dev/ttyUSB0\""));
    }
}
