//! Photon transfer and dark-current series.
//!
//! A photon transfer run holds the grating and filter fixed and, for each exposure
//! time, takes `Bias, Dark, Flat, Flat, Dark, Bias`. Biases and darks are taken with the
//! shutter closed, flats with it open. Every frame is logged to `ptc_log.csv`.
//!
//! A dark series only touches the camera: for each exposure time it takes a bias, a
//! dark and a second bias and logs the three image numbers to `darks_log.csv`.

use crate::data::records::{AcquisitionRecord, DarkSeriesRecord, ImageType};
use crate::data::storage::{AcquisitionLog, DarkSeriesLog};
use crate::error::{AppResult, BenchError};
use crate::experiment::orchestrator::BenchDevices;
use crate::hardware::capabilities::Camera;
use crate::hardware::filter_wheel::SLOT_COUNT;
use crate::hardware::monochromator::validate_wavelength;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, instrument};

/// Exposure ladder used when none is configured.
pub const DEFAULT_PTC_EXPOSURES_S: [f64; 32] = [
    0.010, 0.02, 0.025, 0.050, 0.075, 0.1, 0.2, 0.25, 0.5, 0.75, 1.0, 2.0, 3.0, 5.0, 7.5, 10.0,
    20.0, 30.0, 40.0, 50.0, 60.0, 70.0, 80.0, 90.0, 100.0, 120.0, 140.0, 160.0, 180.0, 200.0,
    250.0, 300.0,
];

/// Photon transfer log file name
pub const PTC_LOG: &str = "ptc_log.csv";

/// Dark series log file name
pub const DARKS_LOG: &str = "darks_log.csv";

/// Frame order for one exposure time.
const PTC_SEQUENCE: [ImageType; 6] = [
    ImageType::Bias,
    ImageType::Dark,
    ImageType::Flat,
    ImageType::Flat,
    ImageType::Dark,
    ImageType::Bias,
];

fn default_exposures() -> Vec<f64> {
    DEFAULT_PTC_EXPOSURES_S.to_vec()
}

/// Photon transfer run parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PtcConfig {
    /// Fixed wavelength; the grating is moved there from home first
    pub wavelength_nm: f64,
    /// Fixed filter slot
    pub filter: u8,
    /// Lamp label for the log
    pub lamp: String,
    /// Exposure times, seconds
    #[serde(default = "default_exposures")]
    pub exposure_times: Vec<f64>,
}

impl PtcConfig {
    /// Parameters with the default exposure ladder
    pub fn new(wavelength_nm: f64, filter: u8, lamp: impl Into<String>) -> Self {
        Self {
            wavelength_nm,
            filter,
            lamp: lamp.into(),
            exposure_times: default_exposures(),
        }
    }

    /// Reject out-of-range wavelengths and slots and unusable exposure lists
    pub fn validate(&self) -> AppResult<()> {
        validate_wavelength(self.wavelength_nm)?;
        if !(1..=SLOT_COUNT).contains(&self.filter) {
            return Err(BenchError::Range(format!(
                "filter {} outside 1..={SLOT_COUNT}",
                self.filter
            )));
        }
        validate_exposures(&self.exposure_times)
    }
}

/// Dark-series parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarkSeriesConfig {
    /// Exposure times, seconds
    pub exposure_times: Vec<f64>,
}

impl Default for DarkSeriesConfig {
    fn default() -> Self {
        Self {
            exposure_times: vec![1.0],
        }
    }
}

fn validate_exposures(exposures: &[f64]) -> AppResult<()> {
    if exposures.is_empty() {
        return Err(BenchError::Configuration(
            "exposure list is empty".to_string(),
        ));
    }
    if let Some(bad) = exposures.iter().find(|t| !t.is_finite() || **t < 0.0) {
        return Err(BenchError::Range(format!("exposure time {bad} s is invalid")));
    }
    Ok(())
}

/// Run a photon transfer sequence. Returns every logged record.
#[instrument(skip(devices, output_dir), fields(wavelength_nm = config.wavelength_nm, filter = config.filter))]
pub async fn run_ptc(
    devices: &mut BenchDevices,
    config: &PtcConfig,
    output_dir: impl AsRef<Path>,
) -> AppResult<Vec<AcquisitionRecord>> {
    config.validate()?;
    let mut log = AcquisitionLog::open(output_dir.as_ref().join(PTC_LOG))?;

    devices.shutter.close().await?;
    devices
        .monochromator
        .go_to_from_home(config.wavelength_nm)
        .await?;
    devices.filter_wheel.set_position(config.filter).await?;

    let mut records = Vec::with_capacity(config.exposure_times.len() * PTC_SEQUENCE.len());
    for &exposure_s in &config.exposure_times {
        for imtype in PTC_SEQUENCE {
            let imno = devices.camera.image_number().await?;
            match imtype {
                ImageType::Bias => {
                    devices.shutter.close().await?;
                    devices.camera.bias().await?;
                }
                ImageType::Dark => {
                    devices.shutter.close().await?;
                    devices.camera.dark(exposure_s).await?;
                }
                _ => {
                    devices.shutter.open().await?;
                    let taken = devices.camera.exposure_burst(exposure_s, 1).await;
                    devices.shutter.close().await?;
                    taken?;
                }
            }
            let record = AcquisitionRecord::now(
                imtype,
                exposure_s,
                &config.lamp,
                config.wavelength_nm,
                imno,
                config.filter,
            );
            log.append(&record)?;
            records.push(record);
        }
        info!(exposure_s, "exposure time complete");
    }
    Ok(records)
}

/// Run a dark-current series. Returns every logged record.
#[instrument(skip(camera, config, output_dir))]
pub async fn run_dark_series(
    camera: &dyn Camera,
    config: &DarkSeriesConfig,
    output_dir: impl AsRef<Path>,
) -> AppResult<Vec<DarkSeriesRecord>> {
    validate_exposures(&config.exposure_times)?;
    let path: PathBuf = output_dir.as_ref().join(DARKS_LOG);
    let mut log = DarkSeriesLog::open(&path)?;

    let mut records = Vec::with_capacity(config.exposure_times.len());
    for &exposure_s in &config.exposure_times {
        let first_bias = camera.image_number().await?;
        camera.bias().await?;
        let dark = camera.image_number().await?;
        camera.dark(exposure_s).await?;
        let second_bias = camera.image_number().await?;
        camera.bias().await?;

        let record = DarkSeriesRecord::now(exposure_s, first_bias, dark, second_bias);
        log.append(&record)?;
        records.push(record);
        info!(exposure_s, dark, "dark series step complete");
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::MockCamera;
    use tempfile::tempdir;

    #[test]
    fn ptc_config_is_validated() {
        assert!(PtcConfig::new(500.0, 3, "QTH").validate().is_ok());
        assert!(matches!(
            PtcConfig::new(950.0, 3, "QTH").validate(),
            Err(BenchError::Range(_))
        ));
        assert!(matches!(
            PtcConfig::new(500.0, 6, "QTH").validate(),
            Err(BenchError::Range(_))
        ));
        let mut config = PtcConfig::new(500.0, 1, "QTH");
        config.exposure_times.clear();
        assert!(matches!(config.validate(), Err(BenchError::Configuration(_))));
    }

    #[tokio::test]
    async fn dark_series_logs_image_numbers() {
        let dir = tempdir().unwrap();
        let camera = MockCamera::new(dir.path().display().to_string());
        let config = DarkSeriesConfig {
            exposure_times: vec![1.0, 5.0],
        };

        let records = run_dark_series(&camera, &config, dir.path()).await.unwrap();

        assert_eq!(records.len(), 2);
        assert_eq!(
            (records[0].first_bias, records[0].dark, records[0].second_bias),
            (1, 2, 3)
        );
        assert_eq!(records[1].first_bias, 4);
        assert_eq!(camera.calls(), vec!["bias", "dark 1", "bias", "bias", "dark 5", "bias"]);

        let text = std::fs::read_to_string(dir.path().join(DARKS_LOG)).unwrap();
        assert_eq!(text.lines().count(), 3);
    }
}
