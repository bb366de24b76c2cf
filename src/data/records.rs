//! Log row types.
//!
//! Column names match the CSV files the analysis notebooks already read, so several
//! fields carry explicit serde renames.

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of camera frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageType {
    /// Zero-second readout
    Bias,
    /// Shutter closed
    Dark,
    /// Shutter open, science frame
    Exposure,
    /// Shutter open, flat field (photon-transfer runs)
    Flat,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImageType::Bias => write!(f, "Bias"),
            ImageType::Dark => write!(f, "Dark"),
            ImageType::Exposure => write!(f, "Exposure"),
            ImageType::Flat => write!(f, "Flat"),
        }
    }
}

/// One row of the scan log: one camera acquisition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AcquisitionRecord {
    /// When the row was written
    pub time: DateTime<Local>,
    /// Frame kind
    pub imtype: ImageType,
    /// Exposure time, seconds
    #[serde(rename = "Exp_time")]
    pub exposure_s: f64,
    /// Lamp identifier
    #[serde(rename = "Lamp")]
    pub lamp: String,
    /// Monochromator wavelength, nm
    #[serde(rename = "wl")]
    pub wavelength_nm: f64,
    /// Camera image number of the first frame
    pub imno: u64,
    /// Filter wheel slot
    #[serde(rename = "filtnum")]
    pub filter: u8,
}

impl AcquisitionRecord {
    /// Row stamped with the current local time
    pub fn now(
        imtype: ImageType,
        exposure_s: f64,
        lamp: impl Into<String>,
        wavelength_nm: f64,
        imno: u64,
        filter: u8,
    ) -> Self {
        Self {
            time: Local::now(),
            imtype,
            exposure_s,
            lamp: lamp.into(),
            wavelength_nm,
            imno,
            filter,
        }
    }
}

/// One row of the dark-series log: bias, dark, bias at one exposure time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DarkSeriesRecord {
    /// Completion time, `MM/DD/YY HH:MM:SS`
    #[serde(rename = "Time")]
    pub time: String,
    /// Dark exposure time, seconds
    #[serde(rename = "Exptime [s]")]
    pub exposure_s: f64,
    /// Image number of the leading bias
    #[serde(rename = "Bias1 img #")]
    pub first_bias: u64,
    /// Image number of the dark
    #[serde(rename = "Dark img #")]
    pub dark: u64,
    /// Image number of the trailing bias
    #[serde(rename = "Bias img #")]
    pub second_bias: u64,
}

impl DarkSeriesRecord {
    /// Row stamped with the current local time
    pub fn now(exposure_s: f64, first_bias: u64, dark: u64, second_bias: u64) -> Self {
        Self {
            time: Local::now().format("%D %T").to_string(),
            exposure_s,
            first_bias,
            dark,
            second_bias,
        }
    }
}
