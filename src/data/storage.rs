//! CSV logs and output file naming.
//!
//! Logs are append-only. Reopening an existing log appends without repeating the
//! header, and every row is flushed as soon as it is written so an aborted scan keeps
//! everything up to the failure.

use crate::data::records::{AcquisitionRecord, DarkSeriesRecord, ImageType};
use crate::error::AppResult;
use chrono::NaiveDate;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Append-only CSV log of `T` rows.
pub struct CsvLog<T> {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
    _row: PhantomData<fn(T)>,
}

/// Scan and photon-transfer log
pub type AcquisitionLog = CsvLog<AcquisitionRecord>;

/// Dark-series log
pub type DarkSeriesLog = CsvLog<DarkSeriesRecord>;

impl<T: Serialize> CsvLog<T> {
    /// Open `path` for appending, creating it and its directory if needed.
    ///
    /// The header is written only when the file is new or empty.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let needs_header = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        debug!(path = %path.display(), new = needs_header, "log opened");
        Ok(Self {
            path,
            writer,
            rows: 0,
            _row: PhantomData,
        })
    }

    /// Append one row and flush it to disk
    pub fn append(&mut self, row: &T) -> AppResult<()> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }

    /// Rows appended through this handle
    pub fn rows_written(&self) -> usize {
        self.rows
    }

    /// File being written
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Read every row of a scan log.
pub fn read_acquisition_log(path: impl AsRef<Path>) -> AppResult<Vec<AcquisitionRecord>> {
    let mut reader = csv::Reader::from_path(path.as_ref())?;
    let rows = reader
        .deserialize::<AcquisitionRecord>()
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// File name for the photodiode series recorded during one acquisition:
/// `picoa_<imtype>_f<filter>_<wl>nm_<imno>.csv`.
pub fn photodiode_file_name(imtype: ImageType, filter: u8, wavelength_nm: f64, imno: u64) -> String {
    format!("picoa_{imtype}_f{filter}_{wavelength_nm}nm_{imno}.csv")
}

/// Experiment folder name:
/// `Exp<MMDDYYYY>_<lamp>_slit_<slit>micron_<start>nmto<end>nm`.
///
/// Start and end are truncated to whole nanometres.
pub fn experiment_folder_name(
    date: NaiveDate,
    lamp: &str,
    slit_um: f64,
    start_nm: f64,
    end_nm: f64,
) -> String {
    format!(
        "Exp{}_{lamp}_slit_{slit_um}micron_{}nmto{}nm",
        date.format("%m%d%Y"),
        start_nm.trunc() as i64,
        end_nm.trunc() as i64
    )
}

/// Create `parent/name`, reusing it if it already exists.
pub fn create_experiment_folder(parent: impl AsRef<Path>, name: &str) -> AppResult<PathBuf> {
    let dir = parent.as_ref().join(name);
    if dir.is_dir() {
        info!(dir = %dir.display(), "experiment folder exists; check it is empty before proceeding");
    } else {
        fs::create_dir_all(&dir)?;
        info!(dir = %dir.display(), "experiment folder created");
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn photodiode_names_follow_pattern() {
        assert_eq!(
            photodiode_file_name(ImageType::Exposure, 2, 105.0, 42),
            "picoa_Exposure_f2_105nm_42.csv"
        );
        assert_eq!(
            photodiode_file_name(ImageType::Dark, 1, 302.5, 7),
            "picoa_Dark_f1_302.5nm_7.csv"
        );
    }

    #[test]
    fn experiment_folder_name_truncates_range() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            experiment_folder_name(date, "D2", 1500.0, 150.0, 420.9),
            "Exp03072024_D2_slit_1500micron_150nmto420nm"
        );
    }

    #[test]
    fn experiment_folder_is_reused() {
        let dir = tempdir().unwrap();
        let first = create_experiment_folder(dir.path(), "Exp1").unwrap();
        fs::write(first.join("marker"), "x").unwrap();
        let second = create_experiment_folder(dir.path(), "Exp1").unwrap();
        assert_eq!(first, second);
        assert!(second.join("marker").exists());
    }

    #[test]
    fn reopened_log_does_not_repeat_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join("scan_log.csv");
        let row = AcquisitionRecord::now(ImageType::Bias, 1.5, "D2", 100.0, 1, 1);

        let mut log = AcquisitionLog::open(&path).unwrap();
        log.append(&row).unwrap();
        drop(log);
        let mut log = AcquisitionLog::open(&path).unwrap();
        log.append(&row).unwrap();
        assert_eq!(log.rows_written(), 1);

        let text = fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().filter(|l| l.starts_with("time,")).count(), 1);
        assert!(text.starts_with("time,imtype,Exp_time,Lamp,wl,imno,filtnum"));

        let rows = read_acquisition_log(&path).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].imtype, ImageType::Bias);
        assert_eq!(rows[1].wavelength_nm, 100.0);
    }

    #[test]
    fn dark_series_header() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("darks_log.csv");
        let mut log = DarkSeriesLog::open(&path).unwrap();
        log.append(&DarkSeriesRecord::now(2.0, 10, 11, 12)).unwrap();
        let text = fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("Time,Exptime [s],Bias1 img #,Dark img #,Bias img #"));
    }
}
