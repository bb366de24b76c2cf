//! Log records and CSV storage.
pub mod records;
pub mod storage;

pub use records::{AcquisitionRecord, DarkSeriesRecord, ImageType};
pub use storage::{AcquisitionLog, CsvLog, DarkSeriesLog};
