//! Scan planning, state and orchestration.
//!
//! - [`plan`]: wavelength grid, filter passes and dark cadence
//! - [`state`]: the scan state machine and run bookkeeping
//! - [`orchestrator`]: runs a plan on the bench devices
//! - [`ptc`]: photon transfer and dark-current series
pub mod orchestrator;
pub mod plan;
pub mod ptc;
pub mod state;

pub use orchestrator::{BenchDevices, OrchestratorSettings, ScanOrchestrator};
pub use plan::{FilterSelection, ScanPlan, ScanPlanConfig, ScanPoint};
pub use ptc::{run_dark_series, run_ptc, DarkSeriesConfig, PtcConfig};
pub use state::{ScanRun, ScanState, StateChange};
