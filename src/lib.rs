//! # Spectral Bench
//!
//! Control library for a spectral calibration bench: a McPherson 789A-4 scan controller
//! driving a monochromator grating, a McPherson 747 filter wheel, a VCM-D1 shutter, a
//! Keithley 6482 picoammeter reading the reference photodiodes, and a camera driven
//! through its command-line client.
//!
//! ## Crate Structure
//!
//! - **`config`**: `BenchConfig` loaded from TOML with `SPECTRAL_BENCH_` environment
//!   overrides, plus the serial port alias database.
//! - **`data`**: log records and append-only CSV storage.
//! - **`error`**: the `BenchError` enum used across the crate.
//! - **`experiment`**: scan plans, the scan state machine, the orchestrator and the
//!   photon transfer / dark series procedures.
//! - **`hardware`**: serial transport, one controller per instrument, the `Camera`
//!   capability and simulated devices.
//! - **`tracing_setup`**: structured logging initialisation.

pub mod config;
pub mod data;
pub mod error;
pub mod experiment;
pub mod hardware;
pub mod tracing_setup;
