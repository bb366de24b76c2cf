//! Scan state machine and run context.
//!
//! # State Machine
//!
//! ```text
//! Init ──> PreDark ──> MoveToWavelength ──> SelectFilter ──> Expose ─┬─> PostDark ──> Home ──> Done
//!                            ▲                                       │
//!                            │                                       ├─> PeriodicDark ─┐
//!                            └───────────────────────────────────────┴──────────────────┘
//!
//! any state except Done ──> Error
//! ```
//!
//! [`ScanRun`] is the live context of one scan: where the monochromator and wheel are,
//! which records have been written and how the run ended. Only the orchestrator
//! mutates it, and every state change goes through [`ScanRun::transition`].

use crate::data::records::AcquisitionRecord;
use crate::error::{AppResult, BenchError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Scan orchestration state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScanState {
    /// Devices being initialised
    Init,
    /// Dark frame before the first point
    PreDark,
    /// Grating moving to the next wavelength
    MoveToWavelength,
    /// Filter wheel being positioned
    SelectFilter,
    /// Bias and science exposure at the current point
    Expose,
    /// Periodic dark frame
    PeriodicDark,
    /// Dark frame after the last point
    PostDark,
    /// Monochromator returning home
    Home,
    /// Scan complete
    Done,
    /// Scan aborted
    Error,
}

impl std::fmt::Display for ScanState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ScanState::Init => "Init",
            ScanState::PreDark => "PreDark",
            ScanState::MoveToWavelength => "MoveToWavelength",
            ScanState::SelectFilter => "SelectFilter",
            ScanState::Expose => "Expose",
            ScanState::PeriodicDark => "PeriodicDark",
            ScanState::PostDark => "PostDark",
            ScanState::Home => "Home",
            ScanState::Done => "Done",
            ScanState::Error => "Error",
        };
        write!(f, "{name}")
    }
}

impl ScanState {
    /// Whether the machine may move from `self` to `next`.
    pub fn can_transition_to(&self, next: ScanState) -> bool {
        use ScanState::*;
        match (*self, next) {
            (Done, _) => false,
            (Error, _) => false,
            (_, Error) => true,
            (Init, PreDark)
            | (PreDark, MoveToWavelength)
            | (MoveToWavelength, SelectFilter)
            | (SelectFilter, Expose)
            | (Expose, PeriodicDark | MoveToWavelength | PostDark)
            | (PeriodicDark, MoveToWavelength | PostDark)
            | (PostDark, Home)
            | (Home, Done) => true,
            _ => false,
        }
    }

    /// Whether the run has ended
    pub fn is_terminal(&self) -> bool {
        matches!(self, ScanState::Done | ScanState::Error)
    }
}

/// One entry of the state history
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    /// State entered
    pub state: ScanState,
    /// When it was entered
    pub at: DateTime<Utc>,
}

/// Live context of one scan.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanRun {
    /// Unique run identifier
    pub id: Uuid,
    /// Run start
    pub started: DateTime<Utc>,
    /// Run end, once terminal
    pub finished: Option<DateTime<Utc>>,
    /// Directory receiving the scan log and photodiode files
    pub output_dir: PathBuf,
    state: ScanState,
    history: Vec<StateChange>,
    /// Wavelength of the last completed move, nm
    pub wavelength_nm: Option<f64>,
    /// Filter slot the wheel was last confirmed at
    pub filter: Option<u8>,
    /// Periodic darks taken so far
    pub dark_count: usize,
    /// Log rows written so far
    pub records: Vec<AcquisitionRecord>,
    /// Photodiode files written so far
    pub photodiode_files: Vec<PathBuf>,
    /// Failure description for aborted runs
    pub error: Option<String>,
}

impl ScanRun {
    /// New run in [`ScanState::Init`]
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        let started = Utc::now();
        Self {
            id: Uuid::new_v4(),
            started,
            finished: None,
            output_dir: output_dir.into(),
            state: ScanState::Init,
            history: vec![StateChange {
                state: ScanState::Init,
                at: started,
            }],
            wavelength_nm: None,
            filter: None,
            dark_count: 0,
            records: Vec::new(),
            photodiode_files: Vec::new(),
            error: None,
        }
    }

    /// Current state
    pub fn state(&self) -> ScanState {
        self.state
    }

    /// States entered, in order
    pub fn history(&self) -> &[StateChange] {
        &self.history
    }

    /// Move to `next`, rejecting transitions the state machine does not allow.
    pub fn transition(&mut self, next: ScanState) -> AppResult<()> {
        if !self.state.can_transition_to(next) {
            return Err(BenchError::InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        let at = Utc::now();
        self.state = next;
        self.history.push(StateChange { state: next, at });
        if next.is_terminal() {
            self.finished = Some(at);
        }
        Ok(())
    }

    /// Mark the run as failed. Returns the state the failure happened in.
    pub fn fail(&mut self, error: &BenchError) -> ScanState {
        let failed_in = self.state;
        self.error = Some(error.to_string());
        if self.transition(ScanState::Error).is_err() {
            // Already terminal; keep the first outcome.
            self.finished.get_or_insert_with(Utc::now);
        }
        failed_in
    }

    /// Write the run summary as pretty JSON.
    pub fn save_summary(&self, path: impl AsRef<Path>) -> AppResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path.as_ref(), json)?;
        Ok(())
    }

    /// Default summary location: `scan_<id>.json` in the output directory
    pub fn summary_path(&self) -> PathBuf {
        self.output_dir.join(format!("scan_{}.json", self.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn happy_path_transitions() {
        let mut run = ScanRun::new("out");
        for next in [
            ScanState::PreDark,
            ScanState::MoveToWavelength,
            ScanState::SelectFilter,
            ScanState::Expose,
            ScanState::PeriodicDark,
            ScanState::MoveToWavelength,
            ScanState::SelectFilter,
            ScanState::Expose,
            ScanState::PostDark,
            ScanState::Home,
            ScanState::Done,
        ] {
            run.transition(next).unwrap();
        }
        assert_eq!(run.state(), ScanState::Done);
        assert_eq!(run.history().len(), 12);
        assert!(run.finished.is_some());
    }

    #[test]
    fn rejects_skipping_states() {
        let mut run = ScanRun::new("out");
        let err = run.transition(ScanState::Expose).unwrap_err();
        assert!(matches!(
            err,
            BenchError::InvalidTransition {
                from: ScanState::Init,
                to: ScanState::Expose
            }
        ));
        assert_eq!(run.state(), ScanState::Init);
    }

    #[test]
    fn error_reachable_from_any_live_state() {
        for state in [
            ScanState::Init,
            ScanState::PreDark,
            ScanState::MoveToWavelength,
            ScanState::SelectFilter,
            ScanState::Expose,
            ScanState::PeriodicDark,
            ScanState::PostDark,
            ScanState::Home,
        ] {
            assert!(state.can_transition_to(ScanState::Error), "{state}");
        }
        assert!(!ScanState::Done.can_transition_to(ScanState::Error));
    }

    #[test]
    fn fail_records_error_and_state() {
        let mut run = ScanRun::new("out");
        run.transition(ScanState::PreDark).unwrap();
        let failed_in = run.fail(&BenchError::Camera("server down".into()));
        assert_eq!(failed_in, ScanState::PreDark);
        assert_eq!(run.state(), ScanState::Error);
        assert!(run.error.as_deref().unwrap().contains("server down"));
    }

    #[test]
    fn summary_is_written_as_json() {
        let dir = tempdir().unwrap();
        let mut run = ScanRun::new(dir.path());
        run.wavelength_nm = Some(105.0);
        run.filter = Some(1);
        let path = run.summary_path();
        run.save_summary(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["state"], "Init");
        assert_eq!(value["wavelength_nm"], 105.0);
        assert_eq!(value["filter"], 1);
    }
}
