//! Scan plans.
//!
//! A [`ScanPlanConfig`] is what the operator writes in the `[scan]` table of the bench
//! configuration. [`ScanPlan::new`] validates it once and freezes the result: the
//! wavelength list, filter passes and exposure schedule cannot change after a scan
//! starts.

use crate::error::{AppResult, BenchError};
use crate::hardware::filter_wheel::{FilterBreakpointTable, SLOT_COUNT};
use crate::hardware::monochromator::{validate_wavelength, MICROSTEPS_PER_NM};
use serde::{Deserialize, Serialize};

/// Tolerance used when deciding whether the end wavelength is on the step grid
const GRID_EPSILON_NM: f64 = 1e-6;

/// Scan parameters as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanPlanConfig {
    /// First wavelength, nm
    pub start_wl: f64,
    /// Last wavelength (inclusive when on the step grid), nm
    pub end_wl: f64,
    /// Wavelength increment, nm
    pub step: f64,
    /// Lamp identifier written into every log row
    pub lamp: String,
    /// Fixed filters to sweep with, one full pass per filter.
    /// When absent the filter follows the breakpoint table.
    #[serde(default)]
    pub filters: Option<Vec<u8>>,
    /// Exposure time for every point, seconds
    pub exposure_time: f64,
    /// Per-point exposure times, seconds. Overrides `exposure_time`.
    #[serde(default)]
    pub exposure_times: Option<Vec<f64>>,
    /// Exposures per burst
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// A periodic dark is taken after every Nth point (1-based). 0 disables them.
    #[serde(default = "default_dark_cadence")]
    pub dark_cadence: usize,
    /// Photodiode samples in the first batch of each acquisition
    #[serde(default = "default_samples")]
    pub samples: usize,
    /// Entrance slit width, used for the experiment folder name
    #[serde(default)]
    pub slit_um: Option<f64>,
}

fn default_burst() -> u32 {
    1
}

fn default_dark_cadence() -> usize {
    10
}

fn default_samples() -> usize {
    10
}

impl ScanPlanConfig {
    /// Minimal plan over `[start_wl, end_wl]`; everything else at its default.
    pub fn new(start_wl: f64, end_wl: f64, step: f64, lamp: impl Into<String>, exposure_time: f64) -> Self {
        Self {
            start_wl,
            end_wl,
            step,
            lamp: lamp.into(),
            filters: None,
            exposure_time,
            exposure_times: None,
            burst: default_burst(),
            dark_cadence: default_dark_cadence(),
            samples: default_samples(),
            slit_um: None,
        }
    }
}

/// How the wheel is driven during a pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FilterSelection {
    /// Filter chosen per point from the breakpoint table
    Automatic,
    /// Wheel held at this slot for the whole pass
    Fixed(u8),
}

/// One wavelength of a pass
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScanPoint {
    /// 1-based index within the pass
    pub index: usize,
    /// Target wavelength, nm
    pub wavelength_nm: f64,
    /// Exposure time, seconds
    pub exposure_s: f64,
}

/// Validated, immutable scan plan.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScanPlan {
    config: ScanPlanConfig,
    table: FilterBreakpointTable,
    points: Vec<ScanPoint>,
    passes: Vec<FilterSelection>,
}

impl ScanPlan {
    /// Validate `config` against the bench limits and freeze it.
    pub fn new(config: ScanPlanConfig, table: FilterBreakpointTable) -> AppResult<Self> {
        if !(config.step.is_finite() && config.step > 0.0) {
            return Err(BenchError::Configuration(format!(
                "scan step must be positive, got {}",
                config.step
            )));
        }
        if config.step < 1.0 / MICROSTEPS_PER_NM {
            return Err(BenchError::Configuration(format!(
                "scan step {} nm is finer than one microstep (1/{MICROSTEPS_PER_NM} nm)",
                config.step
            )));
        }
        validate_wavelength(config.start_wl)?;
        validate_wavelength(config.end_wl)?;
        if config.end_wl < config.start_wl {
            return Err(BenchError::Configuration(format!(
                "scan runs downwards ({} nm to {} nm); scans must ascend",
                config.start_wl, config.end_wl
            )));
        }
        if config.lamp.trim().is_empty() {
            return Err(BenchError::Configuration("lamp must be named".to_string()));
        }
        if config.burst == 0 {
            return Err(BenchError::Configuration("burst must be at least 1".to_string()));
        }
        if config.samples == 0 {
            return Err(BenchError::Configuration(
                "photodiode samples must be at least 1".to_string(),
            ));
        }
        validate_exposure(config.exposure_time)?;

        let wavelengths = wavelength_grid(config.start_wl, config.end_wl, config.step);

        let exposures = match &config.exposure_times {
            Some(times) => {
                if times.len() != wavelengths.len() {
                    return Err(BenchError::Configuration(format!(
                        "{} exposure times given for {} wavelengths",
                        times.len(),
                        wavelengths.len()
                    )));
                }
                for &t in times {
                    validate_exposure(t)?;
                }
                times.clone()
            }
            None => vec![config.exposure_time; wavelengths.len()],
        };

        let passes = match &config.filters {
            Some(filters) => {
                if filters.is_empty() {
                    return Err(BenchError::Configuration(
                        "filter list is empty; omit it to follow the breakpoint table"
                            .to_string(),
                    ));
                }
                if let Some(bad) = filters.iter().find(|f| !(1..=SLOT_COUNT).contains(*f)) {
                    return Err(BenchError::Range(format!(
                        "filter {bad} is outside 1-{SLOT_COUNT}"
                    )));
                }
                filters.iter().map(|&f| FilterSelection::Fixed(f)).collect()
            }
            None => vec![FilterSelection::Automatic],
        };

        let points = wavelengths
            .into_iter()
            .zip(exposures)
            .enumerate()
            .map(|(i, (wavelength_nm, exposure_s))| ScanPoint {
                index: i + 1,
                wavelength_nm,
                exposure_s,
            })
            .collect();

        Ok(Self {
            config,
            table,
            points,
            passes,
        })
    }

    /// The configuration this plan was built from
    pub fn config(&self) -> &ScanPlanConfig {
        &self.config
    }

    /// Breakpoint table for automatic filter selection
    pub fn table(&self) -> &FilterBreakpointTable {
        &self.table
    }

    /// Points of one pass, ascending
    pub fn points(&self) -> &[ScanPoint] {
        &self.points
    }

    /// Filter passes in order
    pub fn passes(&self) -> &[FilterSelection] {
        &self.passes
    }

    /// Lamp identifier
    pub fn lamp(&self) -> &str {
        &self.config.lamp
    }

    /// Exposures per burst
    pub fn burst(&self) -> u32 {
        self.config.burst
    }

    /// Photodiode samples in the first batch of each acquisition
    pub fn samples(&self) -> usize {
        self.config.samples
    }

    /// Whether a periodic dark follows the point with this 1-based index
    pub fn dark_due(&self, index: usize) -> bool {
        self.config.dark_cadence > 0 && index % self.config.dark_cadence == 0
    }

    /// Filter to use at `point` during `pass`
    pub fn filter_for(&self, pass: FilterSelection, point: &ScanPoint) -> u8 {
        match pass {
            FilterSelection::Fixed(filter) => filter,
            FilterSelection::Automatic => self.table.filter_for(point.wavelength_nm),
        }
    }

    /// Total points over all passes
    pub fn total_points(&self) -> usize {
        self.points.len() * self.passes.len()
    }
}

fn validate_exposure(exposure_s: f64) -> AppResult<()> {
    if !(exposure_s.is_finite() && exposure_s >= 0.0) {
        return Err(BenchError::Configuration(format!(
            "exposure time must be a non-negative number of seconds, got {exposure_s}"
        )));
    }
    Ok(())
}

/// `start + i * step` for every `i` that stays at or below `end`.
///
/// Points are computed by multiplication rather than accumulation, and the end is
/// included when it is within a small tolerance of the grid. No point exceeds `end`.
pub fn wavelength_grid(start: f64, end: f64, step: f64) -> Vec<f64> {
    let count = ((end - start) / step + GRID_EPSILON_NM).floor() as usize + 1;
    (0..count).map(|i| (start + i as f64 * step).min(end)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan(config: ScanPlanConfig) -> AppResult<ScanPlan> {
        ScanPlan::new(config, FilterBreakpointTable::default())
    }

    #[test]
    fn grid_includes_end_on_step() {
        assert_eq!(wavelength_grid(100.0, 110.0, 5.0), vec![100.0, 105.0, 110.0]);
        assert_eq!(wavelength_grid(100.0, 112.0, 5.0), vec![100.0, 105.0, 110.0]);
        assert_eq!(wavelength_grid(200.0, 200.0, 1.0), vec![200.0]);
        assert_eq!(wavelength_grid(150.0, 420.0, 10.0).len(), 28);
        assert_eq!(wavelength_grid(300.0, 300.3, 0.1).len(), 4);
    }

    #[test]
    fn grid_never_passes_the_end() {
        let grid = wavelength_grid(100.1, 900.0, 0.1);
        assert_eq!(grid.len(), 8000);
        assert!(grid.iter().all(|&wl| (100.1..=900.0).contains(&wl)));
        assert_eq!(grid.last().copied(), Some(900.0));

        let plan = plan(ScanPlanConfig::new(285.6, 900.0, 0.2, "QTH", 1.0)).unwrap();
        assert!(plan
            .points()
            .iter()
            .all(|p| validate_wavelength(p.wavelength_nm).is_ok()));
    }

    #[test]
    fn step_finer_than_a_microstep_rejected() {
        assert!(matches!(
            plan(ScanPlanConfig::new(100.0, 900.0, 1e-12, "D2", 1.0)),
            Err(BenchError::Configuration(_))
        ));
        assert!(plan(ScanPlanConfig::new(100.0, 100.01, 1.0 / MICROSTEPS_PER_NM, "D2", 1.0)).is_ok());
    }

    #[test]
    fn dark_cadence_counts_from_one() {
        let mut config = ScanPlanConfig::new(100.0, 200.0, 5.0, "D2", 1.0);
        config.dark_cadence = 10;
        let plan = plan(config).unwrap();
        assert_eq!(plan.points().len(), 21);
        let dark_points: Vec<usize> = plan
            .points()
            .iter()
            .map(|p| p.index)
            .filter(|&i| plan.dark_due(i))
            .collect();
        assert_eq!(dark_points, vec![10, 20]);
    }

    #[test]
    fn zero_cadence_disables_periodic_darks() {
        let mut config = ScanPlanConfig::new(100.0, 110.0, 5.0, "D2", 1.0);
        config.dark_cadence = 0;
        let plan = plan(config).unwrap();
        assert!(plan.points().iter().all(|p| !plan.dark_due(p.index)));
    }

    #[test]
    fn filter_list_gives_one_pass_per_filter() {
        let mut config = ScanPlanConfig::new(150.0, 170.0, 10.0, "D2", 40.0);
        config.filters = Some(vec![1, 2, 3]);
        let plan = plan(config).unwrap();
        assert_eq!(
            plan.passes(),
            &[
                FilterSelection::Fixed(1),
                FilterSelection::Fixed(2),
                FilterSelection::Fixed(3)
            ]
        );
        assert_eq!(plan.total_points(), 9);
        assert_eq!(plan.filter_for(plan.passes()[1], &plan.points()[0]), 2);
    }

    #[test]
    fn automatic_pass_follows_table() {
        let plan = plan(ScanPlanConfig::new(230.0, 250.0, 10.0, "Xe", 1.0)).unwrap();
        let filters: Vec<u8> = plan
            .points()
            .iter()
            .map(|p| plan.filter_for(FilterSelection::Automatic, p))
            .collect();
        assert_eq!(filters, vec![1, 1, 2]);
    }

    #[test]
    fn exposure_schedule_must_match_points() {
        let mut config = ScanPlanConfig::new(100.0, 110.0, 5.0, "D2", 1.0);
        config.exposure_times = Some(vec![1.0, 2.0]);
        assert!(matches!(plan(config.clone()), Err(BenchError::Configuration(_))));

        config.exposure_times = Some(vec![1.0, 2.0, 3.0]);
        let plan = plan(config).unwrap();
        let times: Vec<f64> = plan.points().iter().map(|p| p.exposure_s).collect();
        assert_eq!(times, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn rejects_out_of_range_and_bad_parameters() {
        assert!(matches!(
            plan(ScanPlanConfig::new(99.9, 110.0, 5.0, "D2", 1.0)),
            Err(BenchError::Range(_))
        ));
        assert!(matches!(
            plan(ScanPlanConfig::new(100.0, 900.1, 5.0, "D2", 1.0)),
            Err(BenchError::Range(_))
        ));
        assert!(plan(ScanPlanConfig::new(100.0, 110.0, 0.0, "D2", 1.0)).is_err());
        assert!(plan(ScanPlanConfig::new(110.0, 100.0, 5.0, "D2", 1.0)).is_err());
        assert!(plan(ScanPlanConfig::new(100.0, 110.0, 5.0, " ", 1.0)).is_err());
        assert!(plan(ScanPlanConfig::new(100.0, 110.0, 5.0, "D2", -1.0)).is_err());

        let mut config = ScanPlanConfig::new(100.0, 110.0, 5.0, "D2", 1.0);
        config.filters = Some(vec![6]);
        assert!(matches!(plan(config), Err(BenchError::Range(_))));
    }
}
