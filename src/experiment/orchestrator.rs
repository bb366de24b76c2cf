//! Scan orchestration.
//!
//! [`ScanOrchestrator`] drives one wavelength scan over the bench devices:
//!
//! 1. Init: close the shutter, configure the picoammeter, read the wheel position.
//! 2. PreDark: one dark with photodiode sampling before the first point.
//! 3. For every filter pass and every point: move the grating (from home for the first
//!    point of a pass), select the filter, take a bias with the shutter closed, then the
//!    science burst with the shutter open while the picoammeter is sampled, close the
//!    shutter and, every `dark_cadence` points, take a periodic dark.
//! 4. PostDark, then home the monochromator.
//!
//! Each acquisition appends a row to the scan log as soon as the camera call returns.
//! Photodiode samples are written to one CSV per acquisition.
//!
//! # Concurrency
//!
//! The camera call runs in a spawned task. While it is in flight the orchestrator
//! samples the picoammeter in batches (the plan's `samples` first, then
//! [`OrchestratorSettings::next_batch`]) and checks the task after each batch. A failed
//! batch is dropped with a warning; the acquisition carries on.
//!
//! # Failure
//!
//! Any other error moves the run to [`ScanState::Error`], closes the shutter and homes the
//! monochromator (both best effort) and returns [`BenchError::ScanAborted`] carrying the
//! state, wavelength and filter at the time of failure.

use crate::config::{BenchConfig, StorageConfig};
use crate::data::records::{AcquisitionRecord, ImageType};
use crate::data::storage::{
    create_experiment_folder, experiment_folder_name, photodiode_file_name, AcquisitionLog,
};
use crate::error::{AppResult, BenchError};
use crate::experiment::plan::{ScanPlan, ScanPoint};
use crate::experiment::state::{ScanRun, ScanState};
use crate::hardware::capabilities::Camera;
use crate::hardware::filter_wheel::FilterWheelController;
use crate::hardware::monochromator::{MonochromatorController, HOME_WAVELENGTH_NM};
use crate::hardware::picoammeter::{PhotodiodeSeries, PicoammeterSampler};
use crate::hardware::shutter::ShutterController;
use crate::hardware::transport::Transport;
use crate::hardware::pause;
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

/// Every device the scan touches. The orchestrator is their only user while a scan runs.
pub struct BenchDevices {
    /// Scan controller
    pub monochromator: MonochromatorController,
    /// Filter wheel
    pub filter_wheel: FilterWheelController,
    /// Shutter
    pub shutter: ShutterController,
    /// Picoammeter
    pub picoammeter: PicoammeterSampler,
    /// Camera, shared with the exposure task
    pub camera: Arc<dyn Camera>,
}

impl BenchDevices {
    /// Build every controller from configuration over one transport.
    pub fn from_config(
        config: &BenchConfig,
        transport: Arc<dyn Transport>,
        camera: Arc<dyn Camera>,
    ) -> Self {
        Self {
            monochromator: MonochromatorController::new(
                Arc::clone(&transport),
                config.ports.monochromator_port(),
                config.monochromator.clone(),
            ),
            filter_wheel: FilterWheelController::new(
                Arc::clone(&transport),
                config.ports.filter_wheel_port(),
                config.filter_wheel.timing.clone(),
            ),
            shutter: ShutterController::new(Arc::clone(&transport), config.ports.shutter_port()),
            picoammeter: PicoammeterSampler::new(
                transport,
                config.ports.picoammeter_port(),
                config.picoammeter.clone(),
            ),
            camera,
        }
    }
}

/// Orchestrator knobs that are not part of the scan plan.
#[derive(Debug, Clone, PartialEq)]
pub struct OrchestratorSettings {
    /// Photodiode samples per batch after the first
    pub next_batch: usize,
    /// Batches per acquisition before sampling stops and the camera is simply awaited
    pub max_batches: usize,
    /// Pause after a bias before opening the shutter
    pub camera_settle: Duration,
    /// Nominal photodiode sample spacing
    pub sample_interval: Duration,
    /// Scan log file name inside the output directory
    pub scan_log: String,
    /// Write one photodiode CSV per acquisition
    pub save_photodiode: bool,
    /// Write the JSON run summary when the scan ends
    pub save_summary: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            next_batch: 5,
            max_batches: 10_000,
            camera_settle: Duration::from_millis(200),
            sample_interval: Duration::from_millis(100),
            scan_log: "scan_log.csv".to_string(),
            save_photodiode: true,
            save_summary: true,
        }
    }
}

impl OrchestratorSettings {
    /// Settings from the bench configuration
    pub fn from_config(config: &BenchConfig) -> Self {
        Self {
            camera_settle: config.camera.settle,
            sample_interval: config.picoammeter.interval,
            scan_log: config.storage.scan_log.clone(),
            save_photodiode: config.storage.save_photodiode,
            save_summary: config.storage.save_summary,
            ..Self::default()
        }
    }

    /// No settle delay. For simulated hardware.
    pub fn immediate() -> Self {
        Self {
            camera_settle: Duration::ZERO,
            ..Self::default()
        }
    }
}

/// Directory a scan writes into.
///
/// `storage.output_dir` when set, otherwise the camera's data directory; with
/// `storage.experiment_folders` a dated experiment folder is created beneath it.
pub async fn resolve_output_dir(
    storage: &StorageConfig,
    plan: &ScanPlan,
    camera: &dyn Camera,
) -> AppResult<PathBuf> {
    let base = match &storage.output_dir {
        Some(dir) => dir.clone(),
        None => PathBuf::from(camera.path().await?),
    };
    if !storage.experiment_folders {
        return Ok(base);
    }
    let config = plan.config();
    let slit_um = config.slit_um.ok_or_else(|| {
        BenchError::Configuration("scan.slit_um is needed for the experiment folder".to_string())
    })?;
    let name = experiment_folder_name(
        Local::now().date_naive(),
        plan.lamp(),
        slit_um,
        config.start_wl,
        config.end_wl,
    );
    create_experiment_folder(base, &name)
}

/// Runs a [`ScanPlan`] on a set of [`BenchDevices`].
pub struct ScanOrchestrator {
    devices: BenchDevices,
    plan: ScanPlan,
    settings: OrchestratorSettings,
}

impl ScanOrchestrator {
    /// Create an orchestrator. Nothing is sent to the devices until [`ScanOrchestrator::run`].
    pub fn new(devices: BenchDevices, plan: ScanPlan, settings: OrchestratorSettings) -> Self {
        Self {
            devices,
            plan,
            settings,
        }
    }

    /// The plan being run
    pub fn plan(&self) -> &ScanPlan {
        &self.plan
    }

    /// The devices
    pub fn devices(&self) -> &BenchDevices {
        &self.devices
    }

    /// Give the devices back
    pub fn into_devices(self) -> BenchDevices {
        self.devices
    }

    /// Run the scan, writing the log and photodiode files into `output_dir`.
    #[instrument(skip(self, output_dir), fields(lamp = %self.plan.lamp()))]
    pub async fn run(&mut self, output_dir: impl Into<PathBuf>) -> AppResult<ScanRun> {
        let mut run = ScanRun::new(output_dir);
        info!(
            run_id = %run.id,
            points = self.plan.total_points(),
            output_dir = %run.output_dir.display(),
            "scan starting"
        );

        let outcome = self.execute(&mut run).await;
        match outcome {
            Ok(()) => {
                info!(run_id = %run.id, records = run.records.len(), "scan complete");
                if self.settings.save_summary {
                    run.save_summary(run.summary_path())?;
                }
                Ok(run)
            }
            Err(source) => {
                let state = run.fail(&source);
                error!(%state, wavelength_nm = ?run.wavelength_nm, filter = ?run.filter, error = %source, "scan aborted");
                self.make_safe().await;
                if self.settings.save_summary {
                    if let Err(e) = run.save_summary(run.summary_path()) {
                        warn!(error = %e, "could not write run summary");
                    }
                }
                Err(BenchError::ScanAborted {
                    state,
                    wavelength: run.wavelength_nm,
                    filter: run.filter,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn execute(&mut self, run: &mut ScanRun) -> AppResult<()> {
        let mut log = AcquisitionLog::open(run.output_dir.join(&self.settings.scan_log))?;
        let points: Vec<ScanPoint> = self.plan.points().to_vec();
        let (first, last) = match (points.first(), points.last()) {
            (Some(first), Some(last)) => (*first, *last),
            _ => return Err(BenchError::Configuration("scan plan has no points".to_string())),
        };

        // Init
        self.devices.shutter.close().await?;
        self.devices.picoammeter.initialize().await?;
        run.filter = Some(self.devices.filter_wheel.position().await?);

        run.transition(ScanState::PreDark)?;
        let filter = current_filter(run)?;
        self.dark(run, &mut log, first.wavelength_nm, first.exposure_s, filter)
            .await?;

        let passes = self.plan.passes().to_vec();
        for (pass_index, pass) in passes.into_iter().enumerate() {
            info!(pass = pass_index + 1, ?pass, "filter pass starting");
            let mut previous: Option<f64> = None;
            for point in &points {
                run.transition(ScanState::MoveToWavelength)?;
                match previous {
                    None => {
                        self.devices
                            .monochromator
                            .go_to_from_home(point.wavelength_nm)
                            .await?
                    }
                    Some(from) => {
                        self.devices
                            .monochromator
                            .go_to_from(from, point.wavelength_nm)
                            .await?
                    }
                }
                run.wavelength_nm = Some(point.wavelength_nm);
                previous = Some(point.wavelength_nm);

                run.transition(ScanState::SelectFilter)?;
                let target = self.plan.filter_for(pass, point);
                if run.filter != Some(target) {
                    run.filter = None;
                    self.devices.filter_wheel.set_position(target).await?;
                }
                run.filter = Some(target);

                run.transition(ScanState::Expose)?;
                self.expose(run, &mut log, point, target).await?;

                if self.plan.dark_due(point.index) {
                    run.transition(ScanState::PeriodicDark)?;
                    self.dark(run, &mut log, point.wavelength_nm, point.exposure_s, target)
                        .await?;
                    run.dark_count += 1;
                }
                info!(
                    point = point.index,
                    of = points.len(),
                    wavelength_nm = point.wavelength_nm,
                    filter = target,
                    "point complete"
                );
            }
        }

        run.transition(ScanState::PostDark)?;
        let filter = current_filter(run)?;
        self.dark(run, &mut log, last.wavelength_nm, last.exposure_s, filter)
            .await?;

        run.transition(ScanState::Home)?;
        self.devices.monochromator.home().await?;
        run.wavelength_nm = Some(HOME_WAVELENGTH_NM);

        run.transition(ScanState::Done)?;
        Ok(())
    }

    /// Bias with the shutter closed, then the science burst with the shutter open.
    async fn expose(
        &mut self,
        run: &mut ScanRun,
        log: &mut AcquisitionLog,
        point: &ScanPoint,
        filter: u8,
    ) -> AppResult<()> {
        self.devices.shutter.close().await?;
        let imno = self.devices.camera.image_number().await?;
        self.devices.camera.bias().await?;
        self.record(run, log, ImageType::Bias, point.exposure_s, point.wavelength_nm, imno, filter)?;
        pause(self.settings.camera_settle).await;

        self.devices.shutter.open().await?;
        let imno = self.devices.camera.image_number().await?;
        let series = self
            .acquire_with_photodiode(ImageType::Exposure, point.exposure_s)
            .await?;
        self.record(
            run,
            log,
            ImageType::Exposure,
            point.exposure_s,
            point.wavelength_nm,
            imno,
            filter,
        )?;
        self.save_photodiode(run, &series, ImageType::Exposure, filter, point.wavelength_nm, imno)?;
        self.devices.shutter.close().await
    }

    /// Dark burst with photodiode sampling. The shutter is expected closed.
    async fn dark(
        &mut self,
        run: &mut ScanRun,
        log: &mut AcquisitionLog,
        wavelength_nm: f64,
        exposure_s: f64,
        filter: u8,
    ) -> AppResult<()> {
        let imno = self.devices.camera.image_number().await?;
        let series = self
            .acquire_with_photodiode(ImageType::Dark, exposure_s)
            .await?;
        self.record(run, log, ImageType::Dark, exposure_s, wavelength_nm, imno, filter)?;
        self.save_photodiode(run, &series, ImageType::Dark, filter, wavelength_nm, imno)
    }

    /// Run a camera burst in a spawned task while sampling the picoammeter.
    async fn acquire_with_photodiode(
        &mut self,
        imtype: ImageType,
        exposure_s: f64,
    ) -> AppResult<PhotodiodeSeries> {
        let camera = Arc::clone(&self.devices.camera);
        let burst = self.plan.burst();
        let task = tokio::spawn(async move {
            match imtype {
                ImageType::Dark => camera.dark_burst(exposure_s, burst).await,
                _ => camera.exposure_burst(exposure_s, burst).await,
            }
        });

        let origin = Instant::now();
        let interval = self.settings.sample_interval;
        let mut series = PhotodiodeSeries::new();
        let mut batch_size = self.plan.samples();
        let mut batches = 0;
        loop {
            batches += 1;
            match self
                .devices
                .picoammeter
                .sample_from(batch_size, interval, origin)
                .await
            {
                Ok(batch) => series.extend(batch),
                Err(e) => warn!(%imtype, batch = batches, error = %e, "photodiode batch dropped"),
            }
            if task.is_finished() {
                break;
            }
            if batches >= self.settings.max_batches {
                warn!(%imtype, batches, "photodiode batch limit reached; waiting for camera");
                break;
            }
            batch_size = self.settings.next_batch;
            tokio::task::yield_now().await;
        }

        task.await
            .map_err(|e| BenchError::Camera(format!("{imtype} task failed: {e}")))??;
        debug!(%imtype, samples = series.len(), batches, "acquisition complete");
        Ok(series)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        run: &mut ScanRun,
        log: &mut AcquisitionLog,
        imtype: ImageType,
        exposure_s: f64,
        wavelength_nm: f64,
        imno: u64,
        filter: u8,
    ) -> AppResult<()> {
        let record =
            AcquisitionRecord::now(imtype, exposure_s, self.plan.lamp(), wavelength_nm, imno, filter);
        log.append(&record)?;
        run.records.push(record);
        Ok(())
    }

    fn save_photodiode(
        &self,
        run: &mut ScanRun,
        series: &PhotodiodeSeries,
        imtype: ImageType,
        filter: u8,
        wavelength_nm: f64,
        imno: u64,
    ) -> AppResult<()> {
        if !self.settings.save_photodiode {
            return Ok(());
        }
        let path = run
            .output_dir
            .join(photodiode_file_name(imtype, filter, wavelength_nm, imno));
        series.write_csv(&path)?;
        run.photodiode_files.push(path);
        Ok(())
    }

    /// Shutter closed and grating home, ignoring failures.
    async fn make_safe(&mut self) {
        if let Err(e) = self.devices.shutter.close().await {
            warn!(error = %e, "could not close shutter after abort");
        }
        if let Err(e) = self.devices.monochromator.home().await {
            warn!(error = %e, "could not home monochromator after abort");
        }
    }
}

fn current_filter(run: &ScanRun) -> AppResult<u8> {
    run.filter
        .ok_or_else(|| BenchError::Configuration("filter position unknown".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::plan::ScanPlanConfig;
    use crate::hardware::filter_wheel::{FilterBreakpointTable, FilterWheelTiming};
    use crate::hardware::mock::{
        MockCamera, MockTransport, SimulatedFilterWheel, SimulatedPicoammeter,
        SimulatedScanController, SimulatedShutter,
    };
    use crate::hardware::monochromator::MonochromatorTiming;
    use crate::hardware::picoammeter::PicoammeterConfig;
    use crate::hardware::transport::PortConfig;
    use crate::hardware::PollPolicy;
    use tempfile::tempdir;
    use tracing_test::traced_test;

    fn devices(transport: &MockTransport, camera: MockCamera) -> BenchDevices {
        let transport: Arc<dyn Transport> = Arc::new(transport.clone());
        let picoammeter = PicoammeterConfig {
            interval: Duration::ZERO,
            opc_poll: PollPolicy::immediate(10),
            ..PicoammeterConfig::default()
        };
        BenchDevices {
            monochromator: MonochromatorController::new(
                Arc::clone(&transport),
                PortConfig::mcpherson("MC"),
                MonochromatorTiming::immediate(20),
            ),
            filter_wheel: FilterWheelController::new(
                Arc::clone(&transport),
                PortConfig::mcpherson("FW"),
                FilterWheelTiming::immediate(),
            ),
            shutter: ShutterController::new(Arc::clone(&transport), PortConfig::mcpherson("SH")),
            picoammeter: PicoammeterSampler::new(
                transport,
                PortConfig::keithley("PICO"),
                picoammeter,
            ),
            camera: Arc::new(camera),
        }
    }

    fn plan(start: f64, end: f64, step: f64) -> ScanPlan {
        let config = ScanPlanConfig::new(start, end, step, "D2", 1.0);
        ScanPlan::new(config, FilterBreakpointTable::default()).unwrap()
    }

    #[tokio::test]
    #[traced_test]
    async fn failed_photodiode_batches_are_dropped() {
        let dir = tempdir().unwrap();
        let pico = SimulatedPicoammeter::new();
        pico.set_faulty(true);
        let transport = MockTransport::new()
            .with_device("MC", SimulatedScanController::new())
            .with_device("FW", SimulatedFilterWheel::new(1))
            .with_device("SH", SimulatedShutter::new())
            .with_device("PICO", pico.clone());
        let camera = MockCamera::new(dir.path().display().to_string());

        let mut orchestrator = ScanOrchestrator::new(
            devices(&transport, camera),
            plan(100.0, 100.0, 1.0),
            OrchestratorSettings::immediate(),
        );
        let run = orchestrator.run(dir.path()).await.unwrap();

        assert_eq!(run.state(), ScanState::Done);
        assert_eq!(run.records.len(), 4);
        assert!(pico.read_count() > 0);
        assert!(logs_contain("photodiode batch dropped"));
    }

    #[tokio::test]
    async fn photodiode_files_for_sampled_acquisitions() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new()
            .with_device("MC", SimulatedScanController::new())
            .with_device("FW", SimulatedFilterWheel::new(1))
            .with_device("SH", SimulatedShutter::new())
            .with_device("PICO", SimulatedPicoammeter::new());
        let camera = MockCamera::new(dir.path().display().to_string());

        let mut settings = OrchestratorSettings::immediate();
        settings.save_summary = false;
        let mut orchestrator =
            ScanOrchestrator::new(devices(&transport, camera), plan(200.0, 200.0, 1.0), settings);
        let run = orchestrator.run(dir.path()).await.unwrap();

        // Dark, bias, exposure, dark; three of them sampled.
        assert_eq!(run.photodiode_files.len(), 3);
        for path in &run.photodiode_files {
            let text = std::fs::read_to_string(path).unwrap();
            assert!(text.starts_with("Ch1,Ch2,Elapsed_time"));
            // At least the first batch of 10 samples.
            assert!(text.lines().count() > 10);
        }
        assert!(!run.summary_path().exists());
    }

    #[tokio::test]
    async fn summary_is_written_on_success() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new()
            .with_device("MC", SimulatedScanController::new())
            .with_device("FW", SimulatedFilterWheel::new(1))
            .with_device("SH", SimulatedShutter::new())
            .with_device("PICO", SimulatedPicoammeter::new());
        let camera = MockCamera::new(dir.path().display().to_string());

        let mut orchestrator = ScanOrchestrator::new(
            devices(&transport, camera),
            plan(300.0, 310.0, 10.0),
            OrchestratorSettings::immediate(),
        );
        let run = orchestrator.run(dir.path()).await.unwrap();

        let summary = std::fs::read_to_string(run.summary_path()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&summary).unwrap();
        assert_eq!(value["state"], "Done");
        assert_eq!(value["records"].as_array().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn scan_ending_at_the_range_limit_completes() {
        let dir = tempdir().unwrap();
        let transport = MockTransport::new()
            .with_device("MC", SimulatedScanController::new())
            .with_device("FW", SimulatedFilterWheel::new(1))
            .with_device("SH", SimulatedShutter::new())
            .with_device("PICO", SimulatedPicoammeter::new());
        let camera = MockCamera::new(dir.path().display().to_string());

        // 3073 points whose unclamped last value is 900.0000000000001
        let mut config = ScanPlanConfig::new(285.6, 900.0, 0.2, "QTH", 0.0);
        config.dark_cadence = 0;
        config.samples = 1;
        let plan = ScanPlan::new(config, FilterBreakpointTable::default()).unwrap();
        assert_eq!(plan.points().len(), 3073);

        let mut settings = OrchestratorSettings::immediate();
        settings.save_photodiode = false;
        settings.save_summary = false;
        let mut orchestrator =
            ScanOrchestrator::new(devices(&transport, camera), plan, settings);
        let run = orchestrator.run(dir.path()).await.unwrap();

        assert_eq!(run.state(), ScanState::Done);
        assert_eq!(run.records.len(), 2 * 3073 + 2);
        let last = run
            .records
            .iter()
            .rev()
            .find(|r| r.imtype == ImageType::Exposure)
            .unwrap();
        assert_eq!(last.wavelength_nm, 900.0);
    }
}
