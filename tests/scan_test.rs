//! End-to-end scans on the simulated bench.

mod common;

use common::{scan_plan, SimBench, SH};
use spectral_bench::data::records::ImageType;
use spectral_bench::data::storage::read_acquisition_log;
use spectral_bench::error::BenchError;
use spectral_bench::experiment::plan::{ScanPlan, ScanPlanConfig};
use spectral_bench::experiment::ptc::{run_ptc, PtcConfig, PTC_LOG};
use spectral_bench::experiment::{OrchestratorSettings, ScanOrchestrator, ScanState};
use spectral_bench::hardware::filter_wheel::FilterBreakpointTable;
use spectral_bench::hardware::mock::MockCamera;
use std::sync::Arc;
use tempfile::tempdir;

fn count(records: &[spectral_bench::data::AcquisitionRecord], imtype: ImageType) -> usize {
    records.iter().filter(|r| r.imtype == imtype).count()
}

#[tokio::test]
async fn short_scan_logs_darks_biases_and_exposures() {
    let dir = tempdir().unwrap();
    let bench = SimBench::new();
    let camera = Arc::new(MockCamera::new(dir.path().display().to_string()));

    let mut orchestrator = ScanOrchestrator::new(
        bench.devices(Arc::clone(&camera)),
        scan_plan(100.0, 110.0, 5.0),
        OrchestratorSettings::immediate(),
    );
    let run = orchestrator.run(dir.path()).await.unwrap();

    assert_eq!(run.state(), ScanState::Done);
    assert_eq!(count(&run.records, ImageType::Dark), 2);
    assert_eq!(count(&run.records, ImageType::Bias), 3);
    assert_eq!(count(&run.records, ImageType::Exposure), 3);
    assert_eq!(run.dark_count, 0);

    let logged = read_acquisition_log(dir.path().join("scan_log.csv")).unwrap();
    assert_eq!(logged.len(), 8);
    let wavelengths: Vec<f64> = logged.iter().map(|r| r.wavelength_nm).collect();
    assert_eq!(wavelengths, vec![100.0, 100.0, 100.0, 105.0, 105.0, 110.0, 110.0, 110.0]);
    assert!(logged.iter().all(|r| r.lamp == "D2" && r.filter == 1));

    // Image numbers are the ones the camera reported before each acquisition.
    let imnos: Vec<u64> = logged.iter().map(|r| r.imno).collect();
    assert_eq!(imnos, (1..=8).collect::<Vec<u64>>());

    assert_eq!(run.photodiode_files.len(), 5);
    assert!(dir.path().join("picoa_Exposure_f1_105nm_5.csv").exists());
    assert!(!bench.shutter.is_open());
    assert_eq!(bench.transport.open_count(), bench.transport.close_count());
}

#[tokio::test]
async fn periodic_darks_follow_the_cadence() {
    let dir = tempdir().unwrap();
    let bench = SimBench::new();
    let camera = Arc::new(MockCamera::new(dir.path().display().to_string()));
    let mut config = ScanPlanConfig::new(200.0, 250.0, 10.0, "QTH", 0.5);
    config.dark_cadence = 2;
    let plan = ScanPlan::new(config, FilterBreakpointTable::default()).unwrap();

    let mut orchestrator =
        ScanOrchestrator::new(bench.devices(camera), plan, OrchestratorSettings::immediate());
    let run = orchestrator.run(dir.path()).await.unwrap();

    // Six points: periodic darks after points 2, 4 and 6, plus pre and post.
    assert_eq!(run.dark_count, 3);
    assert_eq!(count(&run.records, ImageType::Dark), 5);
    assert!(run.history().iter().any(|c| c.state == ScanState::PeriodicDark));
}

#[tokio::test]
async fn filter_changes_only_when_the_table_says_so() {
    let dir = tempdir().unwrap();
    let bench = SimBench::new();
    let camera = Arc::new(MockCamera::new(dir.path().display().to_string()));

    let mut orchestrator = ScanOrchestrator::new(
        bench.devices(camera),
        scan_plan(230.0, 250.0, 10.0),
        OrchestratorSettings::immediate(),
    );
    let run = orchestrator.run(dir.path()).await.unwrap();

    let filters: Vec<u8> = run
        .records
        .iter()
        .filter(|r| r.imtype == ImageType::Exposure)
        .map(|r| r.filter)
        .collect();
    assert_eq!(filters, vec![1, 1, 2]);
    assert_eq!(bench.wheel.increment_count(), 1);
    assert_eq!(run.filter, Some(2));
}

#[tokio::test]
async fn fixed_filter_passes_repeat_the_grid() {
    let dir = tempdir().unwrap();
    let bench = SimBench::new();
    let camera = Arc::new(MockCamera::new(dir.path().display().to_string()));
    let mut config = ScanPlanConfig::new(400.0, 410.0, 10.0, "Xe", 1.0);
    config.filters = Some(vec![3, 5]);
    let plan = ScanPlan::new(config, FilterBreakpointTable::default()).unwrap();

    let mut orchestrator =
        ScanOrchestrator::new(bench.devices(camera), plan, OrchestratorSettings::immediate());
    let run = orchestrator.run(dir.path()).await.unwrap();

    let filters: Vec<u8> = run
        .records
        .iter()
        .filter(|r| r.imtype == ImageType::Exposure)
        .map(|r| r.filter)
        .collect();
    assert_eq!(filters, vec![3, 3, 5, 5]);
    assert_eq!(bench.wheel.position(), 5);
}

#[tokio::test]
async fn camera_failure_aborts_with_shutter_closed() {
    let dir = tempdir().unwrap();
    let bench = SimBench::new();
    let camera = Arc::new(
        MockCamera::new(dir.path().display().to_string()).failing_on("expose"),
    );

    let mut orchestrator = ScanOrchestrator::new(
        bench.devices(camera),
        scan_plan(100.0, 110.0, 5.0),
        OrchestratorSettings::immediate(),
    );
    let err = orchestrator.run(dir.path()).await.unwrap_err();

    match &err {
        BenchError::ScanAborted {
            state,
            wavelength,
            filter,
            source,
        } => {
            assert_eq!(*state, ScanState::Expose);
            assert_eq!(*wavelength, Some(100.0));
            assert_eq!(*filter, Some(1));
            assert!(matches!(**source, BenchError::Camera(_)));
        }
        other => panic!("unexpected error {other}"),
    }
    assert!(err.is_device_error());
    assert!(!bench.shutter.is_open());
    // The last shutter command is the close sent on abort.
    assert_eq!(
        bench.transport.written_text(SH).last().map(String::as_str),
        Some("A")
    );

    // Pre-dark and the first bias made it to the log before the failure.
    let logged = read_acquisition_log(dir.path().join("scan_log.csv")).unwrap();
    assert_eq!(logged.len(), 2);
}

#[tokio::test]
async fn missing_picoammeter_channels_abort_before_any_io() {
    let dir = tempdir().unwrap();
    let bench = SimBench::new();
    let camera = Arc::new(MockCamera::new(dir.path().display().to_string()));
    let mut devices = bench.devices(camera);
    let mut config = common::immediate_picoammeter();
    config.channel1.enabled = false;
    config.channel2.enabled = false;
    devices.picoammeter = spectral_bench::hardware::PicoammeterSampler::new(
        bench.transport(),
        spectral_bench::hardware::PortConfig::keithley(common::PICO),
        config,
    );

    let err = devices.picoammeter.initialize().await.unwrap_err();

    assert!(matches!(err, BenchError::Configuration(_)), "{err}");
    assert_eq!(bench.transport.open_count(), 0);
}

#[tokio::test]
async fn photon_transfer_sequence() {
    let dir = tempdir().unwrap();
    let bench = SimBench::new();
    let camera = Arc::new(MockCamera::new(dir.path().display().to_string()));
    let mut devices = bench.devices(Arc::clone(&camera));
    let mut config = PtcConfig::new(550.0, 3, "QTH");
    config.exposure_times = vec![0.5, 2.0];

    let records = run_ptc(&mut devices, &config, dir.path()).await.unwrap();

    let kinds: Vec<ImageType> = records.iter().take(6).map(|r| r.imtype).collect();
    assert_eq!(
        kinds,
        vec![
            ImageType::Bias,
            ImageType::Dark,
            ImageType::Flat,
            ImageType::Flat,
            ImageType::Dark,
            ImageType::Bias
        ]
    );
    assert_eq!(records.len(), 12);
    assert!(records[6..].iter().all(|r| r.exposure_s == 2.0));
    assert_eq!(bench.wheel.position(), 3);
    assert!(!bench.shutter.is_open());
    assert_eq!(
        camera.calls()[..6],
        ["bias", "dark 0.5", "expose 0.5 x1", "expose 0.5 x1", "dark 0.5", "bias"]
    );

    let logged = read_acquisition_log(dir.path().join(PTC_LOG)).unwrap();
    assert_eq!(logged.len(), 12);
    assert!(logged.iter().all(|r| r.wavelength_nm == 550.0 && r.filter == 3));
}
