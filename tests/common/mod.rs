//! Simulated bench shared by the integration tests.
#![allow(dead_code)]

use spectral_bench::experiment::plan::{ScanPlan, ScanPlanConfig};
use spectral_bench::experiment::BenchDevices;
use spectral_bench::hardware::filter_wheel::{
    FilterBreakpointTable, FilterWheelController, FilterWheelTiming,
};
use spectral_bench::hardware::mock::{
    MockCamera, MockTransport, SimulatedFilterWheel, SimulatedPicoammeter,
    SimulatedScanController, SimulatedShutter,
};
use spectral_bench::hardware::monochromator::{MonochromatorController, MonochromatorTiming};
use spectral_bench::hardware::picoammeter::{PicoammeterConfig, PicoammeterSampler};
use spectral_bench::hardware::shutter::ShutterController;
use spectral_bench::hardware::{PollPolicy, PortConfig, Transport};
use std::sync::Arc;
use std::time::Duration;

pub const MC: &str = "MC";
pub const FW: &str = "FW";
pub const SH: &str = "SH";
pub const PICO: &str = "PICO";

/// Handles onto every simulated instrument
pub struct SimBench {
    pub transport: MockTransport,
    pub wheel: SimulatedFilterWheel,
    pub shutter: SimulatedShutter,
    pub picoammeter: SimulatedPicoammeter,
}

impl SimBench {
    pub fn new() -> Self {
        Self::with_controller(SimulatedScanController::new())
    }

    pub fn with_controller(controller: SimulatedScanController) -> Self {
        let wheel = SimulatedFilterWheel::new(1);
        let shutter = SimulatedShutter::new();
        let picoammeter = SimulatedPicoammeter::new();
        let transport = MockTransport::new()
            .with_device(MC, controller)
            .with_device(FW, wheel.clone())
            .with_device(SH, shutter.clone())
            .with_device(PICO, picoammeter.clone());
        Self {
            transport,
            wheel,
            shutter,
            picoammeter,
        }
    }

    pub fn transport(&self) -> Arc<dyn Transport> {
        Arc::new(self.transport.clone())
    }

    pub fn monochromator(&self) -> MonochromatorController {
        MonochromatorController::new(
            self.transport(),
            PortConfig::mcpherson(MC),
            MonochromatorTiming::immediate(20),
        )
    }

    pub fn filter_wheel(&self) -> FilterWheelController {
        FilterWheelController::new(
            self.transport(),
            PortConfig::mcpherson(FW),
            FilterWheelTiming::immediate(),
        )
    }

    pub fn devices(&self, camera: Arc<MockCamera>) -> BenchDevices {
        BenchDevices {
            monochromator: self.monochromator(),
            filter_wheel: self.filter_wheel(),
            shutter: ShutterController::new(self.transport(), PortConfig::mcpherson(SH)),
            picoammeter: PicoammeterSampler::new(
                self.transport(),
                PortConfig::keithley(PICO),
                immediate_picoammeter(),
            ),
            camera,
        }
    }
}

pub fn immediate_picoammeter() -> PicoammeterConfig {
    PicoammeterConfig {
        interval: Duration::ZERO,
        opc_poll: PollPolicy::immediate(10),
        ..PicoammeterConfig::default()
    }
}

pub fn scan_plan(start: f64, end: f64, step: f64) -> ScanPlan {
    let config = ScanPlanConfig::new(start, end, step, "D2", 1.0);
    ScanPlan::new(config, FilterBreakpointTable::default()).unwrap()
}
