//! CLI entry point for the spectral bench.
//!
//! Every instrument can be driven on its own (`home`, `goto`, `filter`, `shutter`,
//! `sample`) and the full procedures are available as `scan`, `ptc` and `darks`.
//!
//! # Usage
//!
//! ```bash
//! spectral_bench --config config/bench.toml scan
//! spectral_bench goto 450
//! spectral_bench filter --wavelength 450
//! spectral_bench --simulate scan --start 100 --end 110 --step 5 --lamp D2 --exposure 1
//! ```
//!
//! `--simulate` replaces every serial port and the camera with in-memory devices.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use spectral_bench::config::{discover_usb_ports, BenchConfig, PortDatabase, DEFAULT_CONFIG_PATH};
use spectral_bench::experiment::orchestrator::resolve_output_dir;
use spectral_bench::experiment::plan::{ScanPlan, ScanPlanConfig};
use spectral_bench::experiment::ptc::{run_dark_series, run_ptc, DarkSeriesConfig, PtcConfig};
use spectral_bench::experiment::{BenchDevices, OrchestratorSettings, ScanOrchestrator};
use spectral_bench::hardware::filter_wheel::FilterWheelTiming;
use spectral_bench::hardware::mock::{
    MockCamera, MockTransport, SimulatedFilterWheel, SimulatedPicoammeter, SimulatedScanController,
    SimulatedShutter,
};
use spectral_bench::hardware::monochromator::{
    slit_width_for_bandpass, MonochromatorTiming, HOME_WAVELENGTH_NM,
};
use spectral_bench::hardware::{
    which_filter, Camera, CommandCamera, PollPolicy, SerialTransport, Transport,
};
use spectral_bench::tracing_setup;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "spectral_bench")]
#[command(about = "Spectral calibration bench control", long_about = None)]
struct Cli {
    /// Configuration file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Use simulated instruments instead of the serial ports and camera
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Drive the grating to the home flag
    Home,

    /// Move the grating to a wavelength
    Goto {
        /// Target wavelength, nm
        wavelength: f64,

        /// Current wavelength; without it the grating is homed first
        #[arg(long)]
        from: Option<f64>,
    },

    /// Read or set the filter wheel position
    Filter {
        /// Slot to move to (1-5)
        #[arg(long, conflicts_with = "wavelength")]
        position: Option<u8>,

        /// Select the slot for this wavelength from the change map
        #[arg(long)]
        wavelength: Option<f64>,
    },

    /// Open or close the shutter
    Shutter {
        /// Requested state
        action: ShutterAction,
    },

    /// Configure the picoammeter and read a photodiode series
    Sample {
        /// Number of readings (defaults to picoammeter.samples)
        #[arg(long)]
        count: Option<usize>,

        /// Write the series to this CSV file
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run a wavelength scan
    Scan {
        /// First wavelength, nm (overrides the [scan] section)
        #[arg(long, requires_all = ["end", "step", "lamp", "exposure"])]
        start: Option<f64>,

        /// Last wavelength, nm
        #[arg(long)]
        end: Option<f64>,

        /// Step, nm
        #[arg(long)]
        step: Option<f64>,

        /// Lamp label
        #[arg(long)]
        lamp: Option<String>,

        /// Exposure time, s
        #[arg(long)]
        exposure: Option<f64>,

        /// Output directory (defaults to storage.output_dir or the camera path)
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run a photon transfer sequence at a fixed wavelength and filter
    Ptc {
        /// Wavelength, nm
        #[arg(long)]
        wavelength: f64,

        /// Filter slot
        #[arg(long)]
        filter: u8,

        /// Lamp label
        #[arg(long)]
        lamp: String,

        /// Exposure times, s (comma separated)
        #[arg(long, value_delimiter = ',')]
        exposures: Vec<f64>,

        /// Output directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Run a bias/dark/bias series with the camera only
    Darks {
        /// Exposure times, s (comma separated)
        #[arg(long, value_delimiter = ',')]
        exposures: Vec<f64>,

        /// Output directory
        #[arg(long)]
        output: Option<PathBuf>,
    },

    /// Slit width for a bandpass
    Slit {
        /// Bandpass, nm
        bandpass: f64,
    },

    /// Start the camera server
    CameraServer {
        /// Readout mode passed to the server
        #[arg(default_value = "1")]
        readout_mode: String,
    },

    /// Port database maintenance
    Ports {
        #[command(subcommand)]
        action: PortsAction,
    },

    /// Print the effective configuration
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum ShutterAction {
    Open,
    Close,
}

#[derive(Subcommand)]
enum PortsAction {
    /// List the port database
    List,
    /// Match connected USB adapters against the database and rewrite it
    Refresh,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = BenchConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    tracing_setup::init_from_config(&config)?;
    if let Some(path) = config.ports.database.clone() {
        if path.exists() {
            let database = PortDatabase::load_csv(&path)
                .with_context(|| format!("reading port database {}", path.display()))?;
            config.ports.apply_database(&database);
        }
    }
    config.validate().context("invalid configuration")?;

    let (transport, camera) = if cli.simulate {
        simulated_bench(&mut config)
    } else {
        let transport: Arc<dyn Transport> = Arc::new(SerialTransport);
        let camera: Arc<dyn Camera> = Arc::new(CommandCamera::from_config(&config.camera));
        (transport, camera)
    };

    match cli.command {
        Commands::Home => {
            let mut devices = BenchDevices::from_config(&config, transport, camera);
            devices.monochromator.home().await?;
            println!("Grating at home ({HOME_WAVELENGTH_NM} nm)");
        }
        Commands::Goto { wavelength, from } => {
            let mut devices = BenchDevices::from_config(&config, transport, camera);
            match from {
                Some(start) => devices.monochromator.go_to_from(start, wavelength).await?,
                None => devices.monochromator.go_to_from_home(wavelength).await?,
            }
            println!("Grating at {wavelength} nm");
        }
        Commands::Filter {
            position,
            wavelength,
        } => {
            let mut devices = BenchDevices::from_config(&config, transport, camera);
            let target = match (position, wavelength) {
                (Some(slot), _) => Some(slot),
                (None, Some(wl)) => Some(which_filter(wl, &config.filter_wheel.table()?)),
                (None, None) => None,
            };
            match target {
                Some(slot) => {
                    let increments = devices.filter_wheel.set_position(slot).await?;
                    println!("Filter {slot} ({increments} increments)");
                }
                None => {
                    let slot = devices.filter_wheel.position().await?;
                    println!("Filter {slot}");
                }
            }
        }
        Commands::Shutter { action } => {
            let mut devices = BenchDevices::from_config(&config, transport, camera);
            match action {
                ShutterAction::Open => devices.shutter.open().await?,
                ShutterAction::Close => devices.shutter.close().await?,
            }
            println!("Shutter {}", devices.shutter.state());
        }
        Commands::Sample { count, output } => {
            let mut devices = BenchDevices::from_config(&config, transport, camera);
            devices.picoammeter.initialize().await?;
            let count = count.unwrap_or(config.picoammeter.samples);
            let series = devices
                .picoammeter
                .sample(count, config.picoammeter.interval)
                .await?;
            println!(
                "{} samples, mean ch1 {:?} A, mean ch2 {:?} A",
                series.len(),
                series.mean_ch1(),
                series.mean_ch2()
            );
            if let Some(path) = output {
                series.write_csv(&path)?;
                println!("Written to {}", path.display());
            }
        }
        Commands::Scan {
            start,
            end,
            step,
            lamp,
            exposure,
            output,
        } => {
            let plan = match (start, end, step, lamp, exposure) {
                (Some(start), Some(end), Some(step), Some(lamp), Some(exposure)) => {
                    let mut scan = config
                        .scan
                        .clone()
                        .unwrap_or_else(|| ScanPlanConfig::new(start, end, step, lamp.clone(), exposure));
                    scan.start_wl = start;
                    scan.end_wl = end;
                    scan.step = step;
                    scan.lamp = lamp;
                    scan.exposure_time = exposure;
                    scan.exposure_times = None;
                    ScanPlan::new(scan, config.filter_wheel.table()?)?
                }
                (None, ..) => config.scan_plan()?,
                _ => bail!("--start needs --end, --step, --lamp and --exposure"),
            };
            let output_dir = match output {
                Some(dir) => dir,
                None => resolve_output_dir(&config.storage, &plan, camera.as_ref()).await?,
            };
            let devices = BenchDevices::from_config(&config, transport, camera);
            let mut settings = OrchestratorSettings::from_config(&config);
            if cli.simulate {
                settings.camera_settle = Duration::ZERO;
            }
            let mut orchestrator = ScanOrchestrator::new(devices, plan, settings);
            let run = orchestrator.run(&output_dir).await?;
            println!(
                "Scan {} complete: {} records, {} periodic darks, output in {}",
                run.id,
                run.records.len(),
                run.dark_count,
                run.output_dir.display()
            );
        }
        Commands::Ptc {
            wavelength,
            filter,
            lamp,
            exposures,
            output,
        } => {
            let mut ptc = PtcConfig::new(wavelength, filter, lamp);
            if !exposures.is_empty() {
                ptc.exposure_times = exposures;
            }
            let output_dir = output_dir_for(&config, output, camera.as_ref()).await?;
            let mut devices = BenchDevices::from_config(&config, transport, camera);
            let records = run_ptc(&mut devices, &ptc, &output_dir).await?;
            println!("PTC complete: {} frames logged in {}", records.len(), output_dir.display());
        }
        Commands::Darks { exposures, output } => {
            let mut darks = DarkSeriesConfig::default();
            if !exposures.is_empty() {
                darks.exposure_times = exposures;
            }
            let output_dir = output_dir_for(&config, output, camera.as_ref()).await?;
            let records = run_dark_series(camera.as_ref(), &darks, &output_dir).await?;
            println!("Dark series complete: {} steps logged in {}", records.len(), output_dir.display());
        }
        Commands::Slit { bandpass } => {
            println!("{}", slit_report(bandpass));
        }
        Commands::CameraServer { readout_mode } => {
            let mut child = CommandCamera::from_config(&config.camera).start_server(&readout_mode)?;
            info!("camera server running; Ctrl+C to stop");
            let exited = tokio::select! {
                status = child.wait() => Some(status?),
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    None
                }
            };
            match exited {
                Some(status) => println!("Camera server exited: {status}"),
                None => {
                    child.kill().await?;
                    println!("Camera server stopped");
                }
            }
        }
        Commands::Ports { action } => {
            let path = config
                .ports
                .database
                .clone()
                .context("ports.database is not set")?;
            let mut database = if path.exists() {
                PortDatabase::load_csv(&path)?
            } else {
                PortDatabase::default()
            };
            if let PortsAction::Refresh = action {
                let available = discover_usb_ports()?;
                let updated = database.refresh_from(&available);
                database.save_csv(&path)?;
                println!("{updated} port(s) updated in {}", path.display());
            }
            for entry in database.entries() {
                println!("{:<10} {:<16} {}", entry.alias, entry.serial_number, entry.name);
            }
        }
        Commands::Config => {
            print!("{}", config.to_toml()?);
        }
    }

    Ok(())
}

/// Slit width for `bandpass_nm`, in mm to two decimals.
fn slit_report(bandpass_nm: f64) -> String {
    format!("{:.2} mm", slit_width_for_bandpass(bandpass_nm))
}

async fn output_dir_for(
    config: &BenchConfig,
    output: Option<PathBuf>,
    camera: &dyn Camera,
) -> Result<PathBuf> {
    if let Some(dir) = output.or_else(|| config.storage.output_dir.clone()) {
        return Ok(dir);
    }
    Ok(PathBuf::from(camera.path().await?))
}

/// In-memory instruments on the configured port names, with every delay removed.
fn simulated_bench(config: &mut BenchConfig) -> (Arc<dyn Transport>, Arc<dyn Camera>) {
    config.monochromator = MonochromatorTiming::immediate(config.monochromator.poll.max_attempts);
    config.filter_wheel.timing = FilterWheelTiming::immediate();
    config.picoammeter.interval = Duration::ZERO;
    config.picoammeter.opc_poll = PollPolicy::immediate(config.picoammeter.opc_poll.max_attempts);
    config.camera.settle = Duration::ZERO;

    let transport = MockTransport::new()
        .with_device(config.ports.monochromator.clone(), SimulatedScanController::new())
        .with_device(config.ports.filter_wheel.clone(), SimulatedFilterWheel::new(1))
        .with_device(config.ports.shutter.clone(), SimulatedShutter::new())
        .with_device(config.ports.picoammeter.clone(), SimulatedPicoammeter::new());
    let path = config
        .storage
        .output_dir
        .clone()
        .unwrap_or_else(|| PathBuf::from("simulated_images"));
    let camera = MockCamera::new(path.display().to_string());
    info!("using simulated instruments");
    (Arc::new(transport), Arc::new(camera))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slit_width_reported_in_millimetres() {
        assert_eq!(slit_report(1.24), "1.00 mm");
        assert_eq!(slit_report(0.31), "0.25 mm");
        assert_eq!(slit_report(3.1), "2.50 mm");
    }
}
