//! Camera controlled through its command-line client.
//!
//! The EMCCD camera on the bench is run by a vendor server process; acquisitions are
//! requested by invoking a small client executable once per command, e.g.
//! `cam_comm burst 1`, `cam_comm exptime 2.5`, `cam_comm dark`. Each invocation blocks
//! until the server has finished the request, and `path`/`imno` print their answer on
//! stdout.

use crate::error::{AppResult, BenchError};
use crate::hardware::capabilities::Camera;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Camera client settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Client executable used for every camera command
    #[serde(default = "default_program")]
    pub program: PathBuf,
    /// Server executable, only needed when the bench starts the server itself
    #[serde(default)]
    pub server_program: Option<PathBuf>,
    /// Pause after each acquisition before the next camera command
    #[serde(default = "default_settle", with = "humantime_serde")]
    pub settle: Duration,
}

fn default_program() -> PathBuf {
    PathBuf::from("cam_comm")
}

fn default_settle() -> Duration {
    Duration::from_millis(200)
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            server_program: None,
            settle: default_settle(),
        }
    }
}

/// [`Camera`] implementation that shells out to the camera client.
#[derive(Debug, Clone)]
pub struct CommandCamera {
    program: PathBuf,
    server_program: Option<PathBuf>,
}

impl CommandCamera {
    /// Use `program` as the camera client
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            server_program: None,
        }
    }

    /// Build from configuration
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            program: config.program.clone(),
            server_program: config.server_program.clone(),
        }
    }

    /// Launch the camera server with the given readout mode.
    ///
    /// The server keeps running after this returns; the caller owns the child handle.
    pub fn start_server(&self, readout_mode: &str) -> AppResult<Child> {
        let server = self.server_program.as_ref().ok_or_else(|| {
            BenchError::Configuration("camera.server_program is not set".to_string())
        })?;
        info!(server = %server.display(), readout_mode, "starting camera server");
        Command::new(server)
            .arg(readout_mode)
            .stdout(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BenchError::Camera(format!("failed to start {}: {e}", server.display()))
            })
    }

    async fn run(&self, args: &[&str]) -> AppResult<()> {
        debug!(program = %self.program.display(), ?args, "camera command");
        let status = Command::new(&self.program)
            .args(args)
            .status()
            .await
            .map_err(|e| {
                BenchError::Camera(format!("failed to run {}: {e}", self.program.display()))
            })?;
        if !status.success() {
            return Err(BenchError::Camera(format!(
                "`{} {}` exited with {status}",
                self.program.display(),
                args.join(" ")
            )));
        }
        Ok(())
    }

    async fn query(&self, arg: &str) -> AppResult<String> {
        let output = Command::new(&self.program)
            .arg(arg)
            .output()
            .await
            .map_err(|e| {
                BenchError::Camera(format!("failed to run {}: {e}", self.program.display()))
            })?;
        if !output.status.success() {
            return Err(BenchError::Camera(format!(
                "`{} {arg}` exited with {}",
                self.program.display(),
                output.status
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Camera for CommandCamera {
    async fn path(&self) -> AppResult<String> {
        self.query("path").await
    }

    async fn image_number(&self) -> AppResult<u64> {
        let text = self.query("imno").await?;
        text.parse::<u64>()
            .map_err(|_| BenchError::Camera(format!("unexpected image number '{text}'")))
    }

    async fn bias(&self) -> AppResult<()> {
        self.run(&["burst", "1"]).await?;
        self.run(&["exptime", "0.0"]).await?;
        self.run(&["bias"]).await
    }

    async fn dark(&self, exposure_s: f64) -> AppResult<()> {
        self.run(&["burst", "1"]).await?;
        self.run(&["exptime", &exposure_s.to_string()]).await?;
        self.run(&["dark"]).await
    }

    async fn exposure_burst(&self, exposure_s: f64, count: u32) -> AppResult<()> {
        self.run(&[&format!("burst={count}")]).await?;
        self.run(&[&format!("exptime={exposure_s}")]).await?;
        self.run(&["expose"]).await
    }

    async fn dark_burst(&self, exposure_s: f64, count: u32) -> AppResult<()> {
        self.run(&[&format!("burst={count}")]).await?;
        self.run(&[&format!("exptime={exposure_s}")]).await?;
        self.run(&["dark"]).await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_client_is_a_camera_error() {
        let camera = CommandCamera::new("/nonexistent/cam_comm");
        let err = camera.bias().await.unwrap_err();
        assert!(matches!(err, BenchError::Camera(_)));
    }

    #[tokio::test]
    async fn path_is_read_from_stdout() {
        // `echo path` prints its argument, standing in for the camera client.
        let camera = CommandCamera::new("echo");
        assert_eq!(camera.path().await.unwrap(), "path");
        assert!(camera.image_number().await.is_err());
    }

    #[test]
    fn server_requires_configuration() {
        let camera = CommandCamera::from_config(&CameraConfig::default());
        assert!(matches!(
            camera.start_server("ros"),
            Err(BenchError::Configuration(_))
        ));
    }
}
