//! Camera capability.
//!
//! The bench treats the science camera as an opaque, blocking remote procedure: the
//! orchestrator asks for a bias, a dark or a burst of exposures and waits for the call to
//! return. The vendor software does the actual readout and file writing; all the bench
//! needs back is the data directory and the running image number used to tie log rows to
//! image files.
//!
//! # Contract
//!
//! - Methods are async and take `&self`, so a camera can be shared through `Arc` with a
//!   spawned exposure task while the orchestrator keeps sampling the photodiode.
//! - `image_number` returns the number that the *next* acquisition will be stored under.
//! - Exposure times are in seconds.
//!
//! # Example
//!
//! ```rust,ignore
//! async fn bias_then_expose(camera: &dyn Camera) -> AppResult<u64> {
//!     camera.bias().await?;
//!     let imno = camera.image_number().await?;
//!     camera.exposure_burst(2.5, 1).await?;
//!     Ok(imno)
//! }
//! ```

use crate::error::AppResult;
use async_trait::async_trait;

/// Capability: image acquisition through an external camera controller.
#[async_trait]
pub trait Camera: Send + Sync {
    /// Directory the camera software writes images into
    async fn path(&self) -> AppResult<String>;

    /// Image number the next acquisition will be stored under
    async fn image_number(&self) -> AppResult<u64>;

    /// Take a single zero-second bias frame
    async fn bias(&self) -> AppResult<()>;

    /// Take a single dark frame of `exposure_s` seconds
    async fn dark(&self, exposure_s: f64) -> AppResult<()>;

    /// Take `count` exposures of `exposure_s` seconds each
    async fn exposure_burst(&self, exposure_s: f64, count: u32) -> AppResult<()>;

    /// Take `count` dark frames of `exposure_s` seconds each
    ///
    /// The default repeats [`Camera::dark`]; controllers with a native burst mode
    /// should override it.
    async fn dark_burst(&self, exposure_s: f64, count: u32) -> AppResult<()> {
        for _ in 0..count {
            self.dark(exposure_s).await?;
        }
        Ok(())
    }
}
