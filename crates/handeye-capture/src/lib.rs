//! Interactive capture of hand-eye calibration samples.
//!
//! This crate provides:
//! - a background acquisition loop that reads camera frames, runs chessboard
//!   detection on each one and publishes the latest frame with its pattern flag
//! - a line-oriented command dispatcher that saves frames, records the robot
//!   pose for each one and hands finished sessions to a hand-eye solver
//! - the `handeye-capture` binary (feature `cli`) wiring both together
//!
//! Session storage, pose parsing and result reports live in
//! [`handeye_capture_core`], re-exported here as [`core`].
//!
//! ## Quickstart
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use chrono::Local;
//! use handeye_capture::acquisition::{AcquisitionLoop, DetectionState, HudInfo, NullDisplay, SharedHud};
//! use handeye_capture::camera::{ImageSequenceCamera, SharedCamera};
//! use handeye_capture::detect::ChessboardDetector;
//! use handeye_capture::dispatcher::CommandDispatcher;
//! use handeye_capture::SessionRegistry;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let camera = ImageSequenceCamera::open("frames", Duration::from_millis(33))?;
//! let camera = Arc::new(SharedCamera::new(Box::new(camera)));
//!
//! let mut registry = SessionRegistry::open("eye_hand_data", "data")?;
//! let session = registry.allocate(Local::now().date_naive())?;
//!
//! let state = DetectionState::new();
//! let hud = SharedHud::new(HudInfo::default());
//! let handle = AcquisitionLoop::new(
//!     camera,
//!     Box::new(ChessboardDetector::new(9, 6)),
//!     Box::new(NullDisplay),
//!     state.clone(),
//!     hud.clone(),
//! )
//! .spawn()?;
//!
//! let mut dispatcher = CommandDispatcher::new(registry, &session, state, hud, std::io::stdout())?
//!     .with_acquisition(handle);
//! dispatcher.run(std::io::stdin().lock())?;
//! # Ok(())
//! # }
//! ```
//!
//! ## API map
//! - `handeye_capture::camera`: frame sources and exactly-once release.
//! - `handeye_capture::detect`: chessboard detection and the preview overlay.
//! - `handeye_capture::acquisition`: the frame loop and its shared state.
//! - `handeye_capture::dispatcher`: operator commands and the capture workflow.
//! - `handeye_capture::solver`: solver trait and the external-command solver.
//! - `handeye_capture::config`: JSON configuration with per-section fallback.

pub use handeye_capture_core as core;

pub use handeye_capture_core::{
    CalibrationMode, HandEyeSolution, Pose, PoseRecorder, RawPose, Session, SessionRegistry,
};

pub mod acquisition;
pub mod camera;
pub mod config;
pub mod detect;
pub mod dispatcher;
pub mod solver;
