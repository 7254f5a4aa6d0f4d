//! Storage and data model for hand-eye calibration sample capture.
//!
//! This crate owns everything that touches the session directory:
//!
//! - [`SessionRegistry`] allocates `{prefix}{YYYYMMDD}{NN}` directories and
//!   remembers them in allocation order.
//! - [`PoseRecorder`] parses operator poses (mm, deg), converts them to
//!   meters and radians and appends them to `poses.txt`.
//! - [`write_report`] persists a solver result as a labeled text report.
//!
//! It does not depend on any camera, image or pattern-detection code.
//!
//! ## Quickstart
//!
//! ```no_run
//! use chrono::NaiveDate;
//! use handeye_capture_core::{PoseRecorder, SessionRegistry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut registry = SessionRegistry::open("eye_hand_data", "data")?;
//! let session = registry.allocate(NaiveDate::from_ymd_opt(2024, 5, 1).unwrap())?;
//! std::fs::write(session.image_path(0), b"...jpeg bytes...")?;
//!
//! let mut poses = PoseRecorder::open(&session)?;
//! let recorded = poses.append(0, "100.5 200.3 300.0 10.2 20.5 30.1")?;
//! println!("{}", recorded.pose.to_log_line());
//! # Ok(())
//! # }
//! ```

mod error;
mod logger;
mod pose;
mod report;
mod session;

pub use error::{ParseError, ReportError, SolverInputError, StorageError};
pub use pose::{parse_pose, Pose, PoseRecorder, RawPose, RecordError, RecordedPose, CANCEL_TOKEN};
pub use report::{write_report, CalibrationMode, HandEyeSolution};
pub use session::{
    allocate_session, Session, SessionInventory, SessionName, SessionRegistry, DEFAULT_PREFIX,
    MAX_SESSIONS_PER_DAY, POSE_LOG_FILE,
};

#[cfg(feature = "tracing")]
pub use logger::init_tracing;

pub use logger::init_with_level;
