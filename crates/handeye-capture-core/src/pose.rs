//! Operator pose parsing and the append-only pose log.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;

use crate::error::{ParseError, StorageError};
use crate::session::{count_pose_lines, Session};

/// Input that aborts a pending capture.
pub const CANCEL_TOKEN: &str = "cancel";

/// Pose as typed by the operator: millimeters and degrees.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RawPose {
    pub x_mm: f64,
    pub y_mm: f64,
    pub z_mm: f64,
    pub rx_deg: f64,
    pub ry_deg: f64,
    pub rz_deg: f64,
}

/// Pose in meters and radians, as stored in the pose log.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Pose {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub rx: f64,
    pub ry: f64,
    pub rz: f64,
}

impl RawPose {
    pub fn to_pose(&self) -> Pose {
        Pose {
            x: self.x_mm / 1000.0,
            y: self.y_mm / 1000.0,
            z: self.z_mm / 1000.0,
            rx: self.rx_deg.to_radians(),
            ry: self.ry_deg.to_radians(),
            rz: self.rz_deg.to_radians(),
        }
    }

    /// `x, y, z, rx, ry, rz` with two decimals.
    pub fn summary(&self) -> String {
        format!(
            "{:.2}, {:.2}, {:.2}, {:.2}, {:.2}, {:.2}",
            self.x_mm, self.y_mm, self.z_mm, self.rx_deg, self.ry_deg, self.rz_deg
        )
    }
}

impl Pose {
    /// One pose-log line without the trailing newline.
    pub fn to_log_line(&self) -> String {
        format!(
            "{:.6},{:.6},{:.6},{:.6},{:.6},{:.6}",
            self.x, self.y, self.z, self.rx, self.ry, self.rz
        )
    }
}

/// Parse `x y z rx ry rz` (whitespace separated, mm and degrees).
pub fn parse_pose(text: &str) -> Result<RawPose, ParseError> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    if tokens.len() != 6 {
        return Err(ParseError::Arity { got: tokens.len() });
    }
    let mut values = [0.0_f64; 6];
    for (slot, token) in values.iter_mut().zip(&tokens) {
        let v: f64 = token.parse().map_err(|_| ParseError::InvalidNumber {
            token: token.to_string(),
        })?;
        if !v.is_finite() {
            return Err(ParseError::NonFinite {
                token: token.to_string(),
            });
        }
        *slot = v;
    }
    let [x_mm, y_mm, z_mm, rx_deg, ry_deg, rz_deg] = values;
    Ok(RawPose {
        x_mm,
        y_mm,
        z_mm,
        rx_deg,
        ry_deg,
        rz_deg,
    })
}

/// Errors from [`PoseRecorder::append`].
#[derive(thiserror::Error, Debug)]
pub enum RecordError {
    #[error(transparent)]
    Parse(#[from] ParseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("sample {got} is out of order, the pose log expects sample {expected}")]
    OutOfOrder { expected: usize, got: usize },
    #[error("image for sample {index} is missing")]
    MissingImage { index: usize },
}

/// Pose accepted into the log.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RecordedPose {
    pub index: usize,
    pub raw: RawPose,
    pub pose: Pose,
}

/// Appends validated poses to a session's pose log, one line per sample.
///
/// The line for sample `N` is only written when `{N}.jpg` already exists and
/// the log currently holds exactly `N` lines, which keeps images and poses
/// paired by index.
#[derive(Debug)]
pub struct PoseRecorder {
    session: Session,
    lines: usize,
}

impl PoseRecorder {
    pub fn open(session: &Session) -> Result<Self, StorageError> {
        let path = session.pose_log_path();
        let lines = match fs::read_to_string(&path) {
            Ok(text) => count_pose_lines(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StorageError::io("read", path, e)),
        };
        Ok(Self {
            session: session.clone(),
            lines,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn path(&self) -> PathBuf {
        self.session.pose_log_path()
    }

    /// Number of committed samples.
    pub fn len(&self) -> usize {
        self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines == 0
    }

    /// Parse `raw_pose_text`, convert it and append it as sample
    /// `sample_index`. The append is the commit point of the sample.
    pub fn append(
        &mut self,
        sample_index: usize,
        raw_pose_text: &str,
    ) -> Result<RecordedPose, RecordError> {
        let raw = parse_pose(raw_pose_text)?;
        if sample_index != self.lines {
            return Err(RecordError::OutOfOrder {
                expected: self.lines,
                got: sample_index,
            });
        }
        if !self.session.image_path(sample_index).is_file() {
            return Err(RecordError::MissingImage {
                index: sample_index,
            });
        }

        let pose = raw.to_pose();
        let path = self.path();
        let mut line = pose.to_log_line();
        line.push('\n');
        let mut file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&path)
            .map_err(|e| StorageError::io("open", &path, e))?;
        append_line(&mut file, line.as_bytes())
            .map_err(|e| StorageError::io("append to", &path, e))?;

        self.lines += 1;
        log::debug!("sample {sample_index}: {}", line.trim_end());
        Ok(RecordedPose {
            index: sample_index,
            raw,
            pose,
        })
    }
}

/// Append-only log that can be cut back to an earlier length.
trait LogSink: Write {
    fn byte_len(&self) -> io::Result<u64>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl LogSink for File {
    fn byte_len(&self) -> io::Result<u64> {
        Ok(self.metadata()?.len())
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write one whole line or nothing: a failed write is cut back so no
/// partial line is left in the log.
fn append_line<S: LogSink>(sink: &mut S, line: &[u8]) -> io::Result<()> {
    let before = sink.byte_len()?;
    if let Err(e) = sink.write_all(line).and_then(|()| sink.flush()) {
        if let Err(undo) = sink.truncate_to(before) {
            log::error!("cannot cut pose log back to {before} bytes: {undo}");
        }
        return Err(e);
    }
    Ok(())
}
