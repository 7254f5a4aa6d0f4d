//! Interactive command loop.
//!
//! The dispatcher reads one line at a time. In `AwaitingCommand` a line is a
//! command; after an accepted `capture` the dispatcher moves to
//! `AwaitingPoseInput` and the following lines are robot poses until one is
//! committed or the capture is cancelled. A capture writes `{N}.jpg` first
//! and commits by appending the pose line; every path that does not reach
//! the append removes the image again.

use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDate;
use handeye_capture_core::{
    write_report, CalibrationMode, HandEyeSolution, PoseRecorder, RecordError, ReportError,
    Session, SessionInventory, SessionRegistry, SolverInputError, StorageError, CANCEL_TOKEN,
};
use image::{ImageFormat, RgbImage};

use crate::acquisition::{
    AcquisitionHandle, DetectionState, FrameSnapshot, HudInfo, SharedHud, ShutdownOutcome,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
use crate::solver::{validate_solution, HandEyeSolver, SolverError};

/// Operator commands. Parsing is case-insensitive and accepts the short
/// single-letter forms.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Command {
    Capture,
    ComputeInHand,
    ComputeToHand,
    Status,
    NewSession,
    Help,
    Quit,
}

impl Command {
    pub fn parse(input: &str) -> Option<Self> {
        let command = match input.trim().to_ascii_lowercase().as_str() {
            "s" | "capture" => Self::Capture,
            "i" | "compute_in_hand" => Self::ComputeInHand,
            "o" | "compute_to_hand" => Self::ComputeToHand,
            "" | "status" => Self::Status,
            "n" | "new" => Self::NewSession,
            "h" | "help" | "?" => Self::Help,
            "q" | "quit" => Self::Quit,
            _ => return None,
        };
        Some(command)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DispatcherState {
    AwaitingCommand,
    AwaitingPoseInput,
}

/// Whether the command loop keeps going.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Quit,
}

/// Reasons a `capture` request is refused.
#[derive(thiserror::Error, Debug)]
pub enum CaptureError {
    #[error("no camera frame is available yet")]
    NoFrame,
    #[error("no calibration pattern detected in the current frame")]
    DetectionUnavailable,
    #[error("cannot save image {path}: {source}")]
    ImageWrite {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
}

/// Reasons a compute command produced no result.
#[derive(thiserror::Error, Debug)]
pub enum ComputeError {
    #[error("invalid session data: {0}")]
    Input(#[from] SolverInputError),
    #[error("solver failed: {0}")]
    Solver(#[from] SolverError),
    #[error(transparent)]
    Report(#[from] ReportError),
}

struct PendingCapture {
    index: usize,
    snapshot: Arc<FrameSnapshot>,
    path: PathBuf,
    on_disk: bool,
}

/// Successful compute command.
#[derive(Clone, Debug)]
pub struct ComputeOutcome {
    pub session: Session,
    pub inventory: SessionInventory,
    pub solution: HandEyeSolution,
    pub report_path: PathBuf,
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

/// Command loop over a session registry, the shared detection state and an
/// optional hand-eye solver. Operator messages go to `out`.
pub struct CommandDispatcher<W: Write> {
    registry: SessionRegistry,
    recorder: PoseRecorder,
    state: DetectionState,
    hud: SharedHud,
    solver: Option<Box<dyn HandEyeSolver>>,
    acquisition: Option<AcquisitionHandle>,
    shutdown_timeout: Duration,
    clock: fn() -> NaiveDate,
    pending: Option<PendingCapture>,
    out: W,
}

impl<W: Write> CommandDispatcher<W> {
    /// Start capturing into `session`, which should come from `registry`.
    pub fn new(
        registry: SessionRegistry,
        session: &Session,
        state: DetectionState,
        hud: SharedHud,
        out: W,
    ) -> Result<Self, StorageError> {
        let recorder = PoseRecorder::open(session)?;
        hud.set(HudInfo {
            session_name: session.name().to_string(),
            samples: recorder.len(),
        });
        Ok(Self {
            registry,
            recorder,
            state,
            hud,
            solver: None,
            acquisition: None,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            clock: today,
            pending: None,
            out,
        })
    }

    pub fn with_solver(mut self, solver: Box<dyn HandEyeSolver>) -> Self {
        self.solver = Some(solver);
        self
    }

    /// Hand over the acquisition loop so `quit` can stop it.
    pub fn with_acquisition(mut self, handle: AcquisitionHandle) -> Self {
        self.acquisition = Some(handle);
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Date source for `new` sessions.
    pub fn with_clock(mut self, clock: fn() -> NaiveDate) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> DispatcherState {
        if self.pending.is_some() {
            DispatcherState::AwaitingPoseInput
        } else {
            DispatcherState::AwaitingCommand
        }
    }

    /// Index the next committed sample will get.
    pub fn sample_index(&self) -> usize {
        self.recorder.len()
    }

    pub fn session(&self) -> &Session {
        self.recorder.session()
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    /// Print the session location and the command list.
    pub fn print_banner(&mut self) -> io::Result<()> {
        writeln!(self.out, "Hand-eye calibration data capture")?;
        writeln!(self.out, "{}", "=".repeat(60))?;
        let dir = self.recorder.session().dir().display().to_string();
        writeln!(self.out, "Session directory: {dir}")?;
        self.print_help()?;
        writeln!(self.out, "{}", "=".repeat(60))
    }

    /// Read lines until `quit` or end of input. A capture still waiting for
    /// its pose is rolled back when reading or writing fails.
    pub fn run<R: BufRead>(&mut self, input: R) -> io::Result<()> {
        let result = self.read_commands(input);
        if let Err(e) = &result {
            if self.pending.is_some() {
                log::warn!("operator i/o failed with a capture pending: {e}");
                self.discard_pending();
            }
        }
        result
    }

    fn read_commands<R: BufRead>(&mut self, mut input: R) -> io::Result<()> {
        let mut line = String::new();
        loop {
            self.prompt()?;
            line.clear();
            if input.read_line(&mut line)? == 0 {
                self.end_of_input()?;
                return Ok(());
            }
            if self.handle_line(&line)? == Flow::Quit {
                return Ok(());
            }
        }
    }

    /// Process one line of operator input.
    pub fn handle_line(&mut self, line: &str) -> io::Result<Flow> {
        match self.state() {
            DispatcherState::AwaitingCommand => self.on_command(line),
            DispatcherState::AwaitingPoseInput => {
                self.on_pose_input(line)?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Stop the acquisition loop (bounded wait). Safe to call repeatedly.
    pub fn shutdown(&mut self) -> Option<ShutdownOutcome> {
        let mut handle = self.acquisition.take()?;
        let outcome = handle.shutdown(self.shutdown_timeout);
        log::info!("acquisition shutdown: {outcome:?}");
        Some(outcome)
    }

    fn prompt(&mut self) -> io::Result<()> {
        match self.state() {
            DispatcherState::AwaitingCommand => {
                write!(self.out, "\ncommand (s=capture, i=in-hand, o=to-hand, q=quit)> ")?
            }
            DispatcherState::AwaitingPoseInput => write!(self.out, "pose> ")?,
        }
        self.out.flush()
    }

    fn on_command(&mut self, line: &str) -> io::Result<Flow> {
        let Some(command) = Command::parse(line) else {
            log::debug!("invalid command {:?}", line.trim());
            writeln!(self.out, "invalid command '{}'", line.trim())?;
            writeln!(self.out, "  type 'h' for the list of commands")?;
            return Ok(Flow::Continue);
        };
        match command {
            Command::Capture => self.begin_capture()?,
            Command::ComputeInHand => self.compute(CalibrationMode::EyeInHand)?,
            Command::ComputeToHand => self.compute(CalibrationMode::EyeToHand)?,
            Command::Status => self.report_status()?,
            Command::NewSession => self.new_session()?,
            Command::Help => self.print_help()?,
            Command::Quit => {
                writeln!(self.out, "shutting down...")?;
                self.shutdown();
                writeln!(self.out, "resources released, bye")?;
                return Ok(Flow::Quit);
            }
        }
        Ok(Flow::Continue)
    }

    fn print_help(&mut self) -> io::Result<()> {
        writeln!(self.out, "Commands (case-insensitive):")?;
        writeln!(
            self.out,
            "  s, capture          save the current frame and enter the robot pose"
        )?;
        writeln!(
            self.out,
            "  i, compute_in_hand  eye-in-hand calibration (camera on the end-effector)"
        )?;
        writeln!(
            self.out,
            "  o, compute_to_hand  eye-to-hand calibration (camera fixed to the base)"
        )?;
        writeln!(self.out, "  n, new              start a new session directory")?;
        writeln!(self.out, "  <enter>, status     show detection state and sample count")?;
        writeln!(self.out, "  h, help             show this list")?;
        writeln!(self.out, "  q, quit             stop the camera and exit")
    }

    fn report_status(&mut self) -> io::Result<()> {
        let pattern = match self.state.latest() {
            None => "no frame yet",
            Some(s) if s.pattern_found => "detected",
            Some(_) => "not detected",
        };
        let stopped = self
            .acquisition
            .as_mut()
            .is_some_and(|handle| !handle.is_running());
        let camera = if stopped { " | camera stopped" } else { "" };
        let captured = self.recorder.len();
        let session = self.recorder.session().name().to_string();
        writeln!(
            self.out,
            "pattern: {pattern} | captured: {captured} | session: {session}{camera}"
        )
    }

    fn begin_capture(&mut self) -> io::Result<()> {
        match self.stage_capture() {
            Ok(index) => {
                writeln!(self.out, "saved image {index}.jpg")?;
                writeln!(self.out, "enter robot pose for sample {}", index + 1)?;
                writeln!(
                    self.out,
                    "  format: x y z rx ry rz (mm and degrees, space separated)"
                )?;
                writeln!(self.out, "  example: 100.5 200.3 300.0 10.2 20.5 30.1")?;
                writeln!(self.out, "  type '{CANCEL_TOKEN}' to discard this capture")
            }
            Err(e) => {
                log::warn!("capture rejected: {e}");
                writeln!(self.out, "capture rejected: {e}")?;
                if matches!(e, CaptureError::DetectionUnavailable) {
                    writeln!(
                        self.out,
                        "  adjust the camera or the board until the pattern is found"
                    )?;
                }
                Ok(())
            }
        }
    }

    fn stage_capture(&mut self) -> Result<usize, CaptureError> {
        let snapshot = self.state.latest().ok_or(CaptureError::NoFrame)?;
        if !snapshot.pattern_found {
            return Err(CaptureError::DetectionUnavailable);
        }
        let index = self.recorder.len();
        let path = self.recorder.session().image_path(index);
        save_frame(&snapshot.frame, &path)?;
        log::debug!("staged {} (frame #{})", path.display(), snapshot.sequence);
        self.pending = Some(PendingCapture {
            index,
            snapshot,
            path,
            on_disk: true,
        });
        Ok(index)
    }

    fn on_pose_input(&mut self, line: &str) -> io::Result<()> {
        let text = line.trim();
        if text.eq_ignore_ascii_case(CANCEL_TOKEN) {
            self.discard_pending();
            return writeln!(self.out, "capture cancelled");
        }
        if text.is_empty() {
            return writeln!(
                self.out,
                "pose cannot be empty; enter 6 values or '{CANCEL_TOKEN}'"
            );
        }

        let Some(pending) = self.pending.as_mut() else {
            return Ok(());
        };
        if !pending.on_disk {
            if let Err(e) = save_frame(&pending.snapshot.frame, &pending.path) {
                self.discard_pending();
                log::error!("{e}");
                return writeln!(self.out, "capture failed: {e}");
            }
            pending.on_disk = true;
        }
        let index = pending.index;

        match self.recorder.append(index, text) {
            Ok(recorded) => {
                self.pending = None;
                self.hud.set(HudInfo {
                    session_name: self.recorder.session().name().to_string(),
                    samples: self.recorder.len(),
                });
                log::info!("sample {index} committed");
                writeln!(self.out, "sample {} captured", index + 1)?;
                writeln!(
                    self.out,
                    "  raw pose (mm, deg):   {}",
                    recorded.raw.summary()
                )?;
                writeln!(
                    self.out,
                    "  stored pose (m, rad): {}",
                    recorded.pose.to_log_line().replace(',', ", ")
                )
            }
            Err(RecordError::Parse(e)) => {
                if let Some(pending) = self.pending.as_mut() {
                    remove_image(&pending.path);
                    pending.on_disk = false;
                }
                writeln!(self.out, "invalid pose: {e}")?;
                writeln!(
                    self.out,
                    "  enter the pose again, or '{CANCEL_TOKEN}' to discard the capture"
                )
            }
            Err(e) => {
                self.discard_pending();
                log::error!("sample {index} not recorded: {e}");
                writeln!(self.out, "capture failed: {e}")
            }
        }
    }

    fn discard_pending(&mut self) {
        if let Some(pending) = self.pending.take() {
            if pending.on_disk {
                remove_image(&pending.path);
            }
            log::info!("capture of sample {} discarded", pending.index);
        }
    }

    fn end_of_input(&mut self) -> io::Result<()> {
        if self.pending.is_some() {
            self.discard_pending();
            writeln!(self.out, "\ninput closed, pending capture discarded")?;
        } else {
            writeln!(self.out)?;
        }
        self.shutdown();
        writeln!(self.out, "input closed, resources released")
    }

    fn new_session(&mut self) -> io::Result<()> {
        let date = (self.clock)();
        let opened = self
            .registry
            .allocate(date)
            .and_then(|session| PoseRecorder::open(&session));
        match opened {
            Ok(recorder) => {
                let name = recorder.session().name().to_string();
                let dir = recorder.session().dir().display().to_string();
                self.recorder = recorder;
                self.hud.set(HudInfo {
                    session_name: name,
                    samples: 0,
                });
                writeln!(self.out, "now capturing into {dir}")
            }
            Err(e) => {
                log::error!("{e}");
                writeln!(self.out, "cannot start a new session: {e}")
            }
        }
    }

    fn compute(&mut self, mode: CalibrationMode) -> io::Result<()> {
        writeln!(
            self.out,
            "{} calibration: {}",
            mode.title(),
            mode.describes()
        )?;
        match self.run_compute(mode) {
            Ok(outcome) => {
                writeln!(
                    self.out,
                    "session {}: {} image(s), {} pose(s)",
                    outcome.session.name(),
                    outcome.inventory.images,
                    outcome.inventory.poses
                )?;
                write!(self.out, "{}", outcome.solution.render_report(mode))?;
                writeln!(
                    self.out,
                    "result saved to {}",
                    outcome.report_path.display()
                )
            }
            Err(e) => {
                log::warn!("{} calibration failed: {e}", mode.as_str());
                writeln!(self.out, "{} calibration failed: {e}", mode.title())
            }
        }
    }

    /// Validate the latest session, solve, and persist the report.
    pub fn run_compute(&mut self, mode: CalibrationMode) -> Result<ComputeOutcome, ComputeError> {
        let session = self
            .registry
            .latest()
            .cloned()
            .ok_or(SolverInputError::NoSession)?;
        let inventory = session.validate_for_solve()?;
        let solver = self.solver.as_deref().ok_or(SolverError::NotConfigured {
            mode: mode.as_str(),
        })?;
        let solution = solver.solve(mode, session.dir(), &session.pose_log_path())?;
        let solution = validate_solution(solution)?;
        let report_path = write_report(&session, mode, &solution)?;
        Ok(ComputeOutcome {
            session,
            inventory,
            solution,
            report_path,
        })
    }
}

/// Write `frame` as JPEG. A failed write leaves no file behind.
fn save_frame(frame: &RgbImage, path: &Path) -> Result<(), CaptureError> {
    frame
        .save_with_format(path, ImageFormat::Jpeg)
        .map_err(|source| {
            remove_image(path);
            CaptureError::ImageWrite {
                path: path.to_path_buf(),
                source,
            }
        })
}

fn remove_image(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => log::debug!("removed {}", path.display()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::error!("cannot remove {}: {e}", path.display()),
    }
}

impl<W: Write> Drop for CommandDispatcher<W> {
    fn drop(&mut self) {
        self.discard_pending();
    }
}
