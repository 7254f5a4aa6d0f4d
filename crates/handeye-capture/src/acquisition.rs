//! Continuous frame acquisition with live pattern detection.
//!
//! [`AcquisitionLoop`] owns the detector and the display and runs on its own
//! thread. It publishes every frame with its pattern flag into
//! [`DetectionState`], a mutex-guarded snapshot that the command dispatcher
//! reads. Stopping goes through a channel; [`AcquisitionHandle::shutdown`]
//! waits a bounded time for the loop to acknowledge and releases the camera
//! itself if the loop does not.

use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use image::{ImageFormat, RgbImage};

use crate::camera::{ReleaseOutcome, SharedCamera};
use crate::detect::{draw_status_line, render_overlay, PatternDetection, PatternDetector};

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Default bound on how long `quit` waits for the loop to stop.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// One published frame.
#[derive(Debug)]
pub struct FrameSnapshot {
    pub frame: RgbImage,
    pub pattern_found: bool,
    /// Publication counter, starting at 1.
    pub sequence: u64,
    pub captured_at: Instant,
}

#[derive(Debug, Default)]
struct StateInner {
    latest: Option<Arc<FrameSnapshot>>,
    published: u64,
}

/// Latest frame and pattern flag, written by the acquisition loop only.
///
/// Readers get an `Arc` to a complete snapshot, never a frame that is being
/// overwritten.
#[derive(Clone, Debug, Default)]
pub struct DetectionState {
    inner: Arc<Mutex<StateInner>>,
}

impl DetectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the snapshot and return its sequence number.
    pub fn publish(&self, frame: RgbImage, pattern_found: bool) -> u64 {
        let mut inner = self.lock();
        inner.published += 1;
        let sequence = inner.published;
        inner.latest = Some(Arc::new(FrameSnapshot {
            frame,
            pattern_found,
            sequence,
            captured_at: Instant::now(),
        }));
        sequence
    }

    pub fn latest(&self) -> Option<Arc<FrameSnapshot>> {
        self.lock().latest.clone()
    }

    pub fn pattern_visible(&self) -> bool {
        self.lock()
            .latest
            .as_ref()
            .is_some_and(|s| s.pattern_found)
    }

    /// Drop the current frame so no stale image can be captured.
    pub fn clear(&self) {
        self.lock().latest = None;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Session name and sample count shown in the overlay status line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HudInfo {
    pub session_name: String,
    pub samples: usize,
}

/// [`HudInfo`] shared between the dispatcher (writer) and the loop (reader).
#[derive(Clone, Debug, Default)]
pub struct SharedHud {
    inner: Arc<Mutex<HudInfo>>,
}

impl SharedHud {
    pub fn new(info: HudInfo) -> Self {
        Self {
            inner: Arc::new(Mutex::new(info)),
        }
    }

    pub fn get(&self) -> HudInfo {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn set(&self, info: HudInfo) {
        *self.inner.lock().unwrap_or_else(PoisonError::into_inner) = info;
    }

    pub fn status_line(&self) -> String {
        let info = self.get();
        format!(
            "captured: {} | session: {}",
            info.samples, info.session_name
        )
    }
}

/// Frame handed to a [`Display`].
pub struct OverlayFrame<'a> {
    pub image: &'a RgbImage,
    pub status: &'a str,
    pub pattern_found: bool,
}

#[derive(thiserror::Error, Debug)]
pub enum DisplayError {
    #[error(transparent)]
    Image(#[from] image::ImageError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Presentation sink for the live overlay.
pub trait Display: Send {
    fn show(&mut self, frame: &OverlayFrame<'_>) -> Result<(), DisplayError>;

    /// Free window or file resources. Called exactly once.
    fn release(&mut self) {}
}

/// Headless sink.
#[derive(Debug, Default)]
pub struct NullDisplay;

impl Display for NullDisplay {
    fn show(&mut self, _frame: &OverlayFrame<'_>) -> Result<(), DisplayError> {
        Ok(())
    }
}

/// Writes the overlay, with the status line drawn in, to an image file at
/// most once per `min_interval`, replacing it atomically so viewers never
/// read a half-written file.
#[derive(Debug)]
pub struct PreviewFileDisplay {
    path: PathBuf,
    min_interval: Duration,
    last_write: Option<Instant>,
    last_status: String,
}

impl PreviewFileDisplay {
    pub fn new(path: impl Into<PathBuf>, min_interval: Duration) -> Self {
        Self {
            path: path.into(),
            min_interval,
            last_write: None,
            last_status: String::new(),
        }
    }
}

impl Display for PreviewFileDisplay {
    fn show(&mut self, frame: &OverlayFrame<'_>) -> Result<(), DisplayError> {
        if frame.status != self.last_status {
            log::debug!("preview status: {}", frame.status);
            self.last_status = frame.status.to_string();
        }
        if self
            .last_write
            .is_some_and(|t| t.elapsed() < self.min_interval)
        {
            return Ok(());
        }
        let format = ImageFormat::from_path(&self.path)?;
        let mut image = frame.image.clone();
        draw_status_line(&mut image, frame.status);
        let tmp = self.path.with_extension("partial");
        image.save_with_format(&tmp, format)?;
        std::fs::rename(&tmp, &self.path)?;
        self.last_write = Some(Instant::now());
        Ok(())
    }

    fn release(&mut self) {
        let _ = std::fs::remove_file(self.path.with_extension("partial"));
    }
}

struct DisplayGuard(Box<dyn Display>);

impl Drop for DisplayGuard {
    fn drop(&mut self) {
        self.0.release();
        log::debug!("display released");
    }
}

/// Why the loop ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StopReason {
    Requested,
    CameraFailed(String),
}

/// Result of [`AcquisitionHandle::shutdown`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// The loop acknowledged within the timeout.
    Stopped(StopReason),
    /// No acknowledgment in time; the camera was released from outside.
    TimedOut(ReleaseOutcome),
    /// The loop thread died without acknowledging.
    Panicked,
    /// `shutdown` already ran.
    AlreadyStopped,
}

/// The acquisition loop before it is started (the idle state).
pub struct AcquisitionLoop {
    camera: Arc<SharedCamera>,
    detector: Box<dyn PatternDetector>,
    display: Box<dyn Display>,
    state: DetectionState,
    hud: SharedHud,
}

impl AcquisitionLoop {
    pub fn new(
        camera: Arc<SharedCamera>,
        detector: Box<dyn PatternDetector>,
        display: Box<dyn Display>,
        state: DetectionState,
        hud: SharedHud,
    ) -> Self {
        Self {
            camera,
            detector,
            display,
            state,
            hud,
        }
    }

    /// Start reading frames on a dedicated thread.
    pub fn spawn(self) -> std::io::Result<AcquisitionHandle> {
        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let camera = Arc::clone(&self.camera);
        let thread = thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || {
                let reason = self.run(&stop_rx);
                let _ = done_tx.send(reason);
            })?;
        log::info!("acquisition loop started");
        Ok(AcquisitionHandle {
            stop_tx: Some(stop_tx),
            done_rx,
            thread: Some(thread),
            camera,
            stopped: None,
        })
    }

    #[cfg_attr(feature = "tracing", instrument(level = "info", skip_all))]
    fn run(self, stop_rx: &Receiver<()>) -> StopReason {
        let Self {
            camera,
            detector,
            display,
            state,
            hud,
        } = self;
        let mut display = DisplayGuard(display);
        let mut frames: u64 = 0;
        let mut last_found: Option<bool> = None;
        let mut display_failed = false;

        let reason = loop {
            match stop_rx.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => break StopReason::Requested,
                Err(TryRecvError::Empty) => {}
            }

            let frame = match camera.read_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    log::error!("camera read failed, stopping acquisition: {e}");
                    state.clear();
                    break StopReason::CameraFailed(e.to_string());
                }
            };
            frames += 1;
            if frames == 1 {
                log::info!("camera frame size {}x{}", frame.width(), frame.height());
            }

            let detection: PatternDetection = detector.detect(&frame);
            if last_found != Some(detection.found) {
                if detection.found {
                    log::info!("calibration pattern visible");
                } else {
                    log::info!("calibration pattern not found");
                }
                last_found = Some(detection.found);
            }

            let overlay = render_overlay(&frame, &detection);
            state.publish(frame, detection.found);

            let status = hud.status_line();
            let shown = display.0.show(&OverlayFrame {
                image: &overlay,
                status: &status,
                pattern_found: detection.found,
            });
            match shown {
                Ok(()) => display_failed = false,
                Err(e) if !display_failed => {
                    log::warn!("display update failed: {e}");
                    display_failed = true;
                }
                Err(_) => {}
            }
        };

        drop(display);
        camera.release();
        log::info!("acquisition loop stopped after {frames} frame(s)");
        reason
    }
}

/// Controller for a running acquisition loop.
///
/// Dropping the handle performs [`shutdown`](Self::shutdown) with
/// [`DEFAULT_SHUTDOWN_TIMEOUT`].
pub struct AcquisitionHandle {
    stop_tx: Option<Sender<()>>,
    done_rx: Receiver<StopReason>,
    thread: Option<JoinHandle<()>>,
    camera: Arc<SharedCamera>,
    stopped: Option<StopReason>,
}

impl AcquisitionHandle {
    /// Ask the loop to stop after the current frame. Does not wait.
    pub fn request_stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }

    /// `false` once the loop has ended for any reason.
    pub fn is_running(&mut self) -> bool {
        if self.thread.is_none() || self.stopped.is_some() {
            return false;
        }
        match self.done_rx.try_recv() {
            Ok(reason) => {
                self.stopped = Some(reason);
                false
            }
            Err(TryRecvError::Empty) => true,
            Err(TryRecvError::Disconnected) => false,
        }
    }

    /// Stop the loop and wait up to `timeout` for it to acknowledge.
    ///
    /// On timeout the camera is released from this thread (or handed to the
    /// in-flight read to release) and the loop thread is detached.
    pub fn shutdown(&mut self, timeout: Duration) -> ShutdownOutcome {
        let Some(thread) = self.thread.take() else {
            return ShutdownOutcome::AlreadyStopped;
        };
        self.request_stop();

        let acknowledged = match self.stopped.take() {
            Some(reason) => Ok(reason),
            None => self.done_rx.recv_timeout(timeout),
        };
        match acknowledged {
            Ok(reason) => {
                let _ = thread.join();
                ShutdownOutcome::Stopped(reason)
            }
            Err(RecvTimeoutError::Timeout) => {
                let released = self.camera.release();
                log::warn!(
                    "acquisition loop did not stop within {} ms, camera release: {released:?}",
                    timeout.as_millis()
                );
                ShutdownOutcome::TimedOut(released)
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = thread.join();
                self.camera.release();
                log::error!("acquisition thread ended without acknowledging stop");
                ShutdownOutcome::Panicked
            }
        }
    }
}

impl Drop for AcquisitionHandle {
    fn drop(&mut self) {
        self.shutdown(DEFAULT_SHUTDOWN_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{Camera, CameraError};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SlowCamera {
        delay: Duration,
        releases: Arc<AtomicUsize>,
        fail_after: Option<usize>,
        reads: usize,
    }

    impl Camera for SlowCamera {
        fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
            thread::sleep(self.delay);
            self.reads += 1;
            if self.fail_after.is_some_and(|n| self.reads > n) {
                return Err(CameraError::Read("unplugged".to_string()));
            }
            Ok(RgbImage::new(8, 8))
        }

        fn release(&mut self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CountingDisplay(Arc<AtomicUsize>);

    impl Display for CountingDisplay {
        fn show(&mut self, _frame: &OverlayFrame<'_>) -> Result<(), DisplayError> {
            Ok(())
        }

        fn release(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Rig {
        handle: AcquisitionHandle,
        state: DetectionState,
        camera_releases: Arc<AtomicUsize>,
        display_releases: Arc<AtomicUsize>,
    }

    fn start(delay_ms: u64, fail_after: Option<usize>, found: bool) -> Rig {
        let camera_releases = Arc::new(AtomicUsize::new(0));
        let display_releases = Arc::new(AtomicUsize::new(0));
        let camera = Arc::new(SharedCamera::new(Box::new(SlowCamera {
            delay: Duration::from_millis(delay_ms),
            releases: camera_releases.clone(),
            fail_after,
            reads: 0,
        })));
        let state = DetectionState::new();
        let detector = move |_: &RgbImage| PatternDetection {
            found,
            corners: Vec::new(),
        };
        let handle = AcquisitionLoop::new(
            camera,
            Box::new(detector),
            Box::new(CountingDisplay(display_releases.clone())),
            state.clone(),
            SharedHud::default(),
        )
        .spawn()
        .expect("spawn");
        Rig {
            handle,
            state,
            camera_releases,
            display_releases,
        }
    }

    fn wait_for<F: FnMut() -> bool>(mut cond: F) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn publishes_frames_and_stops_on_request() {
        let mut rig = start(1, None, true);
        wait_for(|| rig.state.latest().is_some_and(|s| s.sequence >= 3));
        assert!(rig.state.pattern_visible());

        let outcome = rig.handle.shutdown(Duration::from_secs(2));
        assert_eq!(outcome, ShutdownOutcome::Stopped(StopReason::Requested));
        assert_eq!(rig.camera_releases.load(Ordering::SeqCst), 1);
        assert_eq!(rig.display_releases.load(Ordering::SeqCst), 1);
        assert_eq!(
            rig.handle.shutdown(Duration::from_secs(2)),
            ShutdownOutcome::AlreadyStopped
        );
        drop(rig.handle);
        assert_eq!(rig.camera_releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn quit_during_a_read_finishes_within_the_bound() {
        let mut rig = start(150, None, false);
        wait_for(|| rig.state.latest().is_some());
        assert!(!rig.state.pattern_visible());

        let started = Instant::now();
        let outcome = rig.handle.shutdown(Duration::from_secs(2));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(outcome, ShutdownOutcome::Stopped(StopReason::Requested));
        assert_eq!(rig.camera_releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn timeout_releases_camera_exactly_once() {
        let mut rig = start(400, None, true);
        wait_for(|| rig.state.latest().is_some());

        let started = Instant::now();
        let outcome = rig.handle.shutdown(Duration::from_millis(50));
        assert!(started.elapsed() < Duration::from_millis(350));
        assert!(matches!(outcome, ShutdownOutcome::TimedOut(_)));

        wait_for(|| rig.display_releases.load(Ordering::SeqCst) == 1);
        wait_for(|| rig.camera_releases.load(Ordering::SeqCst) == 1);
        thread::sleep(Duration::from_millis(50));
        assert_eq!(rig.camera_releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn camera_failure_ends_loop_and_clears_state() {
        let mut rig = start(1, Some(2), true);
        wait_for(|| !rig.handle.is_running());
        assert!(rig.state.latest().is_none());
        assert_eq!(
            rig.handle.shutdown(Duration::from_secs(1)),
            ShutdownOutcome::Stopped(StopReason::CameraFailed(
                "frame read failed: unplugged".to_string()
            ))
        );
        assert_eq!(rig.camera_releases.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hud_status_line_reflects_updates() {
        let hud = SharedHud::default();
        hud.set(HudInfo {
            session_name: "data2024050101".to_string(),
            samples: 3,
        });
        assert_eq!(hud.status_line(), "captured: 3 | session: data2024050101");
    }

    #[test]
    fn preview_file_carries_the_status_line() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("preview.png");
        let mut display = PreviewFileDisplay::new(&path, Duration::ZERO);
        let image = RgbImage::from_pixel(200, 30, image::Rgb([128, 128, 128]));
        display
            .show(&OverlayFrame {
                image: &image,
                status: "captured: 2 | session: data2024050101",
                pattern_found: true,
            })
            .expect("show");

        let written = image::open(&path).expect("preview").to_rgb8();
        assert_eq!(written.get_pixel(4, 2), &image::Rgb([255, 255, 255]));
        assert_eq!(written.get_pixel(0, 0), &image::Rgb([0, 0, 0]));
        assert_eq!(written.get_pixel(199, 29), &image::Rgb([128, 128, 128]));
        assert_eq!(image.get_pixel(4, 2), &image::Rgb([128, 128, 128]));
        assert!(!path.with_extension("partial").exists());
        display.release();
    }
}
