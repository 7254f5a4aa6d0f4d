//! Camera sources and the shared, release-once camera handle.
//!
//! Device drivers are out of scope; anything that can hand out RGB frames
//! implements [`Camera`]. [`ImageSequenceCamera`] replays a directory of
//! images as a live feed, which is what the CLI and the tests use.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};

use image::imageops::FilterType;
use image::RgbImage;

/// Camera failures. `Unavailable` at startup is fatal.
#[derive(thiserror::Error, Debug)]
pub enum CameraError {
    #[error("camera unavailable: {0}")]
    Unavailable(String),
    #[error("frame read failed: {0}")]
    Read(String),
    #[error("camera has been released")]
    Released,
}

/// A frame source.
pub trait Camera: Send {
    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<RgbImage, CameraError>;

    /// Free the device. Called exactly once by [`SharedCamera`].
    fn release(&mut self);
}

/// What [`SharedCamera::release`] managed to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The camera was released by this call.
    Released,
    /// A read is in flight; the reader releases the camera when it returns.
    Deferred,
    /// Someone else released it earlier.
    AlreadyReleased,
}

/// Camera shared between the acquisition thread and its controller.
///
/// The wrapped camera's `release` runs exactly once, whichever side asks
/// first, and at the latest when the last reference is dropped.
pub struct SharedCamera {
    slot: Mutex<Option<Box<dyn Camera>>>,
    release_requested: AtomicBool,
}

impl SharedCamera {
    pub fn new(camera: Box<dyn Camera>) -> Self {
        Self {
            slot: Mutex::new(Some(camera)),
            release_requested: AtomicBool::new(false),
        }
    }

    pub fn read_frame(&self) -> Result<RgbImage, CameraError> {
        let frame = {
            let mut slot = self.lock_slot();
            if self.release_requested.load(Ordering::SeqCst) {
                release_slot(&mut slot);
                return Err(CameraError::Released);
            }
            let camera = slot.as_mut().ok_or(CameraError::Released)?;
            camera.read_frame()
        };
        // A release that found the slot locked is completed here.
        if self.release_requested.load(Ordering::SeqCst) {
            release_slot(&mut self.lock_slot());
        }
        frame
    }

    /// Release the camera without waiting for an in-flight read.
    pub fn release(&self) -> ReleaseOutcome {
        self.release_requested.store(true, Ordering::SeqCst);
        let mut slot = match self.slot.try_lock() {
            Ok(slot) => slot,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return ReleaseOutcome::Deferred,
        };
        if release_slot(&mut slot) {
            ReleaseOutcome::Released
        } else {
            ReleaseOutcome::AlreadyReleased
        }
    }

    fn lock_slot(&self) -> MutexGuard<'_, Option<Box<dyn Camera>>> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_released(&self) -> bool {
        match self.slot.try_lock() {
            Ok(slot) => slot.is_none(),
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner().is_none(),
            Err(TryLockError::WouldBlock) => false,
        }
    }
}

impl Drop for SharedCamera {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(PoisonError::into_inner);
        release_slot(slot);
    }
}

fn release_slot(slot: &mut Option<Box<dyn Camera>>) -> bool {
    match slot.take() {
        Some(mut camera) => {
            camera.release();
            log::info!("camera released");
            true
        }
        None => false,
    }
}

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "tif"];

/// Replays the images of a directory in name order, looping forever, paced
/// to one frame per `interval`.
#[derive(Debug)]
pub struct ImageSequenceCamera {
    frames: Vec<PathBuf>,
    next: usize,
    interval: Duration,
    last_read: Option<Instant>,
    resolution: Option<(u32, u32)>,
}

impl ImageSequenceCamera {
    pub fn open(dir: impl AsRef<Path>, interval: Duration) -> Result<Self, CameraError> {
        let dir = dir.as_ref();
        let entries = fs::read_dir(dir)
            .map_err(|e| CameraError::Unavailable(format!("{}: {e}", dir.display())))?;
        let mut frames: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| p.is_file() && has_image_extension(p))
            .collect();
        if frames.is_empty() {
            return Err(CameraError::Unavailable(format!(
                "no images in {}",
                dir.display()
            )));
        }
        frames.sort();
        log::info!(
            "image sequence camera: {} frame(s) from {}",
            frames.len(),
            dir.display()
        );
        Ok(Self {
            frames,
            next: 0,
            interval,
            last_read: None,
            resolution: None,
        })
    }

    /// Scale every frame to `width`×`height`, like setting a capture mode on a
    /// real device.
    pub fn with_resolution(mut self, width: u32, height: u32) -> Self {
        self.resolution = Some((width, height));
        self
    }

    /// Frames in one pass over the directory.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl Camera for ImageSequenceCamera {
    fn read_frame(&mut self) -> Result<RgbImage, CameraError> {
        if self.frames.is_empty() {
            return Err(CameraError::Released);
        }
        if let Some(last) = self.last_read {
            let wait = self.interval.saturating_sub(last.elapsed());
            if !wait.is_zero() {
                thread::sleep(wait);
            }
        }
        self.last_read = Some(Instant::now());

        let path = &self.frames[self.next % self.frames.len()];
        self.next = self.next.wrapping_add(1);
        let frame = image::open(path)
            .map_err(|e| CameraError::Read(format!("{}: {e}", path.display())))?
            .to_rgb8();
        Ok(match self.resolution {
            Some((w, h)) if frame.dimensions() != (w, h) => {
                image::imageops::resize(&frame, w, h, FilterType::Triangle)
            }
            _ => frame,
        })
    }

    fn release(&mut self) {
        self.frames.clear();
        self.frames.shrink_to_fit();
    }
}

fn has_image_extension(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.iter().any(|x| e.eq_ignore_ascii_case(x)))
}
