//! Hand-eye solver seam.
//!
//! The solve itself is external. [`CommandSolver`] runs a program as
//! `{program} {args..} {mode} {image_dir} {pose_log}` and reads a JSON
//! solution from its stdout:
//!
//! ```json
//! { "rotation": [[1, 0, 0], [0, 1, 0], [0, 0, 1]], "translation": [0.1, 0.0, 0.2] }
//! ```
//!
//! `translation` may also be a 3×1 column (`[[x], [y], [z]]`).

use std::path::Path;
use std::process::{Command, Stdio};

use handeye_capture_core::{CalibrationMode, HandEyeSolution};
use serde::Deserialize;

#[cfg(feature = "tracing")]
use tracing::instrument;

/// Tolerance for accepting a solver rotation as orthonormal with det +1.
pub const ROTATION_TOLERANCE: f64 = 1e-3;

/// Failures of the underlying solve.
#[derive(thiserror::Error, Debug)]
pub enum SolverError {
    #[error("failed to start solver '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("solver exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("solver output is not a valid solution: {0}")]
    Output(#[from] serde_json::Error),
    #[error("solver returned a matrix that is not a proper rotation")]
    NotARotation,
    #[error("no solver configured for {mode}")]
    NotConfigured { mode: &'static str },
}

/// Computes the camera/robot transform from a session's images and poses.
pub trait HandEyeSolver {
    fn solve(
        &self,
        mode: CalibrationMode,
        image_dir: &Path,
        pose_log: &Path,
    ) -> Result<HandEyeSolution, SolverError>;
}

impl<F> HandEyeSolver for F
where
    F: Fn(CalibrationMode, &Path, &Path) -> Result<HandEyeSolution, SolverError>,
{
    fn solve(
        &self,
        mode: CalibrationMode,
        image_dir: &Path,
        pose_log: &Path,
    ) -> Result<HandEyeSolution, SolverError> {
        self(mode, image_dir, pose_log)
    }
}

/// Reject solutions that are not rigid transforms.
pub fn validate_solution(solution: HandEyeSolution) -> Result<HandEyeSolution, SolverError> {
    if solution.is_proper_rotation(ROTATION_TOLERANCE) {
        Ok(solution)
    } else {
        Err(SolverError::NotARotation)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Translation {
    Flat([f64; 3]),
    Column([[f64; 1]; 3]),
}

#[derive(Deserialize)]
struct SolverOutput {
    rotation: [[f64; 3]; 3],
    translation: Translation,
}

/// Parse the JSON printed by an external solver.
pub fn parse_solver_output(stdout: &str) -> Result<HandEyeSolution, SolverError> {
    let out: SolverOutput = serde_json::from_str(stdout.trim())?;
    let translation = match out.translation {
        Translation::Flat(t) => t,
        Translation::Column([[x], [y], [z]]) => [x, y, z],
    };
    Ok(HandEyeSolution::from_arrays(out.rotation, translation))
}

/// Runs an external solver program.
#[derive(Clone, Debug)]
pub struct CommandSolver {
    program: String,
    args: Vec<String>,
}

impl CommandSolver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

impl HandEyeSolver for CommandSolver {
    #[cfg_attr(
        feature = "tracing",
        instrument(level = "info", skip(self), fields(program = %self.program))
    )]
    fn solve(
        &self,
        mode: CalibrationMode,
        image_dir: &Path,
        pose_log: &Path,
    ) -> Result<HandEyeSolution, SolverError> {
        log::info!(
            "running solver {} for {} on {}",
            self.program,
            mode.as_str(),
            image_dir.display()
        );
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(mode.as_str())
            .arg(image_dir)
            .arg(pose_log)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| SolverError::Spawn {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(SolverError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        parse_solver_output(&String::from_utf8_lossy(&output.stdout))
    }
}
