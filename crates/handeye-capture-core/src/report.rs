//! Calibration modes, solver results and the persisted text report.

use std::fmt::Write as _;
use std::io::Write;
use std::path::PathBuf;

use nalgebra::{Matrix3, Rotation3, UnitQuaternion, Vector3};

use crate::error::ReportError;
use crate::session::Session;

/// Hand-eye calibration flavour. Both consume the same session data.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CalibrationMode {
    /// Camera mounted on the end-effector.
    EyeInHand,
    /// Camera fixed relative to the robot base.
    EyeToHand,
}

impl CalibrationMode {
    pub const ALL: [CalibrationMode; 2] = [CalibrationMode::EyeInHand, CalibrationMode::EyeToHand];

    pub fn result_file_name(self) -> &'static str {
        match self {
            Self::EyeInHand => "eye_in_hand_result.txt",
            Self::EyeToHand => "eye_to_hand_result.txt",
        }
    }

    /// Identifier passed to external solvers.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EyeInHand => "eye_in_hand",
            Self::EyeToHand => "eye_to_hand",
        }
    }

    pub fn title(self) -> &'static str {
        match self {
            Self::EyeInHand => "Eye-in-hand",
            Self::EyeToHand => "Eye-to-hand",
        }
    }

    /// What the solved transform describes.
    pub fn describes(self) -> &'static str {
        match self {
            Self::EyeInHand => "camera pose relative to the robot end-effector",
            Self::EyeToHand => "camera pose relative to the robot base",
        }
    }
}

/// Rotation and translation returned by a hand-eye solver.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct HandEyeSolution {
    pub rotation: Matrix3<f64>,
    /// Meters.
    pub translation: Vector3<f64>,
}

impl HandEyeSolution {
    pub fn new(rotation: Matrix3<f64>, translation: Vector3<f64>) -> Self {
        Self {
            rotation,
            translation,
        }
    }

    /// Build from a row-major rotation and a translation vector.
    pub fn from_arrays(rotation: [[f64; 3]; 3], translation: [f64; 3]) -> Self {
        let r = Matrix3::from_row_slice(&[
            rotation[0][0],
            rotation[0][1],
            rotation[0][2],
            rotation[1][0],
            rotation[1][1],
            rotation[1][2],
            rotation[2][0],
            rotation[2][1],
            rotation[2][2],
        ]);
        Self::new(r, Vector3::from(translation))
    }

    /// `R^T R = I` and `det R = +1` within `tol`.
    pub fn is_proper_rotation(&self, tol: f64) -> bool {
        let r = &self.rotation;
        if r.iter().any(|v| !v.is_finite()) || self.translation.iter().any(|v| !v.is_finite()) {
            return false;
        }
        let orthogonality = (r.transpose() * r - Matrix3::identity()).abs().max();
        orthogonality <= tol && (r.determinant() - 1.0).abs() <= tol
    }

    /// Quaternion equivalent of the rotation, canonicalized to `w >= 0`.
    /// Display only; the matrix stays authoritative.
    pub fn quaternion(&self) -> UnitQuaternion<f64> {
        let rot = Rotation3::from_matrix_unchecked(self.rotation);
        let q = UnitQuaternion::from_rotation_matrix(&rot);
        if q.w < 0.0 {
            UnitQuaternion::new_unchecked(-q.into_inner())
        } else {
            q
        }
    }

    /// Quaternion as `[x, y, z, w]`.
    pub fn quaternion_xyzw(&self) -> [f64; 4] {
        let q = self.quaternion();
        [q.i, q.j, q.k, q.w]
    }

    /// Human-readable labeled report.
    pub fn render_report(&self, mode: CalibrationMode) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "{} calibration result", mode.title());
        let _ = writeln!(out, "{}", "=".repeat(40));
        let _ = writeln!(out, "Rotation matrix:");
        for row in self.rotation.row_iter() {
            let _ = writeln!(out, "[{:.6}, {:.6}, {:.6}]", row[0], row[1], row[2]);
        }
        let t = &self.translation;
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Translation vector (m): [{:.6}, {:.6}, {:.6}]",
            t.x, t.y, t.z
        );
        let [qx, qy, qz, qw] = self.quaternion_xyzw();
        let _ = writeln!(out);
        let _ = writeln!(
            out,
            "Quaternion (x,y,z,w): [{qx:.6}, {qy:.6}, {qz:.6}, {qw:.6}]"
        );
        out
    }
}

/// Write the report for `mode` into the session directory.
///
/// The text goes to a temporary file in the same directory first and is
/// renamed into place, so a failed write leaves no result file.
pub fn write_report(
    session: &Session,
    mode: CalibrationMode,
    solution: &HandEyeSolution,
) -> Result<PathBuf, ReportError> {
    let path = session.result_path(mode);
    let io_err = |source: std::io::Error| ReportError::Io {
        path: path.clone(),
        source,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(session.dir()).map_err(io_err)?;
    tmp.write_all(solution.render_report(mode).as_bytes())
        .and_then(|()| tmp.flush())
        .map_err(io_err)?;
    tmp.persist(&path).map_err(|e| io_err(e.error))?;
    log::info!("wrote {} result to {}", mode.as_str(), path.display());
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionRegistry;
    use approx::assert_relative_eq;
    use chrono::NaiveDate;

    fn quarter_turn_about_z() -> HandEyeSolution {
        HandEyeSolution::from_arrays(
            [[0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0]],
            [0.1, -0.02, 0.35],
        )
    }

    #[test]
    fn quaternion_matches_rotation() {
        let [x, y, z, w] = quarter_turn_about_z().quaternion_xyzw();
        let h = std::f64::consts::FRAC_1_SQRT_2;
        assert_relative_eq!(x, 0.0, epsilon = 1e-12);
        assert_relative_eq!(y, 0.0, epsilon = 1e-12);
        assert_relative_eq!(z, h, epsilon = 1e-12);
        assert_relative_eq!(w, h, epsilon = 1e-12);
    }

    #[test]
    fn quaternion_is_canonical() {
        // Half turn about x: w = 0, any sign of x is valid; w never negative.
        let sol = HandEyeSolution::from_arrays(
            [[1.0, 0.0, 0.0], [0.0, -1.0, 0.0], [0.0, 0.0, -1.0]],
            [0.0; 3],
        );
        let [x, _, _, w] = sol.quaternion_xyzw();
        assert!(w >= 0.0);
        assert_relative_eq!(x.abs(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn rotation_check_rejects_scaled_and_reflected_matrices() {
        assert!(quarter_turn_about_z().is_proper_rotation(1e-6));
        let scaled = HandEyeSolution::new(Matrix3::identity() * 2.0, Vector3::zeros());
        assert!(!scaled.is_proper_rotation(1e-3));
        let reflected = HandEyeSolution::from_arrays(
            [[-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            [0.0; 3],
        );
        assert!(!reflected.is_proper_rotation(1e-3));
        let nan = HandEyeSolution::new(Matrix3::identity(), Vector3::new(f64::NAN, 0.0, 0.0));
        assert!(!nan.is_proper_rotation(1e-3));
    }

    #[test]
    fn report_lists_matrix_translation_and_quaternion() {
        let text = quarter_turn_about_z().render_report(CalibrationMode::EyeToHand);
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], "Eye-to-hand calibration result");
        assert_eq!(lines[2], "Rotation matrix:");
        assert_eq!(lines[3], "[0.000000, -1.000000, 0.000000]");
        assert_eq!(lines[4], "[1.000000, 0.000000, 0.000000]");
        assert_eq!(lines[5], "[0.000000, 0.000000, 1.000000]");
        assert_eq!(
            lines[7],
            "Translation vector (m): [0.100000, -0.020000, 0.350000]"
        );
        assert_eq!(
            lines[9],
            "Quaternion (x,y,z,w): [0.000000, 0.000000, 0.707107, 0.707107]"
        );
    }

    #[test]
    fn both_modes_write_distinct_files() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).expect("date");
        let session = SessionRegistry::open(tmp.path(), "data")
            .expect("open")
            .allocate(date)
            .expect("allocate");
        let sol = quarter_turn_about_z();
        let a = write_report(&session, CalibrationMode::EyeInHand, &sol).expect("in hand");
        let b = write_report(&session, CalibrationMode::EyeToHand, &sol).expect("to hand");
        assert_ne!(a, b);
        assert!(std::fs::read_to_string(a)
            .expect("read")
            .starts_with("Eye-in-hand"));
        assert!(std::fs::read_to_string(b)
            .expect("read")
            .starts_with("Eye-to-hand"));
        let stray = std::fs::read_dir(session.dir())
            .expect("dir")
            .filter_map(Result::ok)
            .filter(|e| e.file_name().to_string_lossy().starts_with(".tmp"))
            .count();
        assert_eq!(stray, 0);
    }
}
