//! JSON configuration for the capture tool.
//!
//! Every section is optional. A missing file, malformed JSON, or an invalid
//! value never stops the program: the affected part falls back to its
//! default and a warning is logged.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Calibration board geometry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PatternConfig {
    /// Inner corners along the board's long side.
    pub cols: u32,
    /// Inner corners along the board's short side.
    pub rows: u32,
    /// Square edge length in meters.
    pub square_size: f64,
}

impl Default for PatternConfig {
    fn default() -> Self {
        Self {
            cols: 9,
            rows: 6,
            square_size: 0.02,
        }
    }
}

impl PatternConfig {
    fn problem(&self) -> Option<&'static str> {
        if self.cols == 0 || self.rows == 0 {
            Some("grid counts must be positive")
        } else if !self.square_size.is_finite() || self.square_size <= 0.0 {
            Some("square_size must be a positive length")
        } else {
            None
        }
    }
}

/// Requested capture resolution.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolutionConfig {
    pub width: u32,
    pub height: u32,
}

impl Default for ResolutionConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
        }
    }
}

impl ResolutionConfig {
    fn problem(&self) -> Option<&'static str> {
        (self.width == 0 || self.height == 0).then_some("width and height must be positive")
    }
}

/// External solver program.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolverConfig {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Whole configuration document.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default)]
    pub pattern: PatternConfig,
    #[serde(default)]
    pub capture: ResolutionConfig,
    #[serde(default)]
    pub solver: Option<SolverConfig>,
}

impl CaptureConfig {
    /// Strict load: any problem is an error.
    pub fn load_json(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Write this config to disk as pretty JSON.
    pub fn write_json(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Lenient load used at startup. Never fails.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) => {
                log::warn!(
                    "cannot read config {}: {e}; using defaults",
                    path.display()
                );
                return Self::default();
            }
        };
        Self::from_json_lenient(&raw)
    }

    /// Parse section by section, keeping whatever is valid.
    pub fn from_json_lenient(raw: &str) -> Self {
        let doc: Value = match serde_json::from_str(raw) {
            Ok(Value::Object(map)) => Value::Object(map),
            Ok(_) => {
                log::warn!("config is not a JSON object; using defaults");
                return Self::default();
            }
            Err(e) => {
                log::warn!("malformed config: {e}; using defaults");
                return Self::default();
            }
        };

        let pattern = section::<PatternConfig>(&doc, "pattern");
        let pattern = match pattern.problem() {
            Some(problem) => {
                log::warn!("config pattern: {problem}; using default 9x6, 0.02 m");
                PatternConfig::default()
            }
            None => pattern,
        };
        let capture = section::<ResolutionConfig>(&doc, "capture");
        let capture = match capture.problem() {
            Some(problem) => {
                log::warn!("config capture: {problem}; using default 1280x720");
                ResolutionConfig::default()
            }
            None => capture,
        };
        let solver = match doc.get("solver") {
            None | Some(Value::Null) => None,
            Some(v) => match SolverConfig::deserialize(v) {
                Ok(s) if !s.program.trim().is_empty() => Some(s),
                Ok(_) => {
                    log::warn!("config solver: empty program; no solver configured");
                    None
                }
                Err(e) => {
                    log::warn!("config solver: {e}; no solver configured");
                    None
                }
            },
        };

        Self {
            pattern,
            capture,
            solver,
        }
    }
}

fn section<T>(doc: &Value, key: &str) -> T
where
    T: Default + for<'de> Deserialize<'de>,
{
    match doc.get(key) {
        None | Some(Value::Null) => T::default(),
        Some(v) => T::deserialize(v).unwrap_or_else(|e| {
            log::warn!("config {key}: {e}; using defaults");
            T::default()
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        let cfg = CaptureConfig::from_json_lenient("{}");
        assert_eq!(cfg, CaptureConfig::default());
        assert_eq!(cfg.pattern.cols, 9);
        assert_eq!(cfg.pattern.rows, 6);
        assert_eq!(cfg.pattern.square_size, 0.02);
        assert_eq!(cfg.capture.width, 1280);
        assert_eq!(cfg.capture.height, 720);
        assert!(cfg.solver.is_none());
    }

    #[test]
    fn valid_sections_are_kept_independently() {
        let cfg = CaptureConfig::from_json_lenient(
            r#"{
                "pattern": { "cols": 11, "rows": 8, "square_size": 0.015 },
                "capture": { "width": "wide", "height": 480 },
                "solver": { "program": "solve-handeye", "args": ["--fast"] }
            }"#,
        );
        assert_eq!(
            cfg.pattern,
            PatternConfig {
                cols: 11,
                rows: 8,
                square_size: 0.015
            }
        );
        assert_eq!(cfg.capture, ResolutionConfig::default());
        assert_eq!(
            cfg.solver,
            Some(SolverConfig {
                program: "solve-handeye".to_string(),
                args: vec!["--fast".to_string()],
            })
        );
    }

    #[test]
    fn invalid_values_fall_back() {
        let cfg = CaptureConfig::from_json_lenient(
            r#"{ "pattern": { "cols": 0, "rows": 6, "square_size": 0.02 },
                 "capture": { "width": 0, "height": 720 },
                 "solver": { "program": "  " } }"#,
        );
        assert_eq!(cfg, CaptureConfig::default());
    }

    #[test]
    fn malformed_or_missing_file_gives_defaults() {
        assert_eq!(
            CaptureConfig::from_json_lenient("{ not json"),
            CaptureConfig::default()
        );
        assert_eq!(
            CaptureConfig::from_json_lenient("[1, 2]"),
            CaptureConfig::default()
        );
        let tmp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            CaptureConfig::load_or_default(tmp.path().join("missing.json")),
            CaptureConfig::default()
        );
    }

    #[test]
    fn written_config_loads_strictly() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("config.json");
        let cfg = CaptureConfig {
            solver: Some(SolverConfig {
                program: "solve".to_string(),
                args: Vec::new(),
            }),
            ..CaptureConfig::default()
        };
        cfg.write_json(&path).expect("write");
        assert_eq!(CaptureConfig::load_json(&path).expect("load"), cfg);
    }
}
