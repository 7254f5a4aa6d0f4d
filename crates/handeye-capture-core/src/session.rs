//! Session directory allocation and the in-memory session registry.
//!
//! A session directory is named `{prefix}{YYYYMMDD}{NN}` with `NN` in
//! `01..=99`. The registry remembers every suffix it has handed out per day,
//! so a suffix is never issued twice within one process even when the
//! directory has been deleted in the meantime.

use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;

use crate::error::{SolverInputError, StorageError};
use crate::report::CalibrationMode;

/// Default directory name prefix.
pub const DEFAULT_PREFIX: &str = "data";
/// Pose log file name inside a session directory.
pub const POSE_LOG_FILE: &str = "poses.txt";
/// Largest two-digit session suffix.
pub const MAX_SESSIONS_PER_DAY: u8 = 99;

const DATE_FORMAT: &str = "%Y%m%d";

/// Parsed `{prefix}{YYYYMMDD}{NN}` directory name.
///
/// Ordering matches the lexical ordering of the rendered names for a fixed
/// prefix.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SessionName {
    prefix: String,
    date: NaiveDate,
    seq: u8,
}

impl SessionName {
    /// Build a name; `seq` must be in `1..=99`.
    pub fn new(prefix: impl Into<String>, date: NaiveDate, seq: u8) -> Option<Self> {
        if seq == 0 || seq > MAX_SESSIONS_PER_DAY {
            return None;
        }
        Some(Self {
            prefix: prefix.into(),
            date,
            seq,
        })
    }

    /// Parse a directory name. Accepts any two-digit suffix, including `00`,
    /// so that foreign directories still count when picking the next slot.
    pub fn parse(prefix: &str, name: &str) -> Option<Self> {
        let rest = name.strip_prefix(prefix)?;
        if rest.len() != 10 || !rest.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let (date, seq) = rest.split_at(8);
        let date = NaiveDate::parse_from_str(date, DATE_FORMAT).ok()?;
        let seq = seq.parse().ok()?;
        Some(Self {
            prefix: prefix.to_string(),
            date,
            seq,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn date(&self) -> NaiveDate {
        self.date
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{:02}",
            self.prefix,
            self.date.format(DATE_FORMAT),
            self.seq
        )
    }
}

/// One allocated capture session backed by a directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Session {
    name: SessionName,
    dir: PathBuf,
}

/// File counts used to validate a session before solving.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionInventory {
    pub images: usize,
    pub poses: usize,
}

impl Session {
    pub fn name(&self) -> &SessionName {
        &self.name
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn pose_log_path(&self) -> PathBuf {
        self.dir.join(POSE_LOG_FILE)
    }

    /// Path of the image belonging to sample `index`.
    pub fn image_path(&self, index: usize) -> PathBuf {
        self.dir.join(format!("{index}.jpg"))
    }

    pub fn result_path(&self, mode: CalibrationMode) -> PathBuf {
        self.dir.join(mode.result_file_name())
    }

    /// Count sample images (`{N}.jpg`) and non-empty pose-log lines.
    pub fn inventory(&self) -> Result<SessionInventory, StorageError> {
        let entries =
            fs::read_dir(&self.dir).map_err(|e| StorageError::io("read", &self.dir, e))?;
        let mut images = 0;
        for entry in entries {
            let entry = entry.map_err(|e| StorageError::io("read", &self.dir, e))?;
            if is_sample_image(&entry.path()) {
                images += 1;
            }
        }
        let log_path = self.pose_log_path();
        let poses = match fs::read_to_string(&log_path) {
            Ok(text) => count_pose_lines(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
            Err(e) => return Err(StorageError::io("read", log_path, e)),
        };
        Ok(SessionInventory { images, poses })
    }

    /// Check that the session holds a usable, consistently indexed data set.
    pub fn validate_for_solve(&self) -> Result<SessionInventory, SolverInputError> {
        let session = self.name.to_string();
        if !self.dir.is_dir() {
            return Err(SolverInputError::MissingDirectory { session });
        }
        if !self.pose_log_path().is_file() {
            return Err(SolverInputError::MissingPoseLog { session });
        }
        let inventory = self
            .inventory()
            .map_err(|_| SolverInputError::MissingDirectory {
                session: session.clone(),
            })?;
        if inventory.images == 0 {
            return Err(SolverInputError::NoImages { session });
        }
        if inventory.poses == 0 {
            return Err(SolverInputError::EmptyPoseLog { session });
        }
        if inventory.images != inventory.poses {
            return Err(SolverInputError::CountMismatch {
                session,
                images: inventory.images,
                poses: inventory.poses,
            });
        }
        Ok(inventory)
    }
}

pub(crate) fn count_pose_lines(text: &str) -> usize {
    text.lines().filter(|l| !l.trim().is_empty()).count()
}

fn is_sample_image(path: &Path) -> bool {
    let is_jpg = path
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("jpg"));
    is_jpg
        && path
            .file_stem()
            .and_then(|s| s.to_str())
            .is_some_and(|s| s.parse::<usize>().is_ok())
        && path.is_file()
}

/// Sessions under one base directory, ordered by allocation.
///
/// Sessions found on disk when the registry is opened come first, sorted by
/// name; every session allocated afterwards is appended.
#[derive(Debug)]
pub struct SessionRegistry {
    base: PathBuf,
    prefix: String,
    sessions: Vec<Session>,
    issued: BTreeMap<NaiveDate, u8>,
}

impl SessionRegistry {
    /// Open (and create if needed) the base directory and index the sessions
    /// already present in it.
    pub fn open(base: impl Into<PathBuf>, prefix: impl Into<String>) -> Result<Self, StorageError> {
        let base = base.into();
        let prefix = prefix.into();
        ensure_base_dir(&base)?;

        let mut names = scan_session_names(&base, &prefix)?;
        names.sort();

        let mut issued: BTreeMap<NaiveDate, u8> = BTreeMap::new();
        let sessions = names
            .into_iter()
            .map(|name| {
                let slot = issued.entry(name.date()).or_default();
                *slot = (*slot).max(name.seq());
                Session {
                    dir: base.join(name.to_string()),
                    name,
                }
            })
            .collect::<Vec<_>>();

        log::debug!(
            "indexed {} existing session(s) under {}",
            sessions.len(),
            base.display()
        );
        Ok(Self {
            base,
            prefix,
            sessions,
            issued,
        })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn sessions(&self) -> &[Session] {
        &self.sessions
    }

    /// The most recently allocated session.
    pub fn latest(&self) -> Option<&Session> {
        self.sessions.last()
    }

    /// Create the next session directory for `date` with an empty pose log.
    pub fn allocate(&mut self, date: NaiveDate) -> Result<Session, StorageError> {
        ensure_base_dir(&self.base)?;

        let on_disk = scan_session_names(&self.base, &self.prefix)?
            .into_iter()
            .filter(|n| n.date() == date)
            .map(|n| n.seq())
            .max()
            .unwrap_or(0);
        let issued = self.issued.get(&date).copied().unwrap_or(0);
        let last = on_disk.max(issued);
        let name = SessionName::new(self.prefix.clone(), date, last.saturating_add(1))
            .ok_or_else(|| StorageError::SessionsExhausted {
                date: date.format(DATE_FORMAT).to_string(),
            })?;

        let dir = self.base.join(name.to_string());
        fs::create_dir(&dir).map_err(|e| StorageError::io("create directory", &dir, e))?;
        let log_path = dir.join(POSE_LOG_FILE);
        if let Err(e) = fs::File::create(&log_path) {
            let _ = fs::remove_dir(&dir);
            return Err(StorageError::io("create", log_path, e));
        }

        self.issued.insert(date, name.seq());
        let session = Session { name, dir };
        log::info!("allocated session {}", session.dir.display());
        self.sessions.push(session.clone());
        Ok(session)
    }
}

/// Allocate the next session for `date` under `base_directory` with the
/// default `data` prefix.
pub fn allocate_session(
    base_directory: impl Into<PathBuf>,
    date: NaiveDate,
) -> Result<Session, StorageError> {
    SessionRegistry::open(base_directory, DEFAULT_PREFIX)?.allocate(date)
}

fn ensure_base_dir(base: &Path) -> Result<(), StorageError> {
    fs::create_dir_all(base).map_err(|e| StorageError::io("create directory", base, e))?;
    if !base.is_dir() {
        return Err(StorageError::NotADirectory {
            path: base.to_path_buf(),
        });
    }
    Ok(())
}

fn scan_session_names(base: &Path, prefix: &str) -> Result<Vec<SessionName>, StorageError> {
    let entries = fs::read_dir(base).map_err(|e| StorageError::io("read", base, e))?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StorageError::io("read", base, e))?;
        if !entry.path().is_dir() {
            continue;
        }
        if let Some(name) = entry
            .file_name()
            .to_str()
            .and_then(|n| SessionName::parse(prefix, n))
        {
            names.push(name);
        }
    }
    Ok(names)
}
