//! Stderr logger for the capture tool.
//!
//! Lines look like `[  1.234s  INFO acquisition] camera released`: elapsed
//! time, level and the name of the logging thread, since the acquisition
//! loop and the operator prompt log side by side. Debug output of other
//! crates (the detector stack) only shows up at trace level.

use std::fmt;
use std::io::Write;
use std::sync::OnceLock;
use std::thread;
use std::time::Instant;

use log::{Level, LevelFilter, Log, Metadata, Record};

#[cfg(feature = "tracing")]
use tracing_subscriber::fmt::format::FmtSpan;
#[cfg(feature = "tracing")]
use tracing_subscriber::util::SubscriberInitExt;
#[cfg(feature = "tracing")]
use tracing_subscriber::EnvFilter;

/// Log targets of this tool; everything else is third-party.
const OWN_TARGETS: [&str; 2] = ["handeye_capture", "handeye_capture_core"];

struct CaptureLogger {
    level: LevelFilter,
    started: Instant,
}

impl CaptureLogger {
    fn admits(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
            && (metadata.level() <= Level::Info
                || self.level == LevelFilter::Trace
                || is_own_target(metadata.target()))
    }
}

impl Log for CaptureLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.admits(metadata)
    }

    fn log(&self, record: &Record) {
        if !self.admits(record.metadata()) {
            return;
        }
        let current = thread::current();
        let line = format_line(
            self.started.elapsed().as_secs_f64(),
            record.level(),
            current.name(),
            record.args(),
        );
        // One write per line keeps the two threads from interleaving.
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
    }

    fn flush(&self) {
        let _ = std::io::stderr().flush();
    }
}

fn is_own_target(target: &str) -> bool {
    OWN_TARGETS.iter().any(|own| {
        target
            .strip_prefix(own)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
    })
}

fn format_line(elapsed: f64, level: Level, thread: Option<&str>, args: &fmt::Arguments) -> String {
    format!(
        "[{elapsed:7.3}s {level:>5} {}] {args}\n",
        thread.unwrap_or("-")
    )
}

static LOGGER: OnceLock<CaptureLogger> = OnceLock::new();

/// Install the stderr logger with the provided level filter.
///
/// Calling this more than once is a no-op after the first successful
/// initialization.
pub fn init_with_level(level: LevelFilter) -> Result<(), log::SetLoggerError> {
    if LOGGER.get().is_none() {
        let logger = LOGGER.get_or_init(|| CaptureLogger {
            level,
            started: Instant::now(),
        });
        log::set_logger(logger)?;
        log::set_max_level(level);
    }
    Ok(())
}

/// Install a `tracing` subscriber filtered by `RUST_LOG` (default `info`),
/// tagging events with the thread that emitted them.
#[cfg(feature = "tracing")]
pub fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_span_events(FmtSpan::CLOSE)
        .with_thread_names(true);
    let _ = if json {
        builder.json().flatten_event(true).finish().try_init()
    } else {
        builder
            .with_timer(tracing_subscriber::fmt::time::Uptime::default())
            .finish()
            .try_init()
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use log::MetadataBuilder;

    fn logger(level: LevelFilter) -> CaptureLogger {
        CaptureLogger {
            level,
            started: Instant::now(),
        }
    }

    fn meta(level: Level, target: &str) -> Metadata<'_> {
        MetadataBuilder::new().level(level).target(target).build()
    }

    #[test]
    fn third_party_debug_needs_trace() {
        let debug = logger(LevelFilter::Debug);
        assert!(debug.admits(&meta(Level::Debug, "handeye_capture::dispatcher")));
        assert!(debug.admits(&meta(Level::Debug, "handeye_capture_core::pose")));
        assert!(debug.admits(&meta(Level::Info, "calib_targets::detect")));
        assert!(!debug.admits(&meta(Level::Debug, "calib_targets::detect")));
        assert!(!debug.admits(&meta(Level::Debug, "handeye_capture_extra")));
        assert!(!debug.admits(&meta(Level::Trace, "handeye_capture")));

        let trace = logger(LevelFilter::Trace);
        assert!(trace.admits(&meta(Level::Debug, "calib_targets::detect")));

        let quiet = logger(LevelFilter::Warn);
        assert!(!quiet.admits(&meta(Level::Info, "handeye_capture")));
        assert!(quiet.admits(&meta(Level::Error, "chess_corners")));
    }

    #[test]
    fn line_names_the_logging_thread() {
        let line = format_line(
            1.5,
            Level::Info,
            Some("acquisition"),
            &format_args!("camera released"),
        );
        assert_eq!(line, "[  1.500s  INFO acquisition] camera released\n");
        let line = format_line(0.0, Level::Warn, None, &format_args!("x"));
        assert_eq!(line, "[  0.000s  WARN -] x\n");
    }
}
