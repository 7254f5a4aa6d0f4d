//! handeye-capture: collect image/pose pairs for hand-eye calibration.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use clap::{ArgAction, Parser};
use handeye_capture::acquisition::{
    AcquisitionLoop, Display, DetectionState, HudInfo, NullDisplay, PreviewFileDisplay, SharedHud,
};
use handeye_capture::camera::{CameraError, ImageSequenceCamera, SharedCamera};
use handeye_capture::config::{CaptureConfig, SolverConfig};
use handeye_capture::core::{init_with_level, SessionRegistry, DEFAULT_PREFIX};
use handeye_capture::detect::ChessboardDetector;
use handeye_capture::dispatcher::CommandDispatcher;
use handeye_capture::solver::CommandSolver;
use log::LevelFilter;

type CliError = Box<dyn std::error::Error>;
type CliResult<T> = Result<T, CliError>;

#[derive(Parser, Debug)]
#[command(name = "handeye-capture")]
#[command(about = "Capture chessboard images with robot poses for hand-eye calibration")]
#[command(version)]
struct Cli {
    /// JSON config file; missing or invalid parts fall back to defaults.
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Directory that holds the session directories.
    #[arg(long, default_value = "eye_hand_data")]
    base_dir: PathBuf,

    /// Session name prefix.
    #[arg(long, default_value = DEFAULT_PREFIX)]
    prefix: String,

    /// Directory of images replayed as the live camera feed.
    #[arg(long)]
    camera_dir: Option<PathBuf>,

    /// Delay between replayed frames.
    #[arg(long, default_value_t = 33)]
    frame_interval_ms: u64,

    /// Write the annotated live view to this image file.
    #[arg(long)]
    preview: Option<PathBuf>,

    /// External hand-eye solver program (overrides the config).
    #[arg(long)]
    solver: Option<String>,

    /// Extra argument passed to the solver before the mode (repeatable).
    #[arg(long = "solver-arg", allow_hyphen_values = true)]
    solver_args: Vec<String>,

    /// How long `quit` waits for the acquisition loop to stop.
    #[arg(long, default_value_t = 2000)]
    shutdown_timeout_ms: u64,

    /// More log output (-v debug, -vv trace).
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Only log warnings and errors.
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Log through `tracing` with JSON output.
    #[cfg(feature = "tracing")]
    #[arg(long)]
    json_logs: bool,
}

impl Cli {
    fn level(&self) -> LevelFilter {
        if self.quiet {
            return LevelFilter::Warn;
        }
        match self.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }

    fn apply_overrides(&self, mut config: CaptureConfig) -> CaptureConfig {
        if let Some(program) = &self.solver {
            config.solver = Some(SolverConfig {
                program: program.clone(),
                args: self.solver_args.clone(),
            });
        } else if !self.solver_args.is_empty() {
            match config.solver.as_mut() {
                Some(solver) => solver.args = self.solver_args.clone(),
                None => log::warn!("--solver-arg given without a solver program; ignored"),
            }
        }
        config
    }
}

fn init_logging(cli: &Cli) {
    #[cfg(feature = "tracing")]
    {
        if cli.json_logs {
            handeye_capture::core::init_tracing(true);
            let _ = tracing_log::LogTracer::init();
            return;
        }
    }
    if let Err(e) = init_with_level(cli.level()) {
        eprintln!("logger init failed: {e}");
    }
}

fn open_camera(cli: &Cli, config: &CaptureConfig) -> Result<ImageSequenceCamera, CameraError> {
    let Some(dir) = &cli.camera_dir else {
        return Err(CameraError::Unavailable(
            "no camera source; pass --camera-dir".to_string(),
        ));
    };
    let camera = ImageSequenceCamera::open(dir, Duration::from_millis(cli.frame_interval_ms))?
        .with_resolution(config.capture.width, config.capture.height);
    log::info!(
        "camera: {} frame(s) from {}, requested {}x{}",
        camera.frame_count(),
        dir.display(),
        config.capture.width,
        config.capture.height
    );
    Ok(camera)
}

fn main() -> CliResult<()> {
    let cli = Cli::parse();
    init_logging(&cli);

    let config = cli.apply_overrides(CaptureConfig::load_or_default(&cli.config));
    log::debug!("config: {config:?}");

    let camera = open_camera(&cli, &config).map_err(|e| {
        log::error!("{e}");
        e
    })?;
    let camera = Arc::new(SharedCamera::new(Box::new(camera)));

    let mut registry = SessionRegistry::open(&cli.base_dir, cli.prefix.clone())?;
    let session = registry.allocate(Local::now().date_naive())?;
    log::info!("session directory {}", session.dir().display());

    let state = DetectionState::new();
    let hud = SharedHud::new(HudInfo {
        session_name: session.name().to_string(),
        samples: 0,
    });
    let display: Box<dyn Display> = match &cli.preview {
        Some(path) => Box::new(PreviewFileDisplay::new(path, Duration::from_millis(200))),
        None => Box::new(NullDisplay),
    };
    let detector = ChessboardDetector::new(config.pattern.cols, config.pattern.rows);
    let handle = AcquisitionLoop::new(
        camera,
        Box::new(detector),
        display,
        state.clone(),
        hud.clone(),
    )
    .spawn()?;

    let mut dispatcher = CommandDispatcher::new(registry, &session, state, hud, io::stdout())?
        .with_acquisition(handle)
        .with_shutdown_timeout(Duration::from_millis(cli.shutdown_timeout_ms));
    match &config.solver {
        Some(solver) => {
            log::info!("solver: {}", solver.program);
            let solver = CommandSolver::new(&solver.program, solver.args.clone());
            dispatcher = dispatcher.with_solver(Box::new(solver));
        }
        None => log::info!("no solver configured; compute commands only validate the session"),
    }

    dispatcher.print_banner()?;
    dispatcher.run(io::stdin().lock())?;
    dispatcher.shutdown();
    Ok(())
}
