//! sentineld - exam monitoring daemon
//!
//! This daemon:
//! 1. Loads `SentinelConfig` (file from SENTINEL_CONFIG + environment)
//! 2. Builds the known-student gallery from `students_dir`
//! 3. Registers the configured cameras and result sinks
//! 4. Runs the pipeline until Ctrl-C or `--seconds` elapse
//! 5. Logs per-camera health periodically

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use exam_sentinel::{DisplaySink, EmitSink, Pipeline, SentinelConfig};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Monitor exam-takers across cameras and emit integrity verdicts"
)]
struct Args {
    /// Stop after this many seconds (runs until Ctrl-C when omitted).
    #[arg(long)]
    seconds: Option<u64>,

    /// Write emitted results (JSON lines) to this file instead of stdout.
    #[arg(long, env = "SENTINEL_EMIT_PATH")]
    emit_path: Option<PathBuf>,

    /// Do not emit results; only log verdict changes.
    #[arg(long)]
    no_emit: bool,

    /// Interval between health log lines.
    #[arg(long, default_value = "10")]
    health_interval_secs: u64,

    /// Additional camera URLs (appended to the configured cameras).
    #[arg(long = "camera")]
    cameras: Vec<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SentinelConfig::load()?;
    let mut pipeline = Pipeline::new(config.pipeline_settings());

    if config.students_dir.is_dir() {
        let known = pipeline.load_gallery(&config.students_dir)?;
        log::info!("{} known students loaded", known);
    } else {
        log::warn!(
            "students_dir {} not found; every face will be reported as unknown",
            config.students_dir.display()
        );
    }

    for camera in &config.cameras {
        pipeline.add_camera(&camera.url, camera.id, camera.name.as_deref())?;
    }
    for url in &args.cameras {
        pipeline.add_camera(url, None, None)?;
    }

    pipeline.add_sink(Box::new(DisplaySink::new()));
    if !args.no_emit {
        let writer: Box<dyn Write + Send> = match &args.emit_path {
            Some(path) => Box::new(BufWriter::new(
                File::create(path)
                    .with_context(|| format!("failed to create {}", path.display()))?,
            )),
            None => Box::new(std::io::stdout()),
        };
        pipeline.add_sink(Box::new(EmitSink::new(writer)));
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let deadline = args.seconds.map(|s| Instant::now() + Duration::from_secs(s));
    let health_interval = Duration::from_secs(args.health_interval_secs.max(1));

    pipeline.scoped(|pipeline| -> Result<()> {
        if !pipeline.start() {
            return Err(anyhow!("pipeline failed to start (see log)"));
        }
        log::info!("sentineld running. press Ctrl-C to stop");

        loop {
            let wait = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        log::info!("run time elapsed, stopping");
                        break;
                    }
                    remaining.min(health_interval)
                }
                None => health_interval,
            };
            match rx.recv_timeout(wait) {
                Ok(()) => {
                    log::info!("shutdown signal received, stopping pipeline...");
                    break;
                }
                Err(mpsc::RecvTimeoutError::Timeout) => pipeline.log_health(),
                Err(mpsc::RecvTimeoutError::Disconnected) => break,
            }
        }
        pipeline.log_health();
        Ok(())
    })
}
