use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gpsplay::config::{ProgressStyle, ReplayMode, ReplaySettings};
use gpsplay::core::TrackPoint;
use gpsplay::input::load_file;
use gpsplay::playback::{PlaybackController, TracingListener};
use gpsplay::sink::StdoutSink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "gpsplay", version, about = "Replay recorded GPS tracks as live location fixes")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Replay a GPX or NMEA track, printing fixes to stdout as JSON lines
    Play(PlayArgs),
    /// Print a summary of a track without replaying it
    Inspect {
        /// Path to a .gpx or .nmea file
        path: PathBuf,
    },
}

#[derive(clap::Args, Debug)]
struct PlayArgs {
    /// Path to a .gpx or .nmea file
    path: PathBuf,

    /// Follow the recorded timestamps instead of one point per tick
    #[arg(long)]
    real_time: bool,

    /// Real-time speed multiplier (0.1 - 10)
    #[arg(long)]
    speed: Option<f64>,

    /// Fixed-rate tick period in milliseconds
    #[arg(long)]
    interval_ms: Option<u64>,

    /// Report progress as floor(100 * index / len) instead of 1-based
    #[arg(long)]
    zero_based: bool,

    /// Persist the effective settings before playing
    #[arg(long)]
    save_settings: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gpsplay=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    match args.command {
        Command::Inspect { path } => inspect(&path),
        Command::Play(play) => {
            let rt = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
            rt.block_on(run(play))
        }
    }
}

fn inspect(path: &Path) -> Result<()> {
    let points = load_file(path)?;

    println!("{}: {} points", path.display(), points.len());
    if let (Some(first), Some(last)) = (points.first(), points.last()) {
        println!("  first: {:.6}, {:.6}", first.latitude, first.longitude);
        println!("  last:  {:.6}, {:.6}", last.latitude, last.longitude);
    }

    let timed: Vec<i64> = points.iter().filter_map(TrackPoint::time_millis).collect();
    if let (Some(start), Some(end)) = (timed.first(), timed.last()) {
        println!(
            "  timed: {} points over {:.1} s",
            timed.len(),
            (end - start) as f64 / 1000.0
        );
    }
    let elevated = points.iter().filter(|p| p.elevation.is_some()).count();
    println!("  with elevation: {}", elevated);

    Ok(())
}

fn settings_for(play: &PlayArgs) -> ReplaySettings {
    let mut settings = ReplaySettings::load();
    if play.real_time {
        settings.mode = ReplayMode::RealTime;
    }
    if let Some(speed) = play.speed {
        settings.speed = speed;
    }
    if let Some(ms) = play.interval_ms {
        settings.tick_interval_ms = ms;
    }
    if play.zero_based {
        settings.progress_style = ProgressStyle::ZeroBased;
    }
    settings.sanitized()
}

async fn run(play: PlayArgs) -> Result<()> {
    let settings = settings_for(&play);
    if play.save_settings {
        settings.save()?;
    }

    let controller = PlaybackController::new(
        settings,
        Arc::new(StdoutSink::new()),
        Arc::new(TracingListener),
    );
    controller.start_service(&play.path).await;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => line.context("Failed to read stdin")?,
        };

        // stdin closed: keep playing until interrupted
        let Some(line) = line else {
            tokio::signal::ctrl_c().await.context("Failed to wait for ctrl-c")?;
            break;
        };

        let mut words = line.split_whitespace();
        match (words.next(), words.next()) {
            (Some("jump"), Some(n)) => match n.parse::<i64>() {
                Ok(minutes) => controller.jump(minutes),
                Err(_) => warn!("Not a number of minutes: {}", n),
            },
            (Some("stop"), None) => controller.stop_service().await,
            (Some("start"), None) => controller.start_service(&play.path).await,
            (Some("quit"), None) => break,
            (None, _) => {}
            _ => warn!("Unknown command: {} (try jump <n>, stop, start, quit)", line.trim()),
        }
    }

    controller.stop_service().await;
    Ok(())
}
