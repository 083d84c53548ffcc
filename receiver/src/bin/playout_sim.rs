//! Simulcast playout simulator - CLI binary.
//!
//! Runs simulated simulcast renditions through the receive pipeline and
//! reports what would have been displayed.

use anyhow::{Context, Result};
use clap::Parser;
use moq_playout_common::{
    init_tracing, ColorWhen, MetricsContext, MetricsServerConfig, MetricsSink,
};
use receiver::sim::{run_simulation, SimulcastConfig};
use receiver::{
    JitterBufferConfig, PacingMode, PidGains, Resolution, SimulreceiveConfig, SimulreceiveMode,
    VideoStreamConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// MoQ playout simulator - jitter buffering and simulreceive selection
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Rendition heights, highest first (16:9 widths are derived)
    #[arg(
        short,
        long,
        value_delimiter = ',',
        default_value = "1080,720,360",
        value_parser = clap::value_parser!(u32).range(1..=8640)
    )]
    renditions: Vec<u32>,

    /// Frames per second
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Seconds of media to simulate
    #[arg(short, long, default_value = "10")]
    seconds: u64,

    /// Object loss rate (0.0 to 1.0)
    #[arg(long, default_value = "0.0")]
    loss: f64,

    /// Base one-way delay in milliseconds
    #[arg(long, default_value = "40")]
    delay_ms: u64,

    /// Maximum random extra delay in milliseconds
    #[arg(short, long, default_value = "30")]
    jitter_ms: u64,

    /// Random seed (random if omitted)
    #[arg(long)]
    seed: Option<u64>,

    /// Jitter buffer minimum depth in milliseconds
    #[arg(short = 'b', long, default_value = "200")]
    min_depth_ms: u64,

    /// Jitter buffer capacity in objects
    #[arg(long, default_value = "150")]
    capacity: usize,

    /// Dequeue pacing
    #[arg(long, value_enum, default_value = "aligned")]
    pacing: PacingMode,

    /// Simulreceive mode
    #[arg(long, value_enum, default_value = "enable")]
    simulreceive: SimulreceiveMode,

    /// Decisions that would lower quality before it is displayed
    #[arg(long, default_value = "3")]
    quality_miss_threshold: u32,

    /// Prometheus metrics bind address (serves `GET /metrics`).
    #[arg(long, default_value = "127.0.0.1:9200")]
    metrics_bind: String,

    /// Keep serving metrics after the run until interrupted
    #[arg(long)]
    serve: bool,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorWhen,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color, "info")?;
    info!("Starting MoQ playout simulator v{VERSION}");
    info!("Renditions: {:?} at {}fps", args.renditions, args.fps);
    info!(
        "Network: {}ms delay, {}ms jitter, {:.1}% loss",
        args.delay_ms,
        args.jitter_ms,
        args.loss * 100.0
    );
    info!("Jitter buffer depth: {}ms, pacing {:?}", args.min_depth_ms, args.pacing);

    let metrics = MetricsContext::new("playout-sim")?;
    let metrics_bind = args.metrics_bind.parse().context("invalid metrics bind")?;
    let metrics_task = metrics.spawn_metrics_server(MetricsServerConfig::new(metrics_bind));

    let sim = SimulcastConfig {
        renditions: args
            .renditions
            .iter()
            .map(|&height| Resolution::widescreen(height))
            .collect(),
        fps: args.fps,
        duration: Duration::from_secs(args.seconds),
        loss_rate: args.loss,
        base_delay: Duration::from_millis(args.delay_ms),
        jitter: Duration::from_millis(args.jitter_ms),
        seed: args.seed,
        ..Default::default()
    };
    let stream = VideoStreamConfig {
        jitter: JitterBufferConfig {
            min_depth: Duration::from_millis(args.min_depth_ms),
            capacity: args.capacity,
            ..Default::default()
        },
        pacing: args.pacing,
        pid: PidGains::default(),
        ..Default::default()
    };
    let simulreceive = SimulreceiveConfig {
        mode: args.simulreceive,
        quality_miss_threshold: args.quality_miss_threshold,
        ..Default::default()
    };

    let sink: Arc<dyn MetricsSink> = Arc::new(metrics.clone());
    let report = run_simulation(sim, stream, simulreceive, Some(sink))
        .context("simulation failed")?;

    info!(
        "Sent {} objects, {} lost, {} late, {} underruns",
        report.objects_sent, report.objects_lost, report.late_objects, report.underruns
    );
    for (track, count) in &report.displayed {
        info!("  {track}: displayed {count}");
    }
    info!("Displayed {} frames in total", report.total_displayed());

    if args.serve {
        info!("Serving metrics on {metrics_bind}, Ctrl-C to exit");
        tokio::select! {
            result = metrics_task => result.context("metrics server panicked")??,
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }
    }

    Ok(())
}
