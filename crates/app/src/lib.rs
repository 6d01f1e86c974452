use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use puppeteer_core::checkpoint::{CheckpointStore, FetchOutcome};
use puppeteer_core::config::{config_path, data_dir, initialize_data_dir, AppConfig};
use puppeteer_core::inference::OnnxModelLoader;
use puppeteer_core::logging::{
    self, FileSink, LoggingOptions, PanicHookStatus, RedactingMakeWriter, DEFAULT_LOG_FILTER,
};
use puppeteer_core::pipeline::{AnimationInputs, Animator, PipelineProgress, Stage};
use puppeteer_core::server::{app_state_with_config, serve};
use puppeteer_core::types::{AnimationOptions, DownloadProgress};

#[derive(Parser)]
#[command(
    name = "puppeteer",
    about = "Animate a still image with the motion of a driving video"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(short, long, help = "Server port (overrides PORT and config)")]
    port: Option<u16>,

    #[arg(long, help = "Server bind address")]
    host: Option<String>,

    #[arg(long, global = true, help = "Data directory (overrides PUPPETEER_DATA_DIR)")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the web UI and API (default).
    Serve,
    /// Download the model checkpoint if it is not present yet.
    Fetch(FetchArgs),
    /// Animate a source image with a driving video and write an MP4.
    Animate(AnimateArgs),
}

#[derive(Args)]
struct FetchArgs {
    #[arg(long, help = "Checkpoint URL (defaults to [checkpoint].url in config.toml)")]
    url: Option<String>,
}

#[derive(Args)]
struct AnimateArgs {
    #[arg(short = 's', long, help = "Source image (.jpg, .jpeg, .png)")]
    source: PathBuf,
    #[arg(short = 'd', long, help = "Driving video (.mp4, .mov, .avi)")]
    driving: PathBuf,
    #[arg(short = 'o', long, help = "Output MP4 path")]
    output: PathBuf,
    #[arg(
        long,
        conflicts_with = "absolute",
        help = "Use relative keypoint displacement (default from [animation].relative)"
    )]
    relative: bool,
    #[arg(long, help = "Use absolute instead of relative keypoint displacement")]
    absolute: bool,
    #[arg(long, help = "Adapt movement scale to the source")]
    adapt_scale: bool,
    #[arg(
        long,
        conflicts_with = "adapt_scale",
        help = "Keep the driving movement scale (default from [animation].adapt_scale)"
    )]
    no_adapt_scale: bool,
}

impl AnimateArgs {
    /// Flags given on the command line win; the rest come from config.toml.
    fn options(&self, defaults: AnimationOptions) -> AnimationOptions {
        let relative = if self.absolute {
            false
        } else {
            self.relative || defaults.relative
        };
        let adapt_scale = if self.no_adapt_scale {
            false
        } else {
            self.adapt_scale || defaults.adapt_scale
        };
        AnimationOptions {
            relative,
            adapt_scale,
        }
    }
}

pub async fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let resolved_data_dir = data_dir(cli.data_dir.as_deref());
    let mode = match cli.command {
        None | Some(Commands::Serve) => "server",
        Some(_) => "cli",
    };

    puppeteer_core::runtime::setup_runtime_libs();
    init_logging(
        Some(resolved_data_dir.as_path()),
        cli.verbose,
        cli.log_filter.as_deref(),
    );
    puppeteer_core::runtime::log_runtime_lib_status();
    log_startup_metadata(mode, &resolved_data_dir);

    let config = load_config(&resolved_data_dir)?;

    match cli.command {
        None | Some(Commands::Serve) => {
            run_server(cli.port, cli.host, config, resolved_data_dir).await
        }
        Some(Commands::Fetch(args)) => run_fetch(args, &config, &resolved_data_dir).await,
        Some(Commands::Animate(args)) => run_animate(args, config, resolved_data_dir).await,
    }
}

fn init_logging(data_dir: Option<&Path>, verbose: u8, cli_log_filter: Option<&str>) {
    let panic_hook = logging::install_panic_hook(data_dir);
    if let PanicHookStatus::Unavailable { reason } = &panic_hook {
        eprintln!(
            "Warning: panic crash artifact hook unavailable ({reason}). Panics will not be persisted to crash logs."
        );
    }

    let options = LoggingOptions {
        data_dir: data_dir.map(Path::to_path_buf),
        verbose,
        cli_log_filter: cli_log_filter.map(ToString::to_string),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        ..Default::default()
    };
    let filters = logging::compose_log_filters(&options);
    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(parse_env_filter_with_fallback(&filters.console, "console"));

    match logging::open_file_sink(&options) {
        FileSink::Ready { appender, .. } => {
            let subscriber = tracing_subscriber::registry().with(console_layer).with(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(RedactingMakeWriter::new(appender))
                    .with_filter(parse_env_filter_with_fallback(&filters.file, "file")),
            );

            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
            }
        }
        FileSink::Unavailable {
            attempted_log_dir,
            reason,
        } => {
            let subscriber = tracing_subscriber::registry().with(console_layer);
            if let Err(error) = tracing::subscriber::set_global_default(subscriber) {
                eprintln!(
                    "Failed to initialize tracing subscriber: {error}. Continuing without structured tracing."
                );
                return;
            }

            let attempted_log_dir = attempted_log_dir
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "<none>".to_string());
            warn!(
                attempted_log_dir = %attempted_log_dir,
                reason = %reason,
                "Persistent file logging unavailable; continuing with console-only logging"
            );
        }
    }

    if let PanicHookStatus::Unavailable { reason } = panic_hook {
        warn!(reason = %reason, "Panic crash artifact hook unavailable");
    }
}

fn parse_env_filter_with_fallback(filter: &str, sink_name: &str) -> tracing_subscriber::EnvFilter {
    tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|error| {
        eprintln!(
            "Invalid {sink_name} log filter '{filter}': {error}. Falling back to '{DEFAULT_LOG_FILTER}'."
        );
        tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

fn log_startup_metadata(mode: &str, data_dir: &Path) {
    info!(
        mode,
        pid = std::process::id(),
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %data_dir.display(),
        config_path = %config_path(data_dir).display(),
        "Runtime startup metadata"
    );
}

/// An unreadable config file falls back to defaults; a readable one with
/// invalid values stops startup.
fn load_config(data_dir: &Path) -> Result<AppConfig> {
    if let Err(e) = initialize_data_dir(data_dir) {
        warn!(error = %e, "Failed to initialize data directory");
    }
    let path = config_path(data_dir);
    let config = match AppConfig::load_from_path(&path) {
        Ok(config) => config,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "Failed to load config file, using defaults");
            AppConfig::default()
        }
    };
    config
        .validate()
        .with_context(|| format!("invalid configuration in {}", path.display()))?;
    Ok(config)
}

fn resolve_port(cli_port: Option<u16>, env_port: Option<&str>, config_port: u16) -> u16 {
    cli_port
        .or_else(|| env_port.and_then(|v| v.trim().parse().ok()))
        .unwrap_or(config_port)
}

async fn run_server(
    port_override: Option<u16>,
    host_override: Option<String>,
    config: AppConfig,
    data_dir: PathBuf,
) -> Result<()> {
    let port = resolve_port(
        port_override,
        std::env::var("PORT").ok().as_deref(),
        config.server.port,
    );
    let host = host_override.unwrap_or_else(|| config.server.host.clone());

    let state = app_state_with_config(config, data_dir);
    serve(state, &host, port).await
}

async fn run_fetch(args: FetchArgs, config: &AppConfig, data_dir: &Path) -> Result<()> {
    let url = args
        .url
        .unwrap_or_else(|| config.checkpoint.url.clone())
        .trim()
        .to_string();
    let store = CheckpointStore::new(config.checkpoint_path(data_dir));

    if !store.is_present() && url.is_empty() {
        bail!("no checkpoint URL given; pass --url or set [checkpoint].url in config.toml");
    }

    let started = Instant::now();
    let outcome = tokio::task::spawn_blocking(move || {
        let outcome = store.ensure(&url, &mut |progress: DownloadProgress| {
            eprint!(
                "\r{}    ",
                render_byte_progress(progress, started.elapsed().as_secs_f64())
            );
        });
        (outcome, store)
    })
    .await
    .context("checkpoint download task panicked")?;

    let (outcome, store) = outcome;
    match outcome.context("checkpoint download failed")? {
        FetchOutcome::AlreadyPresent => {
            info!(path = %store.path().display(), "Checkpoint already present");
        }
        FetchOutcome::Downloaded { bytes } => {
            eprintln!();
            info!(
                path = %store.path().display(),
                size = %format_bytes(bytes),
                "Checkpoint ready"
            );
        }
    }
    Ok(())
}

async fn run_animate(args: AnimateArgs, config: AppConfig, data_dir: PathBuf) -> Result<()> {
    let source_bytes = tokio::fs::read(&args.source)
        .await
        .with_context(|| format!("failed to read source image: {}", args.source.display()))?;
    let driving_bytes = tokio::fs::read(&args.driving)
        .await
        .with_context(|| format!("failed to read driving video: {}", args.driving.display()))?;

    let options = args.options(config.animation.options());
    let checkpoint = Arc::new(CheckpointStore::new(config.checkpoint_path(&data_dir)));
    let loader = Arc::new(OnnxModelLoader::new(config.inference.backend));
    let animator = Animator::new(&config, &data_dir, loader, checkpoint);

    let source_name = file_name_of(&args.source)?;
    let driving_name = file_name_of(&args.driving)?;
    info!(
        source = %args.source.display(),
        driving = %args.driving.display(),
        relative = options.relative,
        adapt_scale = options.adapt_scale,
        "Animating"
    );

    let started = Instant::now();
    let output = tokio::task::spawn_blocking(move || {
        animator.run(
            AnimationInputs {
                source_name: &source_name,
                source_bytes: &source_bytes,
                driving_name: &driving_name,
                driving_bytes: &driving_bytes,
                options,
            },
            &mut |progress| {
                eprint!(
                    "\r{}    ",
                    render_frame_progress(progress, started.elapsed().as_secs_f64())
                );
            },
        )
    })
    .await
    .context("animation task panicked")??;
    eprintln!();

    let Some(video) = output.video_mp4 else {
        bail!(
            "{}",
            output
                .notice
                .unwrap_or_else(|| "no video was produced".to_string())
        );
    };

    tokio::fs::write(&args.output, &video)
        .await
        .with_context(|| format!("failed to write output video: {}", args.output.display()))?;
    info!(
        output = %args.output.display(),
        frames = output.frame_count,
        elapsed = %format_duration(started.elapsed().as_secs_f64()),
        "Animation written"
    );
    Ok(())
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .with_context(|| format!("path has no usable file name: {}", path.display()))
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let h = total / 3600;
    let m = (total % 3600) / 60;
    let s = total % 60;
    format!("{:02}:{:02}:{:02}", h, m, s)
}

fn format_bytes(bytes: u64) -> String {
    const MIB: f64 = 1024.0 * 1024.0;
    if bytes as f64 >= MIB {
        format!("{:.1} MiB", bytes as f64 / MIB)
    } else {
        format!("{:.1} KiB", bytes as f64 / 1024.0)
    }
}

const PROGRESS_BAR_WIDTH: usize = 30;

fn progress_bar(fraction: f64) -> String {
    let fraction = fraction.clamp(0.0, 1.0);
    let filled = (fraction * PROGRESS_BAR_WIDTH as f64).round() as usize;
    let empty = PROGRESS_BAR_WIDTH.saturating_sub(filled);
    "█".repeat(filled) + &"░".repeat(empty)
}

fn render_byte_progress(progress: DownloadProgress, elapsed: f64) -> String {
    match progress.fraction() {
        Some(fraction) => format!(
            "[{}] {:5.1}% | {} / {} | Elapsed: {}",
            progress_bar(fraction),
            fraction * 100.0,
            format_bytes(progress.downloaded),
            format_bytes(progress.total.unwrap_or(progress.downloaded)),
            format_duration(elapsed),
        ),
        None => format!(
            "Downloaded {} | Elapsed: {}",
            format_bytes(progress.downloaded),
            format_duration(elapsed),
        ),
    }
}

fn stage_name(stage: Stage) -> &'static str {
    match stage {
        Stage::Decoding => "Decoding",
        Stage::Animating => "Animating",
        Stage::Encoding => "Encoding",
    }
}

fn render_frame_progress(progress: PipelineProgress, elapsed: f64) -> String {
    let stage = stage_name(progress.stage);
    match progress.total {
        Some(total) if total > 0 => {
            let fraction = progress.done as f64 / total as f64;
            format!(
                "{stage:<9} [{}] {:5.1}% | Frame {}/{} | Elapsed: {}",
                progress_bar(fraction),
                fraction.clamp(0.0, 1.0) * 100.0,
                progress.done,
                total,
                format_duration(elapsed),
            )
        }
        _ => format!(
            "{stage:<9} Frame {} | Elapsed: {}",
            progress.done,
            format_duration(elapsed),
        ),
    }
}
