use anyhow::{Context, Result};
use chordsync::cache::{AnalysisCache, FileStamp};
use chordsync::config::AppConfig;
use chordsync::jobs::command::CommandBackend;
use chordsync::jobs::{self, AnalysisBackend, JobPayload};
use chordsync::playback::{ClockSource, PlaybackController, PlaybackSource, ViewSink};
use chordsync::render::{self, TerminalView};
use chordsync::timeline::ChordTimeline;
use chordsync::tracker::PositionTracker;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::time::MissedTickBehavior;

const PLAY_HELP: &str = "Commands: p play/pause, f/b seek, g <sec> go to, s stop, e export, q quit";

#[derive(Parser)]
#[command(name = "chordsync", version, about = "Chord timeline follow-along for audio files")]
struct Cli {
    /// Ignore the analysis cache for this run
    #[arg(long, global = true)]
    no_cache: bool,

    /// Verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play a file with a live chord display (commands on stdin)
    Play {
        /// Audio file to load
        file: PathBuf,
    },

    /// Run every analysis job on a file and print the results
    Analyze {
        /// Audio file to analyze
        file: PathBuf,

        /// Also write the chord listing to the export directory
        #[arg(long)]
        export: bool,
    },

    /// Recognize chords and write a `(MM:SS - MM:SS): chord` listing
    Export {
        /// Audio file to export chords for
        file: PathBuf,

        /// Output directory (defaults to config export_dir)
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Resolve positions against a chord timeline file (.lab, JSON or JAMS)
    Resolve {
        /// Timeline file
        timeline: PathBuf,

        /// Positions in milliseconds, resolved in order
        #[arg(required = true)]
        positions: Vec<u64>,
    },

    /// Export chord listings for every audio file under a directory
    Batch {
        /// Directory to walk
        dir: PathBuf,

        /// Output directory (defaults to config export_dir)
        #[arg(short, long)]
        out: Option<PathBuf>,

        /// Number of parallel workers (0 = auto-detect from config)
        #[arg(short = 'j', long, default_value = "0")]
        jobs: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Set up logging based on verbosity
    let log_level = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(log_level))
        .format_timestamp(None)
        .init();

    // Load config file (optional, defaults if missing)
    let config = AppConfig::load();
    let use_cache = config.use_cache && !cli.no_cache;

    match cli.command {
        Commands::Play { file } => {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .context("Failed to start async runtime")?;
            runtime.block_on(play(&config, &file, open_cache(&config, use_cache)))?;
        }

        Commands::Analyze { file, export } => {
            analyze(&config, &file, open_cache(&config, use_cache), export)?;
        }

        Commands::Export { file, out } => {
            let out_dir = out.unwrap_or_else(|| config.export_dir.clone());
            let cache = open_cache(&config, use_cache);
            let backend = CommandBackend::from_config(&config);
            let timeline = chords_for(&backend, cache.as_ref(), &file)?;
            let title = chordsync::metadata::read_track_info(&file).title;
            let path = chordsync::export::write_listing(&timeline, &out_dir, &title)
                .context("Export failed")?;
            println!("Chords exported to {}", path.display());
        }

        Commands::Resolve { timeline, positions } => {
            let text = std::fs::read_to_string(&timeline)
                .with_context(|| format!("Failed to read {}", timeline.display()))?;
            let parsed = ChordTimeline::parse(&text)
                .with_context(|| format!("Invalid timeline {}", timeline.display()))?;
            let duration_ms = (parsed.end_time() * 1000.0).round() as u64;
            println!("{} segments, {}", parsed.len(), chordsync::metadata::format_clock(duration_ms));

            let mut tracker = PositionTracker::new(parsed);
            for ms in positions {
                let view = tracker.resolve(ms);
                println!("{}", render::format_view(&view, duration_ms));
            }
            let stats = tracker.stats();
            log::debug!(
                "{} resolves, {} steps, {} rescans",
                stats.resolves, stats.steps, stats.rescans
            );
        }

        Commands::Batch { dir, out, jobs } => {
            let workers = if jobs > 0 { jobs } else { config.resolve_workers() };
            let out_dir = out.unwrap_or_else(|| config.export_dir.clone());
            let cache = open_cache(&config, use_cache);
            let backend = CommandBackend::from_config(&config);
            let result = chordsync::batch::export_directory(
                &backend,
                cache.as_ref(),
                &dir,
                &out_dir,
                workers,
            )
            .context("Batch export failed")?;
            println!(
                "Batch complete: {} exported ({} from cache), {} failed",
                result.exported, result.cached, result.failed
            );
        }
    }

    Ok(())
}

/// The cache is optional: failing to open it only costs recomputation.
fn open_cache(config: &AppConfig, enabled: bool) -> Option<AnalysisCache> {
    if !enabled {
        return None;
    }
    let path = config.resolve_cache_path();
    match AnalysisCache::open(&path) {
        Ok(cache) => {
            log::info!("Cache: {}", path.display());
            Some(cache)
        }
        Err(e) => {
            log::warn!("Could not open cache {}: {}", path.display(), e);
            None
        }
    }
}

fn chords_for(
    backend: &dyn AnalysisBackend,
    cache: Option<&AnalysisCache>,
    file: &Path,
) -> Result<ChordTimeline> {
    let stamp = FileStamp::of(file).with_context(|| format!("Cannot read {}", file.display()))?;
    if let Some(cache) = cache {
        match cache.lookup(&stamp) {
            Ok(Some(hit)) => {
                if let Some(chords) = hit.chords {
                    log::info!("Using cached chords for {}", file.display());
                    return Ok(chords);
                }
            }
            Ok(None) => {}
            Err(e) => log::warn!("Cache lookup failed: {}", e),
        }
    }

    let timeline = chordsync::batch::recognize(backend, file).context("Chord recognition failed")?;
    if let Some(cache) = cache {
        if let Err(e) = cache.record(&stamp, &JobPayload::Chords(timeline.clone())) {
            log::warn!("Could not cache chords: {}", e);
        }
    }
    Ok(timeline)
}

fn build_controller<V: ViewSink>(
    config: &AppConfig,
    view: V,
    auto_play: bool,
    cache: Option<AnalysisCache>,
) -> (PlaybackController<ClockSource, V>, jobs::JobReceiver) {
    let (tx, rx) = jobs::job_channel();
    let backend: Arc<dyn AnalysisBackend> = Arc::new(CommandBackend::from_config(config));
    let mut playback = config.playback.clone();
    playback.auto_play = auto_play;
    let mut controller = PlaybackController::new(ClockSource::new(), view, playback, backend, tx);
    if let Some(cache) = cache {
        controller = controller.with_cache(cache);
    }
    (controller, rx)
}

async fn play(config: &AppConfig, file: &Path, cache: Option<AnalysisCache>) -> Result<()> {
    let (mut controller, mut rx) =
        build_controller(config, TerminalView::stdout(), config.playback.auto_play, cache);
    controller
        .load(file)
        .with_context(|| format!("Cannot play {}", file.display()))?;
    println!("{PLAY_HELP}");

    let mut ticker = tokio::time::interval(controller.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                controller.tick();
            }
            Some(event) = rx.recv() => {
                controller.handle_job(event);
            }
            line = lines.next_line() => {
                match line.context("Failed to read stdin")? {
                    Some(line) => {
                        if !run_command(&mut controller, line.trim(), &config.export_dir) {
                            break;
                        }
                    }
                    // stdin closed
                    None => break,
                }
            }
        }
    }

    controller.stop();
    println!();
    Ok(())
}

/// Apply one interactive command. Returns false on quit.
fn run_command<S: PlaybackSource, V: ViewSink>(
    controller: &mut PlaybackController<S, V>,
    line: &str,
    export_dir: &Path,
) -> bool {
    let mut parts = line.split_whitespace();
    match parts.next() {
        Some("p") => controller.play_pause(),
        Some("f") => controller.seek_forward(),
        Some("b") => controller.seek_back(),
        Some("g") => match parts.next().and_then(|s| s.parse::<f64>().ok()) {
            Some(secs) if secs.is_finite() && secs >= 0.0 => {
                controller.seek_to((secs * 1000.0).round() as u64)
            }
            _ => eprintln!("usage: g <seconds>"),
        },
        Some("s") => controller.stop(),
        Some("e") => {
            if let Err(e) = controller.export(export_dir) {
                eprintln!("Export failed: {e}");
            }
        }
        Some("q") => return false,
        Some(other) => eprintln!("Unknown command '{other}'. {PLAY_HELP}"),
        None => {}
    }
    true
}

fn analyze(
    config: &AppConfig,
    file: &Path,
    cache: Option<AnalysisCache>,
    export: bool,
) -> Result<()> {
    // Read before the cache moves into the controller
    let cached_at = cache.as_ref().and_then(|c| {
        let stamp = FileStamp::of(file).ok()?;
        c.lookup(&stamp).ok().flatten()?.analyzed_at
    });

    let (mut controller, mut rx) =
        build_controller(config, TerminalView::notices_only(std::io::stdout()), false, cache);
    controller
        .load(file)
        .with_context(|| format!("Cannot analyze {}", file.display()))?;

    while !controller.session().is_some_and(|s| s.is_settled()) {
        let Some(event) = rx.blocking_recv() else {
            anyhow::bail!("Analysis workers stopped before reporting");
        };
        controller.handle_job(event);
    }

    let Some(session) = controller.session() else {
        anyhow::bail!("No track loaded");
    };
    println!();
    match session.info().artist.as_deref() {
        Some(artist) => println!("{} - {}", artist, session.title()),
        None => println!("{}", session.title()),
    }
    if let Some(at) = cached_at {
        println!("  cached analysis from {}", at.format("%Y-%m-%d %H:%M UTC"));
    }
    if let Some(line) = session.key_tempo_line() {
        println!("  {line}");
    }
    if let Some(stem) = session.stem() {
        println!("  stem: {}", stem.display());
    }
    println!("  {} chord segments", session.timeline().len());
    println!();
    print!("{}", chordsync::export::render_listing(session.timeline()));

    let failed = session.failures().len();
    if export {
        controller
            .export(&config.export_dir)
            .context("Export failed")?;
    }
    if failed > 0 {
        println!("{failed} job(s) failed");
    }
    Ok(())
}
