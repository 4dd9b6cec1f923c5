//! CLI entry point for the media intake tool.

use std::io::{self, IsTerminal, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use media_intake::classify::{Classifier, DisabledLookup, MetadataLookup, TmdbLookup};
use media_intake::notify::{LogNotifier, Notifier, StatusEvent, ThrottledNotifier, render};
use media_intake::placement::{LibraryRoots, PlacementExecutor};
use media_intake::{
    DownloadQueue, ManualResolutionQueue, Pipeline, PipelineConfig, SourceRef, SourceRouter,
    SpeedLimiter, TransferWorker,
};
use tracing::{debug, info, warn};

mod cli;
mod console;

use cli::Args;

/// Minimum gap between two progress lines for the same item.
const CONSOLE_PROGRESS_INTERVAL: Duration = Duration::from_secs(1);

/// How long cancelled workers get to reach a chunk boundary on exit.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments first (before tracing, so --help works without logs)
    let args = Args::parse();

    // Priority: RUST_LOG env var > quiet flag > verbose flag > default (info)
    let default_level = if args.quiet {
        "error"
    } else {
        match args.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    debug!(?args, "CLI arguments parsed");

    let config = load_config(&args)?;
    info!("Media intake starting");

    // Read input: from positional args or stdin
    let input_text = if !args.sources.is_empty() {
        args.sources.join("\n")
    } else if !io::stdin().is_terminal() {
        let mut buffer = String::new();
        io::stdin().read_to_string(&mut buffer)?;
        buffer
    } else {
        info!("No input provided. Pipe sources via stdin or pass as arguments.");
        info!("Example: echo 'https://example.com/Movie.2010.mkv' | media-intake");
        return Ok(());
    };

    let sources = parse_sources(&input_text);
    if sources.is_empty() {
        info!("No usable sources found in input");
        return Ok(());
    }
    info!(sources = sources.len(), "Parsed input");

    tokio::fs::create_dir_all(&config.paths.temp_dir)
        .await
        .with_context(|| format!("creating {}", config.paths.temp_dir.display()))?;

    let spinner = console::new_spinner(!args.quiet && io::stderr().is_terminal());
    let sink: Arc<dyn Notifier> = if args.quiet {
        Arc::new(LogNotifier)
    } else {
        Arc::new(console::ConsoleNotifier::new(spinner.clone()))
    };
    let queue_settings = config.queue_settings();
    let notifier: Arc<dyn Notifier> =
        Arc::new(ThrottledNotifier::new(sink, CONSOLE_PROGRESS_INTERVAL));

    let router = SourceRouter::with_defaults().context("building transfer sources")?;
    let limiter = Arc::new(SpeedLimiter::from_mbps(config.download.max_speed_mbps));
    let worker = TransferWorker::new(Arc::new(router), limiter, config.worker_settings());

    let (queue, completed) = DownloadQueue::new(queue_settings, worker, Arc::clone(&notifier))
        .context("creating download queue")?;

    info!(
        concurrency = config.download.concurrency,
        max_speed_mbps = config.download.max_speed_mbps,
        "Download queue ready"
    );

    let dispatcher = {
        let queue = queue.clone();
        tokio::spawn(async move { queue.run().await })
    };

    let classifier = Classifier::new(build_lookup(&config)?, config.classifier_settings());
    let placement = PlacementExecutor::new(
        config.library_roots(),
        config.classification.conflict_policy,
    );
    let manual = Arc::new(ManualResolutionQueue::new(placement.clone()));
    let pipeline = Arc::new(Pipeline::new(
        classifier,
        placement,
        Arc::clone(&manual),
        Arc::clone(&notifier),
    ));
    let pipeline_task = {
        let pipeline = Arc::clone(&pipeline);
        tokio::spawn(async move { pipeline.run(completed).await })
    };

    let stop = Arc::new(AtomicBool::new(false));
    let spinner_task = spinner
        .clone()
        .map(|bar| console::spawn_snapshot_updates(bar, queue.clone(), Arc::clone(&stop)));

    for (source, filename) in sources {
        let admission = queue.enqueue(source, &filename, None).await?;
        debug!(id = %admission.id, position = admission.position, "source admitted");
    }

    tokio::select! {
        () = queue.wait_idle() => {}
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, cancelling remaining downloads");
        }
    }
    queue.shutdown().await;
    if !queue.drain(SHUTDOWN_GRACE).await {
        warn!("Exiting with transfers still running; partial files may remain");
    }

    if let Err(e) = dispatcher.await {
        warn!(error = %e, "dispatch task ended abnormally");
    }
    if let Err(e) = pipeline_task.await {
        warn!(error = %e, "pipeline task ended abnormally");
    }

    let entries = manual.list().await;
    if !entries.is_empty() {
        notifier.notify(StatusEvent::PendingListing {
            entries: entries.clone(),
        });
    }
    // No operator is attached to a one-shot run: park undecided files in unmatched.
    for entry in entries {
        match manual.skip(entry.id).await {
            Ok(skipped) => notifier.notify(StatusEvent::Skipped {
                entry: entry.id,
                filename: skipped.entry.download.filename,
                destination: skipped.destination,
            }),
            Err(e) => warn!(entry = %entry.id, error = %e, "could not park unresolved file"),
        }
    }

    stop.store(true, Ordering::SeqCst);
    if let Some(handle) = spinner_task {
        let _ = handle.await;
    }

    if !args.quiet {
        println!(
            "{}",
            render(&StatusEvent::Statistics {
                stats: queue.statistics().await,
                snapshot: queue.snapshot().await,
            })
        );
    }

    let stats = queue.statistics().await;
    if stats.failed > 0 {
        info!(failed = stats.failed, "Some downloads failed");
    }

    Ok(())
}

/// Loads the config file and applies command line overrides.
fn load_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::load_or_default(args.config.as_deref())
        .context("loading configuration")?;

    if let Some(base) = &args.library {
        let roots = LibraryRoots::under(base);
        config.paths.movies_dir = roots.movies;
        config.paths.tv_shows_dir = roots.tv;
        config.paths.unmatched_dir = roots.unmatched;
    }
    if let Some(temp_dir) = &args.temp_dir {
        config.paths.temp_dir.clone_from(temp_dir);
    }
    if let Some(concurrency) = args.concurrency {
        config.download.concurrency = usize::from(concurrency);
    }
    if let Some(max_retries) = args.max_retries {
        config.download.max_retries = u32::from(max_retries);
    }
    if let Some(max_speed) = args.max_speed {
        config.download.max_speed_mbps = max_speed;
    }
    if args.no_verify {
        config.download.verify_downloads = false;
    }

    config.validate().context("invalid configuration")?;
    Ok(config)
}

/// TMDB when a key is configured, otherwise every file goes to manual resolution.
fn build_lookup(config: &PipelineConfig) -> Result<Arc<dyn MetadataLookup>> {
    let Some(api_key) = config.tmdb_api_key() else {
        warn!("No TMDB API key configured; downloads will wait for manual resolution");
        return Ok(Arc::new(DisabledLookup));
    };
    let lookup = match &config.metadata.tmdb_base_url {
        Some(base_url) => TmdbLookup::with_base_url(api_key, base_url.clone()),
        None => TmdbLookup::new(api_key),
    }
    .context("building TMDB client")?;
    Ok(Arc::new(lookup))
}

/// One source per line; blank lines and `#` comments are ignored.
fn parse_sources(input: &str) -> Vec<(SourceRef, String)> {
    let mut sources = Vec::new();
    for line in input.lines().map(str::trim) {
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let source = SourceRef::parse(line);
        if matches!(source, SourceRef::Opaque(_)) {
            warn!(input = line, "Skipped unrecognized input");
            continue;
        }
        let filename = source
            .filename_hint()
            .unwrap_or_else(|| format!("download-{}", sources.len() + 1));
        sources.push((source, filename));
    }
    sources
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sources_skips_blank_comment_and_opaque_lines() {
        let input = "\n# queue for tonight\nhttps://example.com/files/Dune.2021.mkv\nnot-a-source\n/downloads/Show.S01E02.mkv\n";
        let sources = parse_sources(input);
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].1, "Dune.2021.mkv");
        assert_eq!(sources[1].1, "Show.S01E02.mkv");
    }

    #[test]
    fn test_load_config_applies_overrides() {
        let args = Args::try_parse_from([
            "media-intake",
            "--config",
            "/nonexistent/never.json",
        ])
        .unwrap();
        assert!(load_config(&args).is_err());

        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"download": {"concurrency": 2}}"#).unwrap();
        let args = Args::try_parse_from([
            "media-intake",
            "--config",
            config_path.to_str().unwrap(),
            "-c",
            "7",
            "-o",
            "/media",
            "--no-verify",
        ])
        .unwrap();
        let config = load_config(&args).unwrap();
        assert_eq!(config.download.concurrency, 7);
        assert!(!config.download.verify_downloads);
        assert_eq!(config.paths.movies_dir, std::path::Path::new("/media/movies"));
        assert_eq!(config.paths.unmatched_dir, std::path::Path::new("/media/unmatched"));
    }
}
