//! relaysync CLI - resumable, disk-bounded transfer pipeline.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use relaysync::checkpoint::{LoadOutcome, PipelineIdentity};
use relaysync::models::ConfigError;
use relaysync::{
    CheckpointSink, CheckpointStore, Config, DirectorySink, FileCheckpointSink, ManifestSource,
    Pipeline, ResumeMode, SinkClient, SourceClient,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "relaysync")]
#[command(version)]
#[command(about = "Resumable, disk-bounded download → upload → cleanup transfer pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, global = true, default_value = "relaysync.toml")]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the pipeline until the source is exhausted or Ctrl-C
    Run {
        /// Continue after the latest checkpoint
        #[arg(long, conflicts_with = "from_position")]
        resume: bool,

        /// Start strictly after this source position
        #[arg(long)]
        from_position: Option<u64>,

        /// Disable the progress bar
        #[arg(long)]
        no_progress: bool,
    },

    /// Show the latest checkpoint
    Status,

    /// Validate configuration file
    Validate,

    /// Show example configuration
    Example,
}

/// `RUST_LOG` wins over `--verbose` when set.
fn setup_logging(verbose: bool) {
    let default = if verbose { "relaysync=debug" } else { "relaysync=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("Failed to set subscriber");
}

fn print_example_config() {
    let example = r#"# relaysync configuration file

[source]
id = 1001
name = "camera-roll"
# JSONL manifest, one {"position", "file_name", "size", "locator"} per line
manifest = "manifest.jsonl"

[staging]
dir = "staging"
max_gb = 10.0
# max_bytes = 10737418240   # exact budget, overrides max_gb
poll_interval_ms = 5000
space_wait_secs = 30
# resume_ratio = 0.9        # resume downloads only below 90% of the budget

[workers]
upload = 3
queue_capacity = 16

[retry]
max_retries = 3
attempt_timeout_secs = 1800
backoff_base_ms = 1000
backoff_max_ms = 60000
rate_limit_cooldown_ms = 60000
quota_cooldown_secs = 86400

[checkpoint]
dir = "checkpoints"
interval_secs = 300
every_cleaned = 10
write_timeout_secs = 30
max_entries = 100

# Cleanup waits for every sink to confirm an item.
[[sinks]]
name = "archive"
root = "/mnt/archive"
"#;
    println!("{example}");
}

fn load_config(path: &PathBuf) -> Result<Config> {
    let config =
        Config::from_file(path).with_context(|| format!("Failed to load config from {path:?}"))?;
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

async fn checkpoint_sink(config: &Config) -> Result<Arc<FileCheckpointSink>> {
    let sink = FileCheckpointSink::new(&config.checkpoint.dir, config.checkpoint.max_entries)
        .await
        .context("Failed to open checkpoint directory")?;
    Ok(Arc::new(sink))
}

fn build_pipeline(config: Config, checkpoints: Arc<dyn CheckpointSink>) -> Result<Pipeline> {
    let manifest = config
        .source
        .manifest
        .clone()
        .ok_or(ConfigError::NoManifest)?;
    let source: Arc<dyn SourceClient> = Arc::new(
        ManifestSource::load(&manifest)
            .with_context(|| format!("Failed to load manifest {manifest:?}"))?,
    );

    let sinks: Vec<Arc<dyn SinkClient>> = config
        .sinks
        .iter()
        .map(|s| Arc::new(DirectorySink::new(&s.name, &s.root)) as Arc<dyn SinkClient>)
        .collect();

    Ok(Pipeline::new(config, source, sinks, checkpoints)?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose);

    match cli.command {
        Commands::Example => {
            print_example_config();
            return Ok(());
        }

        Commands::Validate => {
            let config = load_config(&cli.config)?;
            if config.sinks.is_empty() {
                return Err(ConfigError::NoSinks.into());
            }
            let manifest = config.source.manifest.clone().ok_or(ConfigError::NoManifest)?;
            let source = ManifestSource::load(&manifest)
                .with_context(|| format!("Failed to load manifest {manifest:?}"))?;

            info!("Configuration is valid");
            info!("  Source: {} (id {}), {} items", config.source.name, config.source.id, source.len());
            info!(
                "  Staging: {:?}, budget {:.2}GB",
                config.staging.dir,
                config.staging.max_bytes() as f64 / (1024.0 * 1024.0 * 1024.0)
            );
            info!("  Upload workers: {}", config.workers.upload);
            for sink in &config.sinks {
                info!("  Sink: {} -> {:?}", sink.name, sink.root);
            }
            return Ok(());
        }

        Commands::Status => {
            let config = load_config(&cli.config)?;
            let identity = PipelineIdentity::new(config.source.id, config.source.name.clone());
            let store = CheckpointStore::new(
                checkpoint_sink(&config).await?,
                identity,
                config.checkpoint.write_timeout(),
            );

            match store.load().await.context("Failed to read checkpoint")? {
                LoadOutcome::NotFound => println!("No checkpoint for source {}", config.source.id),
                LoadOutcome::Found(doc) => {
                    let snap = doc.to_snapshot();
                    println!("\n=== {} (source {}) ===", snap.identity.source_name, snap.identity.source_id);
                    println!("Status:      {:?}", snap.status);
                    println!("Position:    {:?}", snap.last_processed_position);
                    println!("Discovered:  {}", snap.counters.discovered);
                    println!("Downloaded:  {}", snap.counters.downloaded);
                    println!("Uploaded:    {}", snap.counters.uploaded);
                    println!("Cleaned:     {}", snap.counters.cleaned);
                    println!("Failed:      {}", snap.counters.failed);
                    println!("Transferred: {:.2}GB", snap.transferred_gb());
                    println!("Updated:     {}", snap.last_updated_at);
                    println!("Summary:     {}", snap.summary(snap.last_updated_at));
                }
            }
        }

        Commands::Run {
            resume,
            from_position,
            no_progress,
        } => {
            let config = load_config(&cli.config)?;
            let checkpoints = checkpoint_sink(&config).await?;
            let pipeline = build_pipeline(config, checkpoints)?;

            let mode = match (resume, from_position) {
                (_, Some(position)) => ResumeMode::FromPosition(position),
                (true, None) => ResumeMode::FromCheckpoint,
                (false, None) => ResumeMode::Fresh,
            };

            let handle = pipeline.start(mode).await.context("Failed to start pipeline")?;

            let pb = if no_progress {
                ProgressBar::hidden()
            } else {
                ProgressBar::new(0)
            };
            pb.set_style(
                ProgressStyle::default_bar()
                    .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} ({percent}%) {msg}")
                    .unwrap()
                    .progress_chars("##-"),
            );

            let mut ticker = tokio::time::interval(Duration::from_millis(500));
            let mut interrupted = false;
            while !handle.is_finished() {
                tokio::select! {
                    _ = ticker.tick() => {
                        let snap = handle.snapshot();
                        let disk = handle.disk_budget();
                        pb.set_length(snap.counters.discovered);
                        pb.set_position(snap.counters.cleaned + snap.counters.failed);
                        let hold = if handle.awaiting_reauth() { " [awaiting re-auth]" } else { "" };
                        pb.set_message(format!(
                            "up {} | failed {} | disk {:.2}/{:.2}GB{}",
                            snap.counters.uploaded,
                            snap.counters.failed,
                            disk.current_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
                            disk.max_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
                            hold,
                        ));
                    }
                    _ = tokio::signal::ctrl_c(), if !interrupted => {
                        warn!("Interrupted, finishing in-flight items and saving checkpoint");
                        interrupted = true;
                        handle.cancel();
                    }
                }
            }

            let summary = handle.wait().await?;
            pb.finish_and_clear();

            let snap = &summary.snapshot;
            println!("\n=== Transfer {} ===", if summary.cancelled { "Paused" } else { "Finished" });
            println!("Status:      {:?}", snap.status);
            println!("Position:    {:?}", snap.last_processed_position);
            println!("Discovered:  {}", snap.counters.discovered);
            println!("Uploaded:    {}", snap.counters.uploaded);
            println!("Cleaned:     {}", snap.counters.cleaned);
            println!("Failed:      {}", snap.counters.failed);
            println!("Transferred: {:.2}GB", snap.transferred_gb());
            println!("Runtime:     {:.1}s", summary.elapsed.as_secs_f64());
            if !summary.checkpoint_saved {
                println!("Checkpoint:  final save FAILED, resume may repeat recent items");
            }
            if let Some(reason) = &summary.stop_error {
                println!("Stopped:     {reason}");
            }
            for failed in &summary.failed {
                println!(
                    "  failed #{} {} ({} after {} retries): {}",
                    failed.position, failed.file_name, failed.stage, failed.retry_count, failed.error
                );
                if let Some(kept) = &failed.kept_at {
                    println!("    kept at {}", kept.display());
                }
            }
        }
    }

    Ok(())
}
