use anyhow::{bail, Context, Result};
use carat::config::Config;
use carat::extraction::ToolExtractor;
use carat::ledger::{process_probe, JobLedger, ReconcilePolicy, ReconcileReport};
use carat::metadata::MetadataResolver;
use carat::network::build_http_client;
use carat::pipeline::{ErrorClass, JobEvent, JobRequest, PipelineHandle, PipelineService};
use carat::tools::Toolset;
use carat::transcode::{sanitize_component, ToolTranscoder};
use clap::{Parser, Subcommand};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::EnvFilter;

/// Shell escaping on Windows can leave literal quotes around paths
fn unquoted(s: &str) -> String {
    s.trim().trim_matches('"').trim().to_string()
}

fn parse_source(s: &str) -> Result<String> {
    let cleaned = unquoted(s);
    if cleaned.is_empty() {
        bail!("empty source");
    }
    Ok(cleaned)
}

fn parse_path(s: &str) -> Result<PathBuf> {
    let cleaned = unquoted(s);
    if cleaned.is_empty() {
        bail!("empty path");
    }
    Ok(PathBuf::from(cleaned))
}

#[derive(Parser, Debug)]
#[command(name = "carat", version, about = "Concise Atmos Ripping Automation Tool")]
struct CliArgs {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one Atmos release into the library
    Rip {
        /// Drive (0, -1 for auto, disc:N, /dev/sr0, D:), ISO, BDMV folder,
        /// track folder or container file
        #[clap(value_parser = parse_source)]
        source: String,
        artist: String,
        album: String,
        #[clap(value_parser = parse_path)]
        library_root: PathBuf,
    },
    /// Clean up jobs left behind by an earlier run
    Reconcile,
    /// List ledger entries
    Jobs,
    /// Transcode a parked job again without re-extracting
    Retry { job_id: String },
    /// Delete a parked job's workspace and ledger entry
    Discard { job_id: String },
    /// Fetch cover art only, into <LIBRARY_ROOT>/<ARTIST>/<ALBUM>/cover.jpg
    CoverArt {
        artist: String,
        album: String,
        #[clap(value_parser = parse_path)]
        library_root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::load();

    match cli_args.command {
        Command::Rip {
            source,
            artist,
            album,
            library_root,
        } => {
            let ledger = open_and_reconcile(&config).await?;
            let pipeline = start_pipeline(&config, ledger)?;
            let mut events = pipeline.subscribe_all();
            let request = JobRequest {
                input: source,
                artist,
                album,
                library_root,
            };
            let job_id = match pipeline.submit(request).await {
                Ok(job_id) => job_id,
                Err(e) => {
                    eprintln!("{} ({})", e, e.class().hint());
                    std::process::exit(2);
                }
            };
            let succeeded = follow(&pipeline, &job_id, &mut events).await;
            pipeline.shutdown().await;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Command::Reconcile => {
            let ledger = JobLedger::open(&config.ledger_path()).await?;
            let report = ledger
                .reconcile_on_startup(&ReconcilePolicy::from_config(&config))
                .await?;
            print_report(&report);
        }
        Command::Jobs => {
            let ledger = JobLedger::open(&config.ledger_path()).await?;
            let entries = ledger.entries().await?;
            if entries.is_empty() {
                println!("No jobs in the ledger");
            }
            for entry in entries {
                println!(
                    "{}  {:<16} {:<20} {}  (heartbeat {})",
                    entry.job_id,
                    entry.stage,
                    entry.variant.name(),
                    entry.input,
                    entry.heartbeat_at.format("%Y-%m-%d %H:%M:%S")
                );
                if let Some(error) = &entry.last_error {
                    println!("    last error: {}", error);
                }
            }
        }
        Command::Retry { job_id } => {
            let ledger = open_and_reconcile(&config).await?;
            let pipeline = start_pipeline(&config, ledger)?;
            let mut events = pipeline.subscribe(&job_id);
            if let Err(e) = pipeline.retry_transcode(&job_id).await {
                eprintln!("{}", e);
                std::process::exit(2);
            }
            let succeeded = follow(&pipeline, &job_id, &mut events).await;
            pipeline.shutdown().await;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Command::Discard { job_id } => {
            let ledger = JobLedger::open(&config.ledger_path()).await?;
            let Some(entry) = ledger.entry(&job_id).await? else {
                bail!("No job {}", job_id);
            };
            if process_probe::is_live_instance(entry.owner_pid) {
                bail!("Job {} is still running in carat pid {}", job_id, entry.owner_pid);
            }
            ledger.complete(&job_id).await?;
            println!("Discarded job {}", job_id);
        }
        Command::CoverArt {
            artist,
            album,
            library_root,
        } => {
            let client = build_http_client(&config.user_agent, config.network_timeout)
                .context("Failed to build HTTP client")?;
            let resolver = MetadataResolver::from_config(&config, client);
            let Some(art) = resolver.cover_art_only(&artist, &album).await else {
                bail!("No acceptable cover art found for {} - {}", artist, album);
            };
            let dir = library_root
                .join(sanitize_component(&artist, "Unknown Artist"))
                .join(sanitize_component(&album, "Unknown Album"));
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("Error creating {:?}", dir))?;
            let path = dir.join("cover.jpg");
            art.write_to(&path).await?;
            println!("Saved {}", path.display());
        }
    }

    Ok(())
}

async fn open_and_reconcile(config: &Config) -> Result<JobLedger> {
    let ledger = JobLedger::open(&config.ledger_path())
        .await
        .with_context(|| format!("Error opening ledger {:?}", config.ledger_path()))?;
    let report = ledger
        .reconcile_on_startup(&ReconcilePolicy::from_config(config))
        .await?;
    if !report.reclaimed.is_empty() || !report.swept.is_empty() {
        print_report(&report);
    }
    Ok(ledger)
}

fn start_pipeline(config: &Config, ledger: JobLedger) -> Result<PipelineHandle> {
    let tools = Toolset::discover(&config.tool_overrides)?;
    info!("Using tools: {:?}", tools);
    let client = build_http_client(&config.user_agent, config.network_timeout)
        .context("Failed to build HTTP client")?;

    Ok(PipelineService::start(
        config,
        ledger,
        Arc::new(ToolExtractor::new(tools.clone(), config.min_title_seconds)),
        Arc::new(ToolTranscoder::new(tools)),
        Arc::new(MetadataResolver::from_config(config, client)),
    ))
}

fn print_report(report: &ReconcileReport) {
    for job_id in &report.reclaimed {
        println!("Reclaimed orphaned job {}", job_id);
    }
    for path in &report.swept {
        println!("Removed stray workspace {}", path.display());
    }
    for job_id in &report.parked {
        println!("Parked job {} can be retried (carat retry {})", job_id, job_id);
    }
    if report.corrupt > 0 {
        println!(
            "Skipped {} unreadable ledger entr{} ({})",
            report.corrupt,
            if report.corrupt == 1 { "y" } else { "ies" },
            ErrorClass::LedgerCorruption.hint()
        );
    }
}

/// Render one job's events until it ends. Returns whether it completed.
async fn follow(
    pipeline: &PipelineHandle,
    job_id: &str,
    events: &mut UnboundedReceiver<JobEvent>,
) -> bool {
    let mut line = ProgressLine::default();
    let mut cancel_requested = false;
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    line.say("Status stream closed");
                    return false;
                };
                if event.job_id() != job_id {
                    continue;
                }
                if let Some(succeeded) = line.render(&event) {
                    return succeeded;
                }
            }
            _ = &mut shutdown, if !cancel_requested => {
                cancel_requested = true;
                line.say("Interrupted, cancelling job");
                if let Err(e) = pipeline.cancel(job_id).await {
                    warn!("Cancel failed: {}", e);
                }
            }
        }
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// Console rendering: progress rewrites one line, anything else clears it first
#[derive(Default)]
struct ProgressLine {
    active: bool,
}

impl ProgressLine {
    fn clear(&mut self) {
        if self.active {
            print!("\r{:79}\r", "");
            self.active = false;
        }
    }

    fn say(&mut self, text: &str) {
        self.clear();
        println!("{}", text);
    }

    fn progress(&mut self, percent: f32, detail: Option<&str>) {
        let text = match detail {
            Some(detail) => format!("{:5.1}%  {}", percent, detail),
            None => format!("{:5.1}%", percent),
        };
        print!("\r{:79}", text);
        let _ = std::io::stdout().flush();
        self.active = true;
    }

    /// `Some(success)` once the job has ended
    fn render(&mut self, event: &JobEvent) -> Option<bool> {
        match event {
            JobEvent::Queued { variant, .. } => {
                self.say(&format!("Detected {}", variant.name()));
            }
            JobEvent::StageChanged { stage, .. } => {
                self.say(&format!("== {} ==", stage));
            }
            JobEvent::Progress {
                percent, detail, ..
            } => self.progress(*percent, detail.as_deref()),
            JobEvent::Message { text, .. } => self.say(text),
            JobEvent::MetadataDegraded { reason, .. } => {
                self.say(&format!(
                    "Metadata lookup failed ({}): {}; using your artist/album as typed",
                    ErrorClass::MetadataResolutionFailed.hint(),
                    reason
                ));
            }
            JobEvent::Completed { outputs, .. } => {
                self.say("Done:");
                println!("  {}", outputs.audio.display());
                println!("  {}", outputs.cue.display());
                match &outputs.cover {
                    Some(cover) => println!("  {}", cover.display()),
                    None => println!("  (no cover art found)"),
                }
                return Some(true);
            }
            JobEvent::Failed {
                job_id,
                class,
                message,
            } => {
                self.clear();
                eprintln!("{} ({}): {}", class, class.hint(), message);
                if *class == ErrorClass::TranscodeFailed {
                    eprintln!("Workspace kept. Run `carat retry {}` to try again.", job_id);
                }
                return Some(false);
            }
            JobEvent::Cancelled { .. } => {
                self.say("Cancelled");
                return Some(false);
            }
        }
        None
    }
}
