#![allow(dead_code)]

use async_trait::async_trait;
use carat::config::Config;
use carat::cue_sheet::CueSheet;
use carat::extraction::{ExtractionError, Extractor};
use carat::format_detector::InputVariant;
use carat::ledger::JobLedger;
use carat::metadata::{
    ArtSource, CatalogService, CoverArt, MetadataError, MetadataResolver,
};
use carat::models::{CatalogSource, ExtractedRelease, MetadataCandidate, OutputPaths, Track};
use carat::pipeline::{JobEvent, JobId, PipelineHandle, PipelineService};
use carat::process::{Invocation, SilentParser, ToolEvent, ToolRunner};
use carat::tools::ToolError;
use carat::transcode::{output_paths, TranscodeError, TranscodeInput, Transcoder};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

/// Initialize tracing for tests with proper test output handling
pub fn tracing_init() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Extractor that pretends to rip: waits, then leaves a master in the workspace
pub struct FakeExtractor {
    delay: Duration,
    /// Run a real `sleep` through the runner instead of waiting in-process
    real_tool: bool,
    durations: Vec<Duration>,
    calls: AtomicUsize,
    intervals: Mutex<Vec<(Instant, Instant)>>,
}

impl FakeExtractor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            real_tool: false,
            durations: vec![Duration::from_millis(245_000), Duration::from_millis(187_500)],
            calls: AtomicUsize::new(0),
            intervals: Mutex::new(Vec::new()),
        }
    }

    pub fn with_real_tool(mut self) -> Self {
        self.real_tool = true;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Start and end of every finished extraction
    pub fn intervals(&self) -> Vec<(Instant, Instant)> {
        self.intervals.lock().unwrap().clone()
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(
        &self,
        variant: &InputVariant,
        runner: &ToolRunner,
    ) -> Result<ExtractedRelease, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        runner.message(format!("Extracting {}", variant.name()));

        if self.real_tool {
            let seconds = self.delay.as_secs().max(1).to_string();
            runner
                .run(
                    Invocation::new("sleep", Path::new("sleep")).arg(seconds),
                    &mut SilentParser,
                )
                .await?;
        } else {
            tokio::select! {
                _ = runner.cancel_token().cancelled() => {
                    return Err(ExtractionError::Tool(ToolError::Cancelled {
                        tool: "fake-ripper".to_string(),
                    }));
                }
                _ = tokio::time::sleep(self.delay) => {}
            }
        }

        runner.report(ToolEvent::Progress {
            percent: 100.0,
            detail: None,
        });
        let master = runner.workspace().join("raw").join("title_t00.mkv");
        tokio::fs::write(&master, b"not really matroska").await?;
        self.intervals.lock().unwrap().push((started, Instant::now()));

        Ok(ExtractedRelease {
            sources: vec![master],
            tracks: Track::sequence(&self.durations),
        })
    }
}

/// Transcoder that writes placeholder library files, failing a set number of times first
pub struct FakeTranscoder {
    failures_left: AtomicUsize,
    delay: Duration,
    calls: AtomicUsize,
}

impl FakeTranscoder {
    pub fn new() -> Self {
        Self::failing(0)
    }

    pub fn failing(times: usize) -> Self {
        Self {
            failures_left: AtomicUsize::new(times),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        }
    }

    /// Take `delay` over every successful transcode
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transcoder for FakeTranscoder {
    async fn transcode(
        &self,
        input: &TranscodeInput<'_>,
        runner: &ToolRunner,
    ) -> Result<OutputPaths, TranscodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TranscodeError::NoAtmosStream(
                input.release.sources[0].display().to_string(),
            ));
        }
        runner.report(ToolEvent::Progress {
            percent: 50.0,
            detail: Some("time=00:03:36".to_string()),
        });
        tokio::select! {
            _ = runner.cancel_token().cancelled() => {
                return Err(TranscodeError::Tool(ToolError::Cancelled {
                    tool: "fake-encoder".to_string(),
                }));
            }
            _ = tokio::time::sleep(self.delay) => {}
        }

        let paths = output_paths(input.library_root, input.metadata, input.cover.is_some());
        let dir = paths.audio.parent().unwrap();
        tokio::fs::create_dir_all(dir).await?;
        let tags = format!(
            "artist={}\nalbum={}\n",
            input.metadata.artist, input.metadata.album
        );
        tokio::fs::write(&paths.audio, tags).await?;

        let file_name = paths.audio.file_name().unwrap().to_string_lossy().into_owned();
        CueSheet::build(input.metadata, &input.release.tracks, &file_name)
            .write_to(&paths.cue)
            .await?;
        if let (Some(from), Some(to)) = (input.cover, &paths.cover) {
            tokio::fs::copy(from, to).await?;
        }
        Ok(paths)
    }
}

/// Catalog answering every search with the same candidates
pub struct FixedCatalog {
    source: CatalogSource,
    results: Vec<MetadataCandidate>,
}

#[async_trait]
impl CatalogService for FixedCatalog {
    fn source(&self) -> CatalogSource {
        self.source
    }

    async fn search(
        &self,
        _artist: &str,
        _album: &str,
    ) -> Result<Vec<MetadataCandidate>, MetadataError> {
        Ok(self.results.clone())
    }
}

/// Art source keyed by catalog id
#[derive(Default)]
pub struct FixedArt {
    by_id: HashMap<String, CoverArt>,
}

#[async_trait]
impl ArtSource for FixedArt {
    fn name(&self) -> &'static str {
        "fixed art"
    }

    async fn fetch_art(
        &self,
        candidate: &MetadataCandidate,
    ) -> Result<Option<CoverArt>, MetadataError> {
        Ok(self.by_id.get(&candidate.catalog_id).cloned())
    }
}

pub fn candidate(id: &str, artist: &str, album: &str) -> MetadataCandidate {
    MetadataCandidate {
        source: CatalogSource::MusicBrainz,
        catalog_id: id.to_string(),
        artist: artist.to_string(),
        album: album.to_string(),
        year: Some("1979".to_string()),
        confidence: 0.0,
        art_urls: Vec::new(),
    }
}

pub fn art() -> CoverArt {
    CoverArt {
        url: "https://example.invalid/front-1200.jpg".to_string(),
        jpeg: vec![0xFF, 0xD8, 0xFF, 0xD9],
        width: 1200,
        height: 1200,
    }
}

/// Resolver whose primary catalog returns `results`; art only for `art_for` ids
pub fn resolver(results: Vec<MetadataCandidate>, art_for: &[&str]) -> Arc<MetadataResolver> {
    let archive = FixedArt {
        by_id: art_for.iter().map(|id| (id.to_string(), art())).collect(),
    };
    Arc::new(MetadataResolver::new(
        Arc::new(FixedCatalog {
            source: CatalogSource::MusicBrainz,
            results,
        }),
        Arc::new(FixedCatalog {
            source: CatalogSource::ITunes,
            results: Vec::new(),
        }),
        Arc::new(archive),
        Arc::new(FixedArt::default()),
        0.75,
        Duration::from_secs(2),
    ))
}

pub struct TestEnv {
    pub dir: TempDir,
    pub config: Config,
    pub ledger: JobLedger,
    pub library: PathBuf,
}

impl TestEnv {
    pub async fn new() -> Self {
        tracing_init();
        let dir = TempDir::new().unwrap();
        let workspace_root = dir.path().join("work");
        std::fs::create_dir_all(&workspace_root).unwrap();
        let config = Config {
            data_dir: dir.path().join("data"),
            workspace_root,
            transcode_slots: 1,
            ..Config::default()
        };
        let ledger = JobLedger::open(&config.ledger_path()).await.unwrap();
        let library = dir.path().join("library");

        Self {
            dir,
            config,
            ledger,
            library,
        }
    }

    pub fn start(
        &self,
        extractor: Arc<FakeExtractor>,
        transcoder: Arc<FakeTranscoder>,
        resolver: Arc<MetadataResolver>,
    ) -> PipelineHandle {
        PipelineService::start(&self.config, self.ledger.clone(), extractor, transcoder, resolver)
    }

    /// A one-file Atmos release to feed the pipeline
    pub fn container_file(&self, name: &str) -> String {
        let path = self.dir.path().join("input").join(name);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"matroska").unwrap();
        path.to_string_lossy().into_owned()
    }

    pub fn bdmv_folder(&self, name: &str) -> String {
        let root = self.dir.path().join("input").join(name);
        std::fs::create_dir_all(root.join("BDMV").join("STREAM")).unwrap();
        root.to_string_lossy().into_owned()
    }

    pub fn workspace_dirs(&self) -> Vec<PathBuf> {
        std::fs::read_dir(&self.config.workspace_root)
            .unwrap()
            .flatten()
            .map(|e| e.path())
            .collect()
    }
}

/// Collect events until `count` jobs have ended, grouped by job
pub async fn until_terminal(
    events: &mut UnboundedReceiver<JobEvent>,
    count: usize,
) -> HashMap<JobId, Vec<JobEvent>> {
    let mut by_job: HashMap<JobId, Vec<JobEvent>> = HashMap::new();
    let mut finished = 0;
    while finished < count {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("timed out waiting for job events")
            .expect("event stream closed");
        if event.is_terminal() {
            finished += 1;
        }
        by_job
            .entry(event.job_id().to_string())
            .or_default()
            .push(event);
    }
    by_job
}

/// Wait for the first event of a job matching `pred`
pub async fn wait_for(
    events: &mut UnboundedReceiver<JobEvent>,
    pred: impl Fn(&JobEvent) -> bool,
) -> JobEvent {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(30), events.recv())
            .await
            .expect("timed out waiting for job event")
            .expect("event stream closed");
        if pred(&event) {
            return event;
        }
    }
}
