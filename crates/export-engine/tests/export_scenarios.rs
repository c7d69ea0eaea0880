use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use splice_common::error::{ErrorKind, SpliceError, SpliceResult};
use splice_export::filter::escape_filter_text;
use splice_export::session::ExportState;
use splice_export::{
    compile, BackendProvider, CancelFlag, Canvas, Engine, EnvironmentCapabilities,
    ExportEnvironment, ExportManager, ExportRequest, FilterStage, FontCatalog, OutputDescriptor,
    ProgressCallback, ProgressEvent, RenderBackend, RenderJob, RenderProgress, ResolvedSource,
    SourceResolver,
};
use splice_timeline::{
    ComponentPayload, Element, ElementPayload, ExportSettings, MediaPayload, RenderMode,
    SharedTimeline, SourceRef, TextAlign, TextPayload, Timeline, TimelineSnapshot, Track,
    TrackKind, VisibleWindow,
};

/// Every reference is an h264 1080p clip under /fixtures.
struct FixtureResolver;

impl SourceResolver for FixtureResolver {
    fn resolve(&self, reference: &SourceRef) -> SpliceResult<ResolvedSource> {
        Ok(ResolvedSource::video(
            reference.as_str(),
            PathBuf::from("/fixtures").join(reference.as_str()),
            "h264",
            1920,
            1080,
            10.0,
        ))
    }
}

/// Holds every lookup until the gate opens.
struct GatedResolver {
    open: Arc<AtomicBool>,
}

impl SourceResolver for GatedResolver {
    fn resolve(&self, reference: &SourceRef) -> SpliceResult<ResolvedSource> {
        let started = Instant::now();
        while !self.open.load(Ordering::SeqCst) {
            if started.elapsed() > Duration::from_secs(10) {
                return Err(SpliceError::resource("resolver gate never opened"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        FixtureResolver.resolve(reference)
    }
}

#[derive(Debug, Clone, Copy)]
enum Behavior {
    Succeed,
    BlockUntilCancelled,
    Fail,
}

struct FakeBackends {
    behavior: Behavior,
    engines: Arc<Mutex<Vec<Engine>>>,
}

impl BackendProvider for FakeBackends {
    fn backend_for(&self, engine: Engine) -> Box<dyn RenderBackend> {
        self.engines.lock().unwrap().push(engine);
        Box::new(FakeBackend {
            behavior: self.behavior,
        })
    }
}

struct FakeBackend {
    behavior: Behavior,
}

impl RenderBackend for FakeBackend {
    fn render(
        &mut self,
        job: &RenderJob,
        progress: Option<ProgressCallback>,
        cancel: &CancelFlag,
    ) -> SpliceResult<OutputDescriptor> {
        let report = |value: f64| {
            if let Some(cb) = &progress {
                cb(RenderProgress {
                    progress: value,
                    frames_rendered: 0,
                    total_frames: 0,
                    eta_secs: 0.0,
                });
            }
        };
        std::fs::write(&job.output_path, b"fake video")?;

        match self.behavior {
            Behavior::Succeed => {
                for value in [0.25, 0.5, 0.4, 1.0] {
                    std::thread::sleep(Duration::from_millis(10));
                    report(value);
                }
            }
            Behavior::BlockUntilCancelled => {
                let started = Instant::now();
                let mut value = 0.0f64;
                loop {
                    cancel.check()?;
                    if started.elapsed() > Duration::from_secs(10) {
                        return Err(SpliceError::resource("fake backend was never cancelled"));
                    }
                    value = (value + 0.01).min(0.99);
                    report(value);
                    std::thread::sleep(Duration::from_millis(10));
                }
            }
            Behavior::Fail => {
                report(0.3);
                return Err(SpliceError::encode(
                    "ffmpeg exited with status 1",
                    "Error while opening encoder for output stream #0:0",
                ));
            }
        }

        Ok(OutputDescriptor {
            path: job.output_path.clone(),
            engine: job.decision.engine,
            duration_secs: job.duration_secs,
            frames: (job.duration_secs * f64::from(job.settings.fps)).round() as u64,
            size_bytes: 10,
        })
    }

    fn is_available(&self) -> bool {
        true
    }

    fn name(&self) -> &str {
        "fake"
    }
}

struct Harness {
    manager: ExportManager,
    engines: Arc<Mutex<Vec<Engine>>>,
    root: PathBuf,
}

impl Harness {
    fn new(name: &str, behavior: Behavior) -> Self {
        Self::with_resolver(name, behavior, Arc::new(FixtureResolver))
    }

    fn with_resolver(name: &str, behavior: Behavior, resolver: Arc<dyn SourceResolver>) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter("splice_export=debug")
            .with_test_writer()
            .try_init();

        let root = std::env::temp_dir().join(format!("splice_scenarios_{name}"));
        let _ = std::fs::remove_dir_all(&root);
        std::fs::create_dir_all(&root).unwrap();

        let engines = Arc::new(Mutex::new(vec![]));
        let env = ExportEnvironment::new(
            root.join("tmp"),
            EnvironmentCapabilities::with_encoder("/usr/bin/ffmpeg"),
            resolver,
            Arc::new(FakeBackends {
                behavior,
                engines: Arc::clone(&engines),
            }),
            FontCatalog::default(),
        );
        Self {
            manager: ExportManager::new(env),
            engines,
            root,
        }
    }

    fn destination(&self) -> PathBuf {
        self.root.join("out").join("export.mp4")
    }

    fn workspace(&self, session_id: &str) -> PathBuf {
        self.root
            .join("tmp")
            .join(format!("splice-export-{session_id}"))
    }

    async fn wait_for_state(&self, session_id: &str, state: ExportState) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while self.manager.status(session_id).unwrap().state != state {
            assert!(Instant::now() < deadline, "session never reached {state}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        std::fs::remove_dir_all(&self.root).ok();
    }
}

fn clip(id: &str, start: f64, duration: f64) -> Element {
    Element::new(
        id,
        start,
        duration,
        ElementPayload::Media(MediaPayload {
            source: SourceRef::new(format!("{id}.mp4")),
            effects: None,
            volume: 1.0,
            muted: false,
        }),
    )
}

fn text(id: &str, content: &str, start: f64, duration: f64) -> Element {
    Element::new(
        id,
        start,
        duration,
        ElementPayload::Text(TextPayload {
            content: content.to_string(),
            font_family: "Sans".to_string(),
            font_size_px: 48.0,
            color: "#ffffff".to_string(),
            background_color: None,
            x: 0.0,
            y: 0.0,
            rotation_degrees: 0.0,
            text_align: TextAlign::Center,
            font_weight: None,
            font_style: None,
        }),
    )
}

fn single_clip_timeline() -> Timeline {
    let mut timeline = Timeline::new();
    timeline
        .add_track(Track::new("v1", TrackKind::Media, "Video"))
        .unwrap();
    timeline.add_element("v1", clip("clip", 0.0, 4.0)).unwrap();
    timeline
}

fn request(timeline: Timeline, destination: PathBuf) -> ExportRequest {
    ExportRequest::new(
        TimelineSnapshot::from_timeline(timeline),
        ExportSettings::default(),
        destination,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn plain_clip_exports_with_direct_copy() {
    let harness = Harness::new("direct_copy", Behavior::Succeed);
    let destination = harness.destination();

    let id = harness
        .manager
        .start_export(request(single_clip_timeline(), destination.clone()))
        .unwrap();
    let mut events = harness.manager.subscribe_progress(&id).unwrap();
    let status = harness.manager.wait(&id).await.unwrap();

    assert_eq!(status.state, ExportState::Completed);
    assert_eq!(status.engine, Some(Engine::NativeDirectCopy));
    assert_eq!(status.progress, 1.0);
    let output = status.output.unwrap();
    assert_eq!(output.path, destination);
    assert!((output.duration_secs - 4.0).abs() < 1e-9);
    assert_eq!(std::fs::read(&destination).unwrap(), b"fake video");
    assert!(!harness.workspace(&id).exists());
    assert_eq!(
        *harness.engines.lock().unwrap(),
        vec![Engine::NativeDirectCopy]
    );

    let mut last = 0.0;
    while let Ok(event) = events.try_recv() {
        if let ProgressEvent::Progress { progress, .. } = event {
            assert!(progress >= last, "progress went backwards: {progress} < {last}");
            last = progress;
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn visible_text_moves_export_off_direct_copy() {
    let harness = Harness::new("filtered", Behavior::Succeed);
    let mut timeline = single_clip_timeline();
    timeline
        .add_track(Track::new("t1", TrackKind::Text, "Titles"))
        .unwrap();
    timeline
        .add_element("t1", text("title", "Hello World", 0.0, 3.0))
        .unwrap();

    let id = harness
        .manager
        .start_export(request(timeline, harness.destination()))
        .unwrap();
    let status = harness.manager.wait(&id).await.unwrap();
    assert_eq!(status.state, ExportState::Completed);
    assert_eq!(status.engine, Some(Engine::NativeFiltered));
}

#[test]
fn text_element_compiles_to_one_overlay_stage() {
    let mut timeline = single_clip_timeline();
    timeline
        .add_track(Track::new("t1", TrackKind::Text, "Titles"))
        .unwrap();
    timeline
        .add_element("t1", text("title", "Hello World", 0.0, 3.0))
        .unwrap();

    let chain = compile(
        &timeline,
        Canvas::from(&ExportSettings::default()),
        &FontCatalog::default(),
    );
    let stages: Vec<_> = chain.text_stages().collect();
    assert_eq!(stages.len(), 1);
    assert_eq!(
        stages[0].window,
        VisibleWindow {
            start: 0.0,
            end: 3.0
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_rendering_leaves_nothing_behind() {
    let harness = Harness::new("cancel", Behavior::BlockUntilCancelled);
    let destination = harness.destination();

    let id = harness
        .manager
        .start_export(request(single_clip_timeline(), destination.clone()))
        .unwrap();
    harness.wait_for_state(&id, ExportState::Rendering).await;
    assert!(harness.workspace(&id).exists());

    harness.manager.cancel_export(&id).unwrap();
    let status = harness.manager.wait(&id).await.unwrap();

    assert_eq!(status.state, ExportState::Cancelled);
    assert!(status.output.is_none());
    assert!(!destination.exists());
    assert!(!harness.workspace(&id).exists());

    // Cancelling a finished session is a no-op.
    harness.manager.cancel_export(&id).unwrap();
    assert_eq!(
        harness.manager.status(&id).unwrap().state,
        ExportState::Cancelled
    );
}

#[test]
fn earlier_track_text_compiles_first() {
    let mut timeline = single_clip_timeline();
    timeline
        .add_track(Track::new("a", TrackKind::Text, "A"))
        .unwrap();
    timeline
        .add_track(Track::new("b", TrackKind::Caption, "B"))
        .unwrap();
    let mut caption = text("from-b", "second", 0.0, 2.0);
    if let ElementPayload::Text(payload) = caption.payload.clone() {
        caption.payload = ElementPayload::Caption(payload);
    }
    timeline.add_element("b", caption).unwrap();
    timeline
        .add_element("a", text("from-a", "first", 0.0, 2.0))
        .unwrap();

    let chain = compile(
        &timeline,
        Canvas::from(&ExportSettings::default()),
        &FontCatalog::default(),
    );
    let order: Vec<&str> = chain.stages().iter().map(FilterStage::element_id).collect();
    assert_eq!(order, vec!["from-a", "from-b"]);

    let filter = chain.to_filter_string();
    let a = filter.find("text=first").unwrap();
    let b = filter.find("text=second").unwrap();
    assert!(a < b);
}

#[test]
fn colons_and_quotes_are_escaped() {
    assert_eq!(escape_filter_text("It's 10:30"), "It\\'s 10\\:30");

    let mut timeline = single_clip_timeline();
    timeline
        .add_track(Track::new("t1", TrackKind::Text, "Titles"))
        .unwrap();
    timeline
        .add_element("t1", text("title", "It's 10:30", 0.0, 3.0))
        .unwrap();
    let chain = compile(
        &timeline,
        Canvas::from(&ExportSettings::default()),
        &FontCatalog::default(),
    );
    let stage = chain.text_stages().next().unwrap();
    assert_eq!(stage.text, "It\\'s 10\\:30");
    // One more level for the filtergraph that carries the drawtext options.
    assert!(chain
        .to_filter_string()
        .contains("text=It\\\\\\'s 10\\\\:30:expansion=none:"));

    let chars: Vec<char> = stage.text.chars().collect();
    for (i, c) in chars.iter().enumerate() {
        if *c == ':' || *c == '\'' {
            assert_eq!(chars[i - 1], '\\', "unescaped {c} at {i}");
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn native_override_with_live_component_is_rejected_before_preparing() {
    let harness = Harness::new("conflict", Behavior::Succeed);
    let mut timeline = single_clip_timeline();
    timeline
        .add_track(Track::new(
            "c1",
            TrackKind::ProgrammaticComponent,
            "Components",
        ))
        .unwrap();
    timeline
        .add_element(
            "c1",
            Element::new(
                "intro",
                0.0,
                2.0,
                ElementPayload::Component(ComponentPayload {
                    component_id: "intro".to_string(),
                    props: Default::default(),
                    render_mode: RenderMode::Live,
                    prerendered_source: None,
                }),
            ),
        )
        .unwrap();

    let err = harness
        .manager
        .start_export(
            request(timeline.clone(), harness.destination())
                .with_session_id("forced")
                .with_override(Engine::NativeFiltered),
        )
        .unwrap_err();
    assert!(matches!(err, SpliceError::ConfigurationConflict { .. }));
    assert_eq!(err.kind(), ErrorKind::Validation);
    assert!(harness.manager.sessions().is_empty());
    assert!(harness.engines.lock().unwrap().is_empty());
    assert!(!harness.root.join("tmp").exists());
    assert!(!harness.destination().exists());

    let id = harness
        .manager
        .start_export(request(timeline, harness.destination()))
        .unwrap();
    let status = harness.manager.wait(&id).await.unwrap();
    assert_eq!(status.engine, Some(Engine::Compositing));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_active_session_is_rejected() {
    let harness = Harness::new("duplicate", Behavior::BlockUntilCancelled);
    let first = request(single_clip_timeline(), harness.destination()).with_session_id("dup");
    let id = harness.manager.start_export(first.clone()).unwrap();
    assert_eq!(id, "dup");

    let err = harness.manager.start_export(first.clone()).unwrap_err();
    assert!(matches!(err, SpliceError::SessionAlreadyActive { .. }));

    harness.manager.cancel_export("dup").unwrap();
    harness.manager.wait("dup").await.unwrap();
    let err = harness.manager.status("missing").unwrap_err();
    assert!(matches!(err, SpliceError::SessionNotFound { .. }));
}

#[tokio::test]
async fn empty_timeline_is_rejected_up_front() {
    let harness = Harness::new("empty", Behavior::Succeed);
    let err = harness
        .manager
        .start_export(request(Timeline::new(), harness.destination()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_during_preparing_never_creates_a_workspace() {
    let open = Arc::new(AtomicBool::new(false));
    let harness = Harness::with_resolver(
        "cancel_preparing",
        Behavior::Succeed,
        Arc::new(GatedResolver {
            open: Arc::clone(&open),
        }),
    );

    let id = harness
        .manager
        .start_export(request(single_clip_timeline(), harness.destination()))
        .unwrap();
    harness.wait_for_state(&id, ExportState::Preparing).await;
    harness.manager.cancel_export(&id).unwrap();
    open.store(true, Ordering::SeqCst);

    let status = harness.manager.wait(&id).await.unwrap();
    assert_eq!(status.state, ExportState::Cancelled);
    assert!(status.engine.is_none());
    assert!(harness.engines.lock().unwrap().is_empty());
    assert!(!harness.root.join("tmp").exists());
    assert!(!harness.destination().exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_sessions_use_separate_workspaces() {
    let harness = Harness::new("concurrent", Behavior::BlockUntilCancelled);
    let out = harness.root.join("out");

    let first = harness
        .manager
        .start_export(
            request(single_clip_timeline(), out.join("first.mp4")).with_session_id("first"),
        )
        .unwrap();
    let second = harness
        .manager
        .start_export(
            request(single_clip_timeline(), out.join("second.mp4")).with_session_id("second"),
        )
        .unwrap();
    harness.wait_for_state(&first, ExportState::Rendering).await;
    harness.wait_for_state(&second, ExportState::Rendering).await;
    assert_ne!(harness.workspace(&first), harness.workspace(&second));
    assert!(harness.workspace(&first).is_dir());
    assert!(harness.workspace(&second).is_dir());

    harness.manager.cancel_export(&first).unwrap();
    let status = harness.manager.wait(&first).await.unwrap();
    assert_eq!(status.state, ExportState::Cancelled);
    assert!(!harness.workspace(&first).exists());

    assert_eq!(
        harness.manager.status(&second).unwrap().state,
        ExportState::Rendering
    );
    assert!(harness.workspace(&second).exists());
    assert_eq!(harness.manager.sessions().len(), 2);

    harness.manager.cancel_export(&second).unwrap();
    harness.manager.wait(&second).await.unwrap();
    assert!(!harness.workspace(&second).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failing_encoder_ends_in_failed_and_cleans_up() {
    let harness = Harness::new("encode_failure", Behavior::Fail);
    let destination = harness.destination();

    let id = harness
        .manager
        .start_export(request(single_clip_timeline(), destination.clone()))
        .unwrap();
    let status = harness.manager.wait(&id).await.unwrap();

    assert_eq!(status.state, ExportState::Failed);
    let failure = status.failure.unwrap();
    assert_eq!(failure.kind, ErrorKind::Encode);
    assert!(failure.reason.contains("status 1"));
    assert!(status.output.is_none());
    assert!(!destination.exists());
    assert!(!harness.workspace(&id).exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn edits_after_snapshot_do_not_reach_the_export() {
    let harness = Harness::new("snapshot_isolation", Behavior::Succeed);
    let shared = SharedTimeline::new(single_clip_timeline());
    let snapshot = shared.snapshot().unwrap();

    shared
        .edit(|t| {
            t.add_track(Track::new("t1", TrackKind::Text, "Titles"))?;
            t.add_element("t1", text("late", "Added later", 0.0, 2.0))?;
            t.add_element("v1", clip("tail", 4.0, 3.0))
        })
        .unwrap();
    assert_eq!(shared.revision().unwrap(), 1);

    let id = harness
        .manager
        .start_export(ExportRequest::new(
            snapshot,
            ExportSettings::default(),
            harness.destination(),
        ))
        .unwrap();
    let status = harness.manager.wait(&id).await.unwrap();

    assert_eq!(status.state, ExportState::Completed);
    assert_eq!(status.engine, Some(Engine::NativeDirectCopy));
    assert!((status.output.unwrap().duration_secs - 4.0).abs() < 1e-9);
}

#[tokio::test]
async fn session_id_outside_the_allowed_charset_is_rejected() {
    let harness = Harness::new("bad_session_id", Behavior::Succeed);
    for id in ["../escape", "a/b", ""] {
        let err = harness
            .manager
            .start_export(request(single_clip_timeline(), harness.destination()).with_session_id(id))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation, "{id:?}");
    }
    assert!(harness.manager.sessions().is_empty());
    assert!(!harness.root.join("tmp").exists());
}
