//! Export session orchestrator.
//!
//! [`ExportManager`] is the invocation boundary front-ends talk to. Each
//! started export runs as one tokio task that drives the session through
//! `Preparing -> Selecting -> Rendering -> Finalizing` and ends in exactly one
//! terminal state. Adapters run on the blocking pool; the task always waits
//! for them to return before the workspace is released.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use splice_common::config::{AppConfig, EncoderConfig};
use splice_common::error::{SpliceError, SpliceResult};
use splice_timeline::{ExportSettings, TimelineSnapshot};
use tokio::sync::broadcast;

use crate::backend::{
    BackendProvider, CancelFlag, OutputDescriptor, ProgressCallback, RenderBackend, RenderJob,
};
use crate::capabilities::EnvironmentCapabilities;
use crate::compositing::CompositingBackend;
use crate::component::ComponentRenderer;
use crate::filter::{compile, Canvas};
use crate::fonts::FontCatalog;
use crate::native::NativeBackend;
use crate::policy::{self, Engine};
use crate::process::probe_duration;
use crate::session::{ExportState, ProgressEvent, SessionStatus, SessionTracker};
use crate::sources::{resolve_all, FsSourceResolver, SourceResolver};
use crate::workspace::{validate_session_id, SessionWorkspace};

/// Allowed difference between the rendered and expected duration.
const DURATION_TOLERANCE_SECS: f64 = 0.5;

/// How long a finished session stays queryable.
const FINISHED_RETENTION_SECS: i64 = 600;

/// Creates ffmpeg-backed adapters.
pub struct FfmpegBackends {
    encoder: EncoderConfig,
    fonts: FontCatalog,
    components: Option<Arc<dyn ComponentRenderer>>,
}

impl FfmpegBackends {
    pub fn new(encoder: EncoderConfig, fonts: FontCatalog) -> Self {
        Self {
            encoder,
            fonts,
            components: None,
        }
    }

    pub fn with_component_renderer(mut self, renderer: Arc<dyn ComponentRenderer>) -> Self {
        self.components = Some(renderer);
        self
    }
}

impl BackendProvider for FfmpegBackends {
    fn backend_for(&self, engine: Engine) -> Box<dyn RenderBackend> {
        if engine.is_native() {
            return Box::new(NativeBackend::new(&self.encoder));
        }
        let mut backend = CompositingBackend::new(&self.encoder, self.fonts.clone());
        if let Some(renderer) = &self.components {
            backend = backend.with_component_renderer(Arc::clone(renderer));
        }
        Box::new(backend)
    }
}

/// Collaborators shared by every session of a manager.
pub struct ExportEnvironment {
    /// Parent of the per-session workspaces.
    pub temp_root: PathBuf,
    pub capabilities: EnvironmentCapabilities,
    pub resolver: Arc<dyn SourceResolver>,
    pub backends: Arc<dyn BackendProvider>,
    pub fonts: FontCatalog,
    /// ffprobe used to check the finished file's duration.
    pub verify_with: Option<PathBuf>,
}

impl ExportEnvironment {
    pub fn new(
        temp_root: impl Into<PathBuf>,
        capabilities: EnvironmentCapabilities,
        resolver: Arc<dyn SourceResolver>,
        backends: Arc<dyn BackendProvider>,
        fonts: FontCatalog,
    ) -> Self {
        Self {
            temp_root: temp_root.into(),
            capabilities,
            resolver,
            backends,
            fonts,
            verify_with: None,
        }
    }

    /// Detect capabilities and wire the ffmpeg adapters from configuration.
    /// Relative source references resolve against `base_dir`.
    pub fn from_config(config: &AppConfig, base_dir: Option<PathBuf>) -> Self {
        let capabilities = EnvironmentCapabilities::detect(&config.encoder);
        let fonts = FontCatalog::from_config(&config.fonts);
        let resolver = FsSourceResolver::new(base_dir, capabilities.ffprobe.clone());
        let backends = FfmpegBackends::new(config.encoder.clone(), fonts.clone());
        let verify_with = capabilities.ffprobe.clone();
        Self {
            temp_root: config.temp_root.clone(),
            capabilities,
            resolver: Arc::new(resolver),
            backends: Arc::new(backends),
            fonts,
            verify_with,
        }
    }
}

/// Parameters of one export.
#[derive(Debug, Clone)]
pub struct ExportRequest {
    /// Caller-chosen session id; a UUID is generated when absent.
    pub session_id: Option<String>,
    pub snapshot: TimelineSnapshot,
    pub settings: ExportSettings,
    pub destination: PathBuf,
    pub explicit_override: Option<Engine>,
}

impl ExportRequest {
    pub fn new(
        snapshot: TimelineSnapshot,
        settings: ExportSettings,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            session_id: None,
            snapshot,
            settings,
            destination: destination.into(),
            explicit_override: None,
        }
    }

    pub fn with_session_id(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_override(mut self, engine: Engine) -> Self {
        self.explicit_override = Some(engine);
        self
    }
}

struct SessionEntry {
    tracker: Arc<SessionTracker>,
    cancel: CancelFlag,
}

/// Drop sessions that finished more than the retention period before `now`.
fn prune_finished(sessions: &mut HashMap<String, Arc<SessionEntry>>, now: DateTime<Utc>) {
    let cutoff = now - chrono::Duration::seconds(FINISHED_RETENTION_SECS);
    sessions.retain(|session_id, entry| match entry.tracker.status().finished_at {
        Some(finished) if finished < cutoff => {
            tracing::debug!(session_id = %session_id, "Forgetting finished export session");
            false
        }
        _ => true,
    });
}

/// Starts, tracks and cancels export sessions.
#[derive(Clone)]
pub struct ExportManager {
    env: Arc<ExportEnvironment>,
    sessions: Arc<Mutex<HashMap<String, Arc<SessionEntry>>>>,
}

impl ExportManager {
    pub fn new(env: ExportEnvironment) -> Self {
        Self {
            env: Arc::new(env),
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn environment(&self) -> &ExportEnvironment {
        &self.env
    }

    /// Validate the request and start a session task. Must be called from
    /// within a tokio runtime.
    pub fn start_export(&self, request: ExportRequest) -> SpliceResult<String> {
        request.settings.validate()?;
        let duration = request.snapshot.compute_duration();
        if duration <= 0.0 {
            return Err(SpliceError::validation(
                "nothing to export: the timeline is empty",
            ));
        }
        if request.destination.is_dir() {
            return Err(SpliceError::validation(format!(
                "destination {} is a directory",
                request.destination.display()
            )));
        }
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| SpliceError::resource(format!("no async runtime for export: {e}")))?;

        let session_id = match &request.session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.clone()
            }
            None => uuid::Uuid::new_v4().to_string(),
        };
        if let Some(engine) = request.explicit_override {
            policy::precheck_override(&request.snapshot, &self.env.capabilities, engine)?;
        }

        let entry = {
            let mut sessions = self.lock_sessions();
            prune_finished(&mut sessions, Utc::now());
            if let Some(existing) = sessions.get(&session_id) {
                if !existing.tracker.state().is_terminal() {
                    return Err(SpliceError::SessionAlreadyActive { id: session_id });
                }
            }
            let entry = Arc::new(SessionEntry {
                tracker: Arc::new(SessionTracker::new(session_id.clone())),
                cancel: CancelFlag::new(),
            });
            sessions.insert(session_id.clone(), Arc::clone(&entry));
            entry
        };

        tracing::info!(
            session_id = %session_id,
            revision = request.snapshot.revision(),
            duration_secs = duration,
            width = request.settings.width,
            height = request.settings.height,
            fps = request.settings.fps,
            destination = %request.destination.display(),
            "Export started"
        );
        entry.tracker.started();

        let env = Arc::clone(&self.env);
        runtime.spawn(run_session(env, entry, request));
        Ok(session_id)
    }

    /// Request cancellation. A no-op for sessions that already finished.
    pub fn cancel_export(&self, session_id: &str) -> SpliceResult<()> {
        let entry = self.entry(session_id)?;
        let state = entry.tracker.state();
        if state.is_terminal() {
            tracing::debug!(session_id, state = state.as_str(), "Cancel ignored for finished export");
            return Ok(());
        }
        tracing::info!(session_id, state = state.as_str(), "Export cancellation requested");
        entry.cancel.cancel();
        Ok(())
    }

    /// Events emitted from now on. Use [`ExportManager::status`] for the
    /// current state.
    pub fn subscribe_progress(
        &self,
        session_id: &str,
    ) -> SpliceResult<broadcast::Receiver<ProgressEvent>> {
        Ok(self.entry(session_id)?.tracker.subscribe())
    }

    pub fn status(&self, session_id: &str) -> SpliceResult<SessionStatus> {
        Ok(self.entry(session_id)?.tracker.status())
    }

    /// Wait until the session reaches a terminal state.
    pub async fn wait(&self, session_id: &str) -> SpliceResult<SessionStatus> {
        let entry = self.entry(session_id)?;
        let mut status = entry.tracker.watch();
        let terminal = status
            .wait_for(|s| s.state.is_terminal())
            .await
            .map_err(|_| SpliceError::resource(format!("export session {session_id} vanished")))?;
        Ok(terminal.clone())
    }

    /// Status of every known session.
    pub fn sessions(&self) -> Vec<SessionStatus> {
        let mut all: Vec<SessionStatus> = self
            .lock_sessions()
            .values()
            .map(|entry| entry.tracker.status())
            .collect();
        all.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        all
    }

    fn entry(&self, session_id: &str) -> SpliceResult<Arc<SessionEntry>> {
        self.lock_sessions()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SpliceError::SessionNotFound {
                id: session_id.to_string(),
            })
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<SessionEntry>>> {
        self.sessions
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

async fn run_session(env: Arc<ExportEnvironment>, entry: Arc<SessionEntry>, request: ExportRequest) {
    let tracker = &entry.tracker;
    let outcome = drive(&env, tracker, &entry.cancel, request).await;

    let recorded = match outcome {
        Ok(output) => {
            tracing::info!(
                session_id = tracker.session_id(),
                path = %output.path.display(),
                engine = output.engine.as_str(),
                size_bytes = output.size_bytes,
                "Export completed"
            );
            tracker.complete(output)
        }
        Err(err) if err.is_cancelled() => {
            tracing::info!(session_id = tracker.session_id(), "Export cancelled");
            tracker.cancelled()
        }
        Err(err) => tracker.fail(&err),
    };
    if let Err(err) = recorded {
        tracing::error!(session_id = tracker.session_id(), error = %err, "Failed to record export outcome");
    }
}

/// Run every stage. The workspace is dropped before this returns, so the
/// terminal state is only published once the temp files are gone.
async fn drive(
    env: &ExportEnvironment,
    tracker: &Arc<SessionTracker>,
    cancel: &CancelFlag,
    request: ExportRequest,
) -> SpliceResult<OutputDescriptor> {
    let ExportRequest {
        snapshot,
        settings,
        destination,
        explicit_override,
        ..
    } = request;
    let session_id = tracker.session_id().to_string();

    tracker.transition(ExportState::Preparing)?;
    cancel.check()?;
    let sources = {
        let resolver = Arc::clone(&env.resolver);
        let snapshot = snapshot.clone();
        let cancel = cancel.clone();
        tokio::task::spawn_blocking(move || resolve_all(&snapshot, resolver.as_ref(), &cancel))
            .await
            .map_err(worker_failed)??
    };
    cancel.check()?;
    let workspace = SessionWorkspace::create(&env.temp_root, &session_id)?;

    tracker.transition(ExportState::Selecting)?;
    let decision = policy::select(
        &snapshot,
        &settings,
        &sources,
        &env.capabilities,
        explicit_override,
    )?;
    tracker.set_decision(&decision);
    tracing::info!(
        session_id = %session_id,
        engine = decision.engine.as_str(),
        reason = %decision.reason,
        estimated_speed = decision.estimated_performance,
        "Engine selected"
    );
    let chain = (decision.engine == Engine::NativeFiltered)
        .then(|| compile(&snapshot, Canvas::from(&settings), &env.fonts));
    if let Some(chain) = &chain {
        for warning in chain.warnings() {
            tracing::warn!(session_id = %session_id, "{warning}");
        }
    }
    cancel.check()?;

    tracker.transition(ExportState::Rendering)?;
    let duration_secs = snapshot.compute_duration();
    let job = RenderJob {
        session_id: session_id.clone(),
        snapshot,
        settings,
        sources,
        decision: decision.clone(),
        chain,
        workspace_dir: workspace.root().to_path_buf(),
        output_path: workspace.output_path(settings.extension()),
        duration_secs,
    };
    let mut backend = env.backends.backend_for(decision.engine);
    tracing::debug!(session_id = %session_id, backend = backend.name(), "Rendering");
    let progress_tracker = Arc::clone(tracker);
    let callback: ProgressCallback =
        Box::new(move |report| progress_tracker.report_progress(report));
    let render_cancel = cancel.clone();
    let rendered = tokio::task::spawn_blocking(move || {
        backend.render(&job, Some(callback), &render_cancel)
    })
    .await
    .map_err(worker_failed)??;
    cancel.check()?;

    tracker.transition(ExportState::Finalizing)?;
    let verify_with = env.verify_with.clone();
    let output = tokio::task::spawn_blocking(move || {
        finalize(rendered, &destination, verify_with.as_deref())
    })
    .await
    .map_err(worker_failed)??;

    drop(workspace);
    Ok(output)
}

fn worker_failed(err: tokio::task::JoinError) -> SpliceError {
    SpliceError::Other(anyhow::anyhow!("export worker failed: {err}"))
}

/// Move the rendered file to `destination`, copying across filesystems.
fn finalize(
    rendered: OutputDescriptor,
    destination: &Path,
    ffprobe: Option<&Path>,
) -> SpliceResult<OutputDescriptor> {
    if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    if let Err(rename_err) = std::fs::rename(&rendered.path, destination) {
        tracing::debug!(error = %rename_err, "Rename failed, copying output instead");
        if let Err(copy_err) = std::fs::copy(&rendered.path, destination) {
            std::fs::remove_file(destination).ok();
            return Err(SpliceError::resource(format!(
                "failed to move output to {}: {copy_err}",
                destination.display()
            )));
        }
        std::fs::remove_file(&rendered.path).ok();
    }

    if let Some(ffprobe) = ffprobe {
        match probe_duration(ffprobe, destination) {
            Some(actual) if (actual - rendered.duration_secs).abs() > DURATION_TOLERANCE_SECS => {
                tracing::warn!(
                    expected_secs = rendered.duration_secs,
                    actual_secs = actual,
                    "Exported duration differs from the timeline"
                );
            }
            Some(_) => {}
            None => tracing::debug!(path = %destination.display(), "Could not probe exported file"),
        }
    }

    Ok(OutputDescriptor {
        path: destination.to_path_buf(),
        ..rendered
    })
}
