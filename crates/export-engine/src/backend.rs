//! Render backend contract shared by the native and compositing adapters.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use splice_common::error::{SpliceError, SpliceResult};
use splice_timeline::{ExportSettings, TimelineSnapshot};

use crate::filter::FilterChain;
use crate::policy::{Engine, EngineDecision};
use crate::sources::SourceTable;

/// Cooperative cancellation flag shared between a session and its adapter.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Idempotent.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> SpliceResult<()> {
        if self.is_cancelled() {
            Err(SpliceError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Everything an adapter needs to render one export.
#[derive(Debug, Clone)]
pub struct RenderJob {
    pub session_id: String,

    /// Immutable timeline captured at export start.
    pub snapshot: TimelineSnapshot,

    pub settings: ExportSettings,

    /// Sources resolved during `Preparing`.
    pub sources: SourceTable,

    /// Engine chosen by the policy, with its rationale.
    pub decision: EngineDecision,

    /// Compiled overlay/effect stages (native filtered path only).
    pub chain: Option<FilterChain>,

    /// Session workspace directory for intermediate files.
    pub workspace_dir: PathBuf,

    /// In-progress output path inside the workspace.
    pub output_path: PathBuf,

    /// Output duration in seconds (the snapshot's duration).
    pub duration_secs: f64,
}

/// Progress report emitted by an adapter while rendering.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderProgress {
    /// Current progress [0.0, 1.0].
    pub progress: f64,

    /// Frames rendered so far.
    pub frames_rendered: u64,

    /// Total frames to render.
    pub total_frames: u64,

    /// Estimated time remaining in seconds.
    pub eta_secs: f64,
}

/// Progress callback for adapters.
pub type ProgressCallback = Box<dyn Fn(RenderProgress) + Send>;

/// What an adapter produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputDescriptor {
    /// Where the rendered file currently lives (workspace path until finalized).
    pub path: PathBuf,
    pub engine: Engine,
    pub duration_secs: f64,
    pub frames: u64,
    pub size_bytes: u64,
}

/// Trait for render backends (native ffmpeg, software compositing).
pub trait RenderBackend: Send {
    /// Execute the render job, writing to `job.output_path`.
    fn render(
        &mut self,
        job: &RenderJob,
        progress: Option<ProgressCallback>,
        cancel: &CancelFlag,
    ) -> SpliceResult<OutputDescriptor>;

    /// Check if this backend can run on the system.
    fn is_available(&self) -> bool;

    /// Backend name.
    fn name(&self) -> &str;
}

/// Creates the backend for a chosen engine.
pub trait BackendProvider: Send + Sync {
    fn backend_for(&self, engine: Engine) -> Box<dyn RenderBackend>;
}
