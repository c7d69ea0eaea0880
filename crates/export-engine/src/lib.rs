//! Splice Export Engine
//!
//! Turns an immutable timeline snapshot into a single encoded video file.
//!
//! # Pipeline Architecture
//!
//! ```text
//! snapshot ──┐
//!            ├── Resolve sources (ffprobe)
//! settings ──┘         │
//!                      ├── Select engine (policy)
//!                      │        │
//!        ┌─────────────┼────────┴───────────────┐
//!        ▼             ▼                        ▼
//!   direct copy   filtered (-vf chain)    compositing (RGBA frames)
//!        │             │                        │
//!        └─────────────┴──── ffmpeg ────────────┘
//!                              │
//!                              ▼
//!                 workspace output ──► destination
//! ```
//!
//! [`ExportManager`] runs each export as a session with its own workspace,
//! progress stream and cancel flag.

pub mod audio;
pub mod backend;
pub mod capabilities;
pub mod component;
pub mod compositing;
pub mod compositor;
pub mod filter;
pub mod fonts;
pub mod native;
pub mod orchestrator;
pub mod policy;
pub mod process;
pub mod session;
pub mod sources;
pub mod workspace;

pub use backend::{
    BackendProvider, CancelFlag, OutputDescriptor, ProgressCallback, RenderBackend, RenderJob,
    RenderProgress,
};
pub use capabilities::EnvironmentCapabilities;
pub use component::{ComponentBundler, ComponentRenderer};
pub use filter::{compile, Canvas, FilterChain, FilterStage};
pub use fonts::FontCatalog;
pub use orchestrator::{ExportEnvironment, ExportManager, ExportRequest, FfmpegBackends};
pub use policy::{select, Engine, EngineDecision};
pub use session::{ExportState, ProgressEvent, SessionStatus};
pub use sources::{FsSourceResolver, ResolvedSource, SourceResolver, SourceTable};
