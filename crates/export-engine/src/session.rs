//! Export session state machine and progress reporting.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use splice_common::error::{ErrorKind, SpliceError, SpliceResult};
use tokio::sync::{broadcast, watch};

use crate::backend::{OutputDescriptor, RenderProgress};
use crate::policy::{Engine, EngineDecision};

/// Buffered progress events per subscriber before lagging.
const EVENT_CAPACITY: usize = 256;

/// State of an export session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportState {
    /// Session created but not started.
    Idle,
    /// Resolving sources and allocating the workspace.
    Preparing,
    /// Running the engine selection policy.
    Selecting,
    /// Adapter is producing the output.
    Rendering,
    /// Moving the output to its destination.
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl ExportState {
    pub fn as_str(self) -> &'static str {
        match self {
            ExportState::Idle => "idle",
            ExportState::Preparing => "preparing",
            ExportState::Selecting => "selecting",
            ExportState::Rendering => "rendering",
            ExportState::Finalizing => "finalizing",
            ExportState::Completed => "completed",
            ExportState::Cancelled => "cancelled",
            ExportState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ExportState::Completed | ExportState::Cancelled | ExportState::Failed
        )
    }

    /// Forward steps, or cancel/fail from any non-terminal state.
    pub fn can_transition_to(self, next: ExportState) -> bool {
        use ExportState::*;
        match (self, next) {
            (Idle, Preparing)
            | (Preparing, Selecting)
            | (Selecting, Rendering)
            | (Rendering, Finalizing)
            | (Finalizing, Completed) => true,
            (from, Cancelled | Failed) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for ExportState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure category and human-readable reason.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureInfo {
    pub kind: ErrorKind,
    pub reason: String,
}

impl From<&SpliceError> for FailureInfo {
    fn from(err: &SpliceError) -> Self {
        let reason = match err {
            SpliceError::Encode {
                message,
                diagnostics,
            } if !diagnostics.is_empty() => format!("{message}\n{diagnostics}"),
            other => other.to_string(),
        };
        Self {
            kind: err.kind(),
            reason,
        }
    }
}

/// Snapshot of a session, as returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub session_id: String,
    pub state: ExportState,

    /// Progress [0.0, 1.0]; never decreases.
    pub progress: f64,

    pub engine: Option<Engine>,
    pub decision_reason: Option<String>,
    pub output: Option<OutputDescriptor>,
    pub failure: Option<FailureInfo>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    fn new(session_id: &str) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.to_string(),
            state: ExportState::Idle,
            progress: 0.0,
            engine: None,
            decision_reason: None,
            output: None,
            failure: None,
            started_at: now,
            updated_at: now,
            finished_at: None,
        }
    }
}

/// Event delivered to progress subscribers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    Started {
        session_id: String,
    },
    StateChanged {
        session_id: String,
        from: ExportState,
        to: ExportState,
    },
    Progress {
        session_id: String,
        progress: f64,
        frames_rendered: u64,
        total_frames: u64,
        eta_secs: f64,
    },
    Completed {
        session_id: String,
        output: OutputDescriptor,
    },
    Failed {
        session_id: String,
        kind: ErrorKind,
        reason: String,
    },
    Cancelled {
        session_id: String,
    },
}

impl ProgressEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProgressEvent::Completed { .. }
                | ProgressEvent::Failed { .. }
                | ProgressEvent::Cancelled { .. }
        )
    }
}

/// Owns one session's status and fans out its events.
///
/// Shared between the session task, the adapter's progress callback and the
/// manager; every update goes through the status channel so readers always
/// see a consistent snapshot.
#[derive(Debug)]
pub struct SessionTracker {
    session_id: String,
    status: watch::Sender<SessionStatus>,
    events: broadcast::Sender<ProgressEvent>,
}

impl SessionTracker {
    pub fn new(session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        let (status, _) = watch::channel(SessionStatus::new(&session_id));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            session_id,
            status,
            events,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.events.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SessionStatus {
        self.status.borrow().clone()
    }

    pub fn state(&self) -> ExportState {
        self.status.borrow().state
    }

    fn emit(&self, event: ProgressEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub fn started(&self) {
        self.emit(ProgressEvent::Started {
            session_id: self.session_id.clone(),
        });
    }

    /// Move to `next`, rejecting illegal transitions.
    pub fn transition(&self, next: ExportState) -> SpliceResult<ExportState> {
        let mut previous = None;
        self.status.send_if_modified(|status| {
            if status.state.can_transition_to(next) {
                previous = Some(status.state);
                status.state = next;
                status.updated_at = Utc::now();
                if next.is_terminal() {
                    status.finished_at = Some(status.updated_at);
                }
                true
            } else {
                false
            }
        });

        let from = previous.ok_or_else(|| {
            SpliceError::Other(anyhow::anyhow!(
                "illegal export state transition {} -> {next} for session {}",
                self.state(),
                self.session_id
            ))
        })?;

        tracing::info!(
            session_id = %self.session_id,
            from = from.as_str(),
            to = next.as_str(),
            "Export state changed"
        );
        self.emit(ProgressEvent::StateChanged {
            session_id: self.session_id.clone(),
            from,
            to: next,
        });
        Ok(from)
    }

    pub fn set_decision(&self, decision: &EngineDecision) {
        self.status.send_modify(|status| {
            status.engine = Some(decision.engine);
            status.decision_reason = Some(decision.reason.clone());
            status.updated_at = Utc::now();
        });
    }

    /// Record adapter progress; regressions are clamped to the last value.
    pub fn report_progress(&self, report: RenderProgress) {
        let mut accepted = None;
        self.status.send_if_modified(|status| {
            if status.state.is_terminal() {
                return false;
            }
            let progress = report.progress.clamp(0.0, 1.0).max(status.progress);
            status.progress = progress;
            status.updated_at = Utc::now();
            accepted = Some(progress);
            true
        });

        if let Some(progress) = accepted {
            tracing::debug!(
                session_id = %self.session_id,
                progress,
                frames = report.frames_rendered,
                "Export progress"
            );
            self.emit(ProgressEvent::Progress {
                session_id: self.session_id.clone(),
                progress,
                frames_rendered: report.frames_rendered,
                total_frames: report.total_frames,
                eta_secs: report.eta_secs,
            });
        }
    }

    pub fn complete(&self, output: OutputDescriptor) -> SpliceResult<()> {
        self.status.send_modify(|status| {
            status.progress = 1.0;
            status.output = Some(output.clone());
        });
        self.transition(ExportState::Completed)?;
        self.emit(ProgressEvent::Completed {
            session_id: self.session_id.clone(),
            output,
        });
        Ok(())
    }

    pub fn fail(&self, err: &SpliceError) -> SpliceResult<()> {
        let failure = FailureInfo::from(err);
        self.status.send_modify(|status| {
            status.failure = Some(failure.clone());
        });
        self.transition(ExportState::Failed)?;
        tracing::error!(
            session_id = %self.session_id,
            kind = failure.kind.as_str(),
            reason = %failure.reason,
            "Export failed"
        );
        self.emit(ProgressEvent::Failed {
            session_id: self.session_id.clone(),
            kind: failure.kind,
            reason: failure.reason,
        });
        Ok(())
    }

    pub fn cancelled(&self) -> SpliceResult<()> {
        self.transition(ExportState::Cancelled)?;
        self.emit(ProgressEvent::Cancelled {
            session_id: self.session_id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(progress: f64) -> RenderProgress {
        RenderProgress {
            progress,
            frames_rendered: (progress * 100.0) as u64,
            total_frames: 100,
            eta_secs: 1.0,
        }
    }

    #[test]
    fn test_forward_transitions_only() {
        use ExportState::*;
        assert!(Idle.can_transition_to(Preparing));
        assert!(Rendering.can_transition_to(Finalizing));
        assert!(!Idle.can_transition_to(Rendering));
        assert!(!Rendering.can_transition_to(Preparing));
        assert!(Selecting.can_transition_to(Cancelled));
        assert!(Preparing.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Failed));
    }

    #[test]
    fn test_illegal_transition_is_rejected() {
        let tracker = SessionTracker::new("s");
        assert!(tracker.transition(ExportState::Rendering).is_err());
        assert_eq!(tracker.state(), ExportState::Idle);
    }

    #[test]
    fn test_progress_never_decreases() {
        let tracker = SessionTracker::new("s");
        let mut events = tracker.subscribe();
        tracker.transition(ExportState::Preparing).unwrap();
        tracker.report_progress(report(0.4));
        tracker.report_progress(report(0.2));
        assert_eq!(tracker.status().progress, 0.4);

        let mut seen = vec![];
        while let Ok(event) = events.try_recv() {
            if let ProgressEvent::Progress { progress, .. } = event {
                seen.push(progress);
            }
        }
        assert_eq!(seen, vec![0.4, 0.4]);
    }

    #[test]
    fn test_failure_records_kind_and_reason() {
        let tracker = SessionTracker::new("s");
        tracker.transition(ExportState::Preparing).unwrap();
        tracker
            .fail(&SpliceError::encode("encoder exited with 1", "bad filter"))
            .unwrap();
        let status = tracker.status();
        assert_eq!(status.state, ExportState::Failed);
        let failure = status.failure.unwrap();
        assert_eq!(failure.kind, ErrorKind::Encode);
        assert!(failure.reason.contains("bad filter"));
        assert!(status.finished_at.is_some());
        assert!(tracker.cancelled().is_err());
    }

    #[test]
    fn test_events_serialize_tagged() {
        let event = ProgressEvent::StateChanged {
            session_id: "s".to_string(),
            from: ExportState::Idle,
            to: ExportState::Preparing,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""event":"state_changed""#));
        assert!(json.contains(r#""to":"preparing""#));
    }
}
