//! Export command — render a timeline to a video file.

use std::io::Write;
use std::path::{Path, PathBuf};

use splice_common::config::AppConfig;
use splice_export::{Engine, ExportEnvironment, ExportManager, ExportRequest, ProgressEvent};
use splice_timeline::TimelineSnapshot;
use tokio::sync::broadcast::error::RecvError;

use super::SettingsArgs;

pub async fn run(
    config: &AppConfig,
    timeline_path: PathBuf,
    output: Option<PathBuf>,
    settings: SettingsArgs,
    engine: Option<String>,
) -> anyhow::Result<()> {
    let timeline = super::load_timeline(&timeline_path)?;
    let settings = settings.resolve(&config.export)?;
    let destination =
        output.unwrap_or_else(|| default_output(&timeline_path, settings.extension()));

    println!("Exporting timeline: {}", timeline_path.display());
    println!(
        "  Output: {} ({}x{} @ {}fps, {} quality)",
        destination.display(),
        settings.width,
        settings.height,
        settings.fps,
        settings.quality.as_str()
    );
    println!("  Duration: {:.2}s", timeline.compute_duration());

    let base_dir = timeline_path.parent().map(Path::to_path_buf);
    let env = ExportEnvironment::from_config(config, base_dir);
    let manager = ExportManager::new(env);

    let mut request = ExportRequest::new(
        TimelineSnapshot::from_timeline(timeline),
        settings,
        destination.clone(),
    );
    if let Some(engine) = engine {
        let engine: Engine = engine.parse()?;
        println!("  Engine override: {engine}");
        request = request.with_override(engine);
    }

    let session_id = manager.start_export(request)?;
    let mut events = manager.subscribe_progress(&session_id)?;
    tracing::info!(session_id = %session_id, "Export started");

    let wait = manager.wait(&session_id);
    tokio::pin!(wait);
    let mut cancel_requested = false;

    let status = loop {
        tokio::select! {
            biased;

            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress events dropped");
                }
                // Sender gone; the wait branch resolves next.
                Err(RecvError::Closed) => {}
            },

            _ = tokio::signal::ctrl_c(), if !cancel_requested => {
                println!();
                println!("Cancelling export...");
                manager.cancel_export(&session_id)?;
                cancel_requested = true;
            }

            status = &mut wait => break status?,
        }
    };

    // Drain events published before the terminal state was observed.
    while let Ok(event) = events.try_recv() {
        print_event(&event);
    }
    println!();

    if let Some(engine) = status.engine {
        println!(
            "  Engine: {engine} ({})",
            status.decision_reason.as_deref().unwrap_or("")
        );
    }

    if let Some(output) = &status.output {
        println!("[OK] Export complete: {}", output.path.display());
        return Ok(());
    }
    if let Some(failure) = &status.failure {
        anyhow::bail!("Export failed ({}): {}", failure.kind.as_str(), failure.reason);
    }
    println!("[WARN] Export cancelled; no output was written");
    Ok(())
}

fn print_event(event: &ProgressEvent) {
    match event {
        ProgressEvent::Progress {
            progress,
            frames_rendered,
            total_frames,
            eta_secs,
            ..
        } => {
            print!(
                "\r  Progress: {:.1}% ({}/{} frames, ETA: {:.0}s)",
                progress * 100.0,
                frames_rendered,
                total_frames,
                eta_secs
            );
            let _ = std::io::stdout().flush();
        }
        ProgressEvent::StateChanged { to, .. } => {
            tracing::debug!(state = to.as_str(), "Export state");
        }
        _ => {}
    }
}

/// `<timeline stem>.<ext>` next to the timeline document.
fn default_output(timeline_path: &Path, extension: &str) -> PathBuf {
    timeline_path.with_extension(extension)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_output_sits_next_to_timeline() {
        let out = default_output(Path::new("/projects/demo/cut.json"), "webm");
        assert_eq!(out, PathBuf::from("/projects/demo/cut.webm"));
    }
}
