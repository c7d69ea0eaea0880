//! Compositing adapter: renders every frame in software and streams raw RGBA
//! into an ffmpeg encoder.
//!
//! Used for content the per-stream filter list cannot express (live
//! components, stickers, blend modes, rotated text, layered media). Audio
//! is muxed with the same mix graph as the native path.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};
use std::sync::Arc;
use std::time::Instant;

use image::{Rgba, RgbaImage};
use splice_common::clock::{format_secs, EtaEstimator, FrameClock, RateController};
use splice_common::config::EncoderConfig;
use splice_common::error::{SpliceError, SpliceResult};
use splice_timeline::ExportSettings;

use crate::audio::{plan_audio, AudioMix, AUDIO_OUT_LABEL};
use crate::backend::{
    CancelFlag, OutputDescriptor, ProgressCallback, RenderBackend, RenderJob, RenderProgress,
};
use crate::capabilities::locate_binary;
use crate::component::ComponentRenderer;
use crate::compositor::{FrameCompositor, FrameRequest, MediaFrameSource};
use crate::filter::Canvas;
use crate::fonts::FontCatalog;
use crate::native::{codec_args_for_settings, normalize_filter, PLAN_REPORT};
use crate::process::{EncoderCommand, EncoderProcess};

/// Progress callbacks per second while streaming frames.
const PROGRESS_HZ: u32 = 10;

/// Software compositing adapter.
pub struct CompositingBackend {
    ffmpeg: PathBuf,
    extra_args: Vec<String>,
    fonts: FontCatalog,
    components: Option<Arc<dyn ComponentRenderer>>,
}

impl CompositingBackend {
    pub fn new(config: &EncoderConfig, fonts: FontCatalog) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            extra_args: config.extra_args.clone(),
            fonts,
            components: None,
        }
    }

    pub fn with_component_renderer(mut self, renderer: Arc<dyn ComponentRenderer>) -> Self {
        self.components = Some(renderer);
        self
    }

    /// Encoder command reading raw frames from stdin.
    pub(crate) fn encoder_command(&self, job: &RenderJob, audio: &AudioMix) -> EncoderCommand {
        let settings = &job.settings;
        let mut command = EncoderCommand::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-y"])
            .args(["-progress", "pipe:1", "-nostats"])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba"])
            .args([
                "-s".to_string(),
                format!("{}x{}", settings.width, settings.height),
                "-r".to_string(),
                settings.fps.to_string(),
            ])
            .args(["-i", "pipe:0"])
            .args(audio.input_args());

        match &audio.graph {
            Some(graph) => {
                command
                    .args(["-filter_complex".to_string(), graph.clone()])
                    .args(["-map", "0:v:0", "-map", AUDIO_OUT_LABEL]);
            }
            None => {
                command.args(["-map", "0:v:0", "-an"]);
            }
        }

        command
            .args(codec_args_for_settings(settings, !audio.is_silent()))
            .args(["-t".to_string(), format_secs(job.duration_secs)])
            .args(self.extra_args.iter().cloned())
            .arg(job.output_path.display().to_string());
        command
    }
}

impl RenderBackend for CompositingBackend {
    fn render(
        &mut self,
        job: &RenderJob,
        progress: Option<ProgressCallback>,
        cancel: &CancelFlag,
    ) -> SpliceResult<OutputDescriptor> {
        let started = Instant::now();
        cancel.check()?;

        if !self.is_available() {
            return Err(SpliceError::resource(format!(
                "compositing needs an encoder to write the container, but {} was not found",
                self.ffmpeg.display()
            )));
        }

        let clock = FrameClock::new(job.settings.fps);
        let total_frames = clock.frame_count(job.duration_secs);
        let audio = plan_audio(&job.snapshot, &job.sources, 1)?;
        let command = self.encoder_command(job, &audio);

        let report = format!(
            "session={}\nengine={}\nreason={}\nduration_secs={:.3}\nframes={}\naudio_inputs={}\nffmpeg_args={}\n",
            job.session_id,
            job.decision.engine,
            job.decision.reason,
            job.duration_secs,
            total_frames,
            audio.inputs.len(),
            command.to_command_line(),
        );
        let report_path = job.workspace_dir.join(PLAN_REPORT);
        if let Err(err) = std::fs::write(&report_path, report) {
            tracing::warn!(error = %err, path = %report_path.display(), "Failed to write plan report");
        }

        let frames = FfmpegFrameSource::new(self.ffmpeg.clone(), job.settings);
        let mut compositor = FrameCompositor::new(
            Canvas::from(&job.settings),
            job.sources.clone(),
            self.fonts.clone(),
            Box::new(frames),
        );
        if let Some(renderer) = &self.components {
            compositor = compositor.with_component_renderer(Arc::clone(renderer));
        }

        tracing::info!(
            session_id = %job.session_id,
            frames = total_frames,
            width = job.settings.width,
            height = job.settings.height,
            "Compositing render started"
        );

        let mut process = EncoderProcess::spawn(&command, true)?;
        stream_frames(
            &mut process,
            &mut compositor,
            job,
            &clock,
            total_frames,
            progress.as_ref(),
            cancel,
        )?;
        process.finish()?;

        let size_bytes = std::fs::metadata(&job.output_path)
            .map(|m| m.len())
            .map_err(|e| {
                SpliceError::encode(
                    format!("encoder produced no output at {}", job.output_path.display()),
                    e.to_string(),
                )
            })?;

        let mut warnings = String::new();
        for warning in compositor.warnings() {
            let _ = writeln!(warnings, "{warning}");
        }
        tracing::info!(
            session_id = %job.session_id,
            elapsed_secs = started.elapsed().as_secs_f64(),
            size_bytes,
            warnings = compositor.warnings().len(),
            "Compositing render finished"
        );
        if !warnings.is_empty() {
            tracing::debug!(session_id = %job.session_id, "Compositing warnings:\n{warnings}");
        }

        Ok(OutputDescriptor {
            path: job.output_path.clone(),
            engine: job.decision.engine,
            duration_secs: job.duration_secs,
            frames: total_frames,
            size_bytes,
        })
    }

    fn is_available(&self) -> bool {
        locate_binary(&self.ffmpeg).is_some()
    }

    fn name(&self) -> &str {
        "software-compositor"
    }
}

/// Compose and write every frame; kills the encoder on cancel or failure.
fn stream_frames(
    process: &mut EncoderProcess,
    compositor: &mut FrameCompositor,
    job: &RenderJob,
    clock: &FrameClock,
    total_frames: u64,
    progress: Option<&ProgressCallback>,
    cancel: &CancelFlag,
) -> SpliceResult<()> {
    let eta = EtaEstimator::start();
    let mut throttle = RateController::new(PROGRESS_HZ);

    for index in 0..total_frames {
        if cancel.is_cancelled() {
            process.kill();
            return Err(SpliceError::Cancelled);
        }

        let frame = match compositor.compose(&job.snapshot, clock.frame_time(index)) {
            Ok(frame) => frame,
            Err(err) => {
                process.kill();
                return Err(err);
            }
        };

        let Some(stdin) = process.stdin() else {
            process.kill();
            return Err(SpliceError::resource("encoder input pipe is closed"));
        };
        if let Err(err) = stdin.write_all(frame.as_raw()) {
            tracing::warn!(error = %err, frame = index, "Encoder stopped accepting frames");
            return Err(SpliceError::encode(
                format!("encoder closed its input at frame {index}"),
                err.to_string(),
            ));
        }

        let rendered = index + 1;
        let elapsed_ns = (eta.elapsed_secs() * 1e9) as u64;
        if rendered == total_frames || throttle.should_tick(elapsed_ns) {
            let fraction = rendered as f64 / total_frames as f64;
            if let Some(cb) = progress {
                cb(RenderProgress {
                    progress: fraction,
                    frames_rendered: rendered,
                    total_frames,
                    eta_secs: eta.eta_secs(fraction),
                });
            }
        }
    }
    Ok(())
}

/// Decodes media through one ffmpeg process per on-screen element, reading
/// sequential raw RGBA frames already fitted to the output canvas.
pub struct FfmpegFrameSource {
    ffmpeg: PathBuf,
    settings: ExportSettings,
    decoders: HashMap<String, Decoder>,
}

struct Decoder {
    child: Child,
    stdout: ChildStdout,
    next_time: f64,
    last: Option<RgbaImage>,
    exhausted: bool,
}

impl Drop for Decoder {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

impl FfmpegFrameSource {
    pub fn new(ffmpeg: PathBuf, settings: ExportSettings) -> Self {
        Self {
            ffmpeg,
            settings,
            decoders: HashMap::new(),
        }
    }

    fn spawn_decoder(&self, request: &FrameRequest<'_>) -> SpliceResult<Decoder> {
        let mut child = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-nostdin", "-loglevel", "error"])
            .args(["-ss", &format_secs(request.source_time_secs)])
            .arg("-i")
            .arg(&request.source.path)
            .args([
                "-vf".to_string(),
                format!("{},format=rgba", normalize_filter(&self.settings)),
            ])
            .args(["-f", "rawvideo", "-pix_fmt", "rgba", "pipe:1"])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                SpliceError::resource(format!(
                    "Failed to start decoder for {}: {e}",
                    request.source.path.display()
                ))
            })?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| SpliceError::resource("Failed to capture decoder stdout"))?;

        tracing::debug!(
            element_id = request.element_id,
            pid = child.id(),
            source_time_secs = request.source_time_secs,
            "Decoder started"
        );
        Ok(Decoder {
            child,
            stdout,
            next_time: request.source_time_secs,
            last: None,
            exhausted: false,
        })
    }
}

impl MediaFrameSource for FfmpegFrameSource {
    fn frame(&mut self, request: &FrameRequest<'_>) -> SpliceResult<RgbaImage> {
        let frame_duration = 1.0 / f64::from(self.settings.fps);
        let in_sequence = self.decoders.get(request.element_id).is_some_and(|d| {
            (d.next_time - request.source_time_secs).abs() <= frame_duration / 2.0
        });
        if !in_sequence {
            let decoder = self.spawn_decoder(request)?;
            self.decoders.insert(request.element_id.to_string(), decoder);
        }
        let decoder = self
            .decoders
            .get_mut(request.element_id)
            .ok_or_else(|| SpliceError::resource("decoder vanished"))?;

        let (w, h) = (request.width, request.height);
        decoder.next_time += frame_duration;
        if !decoder.exhausted {
            let mut buffer = vec![0u8; w as usize * h as usize * 4];
            match decoder.stdout.read_exact(&mut buffer) {
                Ok(()) => {
                    if let Some(image) = RgbaImage::from_raw(w, h, buffer) {
                        decoder.last = Some(image);
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    decoder.exhausted = true;
                }
                Err(err) => {
                    return Err(SpliceError::resource(format!(
                        "failed to read decoded frame for {}: {err}",
                        request.element_id
                    )));
                }
            }
        }

        // A source shorter than its element holds its last frame.
        Ok(decoder
            .last
            .clone()
            .unwrap_or_else(|| RgbaImage::from_pixel(w, h, Rgba([0, 0, 0, 255]))))
    }

    fn retain(&mut self, active_element_ids: &[&str]) {
        self.decoders
            .retain(|id, _| active_element_ids.contains(&id.as_str()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{Engine, EngineDecision};
    use crate::sources::{ResolvedSource, SourceTable};
    use splice_timeline::{
        AudioPayload, Element, ElementPayload, OutputFormat, SourceRef, Timeline,
        TimelineSnapshot, Track, TrackKind,
    };

    fn job(timeline: Timeline, settings: ExportSettings) -> RenderJob {
        let sources: SourceTable = [ResolvedSource::audio("music.wav", "/m/music.wav", 60.0)]
            .into_iter()
            .collect();
        let duration_secs = timeline.compute_duration();
        RenderJob {
            session_id: "s2".to_string(),
            snapshot: TimelineSnapshot::from_timeline(timeline),
            settings,
            sources,
            decision: EngineDecision {
                engine: Engine::Compositing,
                reason: "test".to_string(),
                estimated_performance: Engine::Compositing.estimated_speed(),
            },
            chain: None,
            workspace_dir: PathBuf::from("/tmp/splice-export-s2"),
            output_path: PathBuf::from("/tmp/splice-export-s2/output.webm"),
            duration_secs,
        }
    }

    fn music_timeline() -> Timeline {
        let mut timeline = Timeline::new();
        timeline
            .add_track(Track::new("a1", TrackKind::Audio, "Music"))
            .unwrap();
        timeline
            .add_element(
                "a1",
                Element::new(
                    "music",
                    0.0,
                    2.0,
                    ElementPayload::Audio(AudioPayload {
                        source: SourceRef::new("music.wav"),
                        volume: 1.0,
                        muted: false,
                    }),
                ),
            )
            .unwrap();
        timeline
    }

    #[test]
    fn test_encoder_reads_raw_frames_from_stdin() {
        let settings = ExportSettings::new(640, 360, 24).with_format(OutputFormat::Webm);
        let job = job(music_timeline(), settings);
        let backend = CompositingBackend::new(&EncoderConfig::default(), FontCatalog::default());
        let audio = plan_audio(&job.snapshot, &job.sources, 1).unwrap();
        let command = backend.encoder_command(&job, &audio);
        let args = command.get_args();

        assert!(args.windows(2).any(|w| w == ["-f", "rawvideo"]));
        assert!(args.windows(2).any(|w| w == ["-s", "640x360"]));
        assert!(args.windows(2).any(|w| w == ["-i", "pipe:0"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/m/music.wav"]));
        assert!(args.windows(2).any(|w| w == ["-map", "[aout]"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libvpx-vp9"]));
        assert!(args.windows(2).any(|w| w == ["-t", "2.000000"]));
        assert_eq!(args.last().unwrap(), "/tmp/splice-export-s2/output.webm");
    }

    #[test]
    fn test_missing_encoder_is_resource_error() {
        let config = EncoderConfig {
            ffmpeg_path: PathBuf::from("/nonexistent/splice-ffmpeg"),
            ..EncoderConfig::default()
        };
        let mut backend = CompositingBackend::new(&config, FontCatalog::default());
        let job = job(music_timeline(), ExportSettings::default());
        let err = backend.render(&job, None, &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, SpliceError::Resource { .. }));
    }

    #[test]
    fn test_cancelled_before_start() {
        let mut backend =
            CompositingBackend::new(&EncoderConfig::default(), FontCatalog::default());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let job = job(music_timeline(), ExportSettings::default());
        let err = backend.render(&job, None, &cancel).unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_frame_source_releases_inactive_decoders() {
        let mut frames = FfmpegFrameSource::new(PathBuf::from("ffmpeg"), ExportSettings::default());
        frames.retain(&["a"]);
        assert!(frames.decoders.is_empty());
    }
}
