//! Native encoder adapter: drives ffmpeg directly.
//!
//! Both variants read the media track through an ffconcat list written into
//! the session workspace. Direct copy stream-copies it; the filtered variant
//! normalizes it to the output canvas, applies the compiled filter chain as a
//! single `-vf` and mixes audio in its own `-filter_complex` graph.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Instant;

use splice_common::clock::{format_secs, FrameClock};
use splice_common::config::EncoderConfig;
use splice_common::error::{SpliceError, SpliceResult};
use splice_timeline::{ElementPayload, ExportSettings, OutputFormat, Quality, TrackKind};

use crate::audio::{plan_audio, AUDIO_OUT_LABEL};
use crate::backend::{CancelFlag, OutputDescriptor, ProgressCallback, RenderBackend, RenderJob};
use crate::capabilities::locate_binary;
use crate::policy::Engine;
use crate::process::{EncoderCommand, EncoderProcess};

/// Name of the concat list inside the workspace.
const CONCAT_LIST: &str = "inputs.ffconcat";

/// Name of the plan report inside the workspace.
pub const PLAN_REPORT: &str = "plan.txt";

/// ffmpeg-backed native adapter.
#[derive(Debug, Clone)]
pub struct NativeBackend {
    ffmpeg: PathBuf,
    extra_args: Vec<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct NativePlan {
    pub command: EncoderCommand,
    pub concat_list: String,
    pub concat_path: PathBuf,
    pub total_frames: u64,
    pub report: String,
}

impl NativeBackend {
    pub fn new(config: &EncoderConfig) -> Self {
        Self {
            ffmpeg: config.ffmpeg_path.clone(),
            extra_args: config.extra_args.clone(),
        }
    }

    pub(crate) fn build_plan(&self, job: &RenderJob) -> SpliceResult<NativePlan> {
        let plan_started = Instant::now();
        let engine = job.decision.engine;
        if !engine.is_native() {
            return Err(SpliceError::validation(format!(
                "native adapter cannot run engine {engine}"
            )));
        }

        let concat_path = job.workspace_dir.join(CONCAT_LIST);
        let (concat_list, entries) = build_concat_list(job)?;
        let total_frames = FrameClock::new(job.settings.fps).frame_count(job.duration_secs);

        let mut command = EncoderCommand::new(&self.ffmpeg);
        command
            .args(["-hide_banner", "-nostdin", "-y"])
            .args(["-progress", "pipe:1", "-nostats"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(concat_path.display().to_string());

        let mut stage_count = 0;
        let mut audio_inputs = 0;
        let mut warnings: Vec<String> = vec![];

        match engine {
            Engine::NativeDirectCopy => {
                command
                    .args(["-map", "0:v:0", "-map", "0:a?", "-c", "copy"])
                    .args(container_args(job.settings.output_format));
            }
            _ => {
                let audio = plan_audio(&job.snapshot, &job.sources, 1)?;
                audio_inputs = audio.inputs.len();
                command.args(audio.input_args());

                let mut video_filter = normalize_filter(&job.settings);
                if let Some(chain) = job.chain.as_ref().filter(|c| !c.is_empty()) {
                    video_filter.push(',');
                    video_filter.push_str(&chain.to_filter_string());
                    stage_count = chain.len();
                    warnings = chain.warnings().to_vec();
                }
                command.args(["-vf".to_string(), video_filter]);

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
                    .args(["-r".to_string(), job.settings.fps.to_string()])
                    .args(codec_args_for_settings(&job.settings, !audio.is_silent()));
            }
        }

        command
            .args(["-t".to_string(), format_secs(job.duration_secs)])
            .args(self.extra_args.iter().cloned())
            .arg(job.output_path.display().to_string());

        let mut report = String::new();
        let _ = write!(
            report,
            "session={}\nengine={}\nreason={}\nduration_secs={:.3}\nframes={}\nconcat_entries={}\naudio_inputs={}\nstages={}\n",
            job.session_id,
            engine,
            job.decision.reason,
            job.duration_secs,
            total_frames,
            entries,
            audio_inputs,
            stage_count,
        );
        for warning in &warnings {
            let _ = writeln!(report, "warning={warning}");
        }
        let _ = write!(
            report,
            "ffmpeg_args={}\nplan_build_ms={}\n",
            command.to_command_line(),
            plan_started.elapsed().as_millis()
        );

        tracing::info!(
            session_id = %job.session_id,
            engine = engine.as_str(),
            frames = total_frames,
            concat_entries = entries,
            audio_inputs,
            stages = stage_count,
            "Export plan built"
        );

        Ok(NativePlan {
            command,
            concat_list,
            concat_path,
            total_frames,
            report,
        })
    }
}

impl RenderBackend for NativeBackend {
    fn render(
        &mut self,
        job: &RenderJob,
        progress: Option<ProgressCallback>,
        cancel: &CancelFlag,
    ) -> SpliceResult<OutputDescriptor> {
        let started = Instant::now();
        cancel.check()?;

        let plan = self.build_plan(job)?;
        std::fs::write(&plan.concat_path, &plan.concat_list)?;

        let report_path = job.workspace_dir.join(PLAN_REPORT);
        if let Err(err) = std::fs::write(&report_path, &plan.report) {
            tracing::warn!(error = %err, path = %report_path.display(), "Failed to write plan report");
        } else {
            tracing::info!(path = %report_path.display(), "Wrote plan report");
        }

        cancel.check()?;
        let process = EncoderProcess::spawn(&plan.command, false)?;
        process.monitor(
            job.duration_secs,
            plan.total_frames,
            progress.as_ref(),
            cancel,
        )?;

        let size_bytes = std::fs::metadata(&job.output_path)
            .map(|m| m.len())
            .map_err(|e| {
                SpliceError::encode(
                    format!("encoder produced no output at {}", job.output_path.display()),
                    e.to_string(),
                )
            })?;

        tracing::info!(
            session_id = %job.session_id,
            elapsed_secs = started.elapsed().as_secs_f64(),
            size_bytes,
            "Native render finished"
        );

        Ok(OutputDescriptor {
            path: job.output_path.clone(),
            engine: job.decision.engine,
            duration_secs: job.duration_secs,
            frames: plan.total_frames,
            size_bytes,
        })
    }

    fn is_available(&self) -> bool {
        locate_binary(&self.ffmpeg).is_some()
    }

    fn name(&self) -> &str {
        "ffmpeg-native"
    }
}

/// ffconcat list of the media track in timeline order. Returns the list and
/// its entry count.
fn build_concat_list(job: &RenderJob) -> SpliceResult<(String, usize)> {
    let mut clips: Vec<_> = job
        .snapshot
        .elements()
        .filter(|a| !a.element.hidden && a.track_kind == TrackKind::Media)
        .filter_map(|a| match &a.element.payload {
            ElementPayload::Media(media) => Some((a.element, media)),
            _ => None,
        })
        .collect();
    clips.sort_by(|a, b| {
        a.0.visible_window()
            .start
            .total_cmp(&b.0.visible_window().start)
    });

    if clips.is_empty() {
        return Err(SpliceError::validation(
            "native export needs at least one media clip",
        ));
    }

    let mut list = String::from("ffconcat version 1.0\n");
    for (element, media) in &clips {
        let source = job.sources.get(&media.source)?;
        let _ = writeln!(list, "file {}", quote_concat_path(&source.path));
        let _ = writeln!(list, "inpoint {}", format_secs(element.trim_start));
        let _ = writeln!(
            list,
            "outpoint {}",
            format_secs(element.duration - element.trim_end)
        );
    }
    Ok((list, clips.len()))
}

/// Single-quote a path for an ffconcat `file` directive.
fn quote_concat_path(path: &Path) -> String {
    format!("'{}'", path.display().to_string().replace('\'', "'\\''"))
}

/// Fit every clip onto the output canvas at the output frame rate.
pub(crate) fn normalize_filter(settings: &ExportSettings) -> String {
    let (w, h) = (settings.width, settings.height);
    format!(
        "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,setsar=1,fps={}",
        settings.fps
    )
}

fn container_args(format: OutputFormat) -> Vec<String> {
    match format {
        OutputFormat::Mp4 | OutputFormat::Mov => {
            vec!["-movflags".to_string(), "+faststart".to_string()]
        }
        OutputFormat::Webm => vec![],
    }
}

/// Encoder arguments for the output container and quality preset.
pub(crate) fn codec_args_for_settings(settings: &ExportSettings, with_audio: bool) -> Vec<String> {
    let quality = settings.quality;
    let mut args = match settings.output_format {
        OutputFormat::Mp4 | OutputFormat::Mov => vec![
            "-c:v".to_string(),
            "libx264".to_string(),
            "-preset".to_string(),
            quality.preset().to_string(),
            "-crf".to_string(),
            quality.crf().to_string(),
            "-pix_fmt".to_string(),
            if quality == Quality::Lossless {
                "yuv444p".to_string()
            } else {
                "yuv420p".to_string()
            },
        ],
        OutputFormat::Webm => {
            let mut args = vec![
                "-c:v".to_string(),
                "libvpx-vp9".to_string(),
                "-row-mt".to_string(),
                "1".to_string(),
            ];
            match quality {
                Quality::Lossless => {
                    args.extend(["-lossless".to_string(), "1".to_string()]);
                }
                _ => args.extend([
                    "-b:v".to_string(),
                    "0".to_string(),
                    "-crf".to_string(),
                    vp9_crf(quality).to_string(),
                ]),
            }
            args
        }
    };

    if with_audio {
        match settings.output_format {
            OutputFormat::Mp4 | OutputFormat::Mov => args.extend([
                "-c:a".to_string(),
                "aac".to_string(),
                "-b:a".to_string(),
                "192k".to_string(),
            ]),
            OutputFormat::Webm => args.extend([
                "-c:a".to_string(),
                "libopus".to_string(),
                "-b:a".to_string(),
                "128k".to_string(),
            ]),
        }
    }
    args.extend(container_args(settings.output_format));
    args
}

fn vp9_crf(quality: Quality) -> u8 {
    match quality {
        Quality::Draft => 40,
        Quality::Standard => 32,
        Quality::High => 24,
        Quality::Lossless => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{compile, Canvas};
    use crate::fonts::FontCatalog;
    use crate::policy::EngineDecision;
    use crate::sources::{ResolvedSource, SourceTable};
    use splice_timeline::{
        AudioPayload, Element, MediaPayload, SourceRef, TextAlign, TextPayload, Timeline,
        TimelineSnapshot, Track,
    };

    fn clip(id: &str, source: &str, start: f64, duration: f64) -> Element {
        Element::new(
            id,
            start,
            duration,
            ElementPayload::Media(MediaPayload {
                source: SourceRef::new(source),
                effects: None,
                volume: 1.0,
                muted: false,
            }),
        )
    }

    fn job(timeline: Timeline, engine: Engine) -> RenderJob {
        let sources: SourceTable = [
            ResolvedSource::video("a.mp4", "/media/a.mp4", "h264", 1920, 1080, 10.0),
            ResolvedSource::video("it's.mp4", "/media/it's.mp4", "h264", 1920, 1080, 10.0),
            ResolvedSource::audio("music.wav", "/media/music.wav", 60.0),
        ]
        .into_iter()
        .collect();
        let settings = ExportSettings::default();
        let chain = compile(&timeline, Canvas::from(&settings), &FontCatalog::default());
        let duration_secs = timeline.compute_duration();
        RenderJob {
            session_id: "s1".to_string(),
            snapshot: TimelineSnapshot::from_timeline(timeline),
            settings,
            sources,
            decision: EngineDecision {
                engine,
                reason: "test".to_string(),
                estimated_performance: engine.estimated_speed(),
            },
            chain: Some(chain),
            workspace_dir: PathBuf::from("/tmp/splice-export-s1"),
            output_path: PathBuf::from("/tmp/splice-export-s1/output.mp4"),
            duration_secs,
        }
    }

    fn backend() -> NativeBackend {
        NativeBackend::new(&EncoderConfig::default())
    }

    fn media_timeline() -> Timeline {
        let mut timeline = Timeline::new();
        timeline
            .add_track(Track::new("v1", TrackKind::Media, "Video"))
            .unwrap();
        timeline
            .add_element("v1", clip("second", "it's.mp4", 3.0, 2.0))
            .unwrap();
        timeline
            .add_element("v1", clip("first", "a.mp4", 0.0, 4.0).with_trim(1.0, 0.0))
            .unwrap();
        timeline
    }

    #[test]
    fn test_direct_copy_plan_uses_concat_and_stream_copy() {
        let plan = backend()
            .build_plan(&job(media_timeline(), Engine::NativeDirectCopy))
            .unwrap();

        assert_eq!(
            plan.concat_list,
            "ffconcat version 1.0\n\
             file '/media/a.mp4'\ninpoint 1.000000\noutpoint 4.000000\n\
             file '/media/it'\\''s.mp4'\ninpoint 0.000000\noutpoint 2.000000\n"
        );
        let args = plan.command.get_args();
        assert!(args.windows(2).any(|w| w == ["-c", "copy"]));
        assert!(!args.iter().any(|a| a == "-vf" || a == "-filter_complex"));
        assert!(args.windows(2).any(|w| w == ["-t", "5.000000"]));
        assert_eq!(args.last().unwrap(), "/tmp/splice-export-s1/output.mp4");
        assert_eq!(plan.total_frames, 150);
    }

    #[test]
    fn test_filtered_plan_separates_video_filters_and_audio_graph() {
        let mut timeline = media_timeline();
        timeline
            .add_track(Track::new("t1", TrackKind::Text, "Titles"))
            .unwrap();
        timeline
            .add_track(Track::new("a1", TrackKind::Audio, "Music"))
            .unwrap();
        timeline
            .add_element(
                "t1",
                Element::new(
                    "title",
                    0.0,
                    3.0,
                    ElementPayload::Text(TextPayload {
                        content: "Hello: World".to_string(),
                        font_family: "Sans".to_string(),
                        font_size_px: 64.0,
                        color: "#ffcc00".to_string(),
                        background_color: None,
                        x: 0.0,
                        y: 300.0,
                        rotation_degrees: 0.0,
                        text_align: TextAlign::Center,
                        font_weight: None,
                        font_style: None,
                    }),
                ),
            )
            .unwrap();
        timeline
            .add_element(
                "a1",
                Element::new(
                    "music",
                    0.0,
                    5.0,
                    ElementPayload::Audio(AudioPayload {
                        source: SourceRef::new("music.wav"),
                        volume: 0.8,
                        muted: false,
                    }),
                ),
            )
            .unwrap();

        let plan = backend()
            .build_plan(&job(timeline, Engine::NativeFiltered))
            .unwrap();
        let args = plan.command.get_args();

        let vf = &args[args.iter().position(|a| a == "-vf").unwrap() + 1];
        assert!(vf.starts_with("scale=1920:1080:force_original_aspect_ratio=decrease,"));
        assert!(vf.contains(",drawtext=font=Sans:text=Hello\\\\: World:expansion=none:"));
        assert!(!vf.contains("amix"));

        let graph = &args[args.iter().position(|a| a == "-filter_complex").unwrap() + 1];
        assert!(graph.ends_with("amix=inputs=3:duration=longest:normalize=0[aout]"));
        assert!(args.windows(2).any(|w| w == ["-map", "[aout]"]));
        assert!(args.windows(2).any(|w| w == ["-c:v", "libx264"]));
        assert!(plan.report.contains("stages=1\n"));
        assert!(plan.report.contains("engine=native_filtered\n"));
    }

    #[test]
    fn test_compositing_engine_is_rejected() {
        let err = backend()
            .build_plan(&job(media_timeline(), Engine::Compositing))
            .unwrap_err();
        assert!(matches!(err, SpliceError::Validation { .. }));
    }

    #[test]
    fn test_webm_codec_args() {
        let settings = ExportSettings::default()
            .with_format(OutputFormat::Webm)
            .with_quality(Quality::High);
        let args = codec_args_for_settings(&settings, true);
        assert!(args.windows(2).any(|w| w == ["-c:v", "libvpx-vp9"]));
        assert!(args.windows(2).any(|w| w == ["-crf", "24"]));
        assert!(args.windows(2).any(|w| w == ["-c:a", "libopus"]));
        assert!(!args.iter().any(|a| a == "-movflags"));
    }
}
