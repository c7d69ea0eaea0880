//! Audio mix graph shared by the native and compositing paths.
//!
//! Audio never goes through the per-stream video filter list. Each audible
//! element becomes its own encoder input, trimmed, gain-adjusted and delayed
//! to its timeline position, then mixed into a single `[aout]` stream by a
//! separate `-filter_complex` graph.

use std::path::PathBuf;

use splice_common::clock::format_secs;
use splice_common::error::SpliceResult;
use splice_timeline::{ElementPayload, Timeline};

use crate::filter::fmt_num;
use crate::sources::SourceTable;

/// Output label of the mixed audio stream.
pub const AUDIO_OUT_LABEL: &str = "[aout]";

/// Extra encoder inputs plus the graph that mixes them.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioMix {
    /// Files to pass as `-i`, in input order.
    pub inputs: Vec<PathBuf>,

    /// `-filter_complex` value producing [`AUDIO_OUT_LABEL`]; `None` when silent.
    pub graph: Option<String>,
}

impl AudioMix {
    pub fn is_silent(&self) -> bool {
        self.graph.is_none()
    }

    /// Arguments adding the inputs; must follow the video input(s).
    pub fn input_args(&self) -> Vec<String> {
        self.inputs
            .iter()
            .flat_map(|path| ["-i".to_string(), path.display().to_string()])
            .collect()
    }
}

/// Build the mix for every audible element. `first_input` is the encoder
/// input index of the first audio file.
pub fn plan_audio(
    timeline: &Timeline,
    sources: &SourceTable,
    first_input: usize,
) -> SpliceResult<AudioMix> {
    let mut mix = AudioMix::default();
    let mut chains = Vec::new();

    for active in timeline.elements().filter(|a| !a.element.hidden) {
        let element = active.element;
        let (source_ref, volume, muted) = match &element.payload {
            ElementPayload::Audio(audio) => (&audio.source, audio.volume, audio.muted),
            ElementPayload::Media(media) => (&media.source, media.volume, media.muted),
            _ => continue,
        };
        if muted || volume <= 0.0 {
            continue;
        }
        let source = sources.get(source_ref)?;
        if !source.has_audio {
            continue;
        }

        let input = first_input + mix.inputs.len();
        let label = format!("[a{}]", chains.len());
        let window = element.visible_window();
        let delay_ms = (window.start * 1000.0).round() as u64;
        chains.push((
            format!(
                "[{input}:a]atrim=start={}:end={},asetpts=PTS-STARTPTS,volume={},adelay={delay_ms}:all=1",
                format_secs(element.trim_start),
                format_secs(element.duration - element.trim_end),
                fmt_num(volume),
            ),
            label,
        ));
        mix.inputs.push(source.path.clone());
    }

    mix.graph = match chains.len() {
        0 => None,
        1 => Some(format!("{}{AUDIO_OUT_LABEL}", chains[0].0)),
        n => {
            let mut parts: Vec<String> = chains
                .iter()
                .map(|(chain, label)| format!("{chain}{label}"))
                .collect();
            let labels: String = chains.iter().map(|(_, label)| label.as_str()).collect();
            parts.push(format!(
                "{labels}amix=inputs={n}:duration=longest:normalize=0{AUDIO_OUT_LABEL}"
            ));
            Some(parts.join(";"))
        }
    };

    tracing::debug!(inputs = mix.inputs.len(), "Audio mix planned");
    Ok(mix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sources::ResolvedSource;
    use splice_timeline::{AudioPayload, Element, MediaPayload, SourceRef, Track, TrackKind};

    fn timeline() -> Timeline {
        let mut timeline = Timeline::new();
        timeline
            .add_track(Track::new("v1", TrackKind::Media, "Video"))
            .unwrap();
        timeline
            .add_track(Track::new("a1", TrackKind::Audio, "Music"))
            .unwrap();
        timeline
            .add_element(
                "v1",
                Element::new(
                    "clip",
                    0.0,
                    4.0,
                    ElementPayload::Media(MediaPayload {
                        source: SourceRef::new("clip.mp4"),
                        effects: None,
                        volume: 1.0,
                        muted: false,
                    }),
                ),
            )
            .unwrap();
        timeline
    }

    fn sources() -> SourceTable {
        [
            ResolvedSource::video("clip.mp4", "/m/clip.mp4", "h264", 1920, 1080, 4.0),
            ResolvedSource::audio("music.wav", "/m/music.wav", 30.0),
        ]
        .into_iter()
        .collect()
    }

    fn music(volume: f64, muted: bool) -> Element {
        Element::new(
            "music",
            1.0,
            10.0,
            ElementPayload::Audio(AudioPayload {
                source: SourceRef::new("music.wav"),
                volume,
                muted,
            }),
        )
        .with_trim(0.5, 2.0)
    }

    #[test]
    fn test_single_clip_maps_directly_to_aout() {
        let mix = plan_audio(&timeline(), &sources(), 1).unwrap();
        assert_eq!(mix.inputs, vec![PathBuf::from("/m/clip.mp4")]);
        assert_eq!(
            mix.graph.unwrap(),
            "[1:a]atrim=start=0.000000:end=4.000000,asetpts=PTS-STARTPTS,volume=1,adelay=0:all=1[aout]"
        );
    }

    #[test]
    fn test_audio_element_is_trimmed_delayed_and_mixed() {
        let mut timeline = timeline();
        timeline.add_element("a1", music(0.5, false)).unwrap();

        let mix = plan_audio(&timeline, &sources(), 1).unwrap();
        assert_eq!(mix.inputs.len(), 2);
        let graph = mix.graph.clone().unwrap();
        assert!(graph.contains(
            "[2:a]atrim=start=0.500000:end=8.000000,asetpts=PTS-STARTPTS,volume=0.5,adelay=1500:all=1[a1]"
        ));
        assert!(graph.ends_with("[a0][a1]amix=inputs=2:duration=longest:normalize=0[aout]"));
        assert_eq!(
            mix.input_args(),
            vec!["-i", "/m/clip.mp4", "-i", "/m/music.wav"]
        );
    }

    #[test]
    fn test_muted_audio_is_skipped() {
        let mut timeline = timeline();
        timeline.add_element("a1", music(1.0, true)).unwrap();
        let mix = plan_audio(&timeline, &sources(), 1).unwrap();
        assert_eq!(mix.inputs.len(), 1);
    }

    #[test]
    fn test_silent_timeline_has_no_graph() {
        let mut timeline = Timeline::new();
        timeline
            .add_track(Track::new("a1", TrackKind::Audio, "Music"))
            .unwrap();
        let mix = plan_audio(&timeline, &SourceTable::new(), 1).unwrap();
        assert!(mix.is_silent());
        assert!(mix.input_args().is_empty());
    }
}
