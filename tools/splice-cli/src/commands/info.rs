//! Show timeline information.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;
use splice_timeline::Timeline;

#[derive(Debug, Serialize)]
struct TrackSummary {
    id: String,
    name: String,
    kind: String,
    elements: usize,
    hidden: usize,
}

#[derive(Debug, Serialize)]
struct TimelineSummary {
    version: String,
    duration_secs: f64,
    tracks: Vec<TrackSummary>,
    elements_by_kind: BTreeMap<String, usize>,
}

impl TimelineSummary {
    fn from_timeline(timeline: &Timeline) -> Self {
        let tracks = timeline
            .tracks()
            .iter()
            .map(|track| TrackSummary {
                id: track.id().to_string(),
                name: track.name().to_string(),
                kind: track.kind().as_str().to_string(),
                elements: track.elements().len(),
                hidden: track.elements().iter().filter(|e| e.hidden).count(),
            })
            .collect();

        let mut elements_by_kind = BTreeMap::new();
        for active in timeline.elements() {
            *elements_by_kind
                .entry(active.track_kind.as_str().to_string())
                .or_insert(0) += 1;
        }

        Self {
            version: timeline.version.clone(),
            duration_secs: timeline.compute_duration(),
            tracks,
            elements_by_kind,
        }
    }
}

pub fn run(path: PathBuf, json: bool) -> anyhow::Result<()> {
    let timeline = super::load_timeline(&path)?;
    let summary = TimelineSummary::from_timeline(&timeline);

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    println!("Timeline: {}", path.display());
    println!("  Version: {}", summary.version);
    println!("  Duration: {:.2}s", summary.duration_secs);
    println!();

    println!("Tracks (bottom to top):");
    for track in &summary.tracks {
        println!(
            "  {} [{}] \"{}\": {} element(s){}",
            track.id,
            track.kind,
            track.name,
            track.elements,
            if track.hidden > 0 {
                format!(", {} hidden", track.hidden)
            } else {
                String::new()
            }
        );
    }
    println!();

    println!("Elements:");
    for (kind, count) in &summary.elements_by_kind {
        println!("  {kind}: {count}");
    }

    Ok(())
}
