//! Validate a timeline document and the sources it references.

use std::path::{Path, PathBuf};

use splice_common::config::AppConfig;
use splice_export::{FsSourceResolver, SourceResolver};

pub fn run(config: &AppConfig, path: PathBuf) -> anyhow::Result<()> {
    println!("Validating timeline at: {}", path.display());

    let timeline = super::load_timeline(&path)?;

    println!("  Version: {}", timeline.version);
    println!("  Tracks: {}", timeline.tracks().len());
    println!("  Elements: {}", timeline.elements().count());
    println!("  Duration: {:.2}s", timeline.compute_duration());

    let ffprobe = Some(config.encoder.ffprobe_path.clone());
    let resolver = FsSourceResolver::new(path.parent().map(Path::to_path_buf), ffprobe);

    let mut errors = Vec::new();
    let mut checked = std::collections::BTreeSet::new();
    for active in timeline.elements().filter(|a| !a.element.hidden) {
        for reference in active.element.payload.sources() {
            if !checked.insert(reference.as_str().to_string()) {
                continue;
            }
            if let Err(e) = resolver.resolve(reference) {
                errors.push(format!("{} ({}): {e}", active.element.id, reference.as_str()));
            }
        }
    }

    if timeline.compute_duration() <= 0.0 {
        errors.push("timeline has no visible content".to_string());
    }

    if errors.is_empty() {
        println!("  Sources: All present ({})", checked.len());
        println!("\nTimeline is valid.");
    } else {
        println!("\nValidation issues:");
        for error in &errors {
            println!("  - {error}");
        }
        println!(
            "\n{} issue(s) found. Timeline cannot be exported as-is.",
            errors.len()
        );
    }

    Ok(())
}
