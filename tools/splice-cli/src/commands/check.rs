//! Check encoder capabilities and, optionally, the engine a timeline selects.

use std::path::{Path, PathBuf};

use splice_common::config::AppConfig;
use splice_export::sources::resolve_all;
use splice_export::{select, CancelFlag, EnvironmentCapabilities, FsSourceResolver};

use super::SettingsArgs;

pub fn run(
    config: &AppConfig,
    timeline_path: Option<PathBuf>,
    settings: SettingsArgs,
) -> anyhow::Result<()> {
    println!("Splice Export Check");
    println!("{}", "=".repeat(50));

    let caps = EnvironmentCapabilities::detect(&config.encoder);

    match &caps.ffmpeg {
        Some(path) => println!("[OK] ffmpeg: {}", path.display()),
        None => println!(
            "[WARN] ffmpeg not found ({}); only the software compositor is available",
            config.encoder.ffmpeg_path.display()
        ),
    }
    match &caps.ffprobe {
        Some(path) => println!("[OK] ffprobe: {}", path.display()),
        None => println!("[WARN] ffprobe not found; sources will not be probed"),
    }
    if caps.has_encoder() {
        if caps.drawtext {
            println!("[OK] drawtext filter available");
        } else {
            println!("[WARN] drawtext filter missing; text forces the compositor");
        }
        for encoder in ["libx264", "libvpx-vp9", "aac", "libopus"] {
            if caps.has_video_encoder(encoder) {
                println!("[OK] Encoder: {encoder}");
            } else {
                println!("[WARN] Encoder missing: {encoder}");
            }
        }
    }
    println!("[OK] Temp root: {}", config.temp_root.display());

    let Some(timeline_path) = timeline_path else {
        return Ok(());
    };

    println!();
    println!("Engine selection: {}", timeline_path.display());
    let timeline = super::load_timeline(&timeline_path)?;
    let settings = settings.resolve(&config.export)?;
    let resolver = FsSourceResolver::new(
        timeline_path.parent().map(Path::to_path_buf),
        caps.ffprobe.clone(),
    );
    let sources = resolve_all(&timeline, &resolver, &CancelFlag::new())?;
    let decision = select(&timeline, &settings, &sources, &caps, None)?;

    println!("  Engine: {}", decision.engine);
    println!("  Reason: {}", decision.reason);
    println!(
        "  Estimated speed: {:.2}x realtime",
        decision.estimated_performance
    );

    Ok(())
}
