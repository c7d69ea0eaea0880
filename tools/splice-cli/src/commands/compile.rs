//! Compile command — print the filter chain a timeline compiles to.

use std::path::PathBuf;

use splice_common::config::AppConfig;
use splice_export::{compile, Canvas, FilterStage, FontCatalog};

use super::SettingsArgs;

pub fn run(
    config: &AppConfig,
    timeline_path: PathBuf,
    settings: SettingsArgs,
    json: bool,
) -> anyhow::Result<()> {
    let timeline = super::load_timeline(&timeline_path)?;
    let settings = settings.resolve(&config.export)?;
    let fonts = FontCatalog::from_config(&config.fonts);
    let chain = compile(&timeline, Canvas::from(&settings), &fonts);

    if json {
        println!("{}", serde_json::to_string_pretty(&chain)?);
        return Ok(());
    }

    println!("Filter chain: {}", timeline_path.display());
    println!("{}", "=".repeat(50));
    println!("Canvas: {}x{}", settings.width, settings.height);
    println!("Stages: {}", chain.len());

    for (index, stage) in chain.stages().iter().enumerate() {
        let window = stage.window();
        let label = match stage {
            FilterStage::Effect(_) => "effect",
            FilterStage::TextOverlay(text) if text.caption => "caption",
            FilterStage::TextOverlay(_) => "text",
        };
        println!(
            "  {:>2}. {:<8} {:<20} {:.2}s - {:.2}s",
            index + 1,
            label,
            stage.element_id(),
            window.start,
            window.end
        );
    }

    for warning in chain.warnings() {
        println!("[WARN] {warning}");
    }

    if !chain.is_empty() {
        println!();
        println!("{}", chain.to_filter_string());
    }

    Ok(())
}
