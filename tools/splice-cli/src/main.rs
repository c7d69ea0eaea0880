//! Splice CLI — Command-line interface for timeline export.
//!
//! Usage:
//!   splice export <TIMELINE> -o <OUT>   Export a timeline to video
//!   splice compile <TIMELINE>           Print the compiled filter chain
//!   splice validate <TIMELINE>          Validate a timeline document
//!   splice info <TIMELINE>              Show timeline information
//!   splice check [TIMELINE]             Check encoder capabilities

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use splice_common::config::AppConfig;

mod commands;

#[derive(Parser)]
#[command(
    name = "splice",
    about = "Export video editor timelines with ffmpeg",
    version,
    author
)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Config file (defaults to $XDG_CONFIG_HOME/splice/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Export a timeline to video
    Export {
        /// Timeline document (JSON)
        timeline: PathBuf,

        /// Output file path
        #[arg(short, long)]
        output: Option<PathBuf>,

        #[command(flatten)]
        settings: commands::SettingsArgs,

        /// Force an engine: copy, filtered, or compositing
        #[arg(long)]
        engine: Option<String>,
    },

    /// Print the filter chain compiled from a timeline
    Compile {
        /// Timeline document (JSON)
        timeline: PathBuf,

        #[command(flatten)]
        settings: commands::SettingsArgs,

        /// Print the stages as JSON
        #[arg(long)]
        json: bool,
    },

    /// Validate a timeline document and its sources
    Validate {
        /// Timeline document (JSON)
        timeline: PathBuf,
    },

    /// Show timeline information
    Info {
        /// Timeline document (JSON)
        timeline: PathBuf,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Check encoder capabilities, and the engine a timeline would use
    Check {
        /// Optional timeline document to run engine selection on
        timeline: Option<PathBuf>,

        #[command(flatten)]
        settings: commands::SettingsArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => AppConfig::load_from(path),
        None => AppConfig::load(),
    };
    if cli.verbose {
        config.logging.level = "debug".to_string();
    }
    splice_common::logging::init_logging(&config.logging);

    match cli.command {
        Commands::Export {
            timeline,
            output,
            settings,
            engine,
        } => commands::export::run(&config, timeline, output, settings, engine).await,
        Commands::Compile {
            timeline,
            settings,
            json,
        } => commands::compile::run(&config, timeline, settings, json),
        Commands::Validate { timeline } => commands::validate::run(&config, timeline),
        Commands::Info { timeline, json } => commands::info::run(timeline, json),
        Commands::Check { timeline, settings } => commands::check::run(&config, timeline, settings),
    }
}
