// SPDX-License-Identifier: GPL-3.0-only

use clap::{Parser, Subcommand};
use mplane_camera::Resolution;
use std::path::PathBuf;

mod cli;

#[derive(Parser)]
#[command(name = "mplane-camera")]
#[command(about = "Capture from a multi-planar V4L2 camera")]
#[command(version = env!("GIT_VERSION"))]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List video devices
    List,

    /// Print the recognized options and their defaults
    Properties,

    /// Run a capture session
    Run {
        /// Video device node (default from the settings file)
        #[arg(short, long)]
        device: Option<String>,

        /// Resolution: 640x480, 1280x720 or 1920x1080
        #[arg(short, long)]
        resolution: Option<Resolution>,

        /// Stop after this many capture ticks (default: run until Ctrl+C)
        #[arg(short = 'n', long)]
        frames: Option<u64>,

        /// Capture ticks per second
        #[arg(long, default_value = "30")]
        fps: u32,

        /// Use generated video and audio instead of hardware
        #[arg(long)]
        synthetic: bool,

        /// Disable audio capture
        #[arg(long)]
        no_audio: bool,

        /// Save the last frame as an image file
        #[arg(short, long)]
        snapshot: Option<PathBuf>,

        /// Settings file (default: ~/.config/mplane-camera/settings.json)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    // Set RUST_LOG environment variable to control log level
    // Examples: RUST_LOG=debug, RUST_LOG=mplane_camera=debug, RUST_LOG=info
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_target(true)
        .with_level(true)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::List => cli::list_devices(),
        Commands::Properties => cli::print_properties(),
        Commands::Run {
            device,
            resolution,
            frames,
            fps,
            synthetic,
            no_audio,
            snapshot,
            config,
        } => cli::run(cli::RunOptions {
            device,
            resolution,
            frames,
            fps,
            synthetic,
            no_audio,
            snapshot,
            config,
        }),
    }
}
