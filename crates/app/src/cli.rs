use std::{net::SocketAddr, path::PathBuf};

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use vision::SegmentCliArgs;

use crate::segment;

/// Unseen-object instance segmentation over recorded RGB-D sessions.
#[derive(Debug, Parser)]
#[command(name = "rgbd-seg", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Pair, segment and republish a recorded RGB-D session.
    Segment(SegmentArgs),
}

#[derive(Debug, Args)]
pub struct SegmentArgs {
    #[command(flatten)]
    pub pipeline: SegmentCliArgs,
    /// Serve an HTTP preview of the outputs on this address (e.g. 127.0.0.1:8080).
    #[arg(long = "preview", value_name = "ADDR")]
    pub preview: Option<SocketAddr>,
    /// Also write every published image as PNG under this directory.
    #[arg(long = "dump-dir", value_name = "DIR")]
    pub dump_dir: Option<PathBuf>,
}

pub fn handle_commands(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Segment(args) => segment::run_from_args(args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segment_accepts_pipeline_and_sink_flags() {
        let cli = Cli::try_parse_from([
            "rgbd-seg",
            "segment",
            "recording",
            "--model",
            "seg.pt",
            "--refine-model",
            "crop.pt",
            "--preview",
            "127.0.0.1:8080",
            "--dump-dir",
            "out",
        ])
        .unwrap();
        let Command::Segment(args) = cli.command;
        assert_eq!(args.pipeline.recording, Some(PathBuf::from("recording")));
        assert_eq!(args.pipeline.refine_model, Some(PathBuf::from("crop.pt")));
        assert_eq!(args.preview.map(|a| a.port()), Some(8080));
        assert_eq!(args.dump_dir, Some(PathBuf::from("out")));
    }

    #[test]
    fn bad_preview_address_is_a_usage_error() {
        assert!(Cli::try_parse_from(["rgbd-seg", "segment", "--preview", "nowhere"]).is_err());
    }
}
