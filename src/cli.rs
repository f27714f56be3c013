use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "voxgate",
    version,
    about = "Real-time voice activity detection with per-environment calibration"
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Sample the environment and store detection thresholds
    Calibrate {
        /// Replay a WAV file instead of capturing from the microphone
        #[arg(short, long)]
        input: Option<PathBuf>,
    },

    /// Detect speech until Ctrl+C (default if no subcommand)
    Detect {
        /// Replay a WAV file instead of capturing from the microphone
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Write every emitted chunk to this directory as a WAV file
        #[arg(long)]
        save_chunks: Option<PathBuf>,
    },

    /// Report speech segments in a WAV file without real-time pacing
    Analyze {
        wav: PathBuf,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the stored thresholds
    Thresholds,

    /// List input devices
    Devices,

    /// Print a default config file with documentation
    Config,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_subcommand_parses() {
        let cli = Cli::try_parse_from(["voxgate"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn test_detect_with_options() {
        let cli = Cli::try_parse_from([
            "voxgate",
            "detect",
            "--input",
            "talk.wav",
            "--save-chunks",
            "out",
            "--config",
            "vg.toml",
        ])
        .unwrap();
        assert_eq!(cli.config, Some(PathBuf::from("vg.toml")));
        match cli.command {
            Some(Commands::Detect { input, save_chunks }) => {
                assert_eq!(input, Some(PathBuf::from("talk.wav")));
                assert_eq!(save_chunks, Some(PathBuf::from("out")));
            }
            other => panic!("Expected Detect, got {:?}", other),
        }
    }

    #[test]
    fn test_analyze_requires_file() {
        assert!(Cli::try_parse_from(["voxgate", "analyze"]).is_err());
    }
}
