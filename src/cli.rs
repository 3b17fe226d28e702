//! Command-line definitions (clap derive)

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Splatforge - photos in, Gaussian splat model out
#[derive(Parser, Debug)]
#[command(
    name = "splatforge",
    author,
    version,
    about = "Provision a GPU host and turn a photo set into a Gaussian splat model",
    after_help = "Examples:\n    \
                  splatforge run\n    \
                  splatforge run --preset fast --set train.iterations=5000\n    \
                  splatforge status --json\n    \
                  splatforge config --explain matching.strategy"
)]
pub struct Cli {
    /// Workspace directory (defaults to the nearest initialized ancestor or the current directory)
    #[arg(long, short = 'w', global = true, env = "SPLATFORGE_WORKSPACE")]
    pub workspace: Option<PathBuf>,

    /// Configuration file (defaults to splatforge.conf in the workspace, if present)
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    /// Echo debug output to the terminal
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Provision the host if needed, then run the reconstruction pipeline
    Run {
        /// Named preset applied before --set overrides
        #[arg(long, short = 'p')]
        preset: Option<String>,

        /// Override a configuration key (repeatable)
        #[arg(long = "set", short = 's', value_name = "KEY=VALUE")]
        set: Vec<String>,
    },

    /// Check every provisioning phase without executing anything
    Verify,

    /// Summarize workspace health and the most recent run
    Status {
        /// Machine-readable output
        #[arg(long)]
        json: bool,
    },

    /// Remove intermediate stage and build files (phase markers and outputs are kept)
    Cleanup,

    /// Show resolved configuration with the layer each value came from
    Config {
        /// Write the resolved values to the configuration file
        #[arg(long)]
        persist: bool,

        /// List available presets
        #[arg(long)]
        presets: bool,

        /// Describe one key
        #[arg(long, value_name = "KEY")]
        explain: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_collects_repeated_overrides() {
        let cli = Cli::try_parse_from([
            "splatforge",
            "-w",
            "/tmp/ws",
            "run",
            "--preset",
            "fast",
            "--set",
            "train.iterations=5000",
            "-s",
            "matching.overlap=5",
        ])
        .unwrap();
        assert_eq!(cli.workspace, Some(PathBuf::from("/tmp/ws")));
        match cli.command {
            Commands::Run { preset, set } => {
                assert_eq!(preset.as_deref(), Some("fast"));
                assert_eq!(set, vec!["train.iterations=5000", "matching.overlap=5"]);
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from(["splatforge", "status", "--json", "-v"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }
}
