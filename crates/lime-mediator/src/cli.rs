//! Clap CLI definitions for the LIME mediator.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
\x1b[1;36mExamples:\x1b[0m
  lime-mediator run                         Start the mediator with ~/.lime/mediator.toml
  lime-mediator run --config ./lime.toml    Start with an explicit config file
  lime-mediator check-config                Validate config and certificates
  lime-mediator thumbprint agent.pem        Print thumbprints for [[agents]] entries";

/// LIME mediator: the endpoint agents connect to.
#[derive(Parser, Debug)]
#[command(name = "lime-mediator", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the mediator and serve agents until Ctrl+C.
    Run,
    /// Load and validate the configuration and TLS material, then exit.
    CheckConfig,
    /// Print the thumbprint of every certificate in a PEM file.
    Thumbprint {
        /// PEM file to read.
        pem: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_with_flags() {
        let cli = Cli::parse_from(["lime-mediator", "run", "--config", "/tmp/m.toml", "--log-json"]);
        assert!(matches!(cli.command, Commands::Run));
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/m.toml")));
        assert!(cli.log_json);
    }

    #[test]
    fn test_parse_thumbprint() {
        let cli = Cli::parse_from(["lime-mediator", "thumbprint", "agent.pem"]);
        match cli.command {
            Commands::Thumbprint { pem } => assert_eq!(pem, PathBuf::from("agent.pem")),
            other => panic!("unexpected command {other:?}"),
        }
    }
}
