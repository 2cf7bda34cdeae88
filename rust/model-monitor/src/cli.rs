use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "model-monitor")]
#[command(about = "Probes a model serving endpoint, detects feature drift and emits retraining triggers")]
#[command(version)]
pub struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, env = "MONITOR_CONFIG", value_name = "FILE", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the monitoring loop and the operational API (default)
    Serve,
    /// Run a single monitoring cycle and print its record
    Once,
    /// Delete history older than the retention period, or than --older-than-secs
    Purge {
        #[arg(long, value_name = "SECS")]
        older_than_secs: Option<u64>,
    },
    /// Publish a baseline JSON file ({"model_version", "features": {name: [values]}})
    ImportBaseline {
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },
    /// Mark a retraining trigger consumed
    Consume {
        #[arg(value_name = "TRIGGER_ID")]
        id: String,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default() {
        let cli = Cli::try_parse_from(["model-monitor"]).unwrap();
        assert!(cli.command.is_none());
    }

    #[test]
    fn parses_subcommands() {
        let cli = Cli::try_parse_from([
            "model-monitor",
            "purge",
            "--older-than-secs",
            "3600",
            "--config",
            "monitor.toml",
        ])
        .unwrap();
        assert_eq!(
            cli.command,
            Some(Command::Purge {
                older_than_secs: Some(3600)
            })
        );
        assert_eq!(cli.config, Some(PathBuf::from("monitor.toml")));

        let cli = Cli::try_parse_from(["model-monitor", "consume", "abc"]).unwrap();
        assert_eq!(cli.command, Some(Command::Consume { id: "abc".into() }));
    }
}
