use clap::{Parser, Subcommand};

use std::path::PathBuf;

use crate::periods::PeriodKind;
use crate::settings::DEFAULT_CONFIG_FILE;

#[derive(Parser, Debug)]
#[command(name = "resonans")]
#[command(version, about = "Health-sensor sync and periodic rollups", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Path to config file
    #[arg(long, short = 'c', global = true, env = "RESONANS_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

#[derive(Subcommand, Clone, Debug, PartialEq, Eq)]
pub enum Commands {
    /// Run the HTTP server and background jobs (default command)
    Serve,
    /// Aggregate the default user's periods once and exit
    Aggregate {
        /// Only this period kind (week, month or year); all kinds when omitted
        #[arg(long)]
        period: Option<PeriodKind>,
    },
    /// Pull new Withings data for the default user once and exit
    Sync,
    /// Wipe the default user's events and aggregates, re-import everything and re-aggregate
    FullSync,
}

impl Cli {
    pub fn command(&self) -> Commands {
        self.command.clone().unwrap_or(Commands::Serve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serve_is_the_default_command() {
        let cli = Cli::try_parse_from(["resonans"]).unwrap();
        assert_eq!(cli.command(), Commands::Serve);
    }

    #[test]
    fn parses_subcommands_and_global_config() {
        let cli = Cli::try_parse_from(["resonans", "full-sync", "--config", "/tmp/r.json"]).unwrap();
        assert_eq!(cli.command(), Commands::FullSync);
        assert_eq!(cli.config, PathBuf::from("/tmp/r.json"));

        let cli = Cli::try_parse_from(["resonans", "-c", "x.json", "aggregate"]).unwrap();
        assert_eq!(cli.command(), Commands::Aggregate { period: None });

        let cli = Cli::try_parse_from(["resonans", "aggregate", "--period", "month"]).unwrap();
        assert_eq!(
            cli.command(),
            Commands::Aggregate {
                period: Some(PeriodKind::Month)
            }
        );
        assert!(Cli::try_parse_from(["resonans", "aggregate", "--period", "decade"]).is_err());
        assert!(Cli::try_parse_from(["resonans", "reindex"]).is_err());
    }
}
