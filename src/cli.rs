use clap::Parser;
use std::path::PathBuf;

use crate::config::{RunMode, DEFAULT_CONFIG_FILE};

#[derive(Parser, Debug)]
#[command(name = "parley")]
#[command(version = "0.1.0")]
#[command(about = "Deep Q-learning policy server for negotiation simulators", long_about = None)]
pub struct Cli {
    /// Execution mode
    #[arg(value_enum, default_value_t = RunMode::Test)]
    pub mode: RunMode,

    /// Config file path
    #[arg(short, long, env = "PARLEY_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_to_test_mode() {
        let cli = Cli::try_parse_from(["parley"]).unwrap();
        assert_eq!(cli.mode, RunMode::Test);
        assert_eq!(cli.config, PathBuf::from(DEFAULT_CONFIG_FILE));
    }

    #[test]
    fn test_train_with_config() {
        let cli = Cli::try_parse_from(["parley", "train", "--config", "/etc/parley.txt"]).unwrap();
        assert_eq!(cli.mode, RunMode::Train);
        assert_eq!(cli.config, PathBuf::from("/etc/parley.txt"));
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!(Cli::try_parse_from(["parley", "evaluate"]).is_err());
    }
}
