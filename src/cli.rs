//! CLI argument parsing using clap v4
//!
//! Defines the command-line interface for the shoal worker.

use clap::{Parser, Subcommand};

/// Shoal Worker - peer-to-peer worker framework
///
/// Joins a shoal of workers, accepts worker-socket and worker-group
/// handshakes from its peers, and serves the commissions it belongs to.
#[derive(Parser, Debug)]
#[command(name = "shoal-worker")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Increase logging verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for the worker
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the worker until interrupted
    Run {
        /// Path to configuration file
        #[arg(short, long, env = "SHOAL_CONFIG")]
        config: Option<String>,
    },

    /// Display version and build information
    Version,

    /// Configuration management
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Global random seed management
    Seed {
        #[command(subcommand)]
        subcommand: SeedSubcommand,
    },
}

/// Configuration subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Display the current configuration
    Show {
        /// Path to configuration file
        #[arg(short, long)]
        config: Option<String>,
    },

    /// Initialize a new configuration file
    Init {
        /// Path where to create the config file
        #[arg(short, long)]
        path: Option<String>,

        /// Overwrite existing configuration
        #[arg(short, long)]
        force: bool,
    },

    /// Validate a configuration file
    Validate {
        /// Path to configuration file to validate
        #[arg(short, long)]
        config: Option<String>,
    },
}

/// Seed subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum SeedSubcommand {
    /// Write a fresh random seed; every worker of a shoal imports the same file
    Generate {
        /// Where to write the seed
        #[arg(short, long)]
        output: String,

        /// Overwrite an existing file
        #[arg(short, long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_run_command() {
        let cli = Cli::parse_from(["shoal-worker", "run"]);
        match cli.command {
            Commands::Run { config } => assert!(config.is_none()),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_run_with_config() {
        let cli = Cli::parse_from(["shoal-worker", "run", "--config", "/etc/shoal/worker.toml"]);
        match cli.command {
            Commands::Run { config } => {
                assert_eq!(config, Some("/etc/shoal/worker.toml".to_string()));
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_verbose_flags() {
        let cli = Cli::parse_from(["shoal-worker", "-vv", "version"]);
        assert_eq!(cli.verbose, 2);
        assert!(!cli.quiet);
    }

    #[test]
    fn test_quiet_flag() {
        let cli = Cli::parse_from(["shoal-worker", "--quiet", "version"]);
        assert!(cli.quiet);
    }

    #[test]
    fn test_config_init() {
        let cli = Cli::parse_from(["shoal-worker", "config", "init", "--force"]);
        match cli.command {
            Commands::Config {
                subcommand: ConfigSubcommand::Init { path, force },
            } => {
                assert!(path.is_none());
                assert!(force);
            }
            _ => panic!("Expected Config Init command"),
        }
    }

    #[test]
    fn test_seed_generate() {
        let cli = Cli::parse_from(["shoal-worker", "seed", "generate", "--output", "shoal.seed"]);
        match cli.command {
            Commands::Seed {
                subcommand: SeedSubcommand::Generate { output, force },
            } => {
                assert_eq!(output, "shoal.seed");
                assert!(!force);
            }
            _ => panic!("Expected Seed Generate command"),
        }
    }

    #[test]
    fn test_seed_generate_requires_output() {
        assert!(Cli::try_parse_from(["shoal-worker", "seed", "generate"]).is_err());
    }
}
