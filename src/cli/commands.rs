//! CLI command definitions.
//!
//! Defines all CLI commands and arguments using clap derive macros.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Kiosk entitlements - local diagnostic tool
#[derive(Parser, Debug)]
#[command(name = "kiosk-entitlements")]
#[command(about = "Inspect and manage the on-device entitlement state", long_about = None)]
#[command(version)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the policy configuration file
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Path to the verdict cache file
    #[arg(long, global = true)]
    pub cache: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

/// Available commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Show the cached entitlement verdicts on this device
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Drop cached verdicts
    Invalidate {
        /// Drop only the cached verdict for this signed-in user id
        #[arg(long, conflicts_with = "guest")]
        user: Option<String>,

        /// Drop only the cached verdict for this guest id
        #[arg(long, conflicts_with = "user")]
        guest: Option<String>,
    },

    /// Show or modify the reconciliation policy
    Config {
        /// List all configuration keys and values
        #[arg(long)]
        list: bool,

        /// Get a configuration value, e.g. `policy.positive_ttl_hours`
        #[arg(long, value_name = "KEY")]
        get: Option<String>,

        /// Set a configuration value, e.g. `policy.positive_ttl_hours=12`
        #[arg(long, value_name = "KEY=VALUE")]
        set: Option<String>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_status() {
        let cli = Cli::try_parse_from(["kiosk-entitlements", "status", "--json"]).unwrap();
        assert!(matches!(cli.command, Commands::Status { json: true }));
    }

    #[test]
    fn cli_parses_invalidate_user() {
        let cli =
            Cli::try_parse_from(["kiosk-entitlements", "invalidate", "--user", "alice"]).unwrap();
        match cli.command {
            Commands::Invalidate { user, guest } => {
                assert_eq!(user.as_deref(), Some("alice"));
                assert!(guest.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn invalidate_rejects_user_and_guest_together() {
        let result = Cli::try_parse_from([
            "kiosk-entitlements",
            "invalidate",
            "--user",
            "alice",
            "--guest",
            "g1",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn cli_parses_config_set() {
        let cli = Cli::try_parse_from([
            "kiosk-entitlements",
            "config",
            "--set",
            "policy.positive_ttl_hours=12",
        ])
        .unwrap();
        match cli.command {
            Commands::Config { set, .. } => {
                assert_eq!(set.as_deref(), Some("policy.positive_ttl_hours=12"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
