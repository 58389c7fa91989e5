//! CLI module for the Kiosk entitlements diagnostic tool.
//!
//! Provides a local-only command-line surface over the persisted verdict
//! cache and the policy configuration:
//!
//! - `status` - show the cached entitlement verdicts on this device
//! - `invalidate` - drop cached verdicts
//! - `config` - show or modify the reconciliation policy
//!
//! ## Usage
//!
//! ```bash
//! # Show cached verdicts
//! kiosk-entitlements status
//!
//! # JSON output for scripting
//! kiosk-entitlements status --json
//!
//! # Drop one identity's cached verdict
//! kiosk-entitlements invalidate --user alice
//!
//! # Configuration management
//! kiosk-entitlements config --list
//! kiosk-entitlements config --set policy.positive_ttl_hours=12
//! ```
//!
//! The tool never talks to the ledger or the platform store; reconciliation
//! only runs inside the app process.

pub mod commands;

pub use commands::{Cli, Commands};
