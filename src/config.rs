//! Policy configuration for entitlement reconciliation.
//!
//! Stored in `~/.config/kiosk/entitlements.toml` (or platform equivalent).
//! The staleness window, source-call timeouts, and the set of
//! entitlement-granting products are policy values, not contract; everything
//! here can change without touching the engine.
//!
//! ## Example Config File
//!
//! ```toml
//! [policy]
//! positive_ttl_hours = 24
//! refresh_ahead_minutes = 60
//! ledger_timeout_ms = 5000
//! store_timeout_ms = 5000
//!
//! [[products]]
//! id = "premium.unlimited"
//! tier = "unlimited"
//!
//! [[products]]
//! id = "premium.monthly"
//! tier = "time_limited"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::products::{ProductCatalog, ProductRule};
use crate::verdict::Tier;

// Config file format version.
// Bump this when making breaking changes to the config structure.
const CONFIG_VERSION: u32 = 1;
const LEGACY_CONFIG_VERSION: u32 = 0;

/// Root configuration for the entitlement subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntitlementsConfig {
    /// Config file format version for migrations.
    #[serde(default = "default_config_version")]
    pub version: u32,

    /// Reconciliation policy knobs.
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Entitlement-granting products.
    #[serde(default = "default_products")]
    pub products: Vec<ProductRule>,
}

fn default_config_version() -> u32 {
    LEGACY_CONFIG_VERSION
}

/// Reconciliation policy knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// How long a positive verdict may be served from cache, in hours.
    /// Negative verdicts are never served from cache regardless of this value.
    #[serde(default = "default_positive_ttl_hours")]
    pub positive_ttl_hours: u64,

    /// A cache hit closer than this to the staleness boundary triggers a
    /// non-blocking background refresh, in minutes.
    #[serde(default = "default_refresh_ahead_minutes")]
    pub refresh_ahead_minutes: u64,

    /// Per-call timeout for ledger reads/writes, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub ledger_timeout_ms: u64,

    /// Per-call timeout for platform store queries, in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub store_timeout_ms: u64,
}

// =============================================================================
// Default Value Functions
// =============================================================================

fn default_positive_ttl_hours() -> u64 {
    24
}

fn default_refresh_ahead_minutes() -> u64 {
    60
}

fn default_timeout_ms() -> u64 {
    5000
}

fn default_products() -> Vec<ProductRule> {
    vec![
        ProductRule {
            id: "premium.unlimited".to_string(),
            tier: Tier::Unlimited,
        },
        ProductRule {
            id: "premium.monthly".to_string(),
            tier: Tier::TimeLimited,
        },
    ]
}

impl Default for EntitlementsConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            policy: PolicyConfig::default(),
            products: default_products(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            positive_ttl_hours: default_positive_ttl_hours(),
            refresh_ahead_minutes: default_refresh_ahead_minutes(),
            ledger_timeout_ms: default_timeout_ms(),
            store_timeout_ms: default_timeout_ms(),
        }
    }
}

// =============================================================================
// Configuration Loading and Saving
// =============================================================================

impl EntitlementsConfig {
    /// Get the default configuration file path.
    ///
    /// Returns platform-specific config directory:
    /// - Linux: `~/.config/kiosk/entitlements.toml`
    /// - macOS: `~/Library/Application Support/kiosk/entitlements.toml`
    /// - Windows: `%APPDATA%\kiosk\entitlements.toml`
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("kiosk")
            .join("entitlements.toml")
    }

    /// Load configuration from the default path.
    pub fn load() -> Self {
        Self::load_from(Self::default_path())
    }

    /// Load configuration from a specific path.
    ///
    /// Returns default configuration if the file doesn't exist or can't be
    /// parsed. Performs automatic migration if the config version is outdated.
    pub fn load_from(path: PathBuf) -> Self {
        match std::fs::read_to_string(&path) {
            Ok(content) => match toml::from_str::<Self>(&content) {
                Ok(mut config) => {
                    tracing::debug!("Loaded entitlements config from {:?}", path);

                    let original_version = config.version;
                    config.migrate_if_needed();

                    if config.version != original_version {
                        tracing::info!(
                            "Entitlements config migrated from version {} to {}",
                            original_version,
                            config.version
                        );
                        if let Err(e) = config.save_to(path.clone()) {
                            tracing::warn!(
                                "Failed to persist migrated config {:?}: {}",
                                path,
                                e
                            );
                        }
                    }
                    config
                }
                Err(e) => {
                    tracing::warn!("Failed to parse entitlements config at {:?}: {}", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                tracing::debug!("No entitlements config at {:?}, using defaults", path);
                Self::default()
            }
        }
    }

    /// Migrate config to the latest version if needed.
    fn migrate_if_needed(&mut self) {
        match self.version {
            0 => {
                // Migration from unversioned (v0) to v1: older builds shipped
                // without product rules; restore the defaults so an empty list
                // doesn't lock every user out of their purchase.
                if self.products.is_empty() {
                    tracing::info!("Migrating config: restoring default product rules");
                    self.products = default_products();
                }
                self.version = CONFIG_VERSION;
            }
            CONFIG_VERSION => {
                // Current version - no migration needed.
            }
            _ => {
                tracing::warn!(
                    "Entitlements config version {} is newer than supported version {}. Some settings may be ignored.",
                    self.version,
                    CONFIG_VERSION
                );
            }
        }
    }

    /// Save configuration to the default path.
    pub fn save(&self) -> std::io::Result<()> {
        self.save_to(Self::default_path())
    }

    /// Save configuration to a specific path, creating parent directories.
    pub fn save_to(&self, path: PathBuf) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        std::fs::write(&path, content)?;
        tracing::debug!("Saved entitlements config to {:?}", path);

        Ok(())
    }

    /// Get a configuration value by key path, e.g. `policy.positive_ttl_hours`.
    pub fn get(&self, key: &str) -> Option<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["policy", "positive_ttl_hours"] => Some(self.policy.positive_ttl_hours.to_string()),
            ["policy", "refresh_ahead_minutes"] => {
                Some(self.policy.refresh_ahead_minutes.to_string())
            }
            ["policy", "ledger_timeout_ms"] => Some(self.policy.ledger_timeout_ms.to_string()),
            ["policy", "store_timeout_ms"] => Some(self.policy.store_timeout_ms.to_string()),
            _ => None,
        }
    }

    /// Set a configuration value by key path.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["policy", "positive_ttl_hours"] => {
                self.policy.positive_ttl_hours = parse_positive(key, value)?;
            }
            ["policy", "refresh_ahead_minutes"] => {
                self.policy.refresh_ahead_minutes = parse_positive(key, value)?;
            }
            ["policy", "ledger_timeout_ms"] => {
                self.policy.ledger_timeout_ms = parse_positive(key, value)?;
            }
            ["policy", "store_timeout_ms"] => {
                self.policy.store_timeout_ms = parse_positive(key, value)?;
            }
            _ => {
                return Err(ConfigError::UnknownKey(key.to_string()));
            }
        }

        Ok(())
    }

    /// List all scalar configuration keys with their current values.
    pub fn list(&self) -> Vec<(String, String)> {
        vec![
            (
                "policy.positive_ttl_hours".to_string(),
                self.policy.positive_ttl_hours.to_string(),
            ),
            (
                "policy.refresh_ahead_minutes".to_string(),
                self.policy.refresh_ahead_minutes.to_string(),
            ),
            (
                "policy.ledger_timeout_ms".to_string(),
                self.policy.ledger_timeout_ms.to_string(),
            ),
            (
                "policy.store_timeout_ms".to_string(),
                self.policy.store_timeout_ms.to_string(),
            ),
        ]
    }

    /// Engine-facing resolved form of this configuration.
    pub fn reconcile_policy(&self) -> ReconcilePolicy {
        ReconcilePolicy {
            positive_ttl: Duration::from_secs(self.policy.positive_ttl_hours * 60 * 60),
            refresh_ahead: Duration::from_secs(self.policy.refresh_ahead_minutes * 60),
            ledger_timeout: Duration::from_millis(self.policy.ledger_timeout_ms),
            store_timeout: Duration::from_millis(self.policy.store_timeout_ms),
        }
    }

    /// Product catalog built from the configured rules.
    pub fn product_catalog(&self) -> ProductCatalog {
        ProductCatalog::from_rules(&self.products)
    }
}

fn parse_positive(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
        expected: "positive integer".to_string(),
    })
}

/// Resolved policy handed to the reconciliation engine.
#[derive(Debug, Clone)]
pub struct ReconcilePolicy {
    /// Staleness window for positive cached verdicts.
    pub positive_ttl: Duration,
    /// Margin before the staleness boundary that triggers background refresh.
    pub refresh_ahead: Duration,
    pub ledger_timeout: Duration,
    pub store_timeout: Duration,
}

impl Default for ReconcilePolicy {
    fn default() -> Self {
        EntitlementsConfig::default().reconcile_policy()
    }
}

// =============================================================================
// Errors
// =============================================================================

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("Invalid value for {key}: '{value}' (expected {expected})")]
    InvalidValue {
        key: String,
        value: String,
        expected: String,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Tests
// =============================================================================
