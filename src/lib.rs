//! Kiosk Entitlements - entitlement reconciliation for the Kiosk news app
//!
//! This library owns the question "is this identity currently entitled to the
//! ad-free/premium experience?". The truth about a purchase is scattered
//! across three independently-updating, independently-failing sources:
//!
//! - a fast **local cache** of the last known verdict,
//! - the backend's authoritative **purchase ledger** (possibly lagging),
//! - the **platform store**'s live transaction state (authoritative for
//!   "a purchase happened", blind to server-side revocation).
//!
//! The reconciliation engine consults them in a fixed precedence and produces
//! immutable [`EntitlementVerdict`] values; the session binding re-runs
//! reconciliation on identity changes and publishes a read-only snapshot for
//! UI consumers.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio::sync::watch;
//!
//! use kiosk_entitlements::cache::FileCache;
//! use kiosk_entitlements::config::EntitlementsConfig;
//! use kiosk_entitlements::engine::ReconciliationEngine;
//! use kiosk_entitlements::identity::SessionState;
//! use kiosk_entitlements::ledger::StubLedgerClient;
//! use kiosk_entitlements::session::SessionBinding;
//! use kiosk_entitlements::store::StubStoreClient;
//!
//! # async fn demo() {
//! let config = EntitlementsConfig::load();
//! let engine = ReconciliationEngine::new(
//!     Arc::new(FileCache::open()),
//!     Arc::new(StubLedgerClient::new()),
//!     Arc::new(StubStoreClient::new()),
//!     config.product_catalog(),
//!     config.reconcile_policy(),
//! );
//!
//! let (sessions_tx, sessions_rx) = watch::channel(SessionState::NoSession);
//! let binding = SessionBinding::spawn(engine, sessions_rx);
//! let snapshots = binding.subscribe();
//!
//! // Ad rendering reads the projection, never the sources.
//! let ad_free = snapshots.borrow().is_entitled;
//! # let _ = (sessions_tx, ad_free);
//! # }
//! ```

pub mod cache;
pub mod cli;
pub mod config;
pub mod engine;
pub mod identity;
pub mod ledger;
pub mod products;
pub mod session;
pub mod source;
pub mod store;
pub mod verdict;

// Re-exports for convenience
pub use cache::{CacheEntry, CacheError, FileCache, MemoryCache, VerdictCache};
pub use config::{ConfigError, EntitlementsConfig, PolicyConfig, ReconcilePolicy};
pub use engine::{
    PurchaseError, ReconciliationEngine, ResolveOptions, RevokeError,
};
pub use identity::{Identity, SessionState};
pub use ledger::{LedgerClient, LedgerNotification, LedgerRecord, StubLedgerClient};
pub use products::{ProductCatalog, ProductRule};
pub use session::{EntitlementSnapshot, SessionBinding, SessionError};
pub use source::SourceError;
pub use store::{PlatformTransaction, StoreClient, StubStoreClient};
pub use verdict::{EntitlementVerdict, Tier, VerdictSource};
