//! Entitlement reconciliation engine.
//!
//! Owns the question "is this identity currently entitled?". The truth about a
//! purchase is scattered across three independently-updating sources (the
//! local verdict cache, the server-side purchase ledger, and the platform
//! store) and the engine collapses them into one verdict per resolve, using a
//! fixed precedence:
//!
//! 1. No identity: denied, source `Default`, no source calls.
//! 2. Fresh positive cache hit: served immediately, with a non-blocking
//!    background refresh when close to the staleness boundary. Negative
//!    cached verdicts are never served.
//! 3. Ledger: an active, unexpired record is authoritative.
//! 4. Platform store: an active recognized transaction is ground truth for
//!    "a purchase exists" and is pushed back to the ledger (self-healing
//!    write-back). An unreachable store degrades to the last cached verdict
//!    if one is still servable, else to a denied `Default` verdict.
//!
//! `resolve` never errors: ad gating and paywall UI must always get an answer.
//! `revoke` is the exception: a user-initiated revocation that cannot reach
//! the ledger must surface, not fail silently.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::cache::{CacheEntry, VerdictCache};
use crate::config::ReconcilePolicy;
use crate::identity::Identity;
use crate::ledger::{LedgerClient, LedgerNotification, LedgerRecord};
use crate::products::ProductCatalog;
use crate::source::SourceError;
use crate::store::{PlatformTransaction, StoreClient};
use crate::verdict::{now_ms, EntitlementVerdict, Tier, VerdictSource};

/// Options for a single resolve call.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Skip the cache and re-consult the authoritative sources.
    pub force_refresh: bool,
}

impl ResolveOptions {
    pub fn forced() -> Self {
        Self {
            force_refresh: true,
        }
    }
}

/// Errors surfaced by `revoke`.
#[derive(Debug, Error)]
pub enum RevokeError {
    #[error("Ledger unreachable during revocation: {0}")]
    Ledger(#[from] SourceError),
}

/// Errors surfaced by the purchase/restore flows.
#[derive(Debug, Error)]
pub enum PurchaseError {
    #[error("Platform store call failed: {0}")]
    Store(#[from] SourceError),

    #[error("Product '{0}' is not entitlement-granting")]
    UnknownProduct(String),
}

/// The reconciliation engine.
///
/// One instance per process; cheap to share behind an `Arc`. All mutable
/// state is interior: the in-flight dedup map and the last-resolved identity.
pub struct ReconciliationEngine {
    cache: Arc<dyn VerdictCache>,
    ledger: Arc<dyn LedgerClient>,
    store: Arc<dyn StoreClient>,
    catalog: ProductCatalog,
    policy: ReconcilePolicy,
    /// Waiters attached to the in-flight reconciliation, per identity key.
    /// Presence of a key means a leader is currently reconciling it.
    inflight: parking_lot::Mutex<HashMap<String, Vec<oneshot::Sender<EntitlementVerdict>>>>,
    /// Identity of the most recent resolve, so a no-identity resolve can
    /// clear the verdict cached for it.
    last_identity: parking_lot::Mutex<Option<Identity>>,
    /// Back-reference for spawning background refreshes.
    weak: Weak<ReconciliationEngine>,
}

impl ReconciliationEngine {
    pub fn new(
        cache: Arc<dyn VerdictCache>,
        ledger: Arc<dyn LedgerClient>,
        store: Arc<dyn StoreClient>,
        catalog: ProductCatalog,
        policy: ReconcilePolicy,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            cache,
            ledger,
            store,
            catalog,
            policy,
            inflight: parking_lot::Mutex::new(HashMap::new()),
            last_identity: parking_lot::Mutex::new(None),
            weak: weak.clone(),
        })
    }

    /// Produce an entitlement verdict for `identity`. Never errors.
    pub async fn resolve(
        &self,
        identity: Option<&Identity>,
        options: ResolveOptions,
    ) -> EntitlementVerdict {
        self.resolve_cancellable(identity, options, CancellationToken::new())
            .await
    }

    /// `resolve` with a cancellation token owned by the session layer.
    ///
    /// A resolve whose token is cancelled mid-flight still returns a verdict,
    /// but does not write it to the cache; the session layer discards it.
    pub async fn resolve_cancellable(
        &self,
        identity: Option<&Identity>,
        options: ResolveOptions,
        cancel: CancellationToken,
    ) -> EntitlementVerdict {
        let Some(identity) = identity else {
            // No session is a defined state, not an error. Any verdict cached
            // for the previous identity must not outlive it here.
            if let Some(previous) = self.last_identity.lock().take() {
                if let Err(e) = self.cache.remove(&previous) {
                    tracing::warn!("Failed to drop cached verdict on session end: {}", e);
                }
            }
            return EntitlementVerdict::denied(VerdictSource::Default);
        };

        *self.last_identity.lock() = Some(identity.clone());

        let key = identity.cache_key();

        // Single-flight per identity: the first caller becomes the leader and
        // runs the reconciliation; concurrent callers attach to its result so
        // duplicate source calls (and duplicate write-backs) never race.
        loop {
            let waiter = {
                let mut inflight = self.inflight.lock();
                match inflight.get_mut(&key) {
                    Some(waiters) => {
                        let (tx, rx) = oneshot::channel();
                        waiters.push(tx);
                        Some(rx)
                    }
                    None => {
                        inflight.insert(key.clone(), Vec::new());
                        None
                    }
                }
            };

            match waiter {
                Some(rx) => match rx.await {
                    Ok(verdict) => return verdict,
                    // Leader vanished without delivering; take over.
                    Err(_) => continue,
                },
                None => break,
            }
        }

        let verdict = self
            .reconcile(identity, options.force_refresh, &cancel)
            .await;

        let waiters = self.inflight.lock().remove(&key).unwrap_or_default();
        for tx in waiters {
            let _ = tx.send(verdict.clone());
        }

        verdict
    }

    /// Explicit revocation: clear the cached verdict and record "not
    /// entitled" in the ledger. Idempotent; at most one ledger write per call.
    pub async fn revoke(
        &self,
        identity: &Identity,
    ) -> Result<EntitlementVerdict, RevokeError> {
        if let Err(e) = self.cache.remove(identity) {
            tracing::warn!("Failed to drop cached verdict during revocation: {}", e);
        }

        // A guest identifier is not a durable account key; guests never write
        // to the ledger.
        if identity.is_guest() {
            tracing::info!(key = %identity.cache_key(), "Revoked guest entitlement (cache only)");
            return Ok(EntitlementVerdict::denied(VerdictSource::Default));
        }

        let existing = with_timeout(
            self.policy.ledger_timeout,
            self.ledger.get_record(identity),
        )
        .await?;

        match existing {
            Some(record) if record.is_active => {
                let revoked = LedgerRecord {
                    is_active: false,
                    last_notification: LedgerNotification::Revocation,
                    ..record
                };
                with_timeout(
                    self.policy.ledger_timeout,
                    self.ledger.upsert_record(identity, &revoked),
                )
                .await?;
                tracing::info!(key = %identity.cache_key(), "Revoked entitlement in ledger");
            }
            // Absent or already inactive: nothing to write.
            _ => {
                tracing::debug!(key = %identity.cache_key(), "Revocation was a no-op");
            }
        }

        Ok(EntitlementVerdict::denied(VerdictSource::Ledger))
    }

    /// Run the platform purchase flow, then re-resolve with a forced refresh
    /// so the UI reflects the new entitlement immediately.
    pub async fn complete_purchase(
        &self,
        identity: &Identity,
        product_id: &str,
    ) -> Result<EntitlementVerdict, PurchaseError> {
        if !self.catalog.recognizes(product_id) {
            return Err(PurchaseError::UnknownProduct(product_id.to_string()));
        }

        let txn = with_timeout(self.policy.store_timeout, self.store.purchase(product_id)).await?;
        tracing::info!(
            product = %txn.product_id,
            transaction = %txn.transaction_id,
            "Platform purchase confirmed"
        );

        Ok(self.resolve(Some(identity), ResolveOptions::forced()).await)
    }

    /// Run the platform restore flow, then re-resolve with a forced refresh.
    pub async fn restore_purchases(
        &self,
        identity: &Identity,
    ) -> Result<EntitlementVerdict, PurchaseError> {
        let restored = with_timeout(self.policy.store_timeout, self.store.restore()).await?;
        tracing::info!(count = restored.len(), "Platform restore completed");

        Ok(self.resolve(Some(identity), ResolveOptions::forced()).await)
    }

    /// Drop the cached verdict for one identity (identity swap).
    pub fn invalidate(&self, identity: &Identity) {
        if let Err(e) = self.cache.remove(identity) {
            tracing::warn!("Failed to invalidate cached verdict: {}", e);
        }
    }

    /// Drop every cached verdict (sign-out). The ledger is left alone so the
    /// record is still there when the user signs back in.
    pub fn invalidate_all(&self) {
        if let Err(e) = self.cache.clear() {
            tracing::warn!("Failed to clear verdict cache: {}", e);
        }
    }

    // =========================================================================
    // Reconciliation pipeline
    // =========================================================================

    async fn reconcile(
        &self,
        identity: &Identity,
        force_refresh: bool,
        cancel: &CancellationToken,
    ) -> EntitlementVerdict {
        let now = now_ms();

        if !force_refresh {
            if let Some(verdict) = self.serve_from_cache(identity, now) {
                return verdict;
            }
        }

        // The ledger is authoritative when it has an active, unexpired row:
        // it knows about server-side revocation the store cannot see.
        let ledger_row = with_timeout(
            self.policy.ledger_timeout,
            self.ledger.get_record(identity),
        )
        .await;

        match &ledger_row {
            Ok(Some(record)) if record.grants_at(now) => {
                let tier = tier_from_expiry(record.expires_date);
                let verdict =
                    EntitlementVerdict::entitled(tier, record.expires_date, VerdictSource::Ledger);
                return self.commit(identity, verdict, cancel);
            }
            Ok(_) => {
                tracing::debug!(key = %identity.cache_key(), "Ledger reports no active record");
            }
            Err(e) => {
                tracing::warn!("Ledger unreachable during resolve: {}", e);
            }
        }

        // Ledger inactive, absent, or unreachable: the platform store is
        // ground truth for "a purchase happened", e.g. when the purchase
        // succeeded on-device but the server-side update has not landed.
        match with_timeout(self.policy.store_timeout, self.store.active_transactions()).await {
            Ok(transactions) => match self.best_transaction(&transactions, now) {
                Some(txn) => {
                    let tier = tier_from_expiry(txn.expires_date);
                    let verdict =
                        EntitlementVerdict::entitled(tier, txn.expires_date, VerdictSource::Store);

                    // Self-healing write-back so ledger and store converge.
                    // Guests never write to the ledger.
                    if !identity.is_guest() && !cancel.is_cancelled() {
                        self.spawn_write_back(identity, txn);
                    }

                    self.commit(identity, verdict, cancel)
                }
                None => {
                    let verdict = EntitlementVerdict::denied(VerdictSource::Store);
                    self.commit(identity, verdict, cancel)
                }
            },
            Err(e) => {
                tracing::warn!("Platform store unreachable during resolve: {}", e);

                // Asymmetric failure policy: with every source down, a stale
                // cached verdict beats flashing ads at a paying user. An
                // expired time-limited verdict is the one thing we can still
                // judge locally, so it does not qualify.
                match self.cache.get(identity) {
                    Ok(Some(entry)) if entry.verdict.still_valid_at(now) => {
                        tracing::info!(
                            key = %identity.cache_key(),
                            "Serving last cached verdict while sources are unreachable"
                        );
                        entry.verdict
                    }
                    _ => self.commit(
                        identity,
                        EntitlementVerdict::denied(VerdictSource::Default),
                        cancel,
                    ),
                }
            }
        }
    }

    /// Fresh positive cache hit, if there is one to serve.
    ///
    /// Negative verdicts have a staleness window of zero: a cached "entitled"
    /// value outliving a server-side cancellation was the defining bug of the
    /// implementations this engine replaces, and the inverse (re-checking a
    /// denial) costs one round trip.
    fn serve_from_cache(&self, identity: &Identity, now: u64) -> Option<EntitlementVerdict> {
        let entry = match self.cache.get(identity) {
            Ok(entry) => entry?,
            Err(e) => {
                tracing::warn!("Cache read failed, treating as miss: {}", e);
                return None;
            }
        };

        if !entry.verdict.is_entitled || !entry.verdict.still_valid_at(now) {
            return None;
        }

        let age = Duration::from_millis(entry.age_ms(now));
        if age >= self.policy.positive_ttl {
            return None;
        }

        // Close to the staleness boundary: serve the hit, refresh behind it.
        if self.policy.positive_ttl - age <= self.policy.refresh_ahead {
            self.spawn_background_refresh(identity);
        }

        tracing::debug!(key = %identity.cache_key(), age_ms = age.as_millis() as u64, "Cache hit");
        Some(entry.verdict)
    }

    /// Write the verdict through to the cache, unless the owning session was
    /// torn down mid-flight: a slow response for the old identity must not
    /// corrupt the new identity's state.
    fn commit(
        &self,
        identity: &Identity,
        verdict: EntitlementVerdict,
        cancel: &CancellationToken,
    ) -> EntitlementVerdict {
        if cancel.is_cancelled() {
            tracing::debug!(key = %identity.cache_key(), "Discarding verdict for torn-down session");
            return verdict;
        }

        let entry = CacheEntry::new(verdict.clone(), now_ms());
        if let Err(e) = self.cache.put(identity, entry) {
            tracing::warn!("Failed to cache verdict: {}", e);
        }

        tracing::info!(
            key = %identity.cache_key(),
            entitled = verdict.is_entitled,
            source = ?verdict.source,
            "Reconciled entitlement"
        );
        verdict
    }

    /// Best entitlement-granting transaction: unlimited beats time-limited,
    /// later expiry beats earlier.
    fn best_transaction<'t>(
        &self,
        transactions: &'t [PlatformTransaction],
        now: u64,
    ) -> Option<&'t PlatformTransaction> {
        transactions
            .iter()
            .filter(|txn| self.catalog.recognizes(&txn.product_id))
            .filter(|txn| txn.active_at(now))
            .max_by_key(|txn| match txn.expires_date {
                None => (1, u64::MAX),
                Some(expiry) => (0, expiry),
            })
    }

    fn spawn_background_refresh(&self, identity: &Identity) {
        let Some(engine) = self.weak.upgrade() else {
            return;
        };
        let identity = identity.clone();
        tokio::spawn(async move {
            tracing::debug!(
                key = %identity.cache_key(),
                "Background refresh near staleness boundary"
            );
            engine
                .resolve(Some(&identity), ResolveOptions::forced())
                .await;
        });
    }

    fn spawn_write_back(&self, identity: &Identity, txn: &PlatformTransaction) {
        let ledger = Arc::clone(&self.ledger);
        let timeout = self.policy.ledger_timeout;
        let identity = identity.clone();
        let record = LedgerRecord {
            product_id: txn.product_id.clone(),
            purchase_date: txn.purchase_date,
            expires_date: txn.expires_date,
            is_active: true,
            last_notification: LedgerNotification::InitialBuy,
        };

        tokio::spawn(async move {
            match with_timeout(timeout, ledger.upsert_record(&identity, &record)).await {
                Ok(()) => {
                    tracing::info!(
                        key = %identity.cache_key(),
                        product = %record.product_id,
                        "Write-back pushed platform purchase to ledger"
                    );
                }
                // Not surfaced: the next cache-miss resolve walks the same
                // store path and pushes again.
                Err(e) => {
                    tracing::warn!("Ledger write-back failed, will retry on a later resolve: {}", e);
                }
            }
        });
    }
}

/// Tier implied by an expiry timestamp: dated grants are time-limited,
/// perpetual grants are unlimited. Where configured product tiers disagree
/// with observed billing data, the data wins.
fn tier_from_expiry(expires_date: Option<u64>) -> Tier {
    match expires_date {
        Some(_) => Tier::TimeLimited,
        None => Tier::Unlimited,
    }
}

/// Single-attempt-with-timeout contract shared by every source call.
async fn with_timeout<T>(
    duration: Duration,
    call: impl Future<Output = Result<T, SourceError>>,
) -> Result<T, SourceError> {
    match tokio::time::timeout(duration, call).await {
        Ok(result) => result,
        Err(_) => Err(SourceError::Timeout(duration)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use crate::config::EntitlementsConfig;
    use crate::ledger::StubLedgerClient;
    use crate::store::StubStoreClient;

    const HOUR_MS: u64 = 60 * 60 * 1000;

    struct Harness {
        engine: Arc<ReconciliationEngine>,
        cache: Arc<MemoryCache>,
        ledger: Arc<StubLedgerClient>,
        store: Arc<StubStoreClient>,
    }

    fn harness() -> Harness {
        let config = EntitlementsConfig::default();
        let cache = Arc::new(MemoryCache::new());
        let ledger = Arc::new(StubLedgerClient::new());
        let store = Arc::new(StubStoreClient::new());
        let engine = ReconciliationEngine::new(
            cache.clone(),
            ledger.clone(),
            store.clone(),
            config.product_catalog(),
            config.reconcile_policy(),
        );
        Harness {
            engine,
            cache,
            ledger,
            store,
        }
    }

    fn active_record(product: &str, expires: Option<u64>) -> LedgerRecord {
        LedgerRecord {
            product_id: product.into(),
            purchase_date: now_ms().saturating_sub(HOUR_MS),
            expires_date: expires,
            is_active: true,
            last_notification: LedgerNotification::InitialBuy,
        }
    }

    fn transaction(product: &str, expires: Option<u64>) -> PlatformTransaction {
        PlatformTransaction {
            product_id: product.into(),
            transaction_id: uuid::Uuid::new_v4().to_string(),
            purchase_date: now_ms().saturating_sub(HOUR_MS),
            expires_date: expires,
        }
    }

    fn cached(verdict: EntitlementVerdict, age_ms: u64) -> CacheEntry {
        CacheEntry::new(verdict, now_ms().saturating_sub(age_ms))
    }

    #[tokio::test]
    async fn no_identity_is_denied_without_source_calls() {
        let h = harness();

        let verdict = h.engine.resolve(None, ResolveOptions::default()).await;

        assert!(!verdict.is_entitled);
        assert_eq!(verdict.source, VerdictSource::Default);
        assert_eq!(h.ledger.read_count(), 0);
        assert_eq!(h.store.query_count(), 0);
    }

    #[tokio::test]
    async fn no_identity_clears_previous_identity_cache() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.ledger
            .set_record(&id, active_record("premium.unlimited", None));

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;
        assert!(v.is_entitled);
        assert!(h.cache.get(&id).unwrap().is_some());

        h.engine.resolve(None, ResolveOptions::default()).await;
        assert!(h.cache.get(&id).unwrap().is_none());
    }

    #[tokio::test]
    async fn fresh_positive_cache_hit_skips_sources() {
        let h = harness();
        let id = Identity::authenticated("u1");
        let verdict = EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger);
        h.cache.put(&id, cached(verdict.clone(), HOUR_MS)).unwrap();

        let resolved = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert_eq!(resolved, verdict);
        assert_eq!(h.ledger.read_count(), 0);
        assert_eq!(h.store.query_count(), 0);
    }

    #[tokio::test]
    async fn cached_negative_always_requeries_ledger() {
        let h = harness();
        let id = Identity::authenticated("u1");
        // Even a second-old denial must not be served from cache.
        h.cache
            .put(
                &id,
                cached(EntitlementVerdict::denied(VerdictSource::Store), 1000),
            )
            .unwrap();
        h.ledger
            .set_record(&id, active_record("premium.unlimited", None));

        let resolved = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert_eq!(h.ledger.read_count(), 1);
        assert!(resolved.is_entitled);
        assert_eq!(resolved.source, VerdictSource::Ledger);
    }

    #[tokio::test]
    async fn stale_positive_cache_requeries_ledger() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.cache
            .put(
                &id,
                cached(
                    EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger),
                    25 * HOUR_MS,
                ),
            )
            .unwrap();

        let resolved = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert_eq!(h.ledger.read_count(), 1);
        // No ledger row, no store transaction: denied by the store path.
        assert!(!resolved.is_entitled);
        assert_eq!(resolved.source, VerdictSource::Store);
    }

    #[tokio::test]
    async fn ledger_active_record_is_authoritative_with_exact_expiry() {
        let h = harness();
        let id = Identity::authenticated("u1");
        let expiry = now_ms() + 30 * 24 * HOUR_MS;
        h.ledger
            .set_record(&id, active_record("premium.monthly", Some(expiry)));

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert!(v.is_entitled);
        assert_eq!(v.tier, Tier::TimeLimited);
        assert_eq!(v.expires_at, Some(expiry));
        assert_eq!(v.source, VerdictSource::Ledger);
        // Store never consulted when the ledger grants.
        assert_eq!(h.store.query_count(), 0);
        // Verdict written through to the cache.
        assert_eq!(h.cache.get(&id).unwrap().unwrap().verdict, v);
    }

    #[tokio::test]
    async fn refunded_ledger_record_overrides_stale_positive_cache() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.cache
            .put(
                &id,
                cached(
                    EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger),
                    25 * HOUR_MS,
                ),
            )
            .unwrap();
        let mut record = active_record("premium.unlimited", None);
        record.is_active = false;
        record.last_notification = LedgerNotification::Refund;
        h.ledger.set_record(&id, record);

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert!(!v.is_entitled);
        // The denial replaces the stale positive entry.
        let entry = h.cache.get(&id).unwrap().unwrap();
        assert!(!entry.verdict.is_entitled);
    }

    #[tokio::test]
    async fn forced_refresh_overrides_fresh_cache() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.cache
            .put(
                &id,
                cached(
                    EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger),
                    1000,
                ),
            )
            .unwrap();
        let mut record = active_record("premium.unlimited", None);
        record.is_active = false;
        h.ledger.set_record(&id, record);

        let v = h.engine.resolve(Some(&id), ResolveOptions::forced()).await;

        assert_eq!(h.ledger.read_count(), 1);
        assert!(!v.is_entitled);
    }

    #[tokio::test]
    async fn store_purchase_unknown_to_ledger_wins_and_writes_back() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.store
            .set_transactions(vec![transaction("premium.unlimited", None)]);

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert!(v.is_entitled);
        assert_eq!(v.tier, Tier::Unlimited);
        assert_eq!(v.expires_at, None);
        assert_eq!(v.source, VerdictSource::Store);

        // Write-back is asynchronous; give the spawned task a moment.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let upserts = h.ledger.upserts();
        assert_eq!(upserts.len(), 1);
        let (key, record) = &upserts[0];
        assert_eq!(key, &id.cache_key());
        assert!(record.is_active);
        assert_eq!(record.expires_date, None);
        assert_eq!(record.product_id, "premium.unlimited");
    }

    #[tokio::test]
    async fn guest_store_purchase_never_writes_back() {
        let h = harness();
        let id = Identity::guest("g1");
        h.store
            .set_transactions(vec![transaction("premium.unlimited", None)]);

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert!(v.is_entitled);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.ledger.upserts().is_empty());
    }

    #[tokio::test]
    async fn unrecognized_and_expired_transactions_do_not_grant() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.store.set_transactions(vec![
            transaction("coins.pack", None),
            transaction("premium.monthly", Some(now_ms().saturating_sub(1000))),
        ]);

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert!(!v.is_entitled);
        assert_eq!(v.source, VerdictSource::Store);
    }

    #[tokio::test]
    async fn best_transaction_prefers_unlimited_then_latest_expiry() {
        let h = harness();
        let id = Identity::authenticated("u1");
        let now = now_ms();
        h.store.set_transactions(vec![
            transaction("premium.monthly", Some(now + HOUR_MS)),
            transaction("premium.unlimited", None),
            transaction("premium.monthly", Some(now + 2 * HOUR_MS)),
        ]);

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;
        assert_eq!(v.tier, Tier::Unlimited);

        // Without the unlimited purchase, the longest-lived subscription wins.
        h.cache.clear().unwrap();
        h.store.set_transactions(vec![
            transaction("premium.monthly", Some(now + HOUR_MS)),
            transaction("premium.monthly", Some(now + 2 * HOUR_MS)),
        ]);
        let v = h.engine.resolve(Some(&id), ResolveOptions::forced()).await;
        assert_eq!(v.tier, Tier::TimeLimited);
        assert_eq!(v.expires_at, Some(now + 2 * HOUR_MS));
    }

    #[tokio::test]
    async fn store_unreachable_serves_last_cached_verdict() {
        let h = harness();
        let id = Identity::authenticated("u1");
        let stale = EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger);
        h.cache.put(&id, cached(stale.clone(), 30 * HOUR_MS)).unwrap();
        h.ledger.set_unreachable(true);
        h.store.set_unreachable(true);

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        // Safer to keep the paying user ad-free than to flash a denial.
        assert_eq!(v, stale);
    }

    #[tokio::test]
    async fn store_unreachable_without_cache_defaults_to_denied() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.ledger.set_unreachable(true);
        h.store.set_unreachable(true);

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;

        assert!(!v.is_entitled);
        assert_eq!(v.source, VerdictSource::Default);
    }

    #[tokio::test]
    async fn identity_switch_never_leaks_cached_verdict() {
        let h = harness();
        let a = Identity::authenticated("user-a");
        let b = Identity::authenticated("user-b");
        h.cache
            .put(
                &a,
                cached(
                    EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger),
                    1000,
                ),
            )
            .unwrap();

        let v = h.engine.resolve(Some(&b), ResolveOptions::default()).await;

        assert!(!v.is_entitled);
    }

    #[tokio::test]
    async fn purchase_completion_resolves_synchronously() {
        let h = harness();
        let id = Identity::authenticated("u1");

        let v = h
            .engine
            .complete_purchase(&id, "premium.unlimited")
            .await
            .unwrap();

        assert!(v.is_entitled);
        assert_eq!(v.tier, Tier::Unlimited);
        assert_eq!(v.expires_at, None);
        assert_eq!(v.source, VerdictSource::Store);

        tokio::time::sleep(Duration::from_millis(20)).await;
        let upserts = h.ledger.upserts();
        assert_eq!(upserts.len(), 1);
        assert!(upserts[0].1.is_active);
        assert_eq!(upserts[0].1.expires_date, None);
    }

    #[tokio::test]
    async fn purchase_of_unknown_product_is_rejected() {
        let h = harness();
        let id = Identity::authenticated("u1");

        let result = h.engine.complete_purchase(&id, "coins.pack").await;

        assert!(matches!(result, Err(PurchaseError::UnknownProduct(_))));
        assert_eq!(h.store.query_count(), 0);
    }

    #[tokio::test]
    async fn restore_reresolves_with_force() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.store
            .set_transactions(vec![transaction("premium.monthly", Some(now_ms() + HOUR_MS))]);
        // A fresh denial in cache must not shadow the restored purchase.
        h.cache
            .put(
                &id,
                cached(EntitlementVerdict::denied(VerdictSource::Store), 0),
            )
            .unwrap();

        let v = h.engine.restore_purchases(&id).await.unwrap();

        assert!(v.is_entitled);
        assert_eq!(v.tier, Tier::TimeLimited);
    }

    #[tokio::test]
    async fn revoke_is_idempotent_with_at_most_one_write_per_call() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.ledger
            .set_record(&id, active_record("premium.unlimited", None));
        h.cache
            .put(
                &id,
                cached(
                    EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger),
                    1000,
                ),
            )
            .unwrap();

        let first = h.engine.revoke(&id).await.unwrap();
        assert!(!first.is_entitled);
        assert!(h.cache.get(&id).unwrap().is_none());
        assert_eq!(h.ledger.upserts().len(), 1);
        let written = &h.ledger.upserts()[0].1;
        assert!(!written.is_active);
        assert_eq!(written.last_notification, LedgerNotification::Revocation);

        let second = h.engine.revoke(&id).await.unwrap();
        assert_eq!(second, EntitlementVerdict { as_of: second.as_of, ..first });
        // Second call found the record already inactive: no further write.
        assert_eq!(h.ledger.upserts().len(), 1);
    }

    #[tokio::test]
    async fn revoke_surfaces_ledger_failure() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.ledger.set_unreachable(true);

        let result = h.engine.revoke(&id).await;

        assert!(matches!(result, Err(RevokeError::Ledger(_))));
    }

    #[tokio::test]
    async fn revoke_for_guest_is_cache_only() {
        let h = harness();
        let id = Identity::guest("g1");
        h.cache
            .put(
                &id,
                cached(
                    EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Store),
                    1000,
                ),
            )
            .unwrap();

        let v = h.engine.revoke(&id).await.unwrap();

        assert!(!v.is_entitled);
        assert!(h.cache.get(&id).unwrap().is_none());
        assert_eq!(h.ledger.read_count(), 0);
        assert!(h.ledger.upserts().is_empty());
    }

    #[tokio::test]
    async fn concurrent_resolves_for_one_identity_share_one_flight() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.ledger
            .set_record(&id, active_record("premium.unlimited", None));
        h.ledger.set_read_delay_ms(50);

        let (a, b) = tokio::join!(
            h.engine.resolve(Some(&id), ResolveOptions::default()),
            h.engine.resolve(Some(&id), ResolveOptions::default()),
        );

        assert_eq!(a, b);
        assert_eq!(h.ledger.read_count(), 1);
    }

    #[tokio::test]
    async fn resolves_for_different_identities_run_independently() {
        let h = harness();
        let a = Identity::authenticated("user-a");
        let b = Identity::authenticated("user-b");
        h.ledger
            .set_record(&a, active_record("premium.unlimited", None));
        h.ledger.set_read_delay_ms(20);

        let (va, vb) = tokio::join!(
            h.engine.resolve(Some(&a), ResolveOptions::default()),
            h.engine.resolve(Some(&b), ResolveOptions::default()),
        );

        assert!(va.is_entitled);
        assert!(!vb.is_entitled);
        assert_eq!(h.ledger.read_count(), 2);
    }

    #[tokio::test]
    async fn cancelled_resolve_discards_result() {
        let h = harness();
        let id = Identity::authenticated("u1");
        h.ledger
            .set_record(&id, active_record("premium.unlimited", None));

        let cancel = CancellationToken::new();
        cancel.cancel();

        let v = h
            .engine
            .resolve_cancellable(Some(&id), ResolveOptions::default(), cancel)
            .await;

        // The verdict is still produced, but nothing was written down.
        assert!(v.is_entitled);
        assert!(h.cache.get(&id).unwrap().is_none());
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(h.ledger.upserts().is_empty());
    }

    #[tokio::test]
    async fn near_boundary_cache_hit_triggers_background_refresh() {
        let h = harness();
        let id = Identity::authenticated("u1");
        // Fresh enough to serve, inside the one-hour refresh-ahead margin.
        h.cache
            .put(
                &id,
                cached(
                    EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger),
                    23 * HOUR_MS + 30 * 60 * 1000,
                ),
            )
            .unwrap();
        h.ledger
            .set_record(&id, active_record("premium.unlimited", None));

        let v = h.engine.resolve(Some(&id), ResolveOptions::default()).await;
        assert!(v.is_entitled);
        assert_eq!(v.source, VerdictSource::Ledger);

        // The background refresh re-queries the ledger and rewrites the cache.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(h.ledger.read_count(), 1);
        let entry = h.cache.get(&id).unwrap().unwrap();
        assert!(entry.age_ms(now_ms()) < HOUR_MS);
    }
}
