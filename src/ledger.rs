//! Remote ledger client boundary.
//!
//! The ledger is the backend's authoritative record of a purchase: one row per
//! identity, derived from verified platform transactions and updated by
//! server-side processes reacting to platform billing callbacks. From this
//! crate's perspective it is read-mostly; the one client-side write is the
//! self-healing push when the engine discovers a platform purchase the ledger
//! has not recorded yet. The client must tolerate the row changing underneath
//! it between reads.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::source::SourceError;

/// Last platform billing notification the backend saw for a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerNotification {
    InitialBuy,
    Renewal,
    Cancellation,
    Refund,
    /// Manual grant removal or client-initiated revocation.
    Revocation,
}

/// One per-identity purchase row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct LedgerRecord {
    pub product_id: String,
    /// Unix ms.
    pub purchase_date: u64,
    /// Unix ms; absent = perpetual.
    pub expires_date: Option<u64>,
    pub is_active: bool,
    pub last_notification: LedgerNotification,
}

impl LedgerRecord {
    /// Whether this record grants entitlement at `now`.
    pub fn grants_at(&self, now: u64) -> bool {
        self.is_active && self.expires_date.map_or(true, |expiry| expiry > now)
    }
}

/// Narrow adapter over the backend purchase record store.
///
/// Each call follows a single-attempt contract; the engine wraps calls in its
/// own timeout and treats failures per its degradation policy.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Keyed lookup of the purchase row for an identity.
    async fn get_record(&self, identity: &Identity) -> Result<Option<LedgerRecord>, SourceError>;

    /// Upsert the purchase row for an identity.
    async fn upsert_record(
        &self,
        identity: &Identity,
        record: &LedgerRecord,
    ) -> Result<(), SourceError>;
}

/// In-memory ledger for tests and offline development.
///
/// Records every upsert so tests can assert on write-back traffic.
#[derive(Debug, Default)]
pub struct StubLedgerClient {
    records: parking_lot::Mutex<std::collections::HashMap<String, LedgerRecord>>,
    upserts: parking_lot::Mutex<Vec<(String, LedgerRecord)>>,
    reads: std::sync::atomic::AtomicUsize,
    read_delay_ms: std::sync::atomic::AtomicU64,
    fail: std::sync::atomic::AtomicBool,
}

impl StubLedgerClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the row for an identity.
    pub fn set_record(&self, identity: &Identity, record: LedgerRecord) {
        self.records
            .lock()
            .insert(identity.cache_key(), record);
    }

    /// Make every subsequent call fail with `SourceError::Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail
            .store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }

    /// Inject latency into reads (lets tests overlap concurrent resolves).
    pub fn set_read_delay_ms(&self, delay_ms: u64) {
        self.read_delay_ms
            .store(delay_ms, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of `get_record` calls issued so far.
    pub fn read_count(&self) -> usize {
        self.reads.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// All upserts issued so far, in order.
    pub fn upserts(&self) -> Vec<(String, LedgerRecord)> {
        self.upserts.lock().clone()
    }

    fn check_reachable(&self) -> Result<(), SourceError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            Err(SourceError::Unreachable("stub ledger down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl LedgerClient for StubLedgerClient {
    async fn get_record(&self, identity: &Identity) -> Result<Option<LedgerRecord>, SourceError> {
        self.reads
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        let delay = self.read_delay_ms.load(std::sync::atomic::Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(std::time::Duration::from_millis(delay)).await;
        }
        self.check_reachable()?;
        Ok(self.records.lock().get(&identity.cache_key()).cloned())
    }

    async fn upsert_record(
        &self,
        identity: &Identity,
        record: &LedgerRecord,
    ) -> Result<(), SourceError> {
        self.check_reachable()?;
        let key = identity.cache_key();
        self.upserts.lock().push((key.clone(), record.clone()));
        self.records.lock().insert(key, record.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::now_ms;

    fn record(active: bool, expires: Option<u64>) -> LedgerRecord {
        LedgerRecord {
            product_id: "premium.unlimited".into(),
            purchase_date: now_ms(),
            expires_date: expires,
            is_active: active,
            last_notification: LedgerNotification::InitialBuy,
        }
    }

    #[test]
    fn perpetual_active_record_grants() {
        assert!(record(true, None).grants_at(now_ms()));
    }

    #[test]
    fn inactive_record_never_grants() {
        let now = now_ms();
        assert!(!record(false, None).grants_at(now));
        assert!(!record(false, Some(now + 10_000)).grants_at(now));
    }

    #[test]
    fn expired_record_does_not_grant() {
        let now = now_ms();
        assert!(!record(true, Some(now.saturating_sub(1))).grants_at(now));
        assert!(record(true, Some(now + 1)).grants_at(now));
    }

    #[tokio::test]
    async fn stub_roundtrip_and_upsert_log() {
        let ledger = StubLedgerClient::new();
        let id = Identity::authenticated("u1");

        assert!(ledger.get_record(&id).await.unwrap().is_none());

        let rec = record(true, None);
        ledger.upsert_record(&id, &rec).await.unwrap();

        assert_eq!(ledger.get_record(&id).await.unwrap(), Some(rec));
        assert_eq!(ledger.upserts().len(), 1);
    }

    #[tokio::test]
    async fn stub_unreachable_fails_both_directions() {
        let ledger = StubLedgerClient::new();
        let id = Identity::authenticated("u1");
        ledger.set_unreachable(true);

        assert!(ledger.get_record(&id).await.is_err());
        assert!(ledger.upsert_record(&id, &record(true, None)).await.is_err());
    }
}
