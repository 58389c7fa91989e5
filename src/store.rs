//! Platform store client boundary.
//!
//! Queries the platform billing subsystem for the caller's current
//! transactions and initiates purchase/restore flows. The store knows about
//! purchases the server may not have recorded yet, but it is blind to
//! server-side revocation (refund, manual grant removal). That asymmetry is
//! why the ledger outranks it in the reconciliation precedence.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::source::SourceError;

/// Read-only view of one platform billing transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformTransaction {
    pub product_id: String,
    pub transaction_id: String,
    /// Unix ms.
    pub purchase_date: u64,
    /// Unix ms; absent = perpetual.
    pub expires_date: Option<u64>,
}

impl PlatformTransaction {
    /// Whether the transaction is still live at `now`.
    pub fn active_at(&self, now: u64) -> bool {
        self.expires_date.map_or(true, |expiry| expiry > now)
    }
}

/// Narrow adapter over the platform billing subsystem.
///
/// Single-attempt contract per call; the engine owns timeouts and treats a
/// timeout the same as "no data" everywhere except the failure-asymmetry
/// policy of the resolve path.
#[async_trait]
pub trait StoreClient: Send + Sync {
    /// Current transactions for the calling device/account.
    async fn active_transactions(&self) -> Result<Vec<PlatformTransaction>, SourceError>;

    /// Run the platform purchase flow for a product.
    async fn purchase(&self, product_id: &str) -> Result<PlatformTransaction, SourceError>;

    /// Run the platform restore-purchases flow.
    async fn restore(&self) -> Result<Vec<PlatformTransaction>, SourceError>;
}

/// In-memory store for tests and offline development.
#[derive(Debug, Default)]
pub struct StubStoreClient {
    transactions: parking_lot::Mutex<Vec<PlatformTransaction>>,
    calls: std::sync::atomic::AtomicUsize,
    fail: std::sync::atomic::AtomicBool,
}

impl StubStoreClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transactions(&self, transactions: Vec<PlatformTransaction>) {
        *self.transactions.lock() = transactions;
    }

    /// Make every subsequent call fail with `SourceError::Unreachable`.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.fail
            .store(unreachable, std::sync::atomic::Ordering::SeqCst);
    }

    /// Number of `active_transactions` queries issued so far.
    pub fn query_count(&self) -> usize {
        self.calls.load(std::sync::atomic::Ordering::SeqCst)
    }

    fn check_reachable(&self) -> Result<(), SourceError> {
        if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
            Err(SourceError::Unreachable("stub store down".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl StoreClient for StubStoreClient {
    async fn active_transactions(&self) -> Result<Vec<PlatformTransaction>, SourceError> {
        self.calls
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.check_reachable()?;
        Ok(self.transactions.lock().clone())
    }

    async fn purchase(&self, product_id: &str) -> Result<PlatformTransaction, SourceError> {
        self.check_reachable()?;
        let txn = PlatformTransaction {
            product_id: product_id.to_string(),
            transaction_id: uuid::Uuid::new_v4().to_string(),
            purchase_date: crate::verdict::now_ms(),
            expires_date: None,
        };
        self.transactions.lock().push(txn.clone());
        Ok(txn)
    }

    async fn restore(&self) -> Result<Vec<PlatformTransaction>, SourceError> {
        self.check_reachable()?;
        Ok(self.transactions.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verdict::now_ms;

    #[test]
    fn perpetual_transaction_is_active() {
        let txn = PlatformTransaction {
            product_id: "premium.unlimited".into(),
            transaction_id: "t1".into(),
            purchase_date: now_ms(),
            expires_date: None,
        };
        assert!(txn.active_at(u64::MAX));
    }

    #[test]
    fn expired_transaction_is_inactive() {
        let now = now_ms();
        let txn = PlatformTransaction {
            product_id: "premium.monthly".into(),
            transaction_id: "t2".into(),
            purchase_date: now.saturating_sub(10_000),
            expires_date: Some(now.saturating_sub(1)),
        };
        assert!(!txn.active_at(now));
    }

    #[tokio::test]
    async fn stub_purchase_shows_up_in_transactions() {
        let store = StubStoreClient::new();
        let txn = store.purchase("premium.unlimited").await.unwrap();
        assert_eq!(txn.product_id, "premium.unlimited");

        let all = store.active_transactions().await.unwrap();
        assert_eq!(all, vec![txn.clone()]);
        assert_eq!(store.restore().await.unwrap(), vec![txn]);
    }

    #[tokio::test]
    async fn stub_unreachable() {
        let store = StubStoreClient::new();
        store.set_unreachable(true);
        assert!(store.active_transactions().await.is_err());
        assert!(store.purchase("p").await.is_err());
        assert!(store.restore().await.is_err());
    }
}
