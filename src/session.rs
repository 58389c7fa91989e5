//! Session binding.
//!
//! Reacts to identity changes (sign-in, sign-out, guest-mode entry) by
//! invalidating the affected cache entries and re-running reconciliation, and
//! publishes the resulting verdict as a read-only snapshot for UI consumers.
//! UI components only read the snapshot; they never decide on their own when
//! to refresh. Triggering is centralized here plus the explicit
//! purchase/restore completion hooks.

use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::engine::{PurchaseError, ReconciliationEngine, ResolveOptions, RevokeError};
use crate::identity::{Identity, SessionState};
use crate::verdict::{EntitlementVerdict, Tier, VerdictSource};

/// Read-only projection of the latest verdict for simple UI consumption.
///
/// Always derived from the last `resolve()`/`revoke()` result, never written
/// independently.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementSnapshot {
    pub is_entitled: bool,
    pub tier: Tier,
    pub verdict: EntitlementVerdict,
}

impl From<EntitlementVerdict> for EntitlementSnapshot {
    fn from(verdict: EntitlementVerdict) -> Self {
        Self {
            is_entitled: verdict.is_entitled,
            tier: verdict.tier,
            verdict,
        }
    }
}

impl Default for EntitlementSnapshot {
    fn default() -> Self {
        EntitlementVerdict::denied(VerdictSource::Default).into()
    }
}

/// Errors surfaced by the session-level purchase/revoke facade.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No active session")]
    NoSession,

    #[error(transparent)]
    Purchase(#[from] PurchaseError),

    #[error(transparent)]
    Revoke(#[from] RevokeError),
}

/// Binds the reconciliation engine to the identity provider's session stream.
///
/// Owns a background task that watches `SessionState` transitions; a new
/// transition cancels the previous in-flight resolve so a slow response for
/// the old identity can never corrupt the new identity's state.
pub struct SessionBinding {
    engine: Arc<ReconciliationEngine>,
    sessions: watch::Receiver<SessionState>,
    snapshot_tx: Arc<watch::Sender<EntitlementSnapshot>>,
    refresh_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

impl SessionBinding {
    /// Spawn the binding over a session-state subscription.
    ///
    /// The initial state is resolved immediately (without forcing, so a fresh
    /// cached verdict serves the first render).
    pub fn spawn(
        engine: Arc<ReconciliationEngine>,
        sessions: watch::Receiver<SessionState>,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(EntitlementSnapshot::default());
        let snapshot_tx = Arc::new(snapshot_tx);
        let (refresh_tx, refresh_rx) = mpsc::channel(8);

        let task = tokio::spawn(run_loop(
            engine.clone(),
            sessions.clone(),
            snapshot_tx.clone(),
            refresh_rx,
        ));

        Self {
            engine,
            sessions,
            snapshot_tx,
            refresh_tx,
            task,
        }
    }

    /// Subscribe to snapshot updates.
    pub fn subscribe(&self) -> watch::Receiver<EntitlementSnapshot> {
        self.snapshot_tx.subscribe()
    }

    /// The latest published snapshot.
    pub fn current(&self) -> EntitlementSnapshot {
        self.snapshot_tx.borrow().clone()
    }

    /// Request a forced re-resolve for the current identity (app foreground,
    /// user-initiated refresh).
    pub async fn refresh(&self) {
        let _ = self.refresh_tx.send(()).await;
    }

    /// Run the purchase flow for the current identity and publish the result.
    pub async fn purchase(&self, product_id: &str) -> Result<EntitlementVerdict, SessionError> {
        let identity = self.current_identity().ok_or(SessionError::NoSession)?;
        let verdict = self.engine.complete_purchase(&identity, product_id).await?;
        self.publish_if_current(&identity, verdict.clone());
        Ok(verdict)
    }

    /// Run the restore flow for the current identity and publish the result.
    pub async fn restore(&self) -> Result<EntitlementVerdict, SessionError> {
        let identity = self.current_identity().ok_or(SessionError::NoSession)?;
        let verdict = self.engine.restore_purchases(&identity).await?;
        self.publish_if_current(&identity, verdict.clone());
        Ok(verdict)
    }

    /// Revoke the current identity's entitlement and publish the result.
    pub async fn revoke(&self) -> Result<EntitlementVerdict, SessionError> {
        let identity = self.current_identity().ok_or(SessionError::NoSession)?;
        let verdict = self.engine.revoke(&identity).await?;
        self.publish_if_current(&identity, verdict.clone());
        Ok(verdict)
    }

    fn current_identity(&self) -> Option<Identity> {
        self.sessions.borrow().identity()
    }

    /// Publish unless the session moved on while the call was in flight.
    fn publish_if_current(&self, identity: &Identity, verdict: EntitlementVerdict) {
        if self.current_identity().as_ref() == Some(identity) {
            self.snapshot_tx.send_replace(verdict.into());
        } else {
            tracing::debug!("Discarding verdict produced for a replaced session");
        }
    }
}

impl Drop for SessionBinding {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run_loop(
    engine: Arc<ReconciliationEngine>,
    mut sessions: watch::Receiver<SessionState>,
    snapshot_tx: Arc<watch::Sender<EntitlementSnapshot>>,
    mut refresh_rx: mpsc::Receiver<()>,
) {
    let mut state = sessions.borrow().clone();
    let mut token = CancellationToken::new();

    // Resolve the initial session before watching for changes.
    if let Some(identity) = state.identity() {
        spawn_resolve(
            &engine,
            &snapshot_tx,
            &token,
            identity,
            ResolveOptions::default(),
        );
    }

    loop {
        tokio::select! {
            changed = sessions.changed() => {
                if changed.is_err() {
                    // Identity provider went away; nothing left to bind.
                    break;
                }
                let next = sessions.borrow_and_update().clone();
                if next == state {
                    continue;
                }

                // Tear down the in-flight resolve for the old session.
                token.cancel();
                token = CancellationToken::new();

                apply_transition(&engine, &snapshot_tx, &token, &state, &next).await;
                state = next;
            }

            Some(()) = refresh_rx.recv() => {
                if let Some(identity) = state.identity() {
                    tracing::debug!(key = %identity.cache_key(), "Explicit refresh requested");
                    spawn_resolve(
                        &engine,
                        &snapshot_tx,
                        &token,
                        identity,
                        ResolveOptions::forced(),
                    );
                }
            }
        }
    }
}

async fn apply_transition(
    engine: &Arc<ReconciliationEngine>,
    snapshot_tx: &Arc<watch::Sender<EntitlementSnapshot>>,
    token: &CancellationToken,
    old: &SessionState,
    new: &SessionState,
) {
    tracing::info!(from = ?old, to = ?new, "Session transition");

    match (old.identity(), new.identity()) {
        // Sign-out: clear the cache entirely. The ledger record persists for
        // when the user signs back in.
        (Some(_), None) => {
            engine.invalidate_all();
            let verdict = engine.resolve(None, ResolveOptions::default()).await;
            snapshot_tx.send_replace(verdict.into());
        }

        // Identity swap: the old identity's cached verdict must never leak
        // into the new identity's reads.
        (Some(old_identity), Some(new_identity)) => {
            engine.invalidate(&old_identity);
            spawn_resolve(engine, snapshot_tx, token, new_identity, ResolveOptions::forced());
        }

        // Session start (guest entry or sign-in from cold).
        (None, Some(new_identity)) => {
            spawn_resolve(engine, snapshot_tx, token, new_identity, ResolveOptions::forced());
        }

        (None, None) => {}
    }
}

/// Resolve off the event loop so a slow source never blocks transition
/// handling; the result is dropped if the session was torn down meanwhile.
fn spawn_resolve(
    engine: &Arc<ReconciliationEngine>,
    snapshot_tx: &Arc<watch::Sender<EntitlementSnapshot>>,
    token: &CancellationToken,
    identity: Identity,
    options: ResolveOptions,
) {
    let engine = engine.clone();
    let snapshot_tx = snapshot_tx.clone();
    let token = token.clone();

    tokio::spawn(async move {
        let verdict = engine
            .resolve_cancellable(Some(&identity), options, token.clone())
            .await;
        if token.is_cancelled() {
            tracing::debug!(key = %identity.cache_key(), "Discarding resolve for torn-down session");
            return;
        }
        snapshot_tx.send_replace(verdict.into());
    });
}
