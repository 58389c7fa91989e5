//! Shared error taxonomy for the ledger and store source clients.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single source call.
///
/// The resolve path treats both variants identically (degrade, never throw);
/// only the store-unreachable case participates in the asymmetric failure
/// policy. `revoke` and purchase flows surface these to the caller.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Source unreachable: {0}")]
    Unreachable(String),

    #[error("Source call timed out after {0:?}")]
    Timeout(Duration),
}
