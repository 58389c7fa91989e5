//! Entitlement verdict value types.
//!
//! A verdict is a value, not a mutable object: reconciliation always produces a
//! new verdict rather than patching an old one, so there is no partial-update
//! state to race on. All timestamps are Unix milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Entitlement tier granted by a purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Not entitled.
    None,
    /// Entitled until `expires_at`.
    TimeLimited,
    /// Entitled with no expiry.
    Unlimited,
}

/// Which source produced a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictSource {
    Cache,
    Ledger,
    Store,
    Default,
}

/// Point-in-time answer to "is this identity entitled".
///
/// Invariants (enforced by the constructors):
/// - `is_entitled` implies `tier != Tier::None`
/// - `tier == Tier::TimeLimited` implies `expires_at` is present and was in the
///   future when the verdict was produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitlementVerdict {
    pub is_entitled: bool,
    pub tier: Tier,
    /// Unix ms; absent for `Unlimited` and denied verdicts.
    pub expires_at: Option<u64>,
    /// Unix ms at which this verdict was produced.
    pub as_of: u64,
    /// Source of truth that produced this verdict.
    pub source: VerdictSource,
}

impl EntitlementVerdict {
    /// A denied (not entitled) verdict.
    pub fn denied(source: VerdictSource) -> Self {
        Self {
            is_entitled: false,
            tier: Tier::None,
            expires_at: None,
            as_of: now_ms(),
            source,
        }
    }

    /// An entitled verdict.
    ///
    /// An `Unlimited` tier ignores any expiry. A `TimeLimited` tier whose
    /// expiry is missing or already past degrades to a denied verdict so the
    /// invariants above hold by construction.
    pub fn entitled(tier: Tier, expires_at: Option<u64>, source: VerdictSource) -> Self {
        let now = now_ms();
        match tier {
            Tier::None => Self::denied(source),
            Tier::Unlimited => Self {
                is_entitled: true,
                tier,
                expires_at: None,
                as_of: now,
                source,
            },
            Tier::TimeLimited => match expires_at {
                Some(expiry) if expiry > now => Self {
                    is_entitled: true,
                    tier,
                    expires_at: Some(expiry),
                    as_of: now,
                    source,
                },
                _ => Self::denied(source),
            },
        }
    }

    /// Whether the verdict can still be served at `now`.
    ///
    /// A time-limited verdict outlives its usefulness the moment its expiry
    /// passes, regardless of how recently it was produced.
    pub fn still_valid_at(&self, now: u64) -> bool {
        match self.expires_at {
            Some(expiry) => expiry > now,
            None => true,
        }
    }
}

/// Current time as Unix milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn denied_verdict_has_no_tier() {
        let v = EntitlementVerdict::denied(VerdictSource::Default);
        assert!(!v.is_entitled);
        assert_eq!(v.tier, Tier::None);
        assert!(v.expires_at.is_none());
    }

    #[test]
    fn unlimited_verdict_drops_expiry() {
        let v = EntitlementVerdict::entitled(
            Tier::Unlimited,
            Some(now_ms() + 1000),
            VerdictSource::Ledger,
        );
        assert!(v.is_entitled);
        assert_eq!(v.tier, Tier::Unlimited);
        assert!(v.expires_at.is_none());
    }

    #[test]
    fn time_limited_requires_future_expiry() {
        let future = now_ms() + 60_000;
        let v = EntitlementVerdict::entitled(Tier::TimeLimited, Some(future), VerdictSource::Store);
        assert!(v.is_entitled);
        assert_eq!(v.expires_at, Some(future));

        let expired =
            EntitlementVerdict::entitled(Tier::TimeLimited, Some(1), VerdictSource::Store);
        assert!(!expired.is_entitled);
        assert_eq!(expired.tier, Tier::None);

        let missing = EntitlementVerdict::entitled(Tier::TimeLimited, None, VerdictSource::Store);
        assert!(!missing.is_entitled);
    }

    #[test]
    fn entitled_with_none_tier_is_denied() {
        let v = EntitlementVerdict::entitled(Tier::None, None, VerdictSource::Ledger);
        assert!(!v.is_entitled);
    }

    #[test]
    fn validity_tracks_expiry() {
        let now = now_ms();
        let v =
            EntitlementVerdict::entitled(Tier::TimeLimited, Some(now + 1000), VerdictSource::Store);
        assert!(v.still_valid_at(now));
        assert!(!v.still_valid_at(now + 1001));

        let unlimited = EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Ledger);
        assert!(unlimited.still_valid_at(u64::MAX));
    }

    #[test]
    fn verdict_serialization_roundtrip() {
        let v = EntitlementVerdict::entitled(Tier::Unlimited, None, VerdictSource::Store);
        let json = serde_json::to_string(&v).unwrap();
        assert!(json.contains("\"isEntitled\":true"));
        assert!(json.contains("\"source\":\"store\""));
        let back: EntitlementVerdict = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }
}
