//! Product catalog for entitlement-granting purchases.
//!
//! This module is the single source of truth for which product identifiers
//! grant the premium experience, and at which tier. The set is configuration,
//! not contract: it is built from `[[products]]` rules in the policy config.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::verdict::Tier;

/// One configured entitlement-granting product.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRule {
    /// Platform product identifier, e.g. `premium.unlimited`.
    pub id: String,
    /// Tier the product grants.
    pub tier: Tier,
}

/// Lookup table from product identifier to granted tier.
#[derive(Debug, Clone, Default)]
pub struct ProductCatalog {
    tiers: HashMap<String, Tier>,
}

impl ProductCatalog {
    pub fn from_rules(rules: &[ProductRule]) -> Self {
        let mut tiers = HashMap::new();
        for rule in rules {
            if rule.tier == Tier::None {
                // A product granting nothing is a config mistake, not a grant.
                tracing::warn!(product = %rule.id, "ignoring product rule with tier 'none'");
                continue;
            }
            tiers.insert(rule.id.clone(), rule.tier);
        }
        Self { tiers }
    }

    /// Tier granted by `product_id`, if the catalog recognizes it.
    pub fn tier_for(&self, product_id: &str) -> Option<Tier> {
        self.tiers.get(product_id).copied()
    }

    pub fn recognizes(&self, product_id: &str) -> bool {
        self.tiers.contains_key(product_id)
    }

    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}
