//! Rule layer: deterministic checks that run before any model scoring

use serde::{Deserialize, Serialize};
use tollgate_policy::TrustPolicy;
use tollgate_state::Card;

/// Flags raised by the rule layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RuleFlag {
    NonPositiveAmount,
    AmountCeiling,
    TypeTariffMismatch,
    DuplicateScanWindow,
    InsufficientBalance,
    CrossOutlier,
}

impl RuleFlag {
    /// Stable identifier carried in reason codes.
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleFlag::NonPositiveAmount => "NON_POSITIVE_AMOUNT",
            RuleFlag::AmountCeiling => "AMOUNT_CEILING",
            RuleFlag::TypeTariffMismatch => "TYPE_TARIFF_MISMATCH",
            RuleFlag::DuplicateScanWindow => "DUPLICATE_SCAN_WINDOW",
            RuleFlag::InsufficientBalance => "INSUFFICIENT_BALANCE",
            RuleFlag::CrossOutlier => "CROSS_OUTLIER",
        }
    }

    /// Critical flags block regardless of reader status.
    pub fn is_critical(&self) -> bool {
        matches!(
            self,
            RuleFlag::NonPositiveAmount | RuleFlag::AmountCeiling | RuleFlag::InsufficientBalance
        )
    }
}

/// Evaluate the amount/tariff rules for one event.
///
/// `last_scan_at` is the previous accepted scan of the same tag, if any;
/// the duplicate-window flag fires when two scans land within
/// `policy.timing.duplicate_window` seconds.
pub fn evaluate_rules(
    policy: &TrustPolicy,
    card: &Card,
    amount: i64,
    timestamp: u64,
    last_scan_at: Option<u64>,
) -> Vec<RuleFlag> {
    let mut flags = Vec::new();

    if amount <= 0 {
        flags.push(RuleFlag::NonPositiveAmount);
    }

    let amount_u = amount.max(0) as u64;

    if amount_u > policy.fraud.amount_ceiling {
        flags.push(RuleFlag::AmountCeiling);
    }

    if let Some(ceiling) = policy.fraud.vehicle_ceilings.get(card.vehicle_type.as_str()) {
        if amount_u > *ceiling {
            flags.push(RuleFlag::TypeTariffMismatch);
        }
    }

    if amount > 0 && card.balance < amount_u {
        flags.push(RuleFlag::InsufficientBalance);
    }

    if let Some(last) = last_scan_at {
        if timestamp.saturating_sub(last) <= policy.timing.duplicate_window {
            flags.push(RuleFlag::DuplicateScanWindow);
        }
    }

    flags
}

#[cfg(test)]
mod tests {
    use super::*;
    use tollgate_state::VehicleType;

    fn card(balance: u64, vehicle_type: VehicleType) -> Card {
        Card {
            tag_hash: "ab".repeat(32),
            balance,
            vehicle_type,
            tariff_class: "standard".to_string(),
        }
    }

    #[test]
    fn test_clean_event_has_no_flags() {
        let policy = TrustPolicy::default();
        let flags = evaluate_rules(&policy, &card(500, VehicleType::Car), 50, 1_700_000_000, None);
        assert!(flags.is_empty());
    }

    #[test]
    fn test_non_positive_amount() {
        let policy = TrustPolicy::default();
        let flags = evaluate_rules(&policy, &card(500, VehicleType::Car), 0, 1_700_000_000, None);
        assert!(flags.contains(&RuleFlag::NonPositiveAmount));
        assert!(RuleFlag::NonPositiveAmount.is_critical());
    }

    #[test]
    fn test_vehicle_ceiling_mismatch() {
        let policy = TrustPolicy::default();
        // Car ceiling is 100; 150 trips the type mismatch but not the
        // absolute ceiling (500)
        let flags = evaluate_rules(&policy, &card(500, VehicleType::Car), 150, 1_700_000_000, None);
        assert!(flags.contains(&RuleFlag::TypeTariffMismatch));
        assert!(!flags.contains(&RuleFlag::AmountCeiling));
    }

    #[test]
    fn test_absolute_ceiling() {
        let policy = TrustPolicy::default();
        let flags = evaluate_rules(&policy, &card(5000, VehicleType::Truck), 900, 1_700_000_000, None);
        assert!(flags.contains(&RuleFlag::AmountCeiling));
    }

    #[test]
    fn test_duplicate_window_boundary() {
        let policy = TrustPolicy::default();
        let now = 1_700_000_000;

        // Exactly at the 60s window edge still counts as a duplicate
        let flags = evaluate_rules(&policy, &card(500, VehicleType::Car), 50, now, Some(now - 60));
        assert!(flags.contains(&RuleFlag::DuplicateScanWindow));

        // One second past the window is clean
        let flags = evaluate_rules(&policy, &card(500, VehicleType::Car), 50, now, Some(now - 61));
        assert!(!flags.contains(&RuleFlag::DuplicateScanWindow));
    }

    #[test]
    fn test_insufficient_balance() {
        let policy = TrustPolicy::default();
        let flags = evaluate_rules(&policy, &card(20, VehicleType::Car), 50, 1_700_000_000, None);
        assert!(flags.contains(&RuleFlag::InsufficientBalance));
        assert!(RuleFlag::InsufficientBalance.is_critical());
    }
}
