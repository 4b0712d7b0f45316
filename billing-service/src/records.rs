//! Billing record vocabulary and refund arithmetic.

use chrono::{DateTime, Duration, Utc};

/// A policy is billed for one year of coverage.
pub const POLICY_DURATION_DAYS: i64 = 365;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingType {
    Premium,
    Refund,
    Penalty,
}

impl BillingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingType::Premium => "premium",
            BillingType::Refund => "refund",
            BillingType::Penalty => "penalty",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingStatus {
    Pending,
    Paid,
    Failed,
}

impl BillingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingStatus::Pending => "pending",
            BillingStatus::Paid => "paid",
            BillingStatus::Failed => "failed",
        }
    }
}

/// Pro-rata refund for the unused part of the policy year.
///
/// Returns zero once the full year has elapsed. The result is truncated to
/// whole cents, never rounded up.
pub fn refund_amount(
    original_amount: f64,
    paid_at: DateTime<Utc>,
    cancelled_at: DateTime<Utc>,
) -> f64 {
    let policy_duration = Duration::days(POLICY_DURATION_DAYS);
    let used = cancelled_at - paid_at;

    if used >= policy_duration {
        return 0.0;
    }

    let unused_ratio =
        (policy_duration - used).num_seconds() as f64 / policy_duration.num_seconds() as f64;
    truncate_currency(original_amount * unused_ratio)
}

fn truncate_currency(amount: f64) -> f64 {
    (amount * 100.0).trunc() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(paid_days_ago: i64, cancelled_at: DateTime<Utc>) -> DateTime<Utc> {
        cancelled_at - Duration::days(paid_days_ago)
    }

    #[test]
    fn pro_rata_refund_after_73_days() {
        let cancelled = Utc::now();
        // 292 unused days out of 365 is exactly 80%
        let refund = refund_amount(1200.00, at(73, cancelled), cancelled);
        assert_eq!(refund, 960.00);
    }

    #[test]
    fn partial_days_shrink_the_refund() {
        let cancelled = Utc::now();
        let paid_at = cancelled - Duration::days(73) - Duration::hours(2);
        // 1200 x 7006h / 8760h = 959.7260..., truncated
        let refund = refund_amount(1200.00, paid_at, cancelled);
        assert_eq!(refund, 959.72);
    }

    #[test]
    fn no_refund_after_full_year() {
        let cancelled = Utc::now();
        assert_eq!(refund_amount(1200.00, at(365, cancelled), cancelled), 0.0);
        assert_eq!(refund_amount(1200.00, at(400, cancelled), cancelled), 0.0);
    }

    #[test]
    fn full_refund_when_cancelled_immediately() {
        let cancelled = Utc::now();
        assert_eq!(refund_amount(1200.00, at(0, cancelled), cancelled), 1200.00);
    }

    #[test]
    fn fractional_cents_are_truncated_not_rounded() {
        assert_eq!(truncate_currency(959.7299), 959.72);
        assert_eq!(truncate_currency(0.019), 0.01);
    }

    #[test]
    fn billing_vocabulary_matches_the_schema() {
        assert_eq!(BillingType::Premium.as_str(), "premium");
        assert_eq!(BillingType::Refund.as_str(), "refund");
        assert_eq!(BillingType::Penalty.as_str(), "penalty");
        assert_eq!(BillingStatus::Pending.as_str(), "pending");
        assert_eq!(BillingStatus::Paid.as_str(), "paid");
        assert_eq!(BillingStatus::Failed.as_str(), "failed");
    }
}
