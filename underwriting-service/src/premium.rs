//! Premium calculation.
//!
//! The quote is deterministic: a fixed base premium scaled by a running risk
//! score. Each input contributes its multiplier only when present, and
//! `risk_factors` echoes back exactly the inputs that were used, so an
//! auditor can reproduce any stored quote from its row alone.

use event_schema::PolicyData;
use serde_json::{json, Map, Value};

pub const BASE_PREMIUM: f64 = 1000.0;

/// Result of one premium calculation.
#[derive(Debug, Clone)]
pub struct PremiumQuote {
    pub base_premium: f64,
    pub risk_score: f64,
    pub risk_factors: Map<String, Value>,
    pub final_premium: f64,
}

/// Score the policy and price it.
pub fn calculate(policy: &PolicyData) -> PremiumQuote {
    let mut risk_factors = Map::new();
    let mut risk_score = 1.0;

    if let Some(age) = policy.driver_age {
        risk_factors.insert("driver_age".to_string(), json!(age));
        if age < 25.0 {
            risk_score *= 1.5;
        } else if age > 65.0 {
            risk_score *= 1.2;
        } else {
            risk_score *= 0.9;
        }
    }

    if let Some(experience) = policy.driving_experience {
        risk_factors.insert("driving_experience".to_string(), json!(experience));
        if experience < 3.0 {
            risk_score *= 1.3;
        } else if experience > 10.0 {
            risk_score *= 0.8;
        }
    }

    if let Some(car_type) = policy.car_type.as_deref() {
        risk_factors.insert("car_type".to_string(), json!(car_type));
        match car_type {
            "sports" => risk_score *= 1.8,
            "suv" => risk_score *= 1.1,
            "sedan" => risk_score *= 0.9,
            "electric" => risk_score *= 0.7,
            _ => {}
        }
    }

    if let Some(region) = policy.region.as_deref() {
        risk_factors.insert("region".to_string(), json!(region));
        match region {
            "moscow" => risk_score *= 1.4,
            "spb" => risk_score *= 1.2,
            _ => risk_score *= 0.8,
        }
    }

    if let Some(accidents) = policy.accidents_count {
        risk_factors.insert("accidents_count".to_string(), json!(accidents));
        risk_score *= 1.3f64.powf(accidents);
    }

    PremiumQuote {
        base_premium: BASE_PREMIUM,
        risk_score,
        risk_factors,
        final_premium: round_currency(BASE_PREMIUM * risk_score),
    }
}

/// Half-away-from-zero rounding on the second decimal place.
fn round_currency(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}
