use std::sync::{Mutex, PoisonError};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::model::Payment;

/// Reason recorded when the simulated gateway declines a payment.
pub const DECLINE_REASON: &str = "Insufficient funds";

/// Verdict of the payment gateway for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Approved { transaction_id: String },
    Declined { reason: String },
}

/// Decides the outcome of a settlement attempt.
pub trait SettlementDecider: Send + Sync {
    fn decide(&self, payment: &Payment) -> Decision;
}

/// Bernoulli gateway: approves with a fixed probability.
///
/// Transaction ids have the form `txn_` followed by 12 hex digits, drawn
/// from the same generator so a seeded decider is fully reproducible.
pub struct RandomSettlement {
    success_probability: f64,
    rng: Mutex<StdRng>,
}

impl RandomSettlement {
    pub const DEFAULT_SUCCESS_PROBABILITY: f64 = 0.9;

    pub fn new(success_probability: f64) -> Self {
        Self::with_rng(success_probability, StdRng::from_entropy())
    }

    pub fn seeded(success_probability: f64, seed: u64) -> Self {
        Self::with_rng(success_probability, StdRng::seed_from_u64(seed))
    }

    fn with_rng(success_probability: f64, rng: StdRng) -> Self {
        let success_probability = if success_probability.is_nan() {
            Self::DEFAULT_SUCCESS_PROBABILITY
        } else {
            success_probability.clamp(0.0, 1.0)
        };
        Self {
            success_probability,
            rng: Mutex::new(rng),
        }
    }

    pub fn success_probability(&self) -> f64 {
        self.success_probability
    }
}

impl Default for RandomSettlement {
    fn default() -> Self {
        Self::new(Self::DEFAULT_SUCCESS_PROBABILITY)
    }
}

impl SettlementDecider for RandomSettlement {
    fn decide(&self, _payment: &Payment) -> Decision {
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        if rng.gen_bool(self.success_probability) {
            let digits: u64 = rng.gen_range(0..1u64 << 48);
            Decision::Approved {
                transaction_id: format!("txn_{digits:012x}"),
            }
        } else {
            Decision::Declined {
                reason: DECLINE_REASON.to_string(),
            }
        }
    }
}

/// Gateway with a predetermined verdict.
#[derive(Debug, Clone, Copy)]
pub struct FixedSettlement {
    approve: bool,
}

impl FixedSettlement {
    pub fn approve() -> Self {
        Self { approve: true }
    }

    pub fn decline() -> Self {
        Self { approve: false }
    }
}

impl SettlementDecider for FixedSettlement {
    fn decide(&self, payment: &Payment) -> Decision {
        if self.approve {
            let hex = payment.id.as_uuid().simple().to_string();
            Decision::Approved {
                transaction_id: format!("txn_{}", &hex[..12]),
            }
        } else {
            Decision::Declined {
                reason: DECLINE_REASON.to_string(),
            }
        }
    }
}
