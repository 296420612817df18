use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{Money, OrderId, PaymentId, UserId, Version};
use events::DEFAULT_PAYMENT_METHOD;
use serde::{Deserialize, Serialize};

use crate::{PaymentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Completed => "completed",
            PaymentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PaymentStatus::Completed | PaymentStatus::Failed)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "processing" => Ok(PaymentStatus::Processing),
            "completed" => Ok(PaymentStatus::Completed),
            "failed" => Ok(PaymentStatus::Failed),
            other => Err(PaymentError::Corrupt(format!("unknown payment status: {other}"))),
        }
    }
}

/// A settlement attempt for one order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: Money,
    pub payment_method: String,
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub version: Version,
}

impl Payment {
    /// A new attempt, already in `Processing`.
    pub fn processing(order_id: OrderId, user_id: UserId, amount: Money, now: DateTime<Utc>) -> Self {
        Self {
            id: PaymentId::new(),
            order_id,
            user_id,
            amount,
            payment_method: DEFAULT_PAYMENT_METHOD.to_string(),
            status: PaymentStatus::Processing,
            transaction_id: None,
            failure_reason: None,
            created_at: now,
            updated_at: now,
            processed_at: None,
            failed_at: None,
            version: Version::first(),
        }
    }

    pub fn with_payment_method(mut self, payment_method: impl Into<String>) -> Self {
        self.payment_method = payment_method.into();
        self
    }

    pub(crate) fn complete(&mut self, transaction_id: String, now: DateTime<Utc>) {
        self.status = PaymentStatus::Completed;
        self.transaction_id = Some(transaction_id);
        self.processed_at = Some(now);
        self.updated_at = now;
        self.version = self.version.next();
    }

    pub(crate) fn fail(&mut self, reason: String, now: DateTime<Utc>) {
        self.status = PaymentStatus::Failed;
        self.failure_reason = Some(reason);
        self.failed_at = Some(now);
        self.updated_at = now;
        self.version = self.version.next();
    }

    /// The recorded outcome, if the payment is terminal.
    pub fn outcome(&self) -> Option<PaymentOutcome> {
        match self.status {
            PaymentStatus::Completed => Some(PaymentOutcome::Completed {
                payment_id: self.id,
                transaction_id: self.transaction_id.clone().unwrap_or_default(),
            }),
            PaymentStatus::Failed => Some(PaymentOutcome::Declined {
                payment_id: self.id,
                reason: self.failure_reason.clone().unwrap_or_default(),
            }),
            PaymentStatus::Pending | PaymentStatus::Processing => None,
        }
    }
}

/// Result of a settlement request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentOutcome {
    Completed {
        payment_id: PaymentId,
        transaction_id: String,
    },
    Declined {
        payment_id: PaymentId,
        reason: String,
    },
}

impl PaymentOutcome {
    pub fn payment_id(&self) -> PaymentId {
        match self {
            PaymentOutcome::Completed { payment_id, .. } | PaymentOutcome::Declined { payment_id, .. } => {
                *payment_id
            }
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self, PaymentOutcome::Completed { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentOutcome::Completed { .. } => "completed",
            PaymentOutcome::Declined { .. } => "declined",
        }
    }
}
