//! Transaction records and partial updates.
//!
//! These types are the bridge's own view of a transaction, decoupled from
//! the remote GraphQL response structures.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::error::BridgeError;

/// A single transaction as returned by `GET /transactions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub date: Option<String>,
    pub amount: Option<f64>,
    pub merchant_name: Option<String>,
    pub category_id: Option<String>,
    pub category_name: Option<String>,
    pub account_name: Option<String>,
    pub notes: Option<String>,
    #[serde(default)]
    pub needs_review: bool,
    #[serde(default)]
    pub pending: bool,
}

/// Partial update for a transaction. `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransactionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_review: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merchant_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount: Option<f64>,
    /// Calendar date in `YYYY-MM-DD` form.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

impl TransactionUpdate {
    pub fn is_empty(&self) -> bool {
        self.notes.is_none()
            && self.category_id.is_none()
            && self.needs_review.is_none()
            && self.merchant_name.is_none()
            && self.amount.is_none()
            && self.date.is_none()
    }

    /// Reject malformed field values before anything reaches the remote.
    pub fn validate(&self) -> Result<(), BridgeError> {
        if let Some(ref category_id) = self.category_id {
            if category_id.trim().is_empty() {
                return Err(BridgeError::ValidationError(
                    "category_id must not be blank".to_string(),
                ));
            }
        }
        if let Some(ref merchant) = self.merchant_name {
            if merchant.trim().is_empty() {
                return Err(BridgeError::ValidationError(
                    "merchant_name must not be blank".to_string(),
                ));
            }
        }
        if let Some(amount) = self.amount {
            if !amount.is_finite() {
                return Err(BridgeError::ValidationError(
                    "amount must be a finite number".to_string(),
                ));
            }
        }
        if let Some(ref date) = self.date {
            if NaiveDate::parse_from_str(date, "%Y-%m-%d").is_err() {
                return Err(BridgeError::ValidationError(format!(
                    "date must be YYYY-MM-DD, got {:?}",
                    date
                )));
            }
        }
        Ok(())
    }

    /// Apply this update on top of an existing record.
    pub fn apply_to(&self, txn: &mut Transaction) {
        if let Some(ref notes) = self.notes {
            txn.notes = Some(notes.clone());
        }
        if let Some(ref category_id) = self.category_id {
            txn.category_id = Some(category_id.clone());
        }
        if let Some(needs_review) = self.needs_review {
            txn.needs_review = needs_review;
        }
        if let Some(ref merchant) = self.merchant_name {
            txn.merchant_name = Some(merchant.clone());
        }
        if let Some(amount) = self.amount {
            txn.amount = Some(amount);
        }
        if let Some(ref date) = self.date {
            txn.date = Some(date.clone());
        }
    }
}
