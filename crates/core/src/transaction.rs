use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::card::CardId;
use crate::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TransactionId(pub i64);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Purchase,
    Topup,
    Refund,
    #[default]
    Other,
}

impl fmt::Display for TransactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionKind::Purchase => write!(f, "purchase"),
            TransactionKind::Topup => write!(f, "topup"),
            TransactionKind::Refund => write!(f, "refund"),
            TransactionKind::Other => write!(f, "other"),
        }
    }
}

impl std::str::FromStr for TransactionKind {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "purchase" => Ok(TransactionKind::Purchase),
            "topup" => Ok(TransactionKind::Topup),
            "refund" => Ok(TransactionKind::Refund),
            "other" => Ok(TransactionKind::Other),
            other => Err(format!("Unknown transaction kind: '{other}'")),
        }
    }
}

/// Canonical fields the priority policy resolves. The amount entry covers
/// currency and the FX fields as well: they always come from one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanonicalField {
    Amount,
    TransactionDatetime,
    PostingDatetime,
    Description,
    Location,
    Kind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalFields {
    pub amount: Money,
    pub currency: String,
    pub original_amount: Option<Money>,
    pub original_currency: Option<String>,
    pub fx_rate: Option<Decimal>,
    pub transaction_datetime: Option<DateTime<Utc>>,
    pub posting_datetime: Option<DateTime<Utc>>,
    pub description: String,
    pub location: Option<String>,
    pub kind: TransactionKind,
}

impl CanonicalFields {
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.amount.is_zero() {
            return Err(ValidationError::ZeroAmount);
        }
        validate_currency(&self.currency)?;
        if let Some(original) = &self.original_currency {
            validate_currency(original)?;
        }
        Ok(())
    }

    /// Advisory rule: a transaction should not post on a day before it
    /// happened. Statements carry dates only, so the comparison is by day.
    pub fn posts_before_transaction(&self) -> bool {
        matches!(
            (self.transaction_datetime, self.posting_datetime),
            (Some(t), Some(p)) if p.date_naive() < t.date_naive()
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub card_id: CardId,
    #[serde(flatten)]
    pub canonical: CanonicalFields,
    pub fx_fee: Option<Money>,
    pub merchant_norm: String,
    pub fingerprint: String,
    pub fingerprint_debug: String,
    /// Fields pinned by a manual edit, and when the edit happened.
    pub edited_fields: BTreeSet<CanonicalField>,
    pub edited_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied values for creating a transaction from a source event.
/// Anything left `None` is taken from the source's parsed fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionDraft {
    pub card_id: Option<CardId>,
    pub amount: Option<Money>,
    pub currency: Option<String>,
    pub transaction_datetime: Option<DateTime<Utc>>,
    pub posting_datetime: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub kind: Option<TransactionKind>,
    pub original_amount: Option<Money>,
    pub original_currency: Option<String>,
    pub fx_rate: Option<Decimal>,
    pub fx_fee: Option<Money>,
}

impl TransactionDraft {
    /// Fields the caller pinned explicitly.
    pub fn supplied_fields(&self) -> BTreeSet<CanonicalField> {
        let mut fields = BTreeSet::new();
        if self.amount.is_some()
            || self.currency.is_some()
            || self.original_amount.is_some()
            || self.fx_rate.is_some()
        {
            fields.insert(CanonicalField::Amount);
        }
        if self.transaction_datetime.is_some() {
            fields.insert(CanonicalField::TransactionDatetime);
        }
        if self.posting_datetime.is_some() {
            fields.insert(CanonicalField::PostingDatetime);
        }
        if self.description.is_some() {
            fields.insert(CanonicalField::Description);
        }
        if self.location.is_some() {
            fields.insert(CanonicalField::Location);
        }
        if self.kind.is_some() {
            fields.insert(CanonicalField::Kind);
        }
        fields
    }
}

/// A manual correction to a transaction's canonical fields.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransactionEdit {
    pub amount: Option<Money>,
    pub currency: Option<String>,
    pub transaction_datetime: Option<DateTime<Utc>>,
    pub posting_datetime: Option<DateTime<Utc>>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub kind: Option<TransactionKind>,
    pub fx_fee: Option<Money>,
}

impl TransactionEdit {
    /// Writes the edit into `fields` and returns which canonical fields it
    /// touched. `fx_fee` is not a resolved field and is handled by the caller.
    pub fn apply(&self, fields: &mut CanonicalFields) -> BTreeSet<CanonicalField> {
        let mut touched = BTreeSet::new();
        if let Some(amount) = self.amount {
            fields.amount = amount;
            touched.insert(CanonicalField::Amount);
        }
        if let Some(currency) = &self.currency {
            fields.currency = currency.clone();
            touched.insert(CanonicalField::Amount);
        }
        if let Some(dt) = self.transaction_datetime {
            fields.transaction_datetime = Some(dt);
            touched.insert(CanonicalField::TransactionDatetime);
        }
        if let Some(dt) = self.posting_datetime {
            fields.posting_datetime = Some(dt);
            touched.insert(CanonicalField::PostingDatetime);
        }
        if let Some(description) = &self.description {
            fields.description = description.clone();
            touched.insert(CanonicalField::Description);
        }
        if let Some(location) = &self.location {
            fields.location = Some(location.clone());
            touched.insert(CanonicalField::Location);
        }
        if let Some(kind) = self.kind {
            fields.kind = kind;
            touched.insert(CanonicalField::Kind);
        }
        touched
    }

    pub fn is_empty(&self) -> bool {
        self.amount.is_none()
            && self.currency.is_none()
            && self.transaction_datetime.is_none()
            && self.posting_datetime.is_none()
            && self.description.is_none()
            && self.location.is_none()
            && self.kind.is_none()
            && self.fx_fee.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Transaction amount must be non-zero")]
    ZeroAmount,
    #[error("Invalid currency code: '{0}' (expected three uppercase letters)")]
    InvalidCurrency(String),
    #[error("Missing required field: {0}")]
    MissingField(&'static str),
}

/// Currency codes are exactly three ASCII uppercase letters.
pub fn validate_currency(code: &str) -> Result<(), ValidationError> {
    if code.len() == 3 && code.chars().all(|c| c.is_ascii_uppercase()) {
        Ok(())
    } else {
        Err(ValidationError::InvalidCurrency(code.to_string()))
    }
}
