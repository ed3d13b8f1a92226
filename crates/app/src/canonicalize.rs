//! Rebuilds a transaction's canonical fields from everything linked to it.

use chrono::{DateTime, Utc};
use spendy_core::{
    day_bucket, CanonicalFields, Card, CardId, LinkedSource, Money, SourceEvent, Transaction,
    TransactionId,
};
use spendy_import::{
    fingerprint, fingerprint_key, normalize, Canonicalizer, FingerprintInput, ManualEdits,
    MatchableObservation, Observation,
};
use spendy_storage::{cards, links, transactions, TransactionWrite};
use sqlx::SqliteConnection;
use std::sync::Arc;

use crate::error::ServiceError;
use crate::fx::{FxError, FxRates};

/// Amount and currency of an event expressed in its card's currency when a
/// rate is known, with the original figures kept alongside.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvertedAmount {
    pub amount: Money,
    pub currency: String,
    pub original_amount: Option<Money>,
    pub original_currency: Option<String>,
    pub fx_rate: Option<rust_decimal::Decimal>,
}

/// Derived identity columns for a set of canonical fields.
#[derive(Debug, Clone)]
pub struct Identity {
    pub merchant_norm: String,
    pub fingerprint: String,
    pub fingerprint_debug: String,
}

pub fn identity(card_id: CardId, fields: &CanonicalFields) -> Identity {
    let merchant_norm = normalize(&fields.description);
    let input = FingerprintInput {
        card_id,
        date_bucket: day_bucket(fields.posting_datetime, fields.transaction_datetime),
        amount: fields.amount,
        currency: &fields.currency,
        merchant_norm: &merchant_norm,
    };
    Identity {
        fingerprint: fingerprint(&input),
        fingerprint_debug: fingerprint_key(&input),
        merchant_norm,
    }
}

/// Canonicalizer plus the FX source it converts observations with.
pub struct Resolver {
    canonicalizer: Canonicalizer,
    fx: Arc<dyn FxRates>,
}

impl Resolver {
    pub fn new(canonicalizer: Canonicalizer, fx: Arc<dyn FxRates>) -> Self {
        Self { canonicalizer, fx }
    }

    /// Same canonicalizer, different rate source.
    pub fn with_fx(self, fx: Arc<dyn FxRates>) -> Self {
        Self { fx, ..self }
    }

    /// A failed or missing rate keeps the event in its own currency.
    pub async fn convert(
        &self,
        amount: Money,
        currency: &str,
        card_currency: Option<&str>,
    ) -> ConvertedAmount {
        let unconverted = ConvertedAmount {
            amount,
            currency: currency.to_string(),
            original_amount: None,
            original_currency: None,
            fx_rate: None,
        };
        let Some(target) = card_currency.filter(|c| *c != currency) else {
            return unconverted;
        };
        let rate = match self.fx.rate(currency, target).await {
            Ok(rate) => rate,
            Err(e @ FxError::Unsupported { .. }) => {
                tracing::debug!(error = %e, "keeping original currency");
                return unconverted;
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    from = currency,
                    to = target,
                    "fx lookup failed; keeping original currency"
                );
                return unconverted;
            }
        };
        match amount.convert(rate).filter(|a| !a.is_zero()) {
            Some(converted) => ConvertedAmount {
                amount: converted,
                currency: target.to_string(),
                original_amount: Some(amount),
                original_currency: Some(currency.to_string()),
                fx_rate: Some(rate),
            },
            None => unconverted,
        }
    }

    /// What a parsed event offers the matcher, or `None` when it lacks a
    /// card, an amount or a currency.
    pub async fn matchable(
        &self,
        event: &SourceEvent,
        card: &Card,
    ) -> Option<MatchableObservation> {
        let amount = event.parsed.amount?;
        let currency = event.parsed.currency.as_deref()?;
        let converted = self
            .convert(amount, currency, card.currency.as_deref())
            .await;
        let fields = CanonicalFields {
            amount: converted.amount,
            currency: converted.currency.clone(),
            original_amount: None,
            original_currency: None,
            fx_rate: None,
            transaction_datetime: Some(event.effective_transaction_datetime()),
            posting_datetime: event.parsed.posting_datetime,
            description: event.parsed.description.clone().unwrap_or_default(),
            location: None,
            kind: Default::default(),
        };
        let id = identity(card.id, &fields);
        Some(MatchableObservation {
            card_id: card.id,
            amount: converted.amount,
            currency: converted.currency,
            datetimes: fields
                .transaction_datetime
                .into_iter()
                .chain(fields.posting_datetime)
                .collect(),
            merchant_norm: id.merchant_norm,
            fingerprint: id.fingerprint,
        })
    }

    pub async fn observation(&self, linked: &LinkedSource, card: &Card) -> Option<Observation> {
        let event = &linked.source_event;
        if !event.is_parsed() {
            return None;
        }
        let parsed = &event.parsed;
        let converted = match (parsed.amount, parsed.currency.as_deref()) {
            (Some(amount), Some(currency)) => {
                Some(self.convert(amount, currency, card.currency.as_deref()).await)
            }
            _ => None,
        };
        Some(Observation {
            source_event_id: event.id,
            source_type: event.source_type,
            is_primary: linked.link.is_primary,
            confidence: linked.link.match_confidence,
            contributed_at: event.contributed_at(),
            amount: converted.as_ref().map(|c| c.amount),
            currency: converted.as_ref().map(|c| c.currency.clone()),
            original_amount: converted.as_ref().and_then(|c| c.original_amount),
            original_currency: converted.as_ref().and_then(|c| c.original_currency.clone()),
            fx_rate: converted.as_ref().and_then(|c| c.fx_rate),
            transaction_datetime: Some(event.effective_transaction_datetime()),
            posting_datetime: parsed.posting_datetime,
            description: parsed.description.clone(),
            location: parsed.location.clone(),
            kind: parsed.kind,
        })
    }

    /// Re-resolves the transaction from its linked sources and writes the
    /// result back. Call inside the SQL transaction that changed the links.
    pub async fn recompute(
        &self,
        conn: &mut SqliteConnection,
        transaction_id: TransactionId,
        now: DateTime<Utc>,
    ) -> Result<Transaction, ServiceError> {
        let current = transactions::get_transaction(conn, transaction_id)
            .await?
            .ok_or(ServiceError::TransactionNotFound(transaction_id))?;
        let card = cards::get_card(conn, current.card_id)
            .await?
            .ok_or(ServiceError::CardNotFound(current.card_id))?;

        let linked = links::linked_sources(conn, transaction_id).await?;
        let mut observations = Vec::with_capacity(linked.len());
        for l in &linked {
            observations.extend(self.observation(l, &card).await);
        }

        let edits = ManualEdits {
            fields: current.edited_fields.clone(),
            edited_at: current.edited_at,
        };
        let resolution = self
            .canonicalizer
            .resolve(&current.canonical, &observations, &edits);
        resolution.fields.validate()?;
        if resolution.fields.posts_before_transaction() {
            tracing::warn!(
                transaction_id = %transaction_id,
                "posting date precedes transaction date"
            );
        }
        if resolution.edited_fields.len() < current.edited_fields.len() {
            tracing::info!(
                transaction_id = %transaction_id,
                "manual edits superseded by newer source data"
            );
        }

        let id = identity(current.card_id, &resolution.fields);
        let write = TransactionWrite {
            card_id: current.card_id,
            canonical: &resolution.fields,
            fx_fee: current.fx_fee,
            merchant_norm: &id.merchant_norm,
            fingerprint: &id.fingerprint,
            fingerprint_debug: &id.fingerprint_debug,
            edited_fields: &resolution.edited_fields,
            edited_at: resolution.edited_at,
        };
        transactions::update_transaction(conn, transaction_id, &write, now).await?;
        tracing::debug!(
            transaction_id = %transaction_id,
            sources = observations.len(),
            winners = ?resolution.winners,
            "canonical fields recomputed"
        );

        transactions::get_transaction(conn, transaction_id)
            .await?
            .ok_or(ServiceError::TransactionNotFound(transaction_id))
    }
}
