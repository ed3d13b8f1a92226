//! Link mutations. Each function runs inside the caller's SQL transaction
//! and finishes by recomputing the affected transaction.

use chrono::{DateTime, Utc};
use spendy_core::{
    CanonicalField, CanonicalFields, SourceEventId, Transaction, TransactionDraft, TransactionId,
    TransactionSourceLink, ValidationError,
};
use spendy_storage::{cards, links, source_events, transactions, TransactionWrite};
use sqlx::SqliteConnection;
use std::collections::BTreeSet;

use crate::canonicalize::{identity, Resolver};
use crate::error::ServiceError;

async fn ensure_transaction(
    conn: &mut SqliteConnection,
    id: TransactionId,
) -> Result<Transaction, ServiceError> {
    transactions::get_transaction(conn, id)
        .await?
        .ok_or(ServiceError::TransactionNotFound(id))
}

/// Links an event to a transaction. The first link of a transaction is
/// always primary; otherwise only when `make_primary` asks for it.
pub async fn link(
    conn: &mut SqliteConnection,
    resolver: &Resolver,
    transaction_id: TransactionId,
    source_event_id: SourceEventId,
    confidence: Option<f64>,
    make_primary: bool,
    now: DateTime<Utc>,
) -> Result<Transaction, ServiceError> {
    ensure_transaction(conn, transaction_id).await?;
    source_events::get_source_event(conn, source_event_id)
        .await?
        .ok_or(ServiceError::SourceEventNotFound(source_event_id))?;

    let already = ServiceError::AlreadyLinked {
        transaction_id,
        source_event_id,
    };
    if links::get_link(conn, transaction_id, source_event_id)
        .await?
        .is_some()
    {
        return Err(already);
    }

    let is_primary = make_primary || links::count_links(conn, transaction_id).await? == 0;
    if is_primary {
        links::clear_primary(conn, transaction_id).await?;
    }
    let new_link = TransactionSourceLink {
        transaction_id,
        source_event_id,
        match_confidence: confidence,
        is_primary,
        created_at: now,
    };
    match links::insert_link(conn, &new_link).await {
        Ok(()) => {}
        Err(e) if e.is_unique_violation() => return Err(already),
        Err(e) => return Err(e.into()),
    }
    tracing::info!(
        transaction_id = %transaction_id,
        source_event_id = %source_event_id,
        confidence = ?confidence,
        is_primary,
        "linked source event"
    );

    resolver.recompute(conn, transaction_id, now).await
}

/// Removes a link. When the primary goes and others remain, the best
/// remaining link (confidence, then age) is promoted.
pub async fn unlink(
    conn: &mut SqliteConnection,
    resolver: &Resolver,
    transaction_id: TransactionId,
    source_event_id: SourceEventId,
    now: DateTime<Utc>,
) -> Result<Transaction, ServiceError> {
    let removed = links::delete_link(conn, transaction_id, source_event_id)
        .await?
        .ok_or(ServiceError::LinkNotFound {
            transaction_id,
            source_event_id,
        })?;

    if removed.is_primary {
        if let Some(next) = links::promotion_candidate(conn, transaction_id).await? {
            links::set_primary_flag(conn, transaction_id, next.source_event_id).await?;
            tracing::info!(
                transaction_id = %transaction_id,
                source_event_id = %next.source_event_id,
                "promoted link to primary"
            );
        }
    }
    tracing::info!(
        transaction_id = %transaction_id,
        source_event_id = %source_event_id,
        "unlinked source event"
    );

    resolver.recompute(conn, transaction_id, now).await
}

pub async fn set_primary(
    conn: &mut SqliteConnection,
    resolver: &Resolver,
    transaction_id: TransactionId,
    source_event_id: SourceEventId,
    now: DateTime<Utc>,
) -> Result<Transaction, ServiceError> {
    let target = links::get_link(conn, transaction_id, source_event_id)
        .await?
        .ok_or(ServiceError::LinkNotFound {
            transaction_id,
            source_event_id,
        })?;
    if !target.is_primary {
        links::clear_primary(conn, transaction_id).await?;
        links::set_primary_flag(conn, transaction_id, source_event_id).await?;
        tracing::info!(
            transaction_id = %transaction_id,
            source_event_id = %source_event_id,
            "primary link changed"
        );
    }
    resolver.recompute(conn, transaction_id, now).await
}

/// Creates a transaction for `source_event_id` and links it as primary
/// with full confidence. Draft values override the event's parsed fields
/// and are recorded as manual edits.
pub async fn create_and_link(
    conn: &mut SqliteConnection,
    resolver: &Resolver,
    draft: &TransactionDraft,
    source_event_id: SourceEventId,
    now: DateTime<Utc>,
) -> Result<Transaction, ServiceError> {
    let event = source_events::get_source_event(conn, source_event_id)
        .await?
        .ok_or(ServiceError::SourceEventNotFound(source_event_id))?;
    let card_id = draft
        .card_id
        .or(event.card_id)
        .ok_or(ValidationError::MissingField("card_id"))?;
    let card = cards::get_card(conn, card_id)
        .await?
        .ok_or(ServiceError::CardNotFound(card_id))?;

    let parsed = &event.parsed;
    let fields = CanonicalFields {
        amount: draft
            .amount
            .or(parsed.amount)
            .ok_or(ValidationError::MissingField("amount"))?,
        currency: draft
            .currency
            .clone()
            .or_else(|| parsed.currency.clone())
            .or_else(|| card.currency.clone())
            .ok_or(ValidationError::MissingField("currency"))?,
        original_amount: draft.original_amount,
        original_currency: draft.original_currency.clone(),
        fx_rate: draft.fx_rate,
        transaction_datetime: draft
            .transaction_datetime
            .or(Some(event.effective_transaction_datetime())),
        posting_datetime: draft.posting_datetime.or(parsed.posting_datetime),
        description: draft
            .description
            .clone()
            .or_else(|| parsed.description.clone())
            .unwrap_or_default(),
        location: draft.location.clone().or_else(|| parsed.location.clone()),
        kind: draft.kind.or(parsed.kind).unwrap_or_default(),
    };
    fields.validate()?;

    let edited_fields: BTreeSet<CanonicalField> = draft.supplied_fields();
    let edited_at = (!edited_fields.is_empty()).then_some(now);
    let id = identity(card_id, &fields);
    let write = TransactionWrite {
        card_id,
        canonical: &fields,
        fx_fee: draft.fx_fee,
        merchant_norm: &id.merchant_norm,
        fingerprint: &id.fingerprint,
        fingerprint_debug: &id.fingerprint_debug,
        edited_fields: &edited_fields,
        edited_at,
    };
    let transaction_id = transactions::insert_transaction(conn, &write, now).await?;
    tracing::info!(
        transaction_id = %transaction_id,
        source_event_id = %source_event_id,
        card_id = %card_id,
        "created transaction"
    );

    link(conn, resolver, transaction_id, source_event_id, Some(1.0), true, now).await
}
