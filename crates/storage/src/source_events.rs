use chrono::{DateTime, Utc};
use spendy_core::{
    CardId, Money, ParseStatus, ParsedFields, SourceEvent, SourceEventId, SourceType, TransactionId,
    TransactionKind,
};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::db::StorageError;

/// Everything needed to persist a freshly ingested payload.
#[derive(Debug, Clone)]
pub struct NewSourceEvent {
    pub source_type: SourceType,
    pub raw_text: Option<String>,
    pub file_path: Option<String>,
    pub raw_hash: String,
    pub parsed: ParsedFields,
    pub account_id: Option<i64>,
    pub card_id: Option<CardId>,
    pub sender: Option<String>,
    pub recipients: Option<String>,
    pub received_at: DateTime<Utc>,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub parsed_at: Option<DateTime<Utc>>,
}

/// Outcome of a (re)parse, written back onto an existing event.
#[derive(Debug, Clone)]
pub struct ParseUpdate {
    pub parsed: ParsedFields,
    pub card_id: Option<CardId>,
    pub parse_status: ParseStatus,
    pub parse_error: Option<String>,
    pub parsed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct SourceEventFilter {
    pub source_type: Option<SourceType>,
    pub parse_status: Option<ParseStatus>,
    /// `Some(true)`: only linked events; `Some(false)`: only pending ones.
    pub has_transaction: Option<bool>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(sqlx::FromRow)]
struct SourceEventRow {
    id: i64,
    source_type: String,
    raw_text: Option<String>,
    file_path: Option<String>,
    raw_hash: String,
    parsed_amount_minor: Option<i64>,
    parsed_currency: Option<String>,
    parsed_transaction_datetime: Option<DateTime<Utc>>,
    parsed_posting_datetime: Option<DateTime<Utc>>,
    parsed_description: Option<String>,
    parsed_card_last4: Option<String>,
    parsed_kind: Option<String>,
    parsed_location: Option<String>,
    account_id: Option<i64>,
    card_id: Option<i64>,
    sender: Option<String>,
    recipients: Option<String>,
    received_at: DateTime<Utc>,
    parse_status: String,
    parse_error: Option<String>,
    reprocess_version: i64,
    created_at: DateTime<Utc>,
    parsed_at: Option<DateTime<Utc>>,
}

impl TryFrom<SourceEventRow> for SourceEvent {
    type Error = StorageError;

    fn try_from(r: SourceEventRow) -> Result<Self, Self::Error> {
        let corrupt = |m: String| StorageError::corrupt("source_events", m);
        let kind = r
            .parsed_kind
            .as_deref()
            .map(str::parse::<TransactionKind>)
            .transpose()
            .map_err(corrupt)?;
        Ok(SourceEvent {
            id: SourceEventId(r.id),
            source_type: r.source_type.parse().map_err(corrupt)?,
            raw_text: r.raw_text,
            file_path: r.file_path,
            raw_hash: r.raw_hash,
            parsed: ParsedFields {
                amount: r.parsed_amount_minor.map(Money::from_minor),
                currency: r.parsed_currency,
                transaction_datetime: r.parsed_transaction_datetime,
                posting_datetime: r.parsed_posting_datetime,
                description: r.parsed_description,
                card_last4: r.parsed_card_last4,
                kind,
                location: r.parsed_location,
            },
            account_id: r.account_id,
            card_id: r.card_id.map(CardId),
            sender: r.sender,
            recipients: r.recipients,
            received_at: r.received_at,
            parse_status: r.parse_status.parse().map_err(corrupt)?,
            parse_error: r.parse_error,
            reprocess_version: r.reprocess_version,
            created_at: r.created_at,
            parsed_at: r.parsed_at,
        })
    }
}

const SOURCE_EVENT_COLUMNS: &str = "id, source_type, raw_text, file_path, raw_hash, \
    parsed_amount_minor, parsed_currency, parsed_transaction_datetime, parsed_posting_datetime, \
    parsed_description, parsed_card_last4, parsed_kind, parsed_location, account_id, card_id, \
    sender, recipients, received_at, parse_status, parse_error, reprocess_version, created_at, parsed_at";

pub async fn insert_source_event(
    conn: &mut SqliteConnection,
    event: &NewSourceEvent,
) -> Result<SourceEventId, StorageError> {
    let p = &event.parsed;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO source_events (
            source_type, raw_text, file_path, raw_hash,
            parsed_amount_minor, parsed_currency, parsed_transaction_datetime, parsed_posting_datetime,
            parsed_description, parsed_card_last4, parsed_kind, parsed_location,
            account_id, card_id, sender, recipients, received_at,
            parse_status, parse_error, reprocess_version, created_at, parsed_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
        RETURNING id
        "#,
    )
    .bind(event.source_type.as_str())
    .bind(&event.raw_text)
    .bind(&event.file_path)
    .bind(&event.raw_hash)
    .bind(p.amount.map(Money::minor))
    .bind(&p.currency)
    .bind(p.transaction_datetime)
    .bind(p.posting_datetime)
    .bind(&p.description)
    .bind(&p.card_last4)
    .bind(p.kind.map(|k| k.to_string()))
    .bind(&p.location)
    .bind(event.account_id)
    .bind(event.card_id.map(|c| c.0))
    .bind(&event.sender)
    .bind(&event.recipients)
    .bind(event.received_at)
    .bind(event.parse_status.to_string())
    .bind(&event.parse_error)
    .bind(event.created_at)
    .bind(event.parsed_at)
    .fetch_one(&mut *conn)
    .await?;
    Ok(SourceEventId(id))
}

pub async fn get_source_event(
    conn: &mut SqliteConnection,
    id: SourceEventId,
) -> Result<Option<SourceEvent>, StorageError> {
    sqlx::query_as::<_, SourceEventRow>(&format!(
        "SELECT {SOURCE_EVENT_COLUMNS} FROM source_events WHERE id = ?"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?
    .map(SourceEvent::try_from)
    .transpose()
}

pub async fn find_source_event_by_hash(
    conn: &mut SqliteConnection,
    raw_hash: &str,
) -> Result<Option<SourceEvent>, StorageError> {
    sqlx::query_as::<_, SourceEventRow>(&format!(
        "SELECT {SOURCE_EVENT_COLUMNS} FROM source_events WHERE raw_hash = ?"
    ))
    .bind(raw_hash)
    .fetch_optional(&mut *conn)
    .await?
    .map(SourceEvent::try_from)
    .transpose()
}

/// Writes a parse result if the event is still at `expected_version`, and
/// bumps the version. Returns false when another reprocess got there first.
pub async fn update_parse_result(
    conn: &mut SqliteConnection,
    id: SourceEventId,
    expected_version: i64,
    update: &ParseUpdate,
) -> Result<bool, StorageError> {
    let p = &update.parsed;
    let result = sqlx::query(
        r#"
        UPDATE source_events SET
            parsed_amount_minor = ?, parsed_currency = ?, parsed_transaction_datetime = ?,
            parsed_posting_datetime = ?, parsed_description = ?, parsed_card_last4 = ?,
            parsed_kind = ?, parsed_location = ?, card_id = ?,
            parse_status = ?, parse_error = ?, parsed_at = ?,
            reprocess_version = reprocess_version + 1
        WHERE id = ? AND reprocess_version = ?
        "#,
    )
    .bind(p.amount.map(Money::minor))
    .bind(&p.currency)
    .bind(p.transaction_datetime)
    .bind(p.posting_datetime)
    .bind(&p.description)
    .bind(&p.card_last4)
    .bind(p.kind.map(|k| k.to_string()))
    .bind(&p.location)
    .bind(update.card_id.map(|c| c.0))
    .bind(update.parse_status.to_string())
    .bind(&update.parse_error)
    .bind(update.parsed_at)
    .bind(id.0)
    .bind(expected_version)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn list_source_events(
    conn: &mut SqliteConnection,
    filter: &SourceEventFilter,
) -> Result<Vec<SourceEvent>, StorageError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
        "SELECT {SOURCE_EVENT_COLUMNS} FROM source_events se WHERE 1 = 1"
    ));
    if let Some(t) = filter.source_type {
        qb.push(" AND se.source_type = ").push_bind(t.as_str());
    }
    if let Some(s) = filter.parse_status {
        qb.push(" AND se.parse_status = ").push_bind(s.to_string());
    }
    match filter.has_transaction {
        Some(true) => {
            qb.push(" AND EXISTS (SELECT 1 FROM transaction_source_links l WHERE l.source_event_id = se.id)");
        }
        Some(false) => {
            qb.push(" AND NOT EXISTS (SELECT 1 FROM transaction_source_links l WHERE l.source_event_id = se.id)");
        }
        None => {}
    }
    qb.push(" ORDER BY se.created_at DESC, se.id DESC LIMIT ")
        .push_bind(filter.limit.unwrap_or(100))
        .push(" OFFSET ")
        .push_bind(filter.offset.unwrap_or(0));

    qb.build_query_as::<SourceEventRow>()
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(SourceEvent::try_from)
        .collect()
}

/// Transactions this event is currently linked to.
pub async fn linked_transaction_ids(
    conn: &mut SqliteConnection,
    id: SourceEventId,
) -> Result<Vec<TransactionId>, StorageError> {
    let ids: Vec<i64> = sqlx::query_scalar(
        "SELECT transaction_id FROM transaction_source_links WHERE source_event_id = ? ORDER BY transaction_id",
    )
    .bind(id.0)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids.into_iter().map(TransactionId).collect())
}


#[cfg(test)]
mod tests {
    use super::fixtures::new_event;
    use super::*;
    use crate::db::test_support::temp_db;

    #[tokio::test]
    async fn insert_get_and_find_by_hash() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let mut event = new_event("h1", -12050);
        event.parsed.kind = Some(TransactionKind::Purchase);
        let id = insert_source_event(&mut conn, &event).await.unwrap();

        let stored = get_source_event(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(stored.parsed.amount, Some(Money::from_minor(-12050)));
        assert_eq!(stored.parsed.kind, Some(TransactionKind::Purchase));
        assert_eq!(stored.parse_status, ParseStatus::Parsed);
        assert_eq!(stored.reprocess_version, 0);
        assert_eq!(stored.received_at, event.received_at);

        let by_hash = find_source_event_by_hash(&mut conn, "h1").await.unwrap().unwrap();
        assert_eq!(by_hash.id, id);
        assert!(find_source_event_by_hash(&mut conn, "nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_hash_is_unique_violation() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        insert_source_event(&mut conn, &new_event("dup", -100)).await.unwrap();
        let err = insert_source_event(&mut conn, &new_event("dup", -100)).await.unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn parse_update_is_version_guarded() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let id = insert_source_event(&mut conn, &new_event("h", -100)).await.unwrap();
        let update = ParseUpdate {
            parsed: ParsedFields {
                amount: Some(Money::from_minor(-200)),
                ..Default::default()
            },
            card_id: None,
            parse_status: ParseStatus::Parsed,
            parse_error: None,
            parsed_at: Utc::now(),
        };
        assert!(update_parse_result(&mut conn, id, 0, &update).await.unwrap());
        // stale version loses
        assert!(!update_parse_result(&mut conn, id, 0, &update).await.unwrap());
        let stored = get_source_event(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(stored.reprocess_version, 1);
        assert_eq!(stored.parsed.amount, Some(Money::from_minor(-200)));
    }

    #[tokio::test]
    async fn list_filters_by_status_and_type() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        insert_source_event(&mut conn, &new_event("a", -100)).await.unwrap();
        let mut failed = new_event("b", -100);
        failed.parse_status = ParseStatus::Failed;
        failed.source_type = SourceType::PdfStatement;
        insert_source_event(&mut conn, &failed).await.unwrap();

        let all = list_source_events(&mut conn, &SourceEventFilter::default()).await.unwrap();
        assert_eq!(all.len(), 2);

        let only_failed = list_source_events(
            &mut conn,
            &SourceEventFilter {
                parse_status: Some(ParseStatus::Failed),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(only_failed.len(), 1);
        assert_eq!(only_failed[0].source_type, SourceType::PdfStatement);

        let unlinked = list_source_events(
            &mut conn,
            &SourceEventFilter {
                has_transaction: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        assert_eq!(unlinked.len(), 2);
    }
}
