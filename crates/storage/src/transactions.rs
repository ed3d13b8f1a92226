use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use spendy_core::{
    CanonicalField, CanonicalFields, CardId, Money, Transaction, TransactionId, TransactionKind,
};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};
use std::collections::BTreeSet;
use std::str::FromStr;

use crate::db::StorageError;

/// Column values for inserting or rewriting a transaction row.
#[derive(Debug, Clone)]
pub struct TransactionWrite<'a> {
    pub card_id: CardId,
    pub canonical: &'a CanonicalFields,
    pub fx_fee: Option<Money>,
    pub merchant_norm: &'a str,
    pub fingerprint: &'a str,
    pub fingerprint_debug: &'a str,
    pub edited_fields: &'a BTreeSet<CanonicalField>,
    pub edited_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Money leaving the card (negative amounts).
    Out,
    /// Money arriving (refunds, top-ups).
    In,
}

impl FromStr for Direction {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "out" => Ok(Direction::Out),
            "in" => Ok(Direction::In),
            other => Err(format!("Unknown direction: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub account_id: Option<i64>,
    pub card_id: Option<CardId>,
    /// Bounds on the posting datetime, or the transaction datetime when the
    /// posting one is unknown.
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Case-insensitive substring of the description.
    pub q: Option<String>,
    pub kind: Option<TransactionKind>,
    pub direction: Option<Direction>,
    pub currency: Option<String>,
    pub min_amount: Option<Money>,
    pub max_amount: Option<Money>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransactionPage {
    pub items: Vec<Transaction>,
    pub total: i64,
}

/// Signed totals for one currency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CurrencyTotals {
    pub currency: String,
    pub count: i64,
    pub out_total: Money,
    pub in_total: Money,
}

#[derive(sqlx::FromRow)]
struct TransactionRow {
    id: i64,
    card_id: i64,
    amount_minor: i64,
    currency: String,
    original_amount_minor: Option<i64>,
    original_currency: Option<String>,
    fx_rate: Option<String>,
    fx_fee_minor: Option<i64>,
    transaction_datetime: Option<DateTime<Utc>>,
    posting_datetime: Option<DateTime<Utc>>,
    description: String,
    location: Option<String>,
    kind: String,
    merchant_norm: String,
    fingerprint: String,
    fingerprint_debug: String,
    edited_fields: String,
    edited_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<TransactionRow> for Transaction {
    type Error = StorageError;

    fn try_from(r: TransactionRow) -> Result<Self, Self::Error> {
        let corrupt = |m: String| StorageError::corrupt("transactions", m);
        let fx_rate = r
            .fx_rate
            .as_deref()
            .map(Decimal::from_str)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;
        let edited_fields: BTreeSet<CanonicalField> =
            serde_json::from_str(&r.edited_fields).map_err(|e| corrupt(e.to_string()))?;
        Ok(Transaction {
            id: TransactionId(r.id),
            card_id: CardId(r.card_id),
            canonical: CanonicalFields {
                amount: Money::from_minor(r.amount_minor),
                currency: r.currency,
                original_amount: r.original_amount_minor.map(Money::from_minor),
                original_currency: r.original_currency,
                fx_rate,
                transaction_datetime: r.transaction_datetime,
                posting_datetime: r.posting_datetime,
                description: r.description,
                location: r.location,
                kind: r.kind.parse().map_err(corrupt)?,
            },
            fx_fee: r.fx_fee_minor.map(Money::from_minor),
            merchant_norm: r.merchant_norm,
            fingerprint: r.fingerprint,
            fingerprint_debug: r.fingerprint_debug,
            edited_fields,
            edited_at: r.edited_at,
            created_at: r.created_at,
            updated_at: r.updated_at,
        })
    }
}

const TRANSACTION_COLUMNS: &str = "t.id, t.card_id, t.amount_minor, t.currency, \
    t.original_amount_minor, t.original_currency, t.fx_rate, t.fx_fee_minor, \
    t.transaction_datetime, t.posting_datetime, t.description, t.location, t.kind, \
    t.merchant_norm, t.fingerprint, t.fingerprint_debug, t.edited_fields, t.edited_at, \
    t.created_at, t.updated_at";

fn edited_json(fields: &BTreeSet<CanonicalField>) -> Result<String, StorageError> {
    serde_json::to_string(fields).map_err(|e| StorageError::corrupt("transactions", e.to_string()))
}

pub async fn insert_transaction(
    conn: &mut SqliteConnection,
    tx: &TransactionWrite<'_>,
    now: DateTime<Utc>,
) -> Result<TransactionId, StorageError> {
    let c = tx.canonical;
    let id: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO transactions (
            card_id, amount_minor, currency, original_amount_minor, original_currency, fx_rate,
            fx_fee_minor, transaction_datetime, posting_datetime, description, location, kind,
            merchant_norm, fingerprint, fingerprint_debug, edited_fields, edited_at,
            created_at, updated_at
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        RETURNING id
        "#,
    )
    .bind(tx.card_id.0)
    .bind(c.amount.minor())
    .bind(&c.currency)
    .bind(c.original_amount.map(Money::minor))
    .bind(&c.original_currency)
    .bind(c.fx_rate.map(|r| r.to_string()))
    .bind(tx.fx_fee.map(Money::minor))
    .bind(c.transaction_datetime)
    .bind(c.posting_datetime)
    .bind(&c.description)
    .bind(&c.location)
    .bind(c.kind.to_string())
    .bind(tx.merchant_norm)
    .bind(tx.fingerprint)
    .bind(tx.fingerprint_debug)
    .bind(edited_json(tx.edited_fields)?)
    .bind(tx.edited_at)
    .bind(now)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;
    Ok(TransactionId(id))
}

/// Rewrites every mutable column. Returns false if the row is gone.
pub async fn update_transaction(
    conn: &mut SqliteConnection,
    id: TransactionId,
    tx: &TransactionWrite<'_>,
    now: DateTime<Utc>,
) -> Result<bool, StorageError> {
    let c = tx.canonical;
    let result = sqlx::query(
        r#"
        UPDATE transactions SET
            card_id = ?, amount_minor = ?, currency = ?, original_amount_minor = ?,
            original_currency = ?, fx_rate = ?, fx_fee_minor = ?, transaction_datetime = ?,
            posting_datetime = ?, description = ?, location = ?, kind = ?, merchant_norm = ?,
            fingerprint = ?, fingerprint_debug = ?, edited_fields = ?, edited_at = ?,
            updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(tx.card_id.0)
    .bind(c.amount.minor())
    .bind(&c.currency)
    .bind(c.original_amount.map(Money::minor))
    .bind(&c.original_currency)
    .bind(c.fx_rate.map(|r| r.to_string()))
    .bind(tx.fx_fee.map(Money::minor))
    .bind(c.transaction_datetime)
    .bind(c.posting_datetime)
    .bind(&c.description)
    .bind(&c.location)
    .bind(c.kind.to_string())
    .bind(tx.merchant_norm)
    .bind(tx.fingerprint)
    .bind(tx.fingerprint_debug)
    .bind(edited_json(tx.edited_fields)?)
    .bind(tx.edited_at)
    .bind(now)
    .bind(id.0)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

pub async fn get_transaction(
    conn: &mut SqliteConnection,
    id: TransactionId,
) -> Result<Option<Transaction>, StorageError> {
    sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions t WHERE t.id = ?"
    ))
    .bind(id.0)
    .fetch_optional(&mut *conn)
    .await?
    .map(Transaction::try_from)
    .transpose()
}

/// Transactions on `card_id` with exactly this amount and currency: the
/// only rows the matcher can ever accept.
pub async fn find_candidates(
    conn: &mut SqliteConnection,
    card_id: CardId,
    amount: Money,
    currency: &str,
) -> Result<Vec<Transaction>, StorageError> {
    sqlx::query_as::<_, TransactionRow>(&format!(
        "SELECT {TRANSACTION_COLUMNS} FROM transactions t \
         WHERE t.card_id = ? AND t.amount_minor = ? AND t.currency = ? \
         ORDER BY t.created_at DESC, t.id DESC"
    ))
    .bind(card_id.0)
    .bind(amount.minor())
    .bind(currency)
    .fetch_all(&mut *conn)
    .await?
    .into_iter()
    .map(Transaction::try_from)
    .collect()
}

/// Deletes the transaction; its links go with it.
pub async fn delete_transaction(
    conn: &mut SqliteConnection,
    id: TransactionId,
) -> Result<bool, StorageError> {
    let result = sqlx::query("DELETE FROM transactions WHERE id = ?")
        .bind(id.0)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() == 1)
}

fn push_filters(qb: &mut QueryBuilder<'_, Sqlite>, filter: &TransactionFilter) {
    qb.push(" FROM transactions t JOIN cards c ON c.id = t.card_id WHERE 1 = 1");
    if let Some(account_id) = filter.account_id {
        qb.push(" AND c.account_id = ").push_bind(account_id);
    }
    if let Some(card_id) = filter.card_id {
        qb.push(" AND t.card_id = ").push_bind(card_id.0);
    }
    if let Some(from) = filter.from {
        qb.push(" AND COALESCE(t.posting_datetime, t.transaction_datetime) >= ")
            .push_bind(from);
    }
    if let Some(to) = filter.to {
        qb.push(" AND COALESCE(t.posting_datetime, t.transaction_datetime) <= ")
            .push_bind(to);
    }
    if let Some(q) = filter.q.as_deref().filter(|q| !q.trim().is_empty()) {
        qb.push(" AND t.description LIKE ")
            .push_bind(format!("%{}%", q.trim()));
    }
    if let Some(kind) = filter.kind {
        qb.push(" AND t.kind = ").push_bind(kind.to_string());
    }
    match filter.direction {
        Some(Direction::Out) => {
            qb.push(" AND t.amount_minor < 0");
        }
        Some(Direction::In) => {
            qb.push(" AND t.amount_minor > 0");
        }
        None => {}
    }
    if let Some(currency) = &filter.currency {
        qb.push(" AND t.currency = ").push_bind(currency.clone());
    }
    if let Some(min) = filter.min_amount {
        qb.push(" AND t.amount_minor >= ").push_bind(min.minor());
    }
    if let Some(max) = filter.max_amount {
        qb.push(" AND t.amount_minor <= ").push_bind(max.minor());
    }
}

/// Newest first by posting, then transaction datetime; undated rows last.
pub async fn list_transactions(
    conn: &mut SqliteConnection,
    filter: &TransactionFilter,
) -> Result<TransactionPage, StorageError> {
    let mut count: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT COUNT(*)");
    push_filters(&mut count, filter);
    let total: i64 = count.build_query_scalar().fetch_one(&mut *conn).await?;

    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!("SELECT {TRANSACTION_COLUMNS}"));
    push_filters(&mut qb, filter);
    qb.push(
        " ORDER BY t.posting_datetime IS NULL, t.posting_datetime DESC, \
         t.transaction_datetime IS NULL, t.transaction_datetime DESC, t.id DESC LIMIT ",
    )
    .push_bind(filter.limit.unwrap_or(100))
    .push(" OFFSET ")
    .push_bind(filter.offset.unwrap_or(0));

    let items = qb
        .build_query_as::<TransactionRow>()
        .fetch_all(&mut *conn)
        .await?
        .into_iter()
        .map(Transaction::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(TransactionPage { items, total })
}

/// Out (negative) and in (positive) totals per currency for the filter.
pub async fn transaction_summary(
    conn: &mut SqliteConnection,
    filter: &TransactionFilter,
) -> Result<Vec<CurrencyTotals>, StorageError> {
    let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT t.currency, COUNT(*), \
         COALESCE(SUM(CASE WHEN t.amount_minor < 0 THEN t.amount_minor ELSE 0 END), 0), \
         COALESCE(SUM(CASE WHEN t.amount_minor > 0 THEN t.amount_minor ELSE 0 END), 0)",
    );
    push_filters(&mut qb, filter);
    qb.push(" GROUP BY t.currency ORDER BY t.currency");

    let rows: Vec<(String, i64, i64, i64)> = qb.build_query_as().fetch_all(&mut *conn).await?;
    Ok(rows
        .into_iter()
        .map(|(currency, count, out_minor, in_minor)| CurrencyTotals {
            currency,
            count,
            out_total: Money::from_minor(out_minor),
            in_total: Money::from_minor(in_minor),
        })
        .collect())
}


#[cfg(test)]
mod tests {
    use super::fixtures::{canonical, insert};
    use super::*;
    use crate::cards::insert_card;
    use crate::db::test_support::temp_db;
    use chrono::TimeZone;
    use spendy_core::NewCard;

    fn day(d: u32) -> Option<DateTime<Utc>> {
        Some(Utc.with_ymd_and_hms(2024, 1, d, 12, 0, 0).unwrap())
    }

    async fn card(conn: &mut SqliteConnection, account: i64) -> CardId {
        let new = NewCard {
            account_id: Some(account),
            masked_number: "XXXX1111".into(),
            name: "Card".into(),
            currency: Some("AED".into()),
        };
        insert_card(conn, &new, Utc::now()).await.unwrap().id
    }

    #[tokio::test]
    async fn round_trips_all_columns() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let card_id = card(&mut conn, 1).await;
        let mut fields = canonical(-3673, "Amazon", day(15));
        fields.original_amount = Some(Money::from_minor(-1000));
        fields.original_currency = Some("USD".into());
        fields.fx_rate = Some(Decimal::new(36725, 4));
        let edited: BTreeSet<CanonicalField> = [CanonicalField::Description].into_iter().collect();
        let write = TransactionWrite {
            card_id,
            canonical: &fields,
            fx_fee: Some(Money::from_minor(-11)),
            merchant_norm: "amazon",
            fingerprint: "abc",
            fingerprint_debug: "1|2024-01-15|-36.73|AED|amazon",
            edited_fields: &edited,
            edited_at: day(16),
        };
        let id = insert_transaction(&mut conn, &write, Utc::now()).await.unwrap();
        let t = get_transaction(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(t.canonical, fields);
        assert_eq!(t.fx_fee, Some(Money::from_minor(-11)));
        assert_eq!(t.edited_fields, edited);
        assert_eq!(t.edited_at, day(16));
    }

    #[tokio::test]
    async fn candidates_match_exact_amount_and_currency() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let card_id = card(&mut conn, 1).await;
        let other_card = card(&mut conn, 1).await;
        let hit = insert(&mut conn, card_id, &canonical(-5000, "A", day(15))).await;
        insert(&mut conn, card_id, &canonical(-5100, "B", day(15))).await;
        insert(&mut conn, other_card, &canonical(-5000, "C", day(15))).await;

        let found = find_candidates(&mut conn, card_id, Money::from_minor(-5000), "AED")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, hit);
        assert!(find_candidates(&mut conn, card_id, Money::from_minor(-5000), "USD")
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn list_filters_orders_and_counts() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let c1 = card(&mut conn, 1).await;
        let c2 = card(&mut conn, 2).await;
        let older = insert(&mut conn, c1, &canonical(-1000, "Carrefour", day(10))).await;
        let newer = insert(&mut conn, c1, &canonical(2000, "Refund Noon", day(20))).await;
        insert(&mut conn, c2, &canonical(-3000, "Lulu", day(15))).await;
        let undated = insert(&mut conn, c1, &canonical(-400, "Cash", None)).await;

        let page = list_transactions(&mut conn, &TransactionFilter { account_id: Some(1), ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        let ids: Vec<TransactionId> = page.items.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![newer, older, undated]);

        let out = list_transactions(
            &mut conn,
            &TransactionFilter { direction: Some(Direction::Out), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(out.total, 3);

        let ranged = list_transactions(
            &mut conn,
            &TransactionFilter { from: day(12), to: day(18), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(ranged.total, 1);
        assert_eq!(ranged.items[0].canonical.description, "Lulu");

        let search = list_transactions(
            &mut conn,
            &TransactionFilter { q: Some("carre".into()), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(search.items[0].id, older);

        let paged = list_transactions(
            &mut conn,
            &TransactionFilter { limit: Some(1), offset: Some(1), ..Default::default() },
        )
        .await
        .unwrap();
        assert_eq!(paged.total, 4);
        assert_eq!(paged.items.len(), 1);
    }

    #[tokio::test]
    async fn summary_splits_in_and_out() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let c1 = card(&mut conn, 1).await;
        insert(&mut conn, c1, &canonical(-1000, "A", day(10))).await;
        insert(&mut conn, c1, &canonical(-250, "B", day(11))).await;
        insert(&mut conn, c1, &canonical(500, "C", day(12))).await;

        let totals = transaction_summary(&mut conn, &TransactionFilter::default()).await.unwrap();
        assert_eq!(
            totals,
            vec![CurrencyTotals {
                currency: "AED".into(),
                count: 3,
                out_total: Money::from_minor(-1250),
                in_total: Money::from_minor(500),
            }]
        );
    }

    #[tokio::test]
    async fn update_and_delete() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let c1 = card(&mut conn, 1).await;
        let id = insert(&mut conn, c1, &canonical(-1000, "A", day(10))).await;

        let fields = canonical(-1000, "Renamed", day(10));
        let edited = BTreeSet::new();
        let write = TransactionWrite {
            card_id: c1,
            canonical: &fields,
            fx_fee: None,
            merchant_norm: "renamed",
            fingerprint: "fp2",
            fingerprint_debug: "d2",
            edited_fields: &edited,
            edited_at: None,
        };
        assert!(update_transaction(&mut conn, id, &write, Utc::now()).await.unwrap());
        let t = get_transaction(&mut conn, id).await.unwrap().unwrap();
        assert_eq!(t.canonical.description, "Renamed");
        assert_eq!(t.fingerprint, "fp2");

        assert!(delete_transaction(&mut conn, id).await.unwrap());
        assert!(!delete_transaction(&mut conn, id).await.unwrap());
        assert!(get_transaction(&mut conn, id).await.unwrap().is_none());
    }
}
