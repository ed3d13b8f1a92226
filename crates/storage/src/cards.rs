use chrono::{DateTime, Utc};
use spendy_core::card::last_four_digits;
use spendy_core::{Card, CardId, NewCard};
use sqlx::SqliteConnection;

use crate::db::StorageError;

#[derive(sqlx::FromRow)]
struct CardRow {
    id: i64,
    account_id: Option<i64>,
    masked_number: String,
    name: String,
    currency: Option<String>,
}

impl From<CardRow> for Card {
    fn from(r: CardRow) -> Self {
        Card {
            id: CardId(r.id),
            account_id: r.account_id,
            masked_number: r.masked_number,
            name: r.name,
            currency: r.currency,
        }
    }
}

const CARD_COLUMNS: &str = "id, account_id, masked_number, name, currency";

pub async fn insert_card(
    conn: &mut SqliteConnection,
    card: &NewCard,
    now: DateTime<Utc>,
) -> Result<Card, StorageError> {
    let id: i64 = sqlx::query_scalar(
        "INSERT INTO cards (account_id, masked_number, last_four, name, currency, created_at) VALUES (?, ?, ?, ?, ?, ?) RETURNING id",
    )
    .bind(card.account_id)
    .bind(&card.masked_number)
    .bind(last_four_digits(&card.masked_number))
    .bind(&card.name)
    .bind(&card.currency)
    .bind(now)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Card {
        id: CardId(id),
        account_id: card.account_id,
        masked_number: card.masked_number.clone(),
        name: card.name.clone(),
        currency: card.currency.clone(),
    })
}

pub async fn get_card(conn: &mut SqliteConnection, id: CardId) -> Result<Option<Card>, StorageError> {
    let row = sqlx::query_as::<_, CardRow>(&format!("SELECT {CARD_COLUMNS} FROM cards WHERE id = ?"))
        .bind(id.0)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.map(Card::from))
}

pub async fn list_cards(conn: &mut SqliteConnection) -> Result<Vec<Card>, StorageError> {
    let rows = sqlx::query_as::<_, CardRow>(&format!("SELECT {CARD_COLUMNS} FROM cards ORDER BY id"))
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows.into_iter().map(Card::from).collect())
}

/// The card whose masked number ends in `last_four`, optionally within one
/// account. `None` when no card or more than one card matches.
pub async fn find_card_by_last_four(
    conn: &mut SqliteConnection,
    account_id: Option<i64>,
    last_four: &str,
) -> Result<Option<Card>, StorageError> {
    let rows = sqlx::query_as::<_, CardRow>(&format!(
        "SELECT {CARD_COLUMNS} FROM cards WHERE last_four = ? AND (? IS NULL OR account_id = ?) ORDER BY id LIMIT 2"
    ))
    .bind(last_four)
    .bind(account_id)
    .bind(account_id)
    .fetch_all(&mut *conn)
    .await?;

    if rows.len() > 1 {
        tracing::warn!(last_four, "several cards share these last four digits; not resolving");
        return Ok(None);
    }
    Ok(rows.into_iter().next().map(Card::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_db;

    fn new_card(account: Option<i64>, masked: &str) -> NewCard {
        NewCard {
            account_id: account,
            masked_number: masked.to_string(),
            name: "Card".to_string(),
            currency: Some("AED".to_string()),
        }
    }

    #[tokio::test]
    async fn insert_and_get() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let card = insert_card(&mut conn, &new_card(Some(1), "4111 XXXX XXXX 3278"), Utc::now())
            .await
            .unwrap();
        let fetched = get_card(&mut conn, card.id).await.unwrap().unwrap();
        assert_eq!(fetched.masked_number, "4111 XXXX XXXX 3278");
        assert_eq!(fetched.currency.as_deref(), Some("AED"));
        assert!(get_card(&mut conn, CardId(999)).await.unwrap().is_none());
        assert_eq!(list_cards(&mut conn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn last_four_lookup_respects_account_and_ambiguity() {
        let (_dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let a = insert_card(&mut conn, &new_card(Some(1), "XXXX3278"), Utc::now()).await.unwrap();
        let b = insert_card(&mut conn, &new_card(Some(2), "****3278"), Utc::now()).await.unwrap();

        let found = find_card_by_last_four(&mut conn, Some(1), "3278").await.unwrap();
        assert_eq!(found.map(|c| c.id), Some(a.id));
        let found = find_card_by_last_four(&mut conn, Some(2), "3278").await.unwrap();
        assert_eq!(found.map(|c| c.id), Some(b.id));
        assert!(find_card_by_last_four(&mut conn, None, "3278").await.unwrap().is_none());
        assert!(find_card_by_last_four(&mut conn, None, "0000").await.unwrap().is_none());
    }
}
