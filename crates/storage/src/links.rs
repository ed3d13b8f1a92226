use chrono::{DateTime, Utc};
use spendy_core::{LinkedSource, SourceEventId, TransactionId, TransactionSourceLink};
use sqlx::SqliteConnection;

use crate::db::StorageError;
use crate::source_events::get_source_event;

#[derive(sqlx::FromRow)]
struct LinkRow {
    transaction_id: i64,
    source_event_id: i64,
    match_confidence: Option<f64>,
    is_primary: bool,
    created_at: DateTime<Utc>,
}

impl From<LinkRow> for TransactionSourceLink {
    fn from(r: LinkRow) -> Self {
        TransactionSourceLink {
            transaction_id: TransactionId(r.transaction_id),
            source_event_id: SourceEventId(r.source_event_id),
            match_confidence: r.match_confidence,
            is_primary: r.is_primary,
            created_at: r.created_at,
        }
    }
}

const LINK_COLUMNS: &str = "transaction_id, source_event_id, match_confidence, is_primary, created_at";

/// Fails with a unique violation if the pair is already linked, or if
/// `is_primary` is set while the transaction already has a primary.
pub async fn insert_link(
    conn: &mut SqliteConnection,
    link: &TransactionSourceLink,
) -> Result<(), StorageError> {
    sqlx::query(
        "INSERT INTO transaction_source_links (transaction_id, source_event_id, match_confidence, is_primary, created_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(link.transaction_id.0)
    .bind(link.source_event_id.0)
    .bind(link.match_confidence)
    .bind(link.is_primary)
    .bind(link.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

pub async fn get_link(
    conn: &mut SqliteConnection,
    transaction_id: TransactionId,
    source_event_id: SourceEventId,
) -> Result<Option<TransactionSourceLink>, StorageError> {
    let row = sqlx::query_as::<_, LinkRow>(&format!(
        "SELECT {LINK_COLUMNS} FROM transaction_source_links WHERE transaction_id = ? AND source_event_id = ?"
    ))
    .bind(transaction_id.0)
    .bind(source_event_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(Into::into))
}

/// Primary first, then by confidence (unscored last), then oldest.
pub async fn list_links(
    conn: &mut SqliteConnection,
    transaction_id: TransactionId,
) -> Result<Vec<TransactionSourceLink>, StorageError> {
    let rows = sqlx::query_as::<_, LinkRow>(&format!(
        "SELECT {LINK_COLUMNS} FROM transaction_source_links WHERE transaction_id = ? \
         ORDER BY is_primary DESC, match_confidence IS NULL, match_confidence DESC, created_at ASC, rowid ASC"
    ))
    .bind(transaction_id.0)
    .fetch_all(&mut *conn)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn count_links(
    conn: &mut SqliteConnection,
    transaction_id: TransactionId,
) -> Result<i64, StorageError> {
    let count = sqlx::query_scalar(
        "SELECT COUNT(*) FROM transaction_source_links WHERE transaction_id = ?",
    )
    .bind(transaction_id.0)
    .fetch_one(&mut *conn)
    .await?;
    Ok(count)
}

/// Returns the removed link, if there was one.
pub async fn delete_link(
    conn: &mut SqliteConnection,
    transaction_id: TransactionId,
    source_event_id: SourceEventId,
) -> Result<Option<TransactionSourceLink>, StorageError> {
    let row = sqlx::query_as::<_, LinkRow>(&format!(
        "DELETE FROM transaction_source_links WHERE transaction_id = ? AND source_event_id = ? RETURNING {LINK_COLUMNS}"
    ))
    .bind(transaction_id.0)
    .bind(source_event_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(Into::into))
}

/// Demotes every link of the transaction. Must run before a promotion so
/// the one-primary index never sees two.
pub async fn clear_primary(
    conn: &mut SqliteConnection,
    transaction_id: TransactionId,
) -> Result<(), StorageError> {
    sqlx::query("UPDATE transaction_source_links SET is_primary = 0 WHERE transaction_id = ? AND is_primary = 1")
        .bind(transaction_id.0)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

pub async fn set_primary_flag(
    conn: &mut SqliteConnection,
    transaction_id: TransactionId,
    source_event_id: SourceEventId,
) -> Result<bool, StorageError> {
    let result = sqlx::query(
        "UPDATE transaction_source_links SET is_primary = 1 WHERE transaction_id = ? AND source_event_id = ?",
    )
    .bind(transaction_id.0)
    .bind(source_event_id.0)
    .execute(&mut *conn)
    .await?;
    Ok(result.rows_affected() == 1)
}

/// The link that should become primary when the current one goes away.
pub async fn promotion_candidate(
    conn: &mut SqliteConnection,
    transaction_id: TransactionId,
) -> Result<Option<TransactionSourceLink>, StorageError> {
    let row = sqlx::query_as::<_, LinkRow>(&format!(
        "SELECT {LINK_COLUMNS} FROM transaction_source_links WHERE transaction_id = ? \
         ORDER BY match_confidence IS NULL, match_confidence DESC, created_at ASC, rowid ASC LIMIT 1"
    ))
    .bind(transaction_id.0)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.map(Into::into))
}

/// Links of a transaction joined with their source events, in
/// [`list_links`] order.
pub async fn linked_sources(
    conn: &mut SqliteConnection,
    transaction_id: TransactionId,
) -> Result<Vec<LinkedSource>, StorageError> {
    let links = list_links(conn, transaction_id).await?;
    let mut out = Vec::with_capacity(links.len());
    for link in links {
        let source_event = get_source_event(conn, link.source_event_id)
            .await?
            .ok_or_else(|| {
                StorageError::corrupt(
                    "transaction_source_links",
                    format!("link to missing source event {}", link.source_event_id),
                )
            })?;
        out.push(LinkedSource { link, source_event });
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cards::insert_card;
    use crate::db::test_support::temp_db;
    use crate::source_events::{fixtures::new_event, insert_source_event};
    use crate::transactions::{delete_transaction, fixtures};
    use chrono::TimeZone;
    use spendy_core::NewCard;

    struct Setup {
        _dir: tempfile::TempDir,
        pool: crate::db::DbPool,
        tx: TransactionId,
        events: Vec<SourceEventId>,
    }

    async fn setup(n: usize) -> Setup {
        let (dir, pool) = temp_db().await;
        let mut conn = pool.acquire().await.unwrap();
        let card = insert_card(
            &mut conn,
            &NewCard {
                account_id: None,
                masked_number: "XXXX1111".into(),
                name: "Card".into(),
                currency: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
        let tx = fixtures::insert(&mut conn, card.id, &fixtures::canonical(-1000, "Shop", None)).await;
        let mut events = Vec::new();
        for i in 0..n {
            let e = new_event(&format!("h{i}"), -1000);
            events.push(insert_source_event(&mut conn, &e).await.unwrap());
        }
        drop(conn);
        Setup { _dir: dir, pool, tx, events }
    }

    fn link(tx: TransactionId, se: SourceEventId, conf: Option<f64>, primary: bool, minute: u32) -> TransactionSourceLink {
        TransactionSourceLink {
            transaction_id: tx,
            source_event_id: se,
            match_confidence: conf,
            is_primary: primary,
            created_at: Utc.with_ymd_and_hms(2024, 1, 15, 10, minute, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn second_primary_is_rejected() {
        let s = setup(2).await;
        let mut conn = s.pool.acquire().await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[0], None, true, 0)).await.unwrap();
        let err = insert_link(&mut conn, &link(s.tx, s.events[1], Some(0.9), true, 1))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn duplicate_pair_is_rejected() {
        let s = setup(1).await;
        let mut conn = s.pool.acquire().await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[0], None, true, 0)).await.unwrap();
        let err = insert_link(&mut conn, &link(s.tx, s.events[0], Some(0.9), false, 1))
            .await
            .unwrap_err();
        assert!(err.is_unique_violation());
    }

    #[tokio::test]
    async fn promotion_prefers_confidence_then_age() {
        let s = setup(4).await;
        let mut conn = s.pool.acquire().await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[0], None, true, 0)).await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[1], Some(0.85), false, 1)).await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[2], Some(0.95), false, 3)).await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[3], Some(0.95), false, 2)).await.unwrap();

        delete_link(&mut conn, s.tx, s.events[0]).await.unwrap().unwrap();
        let next = promotion_candidate(&mut conn, s.tx).await.unwrap().unwrap();
        assert_eq!(next.source_event_id, s.events[3]);

        clear_primary(&mut conn, s.tx).await.unwrap();
        assert!(set_primary_flag(&mut conn, s.tx, next.source_event_id).await.unwrap());
        let links = list_links(&mut conn, s.tx).await.unwrap();
        assert!(links[0].is_primary);
        assert_eq!(links[0].source_event_id, s.events[3]);
        assert_eq!(links.iter().filter(|l| l.is_primary).count(), 1);
        assert_eq!(count_links(&mut conn, s.tx).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn linked_sources_join_events() {
        let s = setup(2).await;
        let mut conn = s.pool.acquire().await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[1], None, true, 0)).await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[0], Some(0.9), false, 1)).await.unwrap();
        let sources = linked_sources(&mut conn, s.tx).await.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].source_event.id, s.events[1]);
        assert!(sources[0].link.is_primary);
    }

    #[tokio::test]
    async fn deleting_transaction_cascades_links() {
        let s = setup(1).await;
        let mut conn = s.pool.acquire().await.unwrap();
        insert_link(&mut conn, &link(s.tx, s.events[0], None, true, 0)).await.unwrap();
        assert!(delete_transaction(&mut conn, s.tx).await.unwrap());
        assert!(get_link(&mut conn, s.tx, s.events[0]).await.unwrap().is_none());
        assert!(delete_link(&mut conn, s.tx, s.events[0]).await.unwrap().is_none());
    }
}
