use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Sqlite, SqliteConnection, Transaction};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub type DbPool = Pool<Sqlite>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("Corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
}

impl StorageError {
    pub(crate) fn corrupt(table: &'static str, message: impl Into<String>) -> Self {
        StorageError::Corrupt {
            table,
            message: message.into(),
        }
    }

    /// True when an insert lost a race against a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        match self {
            StorageError::Sqlx(sqlx::Error::Database(e)) => e.is_unique_violation(),
            _ => false,
        }
    }
}

pub async fn create_db(path: &Path, max_connections: u32) -> Result<DbPool, StorageError> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Normal)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5))
        .pragma("cache_size", "-32000");

    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections.max(1))
        .connect_with(options)
        .await?;

    let mut conn = pool.acquire().await?;
    run_migrations(&mut conn).await?;
    drop(conn);

    tracing::debug!(path = %path.display(), "database ready");
    Ok(pool)
}

/// Opens a transaction that holds the SQLite write lock from its first
/// statement. Concurrent writers queue on the busy timeout.
pub async fn begin_write(pool: &DbPool) -> Result<Transaction<'static, Sqlite>, StorageError> {
    Ok(pool.begin_with("BEGIN IMMEDIATE").await?)
}

async fn run_migrations(conn: &mut SqliteConnection) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS cards (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            account_id INTEGER,
            masked_number TEXT NOT NULL,
            last_four TEXT,
            name TEXT NOT NULL,
            currency TEXT,
            created_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS source_events (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_type TEXT NOT NULL,
            raw_text TEXT,
            file_path TEXT,
            raw_hash TEXT NOT NULL UNIQUE,
            parsed_amount_minor INTEGER,
            parsed_currency TEXT,
            parsed_transaction_datetime TEXT,
            parsed_posting_datetime TEXT,
            parsed_description TEXT,
            parsed_card_last4 TEXT,
            parsed_kind TEXT,
            parsed_location TEXT,
            account_id INTEGER,
            card_id INTEGER REFERENCES cards(id) ON DELETE SET NULL,
            sender TEXT,
            recipients TEXT,
            received_at TEXT NOT NULL,
            parse_status TEXT NOT NULL,
            parse_error TEXT,
            reprocess_version INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            parsed_at TEXT
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transactions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            card_id INTEGER NOT NULL REFERENCES cards(id),
            amount_minor INTEGER NOT NULL CHECK (amount_minor <> 0),
            currency TEXT NOT NULL,
            original_amount_minor INTEGER,
            original_currency TEXT,
            fx_rate TEXT,
            fx_fee_minor INTEGER,
            transaction_datetime TEXT,
            posting_datetime TEXT,
            description TEXT NOT NULL,
            location TEXT,
            kind TEXT NOT NULL,
            merchant_norm TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            fingerprint_debug TEXT NOT NULL,
            edited_fields TEXT NOT NULL DEFAULT '[]',
            edited_at TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS transaction_source_links (
            transaction_id INTEGER NOT NULL REFERENCES transactions(id) ON DELETE CASCADE,
            source_event_id INTEGER NOT NULL REFERENCES source_events(id) ON DELETE CASCADE,
            match_confidence REAL,
            is_primary INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            PRIMARY KEY (transaction_id, source_event_id)
        )
        "#,
    )
    .execute(&mut *conn)
    .await?;

    for index in [
        "CREATE INDEX IF NOT EXISTS idx_cards_last_four ON cards(last_four)",
        "CREATE INDEX IF NOT EXISTS idx_transactions_candidates ON transactions(card_id, amount_minor, currency)",
        "CREATE INDEX IF NOT EXISTS idx_transactions_fingerprint ON transactions(fingerprint)",
        "CREATE INDEX IF NOT EXISTS idx_links_source ON transaction_source_links(source_event_id)",
        // at most one primary per transaction, enforced by the database
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_links_one_primary ON transaction_source_links(transaction_id) WHERE is_primary = 1",
    ] {
        sqlx::query(index).execute(&mut *conn).await?;
    }

    Ok(())
}


#[cfg(test)]
mod tests {
    use super::test_support::temp_db;
    use super::*;

    #[tokio::test]
    async fn creates_schema_and_is_reopenable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.db");
        let pool = create_db(&path, 1).await.unwrap();
        pool.close().await;
        // migrations are idempotent
        let pool = create_db(&path, 2).await.unwrap();
        let tables: Vec<(String,)> =
            sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table' ORDER BY name")
                .fetch_all(&pool)
                .await
                .unwrap();
        let names: Vec<&str> = tables.iter().map(|t| t.0.as_str()).collect();
        for expected in ["cards", "source_events", "transaction_source_links", "transactions"] {
            assert!(names.contains(&expected), "missing {expected}");
        }
    }

    #[tokio::test]
    async fn write_transactions_queue_instead_of_failing() {
        let dir = tempfile::tempdir().unwrap();
        let pool = create_db(&dir.path().join("busy.db"), 2).await.unwrap();

        let mut first = begin_write(&pool).await.unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cards")
            .fetch_one(&mut *first)
            .await
            .unwrap();
        assert_eq!(count.0, 0);

        let second_pool = pool.clone();
        let second = tokio::spawn(async move {
            let mut tx = begin_write(&second_pool).await?;
            // read first, then write: the pattern a deferred transaction fails on
            sqlx::query("SELECT COUNT(*) FROM cards").fetch_one(&mut *tx).await?;
            sqlx::query("INSERT INTO cards (masked_number, last_four, name, created_at) VALUES ('****2222', '2222', 'B', '2024-01-01T00:00:00+00:00')")
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok::<_, StorageError>(())
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!second.is_finished());

        sqlx::query("INSERT INTO cards (masked_number, last_four, name, created_at) VALUES ('****1111', '1111', 'A', '2024-01-01T00:00:00+00:00')")
            .execute(&mut *first)
            .await
            .unwrap();
        first.commit().await.unwrap();

        second.await.unwrap().unwrap();
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM cards")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count.0, 2);
    }

    #[tokio::test]
    async fn foreign_keys_are_enforced() {
        let (_dir, pool) = temp_db().await;
        let err = sqlx::query(
            "INSERT INTO transaction_source_links (transaction_id, source_event_id, is_primary, created_at) VALUES (99, 99, 1, '2024-01-01T00:00:00+00:00')",
        )
        .execute(&pool)
        .await;
        assert!(err.is_err());
    }
}
