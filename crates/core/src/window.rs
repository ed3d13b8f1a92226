use chrono::{DateTime, NaiveDate, Utc};

/// Calendar day used to bucket a transaction: the posting day when known,
/// otherwise the transaction day.
pub fn day_bucket(
    posting: Option<DateTime<Utc>>,
    transaction: Option<DateTime<Utc>>,
) -> Option<NaiveDate> {
    posting.or(transaction).map(|dt| dt.date_naive())
}
