use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::source::{SourceEvent, SourceEventId};
use crate::transaction::TransactionId;

/// Join between a canonical transaction and one of its observations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionSourceLink {
    pub transaction_id: TransactionId,
    pub source_event_id: SourceEventId,
    /// Matcher certainty in [0, 1]; `None` for manual links.
    pub match_confidence: Option<f64>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// A linked source event together with its link metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedSource {
    pub link: TransactionSourceLink,
    pub source_event: SourceEvent,
}
