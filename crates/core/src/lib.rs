pub mod card;
pub mod config;
pub mod link;
pub mod money;
pub mod source;
pub mod transaction;
pub mod window;

pub use card::{Card, CardId, NewCard};
pub use config::{ConfigError, MatchSettings, PriorityPolicy, Settings};
pub use link::{LinkedSource, TransactionSourceLink};
pub use money::Money;
pub use source::{ParseStatus, ParsedFields, SourceContext, SourceEvent, SourceEventId, SourceType};
pub use transaction::{
    CanonicalField, CanonicalFields, Transaction, TransactionDraft, TransactionEdit,
    TransactionId, TransactionKind, ValidationError,
};
pub use window::day_bucket;
