//! Reconciliation service: turns raw bank messages, screenshots and
//! statements into canonical transactions.

pub mod canonicalize;
pub mod error;
pub mod fx;
pub mod links;
pub mod locks;
pub mod service;

pub use canonicalize::{identity, ConvertedAmount, Identity, Resolver};
pub use error::ServiceError;
pub use fx::{FxError, FxRates, HttpFxRates, StaticFxRates};
pub use locks::CardLocks;
pub use service::{IngestOutcome, Reconciler, ReprocessOutcome, TransactionSource};
