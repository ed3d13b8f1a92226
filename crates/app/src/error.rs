use spendy_core::{CardId, SourceEventId, TransactionId, ValidationError};
use spendy_intake::IntakeError;
use spendy_storage::StorageError;

use crate::fx::FxError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Source event {source_event_id} is already linked to transaction {transaction_id}")]
    AlreadyLinked {
        transaction_id: TransactionId,
        source_event_id: SourceEventId,
    },
    #[error("No link between transaction {transaction_id} and source event {source_event_id}")]
    LinkNotFound {
        transaction_id: TransactionId,
        source_event_id: SourceEventId,
    },
    #[error("Transaction {0} not found")]
    TransactionNotFound(TransactionId),
    #[error("Source event {0} not found")]
    SourceEventNotFound(SourceEventId),
    #[error("Card {0} not found")]
    CardNotFound(CardId),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("Source event {0} was reprocessed concurrently; retry")]
    ConcurrentReprocess(SourceEventId),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Intake(#[from] IntakeError),
    #[error(transparent)]
    Fx(#[from] FxError),
}

impl From<sqlx::Error> for ServiceError {
    fn from(e: sqlx::Error) -> Self {
        ServiceError::Storage(StorageError::Sqlx(e))
    }
}

impl ServiceError {
    /// Errors the caller caused and can fix before retrying.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            ServiceError::AlreadyLinked { .. }
                | ServiceError::LinkNotFound { .. }
                | ServiceError::TransactionNotFound(_)
                | ServiceError::SourceEventNotFound(_)
                | ServiceError::CardNotFound(_)
                | ServiceError::Validation(_)
                | ServiceError::ConcurrentReprocess(_)
        )
    }
}
