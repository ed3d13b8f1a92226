use spendy_core::CardId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OwnedMutexGuard;

/// One async mutex per card. Matching and link mutation for a card run
/// under its lock so two events cannot both create or claim the same
/// transaction. Take the lock before opening the SQL transaction.
#[derive(Default)]
pub struct CardLocks {
    locks: Mutex<HashMap<CardId, Arc<tokio::sync::Mutex<()>>>>,
}

impl CardLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, card_id: CardId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(card_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Events without a card never match, so they need no lock.
    pub async fn lock_opt(&self, card_id: Option<CardId>) -> Option<OwnedMutexGuard<()>> {
        match card_id {
            Some(id) => Some(self.lock(id).await),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn same_card_serializes() {
        let locks = Arc::new(CardLocks::new());
        let guard = locks.lock(CardId(1)).await;

        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _g = locks.lock(CardId(1)).await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        // a different card is independent
        let _other = locks.lock(CardId(2)).await;

        drop(guard);
        contender.await.unwrap();
    }

    #[tokio::test]
    async fn no_card_no_lock() {
        assert!(CardLocks::new().lock_opt(None).await.is_none());
    }
}
