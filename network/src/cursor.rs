//! Ingestion cursor shared by the pipeline and the request consumer
//!
//! A dispatched transaction is held until its request has been applied.
//! The persisted cursor never passes a held transaction, so anything still
//! queued when the process stops is fetched again on restart.

use pool_core::LedgerStore;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Default)]
struct CursorState {
    held: BTreeSet<u64>,
    /// Highest transaction seen by the pipeline
    seen: Option<u64>,
    saved: Option<u64>,
}

impl CursorState {
    /// Last lt below which every transaction is finished
    fn safe_point(&self) -> Option<u64> {
        match self.held.first() {
            Some(&first) => first.checked_sub(1),
            None => self.seen,
        }
    }
}

pub struct IngestionCursor {
    store: Arc<dyn LedgerStore>,
    state: Mutex<CursorState>,
}

impl IngestionCursor {
    pub fn new(store: Arc<dyn LedgerStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: Mutex::new(CursorState::default()),
        })
    }

    /// Mark a transaction whose request is about to be queued
    pub async fn hold(&self, lt: u64) {
        let mut state = self.state.lock().await;
        state.held.insert(lt);
        state.seen = state.seen.max(Some(lt));
    }

    /// Mark a transaction finished, applied or not, and persist the new safe point
    pub async fn release(&self, lt: u64) {
        let mut state = self.state.lock().await;
        state.held.remove(&lt);
        state.seen = state.seen.max(Some(lt));

        let Some(point) = state.safe_point() else {
            return;
        };
        if state.saved.is_some_and(|saved| saved >= point) {
            return;
        }
        match self.store.save_cursor(point).await {
            Ok(()) => state.saved = Some(point),
            Err(e) => warn!(lt = point, error = %e, "Failed to persist ingestion cursor"),
        }
    }

    /// Transactions queued but not yet released
    pub async fn pending(&self) -> usize {
        self.state.lock().await.held.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pool_core::MemoryStore;

    #[tokio::test]
    async fn test_cursor_waits_for_held_transaction() {
        let store = Arc::new(MemoryStore::new());
        let cursor = IngestionCursor::new(store.clone());

        cursor.release(40).await;
        assert_eq!(store.load_cursor().await.unwrap(), Some(40));

        cursor.hold(42).await;
        cursor.release(43).await;
        cursor.release(44).await;
        assert_eq!(store.load_cursor().await.unwrap(), Some(41));
        assert_eq!(cursor.pending().await, 1);

        cursor.release(42).await;
        assert_eq!(store.load_cursor().await.unwrap(), Some(44));
        assert_eq!(cursor.pending().await, 0);
    }

    #[tokio::test]
    async fn test_cursor_never_moves_back() {
        let store = Arc::new(MemoryStore::new());
        let cursor = IngestionCursor::new(store.clone());

        cursor.hold(10).await;
        cursor.hold(11).await;
        cursor.release(11).await;
        assert_eq!(store.load_cursor().await.unwrap(), Some(9));

        cursor.release(10).await;
        assert_eq!(store.load_cursor().await.unwrap(), Some(11));

        // A late release of an older lt keeps the saved point
        cursor.release(5).await;
        assert_eq!(store.load_cursor().await.unwrap(), Some(11));
    }
}
