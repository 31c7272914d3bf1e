//! Persistence contract for the pool/stake ledger
//!
//! The ledger owns invariants; stores only save, replace and query records.
//! Every backend keeps an index of active stakes so the accrual scheduler
//! never walks settled history.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::StoreResult;
use crate::model::{Operation, OperationKind, Pool, PoolId, Stake, StakeId, User, UserId};

/// Offset/limit pagination window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub offset: usize,
    pub limit: usize,
}

impl Page {
    pub fn new(offset: usize, limit: usize) -> Self {
        Self { offset, limit }
    }

    /// Everything, for internal scans
    pub fn all() -> Self {
        Self {
            offset: 0,
            limit: usize::MAX,
        }
    }

    pub(crate) fn apply<T, I: Iterator<Item = T>>(&self, items: I) -> Vec<T> {
        items.skip(self.offset).take(self.limit).collect()
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new(0, crate::constants::DEFAULT_PAGE_LIMIT)
    }
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // Users

    /// Persist a new user, assigning its id
    async fn save_user(&self, wallet_address: &str) -> StoreResult<User>;

    async fn find_user(&self, id: UserId) -> StoreResult<Option<User>>;

    async fn find_user_by_address(&self, wallet_address: &str) -> StoreResult<Option<User>>;

    // Pools

    /// Persist a new pool; the id field of `pool` is replaced
    async fn save_pool(&self, pool: Pool) -> StoreResult<Pool>;

    /// Full replace of an existing pool
    async fn update_pool(&self, pool: &Pool) -> StoreResult<()>;

    async fn find_pool(&self, id: PoolId) -> StoreResult<Option<Pool>>;

    async fn delete_pool(&self, id: PoolId) -> StoreResult<()>;

    async fn list_pools(&self, page: Page) -> StoreResult<Vec<Pool>>;

    async fn list_pools_by_owner(&self, owner_id: UserId, page: Page) -> StoreResult<Vec<Pool>>;

    async fn count_pools(&self) -> StoreResult<usize>;

    // Stakes

    /// Persist a new stake; the id field of `stake` is replaced
    async fn save_stake(&self, stake: Stake) -> StoreResult<Stake>;

    /// Full replace of an existing stake
    async fn update_stake(&self, stake: &Stake) -> StoreResult<()>;

    async fn find_stake(&self, id: StakeId) -> StoreResult<Option<Stake>>;

    async fn list_stakes_by_pool(&self, pool_id: PoolId) -> StoreResult<Vec<Stake>>;

    async fn list_stakes_by_user(&self, user_id: UserId, page: Page) -> StoreResult<Vec<Stake>>;

    /// Stakes flagged active, ordered by end date
    async fn list_active_stakes(&self) -> StoreResult<Vec<Stake>>;

    async fn count_stakes(&self) -> StoreResult<usize>;

    /// Write a settled stake and its debited pool as one unit; neither is
    /// written if either record is missing
    async fn settle_claim(&self, stake: &Stake, pool: &Pool) -> StoreResult<()>;

    // Operations

    async fn append_operation(
        &self,
        kind: OperationKind,
        user_id: UserId,
        description: &str,
    ) -> StoreResult<Operation>;

    async fn list_operations_by_user(
        &self,
        user_id: UserId,
        page: Page,
    ) -> StoreResult<Vec<Operation>>;

    // Ingestion cursor

    async fn save_cursor(&self, lt: u64) -> StoreResult<()>;

    async fn load_cursor(&self) -> StoreResult<Option<u64>>;
}
