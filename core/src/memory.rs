//! In-memory store, used by tests and dry runs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::model::{Operation, OperationKind, Pool, PoolId, Stake, StakeId, User, UserId};
use crate::store::{LedgerStore, Page};

#[derive(Default)]
struct Tables {
    next_id: u64,
    users: BTreeMap<UserId, User>,
    users_by_address: HashMap<String, UserId>,
    pools: BTreeMap<PoolId, Pool>,
    stakes: BTreeMap<StakeId, Stake>,
    /// (end_date, id) of every active stake
    active: BTreeSet<(DateTime<Utc>, StakeId)>,
    operations: Vec<Operation>,
    cursor: Option<u64>,
}

impl Tables {
    fn allocate_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn reindex(&mut self, previous: Option<&Stake>, current: &Stake) {
        if let Some(prev) = previous {
            self.active.remove(&(prev.end_date, prev.id));
        }
        if current.is_active {
            self.active.insert((current.end_date, current.id));
        }
    }
}

/// Thread-safe in-memory implementation of [`LedgerStore`]
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn save_user(&self, wallet_address: &str) -> StoreResult<User> {
        let mut tables = self.tables.write().await;
        if tables.users_by_address.contains_key(wallet_address) {
            return Err(StoreError::Duplicate(format!("user {}", wallet_address)));
        }

        let user = User {
            id: tables.allocate_id(),
            wallet_address: wallet_address.to_string(),
            created_at: Utc::now(),
        };
        tables
            .users_by_address
            .insert(user.wallet_address.clone(), user.id);
        tables.users.insert(user.id, user.clone());
        Ok(user)
    }

    async fn find_user(&self, id: UserId) -> StoreResult<Option<User>> {
        Ok(self.tables.read().await.users.get(&id).cloned())
    }

    async fn find_user_by_address(&self, wallet_address: &str) -> StoreResult<Option<User>> {
        let tables = self.tables.read().await;
        Ok(tables
            .users_by_address
            .get(wallet_address)
            .and_then(|id| tables.users.get(id))
            .cloned())
    }

    async fn save_pool(&self, mut pool: Pool) -> StoreResult<Pool> {
        let mut tables = self.tables.write().await;
        pool.id = tables.allocate_id();
        tables.pools.insert(pool.id, pool.clone());
        Ok(pool)
    }

    async fn update_pool(&self, pool: &Pool) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        match tables.pools.get_mut(&pool.id) {
            Some(existing) => {
                *existing = pool.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound {
                kind: "pool",
                id: pool.id,
            }),
        }
    }

    async fn find_pool(&self, id: PoolId) -> StoreResult<Option<Pool>> {
        Ok(self.tables.read().await.pools.get(&id).cloned())
    }

    async fn delete_pool(&self, id: PoolId) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        tables
            .pools
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound { kind: "pool", id })
    }

    async fn list_pools(&self, page: Page) -> StoreResult<Vec<Pool>> {
        let tables = self.tables.read().await;
        Ok(page.apply(tables.pools.values().cloned()))
    }

    async fn list_pools_by_owner(&self, owner_id: UserId, page: Page) -> StoreResult<Vec<Pool>> {
        let tables = self.tables.read().await;
        Ok(page.apply(
            tables
                .pools
                .values()
                .filter(|p| p.owner_id == owner_id)
                .cloned(),
        ))
    }

    async fn count_pools(&self) -> StoreResult<usize> {
        Ok(self.tables.read().await.pools.len())
    }

    async fn save_stake(&self, mut stake: Stake) -> StoreResult<Stake> {
        let mut tables = self.tables.write().await;
        stake.id = tables.allocate_id();
        tables.reindex(None, &stake);
        tables.stakes.insert(stake.id, stake.clone());
        Ok(stake)
    }

    async fn update_stake(&self, stake: &Stake) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let previous = tables
            .stakes
            .get(&stake.id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "stake",
                id: stake.id,
            })?;
        tables.reindex(Some(&previous), stake);
        tables.stakes.insert(stake.id, stake.clone());
        Ok(())
    }

    async fn find_stake(&self, id: StakeId) -> StoreResult<Option<Stake>> {
        Ok(self.tables.read().await.stakes.get(&id).cloned())
    }

    async fn list_stakes_by_pool(&self, pool_id: PoolId) -> StoreResult<Vec<Stake>> {
        let tables = self.tables.read().await;
        Ok(tables
            .stakes
            .values()
            .filter(|s| s.pool_id == pool_id)
            .cloned()
            .collect())
    }

    async fn list_stakes_by_user(&self, user_id: UserId, page: Page) -> StoreResult<Vec<Stake>> {
        let tables = self.tables.read().await;
        Ok(page.apply(
            tables
                .stakes
                .values()
                .filter(|s| s.user_id == user_id)
                .cloned(),
        ))
    }

    async fn list_active_stakes(&self) -> StoreResult<Vec<Stake>> {
        let tables = self.tables.read().await;
        Ok(tables
            .active
            .iter()
            .filter_map(|(_, id)| tables.stakes.get(id))
            .cloned()
            .collect())
    }

    async fn count_stakes(&self) -> StoreResult<usize> {
        Ok(self.tables.read().await.stakes.len())
    }

    async fn settle_claim(&self, stake: &Stake, pool: &Pool) -> StoreResult<()> {
        let mut tables = self.tables.write().await;
        let previous = tables
            .stakes
            .get(&stake.id)
            .cloned()
            .ok_or(StoreError::NotFound {
                kind: "stake",
                id: stake.id,
            })?;
        if !tables.pools.contains_key(&pool.id) {
            return Err(StoreError::NotFound {
                kind: "pool",
                id: pool.id,
            });
        }
        tables.reindex(Some(&previous), stake);
        tables.stakes.insert(stake.id, stake.clone());
        tables.pools.insert(pool.id, pool.clone());
        Ok(())
    }

    async fn append_operation(
        &self,
        kind: OperationKind,
        user_id: UserId,
        description: &str,
    ) -> StoreResult<Operation> {
        let mut tables = self.tables.write().await;
        let operation = Operation {
            id: tables.allocate_id(),
            kind,
            description: description.to_string(),
            user_id,
            created_at: Utc::now(),
        };
        tables.operations.push(operation.clone());
        Ok(operation)
    }

    async fn list_operations_by_user(
        &self,
        user_id: UserId,
        page: Page,
    ) -> StoreResult<Vec<Operation>> {
        let tables = self.tables.read().await;
        Ok(page.apply(
            tables
                .operations
                .iter()
                .filter(|op| op.user_id == user_id)
                .cloned(),
        ))
    }

    async fn save_cursor(&self, lt: u64) -> StoreResult<()> {
        self.tables.write().await.cursor = Some(lt);
        Ok(())
    }

    async fn load_cursor(&self) -> StoreResult<Option<u64>> {
        Ok(self.tables.read().await.cursor)
    }
}
