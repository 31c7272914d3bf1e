//! Sled-based persistence for the pool ledger
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use tracing::info;

use crate::error::{StoreError, StoreResult};
use crate::model::{Operation, OperationKind, Pool, PoolId, Stake, StakeId, User, UserId};
use crate::store::{LedgerStore, Page};

const CURSOR_KEY: &[u8] = b"cursor:last_lt";

#[derive(Debug, Clone)]
pub struct LedgerDB {
    db: sled::Db,
    users: sled::Tree,
    users_by_address: sled::Tree,
    pools: sled::Tree,
    stakes: sled::Tree,
    /// pool id ++ stake id
    stakes_by_pool: sled::Tree,
    /// end timestamp ++ stake id, for active stakes only
    active_stakes: sled::Tree,
    /// user id ++ operation id
    operations: sled::Tree,
    meta: sled::Tree,
    path: String,
}

fn encode<T: Serialize>(what: &str, value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value)
        .map_err(|e| StoreError::Serialization(format!("Failed to serialize {}: {}", what, e)))
}

fn decode<T: DeserializeOwned>(what: &str, data: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(data)
        .map_err(|e| StoreError::Serialization(format!("Failed to deserialize {}: {}", what, e)))
}

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

fn pair_key(high: u64, low: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&high.to_be_bytes());
    key[8..].copy_from_slice(&low.to_be_bytes());
    key
}

/// Flip the sign bit so big-endian byte order matches timestamp order
fn active_key(end_date: DateTime<Utc>, id: StakeId) -> [u8; 16] {
    pair_key((end_date.timestamp() ^ i64::MIN) as u64, id)
}

impl LedgerDB {
    /// Open or create the database
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();
        let db = sled::open(&path)
            .map_err(|e| StoreError::Database(format!("Failed to open database: {}", e)))?;

        let tree = |name: &str| {
            db.open_tree(name)
                .map_err(|e| StoreError::Database(format!("Failed to open tree {}: {}", name, e)))
        };

        let ledger_db = LedgerDB {
            users: tree("users")?,
            users_by_address: tree("users_by_address")?,
            pools: tree("pools")?,
            stakes: tree("stakes")?,
            stakes_by_pool: tree("stakes_by_pool")?,
            active_stakes: tree("active_stakes")?,
            operations: tree("operations")?,
            meta: tree("meta")?,
            db,
            path: path_str,
        };
        info!(path = %ledger_db.path, "📂 Ledger database opened");
        Ok(ledger_db)
    }

    /// Get the database path
    pub fn path(&self) -> &str {
        &self.path
    }

    fn next_id(&self) -> StoreResult<u64> {
        // sled ids start at zero; zero is reserved as "unassigned"
        self.db
            .generate_id()
            .map(|id| id + 1)
            .map_err(|e| StoreError::Database(format!("Failed to generate id: {}", e)))
    }

    /// Flush to disk so records survive a restart
    fn flush(&self) -> StoreResult<()> {
        self.db
            .flush()
            .map_err(|e| StoreError::Database(format!("Failed to flush to disk: {}", e)))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(
        &self,
        tree: &sled::Tree,
        what: &str,
        key: &[u8],
    ) -> StoreResult<Option<T>> {
        match tree.get(key) {
            Ok(Some(data)) => Ok(Some(decode(what, &data)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(StoreError::Database(format!("Failed to load {}: {}", what, e))),
        }
    }

    fn put<T: Serialize>(
        &self,
        tree: &sled::Tree,
        what: &str,
        key: &[u8],
        value: &T,
    ) -> StoreResult<()> {
        let data = encode(what, value)?;
        tree.insert(key, data)
            .map_err(|e| StoreError::Database(format!("Failed to save {}: {}", what, e)))?;
        Ok(())
    }

    fn scan<T: DeserializeOwned>(
        &self,
        tree: &sled::Tree,
        what: &str,
    ) -> impl Iterator<Item = StoreResult<T>> {
        let what = what.to_string();
        tree.iter().map(move |item| match item {
            Ok((_key, value)) => decode(&what, &value),
            Err(e) => Err(StoreError::Database(format!("Failed to scan {}: {}", what, e))),
        })
    }

    fn collect_filtered<T, F>(
        &self,
        tree: &sled::Tree,
        what: &str,
        page: Page,
        keep: F,
    ) -> StoreResult<Vec<T>>
    where
        T: DeserializeOwned,
        F: Fn(&T) -> bool,
    {
        let mut matched = Vec::new();
        for item in self.scan::<T>(tree, what) {
            let item = item?;
            if keep(&item) {
                matched.push(item);
            }
        }
        Ok(page.apply(matched.into_iter()))
    }
}

#[async_trait]
impl LedgerStore for LedgerDB {
    async fn save_user(&self, wallet_address: &str) -> StoreResult<User> {
        let user = User {
            id: self.next_id()?,
            wallet_address: wallet_address.to_string(),
            created_at: Utc::now(),
        };
        // Record first, so the address index never points at a missing user
        self.put(&self.users, "user", &id_key(user.id), &user)?;

        let claimed = self
            .users_by_address
            .compare_and_swap(
                wallet_address.as_bytes(),
                None as Option<&[u8]>,
                Some(id_key(user.id).to_vec()),
            )
            .map_err(|e| StoreError::Database(format!("Failed to index user: {}", e)))?;
        if claimed.is_err() {
            self.users.remove(id_key(user.id))?;
            return Err(StoreError::Duplicate(format!("user {}", wallet_address)));
        }
        self.flush()?;
        Ok(user)
    }

    async fn find_user(&self, id: UserId) -> StoreResult<Option<User>> {
        self.get(&self.users, "user", &id_key(id))
    }

    async fn find_user_by_address(&self, wallet_address: &str) -> StoreResult<Option<User>> {
        match self.users_by_address.get(wallet_address.as_bytes())? {
            Some(id) => self.get(&self.users, "user", &id),
            None => Ok(None),
        }
    }

    async fn save_pool(&self, mut pool: Pool) -> StoreResult<Pool> {
        pool.id = self.next_id()?;
        self.put(&self.pools, "pool", &id_key(pool.id), &pool)?;
        self.flush()?;
        Ok(pool)
    }

    async fn update_pool(&self, pool: &Pool) -> StoreResult<()> {
        if !self.pools.contains_key(id_key(pool.id))? {
            return Err(StoreError::NotFound {
                kind: "pool",
                id: pool.id,
            });
        }
        self.put(&self.pools, "pool", &id_key(pool.id), pool)?;
        self.flush()
    }

    async fn find_pool(&self, id: PoolId) -> StoreResult<Option<Pool>> {
        self.get(&self.pools, "pool", &id_key(id))
    }

    async fn delete_pool(&self, id: PoolId) -> StoreResult<()> {
        let removed = self
            .pools
            .remove(id_key(id))
            .map_err(|e| StoreError::Database(format!("Failed to delete pool: {}", e)))?;
        if removed.is_none() {
            return Err(StoreError::NotFound { kind: "pool", id });
        }
        self.flush()
    }

    async fn list_pools(&self, page: Page) -> StoreResult<Vec<Pool>> {
        self.collect_filtered(&self.pools, "pool", page, |_: &Pool| true)
    }

    async fn list_pools_by_owner(&self, owner_id: UserId, page: Page) -> StoreResult<Vec<Pool>> {
        self.collect_filtered(&self.pools, "pool", page, |p: &Pool| p.owner_id == owner_id)
    }

    async fn count_pools(&self) -> StoreResult<usize> {
        Ok(self.pools.len())
    }

    async fn save_stake(&self, mut stake: Stake) -> StoreResult<Stake> {
        stake.id = self.next_id()?;
        self.put(&self.stakes, "stake", &id_key(stake.id), &stake)?;
        self.stakes_by_pool
            .insert(pair_key(stake.pool_id, stake.id), id_key(stake.id).to_vec())?;
        if stake.is_active {
            self.active_stakes
                .insert(active_key(stake.end_date, stake.id), id_key(stake.id).to_vec())?;
        }
        self.flush()?;
        Ok(stake)
    }

    async fn update_stake(&self, stake: &Stake) -> StoreResult<()> {
        let previous: Stake = self
            .get(&self.stakes, "stake", &id_key(stake.id))?
            .ok_or(StoreError::NotFound {
                kind: "stake",
                id: stake.id,
            })?;

        self.put(&self.stakes, "stake", &id_key(stake.id), stake)?;
        self.active_stakes
            .remove(active_key(previous.end_date, previous.id))?;
        if stake.is_active {
            self.active_stakes
                .insert(active_key(stake.end_date, stake.id), id_key(stake.id).to_vec())?;
        }
        self.flush()
    }

    async fn find_stake(&self, id: StakeId) -> StoreResult<Option<Stake>> {
        self.get(&self.stakes, "stake", &id_key(id))
    }

    async fn list_stakes_by_pool(&self, pool_id: PoolId) -> StoreResult<Vec<Stake>> {
        let mut stakes = Vec::new();
        for item in self.stakes_by_pool.scan_prefix(id_key(pool_id)) {
            let (_key, id) = item
                .map_err(|e| StoreError::Database(format!("Failed to scan pool stakes: {}", e)))?;
            if let Some(stake) = self.get(&self.stakes, "stake", &id)? {
                stakes.push(stake);
            }
        }
        Ok(stakes)
    }

    async fn list_stakes_by_user(&self, user_id: UserId, page: Page) -> StoreResult<Vec<Stake>> {
        self.collect_filtered(&self.stakes, "stake", page, |s: &Stake| s.user_id == user_id)
    }

    async fn list_active_stakes(&self) -> StoreResult<Vec<Stake>> {
        let mut stakes = Vec::new();
        for item in self.active_stakes.iter() {
            let (_key, id) = item
                .map_err(|e| StoreError::Database(format!("Failed to scan active stakes: {}", e)))?;
            if let Some(stake) = self.get(&self.stakes, "stake", &id)? {
                stakes.push(stake);
            }
        }
        Ok(stakes)
    }

    async fn count_stakes(&self) -> StoreResult<usize> {
        Ok(self.stakes.len())
    }

    async fn settle_claim(&self, stake: &Stake, pool: &Pool) -> StoreResult<()> {
        let stake_key = id_key(stake.id).to_vec();
        let pool_key = id_key(pool.id).to_vec();
        let stake_data = encode("stake", stake)?;
        let pool_data = encode("pool", pool)?;

        (&self.stakes, &self.pools)
            .transaction(|(stakes, pools)| {
                if stakes.get(&stake_key)?.is_none() {
                    return Err(ConflictableTransactionError::Abort(StoreError::NotFound {
                        kind: "stake",
                        id: stake.id,
                    }));
                }
                if pools.get(&pool_key)?.is_none() {
                    return Err(ConflictableTransactionError::Abort(StoreError::NotFound {
                        kind: "pool",
                        id: pool.id,
                    }));
                }
                stakes.insert(stake_key.clone(), stake_data.clone())?;
                pools.insert(pool_key.clone(), pool_data.clone())?;
                Ok(())
            })
            .map_err(|e| match e {
                TransactionError::Abort(e) => e,
                TransactionError::Storage(e) => {
                    StoreError::Database(format!("Failed to settle claim: {}", e))
                }
            })?;
        self.flush()
    }

    async fn append_operation(
        &self,
        kind: OperationKind,
        user_id: UserId,
        description: &str,
    ) -> StoreResult<Operation> {
        let operation = Operation {
            id: self.next_id()?,
            kind,
            description: description.to_string(),
            user_id,
            created_at: Utc::now(),
        };
        self.put(
            &self.operations,
            "operation",
            &pair_key(user_id, operation.id),
            &operation,
        )?;
        self.flush()?;
        Ok(operation)
    }

    async fn list_operations_by_user(
        &self,
        user_id: UserId,
        page: Page,
    ) -> StoreResult<Vec<Operation>> {
        let mut operations = Vec::new();
        for item in self.operations.scan_prefix(id_key(user_id)) {
            let (_key, value) = item
                .map_err(|e| StoreError::Database(format!("Failed to scan operations: {}", e)))?;
            operations.push(decode("operation", &value)?);
        }
        Ok(page.apply(operations.into_iter()))
    }

    async fn save_cursor(&self, lt: u64) -> StoreResult<()> {
        self.meta
            .insert(CURSOR_KEY, lt.to_be_bytes().to_vec())
            .map_err(|e| StoreError::Database(format!("Failed to save cursor: {}", e)))?;
        self.flush()
    }

    async fn load_cursor(&self) -> StoreResult<Option<u64>> {
        match self.meta.get(CURSOR_KEY)? {
            Some(data) => {
                let bytes: [u8; 8] = data[..]
                    .try_into()
                    .map_err(|_| StoreError::Database("Invalid cursor data".to_string()))?;
                Ok(Some(u64::from_be_bytes(bytes)))
            }
            None => Ok(None),
        }
    }
}
