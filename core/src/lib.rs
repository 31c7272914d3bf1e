//! Pool Treasury Core Library
//!
//! Data model, accounting rules and persistence contract shared by every
//! other crate in the workspace.

pub mod accounting;
pub mod constants;
pub mod db;
pub mod error;
pub mod memory;
pub mod model;
pub mod store;

// Re-export main types
pub use db::LedgerDB;
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;
pub use model::{
    NewPool, Operation, OperationKind, Pool, PoolId, Stake, StakeId, User, UserId,
};
pub use store::{LedgerStore, Page};
