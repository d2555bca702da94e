//! `mandi-core`: domain foundation shared by the jobs and realtime cores.
//!
//! This crate contains **pure domain** primitives plus the `Storage`
//! collaborator trait; no queue, lock or transport concerns live here.

pub mod error;
pub mod id;
pub mod storage;

pub use error::{CoreError, CoreResult};
pub use id::{ProductId, ShopId, UserId};
pub use storage::{
    InMemoryStorage, LowStockProduct, LowStockQuery, NewNotification, Notification, Shop, Storage,
    StorageError,
};
