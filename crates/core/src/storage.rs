//! Storage collaborator boundary.
//!
//! The wider application persists shops, products and notifications behind
//! an ORM; the jobs core only ever touches that layer through this trait.
//! Implementations are expected to be cheap to clone behind an `Arc`.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::id::{ProductId, ShopId, UserId};

/// Storage-layer error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StorageError {
    /// Backing store could not be reached.
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// A query failed for a non-connectivity reason.
    #[error("query failed: {0}")]
    Query(String),
}

/// A shop and its owning user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shop {
    pub id: ShopId,
    pub owner_user_id: UserId,
    pub name: String,
}

/// A product whose stock has fallen below its threshold.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStockProduct {
    pub id: ProductId,
    pub shop_id: ShopId,
    pub name: String,
    pub stock: i32,
    pub low_stock_threshold: i32,
}

/// Filter for the low-stock scan.
///
/// The digest job always issues a single bounded scan across all shops and
/// groups in memory; `shop_id` exists for callers that want one shop only.
#[derive(Debug, Clone, Default)]
pub struct LowStockQuery {
    pub shop_id: Option<ShopId>,
    pub limit: Option<usize>,
}

/// Input for creating a notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewNotification {
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub message: String,
}

/// A persisted notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub id: i64,
    pub user_id: UserId,
    pub kind: String,
    pub title: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// External storage collaborator.
#[async_trait]
pub trait Storage: Send + Sync {
    /// All shops on the platform.
    async fn get_shops(&self) -> Result<Vec<Shop>, StorageError>;

    /// Products at or below their low-stock threshold, in one bounded scan.
    async fn get_low_stock_products(
        &self,
        query: LowStockQuery,
    ) -> Result<Vec<LowStockProduct>, StorageError>;

    /// Persist a notification for a user.
    async fn create_notification(
        &self,
        new: NewNotification,
    ) -> Result<Notification, StorageError>;
}

/// In-memory storage for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    inner: Mutex<InMemoryState>,
}

#[derive(Debug, Default)]
struct InMemoryState {
    shops: HashMap<ShopId, Shop>,
    products: Vec<LowStockProduct>,
    notifications: Vec<Notification>,
    next_notification_id: i64,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_shop(&self, shop: Shop) {
        self.inner.lock().unwrap().shops.insert(shop.id, shop);
    }

    pub fn add_low_stock_product(&self, product: LowStockProduct) {
        self.inner.lock().unwrap().products.push(product);
    }

    /// Snapshot of all notifications created so far.
    pub fn notifications(&self) -> Vec<Notification> {
        self.inner.lock().unwrap().notifications.clone()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn get_shops(&self) -> Result<Vec<Shop>, StorageError> {
        let state = self.inner.lock().unwrap();
        let mut shops: Vec<_> = state.shops.values().cloned().collect();
        shops.sort_by_key(|s| s.id);
        Ok(shops)
    }

    async fn get_low_stock_products(
        &self,
        query: LowStockQuery,
    ) -> Result<Vec<LowStockProduct>, StorageError> {
        let state = self.inner.lock().unwrap();
        let mut products: Vec<_> = state
            .products
            .iter()
            .filter(|p| query.shop_id.is_none_or(|id| p.shop_id == id))
            .cloned()
            .collect();
        if let Some(limit) = query.limit {
            products.truncate(limit);
        }
        Ok(products)
    }

    async fn create_notification(
        &self,
        new: NewNotification,
    ) -> Result<Notification, StorageError> {
        let mut state = self.inner.lock().unwrap();
        state.next_notification_id += 1;
        let notification = Notification {
            id: state.next_notification_id,
            user_id: new.user_id,
            kind: new.kind,
            title: new.title,
            message: new.message,
            created_at: Utc::now(),
        };
        state.notifications.push(notification.clone());
        Ok(notification)
    }
}
