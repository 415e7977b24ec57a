//! # Product Catalog
//!
//! Read-only view of product master data. The ledger and order services
//! only ever read products; the catalog owns them.

use std::sync::Arc;

use async_trait::async_trait;
use keel_core::types::Product;
use keel_db::Database;

use crate::error::{EngineError, EngineResult};

/// Product lookups consumed by the ledger and order services.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn get_product(&self, id: &str) -> EngineResult<Option<Product>>;

    async fn exists(&self, id: &str) -> EngineResult<bool> {
        Ok(self.get_product(id).await?.is_some())
    }

    /// Like [`get_product`](Self::get_product) but absent is `NotFound`.
    async fn require(&self, id: &str) -> EngineResult<Product> {
        self.get_product(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Product", id))
    }
}

/// Catalog backed by the `products` table.
#[derive(Debug, Clone)]
pub struct DbCatalog {
    db: Database,
}

impl DbCatalog {
    pub fn new(db: Database) -> Arc<Self> {
        Arc::new(DbCatalog { db })
    }
}

#[async_trait]
impl ProductCatalog for DbCatalog {
    async fn get_product(&self, id: &str) -> EngineResult<Option<Product>> {
        Ok(self.db.products().get_by_id(id).await?)
    }

    async fn exists(&self, id: &str) -> EngineResult<bool> {
        Ok(self.db.products().exists(id).await?)
    }
}
