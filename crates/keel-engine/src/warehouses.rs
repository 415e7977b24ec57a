//! # Warehouse Service
//!
//! Warehouse master data. Deactivating a warehouse stops new stock
//! movements there; existing reservations can still be released.

use chrono::Utc;
use keel_core::types::{new_id, Page, PageRequest, Warehouse, WarehouseType};
use keel_core::validation::{validate_name, validate_text, validate_uuid, validate_warehouse_code};
use keel_core::{CoreError, ValidationError, ValidationErrors};
use keel_db::{WarehouseFilter, WarehouseRepository, WarehouseStockTotals};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::instrument;

use crate::context::RequestContext;
use crate::error::{EngineError, EngineResult};
use crate::shared::Shared;
use crate::sinks::audit_details;

const MAX_ADDRESS_LEN: usize = 500;

fn check_capacity(errs: &mut ValidationErrors, capacity: Option<i64>) {
    if matches!(capacity, Some(c) if c <= 0) {
        errs.push(ValidationError::MustBePositive {
            field: "capacity".into(),
        });
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewWarehouse {
    pub code: String,
    pub name: String,
    pub warehouse_type: WarehouseType,
    #[serde(default)]
    pub capacity: Option<i64>,
    #[serde(default)]
    pub manager_id: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
}

impl NewWarehouse {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        errs.check(validate_warehouse_code(&self.code));
        errs.check(validate_name("name", &self.name));
        check_capacity(&mut errs, self.capacity);
        if let Some(manager) = &self.manager_id {
            errs.check(validate_uuid("manager_id", manager));
        }
        errs.check(validate_text("address", self.address.as_deref(), MAX_ADDRESS_LEN));
        errs.into_result()
    }
}

/// Fields left `None` are unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarehouseUpdate {
    pub name: Option<String>,
    pub warehouse_type: Option<WarehouseType>,
    pub capacity: Option<i64>,
    pub address: Option<String>,
}

impl WarehouseUpdate {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errs = ValidationErrors::new();
        if let Some(name) = &self.name {
            errs.check(validate_name("name", name));
        }
        check_capacity(&mut errs, self.capacity);
        errs.check(validate_text("address", self.address.as_deref(), MAX_ADDRESS_LEN));
        errs.into_result()
    }
}

/// Stock aggregates for one warehouse.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarehouseStats {
    pub warehouse_id: String,
    pub code: String,
    #[serde(flatten)]
    pub totals: WarehouseStockTotals,
    pub capacity: Option<i64>,
    /// On-hand units as a percentage of capacity.
    pub capacity_utilisation: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct WarehouseService {
    shared: Shared,
}

impl WarehouseService {
    pub fn new(shared: Shared) -> Self {
        WarehouseService { shared }
    }

    #[instrument(skip_all, fields(code = %req.code, correlation_id = %ctx.correlation_id))]
    pub async fn create(&self, ctx: &RequestContext, req: NewWarehouse) -> EngineResult<Warehouse> {
        let details = audit_details(&req);
        let result = async {
            req.validate()?;
            let now = Utc::now();
            let warehouse = Warehouse {
                id: new_id(),
                code: req.code.trim().to_uppercase(),
                name: req.name.trim().to_string(),
                warehouse_type: req.warehouse_type,
                is_active: true,
                capacity: req.capacity,
                manager_id: req.manager_id.clone(),
                address: req.address.clone(),
                created_at: now,
                updated_at: now,
            };
            self.shared.db.warehouses().insert(&warehouse).await?;
            Ok::<_, EngineError>(warehouse)
        }
        .await;
        let resource = result.as_ref().map(|w| w.id.clone()).unwrap_or_default();
        self.shared
            .sinks
            .conclude(ctx, "warehouse.create", &resource, details, result)
    }

    pub async fn get(&self, id: &str) -> EngineResult<Warehouse> {
        self.shared
            .db
            .warehouses()
            .get_by_id(id)
            .await?
            .ok_or_else(|| EngineError::not_found("Warehouse", id))
    }

    pub async fn get_by_code(&self, code: &str) -> EngineResult<Warehouse> {
        self.shared
            .db
            .warehouses()
            .get_by_code(&code.trim().to_uppercase())
            .await?
            .ok_or_else(|| EngineError::not_found("Warehouse", code))
    }

    pub async fn list(&self, filter: &WarehouseFilter, page: PageRequest) -> EngineResult<Page<Warehouse>> {
        let (items, total) = self.shared.db.warehouses().list(filter, page).await?;
        Ok(Page::new(items, total, page))
    }

    #[instrument(skip_all, fields(warehouse_id = %id, correlation_id = %ctx.correlation_id))]
    pub async fn update(&self, ctx: &RequestContext, id: &str, req: WarehouseUpdate) -> EngineResult<Warehouse> {
        let details = audit_details(&req);
        let result = async {
            req.validate()?;
            self.modify(id, |w| {
                if let Some(name) = &req.name {
                    w.name = name.trim().to_string();
                }
                if let Some(t) = req.warehouse_type {
                    w.warehouse_type = t;
                }
                if let Some(c) = req.capacity {
                    w.capacity = Some(c);
                }
                if let Some(a) = &req.address {
                    w.address = Some(a.clone());
                }
            })
            .await
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "warehouse.update", id, details, result)
    }

    /// Activates or deactivates a warehouse.
    #[instrument(skip_all, fields(warehouse_id = %id, active, correlation_id = %ctx.correlation_id))]
    pub async fn set_active(&self, ctx: &RequestContext, id: &str, active: bool) -> EngineResult<Warehouse> {
        let action = if active {
            "warehouse.activate"
        } else {
            "warehouse.deactivate"
        };
        let result = self.modify(id, |w| w.is_active = active).await;
        self.shared
            .sinks
            .conclude(ctx, action, id, json!({ "is_active": active }), result)
    }

    /// Sets or clears the manager.
    #[instrument(skip_all, fields(warehouse_id = %id, correlation_id = %ctx.correlation_id))]
    pub async fn assign_manager(
        &self,
        ctx: &RequestContext,
        id: &str,
        manager_id: Option<String>,
    ) -> EngineResult<Warehouse> {
        let details = json!({ "manager_id": manager_id });
        let result = async {
            if let Some(manager) = &manager_id {
                validate_uuid("manager_id", manager)?;
            }
            self.modify(id, |w| w.manager_id = manager_id.clone()).await
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "warehouse.assign_manager", id, details, result)
    }

    /// Deletes a warehouse that has never held stock.
    #[instrument(skip_all, fields(warehouse_id = %id, correlation_id = %ctx.correlation_id))]
    pub async fn delete(&self, ctx: &RequestContext, id: &str) -> EngineResult<()> {
        let result = async {
            let mut tx = self.shared.db.begin().await?;
            let records = WarehouseRepository::stock_record_count(&mut *tx, id).await?;
            if records > 0 {
                return Err(CoreError::Conflict(format!(
                    "warehouse {} holds {} stock records; deactivate it instead",
                    id, records
                ))
                .into());
            }
            WarehouseRepository::delete(&mut tx, id).await?;
            tx.commit().await?;
            Ok::<_, EngineError>(())
        }
        .await;
        self.shared
            .sinks
            .conclude(ctx, "warehouse.delete", id, json!({}), result)
    }

    pub async fn stats(&self, id: &str) -> EngineResult<WarehouseStats> {
        let warehouse = self.get(id).await?;
        let totals = self.shared.db.warehouses().stock_totals(id).await?;
        let capacity_utilisation = warehouse
            .capacity
            .filter(|c| *c > 0)
            .map(|c| totals.on_hand_units as f64 * 100.0 / c as f64);
        Ok(WarehouseStats {
            warehouse_id: warehouse.id,
            code: warehouse.code,
            totals,
            capacity: warehouse.capacity,
            capacity_utilisation,
        })
    }

    async fn modify(&self, id: &str, change: impl FnOnce(&mut Warehouse)) -> EngineResult<Warehouse> {
        let mut warehouse = self.get(id).await?;
        change(&mut warehouse);
        warehouse.updated_at = Utc::now();
        self.shared.db.warehouses().update(&warehouse).await?;
        Ok(warehouse)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::TestEngine;
    use keel_core::ErrorCode;

    fn depot(code: &str) -> NewWarehouse {
        NewWarehouse {
            code: code.into(),
            name: "North Depot".into(),
            warehouse_type: WarehouseType::Fulfillment,
            capacity: Some(200),
            manager_id: None,
            address: Some("1 Dock Rd".into()),
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("admin");
        let w = t.engine.warehouses.create(&ctx, depot("wh-north")).await.unwrap();
        assert_eq!(w.code, "WH-NORTH");
        assert!(w.is_active);

        let by_code = t.engine.warehouses.get_by_code("wh-north").await.unwrap();
        assert_eq!(by_code.id, w.id);

        let err = t.engine.warehouses.create(&ctx, depot("WH-NORTH")).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let err = t
            .engine
            .warehouses
            .create(
                &ctx,
                NewWarehouse {
                    name: " ".into(),
                    capacity: Some(0),
                    ..depot("bad code!")
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::Validation);
        assert_eq!(err.details().len(), 3);
    }

    #[tokio::test]
    async fn test_update_manager_and_filter() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("admin");
        let w = t.engine.warehouses.create(&ctx, depot("WH-N")).await.unwrap();

        let updated = t
            .engine
            .warehouses
            .update(
                &ctx,
                &w.id,
                WarehouseUpdate {
                    name: Some("Northern Depot".into()),
                    capacity: Some(500),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.name, "Northern Depot");
        assert_eq!(updated.capacity, Some(500));
        assert_eq!(updated.address.as_deref(), Some("1 Dock Rd"));

        let manager = new_id();
        let managed = t
            .engine
            .warehouses
            .assign_manager(&ctx, &w.id, Some(manager.clone()))
            .await
            .unwrap();
        assert_eq!(managed.manager_id, Some(manager));
        let cleared = t.engine.warehouses.assign_manager(&ctx, &w.id, None).await.unwrap();
        assert!(cleared.manager_id.is_none());

        t.engine.warehouses.set_active(&ctx, &w.id, false).await.unwrap();
        let active = t
            .engine
            .warehouses
            .list(
                &WarehouseFilter {
                    is_active: Some(false),
                    ..Default::default()
                },
                PageRequest::default(),
            )
            .await
            .unwrap();
        assert_eq!(active.total, 1);
        assert_eq!(active.items[0].id, w.id);
    }

    #[tokio::test]
    async fn test_delete_refused_while_stock_exists() {
        let t = TestEngine::new().await;
        let ctx = RequestContext::new("admin");
        t.stock(10).await;

        let err = t.engine.warehouses.delete(&ctx, &t.warehouse.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::Conflict);

        let empty = t.engine.warehouses.create(&ctx, depot("WH-EMPTY")).await.unwrap();
        t.engine.warehouses.delete(&ctx, &empty.id).await.unwrap();
        let err = t.engine.warehouses.get(&empty.id).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::NotFound);
    }

    #[tokio::test]
    async fn test_stats_report_utilisation() {
        let t = TestEngine::new().await;
        t.stock(2_500).await;
        let stats = t.engine.warehouses.stats(&t.warehouse.id).await.unwrap();
        assert_eq!(stats.totals.total_products, 1);
        assert_eq!(stats.totals.on_hand_units, 2_500);
        assert_eq!(stats.capacity, Some(10_000));
        assert_eq!(stats.capacity_utilisation, Some(25.0));
    }
}
