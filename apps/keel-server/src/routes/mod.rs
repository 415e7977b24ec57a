//! Route tables, one module per resource.

pub mod alerts;
pub mod files;
pub mod health;
pub mod inventory;
pub mod orders;
pub mod transactions;
pub mod warehouses;
