//! `larder-core`: foundation building blocks shared by the inventory engine.
//!
//! This crate contains **pure domain** primitives (no infrastructure concerns).

pub mod error;
pub mod id;
pub mod version;

pub use error::{DomainError, DomainResult};
pub use id::{
    AdjustmentId, MovementId, OrderId, ProductId, PurchaseOrderId, RecordId, TenantId, UserId,
    VariantId, WarehouseId,
};
pub use version::{ExpectedVersion, Versioned};
