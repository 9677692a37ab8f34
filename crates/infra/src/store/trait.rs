use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use larder_core::{ExpectedVersion, OrderId, ProductId, RecordId, TenantId, VariantId, WarehouseId};
use larder_inventory::{
    IdempotencyKey, InventoryRecord, Movement, MovementDraft, Quantity, Rejection, StockChange,
};

/// One conditional update of one record, paired with the movement it appends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdjustRequest {
    pub record_id: RecordId,
    pub expected_version: ExpectedVersion,
    pub change: StockChange,
    pub movement: MovementDraft,
}

impl AdjustRequest {
    pub fn new(record_id: RecordId, change: StockChange, movement: MovementDraft) -> Self {
        Self {
            record_id,
            expected_version: ExpectedVersion::Any,
            change,
            movement,
        }
    }

    pub fn expecting(mut self, expected_version: ExpectedVersion) -> Self {
        self.expected_version = expected_version;
        self
    }
}

/// Successful outcome of a conditional update.
///
/// `Duplicate` means the movement's idempotency key was already recorded on the
/// record: nothing changed and the original movement is returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Adjusted {
    Applied {
        record: InventoryRecord,
        movement: Movement,
    },
    Duplicate {
        record: InventoryRecord,
        movement: Movement,
    },
}

impl Adjusted {
    pub fn record(&self) -> &InventoryRecord {
        match self {
            Adjusted::Applied { record, .. } | Adjusted::Duplicate { record, .. } => record,
        }
    }

    pub fn movement(&self) -> &Movement {
        match self {
            Adjusted::Applied { movement, .. } | Adjusted::Duplicate { movement, .. } => movement,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Adjusted::Duplicate { .. })
    }
}

/// Store/ledger operation error.
///
/// ## Error Categories
///
/// - **NotFound**: no record for the tuple/id within the caller's tenant
/// - **Conflict**: version mismatch (safe to retry the whole operation)
/// - **InsufficientStock / InsufficientReserved**: business precondition failed
///   (not retried, surfaced to the caller)
/// - **Superseded**: a guard key is already on the record (the hold was
///   settled the other way)
/// - **TenantIsolation**: cross-tenant linkage rejected by the backend
/// - **Backend**: storage failures
#[derive(Debug, Error, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("optimistic concurrency check failed on record {record_id}: expected {expected:?}, found {actual}")]
    Conflict {
        record_id: RecordId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("insufficient stock on record {record_id}: requested {requested}, available {available}")]
    InsufficientStock {
        record_id: RecordId,
        requested: Quantity,
        available: Quantity,
    },

    #[error("insufficient reserved stock on record {record_id}: requested {requested}, reserved {reserved}")]
    InsufficientReserved {
        record_id: RecordId,
        requested: Quantity,
        reserved: Quantity,
    },

    #[error("movement superseded on record {record_id}: '{key}' already recorded")]
    Superseded {
        record_id: RecordId,
        key: IdempotencyKey,
    },

    /// A write would link rows of different tenants.
    #[error("tenant isolation violation: {0}")]
    TenantIsolation(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("storage backend failure: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn from_rejection(record_id: RecordId, rejection: Rejection) -> Self {
        match rejection {
            Rejection::InsufficientStock {
                requested,
                available,
            } => StoreError::InsufficientStock {
                record_id,
                requested,
                available,
            },
            Rejection::InsufficientReserved {
                requested,
                reserved,
            } => StoreError::InsufficientReserved {
                record_id,
                requested,
                reserved,
            },
            Rejection::Overflow => {
                StoreError::Invalid(format!("change to record {record_id} is out of range"))
            }
        }
    }

    pub fn is_insufficient_stock(&self) -> bool {
        matches!(self, StoreError::InsufficientStock { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }
}

/// Half-open time window `[from, to)`; `None` leaves that side unbounded.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimeRange {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl TimeRange {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn between(from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: Some(to),
        }
    }

    /// Everything at or after `from`.
    pub fn since(from: DateTime<Utc>) -> Self {
        Self {
            from: Some(from),
            to: None,
        }
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from.is_none_or(|from| at >= from) && self.to.is_none_or(|to| at < to)
    }
}

/// Current stock snapshots, tenant-scoped.
///
/// The store is the only writer of records. Every write goes through
/// `try_adjust`/`try_adjust_many`, which apply the record change and append its
/// movement in one atomic unit; a change without its movement (or the reverse)
/// cannot be produced.
///
/// ## Implementation Requirements
///
/// Implementations must:
/// - scope every read and write to the given tenant (other tenants' records
///   are reported as `NotFound`)
/// - never block on other writers; fail fast with a typed error instead
/// - treat a recorded idempotency key as a no-op returning the prior movement
/// - apply a batch entirely or not at all
pub trait InventoryStore: Send + Sync {
    fn get(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError>;

    fn get_by_id(&self, tenant_id: TenantId, record_id: RecordId) -> Result<InventoryRecord, StoreError>;

    /// Every record (any warehouse, active or not) of a product/variant.
    fn list_for_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<InventoryRecord>, StoreError>;

    fn list_records(&self, tenant_id: TenantId) -> Result<Vec<InventoryRecord>, StoreError>;

    /// Tenants owning at least one record.
    fn tenants(&self) -> Result<Vec<TenantId>, StoreError>;

    /// Create an all-zero record for the tuple if absent; return the current one.
    fn upsert_zero_state(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError>;

    /// Deactivate/reactivate a record. Records are never deleted.
    fn set_active(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        active: bool,
    ) -> Result<InventoryRecord, StoreError>;

    /// Apply several conditional updates atomically (all or none).
    fn try_adjust_many(
        &self,
        tenant_id: TenantId,
        requests: Vec<AdjustRequest>,
    ) -> Result<Vec<Adjusted>, StoreError>;

    /// Single atomic conditional update.
    fn try_adjust(&self, tenant_id: TenantId, request: AdjustRequest) -> Result<Adjusted, StoreError> {
        self.try_adjust_many(tenant_id, vec![request])?
            .pop()
            .ok_or_else(|| StoreError::Backend("empty batch result".to_string()))
    }
}

/// Read side of the append-only movement ledger.
///
/// Appends only happen through [`InventoryStore::try_adjust_many`]. Results are
/// in append order.
pub trait MovementLedger: Send + Sync {
    fn list_by_record(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        range: TimeRange,
    ) -> Result<Vec<Movement>, StoreError>;

    fn list_by_tenant(&self, tenant_id: TenantId, range: TimeRange) -> Result<Vec<Movement>, StoreError>;

    /// Movements referencing an order (holds and recipe consumption).
    fn list_by_order(&self, tenant_id: TenantId, order_id: OrderId) -> Result<Vec<Movement>, StoreError>;
}

impl<S> InventoryStore for Arc<S>
where
    S: InventoryStore + ?Sized,
{
    fn get(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        (**self).get(tenant_id, product_id, variant_id, warehouse_id)
    }

    fn get_by_id(&self, tenant_id: TenantId, record_id: RecordId) -> Result<InventoryRecord, StoreError> {
        (**self).get_by_id(tenant_id, record_id)
    }

    fn list_for_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<InventoryRecord>, StoreError> {
        (**self).list_for_product(tenant_id, product_id, variant_id)
    }

    fn list_records(&self, tenant_id: TenantId) -> Result<Vec<InventoryRecord>, StoreError> {
        (**self).list_records(tenant_id)
    }

    fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        (**self).tenants()
    }

    fn upsert_zero_state(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        (**self).upsert_zero_state(tenant_id, product_id, variant_id, warehouse_id)
    }

    fn set_active(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        active: bool,
    ) -> Result<InventoryRecord, StoreError> {
        (**self).set_active(tenant_id, record_id, active)
    }

    fn try_adjust_many(
        &self,
        tenant_id: TenantId,
        requests: Vec<AdjustRequest>,
    ) -> Result<Vec<Adjusted>, StoreError> {
        (**self).try_adjust_many(tenant_id, requests)
    }

    fn try_adjust(&self, tenant_id: TenantId, request: AdjustRequest) -> Result<Adjusted, StoreError> {
        (**self).try_adjust(tenant_id, request)
    }
}

impl<S> MovementLedger for Arc<S>
where
    S: MovementLedger + ?Sized,
{
    fn list_by_record(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        range: TimeRange,
    ) -> Result<Vec<Movement>, StoreError> {
        (**self).list_by_record(tenant_id, record_id, range)
    }

    fn list_by_tenant(&self, tenant_id: TenantId, range: TimeRange) -> Result<Vec<Movement>, StoreError> {
        (**self).list_by_tenant(tenant_id, range)
    }

    fn list_by_order(&self, tenant_id: TenantId, order_id: OrderId) -> Result<Vec<Movement>, StoreError> {
        (**self).list_by_order(tenant_id, order_id)
    }
}
