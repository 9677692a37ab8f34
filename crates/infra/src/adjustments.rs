//! Manual stock corrections: signed adjustments, physical recounts and
//! record (de)activation.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use larder_core::{AdjustmentId, ExpectedVersion, RecordId, TenantId, UserId};
use larder_inventory::{
    IdempotencyKey, InventoryRecord, MovementDraft, MovementType, Quantity, Reference, StockChange,
};

use crate::store::{AdjustRequest, Adjusted, InventoryStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualAdjustment {
    pub adjustment_id: AdjustmentId,
    pub record_id: RecordId,
    /// Signed change to total stock. Never takes total below reserved.
    pub delta: Quantity,
    /// Replaces the average cost when set.
    pub new_average_cost: Option<Decimal>,
    pub expected_version: ExpectedVersion,
    pub reason: String,
}

impl ManualAdjustment {
    pub fn new(record_id: RecordId, delta: Quantity, reason: impl Into<String>) -> Self {
        Self {
            adjustment_id: AdjustmentId::new(),
            record_id,
            delta,
            new_average_cost: None,
            expected_version: ExpectedVersion::Any,
            reason: reason.into(),
        }
    }

    pub fn with_cost(mut self, new_average_cost: Decimal) -> Self {
        self.new_average_cost = Some(new_average_cost);
        self
    }

    pub fn expecting(mut self, expected_version: ExpectedVersion) -> Self {
        self.expected_version = expected_version;
        self
    }
}

pub fn adjust<S>(
    store: &S,
    tenant_id: TenantId,
    adjustment: &ManualAdjustment,
    actor: UserId,
) -> Result<Adjusted, StoreError>
where
    S: InventoryStore + ?Sized,
{
    let adjusted = store.try_adjust(tenant_id, adjust_request(adjustment, actor)?)?;
    match &adjusted {
        Adjusted::Applied { record, .. } => info!(
            tenant_id = %tenant_id,
            record_id = %record.id,
            adjustment_id = %adjustment.adjustment_id,
            delta = %adjustment.delta,
            total = %record.total_quantity,
            reason = %adjustment.reason,
            "stock adjusted"
        ),
        Adjusted::Duplicate { .. } => debug!(
            adjustment_id = %adjustment.adjustment_id,
            "adjustment already recorded"
        ),
    }
    Ok(adjusted)
}

fn adjust_request(adjustment: &ManualAdjustment, actor: UserId) -> Result<AdjustRequest, StoreError> {
    if adjustment.reason.trim().is_empty() {
        return Err(StoreError::Invalid("adjustment reason is required".to_string()));
    }
    if adjustment.new_average_cost.is_some_and(|c| c < Decimal::ZERO) {
        return Err(StoreError::Invalid("average cost cannot be negative".to_string()));
    }

    let mut draft = MovementDraft::new(
        MovementType::Adjustment,
        Reference::ManualAdjustment {
            adjustment_id: adjustment.adjustment_id,
        },
        IdempotencyKey::adjustment(adjustment.adjustment_id),
        actor,
    )
    .with_reason(adjustment.reason.clone());
    if let Some(cost) = adjustment.new_average_cost {
        draft = draft.with_unit_cost(cost);
    }

    Ok(AdjustRequest::new(
        adjustment.record_id,
        StockChange::adjustment(adjustment.delta, adjustment.new_average_cost),
        draft,
    )
    .expecting(adjustment.expected_version))
}

/// Set total stock to a physically counted quantity.
///
/// The delta is computed from the record as read and applied only if the
/// record has not changed since; a concurrent change yields `Conflict`.
pub fn recount<S>(
    store: &S,
    tenant_id: TenantId,
    record_id: RecordId,
    counted_total: Quantity,
    reason: &str,
    actor: UserId,
) -> Result<Adjusted, StoreError>
where
    S: InventoryStore + ?Sized,
{
    if counted_total < Decimal::ZERO {
        return Err(StoreError::Invalid(format!(
            "counted quantity cannot be negative (got {counted_total})"
        )));
    }
    let record = store.get_by_id(tenant_id, record_id)?;
    let adjustment = ManualAdjustment::new(record_id, counted_total - record.total_quantity, reason)
        .expecting(ExpectedVersion::of(&record));
    adjust(store, tenant_id, &adjustment, actor)
}

/// One line of a count sheet.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecountLine {
    pub record_id: RecordId,
    pub counted_total: Quantity,
    /// Record version the sheet was issued against. `None` pins the line to
    /// the version read when the batch is applied.
    pub as_of: Option<u64>,
}

impl RecountLine {
    pub fn new(record_id: RecordId, counted_total: Quantity) -> Self {
        Self {
            record_id,
            counted_total,
            as_of: None,
        }
    }

    pub fn as_of(mut self, version: u64) -> Self {
        self.as_of = Some(version);
        self
    }
}

/// Recount many records under one reason, all or none.
///
/// Each line becomes a version-pinned ADJUSTMENT; a record changed since its
/// line was pinned fails the whole batch with `Conflict` and nothing is
/// written.
pub fn recount_many<S>(
    store: &S,
    tenant_id: TenantId,
    lines: &[RecountLine],
    reason: &str,
    actor: UserId,
) -> Result<Vec<Adjusted>, StoreError>
where
    S: InventoryStore + ?Sized,
{
    let mut seen = HashSet::new();
    let mut requests = Vec::with_capacity(lines.len());
    for line in lines {
        if line.counted_total < Decimal::ZERO {
            return Err(StoreError::Invalid(format!(
                "counted quantity cannot be negative (got {} for record {})",
                line.counted_total, line.record_id
            )));
        }
        if !seen.insert(line.record_id) {
            return Err(StoreError::Invalid(format!(
                "record {} counted twice in one batch",
                line.record_id
            )));
        }
        let record = store.get_by_id(tenant_id, line.record_id)?;
        let expected = ExpectedVersion::Exact(line.as_of.unwrap_or(record.version));
        let adjustment =
            ManualAdjustment::new(line.record_id, line.counted_total - record.total_quantity, reason)
                .expecting(expected);
        requests.push(adjust_request(&adjustment, actor)?);
    }
    if requests.is_empty() {
        return Ok(Vec::new());
    }

    let adjusted = store.try_adjust_many(tenant_id, requests)?;
    info!(
        tenant_id = %tenant_id,
        records = adjusted.len(),
        reason = %reason,
        "stock recounted"
    );
    Ok(adjusted)
}

/// Deactivate or reactivate a record. Inactive records are skipped by
/// warehouse selection but keep their history.
pub fn set_active<S>(
    store: &S,
    tenant_id: TenantId,
    record_id: RecordId,
    active: bool,
) -> Result<InventoryRecord, StoreError>
where
    S: InventoryStore + ?Sized,
{
    let record = store.set_active(tenant_id, record_id, active)?;
    info!(tenant_id = %tenant_id, record_id = %record_id, active, "record activation changed");
    Ok(record)
}
