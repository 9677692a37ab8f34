//! Goods receipt against purchase order lines.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use larder_core::{ProductId, PurchaseOrderId, TenantId, UserId, VariantId, WarehouseId};
use larder_inventory::{IdempotencyKey, MovementDraft, MovementType, Quantity, Reference, StockChange};

use crate::store::{AdjustRequest, Adjusted, InventoryStore, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptLine {
    pub purchase_order_id: PurchaseOrderId,
    pub line: u32,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: WarehouseId,
    pub quantity: Quantity,
    pub unit_cost: Decimal,
}

/// Add received stock, creating the record on first receipt.
///
/// The movement is keyed by purchase order line, so a redelivered line is a
/// no-op returning the original movement.
pub fn receive<S>(
    store: &S,
    tenant_id: TenantId,
    receipt: &ReceiptLine,
    actor: UserId,
) -> Result<Adjusted, StoreError>
where
    S: InventoryStore + ?Sized,
{
    if receipt.quantity <= Decimal::ZERO {
        return Err(StoreError::Invalid(format!(
            "received quantity must be positive (got {})",
            receipt.quantity
        )));
    }
    if receipt.unit_cost < Decimal::ZERO {
        return Err(StoreError::Invalid(format!(
            "unit cost cannot be negative (got {})",
            receipt.unit_cost
        )));
    }

    let record = store.upsert_zero_state(
        tenant_id,
        receipt.product_id,
        receipt.variant_id,
        receipt.warehouse_id,
    )?;

    let draft = MovementDraft::new(
        MovementType::Receipt,
        Reference::PurchaseOrder {
            purchase_order_id: receipt.purchase_order_id,
            line: receipt.line,
        },
        IdempotencyKey::receipt(receipt.purchase_order_id, receipt.line),
        actor,
    )
    .with_unit_cost(receipt.unit_cost);

    let adjusted = store.try_adjust(
        tenant_id,
        AdjustRequest::new(
            record.id,
            StockChange::receipt(receipt.quantity, receipt.unit_cost),
            draft,
        ),
    )?;

    match &adjusted {
        Adjusted::Applied { record, .. } => info!(
            tenant_id = %tenant_id,
            purchase_order_id = %receipt.purchase_order_id,
            line = receipt.line,
            record_id = %record.id,
            quantity = %receipt.quantity,
            average_cost = %record.average_cost_price,
            "stock received"
        ),
        Adjusted::Duplicate { .. } => debug!(
            purchase_order_id = %receipt.purchase_order_id,
            line = receipt.line,
            "receipt already recorded"
        ),
    }
    Ok(adjusted)
}
