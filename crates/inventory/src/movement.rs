//! Ledger movements: the append-only history of every stock-affecting event.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use larder_core::{
    AdjustmentId, MovementId, OrderId, ProductId, PurchaseOrderId, RecordId, TenantId, UserId,
};

use crate::record::{InventoryRecord, Quantity};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MovementType {
    Receipt,
    Reserve,
    Release,
    CommitOut,
    BomConsumption,
    Adjustment,
}

impl MovementType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MovementType::Receipt => "RECEIPT",
            MovementType::Reserve => "RESERVE",
            MovementType::Release => "RELEASE",
            MovementType::CommitOut => "COMMIT_OUT",
            MovementType::BomConsumption => "BOM_CONSUMPTION",
            MovementType::Adjustment => "ADJUSTMENT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "RECEIPT" => MovementType::Receipt,
            "RESERVE" => MovementType::Reserve,
            "RELEASE" => MovementType::Release,
            "COMMIT_OUT" => MovementType::CommitOut,
            "BOM_CONSUMPTION" => MovementType::BomConsumption,
            "ADJUSTMENT" => MovementType::Adjustment,
            _ => return None,
        })
    }
}

/// What caused a movement.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reference {
    /// An order line. `attempt` distinguishes re-reservations of a line whose
    /// earlier hold was released.
    Order {
        order_id: OrderId,
        line: u32,
        #[serde(default)]
        attempt: u32,
    },
    PurchaseOrder {
        purchase_order_id: PurchaseOrderId,
        line: u32,
    },
    ManualAdjustment {
        adjustment_id: AdjustmentId,
    },
}

impl Reference {
    pub fn order_id(&self) -> Option<OrderId> {
        match self {
            Reference::Order { order_id, .. } => Some(*order_id),
            _ => None,
        }
    }
}

/// Per-record deduplication key. Appending a key twice is a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(String);

impl IdempotencyKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn hold_prefix(order_id: OrderId, line: u32, attempt: u32) -> String {
        if attempt == 0 {
            format!("{order_id}:{line}")
        } else {
            format!("{order_id}:{line}#{attempt}")
        }
    }

    pub fn reserve(order_id: OrderId, line: u32, attempt: u32) -> Self {
        Self(format!("{}:reserve", Self::hold_prefix(order_id, line, attempt)))
    }

    pub fn release(order_id: OrderId, line: u32, attempt: u32) -> Self {
        Self(format!("{}:release", Self::hold_prefix(order_id, line, attempt)))
    }

    pub fn commit(order_id: OrderId, line: u32, attempt: u32) -> Self {
        Self(format!("{}:commit", Self::hold_prefix(order_id, line, attempt)))
    }

    pub fn component(order_id: OrderId, line: u32, attempt: u32, component: ProductId) -> Self {
        Self(format!(
            "{}:commit:bom:{component}",
            Self::hold_prefix(order_id, line, attempt)
        ))
    }

    pub fn receipt(purchase_order_id: PurchaseOrderId, line: u32) -> Self {
        Self(format!("po:{purchase_order_id}:{line}:receipt"))
    }

    pub fn adjustment(adjustment_id: AdjustmentId) -> Self {
        Self(format!("adj:{adjustment_id}"))
    }
}

impl core::fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Caller-supplied half of a movement; the store fills in the rest when the
/// paired record change commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MovementDraft {
    pub kind: MovementType,
    pub reference: Reference,
    pub idempotency_key: IdempotencyKey,
    /// Keys whose presence on the record means this movement must not happen
    /// (a hold that was released can no longer be committed, and vice versa).
    #[serde(default)]
    pub guard_keys: Vec<IdempotencyKey>,
    pub unit_cost: Option<Decimal>,
    pub reason: Option<String>,
    pub created_by: UserId,
}

impl MovementDraft {
    pub fn new(
        kind: MovementType,
        reference: Reference,
        idempotency_key: IdempotencyKey,
        created_by: UserId,
    ) -> Self {
        Self {
            kind,
            reference,
            idempotency_key,
            guard_keys: Vec::new(),
            unit_cost: None,
            reason: None,
            created_by,
        }
    }

    pub fn guarded_by(mut self, key: IdempotencyKey) -> Self {
        self.guard_keys.push(key);
        self
    }

    pub fn with_unit_cost(mut self, unit_cost: Decimal) -> Self {
        self.unit_cost = Some(unit_cost);
        self
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Seal the draft against the before/after snapshots of its record.
    pub fn seal(
        self,
        id: MovementId,
        before: &InventoryRecord,
        after: &InventoryRecord,
        created_at: DateTime<Utc>,
    ) -> Movement {
        Movement {
            id,
            tenant_id: after.tenant_id,
            record_id: after.id,
            kind: self.kind,
            quantity_delta: after.total_quantity - before.total_quantity,
            reserved_delta: after.reserved_quantity - before.reserved_quantity,
            resulting_total: after.total_quantity,
            resulting_reserved: after.reserved_quantity,
            resulting_average_cost: after.average_cost_price,
            unit_cost: self.unit_cost,
            reference: self.reference,
            reason: self.reason,
            idempotency_key: self.idempotency_key,
            created_at,
            created_by: self.created_by,
        }
    }
}

/// An appended, immutable ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Movement {
    pub id: MovementId,
    pub tenant_id: TenantId,
    pub record_id: RecordId,
    pub kind: MovementType,
    /// Effect on `total_quantity`.
    pub quantity_delta: Quantity,
    /// Effect on `reserved_quantity`.
    pub reserved_delta: Quantity,
    pub resulting_total: Quantity,
    pub resulting_reserved: Quantity,
    pub resulting_average_cost: Decimal,
    pub unit_cost: Option<Decimal>,
    pub reference: Reference,
    pub reason: Option<String>,
    pub idempotency_key: IdempotencyKey,
    pub created_at: DateTime<Utc>,
    pub created_by: UserId,
}

/// Totals obtained by replaying movements from the zero state.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Replayed {
    pub total: Quantity,
    pub reserved: Quantity,
    pub movements: usize,
}

pub fn replay<'a>(movements: impl IntoIterator<Item = &'a Movement>) -> Replayed {
    movements
        .into_iter()
        .fold(Replayed::default(), |mut acc, m| {
            acc.total = acc.total.saturating_add(m.quantity_delta);
            acc.reserved = acc.reserved.saturating_add(m.reserved_delta);
            acc.movements += 1;
            acc
        })
}
