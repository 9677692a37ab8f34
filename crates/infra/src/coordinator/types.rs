use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use larder_core::{OrderId, ProductId, RecordId, VariantId, WarehouseId};
use larder_inventory::{HoldKey, Quantity};

use crate::store::StoreError;

/// What `commit` does when a recipe component has less free stock than the
/// recipe needs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShortfallPolicy {
    /// Fail the line's commit; the hold stays reserved.
    #[default]
    Reject,
    /// Deduct only what is available and log the shortfall.
    ///
    /// Availability is read while planning. If a component is drained between
    /// planning and the write, the line is re-planned once; a second drain
    /// fails the commit with the hold still reserved.
    ClampToAvailable,
}

impl ShortfallPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "reject" => Some(ShortfallPolicy::Reject),
            "clamp" | "clamp_to_available" => Some(ShortfallPolicy::ClampToAvailable),
            _ => None,
        }
    }
}

/// One item of an order, identified by its position in the request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub quantity: Quantity,
}

impl OrderLine {
    pub fn new(product_id: ProductId, quantity: Quantity) -> Self {
        Self {
            product_id,
            variant_id: None,
            quantity,
        }
    }

    pub fn variant(mut self, variant_id: VariantId) -> Self {
        self.variant_id = Some(variant_id);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LineStatus {
    Reserved {
        record_id: RecordId,
        warehouse_id: WarehouseId,
        quantity: Quantity,
    },
    /// The line already holds (or has consumed) stock for this order.
    AlreadyHeld { record_id: RecordId, quantity: Quantity },
    /// Reserved by this call, then released because a later line failed.
    RolledBack {
        record_id: RecordId,
        warehouse_id: WarehouseId,
        quantity: Quantity,
    },
    Failed { error: StoreError },
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineReport {
    pub line: u32,
    pub product_id: ProductId,
    pub status: LineStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationReceipt {
    pub order_id: OrderId,
    pub lines: Vec<LineReport>,
}

/// Per-line outcome of a reservation that did not go through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservationFailure {
    pub order_id: OrderId,
    pub failed_line: u32,
    pub error: StoreError,
    pub lines: Vec<LineReport>,
}

/// Per-order-line component exclusions ("no onions").
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CommitOptions {
    pub excluded: HashMap<u32, HashSet<ProductId>>,
}

impl CommitOptions {
    pub fn exclude(mut self, line: u32, component: ProductId) -> Self {
        self.excluded.entry(line).or_default().insert(component);
        self
    }

    pub(crate) fn is_excluded(&self, line: u32, component: ProductId) -> bool {
        self.excluded
            .get(&line)
            .is_some_and(|set| set.contains(&component))
    }
}

/// Stock taken from one recipe component when its parent line committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentDeduction {
    pub product_id: ProductId,
    pub record_id: RecordId,
    pub required: Quantity,
    pub deducted: Quantity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HoldOutcome {
    Committed { components: Vec<ComponentDeduction> },
    Released,
    AlreadyCommitted,
    AlreadyReleased,
    /// Settled the other way by a concurrent caller.
    Superseded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettledLine {
    pub key: HoldKey,
    pub record_id: RecordId,
    pub quantity: Quantity,
    pub outcome: HoldOutcome,
}

/// Result of committing or releasing an order's holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub order_id: OrderId,
    pub lines: Vec<SettledLine>,
}

impl Settlement {
    pub(crate) fn new(order_id: OrderId) -> Self {
        Self {
            order_id,
            lines: Vec::new(),
        }
    }

    /// Lines whose stock moved during this call.
    pub fn changed(&self) -> impl Iterator<Item = &SettledLine> {
        self.lines.iter().filter(|l| {
            matches!(
                l.outcome,
                HoldOutcome::Committed { .. } | HoldOutcome::Released
            )
        })
    }
}
