//! Inventory domain: stock records, the movement ledger model, cost
//! valuation, BOM explosion and the per-line hold state machine.
//!
//! Pure, deterministic logic only (no IO, no storage, no clocks of its own).

pub mod bom;
pub mod hold;
pub mod movement;
pub mod record;
pub mod valuation;

pub use bom::{BillOfMaterials, BomCatalog, BomError, BomExplosion, BomLine, ComponentRequirement, explode};
pub use hold::{
    CommittedHold, Hold, HoldEvent, HoldKey, HoldPhase, IllegalTransition, ReleasedHold,
    ReservedHold, fold_holds,
};
pub use movement::{
    IdempotencyKey, Movement, MovementDraft, MovementType, Reference, Replayed, replay,
};
pub use record::{
    CostUpdate, InventoryRecord, Precondition, Quantity, RecordKey, Rejection, StockChange,
};
pub use valuation::{CostPolicy, ValuationSummary, on_receipt, summarize};
