//! Inventory record store and movement ledger boundary.
//!
//! Records and their movements live behind one type: the only way to change
//! a record is a conditional update that appends its movement in the same
//! atomic unit.

pub mod in_memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod r#trait;

pub use in_memory::InMemoryInventoryStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresInventoryStore;
pub use r#trait::{AdjustRequest, Adjusted, InventoryStore, MovementLedger, StoreError, TimeRange};
