//! Infrastructure layer: record stores, the order lifecycle coordinator,
//! stock receipt/adjustment flows, reconciliation, the expiry sweep and
//! runtime configuration.

pub mod adjustments;
pub mod catalog;
pub mod config;
pub mod coordinator;
pub mod receiving;
pub mod reconcile;
pub mod store;
pub mod sweep;

pub use catalog::InMemoryBomCatalog;
pub use config::{ConfigError, EngineConfig};
pub use coordinator::{CoordinatorError, ReservationCoordinator, ShortfallPolicy};
pub use store::{
    AdjustRequest, Adjusted, InMemoryInventoryStore, InventoryStore, MovementLedger, StoreError,
    TimeRange,
};
#[cfg(feature = "postgres")]
pub use store::PostgresInventoryStore;
pub use sweep::{ExpirySweep, SweepHandle, SweepStats};
