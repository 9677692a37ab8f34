use thiserror::Error;

use larder_core::OrderId;
use larder_inventory::{BomError, IllegalTransition};

use super::types::{ReservationFailure, Settlement};
use crate::store::StoreError;

/// Order lifecycle error.
///
/// Reservation failures are compensated before they are returned: no hold
/// created by the failing call survives it.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoordinatorError {
    #[error("invalid request: {0}")]
    Validation(String),

    #[error(
        "reservation of order {} failed on line {}: {}",
        .0.order_id, .0.failed_line, .0.error
    )]
    ReservationFailed(Box<ReservationFailure>),

    /// One line failed to commit and stays reserved; `settled` holds the lines
    /// processed before it.
    #[error("commit of order {order_id} failed on line {line}: {source}")]
    CommitFailed {
        order_id: OrderId,
        line: u32,
        source: StoreError,
        settled: Box<Settlement>,
    },

    #[error(transparent)]
    Bom(#[from] BomError),

    #[error("ledger holds an illegal hold transition: {0}")]
    Ledger(#[from] IllegalTransition),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl CoordinatorError {
    pub fn is_insufficient_stock(&self) -> bool {
        match self {
            CoordinatorError::ReservationFailed(f) => f.error.is_insufficient_stock(),
            CoordinatorError::CommitFailed { source, .. } => source.is_insufficient_stock(),
            CoordinatorError::Store(e) => e.is_insufficient_stock(),
            _ => false,
        }
    }

    pub fn reservation_failure(&self) -> Option<&ReservationFailure> {
        match self {
            CoordinatorError::ReservationFailed(f) => Some(f),
            _ => None,
        }
    }
}
