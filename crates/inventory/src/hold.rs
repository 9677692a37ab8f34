//! Per order-line stock hold state machine.
//!
//! ```text
//! NONE --reserve--> RESERVED --commit--> COMMITTED
//!                       \------release--> RELEASED
//! ```
//!
//! Two views of the same machine:
//! - [`HoldPhase`] + [`HoldPhase::on`]: exhaustive transition table used when
//!   folding ledger movements back into hold state.
//! - [`ReservedHold`] / [`CommittedHold`] / [`ReleasedHold`]: typestate values.
//!   A committed or released hold can only be produced by consuming a reserved
//!   one, so `NONE -> COMMITTED` cannot be written.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use larder_core::{OrderId, RecordId};

use crate::movement::{Movement, MovementType, Reference};
use crate::record::Quantity;

/// Identity of one hold: an order line, and which reservation attempt of it.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HoldKey {
    pub order_id: OrderId,
    pub line: u32,
    pub attempt: u32,
}

impl HoldKey {
    pub fn reference(&self) -> Reference {
        Reference::Order {
            order_id: self.order_id,
            line: self.line,
            attempt: self.attempt,
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HoldPhase {
    None,
    Reserved,
    Committed,
    Released,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HoldEvent {
    Reserve,
    Commit,
    Release,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("illegal hold transition {event:?} from {from:?}")]
pub struct IllegalTransition {
    pub from: HoldPhase,
    pub event: HoldEvent,
}

impl HoldPhase {
    pub fn on(self, event: HoldEvent) -> Result<HoldPhase, IllegalTransition> {
        use HoldEvent::*;
        use HoldPhase as P;
        match (self, event) {
            (P::None, Reserve) => Ok(P::Reserved),
            (P::Reserved, Commit) => Ok(P::Committed),
            (P::Reserved, Release) => Ok(P::Released),
            (P::None, Commit | Release)
            | (P::Reserved, Reserve)
            | (P::Committed, Reserve | Commit | Release)
            | (P::Released, Reserve | Commit | Release) => {
                Err(IllegalTransition { from: self, event })
            }
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, HoldPhase::Committed | HoldPhase::Released)
    }
}

impl HoldEvent {
    fn from_movement(kind: MovementType) -> Option<Self> {
        match kind {
            MovementType::Reserve => Some(HoldEvent::Reserve),
            MovementType::CommitOut => Some(HoldEvent::Commit),
            MovementType::Release => Some(HoldEvent::Release),
            MovementType::Receipt | MovementType::BomConsumption | MovementType::Adjustment => None,
        }
    }
}

/// Stock held for an order line, pending commit or release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReservedHold {
    key: HoldKey,
    record_id: RecordId,
    quantity: Quantity,
    reserved_at: DateTime<Utc>,
}

impl ReservedHold {
    /// Rebuild a hold from its RESERVE movement.
    pub fn from_movement(movement: &Movement) -> Option<Self> {
        if movement.kind != MovementType::Reserve {
            return None;
        }
        let Reference::Order {
            order_id,
            line,
            attempt,
        } = movement.reference
        else {
            return None;
        };
        Some(Self {
            key: HoldKey {
                order_id,
                line,
                attempt,
            },
            record_id: movement.record_id,
            quantity: movement.reserved_delta,
            reserved_at: movement.created_at,
        })
    }

    pub fn key(&self) -> HoldKey {
        self.key
    }

    pub fn record_id(&self) -> RecordId {
        self.record_id
    }

    pub fn quantity(&self) -> Quantity {
        self.quantity
    }

    pub fn reserved_at(&self) -> DateTime<Utc> {
        self.reserved_at
    }

    pub fn commit(self, at: DateTime<Utc>) -> CommittedHold {
        CommittedHold {
            hold: self,
            committed_at: at,
        }
    }

    pub fn release(self, at: DateTime<Utc>) -> ReleasedHold {
        ReleasedHold {
            hold: self,
            released_at: at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedHold {
    hold: ReservedHold,
    committed_at: DateTime<Utc>,
}

impl CommittedHold {
    pub fn key(&self) -> HoldKey {
        self.hold.key
    }

    pub fn record_id(&self) -> RecordId {
        self.hold.record_id
    }

    pub fn quantity(&self) -> Quantity {
        self.hold.quantity
    }

    pub fn committed_at(&self) -> DateTime<Utc> {
        self.committed_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleasedHold {
    hold: ReservedHold,
    released_at: DateTime<Utc>,
}

impl ReleasedHold {
    pub fn key(&self) -> HoldKey {
        self.hold.key
    }

    pub fn record_id(&self) -> RecordId {
        self.hold.record_id
    }

    pub fn quantity(&self) -> Quantity {
        self.hold.quantity
    }

    pub fn released_at(&self) -> DateTime<Utc> {
        self.released_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum Hold {
    Reserved(ReservedHold),
    Committed(CommittedHold),
    Released(ReleasedHold),
}

impl Hold {
    pub fn key(&self) -> HoldKey {
        match self {
            Hold::Reserved(h) => h.key(),
            Hold::Committed(h) => h.key(),
            Hold::Released(h) => h.key(),
        }
    }

    pub fn phase(&self) -> HoldPhase {
        match self {
            Hold::Reserved(_) => HoldPhase::Reserved,
            Hold::Committed(_) => HoldPhase::Committed,
            Hold::Released(_) => HoldPhase::Released,
        }
    }

    pub fn as_reserved(&self) -> Option<&ReservedHold> {
        match self {
            Hold::Reserved(h) => Some(h),
            Hold::Committed(_) | Hold::Released(_) => None,
        }
    }
}

/// Fold an order's movements (in append order) into its holds, ordered by key.
///
/// Movements that are not hold transitions (receipts, BOM consumption,
/// adjustments) are ignored. An out-of-order transition means the ledger was
/// written outside the coordinator and is reported, not papered over.
pub fn fold_holds<'a>(
    movements: impl IntoIterator<Item = &'a Movement>,
) -> Result<Vec<Hold>, IllegalTransition> {
    let mut holds: BTreeMap<HoldKey, Hold> = BTreeMap::new();

    for m in movements {
        let Some(event) = HoldEvent::from_movement(m.kind) else {
            continue;
        };
        let Reference::Order {
            order_id,
            line,
            attempt,
        } = m.reference
        else {
            continue;
        };
        let key = HoldKey {
            order_id,
            line,
            attempt,
        };

        let current = holds.get(&key).map_or(HoldPhase::None, Hold::phase);
        current.on(event)?;

        let next = match (holds.remove(&key), event) {
            (None, HoldEvent::Reserve) => ReservedHold::from_movement(m).map(Hold::Reserved),
            (Some(Hold::Reserved(h)), HoldEvent::Commit) => {
                Some(Hold::Committed(h.commit(m.created_at)))
            }
            (Some(Hold::Reserved(h)), HoldEvent::Release) => {
                Some(Hold::Released(h.release(m.created_at)))
            }
            // Every other pairing was rejected by the transition table above.
            (other, _) => other,
        };
        if let Some(hold) = next {
            holds.insert(key, hold);
        }
    }

    Ok(holds.into_values().collect())
}
