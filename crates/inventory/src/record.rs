use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use larder_core::{ProductId, RecordId, TenantId, VariantId, Versioned, WarehouseId};

use crate::valuation::{self, CostPolicy};

/// Stock quantities are exact decimals (recipes consume fractional units).
pub type Quantity = Decimal;

/// Natural key of an inventory record.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordKey {
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: WarehouseId,
}

impl RecordKey {
    pub fn new(
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Self {
        Self {
            tenant_id,
            product_id,
            variant_id,
            warehouse_id,
        }
    }
}

/// Current stock snapshot for one (tenant, product, variant, warehouse).
///
/// Records are values: the store holds the authoritative copy and replaces it
/// with the result of [`InventoryRecord::apply_change`] inside its atomic
/// write. `available` is always derived, never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InventoryRecord {
    pub id: RecordId,
    pub tenant_id: TenantId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: WarehouseId,
    pub total_quantity: Quantity,
    pub reserved_quantity: Quantity,
    pub average_cost_price: Decimal,
    pub last_cost_price: Option<Decimal>,
    pub version: u64,
    pub is_active: bool,
    pub last_updated: DateTime<Utc>,
}

impl InventoryRecord {
    /// All-zero record for a tuple seen for the first time.
    pub fn zero(id: RecordId, key: RecordKey, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: key.tenant_id,
            product_id: key.product_id,
            variant_id: key.variant_id,
            warehouse_id: key.warehouse_id,
            total_quantity: Decimal::ZERO,
            reserved_quantity: Decimal::ZERO,
            average_cost_price: Decimal::ZERO,
            last_cost_price: None,
            version: 0,
            is_active: true,
            last_updated: now,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey {
            tenant_id: self.tenant_id,
            product_id: self.product_id,
            variant_id: self.variant_id,
            warehouse_id: self.warehouse_id,
        }
    }

    pub fn available(&self) -> Quantity {
        self.total_quantity - self.reserved_quantity
    }

    /// Stock value at average cost, saturating at `Decimal::MAX`.
    pub fn value(&self) -> Decimal {
        self.total_quantity.saturating_mul(self.average_cost_price)
    }

    /// Compute the next snapshot for `change`, or the reason it is refused.
    ///
    /// Pure: the caller decides whether to persist the result. Bumps the
    /// version by one and stamps `now`.
    pub fn apply_change(
        &self,
        change: &StockChange,
        policy: CostPolicy,
        now: DateTime<Utc>,
    ) -> Result<InventoryRecord, Rejection> {
        match change.precondition {
            Precondition::None => {}
            Precondition::AvailableAtLeast(q) => {
                if self.available() < q {
                    return Err(Rejection::InsufficientStock {
                        requested: q,
                        available: self.available(),
                    });
                }
            }
            Precondition::ReservedAtLeast(q) => {
                if self.reserved_quantity < q {
                    return Err(Rejection::InsufficientReserved {
                        requested: q,
                        reserved: self.reserved_quantity,
                    });
                }
            }
        }

        let (Some(total), Some(reserved)) = (
            self.total_quantity.checked_add(change.total_delta),
            self.reserved_quantity.checked_add(change.reserved_delta),
        ) else {
            return Err(Rejection::Overflow);
        };

        if reserved < Decimal::ZERO {
            return Err(Rejection::InsufficientReserved {
                requested: -change.reserved_delta,
                reserved: self.reserved_quantity,
            });
        }
        if total < reserved {
            // The change would consume stock that is free neither before nor after.
            let requested = change
                .reserved_delta
                .saturating_sub(change.total_delta)
                .max(Decimal::ZERO);
            return Err(Rejection::InsufficientStock {
                requested,
                available: self.available(),
            });
        }

        let mut next = self.clone();
        match change.cost {
            CostUpdate::Unchanged => {}
            CostUpdate::Receipt { unit_cost } => {
                next.average_cost_price =
                    valuation::on_receipt(self, change.total_delta, unit_cost, policy)
                        .ok_or(Rejection::Overflow)?;
                next.last_cost_price = Some(unit_cost);
            }
            CostUpdate::Override(cost) => {
                next.average_cost_price = policy.round(cost);
            }
        }
        next.total_quantity = total;
        next.reserved_quantity = reserved;
        next.version = self.version + 1;
        next.last_updated = now;
        Ok(next)
    }
}

impl Versioned for InventoryRecord {
    fn version(&self) -> u64 {
        self.version
    }
}

/// Business precondition checked against the record before applying a change.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Precondition {
    None,
    AvailableAtLeast(Quantity),
    ReservedAtLeast(Quantity),
}

/// How a change affects the average cost price.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CostUpdate {
    Unchanged,
    /// Weighted-average blend of the received quantity at `unit_cost`.
    Receipt { unit_cost: Decimal },
    /// Cost-bearing adjustment: replace the average cost outright.
    Override(Decimal),
}

/// Quantity/cost part of a conditional update.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockChange {
    pub total_delta: Quantity,
    pub reserved_delta: Quantity,
    pub precondition: Precondition,
    pub cost: CostUpdate,
}

impl StockChange {
    /// reserved += qty, guarded by `available >= qty`.
    pub fn reserve(qty: Quantity) -> Self {
        Self {
            total_delta: Decimal::ZERO,
            reserved_delta: qty,
            precondition: Precondition::AvailableAtLeast(qty),
            cost: CostUpdate::Unchanged,
        }
    }

    /// reserved -= qty.
    pub fn release(qty: Quantity) -> Self {
        Self {
            total_delta: Decimal::ZERO,
            reserved_delta: -qty,
            precondition: Precondition::ReservedAtLeast(qty),
            cost: CostUpdate::Unchanged,
        }
    }

    /// total -= qty and reserved -= qty (reserved stock leaves the building).
    pub fn commit_out(qty: Quantity) -> Self {
        Self {
            total_delta: -qty,
            reserved_delta: -qty,
            precondition: Precondition::ReservedAtLeast(qty),
            cost: CostUpdate::Unchanged,
        }
    }

    /// total -= qty from unreserved stock.
    pub fn consume(qty: Quantity) -> Self {
        Self {
            total_delta: -qty,
            reserved_delta: Decimal::ZERO,
            precondition: Precondition::AvailableAtLeast(qty),
            cost: CostUpdate::Unchanged,
        }
    }

    /// total += qty at `unit_cost`.
    pub fn receipt(qty: Quantity, unit_cost: Decimal) -> Self {
        Self {
            total_delta: qty,
            reserved_delta: Decimal::ZERO,
            precondition: Precondition::None,
            cost: CostUpdate::Receipt { unit_cost },
        }
    }

    /// Signed manual correction of total; never below what is reserved.
    pub fn adjustment(delta: Quantity, new_cost: Option<Decimal>) -> Self {
        Self {
            total_delta: delta,
            reserved_delta: Decimal::ZERO,
            precondition: Precondition::None,
            cost: new_cost.map_or(CostUpdate::Unchanged, CostUpdate::Override),
        }
    }
}

/// Why a change was refused by the record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    InsufficientStock {
        requested: Quantity,
        available: Quantity,
    },
    InsufficientReserved {
        requested: Quantity,
        reserved: Quantity,
    },
    /// A quantity or cost left the range a `Decimal` can represent.
    Overflow,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn record_with(total: Decimal, reserved: Decimal) -> InventoryRecord {
        let key = RecordKey::new(TenantId::new(), ProductId::new(), None, WarehouseId::new());
        let mut r = InventoryRecord::zero(RecordId::new(), key, Utc::now());
        r.total_quantity = total;
        r.reserved_quantity = reserved;
        r
    }

    #[test]
    fn reserve_moves_available_into_reserved() {
        let r = record_with(dec!(10), dec!(0));
        let next = r
            .apply_change(&StockChange::reserve(dec!(4)), CostPolicy::default(), Utc::now())
            .unwrap();
        assert_eq!(next.total_quantity, dec!(10));
        assert_eq!(next.reserved_quantity, dec!(4));
        assert_eq!(next.available(), dec!(6));
        assert_eq!(next.version, r.version + 1);
    }

    #[test]
    fn reserve_beyond_available_is_refused() {
        let r = record_with(dec!(5), dec!(3));
        let err = r
            .apply_change(&StockChange::reserve(dec!(3)), CostPolicy::default(), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            Rejection::InsufficientStock {
                requested: dec!(3),
                available: dec!(2)
            }
        );
    }

    #[test]
    fn commit_out_requires_reserved_stock() {
        let r = record_with(dec!(5), dec!(1));
        let err = r
            .apply_change(&StockChange::commit_out(dec!(2)), CostPolicy::default(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, Rejection::InsufficientReserved { .. }));
    }

    #[test]
    fn negative_adjustment_cannot_eat_into_reserved_stock() {
        let r = record_with(dec!(10), dec!(8));
        let err = r
            .apply_change(&StockChange::adjustment(dec!(-3), None), CostPolicy::default(), Utc::now())
            .unwrap_err();
        assert_eq!(
            err,
            Rejection::InsufficientStock {
                requested: dec!(3),
                available: dec!(2)
            }
        );

        let ok = r
            .apply_change(&StockChange::adjustment(dec!(-2), None), CostPolicy::default(), Utc::now())
            .unwrap();
        assert_eq!(ok.available(), Decimal::ZERO);
    }

    #[test]
    fn override_replaces_average_cost() {
        let r = record_with(dec!(10), dec!(0));
        let next = r
            .apply_change(
                &StockChange::adjustment(dec!(0), Some(dec!(4.125))),
                CostPolicy::default(),
                Utc::now(),
            )
            .unwrap();
        assert_eq!(next.average_cost_price, dec!(4.13));
    }

    #[test]
    fn change_beyond_decimal_range_is_refused() {
        let r = record_with(Decimal::MAX, dec!(0));
        let err = r
            .apply_change(&StockChange::receipt(dec!(1), dec!(2)), CostPolicy::default(), Utc::now())
            .unwrap_err();
        assert_eq!(err, Rejection::Overflow);

        let mut costly = record_with(dec!(10), dec!(0));
        costly.average_cost_price = Decimal::MAX;
        let err = costly
            .apply_change(&StockChange::receipt(dec!(5), dec!(1)), CostPolicy::default(), Utc::now())
            .unwrap_err();
        assert_eq!(err, Rejection::Overflow);
        assert_eq!(costly.value(), Decimal::MAX);
    }

    mod proptest_tests {
        use super::*;
        use crate::movement::{replay, IdempotencyKey, MovementDraft, MovementType, Reference};
        use larder_core::{AdjustmentId, MovementId, UserId};
        use proptest::prelude::*;

        fn change_strategy() -> impl Strategy<Value = StockChange> {
            let qty = (1i64..50).prop_map(Decimal::from);
            prop_oneof![
                (qty.clone(), 1i64..10).prop_map(|(q, c)| StockChange::receipt(q, Decimal::from(c))),
                qty.clone().prop_map(StockChange::reserve),
                qty.clone().prop_map(StockChange::release),
                qty.clone().prop_map(StockChange::commit_out),
                qty.clone().prop_map(StockChange::consume),
                (-30i64..30).prop_map(|d| StockChange::adjustment(Decimal::from(d), None)),
            ]
        }

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 256,
                ..ProptestConfig::default()
            })]

            /// Property: whatever sequence of changes is attempted, accepted
            /// ones keep `0 <= reserved <= total` and replaying their
            /// movements reproduces the snapshot.
            #[test]
            fn accepted_changes_keep_invariants_and_replay(
                changes in prop::collection::vec(change_strategy(), 1..60)
            ) {
                let policy = CostPolicy::default();
                let mut record = record_with(Decimal::ZERO, Decimal::ZERO);
                let mut ledger = Vec::new();

                for change in changes {
                    let Ok(next) = record.apply_change(&change, policy, Utc::now()) else {
                        continue;
                    };
                    let draft = MovementDraft::new(
                        MovementType::Adjustment,
                        Reference::ManualAdjustment { adjustment_id: AdjustmentId::new() },
                        IdempotencyKey::new(format!("k{}", ledger.len())),
                        UserId::new(),
                    );
                    ledger.push(draft.seal(MovementId::new(), &record, &next, Utc::now()));
                    record = next;

                    prop_assert!(record.reserved_quantity >= Decimal::ZERO);
                    prop_assert!(record.reserved_quantity <= record.total_quantity);
                    prop_assert_eq!(
                        record.total_quantity,
                        record.reserved_quantity + record.available()
                    );
                }

                let replayed = replay(&ledger);
                prop_assert_eq!(replayed.total, record.total_quantity);
                prop_assert_eq!(replayed.reserved, record.reserved_quantity);
                prop_assert_eq!(record.version as usize, ledger.len());
            }
        }
    }
}
