//! Weighted-average cost valuation.
//!
//! Only receipts and cost-bearing adjustments move the average cost; reserve,
//! release and outbound movements never touch it.

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::record::{InventoryRecord, Quantity};

/// Rounding applied to stored average costs.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostPolicy {
    /// Decimal places kept on `average_cost_price`.
    pub scale: u32,
}

impl Default for CostPolicy {
    fn default() -> Self {
        Self { scale: 2 }
    }
}

impl CostPolicy {
    pub fn with_scale(scale: u32) -> Self {
        Self { scale }
    }

    pub fn round(self, value: Decimal) -> Decimal {
        value.round_dp_with_strategy(self.scale, RoundingStrategy::MidpointAwayFromZero)
    }
}

/// New average cost after receiving `quantity` units at `unit_cost`.
///
/// `(old_avg * old_total + unit_cost * quantity) / (old_total + quantity)`, or
/// `unit_cost` when the record held nothing before. `None` when an
/// intermediate product leaves the `Decimal` range.
pub fn on_receipt(
    record: &InventoryRecord,
    quantity: Quantity,
    unit_cost: Decimal,
    policy: CostPolicy,
) -> Option<Decimal> {
    let old_total = record.total_quantity;
    let new_total = old_total.checked_add(quantity)?;
    if old_total <= Decimal::ZERO || new_total <= Decimal::ZERO {
        return Some(policy.round(unit_cost));
    }
    let held = record.average_cost_price.checked_mul(old_total)?;
    let received = unit_cost.checked_mul(quantity)?;
    let blended = held.checked_add(received)?.checked_div(new_total)?;
    Some(policy.round(blended))
}

/// Stock value totals over a set of records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValuationSummary {
    pub records: usize,
    pub active_records: usize,
    pub total_quantity: Quantity,
    pub reserved_quantity: Quantity,
    pub total_value: Decimal,
}

pub fn summarize<'a>(records: impl IntoIterator<Item = &'a InventoryRecord>) -> ValuationSummary {
    let mut summary = ValuationSummary {
        records: 0,
        active_records: 0,
        total_quantity: Decimal::ZERO,
        reserved_quantity: Decimal::ZERO,
        total_value: Decimal::ZERO,
    };
    for r in records {
        summary.records += 1;
        if r.is_active {
            summary.active_records += 1;
        }
        summary.total_quantity = summary.total_quantity.saturating_add(r.total_quantity);
        summary.reserved_quantity = summary.reserved_quantity.saturating_add(r.reserved_quantity);
        summary.total_value = summary.total_value.saturating_add(r.value());
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{RecordKey, StockChange};
    use chrono::Utc;
    use larder_core::{ProductId, RecordId, TenantId, WarehouseId};
    use rust_decimal_macros::dec;

    fn empty_record() -> InventoryRecord {
        let key = RecordKey::new(TenantId::new(), ProductId::new(), None, WarehouseId::new());
        InventoryRecord::zero(RecordId::new(), key, Utc::now())
    }

    #[test]
    fn first_receipt_takes_unit_cost() {
        let r = empty_record();
        assert_eq!(on_receipt(&r, dec!(100), dec!(2.00), CostPolicy::default()), Some(dec!(2.00)));
    }

    #[test]
    fn second_receipt_blends_by_quantity() {
        let policy = CostPolicy::default();
        let r = empty_record();
        let r = r
            .apply_change(&StockChange::receipt(dec!(100), dec!(2.00)), policy, Utc::now())
            .unwrap();
        let r = r
            .apply_change(&StockChange::receipt(dec!(50), dec!(3.00)), policy, Utc::now())
            .unwrap();
        assert_eq!(r.total_quantity, dec!(150));
        assert_eq!(r.average_cost_price, dec!(2.33));
        assert_eq!(r.last_cost_price, Some(dec!(3.00)));
    }

    #[test]
    fn wider_scale_keeps_more_precision() {
        let policy = CostPolicy::with_scale(4);
        let mut r = empty_record();
        r.total_quantity = dec!(100);
        r.average_cost_price = dec!(2);
        assert_eq!(on_receipt(&r, dec!(50), dec!(3), policy), Some(dec!(2.3333)));
    }

    #[test]
    fn outbound_movements_leave_cost_alone() {
        let policy = CostPolicy::default();
        let r = empty_record()
            .apply_change(&StockChange::receipt(dec!(10), dec!(5)), policy, Utc::now())
            .unwrap();
        let r = r
            .apply_change(&StockChange::reserve(dec!(4)), policy, Utc::now())
            .unwrap();
        let r = r
            .apply_change(&StockChange::commit_out(dec!(4)), policy, Utc::now())
            .unwrap();
        assert_eq!(r.average_cost_price, dec!(5));
    }

    #[test]
    fn summary_values_stock_at_average_cost() {
        let mut a = empty_record();
        a.total_quantity = dec!(10);
        a.average_cost_price = dec!(1.5);
        let mut b = empty_record();
        b.total_quantity = dec!(4);
        b.reserved_quantity = dec!(1);
        b.average_cost_price = dec!(2);
        b.is_active = false;

        let s = summarize([&a, &b]);
        assert_eq!(s.records, 2);
        assert_eq!(s.active_records, 1);
        assert_eq!(s.total_quantity, dec!(14));
        assert_eq!(s.reserved_quantity, dec!(1));
        assert_eq!(s.total_value, dec!(23));
    }
}
