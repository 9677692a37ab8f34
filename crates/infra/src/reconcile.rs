//! Ledger-versus-snapshot audits, stock valuation and low-stock reports.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use larder_core::{ProductId, RecordId, TenantId, VariantId, WarehouseId};
use larder_inventory::{Quantity, Replayed, ValuationSummary, replay, summarize};

use crate::store::{InventoryStore, MovementLedger, StoreError, TimeRange};

/// Snapshot of one record next to the replay of its movements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordReconciliation {
    pub record_id: RecordId,
    pub total_quantity: Quantity,
    pub reserved_quantity: Quantity,
    pub replayed: Replayed,
}

impl RecordReconciliation {
    pub fn is_consistent(&self) -> bool {
        self.replayed.total == self.total_quantity && self.replayed.reserved == self.reserved_quantity
    }
}

pub fn reconcile_record<S>(
    store: &S,
    tenant_id: TenantId,
    record_id: RecordId,
) -> Result<RecordReconciliation, StoreError>
where
    S: InventoryStore + MovementLedger + ?Sized,
{
    let record = store.get_by_id(tenant_id, record_id)?;
    let movements = store.list_by_record(tenant_id, record_id, TimeRange::all())?;
    let result = RecordReconciliation {
        record_id,
        total_quantity: record.total_quantity,
        reserved_quantity: record.reserved_quantity,
        replayed: replay(&movements),
    };
    if !result.is_consistent() {
        warn!(
            tenant_id = %tenant_id,
            record_id = %record_id,
            total = %record.total_quantity,
            replayed_total = %result.replayed.total,
            reserved = %record.reserved_quantity,
            replayed_reserved = %result.replayed.reserved,
            "ledger does not reproduce record"
        );
    }
    Ok(result)
}

/// Reconcile every record of a tenant.
pub fn reconcile_tenant<S>(store: &S, tenant_id: TenantId) -> Result<Vec<RecordReconciliation>, StoreError>
where
    S: InventoryStore + MovementLedger + ?Sized,
{
    let results = store
        .list_records(tenant_id)?
        .into_iter()
        .map(|r| reconcile_record(store, tenant_id, r.id))
        .collect::<Result<Vec<_>, _>>()?;

    let inconsistent = results.iter().filter(|r| !r.is_consistent()).count();
    info!(
        tenant_id = %tenant_id,
        records = results.len(),
        inconsistent,
        "tenant reconciled"
    );
    Ok(results)
}

/// Quantity and value of a tenant's stock at average cost.
pub fn valuation_summary<S>(store: &S, tenant_id: TenantId) -> Result<ValuationSummary, StoreError>
where
    S: InventoryStore + ?Sized,
{
    let records = store.list_records(tenant_id)?;
    Ok(summarize(&records))
}

/// An active record whose available stock is at or below its product's minimum.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LowStock {
    pub record_id: RecordId,
    pub product_id: ProductId,
    pub variant_id: Option<VariantId>,
    pub warehouse_id: WarehouseId,
    pub available: Quantity,
    pub minimum: Quantity,
}

/// Records at or below the minimum stock configured for their product.
///
/// Products absent from `minimums` are never reported. Ordered by how far
/// available stock falls short of the minimum, largest shortfall first.
pub fn low_stock<S>(
    store: &S,
    tenant_id: TenantId,
    minimums: &HashMap<ProductId, Quantity>,
) -> Result<Vec<LowStock>, StoreError>
where
    S: InventoryStore + ?Sized,
{
    let mut alerts: Vec<LowStock> = store
        .list_records(tenant_id)?
        .into_iter()
        .filter(|r| r.is_active)
        .filter_map(|r| {
            let minimum = *minimums.get(&r.product_id)?;
            (r.available() <= minimum).then(|| LowStock {
                record_id: r.id,
                product_id: r.product_id,
                variant_id: r.variant_id,
                warehouse_id: r.warehouse_id,
                available: r.available(),
                minimum,
            })
        })
        .collect();
    alerts.sort_by(|a, b| {
        b.minimum
            .saturating_sub(b.available)
            .cmp(&a.minimum.saturating_sub(a.available))
            .then(a.record_id.cmp(&b.record_id))
    });

    if !alerts.is_empty() {
        info!(tenant_id = %tenant_id, records = alerts.len(), "low stock detected");
    }
    Ok(alerts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adjustments::{ManualAdjustment, adjust};
    use crate::coordinator::{OrderLine, ReservationCoordinator};
    use crate::catalog::InMemoryBomCatalog;
    use crate::receiving::{ReceiptLine, receive};
    use crate::store::InMemoryInventoryStore;
    use larder_core::{OrderId, ProductId, PurchaseOrderId, UserId, WarehouseId};
    use proptest::prelude::*;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;
    use std::sync::Arc;

    #[test]
    fn valuation_totals_stock_at_average_cost() {
        let store = InMemoryInventoryStore::new();
        let t = TenantId::new();
        for (qty, cost) in [(dec!(10), dec!(2)), (dec!(4), dec!(0.5))] {
            let receipt = ReceiptLine {
                purchase_order_id: PurchaseOrderId::new(),
                line: 0,
                product_id: ProductId::new(),
                variant_id: None,
                warehouse_id: WarehouseId::new(),
                quantity: qty,
                unit_cost: cost,
            };
            receive(&store, t, &receipt, UserId::new()).unwrap();
        }

        let summary = valuation_summary(&store, t).unwrap();
        assert_eq!(summary.records, 2);
        assert_eq!(summary.total_quantity, dec!(14));
        assert_eq!(summary.total_value, dec!(22));
    }

    #[test]
    fn low_stock_reports_records_at_or_below_minimum() {
        let store = Arc::new(InMemoryInventoryStore::new());
        let coordinator = ReservationCoordinator::new(store.clone(), InMemoryBomCatalog::new());
        let t = TenantId::new();
        let (flour, sugar, salt, w) = (ProductId::new(), ProductId::new(), ProductId::new(), WarehouseId::new());
        for (product, qty) in [(flour, dec!(10)), (sugar, dec!(2)), (salt, dec!(1))] {
            let receipt = ReceiptLine {
                purchase_order_id: PurchaseOrderId::new(),
                line: 0,
                product_id: product,
                variant_id: None,
                warehouse_id: w,
                quantity: qty,
                unit_cost: dec!(1),
            };
            receive(store.as_ref(), t, &receipt, UserId::new()).unwrap();
        }
        // Reserved stock counts against the minimum.
        coordinator
            .reserve(t, OrderId::new(), Some(w), &[OrderLine::new(flour, dec!(7))], UserId::new())
            .unwrap();

        let minimums = HashMap::from([(flour, dec!(5)), (sugar, dec!(2))]);
        let alerts = low_stock(store.as_ref(), t, &minimums).unwrap();

        let products: Vec<_> = alerts.iter().map(|a| (a.product_id, a.available)).collect();
        assert_eq!(products, vec![(flour, dec!(3)), (sugar, dec!(2))]);
    }

    #[derive(Debug, Clone)]
    enum Op {
        Receive(i64),
        Reserve(u8, i64),
        Commit(u8),
        Release(u8),
        Adjust(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            (1i64..20).prop_map(Op::Receive),
            (0u8..6, 1i64..8).prop_map(|(o, q)| Op::Reserve(o, q)),
            (0u8..6).prop_map(Op::Commit),
            (0u8..6).prop_map(Op::Release),
            (-5i64..5).prop_map(Op::Adjust),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: whatever mix of lifecycle calls runs (failures
        /// included), every record stays within `0 <= reserved <= total` and
        /// its ledger replays to its snapshot.
        #[test]
        fn ledger_reconciles_after_random_operations(
            ops in prop::collection::vec(op_strategy(), 1..40)
        ) {
            let store = Arc::new(InMemoryInventoryStore::new());
            let coordinator = ReservationCoordinator::new(store.clone(), InMemoryBomCatalog::new());
            let (t, p, w) = (TenantId::new(), ProductId::new(), WarehouseId::new());
            let actor = UserId::new();
            let orders: Vec<OrderId> = (0..6).map(|_| OrderId::new()).collect();

            let record = store.upsert_zero_state(t, p, None, w).unwrap();
            for op in ops {
                match op {
                    Op::Receive(q) => {
                        let receipt = ReceiptLine {
                            purchase_order_id: PurchaseOrderId::new(),
                            line: 0,
                            product_id: p,
                            variant_id: None,
                            warehouse_id: w,
                            quantity: Decimal::from(q),
                            unit_cost: dec!(1),
                        };
                        receive(store.as_ref(), t, &receipt, actor).unwrap();
                    }
                    Op::Reserve(o, q) => {
                        let _ = coordinator.reserve(
                            t,
                            orders[o as usize],
                            None,
                            &[OrderLine::new(p, Decimal::from(q))],
                            actor,
                        );
                    }
                    Op::Commit(o) => {
                        let _ = coordinator.commit(t, orders[o as usize], actor);
                    }
                    Op::Release(o) => {
                        let _ = coordinator.release(t, orders[o as usize], "test", actor);
                    }
                    Op::Adjust(d) => {
                        let _ = adjust(
                            store.as_ref(),
                            t,
                            &ManualAdjustment::new(record.id, Decimal::from(d), "test"),
                            actor,
                        );
                    }
                }

                let current = store.get_by_id(t, record.id).unwrap();
                prop_assert!(current.reserved_quantity >= Decimal::ZERO);
                prop_assert!(current.reserved_quantity <= current.total_quantity);
            }

            for r in reconcile_tenant(store.as_ref(), t).unwrap() {
                prop_assert!(r.is_consistent(), "inconsistent record: {:?}", r);
            }
        }
    }
}
