use std::collections::HashMap;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use larder_core::{OrderId, ProductId, PurchaseOrderId, TenantId, UserId, VariantId, WarehouseId};
use larder_inventory::{
    BillOfMaterials, BomError, BomLine, HoldPhase, InventoryRecord, Movement, MovementType,
};

use super::*;
use crate::adjustments::{ManualAdjustment, adjust};
use crate::catalog::InMemoryBomCatalog;
use crate::receiving::{ReceiptLine, receive};
use crate::reconcile::reconcile_tenant;
use crate::store::{InMemoryInventoryStore, MovementLedger, TimeRange};
use crate::sweep::ExpirySweep;

type Coordinator = ReservationCoordinator<Arc<InMemoryInventoryStore>, InMemoryBomCatalog>;

struct Fixture {
    tenant: TenantId,
    actor: UserId,
    store: Arc<InMemoryInventoryStore>,
    coordinator: Coordinator,
}

impl Fixture {
    fn new() -> Self {
        Self::with_policy(ShortfallPolicy::Reject)
    }

    fn with_policy(policy: ShortfallPolicy) -> Self {
        let store = Arc::new(InMemoryInventoryStore::new());
        let coordinator =
            ReservationCoordinator::new(store.clone(), InMemoryBomCatalog::new()).with_shortfall_policy(policy);
        Self {
            tenant: TenantId::new(),
            actor: UserId::new(),
            store,
            coordinator,
        }
    }

    fn stock(&self, product: ProductId, warehouse: WarehouseId, qty: Decimal) -> InventoryRecord {
        let receipt = ReceiptLine {
            purchase_order_id: PurchaseOrderId::new(),
            line: 0,
            product_id: product,
            variant_id: None,
            warehouse_id: warehouse,
            quantity: qty,
            unit_cost: dec!(1),
        };
        receive(self.store.as_ref(), self.tenant, &receipt, self.actor)
            .unwrap()
            .record()
            .clone()
    }

    fn record(&self, id: RecordId) -> InventoryRecord {
        self.store.get_by_id(self.tenant, id).unwrap()
    }

    fn reserve(&self, order: OrderId, lines: &[OrderLine]) -> Result<ReservationReceipt, CoordinatorError> {
        self.coordinator.reserve(self.tenant, order, None, lines, self.actor)
    }

    fn recipe(&self, product: ProductId, lines: Vec<BomLine>) {
        self.coordinator
            .catalog()
            .upsert(self.tenant, BillOfMaterials::new(product, lines))
            .unwrap();
    }
}

#[test]
fn released_stock_becomes_available_to_other_orders() {
    let fx = Fixture::new();
    let (p, w) = (ProductId::new(), WarehouseId::new());
    let record = fx.stock(p, w, dec!(5));
    let (order_a, order_b) = (OrderId::new(), OrderId::new());

    fx.reserve(order_a, &[OrderLine::new(p, dec!(5))]).unwrap();
    assert_eq!(fx.record(record.id).available(), dec!(0));

    let err = fx.reserve(order_b, &[OrderLine::new(p, dec!(1))]).unwrap_err();
    assert!(err.is_insufficient_stock());

    fx.coordinator.release(fx.tenant, order_a, "customer cancelled", fx.actor).unwrap();
    assert_eq!(fx.record(record.id).available(), dec!(5));

    fx.reserve(order_b, &[OrderLine::new(p, dec!(1))]).unwrap();
    assert_eq!(fx.record(record.id).available(), dec!(4));
}

#[test]
fn concurrent_reservations_never_oversell() {
    let fx = Fixture::new();
    let (p, w) = (ProductId::new(), WarehouseId::new());
    let record = fx.stock(p, w, dec!(10));
    let coordinator = Arc::new(fx.coordinator);
    let tenant = fx.tenant;

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let coordinator = coordinator.clone();
            thread::spawn(move || {
                coordinator.reserve(tenant, OrderId::new(), None, &[OrderLine::new(p, dec!(1))], UserId::new())
            })
        })
        .collect();

    let mut succeeded = 0;
    let mut insufficient = 0;
    for handle in handles {
        match handle.join().unwrap() {
            Ok(_) => succeeded += 1,
            Err(e) if e.is_insufficient_stock() => insufficient += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(succeeded, 10);
    assert_eq!(insufficient, 90);
    let after = fx.store.get_by_id(tenant, record.id).unwrap();
    assert_eq!(after.available(), dec!(0));
    assert_eq!(after.reserved_quantity, dec!(10));
}

#[test]
fn release_is_idempotent() {
    let fx = Fixture::new();
    let (p, w) = (ProductId::new(), WarehouseId::new());
    let record = fx.stock(p, w, dec!(8));
    let order = OrderId::new();
    fx.reserve(order, &[OrderLine::new(p, dec!(3))]).unwrap();

    let first = fx.coordinator.release(fx.tenant, order, "cancelled", fx.actor).unwrap();
    let after_first = fx.record(record.id);
    let second = fx.coordinator.release(fx.tenant, order, "cancelled", fx.actor).unwrap();

    assert_eq!(first.changed().count(), 1);
    assert_eq!(second.changed().count(), 0);
    assert_eq!(second.lines[0].outcome, HoldOutcome::AlreadyReleased);
    assert_eq!(fx.record(record.id), after_first);
    assert_eq!(after_first.reserved_quantity, dec!(0));
}

#[test]
fn repeated_reserve_does_not_hold_twice() {
    let fx = Fixture::new();
    let (p, w) = (ProductId::new(), WarehouseId::new());
    let record = fx.stock(p, w, dec!(8));
    let order = OrderId::new();
    let lines = [OrderLine::new(p, dec!(3))];

    fx.reserve(order, &lines).unwrap();
    let again = fx.reserve(order, &lines).unwrap();

    assert!(matches!(again.lines[0].status, LineStatus::AlreadyHeld { .. }));
    assert_eq!(fx.record(record.id).reserved_quantity, dec!(3));
}

#[test]
fn commit_deducts_recipe_leaves() {
    let fx = Fixture::new();
    let w = WarehouseId::new();
    let (burger, bun, patty, meat) = (ProductId::new(), ProductId::new(), ProductId::new(), ProductId::new());
    fx.recipe(burger, vec![BomLine::new(bun, dec!(2)), BomLine::new(patty, dec!(1))]);
    fx.recipe(patty, vec![BomLine::new(meat, dec!(0.2))]);

    let burger_rec = fx.stock(burger, w, dec!(10));
    let bun_rec = fx.stock(bun, w, dec!(20));
    let patty_rec = fx.stock(patty, w, dec!(5));
    let meat_rec = fx.stock(meat, w, dec!(2));

    let order = OrderId::new();
    fx.reserve(order, &[OrderLine::new(burger, dec!(3))]).unwrap();
    let settlement = fx.coordinator.commit(fx.tenant, order, fx.actor).unwrap();

    let HoldOutcome::Committed { components } = &settlement.lines[0].outcome else {
        panic!("expected a commit, got {:?}", settlement.lines[0].outcome);
    };
    assert_eq!(components.len(), 2);

    let burger_after = fx.record(burger_rec.id);
    assert_eq!(burger_after.total_quantity, dec!(7));
    assert_eq!(burger_after.reserved_quantity, dec!(0));
    assert_eq!(fx.record(bun_rec.id).total_quantity, dec!(14));
    assert_eq!(fx.record(meat_rec.id).total_quantity, dec!(1.4));
    // Sub-assembly stock is not touched; its leaves are.
    assert_eq!(fx.record(patty_rec.id).total_quantity, dec!(5));

    let again = fx.coordinator.commit(fx.tenant, order, fx.actor).unwrap();
    assert_eq!(again.lines[0].outcome, HoldOutcome::AlreadyCommitted);
    assert_eq!(fx.record(bun_rec.id).total_quantity, dec!(14));
}

#[test]
fn cyclic_recipe_fails_before_any_deduction() {
    let fx = Fixture::new();
    let w = WarehouseId::new();
    let (a, b) = (ProductId::new(), ProductId::new());
    fx.recipe(a, vec![BomLine::new(b, dec!(1))]);
    fx.recipe(b, vec![BomLine::new(a, dec!(1))]);
    let a_rec = fx.stock(a, w, dec!(4));
    let b_rec = fx.stock(b, w, dec!(4));

    let order = OrderId::new();
    fx.reserve(order, &[OrderLine::new(a, dec!(1))]).unwrap();
    let err = fx.coordinator.commit(fx.tenant, order, fx.actor).unwrap_err();

    assert!(matches!(err, CoordinatorError::Bom(BomError::CyclicBom { .. })));
    assert_eq!(fx.record(a_rec.id).total_quantity, dec!(4));
    assert_eq!(fx.record(a_rec.id).reserved_quantity, dec!(1));
    assert_eq!(fx.record(b_rec.id).total_quantity, dec!(4));
    let consumed = fx
        .store
        .list_by_order(fx.tenant, order)
        .unwrap()
        .into_iter()
        .filter(|m| m.kind != MovementType::Reserve)
        .count();
    assert_eq!(consumed, 0);
}

#[test]
fn component_shortfall_rejects_commit_and_keeps_hold() {
    let fx = Fixture::new();
    let w = WarehouseId::new();
    let (dish, sauce) = (ProductId::new(), ProductId::new());
    fx.recipe(dish, vec![BomLine::new(sauce, dec!(1))]);
    let dish_rec = fx.stock(dish, w, dec!(5));
    let sauce_rec = fx.stock(sauce, w, dec!(1));

    let order = OrderId::new();
    fx.reserve(order, &[OrderLine::new(dish, dec!(2))]).unwrap();
    let err = fx.coordinator.commit(fx.tenant, order, fx.actor).unwrap_err();

    assert!(err.is_insufficient_stock());
    assert!(matches!(err, CoordinatorError::CommitFailed { line: 0, .. }));
    let dish_after = fx.record(dish_rec.id);
    assert_eq!(dish_after.total_quantity, dec!(5));
    assert_eq!(dish_after.reserved_quantity, dec!(2));
    assert_eq!(fx.record(sauce_rec.id).total_quantity, dec!(1));

    let holds = fx.coordinator.holds(fx.tenant, order).unwrap();
    assert_eq!(holds[0].phase(), HoldPhase::Reserved);
}

#[test]
fn clamp_policy_deducts_what_is_available() {
    let fx = Fixture::with_policy(ShortfallPolicy::ClampToAvailable);
    let w = WarehouseId::new();
    let (dish, sauce, garnish) = (ProductId::new(), ProductId::new(), ProductId::new());
    fx.recipe(dish, vec![BomLine::new(sauce, dec!(1)), BomLine::new(garnish, dec!(1))]);
    let dish_rec = fx.stock(dish, w, dec!(5));
    let sauce_rec = fx.stock(sauce, w, dec!(1));

    let order = OrderId::new();
    fx.reserve(order, &[OrderLine::new(dish, dec!(2))]).unwrap();
    let settlement = fx.coordinator.commit(fx.tenant, order, fx.actor).unwrap();

    let HoldOutcome::Committed { components } = &settlement.lines[0].outcome else {
        panic!("expected a commit");
    };
    // Garnish has no record at all and is skipped.
    assert_eq!(components.len(), 1);
    assert_eq!(components[0].required, dec!(2));
    assert_eq!(components[0].deducted, dec!(1));
    assert_eq!(fx.record(sauce_rec.id).total_quantity, dec!(0));
    assert_eq!(fx.record(dish_rec.id).total_quantity, dec!(3));
}

#[test]
fn excluded_component_is_not_deducted() {
    let fx = Fixture::new();
    let w = WarehouseId::new();
    let (burger, bun, onion) = (ProductId::new(), ProductId::new(), ProductId::new());
    fx.recipe(burger, vec![BomLine::new(bun, dec!(2)), BomLine::new(onion, dec!(1))]);
    fx.stock(burger, w, dec!(3));
    let bun_rec = fx.stock(bun, w, dec!(10));
    let onion_rec = fx.stock(onion, w, dec!(10));

    let order = OrderId::new();
    fx.reserve(order, &[OrderLine::new(burger, dec!(1))]).unwrap();
    let options = CommitOptions::default().exclude(0, onion);
    fx.coordinator.commit_with(fx.tenant, order, &options, fx.actor).unwrap();

    assert_eq!(fx.record(bun_rec.id).total_quantity, dec!(8));
    assert_eq!(fx.record(onion_rec.id).total_quantity, dec!(10));
}

#[test]
fn declared_warehouse_is_preferred() {
    let fx = Fixture::new();
    let p = ProductId::new();
    let (big, small) = (WarehouseId::new(), WarehouseId::new());
    fx.stock(p, big, dec!(50));
    let small_rec = fx.stock(p, small, dec!(5));

    let receipt = fx
        .coordinator
        .reserve(fx.tenant, OrderId::new(), Some(small), &[OrderLine::new(p, dec!(2))], fx.actor)
        .unwrap();
    assert!(matches!(
        receipt.lines[0].status,
        LineStatus::Reserved { record_id, .. } if record_id == small_rec.id
    ));
}

#[test]
fn undeclared_warehouse_picks_most_available_then_lowest_id() {
    let fx = Fixture::new();
    let p = ProductId::new();
    let (w1, w2, w3) = (WarehouseId::new(), WarehouseId::new(), WarehouseId::new());
    fx.stock(p, w1, dec!(3));
    fx.stock(p, w2, dec!(7));
    fx.stock(p, w3, dec!(7));

    let chosen = fx
        .coordinator
        .select_record(fx.tenant, None, &OrderLine::new(p, dec!(1)))
        .unwrap();
    assert_eq!(chosen.warehouse_id, w2.min(w3));

    // An inactive record is never chosen, even when declared.
    crate::adjustments::set_active(fx.store.as_ref(), fx.tenant, chosen.id, false).unwrap();
    let next = fx
        .coordinator
        .select_record(fx.tenant, Some(chosen.warehouse_id), &OrderLine::new(p, dec!(1)))
        .unwrap();
    assert_eq!(next.warehouse_id, w2.max(w3));
}

#[test]
fn failed_line_rolls_back_earlier_holds() {
    let fx = Fixture::new();
    let w = WarehouseId::new();
    let (plenty, scarce, other) = (ProductId::new(), ProductId::new(), ProductId::new());
    let plenty_rec = fx.stock(plenty, w, dec!(10));
    fx.stock(scarce, w, dec!(1));

    let order = OrderId::new();
    let err = fx
        .reserve(
            order,
            &[
                OrderLine::new(plenty, dec!(4)),
                OrderLine::new(scarce, dec!(2)),
                OrderLine::new(other, dec!(1)),
            ],
        )
        .unwrap_err();

    let failure = err.reservation_failure().unwrap();
    assert_eq!(failure.failed_line, 1);
    assert!(matches!(failure.lines[0].status, LineStatus::RolledBack { .. }));
    assert!(matches!(failure.lines[1].status, LineStatus::Failed { .. }));
    assert_eq!(failure.lines[2].status, LineStatus::NotAttempted);
    assert_eq!(fx.record(plenty_rec.id).reserved_quantity, dec!(0));

    // The rolled back line can be reserved again on a new attempt.
    fx.stock(scarce, w, dec!(5));
    fx.reserve(order, &[OrderLine::new(plenty, dec!(4)), OrderLine::new(scarce, dec!(2))])
        .unwrap();
    let holds = fx.coordinator.holds(fx.tenant, order).unwrap();
    let live: Vec<_> = holds.iter().filter(|h| h.phase() == HoldPhase::Reserved).collect();
    assert_eq!(live.len(), 2);
    assert_eq!(live[0].key().attempt, 1);
    assert_eq!(live[1].key().attempt, 0);
}

#[test]
fn commit_after_release_changes_nothing() {
    let fx = Fixture::new();
    let (p, w) = (ProductId::new(), WarehouseId::new());
    let record = fx.stock(p, w, dec!(4));
    let order = OrderId::new();
    fx.reserve(order, &[OrderLine::new(p, dec!(4))]).unwrap();
    fx.coordinator.release(fx.tenant, order, "cancelled", fx.actor).unwrap();

    let settlement = fx.coordinator.commit(fx.tenant, order, fx.actor).unwrap();
    assert_eq!(settlement.lines[0].outcome, HoldOutcome::AlreadyReleased);
    assert_eq!(settlement.changed().count(), 0);
    assert_eq!(fx.record(record.id).total_quantity, dec!(4));
}

#[test]
fn expired_release_only_touches_old_holds() {
    let fx = Fixture::new();
    let (p, w) = (ProductId::new(), WarehouseId::new());
    let record = fx.stock(p, w, dec!(4));
    let order = OrderId::new();
    fx.reserve(order, &[OrderLine::new(p, dec!(1))]).unwrap();
    let reserved_at = fx
        .store
        .list_by_record(fx.tenant, record.id, TimeRange::all())
        .unwrap()
        .last()
        .unwrap()
        .created_at;

    let early = fx
        .coordinator
        .release_expired(fx.tenant, order, reserved_at, fx.actor)
        .unwrap();
    assert!(early.lines.is_empty());

    let late = fx
        .coordinator
        .release_expired(fx.tenant, order, reserved_at + chrono::Duration::seconds(1), fx.actor)
        .unwrap();
    assert_eq!(late.lines[0].outcome, HoldOutcome::Released);
    assert_eq!(fx.record(record.id).reserved_quantity, dec!(0));
}

#[test]
fn empty_or_non_positive_orders_are_rejected() {
    let fx = Fixture::new();
    assert!(matches!(
        fx.reserve(OrderId::new(), &[]),
        Err(CoordinatorError::Validation(_))
    ));
    assert!(matches!(
        fx.reserve(OrderId::new(), &[OrderLine::new(ProductId::new(), dec!(0))]),
        Err(CoordinatorError::Validation(_))
    ));
}

type BatchHook = Box<dyn FnOnce(&InMemoryInventoryStore) + Send>;

/// In-memory store that runs a hook right before the next batch it applies,
/// standing in for a writer that lands between a read and a write.
struct InterleavedStore {
    inner: Arc<InMemoryInventoryStore>,
    before_next_batch: Mutex<Option<BatchHook>>,
}

impl InterleavedStore {
    fn new(inner: Arc<InMemoryInventoryStore>) -> Self {
        Self {
            inner,
            before_next_batch: Mutex::new(None),
        }
    }

    fn before_next_batch(&self, hook: impl FnOnce(&InMemoryInventoryStore) + Send + 'static) {
        *self.before_next_batch.lock().unwrap() = Some(Box::new(hook));
    }
}

impl InventoryStore for InterleavedStore {
    fn get(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        self.inner.get(tenant_id, product_id, variant_id, warehouse_id)
    }

    fn get_by_id(&self, tenant_id: TenantId, record_id: RecordId) -> Result<InventoryRecord, StoreError> {
        self.inner.get_by_id(tenant_id, record_id)
    }

    fn list_for_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<InventoryRecord>, StoreError> {
        self.inner.list_for_product(tenant_id, product_id, variant_id)
    }

    fn list_records(&self, tenant_id: TenantId) -> Result<Vec<InventoryRecord>, StoreError> {
        self.inner.list_records(tenant_id)
    }

    fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        self.inner.tenants()
    }

    fn upsert_zero_state(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        self.inner.upsert_zero_state(tenant_id, product_id, variant_id, warehouse_id)
    }

    fn set_active(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        active: bool,
    ) -> Result<InventoryRecord, StoreError> {
        self.inner.set_active(tenant_id, record_id, active)
    }

    fn try_adjust_many(
        &self,
        tenant_id: TenantId,
        requests: Vec<AdjustRequest>,
    ) -> Result<Vec<Adjusted>, StoreError> {
        let hook = self.before_next_batch.lock().unwrap().take();
        if let Some(hook) = hook {
            hook(&self.inner);
        }
        self.inner.try_adjust_many(tenant_id, requests)
    }
}

impl MovementLedger for InterleavedStore {
    fn list_by_record(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        range: TimeRange,
    ) -> Result<Vec<Movement>, StoreError> {
        self.inner.list_by_record(tenant_id, record_id, range)
    }

    fn list_by_tenant(&self, tenant_id: TenantId, range: TimeRange) -> Result<Vec<Movement>, StoreError> {
        self.inner.list_by_tenant(tenant_id, range)
    }

    fn list_by_order(&self, tenant_id: TenantId, order_id: OrderId) -> Result<Vec<Movement>, StoreError> {
        self.inner.list_by_order(tenant_id, order_id)
    }
}

#[test]
fn clamp_policy_replans_when_component_drains_after_planning() {
    let inner = Arc::new(InMemoryInventoryStore::new());
    let store = Arc::new(InterleavedStore::new(inner.clone()));
    let coordinator = ReservationCoordinator::new(store.clone(), InMemoryBomCatalog::new())
        .with_shortfall_policy(ShortfallPolicy::ClampToAvailable);
    let (tenant, actor, w) = (TenantId::new(), UserId::new(), WarehouseId::new());
    let (dish, sauce) = (ProductId::new(), ProductId::new());
    coordinator
        .catalog()
        .upsert(tenant, BillOfMaterials::new(dish, vec![BomLine::new(sauce, dec!(1))]))
        .unwrap();

    let mut records = Vec::new();
    for (product, qty) in [(dish, dec!(5)), (sauce, dec!(3))] {
        let receipt = ReceiptLine {
            purchase_order_id: PurchaseOrderId::new(),
            line: 0,
            product_id: product,
            variant_id: None,
            warehouse_id: w,
            quantity: qty,
            unit_cost: dec!(1),
        };
        records.push(receive(inner.as_ref(), tenant, &receipt, actor).unwrap().record().clone());
    }
    let (dish_rec, sauce_rec) = (records[0].clone(), records[1].clone());

    let order = OrderId::new();
    coordinator
        .reserve(tenant, order, None, &[OrderLine::new(dish, dec!(2))], actor)
        .unwrap();

    // Planned against 3 sauce; 2 are spoiled before the commit lands.
    let spoiled = sauce_rec.id;
    store.before_next_batch(move |inner| {
        adjust(inner, tenant, &ManualAdjustment::new(spoiled, dec!(-2), "spoiled"), UserId::new()).unwrap();
    });
    let settlement = coordinator.commit(tenant, order, actor).unwrap();

    let HoldOutcome::Committed { components } = &settlement.lines[0].outcome else {
        panic!("expected a commit, got {:?}", settlement.lines[0].outcome);
    };
    assert_eq!(components[0].required, dec!(2));
    assert_eq!(components[0].deducted, dec!(1));
    assert_eq!(inner.get_by_id(tenant, sauce_rec.id).unwrap().total_quantity, dec!(0));
    assert_eq!(inner.get_by_id(tenant, dish_rec.id).unwrap().total_quantity, dec!(3));
}

#[test]
fn racing_commit_release_and_sweep_settle_each_hold_once() {
    let fx = Fixture::new();
    let w = WarehouseId::new();
    let (meal, rice) = (ProductId::new(), ProductId::new());
    fx.recipe(meal, vec![BomLine::new(rice, dec!(0.5))]);
    let meal_rec = fx.stock(meal, w, dec!(40));
    fx.stock(rice, w, dec!(100));

    let orders: Vec<OrderId> = (0..24).map(|_| OrderId::new()).collect();
    for &order in &orders {
        fx.reserve(order, &[OrderLine::new(meal, dec!(1))]).unwrap();
    }

    let tenant = fx.tenant;
    let coordinator = Arc::new(fx.coordinator);
    let sweepers = 2;
    let barrier = Arc::new(Barrier::new(orders.len() * 2 + sweepers));
    let mut handles = Vec::new();

    for &order in &orders {
        let (c, b) = (coordinator.clone(), barrier.clone());
        handles.push(thread::spawn(move || {
            b.wait();
            c.commit(tenant, order, UserId::new()).map(|_| ()).map_err(|e| e.to_string())
        }));
        let (c, b) = (coordinator.clone(), barrier.clone());
        handles.push(thread::spawn(move || {
            b.wait();
            c.release(tenant, order, "cancelled", UserId::new())
                .map(|_| ())
                .map_err(|e| e.to_string())
        }));
    }
    for _ in 0..sweepers {
        let sweep = ExpirySweep::new(coordinator.clone(), Duration::ZERO);
        let b = barrier.clone();
        handles.push(thread::spawn(move || {
            b.wait();
            let stats = sweep
                .run_once_at(Utc::now() + chrono::Duration::hours(1))
                .map_err(|e| e.to_string())?;
            if stats.failures == 0 {
                Ok(())
            } else {
                Err(format!("{} sweep failures", stats.failures))
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap().unwrap();
    }

    let mut committed = 0;
    for &order in &orders {
        let holds = coordinator.holds(tenant, order).unwrap();
        assert_eq!(holds.len(), 1);
        assert!(holds[0].phase().is_terminal(), "hold left {:?}", holds[0].phase());
        if holds[0].phase() == HoldPhase::Committed {
            committed += 1;
        }

        let mut settlements: HashMap<MovementType, usize> = HashMap::new();
        for m in coordinator.store().list_by_order(tenant, order).unwrap() {
            if matches!(m.kind, MovementType::CommitOut | MovementType::Release) {
                *settlements.entry(m.kind).or_default() += 1;
            }
        }
        assert_eq!(settlements.values().sum::<usize>(), 1, "order {order}: {settlements:?}");
    }

    let store = coordinator.store();
    let meal_after = store.get_by_id(tenant, meal_rec.id).unwrap();
    assert_eq!(meal_after.reserved_quantity, dec!(0));
    assert_eq!(meal_after.total_quantity, dec!(40) - Decimal::from(committed));
    for r in reconcile_tenant(store, tenant).unwrap() {
        assert!(r.is_consistent(), "inconsistent record: {r:?}");
    }
}
