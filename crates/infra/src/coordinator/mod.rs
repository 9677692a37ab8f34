//! Order lifecycle over the record store: reserve, commit, release.
//!
//! Each order line owns at most one live hold at a time. The hold's state is
//! never stored separately; it is folded from the order's movements, so the
//! ledger is the single source of truth and a crashed caller can always pick
//! up where it left off.
//!
//! Guarantees:
//! - a reservation either holds every line or none of the lines it created
//!   (compensating RELEASE movements undo partial progress)
//! - a line's commit deducts the item and all of its recipe components in one
//!   atomic batch, or nothing
//! - commit and release of the same hold exclude each other (guard keys)
//! - every operation is safe to repeat

mod error;
#[cfg(test)]
mod tests;
mod types;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, error, info, warn};

use larder_core::{OrderId, RecordId, TenantId, UserId, WarehouseId};
use larder_inventory::{
    BomCatalog, BomError, Hold, HoldKey, IdempotencyKey, InventoryRecord, MovementDraft,
    MovementType, Quantity, ReservedHold, StockChange, explode, fold_holds,
};

use crate::store::{AdjustRequest, Adjusted, InventoryStore, MovementLedger, StoreError};

pub use error::CoordinatorError;
pub use types::{
    CommitOptions, ComponentDeduction, HoldOutcome, LineReport, LineStatus, OrderLine,
    ReservationFailure, ReservationReceipt, SettledLine, Settlement, ShortfallPolicy,
};

/// Stock reserved by the current call, kept for compensation.
struct CreatedHold {
    report: usize,
    key: HoldKey,
    record: InventoryRecord,
    quantity: Quantity,
}

struct CommitPlan {
    key: HoldKey,
    record_id: RecordId,
    quantity: Quantity,
    requests: Vec<AdjustRequest>,
    components: Vec<ComponentDeduction>,
}

pub struct ReservationCoordinator<S, C> {
    store: S,
    catalog: C,
    shortfall: ShortfallPolicy,
}

impl<S, C> ReservationCoordinator<S, C>
where
    S: InventoryStore + MovementLedger,
    C: BomCatalog,
{
    pub fn new(store: S, catalog: C) -> Self {
        Self {
            store,
            catalog,
            shortfall: ShortfallPolicy::default(),
        }
    }

    pub fn with_shortfall_policy(mut self, shortfall: ShortfallPolicy) -> Self {
        self.shortfall = shortfall;
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    /// Hold stock for every line of an order.
    ///
    /// Lines already holding (or having consumed) stock for the order are
    /// reported as such and not reserved again. On the first failing line,
    /// every hold created by this call is released before the error is
    /// returned.
    pub fn reserve(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        declared_warehouse: Option<WarehouseId>,
        lines: &[OrderLine],
        actor: UserId,
    ) -> Result<ReservationReceipt, CoordinatorError> {
        if lines.is_empty() {
            return Err(CoordinatorError::Validation(format!(
                "order {order_id} has no lines"
            )));
        }
        if let Some((idx, _)) = lines
            .iter()
            .enumerate()
            .find(|(_, l)| l.quantity <= Decimal::ZERO)
        {
            return Err(CoordinatorError::Validation(format!(
                "line {idx} of order {order_id} must have a positive quantity"
            )));
        }
        let line_count = u32::try_from(lines.len())
            .map_err(|_| CoordinatorError::Validation("too many order lines".to_string()))?;

        let latest = self.latest_holds(tenant_id, order_id)?;
        let mut reports: Vec<LineReport> = Vec::with_capacity(lines.len());
        let mut created: Vec<CreatedHold> = Vec::new();

        for (line_no, line) in (0..line_count).zip(lines) {
            let attempt = match latest.get(&line_no) {
                Some(Hold::Reserved(h)) => {
                    reports.push(already_held(line_no, line, h.record_id(), h.quantity()));
                    continue;
                }
                Some(Hold::Committed(h)) => {
                    reports.push(already_held(line_no, line, h.record_id(), h.quantity()));
                    continue;
                }
                Some(Hold::Released(h)) => h.key().attempt + 1,
                None => 0,
            };
            let key = HoldKey {
                order_id,
                line: line_no,
                attempt,
            };

            let outcome = self
                .select_record(tenant_id, declared_warehouse, line)
                .and_then(|record| {
                    let draft = MovementDraft::new(
                        MovementType::Reserve,
                        key.reference(),
                        IdempotencyKey::reserve(order_id, line_no, attempt),
                        actor,
                    );
                    self.store.try_adjust(
                        tenant_id,
                        AdjustRequest::new(record.id, StockChange::reserve(line.quantity), draft),
                    )
                });

            match outcome {
                Ok(Adjusted::Applied { record, .. }) => {
                    info!(
                        tenant_id = %tenant_id,
                        order_id = %order_id,
                        line = line_no,
                        record_id = %record.id,
                        warehouse_id = %record.warehouse_id,
                        quantity = %line.quantity,
                        "stock reserved"
                    );
                    reports.push(LineReport {
                        line: line_no,
                        product_id: line.product_id,
                        status: LineStatus::Reserved {
                            record_id: record.id,
                            warehouse_id: record.warehouse_id,
                            quantity: line.quantity,
                        },
                    });
                    created.push(CreatedHold {
                        report: reports.len() - 1,
                        key,
                        record,
                        quantity: line.quantity,
                    });
                }
                Ok(Adjusted::Duplicate { record, movement }) => {
                    debug!(order_id = %order_id, line = line_no, "reservation already recorded");
                    reports.push(already_held(line_no, line, record.id, movement.reserved_delta));
                }
                Err(error) => {
                    warn!(
                        tenant_id = %tenant_id,
                        order_id = %order_id,
                        line = line_no,
                        error = %error,
                        "reservation failed; rolling back this call's holds"
                    );
                    reports.push(LineReport {
                        line: line_no,
                        product_id: line.product_id,
                        status: LineStatus::Failed {
                            error: error.clone(),
                        },
                    });
                    for (rest_no, rest) in (line_no + 1..line_count).zip(&lines[line_no as usize + 1..]) {
                        reports.push(LineReport {
                            line: rest_no,
                            product_id: rest.product_id,
                            status: LineStatus::NotAttempted,
                        });
                    }
                    self.compensate(tenant_id, &created, &mut reports, actor);
                    return Err(CoordinatorError::ReservationFailed(Box::new(
                        ReservationFailure {
                            order_id,
                            failed_line: line_no,
                            error,
                            lines: reports,
                        },
                    )));
                }
            }
        }

        Ok(ReservationReceipt {
            order_id,
            lines: reports,
        })
    }

    /// Deduct every reserved line of an order, recipes included.
    pub fn commit(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        actor: UserId,
    ) -> Result<Settlement, CoordinatorError> {
        self.commit_with(tenant_id, order_id, &CommitOptions::default(), actor)
    }

    /// [`commit`](Self::commit) with per-line component exclusions.
    ///
    /// All recipes are exploded before anything is deducted, so a cyclic
    /// recipe fails the call with no stock moved. Each line then commits as
    /// one atomic batch; a failing line stays reserved and stops the call.
    pub fn commit_with(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        options: &CommitOptions,
        actor: UserId,
    ) -> Result<Settlement, CoordinatorError> {
        let latest = self.latest_holds(tenant_id, order_id)?;
        let mut settlement = Settlement::new(order_id);
        let mut plans = Vec::new();

        for hold in latest.values() {
            match hold {
                Hold::Reserved(h) => plans.push((h, self.plan_commit(tenant_id, h, options, actor)?)),
                Hold::Committed(h) => settlement.lines.push(SettledLine {
                    key: h.key(),
                    record_id: h.record_id(),
                    quantity: h.quantity(),
                    outcome: HoldOutcome::AlreadyCommitted,
                }),
                Hold::Released(h) => settlement.lines.push(SettledLine {
                    key: h.key(),
                    record_id: h.record_id(),
                    quantity: h.quantity(),
                    outcome: HoldOutcome::AlreadyReleased,
                }),
            }
        }

        for (hold, mut plan) in plans {
            let mut result = self
                .store
                .try_adjust_many(tenant_id, std::mem::take(&mut plan.requests));
            if self.shortfall == ShortfallPolicy::ClampToAvailable
                && matches!(&result, Err(e) if e.is_insufficient_stock())
            {
                // A component was drained after planning; clamp against fresh stock.
                debug!(order_id = %order_id, line = plan.key.line, "component stock moved; re-planning commit");
                plan = self.plan_commit(tenant_id, hold, options, actor)?;
                result = self
                    .store
                    .try_adjust_many(tenant_id, std::mem::take(&mut plan.requests));
            }

            let outcome = match result {
                Ok(outcomes) if outcomes.first().is_some_and(Adjusted::is_duplicate) => {
                    debug!(order_id = %order_id, line = plan.key.line, "commit already recorded");
                    HoldOutcome::AlreadyCommitted
                }
                Ok(_) => {
                    info!(
                        tenant_id = %tenant_id,
                        order_id = %order_id,
                        line = plan.key.line,
                        record_id = %plan.record_id,
                        quantity = %plan.quantity,
                        components = plan.components.len(),
                        "hold committed"
                    );
                    HoldOutcome::Committed {
                        components: plan.components,
                    }
                }
                Err(StoreError::Superseded { .. }) => {
                    warn!(order_id = %order_id, line = plan.key.line, "hold released before commit");
                    HoldOutcome::Superseded
                }
                Err(source) => {
                    warn!(
                        tenant_id = %tenant_id,
                        order_id = %order_id,
                        line = plan.key.line,
                        error = %source,
                        "commit failed; hold stays reserved"
                    );
                    settlement.lines.sort_by_key(|l| l.key);
                    return Err(CoordinatorError::CommitFailed {
                        order_id,
                        line: plan.key.line,
                        source,
                        settled: Box::new(settlement),
                    });
                }
            };
            settlement.lines.push(SettledLine {
                key: plan.key,
                record_id: plan.record_id,
                quantity: plan.quantity,
                outcome,
            });
        }

        settlement.lines.sort_by_key(|l| l.key);
        Ok(settlement)
    }

    /// Return every reserved line of an order to available stock.
    ///
    /// Repeating the call is a no-op.
    pub fn release(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        reason: &str,
        actor: UserId,
    ) -> Result<Settlement, CoordinatorError> {
        self.release_matching(tenant_id, order_id, reason, actor, |_| true)
    }

    /// Release the order's holds reserved strictly before `cutoff`.
    pub fn release_expired(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        cutoff: DateTime<Utc>,
        actor: UserId,
    ) -> Result<Settlement, CoordinatorError> {
        self.release_matching(tenant_id, order_id, "reservation expired", actor, |h| {
            h.reserved_at() < cutoff
        })
    }

    /// Every hold of the order (all attempts), ordered by line then attempt.
    pub fn holds(&self, tenant_id: TenantId, order_id: OrderId) -> Result<Vec<Hold>, CoordinatorError> {
        let movements = self.store.list_by_order(tenant_id, order_id)?;
        Ok(fold_holds(&movements)?)
    }

    /// Pick the record a line reserves from.
    ///
    /// The declared warehouse wins when it has an active record for the
    /// product/variant. Otherwise the active record with the most available
    /// stock, ties going to the lowest warehouse id.
    pub fn select_record(
        &self,
        tenant_id: TenantId,
        declared_warehouse: Option<WarehouseId>,
        line: &OrderLine,
    ) -> Result<InventoryRecord, StoreError> {
        let candidates: Vec<InventoryRecord> = self
            .store
            .list_for_product(tenant_id, line.product_id, line.variant_id)?
            .into_iter()
            .filter(|r| r.is_active)
            .collect();

        if let Some(declared) = declared_warehouse {
            if let Some(record) = candidates.iter().find(|r| r.warehouse_id == declared) {
                return Ok(record.clone());
            }
        }

        candidates
            .into_iter()
            .max_by(|a, b| {
                a.available()
                    .cmp(&b.available())
                    .then_with(|| b.warehouse_id.cmp(&a.warehouse_id))
            })
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "no active inventory record for product {}",
                    line.product_id
                ))
            })
    }

    /// Latest hold per line: a re-reserved line shows its newest attempt.
    fn latest_holds(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
    ) -> Result<BTreeMap<u32, Hold>, CoordinatorError> {
        let mut latest = BTreeMap::new();
        for hold in self.holds(tenant_id, order_id)? {
            latest.insert(hold.key().line, hold);
        }
        Ok(latest)
    }

    fn release_hold(
        &self,
        tenant_id: TenantId,
        key: HoldKey,
        record_id: RecordId,
        quantity: Quantity,
        reason: &str,
        actor: UserId,
    ) -> Result<Adjusted, StoreError> {
        let draft = MovementDraft::new(
            MovementType::Release,
            key.reference(),
            IdempotencyKey::release(key.order_id, key.line, key.attempt),
            actor,
        )
        .guarded_by(IdempotencyKey::commit(key.order_id, key.line, key.attempt))
        .with_reason(reason);

        self.store.try_adjust(
            tenant_id,
            AdjustRequest::new(record_id, StockChange::release(quantity), draft),
        )
    }

    fn compensate(
        &self,
        tenant_id: TenantId,
        created: &[CreatedHold],
        reports: &mut [LineReport],
        actor: UserId,
    ) {
        for hold in created.iter().rev() {
            match self.release_hold(
                tenant_id,
                hold.key,
                hold.record.id,
                hold.quantity,
                "reservation rolled back",
                actor,
            ) {
                Ok(_) => {
                    warn!(
                        order_id = %hold.key.order_id,
                        line = hold.key.line,
                        record_id = %hold.record.id,
                        "hold compensated"
                    );
                    reports[hold.report].status = LineStatus::RolledBack {
                        record_id: hold.record.id,
                        warehouse_id: hold.record.warehouse_id,
                        quantity: hold.quantity,
                    };
                }
                Err(e) => {
                    // Still RESERVED; the expiry sweep releases it later.
                    error!(
                        order_id = %hold.key.order_id,
                        line = hold.key.line,
                        record_id = %hold.record.id,
                        error = %e,
                        "failed to compensate hold"
                    );
                }
            }
        }
    }

    fn release_matching<F>(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
        reason: &str,
        actor: UserId,
        due: F,
    ) -> Result<Settlement, CoordinatorError>
    where
        F: Fn(&ReservedHold) -> bool,
    {
        let latest = self.latest_holds(tenant_id, order_id)?;
        let mut settlement = Settlement::new(order_id);

        for hold in latest.values() {
            let (key, record_id, quantity, outcome) = match hold {
                Hold::Reserved(h) if due(h) => {
                    let outcome = match self.release_hold(
                        tenant_id,
                        h.key(),
                        h.record_id(),
                        h.quantity(),
                        reason,
                        actor,
                    ) {
                        Ok(Adjusted::Applied { .. }) => {
                            info!(
                                tenant_id = %tenant_id,
                                order_id = %order_id,
                                line = h.key().line,
                                record_id = %h.record_id(),
                                quantity = %h.quantity(),
                                reason,
                                "hold released"
                            );
                            HoldOutcome::Released
                        }
                        Ok(Adjusted::Duplicate { .. }) => {
                            debug!(order_id = %order_id, line = h.key().line, "release already recorded");
                            HoldOutcome::AlreadyReleased
                        }
                        Err(StoreError::Superseded { .. }) => {
                            warn!(order_id = %order_id, line = h.key().line, "hold committed before release");
                            HoldOutcome::Superseded
                        }
                        Err(e) => return Err(e.into()),
                    };
                    (h.key(), h.record_id(), h.quantity(), outcome)
                }
                Hold::Reserved(_) => continue,
                Hold::Committed(h) => (h.key(), h.record_id(), h.quantity(), HoldOutcome::AlreadyCommitted),
                Hold::Released(h) => (h.key(), h.record_id(), h.quantity(), HoldOutcome::AlreadyReleased),
            };
            settlement.lines.push(SettledLine {
                key,
                record_id,
                quantity,
                outcome,
            });
        }

        Ok(settlement)
    }

    fn plan_commit(
        &self,
        tenant_id: TenantId,
        hold: &ReservedHold,
        options: &CommitOptions,
        actor: UserId,
    ) -> Result<CommitPlan, CoordinatorError> {
        let key = hold.key();
        let record = self.store.get_by_id(tenant_id, hold.record_id())?;

        let explosion = explode(&self.catalog, tenant_id, record.product_id, hold.quantity())
            .inspect_err(|e| {
                if let BomError::CyclicBom { .. } = e {
                    error!(
                        tenant_id = %tenant_id,
                        product_id = %record.product_id,
                        error = %e,
                        "cyclic recipe; nothing deducted"
                    );
                }
            })?;

        let commit = MovementDraft::new(
            MovementType::CommitOut,
            key.reference(),
            IdempotencyKey::commit(key.order_id, key.line, key.attempt),
            actor,
        )
        .guarded_by(IdempotencyKey::release(key.order_id, key.line, key.attempt));

        let mut requests = vec![AdjustRequest::new(
            record.id,
            StockChange::commit_out(hold.quantity()),
            commit,
        )];
        let mut components = Vec::new();

        for required in explosion.deductions() {
            if options.is_excluded(key.line, required.product_id) {
                debug!(
                    order_id = %key.order_id,
                    line = key.line,
                    component = %required.product_id,
                    "component excluded from line"
                );
                continue;
            }

            let component = match self.store.get(tenant_id, required.product_id, None, record.warehouse_id) {
                Ok(c) => c,
                Err(StoreError::NotFound(_)) if self.shortfall == ShortfallPolicy::ClampToAvailable => {
                    warn!(
                        order_id = %key.order_id,
                        line = key.line,
                        component = %required.product_id,
                        warehouse_id = %record.warehouse_id,
                        "component has no stock record; skipped"
                    );
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let deducted = match self.shortfall {
                ShortfallPolicy::Reject => required.quantity,
                ShortfallPolicy::ClampToAvailable => {
                    let available = component.available().max(Decimal::ZERO);
                    if available < required.quantity {
                        warn!(
                            order_id = %key.order_id,
                            line = key.line,
                            component = %required.product_id,
                            required = %required.quantity,
                            available = %available,
                            "component short; deducting what is available"
                        );
                    }
                    required.quantity.min(available)
                }
            };
            if deducted <= Decimal::ZERO {
                continue;
            }

            let draft = MovementDraft::new(
                MovementType::BomConsumption,
                key.reference(),
                IdempotencyKey::component(key.order_id, key.line, key.attempt, required.product_id),
                actor,
            )
            .with_reason(format!("recipe of product {}", record.product_id));

            requests.push(AdjustRequest::new(component.id, StockChange::consume(deducted), draft));
            components.push(ComponentDeduction {
                product_id: required.product_id,
                record_id: component.id,
                required: required.quantity,
                deducted,
            });
        }

        Ok(CommitPlan {
            key,
            record_id: record.id,
            quantity: hold.quantity(),
            requests,
            components,
        })
    }
}

fn already_held(
    line_no: u32,
    line: &OrderLine,
    record_id: RecordId,
    quantity: Quantity,
) -> LineReport {
    LineReport {
        line: line_no,
        product_id: line.product_id,
        status: LineStatus::AlreadyHeld {
            record_id,
            quantity,
        },
    }
}
