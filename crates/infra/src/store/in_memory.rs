use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::RwLock;

use chrono::Utc;
use rust_decimal::Decimal;

use larder_core::{MovementId, OrderId, ProductId, RecordId, TenantId, VariantId, WarehouseId};
use larder_inventory::{
    CostPolicy, IdempotencyKey, InventoryRecord, Movement, Precondition, RecordKey,
};

use super::r#trait::{AdjustRequest, Adjusted, InventoryStore, MovementLedger, StoreError, TimeRange};

#[derive(Debug, Default)]
struct State {
    records: HashMap<RecordId, InventoryRecord>,
    by_key: HashMap<RecordKey, RecordId>,
    /// Append order across all records.
    movements: Vec<Movement>,
    by_record: HashMap<RecordId, Vec<usize>>,
    keys: HashMap<(RecordId, IdempotencyKey), usize>,
}

impl State {
    fn record(&self, tenant_id: TenantId, record_id: RecordId) -> Result<&InventoryRecord, StoreError> {
        self.records
            .get(&record_id)
            .filter(|r| r.tenant_id == tenant_id)
            .ok_or_else(|| StoreError::NotFound(format!("inventory record {record_id}")))
    }

    fn movement_for_key(&self, record_id: RecordId, key: &IdempotencyKey) -> Option<&Movement> {
        self.keys
            .get(&(record_id, key.clone()))
            .map(|&i| &self.movements[i])
    }
}

/// In-memory record store + movement ledger.
///
/// Every conditional update runs check, mutate and append under one write
/// guard. Intended for tests/dev and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryInventoryStore {
    state: RwLock<State>,
    policy: CostPolicy,
}

impl InMemoryInventoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cost_policy(policy: CostPolicy) -> Self {
        Self {
            state: RwLock::default(),
            policy,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, State>, StoreError> {
        self.state
            .read()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, State>, StoreError> {
        self.state
            .write()
            .map_err(|_| StoreError::Backend("lock poisoned".to_string()))
    }
}

fn validate(request: &AdjustRequest) -> Result<(), StoreError> {
    let negative = match request.change.precondition {
        Precondition::None => false,
        Precondition::AvailableAtLeast(q) | Precondition::ReservedAtLeast(q) => q < Decimal::ZERO,
    };
    if negative {
        return Err(StoreError::Invalid(format!(
            "negative precondition quantity on record {}",
            request.record_id
        )));
    }
    if request.movement.idempotency_key.as_str().is_empty() {
        return Err(StoreError::Invalid("empty idempotency key".to_string()));
    }
    Ok(())
}

impl InventoryStore for InMemoryInventoryStore {
    fn get(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        let key = RecordKey::new(tenant_id, product_id, variant_id, warehouse_id);
        let state = self.read()?;
        state
            .by_key
            .get(&key)
            .and_then(|id| state.records.get(id))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "inventory record for product {product_id} in warehouse {warehouse_id}"
                ))
            })
    }

    fn get_by_id(&self, tenant_id: TenantId, record_id: RecordId) -> Result<InventoryRecord, StoreError> {
        self.read()?.record(tenant_id, record_id).cloned()
    }

    fn list_for_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<InventoryRecord>, StoreError> {
        let state = self.read()?;
        let mut out: Vec<_> = state
            .records
            .values()
            .filter(|r| r.tenant_id == tenant_id && r.product_id == product_id && r.variant_id == variant_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.warehouse_id);
        Ok(out)
    }

    fn list_records(&self, tenant_id: TenantId) -> Result<Vec<InventoryRecord>, StoreError> {
        let state = self.read()?;
        let mut out: Vec<_> = state
            .records
            .values()
            .filter(|r| r.tenant_id == tenant_id)
            .cloned()
            .collect();
        out.sort_by_key(|r| r.id);
        Ok(out)
    }

    fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let state = self.read()?;
        let tenants: BTreeSet<TenantId> = state.records.values().map(|r| r.tenant_id).collect();
        Ok(tenants.into_iter().collect())
    }

    fn upsert_zero_state(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        let key = RecordKey::new(tenant_id, product_id, variant_id, warehouse_id);
        let mut state = self.write()?;
        if let Some(existing) = state.by_key.get(&key).and_then(|id| state.records.get(id)) {
            return Ok(existing.clone());
        }

        let record = InventoryRecord::zero(RecordId::new(), key, Utc::now());
        state.by_key.insert(key, record.id);
        state.records.insert(record.id, record.clone());
        Ok(record)
    }

    fn set_active(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        active: bool,
    ) -> Result<InventoryRecord, StoreError> {
        let mut state = self.write()?;
        state.record(tenant_id, record_id)?;
        let record = state
            .records
            .get_mut(&record_id)
            .ok_or_else(|| StoreError::NotFound(format!("inventory record {record_id}")))?;
        if record.is_active != active {
            record.is_active = active;
            record.last_updated = Utc::now();
        }
        Ok(record.clone())
    }

    fn try_adjust_many(
        &self,
        tenant_id: TenantId,
        requests: Vec<AdjustRequest>,
    ) -> Result<Vec<Adjusted>, StoreError> {
        for request in &requests {
            validate(request)?;
        }

        let mut state = self.write()?;
        let now = Utc::now();

        // Working copies; nothing touches `state` until every request passed.
        let mut staged: HashMap<RecordId, InventoryRecord> = HashMap::new();
        let mut staged_keys: HashSet<(RecordId, IdempotencyKey)> = HashSet::new();
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            let record_id = request.record_id;
            let current = match staged.get(&record_id) {
                Some(r) => r.clone(),
                None => state.record(tenant_id, record_id)?.clone(),
            };

            let key = &request.movement.idempotency_key;
            if let Some(prior) = state.movement_for_key(record_id, key) {
                outcomes.push(Adjusted::Duplicate {
                    record: current,
                    movement: prior.clone(),
                });
                continue;
            }
            if staged_keys.contains(&(record_id, key.clone())) {
                return Err(StoreError::Invalid(format!(
                    "idempotency key '{key}' used twice in one batch"
                )));
            }

            let recorded = |k: &IdempotencyKey| {
                state.keys.contains_key(&(record_id, k.clone()))
                    || staged_keys.contains(&(record_id, k.clone()))
            };
            if let Some(guard) = request.movement.guard_keys.iter().find(|k| recorded(k)) {
                return Err(StoreError::Superseded {
                    record_id,
                    key: guard.clone(),
                });
            }

            request
                .expected_version
                .check(current.version)
                .map_err(|_| StoreError::Conflict {
                    record_id,
                    expected: request.expected_version,
                    actual: current.version,
                })?;

            let next = current
                .apply_change(&request.change, self.policy, now)
                .map_err(|rejection| StoreError::from_rejection(record_id, rejection))?;

            staged_keys.insert((record_id, key.clone()));
            let movement = request.movement.seal(MovementId::new(), &current, &next, now);
            staged.insert(record_id, next.clone());
            outcomes.push(Adjusted::Applied {
                record: next,
                movement,
            });
        }

        for (id, record) in staged {
            state.records.insert(id, record);
        }
        for outcome in &outcomes {
            let Adjusted::Applied { movement, .. } = outcome else {
                continue;
            };
            let index = state.movements.len();
            state.movements.push(movement.clone());
            state.by_record.entry(movement.record_id).or_default().push(index);
            state
                .keys
                .insert((movement.record_id, movement.idempotency_key.clone()), index);
        }

        // Applied outcomes report the record as of the end of the batch.
        for outcome in &mut outcomes {
            if let Adjusted::Applied { record, .. } = outcome {
                if let Some(latest) = state.records.get(&record.id) {
                    *record = latest.clone();
                }
            }
        }

        Ok(outcomes)
    }
}

impl MovementLedger for InMemoryInventoryStore {
    fn list_by_record(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        range: TimeRange,
    ) -> Result<Vec<Movement>, StoreError> {
        let state = self.read()?;
        state.record(tenant_id, record_id)?;
        Ok(state
            .by_record
            .get(&record_id)
            .into_iter()
            .flatten()
            .map(|&i| &state.movements[i])
            .filter(|m| range.contains(m.created_at))
            .cloned()
            .collect())
    }

    fn list_by_tenant(&self, tenant_id: TenantId, range: TimeRange) -> Result<Vec<Movement>, StoreError> {
        let state = self.read()?;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.tenant_id == tenant_id && range.contains(m.created_at))
            .cloned()
            .collect())
    }

    fn list_by_order(&self, tenant_id: TenantId, order_id: OrderId) -> Result<Vec<Movement>, StoreError> {
        let state = self.read()?;
        Ok(state
            .movements
            .iter()
            .filter(|m| m.tenant_id == tenant_id && m.reference.order_id() == Some(order_id))
            .cloned()
            .collect())
    }
}
