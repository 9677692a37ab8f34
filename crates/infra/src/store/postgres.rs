//! Postgres-backed record store and movement ledger.
//!
//! Schema lives in `crates/infra/migrations` and is embedded with
//! [`PostgresInventoryStore::migrate`].
//!
//! ## Atomicity
//!
//! A batch of conditional updates runs in one transaction:
//! 1. lock every target record (`SELECT ... FOR UPDATE`, ordered by id so
//!    concurrent batches acquire locks in the same order)
//! 2. per request: idempotency lookup, guard-key lookup, version and
//!    precondition check against the locked row
//! 3. `UPDATE` the record and `INSERT` its movement
//! 4. commit
//!
//! Any failure drops the transaction, which rolls everything back.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Invalid` |
//! | Database (foreign key violation) | `23503` | `TenantIsolation` |
//! | Database (check constraint violation) | `23514` | `Invalid` |
//! | Database (other) | Any other | `Backend` |
//! | PoolClosed / other | N/A | `Backend` |
//!
//! ## Sync bridge
//!
//! The store traits are synchronous. Calls made from inside a multi-threaded
//! Tokio runtime go through `block_in_place`; calls from plain threads (the
//! expiry sweep) block on the runtime handle captured at construction.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::runtime::Handle;
use tracing::{Span, debug, instrument};
use uuid::Uuid;

use larder_core::{
    MovementId, OrderId, ProductId, RecordId, TenantId, UserId, VariantId, WarehouseId,
};
use larder_inventory::{
    CostPolicy, IdempotencyKey, InventoryRecord, Movement, MovementType, Reference,
};

use super::r#trait::{AdjustRequest, Adjusted, InventoryStore, MovementLedger, StoreError, TimeRange};

const RECORD_COLUMNS: &str = r#"
    id, tenant_id, product_id, variant_id, warehouse_id,
    total_quantity, reserved_quantity, average_cost_price, last_cost_price,
    version, is_active, last_updated
"#;

const MOVEMENT_COLUMNS: &str = r#"
    id, tenant_id, record_id, movement_type,
    quantity_delta, reserved_delta, resulting_total, resulting_reserved,
    resulting_average_cost, unit_cost, reference, reason,
    idempotency_key, created_at, created_by
"#;

/// Postgres record store + ledger.
#[derive(Debug, Clone)]
pub struct PostgresInventoryStore {
    pool: Arc<PgPool>,
    handle: Handle,
    policy: CostPolicy,
}

impl PostgresInventoryStore {
    /// Must be called from within a Tokio runtime; its handle is kept for
    /// calls made later from non-runtime threads.
    pub fn new(pool: PgPool, policy: CostPolicy) -> Result<Self, StoreError> {
        let handle = Handle::try_current()
            .map_err(|e| StoreError::Backend(format!("no tokio runtime available: {e}")))?;
        Ok(Self::with_handle(pool, policy, handle))
    }

    pub fn with_handle(pool: PgPool, policy: CostPolicy, handle: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            handle,
            policy,
        }
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&*self.pool)
            .await
            .map_err(|e| StoreError::Backend(format!("migration failed: {e}")))
    }

    fn blocking<F: Future>(&self, fut: F) -> F::Output {
        match Handle::try_current() {
            Ok(current) => tokio::task::block_in_place(|| current.block_on(fut)),
            Err(_) => self.handle.block_on(fut),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, product_id = %product_id), err)]
    pub async fn load_by_key(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM inventory_records
            WHERE tenant_id = $1
              AND product_id = $2
              AND variant_id IS NOT DISTINCT FROM $3
              AND warehouse_id = $4
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(variant_id.map(|v| *v.as_uuid()))
        .bind(warehouse_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_key", e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound(format!(
                "inventory record for product {product_id} in warehouse {warehouse_id}"
            ))),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, record_id = %record_id), err)]
    pub async fn load_by_id(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
    ) -> Result<InventoryRecord, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM inventory_records WHERE tenant_id = $1 AND id = $2"
        ))
        .bind(tenant_id.as_uuid())
        .bind(record_id.as_uuid())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_by_id", e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound(format!("inventory record {record_id}"))),
        }
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, product_id = %product_id), err)]
    pub async fn load_for_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<InventoryRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {RECORD_COLUMNS}
            FROM inventory_records
            WHERE tenant_id = $1
              AND product_id = $2
              AND variant_id IS NOT DISTINCT FROM $3
            ORDER BY warehouse_id ASC
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(variant_id.map(|v| *v.as_uuid()))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_for_product", e))?;

        rows.iter().map(record_from_row).collect()
    }

    #[instrument(
        skip(self),
        fields(tenant_id = %tenant_id, record_count = tracing::field::Empty),
        err
    )]
    pub async fn load_records(&self, tenant_id: TenantId) -> Result<Vec<InventoryRecord>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM inventory_records WHERE tenant_id = $1 ORDER BY id ASC"
        ))
        .bind(tenant_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_records", e))?;

        Span::current().record("record_count", rows.len());
        rows.iter().map(record_from_row).collect()
    }

    pub async fn load_tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT DISTINCT tenant_id FROM inventory_records ORDER BY tenant_id")
                .fetch_all(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("load_tenants", e))?;
        Ok(ids.into_iter().map(TenantId::from_uuid).collect())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, product_id = %product_id), err)]
    pub async fn insert_zero_state(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        sqlx::query(
            r#"
            INSERT INTO inventory_records (id, tenant_id, product_id, variant_id, warehouse_id)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT ON CONSTRAINT inventory_records_natural_key DO NOTHING
            "#,
        )
        .bind(*RecordId::new().as_uuid())
        .bind(tenant_id.as_uuid())
        .bind(product_id.as_uuid())
        .bind(variant_id.map(|v| *v.as_uuid()))
        .bind(warehouse_id.as_uuid())
        .execute(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("insert_zero_state", e))?;

        self.load_by_key(tenant_id, product_id, variant_id, warehouse_id)
            .await
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, record_id = %record_id), err)]
    pub async fn update_active(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        active: bool,
    ) -> Result<InventoryRecord, StoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE inventory_records
            SET is_active = $3,
                last_updated = CASE WHEN is_active = $3 THEN last_updated ELSE NOW() END
            WHERE tenant_id = $1 AND id = $2
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(record_id.as_uuid())
        .bind(active)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_active", e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(StoreError::NotFound(format!("inventory record {record_id}"))),
        }
    }

    /// Apply conditional updates in one transaction (all or none).
    #[instrument(
        skip(self, requests),
        fields(tenant_id = %tenant_id, request_count = requests.len()),
        err
    )]
    pub async fn apply_batch(
        &self,
        tenant_id: TenantId,
        requests: Vec<AdjustRequest>,
    ) -> Result<Vec<Adjusted>, StoreError> {
        if requests.is_empty() {
            return Ok(vec![]);
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let mut current = lock_records(&mut tx, tenant_id, &requests).await?;
        let now = Utc::now();
        let mut batch_keys: HashSet<(RecordId, IdempotencyKey)> = HashSet::new();
        let mut outcomes = Vec::with_capacity(requests.len());

        for request in requests {
            let record_id = request.record_id;
            let record = current
                .get(&record_id)
                .cloned()
                .ok_or_else(|| StoreError::NotFound(format!("inventory record {record_id}")))?;

            let key = request.movement.idempotency_key.clone();
            if let Some(prior) = find_movement(&mut tx, tenant_id, record_id, &key).await? {
                debug!(record_id = %record_id, key = %key, "idempotent replay");
                outcomes.push(Adjusted::Duplicate {
                    record,
                    movement: prior,
                });
                continue;
            }
            if !batch_keys.insert((record_id, key.clone())) {
                return Err(StoreError::Invalid(format!(
                    "idempotency key '{key}' used twice in one batch"
                )));
            }

            let guard_in_batch = request
                .movement
                .guard_keys
                .iter()
                .find(|g| batch_keys.contains(&(record_id, (*g).clone())))
                .cloned();
            let guard_hit = match guard_in_batch {
                Some(g) => Some(g),
                None => find_guard(&mut tx, record_id, &request.movement.guard_keys).await?,
            };
            if let Some(guard) = guard_hit {
                return Err(StoreError::Superseded {
                    record_id,
                    key: guard,
                });
            }

            if !request.expected_version.matches(record.version) {
                return Err(StoreError::Conflict {
                    record_id,
                    expected: request.expected_version,
                    actual: record.version,
                });
            }

            let next = record
                .apply_change(&request.change, self.policy, now)
                .map_err(|rejection| StoreError::from_rejection(record_id, rejection))?;
            let movement = request.movement.seal(MovementId::new(), &record, &next, now);

            update_record(&mut tx, &next).await?;
            insert_movement(&mut tx, &movement).await?;

            current.insert(record_id, next.clone());
            outcomes.push(Adjusted::Applied {
                record: next,
                movement,
            });
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;

        for outcome in &mut outcomes {
            if let Adjusted::Applied { record, .. } = outcome {
                if let Some(latest) = current.get(&record.id) {
                    *record = latest.clone();
                }
            }
        }
        Ok(outcomes)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, record_id = %record_id), err)]
    pub async fn movements_for_record(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        range: TimeRange,
    ) -> Result<Vec<Movement>, StoreError> {
        self.load_by_id(tenant_id, record_id).await?;

        let rows = sqlx::query(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM inventory_movements
            WHERE tenant_id = $1 AND record_id = $2
              AND ($3::timestamptz IS NULL OR created_at >= $3)
              AND ($4::timestamptz IS NULL OR created_at < $4)
            ORDER BY seq ASC
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(record_id.as_uuid())
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements_for_record", e))?;

        rows.iter().map(movement_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id), err)]
    pub async fn movements_for_tenant(
        &self,
        tenant_id: TenantId,
        range: TimeRange,
    ) -> Result<Vec<Movement>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM inventory_movements
            WHERE tenant_id = $1
              AND ($2::timestamptz IS NULL OR created_at >= $2)
              AND ($3::timestamptz IS NULL OR created_at < $3)
            ORDER BY seq ASC
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(range.from)
        .bind(range.to)
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements_for_tenant", e))?;

        rows.iter().map(movement_from_row).collect()
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, order_id = %order_id), err)]
    pub async fn movements_for_order(
        &self,
        tenant_id: TenantId,
        order_id: OrderId,
    ) -> Result<Vec<Movement>, StoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {MOVEMENT_COLUMNS}
            FROM inventory_movements
            WHERE tenant_id = $1 AND order_id = $2
            ORDER BY seq ASC
            "#
        ))
        .bind(tenant_id.as_uuid())
        .bind(order_id.as_uuid())
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("movements_for_order", e))?;

        rows.iter().map(movement_from_row).collect()
    }
}

impl InventoryStore for PostgresInventoryStore {
    fn get(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        self.blocking(self.load_by_key(tenant_id, product_id, variant_id, warehouse_id))
    }

    fn get_by_id(&self, tenant_id: TenantId, record_id: RecordId) -> Result<InventoryRecord, StoreError> {
        self.blocking(self.load_by_id(tenant_id, record_id))
    }

    fn list_for_product(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
    ) -> Result<Vec<InventoryRecord>, StoreError> {
        self.blocking(self.load_for_product(tenant_id, product_id, variant_id))
    }

    fn list_records(&self, tenant_id: TenantId) -> Result<Vec<InventoryRecord>, StoreError> {
        self.blocking(self.load_records(tenant_id))
    }

    fn tenants(&self) -> Result<Vec<TenantId>, StoreError> {
        self.blocking(self.load_tenants())
    }

    fn upsert_zero_state(
        &self,
        tenant_id: TenantId,
        product_id: ProductId,
        variant_id: Option<VariantId>,
        warehouse_id: WarehouseId,
    ) -> Result<InventoryRecord, StoreError> {
        self.blocking(self.insert_zero_state(tenant_id, product_id, variant_id, warehouse_id))
    }

    fn set_active(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        active: bool,
    ) -> Result<InventoryRecord, StoreError> {
        self.blocking(self.update_active(tenant_id, record_id, active))
    }

    fn try_adjust_many(
        &self,
        tenant_id: TenantId,
        requests: Vec<AdjustRequest>,
    ) -> Result<Vec<Adjusted>, StoreError> {
        self.blocking(self.apply_batch(tenant_id, requests))
    }
}

impl MovementLedger for PostgresInventoryStore {
    fn list_by_record(
        &self,
        tenant_id: TenantId,
        record_id: RecordId,
        range: TimeRange,
    ) -> Result<Vec<Movement>, StoreError> {
        self.blocking(self.movements_for_record(tenant_id, record_id, range))
    }

    fn list_by_tenant(&self, tenant_id: TenantId, range: TimeRange) -> Result<Vec<Movement>, StoreError> {
        self.blocking(self.movements_for_tenant(tenant_id, range))
    }

    fn list_by_order(&self, tenant_id: TenantId, order_id: OrderId) -> Result<Vec<Movement>, StoreError> {
        self.blocking(self.movements_for_order(tenant_id, order_id))
    }
}

async fn lock_records(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    requests: &[AdjustRequest],
) -> Result<HashMap<RecordId, InventoryRecord>, StoreError> {
    let mut ids: Vec<Uuid> = requests.iter().map(|r| *r.record_id.as_uuid()).collect();
    ids.sort();
    ids.dedup();

    let rows = sqlx::query(&format!(
        r#"
        SELECT {RECORD_COLUMNS}
        FROM inventory_records
        WHERE tenant_id = $1 AND id = ANY($2)
        ORDER BY id ASC
        FOR UPDATE
        "#
    ))
    .bind(tenant_id.as_uuid())
    .bind(&ids)
    .fetch_all(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("lock_records", e))?;

    rows.iter()
        .map(|row| record_from_row(row).map(|r| (r.id, r)))
        .collect()
}

async fn find_movement(
    tx: &mut Transaction<'_, Postgres>,
    tenant_id: TenantId,
    record_id: RecordId,
    key: &IdempotencyKey,
) -> Result<Option<Movement>, StoreError> {
    let row = sqlx::query(&format!(
        r#"
        SELECT {MOVEMENT_COLUMNS}
        FROM inventory_movements
        WHERE tenant_id = $1 AND record_id = $2 AND idempotency_key = $3
        "#
    ))
    .bind(tenant_id.as_uuid())
    .bind(record_id.as_uuid())
    .bind(key.as_str())
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("find_movement", e))?;

    row.as_ref().map(movement_from_row).transpose()
}

async fn find_guard(
    tx: &mut Transaction<'_, Postgres>,
    record_id: RecordId,
    guards: &[IdempotencyKey],
) -> Result<Option<IdempotencyKey>, StoreError> {
    if guards.is_empty() {
        return Ok(None);
    }
    let keys: Vec<String> = guards.iter().map(|g| g.as_str().to_string()).collect();
    let hit: Option<String> = sqlx::query_scalar(
        r#"
        SELECT idempotency_key
        FROM inventory_movements
        WHERE record_id = $1 AND idempotency_key = ANY($2)
        LIMIT 1
        "#,
    )
    .bind(record_id.as_uuid())
    .bind(&keys)
    .fetch_optional(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("find_guard", e))?;

    Ok(hit.map(IdempotencyKey::new))
}

async fn update_record(
    tx: &mut Transaction<'_, Postgres>,
    record: &InventoryRecord,
) -> Result<(), StoreError> {
    sqlx::query(
        r#"
        UPDATE inventory_records
        SET total_quantity = $3,
            reserved_quantity = $4,
            average_cost_price = $5,
            last_cost_price = $6,
            version = $7,
            last_updated = $8
        WHERE tenant_id = $1 AND id = $2
        "#,
    )
    .bind(record.tenant_id.as_uuid())
    .bind(record.id.as_uuid())
    .bind(record.total_quantity)
    .bind(record.reserved_quantity)
    .bind(record.average_cost_price)
    .bind(record.last_cost_price)
    .bind(record.version as i64)
    .bind(record.last_updated)
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("update_record", e))?;
    Ok(())
}

async fn insert_movement(
    tx: &mut Transaction<'_, Postgres>,
    movement: &Movement,
) -> Result<(), StoreError> {
    let reference = serde_json::to_value(movement.reference)
        .map_err(|e| StoreError::Backend(format!("failed to encode reference: {e}")))?;

    sqlx::query(
        r#"
        INSERT INTO inventory_movements (
            id, tenant_id, record_id, movement_type,
            quantity_delta, reserved_delta, resulting_total, resulting_reserved,
            resulting_average_cost, unit_cost, reference, order_id, reason,
            idempotency_key, created_at, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
        "#,
    )
    .bind(movement.id.as_uuid())
    .bind(movement.tenant_id.as_uuid())
    .bind(movement.record_id.as_uuid())
    .bind(movement.kind.as_str())
    .bind(movement.quantity_delta)
    .bind(movement.reserved_delta)
    .bind(movement.resulting_total)
    .bind(movement.resulting_reserved)
    .bind(movement.resulting_average_cost)
    .bind(movement.unit_cost)
    .bind(reference)
    .bind(movement.reference.order_id().map(|o| *o.as_uuid()))
    .bind(movement.reason.as_deref())
    .bind(movement.idempotency_key.as_str())
    .bind(movement.created_at)
    .bind(movement.created_by.as_uuid())
    .execute(&mut **tx)
    .await
    .map_err(|e| map_sqlx_error("insert_movement", e))?;
    Ok(())
}

fn decode(what: &str) -> impl FnOnce(sqlx::Error) -> StoreError + '_ {
    move |e| StoreError::Backend(format!("failed to decode {what}: {e}"))
}

fn record_from_row(row: &PgRow) -> Result<InventoryRecord, StoreError> {
    let get_uuid = |col: &str| row.try_get::<Uuid, _>(col).map_err(decode(col));
    let get_dec = |col: &str| row.try_get::<Decimal, _>(col).map_err(decode(col));

    let variant: Option<Uuid> = row.try_get("variant_id").map_err(decode("variant_id"))?;
    let version: i64 = row.try_get("version").map_err(decode("version"))?;

    Ok(InventoryRecord {
        id: RecordId::from_uuid(get_uuid("id")?),
        tenant_id: TenantId::from_uuid(get_uuid("tenant_id")?),
        product_id: ProductId::from_uuid(get_uuid("product_id")?),
        variant_id: variant.map(VariantId::from_uuid),
        warehouse_id: WarehouseId::from_uuid(get_uuid("warehouse_id")?),
        total_quantity: get_dec("total_quantity")?,
        reserved_quantity: get_dec("reserved_quantity")?,
        average_cost_price: get_dec("average_cost_price")?,
        last_cost_price: row
            .try_get("last_cost_price")
            .map_err(decode("last_cost_price"))?,
        version: version as u64,
        is_active: row.try_get("is_active").map_err(decode("is_active"))?,
        last_updated: row
            .try_get::<DateTime<Utc>, _>("last_updated")
            .map_err(decode("last_updated"))?,
    })
}

fn movement_from_row(row: &PgRow) -> Result<Movement, StoreError> {
    let get_uuid = |col: &str| row.try_get::<Uuid, _>(col).map_err(decode(col));
    let get_dec = |col: &str| row.try_get::<Decimal, _>(col).map_err(decode(col));

    let kind: String = row.try_get("movement_type").map_err(decode("movement_type"))?;
    let kind = MovementType::parse(&kind)
        .ok_or_else(|| StoreError::Backend(format!("unknown movement type '{kind}'")))?;
    let reference: serde_json::Value = row.try_get("reference").map_err(decode("reference"))?;
    let reference: Reference = serde_json::from_value(reference)
        .map_err(|e| StoreError::Backend(format!("failed to decode reference: {e}")))?;
    let key: String = row
        .try_get("idempotency_key")
        .map_err(decode("idempotency_key"))?;

    Ok(Movement {
        id: MovementId::from_uuid(get_uuid("id")?),
        tenant_id: TenantId::from_uuid(get_uuid("tenant_id")?),
        record_id: RecordId::from_uuid(get_uuid("record_id")?),
        kind,
        quantity_delta: get_dec("quantity_delta")?,
        reserved_delta: get_dec("reserved_delta")?,
        resulting_total: get_dec("resulting_total")?,
        resulting_reserved: get_dec("resulting_reserved")?,
        resulting_average_cost: get_dec("resulting_average_cost")?,
        unit_cost: row.try_get("unit_cost").map_err(decode("unit_cost"))?,
        reference,
        reason: row.try_get("reason").map_err(decode("reason"))?,
        idempotency_key: IdempotencyKey::new(key),
        created_at: row
            .try_get::<DateTime<Utc>, _>("created_at")
            .map_err(decode("created_at"))?,
        created_by: UserId::from_uuid(get_uuid("created_by")?),
    })
}

/// Map SQLx errors to StoreError.
fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Invalid(msg),
                // Movements reference records through (tenant_id, record_id).
                Some("23503") => StoreError::TenantIsolation(msg),
                Some("23514") => StoreError::Invalid(msg),
                _ => StoreError::Backend(msg),
            }
        }
        sqlx::Error::PoolClosed => {
            StoreError::Backend(format!("connection pool closed in {}", operation))
        }
        _ => StoreError::Backend(format!("sqlx error in {}: {}", operation, err)),
    }
}
