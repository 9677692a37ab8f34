//! Recipe catalog held in memory, scoped per tenant.

use std::collections::HashMap;
use std::sync::RwLock;

use rust_decimal::Decimal;

use larder_core::{ProductId, TenantId};
use larder_inventory::{BillOfMaterials, BomCatalog, BomError};

/// In-memory, tenant-scoped recipe catalog.
#[derive(Debug, Default)]
pub struct InMemoryBomCatalog {
    boms: RwLock<HashMap<(TenantId, ProductId), BillOfMaterials>>,
}

impl InMemoryBomCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the recipe of `bom.product_id`.
    pub fn upsert(&self, tenant_id: TenantId, bom: BillOfMaterials) -> Result<(), BomError> {
        for line in &bom.lines {
            if line.quantity_per_unit <= Decimal::ZERO {
                return Err(BomError::Validation(format!(
                    "component {} must have a positive quantity",
                    line.component_product_id
                )));
            }
            if line.scrap_percentage < Decimal::ZERO {
                return Err(BomError::Validation(format!(
                    "component {} has negative scrap",
                    line.component_product_id
                )));
            }
        }

        let mut boms = self.boms.write().unwrap_or_else(|e| e.into_inner());
        boms.insert((tenant_id, bom.product_id), bom);
        Ok(())
    }

    /// Toggle a recipe; inactive recipes explode to nothing.
    pub fn set_active(&self, tenant_id: TenantId, product_id: ProductId, active: bool) -> bool {
        let mut boms = self.boms.write().unwrap_or_else(|e| e.into_inner());
        match boms.get_mut(&(tenant_id, product_id)) {
            Some(bom) => {
                bom.is_active = active;
                true
            }
            None => false,
        }
    }
}

impl BomCatalog for InMemoryBomCatalog {
    fn bom_for(&self, tenant_id: TenantId, product_id: ProductId) -> Option<BillOfMaterials> {
        let boms = self.boms.read().unwrap_or_else(|e| e.into_inner());
        boms.get(&(tenant_id, product_id)).cloned()
    }
}
