//! Bill of materials explosion.
//!
//! A composite product is resolved into the components it consumes, walking
//! nested recipes depth-first. Quantities multiply along each path and are
//! accumulated per component, so a component reached through several paths is
//! counted once with the summed quantity.

use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use larder_core::{ProductId, TenantId};

use crate::record::Quantity;

/// One component line of a recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BomLine {
    pub component_product_id: ProductId,
    pub quantity_per_unit: Quantity,
    /// Expected waste, in percent, added on top of `quantity_per_unit`.
    #[serde(default)]
    pub scrap_percentage: Decimal,
}

impl BomLine {
    pub fn new(component_product_id: ProductId, quantity_per_unit: Quantity) -> Self {
        Self {
            component_product_id,
            quantity_per_unit,
            scrap_percentage: Decimal::ZERO,
        }
    }

    pub fn with_scrap(mut self, scrap_percentage: Decimal) -> Self {
        self.scrap_percentage = scrap_percentage;
        self
    }

    /// `None` when the product leaves the `Decimal` range.
    fn required_for(&self, quantity: Quantity) -> Option<Quantity> {
        let scrap_factor = Decimal::ONE.checked_add(self.scrap_percentage / Decimal::ONE_HUNDRED)?;
        self.quantity_per_unit
            .checked_mul(quantity)?
            .checked_mul(scrap_factor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BillOfMaterials {
    pub product_id: ProductId,
    pub lines: Vec<BomLine>,
    #[serde(default = "default_active")]
    pub is_active: bool,
}

fn default_active() -> bool {
    true
}

impl BillOfMaterials {
    pub fn new(product_id: ProductId, lines: Vec<BomLine>) -> Self {
        Self {
            product_id,
            lines,
            is_active: true,
        }
    }
}

/// Source of recipes, scoped per tenant.
pub trait BomCatalog: Send + Sync {
    /// The BOM of `product_id`, if it has one.
    fn bom_for(&self, tenant_id: TenantId, product_id: ProductId) -> Option<BillOfMaterials>;
}

impl<C> BomCatalog for std::sync::Arc<C>
where
    C: BomCatalog + ?Sized,
{
    fn bom_for(&self, tenant_id: TenantId, product_id: ProductId) -> Option<BillOfMaterials> {
        (**self).bom_for(tenant_id, product_id)
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BomError {
    /// A product appears as its own ancestor. Configuration defect; never retried.
    #[error("cyclic bill of materials: {}", format_path(.path))]
    CyclicBom { path: Vec<ProductId> },

    #[error("invalid bill of materials: {0}")]
    Validation(String),
}

fn format_path(path: &[ProductId]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" -> ")
}

/// One component of an exploded recipe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRequirement {
    pub product_id: ProductId,
    pub quantity: Quantity,
    /// Has its own recipe; its quantity is already accounted for by its leaves.
    pub sub_assembly: bool,
}

/// Result of exploding a product, in first-seen order.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BomExplosion {
    pub requirements: Vec<ComponentRequirement>,
}

impl BomExplosion {
    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    /// Leaf components: what actually gets deducted from stock.
    pub fn deductions(&self) -> impl Iterator<Item = &ComponentRequirement> {
        self.requirements.iter().filter(|r| !r.sub_assembly)
    }

    pub fn quantity_of(&self, product_id: ProductId) -> Option<Quantity> {
        self.requirements
            .iter()
            .find(|r| r.product_id == product_id)
            .map(|r| r.quantity)
    }
}

/// Explode `product_id` sold `quantity_sold` times into its components.
///
/// Products without an active BOM explode to an empty result.
pub fn explode<C>(
    catalog: &C,
    tenant_id: TenantId,
    product_id: ProductId,
    quantity_sold: Quantity,
) -> Result<BomExplosion, BomError>
where
    C: BomCatalog + ?Sized,
{
    if quantity_sold <= Decimal::ZERO {
        return Err(BomError::Validation(format!(
            "quantity sold must be positive (got {quantity_sold})"
        )));
    }

    let mut walk = Walk {
        catalog,
        tenant_id,
        path: vec![product_id],
        index: HashMap::new(),
        out: BomExplosion::default(),
    };
    if let Some(bom) = walk.active_bom(product_id) {
        walk.descend(&bom, quantity_sold)?;
    }
    Ok(walk.out)
}

struct Walk<'a, C: ?Sized> {
    catalog: &'a C,
    tenant_id: TenantId,
    path: Vec<ProductId>,
    index: HashMap<ProductId, usize>,
    out: BomExplosion,
}

impl<C: BomCatalog + ?Sized> Walk<'_, C> {
    fn active_bom(&self, product_id: ProductId) -> Option<BillOfMaterials> {
        self.catalog
            .bom_for(self.tenant_id, product_id)
            .filter(|b| b.is_active)
    }

    fn descend(&mut self, bom: &BillOfMaterials, quantity: Quantity) -> Result<(), BomError> {
        for line in &bom.lines {
            if line.quantity_per_unit <= Decimal::ZERO {
                return Err(BomError::Validation(format!(
                    "component {} of {} has non-positive quantity",
                    line.component_product_id, bom.product_id
                )));
            }

            let component = line.component_product_id;
            if self.path.contains(&component) {
                let mut path = self.path.clone();
                path.push(component);
                return Err(BomError::CyclicBom { path });
            }

            let required = line.required_for(quantity).ok_or_else(|| overflow(component))?;
            let nested = self.active_bom(component);
            self.accumulate(component, required, nested.is_some())?;

            if let Some(nested) = nested {
                self.path.push(component);
                self.descend(&nested, required)?;
                self.path.pop();
            }
        }
        Ok(())
    }

    fn accumulate(
        &mut self,
        product_id: ProductId,
        quantity: Quantity,
        sub_assembly: bool,
    ) -> Result<(), BomError> {
        match self.index.get(&product_id) {
            Some(&i) => {
                let entry = &mut self.out.requirements[i];
                entry.quantity = entry
                    .quantity
                    .checked_add(quantity)
                    .ok_or_else(|| overflow(product_id))?;
            }
            None => {
                self.index.insert(product_id, self.out.requirements.len());
                self.out.requirements.push(ComponentRequirement {
                    product_id,
                    quantity,
                    sub_assembly,
                });
            }
        }
        Ok(())
    }
}

fn overflow(product_id: ProductId) -> BomError {
    BomError::Validation(format!("required quantity of {product_id} is out of range"))
}
