use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use pharmastock_core::{CategoryId, DomainError, DomainResult, Entity, ProductId};
use pharmastock_inventory::Batch;

/// Product status lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProductStatus {
    Active,
    /// Soft-deleted: kept because historical sales reference it.
    Deleted,
}

/// Editable catalog attributes.
///
/// `name` may be omitted on creation; the product then takes the lot's
/// product name from intake.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductAttrs {
    #[serde(default)]
    pub name: Option<String>,
    /// Price in smallest currency unit.
    pub selling_price: i64,
    #[serde(default)]
    pub margin_percent: Option<f64>,
    #[serde(default)]
    pub category_id: Option<CategoryId>,
    #[serde(default)]
    pub image_path: Option<String>,
}

impl ProductAttrs {
    pub fn validate(&self) -> DomainResult<()> {
        if let Some(name) = &self.name {
            if name.trim().is_empty() {
                return Err(DomainError::validation("name", "cannot be empty"));
            }
        }
        if self.selling_price < 0 {
            return Err(DomainError::validation("selling_price", "cannot be negative"));
        }
        if let Some(margin) = self.margin_percent {
            if !margin.is_finite() {
                return Err(DomainError::validation("margin_percent", "must be a finite number"));
            }
        }
        Ok(())
    }
}

/// How a product leaves the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeletionMode {
    /// Sale history references the product: mark it deleted, keep the row.
    Soft,
    Hard,
}

impl DeletionMode {
    pub fn for_history(has_sales: bool) -> Self {
        if has_sales {
            DeletionMode::Soft
        } else {
            DeletionMode::Hard
        }
    }
}

/// Every persisted column of a product row.
#[derive(Debug, Clone, PartialEq)]
pub struct ProductParts {
    pub id: ProductId,
    pub name: String,
    pub selling_price: i64,
    pub margin_percent: Option<f64>,
    pub category_id: Option<CategoryId>,
    pub image_path: Option<String>,
    pub status: ProductStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    id: ProductId,
    name: String,
    selling_price: i64,
    margin_percent: Option<f64>,
    category_id: Option<CategoryId>,
    image_path: Option<String>,
    status: ProductStatus,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl Entity for Product {
    type Id = ProductId;

    fn id(&self) -> ProductId {
        self.id
    }
}

impl Product {
    /// Create a product; `fallback_name` is used when `attrs.name` is absent.
    pub fn create(
        id: ProductId,
        attrs: ProductAttrs,
        fallback_name: &str,
        now: DateTime<Utc>,
    ) -> DomainResult<Self> {
        attrs.validate()?;
        let name = attrs.name.unwrap_or_else(|| fallback_name.to_string());
        if name.trim().is_empty() {
            return Err(DomainError::validation("name", "cannot be empty"));
        }
        Ok(Self {
            id,
            name,
            selling_price: attrs.selling_price,
            margin_percent: attrs.margin_percent,
            category_id: attrs.category_id,
            image_path: attrs.image_path,
            status: ProductStatus::Active,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn restore(parts: ProductParts) -> Self {
        Self {
            id: parts.id,
            name: parts.name,
            selling_price: parts.selling_price,
            margin_percent: parts.margin_percent,
            category_id: parts.category_id,
            image_path: parts.image_path,
            status: parts.status,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn selling_price(&self) -> i64 {
        self.selling_price
    }

    pub fn margin_percent(&self) -> Option<f64> {
        self.margin_percent
    }

    pub fn category_id(&self) -> Option<CategoryId> {
        self.category_id
    }

    pub fn image_path(&self) -> Option<&str> {
        self.image_path.as_deref()
    }

    pub fn status(&self) -> ProductStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Soft-deleted products cannot be sold or receive allocations.
    pub fn is_active(&self) -> bool {
        self.status == ProductStatus::Active
    }

    /// Fail with `NotFound` unless the product is live.
    pub fn ensure_active(&self) -> DomainResult<()> {
        if self.is_active() {
            Ok(())
        } else {
            Err(DomainError::not_found("product", self.id))
        }
    }

    /// Replace editable attributes. An omitted name keeps the current one.
    pub fn update(&mut self, attrs: ProductAttrs, now: DateTime<Utc>) -> DomainResult<()> {
        self.ensure_active()?;
        attrs.validate()?;
        if let Some(name) = attrs.name {
            self.name = name;
        }
        self.selling_price = attrs.selling_price;
        self.margin_percent = attrs.margin_percent;
        self.category_id = attrs.category_id;
        self.image_path = attrs.image_path;
        self.updated_at = now;
        Ok(())
    }

    pub fn mark_deleted(&mut self, now: DateTime<Utc>) {
        self.status = ProductStatus::Deleted;
        self.updated_at = now;
    }

    pub fn into_parts(self) -> ProductParts {
        ProductParts {
            id: self.id,
            name: self.name,
            selling_price: self.selling_price,
            margin_percent: self.margin_percent,
            category_id: self.category_id,
            image_path: self.image_path,
            status: self.status,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

/// Stock of `product_id`: the sum of remaining quantity over its linked rows.
pub fn total_stock<'a>(product_id: ProductId, batches: impl IntoIterator<Item = &'a Batch>) -> i64 {
    batches
        .into_iter()
        .filter(|b| b.linked_product_id() == Some(product_id))
        .map(Batch::remaining_quantity)
        .sum()
}
