//! Catalog snapshots carried inside cart lines.
//!
//! A snapshot is taken by the caller when an item is added to the cart and
//! is trusted as-is afterwards: prices are not re-fetched or re-validated.

use serde::{Deserialize, Serialize};

use crate::{Money, ProductId, VariantId};

/// The product fields a cart line needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductSnapshot {
    pub id: ProductId,
    pub name: String,
    /// Base price before any variant adjustment.
    pub price: Money,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Franchise the product belongs to (e.g. "Zelda"), if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub franchise: Option<String>,
}

impl ProductSnapshot {
    /// Snapshot with just the fields cart arithmetic depends on.
    #[must_use]
    pub fn new(id: ProductId, name: impl Into<String>, price: Money) -> Self {
        Self {
            id,
            name: name.into(),
            price,
            image_url: None,
            franchise: None,
        }
    }
}

/// A purchasable variant of a product (size, color, edition...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VariantSnapshot {
    pub id: VariantId,
    pub name: String,
    /// Added to the product's base price; may be negative for discounted variants.
    #[serde(default)]
    pub price_adjustment: Money,
}

impl VariantSnapshot {
    #[must_use]
    pub fn new(id: VariantId, name: impl Into<String>, price_adjustment: Money) -> Self {
        Self {
            id,
            name: name.into(),
            price_adjustment,
        }
    }
}

/// Price of one unit of `product` in the given variant.
#[must_use]
pub fn unit_price(product: &ProductSnapshot, variant: Option<&VariantSnapshot>) -> Money {
    product.price + variant.map_or(Money::ZERO, |v| v.price_adjustment)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_price_without_variant() {
        let product = ProductSnapshot::new(ProductId::random(), "Pixel Tee", Money::whole(20));
        assert_eq!(unit_price(&product, None), Money::whole(20));
    }

    #[test]
    fn test_unit_price_with_adjustment() {
        let product = ProductSnapshot::new(ProductId::random(), "Pixel Tee", Money::whole(20));
        let xl = VariantSnapshot::new(VariantId::random(), "XL", Money::from_cents(250));
        assert_eq!(unit_price(&product, Some(&xl)), Money::from_cents(2250));
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let product = ProductSnapshot::new(ProductId::random(), "Mug", Money::whole(9));
        let json = serde_json::to_value(&product).unwrap();
        assert!(json.get("image_url").is_none());
        assert!(json.get("franchise").is_none());
    }
}
