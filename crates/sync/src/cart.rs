//! Per-tab cart replica.
//!
//! [`CartState`] owns the arithmetic: every mutation recomputes `subtotal`,
//! `discount` and `total` so that `total == subtotal - discount` always
//! holds. The discount is the last applied coupon amount clamped to
//! `[0, subtotal]`.
//!
//! [`CartStore`] persists the state through the vault and has two entry
//! points. [`CartStore::apply_local`] is for the user's own edits and
//! broadcasts `CART_UPDATE` when this tab leads. [`CartStore::apply_remote`]
//! is for snapshots received from the leader and never broadcasts.

use std::fmt;

use geekwear_core::{Money, ProductId, ProductSnapshot, VariantSnapshot, unit_price};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::channel::Publisher;
use crate::leader::Leadership;
use crate::message::{ConflictReport, SyncEvent};
use crate::storage::{Vault, VaultError, keys};

// =============================================================================
// Types
// =============================================================================

/// Identifier of a cart line: `{product}:{variant|default}:{nonce}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CartLineId(String);

impl CartLineId {
    fn generate(product: &ProductSnapshot, variant: Option<&VariantSnapshot>) -> Self {
        let variant = variant.map_or_else(|| "default".to_string(), |v| v.id.to_string());
        let nonce: String = uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect();
        Self(format!("{}:{variant}:{nonce}", product.id))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CartLineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for CartLineId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

/// One line of the cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItem {
    pub id: CartLineId,
    pub product: ProductSnapshot,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<VariantSnapshot>,
    /// Always at least 1; a line reaching zero is removed.
    pub quantity: u32,
}

impl CartItem {
    #[must_use]
    pub fn line_total(&self) -> Money {
        unit_price(&self.product, self.variant.as_ref()) * self.quantity
    }

    fn matches(&self, product: ProductId, variant: Option<&VariantSnapshot>) -> bool {
        self.product.id == product && self.variant.as_ref().map(|v| v.id) == variant.map(|v| v.id)
    }
}

/// The replicated cart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct CartState {
    pub items: Vec<CartItem>,
    pub subtotal: Money,
    pub discount: Money,
    pub total: Money,
    /// Amount passed to the last `ApplyCoupon`, before clamping.
    #[serde(default)]
    pub coupon_amount: Money,
}

/// A cart mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartOp {
    AddItem {
        product: ProductSnapshot,
        variant: Option<VariantSnapshot>,
        quantity: u32,
    },
    /// Values `<= 0` remove the line.
    UpdateQuantity { id: CartLineId, quantity: i64 },
    RemoveItem { id: CartLineId },
    Clear,
    ApplyCoupon { amount: Money },
    RemoveCoupon,
}

#[derive(Debug, Error)]
pub enum CartError {
    #[error("quantity must be at least 1")]
    ZeroQuantity,

    #[error("coupon amount cannot be negative: {0}")]
    NegativeCoupon(Money),

    #[error("cart persistence failed: {0}")]
    Storage(#[from] VaultError),
}

// =============================================================================
// Arithmetic
// =============================================================================

impl CartState {
    /// An empty cart.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Total number of units across all lines.
    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.items.iter().map(|item| u64::from(item.quantity)).sum()
    }

    #[must_use]
    pub fn find(&self, id: &CartLineId) -> Option<&CartItem> {
        self.items.iter().find(|item| &item.id == id)
    }

    /// Apply one mutation and recompute the derived fields.
    ///
    /// # Errors
    ///
    /// Returns `CartError::ZeroQuantity` for an add of zero units and
    /// `CartError::NegativeCoupon` for a negative coupon. The state is
    /// unchanged on error.
    pub fn apply(&mut self, op: CartOp) -> Result<(), CartError> {
        match op {
            CartOp::AddItem {
                product,
                variant,
                quantity,
            } => {
                if quantity == 0 {
                    return Err(CartError::ZeroQuantity);
                }
                if let Some(line) = self
                    .items
                    .iter_mut()
                    .find(|item| item.matches(product.id, variant.as_ref()))
                {
                    line.quantity = line.quantity.saturating_add(quantity);
                } else {
                    self.items.push(CartItem {
                        id: CartLineId::generate(&product, variant.as_ref()),
                        product,
                        variant,
                        quantity,
                    });
                }
            }
            CartOp::UpdateQuantity { id, quantity } => {
                if quantity <= 0 {
                    self.items.retain(|item| item.id != id);
                } else if let Some(line) = self.items.iter_mut().find(|item| item.id == id) {
                    line.quantity = u32::try_from(quantity).unwrap_or(u32::MAX);
                }
            }
            CartOp::RemoveItem { id } => self.items.retain(|item| item.id != id),
            CartOp::Clear => {
                *self = Self::empty();
            }
            CartOp::ApplyCoupon { amount } => {
                if amount.is_negative() {
                    return Err(CartError::NegativeCoupon(amount));
                }
                self.coupon_amount = amount;
            }
            CartOp::RemoveCoupon => self.coupon_amount = Money::ZERO,
        }
        self.recompute();
        Ok(())
    }

    /// Re-derive `subtotal`, `discount` and `total` from the lines.
    pub fn recompute(&mut self) {
        self.subtotal = self.items.iter().map(CartItem::line_total).sum();
        self.discount = self.coupon_amount.clamp_to(self.subtotal);
        self.total = self.subtotal - self.discount;
    }
}

// =============================================================================
// Store
// =============================================================================

/// A tab's cart: in-memory replica backed by the encrypted shared copy.
#[derive(Debug)]
pub struct CartStore {
    state: RwLock<CartState>,
    vault: Vault,
    publisher: Publisher,
    leadership: Leadership,
}

impl CartStore {
    /// Load the persisted cart. A value that cannot be opened or parsed is
    /// logged and replaced by an empty cart.
    #[must_use]
    pub fn open(vault: Vault, publisher: Publisher, leadership: Leadership) -> Self {
        let state = load(&vault).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "persisted cart unreadable, starting empty");
            CartState::empty()
        });
        Self {
            state: RwLock::new(state),
            vault,
            publisher,
            leadership,
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> CartState {
        self.state.read().clone()
    }

    #[must_use]
    pub fn item_count(&self) -> u64 {
        self.state.read().item_count()
    }

    /// Apply a local edit: mutate, persist, then broadcast the new snapshot
    /// if this tab leads.
    ///
    /// # Errors
    ///
    /// Returns `CartError` if the operation is invalid or persisting fails;
    /// the replica is left unchanged.
    #[tracing::instrument(skip(self), level = "debug")]
    pub fn apply_local(&self, op: CartOp) -> Result<CartState, CartError> {
        let snapshot = {
            let mut state = self.state.write();
            let mut next = state.clone();
            next.apply(op)?;
            self.vault.set_json(keys::CART, &next)?;
            *state = next.clone();
            next
        };

        if self.leadership.is_leader() {
            self.publisher
                .broadcast(SyncEvent::CartUpdate(Box::new(snapshot.clone())));
        }
        Ok(snapshot)
    }

    /// Adopt a snapshot received from the leader. Never broadcasts.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Storage` if persisting fails.
    pub fn apply_remote(&self, mut snapshot: CartState) -> Result<(), CartError> {
        snapshot.recompute();
        let mut state = self.state.write();
        self.vault.set_json(keys::CART, &snapshot)?;
        tracing::debug!(items = snapshot.items.len(), total = %snapshot.total, "applied remote cart");
        *state = snapshot;
        Ok(())
    }

    /// Compare the replica with the persisted value. On a difference, log
    /// it, broadcast `STORAGE_CONFLICT` and adopt the persisted value.
    ///
    /// # Errors
    ///
    /// Returns `CartError::Storage` if the persisted value cannot be read.
    pub fn rehydrate(&self) -> Result<Option<ConflictReport>, CartError> {
        let Some(raw) = self.vault.get_raw_json(keys::CART)? else {
            return Ok(None);
        };

        let report = {
            let mut state = self.state.write();
            let local = serde_json::to_value(&*state).map_err(VaultError::from)?;
            if local == raw {
                return Ok(None);
            }

            let persisted: CartState = serde_json::from_value(raw).map_err(VaultError::from)?;
            let report = ConflictReport {
                key: keys::CART.to_string(),
                local_items: state.items.len(),
                persisted_items: persisted.items.len(),
            };
            tracing::warn!(
                local_items = report.local_items,
                persisted_items = report.persisted_items,
                "cart replica diverged from persisted state"
            );
            *state = persisted;
            report
        };

        self.publisher
            .broadcast(SyncEvent::StorageConflict(report.clone()));
        Ok(Some(report))
    }

    /// Discard the replica and re-read persisted truth.
    pub fn reload(&self) {
        let state = load(&self.vault).unwrap_or_else(|e| {
            tracing::warn!(error = %e, "persisted cart unreadable on reload, keeping replica");
            self.snapshot()
        });
        *self.state.write() = state;
    }

    /// Add `quantity` units of a product, merging with an existing line.
    ///
    /// # Errors
    ///
    /// See [`CartStore::apply_local`].
    pub fn add_item(
        &self,
        product: ProductSnapshot,
        quantity: u32,
        variant: Option<VariantSnapshot>,
    ) -> Result<CartState, CartError> {
        self.apply_local(CartOp::AddItem {
            product,
            variant,
            quantity,
        })
    }

    /// Set a line's quantity; `<= 0` removes it.
    ///
    /// # Errors
    ///
    /// See [`CartStore::apply_local`].
    pub fn update_item_quantity(&self, id: &CartLineId, quantity: i64) -> Result<CartState, CartError> {
        self.apply_local(CartOp::UpdateQuantity {
            id: id.clone(),
            quantity,
        })
    }

    /// # Errors
    ///
    /// See [`CartStore::apply_local`].
    pub fn remove_item(&self, id: &CartLineId) -> Result<CartState, CartError> {
        self.apply_local(CartOp::RemoveItem { id: id.clone() })
    }

    /// # Errors
    ///
    /// See [`CartStore::apply_local`].
    pub fn clear_cart(&self) -> Result<CartState, CartError> {
        self.apply_local(CartOp::Clear)
    }

    /// # Errors
    ///
    /// See [`CartStore::apply_local`].
    pub fn apply_coupon(&self, amount: Money) -> Result<CartState, CartError> {
        self.apply_local(CartOp::ApplyCoupon { amount })
    }

    /// # Errors
    ///
    /// See [`CartStore::apply_local`].
    pub fn remove_coupon(&self) -> Result<CartState, CartError> {
        self.apply_local(CartOp::RemoveCoupon)
    }
}

fn load(vault: &Vault) -> Result<CartState, VaultError> {
    let mut state = vault.get_json::<CartState>(keys::CART)?.unwrap_or_default();
    state.recompute();
    Ok(state)
}
