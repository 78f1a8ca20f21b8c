//! Cart model: validated item names and per-shopper cart lines

use serde::Serialize;
use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::num::NonZeroU32;
use thiserror::Error;

/// A cart mutation that never reaches the ledger
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MalformedMutation {
    #[error("item name is empty")]
    EmptyName,
    #[error("quantity must be at least 1, got {0}")]
    ZeroQuantity(i64),
}

/// Product name as reported by the detector, trimmed and non-empty
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ItemName(String);

impl ItemName {
    pub fn new(raw: &str) -> Result<Self, MalformedMutation> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(MalformedMutation::EmptyName);
        }
        Ok(Self(trimmed.to_string()))
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ItemName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a raw quantity coming from outside the ledger
pub fn quantity(raw: i64) -> Result<NonZeroU32, MalformedMutation> {
    u32::try_from(raw)
        .ok()
        .and_then(NonZeroU32::new)
        .ok_or(MalformedMutation::ZeroQuantity(raw))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CartLine {
    pub name: ItemName,
    pub quantity: u32,
}

/// What a single ledger mutation did to a cart
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CartChange {
    Added { name: ItemName, by: u32, now: u32 },
    Decremented { name: ItemName, now: u32 },
    Removed { name: ItemName },
}

impl CartChange {
    /// Human-readable delta used for the event log
    pub fn describe(&self) -> String {
        match self {
            CartChange::Added { name, by, .. } => format!("+{by} × {name}"),
            CartChange::Decremented { name, now } => format!("returned {name} (qty now {now})"),
            CartChange::Removed { name } => format!("returned {name}"),
        }
    }
}

/// Ordered cart lines, unique by name, every quantity ≥ 1
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Cart {
    lines: SmallVec<[CartLine; 8]>,
}

impl Cart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge into an existing line or append a new one
    pub fn add(&mut self, name: &ItemName, qty: NonZeroU32) -> CartChange {
        let by = qty.get();
        if let Some(line) = self.lines.iter_mut().find(|l| &l.name == name) {
            line.quantity = line.quantity.saturating_add(by);
            return CartChange::Added { name: name.clone(), by, now: line.quantity };
        }
        self.lines.push(CartLine { name: name.clone(), quantity: by });
        CartChange::Added { name: name.clone(), by, now: by }
    }

    /// Take one unit of `name` back; absent names are ignored
    pub fn remove_one(&mut self, name: &ItemName) -> Option<CartChange> {
        let idx = self.lines.iter().position(|l| &l.name == name)?;
        if self.lines[idx].quantity > 1 {
            self.lines[idx].quantity -= 1;
            return Some(CartChange::Decremented {
                name: name.clone(),
                now: self.lines[idx].quantity,
            });
        }
        self.lines.remove(idx);
        Some(CartChange::Removed { name: name.clone() })
    }

    /// Take up to `qty` units of `name` off the cart, returning how many
    /// were actually removed
    pub fn remove_up_to(&mut self, name: &str, qty: u32) -> u32 {
        let Some(idx) = self.lines.iter().position(|l| l.name.as_str() == name) else {
            return 0;
        };
        let line = &mut self.lines[idx];
        if line.quantity > qty {
            line.quantity -= qty;
            return qty;
        }
        let removed = line.quantity;
        self.lines.remove(idx);
        removed
    }

    pub fn quantity_of(&self, name: &str) -> u32 {
        self.lines.iter().find(|l| l.name.as_str() == name).map(|l| l.quantity).unwrap_or(0)
    }

    pub fn lines(&self) -> &[CartLine] {
        &self.lines
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Name → quantity map for the session payload
    pub fn to_map(&self) -> BTreeMap<String, u32> {
        self.lines.iter().map(|l| (l.name.as_str().to_string(), l.quantity)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> ItemName {
        ItemName::new(s).unwrap()
    }

    fn qty(n: u32) -> NonZeroU32 {
        NonZeroU32::new(n).unwrap()
    }

    #[test]
    fn test_item_name_validation() {
        assert_eq!(ItemName::new("  Pepsi ").unwrap().as_str(), "Pepsi");
        assert_eq!(ItemName::new("   "), Err(MalformedMutation::EmptyName));
        assert_eq!(ItemName::new(""), Err(MalformedMutation::EmptyName));
    }

    #[test]
    fn test_quantity_validation() {
        assert_eq!(quantity(3).unwrap().get(), 3);
        assert_eq!(quantity(0), Err(MalformedMutation::ZeroQuantity(0)));
        assert_eq!(quantity(-2), Err(MalformedMutation::ZeroQuantity(-2)));
    }

    #[test]
    fn test_add_merges_lines() {
        let mut cart = Cart::new();
        cart.add(&name("Pepsi"), qty(1));
        cart.add(&name("Chips"), qty(1));
        let change = cart.add(&name("Pepsi"), qty(2));

        assert_eq!(change, CartChange::Added { name: name("Pepsi"), by: 2, now: 3 });
        assert_eq!(cart.len(), 2);
        assert_eq!(cart.quantity_of("Pepsi"), 3);
        // insertion order is kept
        assert_eq!(cart.lines()[0].name.as_str(), "Pepsi");
        assert_eq!(cart.lines()[1].name.as_str(), "Chips");
    }

    #[test]
    fn test_remove_one_decrements_then_deletes() {
        let mut cart = Cart::new();
        cart.add(&name("Pepsi"), qty(2));

        assert_eq!(
            cart.remove_one(&name("Pepsi")),
            Some(CartChange::Decremented { name: name("Pepsi"), now: 1 })
        );
        assert_eq!(cart.remove_one(&name("Pepsi")), Some(CartChange::Removed { name: name("Pepsi") }));
        assert!(cart.is_empty());
        assert_eq!(cart.quantity_of("Pepsi"), 0);
    }

    #[test]
    fn test_remove_absent_is_noop() {
        let mut cart = Cart::new();
        cart.add(&name("Chips"), qty(1));
        assert_eq!(cart.remove_one(&name("Pepsi")), None);
        assert_eq!(cart.len(), 1);
    }

    #[test]
    fn test_remove_up_to() {
        let mut cart = Cart::new();
        cart.add(&name("Pepsi"), qty(3));
        cart.add(&name("Chips"), qty(1));

        assert_eq!(cart.remove_up_to("Pepsi", 2), 2);
        assert_eq!(cart.quantity_of("Pepsi"), 1);
        assert_eq!(cart.remove_up_to("Chips", 5), 1);
        assert_eq!(cart.quantity_of("Chips"), 0);
        assert_eq!(cart.remove_up_to("Water", 1), 0);
        assert_eq!(cart.len(), 1);
    }

    #[test]
    fn test_quantities_never_drop_below_one() {
        let mut cart = Cart::new();
        cart.add(&name("Water"), qty(3));
        for _ in 0..10 {
            cart.remove_one(&name("Water"));
            assert!(cart.lines().iter().all(|l| l.quantity >= 1));
        }
        assert!(cart.is_empty());
    }

    #[test]
    fn test_describe() {
        let change = CartChange::Added { name: name("Pepsi"), by: 2, now: 2 };
        assert_eq!(change.describe(), "+2 × Pepsi");
        assert_eq!(CartChange::Removed { name: name("Chips") }.describe(), "returned Chips");
    }

    #[test]
    fn test_to_map() {
        let mut cart = Cart::new();
        cart.add(&name("Pepsi"), qty(2));
        cart.add(&name("Chips"), qty(1));
        let map = cart.to_map();
        assert_eq!(map.get("Pepsi"), Some(&2));
        assert_eq!(map.get("Chips"), Some(&1));
    }
}
