use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

/// A single purchased line on a receipt.
///
/// Immutable once assembled; manual corrections go through [`Item::apply`].
#[derive(Debug, Clone, Serialize)]
pub struct Item {
    id: Uuid,
    name: String,
    category: Option<String>,
    quantity: f64,
    price: Option<f64>,
    total: Option<f64>,
    discount: f64,
}

/// A manual edit to an already-assembled item. `None` fields are left as-is.
#[derive(Debug, Clone, Default)]
pub struct ItemEdit {
    pub name: Option<String>,
    pub category: Option<String>,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub total: Option<f64>,
    pub discount: Option<f64>,
}

impl Item {
    pub(crate) fn new(
        name: String,
        category: Option<String>,
        quantity: f64,
        price: Option<f64>,
        total: Option<f64>,
        discount: f64,
    ) -> Self {
        Item {
            id: Uuid::new_v4(),
            name,
            category,
            quantity,
            price,
            total,
            discount,
        }
    }

    /// Rebuild an item from stored fields, keeping its original id.
    pub(crate) fn restore(
        id: Uuid,
        name: String,
        category: Option<String>,
        quantity: f64,
        price: Option<f64>,
        total: Option<f64>,
        discount: f64,
    ) -> Self {
        Item {
            id,
            name,
            category,
            quantity,
            price,
            total,
            discount,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> Option<&str> {
        self.category.as_deref()
    }

    pub fn quantity(&self) -> f64 {
        self.quantity
    }

    pub fn price(&self) -> Option<f64> {
        self.price
    }

    pub fn total(&self) -> Option<f64> {
        self.total
    }

    pub fn discount(&self) -> f64 {
        self.discount
    }

    /// Apply a manual edit (e.g. the user correcting a misread line).
    pub fn apply(&mut self, edit: ItemEdit) {
        if let Some(name) = edit.name {
            self.name = name;
        }
        if let Some(category) = edit.category {
            self.category = Some(category);
        }
        if let Some(quantity) = edit.quantity {
            self.quantity = quantity;
        }
        if let Some(price) = edit.price {
            self.price = Some(price);
        }
        if let Some(total) = edit.total {
            self.total = Some(total);
        }
        if let Some(discount) = edit.discount {
            self.discount = discount;
        }
    }
}

/// A structured record of one purchase. Created only by the assembler; a
/// receipt exclusively owns its items.
#[derive(Debug, Clone, Serialize)]
pub struct Receipt {
    pub id: Uuid,
    #[serde(with = "time::serde::rfc3339")]
    pub date: OffsetDateTime,
    /// True when the service's date string did not parse and the capture time
    /// was substituted.
    pub date_inferred: bool,
    pub items: Vec<Item>,
    pub total: f64,
    pub payment_type: String,
    pub discounts_total: f64,
    pub store_name: String,
    pub currency: String,
    /// Raw bytes of the capture (or its annotated overlay), kept for display
    /// only, never re-parsed.
    #[serde(skip_serializing)]
    pub evidence_image: Option<Vec<u8>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_edit_leaves_unset_fields() {
        let mut item = Item::new("Milk".into(), None, 1.0, Some(3.0), Some(3.0), 0.0);
        item.apply(ItemEdit {
            name: Some("Whole Milk".into()),
            quantity: Some(2.0),
            ..ItemEdit::default()
        });
        assert_eq!(item.name(), "Whole Milk");
        assert_eq!(item.quantity(), 2.0);
        assert_eq!(item.price(), Some(3.0)); // untouched
        assert_eq!(item.discount(), 0.0);
    }
}
