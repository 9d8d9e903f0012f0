use crate::error::{AssemblyWarning, ScanError};
use crate::llm_extract::{ItemPayload, ReceiptPayload};
use crate::model::{Item, Receipt};
use time::OffsetDateTime;
use time::format_description::well_known::{Iso8601, Rfc3339};
use tracing::warn;
use uuid::Uuid;

/// Receipt-level and summed item-level discounts may drift by rounding;
/// anything beyond this is a real disagreement.
const DISCOUNT_EPSILON: f64 = 0.005;

/// An assembled receipt plus anything the assembler had to repair along the
/// way. Warnings are reported, never swallowed.
#[derive(Debug)]
pub struct Assembled {
    pub receipt: Receipt,
    pub warnings: Vec<AssemblyWarning>,
}

/// Convert a decoded extraction payload into the domain entity, applying the
/// documented defaults. Default substitution lives here and only here; the
/// decoder leaves optional fields absent.
pub fn assemble(
    payload: ReceiptPayload,
    evidence_image: Option<Vec<u8>>,
    captured_at: OffsetDateTime,
) -> Result<Assembled, ScanError> {
    if payload.items.is_empty() {
        return Err(ScanError::Validation(
            "no items found on the receipt".to_string(),
        ));
    }

    let mut warnings = Vec::new();

    let items: Vec<Item> = payload.items.into_iter().map(item_from_payload).collect();

    let item_sum: f64 = items.iter().map(Item::discount).sum();
    let discounts_total = match payload.discounts_total {
        Some(declared) if item_sum > 0.0 && (declared - item_sum).abs() > DISCOUNT_EPSILON => {
            let kept = declared.max(item_sum);
            warn!(
                declared,
                item_sum, kept, "Receipt-level and item-level discounts disagree"
            );
            warnings.push(AssemblyWarning::DiscountMismatch { declared, item_sum });
            kept
        }
        Some(declared) => declared,
        None => item_sum,
    };

    let (date, date_inferred) = match parse_receipt_date(&payload.date) {
        Some(parsed) => (parsed, false),
        None => {
            warn!(raw = %payload.date, "Unparseable receipt date, falling back to capture time");
            warnings.push(AssemblyWarning::InferredDate);
            (captured_at, true)
        }
    };

    let receipt = Receipt {
        id: Uuid::new_v4(),
        date,
        date_inferred,
        items,
        total: payload.total,
        payment_type: payload.payment_type.unwrap_or_else(|| "Unknown".to_string()),
        discounts_total,
        store_name: payload.store_name,
        currency: payload.currency,
        evidence_image,
    };

    Ok(Assembled { receipt, warnings })
}

fn item_from_payload(payload: ItemPayload) -> Item {
    Item::new(
        payload.name,
        payload.category,
        payload.quantity.unwrap_or(1.0),
        Some(payload.price),
        Some(payload.total),
        payload.discount.unwrap_or(0.0),
    )
}

/// Strict ISO-8601 parse; RFC 3339 first since that is what the service is
/// asked to produce.
fn parse_receipt_date(raw: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .ok()
        .or_else(|| OffsetDateTime::parse(raw, &Iso8601::DEFAULT).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn payload(items: Vec<ItemPayload>) -> ReceiptPayload {
        ReceiptPayload {
            store_name: "Edeka".to_string(),
            date: "2024-03-08T14:21:00Z".to_string(),
            total: 12.5,
            payment_type: None,
            discounts_total: None,
            currency: "EUR".to_string(),
            items,
        }
    }

    fn item(name: &str, discount: Option<f64>) -> ItemPayload {
        ItemPayload {
            name: name.to_string(),
            category: None,
            quantity: None,
            price: 1.0,
            total: 1.0,
            discount,
        }
    }

    fn captured_at() -> OffsetDateTime {
        datetime!(2024-06-01 10:00:00 UTC)
    }

    #[test]
    fn test_defaults_are_applied() {
        let assembled = assemble(payload(vec![item("Milk", None)]), None, captured_at()).unwrap();
        let receipt = assembled.receipt;
        assert_eq!(receipt.payment_type, "Unknown");
        assert_eq!(receipt.discounts_total, 0.0);
        assert_eq!(receipt.items[0].quantity(), 1.0);
        assert_eq!(receipt.items[0].discount(), 0.0);
        assert!(!receipt.date_inferred);
        assert!(assembled.warnings.is_empty());
    }

    #[test]
    fn test_empty_items_fail_validation() {
        let result = assemble(payload(vec![]), None, captured_at());
        assert!(matches!(result, Err(ScanError::Validation(_))));
    }

    #[test]
    fn test_discount_reconciliation_keeps_the_larger() {
        let mut p = payload(vec![item("Milk", Some(2.0)), item("Bread", Some(3.0))]);
        p.discounts_total = Some(2.0);
        let assembled = assemble(p, None, captured_at()).unwrap();
        assert!((assembled.receipt.discounts_total - 5.0).abs() < 1e-9);
        assert_eq!(
            assembled.warnings,
            vec![AssemblyWarning::DiscountMismatch {
                declared: 2.0,
                item_sum: 5.0
            }]
        );
    }

    #[test]
    fn test_matching_discounts_do_not_warn() {
        let mut p = payload(vec![item("Milk", Some(1.5))]);
        p.discounts_total = Some(1.5);
        let assembled = assemble(p, None, captured_at()).unwrap();
        assert_eq!(assembled.receipt.discounts_total, 1.5);
        assert!(assembled.warnings.is_empty());
    }

    #[test]
    fn test_declared_total_wins_when_items_carry_no_discounts() {
        let mut p = payload(vec![item("Milk", None)]);
        p.discounts_total = Some(2.0);
        let assembled = assemble(p, None, captured_at()).unwrap();
        assert_eq!(assembled.receipt.discounts_total, 2.0);
        assert!(assembled.warnings.is_empty());
    }

    #[test]
    fn test_unparseable_date_falls_back_to_capture_time() {
        let mut p = payload(vec![item("Milk", None)]);
        p.date = "not-a-date".to_string();
        let assembled = assemble(p, None, captured_at()).unwrap();
        assert_eq!(assembled.receipt.date, captured_at());
        assert!(assembled.receipt.date_inferred);
        assert!(assembled.warnings.contains(&AssemblyWarning::InferredDate));
    }

    #[test]
    fn test_evidence_bytes_are_attached_verbatim() {
        let evidence = vec![1u8, 2, 3];
        let assembled = assemble(
            payload(vec![item("Milk", None)]),
            Some(evidence.clone()),
            captured_at(),
        )
        .unwrap();
        assert_eq!(assembled.receipt.evidence_image, Some(evidence));
    }
}
