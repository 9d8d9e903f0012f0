// src/store.rs

use crate::error::ScanError;
use crate::model::{Item, Receipt};
use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::info;
use uuid::Uuid;

/// The persistence collaborator as the pipeline sees it: mutations are staged
/// by `insert`/`delete` and hit disk only on `save`.
pub trait ReceiptStore: Send + Sync {
    fn insert(&self, receipt: &Receipt) -> Result<(), ScanError>;
    fn delete(&self, receipt_id: Uuid) -> Result<(), ScanError>;
    fn save(&self) -> Result<(), ScanError>;
}

/// SQLite-backed receipt store. A receipt exclusively owns its items: deleting
/// the receipt row cascades to them.
pub struct SqliteStore {
    inner: Mutex<StoreInner>,
}

struct StoreInner {
    conn: Connection,
    pending_inserts: Vec<Receipt>,
    pending_deletes: Vec<Uuid>,
}

impl SqliteStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, ScanError> {
        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| ScanError::Storage(format!("could not create db dir: {e}")))?;
            }
        }
        Self::with_connection(Connection::open(db_path)?)
    }

    /// In-memory store, used by tests and `--no-store` runs.
    pub fn in_memory() -> Result<Self, ScanError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, ScanError> {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS receipts (
                id TEXT PRIMARY KEY,
                date TEXT NOT NULL,
                date_inferred INTEGER NOT NULL DEFAULT 0,
                total REAL NOT NULL,
                payment_type TEXT NOT NULL,
                discounts_total REAL NOT NULL DEFAULT 0,
                store_name TEXT NOT NULL,
                currency TEXT NOT NULL,
                evidence BLOB,
                evidence_sha256 TEXT,
                created_at DATETIME DEFAULT CURRENT_TIMESTAMP
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS items (
                id TEXT PRIMARY KEY,
                receipt_id TEXT NOT NULL,
                position INTEGER NOT NULL,
                name TEXT NOT NULL,
                category TEXT,
                quantity REAL NOT NULL DEFAULT 1,
                price REAL,
                total REAL,
                discount REAL NOT NULL DEFAULT 0,
                FOREIGN KEY (receipt_id) REFERENCES receipts(id) ON DELETE CASCADE
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_items_receipt_id ON items(receipt_id)",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_receipts_date ON receipts(date)",
            [],
        )?;

        Ok(SqliteStore {
            inner: Mutex::new(StoreInner {
                conn,
                pending_inserts: Vec::new(),
                pending_deletes: Vec::new(),
            }),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, StoreInner>, ScanError> {
        self.inner
            .lock()
            .map_err(|_| ScanError::Storage("receipt store lock poisoned".to_string()))
    }

    /// Load one receipt with its items. Evidence bytes included.
    pub fn fetch(&self, receipt_id: Uuid) -> Result<Option<Receipt>, ScanError> {
        let inner = self.lock()?;
        let id = receipt_id.to_string();

        let row = inner
            .conn
            .query_row(
                "SELECT id, date, date_inferred, total, payment_type, discounts_total,
                        store_name, currency, evidence
                 FROM receipts WHERE id = ?1",
                params![id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, bool>(2)?,
                        row.get::<_, f64>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, f64>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<Vec<u8>>>(8)?,
                    ))
                },
            )
            .optional()?;

        let Some((id, date, date_inferred, total, payment_type, discounts_total, store_name, currency, evidence)) =
            row
        else {
            return Ok(None);
        };

        let mut stmt = inner.conn.prepare(
            "SELECT id, name, category, quantity, price, total, discount
             FROM items WHERE receipt_id = ?1 ORDER BY position",
        )?;
        let items = stmt
            .query_map(params![id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, f64>(3)?,
                    row.get::<_, Option<f64>>(4)?,
                    row.get::<_, Option<f64>>(5)?,
                    row.get::<_, f64>(6)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?
            .into_iter()
            .map(|(id, name, category, quantity, price, total, discount)| {
                Ok(Item::restore(
                    parse_uuid(&id)?,
                    name,
                    category,
                    quantity,
                    price,
                    total,
                    discount,
                ))
            })
            .collect::<Result<Vec<_>, ScanError>>()?;

        Ok(Some(Receipt {
            id: parse_uuid(&id)?,
            date: parse_stored_date(&date)?,
            date_inferred,
            items,
            total,
            payment_type,
            discounts_total,
            store_name,
            currency,
            evidence_image: evidence,
        }))
    }

    /// All stored receipt ids, newest first.
    pub fn list_ids(&self) -> Result<Vec<Uuid>, ScanError> {
        let inner = self.lock()?;
        let mut stmt = inner
            .conn
            .prepare("SELECT id FROM receipts ORDER BY created_at DESC, id")?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?
            .iter()
            .map(|raw| parse_uuid(raw))
            .collect::<Result<Vec<_>, ScanError>>()?;
        Ok(ids)
    }

    #[cfg(test)]
    fn item_row_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .conn
            .query_row("SELECT COUNT(*) FROM items", [], |row| row.get(0))
            .unwrap()
    }
}

impl ReceiptStore for SqliteStore {
    fn insert(&self, receipt: &Receipt) -> Result<(), ScanError> {
        let mut inner = self.lock()?;
        info!(id = %receipt.id, store = %receipt.store_name, "Receipt staged for save");
        inner.pending_inserts.push(receipt.clone());
        Ok(())
    }

    fn delete(&self, receipt_id: Uuid) -> Result<(), ScanError> {
        let mut inner = self.lock()?;
        let staged = inner.pending_inserts.len();
        inner.pending_inserts.retain(|r| r.id != receipt_id);
        if inner.pending_inserts.len() == staged {
            inner.pending_deletes.push(receipt_id);
        }
        Ok(())
    }

    fn save(&self) -> Result<(), ScanError> {
        let mut inner = self.lock()?;
        let StoreInner {
            conn,
            pending_inserts,
            pending_deletes,
        } = &mut *inner;

        let tx = conn.transaction()?;
        for id in pending_deletes.iter() {
            tx.execute(
                "DELETE FROM receipts WHERE id = ?1",
                params![id.to_string()],
            )?;
        }
        for receipt in pending_inserts.iter() {
            write_receipt(&tx, receipt)?;
        }
        tx.commit()?;

        info!(
            inserted = pending_inserts.len(),
            deleted = pending_deletes.len(),
            "Receipt store saved"
        );
        // Staged work survives a failed commit so the caller can retry.
        pending_inserts.clear();
        pending_deletes.clear();
        Ok(())
    }
}

fn write_receipt(tx: &rusqlite::Transaction<'_>, receipt: &Receipt) -> Result<(), ScanError> {
    let date = receipt
        .date
        .format(&Rfc3339)
        .map_err(|e| ScanError::Storage(format!("could not format receipt date: {e}")))?;
    let digest = receipt.evidence_image.as_deref().map(evidence_digest);

    tx.execute(
        "INSERT INTO receipts (id, date, date_inferred, total, payment_type,
                               discounts_total, store_name, currency, evidence, evidence_sha256)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            receipt.id.to_string(),
            date,
            receipt.date_inferred,
            receipt.total,
            receipt.payment_type,
            receipt.discounts_total,
            receipt.store_name,
            receipt.currency,
            receipt.evidence_image,
            digest,
        ],
    )?;

    for (position, item) in receipt.items.iter().enumerate() {
        tx.execute(
            "INSERT INTO items (id, receipt_id, position, name, category, quantity, price, total, discount)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                item.id().to_string(),
                receipt.id.to_string(),
                position as i64,
                item.name(),
                item.category(),
                item.quantity(),
                item.price(),
                item.total(),
                item.discount(),
            ],
        )?;
    }
    Ok(())
}

fn evidence_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

fn parse_uuid(raw: &str) -> Result<Uuid, ScanError> {
    Uuid::parse_str(raw).map_err(|e| ScanError::Storage(format!("corrupt id in store: {e}")))
}

fn parse_stored_date(raw: &str) -> Result<OffsetDateTime, ScanError> {
    OffsetDateTime::parse(raw, &Rfc3339)
        .map_err(|e| ScanError::Storage(format!("corrupt date in store: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn sample_receipt() -> Receipt {
        Receipt {
            id: Uuid::new_v4(),
            date: datetime!(2024-03-08 14:21:00 UTC),
            date_inferred: false,
            items: vec![
                Item::new("Milk".into(), Some("Dairy".into()), 2.0, Some(1.2), Some(2.4), 0.0),
                Item::new("Bread".into(), None, 1.0, Some(2.0), Some(2.0), 0.5),
            ],
            total: 3.9,
            payment_type: "card".to_string(),
            discounts_total: 0.5,
            store_name: "Edeka".to_string(),
            currency: "EUR".to_string(),
            evidence_image: Some(vec![9, 9, 9]),
        }
    }

    #[test]
    fn test_insert_is_invisible_before_save() {
        let store = SqliteStore::in_memory().unwrap();
        let receipt = sample_receipt();
        store.insert(&receipt).unwrap();
        assert!(store.fetch(receipt.id).unwrap().is_none());
        store.save().unwrap();
        assert!(store.fetch(receipt.id).unwrap().is_some());
    }

    #[test]
    fn test_save_then_fetch_round_trips() {
        let store = SqliteStore::in_memory().unwrap();
        let receipt = sample_receipt();
        store.insert(&receipt).unwrap();
        store.save().unwrap();

        let fetched = store.fetch(receipt.id).unwrap().unwrap();
        assert_eq!(fetched.store_name, "Edeka");
        assert_eq!(fetched.date, receipt.date);
        assert_eq!(fetched.items.len(), 2);
        assert_eq!(fetched.items[0].name(), "Milk");
        assert_eq!(fetched.items[0].id(), receipt.items[0].id());
        assert_eq!(fetched.items[1].discount(), 0.5);
        assert_eq!(fetched.evidence_image, Some(vec![9, 9, 9]));
    }

    #[test]
    fn test_delete_cascades_to_items() {
        let store = SqliteStore::in_memory().unwrap();
        let receipt = sample_receipt();
        store.insert(&receipt).unwrap();
        store.save().unwrap();
        assert_eq!(store.item_row_count(), 2);

        store.delete(receipt.id).unwrap();
        store.save().unwrap();
        assert!(store.fetch(receipt.id).unwrap().is_none());
        assert_eq!(store.item_row_count(), 0);
    }

    #[test]
    fn test_delete_of_staged_receipt_unstages_it() {
        let store = SqliteStore::in_memory().unwrap();
        let receipt = sample_receipt();
        store.insert(&receipt).unwrap();
        store.delete(receipt.id).unwrap();
        store.save().unwrap();
        assert!(store.fetch(receipt.id).unwrap().is_none());
        assert!(store.list_ids().unwrap().is_empty());
    }

    #[test]
    fn test_list_ids_sees_saved_receipts() {
        let store = SqliteStore::in_memory().unwrap();
        let a = sample_receipt();
        let b = sample_receipt();
        store.insert(&a).unwrap();
        store.insert(&b).unwrap();
        store.save().unwrap();
        let ids = store.list_ids().unwrap();
        assert_eq!(ids.len(), 2);
        assert!(ids.contains(&a.id));
        assert!(ids.contains(&b.id));
    }
}
