//! Tenant record source.
//!
//! The entity store itself is an external collaborator; the scheduler only
//! needs the ordered-read contract below. The SQLite implementation reads
//! the embedded `tenant_records` table; the in-memory one backs tests and
//! local development.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use rusqlite::params;

use super::{Database, StoreError};
use crate::types::TenantRecord;

/// Ordered read of every record owned by a tenant.
#[async_trait]
pub trait TenantRecordSource: Send + Sync {
    async fn records_for(&self, client_id: &str) -> Result<Vec<TenantRecord>, StoreError>;
}

/// Record source over the shared SQLite handle.
pub struct SqliteTenantRecords {
    db: Arc<Database>,
}

impl SqliteTenantRecords {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl TenantRecordSource for SqliteTenantRecords {
    async fn records_for(&self, client_id: &str) -> Result<Vec<TenantRecord>, StoreError> {
        let client_id = client_id.to_string();
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, client_id, payload FROM tenant_records
                     WHERE client_id = ?1 ORDER BY id",
                )?;
                let rows = stmt.query_map(params![client_id], |row| {
                    let id: String = row.get(0)?;
                    let client_id: String = row.get(1)?;
                    let payload: String = row.get(2)?;
                    Ok((id, client_id, payload))
                })?;
                let mut records = Vec::new();
                for row in rows {
                    let (id, client_id, payload) = row?;
                    let payload = serde_json::from_str(&payload)
                        .map_err(|e| StoreError::Serialization(e.to_string()))?;
                    records.push(TenantRecord {
                        id,
                        client_id,
                        payload,
                    });
                }
                Ok(records)
            })
            .await
    }
}

/// In-memory record source keyed by tenant.
#[derive(Default)]
pub struct MemoryTenantRecords {
    by_tenant: RwLock<HashMap<String, Vec<TenantRecord>>>,
    fail: RwLock<bool>,
}

impl MemoryTenantRecords {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, record: TenantRecord) {
        self.by_tenant
            .write()
            .entry(record.client_id.clone())
            .or_default()
            .push(record);
    }

    /// Make every subsequent read fail, to exercise read-error handling.
    pub fn fail_reads(&self, fail: bool) {
        *self.fail.write() = fail;
    }
}

#[async_trait]
impl TenantRecordSource for MemoryTenantRecords {
    async fn records_for(&self, client_id: &str) -> Result<Vec<TenantRecord>, StoreError> {
        if *self.fail.read() {
            return Err(StoreError::Sqlite("record source unavailable".to_string()));
        }
        Ok(self
            .by_tenant
            .read()
            .get(client_id)
            .cloned()
            .unwrap_or_default())
    }
}
