//! Durable trigger rows backing the in-memory fire queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};

use super::jobs::parse_instant;
use super::{Database, StoreError};
use crate::types::{JobId, Trigger};

const TRIGGER_COLUMNS: &str = "job_id, next_fire_at, cron_expression, time_zone, paused";

/// Persistence for the firing schedule. The in-memory queue is a cache of
/// these rows; every mutation lands here first.
#[derive(Clone)]
pub struct TriggerStore {
    db: Arc<Database>,
}

impl TriggerStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace the trigger for a job.
    pub async fn upsert(&self, trigger: &Trigger) -> Result<(), StoreError> {
        let trigger = trigger.clone();
        self.db
            .with(move |conn| {
                conn.execute(
                    "INSERT OR REPLACE INTO triggers
                        (job_id, next_fire_at, cron_expression, time_zone, paused)
                     VALUES (?1,?2,?3,?4,?5)",
                    params![
                        trigger.job_id.to_string(),
                        trigger.next_fire_at.to_rfc3339(),
                        trigger.cron_expression,
                        trigger.time_zone,
                        trigger.paused as i32,
                    ],
                )?;
                Ok(())
            })
            .await
    }

    pub async fn get(&self, job_id: JobId) -> Result<Option<Trigger>, StoreError> {
        self.db
            .with(move |conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TRIGGER_COLUMNS} FROM triggers WHERE job_id = ?1"
                ))?;
                let row = stmt
                    .query_row(params![job_id.to_string()], row_to_trigger)
                    .optional()?;
                match row {
                    Some(inner) => Ok(Some(inner?)),
                    None => Ok(None),
                }
            })
            .await
    }

    pub async fn delete(&self, job_id: JobId) -> Result<bool, StoreError> {
        self.db
            .with(move |conn| {
                let rows = conn.execute(
                    "DELETE FROM triggers WHERE job_id = ?1",
                    params![job_id.to_string()],
                )?;
                Ok(rows > 0)
            })
            .await
    }

    /// Advance the firing instant.
    pub async fn set_next_fire(
        &self,
        job_id: JobId,
        next_fire_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.db
            .with(move |conn| {
                let rows = conn.execute(
                    "UPDATE triggers SET next_fire_at = ?1 WHERE job_id = ?2",
                    params![next_fire_at.to_rfc3339(), job_id.to_string()],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(job_id));
                }
                Ok(())
            })
            .await
    }

    pub async fn set_paused(&self, job_id: JobId, paused: bool) -> Result<(), StoreError> {
        self.db
            .with(move |conn| {
                let rows = conn.execute(
                    "UPDATE triggers SET paused = ?1 WHERE job_id = ?2",
                    params![paused as i32, job_id.to_string()],
                )?;
                if rows == 0 {
                    return Err(StoreError::NotFound(job_id));
                }
                Ok(())
            })
            .await
    }

    /// All trigger rows, due-soonest first. Used to rebuild the queue on start.
    pub async fn load_all(&self) -> Result<Vec<Trigger>, StoreError> {
        self.db
            .with(|conn| {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TRIGGER_COLUMNS} FROM triggers ORDER BY next_fire_at"
                ))?;
                let rows = stmt.query_map([], row_to_trigger)?;
                let mut triggers = Vec::new();
                for row in rows {
                    triggers.push(row??);
                }
                Ok(triggers)
            })
            .await
    }
}

fn row_to_trigger(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Trigger, StoreError>> {
    let job_id_str: String = row.get(0)?;
    let next_fire_str: String = row.get(1)?;
    let cron_expression: Option<String> = row.get(2)?;
    let time_zone: String = row.get(3)?;
    let paused: i32 = row.get(4)?;

    Ok((|| -> Result<Trigger, StoreError> {
        Ok(Trigger {
            job_id: job_id_str
                .parse()
                .map_err(|e: uuid::Error| StoreError::Serialization(e.to_string()))?,
            next_fire_at: parse_instant(&next_fire_str)?,
            cron_expression,
            time_zone,
            paused: paused != 0,
        })
    })())
}
