//! Read-only repository over the `Machines` and `Tags` metadata tables.
//!
//! Records are handed out by value as snapshots; a machine snapshot is
//! assembled from two parameterized queries (machines, then tags for those
//! ids) joined in memory. Retries are the caller's concern.

use std::sync::atomic::{AtomicU64, Ordering};

use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, SqlitePool};

use crate::model::{Machine, Tag};
use crate::storage::StoreError;

const MACHINE_COLUMNS: &str = "Id, Name, OpcEndpoint, AutomateType, IsActive";
const TAG_COLUMNS: &str =
    "Id, MachineId, Name, NodeId, DataType, Unit, MinValue, MaxValue, AllowedValues, IsActive";

/// Read-only view of machine and tag metadata.
///
/// Reads always hit the store, so a reload is expressed as a generation
/// bump that downstream caches observe to invalidate themselves.
pub struct MetadataRepository {
    pool: SqlitePool,
    generation: AtomicU64,
}

impl std::fmt::Debug for MetadataRepository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRepository")
            .field("generation", &self.generation.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MetadataRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            generation: AtomicU64::new(0),
        }
    }

    /// All active machines with their active tags, as a snapshot.
    pub async fn list_active_machines(&self) -> Result<Vec<Machine>, StoreError> {
        let machine_rows = sqlx::query(&format!(
            "SELECT {MACHINE_COLUMNS} FROM Machines WHERE IsActive = 1 ORDER BY Id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let mut machines: Vec<Machine> = machine_rows.iter().map(machine_from_row).collect();
        if machines.is_empty() {
            return Ok(machines);
        }

        let mut qb = QueryBuilder::new(format!(
            "SELECT {TAG_COLUMNS} FROM Tags WHERE IsActive = 1 AND MachineId IN ("
        ));
        let mut separated = qb.separated(", ");
        for machine in &machines {
            separated.push_bind(machine.id);
        }
        qb.push(") ORDER BY MachineId, Id");

        let tag_rows = qb.build().fetch_all(&self.pool).await?;
        for row in &tag_rows {
            let tag = tag_from_row(row);
            if let Some(machine) = machines.iter_mut().find(|m| m.id == tag.machine_id) {
                machine.tags.push(tag);
            }
        }

        Ok(machines)
    }

    /// A single machine with its tags, active or not.
    pub async fn get_machine(&self, id: i32) -> Result<Option<Machine>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {MACHINE_COLUMNS} FROM Machines WHERE Id = ?"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut machine = machine_from_row(&row);

        let tag_rows = sqlx::query(&format!(
            "SELECT {TAG_COLUMNS} FROM Tags WHERE MachineId = ? ORDER BY Id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        machine.tags = tag_rows.iter().map(tag_from_row).collect();

        Ok(Some(machine))
    }

    /// Look up a tag by its fleet-unique node address.
    pub async fn get_tag_by_node_id(&self, node_id: &str) -> Result<Option<Tag>, StoreError> {
        let row = sqlx::query(&format!("SELECT {TAG_COLUMNS} FROM Tags WHERE NodeId = ?"))
            .bind(node_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.as_ref().map(tag_from_row))
    }

    /// Active tags of one machine.
    pub async fn list_active_tags_by_machine(&self, id: i32) -> Result<Vec<Tag>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {TAG_COLUMNS} FROM Tags WHERE MachineId = ? AND IsActive = 1 ORDER BY Id"
        ))
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.iter().map(tag_from_row).collect())
    }

    /// Signal consumers that the next read should observe fresh data.
    pub fn reload(&self) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::info!(generation, "Metadata reload requested");
    }

    /// Current reload generation; caches compare against the generation
    /// they were filled under.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }
}

fn machine_from_row(row: &SqliteRow) -> Machine {
    Machine {
        id: row.get(0),
        name: row.get(1),
        opc_endpoint: row.get(2),
        automate_type: row.get(3),
        is_active: row.get::<i64, _>(4) != 0,
        tags: Vec::new(),
    }
}

fn tag_from_row(row: &SqliteRow) -> Tag {
    Tag {
        id: row.get(0),
        machine_id: row.get(1),
        name: row.get(2),
        node_id: row.get(3),
        data_type: row.get(4),
        unit: row.get(5),
        min_value: row.get(6),
        max_value: row.get(7),
        allowed_values: row.get(8),
        is_active: row.get::<i64, _>(9) != 0,
    }
}
