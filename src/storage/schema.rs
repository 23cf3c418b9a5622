//! Database schema definitions.
//!
//! The metadata tables (`Machines`, `Tags`) are seeded by external tooling;
//! this worker only needs them to exist. `TagValues` is the time-series
//! destination, indexed on `ReceivedTimestamp`. `TagValuesBulk` is the bulk
//! insert entry point: an INSTEAD-OF-trigger view accepting the TagValues
//! shape, standing in for a server-side table-valued bulk routine. Stores
//! deployed without it force the sink onto the per-row insert path.

use sqlx::SqlitePool;

use crate::storage::StoreError;

pub const MACHINES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS Machines (
    Id           INTEGER PRIMARY KEY AUTOINCREMENT,
    Name         TEXT    NOT NULL UNIQUE,
    Description  TEXT,
    AutomateType TEXT    NOT NULL DEFAULT '',
    OpcEndpoint  TEXT    NOT NULL,
    IsActive     INTEGER NOT NULL DEFAULT 1,
    CreatedAt    TEXT    NOT NULL DEFAULT (datetime('now')),
    UpdatedAt    TEXT    NOT NULL DEFAULT (datetime('now'))
);
"#;

pub const TAGS_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS Tags (
    Id            INTEGER PRIMARY KEY AUTOINCREMENT,
    MachineId     INTEGER NOT NULL REFERENCES Machines(Id),
    Name          TEXT    NOT NULL,
    NodeId        TEXT    NOT NULL UNIQUE,
    DataType      TEXT    NOT NULL,
    Unit          TEXT,
    MinValue      REAL,
    MaxValue      REAL,
    AllowedValues TEXT,
    IsActive      INTEGER NOT NULL DEFAULT 1,
    UNIQUE (MachineId, Name)
);
CREATE INDEX IF NOT EXISTS IX_Tags_NodeId ON Tags (NodeId);
"#;

pub const TAG_VALUES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS TagValues (
    Id                INTEGER PRIMARY KEY AUTOINCREMENT,
    MachineId         INTEGER NOT NULL,
    TagId             INTEGER NOT NULL,
    TagName           TEXT    NOT NULL,
    NodeId            TEXT    NOT NULL,
    Value             TEXT    NOT NULL,
    Quality           INTEGER NOT NULL,
    SourceTimestamp   TEXT    NOT NULL,
    ServerTimestamp   TEXT    NOT NULL,
    ReceivedTimestamp TEXT    NOT NULL
);
CREATE INDEX IF NOT EXISTS IX_TagValues_ReceivedTimestamp
    ON TagValues (ReceivedTimestamp);
"#;

/// Bulk insert entry point: a view with an INSTEAD OF trigger so a single
/// multi-row INSERT lands every row in `TagValues`.
pub const TAG_VALUES_BULK_DDL: &str = r#"
CREATE VIEW IF NOT EXISTS TagValuesBulk AS
    SELECT MachineId, TagId, TagName, NodeId, Value, Quality,
           SourceTimestamp, ServerTimestamp, ReceivedTimestamp
    FROM TagValues;
CREATE TRIGGER IF NOT EXISTS TR_TagValuesBulk_Insert
    INSTEAD OF INSERT ON TagValuesBulk
BEGIN
    INSERT INTO TagValues (
        MachineId, TagId, TagName, NodeId, Value, Quality,
        SourceTimestamp, ServerTimestamp, ReceivedTimestamp
    ) VALUES (
        NEW.MachineId, NEW.TagId, NEW.TagName, NEW.NodeId, NEW.Value,
        NEW.Quality, NEW.SourceTimestamp, NEW.ServerTimestamp,
        NEW.ReceivedTimestamp
    );
END;
"#;

/// Initialize the full schema, including the bulk entry point.
pub async fn init_schema(pool: &SqlitePool) -> Result<(), StoreError> {
    init_schema_without_bulk(pool).await?;
    sqlx::raw_sql(TAG_VALUES_BULK_DDL).execute(pool).await?;
    tracing::info!("Database schema initialized");
    Ok(())
}

/// Initialize tables and indexes only, leaving the bulk entry point
/// undeployed. Matches stores where the bulk routine is absent.
pub async fn init_schema_without_bulk(pool: &SqlitePool) -> Result<(), StoreError> {
    sqlx::raw_sql(MACHINES_TABLE_DDL).execute(pool).await?;
    sqlx::raw_sql(TAGS_TABLE_DDL).execute(pool).await?;
    sqlx::raw_sql(TAG_VALUES_TABLE_DDL).execute(pool).await?;
    Ok(())
}
