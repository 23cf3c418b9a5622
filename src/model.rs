//! Core domain types shared across the acquisition pipeline.
//!
//! - [`Machine`] / [`Tag`]: metadata records handed out by the repository
//! - [`LogicalType`]: declared tag data type, parsed from its string form
//! - [`Value`]: tagged variant carried by every sample
//! - [`OpcQuality`]: quality category derived from the raw status word
//! - [`Sample`]: one value observation flowing from subscription to storage
//! - [`StoredBatch`]: on-disk spool unit

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

// =============================================================================
// Metadata records
// =============================================================================

/// A programmable controller reachable over OPC UA.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Machine {
    /// Database ID.
    pub id: i32,
    /// Unique machine name.
    pub name: String,
    /// `opc.tcp://...` endpoint URI.
    pub opc_endpoint: String,
    /// Controller family (e.g. "S7-1500", "M340").
    pub automate_type: String,
    /// Inactive machines are never subscribed.
    pub is_active: bool,
    /// Tags owned by this machine.
    pub tags: Vec<Tag>,
}

impl Machine {
    /// Tags that are currently active on this machine.
    pub fn active_tags(&self) -> impl Iterator<Item = &Tag> {
        self.tags.iter().filter(|t| t.is_active)
    }
}

/// A monitored variable on a machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    /// Database ID.
    pub id: i32,
    /// Owning machine ID.
    pub machine_id: i32,
    /// Tag name, unique per machine.
    pub name: String,
    /// Namespace-qualified node address, unique across the fleet,
    /// e.g. `ns=2;s=Press01.Temperature`.
    pub node_id: String,
    /// Declared logical data type in string form.
    pub data_type: String,
    /// Engineering unit, if any.
    pub unit: Option<String>,
    /// Inclusive lower bound for numeric values.
    pub min_value: Option<f64>,
    /// Inclusive upper bound for numeric values.
    pub max_value: Option<f64>,
    /// Comma-separated list of permissible string forms.
    /// Mutually exclusive with the min/max bounds by data shape.
    pub allowed_values: Option<String>,
    /// Inactive tags are rejected at validation.
    pub is_active: bool,
}

impl Tag {
    /// Parse the declared data type; unrecognized strings map to `Unknown`.
    pub fn logical_type(&self) -> LogicalType {
        LogicalType::from_str(&self.data_type).unwrap_or(LogicalType::Unknown)
    }

    /// Parse `allowed_values` into trimmed, non-empty entries.
    pub fn allowed_values_list(&self) -> Option<Vec<&str>> {
        let raw = self.allowed_values.as_deref()?;
        let entries: Vec<&str> = raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if entries.is_empty() { None } else { Some(entries) }
    }
}

// =============================================================================
// Logical types
// =============================================================================

/// Declared logical type of a tag.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumString, Display, AsRefStr,
)]
#[strum(ascii_case_insensitive)]
pub enum LogicalType {
    Int16,
    Int32,
    Int64,
    UInt16,
    UInt32,
    UInt64,
    Float,
    Double,
    Boolean,
    String,
    /// Unrecognized declared type; the type check accepts anything.
    Unknown,
}

// =============================================================================
// Values
// =============================================================================

/// Tagged value variant carried by a sample.
///
/// Self-describing in its serialized form so spool files survive schema
/// drift, and total for type checking (no untyped container).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum Value {
    Int64(i64),
    UInt64(u64),
    Float64(f64),
    Bool(bool),
    Text(String),
    Raw(Vec<u8>),
}

impl Value {
    /// Short runtime type name used in rejection messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int64(_) => "int64",
            Value::UInt64(_) => "uint64",
            Value::Float64(_) => "float64",
            Value::Bool(_) => "bool",
            Value::Text(_) => "text",
            Value::Raw(_) => "raw",
        }
    }

    /// Canonical string rendering, used for enumerated-value comparison and
    /// for the relational `Value` column.
    pub fn render(&self) -> String {
        match self {
            Value::Int64(v) => v.to_string(),
            Value::UInt64(v) => v.to_string(),
            Value::Float64(v) => v.to_string(),
            Value::Bool(v) => v.to_string(),
            Value::Text(v) => v.clone(),
            Value::Raw(bytes) => bytes.iter().map(|b| format!("{b:02x}")).collect(),
        }
    }

    /// Numeric view for range checks; `None` for non-numeric variants.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int64(v) => Some(*v as f64),
            Value::UInt64(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

// =============================================================================
// Quality
// =============================================================================

/// OPC UA quality derived from a raw 32-bit status word.
///
/// The category lives in the top two bits (31..30): `00` Good,
/// `01` Uncertain, `10`/`11` Bad. Equality and hashing are over the raw
/// word, so two Bad samples with different status codes compare unequal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OpcQuality(pub u32);

impl OpcQuality {
    /// The all-clear status word.
    pub const GOOD: OpcQuality = OpcQuality(0);

    /// Raw status word.
    pub fn word(self) -> u32 {
        self.0
    }

    pub fn is_good(self) -> bool {
        self.0 >> 30 == 0
    }

    pub fn is_uncertain(self) -> bool {
        self.0 >> 30 == 1
    }

    pub fn is_bad(self) -> bool {
        self.0 >> 30 >= 2
    }

    /// Category label used for logs and the relational `Quality` rendering.
    pub fn category(self) -> &'static str {
        match self.0 >> 30 {
            0 => "Good",
            1 => "Uncertain",
            _ => "Bad",
        }
    }
}

impl std::fmt::Display for OpcQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (0x{:08x})", self.category(), self.0)
    }
}

// =============================================================================
// Samples
// =============================================================================

/// One value observation.
///
/// Created by the subscription callback with zeroed metadata ids, enriched
/// by the ingestion pipeline, consumed by the batch sink, discarded after
/// persistence or spooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sample {
    pub machine_id: i32,
    pub tag_id: i32,
    pub tag_name: String,
    pub node_id: String,
    pub value: Value,
    pub quality: OpcQuality,
    /// Timestamp assigned by the data source (the controller).
    pub source_timestamp: DateTime<Utc>,
    /// Timestamp assigned by the OPC server.
    pub server_timestamp: DateTime<Utc>,
    /// Timestamp assigned on reception by this worker.
    pub received_timestamp: DateTime<Utc>,
}

impl Sample {
    /// Create an unenriched sample as produced by a value-change callback.
    pub fn new(
        node_id: impl Into<String>,
        value: Value,
        quality: OpcQuality,
        source_timestamp: DateTime<Utc>,
        server_timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            machine_id: 0,
            tag_id: 0,
            tag_name: String::new(),
            node_id: node_id.into(),
            value,
            quality,
            source_timestamp,
            server_timestamp,
            received_timestamp: Utc::now(),
        }
    }

    /// Fill in metadata resolved from the tag cache.
    pub fn enrich(&mut self, tag: &Tag) {
        self.machine_id = tag.machine_id;
        self.tag_id = tag.id;
        self.tag_name = tag.name.clone();
    }
}

// =============================================================================
// Spool batches
// =============================================================================

/// One spooled batch, persisted as a single immutable JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredBatch {
    /// 128-bit hex identifier.
    pub batch_id: String,
    /// Creation time; also encoded into the filename so lexicographic
    /// order equals chronological order.
    pub timestamp: DateTime<Utc>,
    pub tag_values: Vec<Sample>,
}
