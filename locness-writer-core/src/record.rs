//! Record model shared by the fetcher, the batch writer and the store adapters.
//!
//! A store hands back [`RawRecord`]s: plain field maps with scalar values. The
//! fetcher turns each into a [`Record`] by parsing the configured timestamp
//! field and deriving a [`RecordId`] from the configured key fields. Records
//! are never mutated after that.

use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::fmt;

/// Scalar value of a single record field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FieldValue {
    Null,
    Bool(bool),
    /// Decimal number kept as the exact text delivered by the store.
    Number(String),
    Text(String),
}

impl FieldValue {
    pub fn text(s: impl Into<String>) -> Self {
        FieldValue::Text(s.into())
    }

    pub fn number(n: impl ToString) -> Self {
        FieldValue::Number(n.to_string())
    }

    /// Rendering used in CSV cells and record identities. `Null` renders empty.
    pub fn as_cell(&self) -> String {
        match self {
            FieldValue::Null => String::new(),
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Number(n) => n.clone(),
            FieldValue::Text(s) => s.clone(),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_cell())
    }
}

/// Field map exactly as returned by a store page.
pub type RawRecord = BTreeMap<String, FieldValue>;

/// Identity of a record within a bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(String);

impl RecordId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// How raw store items become records.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSchema {
    /// Name of the UTC timestamp field every record carries.
    pub timestamp_field: String,
    /// Fields forming the record identity. Empty means "all fields".
    pub key_fields: Vec<String>,
}

impl Default for RecordSchema {
    fn default() -> Self {
        Self {
            timestamp_field: "datetime_utc".to_string(),
            key_fields: Vec::new(),
        }
    }
}

/// Why a raw item could not become a record.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RecordError {
    #[error("timestamp field '{0}' is missing")]
    MissingTimestamp(String),
    #[error("timestamp field '{field}' has unparseable value '{value}'")]
    BadTimestamp { field: String, value: String },
}

/// An immutable record with its parsed timestamp and identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    timestamp: DateTime<Utc>,
    id: RecordId,
    fields: RawRecord,
}

impl Record {
    pub fn from_raw(fields: RawRecord, schema: &RecordSchema) -> Result<Self, RecordError> {
        let raw_ts = fields
            .get(&schema.timestamp_field)
            .ok_or_else(|| RecordError::MissingTimestamp(schema.timestamp_field.clone()))?;
        let timestamp = parse_timestamp(raw_ts).ok_or_else(|| RecordError::BadTimestamp {
            field: schema.timestamp_field.clone(),
            value: raw_ts.as_cell(),
        })?;
        let id = record_id(&fields, &schema.key_fields);
        Ok(Self {
            timestamp,
            id,
            fields,
        })
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn id(&self) -> &RecordId {
        &self.id
    }

    pub fn fields(&self) -> &RawRecord {
        &self.fields
    }

    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }
}

fn record_id(fields: &RawRecord, key_fields: &[String]) -> RecordId {
    // Unit separator keeps "a|b" + "c" distinct from "a" + "b|c".
    let joined = if key_fields.is_empty() {
        fields
            .iter()
            .map(|(k, v)| format!("{k}={}", v.as_cell()))
            .collect::<Vec<_>>()
            .join("\u{1f}")
    } else {
        key_fields
            .iter()
            .map(|k| fields.get(k).map(FieldValue::as_cell).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("\u{1f}")
    };
    RecordId(joined)
}

/// Parses the timestamp forms the store is known to hold.
///
/// Text values accept RFC 3339 and naive `T`/space separated date-times
/// (read as UTC). Numbers are epoch seconds, fractional part allowed.
pub fn parse_timestamp(value: &FieldValue) -> Option<DateTime<Utc>> {
    match value {
        FieldValue::Text(s) => parse_timestamp_str(s.trim()),
        FieldValue::Number(n) => parse_epoch(n),
        FieldValue::Null | FieldValue::Bool(_) => None,
    }
}

fn parse_timestamp_str(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

fn parse_epoch(n: &str) -> Option<DateTime<Utc>> {
    let secs: f64 = n.parse().ok()?;
    if !secs.is_finite() {
        return None;
    }
    let whole = secs.floor();
    let nanos = ((secs - whole) * 1e9).round() as u32;
    DateTime::from_timestamp(whole as i64, nanos.min(999_999_999))
}
