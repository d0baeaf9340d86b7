//! `check-table`: inspects the DynamoDB key schema and reports whether the
//! indexed query path can be used.
//!
//! The ideal layout has the partition key `data` and the timestamp field as the
//! sort key. A global secondary index with the timestamp as sort key works too.

use anyhow::{Context, Result};
use aws_sdk_dynamodb::types::{KeySchemaElement, KeyType};
use aws_sdk_dynamodb::Client;
use serde::Serialize;
use tracing::info;

use locness_writer_core::config::QueryConfig;

pub const OPTIMAL_PARTITION_KEY: &str = "data";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct KeyPair {
    pub partition_key: Option<String>,
    pub sort_key: Option<String>,
}

impl KeyPair {
    fn from_elements(elements: &[KeySchemaElement]) -> Self {
        let mut keys = KeyPair::default();
        for element in elements {
            match element.key_type() {
                KeyType::Hash => keys.partition_key = Some(element.attribute_name().to_string()),
                KeyType::Range => keys.sort_key = Some(element.attribute_name().to_string()),
                _ => {}
            }
        }
        keys
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexLayout {
    pub name: String,
    pub keys: KeyPair,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TableLayout {
    pub table: String,
    pub status: Option<String>,
    pub item_count: Option<i64>,
    pub size_bytes: Option<i64>,
    pub keys: KeyPair,
    pub indexes: Vec<IndexLayout>,
}

/// How range queries would reach the data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QueryPath {
    Table { partition_key: String },
    Index { index_name: String, partition_key: String },
    ScanOnly,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SchemaAssessment {
    /// Table keys are exactly `data` + the timestamp field.
    pub optimal: bool,
    pub query_path: QueryPath,
    /// Whether the configured `store.query` lines up with `query_path`.
    pub configured_query_usable: bool,
    pub advice: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct SchemaReport {
    pub layout: TableLayout,
    pub assessment: SchemaAssessment,
}

pub fn assess(
    layout: &TableLayout,
    timestamp_field: &str,
    configured: Option<&QueryConfig>,
) -> SchemaAssessment {
    let sorts_by_time = |keys: &KeyPair| keys.sort_key.as_deref() == Some(timestamp_field);

    let optimal = layout.keys.partition_key.as_deref() == Some(OPTIMAL_PARTITION_KEY)
        && sorts_by_time(&layout.keys);

    let query_path = match (&layout.keys.partition_key, sorts_by_time(&layout.keys)) {
        (Some(pk), true) => QueryPath::Table {
            partition_key: pk.clone(),
        },
        _ => layout
            .indexes
            .iter()
            .find_map(|index| match &index.keys.partition_key {
                Some(pk) if sorts_by_time(&index.keys) => Some(QueryPath::Index {
                    index_name: index.name.clone(),
                    partition_key: pk.clone(),
                }),
                _ => None,
            })
            .unwrap_or(QueryPath::ScanOnly),
    };

    let configured_query_usable = match (configured, &query_path) {
        (Some(q), QueryPath::Table { partition_key }) => {
            q.index_name.is_none() && &q.partition_key == partition_key
        }
        (Some(q), QueryPath::Index {
            index_name,
            partition_key,
        }) => q.index_name.as_ref() == Some(index_name) && &q.partition_key == partition_key,
        _ => false,
    };

    let mut advice = Vec::new();
    match (&query_path, configured) {
        (QueryPath::ScanOnly, _) => {
            advice.push(format!(
                "No key sorts by '{timestamp_field}'; every fetch will scan the whole table."
            ));
            advice.push(format!(
                "Recommended: partition key '{OPTIMAL_PARTITION_KEY}' with sort key '{timestamp_field}'."
            ));
        }
        (_, None) => advice.push(
            "Range queries are possible but store.query is not configured; fetches will scan."
                .to_string(),
        ),
        (_, Some(_)) if !configured_query_usable => advice.push(
            "store.query does not match the table keys; fetches will fall back to scanning."
                .to_string(),
        ),
        _ => advice.push("Indexed range queries will be used.".to_string()),
    }

    SchemaAssessment {
        optimal,
        query_path,
        configured_query_usable,
        advice,
    }
}

pub async fn describe_table(client: &Client, table: &str) -> Result<TableLayout> {
    info!(table, "Describing DynamoDB table");
    let output = client
        .describe_table()
        .table_name(table)
        .send()
        .await
        .with_context(|| format!("Failed to describe table '{table}'"))?;
    let description = output
        .table()
        .with_context(|| format!("DescribeTable returned no description for '{table}'"))?;

    Ok(TableLayout {
        table: table.to_string(),
        status: description.table_status().map(|s| s.as_str().to_string()),
        item_count: description.item_count(),
        size_bytes: description.table_size_bytes(),
        keys: KeyPair::from_elements(description.key_schema()),
        indexes: description
            .global_secondary_indexes()
            .iter()
            .map(|gsi| IndexLayout {
                name: gsi.index_name().unwrap_or_default().to_string(),
                keys: KeyPair::from_elements(gsi.key_schema()),
            })
            .collect(),
    })
}
