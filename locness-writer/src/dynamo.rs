//! DynamoDB record store.
//!
//! Scan pages go out unfiltered; the fetcher applies the time window itself.
//! Range queries need a partition key value plus the timestamp as sort key (on
//! the table or on a secondary index). When that is not configured, or DynamoDB
//! rejects the key condition, the query reports [`StoreError::IndexUnavailable`]
//! and the fetcher falls back to scanning.

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_dynamodb::config::http::HttpResponse;
use aws_sdk_dynamodb::config::timeout::TimeoutConfig;
use aws_sdk_dynamodb::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_dynamodb::types::AttributeValue;
use aws_sdk_dynamodb::Client;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::time::Instant;
use tracing::{debug, info};

use locness_writer_core::config::{QueryConfig, StoreConfig};
use locness_writer_core::contract::{Page, PageToken, RecordStore, StoreError, TimeRange};
use locness_writer_core::record::{FieldValue, RawRecord};

/// Service error codes worth retrying.
const TRANSIENT_CODES: &[&str] = &[
    "ProvisionedThroughputExceededException",
    "ThrottlingException",
    "RequestLimitExceeded",
    "InternalServerError",
    "ServiceUnavailable",
];

pub struct DynamoStore {
    client: Client,
    table: String,
    timestamp_field: String,
    timestamp_format: String,
    query: Option<QueryConfig>,
}

/// Builds a DynamoDB client from the standard AWS provider chain, honouring the
/// configured region, endpoint and operation timeout.
pub async fn client_for(config: &StoreConfig) -> Client {
    let mut loader = aws_config::defaults(BehaviorVersion::latest());
    if let Some(region) = &config.region {
        loader = loader.region(Region::new(region.clone()));
    }
    if let Some(endpoint) = &config.endpoint_url {
        loader = loader.endpoint_url(endpoint);
    }
    let sdk_config = loader.load().await;
    let timeouts = TimeoutConfig::builder()
        .operation_timeout(std::time::Duration::from_secs(config.timeout_secs))
        .build();
    let dynamo_config = aws_sdk_dynamodb::config::Builder::from(&sdk_config)
        .timeout_config(timeouts)
        .build();
    Client::from_conf(dynamo_config)
}

impl DynamoStore {
    pub fn new(client: Client, config: &StoreConfig) -> Self {
        info!(
            table = %config.table_name,
            indexed = config.query.is_some(),
            index = config.query.as_ref().and_then(|q| q.index_name.as_deref()).unwrap_or("table"),
            "Initialised DynamoDB store"
        );
        Self {
            client,
            table: config.table_name.clone(),
            timestamp_field: config.timestamp_field.clone(),
            timestamp_format: config.timestamp_format.clone(),
            query: config.query.clone(),
        }
    }

    pub async fn connect(config: &StoreConfig) -> Self {
        Self::new(client_for(config).await, config)
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn table(&self) -> &str {
        &self.table
    }
}

/// Query bounds rendered for the store, widened by one second on each side so
/// that truncating formats never cut records off. The fetcher filters exactly.
pub fn query_bounds(range: &TimeRange, format: &str) -> (String, String) {
    let render = |ts: DateTime<Utc>| ts.format(format).to_string();
    (
        render(range.after - Duration::seconds(1)),
        render(range.until + Duration::seconds(1)),
    )
}

pub fn to_field_value(value: &AttributeValue) -> FieldValue {
    match value {
        AttributeValue::S(s) => FieldValue::Text(s.clone()),
        AttributeValue::N(n) => FieldValue::Number(n.clone()),
        AttributeValue::Bool(b) => FieldValue::Bool(*b),
        AttributeValue::Null(_) => FieldValue::Null,
        other => FieldValue::Text(to_json(other).to_string()),
    }
}

/// Nested and set values flatten to JSON text in a single cell.
fn to_json(value: &AttributeValue) -> serde_json::Value {
    use serde_json::Value;
    match value {
        AttributeValue::S(s) => Value::String(s.clone()),
        AttributeValue::N(n) => n
            .parse::<serde_json::Number>()
            .map(Value::Number)
            .unwrap_or_else(|_| Value::String(n.clone())),
        AttributeValue::Bool(b) => Value::Bool(*b),
        AttributeValue::Null(_) => Value::Null,
        AttributeValue::Ss(v) => Value::from(v.clone()),
        AttributeValue::Ns(v) => Value::from(v.clone()),
        AttributeValue::L(items) => Value::Array(items.iter().map(to_json).collect()),
        AttributeValue::M(map) => {
            // Sorted for stable output.
            let sorted: std::collections::BTreeMap<_, _> =
                map.iter().map(|(k, v)| (k.clone(), to_json(v))).collect();
            Value::Object(sorted.into_iter().collect())
        }
        AttributeValue::B(blob) => Value::String(format!("<{} bytes>", blob.as_ref().len())),
        AttributeValue::Bs(blobs) => Value::String(format!("<{} binary values>", blobs.len())),
        _ => Value::Null,
    }
}

pub fn to_attribute_value(value: &FieldValue) -> AttributeValue {
    match value {
        FieldValue::Text(s) => AttributeValue::S(s.clone()),
        FieldValue::Number(n) => AttributeValue::N(n.clone()),
        FieldValue::Bool(b) => AttributeValue::Bool(*b),
        FieldValue::Null => AttributeValue::Null(true),
    }
}

pub fn to_raw_record(item: &HashMap<String, AttributeValue>) -> RawRecord {
    item.iter()
        .map(|(k, v)| (k.clone(), to_field_value(v)))
        .collect()
}

fn to_page_token(key: &HashMap<String, AttributeValue>) -> PageToken {
    PageToken(to_raw_record(key))
}

fn to_start_key(token: PageToken) -> HashMap<String, AttributeValue> {
    token
        .0
        .iter()
        .map(|(k, v)| (k.clone(), to_attribute_value(v)))
        .collect()
}

/// Classifies a DynamoDB service error by its code and HTTP status.
pub fn classify_service_error(
    operation: &'static str,
    code: Option<&str>,
    status: u16,
    message: String,
) -> StoreError {
    let code = code.unwrap_or_default();
    if TRANSIENT_CODES.contains(&code) || status >= 500 {
        return StoreError::Transient { operation, message };
    }
    if operation == "query" && matches!(code, "ValidationException" | "ResourceNotFoundException") {
        return StoreError::IndexUnavailable(message);
    }
    StoreError::Other { operation, message }
}

fn classify<E>(operation: &'static str, err: SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("{}", DisplayErrorContext(&err));
    match &err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            StoreError::Transient { operation, message }
        }
        SdkError::ResponseError(_) => StoreError::Malformed { operation, message },
        SdkError::ServiceError(ctx) => classify_service_error(
            operation,
            ctx.err().code(),
            ctx.raw().status().as_u16(),
            message,
        ),
        _ => StoreError::Other { operation, message },
    }
}

#[async_trait]
impl RecordStore for DynamoStore {
    async fn query_page(
        &self,
        range: &TimeRange,
        start: Option<PageToken>,
        limit: usize,
    ) -> Result<Page, StoreError> {
        let Some(query) = &self.query else {
            return Err(StoreError::IndexUnavailable(
                "no partition key configured for range queries".to_string(),
            ));
        };
        let (lower, upper) = query_bounds(range, &self.timestamp_format);
        let started = Instant::now();
        let output = self
            .client
            .query()
            .table_name(&self.table)
            .set_index_name(query.index_name.clone())
            .key_condition_expression("#pk = :pk AND #ts BETWEEN :lower AND :upper")
            .expression_attribute_names("#pk", &query.partition_key)
            .expression_attribute_names("#ts", &self.timestamp_field)
            .expression_attribute_values(":pk", AttributeValue::S(query.partition_value.clone()))
            .expression_attribute_values(":lower", AttributeValue::S(lower))
            .expression_attribute_values(":upper", AttributeValue::S(upper))
            .limit(limit.min(i32::MAX as usize) as i32)
            .set_exclusive_start_key(start.map(to_start_key))
            .send()
            .await
            .map_err(|e| classify("query", e))?;

        let items: Vec<RawRecord> = output.items().iter().map(to_raw_record).collect();
        debug!(
            items = items.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[FETCH] DynamoDB query page"
        );
        Ok(Page {
            items,
            next: output.last_evaluated_key().map(to_page_token),
        })
    }

    async fn scan_page(&self, start: Option<PageToken>, limit: usize) -> Result<Page, StoreError> {
        let started = Instant::now();
        let output = self
            .client
            .scan()
            .table_name(&self.table)
            .limit(limit.min(i32::MAX as usize) as i32)
            .set_exclusive_start_key(start.map(to_start_key))
            .send()
            .await
            .map_err(|e| classify("scan", e))?;

        let items: Vec<RawRecord> = output.items().iter().map(to_raw_record).collect();
        debug!(
            items = items.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "[FETCH] DynamoDB scan page"
        );
        Ok(Page {
            items,
            next: output.last_evaluated_key().map(to_page_token),
        })
    }
}
