use super::{
    build_http_client, decode_values, execute, Credential, DeliveryClient, RemoteEntry,
    RemoteSnapshot,
};
use crate::error::SinkError;
use crate::parser::Record;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::debug;

/// Timestamp column format; millisecond precision keeps rows reversible.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Appends rows to a spreadsheet through the values API.
///
/// `endpoint` is the spreadsheet resource (e.g. `https://sheets.googleapis.com/v4/spreadsheets/<id>`)
/// and `range` the target sheet or A1 range. All rows of a drain cycle go out in one append call.
/// The sheet has no natural key, so duplicate suppression stays with the tracker.
#[derive(Debug, Clone)]
pub struct SpreadsheetSink {
    client: Client,
    endpoint: Url,
    range: String,
    credential: Credential,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<Value>>,
}

impl SpreadsheetSink {
    pub fn new(
        endpoint: &str,
        range: impl Into<String>,
        credential: Credential,
        timeout: Duration,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid spreadsheet endpoint {endpoint}"))?;
        if endpoint.cannot_be_a_base() {
            anyhow::bail!("spreadsheet endpoint {endpoint} cannot be used as a base URL");
        }
        Ok(Self {
            client: build_http_client(timeout)?,
            endpoint,
            range: range.into(),
            credential,
        })
    }

    fn values_url(&self, last_segment: &str) -> Url {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push("values").push(last_segment);
        }
        url
    }
}

#[async_trait]
impl DeliveryClient for SpreadsheetSink {
    fn name(&self) -> &'static str {
        "spreadsheet"
    }

    fn encode(&self, record: &Record) -> RemoteEntry {
        let mut row: Vec<Value> = record.values.iter().map(|v| json!(v)).collect();
        let rendered = DateTime::<Utc>::from_timestamp_millis(record.timestamp_ms)
            .map(|ts| ts.format(TIMESTAMP_FORMAT).to_string())
            .unwrap_or_else(|| record.timestamp_ms.to_string());
        row.push(Value::String(rendered));
        RemoteEntry(row)
    }

    fn decode(&self, entry: &RemoteEntry) -> Result<Record, SinkError> {
        if entry.0.len() != 8 {
            return Err(SinkError::Decode(format!(
                "spreadsheet row has {} cells, expected 8",
                entry.0.len()
            )));
        }
        let values = decode_values(entry)?;
        let timestamp_ms = match &entry.0[7] {
            Value::String(text) => NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
                .map(|ts| ts.and_utc().timestamp_millis())
                .map_err(|err| SinkError::Decode(format!("bad timestamp cell {text:?}: {err}")))?,
            Value::Number(n) => n
                .as_i64()
                .ok_or_else(|| SinkError::Decode(format!("bad timestamp cell {n}")))?,
            other => {
                return Err(SinkError::Decode(format!("bad timestamp cell {other}")));
            }
        };
        Ok(Record::new(values, 0, timestamp_ms))
    }

    async fn fetch_state(&self) -> Result<RemoteSnapshot, SinkError> {
        let mut url = self.values_url(&self.range);
        url.query_pairs_mut()
            .append_pair("valueRenderOption", "UNFORMATTED_VALUE");

        let response = execute(self.credential.apply(self.client.get(url))).await?;
        let body: ValueRange = response
            .json()
            .await
            .map_err(|err| SinkError::Decode(err.to_string()))?;

        Ok(RemoteSnapshot {
            entries: body.values.into_iter().map(RemoteEntry).collect(),
        })
    }

    async fn deliver(&self, entries: &[RemoteEntry]) -> Result<(), SinkError> {
        if entries.is_empty() {
            return Ok(());
        }

        let mut url = self.values_url(&format!("{}:append", self.range));
        url.query_pairs_mut()
            .append_pair("valueInputOption", "RAW")
            .append_pair("insertDataOption", "INSERT_ROWS");

        let body = json!({ "values": entries });
        execute(self.credential.apply(self.client.post(url).json(&body))).await?;

        debug!(
            range = %self.range,
            row_count = entries.len(),
            "appended rows to spreadsheet"
        );
        Ok(())
    }
}
