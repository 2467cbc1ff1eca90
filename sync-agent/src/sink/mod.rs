//! Remote destinations for delivered records.
//!
//! Every sink speaks JSON arrays: a spreadsheet row or an element of a document's `full_data`
//! array. [`DeliveryClient::encode`] and [`DeliveryClient::decode`] convert between a
//! [`Record`] and that native shape.

pub mod document_store;
pub mod spreadsheet;

use crate::error::SinkError;
use crate::parser::Record;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

pub use document_store::DocumentStoreSink;
pub use spreadsheet::SpreadsheetSink;

const ERROR_BODY_LIMIT: usize = 512;

/// A record in the sink's native shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteEntry(pub Vec<Value>);

/// Contents of the remote destination at the time of a fetch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RemoteSnapshot {
    pub entries: Vec<RemoteEntry>,
}

impl RemoteSnapshot {
    /// Timestamps of every entry the client can decode; header rows and foreign data are ignored.
    pub fn timestamps(&self, client: &dyn DeliveryClient) -> HashSet<i64> {
        self.entries
            .iter()
            .filter_map(|entry| client.decode(entry).ok())
            .map(|record| record.timestamp_ms)
            .collect()
    }
}

#[async_trait]
pub trait DeliveryClient: Send + Sync {
    fn name(&self) -> &'static str;

    fn encode(&self, record: &Record) -> RemoteEntry;

    fn decode(&self, entry: &RemoteEntry) -> Result<Record, SinkError>;

    async fn fetch_state(&self) -> Result<RemoteSnapshot, SinkError>;

    /// Send `entries`. Entries may already exist remotely when a batch is replayed.
    async fn deliver(&self, entries: &[RemoteEntry]) -> Result<(), SinkError>;
}

/// Opaque authentication material handed to a sink.
#[derive(Clone, Default, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    #[default]
    None,
    Bearer {
        token: String,
    },
    Header {
        name: String,
        value: String,
    },
}

impl Credential {
    pub(crate) fn apply(&self, request: RequestBuilder) -> RequestBuilder {
        match self {
            Credential::None => request,
            Credential::Bearer { token } => request.bearer_auth(token),
            Credential::Header { name, value } => request.header(name.as_str(), value.as_str()),
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::None => f.write_str("None"),
            Credential::Bearer { .. } => f.write_str("Bearer(<redacted>)"),
            Credential::Header { name, .. } => write!(f, "Header({name}: <redacted>)"),
        }
    }
}

pub(crate) fn build_http_client(timeout: Duration) -> Result<Client> {
    Client::builder()
        .timeout(timeout)
        .build()
        .context("failed to build HTTP client")
}

/// Send `request`, mapping non-2xx responses to [`SinkError::Status`].
pub(crate) async fn execute(request: RequestBuilder) -> Result<Response, SinkError> {
    let response = request.send().await?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let mut body = response
        .text()
        .await
        .unwrap_or_else(|err| format!("<unreadable body: {err}>"));
    if body.len() > ERROR_BODY_LIMIT {
        let mut cut = ERROR_BODY_LIMIT;
        while !body.is_char_boundary(cut) {
            cut -= 1;
        }
        body.truncate(cut);
    }
    Err(SinkError::Status {
        status: status.as_u16(),
        body,
    })
}

pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|v| v.is_finite())
}

pub(crate) fn decode_values(entry: &RemoteEntry) -> Result<[f64; 7], SinkError> {
    let mut values = [0.0; 7];
    for (index, slot) in values.iter_mut().enumerate() {
        *slot = entry
            .0
            .get(index)
            .and_then(value_as_f64)
            .ok_or_else(|| SinkError::Decode(format!("entry value {index} is not numeric")))?;
    }
    Ok(values)
}
