use super::{
    build_http_client, decode_values, execute, Credential, DeliveryClient, RemoteEntry,
    RemoteSnapshot,
};
use crate::error::SinkError;
use crate::parser::Record;
use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Url};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Keeps records in the `full_data` array of a single JSON document.
///
/// The store has no server-side merge: `deliver` reads the whole array, appends what is missing
/// and writes it back. Entries are keyed by their timestamp, so replaying a batch is a no-op for
/// entries that already made it. Writes from this process are serialized through `write_lock`.
#[derive(Debug)]
pub struct DocumentStoreSink {
    client: Client,
    endpoint: Url,
    credential: Credential,
    write_lock: Mutex<()>,
}

impl DocumentStoreSink {
    pub fn new(endpoint: &str, credential: Credential, timeout: Duration) -> Result<Self> {
        let endpoint = Url::parse(endpoint)
            .with_context(|| format!("invalid document store endpoint {endpoint}"))?;
        Ok(Self {
            client: build_http_client(timeout)?,
            endpoint,
            credential,
            write_lock: Mutex::new(()),
        })
    }

    async fn fetch_full_data(&self) -> Result<Vec<Value>, SinkError> {
        let request = self
            .credential
            .apply(self.client.get(self.endpoint.clone()));
        let body: Value = execute(request)
            .await?
            .json()
            .await
            .map_err(|err| SinkError::Decode(err.to_string()))?;
        extract_full_data(body)
    }
}

/// Accepts both `{"full_data": [...]}` and the wrapped `{"record": {"full_data": [...]}}` shape.
fn extract_full_data(mut body: Value) -> Result<Vec<Value>, SinkError> {
    let document = if body.get("record").is_some() {
        body["record"].take()
    } else {
        body
    };
    match document.get("full_data") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(items)) => Ok(items.clone()),
        Some(other) => Err(SinkError::Decode(format!(
            "full_data is not an array: {other}"
        ))),
    }
}

fn entry_timestamp(items: &[Value]) -> Option<i64> {
    let stamp = items.get(7)?;
    stamp
        .as_i64()
        .or_else(|| stamp.as_f64().map(|ms| ms.round() as i64))
}

#[async_trait]
impl DeliveryClient for DocumentStoreSink {
    fn name(&self) -> &'static str {
        "document_store"
    }

    fn encode(&self, record: &Record) -> RemoteEntry {
        let mut entry: Vec<Value> = record.values.iter().map(|v| json!(v)).collect();
        entry.push(json!(record.timestamp_ms));
        RemoteEntry(entry)
    }

    fn decode(&self, entry: &RemoteEntry) -> Result<Record, SinkError> {
        if entry.0.len() != 8 {
            return Err(SinkError::Decode(format!(
                "document entry has {} elements, expected 8",
                entry.0.len()
            )));
        }
        let values = decode_values(entry)?;
        let timestamp_ms = entry_timestamp(&entry.0)
            .ok_or_else(|| SinkError::Decode("entry timestamp is not numeric".to_string()))?;
        Ok(Record::new(values, 0, timestamp_ms))
    }

    async fn fetch_state(&self) -> Result<RemoteSnapshot, SinkError> {
        let full_data = self.fetch_full_data().await?;
        let entries = full_data
            .into_iter()
            .filter_map(|item| match item {
                Value::Array(items) => Some(RemoteEntry(items)),
                _ => None,
            })
            .collect();
        Ok(RemoteSnapshot { entries })
    }

    async fn deliver(&self, entries: &[RemoteEntry]) -> Result<(), SinkError> {
        if entries.is_empty() {
            return Ok(());
        }

        let _guard = self.write_lock.lock().await;
        let mut full_data = self.fetch_full_data().await?;
        let mut present: HashSet<i64> = full_data
            .iter()
            .filter_map(|item| item.as_array().and_then(|items| entry_timestamp(items)))
            .collect();

        let before = full_data.len();
        for entry in entries {
            match entry_timestamp(&entry.0) {
                Some(stamp) if !present.insert(stamp) => {
                    debug!(timestamp_ms = stamp, "entry already in document; skipping");
                }
                _ => full_data.push(Value::Array(entry.0.clone())),
            }
        }

        let appended = full_data.len() - before;
        if appended == 0 {
            debug!("document already holds every entry; skipping write");
            return Ok(());
        }

        let body = json!({ "full_data": full_data });
        let request = self
            .credential
            .apply(self.client.put(self.endpoint.clone()).json(&body));
        execute(request).await?;

        debug!(
            appended,
            total = full_data.len(),
            "wrote document with appended entries"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::test_server;
    use std::sync::{Arc, Mutex as StdMutex};

    fn sink(endpoint: &str) -> DocumentStoreSink {
        DocumentStoreSink::new(
            endpoint,
            Credential::Header {
                name: "X-Master-Key".into(),
                value: "key-abc".into(),
            },
            Duration::from_secs(5),
        )
        .unwrap()
    }

    /// Fake bin: GET returns the wrapped document, PUT replaces `full_data`.
    async fn fake_bin(initial: Value) -> (String, test_server::Requests, Arc<StdMutex<Value>>) {
        let document = Arc::new(StdMutex::new(initial));
        let state = document.clone();
        let (base, requests) = test_server::spawn(move |request| {
            let mut doc = state.lock().unwrap();
            match request.method.as_str() {
                "GET" => (200, json!({ "record": doc.clone(), "metadata": {} })),
                "PUT" => {
                    *doc = request.body.clone();
                    (200, json!({ "record": doc.clone() }))
                }
                _ => (405, json!({})),
            }
        })
        .await;
        (format!("{base}/v3/b/bin-1"), requests, document)
    }

    #[test]
    fn entries_round_trip_through_encode() {
        let sink = sink("http://localhost/v3/b/bin-1");
        let record = Record::new([1.5, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0], 0, 1_738_700_000_123);
        let entry = sink.encode(&record);
        assert_eq!(entry.0[7], json!(1_738_700_000_123_i64));
        assert_eq!(sink.decode(&entry).unwrap(), record);
    }

    #[test]
    fn full_data_is_found_in_both_shapes() {
        let wrapped = json!({"record": {"full_data": [[1, 2, 3, 4, 5, 6, 7, 8]]}});
        let bare = json!({"full_data": [[1, 2, 3, 4, 5, 6, 7, 8]]});
        assert_eq!(extract_full_data(wrapped).unwrap().len(), 1);
        assert_eq!(extract_full_data(bare).unwrap().len(), 1);
        assert!(extract_full_data(json!({"record": {}})).unwrap().is_empty());
        assert!(extract_full_data(json!({"full_data": 3})).is_err());
    }

    #[tokio::test]
    async fn deliver_appends_to_existing_array() {
        let (endpoint, requests, document) =
            fake_bin(json!({"full_data": [[9, 9, 9, 9, 9, 9, 9, 500]]})).await;
        let sink = sink(&endpoint);

        let entry = sink.encode(&Record::new([1.0; 7], 1, 1_000));
        sink.deliver(&[entry]).await.unwrap();

        let doc = document.lock().unwrap().clone();
        let full_data = doc["full_data"].as_array().unwrap();
        assert_eq!(full_data.len(), 2);
        assert_eq!(full_data[1][7], json!(1_000));

        let requests = requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[1].method, "PUT");
        assert_eq!(requests[1].headers["x-master-key"], "key-abc");
    }

    #[tokio::test]
    async fn replayed_entries_are_not_duplicated() {
        let (endpoint, requests, document) = fake_bin(json!({"full_data": []})).await;
        let sink = sink(&endpoint);
        let entries = vec![
            sink.encode(&Record::new([1.0; 7], 1, 1_000)),
            sink.encode(&Record::new([2.0; 7], 2, 1_001)),
        ];

        sink.deliver(&entries).await.unwrap();
        sink.deliver(&entries).await.unwrap();

        let doc = document.lock().unwrap().clone();
        assert_eq!(doc["full_data"].as_array().unwrap().len(), 2);
        // second delivery only reads
        let methods: Vec<String> = requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.method.clone())
            .collect();
        assert_eq!(methods, vec!["GET", "PUT", "GET"]);
    }

    #[tokio::test]
    async fn fetch_state_lists_entries() {
        let (endpoint, _requests, _document) =
            fake_bin(json!({"full_data": [[1, 2, 3, 4, 5, 6, 7, 42], "junk"]})).await;
        let sink = sink(&endpoint);

        let snapshot = sink.fetch_state().await.unwrap();
        assert_eq!(snapshot.entries.len(), 1);
        assert!(snapshot.timestamps(&sink).contains(&42));
    }
}
