//! Application runner for the sync agent.
//!
//! Wires the checkpoint store, tracker, watcher and pipeline together and owns shutdown.

pub mod file_mode;

use crate::config::{SinkKind, SinkSettings};
use crate::sink::{DeliveryClient, DocumentStoreSink, SpreadsheetSink};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Build the delivery client selected by configuration.
pub fn build_delivery_client(settings: &SinkSettings) -> Result<Arc<dyn DeliveryClient>> {
    match settings.kind {
        SinkKind::Spreadsheet => {
            let range = settings
                .range
                .as_deref()
                .map(str::trim)
                .filter(|range| !range.is_empty())
                .context("spreadsheet sink requires a range")?;
            let sink = SpreadsheetSink::new(
                &settings.endpoint,
                range,
                settings.credential.clone(),
                settings.timeout,
            )
            .context("failed to configure spreadsheet sink")?;

            info!(
                endpoint = %settings.endpoint,
                range,
                timeout_ms = settings.timeout.as_millis() as u64,
                "configured spreadsheet sink"
            );
            Ok(Arc::new(sink))
        }
        SinkKind::DocumentStore => {
            let sink = DocumentStoreSink::new(
                &settings.endpoint,
                settings.credential.clone(),
                settings.timeout,
            )
            .context("failed to configure document store sink")?;

            info!(
                endpoint = %settings.endpoint,
                timeout_ms = settings.timeout.as_millis() as u64,
                "configured document store sink"
            );
            Ok(Arc::new(sink))
        }
    }
}
