//! Watches an append-only sample log and forwards every new record to a remote sink.
//!
//! Records are read past a persisted watermark, delivered with bounded retry, and the watermark
//! only advances once the sink confirmed them.

pub mod checkpoint;
pub mod config;
pub mod error;
pub mod metrics;
pub mod parser;
pub mod pipeline;
pub mod runner;
pub mod sink;
pub mod tracker;
pub mod watcher;
