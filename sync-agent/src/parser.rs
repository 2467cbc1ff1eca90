//! Record parsing for the sample log.
//!
//! A log line holds exactly seven comma-separated decimal numbers. The tracker feeds raw
//! file chunks into a [`LineChunker`], which hands back complete lines and keeps any
//! partially written trailing line as backlog, and then validates every line with
//! [`parse_values`].

use crate::error::ParseError;

/// Number of numeric values carried by every record.
pub const RECORD_WIDTH: usize = 7;

pub type RecordValues = [f64; RECORD_WIDTH];

/// A validated log line plus the timestamp assigned when it was detected.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub values: RecordValues,
    pub timestamp_ms: i64,
    /// 1-based line number within the log.
    pub line_no: u64,
}

impl Record {
    pub fn new(values: RecordValues, line_no: u64, timestamp_ms: i64) -> Self {
        Self {
            values,
            timestamp_ms,
            line_no,
        }
    }
}

/// Validates one log line.
///
/// Returns `Ok(None)` for blank lines, which are skipped without being an error.
pub fn parse_values(line: &str) -> Result<Option<RecordValues>, ParseError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }

    let tokens: Vec<&str> = line.split(',').map(str::trim).collect();
    if tokens.len() != RECORD_WIDTH {
        return Err(ParseError::MalformedRecord {
            tokens: tokens.len(),
        });
    }

    let mut values = [0.0; RECORD_WIDTH];
    for (index, token) in tokens.iter().enumerate() {
        let value = token
            .parse::<f64>()
            .ok()
            .filter(|v| v.is_finite())
            .ok_or_else(|| ParseError::NonNumericToken {
                index,
                token: (*token).to_string(),
            })?;
        values[index] = value;
    }

    Ok(Some(values))
}

/// Validates `line` and attaches its position and detection timestamp.
pub fn parse_line(line: &str, line_no: u64, timestamp_ms: i64) -> Result<Option<Record>, ParseError> {
    Ok(parse_values(line)?.map(|values| Record::new(values, line_no, timestamp_ms)))
}

/// Same as [`parse_values`] but for raw bytes read from disk.
pub fn parse_line_bytes(line: &[u8]) -> Result<Option<RecordValues>, ParseError> {
    let text = std::str::from_utf8(line).map_err(|_| ParseError::InvalidUtf8)?;
    parse_values(text)
}

/// Splits incoming bytes into complete `\n`-terminated lines.
///
/// Bytes after the last newline stay buffered; `backlog_len` reports them so the caller can
/// keep its watermark on a line boundary.
#[derive(Debug, Default)]
pub struct LineChunker {
    buffer: Vec<u8>,
}

impl LineChunker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and drain every line it completes.
    ///
    /// Lines are returned without the `\n` terminator, so each one accounts for
    /// `line.len() + 1` bytes of the file.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.buffer.extend_from_slice(data);
        drain_complete_lines(&mut self.buffer)
    }

    pub fn backlog_len(&self) -> usize {
        self.buffer.len()
    }
}

fn drain_complete_lines(buffer: &mut Vec<u8>) -> Vec<Vec<u8>> {
    let mut lines = Vec::new();
    let mut start = 0usize;

    for (idx, byte) in buffer.iter().enumerate() {
        if *byte == b'\n' {
            lines.push(buffer[start..idx].to_vec());
            start = idx + 1;
        }
    }

    if start > 0 {
        buffer.drain(0..start);
    }

    lines
}

/// Truncated, lossy rendering of a line for log output.
pub(crate) fn line_preview(line: &[u8], limit: usize) -> String {
    let text = String::from_utf8_lossy(line);
    let mut preview: String = text.chars().take(limit).collect();
    if text.chars().count() > limit {
        preview.push('…');
    }
    preview
}
