//! Event source abstraction for the relay binary.
//!
//! Producers feed the relay newline-delimited JSON. Every object line is a
//! record to report, except control lines carrying a `_signal` field, which
//! are forwarded as [`HostSignal`]s.

use super::HostSignal;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tracing::warn;

/// Field requesting immediate delivery; stripped before reporting.
pub const IMMEDIATE_FIELD: &str = "_immediate";
/// Field marking a control line.
pub const SIGNAL_FIELD: &str = "_signal";

/// Events produced by a source.
#[derive(Debug, PartialEq)]
pub enum SourceEvent {
    Record {
        fields: Map<String, Value>,
        immediate: bool,
    },
    Signal(HostSignal),
    /// No more input.
    Eof,
}

/// Where producer events come from.
#[async_trait]
pub trait EventSource: Send + 'static {
    /// Read the next event. Returns `SourceEvent::Eof` when input is exhausted.
    async fn next_event(&mut self) -> Result<SourceEvent>;

    /// Human-readable name for logging.
    fn source_name(&self) -> &str;
}

/// Reads JSON events one per line.
pub struct LineSource<R> {
    reader: R,
    line_buffer: String,
    name: &'static str,
}

impl LineSource<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()), "stdin")
    }
}

impl<R> LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R, name: &'static str) -> Self {
        Self {
            reader,
            line_buffer: String::with_capacity(1024),
            name,
        }
    }
}

#[async_trait]
impl<R> EventSource for LineSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn next_event(&mut self) -> Result<SourceEvent> {
        loop {
            self.line_buffer.clear();
            let bytes = self.reader.read_line(&mut self.line_buffer).await?;
            if bytes == 0 {
                return Ok(SourceEvent::Eof);
            }
            let line = self.line_buffer.trim();
            if line.is_empty() {
                continue;
            }
            if let Some(event) = parse_line(line) {
                return Ok(event);
            }
        }
    }

    fn source_name(&self) -> &str {
        self.name
    }
}

/// Turn one input line into an event. Malformed lines are logged and skipped.
pub fn parse_line(line: &str) -> Option<SourceEvent> {
    let mut fields = match serde_json::from_str::<Value>(line) {
        Ok(Value::Object(fields)) => fields,
        Ok(other) => {
            warn!(kind = json_kind(&other), "Skipping input line that is not a JSON object");
            return None;
        }
        Err(e) => {
            warn!(error = %e, "Skipping unparseable input line");
            return None;
        }
    };

    if let Some(signal) = fields.get(SIGNAL_FIELD) {
        return match serde_json::from_value::<HostSignal>(signal.clone()) {
            Ok(signal) => Some(SourceEvent::Signal(signal)),
            Err(_) => {
                warn!(signal = %signal, "Skipping unknown host signal");
                None
            }
        };
    }

    let immediate = fields
        .remove(IMMEDIATE_FIELD)
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    Some(SourceEvent::Record { fields, immediate })
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
