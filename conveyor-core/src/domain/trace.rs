//! Trace domain types
//!
//! A trace is the ordered log a runner streams back while executing a job.
//! On the wire each entry is a flat JSON array:
//! `[level, timestamp_ms, message, ...details]`.

use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::{SerializeSeq, Serializer};
use serde::{Deserialize, Serialize};

/// Severity of a trace entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    Verbose,
    Info,
    Warn,
    Error,
}

/// One line of a job trace
#[derive(Debug, Clone, PartialEq)]
pub struct TraceEntry {
    pub level: TraceLevel,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub message: String,
    pub details: Vec<serde_json::Value>,
}

impl TraceEntry {
    pub fn new(level: TraceLevel, timestamp: i64, message: impl Into<String>) -> Self {
        Self {
            level,
            timestamp,
            message: message.into(),
            details: Vec::new(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<serde_json::Value>) -> Self {
        self.details.push(detail.into());
        self
    }
}

impl Serialize for TraceEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut seq = serializer.serialize_seq(Some(3 + self.details.len()))?;
        seq.serialize_element(&self.level)?;
        seq.serialize_element(&self.timestamp)?;
        seq.serialize_element(&self.message)?;
        for detail in &self.details {
            seq.serialize_element(detail)?;
        }
        seq.end()
    }
}

impl<'de> Deserialize<'de> for TraceEntry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct EntryVisitor;

        impl<'de> Visitor<'de> for EntryVisitor {
            type Value = TraceEntry;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("an array [level, timestamp, message, ...details]")
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<TraceEntry, A::Error> {
                let level = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(0, &self))?;
                let timestamp = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(1, &self))?;
                let message = seq
                    .next_element()?
                    .ok_or_else(|| de::Error::invalid_length(2, &self))?;

                let mut details = Vec::new();
                while let Some(detail) = seq.next_element()? {
                    details.push(detail);
                }

                Ok(TraceEntry {
                    level,
                    timestamp,
                    message,
                    details,
                })
            }
        }

        deserializer.deserialize_seq(EntryVisitor)
    }
}
