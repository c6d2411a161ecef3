//! Append-only record of every exchange with the SRI web services.
use crate::document::{DocumentId, DocumentStatus};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const MAX_CODE_LEN: usize = 10;
pub const MAX_MESSAGE_LEN: usize = 500;

/// Codes written by the pipeline for non-SRI outcomes.
pub mod codes {
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const SERVICE_UNAVAILABLE: &str = "SVC_UNAVL";
    pub const SOAP_FAULT: &str = "SOAP_FAULT";
    pub const CRITICAL: &str = "CRIT_ERROR";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Reception,
    Authorization,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Reception => "RECEPTION",
            Operation::Authorization => "AUTHORIZATION",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logged interaction. Code and message are clipped on construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    document_id: DocumentId,
    operation: Operation,
    code: String,
    message: String,
    payload: String,
    recorded_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        document_id: DocumentId,
        operation: Operation,
        code: &str,
        message: &str,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            document_id,
            operation,
            code: clip(code, MAX_CODE_LEN),
            message: clip(message, MAX_MESSAGE_LEN),
            payload: payload.into(),
            recorded_at: Utc::now(),
        }
    }

    pub fn document_id(&self) -> DocumentId {
        self.document_id
    }

    pub fn operation(&self) -> Operation {
        self.operation
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn payload(&self) -> &str {
        &self.payload
    }

    pub fn recorded_at(&self) -> DateTime<Utc> {
        self.recorded_at
    }

    /// Status this entry proves the document reached, if any.
    pub fn proven_status(&self) -> Option<DocumentStatus> {
        match (self.operation, self.code.as_str()) {
            (Operation::Reception, "RECIBIDA") => Some(DocumentStatus::Sent),
            (Operation::Authorization, "AUTORIZADO") => Some(DocumentStatus::Authorized),
            _ => None,
        }
    }
}

fn clip(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

/// Storage for [`LogEntry`] values. Entries are never modified or removed.
pub trait ResponseLog: Send + Sync {
    fn append(&self, entry: LogEntry);

    /// Entries of one document, oldest first.
    fn entries(&self, document_id: DocumentId) -> Vec<LogEntry>;

    /// Highest status any logged response proves.
    fn last_successful_status(&self, document_id: DocumentId) -> Option<DocumentStatus> {
        self.entries(document_id)
            .iter()
            .filter_map(LogEntry::proven_status)
            .max_by_key(DocumentStatus::rank)
    }
}

#[derive(Debug, Default)]
pub struct InMemoryResponseLog {
    entries: RwLock<Vec<LogEntry>>,
}

impl InMemoryResponseLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl ResponseLog for InMemoryResponseLog {
    fn append(&self, entry: LogEntry) {
        self.entries.write().push(entry);
    }

    fn entries(&self, document_id: DocumentId) -> Vec<LogEntry> {
        self.entries
            .read()
            .iter()
            .filter(|e| e.document_id == document_id)
            .cloned()
            .collect()
    }
}
