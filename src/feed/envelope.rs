//! Wire envelope for row-level change events and its typed decoding.
//!
//! The transport delivers an untyped envelope; [`ChangeRecord::decode`] turns
//! it into the closed [`ChangeEvent`] sum the reconciliation engine consumes.
//! Anything that fails to decode is reported as an [`EnvelopeError`] so the
//! pump can log it and drop the event without touching the log.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::{MessageRow, ParticipantRow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventType {
    Insert,
    Update,
    Delete,
}

/// Raw change event as delivered by the transport.
///
/// `new` carries the row for inserts and updates, `old` the prior row for
/// updates and deletes. Either may be absent on a malformed delivery.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChangeRecord {
    #[serde(rename = "eventType")]
    pub event_type: EventType,
    #[serde(default)]
    pub schema: String,
    pub table: String,
    #[serde(default)]
    pub new: Option<Value>,
    #[serde(default)]
    pub old: Option<Value>,
}

/// A decoded row-level change.
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange<T> {
    Insert(T),
    Update { old: Option<T>, new: T },
    Delete(T),
}

/// A change event decoded against the tables this subsystem watches.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Message(RowChange<MessageRow>),
    Participant(RowChange<ParticipantRow>),
}

#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("Unknown table: {0}")]
    UnknownTable(String),
    #[error("Missing {field} row in {event_type:?} event for table {table}")]
    MissingRow {
        event_type: EventType,
        table: String,
        field: &'static str,
    },
    #[error("Malformed row: {0}")]
    MalformedRow(#[from] serde_json::Error),
}

impl ChangeRecord {
    /// Decode the envelope into a typed event.
    pub fn decode(&self) -> Result<ChangeEvent, EnvelopeError> {
        match self.table.as_str() {
            "messages" => Ok(ChangeEvent::Message(self.decode_rows()?)),
            "participants" => Ok(ChangeEvent::Participant(self.decode_rows()?)),
            other => Err(EnvelopeError::UnknownTable(other.to_string())),
        }
    }

    fn decode_rows<T: DeserializeOwned>(&self) -> Result<RowChange<T>, EnvelopeError> {
        match self.event_type {
            EventType::Insert => {
                let new = self.require_row(&self.new, "new")?;
                Ok(RowChange::Insert(new))
            }
            EventType::Update => {
                let new = self.require_row(&self.new, "new")?;
                let old = match &self.old {
                    Some(value) => Some(serde_json::from_value(value.clone())?),
                    None => None,
                };
                Ok(RowChange::Update { old, new })
            }
            EventType::Delete => {
                let old = self.require_row(&self.old, "old")?;
                Ok(RowChange::Delete(old))
            }
        }
    }

    fn require_row<T: DeserializeOwned>(
        &self,
        value: &Option<Value>,
        field: &'static str,
    ) -> Result<T, EnvelopeError> {
        let value = value.as_ref().ok_or(EnvelopeError::MissingRow {
            event_type: self.event_type,
            table: self.table.clone(),
            field,
        })?;
        Ok(serde_json::from_value(value.clone())?)
    }
}
