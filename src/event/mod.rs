//! Pipeline events.
//!
//! Every message on the bus is an [`Event`]: an immutable [`Envelope`]
//! (id, kind, timestamp) plus a typed [`Payload`]. The envelope kind is
//! derived from the payload variant, so a mismatched pair cannot be built.
//! Follow-on events always get a fresh envelope.
//!
//! # Event flow
//!
//! ```text
//! uploaded ──► image_process_requested ──► (worker) ──► image_process_completed
//!                                                          │
//!                            success ◄─────────────────────┴────► failure
//!                               │                                   │
//!                               ▼                                   ▼
//!                       new_file_exist × N                  image_process_dlq
//! ```

pub mod retry;
pub mod serializer;

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::SerializeError;
use crate::model::Content;

pub use retry::{parse_policy_override, RetryMetadata, RetryPolicies, RetryPolicy};
pub use serializer::{EventSerializer, JsonSerializer};

// =============================================================================
// Event Kind
// =============================================================================

/// Closed set of event kinds carried by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Uploaded,
    Delete,
    ImageProcessRequested,
    ImageProcessCompleted,
    NewFileExist,
    DeleteFile,
    ImageProcessDlq,
}

impl EventKind {
    pub const ALL: [EventKind; 7] = [
        EventKind::Uploaded,
        EventKind::Delete,
        EventKind::ImageProcessRequested,
        EventKind::ImageProcessCompleted,
        EventKind::NewFileExist,
        EventKind::DeleteFile,
        EventKind::ImageProcessDlq,
    ];

    /// Wire name, as carried in the `event_kind` attribute.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Uploaded => "uploaded",
            EventKind::Delete => "delete",
            EventKind::ImageProcessRequested => "image_process_requested",
            EventKind::ImageProcessCompleted => "image_process_completed",
            EventKind::NewFileExist => "new_file_exist",
            EventKind::DeleteFile => "delete_file",
            EventKind::ImageProcessDlq => "image_process_dlq",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = SerializeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s)
            .ok_or_else(|| SerializeError::UnsupportedKind(s.to_string()))
    }
}

// =============================================================================
// Envelope
// =============================================================================

/// Common header shared by all events. Fields are read-only.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    event_id: String,
    kind: EventKind,
    timestamp: DateTime<Utc>,
}

impl Envelope {
    fn new(kind: EventKind) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            kind,
            timestamp: Utc::now(),
        }
    }

    pub fn event_id(&self) -> &str {
        &self.event_id
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

// =============================================================================
// Payloads
// =============================================================================

/// A content object landed in storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Uploaded {
    pub content: Content,
}

/// A content object should be removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delete {
    pub content_id: String,
}

/// The external worker should derive artifacts from `content`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProcessRequested {
    pub image_id: String,
    pub content: Content,
    pub version: String,
}

/// Outcome reported by the external worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProcessCompleted {
    pub image_id: String,
    pub version: String,
    pub success: bool,

    /// Produced artifacts, when `success`
    #[serde(default)]
    pub contents: Vec<Content>,

    #[serde(default)]
    pub failure_reason: Option<String>,

    #[serde(default)]
    pub retryable: bool,

    #[serde(default)]
    pub retry: Option<RetryMetadata>,
}

/// One derived artifact to register against its parent image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewFileExist {
    pub content: Content,
}

/// A derived artifact should be removed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteFile {
    pub content_id: String,

    #[serde(default)]
    pub path: Option<String>,
}

/// Processing of an image failed for good.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageProcessDlq {
    pub image_id: String,
    pub original_event_id: String,
    pub failure_reason: String,
    pub retryable: bool,
    pub retry: RetryMetadata,
}

/// Typed event body, one variant per [`EventKind`].
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Uploaded(Uploaded),
    Delete(Delete),
    ImageProcessRequested(ImageProcessRequested),
    ImageProcessCompleted(ImageProcessCompleted),
    NewFileExist(NewFileExist),
    DeleteFile(DeleteFile),
    ImageProcessDlq(ImageProcessDlq),
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Payload::Uploaded(_) => EventKind::Uploaded,
            Payload::Delete(_) => EventKind::Delete,
            Payload::ImageProcessRequested(_) => EventKind::ImageProcessRequested,
            Payload::ImageProcessCompleted(_) => EventKind::ImageProcessCompleted,
            Payload::NewFileExist(_) => EventKind::NewFileExist,
            Payload::DeleteFile(_) => EventKind::DeleteFile,
            Payload::ImageProcessDlq(_) => EventKind::ImageProcessDlq,
        }
    }
}

macro_rules! impl_payload_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for Payload {
                fn from(payload: $variant) -> Self {
                    Payload::$variant(payload)
                }
            }
        )*
    };
}

impl_payload_from!(
    Uploaded,
    Delete,
    ImageProcessRequested,
    ImageProcessCompleted,
    NewFileExist,
    DeleteFile,
    ImageProcessDlq,
);

// =============================================================================
// Event
// =============================================================================

/// Envelope plus payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    envelope: Envelope,
    payload: Payload,
}

impl Event {
    /// Wrap a payload in a fresh envelope.
    pub fn new(payload: impl Into<Payload>) -> Self {
        let payload = payload.into();
        Self {
            envelope: Envelope::new(payload.kind()),
            payload,
        }
    }

    /// Rebuild an event received from the wire.
    pub(crate) fn from_parts(
        event_id: String,
        timestamp: DateTime<Utc>,
        payload: Payload,
    ) -> Self {
        Self {
            envelope: Envelope {
                event_id,
                kind: payload.kind(),
                timestamp,
            },
            payload,
        }
    }

    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn kind(&self) -> EventKind {
        self.envelope.kind
    }

    pub fn event_id(&self) -> &str {
        &self.envelope.event_id
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.envelope.timestamp
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_wire_names_round_trip() {
        for kind in EventKind::ALL {
            assert_eq!(kind.as_str().parse::<EventKind>().unwrap(), kind);
            let json = serde_json::to_string(&kind).unwrap();
            assert_eq!(json, format!("\"{}\"", kind.as_str()));
        }
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let result = "image_processed".parse::<EventKind>();
        assert!(matches!(result, Err(SerializeError::UnsupportedKind(k)) if k == "image_processed"));
    }

    #[test]
    fn test_envelope_kind_follows_payload() {
        let event = Event::new(Delete {
            content_id: "c-1".into(),
        });
        assert_eq!(event.kind(), EventKind::Delete);
        assert_eq!(event.envelope().kind(), EventKind::Delete);
        assert!(Uuid::parse_str(event.event_id()).is_ok());
    }

    #[test]
    fn test_follow_on_events_get_new_envelopes() {
        let a = Event::new(Delete {
            content_id: "c-1".into(),
        });
        let b = Event::new(Delete {
            content_id: "c-1".into(),
        });
        assert_ne!(a.event_id(), b.event_id());
    }
}
