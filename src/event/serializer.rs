//! Wire encoding for events.
//!
//! The canonical body is a JSON object with the envelope fields
//! (`event_id`, `event_kind`, `timestamp`) next to the payload fields:
//!
//! ```json
//! {
//!   "event_id": "6f1c...",
//!   "event_kind": "new_file_exist",
//!   "timestamp": "2024-05-01T12:00:00Z",
//!   "content": { "id": "...", "path": "img-1/thumbnail.jpg", ... }
//! }
//! ```
//!
//! Decoding runs an ordered list of decoders for the requested kind and
//! returns the first one that recognises the body. `uploaded` events may
//! also arrive as a cloud-storage object notification, which the second
//! decoder in its list understands.

use std::collections::HashMap;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::{
    Delete, DeleteFile, Event, EventKind, ImageProcessCompleted, ImageProcessDlq,
    ImageProcessRequested, NewFileExist, Payload, Uploaded,
};
use crate::error::SerializeError;
use crate::model::{Content, ContentType};

/// Provider recorded on contents announced by storage notifications
pub const NOTIFICATION_PROVIDER: &str = "gcs";

/// Metadata key naming the owning image on a storage notification
pub const IMAGE_ID_METADATA: &str = "image-id";

/// Metadata key carrying a pre-assigned content id on a storage notification
pub const CONTENT_ID_METADATA: &str = "content-id";

/// Converts events to and from message bodies.
pub trait EventSerializer: Send + Sync {
    fn serialize(&self, event: &Event) -> Result<Bytes, SerializeError>;

    /// Decode a body announced as `kind` (the wire name of an [`EventKind`]).
    fn deserialize(&self, data: &[u8], kind: &str) -> Result<Event, SerializeError>;
}

// =============================================================================
// Decoders
// =============================================================================

/// Result of one decoder attempt.
pub enum Attempt {
    /// The body was recognised and decoded
    Decoded(Event),
    /// The body is not in this decoder's shape; try the next one
    NotRecognised(String),
    /// The body is in this decoder's shape but is invalid; stop here
    Failed(SerializeError),
}

/// One entry in a kind's ordered decoder list.
#[derive(Clone, Copy)]
pub struct Decoder {
    pub name: &'static str,
    pub decode: fn(&[u8], EventKind) -> Attempt,
}

impl Decoder {
    pub const CANONICAL: Decoder = Decoder {
        name: "canonical",
        decode: decode_canonical,
    };

    pub const STORAGE_NOTIFICATION: Decoder = Decoder {
        name: "storage_notification",
        decode: decode_storage_notification,
    };
}

// =============================================================================
// JSON Serializer
// =============================================================================

/// JSON serializer with per-kind decoder lists.
pub struct JsonSerializer {
    decoders: HashMap<EventKind, Vec<Decoder>>,
}

impl JsonSerializer {
    pub fn new() -> Self {
        let mut decoders: HashMap<EventKind, Vec<Decoder>> = EventKind::ALL
            .into_iter()
            .map(|kind| (kind, vec![Decoder::CANONICAL]))
            .collect();
        decoders.insert(
            EventKind::Uploaded,
            vec![Decoder::CANONICAL, Decoder::STORAGE_NOTIFICATION],
        );
        Self { decoders }
    }

    /// Decoders tried for `kind`, in order.
    pub fn decoders(&self, kind: EventKind) -> &[Decoder] {
        self.decoders.get(&kind).map(Vec::as_slice).unwrap_or(&[])
    }
}

impl Default for JsonSerializer {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSerializer for JsonSerializer {
    fn serialize(&self, event: &Event) -> Result<Bytes, SerializeError> {
        let body = match event.payload() {
            Payload::Uploaded(p) => encode(event, p),
            Payload::Delete(p) => encode(event, p),
            Payload::ImageProcessRequested(p) => encode(event, p),
            Payload::ImageProcessCompleted(p) => encode(event, p),
            Payload::NewFileExist(p) => encode(event, p),
            Payload::DeleteFile(p) => encode(event, p),
            Payload::ImageProcessDlq(p) => encode(event, p),
        }?;
        Ok(Bytes::from(body))
    }

    fn deserialize(&self, data: &[u8], kind: &str) -> Result<Event, SerializeError> {
        let kind: EventKind = kind.parse()?;

        let mut reasons = Vec::new();
        for decoder in self.decoders(kind) {
            match (decoder.decode)(data, kind) {
                Attempt::Decoded(event) => {
                    debug!(
                        kind = %kind,
                        decoder = decoder.name,
                        event_id = event.event_id(),
                        "Decoded event"
                    );
                    return Ok(event);
                }
                Attempt::NotRecognised(reason) => {
                    reasons.push(format!("{}: {}", decoder.name, reason));
                }
                Attempt::Failed(err) => return Err(err),
            }
        }

        Err(SerializeError::UnsupportedPayload {
            kind,
            reason: reasons.join("; "),
        })
    }
}

// =============================================================================
// Canonical Shape
// =============================================================================

#[derive(Serialize)]
struct CanonicalOut<'a, P> {
    event_id: &'a str,
    event_kind: EventKind,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    payload: &'a P,
}

#[derive(Deserialize)]
struct CanonicalIn<P> {
    event_id: String,
    event_kind: EventKind,
    timestamp: DateTime<Utc>,
    #[serde(flatten)]
    payload: P,
}

fn encode<P: Serialize>(event: &Event, payload: &P) -> Result<Vec<u8>, SerializeError> {
    let body = CanonicalOut {
        event_id: event.event_id(),
        event_kind: event.kind(),
        timestamp: event.timestamp(),
        payload,
    };
    Ok(serde_json::to_vec(&body)?)
}

fn decode_as<P>(data: &[u8], kind: EventKind) -> Attempt
where
    P: DeserializeOwned + Into<Payload>,
{
    let body: CanonicalIn<P> = match serde_json::from_slice(data) {
        Ok(body) => body,
        Err(e) => return Attempt::NotRecognised(e.to_string()),
    };

    if body.event_kind != kind {
        return Attempt::Failed(SerializeError::UnsupportedPayload {
            kind,
            reason: format!("body declares event_kind '{}'", body.event_kind),
        });
    }

    Attempt::Decoded(Event::from_parts(
        body.event_id,
        body.timestamp,
        body.payload.into(),
    ))
}

fn decode_canonical(data: &[u8], kind: EventKind) -> Attempt {
    match kind {
        EventKind::Uploaded => decode_as::<Uploaded>(data, kind),
        EventKind::Delete => decode_as::<Delete>(data, kind),
        EventKind::ImageProcessRequested => decode_as::<ImageProcessRequested>(data, kind),
        EventKind::ImageProcessCompleted => decode_as::<ImageProcessCompleted>(data, kind),
        EventKind::NewFileExist => decode_as::<NewFileExist>(data, kind),
        EventKind::DeleteFile => decode_as::<DeleteFile>(data, kind),
        EventKind::ImageProcessDlq => decode_as::<ImageProcessDlq>(data, kind),
    }
}

// =============================================================================
// Storage Notification Shape
// =============================================================================

/// Object change notification as emitted by the storage provider.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageNotification {
    name: String,
    bucket: String,

    #[serde(default)]
    id: Option<String>,

    #[serde(default)]
    content_type: Option<String>,

    /// Decimal string
    #[serde(default)]
    size: Option<String>,

    #[serde(default)]
    time_created: Option<DateTime<Utc>>,

    #[serde(default)]
    metadata: HashMap<String, String>,
}

fn decode_storage_notification(data: &[u8], kind: EventKind) -> Attempt {
    if kind != EventKind::Uploaded {
        return Attempt::NotRecognised(format!("notifications only carry {}", EventKind::Uploaded));
    }

    let notification: StorageNotification = match serde_json::from_slice(data) {
        Ok(n) => n,
        Err(e) => return Attempt::NotRecognised(e.to_string()),
    };

    let Some(image_id) = notification.metadata.get(IMAGE_ID_METADATA).cloned() else {
        return Attempt::Failed(SerializeError::MissingRequiredMetadata(IMAGE_ID_METADATA));
    };

    let size = match notification.size.as_deref() {
        None => 0,
        Some(raw) => match raw.parse::<u64>() {
            Ok(size) => size,
            Err(_) => {
                return Attempt::Failed(SerializeError::UnsupportedPayload {
                    kind,
                    reason: format!("invalid object size '{raw}'"),
                })
            }
        },
    };

    let content_id = notification
        .metadata
        .get(CONTENT_ID_METADATA)
        .cloned()
        .or(notification.id)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let created_at = notification.time_created.unwrap_or_else(Utc::now);

    debug!(
        bucket = %notification.bucket,
        object = %notification.name,
        content_type = notification.content_type.as_deref().unwrap_or("unknown"),
        "Decoding storage notification"
    );

    let content = Content {
        id: content_id,
        parent: Some(image_id),
        provider: NOTIFICATION_PROVIDER.to_string(),
        content_type: ContentType::from_path(&notification.name),
        path: notification.name,
        size,
        created_at,
        deleted_at: None,
    };

    Attempt::Decoded(Event::from_parts(
        Uuid::new_v4().to_string(),
        created_at,
        Uploaded { content }.into(),
    ))
}
