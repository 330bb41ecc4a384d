//! Shared fixture for handler tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{ImageCacheInvalidator, PipelineContext};
use crate::event::{Event, EventKind, EventSerializer, JsonSerializer, RetryPolicies};
use crate::messaging::{InMemoryTransport, TopicResolver, TransportPublisher, ATTR_EVENT_KIND};
use crate::model::{Content, Image, ImageField, ProcessingStatus};
use crate::repository::MemoryStore;

pub const TOPIC: &str = "events";

#[derive(Default)]
pub struct RecordingInvalidator {
    pub invalidated: Mutex<Vec<String>>,
}

#[async_trait]
impl ImageCacheInvalidator for RecordingInvalidator {
    async fn invalidate_image(&self, image_id: &str) {
        self.invalidated.lock().unwrap().push(image_id.to_string());
    }
}

pub struct Fixture {
    pub store: MemoryStore,
    pub transport: Arc<InMemoryTransport>,
    pub invalidator: Arc<RecordingInvalidator>,
    pub ctx: PipelineContext,
}

impl Fixture {
    pub fn new() -> Self {
        let store = MemoryStore::new();
        let transport = Arc::new(InMemoryTransport::recording());
        let invalidator = Arc::new(RecordingInvalidator::default());
        let publisher = TransportPublisher::new(
            transport.clone(),
            Arc::new(JsonSerializer::new()),
            TopicResolver::new(TOPIC),
            RetryPolicies::default(),
        );
        let ctx = PipelineContext::new(
            store.images(),
            store.contents(),
            Arc::new(store.clone()),
            Arc::new(publisher),
            RetryPolicies::default(),
        )
        .with_cache(invalidator.clone());

        Self {
            store,
            transport,
            invalidator,
            ctx,
        }
    }

    /// Decoded events of `kind` published so far.
    pub fn published(&self, kind: EventKind) -> Vec<Event> {
        let serializer = JsonSerializer::new();
        self.transport
            .published(TOPIC)
            .into_iter()
            .filter(|m| m.attribute(ATTR_EVENT_KIND) == Some(kind.as_str()))
            .map(|m| serializer.deserialize(&m.data, kind.as_str()).unwrap())
            .collect()
    }

    pub async fn seed_image(&self, id: &str) -> Image {
        self.store
            .images()
            .create(Image::with_id(id, format!("{id}.svs")))
            .await
            .unwrap()
    }

    /// Seed an image already in `processing`.
    pub async fn seed_processing_image(&self, id: &str) -> Image {
        self.seed_image(id).await;
        self.store
            .images()
            .update(
                id,
                &[
                    ImageField::Status(ProcessingStatus::Processing),
                    ImageField::Version("v2".into()),
                ],
            )
            .await
            .unwrap()
    }

    pub async fn seed_content(&self, image_id: &str, path: &str) -> Content {
        self.store
            .contents()
            .create(Content::new(image_id, "s3", path, 100))
            .await
            .unwrap()
    }

    pub fn invalidated(&self) -> Vec<String> {
        self.invalidator.invalidated.lock().unwrap().clone()
    }
}
