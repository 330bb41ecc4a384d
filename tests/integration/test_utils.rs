//! Test utilities for integration tests.
//!
//! Wires the real handlers, runners and tile server over in-memory
//! adapters, with a stub worker standing in for the external processor.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;

use slide_pipeline::error::PipelineError;
use slide_pipeline::event::{
    Event, EventKind, EventSerializer, ImageProcessCompleted, JsonSerializer, RetryPolicies,
    RetryPolicy,
};
use slide_pipeline::messaging::{
    InMemoryTransport, InMemoryTransportConfig, Publisher, SubscriberConfig, TopicResolver,
    TransportPublisher, TransportSubscriber, ATTR_EVENT_KIND,
};
use slide_pipeline::model::{Content, Image};
use slide_pipeline::pipeline::{
    subscription_name, DeleteHandler, DlqHandler, EventHandler, HandlerRunner, ImageProcessor,
    NewFileHandler, PipelineContext, ProcessCompleteHandler, ProcessRequestHandler,
    ProcessingJob, UploadHandler,
};
use slide_pipeline::repository::MemoryStore;
use slide_pipeline::storage::InMemoryObjectStore;
use slide_pipeline::tile::{TileServer, TileServerConfig};

pub const TOPIC: &str = "slide-events";

/// Attempts allowed for a processing request before it is dead-lettered
pub const PROCESS_ATTEMPTS: u32 = 3;

pub const DZI: &[u8] = br#"<?xml version="1.0"?><Image TileSize="256" Overlap="0" Format="jpeg"/>"#;
pub const THUMBNAIL: &[u8] = b"thumbnail-jpeg";
pub const TILE_A: &[u8] = b"tile-12-0-0";
pub const TILE_B: &[u8] = b"tile-12-1-0!";

/// Archive layout: a 10 byte header, then TILE_A, then TILE_B.
pub fn archive_bytes() -> Vec<u8> {
    let mut archive = b"PK-HEADER-".to_vec();
    archive.extend_from_slice(TILE_A);
    archive.extend_from_slice(TILE_B);
    archive
}

pub fn index_map_bytes() -> Vec<u8> {
    format!(
        r#"{{"version":"v2","tiles":{{"12/0_0":{{"offset":10,"length":{}}},"12/1_0":{{"offset":{},"length":{}}}}}}}"#,
        TILE_A.len(),
        10 + TILE_A.len(),
        TILE_B.len()
    )
    .into_bytes()
}

// =============================================================================
// Stub Worker
// =============================================================================

/// How the stub worker reacts to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerMode {
    /// Write every artifact to storage and report success
    Succeed,
    /// Accept the job, then report a failed run
    ReportFailure,
    /// Fail the call itself, as if the worker were unreachable
    Unavailable,
}

/// Plays the external worker: writes derivatives to object storage and
/// reports the outcome as an `image_process_completed` event.
pub struct StubWorker {
    mode: WorkerMode,
    publisher: Arc<dyn Publisher>,
    storage: InMemoryObjectStore,
    calls: AtomicUsize,
}

impl StubWorker {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn artifacts(&self, image_id: &str) -> Vec<Content> {
        let objects: [(String, Vec<u8>); 4] = [
            (format!("{image_id}/thumbnail.jpg"), THUMBNAIL.to_vec()),
            (format!("{image_id}/slide.dzi"), DZI.to_vec()),
            (format!("{image_id}/indexmap.json"), index_map_bytes()),
            (format!("{image_id}/tiles.zip"), archive_bytes()),
        ];

        objects
            .into_iter()
            .map(|(path, data)| {
                let content = Content::new(image_id, "s3", path.clone(), data.len() as u64);
                self.storage.put(path, data);
                content
            })
            .collect()
    }
}

#[async_trait]
impl ImageProcessor for StubWorker {
    async fn process(&self, job: &ProcessingJob) -> Result<(), PipelineError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let completed = match self.mode {
            WorkerMode::Unavailable => {
                return Err(PipelineError::internal("worker", "connection refused"))
            }
            WorkerMode::ReportFailure => ImageProcessCompleted {
                image_id: job.image_id.clone(),
                version: job.version.clone(),
                success: false,
                contents: Vec::new(),
                failure_reason: Some("corrupt slide".to_string()),
                retryable: false,
                retry: None,
            },
            WorkerMode::Succeed => ImageProcessCompleted {
                image_id: job.image_id.clone(),
                version: job.version.clone(),
                success: true,
                contents: self.artifacts(&job.image_id),
                failure_reason: None,
                retryable: false,
                retry: None,
            },
        };

        self.publisher.publish(&Event::new(completed)).await
    }
}

// =============================================================================
// Pipeline Harness
// =============================================================================

/// Retry policies with no backoff so redelivery happens immediately.
pub fn fast_policies() -> RetryPolicies {
    let policy = |attempts| {
        RetryPolicy::new(attempts, Duration::ZERO, Duration::ZERO, 1.0)
            .expect("valid retry policy")
    };
    RetryPolicies::new(policy(3))
        .with(EventKind::ImageProcessRequested, policy(PROCESS_ATTEMPTS))
        .with(EventKind::ImageProcessDlq, RetryPolicy::no_retry())
}

/// A running pipeline: every handler consuming one shared topic.
pub struct Pipeline {
    pub store: MemoryStore,
    pub storage: InMemoryObjectStore,
    pub transport: Arc<InMemoryTransport>,
    pub serializer: Arc<dyn EventSerializer>,
    pub publisher: Arc<dyn Publisher>,
    pub tile_server: Arc<TileServer>,
    pub worker: Arc<StubWorker>,
    runners: Vec<Arc<HandlerRunner>>,
    tasks: JoinSet<()>,
}

impl Pipeline {
    pub fn start(mode: WorkerMode) -> Self {
        let store = MemoryStore::new();
        let storage = InMemoryObjectStore::new();
        let transport = Arc::new(InMemoryTransport::new(InMemoryTransportConfig {
            max_delivery_attempts: 10,
            record_published: true,
            ..Default::default()
        }));
        let serializer: Arc<dyn EventSerializer> = Arc::new(JsonSerializer::new());
        let topics = TopicResolver::new(TOPIC);
        let policies = fast_policies();

        let publisher: Arc<dyn Publisher> = Arc::new(TransportPublisher::new(
            transport.clone(),
            serializer.clone(),
            topics.clone(),
            policies.clone(),
        ));

        let tile_server = Arc::new(TileServer::new(
            store.images(),
            store.contents(),
            Arc::new(storage.clone()),
            TileServerConfig::default(),
        ));

        let worker = Arc::new(StubWorker {
            mode,
            publisher: publisher.clone(),
            storage: storage.clone(),
            calls: AtomicUsize::new(0),
        });

        let ctx = PipelineContext::new(
            store.images(),
            store.contents(),
            Arc::new(store.clone()),
            publisher.clone(),
            policies.clone(),
        )
        .with_cache(tile_server.clone());

        let handlers: Vec<Arc<dyn EventHandler>> = vec![
            Arc::new(UploadHandler::new(ctx.clone())),
            Arc::new(ProcessRequestHandler::new(ctx.clone(), worker.clone())),
            Arc::new(ProcessCompleteHandler::new(ctx.clone())),
            Arc::new(NewFileHandler::new(ctx.clone())),
            Arc::new(DlqHandler::new(ctx.clone())),
            Arc::new(DeleteHandler::content(ctx.clone())),
            Arc::new(DeleteHandler::file(ctx)),
        ];

        let subscriber = TransportSubscriber::new(
            transport.clone(),
            serializer.clone(),
            policies,
            SubscriberConfig {
                max_in_flight: 4,
                extend_interval: Duration::from_millis(50),
                extend_by: Duration::from_millis(100),
            },
        );

        let mut runners = Vec::new();
        let mut tasks = JoinSet::new();
        for handler in handlers {
            let topic = topics.resolve(handler.kind());
            let subscription = subscription_name(topic, handler.name());
            transport.create_subscription(topic, &subscription);

            let runner = Arc::new(HandlerRunner::new(subscriber.clone(), subscription, handler));
            let task_runner = runner.clone();
            tasks.spawn(async move {
                task_runner.start().await.expect("runner failed");
            });
            runners.push(runner);
        }

        Self {
            store,
            storage,
            transport,
            serializer,
            publisher,
            tile_server,
            worker,
            runners,
            tasks,
        }
    }

    /// Register an image with its origin slide, as the upload API would.
    pub async fn seed_upload(&self, image_id: &str) -> Content {
        self.store
            .images()
            .create(Image::with_id(image_id, format!("{image_id}.svs")))
            .await
            .expect("create image");
        let origin = Content::new(image_id, "s3", format!("{image_id}/origin.svs"), 1024);
        self.storage.put(origin.path.clone(), vec![0u8; 1024]);
        self.store
            .contents()
            .create(origin)
            .await
            .expect("create origin")
    }

    pub async fn publish(&self, event: Event) {
        self.publisher.publish(&event).await.expect("publish");
    }

    /// Wait until every subscription has drained.
    pub async fn settle(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        let mut idle_polls = 0;
        while idle_polls < 3 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "pipeline did not settle"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
            if self.transport.is_idle() {
                idle_polls += 1;
            } else {
                idle_polls = 0;
            }
        }
    }

    /// Events of `kind` published on the shared topic, in order.
    pub fn published(&self, kind: EventKind) -> Vec<Event> {
        self.transport
            .published(TOPIC)
            .into_iter()
            .filter(|m| m.attribute(ATTR_EVENT_KIND) == Some(kind.as_str()))
            .map(|m| {
                self.serializer
                    .deserialize(&m.data, kind.as_str())
                    .expect("decode published event")
            })
            .collect()
    }

    pub async fn shutdown(mut self) {
        for runner in &self.runners {
            runner.stop();
        }
        self.transport.close();
        while self.tasks.join_next().await.is_some() {}
    }
}
