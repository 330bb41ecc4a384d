//! Slide Pipeline - event-driven processing and tile serving for Whole Slide Images.
//!
//! This binary starts the handler runners and the HTTP server.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::task::JoinSet;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use slide_pipeline::{
    config::Config,
    create_s3_client,
    event::{EventSerializer, JsonSerializer},
    messaging::{InMemoryTransport, TopicResolver, TransportPublisher, TransportSubscriber},
    pipeline::{
        subscription_name, DeleteHandler, DlqHandler, EventHandler, HandlerRunner,
        HttpImageProcessor, NewFileHandler, PipelineContext, ProcessCompleteHandler,
        ProcessRequestHandler, UploadHandler,
    },
    repository::MemoryStore,
    server::{create_router, AppState, EventIngest, RouterConfig},
    storage::S3ObjectStore,
    tile::TileServer,
};

#[tokio::main]
async fn main() -> ExitCode {
    let config = Config::parse();

    init_logging(config.verbose);

    if let Err(e) = config.validate() {
        error!("Configuration error: {}", e);
        return ExitCode::FAILURE;
    }

    print_banner();

    info!("Configuration:");
    info!("  S3 bucket: {}", config.s3_bucket);
    if let Some(ref endpoint) = config.s3_endpoint {
        info!("  S3 endpoint: {}", endpoint);
    }
    info!("  S3 region: {}", config.s3_region);
    info!("  Worker: {}", config.worker_url);
    info!("  Processing version: {}", config.processing_version);
    info!(
        "  Cache: {} entries, metadata TTL {}s, index map TTL {}s",
        config.cache_max_entries, config.metadata_ttl, config.index_map_ttl
    );

    // Storage, repositories and transport
    let s3_client = create_s3_client(config.s3_endpoint.as_deref(), &config.s3_region).await;
    let storage = Arc::new(S3ObjectStore::new(s3_client, config.s3_bucket.clone()));
    let store = MemoryStore::new();
    let transport = Arc::new(InMemoryTransport::new(config.transport_config()));
    let serializer: Arc<dyn EventSerializer> = Arc::new(JsonSerializer::new());
    let topics = config.topic_resolver();
    let policies = config.retry_policies();

    let tile_server = Arc::new(TileServer::new(
        store.images(),
        store.contents(),
        storage,
        config.tile_server_config(),
    ));

    let publisher = Arc::new(TransportPublisher::new(
        transport.clone(),
        serializer.clone(),
        topics.clone(),
        policies.clone(),
    ));

    let processor = match HttpImageProcessor::new(&config.worker_url, config.worker_timeout()) {
        Ok(processor) => Arc::new(processor),
        Err(e) => {
            error!("Failed to create worker client: {}", e);
            return ExitCode::FAILURE;
        }
    };

    let ctx = PipelineContext::new(
        store.images(),
        store.contents(),
        Arc::new(store.clone()),
        publisher.clone(),
        policies.clone(),
    )
    .with_cache(tile_server.clone())
    .with_processing_version(config.processing_version.clone());

    let handlers: Vec<Arc<dyn EventHandler>> = vec![
        Arc::new(UploadHandler::new(ctx.clone())),
        Arc::new(ProcessRequestHandler::new(ctx.clone(), processor)),
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
        config.subscriber_config(),
    );
    let runners = build_runners(&transport, &subscriber, &topics, handlers);

    let mut tasks = JoinSet::new();
    for runner in &runners {
        let runner = runner.clone();
        tasks.spawn(async move {
            if let Err(e) = runner.start().await {
                error!(handler = runner.name(), error = %e, "Handler runner failed");
            }
        });
    }
    info!("  Handlers: {} runners started", runners.len());

    // HTTP surface
    let app_state = AppState::new(tile_server).with_ingest(EventIngest {
        serializer,
        publisher,
    });
    let router = create_router(app_state, build_router_config(&config));

    let addr = config.bind_address();

    info!("");
    info!("────────────────────────────────────────────────────────────────");
    info!("  Server listening on: http://{}", addr);
    info!("");
    info!("  Try these endpoints:");
    info!("    curl http://{}/health", addr);
    info!("    curl http://{}/images/<image_id>/slide.dzi", addr);
    info!("────────────────────────────────────────────────────────────────");
    info!("");

    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            error!("Failed to bind to {}: {}", addr, e);
            return ExitCode::FAILURE;
        }
    };

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    info!("Shutting down handlers");
    for runner in &runners {
        runner.stop();
    }
    transport.close();
    while tasks.join_next().await.is_some() {}

    if let Err(e) = served {
        error!("Server error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

/// Create one subscription and runner per handler on the topic its kind routes to.
fn build_runners(
    transport: &InMemoryTransport,
    subscriber: &TransportSubscriber,
    topics: &TopicResolver,
    handlers: Vec<Arc<dyn EventHandler>>,
) -> Vec<Arc<HandlerRunner>> {
    handlers
        .into_iter()
        .map(|handler| {
            let topic = topics.resolve(handler.kind());
            let subscription = subscription_name(topic, handler.name());
            transport.create_subscription(topic, &subscription);
            Arc::new(HandlerRunner::new(subscriber.clone(), subscription, handler))
        })
        .collect()
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

/// Print the startup banner.
fn print_banner() {
    let version = env!("CARGO_PKG_VERSION");
    info!("");
    info!("███████╗██╗     ██╗██████╗ ███████╗");
    info!("██╔════╝██║     ██║██╔══██╗██╔════╝");
    info!("███████╗██║     ██║██║  ██║█████╗  ");
    info!("╚════██║██║     ██║██║  ██║██╔══╝  ");
    info!("███████║███████╗██║██████╔╝███████╗");
    info!("╚══════╝╚══════╝╚═╝╚═════╝ ╚══════╝");
    info!("            pipeline v{}", version);
    info!("");
}

/// Initialize the tracing/logging subsystem.
fn init_logging(verbose: bool) {
    let env_filter = if verbose {
        "slide_pipeline=debug,tower_http=debug"
    } else {
        "slide_pipeline=info,tower_http=info"
    };

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| env_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Build RouterConfig from the application Config.
fn build_router_config(config: &Config) -> RouterConfig {
    let mut router_config = RouterConfig::new();

    if let Some(ref origins) = config.cors_origins {
        router_config = router_config.with_cors_origins(origins.clone());
    }

    router_config.with_tracing(!config.no_tracing)
}
