//! Conveyor Development Monolith
//!
//! All-in-one binary for local development containing:
//! - Embedded in-memory broker
//! - REST trigger for publishing product events
//! - Logging consumer with explicit ack/nack handling
//!
//! `POST /products/{name}` publishes a CREATED event;
//! `POST /products/{name}/{action}` picks the action explicitly.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cv_broker::MemoryBroker;
use cv_client::{Client, DeliveryContext, EventHandler, Publisher};
use cv_common::{
    BrokerConfig, ConsumerOptions, ConveyorError, Event, EventAction, HandlerOutcome,
    PublisherConfig, QueueOptions, ReconnectPolicy,
};

/// Conveyor Development Server
#[derive(Parser, Debug)]
#[command(name = "cv-dev")]
#[command(about = "Conveyor Development Monolith - embedded broker, REST trigger, logging consumer")]
struct Args {
    /// HTTP port for the REST trigger
    #[arg(long, env = "CV_HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Queue name for product events
    #[arg(long, env = "CV_QUEUE", default_value = "products_queue")]
    queue: String,

    /// Declare the queue durable
    #[arg(long, env = "CV_QUEUE_DURABLE", default_value = "true")]
    durable: bool,

    /// Consumer worker concurrency
    #[arg(long, env = "CV_CONSUMER_CONCURRENCY", default_value = "8")]
    concurrency: u32,

    /// Requeues before a delivery is dead-lettered
    #[arg(long, env = "CV_REDELIVERY_CEILING", default_value = "3")]
    redelivery_ceiling: u32,

    /// Publish confirm timeout in milliseconds
    #[arg(long, env = "CV_CONFIRM_TIMEOUT_MS", default_value = "10000")]
    confirm_timeout_ms: u64,

    /// Consumer drain timeout in milliseconds
    #[arg(long, env = "CV_DRAIN_TIMEOUT_MS", default_value = "30000")]
    drain_timeout_ms: u64,
}

/// Consumer handler for local development: log the event and ack.
struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    async fn handle(&self, event: Event, delivery: &DeliveryContext) -> HandlerOutcome {
        info!(
            product = %event.name,
            action = ?event.action,
            redeliveries = delivery.redelivery_count,
            "received product event"
        );
        HandlerOutcome::Success
    }
}

#[derive(Clone)]
struct AppState {
    publisher: Arc<Publisher>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
        .init();

    let args = Args::parse();
    info!("Starting Conveyor Dev Monolith");
    info!(
        http_port = args.http_port,
        queue = %args.queue,
        "configuration loaded"
    );

    // 1. Embedded broker (stands in for a real AMQP broker locally)
    let broker = MemoryBroker::new();

    // 2. Connect the client core
    let client = Arc::new(
        Client::connect(
            Box::new(broker.clone()),
            BrokerConfig::default(),
            ReconnectPolicy::default(),
        )
        .await?,
    );

    let queue = QueueOptions {
        name: args.queue.clone(),
        durable: args.durable,
    };

    // 3. Publisher behind the REST trigger
    let publisher = Arc::new(client.publisher(
        queue.clone(),
        PublisherConfig {
            confirm_timeout: Duration::from_millis(args.confirm_timeout_ms),
            ..PublisherConfig::default()
        },
    ));

    // 4. Logging consumer
    let consumer = client.consumer(ConsumerOptions {
        concurrency: args.concurrency,
        redelivery_ceiling: args.redelivery_ceiling,
        drain_timeout: Duration::from_millis(args.drain_timeout_ms),
        ..ConsumerOptions::default()
    });
    consumer.start(queue, Arc::new(LoggingHandler)).await?;

    // 5. REST trigger
    let app = Router::new()
        .route("/health", get(health))
        .route("/products/:name", post(add_product))
        .route("/products/:name/:action", post(add_product_with_action))
        .with_state(AppState {
            publisher: publisher.clone(),
        })
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    let listener = TcpListener::bind(("0.0.0.0", args.http_port)).await?;
    info!(port = args.http_port, "REST trigger listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // 6. Teardown: drain the consumer, close the connection
    client.shutdown().await;
    info!("Conveyor Dev Monolith stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn add_product(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    publish(&state, name, EventAction::Created).await
}

async fn add_product_with_action(
    State(state): State<AppState>,
    Path((name, action)): Path<(String, String)>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let action = match action.to_uppercase().as_str() {
        "CREATED" => EventAction::Created,
        "UPDATED" => EventAction::Updated,
        "DELETED" => EventAction::Deleted,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({ "error": format!("unknown action '{other}'") })),
            ))
        }
    };
    publish(&state, name, action).await
}

async fn publish(
    state: &AppState,
    name: String,
    action: EventAction,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match state.publisher.send(Event::new(name, action)).await {
        Ok(receipt) => Ok(Json(serde_json::json!({
            "status": "sent",
            "sequence": receipt.sequence,
        }))),
        Err(e) => {
            error!(error = %e, "publish failed");
            let status = match e {
                ConveyorError::Serialization(_) => StatusCode::BAD_REQUEST,
                ConveyorError::PublishTimeout(_) | ConveyorError::Timeout(_) => {
                    StatusCode::GATEWAY_TIMEOUT
                }
                ConveyorError::BrokerRejected(_) => StatusCode::BAD_GATEWAY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err((status, Json(serde_json::json!({ "error": e.to_string() }))))
        }
    }
}
