//! FanQ Server - Pub/sub broker with an HTTP admin API
//!
//! Runs an in-process broker, serves the HTTP API and, unless disabled,
//! a log consumer that prints everything published to the configured
//! fanout exchange. Ctrl-C cancels the consumer, closes its connection and
//! exits cleanly.

mod config;
mod log_consumer;

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use fanq_core::{Broker, LocalConnector};
use fanq_storage::MemoryStorage;
use fanq_types::{Binding, Error, Exchange, ExchangeKind, Message, Queue, QueueStats};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::{OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;

use crate::config::ServerConfig;
use crate::log_consumer::LogConsumer;

// ==================== App State ====================

/// Shared application state
#[derive(Clone)]
struct AppState {
    broker: Arc<Broker>,
}

// ==================== Request/Response Types ====================

/// Declare exchange request
#[derive(Debug, Deserialize, ToSchema)]
struct DeclareExchangeRequest {
    /// Name of the exchange
    name: String,
    /// Routing kind (defaults to fanout)
    #[serde(default = "default_kind")]
    kind: ExchangeKind,
}

fn default_kind() -> ExchangeKind {
    ExchangeKind::Fanout
}

/// Exchange together with its bindings
#[derive(Debug, Serialize, ToSchema)]
struct ExchangeDetails {
    exchange: Exchange,
    bindings: Vec<Binding>,
}

/// Declare queue request
#[derive(Debug, Deserialize, ToSchema)]
struct DeclareQueueRequest {
    /// Queue name; generated names are reserved for connections
    name: String,
    /// Single-consumer queue
    #[serde(default)]
    exclusive: bool,
}

/// Bind request
#[derive(Debug, Deserialize, ToSchema)]
struct BindRequest {
    /// Queue to bind
    queue: String,
    /// Binding key, ignored by fanout exchanges
    #[serde(default)]
    routing_key: Option<String>,
}

/// Unbind query parameters
#[derive(Debug, Deserialize, ToSchema)]
struct UnbindQuery {
    #[serde(default)]
    routing_key: Option<String>,
}

/// Publish message request
#[derive(Debug, Deserialize, ToSchema)]
struct PublishRequest {
    /// Message body content
    body: String,
    /// Routing key, used by direct exchanges
    #[serde(default)]
    routing_key: Option<String>,
    /// Content type (e.g., "application/json")
    #[serde(default)]
    content_type: Option<String>,
    /// Custom message attributes
    #[serde(default)]
    attributes: Option<HashMap<String, String>>,
}

/// Publish response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct PublishResponse {
    /// ID of the published message
    message_id: String,
    /// Number of queues that received a copy
    routed_to: usize,
}

/// API Error response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
struct ApiErrorBody {
    /// Error message
    error: String,
    /// Error code
    code: String,
}

/// Purge response
#[derive(Debug, Serialize, ToSchema)]
struct PurgeResponse {
    /// Number of messages purged
    purged: u64,
}

/// Health check response
#[derive(Debug, Serialize, ToSchema)]
struct HealthResponse {
    /// Health status
    status: String,
    /// Server version
    version: String,
}

// ==================== Error Handling ====================

/// Wrapper for FanQ errors to implement IntoResponse
struct AppError(Error);

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError(err)
    }
}

impl AppError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match &self.0 {
            Error::ExchangeNotFound(_) => (StatusCode::NOT_FOUND, "EXCHANGE_NOT_FOUND"),
            Error::QueueNotFound(_) => (StatusCode::NOT_FOUND, "QUEUE_NOT_FOUND"),
            Error::MessageNotFound(_) => (StatusCode::NOT_FOUND, "MESSAGE_NOT_FOUND"),
            Error::ConfigConflict(_) => (StatusCode::CONFLICT, "CONFIG_CONFLICT"),
            Error::QueueAlreadyExists(_) => (StatusCode::CONFLICT, "QUEUE_ALREADY_EXISTS"),
            Error::ExclusivityViolation(_) => (StatusCode::LOCKED, "EXCLUSIVITY_VIOLATION"),
            Error::InvalidName(_) => (StatusCode::BAD_REQUEST, "INVALID_NAME"),
            Error::ConnectionClosed | Error::ConnectionRefused(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, "CONNECTION_UNAVAILABLE")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let (status, code) = self.status_and_code();

        let body = Json(ApiErrorBody {
            error: self.0.to_string(),
            code: code.to_string(),
        });

        (status, body).into_response()
    }
}

// ==================== OpenAPI Documentation ====================

#[derive(OpenApi)]
#[openapi(
    info(
        title = "FanQ API",
        version = "0.1.0",
        description = "FanQ - Fanout Pub/Sub Broker API",
        license(name = "MIT OR Apache-2.0")
    ),
    servers(
        (url = "http://localhost:3000", description = "Local development server")
    ),
    paths(
        health,
        list_exchanges,
        declare_exchange,
        get_exchange,
        delete_exchange,
        bind_queue,
        unbind_queue,
        publish_message,
        list_queues,
        declare_queue,
        get_queue,
        delete_queue,
        get_queue_stats,
        purge_queue,
    ),
    components(
        schemas(
            HealthResponse,
            Exchange,
            ExchangeKind,
            ExchangeDetails,
            Binding,
            Queue,
            QueueStats,
            DeclareExchangeRequest,
            DeclareQueueRequest,
            BindRequest,
            PublishRequest,
            PublishResponse,
            ApiErrorBody,
            PurgeResponse,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "exchanges", description = "Exchange and binding endpoints"),
        (name = "queues", description = "Queue management endpoints")
    )
)]
struct ApiDoc;

// ==================== Handlers ====================

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/health",
    tag = "health",
    responses(
        (status = 200, description = "Server is healthy", body = HealthResponse)
    )
)]
async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// List all exchanges
#[utoipa::path(
    get,
    path = "/api/v1/exchanges",
    tag = "exchanges",
    responses(
        (status = 200, description = "List of all exchanges", body = Vec<Exchange>)
    )
)]
async fn list_exchanges(State(state): State<AppState>) -> Json<Vec<Exchange>> {
    Json(state.broker.list_exchanges())
}

/// Declare an exchange
#[utoipa::path(
    post,
    path = "/api/v1/exchanges",
    tag = "exchanges",
    request_body = DeclareExchangeRequest,
    responses(
        (status = 200, description = "Exchange declared", body = Exchange),
        (status = 409, description = "Exchange exists with another kind", body = ApiErrorBody)
    )
)]
async fn declare_exchange(
    State(state): State<AppState>,
    Json(req): Json<DeclareExchangeRequest>,
) -> Result<Json<Exchange>, AppError> {
    let exchange = state.broker.declare_exchange(&req.name, req.kind)?;
    Ok(Json(exchange))
}

/// Get exchange details and bindings
#[utoipa::path(
    get,
    path = "/api/v1/exchanges/{name}",
    tag = "exchanges",
    params(
        ("name" = String, Path, description = "Exchange name")
    ),
    responses(
        (status = 200, description = "Exchange details", body = ExchangeDetails),
        (status = 404, description = "Exchange not found", body = ApiErrorBody)
    )
)]
async fn get_exchange(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<ExchangeDetails>, AppError> {
    let exchange = state
        .broker
        .get_exchange(&name)
        .ok_or_else(|| Error::ExchangeNotFound(name.clone()))?;
    let bindings = state.broker.bindings(&name)?;

    Ok(Json(ExchangeDetails { exchange, bindings }))
}

/// Delete an exchange
#[utoipa::path(
    delete,
    path = "/api/v1/exchanges/{name}",
    tag = "exchanges",
    params(
        ("name" = String, Path, description = "Exchange name")
    ),
    responses(
        (status = 204, description = "Exchange deleted"),
        (status = 404, description = "Exchange not found", body = ApiErrorBody)
    )
)]
async fn delete_exchange(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.broker.delete_exchange(&name)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Bind a queue to an exchange
#[utoipa::path(
    post,
    path = "/api/v1/exchanges/{name}/bindings",
    tag = "exchanges",
    params(
        ("name" = String, Path, description = "Exchange name")
    ),
    request_body = BindRequest,
    responses(
        (status = 204, description = "Queue bound"),
        (status = 404, description = "Exchange or queue not found", body = ApiErrorBody)
    )
)]
async fn bind_queue(
    State(state): State<AppState>,
    Path(exchange): Path<String>,
    Json(req): Json<BindRequest>,
) -> Result<StatusCode, AppError> {
    let routing_key = req.routing_key.unwrap_or_default();
    state
        .broker
        .bind_with_key(&exchange, &req.queue, &routing_key)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Remove a binding
#[utoipa::path(
    delete,
    path = "/api/v1/exchanges/{name}/bindings/{queue}",
    tag = "exchanges",
    params(
        ("name" = String, Path, description = "Exchange name"),
        ("queue" = String, Path, description = "Queue name"),
        ("routing_key" = Option<String>, Query, description = "Binding key")
    ),
    responses(
        (status = 204, description = "Binding removed (or was absent)")
    )
)]
async fn unbind_queue(
    State(state): State<AppState>,
    Path((exchange, queue)): Path<(String, String)>,
    Query(query): Query<UnbindQuery>,
) -> StatusCode {
    let routing_key = query.routing_key.unwrap_or_default();
    state.broker.unbind_with_key(&exchange, &queue, &routing_key);
    StatusCode::NO_CONTENT
}

/// Publish a message to an exchange
#[utoipa::path(
    post,
    path = "/api/v1/exchanges/{name}/publish",
    tag = "exchanges",
    params(
        ("name" = String, Path, description = "Exchange name")
    ),
    request_body = PublishRequest,
    responses(
        (status = 201, description = "Message published", body = PublishResponse),
        (status = 404, description = "Exchange not found", body = ApiErrorBody)
    )
)]
async fn publish_message(
    State(state): State<AppState>,
    Path(exchange): Path<String>,
    Json(req): Json<PublishRequest>,
) -> Result<(StatusCode, Json<PublishResponse>), AppError> {
    let mut message = Message::new(req.body);

    if let Some(rk) = req.routing_key {
        message = message.with_routing_key(rk);
    }

    if let Some(ct) = req.content_type {
        message = message.with_content_type(ct);
    }

    if let Some(attrs) = req.attributes {
        for (k, v) in attrs {
            message = message.with_attribute(k, v);
        }
    }

    let message_id = message.id.to_string();
    let routed_to = state.broker.publish(&exchange, message).await?;

    Ok((
        StatusCode::CREATED,
        Json(PublishResponse {
            message_id,
            routed_to,
        }),
    ))
}

/// List all queues
#[utoipa::path(
    get,
    path = "/api/v1/queues",
    tag = "queues",
    responses(
        (status = 200, description = "List of all queues", body = Vec<Queue>)
    )
)]
async fn list_queues(State(state): State<AppState>) -> Result<Json<Vec<Queue>>, AppError> {
    let queues = state.broker.list_queues().await?;
    Ok(Json(queues))
}

/// Declare a queue
#[utoipa::path(
    post,
    path = "/api/v1/queues",
    tag = "queues",
    request_body = DeclareQueueRequest,
    responses(
        (status = 200, description = "Queue declared", body = Queue),
        (status = 400, description = "Empty queue name", body = ApiErrorBody),
        (status = 409, description = "Queue exists with other parameters", body = ApiErrorBody)
    )
)]
async fn declare_queue(
    State(state): State<AppState>,
    Json(req): Json<DeclareQueueRequest>,
) -> Result<Json<Queue>, AppError> {
    // Anonymous queues need an owning connection to be reclaimed
    if req.name.is_empty() {
        return Err(Error::InvalidName("queue name must not be empty".into()).into());
    }
    let queue = state.broker.declare_queue(&req.name, req.exclusive).await?;
    Ok(Json(queue))
}

/// Get queue details
#[utoipa::path(
    get,
    path = "/api/v1/queues/{name}",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 200, description = "Queue details", body = Queue),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn get_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Queue>, AppError> {
    let queue = state
        .broker
        .get_queue(&name)
        .await?
        .ok_or_else(|| Error::QueueNotFound(name))?;

    Ok(Json(queue))
}

/// Delete a queue
#[utoipa::path(
    delete,
    path = "/api/v1/queues/{name}",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 204, description = "Queue deleted successfully"),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn delete_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, AppError> {
    state.broker.delete_queue(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Get queue statistics
#[utoipa::path(
    get,
    path = "/api/v1/queues/{name}/stats",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 200, description = "Queue statistics", body = QueueStats),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn get_queue_stats(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<QueueStats>, AppError> {
    let stats = state.broker.get_queue_stats(&name).await?;
    Ok(Json(stats))
}

/// Purge all messages from a queue
#[utoipa::path(
    post,
    path = "/api/v1/queues/{name}/purge",
    tag = "queues",
    params(
        ("name" = String, Path, description = "Queue name")
    ),
    responses(
        (status = 200, description = "Queue purged", body = PurgeResponse),
        (status = 404, description = "Queue not found", body = ApiErrorBody)
    )
)]
async fn purge_queue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<PurgeResponse>, AppError> {
    let count = state.broker.purge_queue(&name).await?;
    Ok(Json(PurgeResponse { purged: count }))
}

// ==================== Router ====================

fn create_router(state: AppState) -> Router {
    Router::new()
        // Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        // Health
        .route("/health", get(health))
        // Exchanges
        .route(
            "/api/v1/exchanges",
            get(list_exchanges).post(declare_exchange),
        )
        .route(
            "/api/v1/exchanges/:name",
            get(get_exchange).delete(delete_exchange),
        )
        .route("/api/v1/exchanges/:name/bindings", post(bind_queue))
        .route(
            "/api/v1/exchanges/:name/bindings/:queue",
            axum::routing::delete(unbind_queue),
        )
        .route("/api/v1/exchanges/:name/publish", post(publish_message))
        // Queues
        .route("/api/v1/queues", get(list_queues).post(declare_queue))
        .route(
            "/api/v1/queues/:name",
            get(get_queue).delete(delete_queue),
        )
        .route("/api/v1/queues/:name/stats", get(get_queue_stats))
        .route("/api/v1/queues/:name/purge", post(purge_queue))
        // Middleware
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ==================== Main ====================

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "fanq=debug,fanq_core=debug,fanq_storage=info,tower_http=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;

    // Create broker with in-memory storage, reachable under the configured host
    let broker = Arc::new(Broker::new(MemoryStorage::new()));
    let connector = LocalConnector::new();
    connector.register(config.host.clone(), Arc::clone(&broker));

    let log_consumer = if config.run_consumer {
        let consumer = LogConsumer::start(&connector, &config.host, &config.exchange).await?;
        info!(exchange = %config.exchange, queue = %consumer.queue(), "Log consumer started");
        println!(" [*] Waiting for logs. To exit press CTRL+C");
        Some(consumer)
    } else {
        None
    };

    let app = create_router(AppState { broker });

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!("FanQ server listening on {}", config.listen_addr);
    info!("Swagger UI: http://{}/swagger-ui/", config.listen_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(consumer) = log_consumer {
        consumer.stop().await?;
    }

    info!("FanQ server stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{header, Request};
    use tower::ServiceExt;

    fn test_app() -> (Router, Arc<Broker>) {
        let broker = Arc::new(Broker::new(MemoryStorage::new()));
        let app = create_router(AppState {
            broker: Arc::clone(&broker),
        });
        (app, broker)
    }

    fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn read_json<T: serde::de::DeserializeOwned>(response: axum::response::Response) -> T {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = test_app();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_publish_fans_out() {
        let (app, broker) = test_app();
        broker.declare_exchange("logs", ExchangeKind::Fanout).unwrap();
        broker.declare_queue("a", false).await.unwrap();
        broker.declare_queue("b", false).await.unwrap();

        for queue in ["a", "b"] {
            let response = app
                .clone()
                .oneshot(json_request(
                    "POST",
                    "/api/v1/exchanges/logs/bindings",
                    serde_json::json!({ "queue": queue }),
                ))
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NO_CONTENT);
        }

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/exchanges/logs/publish",
                serde_json::json!({ "body": "hello" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let published: PublishResponse = read_json(response).await;
        assert_eq!(published.routed_to, 2);
        assert_eq!(broker.get_queue_stats("a").await.unwrap().pending_count, 1);
        assert_eq!(broker.get_queue_stats("b").await.unwrap().pending_count, 1);
    }

    #[tokio::test]
    async fn test_publish_unknown_exchange() {
        let (app, _) = test_app();
        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/exchanges/missing/publish",
                serde_json::json!({ "body": "x" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body: ApiErrorBody = read_json(response).await;
        assert_eq!(body.code, "EXCHANGE_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_declare_exchange_conflict() {
        let (app, _) = test_app();
        let declare = |kind: &str| {
            json_request(
                "POST",
                "/api/v1/exchanges",
                serde_json::json!({ "name": "logs", "kind": kind }),
            )
        };

        let first = app.clone().oneshot(declare("fanout")).await.unwrap();
        assert_eq!(first.status(), StatusCode::OK);

        let again = app.clone().oneshot(declare("fanout")).await.unwrap();
        assert_eq!(again.status(), StatusCode::OK);

        let conflict = app.oneshot(declare("direct")).await.unwrap();
        assert_eq!(conflict.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_declare_queue_requires_name() {
        let (app, broker) = test_app();

        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/api/v1/queues",
                serde_json::json!({ "name": "" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body: ApiErrorBody = read_json(response).await;
        assert_eq!(body.code, "INVALID_NAME");
        assert!(broker.list_queues().await.unwrap().is_empty());

        let response = app
            .oneshot(json_request(
                "POST",
                "/api/v1/queues",
                serde_json::json!({ "name": "audit" }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(broker.get_queue("audit").await.unwrap().is_some());
    }

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::QueueNotFound("q".into()), StatusCode::NOT_FOUND),
            (Error::ConfigConflict("q".into()), StatusCode::CONFLICT),
            (Error::ExclusivityViolation("q".into()), StatusCode::LOCKED),
            (Error::InvalidName("".into()), StatusCode::BAD_REQUEST),
            (Error::ConnectionClosed, StatusCode::SERVICE_UNAVAILABLE),
            (Error::Internal("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(AppError(err).status_and_code().0, status);
        }
    }
}
