//! HTTP routes over the handlers in [`place_collab::api`].
//!
//! | Route                        | Method        | Handler        |
//! |------------------------------|---------------|----------------|
//! | `/api/metadata`              | GET           | `metadata`     |
//! | `/api/user`                  | GET           | `user`         |
//! | `/api/update-pixel`          | POST          | `update_pixel` |
//! | `/api/board`                 | GET           | `board`        |
//! | `/api/top-tweets`            | GET           | `top_tweets`   |
//! | `/api/users/{id}/block`      | POST          | `block_user`   |
//! | `/api/users/{id}/unblock`    | POST          | `block_user`   |
//!
//! Every route also answers `OPTIONS` with the CORS preflight.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::{Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;

use place_collab::api::{self, ApiResponse, RequestHeaders, ResponseBody};
use place_collab::{
    BlobStore, ChangeLog, CompactorConfig, CursorStore, ServiceConfig, TweetStore, UserStore,
    WriteCoordinator,
};
use place_core::TimestampMs;

/// Every store seam the server needs from one backend.
pub trait Backend: ChangeLog + BlobStore + CursorStore + UserStore + TweetStore + 'static {}

impl<T> Backend for T where T: ChangeLog + BlobStore + CursorStore + UserStore + TweetStore + 'static {}

/// Shared by all routes.
pub struct AppState<S> {
    pub store: Arc<S>,
    pub coordinator: WriteCoordinator<S>,
    pub service: ServiceConfig,
    pub compactor: CompactorConfig,
}

impl<S: Backend> AppState<S> {
    pub fn new(store: Arc<S>, service: ServiceConfig) -> Self {
        let coordinator =
            WriteCoordinator::new(store.clone(), store.clone(), service.coordinator_config());
        Self {
            compactor: service.compactor_config(),
            store,
            coordinator,
            service,
        }
    }
}

/// [`ApiResponse`] as an axum response.
pub struct HttpResponse(pub ApiResponse);

impl IntoResponse for HttpResponse {
    fn into_response(self) -> Response {
        let content_type = self.0.content_type();
        let ApiResponse {
            status,
            headers,
            body,
        } = self.0;

        let body = match body {
            ResponseBody::Json(value) => Body::from(value.to_string()),
            ResponseBody::Bytes(bytes) => Body::from(bytes),
            ResponseBody::Empty => Body::empty(),
        };
        let mut response = Response::new(body);
        *response.status_mut() =
            StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        let map = response.headers_mut();
        if let Some(content_type) = content_type {
            map.insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
        }
        for (name, value) in headers {
            match (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => log::warn!("Dropping invalid response header {name}"),
            }
        }
        response
    }
}

/// Build the router for `app`.
pub fn router<S: Backend>(app: Arc<AppState<S>>) -> Router {
    Router::new()
        .route("/api/metadata", get(metadata::<S>).options(preflight))
        .route("/api/user", get(user::<S>).options(preflight))
        .route("/api/update-pixel", post(update_pixel::<S>).options(preflight))
        .route("/api/board", get(board::<S>).options(preflight))
        .route("/api/top-tweets", get(top_tweets::<S>).options(preflight))
        .route("/api/users/{id}/block", post(block::<S>).options(preflight))
        .route("/api/users/{id}/unblock", post(unblock::<S>).options(preflight))
        .with_state(app)
}

/// Bind `addr` and serve until the listener fails.
pub async fn serve<S: Backend>(addr: &str, app: Arc<AppState<S>>) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    log::info!("HTTP API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(app)).await
}

fn request_headers(headers: &HeaderMap) -> RequestHeaders {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|value| (name.as_str().to_string(), value.to_string()))
        })
        .collect()
}

fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis() as TimestampMs)
}

async fn preflight(headers: HeaderMap) -> HttpResponse {
    HttpResponse(api::preflight(&request_headers(&headers)))
}

async fn metadata<S: Backend>(
    State(app): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> HttpResponse {
    HttpResponse(api::metadata(&app.service).with_cors(&request_headers(&headers)))
}

async fn user<S: Backend>(
    State(app): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> HttpResponse {
    HttpResponse(api::user(&app.coordinator, &request_headers(&headers), now_ms()).await)
}

async fn update_pixel<S: Backend>(
    State(app): State<Arc<AppState<S>>>,
    headers: HeaderMap,
    body: Bytes,
) -> HttpResponse {
    let headers = request_headers(&headers);
    HttpResponse(api::update_pixel(&app.coordinator, &headers, &body, now_ms()).await)
}

async fn board<S: Backend>(
    State(app): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> HttpResponse {
    let response = api::board(app.store.as_ref(), app.store.as_ref(), &app.compactor);
    HttpResponse(response.with_cors(&request_headers(&headers)))
}

async fn top_tweets<S: Backend>(
    State(app): State<Arc<AppState<S>>>,
    headers: HeaderMap,
) -> HttpResponse {
    HttpResponse(api::top_tweets(app.store.as_ref(), &request_headers(&headers)))
}

async fn block<S: Backend>(
    State(app): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> HttpResponse {
    let headers = request_headers(&headers);
    HttpResponse(api::block_user(&app.coordinator, &headers, &id, true, now_ms()).await)
}

async fn unblock<S: Backend>(
    State(app): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> HttpResponse {
    let headers = request_headers(&headers);
    HttpResponse(api::block_user(&app.coordinator, &headers, &id, false, now_ms()).await)
}
