use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, OriginalUri, Path, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, delete, get};
use axum::{Json, Router};
use engine::{
    DispatchError, Dispatcher, InboundRequest, ResetOutcome, ResponseBody, TransportResponse,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::request::{client_ip, credentials, header_pairs, parse_body, query_pairs};

type AppState = Arc<Dispatcher>;

/// Reference whose `DELETE {prefix}/reset/:id` is the admin reset. Every
/// other method on `reset/...` still reaches the snippet.
pub const RESET_REFERENCE: &str = "reset";

/// Function routes mounted under every prefix.
pub fn app_router(dispatcher: Arc<Dispatcher>, prefixes: &[String]) -> Router {
    let mut app = Router::new();
    for prefix in prefixes {
        app = app.nest(prefix, fn_routes());
    }
    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(dispatcher)
}

fn fn_routes() -> Router<AppState> {
    Router::new()
        .route("/types", get(types))
        .route("/_stats", get(stats))
        .route("/reset/:id", delete(reset).fallback(invoke_reset_reference))
        .route("/reset/:id/*path", any(invoke_reset_reference))
        .route("/:reference/:name", any(invoke))
        .route("/:reference/:name/*path", any(invoke))
}

/// Failure body shared by every route.
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            message: message.into(),
        }
    }
}

impl From<DispatchError> for ApiError {
    fn from(err: DispatchError) -> Self {
        ApiError::new(err.status(), err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "message": self.message,
            "status_code": self.status.as_u16(),
        });
        (self.status, Json(body)).into_response()
    }
}

async fn types() -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; charset=utf-8")],
        host::TYPE_DECLARATIONS,
    )
}

async fn stats(
    State(dispatcher): State<AppState>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_auth(&dispatcher, &headers, uri.query())?;
    Ok(Json(dispatcher.stats()))
}

async fn reset(
    State(dispatcher): State<AppState>,
    Path(id): Path<String>,
    OriginalUri(uri): OriginalUri,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    require_auth(&dispatcher, &headers, uri.query())?;
    let outcome = dispatcher.reset(&id)?;
    let outcome = match outcome {
        ResetOutcome::Restored => "restored",
        ResetOutcome::Deleted => "deleted",
    };
    Ok(Json(serde_json::json!({ "id": id, "outcome": outcome })))
}

fn require_auth(
    dispatcher: &Dispatcher,
    headers: &HeaderMap,
    query: Option<&str>,
) -> Result<(), ApiError> {
    let credentials = credentials(headers, &query_pairs(query));
    if dispatcher.auth().is_authenticated(&credentials) {
        Ok(())
    } else {
        Err(DispatchError::Unauthorized.into())
    }
}

async fn invoke(
    State(dispatcher): State<AppState>,
    Path(params): Path<BTreeMap<String, String>>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    dispatch(&dispatcher, params, uri, method, peer, headers, body).await
}

/// `reset/:id` routes that are not the admin reset, read as `reference/name`.
async fn invoke_reset_reference(
    State(dispatcher): State<AppState>,
    Path(mut params): Path<BTreeMap<String, String>>,
    OriginalUri(uri): OriginalUri,
    method: Method,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let name = params.remove("id").unwrap_or_default();
    params.insert("reference".to_string(), RESET_REFERENCE.to_string());
    params.insert("name".to_string(), name);
    dispatch(&dispatcher, params, uri, method, peer, headers, body).await
}

async fn dispatch(
    dispatcher: &Dispatcher,
    params: BTreeMap<String, String>,
    uri: axum::http::Uri,
    method: Method,
    peer: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let reference = params.get("reference").cloned().unwrap_or_default();
    let name = params.get("name").cloned().unwrap_or_default();
    let query = query_pairs(uri.query());
    let body = parse_body(&headers, &body).map_err(|err| ApiError::new(400, err.to_string()))?;

    let request = InboundRequest {
        reference,
        name,
        method: method.as_str().to_string(),
        path: uri.path().to_string(),
        url: uri.to_string(),
        credentials: credentials(&headers, &query),
        query,
        headers: header_pairs(&headers),
        params,
        body,
        ip: client_ip(&headers, peer.map(|ConnectInfo(addr)| addr)),
    };

    let response = dispatcher.invoke(request).await?;
    Ok(render(response))
}

fn render(response: TransportResponse) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::OK);
    let mut builder = Response::builder().status(status);
    if let Some(content_type) = &response.content_type {
        builder = builder.header(CONTENT_TYPE, content_type);
    }
    let body = match response.body {
        ResponseBody::Empty => Body::empty(),
        ResponseBody::Bytes(bytes) => Body::from(bytes),
        ResponseBody::Text(text) => Body::from(text),
        ResponseBody::Json(value) => match serde_json::to_vec(&value) {
            Ok(bytes) => Body::from(bytes),
            Err(err) => return ApiError::new(500, err.to_string()).into_response(),
        },
    };
    builder
        .body(body)
        .unwrap_or_else(|err| {
            ApiError::new(500, format!("invalid response: {}", err)).into_response()
        })
}
