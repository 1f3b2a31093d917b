//! HTTP trigger routing.
//!
//! Every function with HTTP triggers gets a proxy route bound to the union
//! of its triggers' methods. Direct invocations go through a single route
//! that picks the function from the path.

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::{Path, Request, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{on, post, MethodFilter},
    Json,
    Router,
};
use bytes::Bytes;
use serde::Serialize;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, warn};
use uuid::Uuid;

use crate::{
    descriptor::{FunctionKey, HttpMethod},
    error::Error,
    lifecycle::{InvocationLifecycle, InvocationRequest, InvocationResponse},
    registry::LifecycleRegistry,
};

const REQUEST_ID_HEADER: &str = "x-fc-request-id";

mod error_code {
    pub const NOT_FOUND: &str = "NOT_FOUND";
    pub const BAD_REQUEST: &str = "BAD_REQUEST";
}

/// JSON error response body.
#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
    code: &'a str,
}

fn error_response(status: StatusCode, message: &str, code: &str) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: message,
            code,
        }),
    )
        .into_response()
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::ProtocolRejection(_) => StatusCode::FORBIDDEN,
            Error::FunctionNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvokeTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Error::LifecycleTerminated(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::UnsupportedRuntime { .. } |
            Error::MountConfig { .. } |
            Error::Staging { .. } |
            Error::ContainerEngine { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            error!(code = self.code(), "Invocation failed: {:#}", self);
        } else {
            warn!(code = self.code(), "Request rejected: {}", self);
        }
        error_response(status, &self.to_string(), self.code())
    }
}

#[derive(Clone)]
pub struct RouteState {
    pub registry: Arc<LifecycleRegistry>,
}

pub fn proxy_base_path(api_version: &str, key: &FunctionKey) -> String {
    format!("/{}/proxy/{}/{}", api_version, key.service, key.function)
}

pub fn invocation_path(api_version: &str, key: &FunctionKey) -> String {
    format!(
        "/{}/services/{}/functions/{}/invocations",
        api_version, key.service, key.function
    )
}

fn method_filter(method: HttpMethod) -> MethodFilter {
    match method {
        HttpMethod::Get => MethodFilter::GET,
        HttpMethod::Post => MethodFilter::POST,
        HttpMethod::Put => MethodFilter::PUT,
        HttpMethod::Delete => MethodFilter::DELETE,
        HttpMethod::Head => MethodFilter::HEAD,
        HttpMethod::Patch => MethodFilter::PATCH,
        HttpMethod::Options => MethodFilter::OPTIONS,
    }
}

pub fn create_routes(registry: Arc<LifecycleRegistry>, api_version: &str) -> Router {
    let cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_origin(Any)
        .allow_headers(Any)
        .expose_headers(Any);

    let mut router = Router::new();

    for key in registry.keys() {
        let Some(lifecycle) = registry.get(&key) else {
            continue;
        };
        let Some(filter) = lifecycle
            .descriptor()
            .http_methods()
            .into_iter()
            .map(method_filter)
            .reduce(MethodFilter::or)
        else {
            continue;
        };

        let base = proxy_base_path(api_version, &key);
        let handler = {
            let base = base.clone();
            move |request: Request| {
                let lifecycle = lifecycle.clone();
                let base = base.clone();
                async move { proxy(lifecycle, &base, request).await }
            }
        };
        // The catch-all never matches an empty tail, so `{base}/` is its own route.
        router = router
            .route(&base, on(filter, handler.clone()))
            .route(&format!("{base}/"), on(filter, handler.clone()))
            .route(&format!("{base}/{{*path}}"), on(filter, handler));
    }

    router
        .route(
            &format!("/{api_version}/services/{{service}}/functions/{{function}}/invocations"),
            post(invoke_function).with_state(RouteState { registry }),
        )
        .fallback(not_found)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn is_websocket_upgrade(headers: &HeaderMap) -> bool {
    headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
}

async fn proxy(lifecycle: Arc<InvocationLifecycle>, base: &str, request: Request) -> Response {
    if is_websocket_upgrade(request.headers()) {
        return Error::ProtocolRejection("websocket".to_string()).into_response();
    }

    let (parts, body) = request.into_parts();
    let body = match to_bytes(body, usize::MAX).await {
        Ok(body) => body,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                &format!("failed to read request body: {e}"),
                error_code::BAD_REQUEST,
            )
        }
    };

    let path = parts
        .uri
        .path()
        .strip_prefix(base)
        .filter(|rest| !rest.is_empty())
        .unwrap_or("/")
        .to_string();
    let headers = parts
        .headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();

    let invocation = InvocationRequest::Http {
        method: parts.method.as_str().to_string(),
        path,
        query: parts.uri.query().map(str::to_string),
        headers,
        body,
    };

    match lifecycle.invoke(invocation).await {
        Ok(response) => into_http_response(response, parts.method == Method::HEAD),
        Err(e) => e.into_response(),
    }
}

async fn invoke_function(
    State(state): State<RouteState>,
    Path((service, function)): Path<(String, String)>,
    payload: Bytes,
) -> Response {
    let key = FunctionKey::new(service, function);
    let Some(lifecycle) = state.registry.get(&key) else {
        return Error::FunctionNotFound(key.to_string()).into_response();
    };
    match lifecycle.invoke(InvocationRequest::Event { payload }).await {
        Ok(response) => into_http_response(response, false),
        Err(e) => e.into_response(),
    }
}

async fn not_found(request: Request) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        &format!("no route for {} {}", request.method(), request.uri().path()),
        error_code::NOT_FOUND,
    )
}

fn into_http_response(response: InvocationResponse, head: bool) -> Response {
    let status = StatusCode::from_u16(response.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut headers = HeaderMap::new();
    for (name, value) in &response.headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.append(name, value);
            }
            _ => warn!(header = %name, "Dropping invalid response header from function"),
        }
    }
    if let Ok(request_id) = HeaderValue::from_str(&Uuid::new_v4().to_string()) {
        headers.insert(REQUEST_ID_HEADER, request_id);
    }

    let body = if head {
        Body::empty()
    } else {
        Body::from(response.body)
    };
    (status, headers, body).into_response()
}
