//! Request middleware: timing headers, request counting, CORS

use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::State,
    http::{HeaderValue, Request},
    middleware::Next,
    response::Response,
};
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use uuid::Uuid;

use crate::server::state::AppState;

pub const PROCESS_TIME_HEADER: &str = "x-process-time";
pub const REQUEST_COUNT_HEADER: &str = "x-request-count";
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Requests slower than this get a warning
const SLOW_REQUEST: Duration = Duration::from_secs(1);

fn is_health_check(path: &str) -> bool {
    path.ends_with("/health")
}

/// Count the request, time it and tag the response
pub async fn track_requests(
    State(state): State<AppState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let quiet = is_health_check(&path);
    let count = state.record_request();
    let request_id = Uuid::new_v4();
    let start = Instant::now();

    if !quiet {
        tracing::debug!("[{}] {} {}", request_id, method, path);
    }

    let mut response = next.run(request).await;
    let elapsed = start.elapsed();

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&format!("{:.4}", elapsed.as_secs_f64())) {
        headers.insert(PROCESS_TIME_HEADER, value);
    }
    headers.insert(REQUEST_COUNT_HEADER, HeaderValue::from(count));
    if let Ok(value) = HeaderValue::from_str(&request_id.to_string()) {
        headers.insert(REQUEST_ID_HEADER, value);
    }

    if !quiet {
        if elapsed > SLOW_REQUEST {
            tracing::warn!(
                "Slow request: {} {} took {:.2}s",
                method,
                path,
                elapsed.as_secs_f64()
            );
        } else {
            tracing::debug!(
                "[{}] {} {} -> {} in {:?}",
                request_id,
                method,
                path,
                response.status(),
                elapsed
            );
        }
    }

    response
}

/// CORS layer for the configured origins. `*` allows any origin.
pub fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() || origins.iter().any(|o| o.trim() == "*") {
        return layer.allow_origin(Any);
    }

    let allowed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin.trim()) {
            Ok(value) => Some(value),
            Err(_) => {
                tracing::warn!("Ignoring invalid CORS origin: {}", origin);
                None
            }
        })
        .collect();
    layer.allow_origin(AllowOrigin::list(allowed))
}
