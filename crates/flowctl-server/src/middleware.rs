// Copyright 2026 Dropbox (created by Andrew Yates <ayates@dropbox.com>)

//! Request-id middleware (spec §11 supplemented feature): every inbound
//! request gets a `request_id`, echoed in the `X-Request-Id` response
//! header and attached to the tracing span so operators can correlate a
//! log line back to the request that produced it.

use axum::extract::Request;
use axum::http::HeaderValue;
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

const HEADER: &str = "x-request-id";

/// Reuse the caller's `X-Request-Id` if present, otherwise mint one.
pub async fn request_id(mut request: Request, next: Next) -> Response {
    let request_id = request
        .headers()
        .get(HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let span = tracing::Span::current();
    span.record("request_id", tracing::field::display(&request_id));
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let mut response = next.run(request).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(HEADER, value);
    }
    response
}

/// Request extension carrying the id assigned by [`request_id`].
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::routing::get;
    use axum::Router;
    use tower::util::ServiceExt;

    #[tokio::test]
    async fn mints_a_request_id_when_none_is_supplied() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(request_id));
        let response = app
            .oneshot(axum::http::Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert!(response.headers().contains_key(HEADER));
    }

    #[tokio::test]
    async fn echoes_a_caller_supplied_request_id() {
        let app = Router::new()
            .route("/", get(|| async { "ok" }))
            .layer(axum::middleware::from_fn(request_id));
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .header(HEADER, "caller-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers().get(HEADER).unwrap(), "caller-123");
    }
}
