use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::value::RawValue;
use shared::messaging::HEADER_CORRELATION_ID;
use shared::observability::metric_names;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

use crate::models::{ApiError, ApiResult, PublishAck};
use crate::AppState;

pub static X_CORRELATION_ID: HeaderName = HeaderName::from_static("x-correlation-id");

const MAX_CORRELATION_ID_LEN: usize = 128;

/// Accept one event and hand it to the producer for its type
///
/// POST /api/events/:event_type
pub async fn publish_event(
    State(state): State<Arc<AppState>>,
    Path(event_type): Path<String>,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let correlation_id = correlation_id(&headers);

    let mut response = match accept(&state, &event_type, &method, &headers, body, &correlation_id)
        .await
    {
        Ok(()) => (StatusCode::CREATED, Json(PublishAck::success())).into_response(),
        Err(err) => {
            if err.is_client_error() {
                let label = state
                    .registry
                    .resolve(&event_type)
                    .map(|(e, _)| e.as_str())
                    .unwrap_or("unknown");
                state
                    .metrics
                    .increment_labeled(metric_names::EVENTS_REJECTED_TOTAL, label);
                debug!(
                    event_type = %event_type,
                    correlation_id = %correlation_id,
                    reason = %err,
                    "Event rejected"
                );
            } else {
                error!(
                    event_type = %event_type,
                    correlation_id = %correlation_id,
                    error = %err,
                    "Event could not be published"
                );
            }
            err.into_response()
        }
    };

    if let Ok(value) = HeaderValue::from_str(&correlation_id) {
        response.headers_mut().insert(X_CORRELATION_ID.clone(), value);
    }
    response
}

async fn accept(
    state: &AppState,
    event_type: &str,
    method: &Method,
    headers: &HeaderMap,
    body: Bytes,
    correlation_id: &str,
) -> ApiResult<()> {
    if method != Method::POST {
        return Err(ApiError::MethodNotAllowed(method.to_string()));
    }
    require_json(headers)?;

    state
        .registry
        .resolve(event_type)
        .map_err(|e| ApiError::UnknownEventType(e.to_string()))?;

    check_payload(&body)?;

    state
        .producers
        .publish(
            event_type,
            body,
            vec![(HEADER_CORRELATION_ID.to_string(), correlation_id.to_string())],
            state.config.publish_timeout(),
        )
        .await?;

    Ok(())
}

/// Only `application/json` and `application/*+json` are accepted.
fn require_json(headers: &HeaderMap) -> ApiResult<()> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::UnsupportedMediaType("missing Content-Type".to_string()))?;

    let mime: mime::Mime = content_type
        .parse()
        .map_err(|_| ApiError::UnsupportedMediaType(content_type.to_string()))?;

    let is_json = mime.type_() == mime::APPLICATION
        && (mime.subtype() == mime::JSON || mime.suffix() == Some(mime::JSON));
    if is_json {
        Ok(())
    } else {
        Err(ApiError::UnsupportedMediaType(content_type.to_string()))
    }
}

/// The body must be exactly one JSON value and not `null`.
///
/// The value is only checked, never decoded, so the bytes reach the broker
/// untouched.
fn check_payload(body: &[u8]) -> ApiResult<()> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Err(ApiError::BadRequest("Request body is empty".to_string()));
    }

    let raw: &RawValue = serde_json::from_slice(body)
        .map_err(|e| ApiError::BadRequest(format!("Malformed JSON: {}", e)))?;

    if raw.get().trim() == "null" {
        return Err(ApiError::BadRequest(
            "Event payload must not be null".to_string(),
        ));
    }

    Ok(())
}

fn correlation_id(headers: &HeaderMap) -> String {
    headers
        .get(&X_CORRELATION_ID)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_CORRELATION_ID_LEN)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ErrorResponse;
    use crate::routes::create_router;
    use crate::test_support::{test_state, test_state_with, TOPICS};
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use futures::StreamExt;
    use pretty_assertions::assert_eq;
    use shared::messaging::{InMemoryBroker, HEADER_CONTENT_TYPE, HEADER_EVENT_TYPE};
    use std::time::Duration;
    use tower::ServiceExt;

    fn post(path: &str, content_type: &str, body: &'static str) -> Request<Body> {
        Request::builder()
            .method(Method::POST)
            .uri(path)
            .header(header::CONTENT_TYPE, content_type)
            .body(Body::from(body))
            .unwrap()
    }

    async fn send(broker: &InMemoryBroker, request: Request<Body>) -> Response {
        let state = test_state(broker).await;
        create_router(state).oneshot(request).await.unwrap()
    }

    async fn error_code(response: Response) -> String {
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let error: ErrorResponse = serde_json::from_slice(&body).unwrap();
        error.error.code
    }

    fn total_records(broker: &InMemoryBroker) -> usize {
        TOPICS.iter().map(|t| broker.records(t).len()).sum()
    }

    #[tokio::test]
    async fn test_accepted_event_is_published_verbatim() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let body = r#"{ "title": "Solaris",  "year": 1972 }"#;

        let response = send(&broker, post("/api/events/movie", "application/json", body)).await;

        assert_eq!(response.status(), StatusCode::CREATED);
        assert!(response.headers().contains_key(&X_CORRELATION_ID));
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let ack: PublishAck = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(ack, PublishAck::success());

        let records = broker.records("movie-events");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value.as_deref(), Some(body.as_bytes()));
        assert_eq!(records[0].key_str(), "movie");
        assert_eq!(records[0].header(HEADER_EVENT_TYPE), Some("movie"));
        assert_eq!(records[0].header(HEADER_CONTENT_TYPE), Some("application/json"));
    }

    #[tokio::test]
    async fn test_any_non_null_json_is_accepted() {
        for body in [r#"{}"#, "[]", "0", r#""text""#, "false", r#"[null]"#] {
            let broker = InMemoryBroker::new().with_topics(TOPICS);
            let response = send(&broker, post("/api/events/user", "application/json", body)).await;

            assert_eq!(response.status(), StatusCode::CREATED, "body {}", body);
            assert_eq!(broker.records("user-events").len(), 1);
        }
    }

    #[tokio::test]
    async fn test_null_payload_is_rejected_without_publishing() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);

        for _ in 0..2 {
            let response = send(
                &broker,
                post("/api/events/payment", "application/json", " null "),
            )
            .await;
            assert_eq!(response.status(), StatusCode::BAD_REQUEST);
            assert_eq!(error_code(response).await, "BAD_REQUEST");
        }

        assert_eq!(total_records(&broker), 0);
    }

    #[tokio::test]
    async fn test_malformed_and_empty_bodies() {
        for body in ["", "   ", "{", r#"{"a":1} {"b":2}"#, "nul"] {
            let broker = InMemoryBroker::new().with_topics(TOPICS);
            let response = send(&broker, post("/api/events/movie", "application/json", body)).await;

            assert_eq!(response.status(), StatusCode::BAD_REQUEST, "body {:?}", body);
            assert_eq!(total_records(&broker), 0);
        }
    }

    #[tokio::test]
    async fn test_content_type_must_be_json() {
        for content_type in ["text/plain", "application/x-www-form-urlencoded", "json"] {
            let broker = InMemoryBroker::new().with_topics(TOPICS);
            let response = send(&broker, post("/api/events/movie", content_type, "{}")).await;
            assert_eq!(
                response.status(),
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "content type {}",
                content_type
            );
        }

        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let response = send(
            &broker,
            post("/api/events/movie", "application/cloudevents+json; charset=utf-8", "{}"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    #[tokio::test]
    async fn test_missing_content_type() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/events/movie")
            .body(Body::from("{}"))
            .unwrap();

        let response = send(&broker, request).await;
        assert_eq!(response.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);
    }

    #[tokio::test]
    async fn test_wrong_method() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let request = Request::builder()
            .method(Method::GET)
            .uri("/api/events/movie")
            .body(Body::empty())
            .unwrap();

        let response = send(&broker, request).await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(error_code(response).await, "METHOD_NOT_ALLOWED");
    }

    #[tokio::test]
    async fn test_unknown_event_type() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let response = send(&broker, post("/api/events/orders", "application/json", "{}")).await;

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(error_code(response).await, "UNKNOWN_EVENT_TYPE");
        assert_eq!(total_records(&broker), 0);
    }

    #[tokio::test]
    async fn test_broker_failure_is_bad_gateway() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        broker.set_publish_failure("movie-events", Some("broker unreachable"));

        let response = send(&broker, post("/api/events/movie", "application/json", "{}")).await;

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(error_code(response).await, "BROKER_UNAVAILABLE");
    }

    #[tokio::test]
    async fn test_correlation_id_is_forwarded_and_echoed() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let mut request = post("/api/events/user", "application/json", r#"{"id":7}"#);
        request
            .headers_mut()
            .insert(X_CORRELATION_ID.clone(), HeaderValue::from_static("req-42"));

        let response = send(&broker, request).await;

        assert_eq!(response.headers().get(&X_CORRELATION_ID).unwrap(), "req-42");
        let records = broker.records("user-events");
        assert_eq!(records[0].header(HEADER_CORRELATION_ID), Some("req-42"));
    }

    #[tokio::test]
    async fn test_oversized_body() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let mut config = crate::config::Config::default();
        config.server.max_body_bytes = 16;
        let router = create_router(test_state_with(&broker, config).await);

        let response = router
            .oneshot(post(
                "/api/events/movie",
                "application/json",
                r#"{"title":"The Good, the Bad and the Ugly"}"#,
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(total_records(&broker), 0);
    }

    #[tokio::test]
    async fn test_stalled_body_times_out() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let mut config = crate::config::Config::default();
        config.server.body_read_timeout_secs = 1;
        let router = create_router(test_state_with(&broker, config).await);

        let stalled = futures::stream::iter([Ok::<_, std::io::Error>(Bytes::from_static(
            b"{\"title\":",
        ))])
        .chain(futures::stream::pending());
        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/events/movie")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from_stream(stalled))
            .unwrap();

        let response = tokio::time::timeout(Duration::from_secs(5), router.oneshot(request))
            .await
            .expect("body read was never cut off")
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(total_records(&broker), 0);
    }

    #[test]
    fn test_check_payload_is_stateless() {
        let first = check_payload(b"{\"a\":").unwrap_err();
        let second = check_payload(b"{\"a\":").unwrap_err();
        assert_eq!(first.status_code(), second.status_code());
        assert_eq!(first.error_code(), second.error_code());
    }
}
