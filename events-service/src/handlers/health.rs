use axum::{extract::State, response::Json};
use shared::observability::MetricsSnapshot;
use std::sync::Arc;

use crate::models::HealthStatus;
use crate::AppState;

/// Liveness only; the broker is deliberately not consulted.
///
/// GET /api/events/health
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus { status: true })
}

/// GET /healthz
pub async fn healthz() -> &'static str {
    "ok"
}

/// GET /
pub async fn banner() -> &'static str {
    "events-service OK"
}

/// Counter and gauge snapshot
///
/// GET /api/events/metrics
pub async fn metrics(State(state): State<Arc<AppState>>) -> Json<MetricsSnapshot> {
    Json(state.metrics.snapshot())
}

#[cfg(test)]
mod tests {
    use crate::routes::create_router;
    use crate::test_support::{test_state, TOPICS};
    use axum::body::{to_bytes, Body};
    use axum::http::{Method, Request, StatusCode};
    use pretty_assertions::assert_eq;
    use shared::messaging::InMemoryBroker;
    use tower::ServiceExt;

    async fn get(broker: &InMemoryBroker, path: &str) -> (StatusCode, String) {
        let router = create_router(test_state(broker).await);
        let response = router
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_health_ignores_broker_state() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        for topic in TOPICS {
            broker.set_publish_failure(topic, Some("all brokers down"));
        }

        let (status, body) = get(&broker, "/api/events/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, r#"{"status":true}"#);
    }

    #[tokio::test]
    async fn test_plain_liveness_routes() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);

        assert_eq!(get(&broker, "/healthz").await, (StatusCode::OK, "ok".to_string()));
        assert_eq!(
            get(&broker, "/").await,
            (StatusCode::OK, "events-service OK".to_string())
        );
    }

    #[tokio::test]
    async fn test_health_route_wins_over_event_route() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let router = create_router(test_state(&broker).await);

        let response = router
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/api/events/health")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(broker.records("movie-events").len(), 0);
    }

    #[tokio::test]
    async fn test_metrics_snapshot() {
        let broker = InMemoryBroker::new().with_topics(TOPICS);
        let state = test_state(&broker).await;
        state
            .metrics
            .increment_labeled("events_published_total", "movie");

        let response = create_router(state)
            .oneshot(
                Request::builder()
                    .uri("/api/events/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["counters"]["events_published_total:movie"], 1);
    }
}
