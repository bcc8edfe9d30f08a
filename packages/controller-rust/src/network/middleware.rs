//! Transport layers wrapped around every control surface route.
//!
//! Requests get an `x-request-id` (kept if the caller sent one), an INFO
//! trace span carrying it, and a deadline. The id is echoed on the response
//! so operators can match a `POST /shutdown` with the drain logs it caused.

use std::time::Duration;

use axum::body::Body;
use axum::http::header::HeaderName;
use axum::http::{Request, StatusCode};
use axum::Router;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultOnResponse, TraceLayer};
use tracing::{info_span, Level, Span};

/// Header carrying the per-request correlation id.
pub const REQUEST_ID_HEADER: &str = "x-request-id";

fn request_id_header() -> HeaderName {
    HeaderName::from_static(REQUEST_ID_HEADER)
}

fn control_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();
    info_span!(
        "control",
        method = %request.method(),
        path = request.uri().path(),
        request_id,
    )
}

/// Wraps `router` in the control surface layers.
///
/// `Router::layer` makes the last layer the outermost, so requests pass
/// through request-id assignment, request-id propagation, tracing, and
/// finally the timeout. Timed-out responses still carry the id.
pub fn with_control_layers<S>(router: Router<S>, request_timeout: Duration) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
{
    router
        .layer(TimeoutLayer::with_status_code(
            StatusCode::REQUEST_TIMEOUT,
            request_timeout,
        ))
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(control_span)
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(PropagateRequestIdLayer::new(request_id_header()))
        .layer(SetRequestIdLayer::new(request_id_header(), MakeRequestUuid))
}

#[cfg(test)]
mod tests {
    use axum::routing::get;
    use tower::ServiceExt;

    use super::*;

    fn router(request_timeout: Duration) -> Router {
        let routes = Router::new()
            .route("/fast", get(|| async { "ok" }))
            .route(
                "/slow",
                get(|| async {
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    "late"
                }),
            );
        with_control_layers(routes, request_timeout)
    }

    #[tokio::test]
    async fn response_carries_generated_request_id() {
        let response = router(Duration::from_secs(5))
            .oneshot(Request::get("/fast").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let id = response.headers()[REQUEST_ID_HEADER].to_str().unwrap();
        assert!(uuid::Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn caller_request_id_is_kept() {
        let response = router(Duration::from_secs(5))
            .oneshot(
                Request::get("/fast")
                    .header(REQUEST_ID_HEADER, "drain-7")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.headers()[REQUEST_ID_HEADER], "drain-7");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_times_out() {
        let response = router(Duration::from_millis(100))
            .oneshot(Request::get("/slow").body(Body::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::REQUEST_TIMEOUT);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));
    }
}
