//! Server-sent events transport
//!
//! One-way mirror of the WebSocket channel for clients behind strict
//! proxies. Same event schema, same hub subscription semantics.

use std::convert::Infallible;

use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use tracing::info;

use crate::AppState;

/// GET /api/events
pub async fn sse_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    info!("SSE subscriber connected");
    let subscription = state.hub.subscribe();

    let stream = futures::stream::unfold(subscription, |mut subscription| async move {
        let event = subscription.recv().await?;
        let sse_event = Event::default()
            .event(event.kind.as_str())
            .json_data(&event)
            .unwrap_or_default();
        Some((Ok(sse_event), subscription))
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

#[cfg(test)]
mod tests {
    use crate::test_support::make_gateway;
    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use tower::ServiceExt;

    #[tokio::test]
    async fn test_sse_content_type() {
        let gateway = make_gateway().await;
        let app = crate::create_router(gateway.state);

        let response = app
            .oneshot(Request::get("/api/events").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response
                .headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap(),
            "text/event-stream"
        );
    }
}
