//! Live code endpoints.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    extract::State,
    http::{header, HeaderName},
    response::{
        sse::{Event, Sse},
        IntoResponse, Json,
    },
};
use futures::stream::Stream;

use super::routes::AppState;
use crate::live::{snapshot, LiveChannel, TotpCode};
use crate::util::now_unix;

/// GET /api/codes - one snapshot of every derivable code.
pub async fn list_codes(State(state): State<Arc<AppState>>) -> Json<Vec<TotpCode>> {
    Json(snapshot(state.store.as_ref(), &state.vault, now_unix()).await)
}

/// GET /api/codes/stream - a snapshot immediately, then one per stream interval.
///
/// The session is verified by the auth middleware before this handler runs. The
/// per-viewer channel lives inside the stream and is torn down when the client goes away.
pub async fn stream_codes(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let channel = LiveChannel::open(
        Arc::clone(&state.store),
        state.vault.clone(),
        state.config.stream_interval,
    );

    (
        [
            (header::CACHE_CONTROL, "no-cache"),
            (HeaderName::from_static("x-accel-buffering"), "no"),
        ],
        Sse::new(code_events(channel)),
    )
}

fn code_events(mut channel: LiveChannel) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        while let Some(codes) = channel.recv().await {
            match Event::default().json_data(&codes) {
                Ok(event) => yield Ok(event),
                Err(e) => tracing::warn!("Failed to encode code snapshot: {}", e),
            }
        }
        channel.close().await;
    }
}
