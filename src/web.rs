//! HTTP front door: translates `GET /live` into a [`ViewerSession`] and
//! hands it to the [`StreamHub`].

use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::Bytes;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;

use crate::error::RelayError;
use crate::hub::StreamHub;

/// Bound on the writer bridge channel between a session's `pump()` and the
/// HTTP body stream. Not the viewer's backpressure queue (that's
/// `ViewerSession`'s own bounded queue) — this is just the hop from the
/// pump task to the response body.
const WRITER_CHANNEL_CAPACITY: usize = 16;

pub fn router(hub: Arc<StreamHub>) -> Router {
    let max_frame_size = hub.config().relay.max_frame_size;
    Router::new()
        .route("/live", get(live_handler))
        .route("/healthz", get(healthz_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .layer(RequestBodyLimitLayer::new(max_frame_size))
        .with_state(hub)
}

#[derive(Debug, Deserialize)]
struct LiveParams {
    #[serde(rename = "deviceId")]
    device_id: Option<String>,
    #[serde(rename = "rtspUrl")]
    rtsp_url: Option<String>,
}

/// `GET /live?deviceId=<id>&rtspUrl=<url>`.
async fn live_handler(
    State(hub): State<Arc<StreamHub>>,
    Query(params): Query<LiveParams>,
) -> Response {
    let device_id = match non_empty(params.device_id) {
        Some(v) => v,
        None => return bad_request("missing or empty deviceId"),
    };
    let rtsp_url = match non_empty(params.rtsp_url) {
        Some(v) => v,
        None => return bad_request("missing or empty rtspUrl"),
    };
    if url::Url::parse(&rtsp_url).is_err() {
        return bad_request("rtspUrl is not a well-formed URI");
    }

    let (writer_tx, writer_rx) = mpsc::channel::<Bytes>(WRITER_CHANNEL_CAPACITY);

    match hub.attach(&rtsp_url, device_id, writer_tx).await {
        Ok((fingerprint, session)) => {
            let pump_handle = tokio::spawn(Arc::clone(&session).pump());
            tokio::spawn({
                let hub = Arc::clone(&hub);
                let session_id = session.id();
                async move {
                    let _ = pump_handle.await;
                    hub.detach(&fingerprint, session_id);
                }
            });

            let body_stream = ReceiverStream::new(writer_rx).map(Ok::<Bytes, std::io::Error>);
            Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "video/x-flv")
                .header(header::TRANSFER_ENCODING, "chunked")
                .header(header::CACHE_CONTROL, "no-cache")
                .header("pragma", "no-cache")
                .header(header::ACCEPT_RANGES, "bytes")
                .header(header::SERVER, "Video-Stream-Middleware")
                .body(Body::from_stream(body_stream))
                .expect("response with a streamed body is always well-formed")
        }
        Err(err) => err.into_response(),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn bad_request(msg: &str) -> Response {
    RelayError::BadRequest(msg.to_string()).into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn healthz_handler() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Read-only view over the Hub's own counters — operability for the relay
/// itself, not a metrics pipeline for the media it carries.
async fn metrics_handler(State(hub): State<Arc<StreamHub>>) -> Json<crate::hub::HubStats> {
    Json(hub.stats())
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, self.to_string()).into_response()
    }
}
