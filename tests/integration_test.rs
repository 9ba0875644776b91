//! End-to-end HTTP front door tests: spawns the real axum router backed by
//! a fake [`EncoderAdapter`] on an ephemeral port and drives it with
//! `reqwest`, the way a real viewer would.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::net::TcpListener;

use video_relay::config::Config;
use video_relay::encoder::fake::FakeFactory;
use video_relay::hub::StreamHub;
use video_relay::web::router;

/// Spawns the relay's axum router, backed by an injected fake encoder, on
/// an OS-assigned loopback port.
struct TestServer {
    base_url: String,
    hub: Arc<StreamHub>,
    _handle: tokio::task::JoinHandle<()>,
}

impl TestServer {
    async fn start(factory: Arc<FakeFactory>) -> Result<Self> {
        let hub = StreamHub::with_factory(Arc::new(Config::default()), factory);
        hub.spawn_reaper();

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let app = router(Arc::clone(&hub));

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(TestServer {
            base_url: format!("http://{addr}"),
            hub,
            _handle: handle,
        })
    }

    fn url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }
}

#[tokio::test]
async fn single_viewer_receives_header_then_chunks_in_order() -> Result<()> {
    let factory = Arc::new(FakeFactory::new(b"FLVHEADER", vec![b"chunk1", b"chunk2", b"chunk3"]));
    let server = TestServer::start(factory).await?;

    let response = reqwest::get(server.url("/live?deviceId=c1&rtspUrl=rtsp://src/one")).await?;
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "video/x-flv"
    );
    assert_eq!(response.headers().get("cache-control").unwrap(), "no-cache");
    assert_eq!(
        response.headers().get("server").unwrap(),
        "Video-Stream-Middleware"
    );

    let body = response.bytes().await?;
    assert_eq!(&body[..], b"FLVHEADERchunk1chunk2chunk3");

    Ok(())
}

#[tokio::test]
async fn two_viewers_on_the_same_source_share_one_encoder_invocation() -> Result<()> {
    let factory = Arc::new(FakeFactory::new(b"H", vec![b"P1", b"P2", b"P3", b"P4", b"P5"]));
    let server = TestServer::start(Arc::clone(&factory)).await?;

    let url = server.url("/live?deviceId=viewer-a&rtspUrl=rtsp://src/shared");

    let client = reqwest::Client::new();
    let a = client.get(&url).send();
    let b = client.get(&server.url("/live?deviceId=viewer-b&rtspUrl=rtsp://src/shared")).send();
    let (a, b) = tokio::try_join!(a, b)?;

    assert_eq!(a.status(), reqwest::StatusCode::OK);
    assert_eq!(b.status(), reqwest::StatusCode::OK);

    let body_a = a.bytes().await?;
    let body_b = b.bytes().await?;

    // Both viewers must have received the same ContainerHeader as their
    // first bytes, regardless of how much of the payload suffix each saw.
    assert!(body_a.starts_with(b"H"));
    assert!(body_b.starts_with(b"H"));

    assert_eq!(factory.invocation_count(), 1, "one upstream pull for two viewers");

    Ok(())
}

#[tokio::test]
async fn missing_rtsp_url_is_rejected_before_any_body_byte() -> Result<()> {
    let factory = Arc::new(FakeFactory::new(b"H", vec![]));
    let server = TestServer::start(factory).await?;

    let response = reqwest::get(server.url("/live?deviceId=c1")).await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn malformed_rtsp_url_is_rejected() -> Result<()> {
    let factory = Arc::new(FakeFactory::new(b"H", vec![]));
    let server = TestServer::start(factory).await?;

    let response = reqwest::get(server.url("/live?deviceId=c1&rtspUrl=not-a-uri")).await?;
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    Ok(())
}

#[tokio::test]
async fn healthz_and_metrics_reflect_hub_state() -> Result<()> {
    let factory = Arc::new(FakeFactory::new(b"H", vec![b"P1"]));
    let server = TestServer::start(factory).await?;

    let health: serde_json::Value = reqwest::get(server.url("/healthz")).await?.json().await?;
    assert_eq!(health["status"], "ok");

    // Before any viewer attaches, the hub has no active streams.
    let before: serde_json::Value = reqwest::get(server.url("/metrics")).await?.json().await?;
    assert_eq!(before["active_streams"], 0);

    let _resp = reqwest::get(server.url("/live?deviceId=c1&rtspUrl=rtsp://src/metrics")).await?;
    let after: serde_json::Value = reqwest::get(server.url("/metrics")).await?.json().await?;
    assert!(after["active_streams"].as_u64().unwrap() >= 1);

    Ok(())
}

#[tokio::test]
async fn client_disconnect_releases_the_stream_within_idle_grace() -> Result<()> {
    let mut config = Config::default();
    config.relay.idle_grace_seconds = 0;
    let factory = Arc::new(FakeFactory::new(b"H", vec![]));
    let hub = StreamHub::with_factory(Arc::new(config), factory);
    hub.spawn_reaper();

    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(Arc::clone(&hub));
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    let base = format!("http://{addr}");
    let mut stream = reqwest::get(format!("{base}/live?deviceId=c1&rtspUrl=rtsp://src/gone"))
        .await?
        .bytes_stream();
    // Read whatever arrives, then drop the response body to simulate a
    // client disconnect.
    let _ = stream.next().await;
    drop(stream);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if hub.stats().active_streams == 0 {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "stream was never released");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    Ok(())
}
