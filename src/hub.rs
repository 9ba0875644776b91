//! Process-wide registry of Streams keyed by [`SourceFingerprint`].
//!
//! The registry itself (`parking_lot::Mutex<HashMap<..>>`, never held
//! across an `.await`) is the only shared mutable state outside of each
//! Stream's own fan-out task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::Config;
use crate::encoder::EncoderFactory;
use crate::error::RelayError;
use crate::fingerprint::SourceFingerprint;
use crate::session::ViewerSession;
use crate::stream::Stream;

/// Bounded global stop budget for [`StreamHub::shutdown`].
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(30);

/// Read-only snapshot surfaced by the introspection endpoints.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct HubStats {
    pub active_streams: usize,
    pub active_viewers: usize,
    pub total_drops: u64,
}

/// The `fingerprint → Stream` registry plus the create/attach/detach/destroy operations.
pub struct StreamHub {
    registry: parking_lot::Mutex<HashMap<SourceFingerprint, Arc<Stream>>>,
    factory: Arc<dyn EncoderFactory>,
    config: Arc<Config>,
    shutting_down: AtomicBool,
}

impl StreamHub {
    pub fn new(config: Arc<Config>) -> Arc<StreamHub> {
        let factory = Arc::new(crate::encoder::FfmpegEncoderFactory::new(
            (&config.relay.adapter).into(),
        ));
        Self::with_factory(config, factory)
    }

    /// Construct with an injected [`EncoderFactory`], so tests never touch
    /// FFmpeg or the network.
    pub fn with_factory(config: Arc<Config>, factory: Arc<dyn EncoderFactory>) -> Arc<StreamHub> {
        Arc::new(StreamHub {
            registry: parking_lot::Mutex::new(HashMap::new()),
            factory,
            config,
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Start the single process-wide reaper timer. Call once, after
    /// construction.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(crate::stream::REAPER_PERIOD);
            loop {
                interval.tick().await;
                let streams: Vec<Arc<Stream>> = hub.registry.lock().values().cloned().collect();
                for stream in streams {
                    stream.try_check_idle();
                }
            }
        });
    }

    /// Construct a [`ViewerSession`] bound to `writer_tx` and attach it to
    /// the Stream for `url`, creating one if none is currently
    /// Starting/Running for that fingerprint.
    pub async fn attach(
        self: &Arc<Self>,
        url: &str,
        device_id: String,
        writer_tx: mpsc::Sender<Bytes>,
    ) -> Result<(SourceFingerprint, Arc<ViewerSession>), RelayError> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(RelayError::HubUnavailable);
        }
        if self.stats().active_viewers >= self.config.relay.max_connections {
            tracing::warn!(
                max_connections = self.config.relay.max_connections,
                "viewer cap reached, rejecting attach"
            );
            return Err(RelayError::AtCapacity);
        }

        let fingerprint = SourceFingerprint::normalize(url);
        let session = ViewerSession::new(
            device_id,
            self.config.relay.session.queue_capacity,
            writer_tx,
        );

        // Single critical section for the create-or-fetch step: this is
        // what makes concurrent first-attach races on the same fingerprint
        // resolve to exactly one Stream.
        let stream = {
            let mut registry = self.registry.lock();
            match registry.get(&fingerprint).filter(|s| s.accepts_attach()) {
                Some(existing) => Arc::clone(existing),
                None => {
                    let fresh = Stream::spawn(
                        Arc::clone(self),
                        fingerprint.clone(),
                        url.to_string(),
                        Arc::clone(&self.factory),
                        Duration::from_secs(self.config.relay.idle_grace_seconds),
                    );
                    registry.insert(fingerprint.clone(), Arc::clone(&fresh));
                    tracing::info!(fingerprint = %fingerprint, "stream started");
                    fresh
                }
            }
        };

        stream.attach_session(Arc::clone(&session)).await?;
        Ok((fingerprint, session))
    }

    /// No-op if no Stream exists for `fingerprint`, or if the session was
    /// already pruned by a prior fan-out tick.
    pub fn detach(&self, fingerprint: &SourceFingerprint, session_id: Uuid) {
        if let Some(stream) = self.registry.lock().get(fingerprint).cloned() {
            stream.try_detach(session_id);
        }
    }

    /// Called by a Stream's fan-out task once it reaches Terminated.
    /// ABA-safe: only removes the entry if it still points at `instance`,
    /// so a Stream that raced a fresh replacement for the same fingerprint
    /// never evicts its successor.
    pub fn release(&self, fingerprint: &SourceFingerprint, instance: &Arc<Stream>) {
        let mut registry = self.registry.lock();
        if let Some(current) = registry.get(fingerprint) {
            if Arc::ptr_eq(current, instance) {
                registry.remove(fingerprint);
                tracing::info!(fingerprint = %fingerprint, "stream removed from registry");
            }
        }
    }

    /// Draining every Stream and awaiting termination within
    /// [`SHUTDOWN_BUDGET`]; any Stream still running past that is
    /// abandoned (its viewers keep whatever bytes they already received).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);

        let streams: Vec<Arc<Stream>> = self.registry.lock().values().cloned().collect();
        for stream in &streams {
            stream.try_stop();
        }

        for stream in streams {
            let fp = stream.fingerprint().clone();
            if tokio::time::timeout(SHUTDOWN_BUDGET, stream.wait_terminated())
                .await
                .is_err()
            {
                tracing::warn!(fingerprint = %fp, "stream exceeded shutdown budget, abandoning");
            }
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn stats(&self) -> HubStats {
        let registry = self.registry.lock();
        let (active_viewers, total_drops) = registry
            .values()
            .fold((0usize, 0u64), |(viewers, drops), stream| {
                (viewers + stream.viewer_count(), drops + stream.total_drops())
            });
        HubStats {
            active_streams: registry.len(),
            active_viewers,
            total_drops,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::fake::FakeFactory;
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc as tmpsc;

    fn hub_with_fake(chunks: Vec<&'static [u8]>) -> (Arc<StreamHub>, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::new(b"HEADER", chunks));
        let hub = StreamHub::with_factory(Arc::new(Config::default()), Arc::clone(&factory) as _);
        (hub, factory)
    }

    #[tokio::test]
    async fn concurrent_first_attach_creates_exactly_one_stream() {
        let (hub, factory) = hub_with_fake(vec![b"P1"]);
        let url = "rtsp://src/race";

        let mut handles = Vec::new();
        for _ in 0..8 {
            let hub = Arc::clone(&hub);
            let url = url.to_string();
            handles.push(tokio::spawn(async move {
                let (tx, _rx) = tmpsc::channel(8);
                hub.attach(&url, "device".into(), tx).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(factory.invocation_count(), 1);
        assert_eq!(hub.stats().active_streams, 1);
    }

    #[tokio::test]
    async fn same_fingerprint_reuses_running_stream() {
        let (hub, factory) = hub_with_fake(vec![b"P1", b"P2"]);
        let url = "rtsp://src/shared";

        let (tx1, _rx1) = tmpsc::channel(8);
        hub.attach(url, "d1".into(), tx1).await.unwrap();
        let (tx2, _rx2) = tmpsc::channel(8);
        hub.attach(url, "d2".into(), tx2).await.unwrap();

        assert_eq!(factory.invocation_count(), 1);
    }

    #[tokio::test]
    async fn shutdown_rejects_new_attaches() {
        let (hub, _factory) = hub_with_fake(vec![]);
        hub.shutdown().await;

        let (tx, _rx) = tmpsc::channel(8);
        let result = hub.attach("rtsp://src/after-shutdown", "d".into(), tx).await;
        assert!(matches!(result, Err(RelayError::HubUnavailable)));
    }

    #[tokio::test]
    async fn release_is_noop_if_registry_no_longer_points_at_instance() {
        let (hub, factory) = hub_with_fake(vec![]);
        let fp = SourceFingerprint::normalize("rtsp://src/aba");

        let stale = Stream::spawn(
            Arc::clone(&hub),
            fp.clone(),
            "rtsp://src/aba".into(),
            Arc::clone(&factory) as Arc<dyn EncoderFactory>,
            StdDuration::from_secs(10),
        );
        let fresh = Stream::spawn(
            Arc::clone(&hub),
            fp.clone(),
            "rtsp://src/aba".into(),
            Arc::clone(&factory) as Arc<dyn EncoderFactory>,
            StdDuration::from_secs(10),
        );
        hub.registry.lock().insert(fp.clone(), Arc::clone(&fresh));

        // A stale Stream instance releasing after a fresh one has already
        // taken its registry slot must not evict the fresh instance.
        hub.release(&fp, &stale);
        assert!(Arc::ptr_eq(hub.registry.lock().get(&fp).unwrap(), &fresh));

        hub.release(&fp, &fresh);
        assert!(hub.registry.lock().get(&fp).is_none());
    }

    #[tokio::test]
    async fn attach_beyond_max_connections_is_rejected() {
        let mut config = Config::default();
        config.relay.max_connections = 1;
        let factory = Arc::new(FakeFactory::new(b"HEADER", vec![]));
        let hub = StreamHub::with_factory(Arc::new(config), factory as Arc<dyn EncoderFactory>);

        let (tx1, _rx1) = tmpsc::channel(8);
        hub.attach("rtsp://src/cap", "d1".into(), tx1).await.unwrap();

        let deadline = std::time::Instant::now() + StdDuration::from_secs(2);
        loop {
            if hub.stats().active_viewers >= 1 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "first viewer never registered");
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }

        let (tx2, _rx2) = tmpsc::channel(8);
        let result = hub.attach("rtsp://src/cap-2", "d2".into(), tx2).await;
        assert!(matches!(result, Err(RelayError::AtCapacity)));
    }

    #[tokio::test]
    async fn detach_on_unknown_fingerprint_is_a_no_op() {
        let (hub, _factory) = hub_with_fake(vec![]);
        hub.detach(&SourceFingerprint::normalize("rtsp://nowhere"), Uuid::new_v4());
    }

    #[tokio::test]
    async fn idle_stream_is_released_from_registry() {
        let mut config = Config::default();
        config.relay.idle_grace_seconds = 0;
        let factory = Arc::new(FakeFactory::new(b"HEADER", vec![]));
        let hub = StreamHub::with_factory(Arc::new(config), factory as Arc<dyn EncoderFactory>);

        let (tx, _rx) = tmpsc::channel(8);
        let (_fp, session) = hub.attach("rtsp://src/idle2", "d".into(), tx).await.unwrap();
        hub.detach(&SourceFingerprint::normalize("rtsp://src/idle2"), session.id());

        let deadline = std::time::Instant::now() + StdDuration::from_secs(2);
        loop {
            if hub.stats().active_streams == 0 {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "stream was never released");
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
    }
}
