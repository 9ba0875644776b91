//! Per-source fan-out engine: runs one [`crate::encoder::EncoderAdapter`],
//! caches the ContainerHeader, broadcasts payload chunks to every Live
//! viewer, and reaps the Stream once it has sat idle past its grace period.
//!
//! Exactly one task — the fan-out loop spawned in [`Stream::spawn`] — ever
//! touches the viewer set. Every other component reaches it only through
//! the mailbox (`StreamEvent`), which is how the "single mutator"
//! requirement is enforced without a lock around the viewer map itself.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::{mpsc, Notify};
use uuid::Uuid;

use crate::encoder::{EncoderAdapter, EncoderFactory, SinkEvent, StopSignal};
use crate::error::RelayError;
use crate::fingerprint::SourceFingerprint;
use crate::hub::StreamHub;
use crate::session::{AcceptPolicy, CloseCause, ViewerSession};

/// A Live session that drops this many consecutive
/// payload chunks is moved to Closing. Not an exposed config key — it's
/// part of the fan-out algorithm's fixed contract, like the adapter's
/// probe buffer size.
const CONSECUTIVE_DROP_THRESHOLD: u32 = 50;

/// How often the Hub's single process-wide reaper timer ticks every Stream.
pub const REAPER_PERIOD: Duration = Duration::from_secs(10);

/// Bound on the mailbox and the adapter-event bridge channel. Large enough
/// that a burst of attaches or a fast encoder never blocks on it in
/// practice; bounded so a wedged fan-out task can't grow either queue
/// without limit.
const CHANNEL_CAPACITY: usize = 512;

/// Lifecycle state of a [`Stream`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Starting,
    Running,
    Draining,
    Terminated,
}

impl StreamState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => StreamState::Starting,
            1 => StreamState::Running,
            2 => StreamState::Draining,
            _ => StreamState::Terminated,
        }
    }
}

/// Messages delivered to a Stream's fan-out task from outside. This is the
/// only channel through which the viewer set is mutated.
enum StreamEvent {
    Attach(Arc<ViewerSession>),
    Detach(Uuid),
    /// Sent by the Hub's reaper timer; prompts a re-check of `empty_since`
    /// under the fan-out task's own serialization.
    CheckIdle,
    StopRequested,
}

/// One emission bridged over from the adapter's dedicated pull thread.
enum AdapterMsg {
    Event(SinkEvent),
    Exited(Result<(), RelayError>),
}

/// Per-source runtime: the fingerprint, the encoder, the viewer set, and
/// the cached header. Owned by the [`StreamHub`] registry; everything else
/// holds a cheap `Arc<Stream>` handle into it.
pub struct Stream {
    fingerprint: SourceFingerprint,
    source_url: String,
    mailbox: mpsc::Sender<StreamEvent>,
    state: AtomicU8,
    created_at: Instant,
    viewer_count: AtomicUsize,
    total_drops: AtomicU64,
    stop_signal: StopSignal,
    terminated: Notify,
}

impl Stream {
    /// Spawn a fresh Stream for `fingerprint`: an encoder pull thread, a
    /// bridge that forwards its sink calls into the async world, and the
    /// fan-out task that owns the viewer set for this Stream's lifetime.
    ///
    /// Called by [`StreamHub::attach`] while holding the registry guard,
    /// so that fingerprint-collision races resolve to exactly one Stream
    pub fn spawn(
        hub: Arc<StreamHub>,
        fingerprint: SourceFingerprint,
        source_url: String,
        factory: Arc<dyn EncoderFactory>,
        idle_grace: Duration,
    ) -> Arc<Stream> {
        let (mailbox_tx, mailbox_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (adapter_tx, adapter_rx) = mpsc::channel::<AdapterMsg>(CHANNEL_CAPACITY);
        let stop_signal = StopSignal::new();

        let stream = Arc::new(Stream {
            fingerprint: fingerprint.clone(),
            source_url: source_url.clone(),
            mailbox: mailbox_tx,
            state: AtomicU8::new(StreamState::Starting as u8),
            created_at: Instant::now(),
            viewer_count: AtomicUsize::new(0),
            total_drops: AtomicU64::new(0),
            stop_signal: stop_signal.clone(),
            terminated: Notify::new(),
        });

        spawn_encoder_thread(fingerprint, source_url, factory, adapter_tx, stop_signal);

        tokio::spawn(Stream::fan_out_loop(
            Arc::clone(&stream),
            hub,
            mailbox_rx,
            adapter_rx,
            idle_grace,
        ));

        stream
    }

    pub fn fingerprint(&self) -> &SourceFingerprint {
        &self.fingerprint
    }

    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn state(&self) -> StreamState {
        StreamState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn viewer_count(&self) -> usize {
        self.viewer_count.load(Ordering::Relaxed)
    }

    pub fn total_drops(&self) -> u64 {
        self.total_drops.load(Ordering::Relaxed)
    }

    /// Whether a new viewer may be routed to this instance rather than a
    /// fresh one. Read by the Hub under its registry guard.
    pub fn accepts_attach(&self) -> bool {
        matches!(self.state(), StreamState::Starting | StreamState::Running)
    }

    /// Queue an `Attach` event; waits for mailbox capacity, which is only
    /// ever a concern if the fan-out task has fallen badly behind.
    pub async fn attach_session(&self, session: Arc<ViewerSession>) -> Result<(), RelayError> {
        self.mailbox
            .send(StreamEvent::Attach(session))
            .await
            .map_err(|_| RelayError::HubUnavailable)
    }

    /// Non-blocking; safe to call from sync contexts (e.g. a Drop impl).
    pub fn try_detach(&self, session_id: Uuid) {
        let _ = self.mailbox.try_send(StreamEvent::Detach(session_id));
    }

    pub fn try_check_idle(&self) {
        let _ = self.mailbox.try_send(StreamEvent::CheckIdle);
    }

    pub fn try_stop(&self) {
        let _ = self.mailbox.try_send(StreamEvent::StopRequested);
    }

    /// Awaits this Stream's transition to Terminated. Used by
    /// `StreamHub::shutdown` under a bounded wall-clock budget.
    pub async fn wait_terminated(&self) {
        loop {
            if self.state() == StreamState::Terminated {
                return;
            }
            let notified = self.terminated.notified();
            if self.state() == StreamState::Terminated {
                return;
            }
            notified.await;
        }
    }

    fn set_state(&self, state: StreamState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// The fan-out loop: the sole mutator of the viewer set and the sole
    /// caller of `ViewerSession::enqueue` for this Stream.
    async fn fan_out_loop(
        stream: Arc<Stream>,
        hub: Arc<StreamHub>,
        mut mailbox_rx: mpsc::Receiver<StreamEvent>,
        mut adapter_rx: mpsc::Receiver<AdapterMsg>,
        idle_grace: Duration,
    ) {
        let mut viewers: HashMap<Uuid, Arc<ViewerSession>> = HashMap::new();
        let mut header: Option<Bytes> = None;
        let mut empty_since: Option<Instant> = None;
        let mut adapter_exited = false;

        // The Hub's reaper nudges every Stream with `CheckIdle` every
        // `REAPER_PERIOD`, but that period is independent of this Stream's
        // own `idle_grace` (tests and tuned deployments may set a much
        // shorter grace). This self-tick guarantees the idle check below
        // still runs promptly even with no external events and no mailbox
        // traffic at all.
        let mut self_check = tokio::time::interval(
            idle_grace.min(Duration::from_secs(1)).max(Duration::from_millis(10)),
        );
        self_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        'fan_out: loop {
            tokio::select! {
                biased;

                msg = mailbox_rx.recv() => match msg {
                    Some(StreamEvent::Attach(session)) => {
                        if let Some(h) = &header {
                            match session.enqueue(h.clone()) {
                                AcceptPolicy::Accepted => session.mark_live(),
                                AcceptPolicy::Dropped => session.close(CloseCause::SlowConsumer),
                                AcceptPolicy::Closed => {}
                            }
                        }
                        viewers.insert(session.id(), session);
                        empty_since = None;
                    }
                    Some(StreamEvent::Detach(id)) => {
                        if let Some(session) = viewers.remove(&id) {
                            session.close(CloseCause::ClientGone);
                        }
                    }
                    Some(StreamEvent::CheckIdle) => {}
                    Some(StreamEvent::StopRequested) | None => break 'fan_out,
                },

                msg = adapter_rx.recv() => match msg {
                    Some(AdapterMsg::Event(SinkEvent::Header(bytes))) => {
                        header = Some(bytes.clone());
                        if stream.state() == StreamState::Starting {
                            stream.set_state(StreamState::Running);
                        }
                        tracing::info!(fingerprint = %stream.fingerprint, "container header cached");
                        for session in viewers.values() {
                            if session.is_pending() {
                                match session.enqueue(bytes.clone()) {
                                    AcceptPolicy::Accepted => session.mark_live(),
                                    AcceptPolicy::Dropped => session.close(CloseCause::SlowConsumer),
                                    AcceptPolicy::Closed => {}
                                }
                            }
                        }
                    }
                    Some(AdapterMsg::Event(SinkEvent::Payload(bytes))) => {
                        for session in viewers.values() {
                            if session.is_live() {
                                if let AcceptPolicy::Dropped = session.enqueue(bytes.clone()) {
                                    stream.total_drops.fetch_add(1, Ordering::Relaxed);
                                    if session.consecutive_drops() > CONSECUTIVE_DROP_THRESHOLD {
                                        tracing::warn!(
                                            fingerprint = %stream.fingerprint,
                                            "session exceeded drop threshold, closing"
                                        );
                                        session.close(CloseCause::SlowConsumer);
                                    }
                                }
                            }
                        }
                    }
                    Some(AdapterMsg::Exited(result)) => {
                        adapter_exited = true;
                        match result {
                            Ok(()) => tracing::info!(fingerprint = %stream.fingerprint, "upstream ended"),
                            Err(e) => tracing::warn!(fingerprint = %stream.fingerprint, error = %e, "encoder failure"),
                        }
                        break 'fan_out;
                    }
                    None => {
                        adapter_exited = true;
                        break 'fan_out;
                    }
                },

                _ = self_check.tick() => {}
            }

            // Closing/Closed sessions never survive past the tick that
            // observed them.
            viewers.retain(|_, session| !session.is_closing_or_closed());
            stream.viewer_count.store(viewers.len(), Ordering::Relaxed);

            if viewers.is_empty() {
                empty_since.get_or_insert_with(Instant::now);
            } else {
                empty_since = None;
            }

            if let Some(since) = empty_since {
                if since.elapsed() >= idle_grace {
                    tracing::info!(fingerprint = %stream.fingerprint, "idle grace elapsed, draining");
                    break 'fan_out;
                }
            }
        }

        stream.set_state(StreamState::Draining);
        stream.stop_signal.request();
        for session in viewers.drain().map(|(_, s)| s) {
            session.close(CloseCause::StreamEnded);
        }

        if !adapter_exited {
            // The adapter's own stop() budget is 5s; give the bridge
            // a little more room to observe it and forward the exit event.
            let _ = tokio::time::timeout(Duration::from_secs(6), adapter_rx.recv()).await;
        }

        stream.set_state(StreamState::Terminated);
        hub.release(&stream.fingerprint, &stream);
        stream.terminated.notify_waiters();
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Last-resort safety net: if every Arc<Stream> is dropped without
        // the fan-out loop having run its termination sequence (e.g. the
        // Hub itself was torn down first), make sure the adapter thread
        // isn't left pulling forever.
        self.stop_signal.request();
    }
}

/// Runs the adapter on its own OS thread (FFmpeg's blocking pull loop has
/// no async story) and bridges its serialized sink calls into `adapter_tx`
/// via a crossbeam SPSC channel that the fan-out loop reads from.
fn spawn_encoder_thread(
    fingerprint: SourceFingerprint,
    source_url: String,
    factory: Arc<dyn EncoderFactory>,
    adapter_tx: mpsc::Sender<AdapterMsg>,
    stop_signal: StopSignal,
) {
    let name = format!("encoder-{fingerprint}");
    std::thread::Builder::new()
        .name(name)
        .spawn(move || {
            let (sink_tx, sink_rx) = crossbeam_channel::unbounded::<SinkEvent>();

            let bridge_tx = adapter_tx.clone();
            let bridge = std::thread::spawn(move || {
                while let Ok(event) = sink_rx.recv() {
                    if bridge_tx.blocking_send(AdapterMsg::Event(event)).is_err() {
                        break;
                    }
                }
            });

            let mut adapter: Box<dyn EncoderAdapter> = factory.create();
            let sink = move |event: SinkEvent| {
                let _ = sink_tx.send(event);
            };
            let result = adapter.run(&source_url, &sink, stop_signal);
            drop(sink);
            let _ = bridge.join();
            let _ = adapter_tx.blocking_send(AdapterMsg::Exited(result));
        })
        .expect("spawn encoder thread");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::encoder::fake::FakeFactory;
    use std::time::Duration as StdDuration;
    use tokio::sync::mpsc as tmpsc;

    fn test_session() -> (Arc<ViewerSession>, tmpsc::Receiver<Bytes>) {
        let (tx, rx) = tmpsc::channel(64);
        (ViewerSession::new("device".into(), 64, tx), rx)
    }

    async fn wait_until<F: Fn() -> bool>(f: F, timeout: StdDuration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if f() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn header_then_viewers_become_live_in_order() {
        let hub = StreamHub::new(Arc::new(Config::default()));
        let factory = Arc::new(FakeFactory::new(b"HEADER", vec![b"P1", b"P2"]));
        let fp = SourceFingerprint::normalize("rtsp://src/1");

        let stream = Stream::spawn(
            Arc::clone(&hub),
            fp,
            "rtsp://src/1".into(),
            factory,
            StdDuration::from_secs(10),
        );

        let (session, mut rx) = test_session();
        stream.attach_session(Arc::clone(&session)).await.unwrap();
        tokio::spawn(Arc::clone(&session).pump());

        let first = rx.recv().await.unwrap();
        assert_eq!(&first[..], b"HEADER");
        let second = rx.recv().await.unwrap();
        assert_eq!(&second[..], b"P1");
    }

    #[tokio::test]
    async fn one_encoder_invocation_per_stream_lifetime() {
        let hub = StreamHub::new(Arc::new(Config::default()));
        let factory = Arc::new(FakeFactory::new(b"HEADER", vec![b"P1"]));
        let fp = SourceFingerprint::normalize("rtsp://src/shared");

        let stream = Stream::spawn(
            Arc::clone(&hub),
            fp,
            "rtsp://src/shared".into(),
            Arc::clone(&factory),
            StdDuration::from_secs(10),
        );

        let (s1, _r1) = test_session();
        let (s2, _r2) = test_session();
        stream.attach_session(s1).await.unwrap();
        stream.attach_session(s2).await.unwrap();

        assert_eq!(factory.invocation_count(), 1);
    }

    #[tokio::test]
    async fn idle_stream_drains_after_grace_period() {
        let hub = StreamHub::new(Arc::new(Config::default()));
        let factory = Arc::new(FakeFactory::new(b"HEADER", vec![]));
        let fp = SourceFingerprint::normalize("rtsp://src/idle");

        let stream = Stream::spawn(
            Arc::clone(&hub),
            fp,
            "rtsp://src/idle".into(),
            factory,
            StdDuration::from_millis(30),
        );

        let (session, _rx) = test_session();
        stream.attach_session(Arc::clone(&session)).await.unwrap();
        stream.try_detach(session.id());

        let drained = wait_until(
            || stream.state() == StreamState::Terminated,
            StdDuration::from_secs(2),
        )
        .await;
        assert!(drained, "stream should terminate once idle grace elapses");
    }

    #[tokio::test]
    async fn encoder_failure_before_header_terminates_stream() {
        let hub = StreamHub::new(Arc::new(Config::default()));
        let factory = Arc::new(FakeFactory {
            fail_before_header: true,
            ..FakeFactory::new(b"HEADER", vec![])
        });
        let fp = SourceFingerprint::normalize("rtsp://src/bad");

        let stream = Stream::spawn(
            Arc::clone(&hub),
            fp,
            "rtsp://src/bad".into(),
            factory,
            StdDuration::from_secs(10),
        );

        let terminated = wait_until(
            || stream.state() == StreamState::Terminated,
            StdDuration::from_secs(2),
        )
        .await;
        assert!(terminated);
    }
}
