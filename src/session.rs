//! Per-viewer delivery state.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::RelayError;

/// Why a [`ViewerSession`] transitioned to `Closing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseCause {
    /// The writer observed a client disconnect or write error.
    ClientGone,
    /// The session exceeded the consecutive-drop threshold or the
    /// persistent-unwritability window.
    SlowConsumer,
    /// The owning Stream terminated and closed every session.
    StreamEnded,
}

/// Lifecycle state of a [`ViewerSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Attached, waiting for the Stream's cached ContainerHeader.
    Pending,
    /// Header delivered; receiving the payload chunk suffix.
    Live,
    /// Draining or discarding its queue before the writer closes.
    Closing,
    /// Writer closed, queue drained or discarded.
    Closed,
}

/// Outcome of a non-blocking [`ViewerSession::enqueue`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptPolicy {
    Accepted,
    /// Queue was full; the chunk was discarded for this session only.
    Dropped,
    /// The session is no longer accepting bytes.
    Closed,
}

const UNWRITABLE_GRACE: Duration = Duration::from_secs(5);

/// One per connected HTTP client of a Stream.
///
/// Owns a bounded outbound queue and a writer handle; `enqueue` is called
/// from the Stream's fan-out task and must never block it, so the queue is
/// a plain `VecDeque` behind a `parking_lot::Mutex`-free design: the queue
/// itself lives only here, mutated by `enqueue` (producer, fan-out task)
/// and drained by `pump` (consumer, this session's own task).
pub struct ViewerSession {
    id: Uuid,
    device_id: String,
    capacity: usize,
    inner: parking_lot::Mutex<Inner>,
    last_progress_at: AtomicU64,
    epoch: Instant,
    writer_tx: mpsc::Sender<Bytes>,
}

struct Inner {
    queue: VecDeque<Bytes>,
    state: SessionState,
    consecutive_drops: u32,
}

impl ViewerSession {
    /// Construct a session bound to `writer_tx`, the channel end the HTTP
    /// response body stream reads from.
    pub fn new(device_id: String, capacity: usize, writer_tx: mpsc::Sender<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            id: Uuid::new_v4(),
            device_id,
            capacity,
            inner: parking_lot::Mutex::new(Inner {
                queue: VecDeque::with_capacity(capacity.min(64)),
                state: SessionState::Pending,
                consecutive_drops: 0,
            }),
            last_progress_at: AtomicU64::new(0),
            epoch: Instant::now(),
            writer_tx,
        })
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock().state
    }

    fn touch(&self) {
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        self.last_progress_at.store(elapsed, Ordering::Relaxed);
    }

    /// Milliseconds since this session last made forward progress
    /// (a successful enqueue or writer send).
    pub fn idle_for(&self) -> Duration {
        let last = self.last_progress_at.load(Ordering::Relaxed);
        let elapsed = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(elapsed.saturating_sub(last))
    }

    /// Non-blocking append. Only the Stream's fan-out task calls this.
    pub fn enqueue(&self, bytes: Bytes) -> AcceptPolicy {
        let mut inner = self.inner.lock();
        match inner.state {
            SessionState::Closing | SessionState::Closed => return AcceptPolicy::Closed,
            _ => {}
        }

        if inner.queue.len() >= self.capacity {
            inner.consecutive_drops += 1;
            return AcceptPolicy::Dropped;
        }

        inner.queue.push_back(bytes);
        inner.consecutive_drops = 0;
        drop(inner);
        self.touch();
        AcceptPolicy::Accepted
    }

    /// Consecutive drops since the last accepted chunk, for threshold checks.
    pub fn consecutive_drops(&self) -> u32 {
        self.inner.lock().consecutive_drops
    }

    /// Promote a Pending session to Live. Called by the owning Stream's
    /// fan-out loop, synchronously in the same tick as a successful
    /// ContainerHeader `enqueue`, not after the header is actually written
    /// to the transport — the wire write happens later and independently,
    /// on this session's own `pump` task.
    pub fn mark_live(&self) {
        let mut inner = self.inner.lock();
        if inner.state == SessionState::Pending {
            inner.state = SessionState::Live;
        }
    }

    pub fn is_pending(&self) -> bool {
        self.inner.lock().state == SessionState::Pending
    }

    pub fn is_live(&self) -> bool {
        self.inner.lock().state == SessionState::Live
    }

    pub fn is_closing_or_closed(&self) -> bool {
        matches!(
            self.inner.lock().state,
            SessionState::Closing | SessionState::Closed
        )
    }

    /// Idempotent. Marks Closing, drains or discards the queue per `cause`,
    /// and closes the writer channel.
    pub fn close(&self, cause: CloseCause) {
        let mut inner = self.inner.lock();
        if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        inner.state = SessionState::Closing;

        match cause {
            CloseCause::ClientGone | CloseCause::SlowConsumer => {
                inner.queue.clear();
            }
            CloseCause::StreamEnded => {
                // leave any remaining queued bytes for pump() to flush
            }
        }
        drop(inner);

        tracing::debug!(session = %self.id, ?cause, "session closing");
    }

    /// Background drain loop: moves queued chunks to the writer channel.
    /// Runs until the session is Closed or the writer channel is gone.
    /// Returns the [`CloseCause`] if it observed one, or `None` if it
    /// exited because the queue and state both went quiet cleanly.
    pub async fn pump(self: Arc<Self>) {
        loop {
            let next = {
                let mut inner = self.inner.lock();
                match inner.state {
                    SessionState::Closed => None,
                    _ => inner.queue.pop_front(),
                }
            };

            let Some(chunk) = next else {
                if self.is_closing_or_closed() && self.queue_is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
                if self.idle_for() > UNWRITABLE_GRACE && self.is_live() {
                    tracing::warn!(session = %self.id, "persistent unwritability, closing");
                    self.close(CloseCause::SlowConsumer);
                }
                continue;
            };

            match tokio::time::timeout(UNWRITABLE_GRACE, self.writer_tx.send(chunk)).await {
                Ok(Ok(())) => {
                    self.touch();
                }
                Ok(Err(_)) => {
                    self.close(CloseCause::ClientGone);
                }
                Err(_) => {
                    self.close(CloseCause::SlowConsumer);
                }
            }
        }

        self.inner.lock().state = SessionState::Closed;
        tracing::debug!(session = %self.id, "session closed");
    }

    fn queue_is_empty(&self) -> bool {
        self.inner.lock().queue.is_empty()
    }
}

impl Drop for ViewerSession {
    fn drop(&mut self) {
        // Last-resort safety net mirroring `impl Drop for Stream`: if the
        // last `Arc<ViewerSession>` goes away without `pump()` having run
        // its own close sequence (e.g. the task was aborted rather than
        // exiting its loop), make sure the state is left Closed rather than
        // stuck Pending/Live/Closing for anything still inspecting it.
        let mut inner = self.inner.lock();
        inner.queue.clear();
        inner.state = SessionState::Closed;
    }
}

/// Error returned when a Front Door handler cannot construct a session for
/// a malformed request.
pub fn bad_request(msg: impl Into<String>) -> RelayError {
    RelayError::BadRequest(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(capacity: usize) -> (Arc<ViewerSession>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (ViewerSession::new("device-1".into(), capacity, tx), rx)
    }

    #[test]
    fn enqueue_drops_when_full() {
        let (sess, _rx) = session(2);
        assert_eq!(sess.enqueue(Bytes::from_static(b"a")), AcceptPolicy::Accepted);
        assert_eq!(sess.enqueue(Bytes::from_static(b"b")), AcceptPolicy::Accepted);
        assert_eq!(sess.enqueue(Bytes::from_static(b"c")), AcceptPolicy::Dropped);
        assert_eq!(sess.consecutive_drops(), 1);
    }

    #[test]
    fn enqueue_resets_drop_counter_on_success() {
        let (sess, mut rx) = session(1);
        assert_eq!(sess.enqueue(Bytes::from_static(b"a")), AcceptPolicy::Accepted);
        assert_eq!(sess.enqueue(Bytes::from_static(b"b")), AcceptPolicy::Dropped);
        assert_eq!(sess.consecutive_drops(), 1);

        // Drain the queue by hand (no pump running) to make room, then
        // confirm a fresh accept resets the counter.
        {
            let mut inner = sess.inner.lock();
            inner.queue.pop_front();
        }
        let _ = &mut rx;
        assert_eq!(sess.enqueue(Bytes::from_static(b"c")), AcceptPolicy::Accepted);
        assert_eq!(sess.consecutive_drops(), 0);
    }

    #[test]
    fn close_is_idempotent() {
        let (sess, _rx) = session(4);
        sess.close(CloseCause::ClientGone);
        sess.close(CloseCause::SlowConsumer);
        assert!(sess.is_closing_or_closed());
    }

    #[test]
    fn new_session_starts_pending() {
        let (sess, _rx) = session(4);
        assert!(sess.is_pending());
        assert!(!sess.is_live());
    }

    #[tokio::test]
    async fn pump_delivers_queued_chunks_in_order() {
        let (sess, mut rx) = session(8);
        sess.enqueue(Bytes::from_static(b"H"));
        sess.enqueue(Bytes::from_static(b"P1"));
        sess.close(CloseCause::StreamEnded);

        let handle = tokio::spawn(sess.clone().pump());
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert_eq!(&first[..], b"H");
        assert_eq!(&second[..], b"P1");
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn pump_marks_closed_after_client_gone() {
        let (sess, rx) = session(4);
        sess.enqueue(Bytes::from_static(b"H"));
        drop(rx);
        sess.clone().pump().await;
        assert_eq!(sess.state(), SessionState::Closed);
    }
}
