//! Encoder Adapter: pulls an upstream source and emits a ContainerHeader
//! followed by an unbounded sequence of PayloadChunks.

mod ffmpeg_adapter;
mod mem_io;

pub use ffmpeg_adapter::FfmpegEncoderFactory;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use bytes::Bytes;

use crate::error::RelayError;

/// One sink emission from the adapter's pull thread.
#[derive(Debug, Clone)]
pub enum SinkEvent {
    /// Emitted exactly once, before any `Payload`.
    Header(Bytes),
    /// Emitted any number of times after the header.
    Payload(Bytes),
}

/// Cooperative stop signal shared between a Stream and its adapter.
#[derive(Clone)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn request(&self) {
        self.0.store(true, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(std::sync::atomic::Ordering::SeqCst)
    }
}

impl Default for StopSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// Implemented by anything that can pull a remote source and transcode it
/// to the wire format the relay serves.
///
/// `run` runs to completion on its own thread; events are delivered to
/// `sink` from that single thread, serialized and never concurrent.
pub trait EncoderAdapter: Send + 'static {
    /// Begin pulling `url` and forwarding `SinkEvent`s to `sink` until
    /// `stop` is observed, the upstream ends, or an unrecoverable error
    /// occurs. Blocking; callers run this on a dedicated thread.
    fn run(
        &mut self,
        url: &str,
        sink: &(dyn Fn(SinkEvent) + Sync),
        stop: StopSignal,
    ) -> Result<(), RelayError>;
}

/// Constructs a fresh [`EncoderAdapter`] per Stream. Exists so tests can
/// inject a fake adapter without touching FFmpeg or the network.
pub trait EncoderFactory: Send + Sync + 'static {
    fn create(&self) -> Box<dyn EncoderAdapter>;
}

/// Tuning the adapter contract requires.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    pub connect_timeout_ms: u64,
    pub read_timeout_ms: u64,
    pub analyze_timeout_ms: u64,
    pub target_fps: u32,
    pub gop_size: u32,
}

impl From<&crate::config::AdapterConfig> for AdapterConfig {
    fn from(c: &crate::config::AdapterConfig) -> Self {
        Self {
            connect_timeout_ms: c.connect_timeout_ms,
            read_timeout_ms: c.read_timeout_ms,
            analyze_timeout_ms: c.analyze_timeout_ms,
            target_fps: c.target_fps,
            gop_size: c.gop_size,
        }
    }
}

/// Probe buffer size for RTSP analysis.
/// Not an exposed config key; it is a fixed part of the adapter contract.
pub const PROBE_BUFFER_BYTES: i32 = 10 * 1024 * 1024;

/// A scriptable [`EncoderAdapter`] for Stream/Hub tests, so tests can
/// construct their own Hub instance without touching FFmpeg. Gated by the
/// `test-util` feature (enabled for this crate's own unit tests and for
/// `tests/integration_test.rs` via the self dev-dependency in Cargo.toml)
/// rather than plain `#[cfg(test)]`, so it is visible from an external test
/// binary too.
#[cfg(any(test, feature = "test-util"))]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    pub struct FakeAdapter {
        pub header: Bytes,
        pub chunks: Vec<Bytes>,
        pub fail_before_header: bool,
    }

    impl EncoderAdapter for FakeAdapter {
        fn run(
            &mut self,
            _url: &str,
            sink: &(dyn Fn(SinkEvent) + Sync),
            stop: StopSignal,
        ) -> Result<(), RelayError> {
            if self.fail_before_header {
                return Err(RelayError::SourceUnavailable("fake: no video frame".into()));
            }
            sink(SinkEvent::Header(self.header.clone()));
            for chunk in &self.chunks {
                if stop.is_set() {
                    return Ok(());
                }
                sink(SinkEvent::Payload(chunk.clone()));
            }
            while !stop.is_set() {
                std::thread::sleep(std::time::Duration::from_millis(5));
            }
            Ok(())
        }
    }

    pub struct FakeFactory {
        pub header: Bytes,
        pub chunks: Vec<Bytes>,
        pub fail_before_header: bool,
        pub invocations: Arc<Mutex<u32>>,
    }

    impl FakeFactory {
        pub fn new(header: &'static [u8], chunks: Vec<&'static [u8]>) -> Self {
            Self {
                header: Bytes::from_static(header),
                chunks: chunks.into_iter().map(Bytes::from_static).collect(),
                fail_before_header: false,
                invocations: Arc::new(Mutex::new(0)),
            }
        }

        pub fn invocation_count(&self) -> u32 {
            *self.invocations.lock().unwrap()
        }
    }

    impl EncoderFactory for FakeFactory {
        fn create(&self) -> Box<dyn EncoderAdapter> {
            *self.invocations.lock().unwrap() += 1;
            Box::new(FakeAdapter {
                header: self.header.clone(),
                chunks: self.chunks.clone(),
                fail_before_header: self.fail_before_header,
            })
        }
    }
}
