//! Live-video relay middleware: pulls each unique RTSP source exactly once,
//! transcodes it to FLV in real time, and fans the encoded bytes out to
//! every attached HTTP viewer.
//!
//! See the [`hub`] module for the process-wide registry that ties the
//! pieces together, and [`web`] for the HTTP front door that exposes it.

pub mod config;
pub mod encoder;
pub mod error;
pub mod fingerprint;
pub mod hub;
pub mod session;
pub mod stream;
pub mod web;
