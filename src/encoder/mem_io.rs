//! Custom in-memory AVIO sink: captures the FLV muxer's output as discrete
//! Header/Payload chunk events instead of writing to a file.
//!
//! `ffmpeg-the-third` has no safe custom-I/O API, so this wraps
//! `avio_alloc_context` directly and drops to raw
//! `avcodec_parameters_from_context` calls where the safe wrapper has no
//! equivalent.

use std::os::raw::{c_int, c_void};
use std::ptr;

use bytes::Bytes;
use ffmpeg_the_third::ffi;
use ffmpeg_the_third::format::context::Output;

use super::SinkEvent;

const IO_BUFFER_SIZE: usize = 64 * 1024;

/// Reached into through the AVIOContext's opaque pointer by the write
/// callback. The first write after construction is the container header;
/// everything after is a payload chunk — a muxer never rewinds to patch
/// earlier bytes once the header flush has happened.
struct CallbackState<'a> {
    sink: Box<dyn FnMut(SinkEvent) + Send + 'a>,
    header_sent: bool,
}

unsafe extern "C" fn write_packet(opaque: *mut c_void, buf: *const u8, buf_size: c_int) -> c_int {
    if opaque.is_null() || buf.is_null() || buf_size <= 0 {
        return buf_size;
    }
    let state = &mut *(opaque as *mut CallbackState);
    let bytes = Bytes::copy_from_slice(std::slice::from_raw_parts(buf, buf_size as usize));
    if !state.header_sent {
        state.header_sent = true;
        (state.sink)(SinkEvent::Header(bytes));
    } else {
        (state.sink)(SinkEvent::Payload(bytes));
    }
    buf_size
}

/// An `flv` output muxer whose flushed bytes are delivered to a sink as
/// they are produced, rather than written to a file.
pub struct MemoryMuxer<'a> {
    output: Output,
    avio_ctx: *mut ffi::AVIOContext,
    state: *mut CallbackState<'a>,
}

// The AVFormatContext and AVIOContext are only ever touched from the
// adapter's single pull thread; `Send` lets that thread be spawned.
unsafe impl<'a> Send for MemoryMuxer<'a> {}

impl<'a> MemoryMuxer<'a> {
    /// Build an `flv`-muxer output context writing through a custom
    /// AVIOContext whose write callback forwards bytes to `sink`.
    pub fn new(sink: impl FnMut(SinkEvent) + Send + 'a) -> Result<Self, String> {
        unsafe {
            let state = Box::into_raw(Box::new(CallbackState {
                sink: Box::new(sink),
                header_sent: false,
            }));

            let buffer = ffi::av_malloc(IO_BUFFER_SIZE) as *mut u8;
            if buffer.is_null() {
                drop(Box::from_raw(state));
                return Err("av_malloc failed for AVIO buffer".into());
            }

            let avio_ctx = ffi::avio_alloc_context(
                buffer,
                IO_BUFFER_SIZE as c_int,
                1,
                state as *mut c_void,
                None,
                Some(write_packet),
                None,
            );
            if avio_ctx.is_null() {
                ffi::av_free(buffer as *mut c_void);
                drop(Box::from_raw(state));
                return Err("avio_alloc_context failed".into());
            }

            let mut raw_ctx: *mut ffi::AVFormatContext = ptr::null_mut();
            let format_name = std::ffi::CString::new("flv").unwrap();
            let ret = ffi::avformat_alloc_output_context2(
                &mut raw_ctx,
                ptr::null_mut(),
                format_name.as_ptr(),
                ptr::null(),
            );
            if ret < 0 || raw_ctx.is_null() {
                ffi::avio_context_free(&mut (avio_ctx as *mut _));
                drop(Box::from_raw(state));
                return Err(format!("avformat_alloc_output_context2 (flv) failed: {ret}"));
            }

            (*raw_ctx).pb = avio_ctx;
            (*raw_ctx).flags |= ffi::AVFMT_FLAG_CUSTOM_IO as c_int;

            let output = Output::wrap(raw_ctx);

            Ok(Self {
                output,
                avio_ctx,
                state,
            })
        }
    }

    pub fn output(&mut self) -> &mut Output {
        &mut self.output
    }
}

impl<'a> Drop for MemoryMuxer<'a> {
    fn drop(&mut self) {
        unsafe {
            // `self.output`'s own Drop frees the AVFormatContext via
            // avformat_free_context, which leaves a custom-IO `pb` alone —
            // we allocated it outside avio_open, so we free it ourselves.
            let buffer = (*self.avio_ctx).buffer;
            ffi::avio_context_free(&mut self.avio_ctx);
            if !buffer.is_null() {
                ffi::av_free(buffer as *mut c_void);
            }
            drop(Box::from_raw(self.state));
        }
    }
}
