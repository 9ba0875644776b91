//! FFmpeg-backed [`EncoderAdapter`]: pulls RTSP-over-TCP and re-muxes to FLV
//! via H.264 (+ AAC, when the upstream has audio) in real time.

use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::codec::{self, Id as CodecId};
use ffmpeg::encoder;
use ffmpeg::format::sample::Type as SampleType;
use ffmpeg::format::{input_with_dictionary, Pixel, Sample};
use ffmpeg::media::Type as MediaType;
use ffmpeg::software::resampling;
use ffmpeg::software::scaling::{Context as ScaleCtx, Flags as ScaleFlags};
use ffmpeg::util::channel_layout::ChannelLayout;
use ffmpeg::util::frame::audio::Audio as AudioFrame;
use ffmpeg::util::frame::video::Video as VideoFrame;
use ffmpeg::util::rational::Rational;
use ffmpeg::{Dictionary, Packet};

use crate::error::RelayError;

use super::mem_io::MemoryMuxer;
use super::{AdapterConfig, EncoderAdapter, EncoderFactory, SinkEvent, StopSignal, PROBE_BUFFER_BYTES};

const AUDIO_RATE: i32 = 44_100;

/// Converts a timestamp from one timebase to another, the way
/// `av_rescale_q` does, using wider-than-`i64` intermediate arithmetic to
/// avoid overflow on the large numerators RTSP clocks can produce.
fn rescale_ts(pts: i64, from: Rational, to: Rational) -> i64 {
    if from == to || pts == 0 {
        return pts;
    }
    let num = from.numerator() as i128 * to.denominator() as i128;
    let den = from.denominator() as i128 * to.numerator() as i128;
    ((pts as i128 * num) / den) as i64
}

pub struct FfmpegEncoderFactory {
    config: AdapterConfig,
}

impl FfmpegEncoderFactory {
    pub fn new(config: AdapterConfig) -> Self {
        Self { config }
    }
}

impl EncoderFactory for FfmpegEncoderFactory {
    fn create(&self) -> Box<dyn EncoderAdapter> {
        Box::new(FfmpegAdapter {
            config: self.config.clone(),
        })
    }
}

struct FfmpegAdapter {
    config: AdapterConfig,
}

impl EncoderAdapter for FfmpegAdapter {
    fn run(
        &mut self,
        url: &str,
        sink: &(dyn Fn(SinkEvent) + Sync),
        stop: StopSignal,
    ) -> Result<(), RelayError> {
        pull_and_transcode(url, &self.config, sink, stop)
    }
}

fn input_options(config: &AdapterConfig) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    opts.set("rtsp_transport", "tcp");
    opts.set("stimeout", &(config.connect_timeout_ms * 1000).to_string());
    opts.set(
        "analyzeduration",
        &(config.analyze_timeout_ms as i64 * 1000).to_string(),
    );
    opts.set("probesize", &PROBE_BUFFER_BYTES.to_string());
    opts
}

struct AudioPipeline {
    decoder: ffmpeg::decoder::audio::Audio,
    encoder: ffmpeg::encoder::audio::Audio,
    resampler: Option<resampling::Context>,
    fifo_left: Vec<f32>,
    fifo_right: Vec<f32>,
    frame_size: usize,
    /// Next output frame's pts, in `audio_tb`. Seeded from and periodically
    /// resynced to the upstream packet timestamps (rescaled via `in_tb`)
    /// rather than free-running from zero, so audio drifts back toward the
    /// real upstream timeline instead of away from it.
    next_pts: i64,
    in_tb: Rational,
    audio_tb: Rational,
    ost_tb: Rational,
    stream_index: usize,
}

fn open_audio_pipeline(
    ictx: &ffmpeg::format::context::Input,
    stream_index: usize,
    octx: &mut ffmpeg::format::context::Output,
    ost_index: usize,
) -> Result<AudioPipeline, String> {
    let stream = ictx.stream(stream_index).unwrap();
    let in_tb = stream.time_base();

    let dec_ctx = codec::context::Context::from_parameters(stream.parameters())
        .map_err(|e| format!("audio decoder context: {e}"))?;
    let decoder = dec_ctx
        .decoder()
        .audio()
        .map_err(|e| format!("open audio decoder: {e}"))?;

    let aac = encoder::find(CodecId::AAC).ok_or_else(|| "AAC encoder not found".to_string())?;
    let audio_tb = Rational::new(1, AUDIO_RATE);

    let mut ost_audio = octx
        .add_stream(aac)
        .map_err(|e| format!("add audio stream: {e}"))?;
    ost_audio.set_time_base(audio_tb);

    let enc_ctx = codec::context::Context::new_with_codec(aac);
    let mut enc = enc_ctx
        .encoder()
        .audio()
        .map_err(|e| format!("create audio encoder context: {e}"))?;
    enc.set_rate(AUDIO_RATE);
    enc.set_ch_layout(ChannelLayout::STEREO);
    enc.set_format(Sample::F32(SampleType::Planar));
    enc.set_bit_rate(128_000);

    let opened = enc
        .open_as_with(aac, Dictionary::new())
        .map_err(|e| format!("open AAC encoder: {e}"))?;

    let frame_size = (opened.frame_size() as usize).max(1024);
    let ost_tb = octx.stream(ost_index).unwrap().time_base();

    unsafe {
        let ret = ffmpeg::ffi::avcodec_parameters_from_context(
            (**(*octx.as_mut_ptr()).streams.add(ost_index)).codecpar,
            opened.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
        );
        if ret < 0 {
            return Err(format!("avcodec_parameters_from_context (audio) failed: {ret}"));
        }
    }

    Ok(AudioPipeline {
        decoder,
        encoder: opened,
        resampler: None,
        fifo_left: Vec::new(),
        fifo_right: Vec::new(),
        frame_size,
        next_pts: i64::MIN,
        in_tb,
        audio_tb,
        ost_tb,
        stream_index,
    })
}

impl AudioPipeline {
    fn push_decoded(&mut self, raw: &AudioFrame) {
        if let Some(pts) = raw.pts() {
            let rescaled = rescale_ts(pts, self.in_tb, self.audio_tb);
            // Only ever move forward: an initial seed when unsynced, and a
            // forward resync if upstream has outrun what we've already
            // scheduled (e.g. after a gap). Never regress an already-issued
            // timestamp.
            if self.next_pts == i64::MIN || rescaled > self.next_pts {
                self.next_pts = rescaled;
            }
        } else if self.next_pts == i64::MIN {
            self.next_pts = 0;
        }

        let target = Sample::F32(SampleType::Planar);
        let channels = raw.ch_layout().channels();
        let needs_resample = raw.format() != target || raw.rate() != AUDIO_RATE as u32 || channels != 2;

        if needs_resample {
            let src_layout = if channels >= 2 {
                raw.ch_layout()
            } else {
                ChannelLayout::MONO
            };
            let rs = self.resampler.get_or_insert_with(|| {
                resampling::Context::get2(
                    raw.format(),
                    src_layout,
                    raw.rate(),
                    target,
                    ChannelLayout::STEREO,
                    AUDIO_RATE as u32,
                )
                .expect("create audio resampler")
            });
            let mut resampled = AudioFrame::empty();
            if rs.run(raw, &mut resampled).is_ok() && resampled.samples() > 0 {
                self.fifo_push(&resampled);
            }
        } else {
            self.fifo_push(raw);
        }
    }

    fn fifo_push(&mut self, frame: &AudioFrame) {
        let n = frame.samples();
        if n == 0 {
            return;
        }
        unsafe {
            let l = frame.data(0);
            self.fifo_left
                .extend_from_slice(std::slice::from_raw_parts(l.as_ptr() as *const f32, n));
            let r = if frame.ch_layout().channels() >= 2 {
                frame.data(1)
            } else {
                frame.data(0)
            };
            self.fifo_right
                .extend_from_slice(std::slice::from_raw_parts(r.as_ptr() as *const f32, n));
        }
    }

    fn drain(&mut self, octx: &mut ffmpeg::format::context::Output) -> Result<(), String> {
        while self.fifo_left.len() >= self.frame_size {
            let n = self.frame_size;
            let mut frame = AudioFrame::new(
                Sample::F32(SampleType::Planar),
                n,
                ChannelLayout::STEREO.into(),
            );
            frame.set_rate(AUDIO_RATE as u32);
            frame.set_pts(Some(self.next_pts));
            unsafe {
                let ldst = std::slice::from_raw_parts_mut(frame.data_mut(0).as_mut_ptr() as *mut f32, n);
                ldst.copy_from_slice(&self.fifo_left[..n]);
                let rdst = std::slice::from_raw_parts_mut(frame.data_mut(1).as_mut_ptr() as *mut f32, n);
                rdst.copy_from_slice(&self.fifo_right[..n]);
            }
            self.fifo_left.drain(..n);
            self.fifo_right.drain(..n);
            self.next_pts += n as i64;

            self.encoder
                .send_frame(&frame)
                .map_err(|e| format!("send audio frame: {e}"))?;
            self.write_packets(octx)?;
        }
        Ok(())
    }

    fn write_packets(&mut self, octx: &mut ffmpeg::format::context::Output) -> Result<(), String> {
        let mut pkt = Packet::empty();
        while self.encoder.receive_packet(&mut pkt).is_ok() {
            pkt.set_stream(self.stream_index);
            pkt.rescale_ts(self.audio_tb, self.ost_tb);
            pkt.write_interleaved(octx)
                .map_err(|e| format!("write audio packet: {e}"))?;
        }
        Ok(())
    }
}

fn pull_and_transcode<'a>(
    url: &str,
    config: &AdapterConfig,
    sink: &'a (dyn Fn(SinkEvent) + Sync),
    stop: StopSignal,
) -> Result<(), RelayError> {
    let opts = input_options(config);
    let mut ictx = input_with_dictionary(url, opts)
        .map_err(|e| RelayError::SourceUnavailable(format!("open upstream: {e}")))?;

    let video_stream_index = ictx
        .streams()
        .best(MediaType::Video)
        .ok_or_else(|| RelayError::SourceUnavailable("no video stream".into()))?
        .index();
    let audio_stream_index = ictx.streams().best(MediaType::Audio).map(|s| s.index());

    let in_video_tb = ictx.stream(video_stream_index).unwrap().time_base();
    let dec_ctx = codec::context::Context::from_parameters(
        ictx.stream(video_stream_index).unwrap().parameters(),
    )
    .map_err(|e| RelayError::SourceUnavailable(format!("video decoder context: {e}")))?;
    let mut video_decoder = dec_ctx
        .decoder()
        .video()
        .map_err(|e| RelayError::SourceUnavailable(format!("open video decoder: {e}")))?;

    let analyze_deadline = Instant::now() + Duration::from_millis(config.analyze_timeout_ms);
    let fps = config.target_fps.max(1);
    let gop = config.gop_size.max(1);
    let frame_tb = Rational::new(1, fps as i32);

    let mut muxer: Option<MemoryMuxer<'a>> = None;
    let mut video_encoder: Option<ffmpeg::encoder::video::Video> = None;
    let mut video_scaler: Option<ScaleCtx> = None;
    let mut audio: Option<AudioPipeline> = None;
    let mut out_frame_idx: i64 = 0;
    let mut last_video_out_pts: i64 = -1;
    let mut ost_video_tb = frame_tb;
    let (mut display_w, mut display_h) = (0u32, 0u32);

    for result in ictx.packets() {
        if stop.is_set() {
            break;
        }
        let (stream, packet) =
            result.map_err(|e| RelayError::EncoderFailure(format!("read packet: {e}")))?;
        let sidx = stream.index();

        if sidx == video_stream_index {
            video_decoder
                .send_packet(&packet)
                .map_err(|e| RelayError::EncoderFailure(format!("send video packet: {e}")))?;

            let mut decoded = VideoFrame::empty();
            while video_decoder.receive_frame(&mut decoded).is_ok() {
                if muxer.is_none() {
                    let params = ictx.stream(video_stream_index).unwrap().parameters();
                    display_w = params.width();
                    display_h = params.height();
                    if display_w == 0 || display_h == 0 {
                        display_w = video_decoder.width();
                        display_h = video_decoder.height();
                    }
                    if display_w == 0 || display_h == 0 {
                        return Err(RelayError::SourceUnavailable(
                            "decoded frame has no usable dimensions".into(),
                        ));
                    }

                    let (m, enc, ost_tb) =
                        open_video_pipeline(display_w, display_h, fps, gop, sink)
                            .map_err(RelayError::SourceUnavailable)?;
                    muxer = Some(m);
                    video_encoder = Some(enc);
                    ost_video_tb = ost_tb;

                    if let Some(asi) = audio_stream_index {
                        let m = muxer.as_mut().unwrap();
                        match open_audio_pipeline(&ictx, asi, m.output(), 1) {
                            Ok(pipeline) => audio = Some(pipeline),
                            Err(e) => {
                                tracing::warn!(error = %e, "audio pipeline unavailable, continuing video-only");
                            }
                        }
                    }

                    muxer
                        .as_mut()
                        .unwrap()
                        .output()
                        .write_header()
                        .map_err(|e| RelayError::SourceUnavailable(format!("write flv header: {e}")))?;
                }

                let sc = video_scaler.get_or_insert_with(|| {
                    ScaleCtx::get(
                        decoded.format(),
                        display_w,
                        display_h,
                        Pixel::YUV420P,
                        display_w,
                        display_h,
                        ScaleFlags::BILINEAR,
                    )
                    .expect("create swscale context")
                });

                let mut yuv = VideoFrame::empty();
                sc.run(&decoded, &mut yuv)
                    .map_err(|e| RelayError::EncoderFailure(format!("scale video frame: {e}")))?;

                // Derive the output pts from the decoded frame's own upstream
                // timestamp rather than a free-running counter, so A/V sync
                // survives even when the real source frame rate drifts from
                // `target_fps`. Clamp to strictly increasing: B-frame
                // reordering or a jittery upstream clock can otherwise hand
                // us a pts that doesn't advance, which the encoder rejects.
                let raw_pts = decoded.pts().unwrap_or(out_frame_idx);
                let rescaled = rescale_ts(raw_pts, in_video_tb, frame_tb);
                let out_pts = if rescaled > last_video_out_pts {
                    rescaled
                } else {
                    last_video_out_pts + 1
                };
                last_video_out_pts = out_pts;
                yuv.set_pts(Some(out_pts));

                let enc = video_encoder.as_mut().unwrap();
                enc.send_frame(&yuv)
                    .map_err(|e| RelayError::EncoderFailure(format!("send video frame: {e}")))?;

                let mut pkt = Packet::empty();
                while enc.receive_packet(&mut pkt).is_ok() {
                    pkt.set_stream(0);
                    pkt.rescale_ts(frame_tb, ost_video_tb);
                    pkt.write_interleaved(muxer.as_mut().unwrap().output())
                        .map_err(|e| RelayError::EncoderFailure(format!("write video packet: {e}")))?;
                }

                out_frame_idx += 1;
            }

            if muxer.is_none() && Instant::now() > analyze_deadline {
                return Err(RelayError::SourceUnavailable(
                    "no decodable video frame within analyze window".into(),
                ));
            }
        } else if Some(sidx) == audio_stream_index {
            if let Some(pipeline) = audio.as_mut() {
                if pipeline.decoder.send_packet(&packet).is_ok() {
                    let mut raw = AudioFrame::empty();
                    while pipeline.decoder.receive_frame(&mut raw).is_ok() {
                        pipeline.push_decoded(&raw);
                    }
                    if let Some(m) = muxer.as_mut() {
                        pipeline
                            .drain(m.output())
                            .map_err(RelayError::EncoderFailure)?;
                    }
                }
            }
        }
    }

    if let Some(enc) = video_encoder.as_mut() {
        let _ = enc.send_eof();
        if let Some(m) = muxer.as_mut() {
            let mut pkt = Packet::empty();
            while enc.receive_packet(&mut pkt).is_ok() {
                pkt.set_stream(0);
                pkt.rescale_ts(frame_tb, ost_video_tb);
                let _ = pkt.write_interleaved(m.output());
            }
        }
    }
    if let (Some(pipeline), Some(m)) = (audio.as_mut(), muxer.as_mut()) {
        let _ = pipeline.encoder.send_eof();
        let _ = pipeline.write_packets(m.output());
    }
    if let Some(m) = muxer.as_mut() {
        let _ = m.output().write_trailer();
    }

    let _ = stop.is_set();
    Ok(())
}

fn open_video_pipeline<'a>(
    width: u32,
    height: u32,
    fps: u32,
    gop: u32,
    sink: &'a (dyn Fn(SinkEvent) + Sync),
) -> Result<(MemoryMuxer<'a>, ffmpeg::encoder::video::Video, Rational), String> {
    let frame_tb = Rational::new(1, fps as i32);

    let mut muxer = MemoryMuxer::new(move |event| sink(event))?;

    let h264 = encoder::find(CodecId::H264).ok_or_else(|| "H.264 encoder not found".to_string())?;
    let mut ost = muxer
        .output()
        .add_stream(h264)
        .map_err(|e| format!("add video stream: {e}"))?;
    ost.set_time_base(frame_tb);

    let enc_ctx = codec::context::Context::new_with_codec(h264);
    let mut enc = enc_ctx
        .encoder()
        .video()
        .map_err(|e| format!("create video encoder context: {e}"))?;
    enc.set_width(width);
    enc.set_height(height);
    enc.set_format(Pixel::YUV420P);
    enc.set_time_base(frame_tb);
    enc.set_frame_rate(Some(Rational::new(fps as i32, 1)));
    enc.set_bit_rate(0);
    enc.set_gop(gop);
    enc.set_max_b_frames(0);

    let mut opts = Dictionary::new();
    opts.set("tune", "zerolatency");
    opts.set("preset", "veryfast");
    opts.set("g", &gop.to_string());
    opts.set("keyint_min", &gop.to_string());
    opts.set("bf", "0");

    let opened = enc
        .open_as_with(h264, opts)
        .map_err(|e| format!("open H.264 encoder: {e}"))?;

    unsafe {
        let ret = ffmpeg::ffi::avcodec_parameters_from_context(
            (**(*muxer.output().as_mut_ptr()).streams.add(0)).codecpar,
            opened.as_ptr() as *mut ffmpeg::ffi::AVCodecContext,
        );
        if ret < 0 {
            return Err(format!("avcodec_parameters_from_context (video) failed: {ret}"));
        }
    }

    let ost_tb = muxer.output().stream(0).unwrap().time_base();
    Ok((muxer, opened, ost_tb))
}

#[allow(dead_code)]
fn _assert_send<T: Send>() {}
const _: fn() = || {
    _assert_send::<FfmpegAdapter>();
};
