/*!
    FFmpeg decode context and caller-provided picture buffers.

    When a decoder supports direct rendering, its `get_buffer2` callback is
    replaced so that YUV 4:2:0 pictures are decoded straight into pool
    buffers. Other decoders use FFmpeg's own allocator and their pictures
    are copied into the pool by the video handler. Each AVBufferRef carries a boxed [`BufferHandle`] as opaque
    data and releases it from its free callback, which returns the buffer
    to the pool once FFmpeg and every sink are done with it.
*/

use std::borrow::Cow;
use std::ffi::{c_int, c_void};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use ffmpeg_next::{
    codec::{self, decoder::Opened},
    ffi,
    format::stream::Stream,
    util::frame::{audio::Audio as AudioFrameFFmpeg, video::Video as VideoFrameFFmpeg},
};
use media_types::BufferHandle;
use tracing::{debug, trace, warn};

use crate::backend::{
    BackendError, DecodeContext, DimensionAlign, Frame, FrameAllocator, MediaKind, Packet,
    PictureFormat, PlaneRef, Received,
};

use super::convert::{copy_audio_data, error_from_ffmpeg, sample_format_from_ffmpeg};
use super::{apply_timing, best_effort_timestamp};

enum Output {
    Audio(AudioFrameFFmpeg),
    Video(VideoFrameFFmpeg),
}

/**
    One opened FFmpeg decoder.
*/
pub struct FfmpegDecodeContext {
    // Dropped before `allocator`: the codec context refers to it.
    decoder: Opened,
    output: Output,
    allocator: Option<Box<Arc<dyn FrameAllocator>>>,
}

// SAFETY: the codec context and frames are used from one thread at a time;
// the allocator is Send + Sync.
unsafe impl Send for FfmpegDecodeContext {}

impl FfmpegDecodeContext {
    pub fn open(
        stream: &Stream,
        kind: MediaKind,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Result<Self, BackendError> {
        let parameters = stream.parameters();
        let codec = codec::decoder::find(parameters.id())
            .ok_or_else(|| BackendError::DecoderNotFound(format!("{:?}", parameters.id())))?;
        let mut context = codec::context::Context::from_parameters(parameters)
            .map_err(|e| BackendError::Codec(e.to_string()))?;

        // SAFETY: configuring a codec context that has not been opened yet.
        let supports_direct = unsafe {
            let ptr = context.as_mut_ptr();
            (*ptr).pkt_timebase = stream.time_base().into();
            (*codec.as_ptr()).capabilities & ffi::AV_CODEC_CAP_DR1 as c_int != 0
        };

        let allocator = match allocator {
            Some(allocator) if kind == MediaKind::Video && supports_direct => {
                let allocator = Box::new(allocator);
                // SAFETY: the boxed allocator outlives the codec context, see
                // the field order of FfmpegDecodeContext.
                unsafe {
                    let ptr = context.as_mut_ptr();
                    (*ptr).opaque = &*allocator as *const Arc<dyn FrameAllocator> as *mut c_void;
                    (*ptr).get_buffer2 = Some(get_pool_buffer);
                }
                Some(allocator)
            }
            Some(_) if kind == MediaKind::Video => {
                debug!("decoder does not support direct rendering, pictures will be copied");
                None
            }
            _ => None,
        };

        let decoder = context
            .decoder()
            .open_as(codec)
            .map_err(|e| BackendError::Codec(e.to_string()))?;

        let output = match kind {
            MediaKind::Video => Output::Video(VideoFrameFFmpeg::empty()),
            _ => Output::Audio(AudioFrameFFmpeg::empty()),
        };

        Ok(Self {
            decoder,
            output,
            allocator,
        })
    }

    fn export(&self, frame: &mut Frame) -> Result<(), BackendError> {
        match &self.output {
            Output::Video(decoded) => {
                // SAFETY: the frame was just filled by the decoder.
                let raw = unsafe { decoded.as_ptr() };
                frame.pts = decoded.pts();
                frame.best_effort_timestamp = best_effort_timestamp(raw);

                let buffer = if self.allocator.is_some() {
                    pool_buffer(raw)
                } else {
                    None
                };
                // SAFETY: as above.
                let format = if is_i420(unsafe { (*raw).format }) {
                    PictureFormat::I420
                } else {
                    PictureFormat::Other
                };
                let video = frame.video_mut();
                video.width = decoded.width();
                video.height = decoded.height();
                video.format = format;
                for (i, plane) in video.planes.iter_mut().enumerate() {
                    // SAFETY: as above.
                    let (data, stride) = unsafe { ((*raw).data[i], (*raw).linesize[i]) };
                    *plane = PlaneRef {
                        data: data as *const u8,
                        stride: stride.max(0) as usize,
                    };
                }
                video.buffer = buffer;
            }
            Output::Audio(decoded) => {
                // SAFETY: the frame was just filled by the decoder.
                let raw = unsafe { decoded.as_ptr() };
                frame.pts = decoded.pts();
                frame.best_effort_timestamp = best_effort_timestamp(raw);

                let format = sample_format_from_ffmpeg(decoded.format());
                let audio = frame.audio_mut();
                audio.sample_count = decoded.samples();
                audio.channel_count = decoded.channels() as u32;
                audio.sample_rate = decoded.rate();
                audio.format = format;
                match format {
                    Some(format) => copy_audio_data(decoded, format, &mut audio.samples)?,
                    None => audio.samples.clear(),
                }
            }
        }
        Ok(())
    }
}

impl DecodeContext for FfmpegDecodeContext {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), BackendError> {
        match packet {
            Some(packet) => self.decoder.send_packet(&*outgoing(packet)),
            None => self.decoder.send_eof(),
        }
        .map_err(error_from_ffmpeg)
    }

    fn receive_frame(&mut self, frame: &mut Frame) -> Result<Received, BackendError> {
        let received = match &mut self.output {
            Output::Audio(decoded) => self.decoder.receive_frame(decoded),
            Output::Video(decoded) => self.decoder.receive_frame(decoded),
        };
        match received.map_err(error_from_ffmpeg) {
            Ok(()) => {
                self.export(frame)?;
                Ok(Received::Frame)
            }
            Err(BackendError::Again) => Ok(Received::Again),
            Err(BackendError::Eof) => Ok(Received::Eof),
            Err(e) => Err(e),
        }
    }

    fn reset(&mut self) {
        self.decoder.flush();
    }
}

/**
    The FFmpeg packet to send for `packet`: the demuxed packet itself when
    the container attached one, otherwise a copy of the payload with the
    packet's timing.
*/
fn outgoing(packet: &Packet) -> Cow<'_, ffmpeg_next::Packet> {
    let demuxed = packet
        .native
        .as_deref()
        .and_then(|native| native.downcast_ref::<ffmpeg_next::Packet>());
    if let Some(demuxed) = demuxed {
        return Cow::Borrowed(demuxed);
    }

    let mut rebuilt = if packet.data.is_empty() {
        ffmpeg_next::Packet::empty()
    } else {
        ffmpeg_next::Packet::copy(&packet.data)
    };
    apply_timing(&mut rebuilt, packet);
    Cow::Owned(rebuilt)
}

fn is_i420(format: c_int) -> bool {
    format == ffi::AVPixelFormat::AV_PIX_FMT_YUV420P as c_int
        || format == ffi::AVPixelFormat::AV_PIX_FMT_YUVJ420P as c_int
}

/**
    The pool buffer a decoded picture lives in, if it came from our
    `get_buffer2`.
*/
fn pool_buffer(frame: *const ffi::AVFrame) -> Option<Arc<media_types::I420Buffer>> {
    // SAFETY: pictures in a 4:2:0 format from a decoder with our callback
    // installed were allocated by it, so buf[0]'s opaque is a BufferHandle.
    unsafe {
        if !is_i420((*frame).format) {
            return None;
        }
        let buf = (*frame).buf[0];
        if buf.is_null() {
            return None;
        }
        let opaque = ffi::av_buffer_get_opaque(buf);
        if opaque.is_null() {
            return None;
        }
        Some(Arc::clone(BufferHandle::peek_raw(opaque)))
    }
}

struct ContextAlign(*mut ffi::AVCodecContext);

impl DimensionAlign for ContextAlign {
    fn align_dimensions(&self, width: i32, height: i32) -> (i32, i32) {
        let (mut width, mut height) = (width, height);
        // SAFETY: the context is live for the duration of get_buffer2.
        unsafe { ffi::avcodec_align_dimensions(self.0, &mut width, &mut height) };
        (width, height)
    }
}

unsafe extern "C" fn get_pool_buffer(
    context: *mut ffi::AVCodecContext,
    frame: *mut ffi::AVFrame,
    flags: c_int,
) -> c_int {
    // SAFETY: FFmpeg passes the context we configured and a frame whose
    // format and dimensions are set.
    unsafe {
        if !is_i420((*frame).format) || (*context).opaque.is_null() {
            return ffi::avcodec_default_get_buffer2(context, frame, flags);
        }
        let allocator = &*((*context).opaque as *const Arc<dyn FrameAllocator>);
        let (width, height) = ((*frame).width, (*frame).height);

        let allocated = catch_unwind(AssertUnwindSafe(|| {
            allocator.get_buffer(&ContextAlign(context), width, height)
        }));
        let buffer = match allocated {
            Ok(Ok(buffer)) => buffer,
            Ok(Err(e)) => {
                warn!(width, height, error = %e, "picture allocation failed");
                return ffi::AVERROR(ffi::EINVAL);
            }
            Err(_) => return ffi::AVERROR(ffi::ENOMEM),
        };

        for (i, (data, stride)) in buffer.planes.iter().enumerate() {
            (*frame).data[i] = *data;
            (*frame).linesize[i] = *stride as c_int;
        }
        (*frame).extended_data = (*frame).data.as_mut_ptr();

        let data = (*frame).data[0];
        let size = buffer.size;
        let opaque = buffer.handle.into_raw();
        let buf = ffi::av_buffer_create(data, size, Some(release_pool_buffer), opaque, 0);
        if buf.is_null() {
            BufferHandle::from_raw(opaque).release();
            return ffi::AVERROR(ffi::ENOMEM);
        }
        (*frame).buf[0] = buf;
        trace!(width, height, "decoding into pool buffer");
        0
    }
}

unsafe extern "C" fn release_pool_buffer(opaque: *mut c_void, _data: *mut u8) {
    // SAFETY: opaque was produced by BufferHandle::into_raw in get_pool_buffer
    // and FFmpeg calls this exactly once.
    unsafe { BufferHandle::from_raw(opaque) }.release();
}
