/*!
    Backend over the FFmpeg libraries, via ffmpeg-next.
*/

mod convert;
mod decode;

use std::ffi::CString;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use ffmpeg_next::{
    codec, ffi,
    format::{context::Input as InputContext, stream::Stream},
    packet::Mut as PacketMut,
};
use tracing::{debug, warn};

use crate::backend::{
    Backend, BackendError, CodecDescription, Container, DecodeContext, FrameAllocator, MediaKind,
    Packet, ProbedStream,
};

use self::convert::{
    media_kind_from_ffmpeg, media_kind_to_ffmpeg, pixel_format_name, rational_from_ffmpeg,
    timestamp_from_ffmpeg,
};
use self::decode::FfmpegDecodeContext;

/**
    Opens containers with libavformat.
*/
#[derive(Clone, Copy, Debug, Default)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for FfmpegBackend {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    fn open_container(&self, path: &Path) -> Result<Box<dyn Container>, BackendError> {
        ffmpeg_next::init().map_err(|e| BackendError::Open(e.to_string()))?;
        Ok(Box::new(FfmpegContainer::open(path)?))
    }
}

/**
    An opened input with its streams probed.
*/
pub struct FfmpegContainer {
    input: InputContext,
    streams: Vec<ProbedStream>,
}

// SAFETY: the format context is only ever used from one thread at a time;
// the container moves to the worker thread as a whole.
unsafe impl Send for FfmpegContainer {}

impl FfmpegContainer {
    /**
        Open the input and read its stream information.

        Opening and stream discovery are done as separate steps so their
        failures can be told apart.
    */
    pub fn open(path: &Path) -> Result<Self, BackendError> {
        let url = path
            .to_str()
            .and_then(|s| CString::new(s).ok())
            .ok_or_else(|| BackendError::Open(format!("unsupported path {}", path.display())))?;

        // SAFETY: on failure avformat_open_input frees the context and nulls
        // the pointer; on success ownership passes to `InputContext`.
        let input = unsafe {
            let mut ctx: *mut ffi::AVFormatContext = ptr::null_mut();
            let ret = ffi::avformat_open_input(&mut ctx, url.as_ptr(), ptr::null(), ptr::null_mut());
            if ret < 0 {
                return Err(BackendError::Open(ffmpeg_next::Error::from(ret).to_string()));
            }
            let ret = ffi::avformat_find_stream_info(ctx, ptr::null_mut());
            if ret < 0 {
                ffi::avformat_close_input(&mut ctx);
                return Err(BackendError::StreamInfo(
                    ffmpeg_next::Error::from(ret).to_string(),
                ));
            }
            InputContext::wrap(ctx)
        };

        let streams = input.streams().map(|stream| probe_stream(&stream)).collect();
        Ok(Self { input, streams })
    }
}

impl Container for FfmpegContainer {
    fn duration_us(&self) -> u64 {
        self.input.duration().max(0) as u64
    }

    fn bitrate(&self) -> u64 {
        // SAFETY: reading a plain field of a live format context.
        unsafe { (*self.input.as_ptr()).bit_rate.max(0) as u64 }
    }

    fn streams(&self) -> &[ProbedStream] {
        &self.streams
    }

    fn best_stream(&self, kind: MediaKind) -> Option<usize> {
        let medium = media_kind_to_ffmpeg(kind)?;
        self.input.streams().best(medium).map(|stream| stream.index())
    }

    fn read_packet(&mut self, packet: &mut Packet) -> Result<bool, BackendError> {
        let reused = packet
            .native
            .take()
            .and_then(|native| native.downcast::<ffmpeg_next::Packet>().ok());
        let mut demuxed = reused.unwrap_or_else(|| Box::new(ffmpeg_next::Packet::empty()));
        // SAFETY: the packet is ours; its previous payload is no longer used.
        unsafe { ffi::av_packet_unref(demuxed.as_mut_ptr()) };
        let read = demuxed.read(&mut self.input);

        // The payload stays in the demuxed packet, sent to the decoder as is.
        packet.stream_index = demuxed.stream();
        packet.pts = demuxed.pts();
        packet.dts = demuxed.dts();
        packet.duration = demuxed.duration();
        packet.is_key = demuxed.is_key();
        packet.data.clear();
        packet.native = Some(demuxed);

        match read {
            Ok(()) => Ok(true),
            Err(ffmpeg_next::Error::Eof) => Ok(false),
            Err(e) => Err(BackendError::Read(e.to_string())),
        }
    }

    fn rewind(&mut self) -> Result<(), BackendError> {
        self.input
            .seek(0, ..0)
            .map_err(|e| BackendError::Seek(e.to_string()))
    }

    fn open_decoder(
        &mut self,
        stream_index: usize,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Result<Box<dyn DecodeContext>, BackendError> {
        let stream = self
            .input
            .stream(stream_index)
            .ok_or_else(|| BackendError::Codec(format!("no stream {}", stream_index)))?;
        let kind = media_kind_from_ffmpeg(stream.parameters().medium());
        let context = FfmpegDecodeContext::open(&stream, kind, allocator)?;
        debug!(stream_index, %kind, "opened ffmpeg decoder");
        Ok(Box::new(context))
    }
}

/**
    Gather the metadata of one stream from its codec parameters.
*/
fn probe_stream(stream: &Stream) -> ProbedStream {
    let parameters = stream.parameters();
    let kind = media_kind_from_ffmpeg(parameters.medium());
    let mut probed = ProbedStream::new(stream.index(), kind);
    probed.time_base = rational_from_ffmpeg(stream.time_base());
    probed.frame_rate = rational_from_ffmpeg(stream.rate());

    probed.decoder = codec::decoder::find(parameters.id()).map(|codec| CodecDescription {
        name: codec.name().to_string(),
        long_name: codec.description().to_string(),
    });
    if probed.decoder.is_none() && kind != MediaKind::Other {
        warn!(
            stream_index = stream.index(),
            codec = ?parameters.id(),
            "no decoder found"
        );
    }

    // SAFETY: reading plain fields of codec parameters owned by the stream.
    unsafe {
        let ptr = parameters.as_ptr();
        probed.bitrate = (*ptr).bit_rate.max(0) as u64;
        probed.width = (*ptr).width.max(0) as u32;
        probed.height = (*ptr).height.max(0) as u32;
        probed.sample_rate = (*ptr).sample_rate.max(0) as u32;
        probed.channels = (*ptr).ch_layout.nb_channels.max(0) as u32;
    }

    if kind == MediaKind::Video {
        probed.pixel_format_name = codec::context::Context::from_parameters(stream.parameters())
            .ok()
            // SAFETY: reading the pixel format of a live codec context.
            .and_then(|ctx| pixel_format_name(unsafe { (*ctx.as_ptr()).pix_fmt }));
    }

    probed
}

/**
    Copy timing fields onto an FFmpeg packet built from a [`Packet`] that
    carries no demuxed packet of its own.
*/
fn apply_timing(target: &mut ffmpeg_next::Packet, packet: &Packet) {
    // SAFETY: writing plain fields of a packet we own.
    unsafe {
        let ptr = target.as_mut_ptr();
        (*ptr).pts = packet.pts.unwrap_or(ffi::AV_NOPTS_VALUE);
        (*ptr).dts = packet.dts.unwrap_or(ffi::AV_NOPTS_VALUE);
        (*ptr).duration = packet.duration;
        if packet.is_key {
            (*ptr).flags |= ffi::AV_PKT_FLAG_KEY as i32;
        }
    }
}

/**
    Best-effort timestamp of a decoded frame, if set.
*/
fn best_effort_timestamp(frame: *const ffi::AVFrame) -> Option<i64> {
    // SAFETY: callers pass a frame that was just filled by the decoder.
    timestamp_from_ffmpeg(unsafe { (*frame).best_effort_timestamp })
}
