/*!
    The seam between the source and the codec library.

    A [`Backend`] opens containers. A [`Container`] exposes probed stream
    metadata, yields compressed packets and opens per-stream decode contexts.
    A [`DecodeContext`] is the send/receive interface of a single decoder.

    The production implementation lives in the `ffmpeg` module behind the
    `ffmpeg` feature. Tests drive the source through scripted
    implementations of the same traits.
*/

use std::any::Any;
use std::path::Path;
use std::sync::Arc;

use media_types::{BufferHandle, I420Buffer, Rational, Result, SampleFormat};
use thiserror::Error;

/**
    Errors reported by a backend.

    The source maps these onto its own error taxonomy, attaching the path or
    stream index the failure belongs to.
*/
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0}")]
    Open(String),

    #[error("{0}")]
    StreamInfo(String),

    #[error("no decoder available for codec {0}")]
    DecoderNotFound(String),

    #[error("{0}")]
    Codec(String),

    /// The decoder cannot accept input until pending output is drained.
    #[error("resource temporarily unavailable")]
    Again,

    /// The decoder has already been flushed.
    #[error("end of stream")]
    Eof,

    #[error("seek failed: {0}")]
    Seek(String),

    #[error("read failed: {0}")]
    Read(String),
}

/**
    Media type of a container stream.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Other,
}

impl std::fmt::Display for MediaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Audio => "audio",
            Self::Video => "video",
            Self::Other => "other",
        })
    }
}

/**
    Names of the decoder the backend found for a stream.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct CodecDescription {
    pub name: String,
    pub long_name: String,
}

/**
    Stream metadata gathered while probing a container.

    `decoder` is `None` when the codec library has no decoder for the
    stream's codec; such streams are skipped.
*/
#[derive(Clone, Debug, PartialEq)]
pub struct ProbedStream {
    pub index: usize,
    pub kind: MediaKind,
    pub decoder: Option<CodecDescription>,
    pub bitrate: u64,
    pub time_base: Rational,
    pub channels: u32,
    pub sample_rate: u32,
    pub width: u32,
    pub height: u32,
    pub pixel_format_name: Option<String>,
    pub frame_rate: Rational,
}

impl ProbedStream {
    pub fn new(index: usize, kind: MediaKind) -> Self {
        Self {
            index,
            kind,
            decoder: None,
            bitrate: 0,
            time_base: Rational::default(),
            channels: 0,
            sample_rate: 0,
            width: 0,
            height: 0,
            pixel_format_name: None,
            frame_rate: Rational::default(),
        }
    }
}

/**
    A compressed packet read from a container.

    The read loop reuses one packet for the whole run; `read_packet`
    overwrites every field.

    `native` holds the backend's own demuxed packet when it has one, with
    everything the container attached to it (side data, flags). A backend
    that sets it may leave `data` empty; its decode contexts then send the
    native packet as is instead of rebuilding one from the fields here.
*/
#[derive(Debug, Default)]
pub struct Packet {
    pub stream_index: usize,
    pub data: Vec<u8>,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub is_key: bool,
    pub native: Option<Box<dyn Any + Send>>,
}

impl Packet {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Drop the payload while keeping the allocations, `native` included.
    pub fn clear(&mut self) {
        self.data.clear();
        self.pts = None;
        self.dts = None;
        self.duration = 0;
        self.is_key = false;
    }
}

/**
    Outcome of asking a decoder for its next frame.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Received {
    /// A frame was written into the caller's frame.
    Frame,
    /// More input is needed.
    Again,
    /// The decoder is fully drained.
    Eof,
}

/**
    Interleaved PCM produced by an audio decode context.
*/
#[derive(Clone, Debug, Default)]
pub struct AudioData {
    pub sample_count: usize,
    pub channel_count: u32,
    pub sample_rate: u32,
    pub format: Option<SampleFormat>,
    pub samples: Vec<u8>,
}

/**
    A plane as reported by a video decode context: start pointer and stride.
*/
#[derive(Clone, Copy, Debug)]
pub struct PlaneRef {
    pub data: *const u8,
    pub stride: usize,
}

impl PlaneRef {
    pub const NULL: Self = Self {
        data: std::ptr::null(),
        stride: 0,
    };
}

/**
    Pixel layout of a decoded picture, as far as the source can use it.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PictureFormat {
    /// Planar YUV 4:2:0, 8 bits per sample.
    I420,
    #[default]
    Other,
}

/**
    A decoded picture.

    `buffer` is set when the picture lives in a pool buffer handed out by the
    source's [`FrameAllocator`]; the plane pointers then point into it.
    Otherwise they point into memory owned by the decode context, valid
    until the next receive.
*/
#[derive(Clone, Debug)]
pub struct VideoData {
    pub width: u32,
    pub height: u32,
    pub format: PictureFormat,
    pub planes: [PlaneRef; 3],
    pub buffer: Option<Arc<I420Buffer>>,
}

impl Default for VideoData {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            format: PictureFormat::Other,
            planes: [PlaneRef::NULL; 3],
            buffer: None,
        }
    }
}

// SAFETY: plane pointers into decoder-owned memory are only read on the
// thread that received the frame, before the next receive; pool memory is
// kept alive by `buffer`, which is itself Send.
unsafe impl Send for VideoData {}

#[derive(Clone, Debug, Default)]
pub enum FrameData {
    #[default]
    Empty,
    Audio(AudioData),
    Video(VideoData),
}

/**
    A decoded frame, reused across receive calls.
*/
#[derive(Clone, Debug, Default)]
pub struct Frame {
    pub pts: Option<i64>,
    pub best_effort_timestamp: Option<i64>,
    pub data: FrameData,
}

impl Frame {
    pub fn empty() -> Self {
        Self::default()
    }

    /**
        Timestamp used for presentation: the best-effort timestamp when the
        decoder has one, otherwise the presentation timestamp.
    */
    pub fn timestamp(&self) -> Option<i64> {
        self.best_effort_timestamp.or(self.pts)
    }

    /**
        Release per-frame references. Audio sample storage is kept for the
        next frame; video buffer references are dropped.
    */
    pub fn unref(&mut self) {
        self.pts = None;
        self.best_effort_timestamp = None;
        match &mut self.data {
            FrameData::Empty => {}
            FrameData::Audio(audio) => {
                audio.samples.clear();
                audio.sample_count = 0;
            }
            FrameData::Video(video) => {
                video.buffer = None;
                video.planes = [PlaneRef::NULL; 3];
            }
        }
    }

    /// Switch the frame to audio, reusing existing sample storage.
    pub fn audio_mut(&mut self) -> &mut AudioData {
        if !matches!(self.data, FrameData::Audio(_)) {
            self.data = FrameData::Audio(AudioData::default());
        }
        match &mut self.data {
            FrameData::Audio(audio) => audio,
            _ => unreachable!(),
        }
    }

    pub fn video_mut(&mut self) -> &mut VideoData {
        if !matches!(self.data, FrameData::Video(_)) {
            self.data = FrameData::Video(VideoData::default());
        }
        match &mut self.data {
            FrameData::Video(video) => video,
            _ => unreachable!(),
        }
    }
}

/**
    Alignment rules of the decoder a buffer is being allocated for.
*/
pub trait DimensionAlign {
    /// Returns the padded width and height the decoder needs.
    fn align_dimensions(&self, width: i32, height: i32) -> (i32, i32);
}

/**
    Writable plane targets handed to a decoder for one picture.
*/
#[derive(Debug)]
pub struct FrameBuffer {
    pub planes: [(*mut u8, usize); 3],
    pub size: usize,
    pub handle: BufferHandle,
}

/**
    Supplies decoders with output picture memory.
*/
pub trait FrameAllocator: Send + Sync {
    fn get_buffer(&self, align: &dyn DimensionAlign, width: i32, height: i32)
    -> Result<FrameBuffer>;
}

/**
    Send/receive interface of one opened decoder.
*/
pub trait DecodeContext: Send {
    /// Submit a packet; `None` enters draining mode.
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), BackendError>;

    fn receive_frame(&mut self, frame: &mut Frame) -> Result<Received, BackendError>;

    /// Discard buffered state so decoding can restart, e.g. after a rewind.
    fn reset(&mut self);
}

/**
    An opened and probed container.
*/
pub trait Container: Send {
    /// Duration in microseconds, 0 if unknown.
    fn duration_us(&self) -> u64;

    /// Overall bitrate in bits per second, 0 if unknown.
    fn bitrate(&self) -> u64;

    fn streams(&self) -> &[ProbedStream];

    /// The container's preferred stream of the given kind.
    fn best_stream(&self, kind: MediaKind) -> Option<usize>;

    /// Read the next packet. Returns `Ok(false)` at end of input.
    fn read_packet(&mut self, packet: &mut Packet) -> Result<bool, BackendError>;

    /// Seek back to the start of the input.
    fn rewind(&mut self) -> Result<(), BackendError>;

    /**
        Open a decoder for a stream. When an allocator is given and the
        codec supports caller-provided buffers, decoded pictures are written
        into memory obtained from it.
    */
    fn open_decoder(
        &mut self,
        stream_index: usize,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Result<Box<dyn DecodeContext>, BackendError>;
}

/**
    Opens containers.
*/
pub trait Backend: Send + Sync {
    fn name(&self) -> &str;

    fn open_container(&self, path: &Path) -> Result<Box<dyn Container>, BackendError>;
}
