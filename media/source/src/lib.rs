/*!
    File-based media source.

    This crate opens a media file, decodes its preferred audio and video
    streams on a worker thread and pushes the decoded frames to
    caller-installed sinks: interleaved PCM for audio and zero-copy I420
    pictures, backed by a shared buffer pool, for video.

    The codec library sits behind the traits in [`backend`]. Enable the
    `ffmpeg` feature for the FFmpeg implementation and
    [`MediaSource::open`].
*/

pub mod audio;
pub mod backend;
mod codec;
mod decoder;
pub mod property;
mod sink;
mod source;
pub mod video;

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

pub use self::audio::{AudioFrame, AudioFrameHandler, AudioSink};
pub use self::codec::Codec;
pub use self::decoder::{Decoder, FrameHandler};
pub use self::property::{Property, Signal, SubscriptionToken};
pub use self::sink::SinkSlot;
pub use self::source::{MediaSource, SourceConfig, SourceStateListener, StreamFilter};
pub use self::video::{PoolAllocator, VideoFrame, VideoFrameHandler, VideoSink, check_picture_size};

pub use media_types::{
    AudioStreamInfo, Error, FrameBufferPool, I420Buffer, I420View, Plane, Rational, Result,
    SampleFormat, SourceState, StreamDescriptor, StreamKind, VideoStreamInfo,
};
