/*!
    Shared types for the media file source crates.

    This crate defines the vocabulary that crosses crate boundaries: stream
    descriptors, source lifecycle state, timestamps, the error taxonomy and the
    reference-counted frame-buffer pool that decoded pictures live in. It has
    no dependency on FFmpeg, so hosts and sinks can depend on it without
    pulling in codec bindings.
*/

mod buffer;
mod error;
mod format;
mod state;
mod stream;
mod time;

pub use self::buffer::{
    BufferHandle, DEFAULT_POOL_CAPACITY, FrameBufferPool, I420Buffer, I420View, Plane,
};
pub use self::error::{Error, Result};
pub use self::format::SampleFormat;
pub use self::state::SourceState;
pub use self::stream::{AudioStreamInfo, StreamDescriptor, StreamKind, VideoStreamInfo};
pub use self::time::{MICROS_PER_SECOND, Rational};
