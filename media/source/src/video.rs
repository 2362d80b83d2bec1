/*!
    Video frame delivery and zero-copy picture allocation.

    Decoders that accept caller-provided buffers write pictures directly
    into I420 buffers drawn from the source's [`FrameBufferPool`]. The
    decoder's reference to each buffer is a [`BufferHandle`]; the picture
    delivered to the video sink shares the same allocation, so the buffer
    returns to the pool only after both have let go of it.

    I420 pictures from decoders that allocate their own memory are copied
    into a pool buffer before delivery. Pictures in any other format are
    dropped.
*/

use std::sync::Arc;

use media_types::{BufferHandle, Error, FrameBufferPool, I420View, Plane, Rational, Result};
use tracing::{trace, warn};

use crate::backend::{
    DimensionAlign, Frame, FrameAllocator, FrameBuffer, FrameData, PictureFormat, VideoData,
};
use crate::decoder::FrameHandler;
use crate::sink::SinkSlot;

/// Padding the codec library adds around each picture when validating sizes.
const PICTURE_SIZE_PADDING: i64 = 128;

/**
    A decoded picture handed to the video sink.

    The view keeps the underlying pool buffer alive; sinks may clone and
    retain it beyond the callback.
*/
#[derive(Clone, Debug)]
pub struct VideoFrame {
    pub view: I420View,
    /// Presentation timestamp in microseconds.
    pub timestamp_us: i64,
}

/**
    Consumer of decoded video. Called on the source's worker thread.
*/
pub trait VideoSink: Send + Sync {
    fn on_video_frame(&self, frame: VideoFrame);
}

/**
    Returns an error unless a `width` x `height` picture, with the codec
    library's padding, stays addressable with signed 32-bit offsets.
*/
pub fn check_picture_size(width: i32, height: i32) -> Result<()> {
    let w = width as i64;
    let h = height as i64;
    let padded = (w + PICTURE_SIZE_PADDING) * (h + PICTURE_SIZE_PADDING);
    if w <= 0 || h <= 0 || padded >= i32::MAX as i64 / 8 {
        return Err(Error::BufferAllocation {
            width: w,
            height: h,
        });
    }
    Ok(())
}

/**
    Allocates decoder output pictures from a frame buffer pool.
*/
#[derive(Clone, Debug)]
pub struct PoolAllocator {
    pool: FrameBufferPool,
}

impl PoolAllocator {
    pub fn new(pool: FrameBufferPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &FrameBufferPool {
        &self.pool
    }
}

impl FrameAllocator for PoolAllocator {
    fn get_buffer(
        &self,
        align: &dyn DimensionAlign,
        width: i32,
        height: i32,
    ) -> Result<FrameBuffer> {
        let (width, height) = align.align_dimensions(width, height);
        check_picture_size(width, height)?;

        let buffer = self.pool.create_i420(width as u32, height as u32)?;
        let planes = Plane::ALL.map(|plane| (buffer.plane_ptr(plane), buffer.stride(plane)));
        trace!(width, height, size = buffer.len(), "allocated picture buffer");

        Ok(FrameBuffer {
            planes,
            size: buffer.len(),
            handle: BufferHandle::new(buffer),
        })
    }
}

/**
    Copy a picture held in decoder-owned memory into a fresh pool buffer
    and return a view of the whole buffer.
*/
fn copy_into_pool(pool: &FrameBufferPool, video: &VideoData) -> Result<I420View> {
    check_picture_size(video.width as i32, video.height as i32)?;
    let buffer = pool.create_i420(video.width, video.height)?;

    for plane in Plane::ALL {
        let source = video.planes[plane.index()];
        let row_bytes = buffer.stride(plane);
        if source.data.is_null() || source.stride < row_bytes {
            return Err(Error::InvalidView(format!(
                "{:?} plane of a {}x{} picture has stride {}",
                plane, video.width, video.height, source.stride
            )));
        }
        // SAFETY: the buffer was just allocated and is not shared yet.
        let target = unsafe { buffer.data_mut(plane) };
        for (y, row) in target.chunks_exact_mut(row_bytes).enumerate() {
            // SAFETY: the decoder's plane holds one row of at least
            // `row_bytes` bytes every `stride` bytes.
            let src = unsafe {
                std::slice::from_raw_parts(source.data.add(y * source.stride), row_bytes)
            };
            row.copy_from_slice(src);
        }
    }

    Ok(I420View::full(buffer))
}

/**
    Wraps decoded pictures in pool-backed views and forwards them to the
    installed video sink.
*/
pub struct VideoFrameHandler {
    sink: Arc<SinkSlot<dyn VideoSink>>,
    allocator: Arc<PoolAllocator>,
    unconvertible_frames: u64,
}

impl VideoFrameHandler {
    pub fn new(sink: Arc<SinkSlot<dyn VideoSink>>, pool: FrameBufferPool) -> Self {
        Self {
            sink,
            allocator: Arc::new(PoolAllocator::new(pool)),
            unconvertible_frames: 0,
        }
    }
}

impl FrameHandler for VideoFrameHandler {
    fn process_frame(&mut self, frame: &Frame, time_base: Rational) -> Result<()> {
        let FrameData::Video(video) = &frame.data else {
            warn!("video decoder produced a non-video frame");
            return Ok(());
        };
        if video.buffer.is_none() && video.format != PictureFormat::I420 {
            if self.unconvertible_frames == 0 {
                warn!(
                    width = video.width,
                    height = video.height,
                    "decoded picture is not I420, dropping"
                );
            }
            self.unconvertible_frames += 1;
            return Ok(());
        }

        let timestamp_us = frame
            .timestamp()
            .map(|ts| time_base.rescale_to_micros(ts))
            .unwrap_or(0);
        let pool = self.allocator.pool();

        let mut outcome = Ok(());
        let delivered = self.sink.deliver(|sink| {
            let view = match video.buffer.as_ref() {
                Some(buffer) => {
                    let planes = video.planes.map(|plane| (plane.data, plane.stride));
                    I420View::from_planes(Arc::clone(buffer), video.width, video.height, planes)
                }
                None => {
                    trace!(timestamp_us, "copying picture into pool buffer");
                    copy_into_pool(pool, video)
                }
            };
            match view {
                Ok(view) => sink.on_video_frame(VideoFrame { view, timestamp_us }),
                Err(e) => outcome = Err(e),
            }
        });
        if !delivered {
            trace!(timestamp_us, "no video sink, frame dropped");
        }
        outcome
    }

    fn allocator(&self) -> Option<Arc<dyn FrameAllocator>> {
        Some(self.allocator.clone())
    }
}
