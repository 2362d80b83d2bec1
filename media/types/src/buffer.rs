/*!
    Reference-counted planar frame buffers.

    Video decoders write directly into buffers handed out by a
    [`FrameBufferPool`], and sinks receive [`I420View`]s that reference the
    same memory. A buffer's memory goes back to the pool when the last
    reference to it is dropped.
*/

use std::alloc::{self, Layout};
use std::ffi::c_void;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::{Error, Result};

/// Number of released allocations a pool keeps for reuse by default.
pub const DEFAULT_POOL_CAPACITY: usize = 8;

/// Alignment of every plane start, enough for the widest SIMD stores
/// codec libraries issue.
pub const PLANE_ALIGNMENT: usize = 64;

/**
    One of the three planes of an I420 picture.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Plane {
    Y,
    U,
    V,
}

impl Plane {
    pub const ALL: [Plane; 3] = [Plane::Y, Plane::U, Plane::V];

    pub const fn index(self) -> usize {
        match self {
            Self::Y => 0,
            Self::U => 1,
            Self::V => 2,
        }
    }

    pub const fn is_chroma(self) -> bool {
        !matches!(self, Self::Y)
    }
}

const fn chroma_size(luma: u32) -> u32 {
    luma.div_ceil(2)
}

/**
    Plane start offsets and total length of an I420 layout whose planes all
    start on a [`PLANE_ALIGNMENT`] boundary.
*/
fn plane_layout(width: u32, height: u32) -> ([usize; 3], usize) {
    let y_size = width as usize * height as usize;
    let uv_size = chroma_size(width) as usize * chroma_size(height) as usize;
    let u_start = y_size.next_multiple_of(PLANE_ALIGNMENT);
    let v_start = u_start + uv_size.next_multiple_of(PLANE_ALIGNMENT);
    ([0, u_start, v_start], v_start + uv_size)
}

/// Zeroed memory aligned to [`PLANE_ALIGNMENT`], freed on drop.
struct Memory {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the memory is plain bytes owned by this value.
unsafe impl Send for Memory {}

impl Memory {
    fn zeroed(len: usize) -> Option<Self> {
        let layout = Layout::from_size_align(len, PLANE_ALIGNMENT).ok()?;
        if layout.size() == 0 {
            return None;
        }
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self { ptr, layout })
    }

    fn len(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for Memory {
    fn drop(&mut self) {
        // SAFETY: allocated in `zeroed` with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

struct PoolShared {
    free: Mutex<Vec<Memory>>,
    capacity: usize,
    outstanding: AtomicUsize,
    recycled: AtomicUsize,
}

impl PoolShared {
    fn take(&self, len: usize) -> Option<Memory> {
        let mut free = self.free.lock();
        let found = free.iter().position(|memory| memory.len() == len);
        match found {
            Some(pos) => {
                self.recycled.fetch_add(1, Ordering::Relaxed);
                Some(free.swap_remove(pos))
            }
            // New allocations are zeroed, decoders may read padding before writing it.
            None => {
                drop(free);
                Memory::zeroed(len)
            }
        }
    }

    fn give_back(&self, memory: Memory) {
        let mut free = self.free.lock();
        if free.len() < self.capacity {
            free.push(memory);
        }
    }
}

/**
    Pool of contiguous I420 picture allocations.

    Cloning the pool is cheap; clones share the same free list and counters.
*/
#[derive(Clone)]
pub struct FrameBufferPool {
    shared: Arc<PoolShared>,
}

impl FrameBufferPool {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_POOL_CAPACITY)
    }

    /**
        Create a pool that keeps at most `capacity` released allocations
        around for reuse.
    */
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                free: Mutex::new(Vec::with_capacity(capacity)),
                capacity,
                outstanding: AtomicUsize::new(0),
                recycled: AtomicUsize::new(0),
            }),
        }
    }

    /**
        Allocate an I420 buffer of the given luma dimensions.

        The three planes are laid out in one allocation (Y, then U, then V)
        with strides equal to the plane widths. Chroma planes are half size,
        rounded up. Every plane starts on a [`PLANE_ALIGNMENT`] boundary.
    */
    pub fn create_i420(&self, width: u32, height: u32) -> Result<Arc<I420Buffer>> {
        if width == 0 || height == 0 {
            return Err(Error::BufferAllocation {
                width: width as i64,
                height: height as i64,
            });
        }

        let (offsets, len) = plane_layout(width, height);
        let memory = self.shared.take(len).ok_or(Error::BufferAllocation {
            width: width as i64,
            height: height as i64,
        })?;

        self.shared.outstanding.fetch_add(1, Ordering::AcqRel);

        Ok(Arc::new(I420Buffer {
            width,
            height,
            chroma_width: chroma_size(width),
            chroma_height: chroma_size(height),
            data: memory.ptr,
            offsets,
            len,
            memory: Some(memory),
            pool: Arc::clone(&self.shared),
        }))
    }

    /**
        Number of buffers handed out and not yet released.
    */
    pub fn outstanding(&self) -> usize {
        self.shared.outstanding.load(Ordering::Acquire)
    }

    /**
        Number of allocations served from the free list.
    */
    pub fn recycled(&self) -> usize {
        self.shared.recycled.load(Ordering::Relaxed)
    }

    /**
        Drop all released allocations kept for reuse.
    */
    pub fn clear(&self) {
        self.shared.free.lock().clear();
    }
}

impl Default for FrameBufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBufferPool")
            .field("capacity", &self.shared.capacity)
            .field("outstanding", &self.outstanding())
            .field("recycled", &self.recycled())
            .finish_non_exhaustive()
    }
}

/**
    A contiguous planar YUV 4:2:0 picture allocated from a [`FrameBufferPool`].

    The memory is written through the raw plane pointers exactly once, by the
    decoder that requested it, before any view of it is handed to a sink.
    After that it is only read.
*/
pub struct I420Buffer {
    width: u32,
    height: u32,
    chroma_width: u32,
    chroma_height: u32,
    data: NonNull<u8>,
    offsets: [usize; 3],
    len: usize,
    memory: Option<Memory>,
    pool: Arc<PoolShared>,
}

// SAFETY: the allocation is uniquely owned by this buffer and only mutated by
// the decoder before the buffer is shared with readers.
unsafe impl Send for I420Buffer {}
unsafe impl Sync for I420Buffer {}

impl I420Buffer {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma_width(&self) -> u32 {
        self.chroma_width
    }

    pub fn chroma_height(&self) -> u32 {
        self.chroma_height
    }

    pub fn stride(&self, plane: Plane) -> usize {
        if plane.is_chroma() {
            self.chroma_width as usize
        } else {
            self.width as usize
        }
    }

    /// Rows in the given plane.
    pub fn rows(&self, plane: Plane) -> usize {
        if plane.is_chroma() {
            self.chroma_height as usize
        } else {
            self.height as usize
        }
    }

    /// Total size of the allocation in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /**
        Byte range of a plane within the allocation. Padding between planes
        belongs to no plane.
    */
    pub fn plane_range(&self, plane: Plane) -> Range<usize> {
        let start = self.offsets[plane.index()];
        start..start + self.stride(plane) * self.rows(plane)
    }

    pub fn data(&self, plane: Plane) -> &[u8] {
        let range = self.plane_range(plane);
        // SAFETY: the range lies within the allocation of `len` bytes.
        unsafe {
            std::slice::from_raw_parts(self.data.as_ptr().add(range.start), range.len())
        }
    }

    /**
        Pointer to the start of a plane, handed to decoders as their write target.
    */
    pub fn plane_ptr(&self, plane: Plane) -> *mut u8 {
        // SAFETY: the offset is within the allocation.
        unsafe { self.data.as_ptr().add(self.plane_range(plane).start) }
    }

    /**
        Mutable access to a plane.

        # Safety

        The caller must guarantee no other reference to this plane's memory
        is alive for the lifetime of the returned slice, i.e. the buffer has
        not been shared with any reader yet.
    */
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn data_mut(&self, plane: Plane) -> &mut [u8] {
        let range = self.plane_range(plane);
        unsafe { std::slice::from_raw_parts_mut(self.plane_ptr(plane), range.len()) }
    }

    fn memory_range(&self) -> Range<usize> {
        let start = self.data.as_ptr() as usize;
        start..start + self.len
    }
}

impl Drop for I420Buffer {
    fn drop(&mut self) {
        if let Some(memory) = self.memory.take() {
            self.pool.give_back(memory);
        }
        self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for I420Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I420Buffer")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("len", &self.len)
            .finish_non_exhaustive()
    }
}

/**
    Exactly one strong reference to a pool buffer, passed through a decode
    backend's opaque buffer slot.

    The handle is consumed when released, so it can only be destroyed once.
*/
pub struct BufferHandle(Arc<I420Buffer>);

impl BufferHandle {
    pub fn new(buffer: Arc<I420Buffer>) -> Self {
        Self(buffer)
    }

    pub fn buffer(&self) -> &Arc<I420Buffer> {
        &self.0
    }

    /**
        Leak the handle into an opaque pointer. Must be turned back into a
        handle with [`BufferHandle::from_raw`] exactly once.
    */
    pub fn into_raw(self) -> *mut c_void {
        Box::into_raw(Box::new(self.0)) as *mut c_void
    }

    /**
        Reclaim a handle leaked with [`BufferHandle::into_raw`].

        # Safety

        `ptr` must come from `into_raw` and must not have been reclaimed before.
    */
    pub unsafe fn from_raw(ptr: *mut c_void) -> Self {
        Self(*unsafe { Box::from_raw(ptr as *mut Arc<I420Buffer>) })
    }

    /**
        Borrow the buffer behind a leaked handle without reclaiming it.

        # Safety

        `ptr` must come from `into_raw` and must stay unreclaimed while the
        returned reference is used.
    */
    pub unsafe fn peek_raw<'a>(ptr: *const c_void) -> &'a Arc<I420Buffer> {
        unsafe { &*(ptr as *const Arc<I420Buffer>) }
    }

    /**
        Drop the reference this handle holds.
    */
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for BufferHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BufferHandle").field(&self.0).finish()
    }
}

/**
    A possibly cropped view onto an [`I420Buffer`].

    The view shares the buffer's memory and keeps it alive. Its planes start
    wherever the decoder placed the visible picture and are guaranteed to lie
    inside the buffer's planes.
*/
#[derive(Clone)]
pub struct I420View {
    buffer: Arc<I420Buffer>,
    width: u32,
    height: u32,
    offsets: [usize; 3],
    strides: [usize; 3],
}

impl I420View {
    /**
        A view covering the whole buffer.
    */
    pub fn full(buffer: Arc<I420Buffer>) -> Self {
        let offsets = Plane::ALL.map(|plane| buffer.plane_range(plane).start);
        let strides = Plane::ALL.map(|plane| buffer.stride(plane));
        Self {
            width: buffer.width(),
            height: buffer.height(),
            buffer,
            offsets,
            strides,
        }
    }

    /**
        Build a view from raw plane pointers and strides reported by a decoder.

        Fails if the dimensions exceed the allocation or any plane, as
        addressed by its pointer, stride and the view's dimensions, reaches
        outside the corresponding plane of the allocation.
    */
    pub fn from_planes(
        buffer: Arc<I420Buffer>,
        width: u32,
        height: u32,
        planes: [(*const u8, usize); 3],
    ) -> Result<Self> {
        if width == 0 || height == 0 || width > buffer.width() || height > buffer.height() {
            return Err(Error::InvalidView(format!(
                "{}x{} view on a {}x{} buffer",
                width,
                height,
                buffer.width(),
                buffer.height()
            )));
        }

        let memory = buffer.memory_range();
        let mut offsets = [0usize; 3];
        let mut strides = [0usize; 3];

        for plane in Plane::ALL {
            let (ptr, stride) = planes[plane.index()];
            let (row_bytes, rows) = plane_extent(plane, width, height);
            let bounds = buffer.plane_range(plane);

            let addr = ptr as usize;
            if addr < memory.start || stride < row_bytes {
                return Err(Error::InvalidView(format!(
                    "{:?} plane pointer or stride outside the allocation",
                    plane
                )));
            }
            let offset = addr - memory.start;
            let end = stride
                .saturating_mul(rows - 1)
                .saturating_add(row_bytes)
                .saturating_add(offset);
            if offset < bounds.start || end > bounds.end {
                return Err(Error::InvalidView(format!(
                    "{:?} plane spans {}..{}, allocation plane is {}..{}",
                    plane, offset, end, bounds.start, bounds.end
                )));
            }

            offsets[plane.index()] = offset;
            strides[plane.index()] = stride;
        }

        Ok(Self {
            buffer,
            width,
            height,
            offsets,
            strides,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn chroma_width(&self) -> u32 {
        chroma_size(self.width)
    }

    pub fn chroma_height(&self) -> u32 {
        chroma_size(self.height)
    }

    pub fn stride(&self, plane: Plane) -> usize {
        self.strides[plane.index()]
    }

    /// The allocation backing this view.
    pub fn buffer(&self) -> &Arc<I420Buffer> {
        &self.buffer
    }

    /**
        Byte range of a plane of this view, relative to the start of the
        backing allocation.
    */
    pub fn plane_range(&self, plane: Plane) -> Range<usize> {
        let (row_bytes, rows) = plane_extent(plane, self.width, self.height);
        let start = self.offsets[plane.index()];
        start..start + self.strides[plane.index()] * (rows - 1) + row_bytes
    }

    /**
        Plane memory from the first visible pixel to the last, including any
        stride padding between rows.
    */
    pub fn data(&self, plane: Plane) -> &[u8] {
        let range = self.plane_range(plane);
        let base = self.buffer.plane_range(plane).start;
        let data = self.buffer.data(plane);
        &data[range.start - base..range.end - base]
    }

    /**
        Visible pixels of one row of a plane.
    */
    pub fn row(&self, plane: Plane, y: usize) -> &[u8] {
        let (row_bytes, _) = plane_extent(plane, self.width, self.height);
        let start = y * self.stride(plane);
        &self.data(plane)[start..start + row_bytes]
    }
}

impl std::fmt::Debug for I420View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("I420View")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("strides", &self.strides)
            .finish_non_exhaustive()
    }
}

fn plane_extent(plane: Plane, width: u32, height: u32) -> (usize, usize) {
    if plane.is_chroma() {
        (chroma_size(width) as usize, chroma_size(height) as usize)
    } else {
        (width as usize, height as usize)
    }
}
