//! Scripted in-memory backend for driving `MediaSource` without FFmpeg.
//!
//! A `Script` lists the probed streams and the packets the container yields.
//! Decode contexts turn every packet into one frame whose pts equals the
//! packet's, holding back `latency` frames until later packets or a flush.
//! Video contexts draw their pictures from the source's frame allocator, the
//! way a direct-rendering codec does, unless the script turns direct
//! rendering off; they then decode into memory of their own.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use media_source::backend::{
    Backend, BackendError, CodecDescription, Container, DecodeContext, DimensionAlign, Frame,
    FrameAllocator, FrameBuffer, MediaKind, Packet, PictureFormat, PlaneRef, ProbedStream,
    Received,
};
use media_source::{
    AudioFrame, AudioSink, I420Buffer, I420View, Plane, Rational, SampleFormat, VideoFrame,
    VideoSink,
};
use parking_lot::Mutex;

pub const AUDIO_SAMPLES: usize = 1024;
pub const AUDIO_CHANNELS: u32 = 2;

#[derive(Clone, Copy, Debug)]
pub enum OpenFailure {
    Open,
    StreamInfo,
}

#[derive(Clone, Debug)]
pub struct Script {
    pub duration_us: u64,
    pub bitrate: u64,
    pub streams: Vec<ProbedStream>,
    pub packets: Vec<(usize, i64)>,
    pub best_video: Option<usize>,
    pub best_audio: Option<usize>,
    pub latency: usize,
    pub video_size: (u32, u32),
    /// Left and top crop applied to every decoded picture.
    pub crop: (u32, u32),
    pub fail_open: Option<OpenFailure>,
    pub fail_decoder_open: Option<usize>,
    /// Stream index and pts of the packet the decoder rejects.
    pub fail_decode: Option<(usize, i64)>,
    pub read_delay: Option<Duration>,
    /// Whether video contexts decode into buffers from the source's allocator.
    pub direct_rendering: bool,
}

impl Script {
    /// Video on stream 0 and audio on stream 1, `count` packets each,
    /// interleaved.
    pub fn av(count: i64) -> Self {
        let mut packets = Vec::new();
        for pts in 0..count {
            packets.push((0, pts));
            packets.push((1, pts));
        }
        Self {
            duration_us: count as u64 * 40_000,
            bitrate: 1_500_000,
            streams: vec![video_stream(0, "h264"), audio_stream(1, "aac")],
            packets,
            best_video: Some(0),
            best_audio: Some(1),
            latency: 0,
            video_size: (100, 50),
            crop: (0, 0),
            fail_open: None,
            fail_decoder_open: None,
            fail_decode: None,
            read_delay: None,
            direct_rendering: true,
        }
    }

    pub fn audio_only(count: i64) -> Self {
        Self {
            streams: vec![audio_stream(0, "aac")],
            packets: (0..count).map(|pts| (0, pts)).collect(),
            best_video: None,
            best_audio: Some(0),
            ..Self::av(0)
        }
    }

    pub fn video_only(count: i64) -> Self {
        Self {
            streams: vec![video_stream(0, "h264")],
            packets: (0..count).map(|pts| (0, pts)).collect(),
            best_video: Some(0),
            best_audio: None,
            ..Self::av(0)
        }
    }
}

pub fn codec(name: &str) -> Option<CodecDescription> {
    Some(CodecDescription {
        name: name.to_string(),
        long_name: format!("{} test codec", name.to_uppercase()),
    })
}

pub fn video_stream(index: usize, name: &str) -> ProbedStream {
    let mut stream = ProbedStream::new(index, MediaKind::Video);
    stream.decoder = codec(name);
    stream.bitrate = 1_200_000;
    stream.time_base = Rational::new(1, 1000);
    stream.width = 100;
    stream.height = 50;
    stream.pixel_format_name = Some("yuv420p".into());
    stream.frame_rate = Rational::new(25, 1);
    stream
}

pub fn audio_stream(index: usize, name: &str) -> ProbedStream {
    let mut stream = ProbedStream::new(index, MediaKind::Audio);
    stream.decoder = codec(name);
    stream.bitrate = 128_000;
    stream.time_base = Rational::new(1, 1000);
    stream.channels = AUDIO_CHANNELS;
    stream.sample_rate = 48_000;
    stream
}

/// Counters shared by a backend and everything it creates.
#[derive(Debug, Default)]
pub struct Stats {
    pub containers_opened: AtomicUsize,
    pub packets_read: AtomicUsize,
    pub rewinds: AtomicUsize,
    pub decoders_opened: AtomicUsize,
    pub decoders_dropped: AtomicUsize,
    pub flushes: AtomicUsize,
    /// Packets that reached a decoder still carrying the container's own
    /// demuxed packet.
    pub demuxed_packets_decoded: AtomicUsize,
}

impl Stats {
    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct ScriptedBackend {
    script: Script,
    pub stats: Arc<Stats>,
}

impl ScriptedBackend {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            stats: Arc::new(Stats::default()),
        }
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn open_container(&self, path: &Path) -> Result<Box<dyn Container>, BackendError> {
        match self.script.fail_open {
            Some(OpenFailure::Open) => {
                return Err(BackendError::Open(format!(
                    "{}: No such file or directory",
                    path.display()
                )));
            }
            Some(OpenFailure::StreamInfo) => {
                return Err(BackendError::StreamInfo("Invalid data found".into()));
            }
            None => {}
        }
        self.stats.containers_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedContainer {
            script: self.script.clone(),
            position: 0,
            stats: self.stats.clone(),
        }))
    }
}

/// What the scripted container attaches as a packet's native payload.
#[derive(Debug)]
pub struct Demuxed {
    pub stream_index: usize,
    pub pts: i64,
}

struct ScriptedContainer {
    script: Script,
    position: usize,
    stats: Arc<Stats>,
}

impl Container for ScriptedContainer {
    fn duration_us(&self) -> u64 {
        self.script.duration_us
    }

    fn bitrate(&self) -> u64 {
        self.script.bitrate
    }

    fn streams(&self) -> &[ProbedStream] {
        &self.script.streams
    }

    fn best_stream(&self, kind: MediaKind) -> Option<usize> {
        match kind {
            MediaKind::Video => self.script.best_video,
            MediaKind::Audio => self.script.best_audio,
            MediaKind::Other => None,
        }
    }

    fn read_packet(&mut self, packet: &mut Packet) -> Result<bool, BackendError> {
        if let Some(delay) = self.script.read_delay {
            std::thread::sleep(delay);
        }
        let Some(&(stream_index, pts)) = self.script.packets.get(self.position) else {
            return Ok(false);
        };
        self.position += 1;
        self.stats.packets_read.fetch_add(1, Ordering::SeqCst);

        packet.stream_index = stream_index;
        packet.pts = Some(pts);
        packet.dts = Some(pts);
        packet.duration = 1;
        packet.is_key = true;
        packet.data.clear();
        packet.data.extend_from_slice(&pts.to_le_bytes());
        packet.native = Some(Box::new(Demuxed { stream_index, pts }));
        Ok(true)
    }

    fn rewind(&mut self) -> Result<(), BackendError> {
        self.position = 0;
        self.stats.rewinds.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn open_decoder(
        &mut self,
        stream_index: usize,
        allocator: Option<Arc<dyn FrameAllocator>>,
    ) -> Result<Box<dyn DecodeContext>, BackendError> {
        if self.script.fail_decoder_open == Some(stream_index) {
            return Err(BackendError::Codec("could not open codec".into()));
        }
        let stream = self
            .script
            .streams
            .iter()
            .find(|s| s.index == stream_index)
            .ok_or_else(|| BackendError::Codec(format!("no stream {}", stream_index)))?;
        if stream.decoder.is_none() {
            return Err(BackendError::DecoderNotFound("none".into()));
        }

        self.stats.decoders_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedDecoder {
            stream_index,
            kind: stream.kind,
            latency: self.script.latency,
            video_size: self.script.video_size,
            crop: self.script.crop,
            fail_decode: self.script.fail_decode,
            direct_rendering: self.script.direct_rendering,
            allocator,
            held: VecDeque::new(),
            ready: VecDeque::new(),
            current: None,
            flushing: false,
            stats: self.stats.clone(),
        }))
    }
}

pub struct Align16;

impl DimensionAlign for Align16 {
    fn align_dimensions(&self, width: i32, height: i32) -> (i32, i32) {
        ((width + 15) & !15, (height + 15) & !15)
    }
}

/// Picture memory the decoder allocated itself, rows padded past the width.
struct OwnedPicture {
    planes: [Vec<u8>; 3],
    strides: [usize; 3],
}

enum Picture {
    Pool(FrameBuffer),
    Owned(OwnedPicture),
}

impl Picture {
    fn plane(&self, plane: Plane) -> (*const u8, usize) {
        match self {
            Self::Pool(buffer) => {
                let (data, stride) = buffer.planes[plane.index()];
                (data as *const u8, stride)
            }
            Self::Owned(owned) => (
                owned.planes[plane.index()].as_ptr(),
                owned.strides[plane.index()],
            ),
        }
    }

    fn buffer(&self) -> Option<Arc<I420Buffer>> {
        match self {
            Self::Pool(buffer) => Some(buffer.handle.buffer().clone()),
            Self::Owned(_) => None,
        }
    }
}

struct Pending {
    pts: i64,
    picture: Option<Picture>,
}

struct ScriptedDecoder {
    stream_index: usize,
    kind: MediaKind,
    latency: usize,
    video_size: (u32, u32),
    crop: (u32, u32),
    fail_decode: Option<(usize, i64)>,
    direct_rendering: bool,
    allocator: Option<Arc<dyn FrameAllocator>>,
    held: VecDeque<Pending>,
    ready: VecDeque<Pending>,
    /// Picture referenced by the last frame handed out.
    current: Option<Picture>,
    flushing: bool,
    stats: Arc<Stats>,
}

// The raw plane pointers in pending pictures point into pool buffers owned
// by their handles, or into the pictures' own vectors.
unsafe impl Send for ScriptedDecoder {}

impl ScriptedDecoder {
    fn decode_picture(&self, pts: i64) -> Result<Option<Picture>, BackendError> {
        if self.kind != MediaKind::Video {
            return Ok(None);
        }
        let (width, height) = self.video_size;
        if !self.direct_rendering {
            // Every luma byte carries the stamp, so it survives cropping.
            let luma_stride = width as usize + 28;
            let chroma_stride = 64;
            let chroma_rows = height.div_ceil(2) as usize;
            return Ok(Some(Picture::Owned(OwnedPicture {
                planes: [
                    vec![pts as u8; luma_stride * height as usize],
                    vec![128; chroma_stride * chroma_rows],
                    vec![128; chroma_stride * chroma_rows],
                ],
                strides: [luma_stride, chroma_stride, chroma_stride],
            })));
        }
        let Some(allocator) = &self.allocator else {
            return Ok(None);
        };
        let picture = allocator
            .get_buffer(&Align16, width as i32, height as i32)
            .map_err(|e| BackendError::Codec(e.to_string()))?;
        // Stamp the luma plane so tests can tell pictures apart.
        let (luma, _) = picture.planes[0];
        unsafe { *luma = pts as u8 };
        Ok(Some(Picture::Pool(picture)))
    }
}

impl DecodeContext for ScriptedDecoder {
    fn send_packet(&mut self, packet: Option<&Packet>) -> Result<(), BackendError> {
        let Some(packet) = packet else {
            if self.flushing {
                return Err(BackendError::Eof);
            }
            self.flushing = true;
            self.stats.flushes.fetch_add(1, Ordering::SeqCst);
            self.ready.extend(self.held.drain(..));
            return Ok(());
        };

        let pts = packet.pts.unwrap_or(0);
        let demuxed = packet
            .native
            .as_deref()
            .and_then(|native| native.downcast_ref::<Demuxed>());
        if let Some(demuxed) = demuxed {
            if demuxed.stream_index == packet.stream_index && demuxed.pts == pts {
                self.stats.demuxed_packets_decoded.fetch_add(1, Ordering::SeqCst);
            }
        }
        if self.fail_decode == Some((self.stream_index, pts)) {
            return Err(BackendError::Codec("Invalid data found when processing input".into()));
        }
        let picture = self.decode_picture(pts)?;
        self.held.push_back(Pending { pts, picture });
        while self.held.len() > self.latency {
            if let Some(pending) = self.held.pop_front() {
                self.ready.push_back(pending);
            }
        }
        Ok(())
    }

    fn receive_frame(&mut self, frame: &mut Frame) -> Result<Received, BackendError> {
        let Some(pending) = self.ready.pop_front() else {
            return Ok(if self.flushing {
                Received::Eof
            } else {
                Received::Again
            });
        };

        frame.pts = Some(pending.pts);
        frame.best_effort_timestamp = Some(pending.pts);
        match self.kind {
            MediaKind::Video => {
                let (width, height) = self.video_size;
                let (left, top) = self.crop;
                let video = frame.video_mut();
                video.width = width - left;
                video.height = height - top;
                video.format = PictureFormat::I420;
                video.buffer = None;
                if let Some(picture) = &pending.picture {
                    for plane in Plane::ALL {
                        let (data, stride) = picture.plane(plane);
                        let (dx, dy) = if plane.is_chroma() {
                            (left / 2, top / 2)
                        } else {
                            (left, top)
                        };
                        let offset = dy as usize * stride + dx as usize;
                        video.planes[plane.index()] = PlaneRef {
                            data: unsafe { data.add(offset) },
                            stride,
                        };
                    }
                    video.buffer = picture.buffer();
                }
            }
            _ => {
                let audio = frame.audio_mut();
                audio.sample_count = AUDIO_SAMPLES;
                audio.channel_count = AUDIO_CHANNELS;
                audio.sample_rate = 48_000;
                audio.format = Some(SampleFormat::S16);
                audio.samples.clear();
                audio
                    .samples
                    .resize(AUDIO_SAMPLES * AUDIO_CHANNELS as usize * 2, pending.pts as u8);
            }
        }
        // The previous picture's reference is released here, like av_frame_unref.
        self.current = pending.picture;
        Ok(Received::Frame)
    }

    fn reset(&mut self) {
        self.held.clear();
        self.ready.clear();
        self.current = None;
        self.flushing = false;
    }
}

impl Drop for ScriptedDecoder {
    fn drop(&mut self) {
        self.stats.decoders_dropped.fetch_add(1, Ordering::SeqCst);
    }
}

/// Everything a test can observe, in delivery order.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    Audio { pts: i64, timestamp_us: i64 },
    Video { timestamp_us: i64 },
    State(media_source::SourceState),
}

#[derive(Default)]
pub struct Recorder {
    pub events: Mutex<Vec<Event>>,
    pub frames: Mutex<Vec<VideoFrame>>,
    pub audio_bytes: Mutex<Vec<usize>>,
    pub keep_frames: bool,
}

impl Recorder {
    pub fn keeping_frames() -> Self {
        Self {
            keep_frames: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    pub fn audio_pts(&self) -> Vec<i64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Audio { pts, .. } => Some(*pts),
                _ => None,
            })
            .collect()
    }

    pub fn video_timestamps(&self) -> Vec<i64> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Video { timestamp_us } => Some(*timestamp_us),
                _ => None,
            })
            .collect()
    }

    pub fn states(&self) -> Vec<media_source::SourceState> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::State(state) => Some(*state),
                _ => None,
            })
            .collect()
    }
}

impl AudioSink for Recorder {
    fn on_audio_frame(&self, frame: &AudioFrame<'_>) {
        self.audio_bytes.lock().push(frame.data.len());
        self.events.lock().push(Event::Audio {
            pts: frame.pts.unwrap_or(-1),
            timestamp_us: frame.timestamp_us,
        });
    }
}

impl VideoSink for Recorder {
    fn on_video_frame(&self, frame: VideoFrame) {
        self.events.lock().push(Event::Video {
            timestamp_us: frame.timestamp_us,
        });
        if self.keep_frames {
            self.frames.lock().push(frame);
        }
    }
}

impl media_source::SourceStateListener for Recorder {
    fn on_source_state(&self, state: media_source::SourceState) {
        self.events.lock().push(Event::State(state));
    }
}

/// True if every plane of `view` lies inside the matching plane of its
/// allocation and the view is no larger than the allocation.
pub fn view_within_allocation(view: &I420View) -> bool {
    let buffer = view.buffer();
    if view.width() > buffer.width() || view.height() > buffer.height() {
        return false;
    }
    Plane::ALL.iter().all(|&plane| {
        let range = view.plane_range(plane);
        let bounds = buffer.plane_range(plane);
        range.start >= bounds.start && range.end <= bounds.end
    })
}

/// Poll `condition` until it holds or a few seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}
