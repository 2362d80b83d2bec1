/*!
    File-backed media source.

    A [`MediaSource`] opens and probes a container on construction, then on
    [`MediaSource::start`] runs a worker thread that builds decoders for the
    preferred audio and video streams, reads packets, decodes them and
    delivers frames to the installed sinks. Lifecycle changes are published
    through a [`SourceState`] property.
*/

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use media_types::{
    AudioStreamInfo, DEFAULT_POOL_CAPACITY, Error, FrameBufferPool, Result, SourceState,
    StreamDescriptor, StreamKind, VideoStreamInfo,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::audio::{AudioFrameHandler, AudioSink};
use crate::backend::{Backend, BackendError, Container, MediaKind, Packet, ProbedStream};
use crate::decoder::Decoder;
use crate::property::{Property, SubscriptionToken};
use crate::sink::SinkSlot;
use crate::video::{VideoFrameHandler, VideoSink};

/**
    Filter for selecting which streams to decode.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StreamFilter {
    /// Only decode the video stream.
    VideoOnly,
    /// Only decode the audio stream.
    AudioOnly,
    /// Decode both video and audio streams.
    #[default]
    Both,
}

impl StreamFilter {
    fn wants(self, kind: MediaKind) -> bool {
        match (self, kind) {
            (Self::Both, MediaKind::Audio | MediaKind::Video) => true,
            (Self::VideoOnly, MediaKind::Video) => true,
            (Self::AudioOnly, MediaKind::Audio) => true,
            _ => false,
        }
    }
}

/**
    Configuration for opening a media source.
*/
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Which streams to decode.
    pub stream_filter: StreamFilter,
    /// Restart from the beginning when the input ends.
    pub looping: bool,
    /// Number of released picture buffers the pool keeps for reuse.
    pub pool_capacity: usize,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            stream_filter: StreamFilter::default(),
            looping: false,
            pool_capacity: DEFAULT_POOL_CAPACITY,
        }
    }
}

/**
    Observer of source lifecycle changes. Called on the thread that
    changed the state, normally the source's worker thread.
*/
pub trait SourceStateListener: Send + Sync {
    fn on_source_state(&self, state: SourceState);
}

/// State shared between the host-facing handle and the worker thread.
struct Shared {
    path: PathBuf,
    stream_filter: StreamFilter,
    running: AtomicBool,
    looping: AtomicBool,
    state: Property<SourceState>,
    audio_sink: Arc<SinkSlot<dyn AudioSink>>,
    video_sink: Arc<SinkSlot<dyn VideoSink>>,
    pool: FrameBufferPool,
}

#[derive(Default)]
struct Worker {
    handle: Option<JoinHandle<Result<()>>>,
}

/**
    A media file decoded on a dedicated worker thread.

    # Example

    ```ignore
    let source = MediaSource::open("clip.mp4")?;
    source.set_video_sink(Arc::new(MyRenderer::default()));
    source.start()?;
    source.wait()?;
    ```
*/
pub struct MediaSource {
    shared: Arc<Shared>,
    duration_us: u64,
    bitrate: u64,
    streams: Vec<StreamDescriptor>,
    /// The probed container, until the worker takes it over.
    container: Mutex<Option<Box<dyn Container>>>,
    /// Guards starting and stopping the worker.
    worker: Mutex<Worker>,
}

impl MediaSource {
    /**
        Open a media file with the FFmpeg backend and default configuration.
    */
    #[cfg(feature = "ffmpeg")]
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open_with_config(path, SourceConfig::default())
    }

    #[cfg(feature = "ffmpeg")]
    pub fn open_with_config<P: AsRef<Path>>(path: P, config: SourceConfig) -> Result<Self> {
        Self::with_backend(&crate::ffmpeg::FfmpegBackend::new(), path, config)
    }

    /**
        Open and probe a media file through `backend`.

        Streams without an available decoder are skipped with a warning.
        Failing to open the file yields [`Error::Open`]; failing to read its
        stream information yields [`Error::StreamInfo`].
    */
    pub fn with_backend<P: AsRef<Path>>(
        backend: &dyn Backend,
        path: P,
        config: SourceConfig,
    ) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let container = backend
            .open_container(&path)
            .map_err(|e| match e {
                BackendError::StreamInfo(reason) => Error::StreamInfo {
                    path: path.clone(),
                    reason,
                },
                other => Error::Open {
                    path: path.clone(),
                    reason: other.to_string(),
                },
            })?;

        let streams = describe_streams(container.streams());
        let duration_us = container.duration_us();
        let bitrate = container.bitrate();
        info!(
            path = %path.display(),
            backend = backend.name(),
            streams = streams.len(),
            duration_us,
            bitrate,
            "opened media source"
        );

        let shared = Arc::new(Shared {
            path,
            stream_filter: config.stream_filter,
            running: AtomicBool::new(false),
            looping: AtomicBool::new(config.looping),
            state: Property::new(SourceState::Initializing),
            audio_sink: Arc::new(SinkSlot::new()),
            video_sink: Arc::new(SinkSlot::new()),
            pool: FrameBufferPool::with_capacity(config.pool_capacity),
        });

        Ok(Self {
            shared,
            duration_us,
            bitrate,
            streams,
            container: Mutex::new(Some(container)),
            worker: Mutex::new(Worker::default()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Duration in microseconds, 0 if unknown.
    pub fn duration(&self) -> u64 {
        self.duration_us
    }

    /// Overall bitrate in bits per second, 0 if unknown.
    pub fn bitrate(&self) -> u64 {
        self.bitrate
    }

    /// Descriptors of every decodable stream, in container order.
    pub fn stream_info(&self) -> &[StreamDescriptor] {
        &self.streams
    }

    pub fn audio_stream_info(&self) -> Vec<&StreamDescriptor> {
        self.streams.iter().filter(|s| s.is_audio()).collect()
    }

    pub fn video_stream_info(&self) -> Vec<&StreamDescriptor> {
        self.streams.iter().filter(|s| s.is_video()).collect()
    }

    /**
        Enable or disable restarting from the beginning at end of input.
        Takes effect the next time the worker reaches the end.
    */
    pub fn set_loop(&self, looping: bool) {
        self.shared.looping.store(looping, Ordering::Release);
    }

    pub fn is_looping(&self) -> bool {
        self.shared.looping.load(Ordering::Acquire)
    }

    pub fn state(&self) -> SourceState {
        self.shared.state.get()
    }

    /**
        Subscribe to state changes without keeping `listener` alive. The
        subscription expires once the listener is dropped.
    */
    pub fn add_state_listener<L>(&self, listener: &Arc<L>) -> SubscriptionToken
    where
        L: SourceStateListener + 'static,
    {
        self.shared
            .state
            .signal()
            .bind_weak(listener, |listener, state| listener.on_source_state(*state))
    }

    /**
        Subscribe a closure to state changes. It stays subscribed until
        removed with [`MediaSource::remove_state_listener`].
    */
    pub fn on_state_change<F>(&self, callback: F) -> SubscriptionToken
    where
        F: Fn(SourceState) + Send + Sync + 'static,
    {
        self.shared
            .state
            .signal()
            .bind(move |state: &SourceState| callback(*state))
    }

    pub fn remove_state_listener(&self, token: SubscriptionToken) -> bool {
        self.shared.state.signal().unbind(token)
    }

    pub fn set_audio_sink(&self, sink: Arc<dyn AudioSink>) {
        self.shared.audio_sink.set(sink);
    }

    pub fn remove_audio_sink(&self) {
        self.shared.audio_sink.remove();
    }

    pub fn set_video_sink(&self, sink: Arc<dyn VideoSink>) {
        self.shared.video_sink.set(sink);
    }

    pub fn remove_video_sink(&self) {
        self.shared.video_sink.remove();
    }

    /// The pool decoded pictures are allocated from.
    pub fn pool(&self) -> &FrameBufferPool {
        &self.shared.pool
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /**
        Start the worker thread.

        Does nothing if the worker is already running or has already run:
        a source plays its input once.
    */
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock();
        if self.shared.running.load(Ordering::Acquire) {
            debug!("source already running");
            return Ok(());
        }
        let Some(container) = self.container.lock().take() else {
            debug!("source already consumed");
            return Ok(());
        };

        self.shared.running.store(true, Ordering::Release);
        let shared = Arc::clone(&self.shared);
        let spawned = thread::Builder::new()
            .name("media-source".into())
            .spawn(move || run(shared, container));

        match spawned {
            Ok(handle) => {
                worker.handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.shared.running.store(false, Ordering::Release);
                Err(Error::Spawn(e))
            }
        }
    }

    /**
        Ask the worker to stop after the packet it is processing. Does not
        wait for it; the worker still flushes its decoders and moves to
        `Ended` before exiting.
    */
    pub fn stop(&self) {
        let _worker = self.worker.lock();
        if self.shared.running.swap(false, Ordering::AcqRel) {
            debug!("stop requested");
        }
    }

    /**
        Block until the worker thread exits and return its outcome.

        Returns `Ok(())` if the worker was never started or its outcome was
        already collected.
    */
    pub fn wait(&self) -> Result<()> {
        let handle = self.worker.lock().handle.take();
        match handle {
            // A listener dropping the source from the worker thread itself.
            Some(handle) if handle.thread().id() == thread::current().id() => Ok(()),
            Some(handle) => handle.join().unwrap_or(Err(Error::WorkerPanicked)),
            None => Ok(()),
        }
    }

    /**
        Stop the worker, wait for it and release all resources: the container,
        sinks, state listeners and the pool's recycled memory. Safe to call
        more than once.
    */
    pub fn dispose(&self) {
        self.stop();
        if let Err(e) = self.wait() {
            warn!(error = %e, "worker ended with an error");
        }
        if self.container.lock().take().is_some() {
            debug!("released unplayed container");
        }
        self.shared.audio_sink.remove();
        self.shared.video_sink.remove();
        self.shared.state.disconnect_all();
        self.shared.pool.clear();
    }
}

impl Drop for MediaSource {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for MediaSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaSource")
            .field("path", &self.shared.path)
            .field("state", &self.state())
            .field("duration_us", &self.duration_us)
            .field("streams", &self.streams.len())
            .finish_non_exhaustive()
    }
}

/**
    Build descriptors for every stream with an available decoder.
*/
fn describe_streams(probed: &[ProbedStream]) -> Vec<StreamDescriptor> {
    let mut streams = Vec::with_capacity(probed.len());
    for stream in probed {
        let kind = match stream.kind {
            MediaKind::Audio => StreamKind::Audio(AudioStreamInfo {
                channels: stream.channels,
                sample_rate: stream.sample_rate,
            }),
            MediaKind::Video => StreamKind::Video(VideoStreamInfo {
                width: stream.width,
                height: stream.height,
                pixel_format_name: stream
                    .pixel_format_name
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
                frame_rate: stream.frame_rate.to_f64(),
            }),
            MediaKind::Other => continue,
        };
        let Some(codec) = &stream.decoder else {
            warn!(
                stream_index = stream.index,
                kind = %stream.kind,
                "unsupported codec, skipping stream"
            );
            continue;
        };
        streams.push(StreamDescriptor {
            stream_index: stream.index,
            codec_name: codec.name.clone(),
            codec_long_name: codec.long_name.clone(),
            bitrate: stream.bitrate,
            kind,
        });
    }
    streams
}

/**
    Worker thread body.
*/
fn run(shared: Arc<Shared>, container: Box<dyn Container>) -> Result<()> {
    let outcome = play(&shared, container);
    shared.running.store(false, Ordering::Release);
    outcome
}

fn play(shared: &Shared, container: Box<dyn Container>) -> Result<()> {
    let mut session = match Session::initialize(shared, container) {
        Ok(session) => session,
        Err(e) => {
            error!(path = %shared.path.display(), error = %e, "failed to initialize source");
            return Err(e);
        }
    };

    shared.state.set(SourceState::Live);
    info!(path = %shared.path.display(), "source live");

    let outcome = session.read_loop(shared);
    if let Err(e) = &outcome {
        error!(error = %e, "decoding aborted");
    }
    let flushed = session.flush();

    shared.state.set(SourceState::Ended);
    info!(
        path = %shared.path.display(),
        packets = session.packets_read,
        rewinds = session.rewinds,
        "source ended"
    );
    drop(session);

    outcome.and(flushed)
}

/**
    Resources owned by the worker for one run.
*/
struct Session {
    container: Box<dyn Container>,
    packet: Packet,
    video: Option<Decoder>,
    audio: Option<Decoder>,
    packets_read: u64,
    rewinds: u64,
}

impl Session {
    fn initialize(shared: &Shared, mut container: Box<dyn Container>) -> Result<Self> {
        let video = if shared.stream_filter.wants(MediaKind::Video) {
            open_decoder(shared, container.as_mut(), MediaKind::Video)?
        } else {
            None
        };
        let audio = if shared.stream_filter.wants(MediaKind::Audio) {
            open_decoder(shared, container.as_mut(), MediaKind::Audio)?
        } else {
            None
        };

        if video.is_none() && audio.is_none() {
            return Err(Error::NoDecodableStream);
        }

        Ok(Self {
            container,
            packet: Packet::empty(),
            video,
            audio,
            packets_read: 0,
            rewinds: 0,
        })
    }

    fn read_loop(&mut self, shared: &Shared) -> Result<()> {
        let mut packets_since_rewind = 0u64;

        while shared.running.load(Ordering::Acquire) {
            match self.container.read_packet(&mut self.packet) {
                Ok(true) => {}
                Ok(false) => {
                    if !shared.looping.load(Ordering::Acquire) {
                        debug!("end of input");
                        break;
                    }
                    if packets_since_rewind == 0 {
                        warn!("input produced no packets, not looping");
                        break;
                    }
                    if !self.restart()? {
                        break;
                    }
                    packets_since_rewind = 0;
                    continue;
                }
                Err(e) => {
                    warn!(error = %e, "read failed, treating as end of input");
                    break;
                }
            }
            self.packets_read += 1;
            packets_since_rewind += 1;

            let index = self.packet.stream_index;
            let decoder = match (&mut self.video, &mut self.audio) {
                (Some(video), _) if video.stream_index() == index => Some(video),
                (_, Some(audio)) if audio.stream_index() == index => Some(audio),
                _ => None,
            };
            let decoded = match decoder {
                Some(decoder) => decoder.decode(&self.packet),
                None => Ok(()),
            };
            self.packet.clear();
            decoded?;
        }

        Ok(())
    }

    /**
        Drain the decoders and seek back to the start of the input. Returns
        false if the input cannot be rewound.
    */
    fn restart(&mut self) -> Result<bool> {
        self.flush()?;
        for decoder in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            decoder.reset();
        }
        if let Err(e) = self.container.rewind() {
            warn!(error = %e, "could not rewind input, not looping");
            return Ok(false);
        }
        self.rewinds += 1;
        debug!(rewinds = self.rewinds, "rewound input");
        Ok(true)
    }

    /**
        Flush video, then audio. Both are flushed even if the first fails;
        the first error is returned.
    */
    fn flush(&mut self) -> Result<()> {
        let mut outcome = Ok(());
        for decoder in [self.video.as_mut(), self.audio.as_mut()].into_iter().flatten() {
            if let Err(e) = decoder.flush() {
                warn!(stream_index = decoder.stream_index(), error = %e, "flush failed");
                if outcome.is_ok() {
                    outcome = Err(e);
                }
            }
        }
        outcome
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Decoders first: they may still reference container resources.
        if let Some(mut video) = self.video.take() {
            video.close();
        }
        if let Some(mut audio) = self.audio.take() {
            audio.close();
        }
    }
}

fn open_decoder(
    shared: &Shared,
    container: &mut dyn Container,
    kind: MediaKind,
) -> Result<Option<Decoder>> {
    let Some(index) = container.best_stream(kind) else {
        warn!(%kind, "could not find a stream");
        return Ok(None);
    };
    let Some(stream) = container.streams().iter().find(|s| s.index == index) else {
        warn!(%kind, stream_index = index, "preferred stream is not in the stream list");
        return Ok(None);
    };
    if stream.decoder.is_none() {
        warn!(%kind, stream_index = index, "no decoder for preferred stream");
        return Ok(None);
    }

    let time_base = stream.time_base;
    let handler: Box<dyn crate::decoder::FrameHandler> = match kind {
        MediaKind::Video => Box::new(VideoFrameHandler::new(
            Arc::clone(&shared.video_sink),
            shared.pool.clone(),
        )),
        _ => Box::new(AudioFrameHandler::new(Arc::clone(&shared.audio_sink))),
    };

    let mut decoder = Decoder::new(index, time_base, handler);
    decoder.open(container)?;
    info!(%kind, stream_index = index, %time_base, "decoder ready");
    Ok(Some(decoder))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CodecDescription;
    use media_types::Rational;

    fn probed(index: usize, kind: MediaKind, decodable: bool) -> ProbedStream {
        let mut stream = ProbedStream::new(index, kind);
        if decodable {
            stream.decoder = Some(CodecDescription {
                name: "test".into(),
                long_name: "Test codec".into(),
            });
        }
        stream.frame_rate = Rational::new(30_000, 1001);
        stream
    }

    #[test]
    fn undecodable_and_data_streams_are_skipped() {
        let streams = describe_streams(&[
            probed(0, MediaKind::Video, true),
            probed(1, MediaKind::Audio, false),
            probed(2, MediaKind::Other, true),
            probed(3, MediaKind::Audio, true),
        ]);
        let indices: Vec<_> = streams.iter().map(|s| s.stream_index).collect();
        assert_eq!(indices, vec![0, 3]);
    }

    #[test]
    fn video_descriptor_defaults() {
        let streams = describe_streams(&[probed(0, MediaKind::Video, true)]);
        let video = streams[0].video().unwrap();
        assert_eq!(video.pixel_format_name, "unknown");
        assert!((video.frame_rate - 29.97).abs() < 0.01);
    }

    #[test]
    fn stream_filter_selection() {
        assert!(StreamFilter::Both.wants(MediaKind::Audio));
        assert!(StreamFilter::Both.wants(MediaKind::Video));
        assert!(!StreamFilter::Both.wants(MediaKind::Other));
        assert!(StreamFilter::VideoOnly.wants(MediaKind::Video));
        assert!(!StreamFilter::VideoOnly.wants(MediaKind::Audio));
        assert!(!StreamFilter::AudioOnly.wants(MediaKind::Video));
    }
}
