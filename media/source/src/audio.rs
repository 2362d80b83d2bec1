/*!
    Audio frame delivery.
*/

use std::sync::Arc;

use media_types::{MICROS_PER_SECOND, Rational, Result, SampleFormat};
use tracing::{trace, warn};

use crate::backend::{Frame, FrameData};
use crate::decoder::FrameHandler;
use crate::sink::SinkSlot;

/**
    A decoded block of interleaved PCM, borrowed for the duration of the
    sink callback.
*/
#[derive(Clone, Copy, Debug)]
pub struct AudioFrame<'a> {
    pub sample_count: usize,
    pub channel_count: u32,
    pub sample_rate: u32,
    pub sample_format: SampleFormat,
    /// Presentation timestamp in stream time base units.
    pub pts: Option<i64>,
    /// Presentation timestamp in microseconds.
    pub timestamp_us: i64,
    /// Interleaved samples, `sample_count * channel_count` of them.
    pub data: &'a [u8],
}

impl AudioFrame<'_> {
    pub fn duration_us(&self) -> i64 {
        if self.sample_rate == 0 {
            return 0;
        }
        (self.sample_count as i64 * MICROS_PER_SECOND) / self.sample_rate as i64
    }
}

/**
    Consumer of decoded audio. Called on the source's worker thread.
*/
pub trait AudioSink: Send + Sync {
    fn on_audio_frame(&self, frame: &AudioFrame<'_>);
}

/**
    Forwards decoded audio frames to the installed audio sink.
*/
pub struct AudioFrameHandler {
    sink: Arc<SinkSlot<dyn AudioSink>>,
}

impl AudioFrameHandler {
    pub fn new(sink: Arc<SinkSlot<dyn AudioSink>>) -> Self {
        Self { sink }
    }
}

impl FrameHandler for AudioFrameHandler {
    fn process_frame(&mut self, frame: &Frame, time_base: Rational) -> Result<()> {
        let FrameData::Audio(audio) = &frame.data else {
            warn!("audio decoder produced a non-audio frame");
            return Ok(());
        };
        let Some(sample_format) = audio.format else {
            warn!("dropping audio frame with unsupported sample format");
            return Ok(());
        };
        let expected = sample_format.frame_size(audio.channel_count) * audio.sample_count;
        if audio.samples.len() < expected {
            warn!(
                bytes = audio.samples.len(),
                expected, "dropping truncated audio frame"
            );
            return Ok(());
        }

        let timestamp_us = frame
            .timestamp()
            .map(|ts| time_base.rescale_to_micros(ts))
            .unwrap_or(0);
        let delivered = self.sink.deliver(|sink| {
            sink.on_audio_frame(&AudioFrame {
                sample_count: audio.sample_count,
                channel_count: audio.channel_count,
                sample_rate: audio.sample_rate,
                sample_format,
                pts: frame.pts,
                timestamp_us,
                data: &audio.samples[..expected],
            })
        });
        if !delivered {
            trace!(timestamp_us, "no audio sink, frame dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::AudioData;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(usize, u32, i64, usize)>>);

    impl AudioSink for Recorder {
        fn on_audio_frame(&self, frame: &AudioFrame<'_>) {
            self.0.lock().push((
                frame.sample_count,
                frame.channel_count,
                frame.timestamp_us,
                frame.data.len(),
            ));
        }
    }

    fn pcm_frame(pts: i64, format: Option<SampleFormat>) -> Frame {
        Frame {
            pts: Some(pts),
            best_effort_timestamp: None,
            data: FrameData::Audio(AudioData {
                sample_count: 1024,
                channel_count: 2,
                sample_rate: 48_000,
                format,
                samples: vec![0; 1024 * 2 * 2],
            }),
        }
    }

    #[test]
    fn delivers_interleaved_frame_with_timestamp() {
        let slot: Arc<SinkSlot<dyn AudioSink>> = Arc::new(SinkSlot::new());
        let recorder = Arc::new(Recorder::default());
        slot.set(recorder.clone());

        let mut handler = AudioFrameHandler::new(slot);
        handler
            .process_frame(&pcm_frame(1024, Some(SampleFormat::S16)), Rational::new(1, 48_000))
            .unwrap();

        assert_eq!(*recorder.0.lock(), vec![(1024, 2, 21_333, 4096)]);
    }

    #[test]
    fn unsupported_format_is_skipped() {
        let slot: Arc<SinkSlot<dyn AudioSink>> = Arc::new(SinkSlot::new());
        let recorder = Arc::new(Recorder::default());
        slot.set(recorder.clone());

        let mut handler = AudioFrameHandler::new(slot);
        handler
            .process_frame(&pcm_frame(0, None), Rational::new(1, 48_000))
            .unwrap();
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn truncated_frame_is_skipped() {
        let slot: Arc<SinkSlot<dyn AudioSink>> = Arc::new(SinkSlot::new());
        let recorder = Arc::new(Recorder::default());
        slot.set(recorder.clone());

        let mut frame = pcm_frame(0, Some(SampleFormat::S16));
        if let FrameData::Audio(audio) = &mut frame.data {
            audio.samples.truncate(1000);
        }
        let mut handler = AudioFrameHandler::new(slot);
        handler.process_frame(&frame, Rational::new(1, 48_000)).unwrap();
        assert!(recorder.0.lock().is_empty());
    }

    #[test]
    fn frame_duration() {
        let data = [0u8; 0];
        let frame = AudioFrame {
            sample_count: 480,
            channel_count: 1,
            sample_rate: 48_000,
            sample_format: SampleFormat::F32,
            pts: None,
            timestamp_us: 0,
            data: &data,
        };
        assert_eq!(frame.duration_us(), 10_000);
    }
}
