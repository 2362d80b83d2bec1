use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use media_source::{
    AudioFrame, AudioSink, MediaSource, SourceConfig, SourceState, VideoFrame, VideoSink,
};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::info;

use super::Streams;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Parser, Debug)]
pub struct PlayCommand {
    /// Media file to decode
    pub path: PathBuf,

    /// Which streams to decode
    #[arg(long, value_enum, default_value_t = Streams::Both)]
    pub streams: Streams,

    /// Restart from the beginning when the file ends
    #[arg(long = "loop")]
    pub looping: bool,

    /// Stop after this many seconds of wall-clock time
    #[arg(long)]
    pub max_seconds: Option<f64>,

    /// Print the summary as JSON
    #[arg(long)]
    pub json: bool,
}

#[derive(Debug, Default, Serialize)]
struct StreamStats {
    frames: u64,
    first_timestamp_us: Option<i64>,
    last_timestamp_us: Option<i64>,
}

impl StreamStats {
    fn record(&mut self, timestamp_us: i64) {
        self.frames += 1;
        self.first_timestamp_us.get_or_insert(timestamp_us);
        self.last_timestamp_us = Some(timestamp_us);
    }
}

#[derive(Debug, Default, Serialize)]
struct Summary {
    audio: StreamStats,
    audio_samples: u64,
    audio_bytes: u64,
    /// Playback time of all delivered audio.
    audio_duration_us: i64,
    audio_format: Option<&'static str>,
    video: StreamStats,
    video_size: Option<(u32, u32)>,
    states: Vec<SourceState>,
    elapsed_ms: u128,
}

/// Counts everything the source delivers.
#[derive(Default)]
struct FrameCounter {
    summary: Mutex<Summary>,
}

impl AudioSink for FrameCounter {
    fn on_audio_frame(&self, frame: &AudioFrame<'_>) {
        let mut summary = self.summary.lock();
        summary.audio.record(frame.timestamp_us);
        summary.audio_samples += frame.sample_count as u64;
        summary.audio_bytes += frame.data.len() as u64;
        summary.audio_duration_us += frame.duration_us();
        summary.audio_format = Some(frame.sample_format.name());
    }
}

impl VideoSink for FrameCounter {
    fn on_video_frame(&self, frame: VideoFrame) {
        let mut summary = self.summary.lock();
        summary.video.record(frame.timestamp_us);
        summary.video_size = Some((frame.view.width(), frame.view.height()));
    }
}

impl PlayCommand {
    pub fn run(self) -> Result<()> {
        let config = SourceConfig {
            stream_filter: self.streams.into(),
            looping: self.looping,
            ..SourceConfig::default()
        };
        let source = MediaSource::open_with_config(&self.path, config)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let counter = Arc::new(FrameCounter::default());
        source.set_audio_sink(counter.clone());
        source.set_video_sink(counter.clone());

        let states = counter.clone();
        source.on_state_change(move |state| {
            info!(%state, "source state changed");
            states.summary.lock().states.push(state);
        });

        let started = Instant::now();
        source.start().context("failed to start source")?;

        if let Some(limit) = self.max_seconds.map(Duration::from_secs_f64) {
            while source.is_running() && started.elapsed() < limit {
                std::thread::sleep(POLL_INTERVAL);
            }
            source.stop();
        }
        let outcome = source.wait();
        source.dispose();

        let mut summary = std::mem::take(&mut *counter.summary.lock());
        summary.elapsed_ms = started.elapsed().as_millis();
        outcome.with_context(|| format!("decoding {} failed", self.path.display()))?;

        if self.json {
            let json =
                serde_json::to_string_pretty(&summary).context("failed to serialize summary")?;
            println!("{json}");
        } else {
            print_summary(&summary);
        }
        Ok(())
    }
}

fn print_summary(summary: &Summary) {
    let states: Vec<String> = summary.states.iter().map(ToString::to_string).collect();
    println!("States: {}", states.join(" -> "));
    if summary.audio.frames > 0 {
        println!(
            "Audio:  {} frames, {} samples, {} bytes ({}), {:.3}s of sound, {}",
            summary.audio.frames,
            summary.audio_samples,
            summary.audio_bytes,
            summary.audio_format.unwrap_or("?"),
            summary.audio_duration_us as f64 / 1_000_000.0,
            span(&summary.audio)
        );
    }
    if summary.video.frames > 0 {
        let (width, height) = summary.video_size.unwrap_or_default();
        println!(
            "Video:  {} frames, {}x{}, {}",
            summary.video.frames,
            width,
            height,
            span(&summary.video)
        );
    }
    println!("Took:   {} ms", summary.elapsed_ms);
}

fn span(stats: &StreamStats) -> String {
    match (stats.first_timestamp_us, stats.last_timestamp_us) {
        (Some(first), Some(last)) => format!(
            "{:.3}s .. {:.3}s",
            first as f64 / 1_000_000.0,
            last as f64 / 1_000_000.0
        ),
        _ => "no timestamps".to_string(),
    }
}
