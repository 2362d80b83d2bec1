use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use media_source::{MediaSource, StreamDescriptor, StreamKind};
use serde::Serialize;

#[derive(Parser, Debug)]
pub struct ProbeCommand {
    /// Media file to inspect
    pub path: PathBuf,

    /// Print JSON instead of text
    #[arg(long)]
    pub json: bool,
}

#[derive(Serialize)]
struct ProbeReport<'a> {
    path: &'a std::path::Path,
    duration_us: u64,
    bitrate: u64,
    streams: &'a [StreamDescriptor],
}

impl ProbeCommand {
    pub fn run(self) -> Result<()> {
        let source = MediaSource::open(&self.path)
            .with_context(|| format!("failed to open {}", self.path.display()))?;

        let report = ProbeReport {
            path: source.path(),
            duration_us: source.duration(),
            bitrate: source.bitrate(),
            streams: source.stream_info(),
        };

        if self.json {
            let json = serde_json::to_string_pretty(&report)
                .context("failed to serialize probe report")?;
            println!("{json}");
            return Ok(());
        }

        println!("File:     {}", report.path.display());
        println!("Duration: {:.3}s", report.duration_us as f64 / 1_000_000.0);
        println!("Bitrate:  {} kb/s", report.bitrate / 1000);
        if report.streams.is_empty() {
            println!("No decodable streams");
        }
        for stream in report.streams {
            println!("{}", describe(stream));
        }
        Ok(())
    }
}

fn describe(stream: &StreamDescriptor) -> String {
    let details = match &stream.kind {
        StreamKind::Audio(audio) => format!(
            "audio, {} Hz, {} channels",
            audio.sample_rate, audio.channels
        ),
        StreamKind::Video(video) => format!(
            "video, {}x{} ({:.2}:1), {}, {:.2} fps",
            video.width,
            video.height,
            video.aspect_ratio(),
            video.pixel_format_name,
            video.frame_rate
        ),
    };
    format!(
        "  #{}: {} ({}), {}, {} kb/s",
        stream.stream_index,
        stream.codec_name,
        stream.codec_long_name,
        details,
        stream.bitrate / 1000
    )
}
