use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use media_source::StreamFilter;

mod play;
mod probe;

pub use play::PlayCommand;
pub use probe::ProbeCommand;

#[derive(Parser, Debug)]
#[command(name = "mediasrc")]
#[command(about = "Probe and decode media files")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Print the decodable streams of a file
    Probe(ProbeCommand),
    /// Decode a file to completion and print frame statistics
    Play(PlayCommand),
}

impl Args {
    pub fn run(self) -> Result<()> {
        match self.command {
            Command::Probe(cmd) => cmd.run(),
            Command::Play(cmd) => cmd.run(),
        }
    }
}

/// Streams to decode.
#[derive(Clone, Copy, Debug, Default, ValueEnum)]
pub enum Streams {
    Audio,
    Video,
    #[default]
    Both,
}

impl From<Streams> for StreamFilter {
    fn from(streams: Streams) -> Self {
        match streams {
            Streams::Audio => StreamFilter::AudioOnly,
            Streams::Video => StreamFilter::VideoOnly,
            Streams::Both => StreamFilter::Both,
        }
    }
}
