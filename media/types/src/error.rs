use std::path::PathBuf;

use thiserror::Error;

/**
    Errors produced by a media source and its decoders.

    `Open` and `StreamInfo` surface synchronously from construction. The
    decoder-related variants are produced on the worker thread and reported
    through the source's worker outcome.
*/
#[derive(Debug, Error)]
pub enum Error {
    #[error("could not open source file {path}: {reason}")]
    Open { path: PathBuf, reason: String },

    #[error("could not find stream information in {path}: {reason}")]
    StreamInfo { path: PathBuf, reason: String },

    #[error("could not find a decodable audio or video stream in the input")]
    NoDecodableStream,

    #[error("failed to initialize decoder for stream {stream_index}: {reason}")]
    DecoderInit { stream_index: usize, reason: String },

    #[error("decoding stream {stream_index} failed: {reason}")]
    Decode { stream_index: usize, reason: String },

    #[error("invalid picture size {width}x{height}")]
    BufferAllocation { width: i64, height: i64 },

    #[error("decoded picture does not fit its buffer: {0}")]
    InvalidView(String),

    #[error("failed to start worker thread: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("worker thread panicked")]
    WorkerPanicked,
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_failing_stream() {
        let err = Error::DecoderInit {
            stream_index: 3,
            reason: "no decoder for codec".into(),
        };
        assert_eq!(
            err.to_string(),
            "failed to initialize decoder for stream 3: no decoder for codec"
        );
    }
}
