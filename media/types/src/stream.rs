/*!
    Stream descriptor types.
*/

use serde::Serialize;

/**
    Audio-specific stream parameters.
*/
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct AudioStreamInfo {
    /// Number of audio channels.
    pub channels: u32,
    /// Sample rate in Hz.
    pub sample_rate: u32,
}

/**
    Video-specific stream parameters.
*/
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct VideoStreamInfo {
    /// Frame width in pixels.
    pub width: u32,
    /// Frame height in pixels.
    pub height: u32,
    /// Pixel format name as reported by the codec library, or "unknown".
    pub pixel_format_name: String,
    /// Frame rate in frames per second, 0.0 if unknown.
    pub frame_rate: f64,
}

impl VideoStreamInfo {
    /**
        Returns the aspect ratio, or 0.0 if the height is unknown.
    */
    pub fn aspect_ratio(&self) -> f64 {
        if self.height == 0 {
            0.0
        } else {
            self.width as f64 / self.height as f64
        }
    }
}

/**
    Type-specific payload of a stream descriptor.
*/
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StreamKind {
    Audio(AudioStreamInfo),
    Video(VideoStreamInfo),
}

/**
    Metadata for one decodable elementary stream of a container.

    Descriptors are created once while the container is probed and are
    immutable afterwards.
*/
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StreamDescriptor {
    /// Index of the stream inside the container.
    pub stream_index: usize,
    /// Short codec name, e.g. "h264".
    pub codec_name: String,
    /// Descriptive codec name, e.g. "H.264 / AVC / MPEG-4 AVC / MPEG-4 part 10".
    pub codec_long_name: String,
    /// Bitrate in bits per second, 0 if unknown.
    pub bitrate: u64,
    /// Audio or video parameters.
    #[serde(flatten)]
    pub kind: StreamKind,
}

impl StreamDescriptor {
    pub fn is_audio(&self) -> bool {
        matches!(self.kind, StreamKind::Audio(_))
    }

    pub fn is_video(&self) -> bool {
        matches!(self.kind, StreamKind::Video(_))
    }

    pub fn audio(&self) -> Option<&AudioStreamInfo> {
        match &self.kind {
            StreamKind::Audio(info) => Some(info),
            StreamKind::Video(_) => None,
        }
    }

    pub fn video(&self) -> Option<&VideoStreamInfo> {
        match &self.kind {
            StreamKind::Video(info) => Some(info),
            StreamKind::Audio(_) => None,
        }
    }
}
