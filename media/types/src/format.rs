/*!
    Audio sample formats.
*/

use serde::Serialize;

/**
    Sample format of decoded audio delivered to sinks.

    Decoded audio is always delivered interleaved, so there is no planar
    variant here. Backends interleave planar output before handing it over.
*/
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum SampleFormat {
    /// Unsigned 8-bit integer
    U8,
    /// Signed 16-bit integer
    S16,
    /// Signed 32-bit integer
    S32,
    /// 32-bit floating point, range [-1.0, 1.0]
    F32,
    /// 64-bit floating point
    F64,
}

impl SampleFormat {
    pub const fn bytes_per_sample(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::S16 => 2,
            Self::S32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /**
        Short name matching the packed FFmpeg sample format names.
    */
    pub const fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::S16 => "s16",
            Self::S32 => "s32",
            Self::F32 => "flt",
            Self::F64 => "dbl",
        }
    }

    /**
        Number of bytes one interleaved frame of `channels` samples occupies.
    */
    pub const fn frame_size(self, channels: u32) -> usize {
        self.bytes_per_sample() * channels as usize
    }
}
