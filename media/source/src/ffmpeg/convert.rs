/*!
    Conversion utilities between ffmpeg-next types and media-types.
*/

use std::ffi::CStr;

use ffmpeg_next::{ffi, util::frame::audio::Audio as AudioFrameFFmpeg};
use media_types::{Rational, SampleFormat};

use crate::backend::{BackendError, MediaKind};

pub fn rational_from_ffmpeg(r: ffmpeg_next::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

pub fn media_kind_from_ffmpeg(medium: ffmpeg_next::media::Type) -> MediaKind {
    use ffmpeg_next::media::Type;

    match medium {
        Type::Audio => MediaKind::Audio,
        Type::Video => MediaKind::Video,
        _ => MediaKind::Other,
    }
}

pub fn media_kind_to_ffmpeg(kind: MediaKind) -> Option<ffmpeg_next::media::Type> {
    use ffmpeg_next::media::Type;

    match kind {
        MediaKind::Audio => Some(Type::Audio),
        MediaKind::Video => Some(Type::Video),
        MediaKind::Other => None,
    }
}

/**
    Convert an FFmpeg sample format to our SampleFormat, ignoring layout.
*/
pub fn sample_format_from_ffmpeg(format: ffmpeg_next::format::Sample) -> Option<SampleFormat> {
    use ffmpeg_next::format::Sample;

    match format {
        Sample::F32(_) => Some(SampleFormat::F32),
        Sample::F64(_) => Some(SampleFormat::F64),
        Sample::I16(_) => Some(SampleFormat::S16),
        Sample::I32(_) => Some(SampleFormat::S32),
        Sample::U8(_) => Some(SampleFormat::U8),
        _ => None,
    }
}

/**
    FFmpeg's name for a pixel format, e.g. "yuv420p".
*/
pub fn pixel_format_name(format: ffi::AVPixelFormat) -> Option<String> {
    if format == ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        return None;
    }
    // SAFETY: av_get_pix_fmt_name returns null or a static C string.
    unsafe {
        let name = ffi::av_get_pix_fmt_name(format);
        if name.is_null() {
            None
        } else {
            CStr::from_ptr(name).to_str().ok().map(str::to_owned)
        }
    }
}

pub fn timestamp_from_ffmpeg(ts: i64) -> Option<i64> {
    (ts != ffi::AV_NOPTS_VALUE).then_some(ts)
}

/**
    Copy audio samples from an FFmpeg frame into `output` as interleaved PCM.

    Handles both planar and packed formats. For planar audio, FFmpeg stores
    each channel in a separate plane and they are interleaved here.

    In FFmpeg planar audio, linesize[0] holds the size of every plane while
    linesize[1..] may be 0, so planes are addressed through their pointers
    using the size of plane 0. Channel pointers are read from
    `extended_data`, which unlike `data` also covers layouts with more than
    eight channels.
*/
pub fn copy_audio_data(
    frame: &AudioFrameFFmpeg,
    format: SampleFormat,
    output: &mut Vec<u8>,
) -> Result<(), BackendError> {
    let samples = frame.samples();
    let channels = frame.channels() as usize;
    let bytes_per_sample = format.bytes_per_sample();
    let total_bytes = samples * channels * bytes_per_sample;
    let expected_plane_bytes = samples * bytes_per_sample;

    output.clear();
    if samples == 0 || frame.planes() == 0 {
        return Ok(());
    }

    if frame.is_planar() && frame.planes() >= channels {
        let plane_size = frame.data(0).len();
        if plane_size < expected_plane_bytes {
            return Err(BackendError::Codec(format!(
                "audio plane holds {} bytes, expected {} for {} samples",
                plane_size, expected_plane_bytes, samples
            )));
        }

        // SAFETY: reading a field of a frame filled by the decoder.
        let extended = unsafe { (*frame.as_ptr()).extended_data };
        if extended.is_null() {
            return Err(BackendError::Codec("planar audio without channel pointers".into()));
        }

        output.resize(total_bytes, 0);
        for ch in 0..channels {
            // SAFETY: extended_data of a planar frame holds one pointer per
            // channel, and every plane is as large as plane 0.
            let plane = unsafe {
                let ptr = *extended.add(ch);
                if ptr.is_null() {
                    return Err(BackendError::Codec(format!("audio plane {} is missing", ch)));
                }
                std::slice::from_raw_parts(ptr, plane_size)
            };

            for s in 0..samples {
                let src = s * bytes_per_sample;
                let dst = (s * channels + ch) * bytes_per_sample;
                output[dst..dst + bytes_per_sample]
                    .copy_from_slice(&plane[src..src + bytes_per_sample]);
            }
        }
    } else {
        let packed = frame.data(0);
        if packed.len() < total_bytes {
            return Err(BackendError::Codec(format!(
                "packed audio holds {} bytes, expected at least {}",
                packed.len(),
                total_bytes
            )));
        }
        output.extend_from_slice(&packed[..total_bytes]);
    }

    Ok(())
}

pub fn error_from_ffmpeg(error: ffmpeg_next::Error) -> BackendError {
    match error {
        ffmpeg_next::Error::Other { errno } if errno == ffi::EAGAIN => BackendError::Again,
        ffmpeg_next::Error::Eof => BackendError::Eof,
        e => BackendError::Codec(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rational_conversion() {
        let r = rational_from_ffmpeg(ffmpeg_next::Rational::new(1, 90_000));
        assert_eq!(r, Rational::new(1, 90_000));
    }

    #[test]
    fn sample_formats_ignore_layout() {
        use ffmpeg_next::format::Sample;
        use ffmpeg_next::format::sample::Type;

        assert_eq!(
            sample_format_from_ffmpeg(Sample::F32(Type::Planar)),
            Some(SampleFormat::F32)
        );
        assert_eq!(
            sample_format_from_ffmpeg(Sample::I16(Type::Packed)),
            Some(SampleFormat::S16)
        );
        assert_eq!(sample_format_from_ffmpeg(Sample::None), None);
    }

    #[test]
    fn pixel_format_names() {
        assert_eq!(
            pixel_format_name(ffi::AVPixelFormat::AV_PIX_FMT_YUV420P).as_deref(),
            Some("yuv420p")
        );
        assert_eq!(pixel_format_name(ffi::AVPixelFormat::AV_PIX_FMT_NONE), None);
    }

    #[test]
    fn missing_timestamps() {
        assert_eq!(timestamp_from_ffmpeg(ffi::AV_NOPTS_VALUE), None);
        assert_eq!(timestamp_from_ffmpeg(42), Some(42));
    }

    #[test]
    fn planar_audio_beyond_eight_channels_is_interleaved() {
        const CHANNELS: usize = 12;
        const SAMPLES: usize = 4;

        let mut frame = AudioFrameFFmpeg::empty();
        unsafe {
            let ptr = frame.as_mut_ptr();
            (*ptr).format = ffi::AVSampleFormat::AV_SAMPLE_FMT_FLTP as i32;
            (*ptr).nb_samples = SAMPLES as i32;
            ffi::av_channel_layout_default(&mut (*ptr).ch_layout, CHANNELS as i32);
            assert_eq!(ffi::av_frame_get_buffer(ptr, 0), 0);
            for ch in 0..CHANNELS {
                let plane = *(*ptr).extended_data.add(ch) as *mut f32;
                for s in 0..SAMPLES {
                    *plane.add(s) = (ch * 100 + s) as f32;
                }
            }
        }
        assert!(frame.is_planar());

        let mut output = Vec::new();
        copy_audio_data(&frame, SampleFormat::F32, &mut output).unwrap();
        assert_eq!(output.len(), SAMPLES * CHANNELS * 4);

        let sample = |s: usize, ch: usize| {
            let at = (s * CHANNELS + ch) * 4;
            f32::from_ne_bytes(output[at..at + 4].try_into().unwrap())
        };
        assert_eq!(sample(0, 0), 0.0);
        assert_eq!(sample(1, 9), 901.0);
        assert_eq!(sample(3, 11), 1103.0);
    }

    #[test]
    fn error_mapping() {
        assert!(matches!(
            error_from_ffmpeg(ffmpeg_next::Error::Eof),
            BackendError::Eof
        ));
        assert!(matches!(
            error_from_ffmpeg(ffmpeg_next::Error::Other { errno: ffi::EAGAIN }),
            BackendError::Again
        ));
    }
}
