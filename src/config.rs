use std::collections::HashMap;

/// Capture sample rate the audio path is fed with (PulseAudio-style float
/// stream).
pub const AUDIO_RATE: u32 = 44_100;

/// Pixel layout of the raw capture buffers handed to [`crate::FrameWriter`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    /// Packed BGRX, 8 bits per channel, padding byte last.
    Bgr0,
    /// Packed RGBX, 8 bits per channel, padding byte last.
    Rgb0,
    /// Packed 8-bit RGB (3:3:2).
    Bgr8,
}

impl InputFormat {
    /// Bytes per pixel in this layout.
    pub fn bytes_per_pixel(self) -> usize {
        match self {
            InputFormat::Bgr0 | InputFormat::Rgb0 => 4,
            InputFormat::Bgr8 => 1,
        }
    }
}

/// Immutable stream configuration, supplied at construction and owned by the
/// writer for the pipeline's lifetime.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Output file path.
    pub file: String,
    pub width: u32,
    pub height: u32,
    /// Row stride of the input buffers, in bytes.
    pub stride: usize,

    pub format: InputFormat,

    /// Filter expression spliced between the graph source and sink.
    /// "null" is the identity pass-through.
    pub video_filter: String,

    /// Video encoder name (e.g. "libx264", "h264_vaapi").
    pub codec: String,
    /// Container format name (e.g. "mp4", "matroska"). Empty = guess from
    /// the file extension.
    pub muxer: String,
    /// Forced output pixel format name. Empty = negotiate with the codec.
    pub pix_fmt: String,
    /// Hardware device path (e.g. "/dev/dri/renderD128"). Only consulted for
    /// hardware codec families; empty = default device.
    pub hw_device: String,
    /// Codec-private options applied at open.
    pub codec_options: HashMap<String, String>,

    /// Shift applied once to the first audio timestamp, in microseconds.
    pub audio_sync_offset: i64,

    pub enable_audio: bool,
    /// Raise the native FFmpeg log level to debug.
    pub enable_ffmpeg_debug_output: bool,

    /// Force limited-range yuv420p output instead of preferring full-range
    /// formats.
    pub force_yuv: bool,
    /// Number of consecutive B-frames the video encoder may use.
    pub bframes: i32,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            file: String::new(),
            width: 0,
            height: 0,
            stride: 0,
            format: InputFormat::Bgr0,
            video_filter: "null".to_string(),
            codec: "libx264".to_string(),
            muxer: String::new(),
            pix_fmt: String::new(),
            hw_device: String::new(),
            codec_options: HashMap::new(),
            audio_sync_offset: 0,
            enable_audio: false,
            enable_ffmpeg_debug_output: false,
            force_yuv: false,
            bframes: 0,
        }
    }
}

impl WriterConfig {
    /// Minimum byte length of one frame buffer in this configuration.
    pub fn frame_buffer_size(&self) -> usize {
        self.stride * self.height as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_per_pixel() {
        assert_eq!(InputFormat::Bgr0.bytes_per_pixel(), 4);
        assert_eq!(InputFormat::Rgb0.bytes_per_pixel(), 4);
        assert_eq!(InputFormat::Bgr8.bytes_per_pixel(), 1);
    }

    #[test]
    fn frame_buffer_size_uses_stride() {
        let config = WriterConfig {
            width: 100,
            height: 10,
            stride: 416,
            ..Default::default()
        };
        assert_eq!(config.frame_buffer_size(), 4160);
    }
}
