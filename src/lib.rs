#![allow(dead_code)]

/// Registers FFmpeg components (codecs, muxers, filters). Call once at
/// startup before constructing a [`writer::FrameWriter`].
pub fn init() -> Result<(), error::WriterError> {
    ffmpeg_next::init().map_err(error::WriterError::Codec)
}

pub mod audio;
pub mod config;
pub mod encoder;
pub mod error;
pub mod filter;
pub mod hw;
pub mod output;
pub mod packet;
pub mod pixfmt;
pub mod writer;

pub use config::{InputFormat, WriterConfig};
pub use error::WriterError;
pub use writer::FrameWriter;
