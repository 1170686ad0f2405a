//! Frame writer orchestrator.
//!
//! Owns every pipeline component and defines the startup and teardown
//! sequences. Synchronous from the caller's perspective: `add_frame` and
//! `add_audio` block for the duration of one encode step, and the caller is
//! responsible for serializing access (capture and audio threads each go
//! through their own mutex-protected submission path).

use ffmpeg_next::frame;
use tokio_util::sync::CancellationToken;

use crate::audio::AudioPipeline;
use crate::config::WriterConfig;
use crate::encoder::VideoPipeline;
use crate::error::WriterError;
use crate::filter::VideoFilter;
use crate::hw::{self, HwContext};
use crate::output::Muxer;
use crate::pixfmt::{self, ResolvedFormat};

pub struct FrameWriter {
    config: WriterConfig,
    /// Observer handle to the application-owned cancellation source.
    /// Advisory: checked at the top of each submission, never interrupts an
    /// in-flight encode.
    cancel: CancellationToken,
    resolved: ResolvedFormat,
    // Field order doubles as teardown order: pipelines and the filter graph
    // go before the hardware contexts, the output context last.
    video: VideoPipeline,
    audio: Option<AudioPipeline>,
    filter: VideoFilter,
    hw: Option<HwContext>,
    muxer: Muxer,
    finished: bool,
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter")
            .field("config", &self.config)
            .field("resolved", &self.resolved)
            .field("filter", &self.filter)
            .field("hw", &self.hw)
            .field("muxer", &self.muxer)
            .field("finished", &self.finished)
            .finish_non_exhaustive()
    }
}

impl FrameWriter {
    /// Build the full pipeline. Initialization order is fixed and each step
    /// fails fast: resolve pixel formats, open the hardware context if the
    /// codec needs one, build the filter graph, open the video codec and
    /// stream, open the audio codec and stream when enabled, then write the
    /// container header.
    pub fn new(config: WriterConfig, cancel: CancellationToken) -> Result<Self, WriterError> {
        if config.width == 0 || config.height == 0 {
            return Err(WriterError::Configuration(
                "frame dimensions must be non-zero".to_string(),
            ));
        }
        let min_stride = config.width as usize * config.format.bytes_per_pixel();
        if config.stride < min_stride {
            return Err(WriterError::Configuration(format!(
                "stride {} smaller than one row ({min_stride} bytes)",
                config.stride
            )));
        }

        if config.enable_ffmpeg_debug_output {
            ffmpeg_next::util::log::set_level(ffmpeg_next::util::log::Level::Debug);
        }

        let codec = ffmpeg_next::encoder::find_by_name(&config.codec).ok_or_else(|| {
            WriterError::Configuration(format!("video codec not found: {}", config.codec))
        })?;
        let resolved = pixfmt::resolve(&codec, &config)?;
        log::info!(
            "pipeline formats: {} -> {} (encoder {})",
            pixfmt::pixel_name(resolved.src),
            pixfmt::pixel_name(resolved.target),
            pixfmt::pixel_name(resolved.encoder),
        );

        let hw = if hw::is_hardware_codec(&config.codec) {
            Some(HwContext::new(
                &config.hw_device,
                config.width,
                config.height,
                hw::pool_size(config.bframes),
            )?)
        } else {
            None
        };

        let filter = VideoFilter::new(
            &config.video_filter,
            config.width,
            config.height,
            resolved.src,
            resolved.target,
        )?;

        let mut muxer = Muxer::new(&config.file, &config.muxer)?;

        // The container file exists on disk from this point; an init failure
        // past here must not leave it behind.
        let (video, audio) =
            match Self::open_streams(&config, resolved, &filter, hw.as_ref(), &mut muxer) {
                Ok(streams) => streams,
                Err(e) => {
                    remove_partial_output(&config.file);
                    return Err(e);
                }
            };

        Ok(Self {
            config,
            cancel,
            resolved,
            video,
            audio,
            filter,
            hw,
            muxer,
            finished: false,
        })
    }

    /// Open the codec pipelines, register their streams, and write the
    /// container header.
    fn open_streams(
        config: &WriterConfig,
        resolved: ResolvedFormat,
        filter: &VideoFilter,
        hw: Option<&HwContext>,
        muxer: &mut Muxer,
    ) -> Result<(VideoPipeline, Option<AudioPipeline>), WriterError> {
        let video = VideoPipeline::new(
            config,
            resolved,
            filter.sink_dimensions(),
            filter.sink_time_base(),
            hw,
            muxer,
        )?;
        let audio = if config.enable_audio {
            Some(AudioPipeline::new(config, muxer)?)
        } else {
            None
        };

        // Codec parameters for every stream are final; the header can go
        // out. A header rejected at this point is a codec/container
        // mismatch, not a runtime failure.
        muxer.write_header().map_err(|e| match e {
            WriterError::Codec(inner) => WriterError::Configuration(format!(
                "cannot write container header for codec {} in muxer {:?}: {inner}",
                config.codec, config.muxer
            )),
            other => other,
        })?;
        Ok((video, audio))
    }

    pub fn has_audio(&self) -> bool {
        self.audio.is_some()
    }

    /// Byte length expected per [`FrameWriter::add_audio`] call, or `None`
    /// when audio is disabled.
    pub fn audio_buffer_size(&self) -> Option<usize> {
        self.audio.as_ref().map(|a| a.required_buffer_size())
    }

    /// Submit one captured frame.
    ///
    /// `pixels` must hold at least `stride * height` bytes in the configured
    /// layout; `usec` is the presentation time since stream start;
    /// `y_invert` reads input rows bottom-to-top for sources that store
    /// frames flipped. Returns `Ok(false)` when the frame was rejected
    /// (cancellation) or dropped (timestamp regression, exhausted hardware
    /// pool, recoverable encode error).
    pub fn add_frame(
        &mut self,
        pixels: &[u8],
        usec: i64,
        y_invert: bool,
    ) -> Result<bool, WriterError> {
        if self.cancel.is_cancelled() {
            log::debug!("recording aborted, rejecting frame at {usec}us");
            return Ok(false);
        }
        if self.finished {
            return Err(WriterError::ContractViolation(
                "frame submitted after finish".to_string(),
            ));
        }
        if pixels.len() < self.config.frame_buffer_size() {
            return Err(WriterError::ContractViolation(format!(
                "pixel buffer too small: {} < {}",
                pixels.len(),
                self.config.frame_buffer_size()
            )));
        }

        let frame = self.prepare_frame(pixels, usec, y_invert);
        self.filter.push(&frame)?;

        let mut accepted = true;
        while let Some(filtered) = self.filter.pull()? {
            accepted &= self
                .video
                .submit(filtered, self.hw.as_ref(), &mut self.muxer)?;
        }
        Ok(accepted)
    }

    /// Submit one audio block of exactly [`FrameWriter::audio_buffer_size`]
    /// bytes (packed f32 stereo at the capture rate).
    pub fn add_audio(&mut self, buffer: &[u8]) -> Result<(), WriterError> {
        if self.cancel.is_cancelled() {
            log::debug!("recording aborted, rejecting audio block");
            return Ok(());
        }
        if self.finished {
            return Err(WriterError::ContractViolation(
                "audio submitted after finish".to_string(),
            ));
        }
        let audio = self.audio.as_mut().ok_or_else(|| {
            WriterError::ContractViolation("audio submitted but audio is disabled".to_string())
        })?;
        audio.add(buffer, &mut self.muxer)
    }

    /// Flush both pipelines and write the container trailer. Idempotent.
    ///
    /// A flush or trailer failure is reported, but teardown still proceeds
    /// so no context leaks.
    pub fn finish(&mut self) -> Result<(), WriterError> {
        if self.finished {
            return Ok(());
        }
        self.finished = true;

        let mut result = Ok(());

        if let Err(e) = self.drain_filter() {
            log::error!("filter drain failed during finish: {e}");
            result = Err(e);
        }
        if let Some(audio) = self.audio.as_mut() {
            if let Err(e) = audio.flush(&mut self.muxer) {
                log::error!("audio flush failed during finish: {e}");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        if let Err(e) = self.video.flush(&mut self.muxer) {
            log::error!("video flush failed during finish: {e}");
            if result.is_ok() {
                result = Err(e);
            }
        }
        if let Err(e) = self.muxer.finish() {
            log::error!("trailer write failed: {e}");
            if result.is_ok() {
                result = Err(e);
            }
        }
        result
    }

    /// Copy raw capture bytes into a frame at the source format, honoring
    /// stride and the vertical-flip flag.
    fn prepare_frame(&self, pixels: &[u8], usec: i64, y_invert: bool) -> frame::Video {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let row_bytes = width * self.config.format.bytes_per_pixel();
        let src_stride = self.config.stride;

        let mut frame = frame::Video::new(self.resolved.src, self.config.width, self.config.height);
        let dst_stride = frame.stride(0);
        let dst = frame.data_mut(0);
        for y in 0..height {
            let src_row = if y_invert { height - 1 - y } else { y };
            let src_offset = src_row * src_stride;
            let dst_offset = y * dst_stride;
            dst[dst_offset..dst_offset + row_bytes]
                .copy_from_slice(&pixels[src_offset..src_offset + row_bytes]);
        }

        frame.set_pts(Some(usec));
        if self.resolved.full_range {
            unsafe {
                (*frame.as_mut_ptr()).color_range =
                    ffmpeg_next::ffi::AVColorRange::AVCOL_RANGE_JPEG;
            }
        }
        frame
    }

    fn drain_filter(&mut self) -> Result<(), WriterError> {
        self.filter.flush()?;
        while let Some(filtered) = self.filter.pull()? {
            self.video
                .submit(filtered, self.hw.as_ref(), &mut self.muxer)?;
        }
        Ok(())
    }
}

/// Best-effort removal of a partially created output file.
fn remove_partial_output(path: &str) {
    if std::path::Path::new(path).exists() {
        if let Err(e) = std::fs::remove_file(path) {
            log::warn!("could not remove partial output {path}: {e}");
        }
    }
}

impl Drop for FrameWriter {
    fn drop(&mut self) {
        if let Err(e) = self.finish() {
            log::error!("frame writer teardown failed: {e}");
        }
    }
}

#[cfg(test)]
#[path = "writer_test.rs"]
mod writer_test;
