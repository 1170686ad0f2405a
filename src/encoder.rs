//! Video codec pipeline: codec context ownership and the encode/flush
//! protocol.
//!
//! The codec may buffer several frames before emitting the first packet
//! (lookahead, B-frames); a submission that yields zero packets is normal.

use std::collections::HashMap;

use ffmpeg_next::{Dictionary, Rational, frame, util::error};

use crate::config::WriterConfig;
use crate::error::WriterError;
use crate::hw::HwContext;
use crate::output::Muxer;
use crate::packet::EncodedPacket;
use crate::pixfmt::ResolvedFormat;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Ready,
    Encoding,
    Flushing,
    Closed,
    /// The codec context reported a terminal error; further submissions are
    /// rejected.
    Failed,
}

pub struct VideoPipeline {
    encoder: ffmpeg_next::codec::encoder::Video,
    parameters: ffmpeg_next::codec::Parameters,
    time_base: Rational,
    stream_index: usize,
    state: PipelineState,
    last_pts: Option<i64>,
}

/// Codec-private options from the configuration map, with real-time
/// defaults when the caller supplied none.
fn load_codec_options(options: &HashMap<String, String>, codec: &str) -> Dictionary<'static> {
    let mut dict = Dictionary::new();
    if options.is_empty() {
        if codec.contains("x264") || codec.contains("x265") {
            dict.set("preset", "ultrafast");
            dict.set("tune", "zerolatency");
        }
        return dict;
    }
    for (key, value) in options {
        dict.set(key, value);
    }
    dict
}

/// Errors after which the codec context cannot accept further frames. The
/// codec signals EOF once it has been flushed or has shut down internally.
fn is_terminal(err: &ffmpeg_next::Error) -> bool {
    matches!(err, ffmpeg_next::Error::Eof)
}

impl VideoPipeline {
    /// Open the codec context and register its stream with the muxer.
    ///
    /// `dimensions` and `time_base` come from the filter sink so the codec
    /// matches whatever the filter chain emits and filtered pts pass through
    /// unrescaled. A hardware context attaches its frame pool to the codec
    /// before open.
    pub fn new(
        config: &WriterConfig,
        resolved: ResolvedFormat,
        dimensions: (u32, u32),
        time_base: Rational,
        hw: Option<&HwContext>,
        muxer: &mut Muxer,
    ) -> Result<Self, WriterError> {
        let codec = ffmpeg_next::encoder::find_by_name(&config.codec).ok_or_else(|| {
            WriterError::Configuration(format!("video codec not found: {}", config.codec))
        })?;
        log::info!("opening video encoder: {}", config.codec);

        let context = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = context.encoder().video().map_err(WriterError::Codec)?;
        encoder.set_width(dimensions.0);
        encoder.set_height(dimensions.1);
        encoder.set_format(resolved.encoder);
        encoder.set_time_base(time_base);
        if muxer.needs_global_header() {
            encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }

        // max_b_frames, color range and the hardware pool are not covered by
        // the safe setters.
        unsafe {
            let ptr = encoder.as_mut_ptr();
            (*ptr).max_b_frames = config.bframes.max(0);
            if resolved.full_range {
                (*ptr).color_range = ffmpeg_next::ffi::AVColorRange::AVCOL_RANGE_JPEG;
            }
            if let Some(hw) = hw {
                (*ptr).hw_frames_ctx = hw.frames_ref();
            }
        }

        let options = load_codec_options(&config.codec_options, &config.codec);
        let encoder = encoder.open_with(options).map_err(|e| {
            WriterError::Configuration(format!("cannot open video codec {}: {e}", config.codec))
        })?;

        let mut parameters = ffmpeg_next::codec::Parameters::new();
        let ret = unsafe {
            ffmpeg_next::ffi::avcodec_parameters_from_context(
                parameters.as_mut_ptr(),
                encoder.0.as_ptr(),
            )
        };
        if ret < 0 {
            return Err(WriterError::Codec(ffmpeg_next::Error::from(ret)));
        }

        let stream_index = muxer.add_stream(parameters.clone())?;

        Ok(Self {
            encoder,
            parameters,
            time_base,
            stream_index,
            state: PipelineState::Ready,
            last_pts: None,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn parameters(&self) -> ffmpeg_next::codec::Parameters {
        self.parameters.clone()
    }

    /// Encode one filtered frame and forward every packet the codec has
    /// ready. Returns `false` when the frame was dropped (pts regression,
    /// exhausted hardware pool, or a recoverable encode error).
    pub fn submit(
        &mut self,
        frame: frame::Video,
        hw: Option<&HwContext>,
        muxer: &mut Muxer,
    ) -> Result<bool, WriterError> {
        match self.state {
            PipelineState::Ready | PipelineState::Encoding => {}
            PipelineState::Flushing | PipelineState::Closed => {
                return Err(WriterError::ContractViolation(
                    "frame submitted after flush".to_string(),
                ));
            }
            PipelineState::Failed => {
                return Err(WriterError::ContractViolation(
                    "frame submitted to a failed pipeline".to_string(),
                ));
            }
        }

        // The container needs monotonic timestamps per stream; regressions
        // are dropped here, before the codec can propagate them.
        if let Some(pts) = frame.pts() {
            if let Some(last) = self.last_pts {
                if pts < last {
                    log::warn!("dropping out-of-order video frame: pts {pts} < {last}");
                    return Ok(false);
                }
            }
            self.last_pts = Some(pts);
        }

        let frame = match hw {
            Some(context) => match context.upload(&frame) {
                Ok(hw_frame) => hw_frame,
                Err(WriterError::Resource(msg)) => {
                    log::warn!("{msg}; dropping frame");
                    return Ok(false);
                }
                Err(e) => return Err(self.fail(e)),
            },
            None => frame,
        };

        if let Err(e) = self.encoder.send_frame(&frame) {
            if is_terminal(&e) {
                return Err(self.fail(WriterError::Codec(e)));
            }
            log::error!("video encode failed, skipping frame: {e}");
            return Ok(false);
        }
        self.state = PipelineState::Encoding;

        self.drain(muxer)?;
        Ok(true)
    }

    /// Signal end-of-stream and drain the codec's remaining packets.
    pub fn flush(&mut self, muxer: &mut Muxer) -> Result<(), WriterError> {
        match self.state {
            PipelineState::Closed | PipelineState::Failed => return Ok(()),
            _ => {}
        }
        self.state = PipelineState::Flushing;
        self.encoder.send_eof().map_err(WriterError::Codec)?;
        self.drain(muxer)?;
        self.state = PipelineState::Closed;
        Ok(())
    }

    fn drain(&mut self, muxer: &mut Muxer) -> Result<(), WriterError> {
        while let Some(packet) = self.receive_packet()? {
            muxer.write_packet(self.stream_index, packet)?;
        }
        Ok(())
    }

    fn receive_packet(&mut self) -> Result<Option<EncodedPacket>, WriterError> {
        let mut packet = ffmpeg_next::codec::packet::Packet::empty();
        match self.encoder.receive_packet(&mut packet) {
            Ok(()) => Ok(Some(EncodedPacket::from((packet, self.time_base)))),
            Err(ffmpeg_next::Error::Other { errno }) if errno == error::EAGAIN => Ok(None),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(e) => Err(self.fail(WriterError::Codec(e))),
        }
    }

    fn fail(&mut self, err: WriterError) -> WriterError {
        log::error!("video pipeline entering failed state: {err}");
        self.state = PipelineState::Failed;
        err
    }
}
