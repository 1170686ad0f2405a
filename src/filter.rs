//! Video filter graph.
//!
//! One `buffer` source fed with raw capture frames, the user's filter
//! expression in the middle ("null" pass-through by default), and one
//! `buffersink` pinned to the negotiated target pixel format. Filters may
//! buffer, reorder, or drop frames, so one push can yield zero or more
//! pulls.

use ffmpeg_next::{Rational, filter, frame, util::error};

use crate::error::WriterError;
use crate::pixfmt;

/// Source time base the capture clock is declared in (microseconds).
pub const SOURCE_TIME_BASE: Rational = Rational(1, 1_000_000);

pub struct VideoFilter {
    graph: filter::Graph,
    sink_time_base: Rational,
    sink_width: u32,
    sink_height: u32,
}

impl std::fmt::Debug for VideoFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFilter")
            .field("sink_time_base", &self.sink_time_base)
            .field("sink_width", &self.sink_width)
            .field("sink_height", &self.sink_height)
            .finish_non_exhaustive()
    }
}

// Safety: the graph pointer is owned exclusively and only dereferenced
// through &mut self; no alias escapes, so moving the whole filter between
// threads is sound.
unsafe impl Send for VideoFilter {}

impl VideoFilter {
    /// Build and validate the graph. A malformed filter expression fails
    /// here, before any frame is processed.
    pub fn new(
        expression: &str,
        width: u32,
        height: u32,
        src: ffmpeg_next::format::Pixel,
        target: ffmpeg_next::format::Pixel,
    ) -> Result<Self, WriterError> {
        let mut graph = filter::Graph::new();

        let source_args = format!(
            "video_size={}x{}:pix_fmt={}:time_base={}/{}:pixel_aspect=1/1",
            width,
            height,
            pixfmt::pixel_name(src),
            SOURCE_TIME_BASE.numerator(),
            SOURCE_TIME_BASE.denominator(),
        );
        graph
            .add(
                &filter::find("buffer").ok_or_else(|| {
                    WriterError::Configuration("buffer source filter unavailable".to_string())
                })?,
                "in",
                &source_args,
            )
            .map_err(|e| WriterError::Configuration(format!("filter source: {e}")))?;

        graph
            .add(
                &filter::find("buffersink").ok_or_else(|| {
                    WriterError::Configuration("buffersink filter unavailable".to_string())
                })?,
                "out",
                "",
            )
            .map_err(|e| WriterError::Configuration(format!("filter sink: {e}")))?;

        let expression = if expression.is_empty() {
            "null"
        } else {
            expression
        };
        // The trailing format stage pins the sink to the exact format the
        // codec expects, whatever the user expression emits.
        let spec = format!(
            "{},format=pix_fmts={}",
            expression,
            pixfmt::pixel_name(target)
        );
        graph
            .output("in", 0)
            .and_then(|o| o.input("out", 0))
            .and_then(|p| p.parse(&spec))
            .map_err(|e| {
                WriterError::Configuration(format!("invalid filter expression {spec:?}: {e}"))
            })?;

        graph
            .validate()
            .map_err(|e| {
                WriterError::Configuration(format!("filter graph validation failed: {e}"))
            })?;

        // The sink's time base is fixed once the graph is configured; the
        // encoder is opened with this exact time base so sink pts pass
        // through unrescaled.
        let (sink_time_base, sink_width, sink_height) = {
            let mut sink = graph
                .get("out")
                .ok_or_else(|| WriterError::Configuration("filter sink missing".to_string()))?;
            unsafe {
                let ptr = sink.as_mut_ptr();
                (
                    Rational::from(ffmpeg_next::ffi::av_buffersink_get_time_base(ptr)),
                    ffmpeg_next::ffi::av_buffersink_get_w(ptr) as u32,
                    ffmpeg_next::ffi::av_buffersink_get_h(ptr) as u32,
                )
            }
        };

        log::debug!(
            "filter graph ready: {} -> {} via {:?}, sink {}x{}, time base {}/{}",
            pixfmt::pixel_name(src),
            pixfmt::pixel_name(target),
            expression,
            sink_width,
            sink_height,
            sink_time_base.numerator(),
            sink_time_base.denominator(),
        );

        Ok(Self {
            graph,
            sink_time_base,
            sink_width,
            sink_height,
        })
    }

    /// Time base output frame pts are expressed in.
    pub fn sink_time_base(&self) -> Rational {
        self.sink_time_base
    }

    /// Output dimensions after the filter chain (a scale stage may differ
    /// from the capture size). The codec must be opened with these.
    pub fn sink_dimensions(&self) -> (u32, u32) {
        (self.sink_width, self.sink_height)
    }

    /// Feed one raw frame into the source node.
    pub fn push(&mut self, frame: &frame::Video) -> Result<(), WriterError> {
        let mut source = self
            .graph
            .get("in")
            .ok_or_else(|| WriterError::Configuration("filter source missing".to_string()))?;
        source.source().add(frame).map_err(WriterError::Codec)
    }

    /// Drain one output frame. `Ok(None)` when the graph has nothing ready
    /// (EAGAIN) or is fully drained (EOF).
    pub fn pull(&mut self) -> Result<Option<frame::Video>, WriterError> {
        let mut out = frame::Video::empty();
        let mut sink = self
            .graph
            .get("out")
            .ok_or_else(|| WriterError::Configuration("filter sink missing".to_string()))?;
        match sink.sink().frame(&mut out) {
            Ok(()) => Ok(Some(out)),
            Err(ffmpeg_next::Error::Eof) => Ok(None),
            Err(ffmpeg_next::Error::Other { errno }) if errno == error::EAGAIN => Ok(None),
            Err(e) => Err(WriterError::Codec(e)),
        }
    }

    /// Signal end-of-stream to the source so buffered frames drain on the
    /// next pulls.
    pub fn flush(&mut self) -> Result<(), WriterError> {
        let mut source = self
            .graph
            .get("in")
            .ok_or_else(|| WriterError::Configuration("filter source missing".to_string()))?;
        source.source().close(0).map_err(WriterError::Codec)
    }
}
