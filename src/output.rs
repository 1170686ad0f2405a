//! Output container ownership: stream table, header/trailer lifecycle, and
//! per-stream timestamp policing.

use std::collections::HashMap;

use ffmpeg_next::format;

use crate::error::WriterError;
use crate::packet::EncodedPacket;

pub struct Muxer {
    inner: format::context::Output,
    /// Last dts written per stream index, in that stream's time base.
    last_dts: HashMap<usize, i64>,
    header_written: bool,
    trailer_written: bool,
}

impl std::fmt::Debug for Muxer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Muxer")
            .field("last_dts", &self.last_dts)
            .field("header_written", &self.header_written)
            .field("trailer_written", &self.trailer_written)
            .finish_non_exhaustive()
    }
}

impl Muxer {
    /// Open the output container at `path`. An empty `muxer` name lets
    /// FFmpeg guess the container from the file extension.
    pub fn new(path: &str, muxer: &str) -> Result<Self, WriterError> {
        let inner = if muxer.is_empty() {
            format::output(&path)
        } else {
            format::output_as(&path, muxer)
        }
        .map_err(|e| {
            WriterError::Configuration(format!("cannot open output {path} (muxer {muxer:?}): {e}"))
        })?;

        Ok(Self {
            inner,
            last_dts: HashMap::new(),
            header_written: false,
            trailer_written: false,
        })
    }

    /// Whether the container wants codec extradata in global headers rather
    /// than in-band. Must be honored before the codec is opened.
    pub fn needs_global_header(&self) -> bool {
        self.inner
            .format()
            .flags()
            .contains(format::flag::Flags::GLOBAL_HEADER)
    }

    /// Add a stream carrying the given finalized codec parameters. Returns
    /// the container stream index.
    pub fn add_stream(
        &mut self,
        parameters: ffmpeg_next::codec::Parameters,
    ) -> Result<usize, WriterError> {
        if self.header_written {
            return Err(WriterError::ContractViolation(
                "stream added after header write".to_string(),
            ));
        }
        let codec = ffmpeg_next::encoder::find(parameters.id());
        let mut stream = self.inner.add_stream(codec).map_err(WriterError::Codec)?;
        stream.set_parameters(parameters);
        Ok(stream.index())
    }

    /// Write the container header. Valid exactly once, after every codec's
    /// parameters are finalized.
    pub fn write_header(&mut self) -> Result<(), WriterError> {
        if self.header_written {
            return Err(WriterError::ContractViolation(
                "container header written twice".to_string(),
            ));
        }
        self.inner.write_header().map_err(WriterError::Codec)?;
        self.header_written = true;
        Ok(())
    }

    /// Rescale and write one packet. Returns `false` when the packet was
    /// dropped for violating per-stream timestamp monotonicity; one bad
    /// timestamp is not worth corrupting the container.
    pub fn write_packet(
        &mut self,
        stream_index: usize,
        mut packet: EncodedPacket,
    ) -> Result<bool, WriterError> {
        if !self.header_written {
            return Err(WriterError::ContractViolation(
                "packet written before container header".to_string(),
            ));
        }
        let source_time_base = packet.time_base();
        let target_time_base = self
            .inner
            .stream(stream_index)
            .ok_or_else(|| {
                WriterError::ContractViolation(format!("unknown stream index {stream_index}"))
            })?
            .time_base();

        let raw = packet.get_mut();
        raw.set_stream(stream_index);
        raw.set_position(-1);
        raw.rescale_ts(source_time_base, target_time_base);

        if let Some(dts) = raw.dts().or_else(|| raw.pts()) {
            if let Some(&last) = self.last_dts.get(&stream_index) {
                if dts < last {
                    log::warn!(
                        "dropping non-monotonic packet on stream {}: dts {} < {}",
                        stream_index,
                        dts,
                        last
                    );
                    return Ok(false);
                }
            }
            self.last_dts.insert(stream_index, dts);
        }

        raw.write_interleaved(&mut self.inner)
            .map_err(WriterError::Codec)?;
        Ok(true)
    }

    /// Write the trailer. Idempotent; a no-op when the header never made it
    /// out.
    pub fn finish(&mut self) -> Result<(), WriterError> {
        if self.header_written && !self.trailer_written {
            self.trailer_written = true;
            self.inner.write_trailer().map_err(WriterError::Shutdown)?;
        }
        Ok(())
    }
}
