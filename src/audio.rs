//! Audio resampler and encoder.
//!
//! Converts the capture's packed f32 stereo stream into the encoder's
//! required sample format, accumulates samples until a full encoder frame is
//! available, and drives its own codec context. Present only when audio is
//! enabled in the configuration.

use ffmpeg_next::{ChannelLayout, Dictionary, Rational, format::Sample, frame, util::error};

use crate::config::{AUDIO_RATE, WriterConfig};
use crate::encoder::PipelineState;
use crate::error::WriterError;
use crate::output::Muxer;
use crate::packet::EncodedPacket;

const CHANNELS: usize = 2;
const BYTES_PER_SAMPLE: usize = std::mem::size_of::<f32>();

/// Append-only byte FIFO carved into fixed-size frames. Trimmed as frames
/// are consumed, so it stays bounded under steady-state input.
struct SampleBuffer {
    data: Vec<u8>,
}

impl SampleBuffer {
    fn new() -> Self {
        Self { data: Vec::new() }
    }

    fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Remove and return the next `frame_bytes` bytes, or `None` when less
    /// than a full frame is buffered.
    fn take(&mut self, frame_bytes: usize) -> Option<Vec<u8>> {
        if self.data.len() < frame_bytes {
            return None;
        }
        Some(self.data.drain(..frame_bytes).collect())
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

pub struct AudioPipeline {
    encoder: ffmpeg_next::codec::encoder::Audio,
    resampler: ffmpeg_next::software::resampling::Context,
    parameters: ffmpeg_next::codec::Parameters,
    time_base: Rational,
    stream_index: usize,
    state: PipelineState,
    buffer: SampleBuffer,
    /// Samples per encoder frame.
    frame_size: usize,
    /// Next pts in samples. Starts at the configured sync offset so the
    /// first audio timestamp is shifted once, not per-frame.
    next_pts: i64,
}

impl AudioPipeline {
    pub fn new(config: &WriterConfig, muxer: &mut Muxer) -> Result<Self, WriterError> {
        let codec = ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC).ok_or_else(|| {
            WriterError::Configuration("aac audio encoder not available".to_string())
        })?;
        log::info!("opening audio encoder: {}", codec.name());

        let sample_format = Sample::F32(ffmpeg_next::format::sample::Type::Planar);
        let time_base = Rational(1, AUDIO_RATE as i32);

        let context = ffmpeg_next::codec::Context::new_with_codec(codec);
        let mut encoder = context.encoder().audio().map_err(WriterError::Codec)?;
        encoder.set_rate(AUDIO_RATE as i32);
        encoder.set_format(sample_format);
        encoder.set_channel_layout(ChannelLayout::STEREO);
        encoder.set_time_base(time_base);
        if muxer.needs_global_header() {
            encoder.set_flags(ffmpeg_next::codec::Flags::GLOBAL_HEADER);
        }

        let encoder = encoder.open_with(Dictionary::new()).map_err(|e| {
            WriterError::Configuration(format!("cannot open audio codec: {e}"))
        })?;

        let frame_size = {
            let raw = unsafe { (*encoder.0.as_ptr()).frame_size };
            if raw > 0 { raw as usize } else { 1024 }
        };

        let resampler = ffmpeg_next::software::resampling::Context::get(
            Sample::F32(ffmpeg_next::format::sample::Type::Packed),
            ChannelLayout::STEREO,
            AUDIO_RATE,
            sample_format,
            ChannelLayout::STEREO,
            AUDIO_RATE,
        )
        .map_err(|e| WriterError::Configuration(format!("cannot open resampler: {e}")))?;

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

        // One-time shift compensating capture latency between the audio and
        // video sources, expressed in samples.
        let next_pts = config.audio_sync_offset * AUDIO_RATE as i64 / 1_000_000;

        Ok(Self {
            encoder,
            resampler,
            parameters,
            time_base,
            stream_index,
            state: PipelineState::Ready,
            buffer: SampleBuffer::new(),
            frame_size,
            next_pts,
        })
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn stream_index(&self) -> usize {
        self.stream_index
    }

    pub fn parameters(&self) -> ffmpeg_next::codec::Parameters {
        self.parameters.clone()
    }

    /// Exact byte length callers must supply per [`AudioPipeline::add`]
    /// call: one encoder frame of packed f32 stereo at the capture rate.
    pub fn required_buffer_size(&self) -> usize {
        self.frame_size * CHANNELS * BYTES_PER_SAMPLE
    }

    /// Buffer one capture block and encode every full frame now available.
    pub fn add(&mut self, buffer: &[u8], muxer: &mut Muxer) -> Result<(), WriterError> {
        match self.state {
            PipelineState::Ready | PipelineState::Encoding => {}
            _ => {
                return Err(WriterError::ContractViolation(
                    "audio submitted after flush".to_string(),
                ));
            }
        }
        let required = self.required_buffer_size();
        if buffer.len() != required {
            return Err(WriterError::ContractViolation(format!(
                "audio buffer must be exactly {required} bytes, got {}",
                buffer.len()
            )));
        }

        self.buffer.append(buffer);
        let frame_bytes = required;
        while let Some(chunk) = self.buffer.take(frame_bytes) {
            self.encode_chunk(&chunk, muxer)?;
        }
        Ok(())
    }

    fn encode_chunk(&mut self, chunk: &[u8], muxer: &mut Muxer) -> Result<(), WriterError> {
        let mut input = frame::Audio::new(
            Sample::F32(ffmpeg_next::format::sample::Type::Packed),
            self.frame_size,
            ChannelLayout::STEREO,
        );
        input.set_rate(AUDIO_RATE);
        input.data_mut(0)[..chunk.len()].copy_from_slice(chunk);

        let mut converted = frame::Audio::new(
            Sample::F32(ffmpeg_next::format::sample::Type::Planar),
            self.frame_size,
            ChannelLayout::STEREO,
        );
        converted.set_rate(AUDIO_RATE);
        self.resampler
            .run(&input, &mut converted)
            .map_err(WriterError::Codec)?;

        converted.set_pts(Some(self.next_pts));
        self.next_pts += converted.samples() as i64;

        self.send(&converted, muxer)
    }

    fn send(&mut self, frame: &frame::Audio, muxer: &mut Muxer) -> Result<(), WriterError> {
        if let Err(e) = self.encoder.send_frame(frame) {
            log::error!("audio encode failed, skipping frame: {e}");
            return Ok(());
        }
        self.state = PipelineState::Encoding;
        self.drain(muxer)
    }

    /// Flush the resampler tail and the codec, draining remaining packets.
    /// A buffered partial frame (less than one encoder frame) is discarded.
    pub fn flush(&mut self, muxer: &mut Muxer) -> Result<(), WriterError> {
        match self.state {
            PipelineState::Closed | PipelineState::Failed => return Ok(()),
            _ => {}
        }
        if self.buffer.len() > 0 {
            log::debug!("discarding {} bytes of partial audio frame", self.buffer.len());
        }

        let mut tail = frame::Audio::new(
            Sample::F32(ffmpeg_next::format::sample::Type::Planar),
            self.frame_size,
            ChannelLayout::STEREO,
        );
        tail.set_rate(AUDIO_RATE);
        match self.resampler.flush(&mut tail) {
            Ok(_) if tail.samples() > 0 => {
                tail.set_pts(Some(self.next_pts));
                self.next_pts += tail.samples() as i64;
                self.send(&tail, muxer)?;
            }
            Ok(_) => {}
            Err(e) => log::warn!("resampler flush failed: {e}"),
        }

        self.state = PipelineState::Flushing;
        self.encoder.send_eof().map_err(WriterError::Codec)?;
        self.drain(muxer)?;
        self.state = PipelineState::Closed;
        Ok(())
    }

    fn drain(&mut self, muxer: &mut Muxer) -> Result<(), WriterError> {
        loop {
            let mut packet = ffmpeg_next::codec::packet::Packet::empty();
            match self.encoder.receive_packet(&mut packet) {
                Ok(()) => {
                    muxer.write_packet(
                        self.stream_index,
                        EncodedPacket::from((packet, self.time_base)),
                    )?;
                }
                Err(ffmpeg_next::Error::Other { errno }) if errno == error::EAGAIN => break,
                Err(ffmpeg_next::Error::Eof) => break,
                Err(e) => {
                    self.state = PipelineState::Failed;
                    return Err(WriterError::Codec(e));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_buffer_carves_exact_frames() {
        let mut buffer = SampleBuffer::new();
        buffer.append(&[1u8; 10]);
        assert!(buffer.take(16).is_none());
        buffer.append(&[2u8; 10]);
        let frame = buffer.take(16).expect("20 buffered, 16 wanted");
        assert_eq!(frame.len(), 16);
        assert_eq!(&frame[..10], &[1u8; 10]);
        assert_eq!(&frame[10..], &[2u8; 6]);
        assert_eq!(buffer.len(), 4);
        assert!(buffer.take(16).is_none());
    }

    fn temp_output(name: &str) -> String {
        std::env::temp_dir()
            .join(name)
            .to_string_lossy()
            .into_owned()
    }

    #[test]
    fn buffer_size_matches_encoder_frame() -> anyhow::Result<()> {
        crate::init()?;
        if ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC).is_none() {
            eprintln!("skip: aac encoder not available");
            return Ok(());
        }
        let config = WriterConfig::default();
        let mut muxer = Muxer::new(&temp_output("ffmpeg-writer-audio-open.mkv"), "matroska")?;
        let audio = AudioPipeline::new(&config, &mut muxer)?;
        assert!(audio.frame_size > 0);
        assert_eq!(
            audio.required_buffer_size(),
            audio.frame_size * CHANNELS * BYTES_PER_SAMPLE
        );
        Ok(())
    }

    #[test]
    fn wrong_buffer_size_is_a_contract_violation() -> anyhow::Result<()> {
        crate::init()?;
        if ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC).is_none() {
            eprintln!("skip: aac encoder not available");
            return Ok(());
        }
        let config = WriterConfig::default();
        let mut muxer = Muxer::new(&temp_output("ffmpeg-writer-audio-size.mkv"), "matroska")?;
        let mut audio = AudioPipeline::new(&config, &mut muxer)?;
        let short = vec![0u8; audio.required_buffer_size() - 1];
        let err = audio.add(&short, &mut muxer).unwrap_err();
        assert!(matches!(err, WriterError::ContractViolation(_)), "got: {err}");
        Ok(())
    }

    #[test]
    fn sync_offset_shifts_first_pts() -> anyhow::Result<()> {
        crate::init()?;
        if ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC).is_none() {
            eprintln!("skip: aac encoder not available");
            return Ok(());
        }
        let config = WriterConfig {
            audio_sync_offset: 1_000_000,
            ..Default::default()
        };
        let mut muxer = Muxer::new(&temp_output("ffmpeg-writer-audio-sync.mkv"), "matroska")?;
        let audio = AudioPipeline::new(&config, &mut muxer)?;
        assert_eq!(audio.next_pts, AUDIO_RATE as i64);
        Ok(())
    }
}
