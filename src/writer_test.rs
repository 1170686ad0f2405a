use std::path::PathBuf;

use tokio_util::sync::CancellationToken;

use crate::config::{InputFormat, WriterConfig};
use crate::writer::FrameWriter;
use crate::error::WriterError;

fn temp_path(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(name);
    let _ = std::fs::remove_file(&path);
    path
}

/// ffv1 + matroska + native aac are present in any stock FFmpeg build, so
/// these tests do not depend on external encoder libraries.
fn base_config(file: &PathBuf) -> WriterConfig {
    WriterConfig {
        file: file.to_string_lossy().into_owned(),
        width: 64,
        height: 48,
        stride: 64 * 4,
        format: InputFormat::Bgr0,
        codec: "ffv1".to_string(),
        muxer: "matroska".to_string(),
        ..Default::default()
    }
}

fn have_codecs() -> bool {
    let _ = env_logger::builder().is_test(true).try_init();
    crate::init().is_ok()
        && ffmpeg_next::encoder::find_by_name("ffv1").is_some()
        && ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::AAC).is_some()
}

fn gray_frame(config: &WriterConfig) -> Vec<u8> {
    vec![0x40u8; config.frame_buffer_size()]
}

/// Collect the stream time base and pts list for one stream of the written
/// file.
fn probe_stream(
    path: &PathBuf,
    medium: ffmpeg_next::media::Type,
) -> anyhow::Result<(ffmpeg_next::Rational, Vec<i64>)> {
    let mut input = ffmpeg_next::format::input(path)?;
    let (index, time_base) = input
        .streams()
        .best(medium)
        .map(|s| (s.index(), s.time_base()))
        .ok_or_else(|| anyhow::anyhow!("no {medium:?} stream"))?;
    let mut timestamps = Vec::new();
    for (stream, packet) in input.packets() {
        if stream.index() == index {
            timestamps.push(packet.pts().or_else(|| packet.dts()).unwrap_or(0));
        }
    }
    Ok((time_base, timestamps))
}

#[test]
fn three_frames_produce_three_monotonic_packets() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-three-frames.mkv");
    let config = base_config(&path);
    let frame = gray_frame(&config);

    let mut writer = FrameWriter::new(config, CancellationToken::new())?;
    assert!(writer.add_frame(&frame, 0, false)?);
    assert!(writer.add_frame(&frame, 33_000, false)?);
    assert!(writer.add_frame(&frame, 66_000, false)?);
    writer.finish()?;
    drop(writer);

    let (_, timestamps) = probe_stream(&path, ffmpeg_next::media::Type::Video)?;
    assert_eq!(timestamps.len(), 3);
    assert!(
        timestamps.windows(2).all(|w| w[0] <= w[1]),
        "timestamps regressed: {timestamps:?}"
    );
    Ok(())
}

#[test]
fn out_of_order_frame_is_dropped_not_propagated() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-out-of-order.mkv");
    let config = base_config(&path);
    let frame = gray_frame(&config);

    let mut writer = FrameWriter::new(config, CancellationToken::new())?;
    assert!(writer.add_frame(&frame, 0, false)?);
    assert!(writer.add_frame(&frame, 66_000, false)?);
    assert!(!writer.add_frame(&frame, 33_000, false)?, "regression must be dropped");
    writer.finish()?;
    drop(writer);

    let (_, timestamps) = probe_stream(&path, ffmpeg_next::media::Type::Video)?;
    assert_eq!(timestamps.len(), 2);
    Ok(())
}

#[test]
fn cancelled_token_rejects_submissions() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-cancelled.mkv");
    let config = WriterConfig {
        enable_audio: true,
        ..base_config(&path)
    };
    let frame = gray_frame(&config);

    let cancel = CancellationToken::new();
    let mut writer = FrameWriter::new(config, cancel.clone())?;
    let silence = vec![0u8; writer.audio_buffer_size().expect("audio enabled")];
    cancel.cancel();

    assert!(!writer.add_frame(&frame, 0, false)?);
    // Audio blocks are accepted without error but discarded.
    writer.add_audio(&silence)?;
    writer.finish()?;
    drop(writer);

    // The trailer still goes out: the file is readable and both streams are
    // simply empty.
    let (_, video) = probe_stream(&path, ffmpeg_next::media::Type::Video)?;
    assert!(video.is_empty());
    let (_, audio) = probe_stream(&path, ffmpeg_next::media::Type::Audio)?;
    assert!(audio.is_empty());
    Ok(())
}

#[test]
fn vertical_flip_is_accepted() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-flip.mkv");
    let config = base_config(&path);
    let frame = gray_frame(&config);

    let mut writer = FrameWriter::new(config, CancellationToken::new())?;
    assert!(writer.add_frame(&frame, 0, true)?);
    writer.finish()?;
    Ok(())
}

#[test]
fn audio_blocks_produce_a_monotonic_audio_stream() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-audio.mkv");
    let config = WriterConfig {
        enable_audio: true,
        ..base_config(&path)
    };
    let frame = gray_frame(&config);

    let mut writer = FrameWriter::new(config, CancellationToken::new())?;
    let block_size = writer.audio_buffer_size().expect("audio enabled");
    let silence = vec![0u8; block_size];

    const BLOCKS: usize = 20;
    assert!(writer.add_frame(&frame, 0, false)?);
    for _ in 0..BLOCKS {
        writer.add_audio(&silence)?;
    }
    assert!(writer.add_frame(&frame, 33_000, false)?);
    writer.finish()?;
    drop(writer);

    let (time_base, timestamps) = probe_stream(&path, ffmpeg_next::media::Type::Audio)?;
    // One packet per submitted block, within encoder-delay tolerance.
    assert!(
        timestamps.len() >= BLOCKS,
        "expected at least {BLOCKS} audio packets, got {}",
        timestamps.len()
    );
    assert!(
        timestamps.windows(2).all(|w| w[0] <= w[1]),
        "audio timestamps regressed: {timestamps:?}"
    );

    // Stream duration matches samples submitted / sample rate. The codec's
    // startup delay shifts timestamps by up to one frame, and the container
    // clock rounds, so the tolerance is two frame spans.
    let frame_samples = (block_size / (2 * std::mem::size_of::<f32>())) as i64;
    let to_stream_tb = |samples: i64| {
        samples * time_base.denominator() as i64 / (44_100 * time_base.numerator() as i64)
    };
    let expected = to_stream_tb(BLOCKS as i64 * frame_samples);
    let frame_span = to_stream_tb(frame_samples).max(1);
    let implied = timestamps.last().copied().unwrap_or(0) + frame_span;
    assert!(
        (implied - expected).abs() <= 2 * frame_span,
        "audio duration drifted: implied {implied}, expected {expected} \
         (stream time base {}/{})",
        time_base.numerator(),
        time_base.denominator()
    );
    Ok(())
}

#[test]
fn audio_disabled_means_no_buffer_size_and_rejected_audio() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-no-audio.mkv");
    let config = base_config(&path);

    let mut writer = FrameWriter::new(config, CancellationToken::new())?;
    assert!(writer.audio_buffer_size().is_none());
    let err = writer.add_audio(&[0u8; 16]).unwrap_err();
    assert!(matches!(err, WriterError::ContractViolation(_)), "got: {err}");
    writer.finish()?;
    Ok(())
}

#[test]
fn forced_unsupported_pix_fmt_creates_no_output_file() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-bad-pixfmt.mkv");
    let config = WriterConfig {
        codec: "mpeg4".to_string(),
        pix_fmt: "rgb24".to_string(),
        ..base_config(&path)
    };

    let err = FrameWriter::new(config, CancellationToken::new()).unwrap_err();
    assert!(err.is_configuration(), "got: {err}");
    assert!(!path.exists(), "no output file may be produced on init failure");
    Ok(())
}

#[test]
fn rejected_header_write_leaves_no_output_file() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-bad-container.mp4");
    // mp4 has no codec tag for ffv1, so the header write is rejected after
    // avio has already created the file.
    let config = WriterConfig {
        muxer: "mp4".to_string(),
        ..base_config(&path)
    };

    let err = FrameWriter::new(config, CancellationToken::new()).unwrap_err();
    assert!(err.is_configuration(), "got: {err}");
    assert!(!path.exists(), "failed init must not leave a partial file");
    Ok(())
}

#[test]
fn zero_dimensions_fail_fast() {
    crate::init().unwrap();
    let path = temp_path("ffmpeg-writer-zero-dims.mkv");
    let config = WriterConfig {
        width: 0,
        ..base_config(&path)
    };
    let err = FrameWriter::new(config, CancellationToken::new()).unwrap_err();
    assert!(err.is_configuration(), "got: {err}");
}

#[test]
fn undersized_pixel_buffer_is_a_contract_violation() -> anyhow::Result<()> {
    if !have_codecs() {
        eprintln!("skip: ffv1/aac not available");
        return Ok(());
    }
    let path = temp_path("ffmpeg-writer-short-buffer.mkv");
    let config = base_config(&path);

    let mut writer = FrameWriter::new(config, CancellationToken::new())?;
    let err = writer.add_frame(&[0u8; 16], 0, false).unwrap_err();
    assert!(matches!(err, WriterError::ContractViolation(_)), "got: {err}");
    writer.finish()?;
    Ok(())
}
