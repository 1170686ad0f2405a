//! Pixel format resolution.
//!
//! Maps the capture's packed input layout plus codec/pixel-format hints onto
//! the concrete source and target formats of the conversion chain, and
//! decides whether a conversion stage is required at all.

use std::ffi::{CStr, CString};

use ffmpeg_next::format::Pixel;

use crate::config::{InputFormat, WriterConfig};
use crate::error::WriterError;
use crate::hw;

/// Outcome of format negotiation for one stream.
#[derive(Debug, Clone, Copy)]
pub struct ResolvedFormat {
    /// Pixel format of the raw capture buffers.
    pub src: Pixel,
    /// Format the filter sink must emit. For hardware codecs this is the
    /// software upload format (the surfaces themselves are `encoder`).
    pub target: Pixel,
    /// Format the codec context is configured with. Equal to `target` for
    /// software codecs, the hardware surface format otherwise.
    pub encoder: Pixel,
    /// Whether `target` carries full-range color.
    pub full_range: bool,
    /// True when `target` differs from `src` and the filter graph must
    /// convert rather than pass frames through.
    pub needs_conversion: bool,
}

/// Concrete pixel format of one capture layout.
pub fn input_pixel_format(format: InputFormat) -> Pixel {
    match format {
        // ffmpeg-next spells FFmpeg's digit-leading names with a Z.
        InputFormat::Bgr0 => Pixel::BGRZ,
        InputFormat::Rgb0 => Pixel::RGBZ,
        InputFormat::Bgr8 => Pixel::BGR8,
    }
}

/// FFmpeg's canonical name for a pixel format.
pub fn pixel_name(pixel: Pixel) -> String {
    unsafe {
        let ptr = ffmpeg_next::ffi::av_get_pix_fmt_name(pixel.into());
        if ptr.is_null() {
            return "none".to_string();
        }
        CStr::from_ptr(ptr).to_string_lossy().into_owned()
    }
}

/// Parse a pixel format by FFmpeg name. Returns `None` for unknown names.
pub fn parse_pixel(name: &str) -> Option<Pixel> {
    let cname = CString::new(name).ok()?;
    let raw = unsafe { ffmpeg_next::ffi::av_get_pix_fmt(cname.as_ptr()) };
    if raw == ffmpeg_next::ffi::AVPixelFormat::AV_PIX_FMT_NONE {
        None
    } else {
        Some(Pixel::from(raw))
    }
}

fn is_full_range(pixel: Pixel) -> bool {
    matches!(pixel, Pixel::YUVJ420P | Pixel::YUVJ422P | Pixel::YUVJ444P)
}

/// Software formats we are willing to feed an encoder with, most preferred
/// first. Full-range formats lead unless the configuration forces limited
/// range.
fn preference_order(force_yuv: bool) -> &'static [Pixel] {
    if force_yuv {
        &[Pixel::YUV420P, Pixel::NV12, Pixel::YUV422P, Pixel::YUV444P]
    } else {
        &[
            Pixel::YUVJ420P,
            Pixel::YUV420P,
            Pixel::NV12,
            Pixel::YUVJ422P,
            Pixel::YUV422P,
            Pixel::YUVJ444P,
            Pixel::YUV444P,
        ]
    }
}

fn supported_formats(codec: &ffmpeg_next::Codec) -> Option<Vec<Pixel>> {
    let video = codec.video().ok()?;
    video.formats().map(|iter| iter.collect())
}

/// Negotiate source/target/encoder pixel formats for `codec` under `config`.
///
/// A forced `pix_fmt` is honored when the codec supports it and rejected
/// with a configuration error otherwise. Without a forced format the first
/// entry of the preference order the codec advertises wins.
pub fn resolve(
    codec: &ffmpeg_next::Codec,
    config: &WriterConfig,
) -> Result<ResolvedFormat, WriterError> {
    let src = input_pixel_format(config.format);
    let hardware = hw::is_hardware_codec(&config.codec);

    let forced = if config.pix_fmt.is_empty() {
        None
    } else {
        let pixel = parse_pixel(&config.pix_fmt).ok_or_else(|| {
            WriterError::Configuration(format!("unknown pixel format: {}", config.pix_fmt))
        })?;
        Some(pixel)
    };

    if hardware {
        // Surfaces live on the device; the forced format (if any) selects the
        // software upload format instead.
        let target = forced.unwrap_or(Pixel::NV12);
        return Ok(ResolvedFormat {
            src,
            target,
            encoder: hw::SURFACE_FORMAT,
            full_range: false,
            needs_conversion: true,
        });
    }

    let advertised = supported_formats(codec);

    let target = match forced {
        Some(pixel) => {
            if let Some(ref formats) = advertised {
                if !formats.contains(&pixel) {
                    return Err(WriterError::Configuration(format!(
                        "codec {} does not support pixel format {}",
                        config.codec,
                        pixel_name(pixel)
                    )));
                }
            }
            pixel
        }
        None => match advertised {
            Some(ref formats) => preference_order(config.force_yuv)
                .iter()
                .copied()
                .find(|candidate| formats.contains(candidate))
                .ok_or_else(|| {
                    WriterError::Configuration(format!(
                        "no compatible pixel format for codec {}",
                        config.codec
                    ))
                })?,
            // Codec does not advertise a list; fall back to the safest choice.
            None => {
                if config.force_yuv {
                    Pixel::YUV420P
                } else {
                    Pixel::YUVJ420P
                }
            }
        },
    };

    Ok(ResolvedFormat {
        src,
        target,
        encoder: target,
        full_range: is_full_range(target) && !config.force_yuv,
        needs_conversion: target != src,
    })
}
