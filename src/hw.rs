//! Hardware acceleration context.
//!
//! Owns the VAAPI device context and a bounded frame-pool context sized to
//! the stream. Frames destined for a hardware codec must be uploaded into a
//! pool surface first; a software frame is never handed to a hardware codec
//! context directly.
//!
//! The hwcontext API is not covered by the safe ffmpeg-next wrapper, so this
//! module talks to `ffmpeg_next::ffi` directly.

use std::ffi::CString;
use std::ptr;

use ffmpeg_next::ffi::{
    AVBufferRef, AVHWDeviceType, AVHWFramesContext, AVPixelFormat, av_buffer_ref,
    av_buffer_unref, av_hwdevice_ctx_create, av_hwframe_ctx_alloc, av_hwframe_ctx_init,
    av_hwframe_get_buffer, av_hwframe_transfer_data,
};
use ffmpeg_next::format::Pixel;
use ffmpeg_next::frame;

use crate::error::WriterError;

/// Surface format hardware codecs consume.
pub const SURFACE_FORMAT: Pixel = Pixel::VAAPI;

/// Pool headroom beyond the encoder's B-frame chain. Covers rate-control
/// lookahead without letting the pool grow unbounded.
const POOL_HEADROOM: i32 = 16;

/// Whether a codec name selects a hardware-accelerated family.
pub fn is_hardware_codec(codec_name: &str) -> bool {
    codec_name.contains("vaapi")
}

/// Bounded surface count for a pipeline with `bframes` consecutive B-frames.
pub fn pool_size(bframes: i32) -> i32 {
    POOL_HEADROOM + bframes.max(0)
}

/// VAAPI device context plus the frame pool derived from it.
#[derive(Debug)]
pub struct HwContext {
    device_ref: *mut AVBufferRef,
    frames_ref: *mut AVBufferRef,
}

// Safety: both AVBufferRefs are exclusive handles into libav's thread-safe
// refcounting; no other alias to them exists outside codec contexts that
// take their own reference via `frames_ref()`.
unsafe impl Send for HwContext {}

impl HwContext {
    /// Open the named device (or the default when `device` is empty) and
    /// allocate a frame pool for `width`x`height` NV12 uploads.
    ///
    /// Both steps are fatal on failure: there is no degraded mode for a
    /// hardware codec without its surfaces.
    pub fn new(
        device: &str,
        width: u32,
        height: u32,
        surfaces: i32,
    ) -> Result<Self, WriterError> {
        let device_name = if device.is_empty() {
            None
        } else {
            Some(CString::new(device).map_err(|_| {
                WriterError::Configuration(format!("invalid hardware device name: {device}"))
            })?)
        };

        let mut device_ref: *mut AVBufferRef = ptr::null_mut();
        let ret = unsafe {
            av_hwdevice_ctx_create(
                &mut device_ref,
                AVHWDeviceType::AV_HWDEVICE_TYPE_VAAPI,
                device_name
                    .as_ref()
                    .map_or(ptr::null(), |name| name.as_ptr()),
                ptr::null_mut(),
                0,
            )
        };
        if ret < 0 {
            return Err(WriterError::Configuration(format!(
                "failed to open vaapi device {}: {}",
                if device.is_empty() { "(default)" } else { device },
                ffmpeg_next::Error::from(ret)
            )));
        }

        let frames_ref = unsafe { av_hwframe_ctx_alloc(device_ref) };
        if frames_ref.is_null() {
            let mut device = device_ref;
            unsafe { av_buffer_unref(&mut device) };
            return Err(WriterError::Configuration(
                "failed to allocate hardware frame context".to_string(),
            ));
        }

        unsafe {
            let frames_ctx = (*frames_ref).data as *mut AVHWFramesContext;
            (*frames_ctx).format = SURFACE_FORMAT.into();
            (*frames_ctx).sw_format = AVPixelFormat::AV_PIX_FMT_NV12;
            (*frames_ctx).width = width as i32;
            (*frames_ctx).height = height as i32;
            (*frames_ctx).initial_pool_size = surfaces;
        }

        let ret = unsafe { av_hwframe_ctx_init(frames_ref) };
        if ret < 0 {
            let mut frames = frames_ref;
            let mut device = device_ref;
            unsafe {
                av_buffer_unref(&mut frames);
                av_buffer_unref(&mut device);
            }
            return Err(WriterError::Configuration(format!(
                "failed to initialize hardware frame pool: {}",
                ffmpeg_next::Error::from(ret)
            )));
        }

        log::info!(
            "vaapi frame pool ready: {}x{} nv12, {} surfaces",
            width,
            height,
            surfaces
        );

        Ok(Self {
            device_ref,
            frames_ref,
        })
    }

    /// New reference to the frame pool, for the codec context to own.
    pub fn frames_ref(&self) -> *mut AVBufferRef {
        unsafe { av_buffer_ref(self.frames_ref) }
    }

    /// Upload a software frame into a pool surface.
    ///
    /// A pool with no free surface fails the current frame with a resource
    /// error; the caller drops the frame and continues.
    pub fn upload(&self, sw_frame: &frame::Video) -> Result<frame::Video, WriterError> {
        let mut hw_frame = frame::Video::empty();
        let ret = unsafe { av_hwframe_get_buffer(self.frames_ref, hw_frame.as_mut_ptr(), 0) };
        if ret < 0 {
            return Err(WriterError::Resource(format!(
                "hardware frame pool exhausted: {}",
                ffmpeg_next::Error::from(ret)
            )));
        }

        let ret = unsafe { av_hwframe_transfer_data(hw_frame.as_mut_ptr(), sw_frame.as_ptr(), 0) };
        if ret < 0 {
            return Err(WriterError::Codec(ffmpeg_next::Error::from(ret)));
        }

        hw_frame.set_pts(sw_frame.pts());
        Ok(hw_frame)
    }
}

impl Drop for HwContext {
    fn drop(&mut self) {
        unsafe {
            av_buffer_unref(&mut self.frames_ref);
            av_buffer_unref(&mut self.device_ref);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_family_detection() {
        assert!(is_hardware_codec("h264_vaapi"));
        assert!(is_hardware_codec("hevc_vaapi"));
        assert!(!is_hardware_codec("libx264"));
        assert!(!is_hardware_codec("ffv1"));
    }

    #[test]
    fn pool_size_is_bounded() {
        assert_eq!(pool_size(0), 16);
        assert_eq!(pool_size(2), 18);
        assert_eq!(pool_size(-3), 16);
    }

    #[test]
    fn bogus_device_fails_fast() {
        crate::init().unwrap();
        let err = HwContext::new("/dev/dri/does-not-exist", 640, 480, pool_size(0)).unwrap_err();
        assert!(err.is_configuration(), "got: {err}");
    }
}
