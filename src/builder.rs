use crate::config::CameraConfig;
use crate::frame::{CapturedFrame, PixelFormat, VideoFrame};
use crate::reader::{FrameReader, ReaderError, StreamControl};
use nokhwa::pixel_format::RgbFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraInfo, FrameFormat, RequestedFormat, RequestedFormatType,
    Resolution,
};
use nokhwa::{query, CallbackCamera};
use tracing::{debug, info, warn};

/// Frame rate is not part of the match contract; the backend picks the
/// closest rate the device offers at the requested resolution/format.
const REQUESTED_FRAME_RATE: u32 = 30;

/// Selects a capture device and negotiates a frame stream against it.
///
/// `build` returns `None` for every failure mode (no device whose name
/// contains the substring, no exact width/height/format match,
/// construction error). Callers treat `None` as "capture unavailable"
/// and skip starting; nothing here affects the process exit code.
pub struct FrameSourceBuilder {
    name_match: String,
    width: u32,
    height: u32,
    format: PixelFormat,
}

impl FrameSourceBuilder {
    pub fn new(name_match: impl Into<String>, width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            name_match: name_match.into(),
            width,
            height,
            format,
        }
    }

    pub fn from_config(camera: &CameraConfig) -> Self {
        Self::new(
            camera.name_match.clone(),
            camera.width,
            camera.height,
            camera.format,
        )
    }

    pub fn build(self) -> Option<FrameReader> {
        let cameras = match query(ApiBackend::Auto) {
            Ok(cameras) => cameras,
            Err(e) => {
                warn!(error = %e, "capture device enumeration failed");
                return None;
            }
        };
        debug!(count = cameras.len(), "enumerated capture devices");

        let device = match match_device(&cameras, &self.name_match) {
            Some(device) => device,
            None => {
                info!(name_match = self.name_match, "no capture device matches");
                return None;
            }
        };
        info!(device = device.human_name(), "selected capture device");

        let wanted = CameraFormat::new(
            Resolution::new(self.width, self.height),
            frame_format_of(self.format),
            REQUESTED_FRAME_RATE,
        );
        let requested = RequestedFormat::new::<RgbFormat>(RequestedFormatType::Closest(wanted));

        let (mut reader, sender) = FrameReader::detached();
        let camera = CallbackCamera::new(device.index().clone(), requested, move |buffer| {
            match pixel_format_of(buffer.source_frame_format()) {
                Some(format) => {
                    let resolution = buffer.resolution();
                    sender.deliver(CapturedFrame::Video(VideoFrame {
                        format,
                        width: resolution.width(),
                        height: resolution.height(),
                        data: buffer.buffer().to_vec(),
                    }));
                }
                None => debug!(
                    format = ?buffer.source_frame_format(),
                    "dropping frame with unsupported pixel layout"
                ),
            }
        });
        let camera = match camera {
            Ok(camera) => camera,
            Err(e) => {
                warn!(error = %e, "failed to open capture device");
                return None;
            }
        };

        let negotiated = match camera.camera_format() {
            Ok(format) => format,
            Err(e) => {
                warn!(error = %e, "failed to read negotiated format");
                return None;
            }
        };
        if !format_matches(&negotiated, &wanted) {
            info!(
                requested = ?wanted,
                negotiated = ?negotiated,
                "device cannot provide the requested frame format"
            );
            return None;
        }
        info!(format = ?negotiated, "negotiated frame format");

        reader.set_control(Box::new(CameraControl { camera }));
        Some(reader)
    }
}

/// First device whose display name contains the substring, case-sensitive.
fn match_device<'a>(cameras: &'a [CameraInfo], name_match: &str) -> Option<&'a CameraInfo> {
    cameras
        .iter()
        .find(|camera| camera.human_name().contains(name_match))
}

/// Resolution and pixel layout must match exactly; frame rate is whatever
/// the device offered.
fn format_matches(negotiated: &CameraFormat, wanted: &CameraFormat) -> bool {
    negotiated.resolution() == wanted.resolution() && negotiated.format() == wanted.format()
}

fn frame_format_of(format: PixelFormat) -> FrameFormat {
    match format {
        PixelFormat::Nv12 => FrameFormat::NV12,
        PixelFormat::Yuyv => FrameFormat::YUYV,
        PixelFormat::Mjpeg => FrameFormat::MJPEG,
        PixelFormat::Rgb24 => FrameFormat::RAWRGB,
    }
}

fn pixel_format_of(format: FrameFormat) -> Option<PixelFormat> {
    match format {
        FrameFormat::NV12 => Some(PixelFormat::Nv12),
        FrameFormat::YUYV => Some(PixelFormat::Yuyv),
        FrameFormat::MJPEG => Some(PixelFormat::Mjpeg),
        FrameFormat::RAWRGB => Some(PixelFormat::Rgb24),
        _ => None,
    }
}

/// Exclusive hardware access is held from `start` until `stop` (or until
/// the camera is dropped).
struct CameraControl {
    camera: CallbackCamera,
}

impl StreamControl for CameraControl {
    fn start(&mut self) -> Result<(), ReaderError> {
        self.camera
            .open_stream()
            .map_err(|e| ReaderError::Start(e.to_string()))
    }

    fn stop(&mut self) -> Result<(), ReaderError> {
        self.camera
            .stop_stream()
            .map_err(|e| ReaderError::Stop(e.to_string()))
    }
}
