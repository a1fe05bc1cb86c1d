use image::RgbImage;
use serde::Deserialize;

/// Pixel layout of a delivered frame buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    /// YUV 4:2:0 semi-planar: full-res Y plane followed by interleaved UV.
    Nv12,
    /// YUV 4:2:2 packed: Y0 U Y1 V per pixel pair.
    Yuyv,
    /// A complete JPEG image per frame.
    Mjpeg,
    /// Packed 8-bit RGB, no conversion needed before encoding.
    Rgb24,
}

/// A single decoded image buffer as delivered by the capture backend.
///
/// Transient: owned by the handler invocation that takes it from the
/// reader's latest-frame slot, never retained across invocations.
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub format: PixelFormat,
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

/// What a frame-arrived notification actually carried.
///
/// Capture streams can interleave non-video samples (audio, metadata);
/// handlers skip those without error.
#[derive(Debug, Clone)]
pub enum CapturedFrame {
    Video(VideoFrame),
    NonVideo,
}

impl CapturedFrame {
    /// Returns the video payload, or `None` for non-video samples.
    pub fn video(&self) -> Option<&VideoFrame> {
        match self {
            CapturedFrame::Video(frame) => Some(frame),
            CapturedFrame::NonVideo => None,
        }
    }

    pub fn into_video(self) -> Option<VideoFrame> {
        match self {
            CapturedFrame::Video(frame) => Some(frame),
            CapturedFrame::NonVideo => None,
        }
    }
}

impl VideoFrame {
    /// Convert to a packed RGB image, validating the buffer against the
    /// declared dimensions. `Rgb24` input passes through unchanged.
    pub fn to_rgb(&self) -> Result<RgbImage, FrameError> {
        match self.format {
            PixelFormat::Rgb24 => {
                let expected = pixel_count(self.width, self.height)?
                    .checked_mul(3)
                    .ok_or(FrameError::DimensionsOverflow)?;
                if self.data.len() != expected {
                    return Err(FrameError::BufferSize {
                        format: self.format,
                        expected,
                        got: self.data.len(),
                    });
                }
                RgbImage::from_raw(self.width, self.height, self.data.clone())
                    .ok_or(FrameError::DimensionsOverflow)
            }
            PixelFormat::Nv12 => self.nv12_to_rgb(),
            PixelFormat::Yuyv => self.yuyv_to_rgb(),
            PixelFormat::Mjpeg => {
                let decoded = image::load_from_memory(&self.data)
                    .map_err(FrameError::Decode)?
                    .to_rgb8();
                if decoded.width() != self.width || decoded.height() != self.height {
                    return Err(FrameError::DecodedSizeMismatch {
                        expected: (self.width, self.height),
                        got: (decoded.width(), decoded.height()),
                    });
                }
                Ok(decoded)
            }
        }
    }

    fn nv12_to_rgb(&self) -> Result<RgbImage, FrameError> {
        // 4:2:0 subsampling needs even dimensions; an odd width or height
        // makes the truncated UV plane smaller than the rounded-up row
        // indexing assumes.
        if self.width % 2 != 0 || self.height % 2 != 0 {
            return Err(FrameError::OddDimensions {
                format: self.format,
                width: self.width,
                height: self.height,
            });
        }
        let w = self.width as usize;
        let h = self.height as usize;
        let y_plane = pixel_count(self.width, self.height)?;
        let expected = y_plane
            .checked_add(y_plane / 2)
            .ok_or(FrameError::DimensionsOverflow)?;
        if self.data.len() != expected {
            return Err(FrameError::BufferSize {
                format: self.format,
                expected,
                got: self.data.len(),
            });
        }

        let mut rgb = vec![0u8; y_plane * 3];
        for j in 0..h {
            for i in 0..w {
                let y = self.data[j * w + i] as f32;
                // UV plane is interleaved at half resolution in both axes
                let uv_index = y_plane + (j / 2) * w + (i / 2) * 2;
                let u = self.data[uv_index] as f32 - 128.0;
                let v = self.data[uv_index + 1] as f32 - 128.0;
                write_rgb(&mut rgb[(j * w + i) * 3..], y, u, v);
            }
        }

        RgbImage::from_raw(self.width, self.height, rgb).ok_or(FrameError::DimensionsOverflow)
    }

    fn yuyv_to_rgb(&self) -> Result<RgbImage, FrameError> {
        // 4:2:2 pixel pairs need an even width
        if self.width % 2 != 0 {
            return Err(FrameError::OddDimensions {
                format: self.format,
                width: self.width,
                height: self.height,
            });
        }
        let pixels = pixel_count(self.width, self.height)?;
        let expected = pixels.checked_mul(2).ok_or(FrameError::DimensionsOverflow)?;
        if self.data.len() != expected {
            return Err(FrameError::BufferSize {
                format: self.format,
                expected,
                got: self.data.len(),
            });
        }

        let mut rgb = vec![0u8; pixels * 3];
        for (pair, chunk) in self.data.chunks_exact(4).enumerate() {
            let (y0, u, y1, v) = (chunk[0], chunk[1], chunk[2], chunk[3]);
            let u = u as f32 - 128.0;
            let v = v as f32 - 128.0;
            write_rgb(&mut rgb[pair * 6..], y0 as f32, u, v);
            write_rgb(&mut rgb[pair * 6 + 3..], y1 as f32, u, v);
        }

        RgbImage::from_raw(self.width, self.height, rgb).ok_or(FrameError::DimensionsOverflow)
    }
}

fn pixel_count(width: u32, height: u32) -> Result<usize, FrameError> {
    (width as usize)
        .checked_mul(height as usize)
        .ok_or(FrameError::DimensionsOverflow)
}

/// BT.601 YUV -> RGB for one pixel.
fn write_rgb(out: &mut [u8], y: f32, u: f32, v: f32) {
    let r = y + 1.402 * v;
    let g = y - 0.344_136 * u - 0.714_136 * v;
    let b = y + 1.772 * u;
    out[0] = clamp_to_u8(r);
    out[1] = clamp_to_u8(g);
    out[2] = clamp_to_u8(b);
}

fn clamp_to_u8(value: f32) -> u8 {
    value.round().clamp(0.0, 255.0) as u8
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("{format:?} buffer length mismatch: expected {expected} bytes, got {got}")]
    BufferSize {
        format: PixelFormat,
        expected: usize,
        got: usize,
    },
    #[error("{format:?} needs even dimensions for chroma subsampling, got {width}x{height}")]
    OddDimensions {
        format: PixelFormat,
        width: u32,
        height: u32,
    },
    #[error("frame dimensions overflow")]
    DimensionsOverflow,
    #[error("failed to decode compressed frame: {0}")]
    Decode(image::ImageError),
    #[error("decoded frame is {got:?}, negotiated format was {expected:?}")]
    DecodedSizeMismatch {
        expected: (u32, u32),
        got: (u32, u32),
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gray_nv12(width: u32, height: u32) -> VideoFrame {
        let y_plane = (width * height) as usize;
        let mut data = vec![128u8; y_plane];
        data.extend(vec![128u8; y_plane / 2]);
        VideoFrame {
            format: PixelFormat::Nv12,
            width,
            height,
            data,
        }
    }

    #[test]
    fn nv12_neutral_chroma_converts_to_gray() {
        let rgb = gray_nv12(2, 2).to_rgb().unwrap();
        assert_eq!(rgb.as_raw(), &vec![128u8; 12]);
    }

    #[test]
    fn nv12_wrong_length_is_rejected() {
        let mut frame = gray_nv12(2, 2);
        frame.data.pop();
        assert!(matches!(
            frame.to_rgb(),
            Err(FrameError::BufferSize { .. })
        ));
    }

    #[test]
    fn nv12_odd_dimensions_are_rejected() {
        // 3x2: the truncated UV plane passes the length check but the
        // last pixel's rounded-up UV index would read past the buffer
        let frame = VideoFrame {
            format: PixelFormat::Nv12,
            width: 3,
            height: 2,
            data: vec![128u8; 9],
        };
        assert!(matches!(
            frame.to_rgb(),
            Err(FrameError::OddDimensions { .. })
        ));

        let frame = VideoFrame {
            format: PixelFormat::Nv12,
            width: 2,
            height: 3,
            data: vec![128u8; 9],
        };
        assert!(matches!(
            frame.to_rgb(),
            Err(FrameError::OddDimensions { .. })
        ));
    }

    #[test]
    fn yuyv_odd_width_is_rejected_even_with_matching_length() {
        let frame = VideoFrame {
            format: PixelFormat::Yuyv,
            width: 3,
            height: 1,
            data: vec![128u8; 6],
        };
        assert!(matches!(
            frame.to_rgb(),
            Err(FrameError::OddDimensions { .. })
        ));
    }

    #[test]
    fn yuyv_neutral_chroma_converts_to_gray() {
        let frame = VideoFrame {
            format: PixelFormat::Yuyv,
            width: 2,
            height: 1,
            data: vec![200, 128, 200, 128],
        };
        let rgb = frame.to_rgb().unwrap();
        assert_eq!(rgb.as_raw(), &vec![200u8; 6]);
    }

    #[test]
    fn rgb24_passes_through() {
        let frame = VideoFrame {
            format: PixelFormat::Rgb24,
            width: 1,
            height: 2,
            data: vec![1, 2, 3, 4, 5, 6],
        };
        let rgb = frame.to_rgb().unwrap();
        assert_eq!(rgb.as_raw(), &frame.data);
    }

    #[test]
    fn mjpeg_decodes_and_checks_dimensions() {
        let mut jpeg = Vec::new();
        let img = RgbImage::from_pixel(4, 4, image::Rgb([10, 20, 30]));
        img.write_to(
            &mut std::io::Cursor::new(&mut jpeg),
            image::ImageFormat::Jpeg,
        )
        .unwrap();

        let frame = VideoFrame {
            format: PixelFormat::Mjpeg,
            width: 4,
            height: 4,
            data: jpeg.clone(),
        };
        assert_eq!(frame.to_rgb().unwrap().dimensions(), (4, 4));

        let mismatched = VideoFrame {
            format: PixelFormat::Mjpeg,
            width: 8,
            height: 8,
            data: jpeg,
        };
        assert!(matches!(
            mismatched.to_rgb(),
            Err(FrameError::DecodedSizeMismatch { .. })
        ));
    }

    #[test]
    fn non_video_has_no_payload() {
        assert!(CapturedFrame::NonVideo.video().is_none());
        let frame = CapturedFrame::Video(gray_nv12(2, 2));
        assert!(frame.video().is_some());
    }
}
