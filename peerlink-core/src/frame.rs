//! Decoded video frame records
//!
//! A [`Frame`] describes one decoded image: its id, capture timestamp,
//! pixel format and one [`ImagePlane`] per plane. Pixel bytes are held in
//! reference-counted [`Bytes`], so moving a frame description between the
//! native layer, the buffer pool and callbacks never copies pixel data.

use crate::error::{PeerLinkError, PeerLinkResult};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Maximum planes any supported format uses
pub const MAX_PLANES: usize = 3;

/// Pixel layout of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameFormat {
    /// Planar YUV 4:2:0, three planes (Y, U, V)
    Yuv420_888,
    /// Packed RGBA, one plane, four bytes per pixel
    Rgba8888,
}

impl FrameFormat {
    /// Number of planes the format always carries
    pub fn plane_count(&self) -> usize {
        match self {
            FrameFormat::Yuv420_888 => 3,
            FrameFormat::Rgba8888 => 1,
        }
    }
}

impl fmt::Display for FrameFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameFormat::Yuv420_888 => write!(f, "YUV420_888"),
            FrameFormat::Rgba8888 => write!(f, "RGBA_8888"),
        }
    }
}

/// Memory layout of one image plane
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ImagePlane {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Bytes per row
    pub stride: u32,
    /// Bytes per pixel
    pub bytes_per_pixel: u32,
    /// Size of the plane in bytes
    pub size: u32,
    /// Plane bytes
    pub data: Bytes,
}

impl ImagePlane {
    /// Describe a plane backed by `data`
    pub fn new(width: u32, height: u32, stride: u32, bytes_per_pixel: u32, data: Bytes) -> Self {
        Self {
            width,
            height,
            stride,
            bytes_per_pixel,
            size: data.len() as u32,
            data,
        }
    }

    fn check(&self, index: usize, format: FrameFormat) -> PeerLinkResult<()> {
        let reject = |reason: String| {
            Err(PeerLinkError::InvalidFrameFormat {
                reason: format!("{} plane {}: {}", format, index, reason),
            })
        };

        if self.width == 0 || self.height == 0 {
            return reject("zero-sized plane".to_string());
        }
        let bpp_ok = match format {
            FrameFormat::Rgba8888 => self.bytes_per_pixel == 4,
            FrameFormat::Yuv420_888 => matches!(self.bytes_per_pixel, 1 | 2),
        };
        if !bpp_ok {
            return reject(format!("{} bytes per pixel", self.bytes_per_pixel));
        }

        let row = self.width as u64 * self.bytes_per_pixel as u64;
        if (self.stride as u64) < row {
            return reject(format!("stride {} shorter than row {}", self.stride, row));
        }
        let needed = self.stride as u64 * (self.height as u64 - 1) + row;
        if (self.size as u64) < needed {
            return reject(format!("size {} below {} required", self.size, needed));
        }
        if (self.data.len() as u64) < self.size as u64 {
            return reject(format!(
                "{} bytes of data for declared size {}",
                self.data.len(),
                self.size
            ));
        }
        Ok(())
    }
}

/// One decoded video frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame id
    pub id: u64,
    /// Capture timestamp in microseconds
    pub timestamp_us: u64,
    /// Pixel format
    pub format: FrameFormat,
    /// Planes; length always equals `format.plane_count()` for a validated frame
    pub planes: Vec<ImagePlane>,
}

impl Frame {
    /// Build and validate a frame
    pub fn new(
        id: u64,
        timestamp_us: u64,
        format: FrameFormat,
        planes: Vec<ImagePlane>,
    ) -> PeerLinkResult<Self> {
        let frame = Self {
            id,
            timestamp_us,
            format,
            planes,
        };
        frame.validate()?;
        Ok(frame)
    }

    /// Packed RGBA frame with a tightly packed stride
    pub fn rgba(id: u64, timestamp_us: u64, width: u32, height: u32, data: Bytes) -> PeerLinkResult<Self> {
        let stride = width
            .checked_mul(4)
            .ok_or_else(|| PeerLinkError::InvalidFrameFormat {
                reason: format!("width {} overflows an RGBA row", width),
            })?;
        let plane = ImagePlane::new(width, height, stride, 4, data);
        Self::new(id, timestamp_us, FrameFormat::Rgba8888, vec![plane])
    }

    /// Planar YUV 4:2:0 frame; chroma planes are half size, rounded up
    pub fn yuv420(
        id: u64,
        timestamp_us: u64,
        width: u32,
        height: u32,
        y: Bytes,
        u: Bytes,
        v: Bytes,
    ) -> PeerLinkResult<Self> {
        let chroma_width = width.div_ceil(2);
        let chroma_height = height.div_ceil(2);
        let planes = vec![
            ImagePlane::new(width, height, width, 1, y),
            ImagePlane::new(chroma_width, chroma_height, chroma_width, 1, u),
            ImagePlane::new(chroma_width, chroma_height, chroma_width, 1, v),
        ];
        Self::new(id, timestamp_us, FrameFormat::Yuv420_888, planes)
    }

    /// Empty description used to pre-allocate pool slots
    pub fn empty(format: FrameFormat) -> Self {
        Self {
            id: 0,
            timestamp_us: 0,
            format,
            planes: Vec::with_capacity(MAX_PLANES),
        }
    }

    /// Check plane count and per-plane layout against the format
    pub fn validate(&self) -> PeerLinkResult<()> {
        let expected = self.format.plane_count();
        if self.planes.len() != expected {
            return Err(PeerLinkError::InvalidFramePlaneCount {
                format: self.format.to_string(),
                expected,
                actual: self.planes.len(),
            });
        }
        for (index, plane) in self.planes.iter().enumerate() {
            plane.check(index, self.format)?;
        }
        Ok(())
    }

    /// Overwrite this description in place, keeping the plane vector's allocation
    pub fn copy_from(&mut self, other: &Frame) {
        self.id = other.id;
        self.timestamp_us = other.timestamp_us;
        self.format = other.format;
        self.planes.clear();
        self.planes.extend(other.planes.iter().cloned());
    }

    /// Width of the first plane
    pub fn width(&self) -> u32 {
        self.planes.first().map_or(0, |p| p.width)
    }

    /// Height of the first plane
    pub fn height(&self) -> u32 {
        self.planes.first().map_or(0, |p| p.height)
    }

    /// Total bytes across planes
    pub fn total_size(&self) -> u64 {
        self.planes.iter().map(|p| p.size as u64).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResultCode;

    fn rgba_bytes(width: u32, height: u32) -> Bytes {
        Bytes::from(vec![0u8; (width * height * 4) as usize])
    }

    #[test]
    fn test_plane_count_is_format_determined() {
        assert_eq!(FrameFormat::Yuv420_888.plane_count(), 3);
        assert_eq!(FrameFormat::Rgba8888.plane_count(), 1);
    }

    #[test]
    fn test_rgba_frame_metadata() {
        let frame = Frame::rgba(9, 1_000, 4, 2, rgba_bytes(4, 2)).unwrap();
        let plane = &frame.planes[0];
        assert_eq!(frame.id, 9);
        assert_eq!(frame.timestamp_us, 1_000);
        assert_eq!(plane.stride, 16);
        assert_eq!(plane.size, 32);
        assert_eq!(frame.width(), 4);
        assert_eq!(frame.height(), 2);
    }

    #[test]
    fn test_rgba_width_overflow_rejected() {
        let err = Frame::rgba(1, 0, u32::MAX / 2, 1, Bytes::new()).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidFrameFormat);
    }

    #[test]
    fn test_mismatched_plane_count_rejected() {
        let plane = ImagePlane::new(2, 2, 8, 4, rgba_bytes(2, 2));
        let err = Frame::new(1, 0, FrameFormat::Yuv420_888, vec![plane]).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidFramePlaneCount);
    }

    #[test]
    fn test_bad_layout_rejected() {
        let short = ImagePlane::new(4, 4, 16, 4, Bytes::from(vec![0u8; 10]));
        let err = Frame::new(1, 0, FrameFormat::Rgba8888, vec![short]).unwrap_err();
        assert_eq!(err.code(), ResultCode::InvalidFrameFormat);

        let bad_bpp = ImagePlane::new(2, 2, 8, 3, rgba_bytes(2, 2));
        assert!(Frame::new(1, 0, FrameFormat::Rgba8888, vec![bad_bpp]).is_err());
    }

    #[test]
    fn test_yuv420_odd_dimensions() {
        let frame = Frame::yuv420(
            1,
            0,
            5,
            3,
            Bytes::from(vec![0u8; 15]),
            Bytes::from(vec![0u8; 6]),
            Bytes::from(vec![0u8; 6]),
        )
        .unwrap();
        assert_eq!(frame.planes[1].width, 3);
        assert_eq!(frame.planes[1].height, 2);
        assert_eq!(frame.total_size(), 27);
    }

    #[test]
    fn test_copy_from_keeps_allocation() {
        let source = Frame::rgba(3, 30, 2, 2, rgba_bytes(2, 2)).unwrap();
        let mut slot = Frame::empty(FrameFormat::Yuv420_888);
        let capacity = slot.planes.capacity();

        slot.copy_from(&source);
        assert_eq!(slot, source);
        assert_eq!(slot.planes.capacity(), capacity);
    }
}
