//! Frame geometry, pixel formats and the delivered frame type.
//!
//! [`FrameBufferManager`] owns the geometry (ROI, binning, pixel format) and
//! produces correctly sized buffers for the acquisition worker. The conversion
//! from the vendor's interleaved component order into channel-planar data lives
//! in [`convert`].

pub mod buffer;
pub mod convert;

pub use buffer::FrameBufferManager;
pub use convert::{deinterleave_into_planes, FrameConsumer};

use crate::exposure::FrameKind;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum allowed frame payload in bytes (100 MiB).
pub const MAX_FRAME_BYTES: usize = 100 * 1024 * 1024;

/// Region of interest in binned pixels.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Roi {
    /// Left edge.
    pub x: u32,
    /// Top edge.
    pub y: u32,
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Roi {
    /// ROI covering a whole `width` x `height` sensor.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }

    /// Number of pixels covered.
    pub fn pixels(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Binning factors.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Binning {
    /// Horizontal factor.
    pub x: u32,
    /// Vertical factor.
    pub y: u32,
}

impl Binning {
    /// Unbinned readout.
    pub const NONE: Binning = Binning { x: 1, y: 1 };

    /// Symmetric binning.
    pub fn square(factor: u32) -> Self {
        Self {
            x: factor,
            y: factor,
        }
    }
}

impl Default for Binning {
    fn default() -> Self {
        Self::NONE
    }
}

/// Sensor output formats.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 8-bit raw (Bayer on colour sensors).
    Raw8,
    /// 16-bit raw (Bayer on colour sensors).
    Raw16,
    /// 8-bit luminance.
    Y8,
    /// 8-bit interleaved colour, vendor order B, G, R.
    Rgb24,
    /// 8-bit interleaved colour with alpha, vendor order B, G, R, A.
    Rgb32,
}

impl PixelFormat {
    /// Bytes per channel sample.
    pub fn bytes_per_pixel(&self) -> usize {
        match self {
            PixelFormat::Raw16 => 2,
            _ => 1,
        }
    }

    /// Interleaved channel count.
    pub fn channels(&self) -> usize {
        match self {
            PixelFormat::Rgb24 => 3,
            PixelFormat::Rgb32 => 4,
            _ => 1,
        }
    }

    /// Whether the hardware delivers interleaved colour components.
    pub fn is_interleaved_color(&self) -> bool {
        self.channels() > 1
    }

    /// Stable name for logs and metadata.
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Raw8 => "RAW8",
            PixelFormat::Raw16 => "RAW16",
            PixelFormat::Y8 => "Y8",
            PixelFormat::Rgb24 => "RGB24",
            PixelFormat::Rgb32 => "RGB32",
        }
    }
}

/// Current readout geometry.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameGeometry {
    /// ROI in binned pixels.
    pub roi: Roi,
    /// On-chip binning.
    pub binning: Binning,
    /// Pixel layout of the readout.
    pub format: PixelFormat,
}

impl FrameGeometry {
    /// Bytes needed for one frame: `width x height x bytes-per-pixel x channels`.
    ///
    /// Returns `None` when the product overflows `usize`.
    pub fn frame_bytes(&self) -> Option<usize> {
        (self.roi.width as usize)
            .checked_mul(self.roi.height as usize)?
            .checked_mul(self.format.bytes_per_pixel())?
            .checked_mul(self.format.channels())
    }
}

/// Metadata delivered alongside pixel data.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct FrameMetadata {
    /// Readout geometry of the frame.
    pub geometry: FrameGeometry,
    /// What the frame is used for.
    pub frame_kind: FrameKind,
    /// Requested integration time.
    #[serde(with = "humantime_serde")]
    pub exposure: Duration,
    /// Data is channel-planar (colour formats only).
    pub planar: bool,
    /// Downstream should debayer this frame.
    pub bayer: bool,
    /// Number of exposure restarts it took to get this frame.
    pub restarts: u32,
    /// When the readout finished.
    pub timestamp: DateTime<Utc>,
}

/// A fully read-back frame. Only ever built from a complete readout.
#[derive(Clone, Debug, PartialEq)]
pub struct Frame {
    /// Pixel payload, planar for colour formats.
    pub data: Vec<u8>,
    /// Geometry and acquisition details.
    pub metadata: FrameMetadata,
}

impl Frame {
    /// Pixel payload length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the payload is empty (zero sized ROI).
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}
