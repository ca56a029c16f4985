//! Frame geometry bookkeeping and buffer allocation.
//!
//! The manager keeps the requested ROI in unbinned sensor coordinates and
//! derives the applied (binned, clamped, aligned) ROI from it whenever the ROI,
//! binning or pixel format changes. Buffers are allocated fresh for every
//! exposure and handed to the acquisition worker, which owns them until the
//! readout completes.

use super::{
    deinterleave_into_planes, Binning, FrameConsumer, FrameGeometry, FrameMetadata, PixelFormat,
    Roi, MAX_FRAME_BYTES,
};
use crate::config::SensorConfig;
use crate::error::{EngineError, EngineResult};
use crate::exposure::FrameKind;
use crate::hardware::SensorInfo;
use chrono::Utc;
use std::time::Duration;
use tracing::{debug, warn};

/// Owns the readout geometry of one camera.
#[derive(Debug)]
pub struct FrameBufferManager {
    sensor: SensorInfo,
    width_alignment: u32,
    height_alignment: u32,
    buffer_memory: usize,
    /// Last ROI request, unbinned.
    requested: Roi,
    geometry: FrameGeometry,
    frame_bytes: usize,
    /// Geometry last written to the hardware.
    programmed: Option<FrameGeometry>,
    width_warned: bool,
    height_warned: bool,
}

impl FrameBufferManager {
    /// Full-frame, unbinned geometry in the sensor's deepest raw format.
    pub fn new(sensor: SensorInfo, alignment: &SensorConfig) -> EngineResult<Self> {
        let format = [PixelFormat::Raw16, PixelFormat::Raw8]
            .into_iter()
            .find(|f| sensor.supports(*f))
            .or_else(|| sensor.pixel_formats.first().copied())
            .ok_or_else(|| EngineError::BadRequest("sensor offers no pixel format".into()))?;

        let requested = Roi::full(sensor.max_width, sensor.max_height);
        let mut manager = Self {
            width_alignment: alignment.width_alignment.max(1),
            height_alignment: alignment.height_alignment.max(1),
            buffer_memory: alignment.buffer_memory,
            requested,
            geometry: FrameGeometry {
                roi: requested,
                binning: Binning::NONE,
                format,
            },
            frame_bytes: 0,
            programmed: None,
            width_warned: false,
            height_warned: false,
            sensor,
        };
        manager.apply(requested, Binning::NONE, format)?;
        Ok(manager)
    }

    /// Current applied geometry.
    pub fn geometry(&self) -> FrameGeometry {
        self.geometry
    }

    /// Bytes in one frame with the current geometry.
    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    /// Sensor this manager was built for.
    pub fn sensor(&self) -> &SensorInfo {
        &self.sensor
    }

    /// Request a new ROI in unbinned sensor pixels.
    ///
    /// Out-of-range or misaligned requests are truncated to the nearest valid
    /// ROI. The ROI actually applied (in binned pixels) is returned.
    pub fn set_roi(&mut self, roi: Roi) -> EngineResult<Roi> {
        self.apply(roi, self.geometry.binning, self.geometry.format)
    }

    /// Change binning; the last ROI request is re-applied at the new scale.
    pub fn set_binning(&mut self, binning: Binning) -> EngineResult<Roi> {
        let max = self.sensor.max_binning;
        if !(1..=max).contains(&binning.x) || !(1..=max).contains(&binning.y) {
            return Err(EngineError::BadRequest(format!(
                "binning {}x{} outside 1..={}",
                binning.x, binning.y, max
            )));
        }
        self.apply(self.requested, binning, self.geometry.format)
    }

    /// Change the pixel format.
    pub fn set_format(&mut self, format: PixelFormat) -> EngineResult<()> {
        if !self.sensor.supports(format) {
            return Err(EngineError::BadRequest(format!(
                "pixel format {} not supported by this sensor",
                format.as_str()
            )));
        }
        self.apply(self.requested, self.geometry.binning, format)?;
        Ok(())
    }

    fn apply(&mut self, requested: Roi, binning: Binning, format: PixelFormat) -> EngineResult<Roi> {
        if requested.width == 0 || requested.height == 0 {
            return Err(EngineError::BadRequest(format!(
                "ROI {}x{} is empty",
                requested.width, requested.height
            )));
        }

        let max_w = self.sensor.max_width / binning.x;
        let max_h = self.sensor.max_height / binning.y;
        let x = (requested.x / binning.x).min(max_w);
        let y = (requested.y / binning.y).min(max_h);
        let mut width = (requested.width / binning.x).min(max_w - x);
        let mut height = (requested.height / binning.y).min(max_h - y);

        let w_rem = width % self.width_alignment;
        if w_rem != 0 {
            if !self.width_warned {
                warn!(
                    width,
                    alignment = self.width_alignment,
                    "Frame width is not a multiple of the sensor alignment, truncating"
                );
                self.width_warned = true;
            }
            width -= w_rem;
        }
        let h_rem = height % self.height_alignment;
        if h_rem != 0 {
            if !self.height_warned {
                warn!(
                    height,
                    alignment = self.height_alignment,
                    "Frame height is not a multiple of the sensor alignment, truncating"
                );
                self.height_warned = true;
            }
            height -= h_rem;
        }

        if width == 0 || height == 0 {
            return Err(EngineError::BadRequest(format!(
                "ROI {}x{}+{}+{} leaves no pixels at {}x{} binning",
                requested.width, requested.height, requested.x, requested.y, binning.x, binning.y
            )));
        }

        let geometry = FrameGeometry {
            roi: Roi {
                x,
                y,
                width,
                height,
            },
            binning,
            format,
        };
        let frame_bytes = checked_frame_bytes(&geometry)?;

        self.requested = requested;
        self.geometry = geometry;
        self.frame_bytes = frame_bytes;
        debug!(
            roi = ?geometry.roi,
            bin_x = binning.x,
            bin_y = binning.y,
            format = format.as_str(),
            frame_bytes,
            "Frame geometry updated"
        );
        Ok(geometry.roi)
    }

    /// Geometry that still has to be written to the hardware, if any.
    pub fn pending_format(&self) -> Option<FrameGeometry> {
        match self.programmed {
            Some(programmed) if programmed == self.geometry => None,
            _ => Some(self.geometry),
        }
    }

    /// Record that `geometry` is now active on the hardware.
    pub fn mark_programmed(&mut self, geometry: FrameGeometry) {
        self.programmed = Some(geometry);
    }

    /// Bytes held at once while downloading one frame: the raw readout, plus
    /// the planar copy for interleaved colour.
    pub fn download_bytes(&self) -> Option<usize> {
        let copies = if self.geometry.format.is_interleaved_color() {
            2
        } else {
            1
        };
        self.frame_bytes.checked_mul(copies)
    }

    /// Allocate a zeroed buffer for one frame of the current geometry.
    ///
    /// Fails with `OutOfMemory` rather than aborting the process, including
    /// when the download would exceed the configured buffer memory.
    pub fn allocate(&self) -> EngineResult<Vec<u8>> {
        match self.download_bytes() {
            Some(bytes) if bytes <= self.buffer_memory => allocate_bytes(self.frame_bytes),
            bytes => {
                let bytes = bytes.unwrap_or(usize::MAX);
                warn!(
                    bytes,
                    limit = self.buffer_memory,
                    "Frame download exceeds buffer memory"
                );
                Err(EngineError::OutOfMemory { bytes })
            }
        }
    }

    /// Whether downstream should debayer frames of the current geometry.
    pub fn is_bayer(&self) -> bool {
        let raw = matches!(
            self.geometry.format,
            PixelFormat::Raw8 | PixelFormat::Raw16
        );
        self.sensor.is_color && raw && self.geometry.binning == Binning::NONE
    }

    /// Metadata for a frame read with the current geometry.
    pub fn metadata(&self, frame_kind: FrameKind, exposure: Duration, restarts: u32) -> FrameMetadata {
        FrameMetadata {
            geometry: self.geometry,
            frame_kind,
            exposure,
            planar: self.geometry.format.is_interleaved_color(),
            bayer: self.is_bayer(),
            restarts,
            timestamp: Utc::now(),
        }
    }
}

/// Frame bytes for `geometry`, bounded by [`MAX_FRAME_BYTES`].
pub fn checked_frame_bytes(geometry: &FrameGeometry) -> EngineResult<usize> {
    match geometry.frame_bytes() {
        Some(bytes) if bytes <= MAX_FRAME_BYTES => Ok(bytes),
        Some(bytes) => Err(EngineError::OutOfMemory { bytes }),
        None => Err(EngineError::OutOfMemory { bytes: usize::MAX }),
    }
}

fn allocate_bytes(bytes: usize) -> EngineResult<Vec<u8>> {
    if bytes > MAX_FRAME_BYTES {
        return Err(EngineError::OutOfMemory { bytes });
    }
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(bytes)
        .map_err(|_| EngineError::OutOfMemory { bytes })?;
    buffer.resize(bytes, 0);
    Ok(buffer)
}

/// Turn a complete raw readout into the delivered payload.
///
/// Non-interleaved formats are passed through untouched. Interleaved colour is
/// converted into planes with exactly one copy into a new buffer.
pub fn normalize(raw: Vec<u8>, format: PixelFormat, consumer: FrameConsumer) -> EngineResult<Vec<u8>> {
    if !format.is_interleaved_color() {
        return Ok(raw);
    }
    let mut planar = allocate_bytes(raw.len())?;
    deinterleave_into_planes(&raw, &mut planar, format.channels(), consumer.swaps_first_last());
    Ok(planar)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    fn manager(sensor: SensorInfo) -> FrameBufferManager {
        FrameBufferManager::new(sensor, &SensorConfig::default()).unwrap()
    }

    #[test]
    fn test_initial_geometry_is_full_frame() {
        let m = manager(SensorInfo::mono(640, 480));
        let g = m.geometry();
        assert_eq!(g.roi, Roi::full(640, 480));
        assert_eq!(g.format, PixelFormat::Raw16);
        assert_eq!(m.frame_bytes(), 640 * 480 * 2);
        assert_eq!(m.allocate().unwrap().len(), 640 * 480 * 2);
    }

    #[traced_test]
    #[test]
    fn test_misaligned_roi_truncated_and_warned_once() {
        let mut m = manager(SensorInfo::mono(640, 480));

        let applied = m
            .set_roi(Roi {
                x: 0,
                y: 0,
                width: 101,
                height: 51,
            })
            .unwrap();
        assert_eq!(applied.width, 96);
        assert_eq!(applied.height, 50);
        assert_eq!(m.frame_bytes(), 96 * 50 * 2);

        m.set_roi(Roi {
            x: 0,
            y: 0,
            width: 203,
            height: 101,
        })
        .unwrap();

        logs_assert(|lines: &[&str]| {
            let width_warnings = lines
                .iter()
                .filter(|l| l.contains("Frame width is not a multiple"))
                .count();
            let height_warnings = lines
                .iter()
                .filter(|l| l.contains("Frame height is not a multiple"))
                .count();
            match (width_warnings, height_warnings) {
                (1, 1) => Ok(()),
                other => Err(format!("expected one warning per axis, got {:?}", other)),
            }
        });
    }

    #[test]
    fn test_roi_clamped_to_sensor() {
        let mut m = manager(SensorInfo::mono(640, 480));
        let applied = m
            .set_roi(Roi {
                x: 600,
                y: 0,
                width: 200,
                height: 1000,
            })
            .unwrap();
        assert_eq!(applied.x, 600);
        assert_eq!(applied.width, 40);
        assert_eq!(applied.height, 480);
    }

    #[test]
    fn test_binning_rescales_requested_roi() {
        let mut m = manager(SensorInfo::mono(640, 480));
        let applied = m.set_binning(Binning::square(2)).unwrap();
        assert_eq!(applied, Roi::full(320, 240));
        assert_eq!(m.frame_bytes(), 320 * 240 * 2);

        assert!(matches!(
            m.set_binning(Binning::square(5)),
            Err(EngineError::BadRequest(_))
        ));
        assert!(matches!(
            m.set_binning(Binning { x: 0, y: 1 }),
            Err(EngineError::BadRequest(_))
        ));
    }

    #[test]
    fn test_empty_roi_rejected() {
        let mut m = manager(SensorInfo::mono(640, 480));
        let result = m.set_roi(Roi {
            x: 0,
            y: 0,
            width: 4,
            height: 10,
        });
        assert!(matches!(result, Err(EngineError::BadRequest(_))));
        // Geometry unchanged after a rejected request.
        assert_eq!(m.geometry().roi, Roi::full(640, 480));
    }

    #[test]
    fn test_unsupported_format_rejected() {
        let mut m = manager(SensorInfo::mono(640, 480));
        assert!(matches!(
            m.set_format(PixelFormat::Rgb24),
            Err(EngineError::BadRequest(_))
        ));

        let mut c = manager(SensorInfo::color(640, 480));
        c.set_format(PixelFormat::Rgb24).unwrap();
        assert_eq!(c.frame_bytes(), 640 * 480 * 3);
        assert!(!c.is_bayer());
    }

    #[test]
    fn test_oversized_frame_is_out_of_memory() {
        let mut m = manager(SensorInfo::color(6000, 6000));
        // 6000 x 6000 x 3 channels is above the frame limit.
        assert!(matches!(
            m.set_format(PixelFormat::Rgb24),
            Err(EngineError::OutOfMemory { .. })
        ));
        assert_eq!(m.geometry().format, PixelFormat::Raw16);

        m.set_roi(Roi::full(4000, 4000)).unwrap();
        m.set_format(PixelFormat::Rgb24).unwrap();
        assert_eq!(m.frame_bytes(), 4000 * 4000 * 3);
    }

    #[test]
    fn test_allocation_above_frame_limit_fails() {
        assert!(matches!(
            allocate_bytes(MAX_FRAME_BYTES + 1),
            Err(EngineError::OutOfMemory { bytes }) if bytes == MAX_FRAME_BYTES + 1
        ));
        assert_eq!(allocate_bytes(16).unwrap(), vec![0u8; 16]);
    }

    #[test]
    fn test_colour_download_needs_two_frames_of_memory() {
        let one_frame = 64 * 32 * 3;
        let config = SensorConfig {
            buffer_memory: one_frame,
            ..SensorConfig::default()
        };
        let mut m = FrameBufferManager::new(SensorInfo::color(64, 32), &config).unwrap();
        m.set_format(PixelFormat::Raw8).unwrap();
        assert_eq!(m.allocate().unwrap().len(), 64 * 32);

        m.set_format(PixelFormat::Rgb24).unwrap();
        assert_eq!(m.download_bytes(), Some(2 * one_frame));
        assert!(matches!(
            m.allocate(),
            Err(EngineError::OutOfMemory { bytes }) if bytes == 2 * one_frame
        ));
    }

    #[test]
    fn test_pending_format_tracks_changes() {
        let mut m = manager(SensorInfo::mono(640, 480));
        let initial = m.pending_format().unwrap();
        m.mark_programmed(initial);
        assert_eq!(m.pending_format(), None);

        m.set_binning(Binning::square(2)).unwrap();
        assert_eq!(m.pending_format().map(|g| g.binning), Some(Binning::square(2)));
    }

    #[test]
    fn test_bayer_hint() {
        let mut m = manager(SensorInfo::color(640, 480));
        assert!(m.is_bayer());
        m.set_binning(Binning::square(2)).unwrap();
        assert!(!m.is_bayer());
    }

    #[test]
    fn test_normalize_converts_colour_only() {
        let raw = vec![1, 2, 3, 4, 5, 6];
        let still = normalize(raw.clone(), PixelFormat::Rgb24, FrameConsumer::Still).unwrap();
        assert_eq!(still, vec![3, 6, 2, 5, 1, 4]);

        let mono = normalize(raw.clone(), PixelFormat::Raw8, FrameConsumer::Still).unwrap();
        assert_eq!(mono, raw);
    }
}
