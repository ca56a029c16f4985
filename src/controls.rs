//! Typed camera control table.
//!
//! Built once at connect from the capability list the hardware reports, then
//! addressed by [`ControlId`] instead of by name.

use crate::error::{EngineError, EngineResult};
use crate::hardware::{CameraHardware, ControlCaps, ControlId, ControlKind};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Everything known about one control.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlInfo {
    /// Which control this is.
    pub id: ControlId,
    /// Value semantics, inferred from the range.
    pub kind: ControlKind,
    /// Smallest accepted value.
    pub min: i64,
    /// Largest accepted value.
    pub max: i64,
    /// Value after power-up.
    pub default: i64,
    /// Whether the value can be changed.
    pub writable: bool,
    /// Whether the camera can drive the value itself.
    pub auto_supported: bool,
}

impl From<&ControlCaps> for ControlInfo {
    fn from(caps: &ControlCaps) -> Self {
        // A 0..=1 range is a switch.
        let kind = if caps.min == 0 && caps.max == 1 {
            ControlKind::Boolean
        } else {
            ControlKind::Integer
        };
        Self {
            id: caps.id,
            kind,
            min: caps.min,
            max: caps.max,
            default: caps.default,
            writable: caps.writable,
            auto_supported: caps.auto_supported,
        }
    }
}

/// Controls supported by the connected camera.
pub struct ControlTable {
    hardware: Arc<dyn CameraHardware>,
    slots: Vec<Option<ControlInfo>>,
}

impl ControlTable {
    /// Query the hardware and build the table.
    pub async fn load(hardware: Arc<dyn CameraHardware>) -> EngineResult<Self> {
        let caps = hardware.control_caps().await?;
        Ok(Self::from_caps(hardware, &caps))
    }

    /// Build the table from an already fetched capability list.
    pub fn from_caps(hardware: Arc<dyn CameraHardware>, caps: &[ControlCaps]) -> Self {
        let mut slots = vec![None; ControlId::ALL.len()];
        for cap in caps {
            debug!(control = ?cap.id, min = cap.min, max = cap.max, writable = cap.writable, "Control");
            slots[cap.id.index()] = Some(ControlInfo::from(cap));
        }
        Self { hardware, slots }
    }

    /// Capabilities of `id`, if the camera offers it.
    pub fn get(&self, id: ControlId) -> Option<&ControlInfo> {
        self.slots.get(id.index()).and_then(Option::as_ref)
    }

    /// Whether the camera offers `id`.
    pub fn contains(&self, id: ControlId) -> bool {
        self.get(id).is_some()
    }

    /// Supported controls, in table order.
    pub fn iter(&self) -> impl Iterator<Item = &ControlInfo> {
        self.slots.iter().flatten()
    }

    /// Number of controls the camera offers.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether the camera offers no controls at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Validate and write a control value.
    pub async fn set(&self, id: ControlId, value: i64, auto: bool) -> EngineResult<()> {
        let info = self
            .get(id)
            .ok_or_else(|| EngineError::BadRequest(format!("control {id:?} not supported")))?;
        if !info.writable {
            return Err(EngineError::BadRequest(format!("control {id:?} is read-only")));
        }
        if auto && !info.auto_supported {
            return Err(EngineError::BadRequest(format!(
                "control {id:?} has no automatic mode"
            )));
        }
        if value < info.min || value > info.max {
            return Err(EngineError::BadRequest(format!(
                "control {id:?} value {value} outside {}..={}",
                info.min, info.max
            )));
        }
        self.hardware.set_control(id, value, auto).await?;
        debug!(control = ?id, value, auto, "Control updated");
        Ok(())
    }
}
