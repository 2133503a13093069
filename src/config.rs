// config.rs — Warp session configuration.
//
// One plain struct with public fields and a `Default` that matches the
// camera-driven face warp. Serde derives let a host application keep the
// settings next to its own config; nothing in the crate reads files.

use serde::{Deserialize, Serialize};

use crate::error::{WarpError, WarpResult};
use crate::gpu::device::DeviceProfile;
use crate::mask::{MaskMode, DEFAULT_BLUR_PASSES};

/// Which execution substrate draws the warp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendPreference {
    /// Try the GPU, fall back to the host backend if it cannot be created.
    #[default]
    Auto,
    /// Data-parallel host execution only.
    Host,
    /// GPU only; initialisation failure is reported to the caller.
    Gpu,
}

/// Serializable mirror of [`DeviceProfile`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceProfileSetting {
    #[default]
    Native,
    RaspberryPi,
}

impl From<DeviceProfileSetting> for DeviceProfile {
    fn from(s: DeviceProfileSetting) -> Self {
        match s {
            DeviceProfileSetting::Native => DeviceProfile::Native,
            DeviceProfileSetting::RaspberryPi => DeviceProfile::RaspberryPi,
        }
    }
}

/// Settings for one warp session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WarpConfig {
    /// Diffusion passes used to soften the region mask.
    pub blur_passes: usize,
    /// Outline used for the inside test.
    pub mask_mode: MaskMode,
    /// Keep every k-th active landmark (starting at index 0).
    /// The camera driver runs with 2.
    pub active_landmark_stride: usize,
    /// CPU draw visits every s-th pixel per axis. 1 is the exact algorithm.
    pub processing_scale: usize,
    /// Precompute the base-inverse leg for every pixel of the region.
    pub precompute_base_inverse: bool,
    /// Execution substrate for `draw_accelerated`.
    pub backend: BackendPreference,
    /// Device limits profile for the GPU backend.
    pub device_profile: DeviceProfileSetting,
}

impl Default for WarpConfig {
    fn default() -> Self {
        WarpConfig {
            blur_passes: DEFAULT_BLUR_PASSES,
            mask_mode: MaskMode::ConvexHull,
            active_landmark_stride: 1,
            processing_scale: 1,
            precompute_base_inverse: true,
            backend: BackendPreference::Auto,
            device_profile: DeviceProfileSetting::Native,
        }
    }
}

impl WarpConfig {
    /// Settings used by the live camera driver: every second landmark
    /// drives the active spline.
    pub fn camera() -> Self {
        WarpConfig { active_landmark_stride: 2, ..Self::default() }
    }

    pub fn with_mask_mode(mut self, mode: MaskMode) -> Self {
        self.mask_mode = mode;
        self
    }

    pub fn with_blur_passes(mut self, passes: usize) -> Self {
        self.blur_passes = passes;
        self
    }

    pub fn with_active_landmark_stride(mut self, stride: usize) -> Self {
        self.active_landmark_stride = stride;
        self
    }

    pub fn with_processing_scale(mut self, scale: usize) -> Self {
        self.processing_scale = scale;
        self
    }

    pub fn with_backend(mut self, backend: BackendPreference) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_precompute_base_inverse(mut self, on: bool) -> Self {
        self.precompute_base_inverse = on;
        self
    }

    pub fn validate(&self) -> WarpResult<()> {
        if self.blur_passes == 0 {
            return Err(WarpError::invalid_config("blur_passes must be at least 1"));
        }
        if self.active_landmark_stride == 0 {
            return Err(WarpError::invalid_config("active_landmark_stride must be at least 1"));
        }
        if self.processing_scale == 0 {
            return Err(WarpError::invalid_config("processing_scale must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = WarpConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.blur_passes, 20);
        assert_eq!(cfg.mask_mode, MaskMode::ConvexHull);
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(WarpConfig::default().with_blur_passes(0).validate().is_err());
        assert!(WarpConfig::default().with_active_landmark_stride(0).validate().is_err());
        assert!(WarpConfig::default().with_processing_scale(0).validate().is_err());
    }

    #[test]
    fn test_camera_preset() {
        assert_eq!(WarpConfig::camera().active_landmark_stride, 2);
    }

    #[test]
    fn test_profile_setting_converts() {
        assert_eq!(DeviceProfile::from(DeviceProfileSetting::RaspberryPi), DeviceProfile::RaspberryPi);
    }
}
