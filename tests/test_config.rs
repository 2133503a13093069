// tests/test_config.rs — Configuration serialization.

use pareidolia::config::{BackendPreference, DeviceProfileSetting, WarpConfig};
use pareidolia::mask::MaskMode;

#[test]
fn partial_json_fills_defaults() {
    let cfg: WarpConfig = serde_json::from_str(r#"{ "mask_mode": "polygon", "backend": "host" }"#).unwrap();
    assert_eq!(cfg.mask_mode, MaskMode::Polygon);
    assert_eq!(cfg.backend, BackendPreference::Host);
    assert_eq!(cfg.blur_passes, WarpConfig::default().blur_passes);
    assert!(cfg.validate().is_ok());
}

#[test]
fn json_round_trip() {
    let cfg = WarpConfig::camera().with_processing_scale(2).with_blur_passes(8);
    let text = serde_json::to_string_pretty(&cfg).unwrap();
    assert!(text.contains("\"active_landmark_stride\": 2"));
    let back: WarpConfig = serde_json::from_str(&text).unwrap();
    assert_eq!(back, cfg);
}

#[test]
fn device_profile_names() {
    let cfg: WarpConfig = serde_json::from_str(r#"{ "device_profile": "raspberry_pi" }"#).unwrap();
    assert_eq!(cfg.device_profile, DeviceProfileSetting::RaspberryPi);
}

#[test]
fn invalid_values_deserialize_but_fail_validation() {
    let cfg: WarpConfig = serde_json::from_str(r#"{ "processing_scale": 0 }"#).unwrap();
    assert!(cfg.validate().is_err());
}
