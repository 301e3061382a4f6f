// SPDX-License-Identifier: GPL-3.0-only

//! Integration tests for configuration module

use mplane_camera::config::{self, PropertyKind};
use mplane_camera::{CaptureError, CaptureSettings, Resolution};
use std::path::PathBuf;

fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("mplane-camera-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    dir
}

#[test]
fn test_config_default() {
    let settings = CaptureSettings::default();
    assert_eq!(settings.device_path, "/dev/video11");
    assert_eq!(settings.resolution, Resolution::FullHd);
    assert_eq!(settings.buffer_count, 4);
    assert!(settings.audio.enabled);
    assert!(settings.validate().is_ok());
}

#[test]
fn test_save_and_load() {
    let dir = scratch_dir("roundtrip");
    let path = dir.join("nested").join("settings.json");

    let mut settings = CaptureSettings::new("/dev/video2", Resolution::Hd);
    settings.audio.gain = 1.5;
    settings.audio.device = "hw:1,0".into();
    settings.save(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(text.contains("\"1280x720\""));
    assert_eq!(CaptureSettings::load(&path).unwrap(), settings);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_broken_file_falls_back_to_defaults() {
    let dir = scratch_dir("broken");
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("settings.json");
    std::fs::write(&path, "{ not json").unwrap();

    assert!(matches!(CaptureSettings::load(&path), Err(CaptureError::Config(_))));
    assert_eq!(CaptureSettings::load_or_default(&path), CaptureSettings::default());

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn test_missing_file_falls_back_to_defaults() {
    let path = scratch_dir("missing").join("settings.json");
    assert_eq!(CaptureSettings::load_or_default(&path), CaptureSettings::default());
}

#[test]
fn test_properties_list_resolutions() {
    let properties = config::properties();
    let names: Vec<_> = properties.iter().map(|p| p.name).collect();
    assert_eq!(names, ["device_path", "resolution"]);

    let resolution = &properties[1];
    assert_eq!(resolution.default, "1920x1080");
    assert_eq!(
        resolution.kind,
        PropertyKind::List(vec!["640x480".into(), "1280x720".into(), "1920x1080".into()])
    );
}
