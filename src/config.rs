// SPDX-License-Identifier: GPL-3.0-only

//! Capture settings and the recognized configuration options

use crate::constants;
use crate::errors::{CaptureError, CaptureResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, warn};

/// Output resolutions the engine offers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Resolution {
    /// 640x480
    Vga,
    /// 1280x720
    Hd,
    /// 1920x1080
    #[default]
    FullHd,
}

impl Resolution {
    pub const ALL: [Resolution; 3] = [Resolution::Vga, Resolution::Hd, Resolution::FullHd];

    /// Width and height in pixels
    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Resolution::Vga => (640, 480),
            Resolution::Hd => (1280, 720),
            Resolution::FullHd => (1920, 1080),
        }
    }

    pub fn width(&self) -> u32 {
        self.dimensions().0
    }

    pub fn height(&self) -> u32 {
        self.dimensions().1
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (w, h) = self.dimensions();
        write!(f, "{}x{}", w, h)
    }
}

impl FromStr for Resolution {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase();
        Resolution::ALL
            .into_iter()
            .find(|r| r.to_string() == normalized)
            .ok_or_else(|| {
                CaptureError::InvalidSetting(format!(
                    "unsupported resolution '{}' (expected 640x480, 1280x720 or 1920x1080)",
                    s
                ))
            })
    }
}

impl TryFrom<String> for Resolution {
    type Error = CaptureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Resolution> for String {
    fn from(value: Resolution) -> Self {
        value.to_string()
    }
}

/// Audio capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioSettings {
    /// Capture audio alongside video
    pub enabled: bool,
    /// Capture device name (ALSA naming, e.g. "default" or "hw:1,0")
    pub device: String,
    pub sample_rate: u32,
    pub channels: u16,
    /// Frames per block handed to the audio sink
    pub frames_per_block: u32,
    /// Linear gain multiplier applied to every sample
    pub gain: f32,
}

impl Default for AudioSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            device: constants::DEFAULT_AUDIO_DEVICE.to_string(),
            sample_rate: constants::audio::SAMPLE_RATE,
            channels: constants::audio::CHANNELS,
            frames_per_block: constants::audio::FRAMES_PER_BLOCK,
            gain: constants::audio::DEFAULT_GAIN,
        }
    }
}

/// Complete engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureSettings {
    /// Video device node (e.g. /dev/video11)
    pub device_path: String,
    pub resolution: Resolution,
    /// Capture buffers requested from the driver
    pub buffer_count: u32,
    pub audio: AudioSettings,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self {
            device_path: constants::DEFAULT_DEVICE_PATH.to_string(),
            resolution: Resolution::default(),
            buffer_count: constants::buffers::DEFAULT_COUNT,
            audio: AudioSettings::default(),
        }
    }
}

impl CaptureSettings {
    /// Settings for a device and resolution with everything else defaulted
    pub fn new(device_path: impl Into<String>, resolution: Resolution) -> Self {
        Self {
            device_path: device_path.into(),
            resolution,
            ..Self::default()
        }
    }

    /// Reject settings that cannot describe a working session
    pub fn validate(&self) -> CaptureResult<()> {
        if self.device_path.trim().is_empty() {
            return Err(CaptureError::InvalidSetting("device path is empty".into()));
        }
        if self.audio.enabled {
            if self.audio.sample_rate == 0 {
                return Err(CaptureError::InvalidSetting("audio sample rate is zero".into()));
            }
            if self.audio.channels == 0 {
                return Err(CaptureError::InvalidSetting("audio channel count is zero".into()));
            }
            if self.audio.frames_per_block == 0 {
                return Err(CaptureError::InvalidSetting("audio block size is zero".into()));
            }
            if !self.audio.gain.is_finite() || self.audio.gain < 0.0 {
                return Err(CaptureError::InvalidSetting(format!(
                    "audio gain {} is not a non-negative number",
                    self.audio.gain
                )));
            }
        }
        Ok(())
    }

    /// Buffer count clamped to what the pool supports
    pub fn effective_buffer_count(&self) -> u32 {
        self.buffer_count.clamp(1, constants::buffers::MAX_COUNT)
    }

    /// Whether switching to `other` requires tearing the video device down
    pub fn video_differs(&self, other: &CaptureSettings) -> bool {
        self.device_path != other.device_path
            || self.resolution != other.resolution
            || self.effective_buffer_count() != other.effective_buffer_count()
    }

    /// Default settings file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mplane-camera").join("settings.json"))
    }

    /// Load settings from a JSON file
    pub fn load(path: &Path) -> CaptureResult<Self> {
        let text = std::fs::read_to_string(path)?;
        let settings: CaptureSettings = serde_json::from_str(&text)?;
        debug!(path = %path.display(), "Loaded capture settings");
        Ok(settings)
    }

    /// Load settings, falling back to defaults when the file is missing or broken
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        match Self::load(path) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable settings file");
                Self::default()
            }
        }
    }

    /// Write settings as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> CaptureResult<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let text = serde_json::to_string_pretty(self)?;
        std::fs::write(path, text)?;
        Ok(())
    }
}

/// Kind of value a property accepts
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", content = "options", rename_all = "snake_case")]
pub enum PropertyKind {
    /// Free-form text
    Text,
    /// One of a fixed list of values
    List(Vec<String>),
}

/// A recognized configuration option, as shown by the host's settings UI
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Property {
    pub name: &'static str,
    pub description: &'static str,
    pub kind: PropertyKind,
    pub default: String,
}

/// Enumerate the options the engine recognizes, with their defaults
pub fn properties() -> Vec<Property> {
    let defaults = CaptureSettings::default();
    vec![
        Property {
            name: "device_path",
            description: "Video device",
            kind: PropertyKind::Text,
            default: defaults.device_path,
        },
        Property {
            name: "resolution",
            description: "Resolution",
            kind: PropertyKind::List(Resolution::ALL.iter().map(|r| r.to_string()).collect()),
            default: defaults.resolution.to_string(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolution_parse() {
        assert_eq!("1280x720".parse::<Resolution>().unwrap(), Resolution::Hd);
        assert_eq!(" 640X480 ".parse::<Resolution>().unwrap(), Resolution::Vga);
        assert!("800x600".parse::<Resolution>().is_err());
    }

    #[test]
    fn test_resolution_serializes_as_string() {
        let json = serde_json::to_string(&Resolution::FullHd).unwrap();
        assert_eq!(json, "\"1920x1080\"");
        let back: Resolution = serde_json::from_str("\"640x480\"").unwrap();
        assert_eq!(back, Resolution::Vga);
        assert!(serde_json::from_str::<Resolution>("\"1x1\"").is_err());
    }

    #[test]
    fn test_partial_settings_fill_defaults() {
        let settings: CaptureSettings =
            serde_json::from_str(r#"{"device_path": "/dev/video3", "audio": {"gain": 2.0}}"#)
                .unwrap();
        assert_eq!(settings.device_path, "/dev/video3");
        assert_eq!(settings.resolution, Resolution::FullHd);
        assert_eq!(settings.audio.gain, 2.0);
        assert_eq!(settings.audio.sample_rate, 48_000);
    }

    #[test]
    fn test_validate_rejects_empty_path() {
        let settings = CaptureSettings::new("  ", Resolution::Vga);
        assert!(matches!(settings.validate(), Err(CaptureError::InvalidSetting(_))));
    }

    #[test]
    fn test_video_differs() {
        let a = CaptureSettings::new("/dev/video11", Resolution::Hd);
        let mut b = a.clone();
        b.audio.gain = 3.0;
        assert!(!a.video_differs(&b));
        b.resolution = Resolution::Vga;
        assert!(a.video_differs(&b));
    }

    #[test]
    fn test_buffer_count_clamped() {
        let mut settings = CaptureSettings::default();
        settings.buffer_count = 32;
        assert_eq!(settings.effective_buffer_count(), 8);
        settings.buffer_count = 0;
        assert_eq!(settings.effective_buffer_count(), 1);
    }

    #[test]
    fn test_properties_list_resolutions() {
        let props = properties();
        let resolution = props.iter().find(|p| p.name == "resolution").unwrap();
        assert_eq!(
            resolution.kind,
            PropertyKind::List(vec![
                "640x480".to_string(),
                "1280x720".to_string(),
                "1920x1080".to_string()
            ])
        );
        assert_eq!(resolution.default, "1920x1080");
    }
}
