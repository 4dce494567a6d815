//! Engine configuration, loaded from a TOML file
//!
//! Every field has a default, so an empty file (or no file at all) is a valid configuration.
//!
//! ```toml
//! [window]
//! width = 1920
//! height = 1080
//!
//! [renderer]
//! prefer_mailbox = false
//! max_anisotropy = 8.0
//!
//! [session]
//! scene = "scenes/earth_moon.toml"
//!
//! [log]
//! filters = "orrery::render=trace"
//! ```

use anyhow::Context;
use orrery_utils::AnyResult;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    pub window: WindowConfig,
    pub renderer: RendererConfig,
    pub session: SessionConfig,
    pub log: LogConfig,
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> AnyResult<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("couldn't read config file `{}`", path.display()))?;
        Self::from_toml(&text)
            .with_context(|| format!("couldn't parse config file `{}`", path.display()))
    }

    pub fn from_toml(text: &str) -> AnyResult<Self> {
        Ok(toml::from_str(text)?)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WindowConfig {
    pub width: u32,
    pub height: u32,
    pub title: String,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            title: String::from("Orrery"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RendererConfig {
    /// Use mailbox presentation when the surface supports it.
    pub prefer_mailbox: bool,
    /// Overrides the device's anisotropy limit for texture samplers.
    pub max_anisotropy: Option<f32>,
    pub clear_color: [f32; 4],
    /// Amount of frames kept in the timing history.
    pub frame_timing_history: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            prefer_mailbox: true,
            max_anisotropy: None,
            clear_color: [0.0, 0.0, 0.0, 1.0],
            frame_timing_history: 600,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SessionConfig {
    /// Scene description loaded at startup.
    pub scene: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LogConfig {
    /// `RUST_LOG` style filters, applied on top of the default level.
    pub filters: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    pub fn empty_config_is_default() {
        assert_eq!(EngineConfig::from_toml("").unwrap(), EngineConfig::default());
    }

    #[test]
    pub fn partial_sections_keep_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [renderer]
            max_anisotropy = 4.0

            [session]
            scene = "solar_system.toml"
            "#,
        )
        .unwrap();

        assert_eq!(config.renderer.max_anisotropy, Some(4.0));
        assert!(config.renderer.prefer_mailbox);
        assert_eq!(config.renderer.frame_timing_history, 600);
        assert_eq!(config.session.scene, Some(PathBuf::from("solar_system.toml")));
        assert_eq!(config.window, WindowConfig::default());
    }

    #[test]
    pub fn unknown_keys_are_rejected() {
        assert!(EngineConfig::from_toml("[renderer]\nvsync = true").is_err());
    }
}
