//! Scene descriptions
//!
//! A scene description lists the bodies of a simulation and where the camera starts. Positions
//! and scales are in meters.
//!
//! ```toml
//! [camera]
//! position = [0.0, 0.0, 2.5e7]
//!
//! [[bodies]]
//! name = "Earth"
//! scale = 6.371e6
//! texture = "textures/earth.png"
//!
//! [[bodies]]
//! name = "Moon"
//! parent = "Earth"
//! position = [3.844e8, 0.0, 0.0]
//! scale = 1.737e6
//! visual_scale = 0.1
//! ```
//!
//! Relative `texture` paths are resolved against the description's directory.

use glam::{DQuat, DVec3};
use itertools::Itertools;
use serde::Deserialize;
use std::{
    fs, io,
    path::{Path, PathBuf},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SceneError {
    #[error("couldn't read scene description `{}`: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
    #[error("couldn't parse scene description `{}`: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("body name `{0}` is used more than once")]
    DuplicateBody(String),
    #[error("body `{body}` has an unknown parent `{parent}`")]
    UnknownParent { body: String, parent: String },
    #[error("body `{0}` has a non-positive scale")]
    InvalidScale(String),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SceneDescription {
    pub camera: CameraDescription,
    pub bodies: Vec<BodyDescription>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraDescription {
    pub position: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BodyDescription {
    pub name: String,
    #[serde(default)]
    pub position: [f64; 3],
    /// Quaternion, `[x, y, z, w]`.
    #[serde(default = "identity_rotation")]
    pub rotation: [f64; 4],
    #[serde(default = "one")]
    pub scale: f64,
    /// Magnification applied when rendering, and to the offsets of child bodies.
    #[serde(default = "one")]
    pub visual_scale: f64,
    /// Name of the parent body. Bodies without one are placed in render space.
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub texture: Option<PathBuf>,
}

fn identity_rotation() -> [f64; 4] {
    [0.0, 0.0, 0.0, 1.0]
}

fn one() -> f64 {
    1.0
}

impl BodyDescription {
    pub fn position(&self) -> DVec3 {
        DVec3::from_array(self.position)
    }

    pub fn rotation(&self) -> DQuat {
        DQuat::from_array(self.rotation).normalize()
    }
}

impl SceneDescription {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SceneError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| SceneError::Io {
            path: path.to_owned(),
            source,
        })?;
        let mut scene: Self = toml::from_str(&text).map_err(|source| SceneError::Parse {
            path: path.to_owned(),
            source,
        })?;

        if let Some(root) = path.parent() {
            for texture in scene.bodies.iter_mut().filter_map(|b| b.texture.as_mut()) {
                if texture.is_relative() {
                    *texture = root.join(&*texture);
                }
            }
        }

        scene.validate()?;
        Ok(scene)
    }

    /// Checks that body names are unique, parents exist and scales are positive.
    pub fn validate(&self) -> Result<(), SceneError> {
        if let Some(name) = self.bodies.iter().map(|body| &body.name).duplicates().next() {
            return Err(SceneError::DuplicateBody(name.clone()));
        }

        for body in &self.bodies {
            if body.scale <= 0.0 || body.visual_scale <= 0.0 {
                return Err(SceneError::InvalidScale(body.name.clone()));
            }
            if let Some(parent) = &body.parent {
                if self.body_index(parent).is_none() {
                    return Err(SceneError::UnknownParent {
                        body: body.name.clone(),
                        parent: parent.clone(),
                    });
                }
            }
        }

        Ok(())
    }

    pub fn body_index(&self, name: &str) -> Option<usize> {
        self.bodies.iter().position(|body| body.name == name)
    }

    pub fn camera_position(&self) -> DVec3 {
        DVec3::from_array(self.camera.position)
    }

    /// Distinct texture paths, in order of first use.
    pub fn textures(&self) -> Vec<&Path> {
        self.bodies
            .iter()
            .filter_map(|body| body.texture.as_deref())
            .unique()
            .collect()
    }
}
