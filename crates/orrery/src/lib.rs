//! Orrery, an orbital mechanics visualization workbench
//!
//! This crate holds the core of the workbench: the entity [`ecs`] that stores the simulated
//! scene, and the [`render`] pipeline that turns it into frames. GPU access goes through the
//! [`gpu::Device`] trait; the crate ships an in-memory implementation of it in [`gpu::headless`].

pub mod cli;
pub mod config;
pub mod ecs;
pub mod engine;
pub mod events;
pub mod gc;
pub mod gpu;
pub mod render;
pub mod scene;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
