//! Built-in components

#[doc(inline)]
pub use transform::*;
mod transform;

#[doc(inline)]
pub use reference_frame::*;
mod reference_frame;

#[doc(inline)]
pub use renderable::*;
mod renderable;
