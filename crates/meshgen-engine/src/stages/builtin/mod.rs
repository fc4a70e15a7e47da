//! Built-in CPU reference stages.
//!
//! Deterministic geometry and image processing that satisfy the stage
//! contracts so the service runs end to end without external models.
//! Footprints are nominal figures for the memory accounting.

mod background;
mod caption;
mod cleanup;
mod convert;
mod reduce;
mod shape;
mod texture;

pub use background::BorderKeyRemover;
pub use caption::CaptionSketch;
pub use cleanup::TopologyCleaner;
pub use convert::GlbPacker;
pub use reduce::{ClusterDecimator, DEFAULT_MAX_FACES};
pub use shape::SilhouetteLifter;
pub use texture::ProjectionPainter;
pub(crate) use texture::sibling;

pub(crate) const MIB: u64 = 1024 * 1024;
pub(crate) const GIB: u64 = 1024 * MIB;
