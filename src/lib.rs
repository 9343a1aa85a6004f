//! Tiled raster/metadata storage engine for a continuous world map.
//!
//! Pages square raster buffers (heightfield and color layers) and metadata
//! tiles on and off disk, tracks modification state, performs box-filter
//! scaling, and resolves per-entity properties through an ancestor-chain
//! inheritance graph. Single-threaded and synchronous; callers serialize
//! access.

pub mod buffer;
pub mod codec;
pub mod coord;
pub mod error;
pub mod layer;
pub mod properties;
pub mod section;
pub mod worldmap;
pub mod xml;

pub use buffer::{Argb, Height16, MapBuffer, Sample, Scalar32};
pub use coord::{CoordXZ, SUBUNITS_PER_METER};
pub use error::{MapError, MapResult};
pub use layer::{ColorLayer, LayerGeometry, LayerRegistry, MapLayer, ScalarLayer};
pub use properties::{PropertyBag, PropertyValue};
pub use section::{MapSection, MapTile};
pub use worldmap::{
    MapZone, WorldFiles, WorldMap, METERS_PER_TILE, SECTION_SIZE, TILES_PER_SECTION, TILE_SIZE,
};
