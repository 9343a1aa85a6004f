//! Raster layers: named planes of paged tiles at one sample density.
//!
//! A layer maps tile coordinates to in-memory [`MapBuffer`]s for the tiles
//! currently paged in; absence from the map says nothing about existence,
//! which is checked against disk separately. Unloading is the only eviction
//! path and always flushes dirty content first.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use image::RgbaImage;
use log::{debug, info};

use crate::buffer::{is_power_of_two, Argb, Height16, MapBuffer, Sample};
use crate::codec::RawImage;
use crate::coord::{CoordXZ, SUBUNITS_PER_METER};
use crate::error::{MapError, MapResult};
use crate::properties::{read_properties, write_properties, PropertyBag};
use crate::worldmap::WorldFiles;
use crate::xml::XmlNode;

// =============================================================================
// GEOMETRY
// =============================================================================

/// Fixed geometry of one layer: tile footprint and sample density.
#[derive(Clone, Copy, Debug)]
pub struct LayerGeometry {
    meters_per_tile: i64,
    meters_per_sample: i64,
}

impl LayerGeometry {
    pub fn new(meters_per_tile: i64, meters_per_sample: i64) -> Self {
        assert!(meters_per_tile > 0 && meters_per_sample > 0, "geometry must be positive");
        assert_eq!(
            meters_per_tile % meters_per_sample,
            0,
            "sample size must divide tile size"
        );
        let geom = Self { meters_per_tile, meters_per_sample };
        assert!(
            is_power_of_two(geom.samples_per_tile()),
            "samples per tile must be a power of two"
        );
        geom
    }

    pub fn meters_per_tile(&self) -> i64 {
        self.meters_per_tile
    }

    pub fn meters_per_sample(&self) -> i64 {
        self.meters_per_sample
    }

    pub fn samples_per_tile(&self) -> usize {
        (self.meters_per_tile / self.meters_per_sample) as usize
    }

    /// Tile footprint in world sub-units.
    pub fn tile_size(&self) -> i64 {
        self.meters_per_tile * SUBUNITS_PER_METER
    }

    /// Sample footprint in world sub-units.
    pub fn sample_size(&self) -> i64 {
        self.meters_per_sample * SUBUNITS_PER_METER
    }
}

// =============================================================================
// TILE PAGING
// =============================================================================

/// Paging core shared by the concrete layer kinds.
struct TileStore<S: Sample> {
    layer_name: String,
    geom: LayerGeometry,
    /// Paged-in tiles keyed by tile index
    tiles: HashMap<(i64, i64), MapBuffer<S>>,
}

impl<S: Sample> TileStore<S> {
    fn new(layer_name: &str, geom: LayerGeometry) -> Self {
        Self { layer_name: layer_name.to_string(), geom, tiles: HashMap::new() }
    }

    fn tile_key(&self, coord: CoordXZ) -> (i64, i64) {
        coord.cell_index(self.geom.tile_size())
    }

    fn loaded(&self, coord: CoordXZ) -> bool {
        self.tiles.contains_key(&self.tile_key(coord))
    }

    fn exists(&self, coord: CoordXZ, files: &WorldFiles) -> bool {
        let key = self.tile_key(coord);
        self.tiles.contains_key(&key)
            || files.raster_tile_path(&self.layer_name, key.0, key.1).exists()
    }

    /// Page a tile in from disk. Already-loaded tiles are a no-op.
    fn load(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()> {
        let key = self.tile_key(coord);
        if self.tiles.contains_key(&key) {
            return Ok(());
        }
        let path = files.raster_tile_path(&self.layer_name, key.0, key.1);
        if !path.exists() {
            return Err(MapError::MissingTileFile(path));
        }
        let buffer =
            MapBuffer::load(&path, self.geom.samples_per_tile(), self.geom.meters_per_sample)?;
        self.tiles.insert(key, buffer);
        Ok(())
    }

    /// Evict a tile, flushing first if it holds unsaved changes.
    fn unload(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()> {
        let key = self.tile_key(coord);
        if let Some(mut buffer) = self.tiles.remove(&key) {
            let path = files.raster_tile_path(&self.layer_name, key.0, key.1);
            buffer.save(&path)?;
            debug!("layer '{}': unloaded tile ({},{})", self.layer_name, key.0, key.1);
        }
        Ok(())
    }

    /// Persist every loaded dirty tile without evicting anything.
    fn flush(&mut self, files: &WorldFiles) -> MapResult<()> {
        let mut written = 0;
        for (key, buffer) in self.tiles.iter_mut() {
            if buffer.is_dirty() {
                let path = files.raster_tile_path(&self.layer_name, key.0, key.1);
                buffer.save(&path)?;
                written += 1;
            }
        }
        if written > 0 {
            info!("layer '{}': flushed {} dirty tiles", self.layer_name, written);
        }
        Ok(())
    }

    /// Page in (or create, default-filled) the destination tile and blit
    /// `src` at the sample offset corresponding to `dest`.
    fn copy_in(
        &mut self,
        dest: CoordXZ,
        src: &MapBuffer<S>,
        default_fill: S,
        files: &WorldFiles,
    ) -> MapResult<()> {
        let key = self.tile_key(dest);
        let (off_x, off_z) = dest.offset_within(self.geom.tile_size());
        let sample_x = (off_x / self.geom.sample_size()) as usize;
        let sample_z = (off_z / self.geom.sample_size()) as usize;
        assert!(
            sample_x + src.num_samples() <= self.geom.samples_per_tile()
                && sample_z + src.num_samples() <= self.geom.samples_per_tile(),
            "copy_in source spans multiple tiles"
        );

        let buffer = match self.tiles.entry(key) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let path = files.raster_tile_path(&self.layer_name, key.0, key.1);
                let buffer = if path.exists() {
                    MapBuffer::load(
                        &path,
                        self.geom.samples_per_tile(),
                        self.geom.meters_per_sample,
                    )?
                } else {
                    MapBuffer::new_filled(
                        self.geom.samples_per_tile(),
                        self.geom.meters_per_sample,
                        default_fill,
                    )
                };
                entry.insert(buffer)
            }
        };
        buffer.copy_from(sample_x, sample_z, src);
        Ok(())
    }

    /// Render a preview of the square region starting at `coord`.
    fn thumbnail(
        &mut self,
        coord: CoordXZ,
        world_size_meters: i64,
        pixel_size: usize,
        files: &WorldFiles,
    ) -> MapResult<RgbaImage> {
        assert!(
            coord.is_aligned(self.geom.sample_size()),
            "thumbnail origin must land on a sample boundary"
        );
        let size_samples = (world_size_meters / self.geom.meters_per_sample) as usize;
        assert!(
            is_power_of_two(size_samples) && is_power_of_two(pixel_size),
            "thumbnail sizes must be powers of two"
        );

        self.load(coord, files)?;
        let key = self.tile_key(coord);
        let (off_x, off_z) = coord.offset_within(self.geom.tile_size());
        let sample_x = (off_x / self.geom.sample_size()) as usize;
        let sample_z = (off_z / self.geom.sample_size()) as usize;
        let buffer = &self.tiles[&key];
        Ok(buffer.thumbnail(sample_x, sample_z, size_samples, pixel_size))
    }

    fn sample_at(&self, coord: CoordXZ) -> Option<S> {
        let key = self.tile_key(coord);
        let buffer = self.tiles.get(&key)?;
        let (off_x, off_z) = coord.offset_within(self.geom.tile_size());
        let sample_x = (off_x / self.geom.sample_size()) as usize;
        let sample_z = (off_z / self.geom.sample_size()) as usize;
        Some(buffer.get(sample_x, sample_z))
    }
}

// =============================================================================
// LAYER TRAIT
// =============================================================================

/// Common surface of every raster layer kind.
pub trait MapLayer {
    fn name(&self) -> &str;

    /// Concrete-type access for kind-specific operations like `copy_in`.
    fn as_any(&self) -> &dyn std::any::Any;
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;

    /// Tag dispatched through the [`LayerRegistry`] when loading a world.
    fn type_tag(&self) -> &'static str;

    fn geometry(&self) -> LayerGeometry;

    fn properties(&self) -> &PropertyBag;
    fn properties_mut(&mut self) -> &mut PropertyBag;

    /// In-memory presence only.
    fn tile_loaded(&self, coord: CoordXZ) -> bool;

    /// In-memory or on-disk presence.
    fn tile_exists(&self, coord: CoordXZ, files: &WorldFiles) -> bool;

    fn load_tile(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()>;
    fn unload_tile(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()>;
    fn flush(&mut self, files: &WorldFiles) -> MapResult<()>;

    fn create_thumbnail(
        &mut self,
        coord: CoordXZ,
        world_size_meters: i64,
        pixel_size: usize,
        files: &WorldFiles,
    ) -> MapResult<RgbaImage>;

    /// The layer's `<Layer>` element for the world file.
    fn to_xml(&self) -> XmlNode;
}

// =============================================================================
// SCALAR LAYER
// =============================================================================

/// 16-bit scalar layer with an affine raw-to-value mapping.
///
/// Raw sample `r` decodes to `value_base + (r / 65535) * value_range`. The
/// default value is cached and eagerly recomputed by every setter that can
/// affect it.
pub struct ScalarLayer {
    store: TileStore<Height16>,
    properties: PropertyBag,
    default_raw: u16,
    value_base: f32,
    value_range: f32,
    default_value: f32,
}

impl ScalarLayer {
    pub const TYPE_TAG: &'static str = "Heightfield";

    pub fn new(
        name: &str,
        geom: LayerGeometry,
        value_base: f32,
        value_range: f32,
        default_raw: u16,
    ) -> Self {
        assert!(value_range > 0.0, "value range must be positive");
        let mut layer = Self {
            store: TileStore::new(name, geom),
            properties: PropertyBag::new(),
            default_raw,
            value_base,
            value_range,
            default_value: 0.0,
        };
        layer.recompute_default();
        layer
    }

    fn recompute_default(&mut self) {
        self.default_value = self.raw_to_value(self.default_raw);
    }

    pub fn default_raw(&self) -> u16 {
        self.default_raw
    }

    pub fn default_value(&self) -> f32 {
        self.default_value
    }

    pub fn value_base(&self) -> f32 {
        self.value_base
    }

    pub fn value_range(&self) -> f32 {
        self.value_range
    }

    pub fn set_default_raw(&mut self, raw: u16) {
        self.default_raw = raw;
        self.recompute_default();
    }

    pub fn set_value_base(&mut self, base: f32) {
        self.value_base = base;
        self.recompute_default();
    }

    pub fn set_value_range(&mut self, range: f32) {
        assert!(range > 0.0, "value range must be positive");
        self.value_range = range;
        self.recompute_default();
    }

    /// Set the default by value; quantizes to raw, then re-derives the cache
    /// so the cached value matches what a fresh tile will decode to.
    pub fn set_default_value(&mut self, value: f32) {
        self.default_raw = self.value_to_raw(value);
        self.recompute_default();
    }

    pub fn raw_to_value(&self, raw: u16) -> f32 {
        self.value_base + (raw as f32 / u16::MAX as f32) * self.value_range
    }

    pub fn value_to_raw(&self, value: f32) -> u16 {
        let t = ((value - self.value_base) / self.value_range).clamp(0.0, 1.0);
        (t * u16::MAX as f32) as u16
    }

    /// Blit a compatible buffer into the layer, paging or creating the
    /// destination tile as needed.
    pub fn copy_in(
        &mut self,
        dest: CoordXZ,
        src: &MapBuffer<Height16>,
        files: &WorldFiles,
    ) -> MapResult<()> {
        let fill = Height16(self.default_raw);
        self.store.copy_in(dest, src, fill, files)
    }

    /// Build a layer-compatible buffer from a region of an external image.
    ///
    /// The image's declared value range `[image_min, image_max]` is rescaled
    /// into this layer's own range, clamped to [0, 1] before quantizing.
    pub fn buffer_from_image(
        &self,
        image: &RawImage,
        src_x: usize,
        src_y: usize,
        size: usize,
        image_min: f32,
        image_max: f32,
    ) -> MapBuffer<Height16> {
        assert!(is_power_of_two(size), "region size must be a power of two");
        assert!(
            src_x + size <= image.width() && src_y + size <= image.height(),
            "image region out of bounds"
        );
        assert!(image_max > image_min, "image value range is empty");

        let mut buffer = MapBuffer::new(size, self.store.geom.meters_per_sample);
        for z in 0..size {
            for x in 0..size {
                let normalized = image.normalized_pixel(src_x + x, src_y + z) as f32;
                let value = image_min + normalized * (image_max - image_min);
                buffer.set(x, z, Height16(self.value_to_raw(value)));
            }
        }
        buffer
    }

    /// Decoded value at a coordinate, for currently loaded tiles only.
    pub fn value_at(&self, coord: CoordXZ) -> Option<f32> {
        self.store.sample_at(coord).map(|s| self.raw_to_value(s.0))
    }

    pub fn from_xml(node: &XmlNode) -> MapResult<Box<dyn MapLayer>> {
        let geom =
            LayerGeometry::new(node.parse_attr("MetersPerTile")?, node.parse_attr("MetersPerSample")?);
        let mut layer = ScalarLayer::new(
            node.require_attr("Name")?,
            geom,
            node.parse_attr("ValueBase")?,
            node.parse_attr("ValueRange")?,
            node.parse_attr("DefaultRaw")?,
        );
        layer.properties = read_properties(node)?;
        Ok(Box::new(layer))
    }
}

impl MapLayer for ScalarLayer {
    fn name(&self) -> &str {
        &self.store.layer_name
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn geometry(&self) -> LayerGeometry {
        self.store.geom
    }

    fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    fn properties_mut(&mut self) -> &mut PropertyBag {
        &mut self.properties
    }

    fn tile_loaded(&self, coord: CoordXZ) -> bool {
        self.store.loaded(coord)
    }

    fn tile_exists(&self, coord: CoordXZ, files: &WorldFiles) -> bool {
        self.store.exists(coord, files)
    }

    fn load_tile(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()> {
        self.store.load(coord, files)
    }

    fn unload_tile(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()> {
        self.store.unload(coord, files)
    }

    fn flush(&mut self, files: &WorldFiles) -> MapResult<()> {
        self.store.flush(files)
    }

    fn create_thumbnail(
        &mut self,
        coord: CoordXZ,
        world_size_meters: i64,
        pixel_size: usize,
        files: &WorldFiles,
    ) -> MapResult<RgbaImage> {
        self.store.thumbnail(coord, world_size_meters, pixel_size, files)
    }

    fn to_xml(&self) -> XmlNode {
        let mut node = XmlNode::new("Layer")
            .with_attr("Type", Self::TYPE_TAG)
            .with_attr("Name", self.name())
            .with_attr("MetersPerTile", self.store.geom.meters_per_tile)
            .with_attr("MetersPerSample", self.store.geom.meters_per_sample)
            .with_attr("ValueBase", self.value_base)
            .with_attr("ValueRange", self.value_range)
            .with_attr("DefaultRaw", self.default_raw);
        write_properties(&self.properties, &mut node);
        node
    }
}

// =============================================================================
// COLOR LAYER
// =============================================================================

/// Packed-ARGB color layer with a configurable default fill.
pub struct ColorLayer {
    store: TileStore<Argb>,
    properties: PropertyBag,
    default_color: Argb,
}

impl ColorLayer {
    pub const TYPE_TAG: &'static str = "Color";

    pub fn new(name: &str, geom: LayerGeometry, default_color: Argb) -> Self {
        Self {
            store: TileStore::new(name, geom),
            properties: PropertyBag::new(),
            default_color,
        }
    }

    pub fn default_color(&self) -> Argb {
        self.default_color
    }

    pub fn set_default_color(&mut self, color: Argb) {
        self.default_color = color;
    }

    pub fn copy_in(&mut self, dest: CoordXZ, src: &MapBuffer<Argb>, files: &WorldFiles) -> MapResult<()> {
        self.store.copy_in(dest, src, self.default_color, files)
    }

    /// Create the tile containing `coord` if nothing is loaded or on disk,
    /// filling it with the default color.
    pub fn create_tile(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()> {
        if self.store.exists(coord, files) {
            return self.store.load(coord, files);
        }
        let key = self.store.tile_key(coord);
        let buffer = MapBuffer::new_filled(
            self.store.geom.samples_per_tile(),
            self.store.geom.meters_per_sample,
            self.default_color,
        );
        self.store.tiles.insert(key, buffer);
        Ok(())
    }

    pub fn color_at(&self, coord: CoordXZ) -> Option<Argb> {
        self.store.sample_at(coord)
    }

    pub fn from_xml(node: &XmlNode) -> MapResult<Box<dyn MapLayer>> {
        let geom =
            LayerGeometry::new(node.parse_attr("MetersPerTile")?, node.parse_attr("MetersPerSample")?);
        let default_text: String = node.parse_attr("DefaultColor")?;
        let default_color = u32::from_str_radix(default_text.trim_start_matches("0x"), 16)
            .map_err(|_| {
                crate::error::MapError::Parse(format!("bad DefaultColor '{}'", default_text))
            })?;
        let mut layer =
            ColorLayer::new(node.require_attr("Name")?, geom, Argb(default_color));
        layer.properties = read_properties(node)?;
        Ok(Box::new(layer))
    }
}

impl MapLayer for ColorLayer {
    fn name(&self) -> &str {
        &self.store.layer_name
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }

    fn type_tag(&self) -> &'static str {
        Self::TYPE_TAG
    }

    fn geometry(&self) -> LayerGeometry {
        self.store.geom
    }

    fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    fn properties_mut(&mut self) -> &mut PropertyBag {
        &mut self.properties
    }

    fn tile_loaded(&self, coord: CoordXZ) -> bool {
        self.store.loaded(coord)
    }

    fn tile_exists(&self, coord: CoordXZ, files: &WorldFiles) -> bool {
        self.store.exists(coord, files)
    }

    fn load_tile(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()> {
        self.store.load(coord, files)
    }

    fn unload_tile(&mut self, coord: CoordXZ, files: &WorldFiles) -> MapResult<()> {
        self.store.unload(coord, files)
    }

    fn flush(&mut self, files: &WorldFiles) -> MapResult<()> {
        self.store.flush(files)
    }

    fn create_thumbnail(
        &mut self,
        coord: CoordXZ,
        world_size_meters: i64,
        pixel_size: usize,
        files: &WorldFiles,
    ) -> MapResult<RgbaImage> {
        self.store.thumbnail(coord, world_size_meters, pixel_size, files)
    }

    fn to_xml(&self) -> XmlNode {
        let mut node = XmlNode::new("Layer")
            .with_attr("Type", Self::TYPE_TAG)
            .with_attr("Name", self.name())
            .with_attr("MetersPerTile", self.store.geom.meters_per_tile)
            .with_attr("MetersPerSample", self.store.geom.meters_per_sample)
            .with_attr("DefaultColor", format!("0x{:08x}", self.default_color.0));
        write_properties(&self.properties, &mut node);
        node
    }
}

// =============================================================================
// LAYER TYPE REGISTRY
// =============================================================================

/// Parser for one `<Layer Type="...">` element.
pub type LayerParser = fn(&XmlNode) -> MapResult<Box<dyn MapLayer>>;

/// Explicit mapping from layer type tags to parsers.
///
/// Constructed per world map rather than process-wide, so registration order
/// is deterministic and tests can register their own kinds.
pub struct LayerRegistry {
    parsers: HashMap<String, LayerParser>,
}

impl LayerRegistry {
    /// Registry with no entries.
    pub fn empty() -> Self {
        Self { parsers: HashMap::new() }
    }

    /// Registry with the built-in scalar and color kinds.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(ScalarLayer::TYPE_TAG, ScalarLayer::from_xml);
        registry.register(ColorLayer::TYPE_TAG, ColorLayer::from_xml);
        registry
    }

    pub fn register(&mut self, tag: &str, parser: LayerParser) {
        self.parsers.insert(tag.to_string(), parser);
    }

    pub fn parse(&self, node: &XmlNode) -> MapResult<Box<dyn MapLayer>> {
        let tag = node.require_attr("Type")?;
        let parser = self
            .parsers
            .get(tag)
            .ok_or_else(|| MapError::UnknownLayerType(tag.to_string()))?;
        parser(node)
    }
}

impl Default for LayerRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn files(dir: &std::path::Path) -> WorldFiles {
        WorldFiles::new(dir, "test_world")
    }

    fn scalar_layer() -> ScalarLayer {
        // 512m tiles, 4m samples -> 128 samples per tile
        ScalarLayer::new("heightfield", LayerGeometry::new(512, 4), 0.0, 100.0, 0)
    }

    #[test]
    fn test_geometry_derivations() {
        let geom = LayerGeometry::new(512, 4);
        assert_eq!(geom.samples_per_tile(), 128);
        assert_eq!(geom.tile_size(), 512_000);
        assert_eq!(geom.sample_size(), 4_000);
    }

    #[test]
    fn test_copy_in_then_read_back() {
        let dir = tempdir().unwrap();
        let files = files(dir.path());
        let mut layer = scalar_layer();

        let mut src = MapBuffer::new(4, 4);
        src.fill(Height16(4242));

        // Tile-aligned destination inside tile (0,0), sample offset (8,8)
        let dest = CoordXZ::new(32_000, 32_000);
        layer.copy_in(dest, &src, &files).unwrap();

        assert!(layer.tile_loaded(dest));
        assert_eq!(layer.store.sample_at(dest), Some(Height16(4242)));
        let past_region = CoordXZ::new(32_000 + 4 * 4_000, 32_000);
        assert_eq!(layer.store.sample_at(past_region), Some(Height16(0)));
    }

    #[test]
    #[should_panic(expected = "spans multiple tiles")]
    fn test_copy_in_cross_tile_panics() {
        let dir = tempdir().unwrap();
        let files = files(dir.path());
        let mut layer = scalar_layer();

        let src = MapBuffer::new_filled(4, 4, Height16(1));
        // Two samples before the tile edge; a 4-sample source cannot fit
        layer.copy_in(CoordXZ::new(512_000 - 2 * 4_000, 0), &src, &files).unwrap();
    }

    #[test]
    fn test_unload_flushes_and_evicts() {
        let dir = tempdir().unwrap();
        let files = files(dir.path());
        let mut layer = scalar_layer();

        let coord = CoordXZ::new(0, 0);
        let src = MapBuffer::new_filled(4, 4, Height16(77));
        layer.copy_in(coord, &src, &files).unwrap();
        assert!(layer.tile_loaded(coord));
        assert!(!files.raster_tile_path("heightfield", 0, 0).exists());

        layer.unload_tile(coord, &files).unwrap();
        assert!(!layer.tile_loaded(coord));
        assert!(layer.tile_exists(coord, &files));

        // Page back in and verify the flushed content survived
        layer.load_tile(coord, &files).unwrap();
        assert_eq!(layer.store.sample_at(coord), Some(Height16(77)));
    }

    #[test]
    fn test_load_missing_tile_is_error() {
        let dir = tempdir().unwrap();
        let files = files(dir.path());
        let mut layer = scalar_layer();

        let result = layer.load_tile(CoordXZ::new(0, 0), &files);
        assert!(matches!(result, Err(MapError::MissingTileFile(_))));
    }

    #[test]
    fn test_flush_keeps_tiles_loaded() {
        let dir = tempdir().unwrap();
        let files = files(dir.path());
        let mut layer = scalar_layer();

        let src = MapBuffer::new_filled(4, 4, Height16(5));
        layer.copy_in(CoordXZ::new(0, 0), &src, &files).unwrap();
        layer.flush(&files).unwrap();

        assert!(layer.tile_loaded(CoordXZ::new(0, 0)));
        assert!(files.raster_tile_path("heightfield", 0, 0).exists());
    }

    #[test]
    fn test_default_value_recomputed_by_setters() {
        let mut layer = scalar_layer();
        layer.set_default_raw(32767);
        assert!((layer.default_value() - 50.0).abs() < 0.01);

        layer.set_value_range(200.0);
        assert!((layer.default_value() - 100.0).abs() < 0.01);

        layer.set_value_base(-50.0);
        assert!((layer.default_value() - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_buffer_from_image_rescales_and_clamps() {
        let layer = ScalarLayer::new("heightfield", LayerGeometry::new(512, 4), 0.0, 100.0, 0);

        // 2x2 8-bit image: 0, 128, 255, 255
        let image = RawImage::new(2, 2, 1, vec![0, 128, 255, 255]);
        // Image declares values from -100 to 300; layer range is 0..100
        let buffer = layer.buffer_from_image(&image, 0, 0, 2, -100.0, 300.0);

        // -100 clamps to the bottom of the layer range
        assert_eq!(buffer.get(0, 0), Height16(0));
        // 128/255 of [-100,300] is ~100.8, clamping to the top
        assert_eq!(buffer.get(1, 0), Height16(u16::MAX));
        assert_eq!(buffer.get(0, 1), Height16(u16::MAX));
    }

    #[test]
    fn test_color_layer_default_fill() {
        let dir = tempdir().unwrap();
        let files = files(dir.path());
        let default = Argb::from_channels(0xff, 0x40, 0x80, 0xc0);
        let mut layer = ColorLayer::new("color0", LayerGeometry::new(512, 8), default);

        let coord = CoordXZ::new(100_000, 250_000);
        layer.create_tile(coord, &files).unwrap();

        assert_eq!(layer.color_at(coord), Some(default));
        assert_eq!(layer.color_at(CoordXZ::new(0, 0)), Some(default));
    }

    #[test]
    fn test_thumbnail_requires_sample_alignment() {
        let dir = tempdir().unwrap();
        let files = files(dir.path());
        let mut layer = scalar_layer();

        let src = MapBuffer::new_filled(128, 4, Height16(9));
        layer.copy_in(CoordXZ::new(0, 0), &src, &files).unwrap();

        let img = layer.create_thumbnail(CoordXZ::new(0, 0), 128, 16, &files).unwrap();
        assert_eq!(img.dimensions(), (16, 16));

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            layer.create_thumbnail(CoordXZ::new(1, 0), 128, 16, &files)
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_registry_dispatch_and_unknown_tag() {
        let registry = LayerRegistry::builtin();
        let layer = scalar_layer();
        let parsed = registry.parse(&layer.to_xml()).unwrap();
        assert_eq!(parsed.name(), "heightfield");
        assert_eq!(parsed.geometry().samples_per_tile(), 128);

        let bogus = XmlNode::new("Layer").with_attr("Type", "Vector");
        assert!(matches!(registry.parse(&bogus), Err(MapError::UnknownLayerType(_))));
    }

    #[test]
    fn test_negative_coordinates_map_to_negative_tiles() {
        let dir = tempdir().unwrap();
        let files = files(dir.path());
        let mut layer = scalar_layer();

        let src = MapBuffer::new_filled(4, 4, Height16(11));
        // Just left of the origin: tile (-1, -1), near its far corner
        let dest = CoordXZ::new(-4 * 4_000, -4 * 4_000);
        layer.copy_in(dest, &src, &files).unwrap();

        assert!(layer.tile_loaded(dest));
        assert!(!layer.tile_loaded(CoordXZ::new(0, 0)));
        assert_eq!(layer.store.sample_at(dest), Some(Height16(11)));
        layer.unload_tile(dest, &files).unwrap();
        assert!(files.raster_tile_path("heightfield", -1, -1).exists());
    }
}
