//! Top-level world map: constants, registries, and the save/load pipeline.
//!
//! The world map owns every section, zone, and raster layer. Property lookup
//! walks the inheritance DAG (tile -> zone -> layers -> world) with a visited
//! set, and writes copy the nearest ancestor's definition into the local bag
//! first, so ancestor state is never mutated.

use std::collections::hash_map::Entry;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::buffer::Argb;
use crate::coord::{CoordXZ, SUBUNITS_PER_METER};
use crate::error::{MapError, MapResult};
use crate::layer::{ColorLayer, LayerGeometry, LayerRegistry, MapLayer, ScalarLayer};
use crate::properties::{read_properties, write_properties, PropertyBag, PropertyValue};
use crate::section::{MapSection, MapTile};
use crate::xml::XmlNode;

// =============================================================================
// WORLD CONSTANTS
// =============================================================================

/// Edge length of one tile in meters.
pub const METERS_PER_TILE: i64 = 512;

/// Tiles along one edge of a section.
pub const TILES_PER_SECTION: i64 = 64;

/// Tile footprint in world sub-units.
pub const TILE_SIZE: i64 = METERS_PER_TILE * SUBUNITS_PER_METER;

/// Section footprint in world sub-units.
pub const SECTION_SIZE: i64 = TILE_SIZE * TILES_PER_SECTION;

/// Sample density of the auto-created heightfield layer (meters per sample).
const DEFAULT_HEIGHTFIELD_DENSITY: i64 = 4;

/// Sample density of the auto-created color layers.
const DEFAULT_COLOR_DENSITY: i64 = 8;

// =============================================================================
// FILE LAYOUT
// =============================================================================

/// Resolves the on-disk layout of one world: the world file, section files,
/// and per-layer raster tile files, all in a single directory.
#[derive(Clone, Debug)]
pub struct WorldFiles {
    dir: PathBuf,
    world_name: String,
}

impl WorldFiles {
    pub fn new<P: AsRef<Path>>(dir: P, world_name: &str) -> Self {
        Self { dir: dir.as_ref().to_path_buf(), world_name: world_name.to_string() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn world_name(&self) -> &str {
        &self.world_name
    }

    /// `{World}.mwm`
    pub fn world_path(&self) -> PathBuf {
        self.dir.join(format!("{}.mwm", self.world_name))
    }

    /// `{World}-({sectionX},{sectionZ}).mms`
    pub fn section_path(&self, section_x: i64, section_z: i64) -> PathBuf {
        self.dir.join(format!("{}-({},{}).mms", self.world_name, section_x, section_z))
    }

    /// `{World}-{Layer}({tileX},{tileZ}).raw`
    pub fn raster_tile_path(&self, layer: &str, tile_x: i64, tile_z: i64) -> PathBuf {
        self.dir.join(format!("{}-{}({},{}).raw", self.world_name, layer, tile_x, tile_z))
    }
}

// =============================================================================
// ZONES
// =============================================================================

/// A named region grouping tiles for shared default properties.
///
/// Zones hold tile coordinates only; the tile keeps the forward reference,
/// so there is no ownership cycle.
pub struct MapZone {
    name: String,
    tiles: HashSet<CoordXZ>,
    properties: PropertyBag,
}

impl MapZone {
    fn new(name: &str) -> Self {
        Self { name: name.to_string(), tiles: HashSet::new(), properties: PropertyBag::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn contains(&self, coord: CoordXZ) -> bool {
        self.tiles.contains(&coord)
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }
}

// =============================================================================
// PROPERTY OWNERS
// =============================================================================

/// Identity of a property owner in the inheritance DAG.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum OwnerKey {
    World,
    Layer(String),
    Zone(String),
    /// Tile-aligned coordinate; the owning section must be in memory.
    Tile(CoordXZ),
}

// =============================================================================
// WORLD MAP
// =============================================================================

/// Observer invoked synchronously, once per created tile.
pub type TileCreatedObserver = Box<dyn FnMut(CoordXZ)>;

pub struct WorldMap {
    files: WorldFiles,
    min_height: f32,
    max_height: f32,
    bounds_min: CoordXZ,
    bounds_max: CoordXZ,
    properties: PropertyBag,
    zones: BTreeMap<String, MapZone>,
    layers: Vec<Box<dyn MapLayer>>,
    sections: HashMap<(i64, i64), MapSection>,
    observers: Vec<TileCreatedObserver>,
    registry: LayerRegistry,
}

impl WorldMap {
    /// Create a fresh world with the default layer set: one heightfield and
    /// two color layers.
    pub fn new<P: AsRef<Path>>(
        dir: P,
        name: &str,
        min_height: f32,
        max_height: f32,
        default_height: f32,
    ) -> Self {
        assert!(max_height > min_height, "empty height range");

        let mut heightfield = ScalarLayer::new(
            "heightfield",
            LayerGeometry::new(METERS_PER_TILE, DEFAULT_HEIGHTFIELD_DENSITY),
            min_height,
            max_height - min_height,
            0,
        );
        heightfield.set_default_value(default_height);

        let color_geom = LayerGeometry::new(METERS_PER_TILE, DEFAULT_COLOR_DENSITY);
        let color0 = ColorLayer::new("color0", color_geom, Argb(0xffff_ffff));
        let color1 = ColorLayer::new("color1", color_geom, Argb(0xff00_0000));

        Self {
            files: WorldFiles::new(dir, name),
            min_height,
            max_height,
            bounds_min: CoordXZ::default(),
            bounds_max: CoordXZ::default(),
            properties: PropertyBag::new(),
            zones: BTreeMap::new(),
            layers: vec![Box::new(heightfield), Box::new(color0), Box::new(color1)],
            sections: HashMap::new(),
            observers: Vec::new(),
            registry: LayerRegistry::builtin(),
        }
    }

    pub fn name(&self) -> &str {
        self.files.world_name()
    }

    pub fn files(&self) -> &WorldFiles {
        &self.files
    }

    pub fn height_range(&self) -> (f32, f32) {
        (self.min_height, self.max_height)
    }

    pub fn bounds(&self) -> (CoordXZ, CoordXZ) {
        (self.bounds_min, self.bounds_max)
    }

    // -------------------------------------------------------------------------
    // LAYERS
    // -------------------------------------------------------------------------

    pub fn layers(&self) -> impl Iterator<Item = &dyn MapLayer> {
        self.layers.iter().map(|l| l.as_ref())
    }

    pub fn layer(&self, name: &str) -> Option<&dyn MapLayer> {
        self.layers.iter().find(|l| l.name() == name).map(|l| l.as_ref())
    }

    pub fn layer_mut(&mut self, name: &str) -> Option<&mut (dyn MapLayer + 'static)> {
        for layer in self.layers.iter_mut() {
            if layer.name() == name {
                return Some(layer.as_mut());
            }
        }
        None
    }

    /// Typed access to a scalar layer.
    pub fn scalar_layer_mut(&mut self, name: &str) -> Option<&mut ScalarLayer> {
        self.layer_mut(name)?.as_any_mut().downcast_mut()
    }

    /// Typed access to a color layer.
    pub fn color_layer_mut(&mut self, name: &str) -> Option<&mut ColorLayer> {
        self.layer_mut(name)?.as_any_mut().downcast_mut()
    }

    pub fn add_layer(&mut self, layer: Box<dyn MapLayer>) {
        assert!(
            self.layer(layer.name()).is_none(),
            "layer '{}' already registered",
            layer.name()
        );
        self.layers.push(layer);
    }

    pub fn layer_registry_mut(&mut self) -> &mut LayerRegistry {
        &mut self.registry
    }

    // -------------------------------------------------------------------------
    // SECTIONS AND TILES
    // -------------------------------------------------------------------------

    fn section_key(coord: CoordXZ) -> (i64, i64) {
        coord.cell_index(SECTION_SIZE)
    }

    /// Page in (or create) the section owning `coord`.
    fn ensure_section(&mut self, coord: CoordXZ) -> MapResult<&mut MapSection> {
        let key = Self::section_key(coord);
        match self.sections.entry(key) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let path = self.files.section_path(key.0, key.1);
                let section = if path.exists() {
                    let section = MapSection::load(&path)?;
                    // Rebuild zone membership from the persisted tiles
                    for tile in section.tiles() {
                        if let Some(zone_name) = tile.zone() {
                            match self.zones.get_mut(zone_name) {
                                Some(zone) => {
                                    zone.tiles.insert(tile.coord());
                                }
                                None => warn!(
                                    "section {} references unknown zone '{}'",
                                    path.display(),
                                    zone_name
                                ),
                            }
                        }
                    }
                    section
                } else {
                    MapSection::new(CoordXZ::new(key.0 * SECTION_SIZE, key.1 * SECTION_SIZE))
                };
                Ok(entry.insert(section))
            }
        }
    }

    /// Allocate a metadata tile, register it in its section, and notify
    /// observers. An occupied slot is a programmer error.
    pub fn create_tile(&mut self, coord: CoordXZ) -> MapResult<CoordXZ> {
        let coord = coord.align_to(TILE_SIZE);
        let section = self.ensure_section(coord)?;
        section.add_tile(MapTile::new(coord));

        self.bounds_min.x = self.bounds_min.x.min(coord.x);
        self.bounds_min.z = self.bounds_min.z.min(coord.z);
        self.bounds_max.x = self.bounds_max.x.max(coord.x + TILE_SIZE);
        self.bounds_max.z = self.bounds_max.z.max(coord.z + TILE_SIZE);

        for observer in self.observers.iter_mut() {
            observer(coord);
        }
        Ok(coord)
    }

    /// The metadata tile at `coord`, paging its section in if needed.
    pub fn tile(&mut self, coord: CoordXZ) -> MapResult<Option<&MapTile>> {
        let coord = coord.align_to(TILE_SIZE);
        let section = self.ensure_section(coord)?;
        Ok(section.tile(coord))
    }

    pub fn tile_exists(&mut self, coord: CoordXZ) -> MapResult<bool> {
        Ok(self.tile(coord)?.is_some())
    }

    /// Register a synchronous tile-creation observer.
    pub fn subscribe_tile_created(&mut self, observer: TileCreatedObserver) {
        self.observers.push(observer);
    }

    // -------------------------------------------------------------------------
    // ZONES
    // -------------------------------------------------------------------------

    pub fn create_zone(&mut self, name: &str) {
        assert!(!self.zones.contains_key(name), "zone '{}' already exists", name);
        self.zones.insert(name.to_string(), MapZone::new(name));
    }

    pub fn zone(&self, name: &str) -> Option<&MapZone> {
        self.zones.get(name)
    }

    pub fn zones(&self) -> impl Iterator<Item = &MapZone> {
        self.zones.values()
    }

    /// Put an existing tile into a zone. The tile keeps the forward
    /// reference; the zone records the coordinate.
    pub fn assign_zone(&mut self, zone_name: &str, coord: CoordXZ) -> MapResult<()> {
        let coord = coord.align_to(TILE_SIZE);
        if !self.zones.contains_key(zone_name) {
            return Err(MapError::UnknownName(zone_name.to_string()));
        }
        let section = self.ensure_section(coord)?;
        let tile = section
            .tile_mut(coord)
            .ok_or_else(|| MapError::UnknownName(format!("tile {}", coord)))?;
        tile.assign_zone(zone_name);
        self.zones.get_mut(zone_name).unwrap().tiles.insert(coord);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // PROPERTY RESOLUTION
    // -------------------------------------------------------------------------

    fn bag_of(&self, key: &OwnerKey) -> MapResult<&PropertyBag> {
        match key {
            OwnerKey::World => Ok(&self.properties),
            OwnerKey::Layer(name) => self
                .layer(name)
                .map(|l| l.properties())
                .ok_or_else(|| MapError::UnknownName(name.clone())),
            OwnerKey::Zone(name) => self
                .zones
                .get(name)
                .map(|z| &z.properties)
                .ok_or_else(|| MapError::UnknownName(name.clone())),
            OwnerKey::Tile(coord) => self
                .sections
                .get(&Self::section_key(*coord))
                .and_then(|s| s.tile(*coord))
                .map(|t| t.properties())
                .ok_or_else(|| MapError::UnknownName(format!("tile {}", coord))),
        }
    }

    /// Ordered parent list for one owner. Layers and the world are roots.
    fn parents_of(&self, key: &OwnerKey) -> MapResult<Vec<OwnerKey>> {
        let shared_roots = || {
            self.layers
                .iter()
                .map(|l| OwnerKey::Layer(l.name().to_string()))
                .chain(std::iter::once(OwnerKey::World))
        };
        Ok(match key {
            OwnerKey::World | OwnerKey::Layer(_) => Vec::new(),
            OwnerKey::Zone(_) => shared_roots().collect(),
            OwnerKey::Tile(coord) => {
                let tile = self
                    .sections
                    .get(&Self::section_key(*coord))
                    .and_then(|s| s.tile(*coord))
                    .ok_or_else(|| MapError::UnknownName(format!("tile {}", coord)))?;
                let mut parents = Vec::new();
                if let Some(zone) = tile.zone() {
                    parents.push(OwnerKey::Zone(zone.to_string()));
                }
                parents.extend(shared_roots());
                parents
            }
        })
    }

    /// Depth-first lookup over the DAG with a visited set, local bag first,
    /// then parents in order. Reconverging paths contribute once.
    fn resolve(&self, start: Vec<OwnerKey>, name: &str) -> MapResult<Option<&PropertyValue>> {
        let mut visited: HashSet<OwnerKey> = HashSet::new();
        let mut stack: Vec<OwnerKey> = start.into_iter().rev().collect();

        while let Some(key) = stack.pop() {
            if !visited.insert(key.clone()) {
                continue;
            }
            if let Some(value) = self.bag_of(&key)?.get(name) {
                return Ok(Some(value));
            }
            for parent in self.parents_of(&key)?.into_iter().rev() {
                stack.push(parent);
            }
        }
        Ok(None)
    }

    fn get_property(&self, owner: OwnerKey, name: &str) -> MapResult<PropertyValue> {
        self.resolve(vec![owner], name)?
            .cloned()
            .ok_or_else(|| MapError::MissingProperty(name.to_string()))
    }

    pub fn world_property(&self, name: &str) -> MapResult<PropertyValue> {
        self.get_property(OwnerKey::World, name)
    }

    pub fn layer_property(&self, layer: &str, name: &str) -> MapResult<PropertyValue> {
        self.get_property(OwnerKey::Layer(layer.to_string()), name)
    }

    pub fn zone_property(&self, zone: &str, name: &str) -> MapResult<PropertyValue> {
        self.get_property(OwnerKey::Zone(zone.to_string()), name)
    }

    /// Tile property through the full ancestor chain; pages the owning
    /// section in first.
    pub fn tile_property(&mut self, coord: CoordXZ, name: &str) -> MapResult<PropertyValue> {
        let coord = coord.align_to(TILE_SIZE);
        self.ensure_section(coord)?;
        self.get_property(OwnerKey::Tile(coord), name)
    }

    /// Value an ancestor would supply for `name`, if the local bag lacks it.
    fn copy_on_write_value(&self, owner: &OwnerKey, name: &str) -> MapResult<Option<PropertyValue>> {
        if self.bag_of(owner)?.contains(name) {
            return Ok(None);
        }
        Ok(self.resolve(self.parents_of(owner)?, name)?.cloned())
    }

    pub fn set_world_property(&mut self, name: &str, value: PropertyValue) {
        if self.properties.contains(name) {
            self.properties.set(name, value);
        } else {
            self.properties.define(name, value);
        }
    }

    pub fn set_layer_property(&mut self, layer: &str, name: &str, value: PropertyValue) -> MapResult<()> {
        let key = OwnerKey::Layer(layer.to_string());
        let inherited = self.copy_on_write_value(&key, name)?;
        let bag = self
            .layer_mut(layer)
            .map(|l| l.properties_mut())
            .ok_or_else(|| MapError::UnknownName(layer.to_string()))?;
        apply_cow(bag, name, inherited, value);
        Ok(())
    }

    pub fn set_zone_property(&mut self, zone: &str, name: &str, value: PropertyValue) -> MapResult<()> {
        let key = OwnerKey::Zone(zone.to_string());
        let inherited = self.copy_on_write_value(&key, name)?;
        let bag = self
            .zones
            .get_mut(zone)
            .map(|z| &mut z.properties)
            .ok_or_else(|| MapError::UnknownName(zone.to_string()))?;
        apply_cow(bag, name, inherited, value);
        Ok(())
    }

    /// Set a tile property with copy-on-write from the nearest ancestor.
    /// The write never touches ancestor bags.
    pub fn set_tile_property(&mut self, coord: CoordXZ, name: &str, value: PropertyValue) -> MapResult<()> {
        let coord = coord.align_to(TILE_SIZE);
        self.ensure_section(coord)?;
        let key = OwnerKey::Tile(coord);
        let inherited = self.copy_on_write_value(&key, name)?;

        let section = self.sections.get_mut(&Self::section_key(coord)).unwrap();
        let tile = section
            .tile_mut(coord)
            .ok_or_else(|| MapError::UnknownName(format!("tile {}", coord)))?;
        match inherited {
            Some(ancestor_value) => {
                tile.define_property(name, ancestor_value);
                tile.set_property(name, value);
            }
            None if tile.properties().contains(name) => tile.set_property(name, value),
            None => tile.define_property(name, value),
        }
        Ok(())
    }

    // -------------------------------------------------------------------------
    // SAVE / LOAD
    // -------------------------------------------------------------------------

    fn to_xml(&self) -> XmlNode {
        let mut root = XmlNode::new("WorldMap")
            .with_attr("MinX", self.bounds_min.x)
            .with_attr("MinZ", self.bounds_min.z)
            .with_attr("MaxX", self.bounds_max.x)
            .with_attr("MaxZ", self.bounds_max.z)
            .with_attr("MinHeight", self.min_height)
            .with_attr("MaxHeight", self.max_height);

        for zone in self.zones.values() {
            let mut node = XmlNode::new("Zone").with_attr("Name", &zone.name);
            write_properties(&zone.properties, &mut node);
            root.push(node);
        }
        for layer in &self.layers {
            root.push(layer.to_xml());
        }
        write_properties(&self.properties, &mut root);
        root
    }

    /// Persist the world in three phases: the world file, every dirty
    /// section, then a flush of every raster layer. Raster tiles that were
    /// never loaded are never touched.
    pub fn save(&mut self) -> MapResult<()> {
        fs::create_dir_all(self.files.dir())?;
        self.to_xml().write_file(&self.files.world_path())?;

        let files = self.files.clone();
        for (key, section) in self.sections.iter_mut() {
            section.save(&files.section_path(key.0, key.1))?;
        }
        for layer in self.layers.iter_mut() {
            layer.flush(&files)?;
        }
        info!("saved world '{}' to {}", files.world_name(), files.dir().display());
        Ok(())
    }

    /// Load a world file, dispatching layer elements through `registry`.
    /// Sections and raster tiles page in lazily afterwards.
    pub fn load<P: AsRef<Path>>(dir: P, name: &str, registry: LayerRegistry) -> MapResult<Self> {
        let files = WorldFiles::new(dir, name);
        let root = XmlNode::read_file(&files.world_path())?;
        if root.name != "WorldMap" {
            return Err(MapError::Parse(format!("expected <WorldMap>, found <{}>", root.name)));
        }

        let mut zones = BTreeMap::new();
        for node in root.children_named("Zone") {
            let mut zone = MapZone::new(node.require_attr("Name")?);
            zone.properties = read_properties(node)?;
            zones.insert(zone.name.clone(), zone);
        }

        let mut layers: Vec<Box<dyn MapLayer>> = Vec::new();
        for node in root.children_named("Layer") {
            layers.push(registry.parse(node)?);
        }

        Ok(Self {
            min_height: root.parse_attr("MinHeight")?,
            max_height: root.parse_attr("MaxHeight")?,
            bounds_min: CoordXZ::new(root.parse_attr("MinX")?, root.parse_attr("MinZ")?),
            bounds_max: CoordXZ::new(root.parse_attr("MaxX")?, root.parse_attr("MaxZ")?),
            properties: read_properties(&root)?,
            zones,
            layers,
            sections: HashMap::new(),
            observers: Vec::new(),
            registry,
            files,
        })
    }
}

/// Copy-on-write write into a local bag: pull the inherited definition in
/// first (so the type is pinned), then overwrite.
fn apply_cow(
    bag: &mut PropertyBag,
    name: &str,
    inherited: Option<PropertyValue>,
    value: PropertyValue,
) {
    match inherited {
        Some(ancestor_value) => {
            bag.define(name, ancestor_value);
            bag.set(name, value);
        }
        None if bag.contains(name) => bag.set(name, value),
        None => bag.define(name, value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Height16, MapBuffer};
    use std::cell::RefCell;
    use std::rc::Rc;
    use tempfile::tempdir;

    fn new_world(dir: &Path) -> WorldMap {
        WorldMap::new(dir, "testworld", 0.0, 100.0, 50.0)
    }

    #[test]
    fn test_fresh_world_has_default_layers() {
        let dir = tempdir().unwrap();
        let world = new_world(dir.path());

        let names: Vec<&str> = world.layers().map(|l| l.name()).collect();
        assert_eq!(names, vec!["heightfield", "color0", "color1"]);
        assert_eq!(world.layer("heightfield").unwrap().geometry().samples_per_tile(), 128);
    }

    #[test]
    fn test_default_height_quantization() {
        let dir = tempdir().unwrap();
        let mut world = new_world(dir.path());

        let heightfield = world.scalar_layer_mut("heightfield").unwrap();
        // 50 out of [0, 100] lands on the midpoint of the raw range
        assert_eq!(heightfield.default_raw(), 32767);
        assert!((heightfield.default_value() - 50.0).abs() < 0.01);

        // A freshly created tile decodes the default fill back to ~50m
        let files = WorldFiles::new(dir.path(), "testworld");
        let src = MapBuffer::new_filled(4, 4, Height16(0));
        heightfield.copy_in(CoordXZ::new(0, 0), &src, &files).unwrap();
        let untouched = CoordXZ::new(100 * 4_000, 0);
        let value = heightfield.value_at(untouched).unwrap();
        assert!((value - 50.0).abs() < 0.01);
    }

    #[test]
    fn test_create_tile_fires_observer_once() {
        let dir = tempdir().unwrap();
        let mut world = new_world(dir.path());

        let seen: Rc<RefCell<Vec<CoordXZ>>> = Rc::new(RefCell::new(Vec::new()));
        let sink = Rc::clone(&seen);
        world.subscribe_tile_created(Box::new(move |coord| sink.borrow_mut().push(coord)));

        let coord = world.create_tile(CoordXZ::new(TILE_SIZE + 100, 0)).unwrap();
        assert_eq!(coord, CoordXZ::new(TILE_SIZE, 0));
        assert_eq!(seen.borrow().as_slice(), &[coord]);

        world.create_tile(CoordXZ::new(5 * TILE_SIZE, 0)).unwrap();
        assert_eq!(seen.borrow().len(), 2);
    }

    #[test]
    #[should_panic(expected = "already occupied")]
    fn test_create_tile_twice_panics() {
        let dir = tempdir().unwrap();
        let mut world = new_world(dir.path());
        world.create_tile(CoordXZ::new(0, 0)).unwrap();
        world.create_tile(CoordXZ::new(100, 100)).unwrap();
    }

    #[test]
    fn test_property_inheritance_nearest_ancestor_wins() {
        let dir = tempdir().unwrap();
        let mut world = new_world(dir.path());

        world.set_world_property("Climate", PropertyValue::Text("temperate".into()));
        world.create_zone("tundra_belt");
        world.create_tile(CoordXZ::new(0, 0)).unwrap();
        world.assign_zone("tundra_belt", CoordXZ::new(0, 0)).unwrap();

        // No local or zone value: falls through to the world
        assert_eq!(
            world.tile_property(CoordXZ::new(0, 0), "Climate").unwrap(),
            PropertyValue::Text("temperate".into())
        );

        // Zone value shadows the world for member tiles
        world
            .set_zone_property("tundra_belt", "Climate", PropertyValue::Text("arctic".into()))
            .unwrap();
        assert_eq!(
            world.tile_property(CoordXZ::new(0, 0), "Climate").unwrap(),
            PropertyValue::Text("arctic".into())
        );
        assert_eq!(
            world.world_property("Climate").unwrap(),
            PropertyValue::Text("temperate".into())
        );
    }

    #[test]
    fn test_copy_on_write_leaves_ancestor_untouched() {
        let dir = tempdir().unwrap();
        let mut world = new_world(dir.path());

        world.set_world_property("Fertility", PropertyValue::Float(0.3));
        world.create_tile(CoordXZ::new(0, 0)).unwrap();

        world
            .set_tile_property(CoordXZ::new(0, 0), "Fertility", PropertyValue::Float(0.9))
            .unwrap();

        assert_eq!(
            world.tile_property(CoordXZ::new(0, 0), "Fertility").unwrap(),
            PropertyValue::Float(0.9)
        );
        assert_eq!(world.world_property("Fertility").unwrap(), PropertyValue::Float(0.3));
    }

    #[test]
    fn test_missing_property_is_error() {
        let dir = tempdir().unwrap();
        let mut world = new_world(dir.path());
        world.create_tile(CoordXZ::new(0, 0)).unwrap();

        let result = world.tile_property(CoordXZ::new(0, 0), "Nonexistent");
        assert!(matches!(result, Err(MapError::MissingProperty(_))));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let mut world = new_world(dir.path());

        world.set_world_property("Author", PropertyValue::Text("cartographer".into()));
        world.create_zone("coast");
        world.set_zone_property("coast", "Tide", PropertyValue::Float(1.5)).unwrap();
        world.create_tile(CoordXZ::new(0, 0)).unwrap();
        world.assign_zone("coast", CoordXZ::new(0, 0)).unwrap();
        world
            .set_tile_property(CoordXZ::new(0, 0), "Harbor", PropertyValue::Bool(true))
            .unwrap();
        world.save().unwrap();

        let mut reloaded =
            WorldMap::load(dir.path(), "testworld", LayerRegistry::builtin()).unwrap();
        assert_eq!(reloaded.height_range(), (0.0, 100.0));
        assert_eq!(
            reloaded.world_property("Author").unwrap(),
            PropertyValue::Text("cartographer".into())
        );
        assert_eq!(
            reloaded.zone_property("coast", "Tide").unwrap(),
            PropertyValue::Float(1.5)
        );
        let names: Vec<&str> = reloaded.layers().map(|l| l.name()).collect();
        assert_eq!(names, vec!["heightfield", "color0", "color1"]);

        // Section pages in lazily; tile and zone membership come back
        assert_eq!(
            reloaded.tile_property(CoordXZ::new(0, 0), "Harbor").unwrap(),
            PropertyValue::Bool(true)
        );
        assert_eq!(
            reloaded.tile_property(CoordXZ::new(0, 0), "Tide").unwrap(),
            PropertyValue::Float(1.5)
        );
        assert!(reloaded.zone("coast").unwrap().contains(CoordXZ::new(0, 0)));
    }

    #[test]
    fn test_load_rejects_unknown_layer_type() {
        let dir = tempdir().unwrap();
        let xml = XmlNode::new("WorldMap")
            .with_attr("MinX", 0)
            .with_attr("MinZ", 0)
            .with_attr("MaxX", 0)
            .with_attr("MaxZ", 0)
            .with_attr("MinHeight", 0.0)
            .with_attr("MaxHeight", 1.0);
        let mut root = xml;
        root.push(XmlNode::new("Layer").with_attr("Type", "Vector").with_attr("Name", "roads"));
        root.write_file(&dir.path().join("broken.mwm")).unwrap();

        let result = WorldMap::load(dir.path(), "broken", LayerRegistry::builtin());
        assert!(matches!(result, Err(MapError::UnknownLayerType(_))));
    }

    #[test]
    fn test_save_only_rewrites_dirty_sections() {
        let dir = tempdir().unwrap();
        let mut world = new_world(dir.path());
        world.create_tile(CoordXZ::new(0, 0)).unwrap();
        world.save().unwrap();

        let section_path = world.files().section_path(0, 0);
        let stamp = fs::metadata(&section_path).unwrap().modified().unwrap();

        // Nothing changed: the section file must not be rewritten
        std::thread::sleep(std::time::Duration::from_millis(20));
        world.save().unwrap();
        assert_eq!(fs::metadata(&section_path).unwrap().modified().unwrap(), stamp);
    }
}
