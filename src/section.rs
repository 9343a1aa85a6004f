//! Metadata tiles and their 64x64 section batches.
//!
//! A [`MapTile`] is one cell of the fixed 512 m tile grid: an optional zone
//! membership plus a property bag. Tiles are persisted in [`MapSection`]
//! batches, one XML file per section, grouped by zone name.

use std::collections::BTreeMap;
use std::path::Path;

use log::debug;

use crate::coord::CoordXZ;
use crate::error::{MapError, MapResult};
use crate::properties::{read_properties, write_properties, PropertyBag, PropertyValue};
use crate::worldmap::{SECTION_SIZE, TILES_PER_SECTION, TILE_SIZE};
use crate::xml::XmlNode;

// =============================================================================
// METADATA TILE
// =============================================================================

/// One cell of the metadata tile grid.
///
/// The zone reference points forward only (tile -> zone by name); the zone
/// itself keeps a coordinate set, never tile ownership.
pub struct MapTile {
    coord: CoordXZ,
    zone: Option<String>,
    properties: PropertyBag,
    dirty: bool,
}

impl MapTile {
    /// Create a tile at a tile-aligned coordinate. New tiles are dirty.
    pub fn new(coord: CoordXZ) -> Self {
        assert!(coord.is_aligned(TILE_SIZE), "tile coordinate must be tile-aligned");
        Self { coord, zone: None, properties: PropertyBag::new(), dirty: true }
    }

    pub fn coord(&self) -> CoordXZ {
        self.coord
    }

    pub fn zone(&self) -> Option<&str> {
        self.zone.as_deref()
    }

    /// Assign the tile's zone. A tile belongs to at most one zone for its
    /// whole lifetime; reassignment is a programmer error.
    pub fn assign_zone(&mut self, zone: &str) {
        assert!(
            self.zone.is_none(),
            "tile {} already belongs to zone '{}'",
            self.coord,
            self.zone.as_deref().unwrap_or_default()
        );
        self.zone = Some(zone.to_string());
        self.dirty = true;
    }

    pub fn properties(&self) -> &PropertyBag {
        &self.properties
    }

    /// Define or replace a local property and mark the tile dirty.
    pub fn define_property(&mut self, name: &str, value: PropertyValue) {
        self.properties.define(name, value);
        self.dirty = true;
    }

    /// Overwrite an existing local property (same type) and mark dirty.
    pub fn set_property(&mut self, name: &str, value: PropertyValue) {
        self.properties.set(name, value);
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }
}

// =============================================================================
// METADATA SECTION
// =============================================================================

/// A 64x64 batch of metadata tile slots persisted as one file.
///
/// Sections are append-only: a slot is filled at most once. Whether the
/// section needs saving is computed from its members at save time rather
/// than cached when tiles are added.
pub struct MapSection {
    origin: CoordXZ,
    tiles: Vec<Option<MapTile>>,
    dirty: bool,
}

impl MapSection {
    /// Create an empty section at a section-aligned origin.
    pub fn new(origin: CoordXZ) -> Self {
        assert!(origin.is_aligned(SECTION_SIZE), "section origin must be section-aligned");
        let slots = (TILES_PER_SECTION * TILES_PER_SECTION) as usize;
        let mut tiles = Vec::with_capacity(slots);
        tiles.resize_with(slots, || None);
        Self { origin, tiles, dirty: false }
    }

    pub fn origin(&self) -> CoordXZ {
        self.origin
    }

    /// Slot index for a tile coordinate, asserting it lies in this section.
    fn slot(&self, coord: CoordXZ) -> usize {
        let offset = coord - self.origin;
        let tx = offset.x.div_euclid(TILE_SIZE);
        let tz = offset.z.div_euclid(TILE_SIZE);
        assert!(
            (0..TILES_PER_SECTION).contains(&tx) && (0..TILES_PER_SECTION).contains(&tz),
            "tile {} outside section at {}",
            coord,
            self.origin
        );
        (tz * TILES_PER_SECTION + tx) as usize
    }

    /// Register a tile in its slot. Occupied slots are a programmer error;
    /// sections never replace tiles.
    pub fn add_tile(&mut self, tile: MapTile) {
        let slot = self.slot(tile.coord());
        assert!(
            self.tiles[slot].is_none(),
            "section slot for tile {} already occupied",
            tile.coord()
        );
        self.tiles[slot] = Some(tile);
        self.dirty = true;
    }

    pub fn tile(&self, coord: CoordXZ) -> Option<&MapTile> {
        self.tiles[self.slot(coord)].as_ref()
    }

    pub fn tile_mut(&mut self, coord: CoordXZ) -> Option<&mut MapTile> {
        let slot = self.slot(coord);
        self.tiles[slot].as_mut()
    }

    pub fn tiles(&self) -> impl Iterator<Item = &MapTile> {
        self.tiles.iter().flatten()
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.iter().flatten().count()
    }

    /// True if the section or any member tile holds unsaved changes.
    pub fn needs_save(&self) -> bool {
        self.dirty || self.tiles().any(|t| t.is_dirty())
    }

    /// Write the section file if anything changed, clearing dirty flags.
    pub fn save(&mut self, path: &Path) -> MapResult<()> {
        if !self.needs_save() {
            return Ok(());
        }
        self.to_xml().write_file(path)?;
        debug!("saved section {} ({} tiles) to {}", self.origin, self.tile_count(), path.display());
        self.dirty = false;
        for tile in self.tiles.iter_mut().flatten() {
            tile.mark_clean();
        }
        Ok(())
    }

    pub fn to_xml(&self) -> XmlNode {
        let (sx, sz) = self.origin.cell_index(SECTION_SIZE);
        let mut root = XmlNode::new("Section")
            .with_attr("SectionCoordX", sx)
            .with_attr("SectionCoordZ", sz);

        // Group tiles by zone; unzoned tiles go under the empty name.
        let mut by_zone: BTreeMap<&str, Vec<&MapTile>> = BTreeMap::new();
        for tile in self.tiles() {
            by_zone.entry(tile.zone().unwrap_or("")).or_default().push(tile);
        }

        for (zone, tiles) in by_zone {
            let mut zone_node = XmlNode::new("Zone").with_attr("Name", zone);
            for tile in tiles {
                let (tx, tz) = tile.coord().cell_index(TILE_SIZE);
                let mut tile_node = XmlNode::new("Tile").with_attr("X", tx).with_attr("Z", tz);
                write_properties(tile.properties(), &mut tile_node);
                zone_node.push(tile_node);
            }
            root.push(zone_node);
        }
        root
    }

    /// Rebuild a section from its file format. The result is clean.
    pub fn from_xml(root: &XmlNode) -> MapResult<Self> {
        if root.name != "Section" {
            return Err(MapError::Parse(format!("expected <Section>, found <{}>", root.name)));
        }
        let sx: i64 = root.parse_attr("SectionCoordX")?;
        let sz: i64 = root.parse_attr("SectionCoordZ")?;
        let mut section = Self::new(CoordXZ::new(sx * SECTION_SIZE, sz * SECTION_SIZE));

        for zone_node in root.children_named("Zone") {
            let zone_name = zone_node.require_attr("Name")?;
            for tile_node in zone_node.children_named("Tile") {
                let tx: i64 = tile_node.parse_attr("X")?;
                let tz: i64 = tile_node.parse_attr("Z")?;
                let mut tile = MapTile::new(CoordXZ::new(tx * TILE_SIZE, tz * TILE_SIZE));
                if !zone_name.is_empty() {
                    tile.zone = Some(zone_name.to_string());
                }
                tile.properties = read_properties(tile_node)?;
                tile.dirty = false;
                section.add_tile(tile);
            }
        }

        section.dirty = false;
        Ok(section)
    }

    pub fn load(path: &Path) -> MapResult<Self> {
        Self::from_xml(&XmlNode::read_file(path)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn tile_at(tx: i64, tz: i64) -> MapTile {
        MapTile::new(CoordXZ::new(tx * TILE_SIZE, tz * TILE_SIZE))
    }

    #[test]
    fn test_add_and_get_tile() {
        let mut section = MapSection::new(CoordXZ::new(0, 0));
        section.add_tile(tile_at(3, 5));

        let coord = CoordXZ::new(3 * TILE_SIZE, 5 * TILE_SIZE);
        assert!(section.tile(coord).is_some());
        assert!(section.tile(CoordXZ::new(0, 0)).is_none());
        assert_eq!(section.tile_count(), 1);
    }

    #[test]
    #[should_panic(expected = "already occupied")]
    fn test_add_tile_twice_panics() {
        let mut section = MapSection::new(CoordXZ::new(0, 0));
        section.add_tile(tile_at(3, 5));
        section.add_tile(tile_at(3, 5));
    }

    #[test]
    #[should_panic(expected = "already belongs to zone")]
    fn test_zone_reassignment_panics() {
        let mut tile = tile_at(0, 0);
        tile.assign_zone("meadow");
        tile.assign_zone("swamp");
    }

    #[test]
    fn test_needs_save_follows_member_tiles() {
        let mut section = MapSection::new(CoordXZ::new(0, 0));
        section.add_tile(tile_at(1, 1));
        assert!(section.needs_save());

        let dir = tempdir().unwrap();
        let path = dir.path().join("section.mms");
        section.save(&path).unwrap();
        assert!(!section.needs_save());

        // A tile dirtied after the save makes the section dirty again,
        // without any flag caching at add time
        let coord = CoordXZ::new(TILE_SIZE, TILE_SIZE);
        section.tile_mut(coord).unwrap().define_property("Seen", PropertyValue::Bool(true));
        assert!(section.needs_save());
    }

    #[test]
    fn test_save_skips_clean_section() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("untouched.mms");

        let mut section = MapSection::new(CoordXZ::new(0, 0));
        section.save(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_xml_roundtrip_with_zones() {
        let origin = CoordXZ::new(-SECTION_SIZE, 2 * SECTION_SIZE);
        let mut section = MapSection::new(origin);

        let mut zoned = MapTile::new(origin + CoordXZ::new(2 * TILE_SIZE, 0));
        zoned.assign_zone("highlands");
        zoned.define_property("Snowline", PropertyValue::Float(2400.0));
        section.add_tile(zoned);

        let mut plain = MapTile::new(origin + CoordXZ::new(0, 63 * TILE_SIZE));
        plain.define_property("Road", PropertyValue::Bool(true));
        section.add_tile(plain);

        let reread = MapSection::from_xml(&section.to_xml()).unwrap();
        assert_eq!(reread.origin(), origin);
        assert_eq!(reread.tile_count(), 2);
        assert!(!reread.needs_save());

        let zoned_back = reread.tile(origin + CoordXZ::new(2 * TILE_SIZE, 0)).unwrap();
        assert_eq!(zoned_back.zone(), Some("highlands"));
        assert_eq!(
            zoned_back.properties().get("Snowline"),
            Some(&PropertyValue::Float(2400.0))
        );

        let plain_back = reread.tile(origin + CoordXZ::new(0, 63 * TILE_SIZE)).unwrap();
        assert_eq!(plain_back.zone(), None);
    }

    #[test]
    fn test_save_load_file_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("world-(0,0).mms");

        let mut section = MapSection::new(CoordXZ::new(0, 0));
        let mut tile = tile_at(10, 20);
        tile.define_property("Name", PropertyValue::Text("ford".into()));
        section.add_tile(tile);
        section.save(&path).unwrap();

        let loaded = MapSection::load(&path).unwrap();
        let coord = CoordXZ::new(10 * TILE_SIZE, 20 * TILE_SIZE);
        assert_eq!(
            loaded.tile(coord).unwrap().properties().get("Name"),
            Some(&PropertyValue::Text("ford".into()))
        );
    }
}
