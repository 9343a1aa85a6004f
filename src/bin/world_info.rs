//! Inspection tool for saved worlds.
//!
//! Prints the world's constants, layers, zones, and section population, and
//! can render a PNG preview of one raster tile.

use clap::Parser;

use mapstore::worldmap::{METERS_PER_TILE, TILES_PER_SECTION, TILE_SIZE};
use mapstore::{CoordXZ, LayerRegistry, MapResult, WorldMap, SUBUNITS_PER_METER};

#[derive(Parser, Debug)]
#[command(name = "world_info")]
#[command(about = "Inspect a saved world map directory")]
struct Args {
    /// Directory holding the world files
    #[arg(short, long, default_value = ".")]
    dir: String,

    /// World name (the `{name}.mwm` file to open)
    world: String,

    /// Render a thumbnail of the named layer's tile at --tile-x/--tile-z
    #[arg(long)]
    thumbnail: Option<String>,

    /// Tile X index for the thumbnail
    #[arg(long, default_value = "0")]
    tile_x: i64,

    /// Tile Z index for the thumbnail
    #[arg(long, default_value = "0")]
    tile_z: i64,

    /// Thumbnail edge length in pixels (power of two)
    #[arg(long, default_value = "64")]
    pixels: usize,

    /// Output path for the thumbnail PNG
    #[arg(long, default_value = "thumbnail.png")]
    out: String,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    if let Err(e) = run(&args) {
        eprintln!("error: {}", e);
        std::process::exit(1);
    }
}

fn run(args: &Args) -> MapResult<()> {
    let mut world = WorldMap::load(&args.dir, &args.world, LayerRegistry::builtin())?;

    let (min_h, max_h) = world.height_range();
    let (bmin, bmax) = world.bounds();
    println!("World '{}'", world.name());
    println!(
        "  grid: {}m tiles, {} tiles per section ({} sub-units per tile)",
        METERS_PER_TILE, TILES_PER_SECTION, TILE_SIZE
    );
    println!("  bounds: {} .. {} (sub-units, {} per meter)", bmin, bmax, SUBUNITS_PER_METER);
    println!("  height range: {}m .. {}m", min_h, max_h);

    println!("  layers:");
    for layer in world.layers() {
        let geom = layer.geometry();
        println!(
            "    {:<12} {:<12} {}m/sample, {} samples/tile",
            layer.name(),
            layer.type_tag(),
            geom.meters_per_sample(),
            geom.samples_per_tile()
        );
    }

    println!("  zones:");
    for zone in world.zones() {
        println!("    {:<12} {} tiles", zone.name(), zone.tile_count());
    }

    println!("  sections on disk: {}", count_section_files(&world)?);

    if let Some(layer_name) = &args.thumbnail {
        let files = world.files().clone();
        let coord = CoordXZ::new(args.tile_x * TILE_SIZE, args.tile_z * TILE_SIZE);
        let layer = world
            .layer_mut(layer_name)
            .ok_or_else(|| mapstore::MapError::UnknownName(layer_name.clone()))?;
        check_thumbnail_size(args.pixels, layer.geometry().samples_per_tile())?;
        let image = layer.create_thumbnail(coord, METERS_PER_TILE, args.pixels, &files)?;
        image
            .save(&args.out)
            .map_err(|e| mapstore::MapError::Parse(format!("PNG encode failed: {}", e)))?;
        println!("wrote {}x{} thumbnail to {}", args.pixels, args.pixels, args.out);
    }

    Ok(())
}

/// Reject thumbnail sizes the raster pipeline cannot produce: the preview
/// is a downsample, so it cannot exceed the tile's own resolution.
fn check_thumbnail_size(pixels: usize, samples_per_tile: usize) -> MapResult<()> {
    if !mapstore::buffer::is_power_of_two(pixels) {
        return Err(mapstore::MapError::Parse(format!(
            "--pixels {} is not a power of two",
            pixels
        )));
    }
    if pixels > samples_per_tile {
        return Err(mapstore::MapError::Parse(format!(
            "--pixels {} exceeds the layer's {} samples per tile",
            pixels, samples_per_tile
        )));
    }
    Ok(())
}

/// Count the `{world}-(x,z).mms` section files next to the world file.
fn count_section_files(world: &WorldMap) -> MapResult<usize> {
    let prefix = format!("{}-(", world.name());
    let mut count = 0;
    for entry in std::fs::read_dir(world.files().dir())? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.starts_with(&prefix) && name.ends_with(".mms") {
            count += 1;
        }
    }
    Ok(count)
}
