//! Square raster buffers holding one tile's worth of samples.
//!
//! A buffer is a `num_samples x num_samples` grid (power of two) of 16- or
//! 32-bit samples. Sample kinds differ only in width and in how a raw value
//! maps to a display color; everything else, including the box-filter
//! scaling math, is shared through [`MapBuffer`].

use std::path::Path;

use bytemuck::{Pod, Zeroable};
use image::RgbaImage;
use log::debug;

use crate::codec;
use crate::error::MapResult;

// =============================================================================
// SAMPLE KINDS
// =============================================================================

/// One raster element: a scalar or packed color of known byte width.
///
/// `to_raw`/`from_raw` round-trip through a widened integer so box-filter
/// accumulation never overflows for 32-bit samples.
pub trait Sample: Copy + PartialEq + Default + Pod + 'static {
    /// Bytes per sample on disk.
    const BYTES: usize;

    fn to_raw(self) -> u64;
    fn from_raw(raw: u64) -> Self;

    /// Map a raw value to an RGBA display color for previews.
    fn display_rgba(self) -> [u8; 4];
}

/// 16-bit scalar sample (heightfield).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Height16(pub u16);

impl Sample for Height16 {
    const BYTES: usize = 2;

    fn to_raw(self) -> u64 {
        self.0 as u64
    }

    fn from_raw(raw: u64) -> Self {
        Height16(raw as u16)
    }

    fn display_rgba(self) -> [u8; 4] {
        let v = (self.0 >> 8) as u8;
        [v, v, v, 0xff]
    }
}

/// 32-bit scalar sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Scalar32(pub u32);

impl Sample for Scalar32 {
    const BYTES: usize = 4;

    fn to_raw(self) -> u64 {
        self.0 as u64
    }

    fn from_raw(raw: u64) -> Self {
        Scalar32(raw as u32)
    }

    fn display_rgba(self) -> [u8; 4] {
        let v = (self.0 >> 24) as u8;
        [v, v, v, 0xff]
    }
}

/// Packed ARGB color sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
#[repr(transparent)]
pub struct Argb(pub u32);

impl Argb {
    pub fn from_channels(a: u8, r: u8, g: u8, b: u8) -> Self {
        Argb(((a as u32) << 24) | ((r as u32) << 16) | ((g as u32) << 8) | b as u32)
    }

    pub fn alpha(self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn red(self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn green(self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn blue(self) -> u8 {
        self.0 as u8
    }
}

impl Sample for Argb {
    const BYTES: usize = 4;

    fn to_raw(self) -> u64 {
        self.0 as u64
    }

    fn from_raw(raw: u64) -> Self {
        Argb(raw as u32)
    }

    fn display_rgba(self) -> [u8; 4] {
        [self.red(), self.green(), self.blue(), self.alpha()]
    }
}

/// True for nonzero powers of two.
pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && n & (n - 1) == 0
}

// =============================================================================
// MAP BUFFER
// =============================================================================

/// A square grid of samples for one raster tile.
///
/// `dirty` is true exactly when the in-memory content differs from the last
/// persisted state; every mutator sets it, and [`MapBuffer::save`] clears it.
pub struct MapBuffer<S: Sample> {
    num_samples: usize,
    meters_per_sample: i64,
    dirty: bool,
    samples: Vec<S>,
}

impl<S: Sample> MapBuffer<S> {
    /// Create a buffer filled with the sample default.
    ///
    /// A freshly created buffer is dirty: it has never been persisted.
    pub fn new(num_samples: usize, meters_per_sample: i64) -> Self {
        Self::new_filled(num_samples, meters_per_sample, S::default())
    }

    /// Create a buffer filled with `value`.
    pub fn new_filled(num_samples: usize, meters_per_sample: i64, value: S) -> Self {
        assert!(is_power_of_two(num_samples), "num_samples must be a power of two");
        assert!(meters_per_sample > 0, "meters_per_sample must be positive");
        Self {
            num_samples,
            meters_per_sample,
            dirty: true,
            samples: vec![value; num_samples * num_samples],
        }
    }

    /// Load a buffer from its tile file. The result is clean.
    pub fn load(path: &Path, num_samples: usize, meters_per_sample: i64) -> MapResult<Self> {
        assert!(is_power_of_two(num_samples), "num_samples must be a power of two");
        let samples = codec::load_raw_samples(path, num_samples * num_samples)?;
        debug!("loaded {}x{} tile from {}", num_samples, num_samples, path.display());
        Ok(Self { num_samples, meters_per_sample, dirty: false, samples })
    }

    pub fn num_samples(&self) -> usize {
        self.num_samples
    }

    pub fn meters_per_sample(&self) -> i64 {
        self.meters_per_sample
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// Mark the buffer as matching persisted state without writing it.
    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    fn index(&self, x: usize, z: usize) -> usize {
        assert!(x < self.num_samples && z < self.num_samples, "sample out of bounds");
        z * self.num_samples + x
    }

    pub fn get(&self, x: usize, z: usize) -> S {
        self.samples[self.index(x, z)]
    }

    pub fn set(&mut self, x: usize, z: usize, value: S) {
        let idx = self.index(x, z);
        self.samples[idx] = value;
        self.dirty = true;
    }

    /// Fill the whole buffer with one value.
    pub fn fill(&mut self, value: S) {
        self.samples.fill(value);
        self.dirty = true;
    }

    /// Fill a `size x size` region starting at (x, z).
    pub fn fill_rect(&mut self, value: S, x: usize, z: usize, size: usize) {
        assert!(
            x + size <= self.num_samples && z + size <= self.num_samples,
            "fill region out of bounds"
        );
        for row in z..z + size {
            let start = row * self.num_samples + x;
            self.samples[start..start + size].fill(value);
        }
        self.dirty = true;
    }

    /// Blit `src` into this buffer with its origin at (dest_x, dest_z).
    ///
    /// Both buffers must have the same sample density and `src` must fit
    /// entirely inside `self`.
    pub fn copy_from(&mut self, dest_x: usize, dest_z: usize, src: &MapBuffer<S>) {
        assert_eq!(
            self.meters_per_sample, src.meters_per_sample,
            "sample density mismatch in copy"
        );
        assert!(
            dest_x + src.num_samples <= self.num_samples
                && dest_z + src.num_samples <= self.num_samples,
            "source does not fit inside destination"
        );
        for src_z in 0..src.num_samples {
            let src_start = src_z * src.num_samples;
            let dest_start = (dest_z + src_z) * self.num_samples + dest_x;
            self.samples[dest_start..dest_start + src.num_samples]
                .copy_from_slice(&src.samples[src_start..src_start + src.num_samples]);
        }
        self.dirty = true;
    }

    /// Resample to a different resolution over the same footprint.
    ///
    /// Upsampling replicates each sample into a block; downsampling averages
    /// each block with a box filter. The two compose losslessly:
    /// scaling up by k then back down by k reproduces the original exactly.
    pub fn scale(&self, dest_num_samples: usize) -> MapBuffer<S> {
        assert!(is_power_of_two(dest_num_samples), "num_samples must be a power of two");
        assert_ne!(dest_num_samples, self.num_samples, "scale requires a resolution change");

        if dest_num_samples > self.num_samples {
            let factor = dest_num_samples / self.num_samples;
            let mps = self.meters_per_sample / factor as i64;
            assert!(mps > 0, "upsample factor exceeds sample density");
            let mut out = MapBuffer::new(dest_num_samples, mps);
            for z in 0..dest_num_samples {
                for x in 0..dest_num_samples {
                    let idx = z * dest_num_samples + x;
                    out.samples[idx] = self.get(x / factor, z / factor);
                }
            }
            out
        } else {
            let factor = self.num_samples / dest_num_samples;
            let mut out =
                MapBuffer::new(dest_num_samples, self.meters_per_sample * factor as i64);
            for z in 0..dest_num_samples {
                for x in 0..dest_num_samples {
                    let idx = z * dest_num_samples + x;
                    out.samples[idx] = self.average_block(x * factor, z * factor, factor);
                }
            }
            out
        }
    }

    /// Box-filter average of a `size x size` block, accumulated in 64 bits.
    fn average_block(&self, x: usize, z: usize, size: usize) -> S {
        let mut sum: u64 = 0;
        for bz in z..z + size {
            for bx in x..x + size {
                sum += self.get(bx, bz).to_raw();
            }
        }
        S::from_raw(sum / (size * size) as u64)
    }

    /// Downsample a square subregion into a `dest_size`-pixel preview image.
    ///
    /// Both `size` and `dest_size` must be powers of two, with `size` at
    /// least `dest_size` and the region fully inside the buffer.
    pub fn thumbnail(&self, src_x: usize, src_z: usize, size: usize, dest_size: usize) -> RgbaImage {
        assert!(is_power_of_two(size) && is_power_of_two(dest_size), "sizes must be powers of two");
        assert!(size >= dest_size, "thumbnail cannot upsample");
        assert!(
            src_x + size <= self.num_samples && src_z + size <= self.num_samples,
            "thumbnail region out of bounds"
        );

        let block = size / dest_size;
        let mut img = RgbaImage::new(dest_size as u32, dest_size as u32);
        for z in 0..dest_size {
            for x in 0..dest_size {
                let avg = self.average_block(src_x + x * block, src_z + z * block, block);
                img.put_pixel(x as u32, z as u32, image::Rgba(avg.display_rgba()));
            }
        }
        img
    }

    /// Persist the raw sample array if dirty; clean buffers are a no-op.
    pub fn save(&mut self, path: &Path) -> MapResult<()> {
        if !self.dirty {
            return Ok(());
        }
        codec::save_raw_samples(path, &self.samples)?;
        debug!("saved {}x{} tile to {}", self.num_samples, self.num_samples, path.display());
        self.dirty = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_fill_then_get() {
        let mut buf = MapBuffer::new(8, 4);
        buf.fill(Height16(1234));
        for z in 0..8 {
            for x in 0..8 {
                assert_eq!(buf.get(x, z), Height16(1234));
            }
        }
    }

    #[test]
    fn test_mutators_set_dirty() {
        let mut buf = MapBuffer::<Height16>::new(8, 4);
        buf.mark_clean();
        buf.set(3, 3, Height16(7));
        assert!(buf.is_dirty());

        buf.mark_clean();
        buf.fill_rect(Height16(9), 0, 0, 4);
        assert!(buf.is_dirty());

        buf.mark_clean();
        let src = MapBuffer::new_filled(4, 4, Height16(2));
        buf.copy_from(4, 4, &src);
        assert!(buf.is_dirty());
    }

    #[test]
    fn test_copy_blits_at_offset() {
        let mut dest = MapBuffer::new_filled(8, 4, Height16(0));
        let src = MapBuffer::new_filled(2, 4, Height16(500));
        dest.copy_from(4, 2, &src);

        assert_eq!(dest.get(4, 2), Height16(500));
        assert_eq!(dest.get(5, 3), Height16(500));
        assert_eq!(dest.get(3, 2), Height16(0));
        assert_eq!(dest.get(4, 4), Height16(0));
    }

    #[test]
    #[should_panic(expected = "source does not fit")]
    fn test_copy_out_of_bounds_panics() {
        let mut dest = MapBuffer::new(8, 4);
        let src = MapBuffer::new_filled(4, 4, Height16(1));
        dest.copy_from(6, 0, &src);
    }

    #[test]
    #[should_panic(expected = "sample density mismatch")]
    fn test_copy_density_mismatch_panics() {
        let mut dest = MapBuffer::<Height16>::new(8, 4);
        let src = MapBuffer::<Height16>::new(4, 8);
        dest.copy_from(0, 0, &src);
    }

    #[test]
    fn test_scale_up_replicates() {
        let mut buf = MapBuffer::new(2, 8);
        buf.set(0, 0, Scalar32(10));
        buf.set(1, 0, Scalar32(20));
        buf.set(0, 1, Scalar32(30));
        buf.set(1, 1, Scalar32(40));

        let up = buf.scale(4);
        assert_eq!(up.meters_per_sample(), 4);
        assert_eq!(up.get(0, 0), Scalar32(10));
        assert_eq!(up.get(1, 1), Scalar32(10));
        assert_eq!(up.get(2, 0), Scalar32(20));
        assert_eq!(up.get(3, 3), Scalar32(40));
    }

    #[test]
    fn test_scale_down_box_filters() {
        let mut buf = MapBuffer::new(4, 2);
        buf.fill(Height16(100));
        buf.fill_rect(Height16(200), 0, 0, 2);

        let down = buf.scale(2);
        assert_eq!(down.meters_per_sample(), 4);
        assert_eq!(down.get(0, 0), Height16(200));
        assert_eq!(down.get(1, 1), Height16(100));
    }

    #[test]
    fn test_scale_up_then_down_is_lossless() {
        let mut buf = MapBuffer::new(4, 8);
        for z in 0..4 {
            for x in 0..4 {
                buf.set(x, z, Scalar32((z * 4 + x) as u32 * 1_000_003));
            }
        }

        let roundtrip = buf.scale(16).scale(4);
        for z in 0..4 {
            for x in 0..4 {
                assert_eq!(roundtrip.get(x, z), buf.get(x, z));
            }
        }
    }

    #[test]
    fn test_wide_accumulator_averages_32bit_samples() {
        // 2x2 block of near-max values would overflow a 32-bit accumulator
        let buf = MapBuffer::new_filled(2, 2, Scalar32(u32::MAX - 1));
        let down = buf.scale(1);
        assert_eq!(down.get(0, 0), Scalar32(u32::MAX - 1));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tile.raw");

        let mut buf = MapBuffer::new(8, 4);
        for z in 0..8 {
            for x in 0..8 {
                buf.set(x, z, Height16((z * 8 + x) as u16 * 7));
            }
        }
        buf.save(&path).unwrap();
        assert!(!buf.is_dirty());

        let loaded = MapBuffer::<Height16>::load(&path, 8, 4).unwrap();
        assert!(!loaded.is_dirty());
        for z in 0..8 {
            for x in 0..8 {
                assert_eq!(loaded.get(x, z), buf.get(x, z));
            }
        }
    }

    #[test]
    fn test_save_skips_clean_buffer() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("never_written.raw");

        let mut buf = MapBuffer::<Argb>::new(4, 8);
        buf.mark_clean();
        buf.save(&path).unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn test_thumbnail_dimensions_and_color() {
        let buf = MapBuffer::new_filled(16, 2, Argb::from_channels(0xff, 0x10, 0x20, 0x30));
        let img = buf.thumbnail(0, 0, 16, 4);
        assert_eq!(img.dimensions(), (4, 4));
        assert_eq!(img.get_pixel(0, 0).0, [0x10, 0x20, 0x30, 0xff]);
    }

    #[test]
    #[should_panic(expected = "powers of two")]
    fn test_thumbnail_rejects_non_power_of_two() {
        let buf = MapBuffer::<Height16>::new(16, 2);
        buf.thumbnail(0, 0, 12, 4);
    }
}
