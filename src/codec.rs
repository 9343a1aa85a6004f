//! Raw pixel-buffer codec boundary.
//!
//! The engine treats tile persistence as a decode/encode boundary: a tile
//! file is exactly `num_samples * num_samples` little-endian samples with no
//! framing. This module also provides [`RawImage`], the shape the import
//! pipeline hands to layers when building tiles from externally decoded
//! imagery.

use std::fs::File;
use std::io::{BufWriter, Read, Write};
use std::path::Path;

use bytemuck::Pod;

use crate::error::{MapError, MapResult};

/// Write a sample array as a raw little-endian payload.
pub fn save_raw_samples<S: Pod>(path: &Path, samples: &[S]) -> MapResult<()> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytemuck::cast_slice(samples))?;
    writer.flush()?;
    Ok(())
}

/// Read a raw payload back into a sample array of known length.
pub fn load_raw_samples<S: Pod + Clone + Default>(
    path: &Path,
    expected: usize,
) -> MapResult<Vec<S>> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::with_capacity(expected * std::mem::size_of::<S>());
    file.read_to_end(&mut bytes)?;

    let sample_size = std::mem::size_of::<S>();
    if bytes.len() != expected * sample_size {
        return Err(MapError::TruncatedTileFile {
            path: path.to_path_buf(),
            expected,
            found: bytes.len() / sample_size,
        });
    }

    let mut samples = vec![S::default(); expected];
    bytemuck::cast_slice_mut(&mut samples).copy_from_slice(&bytes);
    Ok(samples)
}

/// An externally decoded image, exposed to the engine as raw per-pixel
/// integer values.
///
/// `bytes_per_pixel` is 1, 2, or 4; pixels are little-endian and tightly
/// packed in row-major order.
pub struct RawImage {
    width: usize,
    height: usize,
    bytes_per_pixel: usize,
    data: Vec<u8>,
}

impl RawImage {
    pub fn new(width: usize, height: usize, bytes_per_pixel: usize, data: Vec<u8>) -> Self {
        assert!(
            matches!(bytes_per_pixel, 1 | 2 | 4),
            "unsupported pixel width: {}",
            bytes_per_pixel
        );
        assert_eq!(
            data.len(),
            width * height * bytes_per_pixel,
            "pixel data length does not match dimensions"
        );
        Self { width, height, bytes_per_pixel, data }
    }

    /// Load a headerless raw image file of known dimensions.
    pub fn load(path: &Path, width: usize, height: usize, bytes_per_pixel: usize) -> MapResult<Self> {
        let mut file = File::open(path)?;
        let mut data = Vec::with_capacity(width * height * bytes_per_pixel);
        file.read_to_end(&mut data)?;
        if data.len() != width * height * bytes_per_pixel {
            return Err(MapError::Parse(format!(
                "raw image {} is {} bytes, expected {}",
                path.display(),
                data.len(),
                width * height * bytes_per_pixel
            )));
        }
        Ok(Self::new(width, height, bytes_per_pixel, data))
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn bytes_per_pixel(&self) -> usize {
        self.bytes_per_pixel
    }

    /// Raw integer value of one pixel.
    pub fn raw_pixel(&self, x: usize, y: usize) -> u64 {
        assert!(x < self.width && y < self.height, "pixel out of bounds");
        let offset = (y * self.width + x) * self.bytes_per_pixel;
        let bytes = &self.data[offset..offset + self.bytes_per_pixel];
        match self.bytes_per_pixel {
            1 => bytes[0] as u64,
            2 => u16::from_le_bytes([bytes[0], bytes[1]]) as u64,
            _ => u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as u64,
        }
    }

    /// Pixel value normalized to [0, 1] by the pixel width's full range.
    pub fn normalized_pixel(&self, x: usize, y: usize) -> f64 {
        let max = match self.bytes_per_pixel {
            1 => u8::MAX as u64,
            2 => u16::MAX as u64,
            _ => u32::MAX as u64,
        };
        self.raw_pixel(x, y) as f64 / max as f64
    }
}
