//! Integer world coordinates.
//!
//! All positions in the storage engine are expressed as (x, z) pairs of
//! world sub-units (1 meter = 1000 sub-units). The same type is used at four
//! nested scales: sub-units, sample units, tile units, and section units.

use std::fmt;
use std::ops::{Add, Sub};

/// Sub-units per meter (millimeter resolution).
pub const SUBUNITS_PER_METER: i64 = 1000;

/// An (x, z) position or offset on the world grid.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct CoordXZ {
    pub x: i64,
    pub z: i64,
}

impl CoordXZ {
    pub fn new(x: i64, z: i64) -> Self {
        Self { x, z }
    }

    /// Quantize an arbitrary position to the origin of the enclosing cell.
    ///
    /// Negative inputs floor toward negative infinity, so cells tile the
    /// plane uniformly across the origin.
    pub fn grid_aligned(x: i64, z: i64, cell_size: i64) -> Self {
        debug_assert!(cell_size > 0, "cell size must be positive");
        Self {
            x: x.div_euclid(cell_size) * cell_size,
            z: z.div_euclid(cell_size) * cell_size,
        }
    }

    /// Align this coordinate to the origin of the enclosing cell.
    pub fn align_to(self, cell_size: i64) -> Self {
        Self::grid_aligned(self.x, self.z, cell_size)
    }

    /// Index of the enclosing cell (floored division by the cell size).
    pub fn cell_index(self, cell_size: i64) -> (i64, i64) {
        debug_assert!(cell_size > 0, "cell size must be positive");
        (self.x.div_euclid(cell_size), self.z.div_euclid(cell_size))
    }

    /// Offset from the enclosing cell's origin, always non-negative.
    pub fn offset_within(self, cell_size: i64) -> (i64, i64) {
        debug_assert!(cell_size > 0, "cell size must be positive");
        (self.x.rem_euclid(cell_size), self.z.rem_euclid(cell_size))
    }

    /// True if both components land exactly on a multiple of `step`.
    pub fn is_aligned(self, step: i64) -> bool {
        self.x.rem_euclid(step) == 0 && self.z.rem_euclid(step) == 0
    }
}

impl Add for CoordXZ {
    type Output = CoordXZ;

    fn add(self, rhs: CoordXZ) -> CoordXZ {
        CoordXZ::new(self.x + rhs.x, self.z + rhs.z)
    }
}

impl Sub for CoordXZ {
    type Output = CoordXZ;

    fn sub(self, rhs: CoordXZ) -> CoordXZ {
        CoordXZ::new(self.x - rhs.x, self.z - rhs.z)
    }
}

impl fmt::Display for CoordXZ {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.x, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_aligned_positive() {
        let c = CoordXZ::grid_aligned(1500, 2999, 1000);
        assert_eq!(c, CoordXZ::new(1000, 2000));
    }

    #[test]
    fn test_grid_aligned_negative_floors() {
        // -1 is inside the cell whose origin is -1000, not 0
        let c = CoordXZ::grid_aligned(-1, -1000, 1000);
        assert_eq!(c, CoordXZ::new(-1000, -1000));
    }

    #[test]
    fn test_cell_index_and_offset() {
        let c = CoordXZ::new(-300, 2500);
        assert_eq!(c.cell_index(1000), (-1, 2));
        assert_eq!(c.offset_within(1000), (700, 500));
    }

    #[test]
    fn test_subtraction_gives_offset() {
        let a = CoordXZ::new(5000, 3000);
        let b = CoordXZ::new(2000, 4000);
        assert_eq!(a - b, CoordXZ::new(3000, -1000));
        assert_eq!(b + (a - b), a);
    }

    #[test]
    fn test_alignment_check() {
        assert!(CoordXZ::new(2000, -4000).is_aligned(1000));
        assert!(!CoordXZ::new(2001, 0).is_aligned(1000));
    }
}
