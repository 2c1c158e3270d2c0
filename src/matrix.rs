//! Row-major bit matrices and their replicated sharings.
//!
//! A [`BitMatrix`] with `rows` instances and `cols` bits per instance is how callers hand inputs
//! to, and receive outputs from, the evaluator. Bit `c` of row `r` lives in byte `c / 8` of the
//! row at bit position `c % 8` (lsb first); bits beyond `cols` in the last byte are kept zero.
use std::ops::BitXorAssign;

use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors when assembling matrices from caller data.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// A row has a different number of bits than the matrix has columns.
    #[error("row {row} has {actual} bits, expected {expected}")]
    RowLength {
        /// Index of the offending row.
        row: usize,
        /// Number of columns.
        expected: usize,
        /// Number of bits in the row.
        actual: usize,
    },
    /// The two planes of a sharing differ in shape.
    #[error("share planes differ in shape: {own:?} vs {prev:?}")]
    PlaneShape {
        /// Rows and columns of plane 0.
        own: (usize, usize),
        /// Rows and columns of plane 1.
        prev: (usize, usize),
    },
}

/// A dense, row-major bit matrix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitMatrix {
    rows: usize,
    cols: usize,
    data: Vec<u8>,
}

impl BitMatrix {
    /// An all-zero matrix.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            rows,
            cols,
            data: vec![0; rows * cols.div_ceil(8)],
        }
    }

    /// A matrix with uniformly random bits.
    pub fn random(rows: usize, cols: usize, rng: &mut impl RngCore) -> Self {
        let mut m = Self::new(rows, cols);
        rng.fill_bytes(&mut m.data);
        m.clear_padding();
        m
    }

    /// Builds a matrix from rows of bits. All rows must have length `cols`.
    pub fn from_bits(rows: &[Vec<bool>], cols: usize) -> Result<Self, Error> {
        let mut m = Self::new(rows.len(), cols);
        for (r, bits) in rows.iter().enumerate() {
            if bits.len() != cols {
                return Err(Error::RowLength {
                    row: r,
                    expected: cols,
                    actual: bits.len(),
                });
            }
            for (c, bit) in bits.iter().enumerate() {
                m.set(r, c, *bit);
            }
        }
        Ok(m)
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Number of bit columns.
    pub fn cols(&self) -> usize {
        self.cols
    }

    /// Number of bytes per row.
    pub fn stride(&self) -> usize {
        self.cols.div_ceil(8)
    }

    /// The packed bytes of row `r`.
    pub fn row(&self, r: usize) -> &[u8] {
        let s = self.stride();
        &self.data[r * s..(r + 1) * s]
    }

    /// The packed bytes of row `r`, mutably.
    pub fn row_mut(&mut self, r: usize) -> &mut [u8] {
        let s = self.stride();
        &mut self.data[r * s..(r + 1) * s]
    }

    /// Bit `c` of row `r`.
    pub fn get(&self, r: usize, c: usize) -> bool {
        self.row(r)[c / 8] >> (c % 8) & 1 == 1
    }

    /// Sets bit `c` of row `r`.
    pub fn set(&mut self, r: usize, c: usize, bit: bool) {
        let byte = &mut self.row_mut(r)[c / 8];
        *byte = (*byte & !(1 << (c % 8))) | ((bit as u8) << (c % 8));
    }

    /// All bits of row `r`.
    pub fn row_bits(&self, r: usize) -> Vec<bool> {
        (0..self.cols).map(|c| self.get(r, c)).collect()
    }

    /// All packed bytes, row after row.
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub(crate) fn clear_padding(&mut self) {
        let rem = self.cols % 8;
        if rem == 0 || self.rows == 0 {
            return;
        }
        let mask = (1u8 << rem) - 1;
        let s = self.stride();
        for r in 0..self.rows {
            self.data[r * s + s - 1] &= mask;
        }
    }
}

impl BitXorAssign<&BitMatrix> for BitMatrix {
    fn bitxor_assign(&mut self, rhs: &BitMatrix) {
        assert_eq!((self.rows, self.cols), (rhs.rows, rhs.cols));
        crate::utils::xor_inplace(&mut self.data, &rhs.data);
    }
}

/// One party's view of a shared matrix.
///
/// Under the replicated sharing `x = x0 ^ x1 ^ x2`, party `i` holds `x_i` in plane 0 and
/// `x_{i-1}` (the previous party's share) in plane 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SharedMatrix {
    planes: [BitMatrix; 2],
}

impl SharedMatrix {
    /// An all-zero sharing.
    pub fn new(rows: usize, cols: usize) -> Self {
        Self {
            planes: [BitMatrix::new(rows, cols), BitMatrix::new(rows, cols)],
        }
    }

    /// Combines two planes of equal shape.
    pub fn from_planes(own: BitMatrix, prev: BitMatrix) -> Result<Self, Error> {
        let (own_shape, prev_shape) = ((own.rows, own.cols), (prev.rows, prev.cols));
        if own_shape != prev_shape {
            return Err(Error::PlaneShape {
                own: own_shape,
                prev: prev_shape,
            });
        }
        Ok(Self {
            planes: [own, prev],
        })
    }

    /// Number of rows.
    pub fn rows(&self) -> usize {
        self.planes[0].rows
    }

    /// Number of bit columns.
    pub fn cols(&self) -> usize {
        self.planes[0].cols
    }

    /// Plane 0 holds this party's share, plane 1 the previous party's share.
    pub fn plane(&self, i: usize) -> &BitMatrix {
        &self.planes[i]
    }

    /// See [`SharedMatrix::plane`].
    pub fn plane_mut(&mut self, i: usize) -> &mut BitMatrix {
        &mut self.planes[i]
    }
}

/// Splits `m` into the views of parties 0, 1 and 2.
pub fn share_matrix(m: &BitMatrix, rng: &mut impl Rng) -> [SharedMatrix; 3] {
    let x1 = BitMatrix::random(m.rows, m.cols, rng);
    let x2 = BitMatrix::random(m.rows, m.cols, rng);
    let mut x0 = m.clone();
    x0 ^= &x1;
    x0 ^= &x2;
    let view = |own, prev| SharedMatrix {
        planes: [own, prev],
    };
    [
        view(x0.clone(), x2.clone()),
        view(x1.clone(), x0),
        view(x2, x1),
    ]
}

/// Recombines the views of parties 0, 1 and 2.
///
/// Returns `None` if the views are not a consistent replicated sharing.
pub fn reconstruct(views: &[SharedMatrix; 3]) -> Option<BitMatrix> {
    for i in 0..3 {
        if views[i].planes[1] != views[(i + 2) % 3].planes[0] {
            return None;
        }
    }
    let mut m = views[0].planes[0].clone();
    m ^= &views[1].planes[0];
    m ^= &views[2].planes[0];
    Some(m)
}
