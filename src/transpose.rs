//! Transpose bit-matrices fast.
//!
//! The evaluator keeps wires in bit-sliced form (one row of `width` bits per wire) while callers
//! supply one row per instance. [`transpose`] converts between the two for any matrix shape.
mod portable;

use crate::matrix::BitMatrix;

/// Returns the transpose of `m`.
pub(crate) fn transpose(m: &BitMatrix) -> BitMatrix {
    let mut t = BitMatrix::new(m.cols(), m.rows());
    if m.rows() == 0 || m.cols() == 0 {
        return t;
    }
    // the kernel wants both dimensions to be multiples of 16
    let rows = m.rows().next_multiple_of(16);
    let cols = m.cols().next_multiple_of(16);
    let (in_stride, out_stride) = (cols / 8, rows / 8);

    let mut input = vec![0u8; rows * in_stride];
    for r in 0..m.rows() {
        input[r * in_stride..r * in_stride + m.stride()].copy_from_slice(m.row(r));
    }
    let mut output = vec![0u8; input.len()];
    portable::transpose_bitmatrix(&input, &mut output, rows);

    let stride = t.stride();
    for c in 0..m.cols() {
        t.row_mut(c)
            .copy_from_slice(&output[c * out_stride..c * out_stride + stride]);
    }
    t.clear_padding();
    t
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha20Rng;

    use super::*;

    proptest! {
        #[test]
        fn matches_naive_transpose(rows in 0usize..70, cols in 0usize..70, seed: u64) {
            let mut rng = ChaCha20Rng::seed_from_u64(seed);
            let m = BitMatrix::random(rows, cols, &mut rng);
            let t = transpose(&m);
            prop_assert_eq!((t.rows(), t.cols()), (cols, rows));
            for r in 0..rows {
                for c in 0..cols {
                    prop_assert_eq!(m.get(r, c), t.get(c, r));
                }
            }
            prop_assert_eq!(transpose(&t), m);
        }
    }
}
