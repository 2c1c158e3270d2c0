use wide::{i8x16, i64x2};

/// Transposes a packed, row-major bit matrix with `rows` rows into `output`.
///
/// # Panics
/// - If `rows` is not a positive multiple of 16
/// - If `input.len()` is not divisible by `rows`
/// - If the column count `input.len() * 8 / rows` is below 16 or not a multiple of 8
pub(super) fn transpose_bitmatrix(input: &[u8], output: &mut [u8], rows: usize) {
    assert!(rows >= 16 && rows % 16 == 0, "rows must be a positive multiple of 16");
    assert_eq!(0, input.len() % rows, "input.len() must be divisible by rows");
    let cols = input.len() * 8 / rows;
    assert!(
        cols >= 16 && cols % 8 == 0,
        "columns must be at least 16 and a multiple of 8, got {cols}"
    );
    assert_eq!(input.len(), output.len());

    // Work in blocks of 16 rows by 8 columns, which is one byte from each of 16 rows.
    for row in (0..rows).step_by(16) {
        for col in (0..cols).step_by(8) {
            let mut v = load_bytes(input, row, col, cols);
            // move_mask gathers the top bit of every byte, which is column `col + 7` of each of
            // the 16 rows. Shifting left by one exposes the next lower column.
            for bit in (0..8).rev() {
                let msbs = v.move_mask().to_le_bytes();
                let idx = out(row, col + bit, rows);
                output[idx..idx + 2].copy_from_slice(&msbs[..2]);
                // i8x16 has no shift, bits crossing into the neighbouring byte are never read
                let v: &mut i64x2 = bytemuck::must_cast_mut(&mut v);
                *v = *v << 1;
            }
        }
    }
}

#[inline]
fn inp(x: usize, y: usize, cols: usize) -> usize {
    x * cols / 8 + y / 8
}

#[inline]
fn out(x: usize, y: usize, rows: usize) -> usize {
    y * rows / 8 + x / 8
}

// byte `col / 8` of rows `row..row + 16`
#[inline]
fn load_bytes(b: &[u8], row: usize, col: usize, cols: usize) -> i8x16 {
    let bytes = std::array::from_fn(|i| b[inp(row + i, col, cols)] as i8);
    i8x16::from(bytes)
}
