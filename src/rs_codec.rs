//! Systematic Reed-Solomon erasure codec over GF(2^16).
//!
//! Grounded in the teacher's matrix-based reconstruction approach
//! (`reed_solomon/matrix.rs`, `reed_solomon/reconstruction.rs`) but
//! generalized to STRUBS's runtime-configured `(D, P)` instead of the
//! teacher's compile-time PAR2 recovery-set dimensions, since `D`/`P` here
//! come from `Config` rather than being fixed at build time.
//!
//! Construction: a `(D+P) x D` Vandermonde matrix `V` (row `i` = powers of
//! `i+1`) is made systematic by multiplying by the inverse of its own top
//! `D x D` block, so the first `D` rows become the identity matrix and any
//! `D` of its rows stay invertible (Vandermonde rows with distinct
//! evaluation points are always independent). Encoding multiplies the parity
//! rows against the data chunks; reconstruction inverts whichever `D` rows
//! are actually available and solves for the original data chunks.

use crate::galois::Gf16;
use rustc_hash::FxHashMap as HashMap;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("need exactly {expected} chunks of equal even length to encode/reconstruct, got {actual}")]
    ChunkCountMismatch { expected: usize, actual: usize },
    #[error("chunk length {0} is not a whole number of 16-bit words")]
    OddChunkLength(usize),
    #[error("generator submatrix for the given active slices is singular (duplicate evaluation point)")]
    SingularMatrix,
}

/// A `D x D` (or smaller) matrix of field elements with Gaussian-elimination
/// inversion — the runtime-sized counterpart of the teacher's const-generic
/// `Matrix<ROWS, COLS>`.
#[derive(Clone)]
struct Matrix {
    rows: usize,
    cols: usize,
    data: Vec<Gf16>,
}

impl Matrix {
    fn zero(rows: usize, cols: usize) -> Self {
        Matrix {
            rows,
            cols,
            data: vec![Gf16::ZERO; rows * cols],
        }
    }

    #[inline]
    fn get(&self, r: usize, c: usize) -> Gf16 {
        self.data[r * self.cols + c]
    }

    #[inline]
    fn set(&mut self, r: usize, c: usize, v: Gf16) {
        self.data[r * self.cols + c] = v;
    }

    /// Invert a square matrix via Gauss-Jordan elimination with the first
    /// nonzero pivot found in each column (GF(2^16) has no notion of
    /// "largest" pivot, so any nonzero candidate is equally good).
    fn invert(&self) -> Result<Matrix, CodecError> {
        assert_eq!(self.rows, self.cols);
        let n = self.rows;
        let mut work = self.clone();
        let mut inv = Matrix::identity(n);

        for col in 0..n {
            let pivot_row = (col..n).find(|&r| !work.get(r, col).is_zero());
            let pivot_row = pivot_row.ok_or(CodecError::SingularMatrix)?;
            if pivot_row != col {
                work.swap_rows(col, pivot_row);
                inv.swap_rows(col, pivot_row);
            }

            let pivot = work.get(col, col);
            let pivot_inv = pivot.inverse();
            work.scale_row(col, pivot_inv);
            inv.scale_row(col, pivot_inv);

            for r in 0..n {
                if r == col {
                    continue;
                }
                let factor = work.get(r, col);
                if factor.is_zero() {
                    continue;
                }
                work.add_scaled_row(r, col, factor);
                inv.add_scaled_row(r, col, factor);
            }
        }

        Ok(inv)
    }

    fn identity(n: usize) -> Matrix {
        let mut m = Matrix::zero(n, n);
        for i in 0..n {
            m.set(i, i, Gf16::ONE);
        }
        m
    }

    fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for c in 0..self.cols {
            self.data.swap(a * self.cols + c, b * self.cols + c);
        }
    }

    fn scale_row(&mut self, row: usize, factor: Gf16) {
        for c in 0..self.cols {
            let v = self.get(row, c);
            self.set(row, c, v * factor);
        }
    }

    /// `target_row -= factor * source_row` (subtraction is XOR in GF(2^k)).
    fn add_scaled_row(&mut self, target_row: usize, source_row: usize, factor: Gf16) {
        for c in 0..self.cols {
            let s = self.get(source_row, c) * factor;
            let t = self.get(target_row, c);
            self.set(target_row, c, t - s);
        }
    }

    fn mul_vec(&self, vec: &[Gf16]) -> Vec<Gf16> {
        assert_eq!(vec.len(), self.cols);
        (0..self.rows)
            .map(|r| {
                (0..self.cols)
                    .map(|c| self.get(r, c) * vec[c])
                    .fold(Gf16::ZERO, |acc, v| acc + v)
            })
            .collect()
    }
}

/// A systematic Reed-Solomon generator for a fixed `(data, parity)` shape.
pub struct Codec {
    data_count: usize,
    total_count: usize,
    generator: Matrix, // (data+parity) x data, rows 0..data are the identity
}

impl Codec {
    pub fn new(data_count: usize, parity_count: usize) -> Self {
        let total_count = data_count + parity_count;
        let vandermonde = Self::vandermonde(total_count, data_count);
        let top = vandermonde.sub_matrix(0, data_count);
        let top_inv = top
            .invert()
            .expect("Vandermonde top block is always invertible for distinct evaluation points");
        let generator = vandermonde.mul_matrix(&top_inv);
        Codec {
            data_count,
            total_count,
            generator,
        }
    }

    fn vandermonde(rows: usize, cols: usize) -> Matrix {
        let mut m = Matrix::zero(rows, cols);
        for r in 0..rows {
            let base = Gf16::new((r + 1) as u16);
            for c in 0..cols {
                m.set(r, c, base.pow(c as u32));
            }
        }
        m
    }

    /// Encode `data_chunks` (exactly `data_count` equal-length, even-length
    /// buffers) into `parity_count` parity chunks of the same length.
    pub fn encode_parity(&self, data_chunks: &[&[u8]]) -> Result<Vec<Vec<u8>>, CodecError> {
        if data_chunks.len() != self.data_count {
            return Err(CodecError::ChunkCountMismatch {
                expected: self.data_count,
                actual: data_chunks.len(),
            });
        }
        let chunk_len = data_chunks[0].len();
        for c in data_chunks {
            if c.len() != chunk_len {
                return Err(CodecError::ChunkCountMismatch {
                    expected: chunk_len,
                    actual: c.len(),
                });
            }
        }
        if chunk_len % 2 != 0 {
            return Err(CodecError::OddChunkLength(chunk_len));
        }

        let word_count = chunk_len / 2;
        let parity_count = self.total_count - self.data_count;
        let mut parity = vec![vec![0u8; chunk_len]; parity_count];

        for word_idx in 0..word_count {
            let column: Vec<Gf16> = data_chunks
                .iter()
                .map(|c| word_at(c, word_idx))
                .collect();
            for p in 0..parity_count {
                let row = self.data_count + p;
                let value = (0..self.data_count)
                    .map(|d| self.generator.get(row, d) * column[d])
                    .fold(Gf16::ZERO, |acc, v| acc + v);
                write_word(&mut parity[p], word_idx, value);
            }
        }

        Ok(parity)
    }

    /// Reconstruct the original data chunks named in `missing_data_indices`
    /// (indices in `[0, data_count)`) from `active`, a set of exactly
    /// `data_count` `(slice_index, chunk_bytes)` pairs spanning data and/or
    /// parity slices (`slice_index` in `[0, total_count)`).
    pub fn reconstruct(
        &self,
        active: &[(usize, &[u8])],
        missing_data_indices: &[usize],
    ) -> Result<HashMap<usize, Vec<u8>>, CodecError> {
        if active.len() != self.data_count {
            return Err(CodecError::ChunkCountMismatch {
                expected: self.data_count,
                actual: active.len(),
            });
        }
        let chunk_len = active[0].1.len();
        for (_, c) in active {
            if c.len() != chunk_len {
                return Err(CodecError::ChunkCountMismatch {
                    expected: chunk_len,
                    actual: c.len(),
                });
            }
        }
        if chunk_len % 2 != 0 {
            return Err(CodecError::OddChunkLength(chunk_len));
        }

        let mut rows = Matrix::zero(self.data_count, self.data_count);
        for (i, (slice_idx, _)) in active.iter().enumerate() {
            for c in 0..self.data_count {
                rows.set(i, c, self.generator.get(*slice_idx, c));
            }
        }
        let inv = rows.invert()?;

        let word_count = chunk_len / 2;
        let mut decoded: HashMap<usize, Vec<u8>> = missing_data_indices
            .iter()
            .map(|&i| (i, vec![0u8; chunk_len]))
            .collect();

        for word_idx in 0..word_count {
            let y: Vec<Gf16> = active.iter().map(|(_, c)| word_at(c, word_idx)).collect();
            let x = inv.mul_vec(&y);
            for &missing in missing_data_indices {
                if let Some(buf) = decoded.get_mut(&missing) {
                    write_word(buf, word_idx, x[missing]);
                }
            }
        }

        Ok(decoded)
    }

    pub fn data_count(&self) -> usize {
        self.data_count
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }
}

impl Matrix {
    fn sub_matrix(&self, start_row: usize, row_count: usize) -> Matrix {
        let mut m = Matrix::zero(row_count, self.cols);
        for r in 0..row_count {
            for c in 0..self.cols {
                m.set(r, c, self.get(start_row + r, c));
            }
        }
        m
    }

    fn mul_matrix(&self, rhs: &Matrix) -> Matrix {
        assert_eq!(self.cols, rhs.rows);
        let mut out = Matrix::zero(self.rows, rhs.cols);
        for r in 0..self.rows {
            for c in 0..rhs.cols {
                let mut acc = Gf16::ZERO;
                for k in 0..self.cols {
                    acc += self.get(r, k) * rhs.get(k, c);
                }
                out.set(r, c, acc);
            }
        }
        out
    }
}

#[inline]
fn word_at(buf: &[u8], word_idx: usize) -> Gf16 {
    let i = word_idx * 2;
    Gf16::new(u16::from_le_bytes([buf[i], buf[i + 1]]))
}

#[inline]
fn write_word(buf: &mut [u8], word_idx: usize, value: Gf16) {
    let i = word_idx * 2;
    let bytes = value.value().to_le_bytes();
    buf[i] = bytes[0];
    buf[i + 1] = bytes[1];
}
