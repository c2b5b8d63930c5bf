use crate::error::{Result, TideError};
use crate::types::{DimSeq, MAX_DIMS};

/// Strided multi-dimensional sub-region of an array object:
/// start/count/stride/block per logical dimension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hyperslab {
    pub start: Vec<u64>,
    pub count: Vec<u64>,
    pub stride: Vec<u64>,
    pub block: Vec<u64>,
}

impl Hyperslab {
    /// Full selection over the given dimensions.
    pub fn full(dims: &[u64]) -> Self {
        Self {
            start: vec![0; dims.len()],
            count: vec![1; dims.len()],
            stride: dims.to_vec(),
            block: dims.to_vec(),
        }
    }

    pub fn num_dims(&self) -> usize {
        self.start.len()
    }

    /// Selected cell count.
    pub fn num_cells(&self) -> u64 {
        self.count
            .iter()
            .zip(&self.block)
            .map(|(c, b)| c * b)
            .product()
    }

    pub fn validate(&self, dims: &[u64]) -> Result<()> {
        let n = dims.len();
        if n == 0 || n > MAX_DIMS {
            return Err(TideError::InvalidArgument(format!(
                "array has {} dimensions, expected 1..={}",
                n, MAX_DIMS
            )));
        }
        if self.start.len() != n
            || self.count.len() != n
            || self.stride.len() != n
            || self.block.len() != n
        {
            return Err(TideError::InvalidArgument(format!(
                "hyperslab rank mismatch: array has {} dimensions",
                n
            )));
        }
        for d in 0..n {
            if self.count[d] == 0 || self.block[d] == 0 {
                // Zero-cell selections are legal no-ops, checked by caller
                // via num_cells; zero block with nonzero count is not.
                continue;
            }
            if self.count[d] > 1 && self.stride[d] < self.block[d] {
                return Err(TideError::InvalidArgument(format!(
                    "hyperslab stride {} smaller than block {} in dimension {}",
                    self.stride[d], self.block[d], d
                )));
            }
            let span = self.start[d] + (self.count[d] - 1) * self.stride[d] + self.block[d];
            if span > dims[d] {
                return Err(TideError::InvalidArgument(format!(
                    "hyperslab exceeds dimension {}: span {} > extent {}",
                    d, span, dims[d]
                )));
            }
        }
        Ok(())
    }

    /// Linearize the selection into `(byte_offset, byte_len)` runs in payload
    /// order. Payload order is row-major over the logical dimensions; the
    /// physical offset of each cell honors the dimension-sequence
    /// permutation. Adjacent runs are merged.
    pub fn byte_runs(&self, cell_size: u32, dims: &[u64], seq: &DimSeq) -> Result<Vec<(u64, u64)>> {
        self.validate(dims)?;
        let n = dims.len();
        let cell = cell_size as u64;

        if self.num_cells() == 0 {
            return Ok(Vec::new());
        }

        // Physical extent per physical position, and the multiplier each
        // logical dimension contributes to the flat cell index.
        let phys_extents: Vec<u64> = seq.as_slice().iter().map(|&d| dims[d as usize]).collect();
        let mut phys_multiplier = vec![1u64; n];
        {
            let mut acc = 1u64;
            for p in (0..n).rev() {
                phys_multiplier[p] = acc;
                acc *= phys_extents[p];
            }
        }
        let mut logical_multiplier = vec![0u64; n];
        for (p, &d) in seq.as_slice().iter().enumerate() {
            logical_multiplier[d as usize] = phys_multiplier[p];
        }

        let mut runs: Vec<(u64, u64)> = Vec::new();
        let mut coords = vec![0u64; n]; // (block index, within-block) folded below
        let mut block_pos = vec![0u64; n];

        loop {
            let mut cell_index = 0u64;
            for d in 0..n {
                let pos = self.start[d] + coords[d] * self.stride[d] + block_pos[d];
                cell_index += pos * logical_multiplier[d];
            }
            let offset = cell_index * cell;
            match runs.last_mut() {
                Some((last_off, last_len)) if *last_off + *last_len == offset => {
                    *last_len += cell;
                }
                _ => runs.push((offset, cell)),
            }

            // Advance row-major: innermost is the within-block position of
            // the last dimension.
            let mut d = n;
            loop {
                if d == 0 {
                    return Ok(runs);
                }
                d -= 1;
                block_pos[d] += 1;
                if block_pos[d] < self.block[d] {
                    break;
                }
                block_pos[d] = 0;
                coords[d] += 1;
                if coords[d] < self.count[d] {
                    break;
                }
                coords[d] = 0;
                if d == 0 {
                    return Ok(runs);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_selection_is_one_run() {
        let dims = [3, 4];
        let slab = Hyperslab::full(&dims);
        let runs = slab
            .byte_runs(8, &dims, &DimSeq::identity(2))
            .unwrap();
        assert_eq!(runs, vec![(0, 3 * 4 * 8)]);
        assert_eq!(slab.num_cells(), 12);
    }

    #[test]
    fn test_strided_selection_runs() {
        // 1-D array of 8 cells, pick cells 0,1 and 4,5 (count=2 stride=4
        // block=2), cell size 2.
        let dims = [8];
        let slab = Hyperslab {
            start: vec![0],
            count: vec![2],
            stride: vec![4],
            block: vec![2],
        };
        // Cells 4,5 at cell size 2 start at byte 8.
        let runs = slab.byte_runs(2, &dims, &DimSeq::identity(1)).unwrap();
        assert_eq!(runs, vec![(0, 4), (8, 4)]);
    }

    #[test]
    fn test_dim_seq_permutes_offsets() {
        // 2x3 array, select row 1 fully. Identity layout keeps the row
        // contiguous; the transposed layout scatters it column-wise.
        let dims = [2, 3];
        let slab = Hyperslab {
            start: vec![1, 0],
            count: vec![1, 1],
            stride: vec![1, 3],
            block: vec![1, 3],
        };
        let id_runs = slab.byte_runs(1, &dims, &DimSeq::identity(2)).unwrap();
        assert_eq!(id_runs, vec![(3, 3)]);

        let transposed = DimSeq::new(vec![1, 0]).unwrap();
        let tr_runs = slab.byte_runs(1, &dims, &transposed).unwrap();
        assert_eq!(tr_runs, vec![(1, 1), (3, 1), (5, 1)]);
    }

    #[test]
    fn test_out_of_bounds_rejected() {
        let dims = [4];
        let slab = Hyperslab {
            start: vec![2],
            count: vec![1],
            stride: vec![3],
            block: vec![3],
        };
        assert!(slab.byte_runs(1, &dims, &DimSeq::identity(1)).is_err());
    }

    #[test]
    fn test_zero_cell_selection_is_empty() {
        let dims = [4];
        let slab = Hyperslab {
            start: vec![0],
            count: vec![0],
            stride: vec![1],
            block: vec![1],
        };
        assert!(slab
            .byte_runs(4, &dims, &DimSeq::identity(1))
            .unwrap()
            .is_empty());
    }
}
