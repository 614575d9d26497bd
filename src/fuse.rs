//! Dimension fusion for row-major traversal.
//!
//! Merges adjacent dimensions that every operand walks contiguously, so the
//! executor runs fewer, longer loops.

use crate::stridx::Stridx;

/// Result of [`fuse_steps`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Fused {
    pub dims: Vec<usize>,
    /// Per operand, one descriptor per remaining dimension.
    pub steps: Vec<Vec<Stridx>>,
    /// Per operand, byte offset folded out of dropped extent-1 dimensions.
    pub base_delta: Vec<isize>,
}

/// Drop extent-1 dimensions and merge adjacent stride-regular dimensions.
///
/// Dimensions `i` (outer) and `i + 1` (inner) merge when every operand has a
/// stride on both and `step[i] == dims[i + 1] * step[i + 1]`. The merged
/// dimension keeps the inner steps. Zero-extent dimensions are kept.
pub(crate) fn fuse_steps(dims: &[usize], steps: &[Vec<Stridx>]) -> Fused {
    let mut base_delta = vec![0isize; steps.len()];
    let mut out_dims: Vec<usize> = Vec::with_capacity(dims.len());
    let mut out_steps: Vec<Vec<Stridx>> = vec![Vec::with_capacity(dims.len()); steps.len()];

    for (d, &n) in dims.iter().enumerate() {
        if n == 1 {
            for (delta, op) in base_delta.iter_mut().zip(steps) {
                *delta += op[d].offset_at(0);
            }
            continue;
        }
        if let Some(&outer_n) = out_dims.last() {
            // The dimension pushed last is the outer one, `d` the inner one.
            let mergeable = steps.iter().zip(&out_steps).all(|(op, fused)| {
                match (fused.last(), &op[d]) {
                    (Some(Stridx::Stride(outer)), Stridx::Stride(inner)) => {
                        *outer == n as isize * inner
                    }
                    _ => false,
                }
            });
            if mergeable {
                if let Some(last) = out_dims.last_mut() {
                    *last = outer_n * n;
                }
                for (op, fused) in steps.iter().zip(out_steps.iter_mut()) {
                    if let Some(last) = fused.last_mut() {
                        *last = op[d].clone();
                    }
                }
                continue;
            }
        }
        out_dims.push(n);
        for (op, fused) in steps.iter().zip(out_steps.iter_mut()) {
            fused.push(op[d].clone());
        }
    }

    Fused {
        dims: out_dims,
        steps: out_steps,
        base_delta,
    }
}

/// Stride-only form of [`fuse_steps`].
pub(crate) fn fuse_dims(dims: &[usize], all_strides: &[&[isize]]) -> (Vec<usize>, Vec<Vec<isize>>) {
    let steps: Vec<Vec<Stridx>> = all_strides
        .iter()
        .map(|s| s.iter().copied().map(Stridx::Stride).collect())
        .collect();
    let fused = fuse_steps(dims, &steps);
    let strides = fused
        .steps
        .into_iter()
        .map(|op| op.into_iter().filter_map(|s| s.stride()).collect())
        .collect();
    (fused.dims, strides)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fuse_contiguous() {
        let (dims, strides) = fuse_dims(&[2, 3, 4], &[&[96, 32, 8]]);
        assert_eq!(dims, vec![24]);
        assert_eq!(strides, vec![vec![8]]);
    }

    #[test]
    fn test_no_fuse_when_any_operand_breaks() {
        let (dims, strides) = fuse_dims(&[2, 3], &[&[24, 8], &[8, 16]]);
        assert_eq!(dims, vec![2, 3]);
        assert_eq!(strides, vec![vec![24, 8], vec![8, 16]]);
    }

    #[test]
    fn test_drops_extent_one() {
        let (dims, strides) = fuse_dims(&[1, 5, 1], &[&[40, 8, 8]]);
        assert_eq!(dims, vec![5]);
        assert_eq!(strides, vec![vec![8]]);
        let (dims, _) = fuse_dims(&[1, 1], &[&[8, 8]]);
        assert!(dims.is_empty());
    }

    #[test]
    fn test_broadcast_zero_steps_fuse() {
        // An operand broadcast over both dims fuses with a contiguous one.
        let (dims, strides) = fuse_dims(&[3, 4], &[&[32, 8], &[0, 0]]);
        assert_eq!(dims, vec![12]);
        assert_eq!(strides, vec![vec![8], vec![0]]);
    }

    #[test]
    fn test_index_blocks_fusion_and_folds_extent_one() {
        let steps = vec![vec![
            Stridx::Index(Arc::from(vec![16usize])),
            Stridx::Stride(4),
            Stridx::Index(Arc::from(vec![0usize, 8])),
        ]];
        let fused = fuse_steps(&[1, 2, 2], &steps);
        assert_eq!(fused.dims, vec![2, 2]);
        assert_eq!(fused.base_delta, vec![16]);
        assert!(fused.steps[0][1].is_index());
    }
}
