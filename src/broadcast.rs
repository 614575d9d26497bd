//! Shape broadcasting.
//!
//! Shapes are right-aligned; a missing or extent-1 axis stretches to the
//! other operand's extent. Two extents that are both not 1 must agree.

use crate::{NArrayError, Result};

/// Broadcast two shapes.
///
/// Returns `None` when some pair of extents is incompatible.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Option<Vec<usize>> {
    broadcast_shapes(&[a, b]).ok()
}

/// Broadcast any number of shapes into the common shape.
///
/// The error names the first mismatching axis of the result.
pub fn broadcast_shapes(shapes: &[&[usize]]) -> Result<Vec<usize>> {
    let rank = shapes.iter().map(|s| s.len()).max().unwrap_or(0);
    let mut result = vec![1usize; rank];
    for shape in shapes {
        let lead = rank - shape.len();
        for (i, &n) in shape.iter().enumerate() {
            merge_extent(&mut result[lead + i], n, lead + i)?;
        }
    }
    Ok(result)
}

/// Fold extent `n` into `acc` for axis `dim`.
#[inline]
pub(crate) fn merge_extent(acc: &mut usize, n: usize, dim: usize) -> Result<()> {
    if n == 1 || n == *acc {
        return Ok(());
    }
    if *acc == 1 {
        *acc = n;
        return Ok(());
    }
    Err(NArrayError::ShapeMismatch {
        dim,
        expected: *acc,
        found: n,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_shape() {
        assert_eq!(broadcast_shape(&[3, 1], &[1, 4]), Some(vec![3, 4]));
        assert_eq!(broadcast_shape(&[4], &[2, 3, 4]), Some(vec![2, 3, 4]));
        assert_eq!(broadcast_shape(&[], &[5]), Some(vec![5]));
        assert_eq!(broadcast_shape(&[2], &[3]), None);
    }

    #[test]
    fn test_broadcast_shapes_error() {
        let err = broadcast_shapes(&[&[2, 3], &[1, 3], &[4, 3]]).unwrap_err();
        assert!(matches!(
            err,
            NArrayError::ShapeMismatch {
                dim: 0,
                expected: 2,
                found: 4
            }
        ));
    }

    #[test]
    fn test_zero_extent() {
        assert_eq!(broadcast_shape(&[0], &[1]), Some(vec![0]));
        assert_eq!(broadcast_shape(&[0], &[3]), None);
    }
}
