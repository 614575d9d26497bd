//! Per-axis traversal descriptors.

use std::sync::Arc;

use crate::{NArrayError, Result};

/// How one axis of a view maps positions to byte offsets.
///
/// Position `k` of a `Stride(s)` axis lives at `k * s` bytes from the view's
/// base offset (negative strides walk backwards). Position `k` of an
/// `Index(list)` axis lives at `list[k]` bytes from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Stridx {
    Stride(isize),
    Index(Arc<[usize]>),
}

impl Stridx {
    /// Whether the axis is walked through an explicit offset list.
    #[inline]
    pub fn is_index(&self) -> bool {
        matches!(self, Stridx::Index(_))
    }

    /// The byte stride, if the axis is regular.
    #[inline]
    pub fn stride(&self) -> Option<isize> {
        match self {
            Stridx::Stride(s) => Some(*s),
            Stridx::Index(_) => None,
        }
    }

    /// The byte offsets, if the axis is gathered.
    #[inline]
    pub fn index(&self) -> Option<&[usize]> {
        match self {
            Stridx::Stride(_) => None,
            Stridx::Index(list) => Some(list),
        }
    }

    /// Byte offset of position `k`, relative to the base offset.
    #[inline]
    pub fn offset_at(&self, k: usize) -> isize {
        match self {
            Stridx::Stride(s) => s * k as isize,
            Stridx::Index(list) => list[k] as isize,
        }
    }

    /// Smallest and largest offsets reachable over `n` positions.
    ///
    /// Returns `(0, 0)` for `n == 0`.
    pub(crate) fn reach(&self, n: usize) -> Result<(isize, isize)> {
        if n == 0 {
            return Ok((0, 0));
        }
        match self {
            Stridx::Stride(s) => {
                let end = s
                    .checked_mul(n as isize - 1)
                    .ok_or_else(|| NArrayError::Internal("offset overflow".into()))?;
                Ok((end.min(0), end.max(0)))
            }
            Stridx::Index(list) => {
                if list.len() < n {
                    return Err(NArrayError::Internal(format!(
                        "index list of length {} used for extent {}",
                        list.len(),
                        n
                    )));
                }
                let max = list[..n].iter().copied().max().unwrap_or(0);
                let min = list[..n].iter().copied().min().unwrap_or(0);
                Ok((min as isize, max as isize))
            }
        }
    }
}

/// Row-major byte strides of a contiguous array.
pub fn row_major_strides(shape: &[usize], elmsz: usize) -> Vec<isize> {
    let rank = shape.len();
    if rank == 0 {
        return vec![];
    }
    let mut strides = vec![elmsz as isize; rank];
    for i in (0..rank - 1).rev() {
        strides[i] = strides[i + 1] * shape[i + 1] as isize;
    }
    strides
}

/// Apply a signed byte delta to an unsigned offset.
///
/// Going below zero means an earlier step produced an impossible layout.
#[inline]
pub(crate) fn offset_add(base: usize, delta: isize) -> Result<usize> {
    base.checked_add_signed(delta)
        .ok_or_else(|| NArrayError::Internal(format!("negative offset: {base} + ({delta})")))
}
