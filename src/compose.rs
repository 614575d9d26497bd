//! View composition: apply resolved selectors to an array's layout.

use std::sync::Arc;

use crate::array::NArray;
use crate::index::{check_index_count, resolve_args, AxisSelector, IndexExpr, ResolvedAxis};
use crate::stridx::Stridx;
use crate::{NArrayError, Result};

/// Build the view of `source` described by `axes`.
///
/// Scalar selectors fold their offset into the base offset and drop the axis,
/// unless `keep_dim` is set, in which case every selector keeps its slot.
/// Inserted axes get a stride of one element.
pub fn compose(source: &NArray, axes: &[ResolvedAxis], keep_dim: bool) -> Result<NArray> {
    let elmsz = source.element_size() as isize;
    let mut offset = source.offset() as isize;
    let mut shape = Vec::with_capacity(axes.len());
    let mut stridx = Vec::with_capacity(axes.len());
    let mut reduce = Vec::with_capacity(axes.len());

    for q in axes {
        let dim = match (&q.selector, q.orig_dim) {
            (AxisSelector::NewAxis, _) => {
                shape.push(1);
                stridx.push(Stridx::Stride(elmsz));
                reduce.push(q.reduce);
                continue;
            }
            (_, Some(dim)) if dim < source.ndim() => dim,
            _ => {
                return Err(NArrayError::Internal(format!(
                    "selector {:?} has no source axis",
                    q.selector
                )))
            }
        };
        let src = source.stridx(dim);

        let (start, step, count) = match &q.selector {
            AxisSelector::Scalar(pos) if !keep_dim => {
                offset += src.offset_at(*pos);
                continue;
            }
            AxisSelector::Scalar(pos) => (*pos, 1, 1),
            AxisSelector::All(n) => (0, 1, *n),
            AxisSelector::Range { start, step, count } => (*start, *step, *count),
            AxisSelector::Explicit(list) => {
                let sdx = match &src {
                    // index <- index
                    Stridx::Index(old) => list.iter().map(|&i| old[i]).collect::<Vec<_>>(),
                    // index <- step
                    Stridx::Stride(s) if *s >= 0 => {
                        list.iter().map(|&i| i * *s as usize).collect()
                    }
                    Stridx::Stride(s) => {
                        let s = s.unsigned_abs();
                        let last = source.shape()[dim].saturating_sub(1);
                        let shift = (last * s) as isize;
                        if offset < shift {
                            return Err(NArrayError::Internal("negative offset".into()));
                        }
                        offset -= shift;
                        list.iter().map(|&i| (last - i) * s).collect()
                    }
                };
                shape.push(list.len());
                stridx.push(Stridx::Index(Arc::from(sdx)));
                reduce.push(q.reduce);
                continue;
            }
            AxisSelector::NewAxis => {
                return Err(NArrayError::Internal("new axis bound to a source axis".into()))
            }
        };

        let sdx = match &src {
            // step <- index
            Stridx::Index(old) => {
                let list: Vec<usize> = (0..count)
                    .map(|k| old[(start as isize + step * k as isize) as usize])
                    .collect();
                Stridx::Index(Arc::from(list))
            }
            // step <- step
            Stridx::Stride(s) => {
                if count > 0 {
                    offset += s * start as isize;
                }
                Stridx::Stride(s * step)
            }
        };
        shape.push(count);
        stridx.push(sdx);
        reduce.push(q.reduce);
    }

    let offset = usize::try_from(offset)
        .map_err(|_| NArrayError::Internal(format!("negative offset {offset}")))?;
    let view = NArray::view(
        source.dtype(),
        &shape,
        source.buffer().clone(),
        stridx,
        offset,
    );
    Ok(view.with_reduce_mask(&reduce))
}

/// Rank-0 view of the element at byte `pos` of `source`'s buffer.
fn element_view(source: &NArray, pos: isize) -> Result<NArray> {
    let pos =
        usize::try_from(pos).map_err(|_| NArrayError::Internal(format!("negative offset {pos}")))?;
    Ok(NArray::view(
        source.dtype(),
        &[],
        source.buffer().clone(),
        vec![],
        pos,
    ))
}

fn check_flat(pos: isize, size: usize, dim: usize) -> Result<usize> {
    let x = if pos < 0 { pos + size as isize } else { pos };
    if x < 0 || x >= size as isize {
        return Err(NArrayError::OutOfRange {
            index: pos,
            dim,
            size,
        });
    }
    Ok(x as usize)
}

/// Direct address of an all-integer index, if the expression has that form.
///
/// One integer per axis addresses a single element; a lone integer on a
/// rank>1 array indexes its elements in row-major order.
fn integer_fast_path(source: &NArray, args: &[IndexExpr]) -> Result<Option<NArray>> {
    let ints: Option<Vec<isize>> = args
        .iter()
        .map(|a| match a {
            IndexExpr::Int(i) => Some(*i),
            _ => None,
        })
        .collect();
    let Some(ints) = ints else {
        return Ok(None);
    };

    let mut pos = source.offset() as isize;
    if ints.len() == source.ndim() {
        for (dim, &i) in ints.iter().enumerate() {
            let x = check_flat(i, source.shape()[dim], dim)?;
            pos += source.stridx(dim).offset_at(x);
        }
    } else if ints.len() == 1 {
        let mut x = check_flat(ints[0], source.size(), 0)?;
        for dim in (0..source.ndim()).rev() {
            let n = source.shape()[dim];
            pos += source.stridx(dim).offset_at(x % n);
            x /= n;
        }
    } else {
        return Ok(None);
    }
    if crate::config::debug_enabled() {
        tracing::debug!(pos, "integer index resolved without composition");
    }
    element_view(source, pos).map(Some)
}

/// Full indexing entry point behind [`NArray::aref`] and [`NArray::slice`].
pub(crate) fn aref(source: &NArray, args: &[IndexExpr], keep_dim: bool) -> Result<NArray> {
    if source.size() == 0 {
        return Err(NArrayError::Usage("cannot get index of empty array".into()));
    }
    if args.is_empty() {
        return crate::ops::copy(source);
    }
    if !keep_dim {
        if let Some(view) = integer_fast_path(source, args)? {
            return Ok(view);
        }
    }

    let result_nd = check_index_count(args, source.ndim())?;
    let single = args.len() == 1 && result_nd == 1;
    if !single || source.ndim() <= 1 {
        let axes = resolve_args(source.shape(), args)?;
        return compose(source, &axes, keep_dim);
    }

    // A lone expression indexes the elements in row-major order. An index
    // array of rank>1 also shapes the result.
    let flat = source.flatten();
    match &args[0] {
        IndexExpr::Array(index) if index.ndim() > 1 => {
            let arg = IndexExpr::Array(index.flatten());
            let axes = resolve_args(flat.shape(), std::slice::from_ref(&arg))?;
            let gathered = compose(&flat, &axes, keep_dim)?;
            crate::ops::copy(&gathered)?.into_shape(index.shape())
        }
        _ => {
            let axes = resolve_args(flat.shape(), args)?;
            compose(&flat, &axes, keep_dim)
        }
    }
}
