//! Array operations built on the loop engine: materializing copies,
//! broadcasting assignment and dtype conversion.

use crate::array::NArray;
use crate::broadcast::broadcast_shapes;
use crate::dtype::{convert, with_dtype, DType};
use crate::kernel::KernelContext;
use crate::ndloop::ndloop_into;
use crate::plan::{InArg, LoopOptions, LoopSupport, NdFunc, OutArg};
use crate::{NArrayError, Result};

/// Copy `src` into a new contiguous array of the same dtype and shape.
///
/// Views (strided, reversed, gathered) are materialized in row-major order.
pub fn copy(src: &NArray) -> Result<NArray> {
    let out = NArray::zeros(src.dtype(), src.shape());
    let func = NdFunc::new(vec![InArg::new(None)], vec![OutArg::same_as(0)])
        .with_support(LoopSupport::Gathered);
    let dtype = src.dtype();
    ndloop_into(&func, &[src], &[&out], &LoopOptions::default(), |ctx| {
        with_dtype!(dtype, T => copy_run::<T>(ctx))
    })?;
    Ok(out)
}

fn copy_run<T: crate::Element>(ctx: &KernelContext<'_>) -> Result<()> {
    ctx.for_each(|offs| {
        let v: T = ctx.read(0, offs[0]);
        ctx.write(1, offs[1], v);
        Ok(())
    })
}

/// Write `src` into `dst`, broadcasting `src` over `dst`'s shape and casting
/// to `dst`'s dtype.
///
/// `dst` may be a view; only the elements it selects are written.
///
/// ```rust
/// use strided_narray::{store, NArray};
///
/// let a = NArray::from_vec(&[2, 3], vec![0i32; 6]).unwrap();
/// let row = NArray::from_vec(&[3], vec![1.0f64, 2.0, 3.0]).unwrap();
/// store(&a, &row).unwrap();
/// assert_eq!(a.to_vec::<i32>().unwrap(), vec![1, 2, 3, 1, 2, 3]);
/// ```
pub fn store(dst: &NArray, src: &NArray) -> Result<()> {
    let shape = broadcast_shapes(&[dst.shape(), src.shape()])?;
    if shape != dst.shape() {
        let lead = shape.len() - dst.ndim();
        let dim = (0..shape.len())
            .find(|&d| d < lead || shape[d] != dst.shape()[d - lead])
            .unwrap_or(0);
        return Err(NArrayError::ShapeMismatch {
            dim,
            expected: dim.checked_sub(lead).map_or(1, |d| dst.shape()[d]),
            found: shape[dim],
        });
    }
    let dtype = dst.dtype();
    let func = NdFunc::new(vec![InArg::new(Some(dtype))], vec![OutArg::new(dtype)])
        .with_support(LoopSupport::Gathered);
    ndloop_into(&func, &[src], &[dst], &LoopOptions::default(), |ctx| {
        with_dtype!(dtype, T => copy_run::<T>(ctx))
    })
}

/// Convert `src` to `dtype`, element by element.
///
/// Fails with a type error on the first value `dtype` cannot represent.
pub fn cast(src: &NArray, dtype: DType) -> Result<NArray> {
    if src.dtype() == dtype {
        return copy(src);
    }
    let out = NArray::zeros(dtype, src.shape());
    let func = NdFunc::new(vec![InArg::new(None)], vec![OutArg::new(dtype)])
        .with_support(LoopSupport::Gathered);
    let from = src.dtype();
    ndloop_into(&func, &[src], &[&out], &LoopOptions::default(), |ctx| {
        with_dtype!(from, S => with_dtype!(dtype, D => cast_run::<S, D>(ctx)))
    })?;
    Ok(out)
}

fn cast_run<S: crate::Element, D: crate::Element>(ctx: &KernelContext<'_>) -> Result<()> {
    ctx.for_each(|offs| {
        let v: S = ctx.read(0, offs[0]);
        ctx.write(1, offs[1], convert::<S, D>(v)?);
        Ok(())
    })
}
