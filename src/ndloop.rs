//! Kernel invocation entry points: cast inputs, allocate outputs, lock
//! every buffer, plan, and run.

use crate::array::NArray;
use crate::broadcast::broadcast_shapes;
use crate::buffer::{Buffer, Intent, LockSet};
use crate::dtype::{encode_f64, DType};
use crate::kernel::{execute, KernelContext};
use crate::plan::{plan, LoopOptions, LoopPlan, NdFunc, OutType};
use crate::{NArrayError, Result};

/// Run `kernel` over `inputs`, allocating and returning the outputs.
///
/// Inputs are broadcast against each other. Each output has the shape of the
/// loop dimensions (reduced ones dropped, or kept as extent 1 under
/// `keep_dims`) followed by its kernel shape. An output without an initial
/// value reuses the first input marked [`NArray::inplace`] with the same dtype
/// and shape that no earlier output took.
pub fn ndloop<F>(
    func: &NdFunc,
    inputs: &[&NArray],
    opts: &LoopOptions,
    kernel: F,
) -> Result<Vec<NArray>>
where
    F: FnMut(&KernelContext<'_>) -> Result<()>,
{
    let inputs = cast_inputs(func, inputs)?;
    let outputs = alloc_outputs(func, &inputs, opts)?;
    let in_refs: Vec<&NArray> = inputs.iter().collect();
    let out_refs: Vec<&NArray> = outputs.iter().collect();
    with_plan(func, &in_refs, &out_refs, opts, |plan, locks| {
        execute(plan, locks, kernel)
    })?;
    Ok(outputs)
}

/// Run `kernel` writing into caller-provided `outputs`.
///
/// Outputs take part in broadcasting; their dtypes must already match.
pub fn ndloop_into<F>(
    func: &NdFunc,
    inputs: &[&NArray],
    outputs: &[&NArray],
    opts: &LoopOptions,
    kernel: F,
) -> Result<()>
where
    F: FnMut(&KernelContext<'_>) -> Result<()>,
{
    let inputs = cast_inputs(func, inputs)?;
    check_output_dtypes(func, &inputs, outputs)?;
    let in_refs: Vec<&NArray> = inputs.iter().collect();
    with_plan(func, &in_refs, outputs, opts, |plan, locks| {
        execute(plan, locks, kernel)
    })
}

/// Like [`ndloop`], splitting the outermost loop dimension across the rayon
/// pool when the plan allows it.
///
/// Runs sequentially when a written operand is broadcast or reduced along
/// the outermost dimension, or when the iteration is smaller than
/// [`Config::parallel_min_len`](crate::config::Config::parallel_min_len).
#[cfg(feature = "parallel")]
pub fn ndloop_par<F>(
    func: &NdFunc,
    inputs: &[&NArray],
    opts: &LoopOptions,
    kernel: F,
) -> Result<Vec<NArray>>
where
    F: Fn(&KernelContext<'_>) -> Result<()> + Sync,
{
    use crate::kernel::operand_bytes;
    use crate::threading::{can_split, execute_par};

    let inputs = cast_inputs(func, inputs)?;
    let outputs = alloc_outputs(func, &inputs, opts)?;
    let in_refs: Vec<&NArray> = inputs.iter().collect();
    let out_refs: Vec<&NArray> = outputs.iter().collect();
    let min_len = crate::config::get().parallel_min_len;
    with_plan(func, &in_refs, &out_refs, opts, |plan, locks| {
        if can_split(plan, min_len) {
            if crate::config::debug_enabled() {
                tracing::debug!(len = plan.len(), "splitting loop across threads");
            }
            let raws = operand_bytes(plan, locks)?;
            execute_par(plan, &raws, min_len, &kernel)
        } else {
            execute(plan, locks, &kernel)
        }
    })?;
    Ok(outputs)
}

/// Lock every operand, plan, and hand both to `exec`.
///
/// Locks are released when this returns, on success and on error.
fn with_plan<R>(
    func: &NdFunc,
    inputs: &[&NArray],
    outputs: &[&NArray],
    opts: &LoopOptions,
    exec: impl FnOnce(&LoopPlan, &LockSet<'_>) -> Result<R>,
) -> Result<R> {
    let requests: Vec<(&Buffer, Intent)> = inputs
        .iter()
        .zip(&func.inputs)
        .map(|(a, arg)| (a.buffer(), arg.intent))
        .chain(outputs.iter().map(|a| (a.buffer(), Intent::Write)))
        .collect();
    for (buffer, _) in &requests {
        buffer.synchronize()?;
    }
    let locks = LockSet::acquire(&requests)?;
    let plan = plan(func, inputs, outputs, opts)?;
    exec(&plan, &locks)
}

fn cast_inputs(func: &NdFunc, inputs: &[&NArray]) -> Result<Vec<NArray>> {
    if inputs.len() != func.inputs.len() {
        return Err(NArrayError::Usage(format!(
            "kernel takes {} inputs, got {}",
            func.inputs.len(),
            inputs.len()
        )));
    }
    inputs
        .iter()
        .zip(&func.inputs)
        .enumerate()
        .map(|(i, (a, arg))| match arg.dtype {
            Some(dtype) if dtype != a.dtype() => {
                if arg.intent == Intent::Write {
                    return Err(NArrayError::TypeError(format!(
                        "input {i} is written by the kernel and cannot be cast from {} to {}",
                        a.dtype(),
                        dtype
                    )));
                }
                crate::ops::cast(a, dtype)
            }
            _ => Ok((*a).clone()),
        })
        .collect()
}

fn output_dtype(out: OutType, inputs: &[NArray]) -> Result<DType> {
    match out {
        OutType::Fixed(dtype) => Ok(dtype),
        OutType::SameAs(i) => inputs.get(i).map(NArray::dtype).ok_or_else(|| {
            NArrayError::Usage(format!("output dtype refers to missing input {i}"))
        }),
    }
}

fn check_output_dtypes(func: &NdFunc, inputs: &[NArray], outputs: &[&NArray]) -> Result<()> {
    for (o, (out, arg)) in outputs.iter().zip(&func.outputs).enumerate() {
        let dtype = output_dtype(arg.dtype, inputs)?;
        if out.dtype() != dtype {
            return Err(NArrayError::TypeError(format!(
                "output {o} has dtype {}, kernel produces {}",
                out.dtype(),
                dtype
            )));
        }
    }
    Ok(())
}

/// Shape of the outputs' loop part: the broadcast input loop shape with
/// reduced dimensions dropped or kept as extent 1.
fn output_loop_shape(func: &NdFunc, inputs: &[NArray], opts: &LoopOptions) -> Result<Vec<usize>> {
    let loop_parts = inputs
        .iter()
        .zip(&func.inputs)
        .map(|(a, arg)| {
            a.ndim()
                .checked_sub(arg.kernel_rank)
                .map(|r| &a.shape()[..r])
                .ok_or(NArrayError::RankMismatch(a.ndim(), arg.kernel_rank))
        })
        .collect::<Result<Vec<_>>>()?;
    let iter_shape = broadcast_shapes(&loop_parts)?;
    if let Some(&d) = opts.reduce.iter().find(|&&d| d >= iter_shape.len()) {
        return Err(NArrayError::Usage(format!(
            "reduce dimension {d} out of loop rank {}",
            iter_shape.len()
        )));
    }
    Ok(iter_shape
        .iter()
        .enumerate()
        .filter_map(|(d, &n)| match (opts.reduce.contains(&d), opts.keep_dims) {
            (false, _) => Some(n),
            (true, true) => Some(1),
            (true, false) => None,
        })
        .collect())
}

fn alloc_outputs(func: &NdFunc, inputs: &[NArray], opts: &LoopOptions) -> Result<Vec<NArray>> {
    let loop_shape = output_loop_shape(func, inputs, opts)?;
    let mut taken = vec![false; inputs.len()];
    let mut outputs = Vec::with_capacity(func.outputs.len());
    for arg in &func.outputs {
        let dtype = output_dtype(arg.dtype, inputs)?;
        let shape: Vec<usize> = loop_shape
            .iter()
            .chain(&arg.kernel_shape)
            .copied()
            .collect();

        let reuse = match arg.init {
            Some(_) => None,
            None => inputs.iter().enumerate().position(|(i, a)| {
                !taken[i] && a.is_inplace() && a.dtype() == dtype && a.shape() == &shape[..]
            }),
        };
        let out = match reuse {
            Some(i) => {
                taken[i] = true;
                if crate::config::debug_enabled() {
                    tracing::debug!(input = i, "reusing input as output");
                }
                inputs[i].clone()
            }
            None => {
                let out = NArray::zeros(dtype, &shape);
                if let Some(init) = arg.init {
                    fill(&out, &encode_f64(dtype, init)?)?;
                }
                out
            }
        };
        outputs.push(out);
    }
    Ok(outputs)
}

/// Set every element of a freshly allocated array to `elem`.
fn fill(array: &NArray, elem: &[u8]) -> Result<()> {
    let mut guard = array.buffer().try_write()?;
    for chunk in guard.bytes_mut().chunks_exact_mut(elem.len()) {
        chunk.copy_from_slice(elem);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::{InArg, LoopSupport, OutArg};
    use approx::assert_relative_eq;

    fn add_func() -> NdFunc {
        NdFunc::new(
            vec![
                InArg::new(Some(DType::Float64)),
                InArg::new(Some(DType::Float64)),
            ],
            vec![OutArg::new(DType::Float64)],
        )
    }

    fn add(ctx: &KernelContext<'_>) -> Result<()> {
        ctx.for_each(|offs| {
            let x: f64 = ctx.read(0, offs[0]);
            let y: f64 = ctx.read(1, offs[1]);
            ctx.write(2, offs[2], x + y);
            Ok(())
        })
    }

    #[test]
    fn test_broadcast_add() {
        let a = NArray::from_vec(&[3, 1], vec![1.0f64, 2.0, 3.0]).unwrap();
        let b = NArray::from_vec(&[1, 4], vec![10.0f64, 20.0, 30.0, 40.0]).unwrap();
        let out = ndloop(&add_func(), &[&a, &b], &LoopOptions::default(), add).unwrap();
        assert_eq!(out[0].shape(), &[3, 4]);
        let v = out[0].to_vec::<f64>().unwrap();
        assert_relative_eq!(v[0], 11.0);
        assert_relative_eq!(v[5], 22.0);
        assert_relative_eq!(v[11], 43.0);
    }

    #[test]
    fn test_inputs_are_cast() {
        let a = NArray::from_vec(&[2], vec![1i32, 2]).unwrap();
        let b = NArray::from_vec(&[2], vec![0.5f64, 0.25]).unwrap();
        let out = ndloop(&add_func(), &[&a, &b], &LoopOptions::default(), add).unwrap();
        assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![1.5, 2.25]);
    }

    #[test]
    fn test_written_input_is_never_cast() {
        let a = NArray::from_vec(&[2], vec![1i32, 2]).unwrap();
        let func = NdFunc::new(vec![InArg::new(Some(DType::Float64)).write()], vec![]);
        let err = ndloop(&func, &[&a], &LoopOptions::default(), |_| Ok(())).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Type);
    }

    #[test]
    fn test_reduce_with_init() {
        let a = NArray::from_vec(&[2, 3], vec![1.0f64, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        let func = NdFunc::new(
            vec![InArg::new(Some(DType::Float64))],
            vec![OutArg::new(DType::Float64).with_init(100.0)],
        );
        let opts = LoopOptions {
            reduce: vec![1],
            keep_dims: false,
        };
        let sum = |ctx: &KernelContext<'_>| {
            ctx.for_each(|offs| {
                let x: f64 = ctx.read(0, offs[0]);
                let acc: f64 = ctx.read(1, offs[1]);
                ctx.write(1, offs[1], acc + x);
                Ok(())
            })
        };
        let out = ndloop(&func, &[&a], &opts, sum).unwrap();
        assert_eq!(out[0].shape(), &[2]);
        assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![106.0, 115.0]);

        let opts = LoopOptions {
            reduce: vec![0],
            keep_dims: true,
        };
        let out = ndloop(&func, &[&a], &opts, sum).unwrap();
        assert_eq!(out[0].shape(), &[1, 3]);
        assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![105.0, 107.0, 109.0]);
    }

    #[test]
    fn test_inplace_reuses_first_eligible_input() {
        let a = NArray::from_vec(&[3], vec![1.0f64, 2.0, 3.0]).unwrap().inplace();
        let b = NArray::from_vec(&[3], vec![1.0f64, 1.0, 1.0]).unwrap().inplace();
        let out = ndloop(&add_func(), &[&a, &b], &LoopOptions::default(), add).unwrap();
        assert!(out[0].buffer().ptr_eq(a.buffer()));
        assert_eq!(a.to_vec::<f64>().unwrap(), vec![2.0, 3.0, 4.0]);
        assert_eq!(b.to_vec::<f64>().unwrap(), vec![1.0, 1.0, 1.0]);
    }

    #[test]
    fn test_inplace_requires_matching_shape() {
        let a = NArray::from_vec(&[1], vec![5.0f64]).unwrap().inplace();
        let b = NArray::from_vec(&[3], vec![1.0f64, 2.0, 3.0]).unwrap();
        let out = ndloop(&add_func(), &[&a, &b], &LoopOptions::default(), add).unwrap();
        assert!(!out[0].buffer().ptr_eq(a.buffer()));
        assert_eq!(out[0].to_vec::<f64>().unwrap(), vec![6.0, 7.0, 8.0]);
    }

    #[test]
    fn test_busy_operand_is_reported_and_released() {
        let a = NArray::from_vec(&[2], vec![1.0f64, 2.0]).unwrap();
        let b = NArray::from_vec(&[2], vec![1.0f64, 2.0]).unwrap();
        {
            let _held = b.buffer().try_write().unwrap();
            let err = ndloop(&add_func(), &[&a, &b], &LoopOptions::default(), add).unwrap_err();
            assert_eq!(err.kind(), crate::ErrorKind::Busy);
        }
        // `a` was released with the failed call.
        assert!(a.buffer().try_write().is_ok());
        assert!(ndloop(&add_func(), &[&a, &b], &LoopOptions::default(), add).is_ok());
    }

    #[test]
    fn test_ndloop_into_checks_dtype_and_broadcasts() {
        let src = NArray::from_vec(&[3], vec![1i16, 2, 3]).unwrap();
        let dst = NArray::zeros(DType::Int16, &[2, 3]);
        let func = NdFunc::new(vec![InArg::new(None)], vec![OutArg::same_as(0)])
            .with_support(LoopSupport::Strided);
        ndloop_into(&func, &[&src], &[&dst], &LoopOptions::default(), |ctx| {
            ctx.for_each(|offs| {
                let v: i16 = ctx.read(0, offs[0]);
                ctx.write(1, offs[1], v);
                Ok(())
            })
        })
        .unwrap();
        assert_eq!(dst.to_vec::<i16>().unwrap(), vec![1, 2, 3, 1, 2, 3]);

        let wrong = NArray::zeros(DType::Int32, &[3]);
        let err = ndloop_into(&func, &[&src], &[&wrong], &LoopOptions::default(), |_| Ok(()))
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Type);
    }
}
