//! Loop planning.
//!
//! Broadcasts every operand of a kernel call to one iteration space, then
//! records for each operand how it is walked along every loop dimension:
//! a byte step (0 for a broadcast axis) or an explicit offset list. Loop
//! dimensions are simplified (extent-1 dims dropped, contiguous dims fused)
//! and, when the kernel supports it, the innermost one is handed to the
//! kernel as a single run.

use crate::array::NArray;
use crate::broadcast::merge_extent;
use crate::buffer::{Buffer, Intent};
use crate::dtype::DType;
use crate::fuse::fuse_steps;
use crate::stridx::Stridx;
use crate::{NArrayError, Result};

/// Access patterns a kernel can consume in one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LoopSupport {
    /// One element per invocation.
    #[default]
    Element,
    /// A run of densely packed elements.
    Contiguous,
    /// A run with an arbitrary byte stride per operand.
    Strided,
    /// A run with arbitrary strides or explicit offset lists.
    Gathered,
}

/// Input operand description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InArg {
    /// Required dtype; the input is cast when it differs. `None` accepts any.
    pub dtype: Option<DType>,
    /// Number of trailing axes the kernel consumes itself.
    pub kernel_rank: usize,
    pub intent: Intent,
}

impl InArg {
    /// Read-only input with no kernel axes; `dtype` of `None` accepts any.
    pub fn new(dtype: Option<DType>) -> Self {
        Self {
            dtype,
            kernel_rank: 0,
            intent: Intent::Read,
        }
    }

    /// Leave the trailing `kernel_rank` axes to the kernel.
    pub fn with_kernel_rank(mut self, kernel_rank: usize) -> Self {
        self.kernel_rank = kernel_rank;
        self
    }

    /// The kernel writes through this input.
    pub fn write(mut self) -> Self {
        self.intent = Intent::Write;
        self
    }
}

/// How an output's dtype is chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutType {
    Fixed(DType),
    /// Same dtype as the input at this position, after casting.
    SameAs(usize),
}

/// Output operand description.
#[derive(Debug, Clone, PartialEq)]
pub struct OutArg {
    pub dtype: OutType,
    /// Trailing axes the kernel produces itself.
    pub kernel_shape: Vec<usize>,
    /// Value every element is set to before the loop runs.
    pub init: Option<f64>,
}

impl OutArg {
    /// Output of a fixed dtype.
    pub fn new(dtype: DType) -> Self {
        Self {
            dtype: OutType::Fixed(dtype),
            kernel_shape: Vec::new(),
            init: None,
        }
    }

    /// Output with the dtype of input `input`.
    pub fn same_as(input: usize) -> Self {
        Self {
            dtype: OutType::SameAs(input),
            kernel_shape: Vec::new(),
            init: None,
        }
    }

    pub fn with_kernel_shape(mut self, kernel_shape: Vec<usize>) -> Self {
        self.kernel_shape = kernel_shape;
        self
    }

    /// Fill the output with `init` before the loop; reduction outputs start here.
    pub fn with_init(mut self, init: f64) -> Self {
        self.init = Some(init);
        self
    }
}

/// Description of a kernel and its operands.
#[derive(Debug, Clone, PartialEq)]
pub struct NdFunc {
    pub inputs: Vec<InArg>,
    pub outputs: Vec<OutArg>,
    pub support: LoopSupport,
}

impl NdFunc {
    /// Element-at-a-time kernel over `inputs` producing `outputs`.
    pub fn new(inputs: Vec<InArg>, outputs: Vec<OutArg>) -> Self {
        Self {
            inputs,
            outputs,
            support: LoopSupport::Element,
        }
    }

    pub fn with_support(mut self, support: LoopSupport) -> Self {
        self.support = support;
        self
    }

    fn has_kernel_dims(&self) -> bool {
        self.inputs.iter().any(|a| a.kernel_rank > 0)
            || self.outputs.iter().any(|a| !a.kernel_shape.is_empty())
    }
}

/// Per-call loop options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoopOptions {
    /// Loop dimensions accumulated into the outputs.
    pub reduce: Vec<usize>,
    /// Keep reduced dimensions in the outputs as extent 1.
    pub keep_dims: bool,
}

impl LoopOptions {
    /// Reduce over the axes an index expression marked on `array`.
    ///
    /// Axis numbers are taken as loop dimensions, which holds when `array`
    /// has the highest loop rank among the inputs.
    pub fn reduce_marked(array: &NArray) -> Self {
        Self {
            reduce: array.reduce_axes(),
            keep_dims: false,
        }
    }
}

/// How one operand is walked.
#[derive(Debug, Clone)]
pub struct PlanOperand {
    pub dtype: DType,
    pub intent: Intent,
    /// Byte offset of the first element visited.
    pub base: usize,
    /// One descriptor per loop dimension.
    pub steps: Vec<Stridx>,
    /// Descriptor of the run handed to the kernel.
    pub inner: Stridx,
    /// Extents of the axes the kernel consumes itself.
    pub kernel_shape: Vec<usize>,
    pub kernel_stridx: Vec<Stridx>,
    pub(crate) buffer: Buffer,
}

impl PlanOperand {
    #[inline]
    pub fn element_size(&self) -> usize {
        self.dtype.size()
    }
}

/// Complete traversal plan of one kernel call.
#[derive(Debug, Clone)]
pub struct LoopPlan {
    /// Broadcast iteration shape, before simplification.
    pub iter_shape: Vec<usize>,
    /// Loop dimensions walked by the executor.
    pub shape: Vec<usize>,
    /// Length of the run handed to the kernel per invocation.
    pub inner_len: usize,
    /// Inputs first, then outputs.
    pub operands: Vec<PlanOperand>,
}

impl LoopPlan {
    /// Number of kernel elements visited.
    pub fn len(&self) -> usize {
        self.shape.iter().product::<usize>() * self.inner_len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loop dimension of each operand axis, for the axes in front of the
/// kernel axes.
fn loop_axes(rank: usize, loop_nd: usize) -> impl Iterator<Item = (usize, usize)> {
    (0..rank).map(move |a| (a, loop_nd - rank + a))
}

/// Plan a kernel call over `inputs` writing `outputs`.
///
/// Inputs and outputs must already have the dtypes the kernel expects.
pub fn plan(
    func: &NdFunc,
    inputs: &[&NArray],
    outputs: &[&NArray],
    opts: &LoopOptions,
) -> Result<LoopPlan> {
    if inputs.len() != func.inputs.len() || outputs.len() != func.outputs.len() {
        return Err(NArrayError::Usage(format!(
            "kernel takes {} inputs and {} outputs, got {} and {}",
            func.inputs.len(),
            func.outputs.len(),
            inputs.len(),
            outputs.len()
        )));
    }

    let in_loop_ranks = inputs
        .iter()
        .zip(&func.inputs)
        .map(|(a, arg)| {
            a.ndim()
                .checked_sub(arg.kernel_rank)
                .ok_or(NArrayError::RankMismatch(a.ndim(), arg.kernel_rank))
        })
        .collect::<Result<Vec<_>>>()?;
    let out_loop_ranks = outputs
        .iter()
        .zip(&func.outputs)
        .map(|(a, arg)| {
            let rank = a.ndim().checked_sub(arg.kernel_shape.len());
            match rank {
                Some(r) if a.shape()[r..] == arg.kernel_shape[..] => Ok(r),
                Some(r) => Err(NArrayError::Usage(format!(
                    "output kernel shape {:?} does not match {:?}",
                    &a.shape()[r..],
                    arg.kernel_shape
                ))),
                None => Err(NArrayError::RankMismatch(a.ndim(), arg.kernel_shape.len())),
            }
        })
        .collect::<Result<Vec<_>>>()?;

    let loop_nd = in_loop_ranks
        .iter()
        .chain(&out_loop_ranks)
        .copied()
        .max()
        .unwrap_or(0);

    let mut reduce = vec![false; loop_nd];
    for &d in &opts.reduce {
        if d >= loop_nd {
            return Err(NArrayError::Usage(format!(
                "reduce dimension {d} out of loop rank {loop_nd}"
            )));
        }
        reduce[d] = true;
    }
    let kept: Vec<usize> = (0..loop_nd).filter(|&d| !reduce[d]).collect();

    // Loop dimension of every loop axis, per operand.
    let mut mapping: Vec<Vec<(usize, usize)>> = Vec::with_capacity(inputs.len() + outputs.len());
    for &lr in &in_loop_ranks {
        mapping.push(loop_axes(lr, loop_nd).collect());
    }
    for &lr in &out_loop_ranks {
        if opts.keep_dims {
            mapping.push(loop_axes(lr, loop_nd).collect());
        } else {
            if lr > kept.len() {
                return Err(NArrayError::RankMismatch(lr, kept.len()));
            }
            let lead = kept.len() - lr;
            mapping.push((0..lr).map(|a| (a, kept[lead + a])).collect());
        }
    }

    let arrays: Vec<&NArray> = inputs.iter().chain(outputs).copied().collect();
    let mut iter_shape = vec![1usize; loop_nd];
    for (array, axes) in arrays.iter().zip(&mapping) {
        for &(a, d) in axes {
            merge_extent(&mut iter_shape[d], array.shape()[a], d)?;
        }
    }

    let mut bases = Vec::with_capacity(arrays.len());
    let mut all_steps = Vec::with_capacity(arrays.len());
    for (array, axes) in arrays.iter().zip(&mapping) {
        let mut base = array.offset() as isize;
        let mut steps = vec![Stridx::Stride(0); loop_nd];
        for &(a, d) in axes {
            let sdx = array.stridx(a);
            if array.shape()[a] == 1 {
                base += sdx.offset_at(0);
            } else {
                steps[d] = sdx;
            }
        }
        bases.push(base);
        all_steps.push(steps);
    }

    let fused = fuse_steps(&iter_shape, &all_steps);
    let mut shape = fused.dims;
    let mut steps = fused.steps;

    let mut inner_len = 1;
    let mut inner: Vec<Stridx> = vec![Stridx::Stride(0); arrays.len()];
    if !func.has_kernel_dims() && !shape.is_empty() {
        let last = shape.len() - 1;
        let fold = match func.support {
            LoopSupport::Element => false,
            LoopSupport::Contiguous => arrays
                .iter()
                .zip(&steps)
                .all(|(a, op)| op[last] == Stridx::Stride(a.element_size() as isize)),
            LoopSupport::Strided => steps.iter().all(|op| !op[last].is_index()),
            LoopSupport::Gathered => true,
        };
        if fold {
            inner_len = shape[last];
            shape.truncate(last);
            for (op, slot) in steps.iter_mut().zip(inner.iter_mut()) {
                if let Some(sdx) = op.pop() {
                    *slot = sdx;
                }
            }
        }
    }

    let intents = func
        .inputs
        .iter()
        .map(|a| a.intent)
        .chain(func.outputs.iter().map(|_| Intent::Write));
    let mut operands = Vec::with_capacity(arrays.len());
    for (j, (((array, op_steps), op_inner), intent)) in arrays
        .iter()
        .zip(steps)
        .zip(inner)
        .zip(intents)
        .enumerate()
    {
        let base = bases[j] + fused.base_delta[j];
        let base = usize::try_from(base)
            .map_err(|_| NArrayError::Internal(format!("operand {j} has negative base {base}")))?;
        let lr = mapping[j].len();
        operands.push(PlanOperand {
            dtype: array.dtype(),
            intent,
            base,
            steps: op_steps,
            inner: op_inner,
            kernel_shape: array.shape()[lr..].to_vec(),
            kernel_stridx: (lr..array.ndim()).map(|a| array.stridx(a)).collect(),
            buffer: array.buffer().clone(),
        });
    }

    let plan = LoopPlan {
        iter_shape,
        shape,
        inner_len,
        operands,
    };
    validate_bounds(&plan)?;

    if crate::config::debug_enabled() {
        tracing::debug!(
            iter_shape = ?plan.iter_shape,
            loop_shape = ?plan.shape,
            inner_len = plan.inner_len,
            support = ?func.support,
            "loop plan"
        );
        for (j, op) in plan.operands.iter().enumerate() {
            tracing::debug!(
                operand = j,
                dtype = %op.dtype,
                intent = ?op.intent,
                base = op.base,
                steps = ?op.steps,
                inner = ?op.inner,
                kernel_shape = ?op.kernel_shape,
                "loop plan operand"
            );
        }
    }
    Ok(plan)
}

/// Check that every byte an operand can reach lies inside its buffer.
fn validate_bounds(plan: &LoopPlan) -> Result<()> {
    if plan.is_empty() {
        return Ok(());
    }
    for (j, op) in plan.operands.iter().enumerate() {
        if op.kernel_shape.contains(&0) {
            continue;
        }
        let mut lo = op.base as isize;
        let mut hi = op.base as isize;
        let dims = plan
            .shape
            .iter()
            .zip(&op.steps)
            .chain(std::iter::once((&plan.inner_len, &op.inner)))
            .chain(op.kernel_shape.iter().zip(&op.kernel_stridx));
        for (&n, sdx) in dims {
            let (min, max) = sdx.reach(n)?;
            lo += min;
            hi += max;
        }
        let end = hi + op.element_size() as isize;
        if lo < 0 || end > op.buffer.len() as isize {
            return Err(NArrayError::Internal(format!(
                "operand {j} reaches bytes {lo}..{end} outside a buffer of {} bytes",
                op.buffer.len()
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IndexExpr;

    fn f64_func(nin: usize) -> NdFunc {
        NdFunc::new(
            vec![InArg::new(Some(DType::Float64)); nin],
            vec![OutArg::new(DType::Float64)],
        )
    }

    #[test]
    fn test_broadcast_steps() {
        let a = NArray::zeros(DType::Float64, &[3, 1]);
        let b = NArray::zeros(DType::Float64, &[1, 4]);
        let c = NArray::zeros(DType::Float64, &[3, 4]);
        let p = plan(&f64_func(2), &[&a, &b], &[&c], &LoopOptions::default()).unwrap();
        assert_eq!(p.iter_shape, vec![3, 4]);
        assert_eq!(p.shape, vec![3, 4]);
        assert_eq!(p.operands[0].steps, vec![Stridx::Stride(8), Stridx::Stride(0)]);
        assert_eq!(p.operands[1].steps, vec![Stridx::Stride(0), Stridx::Stride(8)]);
        assert_eq!(p.operands[2].steps, vec![Stridx::Stride(32), Stridx::Stride(8)]);
        assert_eq!(p.len(), 12);
    }

    #[test]
    fn test_shape_mismatch() {
        let a = NArray::zeros(DType::Float64, &[2, 3]);
        let b = NArray::zeros(DType::Float64, &[4, 3]);
        let c = NArray::zeros(DType::Float64, &[2, 3]);
        let err = plan(&f64_func(2), &[&a, &b], &[&c], &LoopOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Shape);
    }

    #[test]
    fn test_contiguous_fast_path_folds_everything() {
        let a = NArray::zeros(DType::Float64, &[2, 3, 4]);
        let c = NArray::zeros(DType::Float64, &[2, 3, 4]);
        let func = f64_func(1).with_support(LoopSupport::Contiguous);
        let p = plan(&func, &[&a], &[&c], &LoopOptions::default()).unwrap();
        assert!(p.shape.is_empty());
        assert_eq!(p.inner_len, 24);
        assert_eq!(p.operands[0].inner, Stridx::Stride(8));
    }

    #[test]
    fn test_classification_by_support() {
        let src = NArray::from_vec(&[4], vec![1.0f64, 2.0, 3.0, 4.0]).unwrap();
        let gathered = src.aref(&[IndexExpr::List(vec![3, 1, 0])]).unwrap();
        let rev = src.aref(&[IndexExpr::from(0isize..3)]).unwrap();
        let rev = rev.aref(&[IndexExpr::Reverse]).unwrap();
        let c = NArray::zeros(DType::Float64, &[3]);

        let strided = f64_func(1).with_support(LoopSupport::Strided);
        let p = plan(&strided, &[&gathered], &[&c], &LoopOptions::default()).unwrap();
        assert_eq!(p.shape, vec![3]);
        assert_eq!(p.inner_len, 1);
        let p = plan(&strided, &[&rev], &[&c], &LoopOptions::default()).unwrap();
        assert!(p.shape.is_empty());
        assert_eq!(p.operands[0].inner, Stridx::Stride(-8));

        let contiguous = f64_func(1).with_support(LoopSupport::Contiguous);
        let p = plan(&contiguous, &[&rev], &[&c], &LoopOptions::default()).unwrap();
        assert_eq!(p.shape, vec![3]);

        let any = f64_func(1).with_support(LoopSupport::Gathered);
        let p = plan(&any, &[&gathered], &[&c], &LoopOptions::default()).unwrap();
        assert!(p.shape.is_empty());
        assert!(p.operands[0].inner.is_index());
    }

    #[test]
    fn test_reduce_dims_map_outputs() {
        let a = NArray::zeros(DType::Float64, &[2, 3]);
        let sum = NArray::zeros(DType::Float64, &[2]);
        let opts = LoopOptions {
            reduce: vec![1],
            keep_dims: false,
        };
        let p = plan(&f64_func(1), &[&a], &[&sum], &opts).unwrap();
        assert_eq!(p.iter_shape, vec![2, 3]);
        assert_eq!(p.operands[1].steps, vec![Stridx::Stride(8), Stridx::Stride(0)]);

        let kept = NArray::zeros(DType::Float64, &[2, 1]);
        let opts = LoopOptions {
            reduce: vec![1],
            keep_dims: true,
        };
        let p = plan(&f64_func(1), &[&a], &[&kept], &opts).unwrap();
        assert_eq!(p.operands[1].steps, vec![Stridx::Stride(8), Stridx::Stride(0)]);
    }

    #[test]
    fn test_kernel_rank_keeps_axes_for_kernel() {
        let a = NArray::zeros(DType::Float64, &[5, 3]);
        let c = NArray::zeros(DType::Float64, &[5]);
        let func = NdFunc::new(
            vec![InArg::new(Some(DType::Float64)).with_kernel_rank(1)],
            vec![OutArg::new(DType::Float64)],
        )
        .with_support(LoopSupport::Gathered);
        let p = plan(&func, &[&a], &[&c], &LoopOptions::default()).unwrap();
        assert_eq!(p.shape, vec![5]);
        assert_eq!(p.inner_len, 1);
        assert_eq!(p.operands[0].kernel_shape, vec![3]);
        assert_eq!(p.operands[0].kernel_stridx, vec![Stridx::Stride(8)]);
        assert_eq!(p.operands[0].steps, vec![Stridx::Stride(24)]);
    }

    #[test]
    fn test_rank_below_kernel_rank() {
        let a = NArray::zeros(DType::Float64, &[3]);
        let c = NArray::zeros(DType::Float64, &[]);
        let func = NdFunc::new(
            vec![InArg::new(None).with_kernel_rank(2)],
            vec![OutArg::new(DType::Float64)],
        );
        let err = plan(&func, &[&a], &[&c], &LoopOptions::default()).unwrap_err();
        assert!(matches!(err, NArrayError::RankMismatch(1, 2)));
    }

    #[test]
    fn test_bounds_violation_is_internal() {
        let a = NArray::zeros(DType::Float64, &[2]);
        let bad = NArray::view(
            DType::Float64,
            &[3],
            a.buffer().clone(),
            vec![Stridx::Stride(8)],
            0,
        );
        let c = NArray::zeros(DType::Float64, &[3]);
        let err = plan(&f64_func(1), &[&bad], &[&c], &LoopOptions::default()).unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::Internal);
    }
}
