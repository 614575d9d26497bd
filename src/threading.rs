//! Rayon-based parallel execution of a loop plan.
//!
//! The outermost loop dimension is halved recursively with `rayon::join`
//! until a piece falls below the configured threshold; each piece then runs
//! the sequential odometer.

use std::ops::Range;

use crate::buffer::{Intent, RawBytes};
use crate::kernel::{run_block, KernelContext};
use crate::plan::{LoopPlan, PlanOperand};
use crate::stridx::Stridx;
use crate::Result;

/// Operand bytes shared by worker threads.
///
/// # Safety
/// Only plans accepted by [`can_split`] are shared: every written operand
/// touches disjoint bytes for distinct outermost positions, and any other
/// operand on a written buffer walks it with the same layout, so each byte
/// written by one worker is touched by no other worker.
#[derive(Clone, Copy)]
struct SharedBytes<'a>(&'a [RawBytes]);

unsafe impl Send for SharedBytes<'_> {}
unsafe impl Sync for SharedBytes<'_> {}

/// Whether `plan` can be split along its outermost loop dimension.
///
/// Every written operand must step along it with a plain stride larger than
/// the byte span one outermost position covers, and every other operand on
/// the same buffer must share its layout.
pub(crate) fn can_split(plan: &LoopPlan, min_len: usize) -> bool {
    match plan.shape.first() {
        Some(&outer) if outer > 1 && plan.len() >= min_len => plan
            .operands
            .iter()
            .enumerate()
            .filter(|(_, op)| op.intent == Intent::Write)
            .all(|(j, op)| writes_disjoint(plan, op) && aliases_agree(plan, j, op)),
        _ => false,
    }
}

/// Whether distinct outermost positions of `op` touch disjoint bytes.
fn writes_disjoint(plan: &LoopPlan, op: &PlanOperand) -> bool {
    let Some(step) = op.steps.first().and_then(Stridx::stride) else {
        return false;
    };
    let inner = op.steps[1..]
        .iter()
        .zip(&plan.shape[1..])
        .chain(std::iter::once((&op.inner, &plan.inner_len)))
        .chain(op.kernel_stridx.iter().zip(&op.kernel_shape));
    let mut span = 0isize;
    for (sdx, &n) in inner {
        match sdx.reach(n) {
            Ok((lo, hi)) => span = span.saturating_add(hi - lo),
            Err(_) => return false,
        }
    }
    step.unsigned_abs() > span.unsigned_abs().saturating_add(op.element_size() - 1)
}

/// Whether every other operand on `op`'s buffer is walked exactly like it.
fn aliases_agree(plan: &LoopPlan, j: usize, op: &PlanOperand) -> bool {
    plan.operands
        .iter()
        .enumerate()
        .filter(|&(k, other)| k != j && other.buffer.ptr_eq(&op.buffer))
        .all(|(_, other)| {
            other.base == op.base
                && other.element_size() == op.element_size()
                && other.steps == op.steps
                && other.inner == op.inner
                && other.kernel_shape == op.kernel_shape
                && other.kernel_stridx == op.kernel_stridx
        })
}

/// Run `kernel` over `plan` on the rayon pool.
pub(crate) fn execute_par<F>(
    plan: &LoopPlan,
    raws: &[RawBytes],
    min_len: usize,
    kernel: &F,
) -> Result<()>
where
    F: Fn(&KernelContext<'_>) -> Result<()> + Sync,
{
    let outer = plan.shape.first().copied().unwrap_or(1);
    let per_outer = plan.len() / outer.max(1);
    split(plan, SharedBytes(raws), 0..outer, per_outer, min_len, kernel)
}

fn split<F>(
    plan: &LoopPlan,
    shared: SharedBytes<'_>,
    range: Range<usize>,
    per_outer: usize,
    min_len: usize,
    kernel: &F,
) -> Result<()>
where
    F: Fn(&KernelContext<'_>) -> Result<()> + Sync,
{
    let len = range.len();
    if len <= 1 || len * per_outer <= min_len || rayon::current_num_threads() <= 1 {
        let mut k = kernel;
        return run_block(plan, shared.0, range, &mut k);
    }
    let mid = range.start + len / 2;
    let (left, right) = rayon::join(
        || split(plan, shared, range.start..mid, per_outer, min_len, kernel),
        || split(plan, shared, mid..range.end, per_outer, min_len, kernel),
    );
    left.and(right)
}
