//! Loop executor: walks a [`LoopPlan`] with an odometer and hands each
//! position to the kernel.

use std::ops::Range;

use smallvec::SmallVec;

use crate::buffer::{Intent, LockSet, RawBytes};
use crate::dtype::Element;
use crate::plan::{LoopPlan, PlanOperand};
use crate::stridx::Stridx;
use crate::{NArrayError, Result};

type Offsets = SmallVec<[usize; 8]>;

/// What a kernel sees on one invocation.
///
/// Offsets are byte offsets into the operand's buffer. Operands are numbered
/// inputs first, then outputs.
pub struct KernelContext<'a> {
    plan: &'a LoopPlan,
    raws: &'a [RawBytes],
    bases: &'a [usize],
}

impl<'a> KernelContext<'a> {
    #[inline]
    pub fn nargs(&self) -> usize {
        self.plan.operands.len()
    }

    /// Length of the run handed over in this invocation.
    #[inline]
    pub fn len(&self) -> usize {
        self.plan.inner_len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.plan.inner_len == 0
    }

    /// Byte offset of operand `arg`'s first element in this invocation.
    #[inline]
    pub fn offset(&self, arg: usize) -> usize {
        self.bases[arg]
    }

    /// How operand `arg` advances along the run.
    #[inline]
    pub fn step(&self, arg: usize) -> &Stridx {
        &self.plan.operands[arg].inner
    }

    /// Extents of the axes operand `arg` leaves to the kernel.
    #[inline]
    pub fn kernel_shape(&self, arg: usize) -> &[usize] {
        &self.plan.operands[arg].kernel_shape
    }

    #[inline]
    pub fn kernel_stridx(&self, arg: usize) -> &[Stridx] {
        &self.plan.operands[arg].kernel_stridx
    }

    /// Call `f` with every operand's offset, once per element of the run.
    pub fn for_each<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&[usize]) -> Result<()>,
    {
        let mut offs: Offsets = self.bases.iter().copied().collect();
        for k in 0..self.plan.inner_len {
            for (j, op) in self.plan.operands.iter().enumerate() {
                offs[j] = (self.bases[j] as isize + op.inner.offset_at(k)) as usize;
            }
            f(&offs)?;
        }
        Ok(())
    }

    fn operand(&self, arg: usize, off: usize, size: usize) -> (&PlanOperand, RawBytes) {
        let op = &self.plan.operands[arg];
        let raw = self.raws[arg];
        assert!(
            off + size <= raw.len,
            "offset {off} out of bounds for operand {arg} of {} bytes",
            raw.len
        );
        (op, raw)
    }

    /// Read one element of operand `arg` at byte offset `off`.
    ///
    /// # Panics
    /// Panics if `T` is not the operand's dtype or `off` is out of bounds.
    #[inline]
    pub fn read<T: Element>(&self, arg: usize, off: usize) -> T {
        let (op, raw) = self.operand(arg, off, std::mem::size_of::<T>());
        assert_eq!(T::DTYPE, op.dtype, "operand {arg} has dtype {}", op.dtype);
        // SAFETY: the range was bounds-checked and the buffer is locked for
        // the lifetime of the plan execution.
        unsafe { std::ptr::read_unaligned(raw.ptr.add(off) as *const T) }
    }

    /// Write one element of operand `arg` at byte offset `off`.
    ///
    /// # Panics
    /// Panics if `T` is not the operand's dtype, `off` is out of bounds, or
    /// the operand is not held with write intent.
    #[inline]
    pub fn write<T: Element>(&self, arg: usize, off: usize, value: T) {
        let (op, raw) = self.operand(arg, off, std::mem::size_of::<T>());
        assert_eq!(T::DTYPE, op.dtype, "operand {arg} has dtype {}", op.dtype);
        assert!(raw.writable, "operand {arg} is not writable");
        // SAFETY: as in `read`; the buffer is held under a write lock.
        unsafe { std::ptr::write_unaligned(raw.ptr.add(off) as *mut T, value) }
    }
}

/// Raw bytes of every operand, checked against the operand's intent.
pub(crate) fn operand_bytes(plan: &LoopPlan, locks: &LockSet<'_>) -> Result<Vec<RawBytes>> {
    plan.operands
        .iter()
        .enumerate()
        .map(|(j, op)| {
            let raw = locks.raw(&op.buffer)?;
            if op.intent == Intent::Write && !raw.writable {
                return Err(NArrayError::Internal(format!(
                    "operand {j} needs write access but was locked for reading"
                )));
            }
            Ok(raw)
        })
        .collect()
}

/// Run `kernel` over every position of `plan`.
///
/// Every buffer the plan touches must be held by `locks`.
pub fn execute<F>(plan: &LoopPlan, locks: &LockSet<'_>, mut kernel: F) -> Result<()>
where
    F: FnMut(&KernelContext<'_>) -> Result<()>,
{
    let raws = operand_bytes(plan, locks)?;
    let outer = plan.shape.first().copied().unwrap_or(1);
    run_block(plan, &raws, 0..outer, &mut kernel)
}

/// Odometer over the loop dimensions, restricted to `outer` on the
/// outermost one.
pub(crate) fn run_block<F>(
    plan: &LoopPlan,
    raws: &[RawBytes],
    outer: Range<usize>,
    kernel: &mut F,
) -> Result<()>
where
    F: FnMut(&KernelContext<'_>) -> Result<()>,
{
    if plan.is_empty() || outer.is_empty() {
        return Ok(());
    }
    let nargs = plan.operands.len();
    let nd = plan.shape.len();

    if nd == 0 {
        let bases: Offsets = plan.operands.iter().map(|op| op.base).collect();
        return kernel(&KernelContext {
            plan,
            raws,
            bases: &bases,
        });
    }

    // pos[j * (nd + 1) + d] is operand j's offset with loop dims 0..d applied.
    let stride = nd + 1;
    let mut pos = vec![0isize; nargs * stride];
    for (j, op) in plan.operands.iter().enumerate() {
        pos[j * stride] = op.base as isize;
    }
    let mut counter = vec![0usize; nd];
    counter[0] = outer.start;
    let mut bases: Offsets = SmallVec::from_elem(0, nargs);

    let mut d = 0;
    loop {
        for dd in d..nd {
            for (j, op) in plan.operands.iter().enumerate() {
                pos[j * stride + dd + 1] = pos[j * stride + dd] + op.steps[dd].offset_at(counter[dd]);
            }
        }
        for j in 0..nargs {
            bases[j] = pos[j * stride + nd] as usize;
        }
        kernel(&KernelContext {
            plan,
            raws,
            bases: &bases,
        })?;

        // Advance, carrying into outer dimensions.
        let mut dd = nd;
        loop {
            if dd == 0 {
                return Ok(());
            }
            dd -= 1;
            counter[dd] += 1;
            let end = if dd == 0 { outer.end } else { plan.shape[dd] };
            if counter[dd] < end {
                break;
            }
            counter[dd] = 0;
        }
        d = dd;
    }
}
