//! Per-axis index expressions and their resolution against an axis size.

use std::ops::{Range, RangeFrom, RangeFull, RangeInclusive, RangeTo, RangeToInclusive};

use crate::array::NArray;
use crate::dtype::{convert, read_element, with_dtype};
use crate::{NArrayError, Result};

/// One per-axis index expression as written by the caller.
#[derive(Debug, Clone)]
pub enum IndexExpr {
    /// A single position; negative values count from the end.
    Int(isize),
    /// The whole axis.
    All,
    /// The whole axis in reverse order.
    Reverse,
    /// Insert a length-1 axis that does not consume a source axis.
    NewAxis,
    /// The whole axis, marked for accumulation by a consuming kernel.
    Reduce,
    /// Fill every axis not addressed by another expression with `All`.
    Rest,
    /// `begin..end` or `begin..=end`; negative ends count from the end.
    Range {
        begin: isize,
        end: isize,
        exclusive: bool,
    },
    /// A range enumerated with a step.
    StepRange {
        begin: isize,
        end: isize,
        exclusive: bool,
        step: isize,
    },
    /// Arithmetic sequence with optional parts.
    Step(StepSeq),
    /// Explicit positions; order and repetition are preserved.
    List(Vec<isize>),
    /// A 1-D integer array of positions.
    Array(NArray),
    /// Another selector whose axis is also marked for accumulation.
    Reduced(Box<IndexExpr>),
}

impl IndexExpr {
    /// Mark this selector's axis for accumulation.
    pub fn reduced(self) -> Self {
        IndexExpr::Reduced(Box::new(self))
    }
}

impl From<isize> for IndexExpr {
    fn from(i: isize) -> Self {
        IndexExpr::Int(i)
    }
}

impl From<i32> for IndexExpr {
    fn from(i: i32) -> Self {
        IndexExpr::Int(i as isize)
    }
}

impl From<usize> for IndexExpr {
    fn from(i: usize) -> Self {
        IndexExpr::Int(i as isize)
    }
}

impl From<RangeFull> for IndexExpr {
    fn from(_: RangeFull) -> Self {
        IndexExpr::All
    }
}

impl From<Range<isize>> for IndexExpr {
    fn from(r: Range<isize>) -> Self {
        IndexExpr::Range {
            begin: r.start,
            end: r.end,
            exclusive: true,
        }
    }
}

impl From<RangeInclusive<isize>> for IndexExpr {
    fn from(r: RangeInclusive<isize>) -> Self {
        IndexExpr::Range {
            begin: *r.start(),
            end: *r.end(),
            exclusive: false,
        }
    }
}

impl From<RangeFrom<isize>> for IndexExpr {
    fn from(r: RangeFrom<isize>) -> Self {
        IndexExpr::Range {
            begin: r.start,
            end: -1,
            exclusive: false,
        }
    }
}

impl From<RangeTo<isize>> for IndexExpr {
    fn from(r: RangeTo<isize>) -> Self {
        IndexExpr::Range {
            begin: 0,
            end: r.end,
            exclusive: true,
        }
    }
}

impl From<RangeToInclusive<isize>> for IndexExpr {
    fn from(r: RangeToInclusive<isize>) -> Self {
        IndexExpr::Range {
            begin: 0,
            end: r.end,
            exclusive: false,
        }
    }
}

impl From<Vec<isize>> for IndexExpr {
    fn from(v: Vec<isize>) -> Self {
        IndexExpr::List(v)
    }
}

impl From<&[isize]> for IndexExpr {
    fn from(v: &[isize]) -> Self {
        IndexExpr::List(v.to_vec())
    }
}

impl From<StepSeq> for IndexExpr {
    fn from(s: StepSeq) -> Self {
        IndexExpr::Step(s)
    }
}

impl From<NArray> for IndexExpr {
    fn from(a: NArray) -> Self {
        IndexExpr::Array(a)
    }
}

/// Lazy arithmetic sequence of positions.
///
/// Missing parts default from the axis: `begin` to the first position in the
/// walking direction, `end` to the last, `step` to 1. When `len` is given
/// without `step`, the step is derived so the sequence spans `begin..=end`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StepSeq {
    pub begin: Option<isize>,
    pub end: Option<isize>,
    pub step: Option<isize>,
    pub len: Option<usize>,
    pub exclusive: bool,
}

impl StepSeq {
    /// Sequence over the whole axis with step 1.
    pub fn new() -> Self {
        Self::default()
    }

    /// First position; negative values count from the end.
    pub fn begin(mut self, begin: isize) -> Self {
        self.begin = Some(begin);
        self
    }

    /// Last position, inclusive unless [`StepSeq::exclusive`] is set.
    pub fn end(mut self, end: isize) -> Self {
        self.end = Some(end);
        self
    }

    /// Distance between positions; negative walks backwards.
    pub fn step(mut self, step: isize) -> Self {
        self.step = Some(step);
        self
    }

    /// Number of positions.
    pub fn len(mut self, len: usize) -> Self {
        self.len = Some(len);
        self
    }

    /// Leave `end` out of the sequence.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Resolve to `(start, step, count)` on an axis of `size`.
    fn resolve(&self, size: usize) -> Result<(usize, isize, usize)> {
        let isize_n = size as isize;
        let range_error = || NArrayError::RangeError {
            begin: self.begin.unwrap_or(0),
            end: self.end.unwrap_or(isize_n - 1),
            exclusive: self.exclusive,
            size,
        };
        let wrap = |x: isize| if x < 0 { x + isize_n } else { x };
        let backward = self.step.is_some_and(|s| s < 0);
        let begin = self.begin.map(wrap).unwrap_or(if backward { isize_n - 1 } else { 0 });
        let mut end = self.end.map(wrap).unwrap_or(if backward { 0 } else { isize_n - 1 });
        if self.exclusive && self.end.is_some() {
            end = end.saturating_add(if end < begin { 1 } else { -1 });
        }

        let (step, count) = match (self.step, self.len) {
            (Some(0), _) => return Err(NArrayError::Usage("step can't be 0".into())),
            (Some(step), Some(len)) => (step, len),
            (Some(step), None) => (step, span_count(begin, end, step)),
            (None, Some(0)) => (1, 0),
            (None, Some(1)) => (1, 1),
            (None, Some(len)) => {
                let span = end.checked_sub(begin).ok_or_else(range_error)?;
                let gaps = isize::try_from(len - 1).map_err(|_| range_error())?;
                if span % gaps != 0 {
                    return Err(NArrayError::Usage(format!(
                        "{len} steps do not divide {begin}..={end} evenly"
                    )));
                }
                (span / gaps, len)
            }
            (None, None) => (1, span_count(begin, end, 1)),
        };

        if count > 0 {
            let last = isize::try_from(count - 1)
                .ok()
                .and_then(|gaps| step.checked_mul(gaps))
                .and_then(|delta| begin.checked_add(delta));
            match last {
                Some(last) if (0..isize_n).contains(&begin) && (0..isize_n).contains(&last) => {
                    Ok((begin as usize, step, count))
                }
                _ => Err(NArrayError::RangeError {
                    begin: self.begin.unwrap_or(begin),
                    end: self.end.or(last).unwrap_or(isize::MAX),
                    exclusive: self.exclusive,
                    size,
                }),
            }
        } else {
            Ok((0, step, 0))
        }
    }
}

/// `floor((end - begin) / step) + 1`, clamped at zero.
fn span_count(begin: isize, end: isize, step: isize) -> usize {
    let (a, b) = (end as i128 - begin as i128, step as i128);
    let mut q = a / b;
    if a % b != 0 && ((a < 0) != (b < 0)) {
        q -= 1;
    }
    usize::try_from((q + 1).max(0)).unwrap_or(usize::MAX)
}

/// A resolved per-axis selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AxisSelector {
    /// The whole axis of the given length.
    All(usize),
    /// One position; the axis collapses unless keep-dim mode is requested.
    Scalar(usize),
    /// `count` positions `start, start + step, ...`; `step` may be negative.
    Range { start: usize, step: isize, count: usize },
    /// Explicit positions.
    Explicit(Vec<usize>),
    /// A length-1 axis not present in the source.
    NewAxis,
}

impl AxisSelector {
    /// Number of positions selected.
    pub fn len(&self) -> usize {
        match self {
            AxisSelector::All(n) => *n,
            AxisSelector::Scalar(_) | AxisSelector::NewAxis => 1,
            AxisSelector::Range { count, .. } => *count,
            AxisSelector::Explicit(list) => list.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the selection yields an output axis outside keep-dim mode.
    pub fn keeps_axis(&self) -> bool {
        !matches!(self, AxisSelector::Scalar(_))
    }
}

/// Output of [`resolve`]: a selector plus the axis it reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAxis {
    pub selector: AxisSelector,
    /// The output axis is an accumulation target.
    pub reduce: bool,
    /// Source axis the selector applies to; `None` for inserted axes.
    pub orig_dim: Option<usize>,
}

fn check_position(pos: isize, size: usize, dim: usize) -> Result<usize> {
    let n = size as isize;
    let x = if pos < 0 { pos + n } else { pos };
    if x < 0 || x >= n {
        return Err(NArrayError::OutOfRange {
            index: pos,
            dim,
            size,
        });
    }
    Ok(x as usize)
}

fn resolve_range(
    begin: isize,
    end: isize,
    exclusive: bool,
    step: isize,
    size: usize,
) -> Result<AxisSelector> {
    if step == 0 {
        return Err(NArrayError::Usage("step can't be 0".into()));
    }
    let n = size as isize;
    let b = if begin < 0 { begin + n } else { begin };
    let mut e = if end < 0 { end + n } else { end };
    if exclusive {
        e -= 1;
    }
    if b < 0 || b >= n || e < 0 || e >= n {
        return Err(NArrayError::RangeError {
            begin,
            end,
            exclusive,
            size,
        });
    }
    Ok(AxisSelector::Range {
        start: b as usize,
        step,
        count: span_count(b, e, step),
    })
}

/// Read a 1-D integer array into host positions.
fn array_positions(array: &NArray) -> Result<Vec<isize>> {
    if array.ndim() != 1 {
        return Err(NArrayError::TypeError(format!(
            "array index should be 1-d, got rank {}",
            array.ndim()
        )));
    }
    let buffer = array.buffer();
    buffer.synchronize()?;
    let guard = buffer.try_read()?;
    let bytes = guard.bytes();
    with_dtype!(array.dtype(), T => {
        array
            .offsets()
            .map(|off| convert::<T, i64>(read_element::<T>(bytes, off)).map(|v| v as isize))
            .collect()
    })
}

/// Resolve one expression against source axis `dim` of length `size`.
///
/// `Rest` cannot be resolved on its own; see [`resolve_args`].
pub fn resolve(expr: &IndexExpr, size: usize, dim: usize) -> Result<ResolvedAxis> {
    let axis = |selector| ResolvedAxis {
        selector,
        reduce: false,
        orig_dim: Some(dim),
    };
    let resolved = match expr {
        IndexExpr::Int(i) => axis(AxisSelector::Scalar(check_position(*i, size, dim)?)),
        IndexExpr::All => axis(AxisSelector::All(size)),
        IndexExpr::Reverse => axis(AxisSelector::Range {
            start: size.saturating_sub(1),
            step: -1,
            count: size,
        }),
        IndexExpr::NewAxis => ResolvedAxis {
            selector: AxisSelector::NewAxis,
            reduce: false,
            orig_dim: None,
        },
        IndexExpr::Reduce => ResolvedAxis {
            reduce: true,
            ..axis(AxisSelector::All(size))
        },
        IndexExpr::Rest => {
            return Err(NArrayError::Usage(
                "rest marker must be expanded against the full index".into(),
            ))
        }
        IndexExpr::Range {
            begin,
            end,
            exclusive,
        } => axis(resolve_range(*begin, *end, *exclusive, 1, size)?),
        IndexExpr::StepRange {
            begin,
            end,
            exclusive,
            step,
        } => axis(resolve_range(*begin, *end, *exclusive, *step, size)?),
        IndexExpr::Step(seq) => {
            let (start, step, count) = seq.resolve(size)?;
            axis(AxisSelector::Range { start, step, count })
        }
        IndexExpr::List(list) => axis(AxisSelector::Explicit(
            list.iter()
                .map(|&x| check_position(x, size, dim))
                .collect::<Result<_>>()?,
        )),
        IndexExpr::Array(array) => axis(AxisSelector::Explicit(
            array_positions(array)?
                .into_iter()
                .map(|x| check_position(x, size, dim))
                .collect::<Result<_>>()?,
        )),
        IndexExpr::Reduced(inner) => match inner.as_ref() {
            IndexExpr::Int(_)
            | IndexExpr::NewAxis
            | IndexExpr::Rest
            | IndexExpr::Reduce
            | IndexExpr::Reduced(_) => {
                return Err(NArrayError::Usage(format!(
                    "reduce marker cannot be combined with {inner:?}"
                )))
            }
            other => ResolvedAxis {
                reduce: true,
                ..resolve(other, size, dim)?
            },
        },
    };
    Ok(resolved)
}

/// Number of output axes produced by a full index expression, or the
/// index-count error.
pub(crate) fn check_index_count(args: &[IndexExpr], ndim: usize) -> Result<usize> {
    let count_rest = args.iter().filter(|a| matches!(a, IndexExpr::Rest)).count();
    let count_new = args.iter().filter(|a| matches!(a, IndexExpr::NewAxis)).count();
    if count_rest > 1 {
        return Err(NArrayError::Usage(
            "multiple rest-dimension is not allowed".into(),
        ));
    }
    let result_nd = ndim + count_new;
    let given = args.len();
    if count_rest == 0 {
        if count_new == 0 && given == 1 {
            return Ok(1);
        }
        if given == result_nd {
            return Ok(result_nd);
        }
    } else if given - 1 <= result_nd {
        return Ok(result_nd);
    }
    Err(NArrayError::IndexCount {
        given,
        ndim,
        rest: count_rest == 1,
    })
}

/// Resolve a full index expression against a source shape.
///
/// `Rest` expands to as many `All` selectors as needed to address every
/// source axis. The expression count must match the rank plus inserted axes.
pub fn resolve_args(shape: &[usize], args: &[IndexExpr]) -> Result<Vec<ResolvedAxis>> {
    let count_new = args.iter().filter(|a| matches!(a, IndexExpr::NewAxis)).count();
    let has_rest = args.iter().any(|a| matches!(a, IndexExpr::Rest));
    let result_nd = shape.len() + count_new;
    check_index_count(args, shape.len())?;
    // A lone expression on a rank>1 source passes the count check but must be
    // applied to the flattened source first.
    if !has_rest && args.len() != result_nd {
        return Err(NArrayError::IndexCount {
            given: args.len(),
            ndim: shape.len(),
            rest: has_rest,
        });
    }

    let mut axes = Vec::with_capacity(result_nd);
    let mut k = 0;
    for arg in args {
        match arg {
            IndexExpr::Rest => {
                for _ in 0..result_nd + 1 - args.len() {
                    axes.push(resolve(&IndexExpr::All, shape[k], k)?);
                    k += 1;
                }
            }
            IndexExpr::NewAxis => axes.push(resolve(arg, 1, k)?),
            _ => {
                axes.push(resolve(arg, shape[k], k)?);
                k += 1;
            }
        }
    }

    if crate::config::debug_enabled() {
        for (i, q) in axes.iter().enumerate() {
            tracing::debug!(
                axis = i,
                n = q.selector.len(),
                selector = ?q.selector,
                reduce = q.reduce,
                orig_dim = ?q.orig_dim,
                "resolved index argument"
            );
        }
    }
    Ok(axes)
}
