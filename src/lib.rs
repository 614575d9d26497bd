//! Indexing and loop engine for strided N-dimensional arrays.
//!
//! This crate provides the two pieces of an N-dimensional array library that
//! deal with memory access patterns rather than arithmetic:
//!
//! - an **indexing engine** that resolves per-axis index expressions
//!   (integers, ranges with step, explicit index lists, reduce markers,
//!   new axes, rest markers) into a zero-copy [`NArray`] view sharing the
//!   source buffer, and
//! - a **loop engine** ([`ndloop`]) that broadcasts any number of operands
//!   to a common iteration shape, plans per-operand strided or gathered
//!   traversal, and drives a user kernel over it.
//!
//! # Core Types
//!
//! - [`NArray`]: An owned contiguous array or a view over another array's buffer
//! - [`Stridx`]: Per-axis descriptor, either a byte stride or a list of byte offsets
//! - [`IndexExpr`]: One per-axis index expression as written by the caller
//! - [`NdFunc`]: Kernel description (operand dtypes, kernel ranks, loop support)
//! - [`KernelContext`]: What a kernel sees on every invocation
//!
//! # Indexing Example
//!
//! ```rust
//! use strided_narray::{IndexExpr, NArray};
//!
//! let a = NArray::from_vec(&[2, 3], vec![0i32, 1, 2, 3, 4, 5]).unwrap();
//!
//! // Second row, every column.
//! let row = a.aref(&[IndexExpr::Int(1), IndexExpr::All]).unwrap();
//! assert_eq!(row.shape(), &[3]);
//! assert_eq!(row.to_vec::<i32>().unwrap(), vec![3, 4, 5]);
//!
//! // Reverse the columns of every row.
//! let rev = a.aref(&[IndexExpr::All, IndexExpr::Reverse]).unwrap();
//! assert_eq!(rev.to_vec::<i32>().unwrap(), vec![2, 1, 0, 5, 4, 3]);
//! ```
//!
//! # Loop Example
//!
//! ```rust
//! use strided_narray::{ndloop, DType, InArg, LoopOptions, NArray, NdFunc, OutArg};
//!
//! let a = NArray::from_vec(&[3, 1], vec![1.0f64, 2.0, 3.0]).unwrap();
//! let b = NArray::from_vec(&[1, 4], vec![10.0f64, 20.0, 30.0, 40.0]).unwrap();
//!
//! let func = NdFunc::new(
//!     vec![InArg::new(Some(DType::Float64)), InArg::new(Some(DType::Float64))],
//!     vec![OutArg::new(DType::Float64)],
//! );
//! let out = ndloop(&func, &[&a, &b], &LoopOptions::default(), |ctx| {
//!     ctx.for_each(|offs| {
//!         let x: f64 = ctx.read(0, offs[0]);
//!         let y: f64 = ctx.read(1, offs[1]);
//!         ctx.write(2, offs[2], x + y);
//!         Ok(())
//!     })
//! })
//! .unwrap();
//!
//! assert_eq!(out[0].shape(), &[3, 4]);
//! ```

mod array;
mod broadcast;
mod buffer;
mod compose;
pub mod config;
mod dtype;
mod fuse;
mod index;
mod kernel;
mod ndloop;
mod ops;
mod plan;
mod stridx;
#[cfg(feature = "parallel")]
mod threading;

// ============================================================================
// Arrays and storage
// ============================================================================
pub use array::{NArray, OffsetIter};
pub use buffer::{Buffer, DeviceSync, Intent, LockSet};
pub use dtype::{DType, Element};
pub use stridx::{row_major_strides, Stridx};

// ============================================================================
// Indexing
// ============================================================================
pub use compose::compose;
pub use index::{resolve, resolve_args, AxisSelector, IndexExpr, ResolvedAxis, StepSeq};

// ============================================================================
// Loop engine
// ============================================================================
pub use broadcast::{broadcast_shape, broadcast_shapes};
pub use kernel::{execute, KernelContext};
pub use ndloop::{ndloop, ndloop_into};
#[cfg(feature = "parallel")]
pub use ndloop::ndloop_par;
pub use plan::{
    plan, InArg, LoopOptions, LoopPlan, LoopSupport, NdFunc, OutArg, OutType, PlanOperand,
};

// ============================================================================
// Operations built on the engine
// ============================================================================
pub use ops::{cast, copy, store};

// ============================================================================
// Error types
// ============================================================================

/// Category of an [`NArrayError`], independent of the details it carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// A position lies outside `[0, size)` after negative-index normalization.
    OutOfRange,
    /// A range endpoint lies outside the axis.
    Range,
    /// Unsupported index expression or a failed dtype cast.
    Type,
    /// Incompatible shapes or a wrong number of index expressions.
    Shape,
    /// The call is malformed (several rest markers, bad reduce combination, ...).
    Usage,
    /// A buffer is held by another call with a conflicting intent.
    Busy,
    /// The kernel reported a failure.
    Kernel,
    /// A bookkeeping invariant of this crate was broken.
    Internal,
}

/// Errors that can occur during indexing and loop operations.
#[derive(Debug, thiserror::Error)]
pub enum NArrayError {
    /// Scalar or list position outside the axis.
    #[error("index={index} out of shape[{dim}]={size}")]
    OutOfRange { index: isize, dim: usize, size: usize },

    /// Range endpoints outside the axis.
    #[error("{begin}{}{end} is out of range for size={size}", range_dots(.exclusive))]
    RangeError {
        begin: isize,
        end: isize,
        exclusive: bool,
        size: usize,
    },

    /// Unsupported index expression or failed cast.
    #[error("{0}")]
    TypeError(String),

    /// Two extents that must agree do not.
    #[error("shape1[{dim}](={expected}) != shape2[{dim}](={found})")]
    ShapeMismatch {
        dim: usize,
        expected: usize,
        found: usize,
    },

    /// Wrong number of index expressions for the source rank.
    #[error("# of index(={given}) {} ndim(={ndim})", count_relation(.rest))]
    IndexCount { given: usize, ndim: usize, rest: bool },

    /// Array ranks do not match.
    #[error("rank mismatch: {0} vs {1}")]
    RankMismatch(usize, usize),

    /// Malformed call.
    #[error("{0}")]
    Usage(String),

    /// A buffer could not be acquired without waiting.
    #[error("buffer is in use by another operation")]
    Busy,

    /// Error raised from inside a kernel.
    #[error("kernel failed: {0}")]
    Kernel(String),

    /// Internal bookkeeping failure; indicates a bug in this crate.
    #[error("bug: {0}")]
    Internal(String),
}

fn range_dots(exclusive: &bool) -> &'static str {
    if *exclusive {
        "..."
    } else {
        ".."
    }
}

fn count_relation(rest: &bool) -> &'static str {
    if *rest {
        ">"
    } else {
        "should be equal to"
    }
}

impl NArrayError {
    /// Returns the category of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NArrayError::OutOfRange { .. } => ErrorKind::OutOfRange,
            NArrayError::RangeError { .. } => ErrorKind::Range,
            NArrayError::TypeError(_) => ErrorKind::Type,
            NArrayError::ShapeMismatch { .. }
            | NArrayError::IndexCount { .. }
            | NArrayError::RankMismatch(..) => ErrorKind::Shape,
            NArrayError::Usage(_) => ErrorKind::Usage,
            NArrayError::Busy => ErrorKind::Busy,
            NArrayError::Kernel(_) => ErrorKind::Kernel,
            NArrayError::Internal(_) => ErrorKind::Internal,
        }
    }
}

/// Result type for indexing and loop operations.
pub type Result<T> = std::result::Result<T, NArrayError>;
