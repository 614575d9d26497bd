//! The array type: an owned contiguous block or a view over another
//! array's buffer.

use smallvec::SmallVec;

use crate::buffer::Buffer;
use crate::dtype::{read_element, write_element, DType, Element};
use crate::stridx::{offset_add, row_major_strides, Stridx};
use crate::{IndexExpr, NArrayError, Result};

pub(crate) type Shape = SmallVec<[usize; 4]>;

#[derive(Debug, Clone)]
pub(crate) enum Storage {
    /// Row-major contiguous elements starting at byte 0.
    Data(Buffer),
    /// Alternate traversal of a buffer owned elsewhere.
    View {
        buffer: Buffer,
        stridx: Vec<Stridx>,
        offset: usize,
    },
}

/// N-dimensional array.
///
/// Cloning is cheap: clones share the same buffer.
#[derive(Debug, Clone)]
pub struct NArray {
    dtype: DType,
    shape: Shape,
    storage: Storage,
    reduce: SmallVec<[bool; 4]>,
    inplace: bool,
}

impl NArray {
    /// Zero-filled contiguous array.
    pub fn zeros(dtype: DType, shape: &[usize]) -> Self {
        let size: usize = shape.iter().product();
        Self::from_storage(dtype, shape, Storage::Data(Buffer::zeroed(size * dtype.size())))
    }

    /// Contiguous array from row-major elements.
    pub fn from_vec<T: Element>(shape: &[usize], data: Vec<T>) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(NArrayError::ShapeMismatch {
                dim: 0,
                expected: size,
                found: data.len(),
            });
        }
        let buffer = Buffer::from_bytes(bytemuck::cast_slice(&data));
        Ok(Self::from_storage(T::DTYPE, shape, Storage::Data(buffer)))
    }

    /// Contiguous array with every element set to `value`.
    pub fn from_elem<T: Element>(shape: &[usize], value: T) -> Self {
        let size: usize = shape.iter().product();
        let data = vec![value; size];
        let buffer = Buffer::from_bytes(bytemuck::cast_slice(&data));
        Self::from_storage(T::DTYPE, shape, Storage::Data(buffer))
    }

    /// Rank-0 array holding one element.
    pub fn scalar<T: Element>(value: T) -> Self {
        Self::from_elem(&[], value)
    }

    /// Wrap an existing buffer as a contiguous array.
    pub fn from_buffer(dtype: DType, shape: &[usize], buffer: Buffer) -> Result<Self> {
        let size: usize = shape.iter().product();
        if buffer.len() != size * dtype.size() {
            return Err(NArrayError::ShapeMismatch {
                dim: 0,
                expected: size * dtype.size(),
                found: buffer.len(),
            });
        }
        Ok(Self::from_storage(dtype, shape, Storage::Data(buffer)))
    }

    pub(crate) fn from_storage(dtype: DType, shape: &[usize], storage: Storage) -> Self {
        Self {
            dtype,
            shape: SmallVec::from_slice(shape),
            storage,
            reduce: SmallVec::from_elem(false, shape.len()),
            inplace: false,
        }
    }

    pub(crate) fn view(
        dtype: DType,
        shape: &[usize],
        buffer: Buffer,
        stridx: Vec<Stridx>,
        offset: usize,
    ) -> Self {
        debug_assert_eq!(shape.len(), stridx.len());
        Self::from_storage(
            dtype,
            shape,
            Storage::View {
                buffer,
                stridx,
                offset,
            },
        )
    }

    pub(crate) fn with_reduce_mask(mut self, mask: &[bool]) -> Self {
        debug_assert_eq!(mask.len(), self.shape.len());
        self.reduce = SmallVec::from_slice(mask);
        self
    }

    #[inline]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[inline]
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    #[inline]
    pub fn ndim(&self) -> usize {
        self.shape.len()
    }

    /// Number of elements.
    #[inline]
    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }

    #[inline]
    pub fn element_size(&self) -> usize {
        self.dtype.size()
    }

    /// Whether this array borrows another array's storage.
    #[inline]
    pub fn is_view(&self) -> bool {
        matches!(self.storage, Storage::View { .. })
    }

    /// The backing buffer.
    pub fn buffer(&self) -> &Buffer {
        match &self.storage {
            Storage::Data(buffer) => buffer,
            Storage::View { buffer, .. } => buffer,
        }
    }

    /// Byte offset of element `[0, 0, ...]` within the buffer.
    #[inline]
    pub fn offset(&self) -> usize {
        match &self.storage {
            Storage::Data(_) => 0,
            Storage::View { offset, .. } => *offset,
        }
    }

    /// Descriptor of `axis`.
    ///
    /// # Panics
    /// Panics if `axis >= self.ndim()`.
    pub fn stridx(&self, axis: usize) -> Stridx {
        assert!(axis < self.ndim(), "axis {axis} out of rank {}", self.ndim());
        match &self.storage {
            Storage::Data(_) => {
                let stride: usize = self.shape[axis + 1..].iter().product();
                Stridx::Stride((stride * self.element_size()) as isize)
            }
            Storage::View { stridx, .. } => stridx[axis].clone(),
        }
    }

    /// Descriptors of every axis.
    pub fn stridxs(&self) -> Vec<Stridx> {
        match &self.storage {
            Storage::Data(_) => row_major_strides(&self.shape, self.element_size())
                .into_iter()
                .map(Stridx::Stride)
                .collect(),
            Storage::View { stridx, .. } => stridx.clone(),
        }
    }

    /// Axes marked for accumulation by an index expression.
    pub fn reduce_axes(&self) -> Vec<usize> {
        self.reduce
            .iter()
            .enumerate()
            .filter_map(|(axis, &r)| r.then_some(axis))
            .collect()
    }

    /// Mark this array as reusable for a loop output of matching dtype and shape.
    pub fn inplace(mut self) -> Self {
        self.inplace = true;
        self
    }

    #[inline]
    pub fn is_inplace(&self) -> bool {
        self.inplace
    }

    /// Whether the elements are packed row-major from the base offset.
    pub fn is_contiguous(&self) -> bool {
        match &self.storage {
            Storage::Data(_) => true,
            Storage::View { stridx, .. } => {
                let mut expected = self.element_size() as isize;
                for (&n, sdx) in self.shape.iter().zip(stridx).rev() {
                    if n <= 1 {
                        continue;
                    }
                    if sdx.stride() != Some(expected) {
                        return false;
                    }
                    expected *= n as isize;
                }
                true
            }
        }
    }

    /// Byte offsets of every element in row-major visitation order.
    pub fn offsets(&self) -> OffsetIter {
        OffsetIter::new(self.shape.to_vec(), self.stridxs(), self.offset())
    }

    /// Copy the elements out in row-major order.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        self.check_dtype::<T>()?;
        let buffer = self.buffer();
        buffer.synchronize()?;
        let guard = buffer.try_read()?;
        let bytes = guard.bytes();
        Ok(self.offsets().map(|off| read_element::<T>(bytes, off)).collect())
    }

    /// Element at a multi-dimensional position.
    pub fn get<T: Element>(&self, pos: &[usize]) -> Result<T> {
        let off = self.element_offset(pos)?;
        self.check_dtype::<T>()?;
        let buffer = self.buffer();
        buffer.synchronize()?;
        let guard = buffer.try_read()?;
        Ok(read_element::<T>(guard.bytes(), off))
    }

    /// Overwrite the element at a multi-dimensional position.
    pub fn set<T: Element>(&self, pos: &[usize], value: T) -> Result<()> {
        let off = self.element_offset(pos)?;
        self.check_dtype::<T>()?;
        let mut guard = self.buffer().try_write()?;
        write_element::<T>(guard.bytes_mut(), off, value);
        Ok(())
    }

    fn element_offset(&self, pos: &[usize]) -> Result<usize> {
        if pos.len() != self.ndim() {
            return Err(NArrayError::RankMismatch(pos.len(), self.ndim()));
        }
        let mut off = self.offset();
        for (axis, (&p, &n)) in pos.iter().zip(self.shape.iter()).enumerate() {
            if p >= n {
                return Err(NArrayError::OutOfRange {
                    index: p as isize,
                    dim: axis,
                    size: n,
                });
            }
            off = offset_add(off, self.stridx(axis).offset_at(p))?;
        }
        Ok(off)
    }

    fn check_dtype<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(NArrayError::TypeError(format!(
                "element type {} does not match array dtype {}",
                T::DTYPE,
                self.dtype
            )));
        }
        Ok(())
    }

    /// Rank-1 view visiting every element in row-major order.
    ///
    /// Uses a single stride when the layout allows it and an explicit offset
    /// list otherwise.
    pub fn flatten(&self) -> NArray {
        let size = self.size();
        let elmsz = self.element_size() as isize;
        let stridx = self.stridxs();
        let strides: Option<Vec<isize>> = stridx.iter().map(Stridx::stride).collect();
        let fused = strides.and_then(|strides| {
            let (dims, strides) = crate::fuse::fuse_dims(&self.shape, &[&strides]);
            match dims.len() {
                0 => Some(elmsz),
                1 => Some(strides[0][0]),
                _ => None,
            }
        });
        let (sdx, offset) = match fused {
            Some(stride) => (Stridx::Stride(stride), self.offset()),
            None => {
                let list: Vec<usize> = self.offsets().collect();
                (Stridx::Index(list.into()), 0)
            }
        };
        NArray::view(self.dtype, &[size], self.buffer().clone(), vec![sdx], offset)
    }

    /// Index with one expression per axis, dropping axes selected by a scalar.
    ///
    /// The result shares this array's buffer.
    pub fn aref(&self, args: &[IndexExpr]) -> Result<NArray> {
        crate::compose::aref(self, args, false)
    }

    /// Like [`NArray::aref`] but every expression keeps its axis; scalar
    /// selections become length-1 axes.
    pub fn slice(&self, args: &[IndexExpr]) -> Result<NArray> {
        crate::compose::aref(self, args, true)
    }

    /// Reinterpret a contiguous array under a new shape of the same size.
    pub(crate) fn into_shape(self, shape: &[usize]) -> Result<NArray> {
        let size: usize = shape.iter().product();
        match self.storage {
            Storage::Data(buffer) if size == self.shape.iter().product::<usize>() => {
                Ok(Self::from_storage(self.dtype, shape, Storage::Data(buffer)))
            }
            _ => Err(NArrayError::Internal(
                "reshape requires a contiguous array of equal size".into(),
            )),
        }
    }
}

/// Iterator over the byte offsets of an array's elements.
#[derive(Debug, Clone)]
pub struct OffsetIter {
    shape: Vec<usize>,
    stridx: Vec<Stridx>,
    counter: Vec<usize>,
    base: isize,
    remaining: usize,
}

impl OffsetIter {
    fn new(shape: Vec<usize>, stridx: Vec<Stridx>, base: usize) -> Self {
        let remaining = shape.iter().product();
        Self {
            counter: vec![0; shape.len()],
            shape,
            stridx,
            base: base as isize,
            remaining,
        }
    }
}

impl Iterator for OffsetIter {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        if self.remaining == 0 {
            return None;
        }
        let off: isize = self
            .counter
            .iter()
            .zip(&self.stridx)
            .map(|(&k, sdx)| sdx.offset_at(k))
            .sum();
        self.remaining -= 1;
        for d in (0..self.shape.len()).rev() {
            self.counter[d] += 1;
            if self.counter[d] < self.shape[d] {
                break;
            }
            self.counter[d] = 0;
        }
        Some((self.base + off) as usize)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.remaining, Some(self.remaining))
    }
}

impl ExactSizeIterator for OffsetIter {}
