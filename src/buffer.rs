//! Backing storage shared by an array and its views, plus the per-call
//! read/write intent locks.
//!
//! A [`Buffer`] is a cheap handle: the data-carrying array owns one and every
//! view built from it retains a clone, so the storage lives as long as the
//! longest-lived view. Contents sit behind a reader/writer lock. A loop or
//! index call takes every buffer it touches through a [`LockSet`] before
//! computing any address and drops it on every exit path. Acquisition never
//! waits: a buffer held with a conflicting intent yields
//! [`NArrayError::Busy`].

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Once, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};

use crate::{NArrayError, Result};

/// Hook for storage that lives on a device and must be synchronized before
/// the host reads it.
pub trait DeviceSync: Send + Sync {
    /// Block until all pending writes to the storage are visible to the host.
    fn synchronize(&self) -> Result<()>;
}

struct BufferInner {
    // u64 words keep every element type naturally aligned.
    words: RwLock<Vec<u64>>,
    len: usize,
    device: Option<Arc<dyn DeviceSync>>,
}

/// Shared handle to raw array storage.
#[derive(Clone)]
pub struct Buffer {
    inner: Arc<BufferInner>,
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.inner.len)
            .field("device", &self.inner.device.is_some())
            .finish()
    }
}

fn words_for(len: usize) -> usize {
    len.div_ceil(8)
}

impl Buffer {
    /// Allocate `len` zeroed bytes.
    pub fn zeroed(len: usize) -> Self {
        Self {
            inner: Arc::new(BufferInner {
                words: RwLock::new(vec![0u64; words_for(len)]),
                len,
                device: None,
            }),
        }
    }

    /// Take ownership of `bytes`.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let buffer = Self::zeroed(bytes.len());
        {
            let mut words = buffer
                .inner
                .words
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let dst: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
            dst[..bytes.len()].copy_from_slice(bytes);
        }
        buffer
    }

    /// Attach a device synchronization hook.
    pub fn with_device_sync(self, device: Arc<dyn DeviceSync>) -> Self {
        let len = self.inner.len;
        let words = match Arc::try_unwrap(self.inner) {
            Ok(inner) => inner
                .words
                .into_inner()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            Err(shared) => shared
                .words
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        };
        Self {
            inner: Arc::new(BufferInner {
                words: RwLock::new(words),
                len,
                device: Some(device),
            }),
        }
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.inner.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    /// Whether two handles refer to the same storage.
    #[inline]
    pub fn ptr_eq(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Whether the storage is device-resident.
    pub fn is_device(&self) -> bool {
        self.inner.device.is_some()
    }

    /// Make device-resident contents visible to the host.
    ///
    /// No-op for host storage.
    pub fn synchronize(&self) -> Result<()> {
        match &self.inner.device {
            Some(device) => {
                static WARN_ONCE: Once = Once::new();
                WARN_ONCE.call_once(|| {
                    tracing::warn!("synchronizing device buffer before a host read");
                });
                device.synchronize()
            }
            None => Ok(()),
        }
    }

    fn key(&self) -> usize {
        Arc::as_ptr(&self.inner) as *const () as usize
    }

    /// Take a read lock without waiting.
    pub fn try_read(&self) -> Result<ReadBytes<'_>> {
        let guard = match self.inner.words.try_read() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(NArrayError::Busy),
        };
        Ok(ReadBytes {
            guard,
            len: self.inner.len,
        })
    }

    /// Take a write lock without waiting.
    pub fn try_write(&self) -> Result<WriteBytes<'_>> {
        let guard = match self.inner.words.try_write() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => return Err(NArrayError::Busy),
        };
        Ok(WriteBytes {
            guard,
            len: self.inner.len,
        })
    }
}

/// Scoped read access to a buffer's bytes.
pub struct ReadBytes<'a> {
    guard: RwLockReadGuard<'a, Vec<u64>>,
    len: usize,
}

impl ReadBytes<'_> {
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(self.guard.as_slice())[..self.len]
    }
}

/// Scoped write access to a buffer's bytes.
pub struct WriteBytes<'a> {
    guard: RwLockWriteGuard<'a, Vec<u64>>,
    len: usize,
}

impl WriteBytes<'_> {
    pub fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u64, u8>(self.guard.as_slice())[..self.len]
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut::<u64, u8>(self.guard.as_mut_slice())[..self.len]
    }
}

/// Access an operand is placed under for the duration of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Intent {
    Read,
    Write,
}

// Guards are only kept alive, never read.
#[allow(dead_code)]
enum Held<'a> {
    Read(ReadBytes<'a>),
    Write(WriteBytes<'a>),
}

/// Raw view of a locked buffer, valid while its [`LockSet`] is alive.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RawBytes {
    pub(crate) ptr: *mut u8,
    pub(crate) len: usize,
    pub(crate) writable: bool,
}

/// All buffers touched by one call, each held under the strongest intent
/// requested for it.
///
/// Dropping the set releases every lock.
pub struct LockSet<'a> {
    held: Vec<Held<'a>>,
    raw: HashMap<usize, RawBytes>,
}

impl<'a> LockSet<'a> {
    /// Acquire every requested buffer.
    ///
    /// Requests naming the same storage are merged; a write request wins over
    /// a read request. Locks acquired before a failure are released when the
    /// partially built set is dropped.
    pub fn acquire(requests: &[(&'a Buffer, Intent)]) -> Result<Self> {
        let mut merged: Vec<(&'a Buffer, Intent)> = Vec::with_capacity(requests.len());
        for &(buffer, intent) in requests {
            match merged.iter_mut().find(|(b, _)| b.ptr_eq(buffer)) {
                Some(entry) => entry.1 = entry.1.max(intent),
                None => merged.push((buffer, intent)),
            }
        }

        let mut set = LockSet {
            held: Vec::with_capacity(merged.len()),
            raw: HashMap::with_capacity(merged.len()),
        };
        for (buffer, intent) in merged {
            let raw = match intent {
                Intent::Read => {
                    let guard = buffer.try_read()?;
                    let raw = RawBytes {
                        ptr: guard.bytes().as_ptr() as *mut u8,
                        len: guard.len,
                        writable: false,
                    };
                    set.held.push(Held::Read(guard));
                    raw
                }
                Intent::Write => {
                    let mut guard = buffer.try_write()?;
                    let raw = RawBytes {
                        ptr: guard.bytes_mut().as_mut_ptr(),
                        len: guard.len,
                        writable: true,
                    };
                    set.held.push(Held::Write(guard));
                    raw
                }
            };
            set.raw.insert(buffer.key(), raw);
        }
        Ok(set)
    }

    /// Number of distinct buffers held.
    pub fn len(&self) -> usize {
        self.held.len()
    }

    pub fn is_empty(&self) -> bool {
        self.held.is_empty()
    }

    /// Whether `buffer` is held with write intent.
    pub fn is_writable(&self, buffer: &Buffer) -> bool {
        self.raw.get(&buffer.key()).is_some_and(|raw| raw.writable)
    }

    pub(crate) fn raw(&self, buffer: &Buffer) -> Result<RawBytes> {
        self.raw
            .get(&buffer.key())
            .copied()
            .ok_or_else(|| NArrayError::Internal("operand buffer was not locked".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_from_bytes_roundtrip() {
        let buffer = Buffer::from_bytes(&[1, 2, 3]);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.try_read().unwrap().bytes(), &[1, 2, 3]);
    }

    #[test]
    fn test_shared_read_locks() {
        let buffer = Buffer::zeroed(8);
        let _a = buffer.try_read().unwrap();
        let _b = buffer.try_read().unwrap();
        assert!(matches!(buffer.try_write(), Err(NArrayError::Busy)));
    }

    #[test]
    fn test_lockset_merges_intents() {
        let a = Buffer::zeroed(8);
        let alias = a.clone();
        let b = Buffer::zeroed(8);
        let set = LockSet::acquire(&[(&a, Intent::Read), (&b, Intent::Read), (&alias, Intent::Write)])
            .unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.is_writable(&a));
        assert!(!set.is_writable(&b));
    }

    #[test]
    fn test_lockset_releases_on_drop_and_on_failure() {
        let a = Buffer::zeroed(8);
        let b = Buffer::zeroed(8);
        {
            let _set = LockSet::acquire(&[(&a, Intent::Write)]).unwrap();
            assert!(matches!(a.try_read(), Err(NArrayError::Busy)));
        }
        assert!(a.try_write().is_ok());

        let blocker = b.try_write().unwrap();
        let err = LockSet::acquire(&[(&a, Intent::Write), (&b, Intent::Read)]);
        assert!(matches!(err, Err(NArrayError::Busy)));
        drop(blocker);
        // `a` was released when the partial set was dropped.
        assert!(a.try_write().is_ok());
    }

    struct CountingSync(AtomicUsize);

    impl DeviceSync for CountingSync {
        fn synchronize(&self) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[test]
    fn test_device_sync_hook() {
        let sync = Arc::new(CountingSync(AtomicUsize::new(0)));
        let buffer = Buffer::zeroed(16).with_device_sync(sync.clone());
        assert!(buffer.is_device());
        buffer.synchronize().unwrap();
        buffer.synchronize().unwrap();
        assert_eq!(sync.0.load(Ordering::SeqCst), 2);
        assert!(!Buffer::zeroed(4).is_device());
    }
}
