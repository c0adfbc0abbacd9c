use super::Word;
use crate::error::{Error, ErrorKind};
use crate::runtime::{lock, DepKind, Event, Handler};
use std::fmt;
use std::mem::size_of;
use std::sync::{Arc, Mutex};

/// Fixed-capacity device storage.
pub struct Storage<W: Word> {
    cells: Box<[W::Cell]>,
}

impl<W: Word> fmt::Debug for Storage<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Storage<{}>({})", std::any::type_name::<W>(), self.len())
    }
}

impl<W: Word> Storage<W> {
    /// Zero-initialised storage of `len` words.
    pub fn try_new(len: usize) -> Result<Self, Error> {
        let bytes = len.saturating_mul(size_of::<W>());
        if bytes > isize::MAX as usize {
            return Err(ErrorKind::allocation(bytes, "size overflows the address space"));
        }
        let mut cells = Vec::new();
        cells
            .try_reserve_exact(len)
            .map_err(|e| ErrorKind::allocation(bytes, e))?;
        cells.extend((0..len).map(|_| W::ZERO.cell()));
        Ok(Self {
            cells: cells.into_boxed_slice(),
        })
    }

    pub fn len(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    #[inline(always)]
    pub fn load(&self, i: usize) -> W {
        W::load(&self.cells[i])
    }

    #[inline(always)]
    pub fn store(&self, i: usize, w: W) {
        W::store(&self.cells[i], w)
    }
}

/// Producer/consumer bookkeeping for a buffer.
#[derive(Default)]
struct AccessTracker {
    last_write: Event,
    reads: Vec<Event>,
}

impl AccessTracker {
    fn read(&mut self, cgh: &mut Handler) {
        cgh.require(self.last_write.clone(), DepKind::Memory);
        self.reads.retain(|e| !e.exec_status().is_terminal());
        if !self.reads.iter().any(|e| e.same_as(cgh.event())) {
            self.reads.push(cgh.event().clone());
        }
    }

    fn write(&mut self, cgh: &mut Handler) {
        cgh.require(self.last_write.clone(), DepKind::Memory);
        for e in self.reads.drain(..) {
            cgh.require(e, DepKind::Memory);
        }
        self.last_write = cgh.event().clone();
    }
}

struct BufferInner<W: Word> {
    storage: Arc<Storage<W>>,
    tracker: Mutex<AccessTracker>,
}

/// Reference-counted device buffer. It lives as long as its longest holder,
/// including accessors of kernels still in flight.
pub struct Buffer<W: Word> {
    inner: Arc<BufferInner<W>>,
}

impl<W: Word> Clone for Buffer<W> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<W: Word> fmt::Debug for Buffer<W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Buffer({} words, {} holders)", self.len(), self.holders())
    }
}

impl<W: Word> Buffer<W> {
    pub fn new(len: usize) -> Result<Self, Error> {
        Ok(Self {
            inner: Arc::new(BufferInner {
                storage: Arc::new(Storage::try_new(len)?),
                tracker: Mutex::new(AccessTracker::default()),
            }),
        })
    }

    pub fn len(&self) -> usize {
        self.inner.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.storage.is_empty()
    }

    /// Handles to this buffer currently alive.
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_as(&self, other: &Buffer<W>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub(crate) fn storage(&self) -> &Arc<Storage<W>> {
        &self.inner.storage
    }

    pub(crate) fn register_read(&self, cgh: &mut Handler) {
        lock(&self.inner.tracker).read(cgh)
    }

    pub(crate) fn register_write(&self, cgh: &mut Handler) {
        lock(&self.inner.tracker).write(cgh)
    }
}
