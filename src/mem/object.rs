use super::{Buffer, DataType, ReadMem, ReadWriteMem, Storage, WriteMem};
use crate::runtime::Handler;
use derivative::Derivative;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

/// Type-level tag naming the storage a memory object sits on.
pub trait StorageKind: Send + Sync + 'static {
    /// Raw device addresses with explicit lifetime, rather than buffers.
    const IS_USM: bool;
    const NAME: &'static str;
}

/// Reference-counted buffers with implicit dependency tracking.
#[derive(Debug)]
pub enum BufferKind {}

/// Raw device allocations ordered only through explicit events.
#[derive(Debug)]
pub enum UsmKind {}

impl StorageKind for BufferKind {
    const IS_USM: bool = false;
    const NAME: &'static str = "buffer";
}

impl StorageKind for UsmKind {
    const IS_USM: bool = true;
    const NAME: &'static str = "usm";
}

pub trait Access: Send + Sync + 'static {}

#[derive(Debug)]
pub enum ReadWrite {}
#[derive(Debug)]
pub enum ReadOnly {}

impl Access for ReadWrite {}
impl Access for ReadOnly {}

/// Bounds-checked, typed view of device storage.
pub trait MemObject<T: DataType>: Clone + Debug + Send + Sync + 'static {
    type Kind: StorageKind;

    fn extent(&self) -> usize;
    fn offset(&self) -> usize;
    fn read_mem(&self, cgh: &mut Handler) -> ReadMem<T>;
}

pub trait MutMemObject<T: DataType>: MemObject<T> {
    type Const: MemObject<T, Kind = Self::Kind>;

    fn as_const(&self) -> Self::Const;
    fn write_mem(&self, cgh: &mut Handler) -> WriteMem<T>;
    fn read_write_mem(&self, cgh: &mut Handler) -> ReadWriteMem<T>;
}

#[track_caller]
fn check_extent(capacity: usize, extent: usize, offset: usize) {
    assert!(extent > 0, "Memory object must cover at least one element");
    let fits = extent.checked_add(offset).map_or(false, |end| end <= capacity);
    assert!(
        fits,
        "Memory object of {extent} elements at offset {offset} exceeds storage of {capacity} elements"
    );
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct BufferMemObject<T: DataType, A: Access = ReadWrite> {
    buffer: Buffer<T::Word>,
    extent: usize,
    offset: usize,
    #[derivative(Debug = "ignore")]
    _m: PhantomData<(T, A)>,
}

/// Panics unless `0 < extent` and `extent + offset <= buffer.len()`.
#[track_caller]
pub fn make_buffer_mem_object<T: DataType>(
    buffer: Buffer<T::Word>,
    extent: usize,
    offset: usize,
) -> BufferMemObject<T> {
    check_extent(buffer.len(), extent, offset);
    BufferMemObject {
        buffer,
        extent,
        offset,
        _m: PhantomData,
    }
}

impl<T: DataType, A: Access> BufferMemObject<T, A> {
    pub fn buffer(&self) -> &Buffer<T::Word> {
        &self.buffer
    }

    /// The same elements viewed as another type of the same size.
    pub fn cast<U: DataType<Word = T::Word>>(&self) -> BufferMemObject<U, A> {
        BufferMemObject {
            buffer: self.buffer.clone(),
            extent: self.extent,
            offset: self.offset,
            _m: PhantomData,
        }
    }
}

impl<T: DataType, A: Access> MemObject<T> for BufferMemObject<T, A> {
    type Kind = BufferKind;

    fn extent(&self) -> usize {
        self.extent
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn read_mem(&self, cgh: &mut Handler) -> ReadMem<T> {
        self.buffer.register_read(cgh);
        ReadMem::new(self.buffer.storage().clone(), self.offset, self.extent)
    }
}

impl<T: DataType> MutMemObject<T> for BufferMemObject<T, ReadWrite> {
    type Const = BufferMemObject<T, ReadOnly>;

    fn as_const(&self) -> Self::Const {
        BufferMemObject {
            buffer: self.buffer.clone(),
            extent: self.extent,
            offset: self.offset,
            _m: PhantomData,
        }
    }

    fn write_mem(&self, cgh: &mut Handler) -> WriteMem<T> {
        self.buffer.register_write(cgh);
        WriteMem::new(self.buffer.storage().clone(), self.offset, self.extent)
    }

    fn read_write_mem(&self, cgh: &mut Handler) -> ReadWriteMem<T> {
        self.buffer.register_read(cgh);
        self.buffer.register_write(cgh);
        ReadWriteMem::new(self.buffer.storage().clone(), self.offset, self.extent)
    }
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct UsmMemObject<T: DataType, A: Access = ReadWrite> {
    allocation: Arc<Storage<T::Word>>,
    extent: usize,
    offset: usize,
    #[derivative(Debug = "ignore")]
    _m: PhantomData<(T, A)>,
}

/// Panics unless `0 < extent` and `extent + offset` fits in the allocation.
#[track_caller]
pub fn make_usm_mem_object<T: DataType>(
    allocation: Arc<Storage<T::Word>>,
    extent: usize,
    offset: usize,
) -> UsmMemObject<T> {
    check_extent(allocation.len(), extent, offset);
    UsmMemObject {
        allocation,
        extent,
        offset,
        _m: PhantomData,
    }
}

impl<T: DataType, A: Access> UsmMemObject<T, A> {
    pub fn cast<U: DataType<Word = T::Word>>(&self) -> UsmMemObject<U, A> {
        UsmMemObject {
            allocation: self.allocation.clone(),
            extent: self.extent,
            offset: self.offset,
            _m: PhantomData,
        }
    }
}

impl<T: DataType, A: Access> MemObject<T> for UsmMemObject<T, A> {
    type Kind = UsmKind;

    fn extent(&self) -> usize {
        self.extent
    }

    fn offset(&self) -> usize {
        self.offset
    }

    fn read_mem(&self, _: &mut Handler) -> ReadMem<T> {
        ReadMem::new(self.allocation.clone(), self.offset, self.extent)
    }
}

impl<T: DataType> MutMemObject<T> for UsmMemObject<T, ReadWrite> {
    type Const = UsmMemObject<T, ReadOnly>;

    fn as_const(&self) -> Self::Const {
        UsmMemObject {
            allocation: self.allocation.clone(),
            extent: self.extent,
            offset: self.offset,
            _m: PhantomData,
        }
    }

    fn write_mem(&self, _: &mut Handler) -> WriteMem<T> {
        WriteMem::new(self.allocation.clone(), self.offset, self.extent)
    }

    fn read_write_mem(&self, _: &mut Handler) -> ReadWriteMem<T> {
        ReadWriteMem::new(self.allocation.clone(), self.offset, self.extent)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::runtime::Queue;
    use std::panic::{catch_unwind, AssertUnwindSafe};

    #[test]
    fn test_capacity_invariant() {
        let cap = 6;
        let buf = Buffer::<u32>::new(cap).unwrap();
        for extent in 1..=cap + 2 {
            for offset in 0..=cap + 2 {
                let b = buf.clone();
                let made = catch_unwind(AssertUnwindSafe(move || {
                    make_buffer_mem_object::<f32>(b, extent, offset)
                }));
                assert_eq!(made.is_ok(), extent + offset <= cap, "{extent} at {offset}");

                let s = Arc::new(Storage::<u32>::try_new(cap).unwrap());
                let made = catch_unwind(AssertUnwindSafe(move || {
                    make_usm_mem_object::<i32>(s, extent, offset)
                }));
                assert_eq!(made.is_ok(), extent + offset <= cap, "{extent} at {offset}");
            }
        }
        let empty = catch_unwind(|| make_buffer_mem_object::<f32>(Buffer::new(4).unwrap(), 0, 0));
        assert!(empty.is_err());
    }

    #[test]
    fn test_cast_shares_storage() {
        let q = Queue::host().unwrap();
        let mem = make_buffer_mem_object::<f32>(Buffer::new(8).unwrap(), 4, 2);
        let bits = mem.cast::<u32>();
        assert_eq!((bits.extent(), bits.offset()), (4, 2));
        assert!(bits.buffer().same_as(mem.buffer()));

        let m = mem.clone();
        q.submit("fill", &[], |cgh| {
            let out = m.write_mem(cgh);
            cgh.single_task(move || out.set(1, 1.0))
        });
        let ro = bits.as_const();
        let seen = Arc::new(std::sync::Mutex::new(vec![]));
        let s = seen.clone();
        q.submit("read", &[], |cgh| {
            let inp = ro.read_mem(cgh);
            cgh.single_task(move || *s.lock().unwrap() = inp.to_vec())
        })
        .wait()
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![0, 1.0f32.to_bits(), 0, 0]);
    }

    #[test]
    fn test_buffer_tracking_orders_writer_then_reader() {
        let q = Queue::host().unwrap();
        let mem = make_buffer_mem_object::<f64>(Buffer::new(1).unwrap(), 1, 0);
        let m = mem.clone();
        let write = q.submit("slow_write", &[], |cgh| {
            let out = m.write_mem(cgh);
            cgh.single_task(move || {
                std::thread::sleep(std::time::Duration::from_millis(30));
                out.set(0, 42.0)
            })
        });
        let value = Arc::new(std::sync::Mutex::new(0.0));
        let v = value.clone();
        let read = q.submit("read", &[], |cgh| {
            let inp = mem.as_const().read_mem(cgh);
            cgh.single_task(move || *v.lock().unwrap() = inp.get(0))
        });
        read.wait().unwrap();
        assert!(write.is_complete());
        assert_eq!(*value.lock().unwrap(), 42.0);
    }
}
