use super::heap::DeviceHeap;
use super::{Backend, DevicePointer, DevicePtr, MatmulProvider, MemoryProvider, ReduceProvider};
use crate::error::Error;
use crate::mem::{make_usm_mem_object, DataType, Storage, UsmKind, UsmMemObject};
use crate::runtime::{lock, DeviceInfo, Queue};
use std::any::Any;
use std::mem::size_of;
use std::sync::{Arc, Mutex};

type Allocation = Box<dyn Any + Send + Sync>;

/// Raw-address host backend: allocations live until explicitly freed.
///
/// Interior addresses of any live allocation are valid pointers, so pointer
/// arithmetic may step from one allocation into another.
pub struct UsmBackend {
    queue: Queue,
    info: DeviceInfo,
    heap: Mutex<DeviceHeap<Allocation>>,
}

impl std::fmt::Debug for UsmBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsmBackend")
            .field("queue", &self.queue)
            .field("allocations", &lock(&self.heap).len())
            .finish()
    }
}

impl UsmBackend {
    pub fn new(queue: Queue) -> Self {
        let info = DeviceInfo::host(&queue);
        Self {
            queue,
            info,
            heap: Mutex::new(DeviceHeap::new()),
        }
    }

    pub fn host() -> Result<Self, Error> {
        Ok(Self::new(Queue::host()?))
    }

    /// Live allocations.
    pub fn allocations(&self) -> usize {
        lock(&self.heap).len()
    }
}

/// Resolves `ptr` in `heap` to the entry of its allocation and the element
/// offset into it.
pub(crate) fn resolve<T: DataType, E: Clone + 'static>(
    heap: &DeviceHeap<Allocation>,
    ptr: DevicePtr<T>,
) -> (E, usize) {
    assert!(!ptr.is_null(), "Memory object requested for a null pointer");
    let Some((base, block)) = heap.resolve(ptr.addr()) else {
        panic!("{ptr:?} is not inside a live allocation");
    };
    let bytes = (ptr.addr() - base) as usize;
    assert_eq!(
        bytes % size_of::<T>(),
        0,
        "{ptr:?} is not aligned to {}",
        T::NAME
    );
    let Some(entry) = block.entry.downcast_ref::<E>() else {
        panic!("{ptr:?} was allocated for an element of another size than {}", T::NAME);
    };
    (entry.clone(), bytes / size_of::<T>())
}

impl MemoryProvider for UsmBackend {
    type Kind = UsmKind;
    type Pointer<T: DataType> = DevicePtr<T>;
    type MemObject<T: DataType> = UsmMemObject<T>;

    fn get_mem_object<T: DataType>(&self, ptr: DevicePtr<T>, n_elems: usize) -> UsmMemObject<T> {
        let (storage, offset) = resolve::<T, Arc<Storage<T::Word>>>(&lock(&self.heap), ptr);
        make_usm_mem_object(storage, n_elems, offset)
    }

    fn get_queue(&self) -> &Queue {
        &self.queue
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Backend for UsmBackend {
    type InternalPointer<T: DataType> = DevicePtr<T>;

    fn name(&self) -> &'static str {
        "usm"
    }

    fn allocate<T: DataType>(&self, n_elems: usize) -> Result<DevicePtr<T>, Error> {
        let storage = Arc::new(Storage::<T::Word>::try_new(n_elems)?);
        let bytes = (n_elems * size_of::<T>()) as u64;
        let addr = lock(&self.heap).insert(bytes, Box::new(storage));
        log::trace!("usm allocation of {bytes} bytes at {addr:#x}");
        Ok(DevicePtr::from_addr(addr))
    }

    /// Kernels already submitted keep their view of the memory alive.
    fn deallocate<T: DataType>(&self, ptr: DevicePtr<T>) {
        if lock(&self.heap).remove(ptr.addr()).is_none() {
            panic!("Deallocating {ptr:?}, which does not start a live allocation");
        }
    }

    fn get_mem_object_internal<T: DataType>(
        &self,
        ptr: DevicePtr<T>,
        n_elems: usize,
    ) -> UsmMemObject<T> {
        self.get_mem_object(ptr, n_elems)
    }

    fn to_internal_pointer<T: DataType>(&self, ptr: DevicePtr<T>) -> DevicePtr<T> {
        ptr
    }

    fn supports_interleaved_matmul(&self) -> bool {
        true
    }
}

impl MatmulProvider for UsmBackend {}
impl ReduceProvider for UsmBackend {}
