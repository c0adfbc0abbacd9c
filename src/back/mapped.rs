use super::buffer::buffer_mem_object;
use super::heap::DeviceHeap;
use super::usm::resolve;
use super::{Backend, BufferPtr, DevicePtr, MatmulProvider, MemoryProvider, ReduceProvider};
use crate::error::Error;
use crate::mem::{Buffer, BufferKind, BufferMemObject, DataType};
use crate::runtime::{lock, DeviceInfo, Queue};
use std::any::Any;
use std::mem::size_of;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

/// Hands out raw device addresses, while its kernels work on buffers.
///
/// Every external address maps onto a buffer and an offset; converting to the
/// internal pointer performs that lookup.
pub struct MappedBackend {
    queue: Queue,
    info: DeviceInfo,
    map: Mutex<DeviceHeap<Box<dyn Any + Send + Sync>>>,
    translations: AtomicUsize,
    releases: AtomicUsize,
}

impl std::fmt::Debug for MappedBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedBackend")
            .field("queue", &self.queue)
            .field("mappings", &lock(&self.map).len())
            .finish()
    }
}

impl MappedBackend {
    pub fn new(queue: Queue) -> Self {
        let info = DeviceInfo::host(&queue);
        Self {
            queue,
            info,
            map: Mutex::new(DeviceHeap::new()),
            translations: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
        }
    }

    pub fn host() -> Result<Self, Error> {
        Ok(Self::new(Queue::host()?))
    }

    fn translate<T: DataType>(&self, ptr: DevicePtr<T>) -> BufferPtr<T> {
        let (buffer, offset) = resolve::<T, Buffer<T::Word>>(&lock(&self.map), ptr);
        BufferPtr::new(buffer, offset)
    }

    /// Internal pointers handed out and not yet released.
    pub fn outstanding_internal_pointers(&self) -> usize {
        self.translations.load(Ordering::Acquire) - self.releases.load(Ordering::Acquire)
    }
}

impl MemoryProvider for MappedBackend {
    type Kind = BufferKind;
    type Pointer<T: DataType> = DevicePtr<T>;
    type MemObject<T: DataType> = BufferMemObject<T>;

    fn get_mem_object<T: DataType>(&self, ptr: DevicePtr<T>, n_elems: usize) -> BufferMemObject<T> {
        buffer_mem_object(self.translate(ptr), n_elems)
    }

    fn get_queue(&self) -> &Queue {
        &self.queue
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Backend for MappedBackend {
    type InternalPointer<T: DataType> = BufferPtr<T>;

    fn name(&self) -> &'static str {
        "mapped"
    }

    fn allocate<T: DataType>(&self, n_elems: usize) -> Result<DevicePtr<T>, Error> {
        let buffer = Buffer::<T::Word>::new(n_elems)?;
        let addr = lock(&self.map).insert((n_elems * size_of::<T>()) as u64, Box::new(buffer));
        Ok(DevicePtr::from_addr(addr))
    }

    fn deallocate<T: DataType>(&self, ptr: DevicePtr<T>) {
        if lock(&self.map).remove(ptr.addr()).is_none() {
            panic!("Deallocating {ptr:?}, which does not start a live allocation");
        }
    }

    fn get_mem_object_internal<T: DataType>(
        &self,
        ptr: BufferPtr<T>,
        n_elems: usize,
    ) -> BufferMemObject<T> {
        buffer_mem_object(ptr, n_elems)
    }

    fn to_internal_pointer<T: DataType>(&self, ptr: DevicePtr<T>) -> BufferPtr<T> {
        self.translations.fetch_add(1, Ordering::AcqRel);
        self.translate(ptr)
    }

    fn release_internal_pointer<T: DataType>(&self, ptr: BufferPtr<T>) {
        self.releases.fetch_add(1, Ordering::AcqRel);
        drop(ptr)
    }

    fn supports_interleaved_matmul(&self) -> bool {
        true
    }
}

impl MatmulProvider for MappedBackend {}
impl ReduceProvider for MappedBackend {}

#[cfg(test)]
mod test {
    use super::*;
    use crate::back::is_usm_backend;

    #[test]
    fn test_translation_to_buffer() {
        let b = MappedBackend::host().unwrap();
        assert!(!is_usm_backend::<MappedBackend>());
        let p = b.allocate::<f32>(10).unwrap();
        let q = b.allocate::<f32>(10).unwrap();
        let ip = b.to_internal_pointer(p + 3);
        let iq = b.to_internal_pointer(q);
        assert_eq!(ip.offset(), 3);
        assert!(!ip.same_storage(&iq));
        assert_eq!(b.outstanding_internal_pointers(), 2);
        b.release_internal_pointer(ip);
        b.release_internal_pointer(iq);
        assert_eq!(b.outstanding_internal_pointers(), 0);
    }
}
