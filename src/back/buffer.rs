use super::{Backend, BufferPtr, MatmulProvider, MemoryProvider, ReduceProvider};
use crate::error::Error;
use crate::mem::{make_buffer_mem_object, Buffer, BufferKind, BufferMemObject, DataType};
use crate::runtime::{DeviceInfo, Queue};

/// Buffer-backed host backend. External and internal pointers coincide.
#[derive(Debug)]
pub struct BufferBackend {
    queue: Queue,
    info: DeviceInfo,
}

impl BufferBackend {
    pub fn new(queue: Queue) -> Self {
        let info = DeviceInfo::host(&queue);
        Self { queue, info }
    }

    pub fn with_device_info(queue: Queue, info: DeviceInfo) -> Self {
        Self { queue, info }
    }

    pub fn host() -> Result<Self, Error> {
        Ok(Self::new(Queue::host()?))
    }
}

pub(crate) fn buffer_mem_object<T: DataType>(ptr: BufferPtr<T>, n_elems: usize) -> BufferMemObject<T> {
    match ptr.buffer() {
        Some(buffer) => make_buffer_mem_object(buffer.clone(), n_elems, ptr.offset()),
        None => panic!("Memory object requested for a null pointer"),
    }
}

impl MemoryProvider for BufferBackend {
    type Kind = BufferKind;
    type Pointer<T: DataType> = BufferPtr<T>;
    type MemObject<T: DataType> = BufferMemObject<T>;

    fn get_mem_object<T: DataType>(&self, ptr: BufferPtr<T>, n_elems: usize) -> BufferMemObject<T> {
        buffer_mem_object(ptr, n_elems)
    }

    fn get_queue(&self) -> &Queue {
        &self.queue
    }

    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }
}

impl Backend for BufferBackend {
    type InternalPointer<T: DataType> = BufferPtr<T>;

    fn name(&self) -> &'static str {
        "buffer"
    }

    fn allocate<T: DataType>(&self, n_elems: usize) -> Result<BufferPtr<T>, Error> {
        log::trace!("allocating {n_elems} x {}", T::NAME);
        Ok(BufferPtr::new(Buffer::new(n_elems)?, 0))
    }

    /// The storage is released once the last pointer, memory object or
    /// in-flight kernel holding it is gone.
    fn deallocate<T: DataType>(&self, ptr: BufferPtr<T>) {
        drop(ptr)
    }

    fn get_mem_object_internal<T: DataType>(
        &self,
        ptr: BufferPtr<T>,
        n_elems: usize,
    ) -> BufferMemObject<T> {
        buffer_mem_object(ptr, n_elems)
    }

    fn to_internal_pointer<T: DataType>(&self, ptr: BufferPtr<T>) -> BufferPtr<T> {
        ptr
    }

    fn supports_interleaved_matmul(&self) -> bool {
        true
    }
}

impl MatmulProvider for BufferBackend {}
impl ReduceProvider for BufferBackend {}
