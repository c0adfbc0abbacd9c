use super::{Backend, MemoryProvider};
use crate::mem::DataType;
use crate::runtime::{DeviceInfo, Queue};

/// Presents a backend's internal pointers through [`MemoryProvider`], so a
/// launcher written for external pointers runs unchanged on internal ones.
///
/// Borrows the backend for the duration of a single launch.
#[derive(Debug)]
pub struct InternalBackend<'a, B: Backend> {
    underlying: &'a B,
}

impl<'a, B: Backend> InternalBackend<'a, B> {
    pub fn new(underlying: &'a B) -> Self {
        Self { underlying }
    }

    pub fn underlying(&self) -> &'a B {
        self.underlying
    }
}

impl<'a, B: Backend> MemoryProvider for InternalBackend<'a, B> {
    type Kind = B::Kind;
    type Pointer<T: DataType> = B::InternalPointer<T>;
    type MemObject<T: DataType> = B::MemObject<T>;

    fn get_mem_object<T: DataType>(
        &self,
        ptr: Self::Pointer<T>,
        n_elems: usize,
    ) -> Self::MemObject<T> {
        self.underlying.get_mem_object_internal(ptr, n_elems)
    }

    fn get_queue(&self) -> &Queue {
        self.underlying.get_queue()
    }

    fn device_info(&self) -> &DeviceInfo {
        self.underlying.device_info()
    }
}
