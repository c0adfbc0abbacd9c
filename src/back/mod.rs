//! Backend capability contract.
//!
//! Kernel launchers are written once against [`MemoryProvider`]. A backend
//! exposes its external pointers through it directly, and its internal
//! pointers through the [`InternalBackend`] bridge.

mod buffer;
mod heap;
mod internal;
mod mapped;
mod pointer;
mod usm;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use buffer::BufferBackend;
pub use internal::InternalBackend;
pub use mapped::MappedBackend;
pub use pointer::{BufferPtr, DevicePointer, DevicePtr};
pub use usm::UsmBackend;

use crate::error::{Error, ErrorKind};
use crate::matmul::{self, MatmulParams};
use crate::mem::{DataType, Float, MemObject, MutMemObject, StorageKind};
use crate::reduce::{self, ReduceOp};
use crate::runtime::{DeviceInfo, Event, Queue};
use crate::shape::Shape;
use ndarray::{ArcArray, IxDyn};
use std::sync::mpsc;

/// Pointer-shaped view of device memory plus the queue to run kernels on.
pub trait MemoryProvider {
    type Kind: StorageKind;
    type Pointer<T: DataType>: DevicePointer<T>;
    type MemObject<T: DataType>: MutMemObject<T, Kind = Self::Kind>;

    /// View of the `n_elems` elements starting at `ptr`.
    ///
    /// Panics for null, freed or too small allocations.
    fn get_mem_object<T: DataType>(&self, ptr: Self::Pointer<T>, n_elems: usize)
        -> Self::MemObject<T>;

    fn get_queue(&self) -> &Queue;

    fn device_info(&self) -> &DeviceInfo;

    fn supports_subgroup(&self) -> bool {
        self.device_info().supports_subgroup
    }

    /// Copies `data`, in logical order, to the elements at `ptr`.
    fn upload<T: DataType>(
        &self,
        ptr: Self::Pointer<T>,
        data: ArcArray<T, IxDyn>,
        wait: &[Event],
    ) -> Event {
        let mem = self.get_mem_object(ptr, data.len());
        self.get_queue().submit("upload", wait, move |cgh| {
            let out = mem.write_mem(cgh);
            cgh.single_task(move || {
                for (i, v) in data.iter().enumerate() {
                    out.set(i, *v);
                }
            })
        })
    }

    /// Reads `shape.prod()` elements at `ptr` once `wait` has completed.
    fn download<T: DataType>(
        &self,
        ptr: Self::Pointer<T>,
        shape: &Shape,
        wait: &[Event],
    ) -> Result<ArcArray<T, IxDyn>, Error> {
        let mem = self.get_mem_object(ptr, shape.prod()).as_const();
        let (tx, rx) = mpsc::channel();
        self.get_queue()
            .submit("download", wait, move |cgh| {
                let inp = mem.read_mem(cgh);
                cgh.single_task(move || {
                    let _ = tx.send(inp.to_vec());
                })
            })
            .wait()?;

        let data = rx.recv().map_err(|e| ErrorKind::KernelFault {
            kernel: "download",
            message: e.to_string(),
        })?;
        Ok(ArcArray::from_shape_vec(shape.ix(), data).map_err(|_| ErrorKind::WrongShape {
            expected: shape.prod(),
            got: shape.clone(),
        })?)
    }
}

/// A device session: one queue, an allocator and the pointer conversions.
pub trait Backend: MemoryProvider + Sized {
    type InternalPointer<T: DataType>: DevicePointer<T>;

    fn name(&self) -> &'static str;

    fn allocate<T: DataType>(&self, n_elems: usize) -> Result<Self::Pointer<T>, Error>;

    fn deallocate<T: DataType>(&self, ptr: Self::Pointer<T>);

    fn get_mem_object_internal<T: DataType>(
        &self,
        ptr: Self::InternalPointer<T>,
        n_elems: usize,
    ) -> Self::MemObject<T>;

    fn to_internal_pointer<T: DataType>(&self, ptr: Self::Pointer<T>) -> Self::InternalPointer<T>;

    fn release_internal_pointer<T: DataType>(&self, _ptr: Self::InternalPointer<T>) {}

    /// Whether [`MatmulProvider::matmul`] accepts [`matmul::BatchFormat::Interleaved`].
    fn supports_interleaved_matmul(&self) -> bool {
        false
    }
}

/// Matrix multiply on internal pointers.
pub trait MatmulProvider: Backend {
    fn matmul<T: Float>(
        &self,
        lhs: Self::InternalPointer<T>,
        rhs: Self::InternalPointer<T>,
        output: Self::InternalPointer<T>,
        params: &MatmulParams,
        wait: &[Event],
    ) -> Event {
        let status = matmul::launch::<T, _>(lhs, rhs, output, params, &InternalBackend::new(self), wait);
        assert!(status.is_ok(), "{} matmul rejected {params:?}: {}", self.name(), status.status);
        status.event
    }
}

/// Reduction on internal pointers.
pub trait ReduceProvider: Backend {
    #[allow(clippy::too_many_arguments)]
    fn reduce<T: Float>(
        &self,
        input: Self::InternalPointer<T>,
        output: Self::InternalPointer<T>,
        op: ReduceOp,
        batches: usize,
        outer: usize,
        inner: usize,
        wait: &[Event],
    ) -> Event {
        let status = reduce::launch::<T, _>(
            input,
            output,
            op,
            batches,
            outer,
            inner,
            &InternalBackend::new(self),
            wait,
        );
        assert!(status.is_ok(), "{} reduce rejected its parameters: {}", self.name(), status.status);
        status.event
    }
}

/// Whether `B` hands out raw device addresses rather than buffers.
pub fn is_usm_backend<B: MemoryProvider>() -> bool {
    <B::Kind as StorageKind>::IS_USM
}

