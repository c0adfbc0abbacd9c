//! Portable neural network primitives over a host device queue.
//!
//! Every operation validates its parameters, submits its kernels to the
//! backend's [`runtime::Queue`] and returns a [`Status`] carrying the
//! [`runtime::Event`] of the last submitted kernel. Nothing blocks unless
//! the caller waits on that event.

pub mod back;
pub mod batchnorm;
pub mod bias;
pub mod binaryop;
pub mod conv2d;
pub mod depthwise_conv2d;
pub mod error;
pub mod format;
pub mod helpers;
pub mod matmul;
pub mod mem;
pub mod pointwise;
pub mod pooling;
pub mod reduce;
pub mod runtime;
pub mod shape;
pub mod softmax;
pub mod status;
pub mod transpose;

pub use back::{Backend, BufferBackend, MappedBackend, MatmulProvider, MemoryProvider, UsmBackend};
pub use error::{Error, ErrorKind};
pub use format::{DataFormat, FilterFormat};
pub use helpers::PaddingMode;
pub use runtime::{Event, Queue, QueueConfig};
pub use shape::Shape;
pub use status::{Status, StatusCode};
