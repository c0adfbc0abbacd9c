use crate::shape::Shape;

/// Faults that fall outside the validated-parameter control flow.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("Allocation of {bytes} bytes failed: {reason}")]
    Allocation { bytes: usize, reason: String },
    #[error("Kernel `{kernel}` failed: {message}")]
    KernelFault {
        kernel: &'static str,
        message: String,
    },
    #[error("Kernel `{kernel}` was not run, dependency `{dependency}` failed")]
    DependencyFault {
        kernel: &'static str,
        dependency: &'static str,
    },
    #[error("Could not build queue thread pool: {0}")]
    ThreadPool(String),
    #[error("Wrong shape: {got:?} expected {expected} elements")]
    WrongShape { expected: usize, got: Shape },
    #[error("No compatible device adapter found")]
    NoAdapter,
    #[error("Device request failed: {0}")]
    RequestDevice(String),
    #[error("Device buffer mapping failed: {0}")]
    BufferMap(String),
}

pub type Error = Box<ErrorKind>;

impl ErrorKind {
    pub(crate) fn allocation(bytes: usize, reason: impl ToString) -> Error {
        Box::new(ErrorKind::Allocation {
            bytes,
            reason: reason.to_string(),
        })
    }
}
