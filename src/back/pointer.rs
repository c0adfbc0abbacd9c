use crate::mem::{Buffer, DataType};
use derivative::Derivative;
use std::fmt::Debug;
use std::marker::PhantomData;
use std::mem::size_of;
use std::ops::{Add, AddAssign};

/// Handle to device memory. Arithmetic moves the handle, never the data.
pub trait DevicePointer<T: DataType>:
    Clone + Debug + Send + Sync + 'static + Add<usize, Output = Self> + AddAssign<usize>
{
    fn null() -> Self;
    fn is_null(&self) -> bool;
}

/// A buffer plus an element offset into it.
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""), Default(bound = ""))]
pub struct BufferPtr<T: DataType> {
    buffer: Option<Buffer<T::Word>>,
    offset: usize,
    #[derivative(Debug = "ignore")]
    _t: PhantomData<T>,
}

impl<T: DataType> BufferPtr<T> {
    pub fn new(buffer: Buffer<T::Word>, offset: usize) -> Self {
        Self {
            buffer: Some(buffer),
            offset,
            _t: PhantomData,
        }
    }

    pub fn buffer(&self) -> Option<&Buffer<T::Word>> {
        self.buffer.as_ref()
    }

    /// Elements from the start of the buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn same_storage(&self, other: &BufferPtr<T>) -> bool {
        match (&self.buffer, &other.buffer) {
            (Some(a), Some(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl<T: DataType> Add<usize> for BufferPtr<T> {
    type Output = Self;

    fn add(mut self, rhs: usize) -> Self::Output {
        self.offset += rhs;
        self
    }
}

impl<T: DataType> AddAssign<usize> for BufferPtr<T> {
    fn add_assign(&mut self, rhs: usize) {
        self.offset += rhs;
    }
}

impl<T: DataType> DevicePointer<T> for BufferPtr<T> {
    fn null() -> Self {
        Self::default()
    }

    fn is_null(&self) -> bool {
        self.buffer.is_none()
    }
}

/// Raw device address in bytes. Zero is null.
#[derive(Derivative)]
#[derivative(
    Debug(bound = ""),
    Clone(bound = ""),
    Copy(bound = ""),
    PartialEq(bound = ""),
    Eq(bound = ""),
    Hash(bound = ""),
    Default(bound = "")
)]
pub struct DevicePtr<T: DataType> {
    addr: u64,
    #[derivative(Debug = "ignore", PartialEq = "ignore", Hash = "ignore")]
    _t: PhantomData<fn() -> T>,
}

impl<T: DataType> DevicePtr<T> {
    pub(crate) fn from_addr(addr: u64) -> Self {
        Self {
            addr,
            _t: PhantomData,
        }
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }
}

impl<T: DataType> Add<usize> for DevicePtr<T> {
    type Output = Self;

    fn add(self, rhs: usize) -> Self::Output {
        Self::from_addr(self.addr + (rhs * size_of::<T>()) as u64)
    }
}

impl<T: DataType> AddAssign<usize> for DevicePtr<T> {
    fn add_assign(&mut self, rhs: usize) {
        self.addr += (rhs * size_of::<T>()) as u64;
    }
}

impl<T: DataType> DevicePointer<T> for DevicePtr<T> {
    fn null() -> Self {
        Self::from_addr(0)
    }

    fn is_null(&self) -> bool {
        self.addr == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_offset_round_trip() {
        let buf = Buffer::<u32>::new(64).unwrap();
        let p = BufferPtr::<f32>::new(buf, 3);
        for a in 0..8 {
            for b in 0..8 {
                let mut q = p.clone() + a;
                q += b;
                assert!(q.same_storage(&p));
                assert_eq!(q.offset(), p.offset() + a + b);
            }
        }
        assert_eq!(p.buffer().unwrap().len(), 64);
        assert!(BufferPtr::<f32>::null().is_null());

        let d = DevicePtr::<f64>::from_addr(4096);
        assert_eq!((d + 2 + 3).addr(), 4096 + 5 * 8);
        assert!(DevicePtr::<f64>::null().is_null());
    }
}
