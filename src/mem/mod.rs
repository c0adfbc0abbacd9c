//! Element types, device storage and the memory objects kernels read through.

mod accessor;
mod object;
mod storage;

pub use accessor::{ReadMem, ReadWriteMem, WriteMem};
pub use object::{
    make_buffer_mem_object, make_usm_mem_object, Access, BufferKind, BufferMemObject, MemObject,
    MutMemObject, ReadOnly, ReadWrite, StorageKind, UsmKind, UsmMemObject,
};
pub use storage::{Buffer, Storage};

use std::fmt::Debug;
use std::ops::{Add, AddAssign, Div, Mul, MulAssign, Neg, Sub};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Machine word backing one element. Stored in atomic cells so that kernels
/// on different workers can share storage.
pub trait Word: Copy + PartialEq + Debug + Send + Sync + 'static {
    type Cell: Send + Sync + 'static;
    const ZERO: Self;

    fn cell(self) -> Self::Cell;
    fn load(cell: &Self::Cell) -> Self;
    fn store(cell: &Self::Cell, v: Self);
}

impl Word for u32 {
    type Cell = AtomicU32;
    const ZERO: Self = 0;

    fn cell(self) -> Self::Cell {
        AtomicU32::new(self)
    }
    #[inline(always)]
    fn load(cell: &Self::Cell) -> Self {
        cell.load(Ordering::Relaxed)
    }
    #[inline(always)]
    fn store(cell: &Self::Cell, v: Self) {
        cell.store(v, Ordering::Relaxed)
    }
}

impl Word for u64 {
    type Cell = AtomicU64;
    const ZERO: Self = 0;

    fn cell(self) -> Self::Cell {
        AtomicU64::new(self)
    }
    #[inline(always)]
    fn load(cell: &Self::Cell) -> Self {
        cell.load(Ordering::Relaxed)
    }
    #[inline(always)]
    fn store(cell: &Self::Cell, v: Self) {
        cell.store(v, Ordering::Relaxed)
    }
}

/// A type that can live in device memory.
///
/// Two types with the same `Word` have the same size, which is what
/// [`BufferMemObject::cast`] relies on.
pub trait DataType: Copy + Default + PartialEq + PartialOrd + Debug + Send + Sync + 'static {
    type Word: Word;
    const NAME: &'static str;

    fn to_word(self) -> Self::Word;
    fn from_word(w: Self::Word) -> Self;
}

macro_rules! data_type {
    ($t:ty, $w:ty, $to:expr, $from:expr) => {
        impl DataType for $t {
            type Word = $w;
            const NAME: &'static str = stringify!($t);

            #[inline(always)]
            fn to_word(self) -> $w {
                $to(self)
            }
            #[inline(always)]
            fn from_word(w: $w) -> Self {
                $from(w)
            }
        }
    };
}

data_type!(f32, u32, f32::to_bits, f32::from_bits);
data_type!(f64, u64, f64::to_bits, f64::from_bits);
data_type!(u32, u32, |v| v, |w| w);
data_type!(i32, u32, |v: i32| v as u32, |w: u32| w as i32);
data_type!(u64, u64, |v| v, |w| w);
data_type!(i64, u64, |v: i64| v as u64, |w: u64| w as i64);

/// Element types the numeric kernels are instantiated for.
pub trait Float:
    DataType
    + Add<Output = Self>
    + Sub<Output = Self>
    + Mul<Output = Self>
    + Div<Output = Self>
    + Neg<Output = Self>
    + AddAssign
    + MulAssign
{
    const ZERO: Self;
    const ONE: Self;
    const LOWEST: Self;
    const HIGHEST: Self;

    fn from_f64(v: f64) -> Self;
    fn to_f64(self) -> f64;
    fn max(self, other: Self) -> Self;
    fn min(self, other: Self) -> Self;
    fn exp(self) -> Self;
    fn tanh(self) -> Self;
    fn sqrt(self) -> Self;

    fn from_usize(n: usize) -> Self {
        Self::from_f64(n as f64)
    }
}

macro_rules! float {
    ($t:ident) => {
        impl Float for $t {
            const ZERO: Self = 0.0;
            const ONE: Self = 1.0;
            const LOWEST: Self = $t::MIN;
            const HIGHEST: Self = $t::MAX;

            #[inline(always)]
            fn from_f64(v: f64) -> Self {
                v as $t
            }
            #[inline(always)]
            fn to_f64(self) -> f64 {
                self as f64
            }
            #[inline(always)]
            fn max(self, other: Self) -> Self {
                $t::max(self, other)
            }
            #[inline(always)]
            fn min(self, other: Self) -> Self {
                $t::min(self, other)
            }
            #[inline(always)]
            fn exp(self) -> Self {
                $t::exp(self)
            }
            #[inline(always)]
            fn tanh(self) -> Self {
                $t::tanh(self)
            }
            #[inline(always)]
            fn sqrt(self) -> Self {
                $t::sqrt(self)
            }
        }
    };
}

float!(f32);
float!(f64);
