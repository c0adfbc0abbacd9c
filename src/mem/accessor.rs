use super::{DataType, Storage};
use std::marker::PhantomData;
use std::sync::Arc;

macro_rules! accessor {
    ($(#[$m:meta])* $name:ident) => {
        $(#[$m])*
        pub struct $name<T: DataType> {
            storage: Arc<Storage<T::Word>>,
            offset: usize,
            extent: usize,
            _t: PhantomData<T>,
        }

        impl<T: DataType> $name<T> {
            pub(crate) fn new(storage: Arc<Storage<T::Word>>, offset: usize, extent: usize) -> Self {
                debug_assert!(offset + extent <= storage.len());
                Self {
                    storage,
                    offset,
                    extent,
                    _t: PhantomData,
                }
            }

            pub fn len(&self) -> usize {
                self.extent
            }

            pub fn is_empty(&self) -> bool {
                self.extent == 0
            }

            #[inline(always)]
            fn slot(&self, i: usize) -> usize {
                assert!(
                    i < self.extent,
                    "Access at {i} outside of {} elements",
                    self.extent
                );
                self.offset + i
            }
        }
    };
}

macro_rules! readable {
    ($name:ident) => {
        impl<T: DataType> $name<T> {
            #[inline(always)]
            pub fn get(&self, i: usize) -> T {
                T::from_word(self.storage.load(self.slot(i)))
            }

            pub fn to_vec(&self) -> Vec<T> {
                (0..self.extent).map(|i| self.get(i)).collect()
            }
        }
    };
}

macro_rules! writable {
    ($name:ident) => {
        impl<T: DataType> $name<T> {
            #[inline(always)]
            pub fn set(&self, i: usize, v: T) {
                self.storage.store(self.slot(i), v.to_word())
            }
        }
    };
}

accessor!(
    /// Read view bound to one command group.
    ReadMem
);
accessor!(
    /// Write view bound to one command group. Contents are undefined until written.
    WriteMem
);
accessor!(ReadWriteMem);

readable!(ReadMem);
readable!(ReadWriteMem);
writable!(WriteMem);
writable!(ReadWriteMem);
