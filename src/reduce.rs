//! Reduction over the middle axis of a `[batches, outer, inner]` tensor.

use crate::back::MemoryProvider;
use crate::helpers::{check_index_range, size_of_dims};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{validate_param, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReduceOp {
    Add,
    Mean,
    Max,
    Min,
}

impl ReduceOp {
    fn init<T: Float>(self) -> T {
        match self {
            ReduceOp::Add | ReduceOp::Mean => T::ZERO,
            ReduceOp::Max => T::LOWEST,
            ReduceOp::Min => T::HIGHEST,
        }
    }

    #[inline(always)]
    fn combine<T: Float>(self, acc: T, v: T) -> T {
        match self {
            ReduceOp::Add | ReduceOp::Mean => acc + v,
            ReduceOp::Max => acc.max(v),
            ReduceOp::Min => acc.min(v),
        }
    }
}

/// `output[b, i] = op over o of input[b, o, i]`.
#[allow(clippy::too_many_arguments)]
pub fn launch<T: Float, B: MemoryProvider>(
    input: B::Pointer<T>,
    output: B::Pointer<T>,
    op: ReduceOp,
    batches: usize,
    outer: usize,
    inner: usize,
    backend: &B,
    wait: &[Event],
) -> Status {
    validate_param!(batches > 0, "The number of batches must be positive.");
    validate_param!(outer > 0, "The outer size must be positive.");
    validate_param!(inner > 0, "The inner size must be positive.");
    let in_size = size_of_dims(&[batches, outer, inner]);
    let out_size = size_of_dims(&[batches, inner]);
    if let Err(code) = check_index_range(&[in_size, out_size]) {
        return code.into();
    }

    let input = backend.get_mem_object(input, in_size).as_const();
    let output = backend.get_mem_object(output, out_size);
    let event = backend.get_queue().submit("reduce", wait, |cgh| {
        let inp = input.read_mem(cgh);
        let out = output.write_mem(cgh);
        let count = T::from_usize(outer);
        cgh.parallel_for(out_size, move |idx| {
            let (b, i) = (idx / inner, idx % inner);
            let base = b * outer * inner + i;
            let mut acc = op.init::<T>();
            for o in 0..outer {
                acc = op.combine(acc, inp.get(base + o * inner));
            }
            if op == ReduceOp::Mean {
                acc = acc / count;
            }
            out.set(idx, acc);
        });
    });
    Status::ok(event)
}
