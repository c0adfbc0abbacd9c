//! Elementwise arithmetic between two tensors with broadcasting.

use crate::back::MemoryProvider;
use crate::helpers::{check_index_range, size_of_dims};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{validate_param, Status};

pub const MAX_DIMS: usize = 6;

pub trait BinaryOp: Send + Sync + 'static {
    const NAME: &'static str;

    fn apply<T: Float>(lhs: T, rhs: T) -> T;
}

#[derive(Debug)]
pub enum Add {}
#[derive(Debug)]
pub enum Sub {}
#[derive(Debug)]
pub enum Mul {}
#[derive(Debug)]
pub enum Div {}

macro_rules! binary_op {
    ($op:ident, $name:literal, $f:tt) => {
        impl BinaryOp for $op {
            const NAME: &'static str = $name;

            #[inline(always)]
            fn apply<T: Float>(lhs: T, rhs: T) -> T {
                lhs $f rhs
            }
        }
    };
}

binary_op!(Add, "binary_add", +);
binary_op!(Sub, "binary_sub", -);
binary_op!(Mul, "binary_mul", *);
binary_op!(Div, "binary_div", /);

/// Operand shapes. An empty shape is a scalar.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryParams {
    pub lhs_dims: Vec<usize>,
    pub rhs_dims: Vec<usize>,
}

/// Broadcast shape of `lhs` and `rhs`, aligned on their trailing dimensions.
///
/// `None` when a pair of dimensions differs and neither is 1.
pub fn output_dims(lhs: &[usize], rhs: &[usize]) -> Option<Vec<usize>> {
    let rank = lhs.len().max(rhs.len()).max(1);
    let (lhs, rhs) = (left_pad(lhs, rank), left_pad(rhs, rank));
    lhs.iter()
        .zip(&rhs)
        .map(|(&l, &r)| (l == r || l == 1 || r == 1).then(|| l.max(r)))
        .collect()
}

fn left_pad(dims: &[usize], rank: usize) -> Vec<usize> {
    let mut padded = vec![1; rank - dims.len()];
    padded.extend_from_slice(dims);
    padded
}

/// Element strides of `dims` read through the broadcast shape; 0 along
/// broadcast dimensions.
fn broadcast_strides(dims: &[usize], rank: usize) -> [usize; MAX_DIMS] {
    let dims = left_pad(dims, rank);
    let mut strides = [0; MAX_DIMS];
    let mut step = 1;
    for (i, &d) in dims.iter().enumerate().rev() {
        strides[i] = if d == 1 { 0 } else { step };
        step *= d;
    }
    strides
}

/// `output = Op(lhs, rhs)` over the broadcast shape of the two operands.
pub fn launch<T: Float, Op: BinaryOp, B: MemoryProvider>(
    lhs: B::Pointer<T>,
    rhs: B::Pointer<T>,
    output: B::Pointer<T>,
    params: &BinaryParams,
    backend: &B,
    wait: &[Event],
) -> Status {
    let p = params;
    validate_param!(
        p.lhs_dims.len() <= MAX_DIMS,
        "Left operand size exceeds the maximum number of dimensions."
    );
    validate_param!(
        p.rhs_dims.len() <= MAX_DIMS,
        "Right operand size exceeds the maximum number of dimensions."
    );
    let lhs_size = size_of_dims(&p.lhs_dims);
    let rhs_size = size_of_dims(&p.rhs_dims);
    validate_param!(lhs_size > 0, "Left operand size cannot be zero.");
    validate_param!(rhs_size > 0, "Right operand size cannot be zero.");
    let out_dims = output_dims(&p.lhs_dims, &p.rhs_dims);
    validate_param!(out_dims.is_some(), "Dimensions cannot be broadcasted.");
    let out_dims = out_dims.unwrap_or_default();
    let out_size = size_of_dims(&out_dims);
    if let Err(code) = check_index_range(&[lhs_size, rhs_size, out_size]) {
        return code.into();
    }

    let rank = out_dims.len();
    let mut shape = [1; MAX_DIMS];
    shape[..rank].copy_from_slice(&out_dims);
    let lhs_strides = broadcast_strides(&p.lhs_dims, rank);
    let rhs_strides = broadcast_strides(&p.rhs_dims, rank);

    let lhs = backend.get_mem_object(lhs, lhs_size).as_const();
    let rhs = backend.get_mem_object(rhs, rhs_size).as_const();
    let output = backend.get_mem_object(output, out_size);
    let event = backend.get_queue().submit(Op::NAME, wait, |cgh| {
        let a = lhs.read_mem(cgh);
        let b = rhs.read_mem(cgh);
        let out = output.write_mem(cgh);
        cgh.parallel_for(out_size, move |idx| {
            let (mut rest, mut l, mut r) = (idx, 0, 0);
            for d in (0..rank).rev() {
                let pos = rest % shape[d];
                rest /= shape[d];
                l += pos * lhs_strides[d];
                r += pos * rhs_strides[d];
            }
            out.set(idx, Op::apply(a.get(l), b.get(r)));
        });
    });
    Status::ok(event)
}
