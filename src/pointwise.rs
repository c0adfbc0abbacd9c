//! Elementwise activations and their gradients.

use crate::back::MemoryProvider;
use crate::helpers::check_index_range;
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{validate_param, Status};

/// An activation whose gradient can be recovered from its forward output.
pub trait PointwiseOp: Send + Sync + 'static {
    const NAME: &'static str;
    const GRAD_NAME: &'static str;

    fn forward<T: Float>(x: T) -> T;
    /// Input gradient from the forward output `y` and the output gradient.
    fn gradient<T: Float>(y: T, dy: T) -> T;
}

/// `max(x, 0)`, with a zero gradient at `x == 0`.
#[derive(Debug)]
pub enum Relu {}
#[derive(Debug)]
pub enum Tanh {}
#[derive(Debug)]
pub enum Exp {}
#[derive(Debug)]
pub enum Sqrt {}

impl PointwiseOp for Relu {
    const NAME: &'static str = "relu";
    const GRAD_NAME: &'static str = "relu_grad";

    #[inline(always)]
    fn forward<T: Float>(x: T) -> T {
        x.max(T::ZERO)
    }
    #[inline(always)]
    fn gradient<T: Float>(y: T, dy: T) -> T {
        if y > T::ZERO {
            dy
        } else {
            T::ZERO
        }
    }
}

impl PointwiseOp for Tanh {
    const NAME: &'static str = "tanh";
    const GRAD_NAME: &'static str = "tanh_grad";

    #[inline(always)]
    fn forward<T: Float>(x: T) -> T {
        x.tanh()
    }
    #[inline(always)]
    fn gradient<T: Float>(y: T, dy: T) -> T {
        (T::ONE - y * y) * dy
    }
}

impl PointwiseOp for Exp {
    const NAME: &'static str = "exp";
    const GRAD_NAME: &'static str = "exp_grad";

    #[inline(always)]
    fn forward<T: Float>(x: T) -> T {
        x.exp()
    }
    #[inline(always)]
    fn gradient<T: Float>(y: T, dy: T) -> T {
        y * dy
    }
}

impl PointwiseOp for Sqrt {
    const NAME: &'static str = "sqrt";
    const GRAD_NAME: &'static str = "sqrt_grad";

    #[inline(always)]
    fn forward<T: Float>(x: T) -> T {
        x.sqrt()
    }
    #[inline(always)]
    fn gradient<T: Float>(y: T, dy: T) -> T {
        dy / (y + y)
    }
}

/// `output[i] = Op(input[i])` for `n_items` elements. `input` may equal `output`.
pub fn launch<T: Float, Op: PointwiseOp, B: MemoryProvider>(
    input: B::Pointer<T>,
    output: B::Pointer<T>,
    n_items: usize,
    backend: &B,
    wait: &[Event],
) -> Status {
    validate_param!(n_items > 0, "The number of items must be positive.");
    if let Err(code) = check_index_range(&[n_items]) {
        return code.into();
    }

    let input = backend.get_mem_object(input, n_items).as_const();
    let output = backend.get_mem_object(output, n_items);
    let event = backend.get_queue().submit(Op::NAME, wait, |cgh| {
        let inp = input.read_mem(cgh);
        let out = output.write_mem(cgh);
        cgh.parallel_for(n_items, move |i| out.set(i, Op::forward(inp.get(i))));
    });
    Status::ok(event)
}

/// `input_grad[i]` from the forward output and the gradient flowing into it.
pub fn launch_gradient<T: Float, Op: PointwiseOp, B: MemoryProvider>(
    output_forward: B::Pointer<T>,
    output_grad: B::Pointer<T>,
    input_grad: B::Pointer<T>,
    n_items: usize,
    backend: &B,
    wait: &[Event],
) -> Status {
    validate_param!(n_items > 0, "The number of items must be positive.");
    if let Err(code) = check_index_range(&[n_items]) {
        return code.into();
    }

    let forward = backend.get_mem_object(output_forward, n_items).as_const();
    let grad = backend.get_mem_object(output_grad, n_items).as_const();
    let input_grad = backend.get_mem_object(input_grad, n_items);
    let event = backend.get_queue().submit(Op::GRAD_NAME, wait, |cgh| {
        let y = forward.read_mem(cgh);
        let dy = grad.read_mem(cgh);
        let dx = input_grad.write_mem(cgh);
        cgh.parallel_for(n_items, move |i| dx.set(i, Op::gradient(y.get(i), dy.get(i))));
    });
    Status::ok(event)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::back::{Backend, BufferBackend, UsmBackend};
    use crate::shape;
    use crate::status::StatusCode;
    use ndarray::{ArcArray, IxDyn};

    fn run<Op: PointwiseOp>(data: &[f64]) -> (Vec<f64>, Vec<f64>) {
        let b = BufferBackend::host().unwrap();
        let n = data.len();
        let x = b.allocate::<f64>(n).unwrap();
        let y = b.allocate::<f64>(n).unwrap();
        let dy = b.allocate::<f64>(n).unwrap();
        let dx = b.allocate::<f64>(n).unwrap();
        let up_x = b.upload(x.clone(), ArcArray::from_shape_vec(IxDyn(&[n]), data.to_vec()).unwrap(), &[]);
        let up_dy = b.upload(dy.clone(), ArcArray::from_elem(IxDyn(&[n]), 1.0), &[]);

        let fwd = launch::<f64, Op, _>(x, y.clone(), n, &b, &[up_x]);
        assert!(fwd.is_ok());
        let grad = launch_gradient::<f64, Op, _>(y.clone(), dy, dx.clone(), n, &b, &[fwd.event.clone(), up_dy]);
        assert!(grad.is_ok());
        let y = b.download(y, &shape![n], &[fwd.event]).unwrap();
        let dx = b.download(dx, &shape![n], &[grad.event]).unwrap();
        (y.iter().copied().collect(), dx.iter().copied().collect())
    }

    #[test]
    fn test_activations() {
        let (y, dx) = run::<Relu>(&[-2., 0., 3.]);
        assert_eq!(y, [0., 0., 3.]);
        assert_eq!(dx, [0., 0., 1.]);

        let (y, dx) = run::<Tanh>(&[-1., 0., 0.5]);
        for ((y, dx), x) in y.iter().zip(&dx).zip([-1f64, 0., 0.5]) {
            assert!((y - x.tanh()).abs() < 1e-12);
            assert!((dx - (1. - x.tanh().powi(2))).abs() < 1e-12);
        }

        let (y, dx) = run::<Exp>(&[0., 1.]);
        assert!((y[1] - std::f64::consts::E).abs() < 1e-12);
        assert_eq!(y, dx);

        let (y, dx) = run::<Sqrt>(&[4., 9.]);
        assert_eq!(y, [2., 3.]);
        assert!((dx[0] - 0.25).abs() < 1e-12);
        assert!((dx[1] - 1. / 6.).abs() < 1e-12);
    }

    #[test]
    fn test_in_place_on_usm() {
        let b = UsmBackend::host().unwrap();
        let x = b.allocate::<f32>(4).unwrap();
        let up = b.upload(x, ArcArray::from_shape_vec(IxDyn(&[4]), vec![-1., 2., -3., 4.]).unwrap(), &[]);
        let status = launch::<f32, Relu, _>(x, x, 4, &b, &[up]);
        let res = b.download(x, &shape![4], &[status.event]).unwrap();
        assert_eq!(res.as_slice().unwrap(), &[0., 2., 0., 4.]);
    }

    #[test]
    fn test_rejects_empty() {
        let b = BufferBackend::host().unwrap();
        let x = b.allocate::<f32>(1).unwrap();
        let status = launch::<f32, Tanh, _>(x.clone(), x, 0, &b, &[]);
        assert_eq!(status.status, StatusCode::InvalidParameter);
    }
}
