//! 2D max and average pooling.

use crate::back::MemoryProvider;
use crate::format::{DataFormat, ImageDims};
use crate::helpers::{check_index_range, size_of_dims, window_fits, PaddingAndOutput, WindowParams};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{validate_param, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingParams {
    pub in_rows: usize,
    pub in_cols: usize,
    pub out_rows: usize,
    pub out_cols: usize,
    pub window_rows: usize,
    pub window_cols: usize,
    pub stride_rows: usize,
    pub stride_cols: usize,
    pub batch: usize,
    pub channels: usize,
    pub pad_rows: usize,
    pub pad_cols: usize,
    pub input_format: DataFormat,
}

impl PoolingParams {
    fn in_dims(&self) -> ImageDims {
        ImageDims::new(self.batch, self.in_rows, self.in_cols, self.channels)
    }

    fn out_dims(&self) -> ImageDims {
        ImageDims::new(self.batch, self.out_rows, self.out_cols, self.channels)
    }

    /// In-bounds `[start, end)` input rows and columns of the window of output
    /// `(row, col)`.
    #[inline(always)]
    fn window(&self, row: usize, col: usize) -> ([usize; 2], [usize; 2]) {
        let span = |o: usize, stride: usize, pad: usize, window: usize, size: usize| {
            let start = (o * stride) as isize - pad as isize;
            let end = (start + window as isize).min(size as isize);
            let start = start.max(0);
            [start as usize, end.max(start) as usize]
        };
        (
            span(row, self.stride_rows, self.pad_rows, self.window_rows, self.in_rows),
            span(col, self.stride_cols, self.pad_cols, self.window_cols, self.in_cols),
        )
    }

    /// Outputs whose window covers input `pos` along one axis, as `[first, last)`.
    #[inline(always)]
    fn covering(pos: usize, stride: usize, pad: usize, window: usize, out: usize) -> [usize; 2] {
        let padded = pos + pad;
        let first = if padded + 1 >= window {
            (padded + 1 - window + stride - 1) / stride
        } else {
            0
        };
        let last = (padded / stride + 1).min(out);
        [first, last.max(first)]
    }
}

impl Default for PoolingParams {
    fn default() -> Self {
        Self {
            in_rows: 0,
            in_cols: 0,
            out_rows: 0,
            out_cols: 0,
            window_rows: 0,
            window_cols: 0,
            stride_rows: 1,
            stride_cols: 1,
            batch: 1,
            channels: 0,
            pad_rows: 0,
            pad_cols: 0,
            input_format: DataFormat::NHWC,
        }
    }
}

impl WindowParams for PoolingParams {
    fn window_geometry(&self) -> [(usize, usize, usize); 2] {
        [
            (self.in_rows, self.window_rows, self.stride_rows),
            (self.in_cols, self.window_cols, self.stride_cols),
        ]
    }

    fn set_output_and_padding(&mut self, rows: PaddingAndOutput, cols: PaddingAndOutput) {
        self.out_rows = rows.output;
        self.pad_rows = rows.padding;
        self.out_cols = cols.output;
        self.pad_cols = cols.padding;
    }
}

pub trait PoolDirection: Send + Sync + 'static {
    const BACKPROP: bool;
}

/// Pooled output from input.
#[derive(Debug)]
pub enum Forward {}
/// Input gradient from output gradient.
#[derive(Debug)]
pub enum Backpropagate {}

impl PoolDirection for Forward {
    const BACKPROP: bool = false;
}

impl PoolDirection for Backpropagate {
    const BACKPROP: bool = true;
}

/// A reduction applied over each pooling window.
pub trait PoolType: Send + Sync + 'static {
    const NAME: &'static str;

    fn init<T: Float>() -> T;
    fn accumulate<T: Float>(acc: T, v: T) -> T;
    /// Pooled value from the accumulator and the number of in-bounds elements.
    fn value<T: Float>(acc: T, count: usize) -> T;
}

/// Max pooling whose gradient flows to the elements equal to the maximum.
pub trait MaxPoolType: PoolType {
    fn are_equal<T: Float>(a: T, b: T) -> bool;
}

#[derive(Debug)]
pub enum Max {}
/// Max pooling that propagates NaN.
#[derive(Debug)]
pub enum MaxWithNan {}
/// Average over the in-bounds elements only.
#[derive(Debug)]
pub enum Average {}

#[inline(always)]
#[allow(clippy::eq_op)]
fn is_nan<T: Float>(v: T) -> bool {
    v != v
}

impl PoolType for Max {
    const NAME: &'static str = "max_pool";

    fn init<T: Float>() -> T {
        T::LOWEST
    }
    #[inline(always)]
    fn accumulate<T: Float>(acc: T, v: T) -> T {
        if v > acc {
            v
        } else {
            acc
        }
    }
    fn value<T: Float>(acc: T, _: usize) -> T {
        acc
    }
}

impl MaxPoolType for Max {
    fn are_equal<T: Float>(a: T, b: T) -> bool {
        a == b
    }
}

impl PoolType for MaxWithNan {
    const NAME: &'static str = "max_pool_nan";

    fn init<T: Float>() -> T {
        T::LOWEST
    }
    #[inline(always)]
    fn accumulate<T: Float>(acc: T, v: T) -> T {
        if is_nan(v) || v > acc {
            v
        } else {
            acc
        }
    }
    fn value<T: Float>(acc: T, _: usize) -> T {
        acc
    }
}

impl MaxPoolType for MaxWithNan {
    fn are_equal<T: Float>(a: T, b: T) -> bool {
        a == b || (is_nan(a) && is_nan(b))
    }
}

impl PoolType for Average {
    const NAME: &'static str = "avg_pool";

    fn init<T: Float>() -> T {
        T::ZERO
    }
    #[inline(always)]
    fn accumulate<T: Float>(acc: T, v: T) -> T {
        acc + v
    }
    fn value<T: Float>(acc: T, count: usize) -> T {
        acc / T::from_usize(count)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolingSizes {
    pub input_size: usize,
    pub output_size: usize,
}

/// Element counts of the tensor read and the tensor written in direction `D`.
pub fn get_sizes<D: PoolDirection>(params: &PoolingParams) -> PoolingSizes {
    let p = params;
    let pooled = size_of_dims(&[p.batch, p.in_rows, p.in_cols, p.channels]);
    let unpooled = size_of_dims(&[p.batch, p.out_rows, p.out_cols, p.channels]);
    if D::BACKPROP {
        PoolingSizes {
            input_size: unpooled,
            output_size: pooled,
        }
    } else {
        PoolingSizes {
            input_size: pooled,
            output_size: unpooled,
        }
    }
}

fn validate_params<D: PoolDirection>(p: &PoolingParams) -> Status {
    validate_param!(p.batch > 0, "The batch size must be positive.");
    validate_param!(p.channels > 0, "The number of channels must be positive.");
    validate_param!(p.in_rows > 0, "The number of input rows must be positive.");
    validate_param!(p.in_cols > 0, "The number of input columns must be positive.");
    validate_param!(p.out_rows > 0, "The number of output rows must be positive.");
    validate_param!(p.out_cols > 0, "The number of output columns must be positive.");
    validate_param!(p.window_rows > 0, "The number of window rows must be positive.");
    validate_param!(p.window_cols > 0, "The number of window columns must be positive.");
    validate_param!(p.stride_rows > 0, "The stride in the row direction must be positive.");
    validate_param!(p.stride_cols > 0, "The stride in the column direction must be positive.");
    validate_param!(
        window_fits(p.in_rows, p.out_rows, p.window_rows, p.stride_rows, p.pad_rows),
        "The output rows do not match the input rows, window, stride and padding."
    );
    validate_param!(
        window_fits(p.in_cols, p.out_cols, p.window_cols, p.stride_cols, p.pad_cols),
        "The output columns do not match the input columns, window, stride and padding."
    );
    validate_param!(
        p.input_format == DataFormat::NHWC || !D::BACKPROP,
        "Pooling gradients support only the NHWC data format."
    );
    let sizes = get_sizes::<D>(p);
    if let Err(code) = check_index_range(&[sizes.input_size, sizes.output_size]) {
        return code.into();
    }
    Status::default()
}

/// A pooling type that runs in direction `D` from a single input tensor.
pub trait PoolKernel<D: PoolDirection>: PoolType {
    fn queue<T, B, In, Out>(
        backend: &B,
        input: In,
        output: Out,
        params: &PoolingParams,
        wait: &[Event],
    ) -> Event
    where
        T: Float,
        B: MemoryProvider,
        In: MemObject<T>,
        Out: MutMemObject<T>;
}

impl<P: PoolType> PoolKernel<Forward> for P {
    fn queue<T, B, In, Out>(
        backend: &B,
        input: In,
        output: Out,
        params: &PoolingParams,
        wait: &[Event],
    ) -> Event
    where
        T: Float,
        B: MemoryProvider,
        In: MemObject<T>,
        Out: MutMemObject<T>,
    {
        let p = *params;
        let (in_dims, out_dims) = (p.in_dims(), p.out_dims());
        let fmt = p.input_format;
        backend.get_queue().submit(P::NAME, wait, |cgh| {
            let inp = input.read_mem(cgh);
            let out = output.write_mem(cgh);
            cgh.parallel_for(out_dims.size(), move |idx| {
                let (b, row, col, ch) = fmt.unflatten(&out_dims, idx);
                let ([r0, r1], [c0, c1]) = p.window(row, col);
                let mut acc = P::init::<T>();
                for r in r0..r1 {
                    for c in c0..c1 {
                        acc = P::accumulate(acc, inp.get(fmt.index(&in_dims, b, r, c, ch)));
                    }
                }
                let count = (r1 - r0) * (c1 - c0);
                out.set(idx, P::value(acc, count));
            });
        })
    }
}

impl PoolKernel<Backpropagate> for Average {
    fn queue<T, B, In, Out>(
        backend: &B,
        input: In,
        output: Out,
        params: &PoolingParams,
        wait: &[Event],
    ) -> Event
    where
        T: Float,
        B: MemoryProvider,
        In: MemObject<T>,
        Out: MutMemObject<T>,
    {
        let p = *params;
        let (in_dims, out_dims) = (p.in_dims(), p.out_dims());
        backend.get_queue().submit("avg_pool_grad", wait, |cgh| {
            let grad = input.read_mem(cgh);
            let out = output.write_mem(cgh);
            cgh.parallel_for(in_dims.size(), move |idx| {
                let (b, r, c, ch) = DataFormat::NHWC.unflatten(&in_dims, idx);
                let [or0, or1] =
                    PoolingParams::covering(r, p.stride_rows, p.pad_rows, p.window_rows, p.out_rows);
                let [oc0, oc1] =
                    PoolingParams::covering(c, p.stride_cols, p.pad_cols, p.window_cols, p.out_cols);
                let mut acc = T::ZERO;
                for orow in or0..or1 {
                    for ocol in oc0..oc1 {
                        let ([r0, r1], [c0, c1]) = p.window(orow, ocol);
                        let count = T::from_usize((r1 - r0) * (c1 - c0));
                        acc += grad.get(DataFormat::NHWC.index(&out_dims, b, orow, ocol, ch)) / count;
                    }
                }
                out.set(idx, acc);
            });
        })
    }
}

/// Pools `input` into `output`, or for [`Backpropagate`] spreads the output
/// gradient in `input` back over the pooled tensor in `output`.
pub fn launch<T, P, D, B>(
    input: B::Pointer<T>,
    output: B::Pointer<T>,
    params: &PoolingParams,
    backend: &B,
    wait: &[Event],
) -> Status
where
    T: Float,
    D: PoolDirection,
    P: PoolKernel<D>,
    B: MemoryProvider,
{
    let status = validate_params::<D>(params);
    if !status.is_ok() {
        return status;
    }
    let sizes = get_sizes::<D>(params);
    let input = backend.get_mem_object(input, sizes.input_size).as_const();
    let output = backend.get_mem_object(output, sizes.output_size);
    log::debug!("{} {params:?}", P::NAME);
    Status::ok(<P as PoolKernel<D>>::queue::<T, B, _, _>(backend, input, output, params, wait))
}

/// Gradient of max pooling. Every input element equal to the maximum of a
/// window it belongs to receives that window's gradient.
pub fn launch_max_grad<T, P, B>(
    input_data: B::Pointer<T>,
    output_data: B::Pointer<T>,
    output_backprop: B::Pointer<T>,
    input_backprop: B::Pointer<T>,
    params: &PoolingParams,
    backend: &B,
    wait: &[Event],
) -> Status
where
    T: Float,
    P: MaxPoolType,
    B: MemoryProvider,
{
    let status = validate_params::<Backpropagate>(params);
    if !status.is_ok() {
        return status;
    }
    let sizes = get_sizes::<Forward>(params);
    let input_data = backend.get_mem_object(input_data, sizes.input_size).as_const();
    let output_data = backend.get_mem_object(output_data, sizes.output_size).as_const();
    let output_backprop = backend.get_mem_object(output_backprop, sizes.output_size).as_const();
    let input_backprop = backend.get_mem_object(input_backprop, sizes.input_size);

    let p = *params;
    let (in_dims, out_dims) = (p.in_dims(), p.out_dims());
    let nhwc = DataFormat::NHWC;
    let event = backend.get_queue().submit("max_pool_grad", wait, |cgh| {
        let x = input_data.read_mem(cgh);
        let y = output_data.read_mem(cgh);
        let dy = output_backprop.read_mem(cgh);
        let dx = input_backprop.write_mem(cgh);
        cgh.parallel_for(in_dims.size(), move |idx| {
            let (b, r, c, ch) = nhwc.unflatten(&in_dims, idx);
            let v = x.get(idx);
            let [or0, or1] =
                PoolingParams::covering(r, p.stride_rows, p.pad_rows, p.window_rows, p.out_rows);
            let [oc0, oc1] =
                PoolingParams::covering(c, p.stride_cols, p.pad_cols, p.window_cols, p.out_cols);
            let mut acc = T::ZERO;
            for orow in or0..or1 {
                for ocol in oc0..oc1 {
                    let o = nhwc.index(&out_dims, b, orow, ocol, ch);
                    if P::are_equal(v, y.get(o)) {
                        acc += dy.get(o);
                    }
                }
            }
            dx.set(idx, acc);
        });
    });
    Status::ok(event)
}
