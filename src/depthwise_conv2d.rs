//! Depthwise 2D convolution: every input channel is convolved with its own
//! `channel_multiplier` filters.
//!
//! Data is NHWC, the filter is `[window_rows, window_cols, channels,
//! channel_multiplier]`, and output feature `c * channel_multiplier + m`
//! comes from input channel `c`.

use crate::back::MemoryProvider;
use crate::conv2d::{ConvType, Direction};
use crate::format::{DataFormat, ImageDims};
use crate::helpers::{check_index_range, size_of_dims, window_fits, PaddingAndOutput, WindowParams};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{validate_param, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthwiseConv2DParams {
    pub channels: usize,
    pub channel_multiplier: usize,
    pub batch: usize,
    pub in_rows: usize,
    pub in_cols: usize,
    pub window_rows: usize,
    pub window_cols: usize,
    pub stride_rows: usize,
    pub stride_cols: usize,
    pub out_rows: usize,
    pub out_cols: usize,
    pub pad_rows: usize,
    pub pad_cols: usize,
}

impl Default for DepthwiseConv2DParams {
    fn default() -> Self {
        Self {
            channels: 0,
            channel_multiplier: 1,
            batch: 1,
            in_rows: 0,
            in_cols: 0,
            window_rows: 0,
            window_cols: 0,
            stride_rows: 1,
            stride_cols: 1,
            out_rows: 0,
            out_cols: 0,
            pad_rows: 0,
            pad_cols: 0,
        }
    }
}

impl DepthwiseConv2DParams {
    pub fn features(&self) -> usize {
        self.channels * self.channel_multiplier
    }

    fn in_dims(&self) -> ImageDims {
        ImageDims::new(self.batch, self.in_rows, self.in_cols, self.channels)
    }

    fn out_dims(&self) -> ImageDims {
        ImageDims::new(self.batch, self.out_rows, self.out_cols, self.features())
    }

    #[inline(always)]
    fn filter_index(&self, r: usize, s: usize, c: usize, m: usize) -> usize {
        ((r * self.window_cols + s) * self.channels + c) * self.channel_multiplier + m
    }

    #[inline(always)]
    fn in_row(&self, o: usize, r: usize) -> Option<usize> {
        let i = (o * self.stride_rows + r).checked_sub(self.pad_rows)?;
        (i < self.in_rows).then_some(i)
    }

    #[inline(always)]
    fn in_col(&self, o: usize, c: usize) -> Option<usize> {
        let i = (o * self.stride_cols + c).checked_sub(self.pad_cols)?;
        (i < self.in_cols).then_some(i)
    }

    #[inline(always)]
    fn out_row(&self, i: usize, r: usize) -> Option<usize> {
        let shifted = (i + self.pad_rows).checked_sub(r)?;
        (shifted % self.stride_rows == 0 && shifted / self.stride_rows < self.out_rows)
            .then_some(shifted / self.stride_rows)
    }

    #[inline(always)]
    fn out_col(&self, i: usize, c: usize) -> Option<usize> {
        let shifted = (i + self.pad_cols).checked_sub(c)?;
        (shifted % self.stride_cols == 0 && shifted / self.stride_cols < self.out_cols)
            .then_some(shifted / self.stride_cols)
    }
}

impl WindowParams for DepthwiseConv2DParams {
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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DepthwiseSizes {
    pub input_size: usize,
    pub filter_size: usize,
    pub output_size: usize,
}

/// Element counts of the tensors passed to a launch in direction `C`, with
/// the same role swaps as [`crate::conv2d::get_sizes`].
pub fn get_sizes<C: ConvType>(params: &DepthwiseConv2DParams) -> DepthwiseSizes {
    let p = params;
    let x = size_of_dims(&[p.batch, p.in_rows, p.in_cols, p.channels]);
    let w = size_of_dims(&[p.window_rows, p.window_cols, p.channels, p.channel_multiplier]);
    let y = size_of_dims(&[p.batch, p.out_rows, p.out_cols, p.channels, p.channel_multiplier]);
    let (input_size, filter_size, output_size) = match C::DIRECTION {
        Direction::Forward => (x, w, y),
        Direction::InputBackprop => (y, w, x),
        Direction::FilterBackprop => (x, y, w),
    };
    DepthwiseSizes {
        input_size,
        filter_size,
        output_size,
    }
}

fn validate_params(p: &DepthwiseConv2DParams) -> Status {
    validate_param!(p.channels > 0, "The number of channels must be positive.");
    validate_param!(p.channel_multiplier > 0, "The channel multiplier must be positive.");
    validate_param!(p.batch > 0, "The batch size must be positive.");
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
    Status::default()
}

/// Runs a depthwise convolution in direction `C`, overwriting `output`.
pub fn launch<T: Float, C: ConvType, B: MemoryProvider>(
    input: B::Pointer<T>,
    filter: B::Pointer<T>,
    output: B::Pointer<T>,
    params: &DepthwiseConv2DParams,
    backend: &B,
    wait: &[Event],
) -> Status {
    let status = validate_params(params);
    if !status.is_ok() {
        return status;
    }
    let sizes = get_sizes::<C>(params);
    if let Err(code) = check_index_range(&[sizes.input_size, sizes.filter_size, sizes.output_size]) {
        return code.into();
    }
    log::debug!("depthwise {:?} {params:?}", C::DIRECTION);

    let input = backend.get_mem_object(input, sizes.input_size).as_const();
    let filter = backend.get_mem_object(filter, sizes.filter_size).as_const();
    let output = backend.get_mem_object(output, sizes.output_size);
    let p = *params;
    let (in_dims, out_dims) = (p.in_dims(), p.out_dims());
    let nhwc = DataFormat::NHWC;
    let mult = p.channel_multiplier;

    let event = match C::DIRECTION {
        Direction::Forward => backend.get_queue().submit("depthwise_conv2d", wait, |cgh| {
            let x = input.read_mem(cgh);
            let w = filter.read_mem(cgh);
            let y = output.write_mem(cgh);
            cgh.parallel_for(sizes.output_size, move |idx| {
                let (b, oh, ow, f) = nhwc.unflatten(&out_dims, idx);
                let (c, m) = (f / mult, f % mult);
                let mut acc = T::ZERO;
                for r in 0..p.window_rows {
                    let Some(ih) = p.in_row(oh, r) else { continue };
                    for s in 0..p.window_cols {
                        let Some(iw) = p.in_col(ow, s) else { continue };
                        acc += x.get(nhwc.index(&in_dims, b, ih, iw, c)) * w.get(p.filter_index(r, s, c, m));
                    }
                }
                y.set(idx, acc);
            });
        }),
        Direction::InputBackprop => backend.get_queue().submit("depthwise_conv2d_input", wait, |cgh| {
            let dy = input.read_mem(cgh);
            let w = filter.read_mem(cgh);
            let dx = output.write_mem(cgh);
            cgh.parallel_for(sizes.output_size, move |idx| {
                let (b, ih, iw, c) = nhwc.unflatten(&in_dims, idx);
                let mut acc = T::ZERO;
                for r in 0..p.window_rows {
                    let Some(oh) = p.out_row(ih, r) else { continue };
                    for s in 0..p.window_cols {
                        let Some(ow) = p.out_col(iw, s) else { continue };
                        for m in 0..mult {
                            acc += dy.get(nhwc.index(&out_dims, b, oh, ow, c * mult + m))
                                * w.get(p.filter_index(r, s, c, m));
                        }
                    }
                }
                dx.set(idx, acc);
            });
        }),
        Direction::FilterBackprop => backend.get_queue().submit("depthwise_conv2d_filter", wait, |cgh| {
            let x = input.read_mem(cgh);
            let dy = filter.read_mem(cgh);
            let dw = output.write_mem(cgh);
            cgh.parallel_for(sizes.output_size, move |idx| {
                let m = idx % mult;
                let rest = idx / mult;
                let c = rest % p.channels;
                let rs = rest / p.channels;
                let (r, s) = (rs / p.window_cols, rs % p.window_cols);
                let mut acc = T::ZERO;
                for b in 0..p.batch {
                    for oh in 0..p.out_rows {
                        let Some(ih) = p.in_row(oh, r) else { continue };
                        for ow in 0..p.out_cols {
                            let Some(iw) = p.in_col(ow, s) else { continue };
                            acc += x.get(nhwc.index(&in_dims, b, ih, iw, c))
                                * dy.get(nhwc.index(&out_dims, b, oh, ow, c * mult + m));
                        }
                    }
                }
                dw.set(idx, acc);
            });
        }),
    };
    Status::ok(event)
}
