//! Per-channel bias addition.

use crate::back::MemoryProvider;
use crate::format::{DataFormat, ImageDims};
use crate::helpers::{check_index_range, size_of_dims};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{validate_param, Status};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BiasParams {
    pub batch: usize,
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
    pub input_format: DataFormat,
}

impl Default for BiasParams {
    fn default() -> Self {
        Self {
            batch: 1,
            rows: 0,
            cols: 0,
            channels: 0,
            input_format: DataFormat::NHWC,
        }
    }
}

/// `output[b, r, c, ch] = input[b, r, c, ch] + bias[ch]`.
pub fn launch<T: Float, B: MemoryProvider>(
    input: B::Pointer<T>,
    bias: B::Pointer<T>,
    output: B::Pointer<T>,
    params: &BiasParams,
    backend: &B,
    wait: &[Event],
) -> Status {
    let p = *params;
    validate_param!(p.batch > 0, "The batch size must be positive.");
    validate_param!(p.rows > 0, "The number of rows must be positive.");
    validate_param!(p.cols > 0, "The number of columns must be positive.");
    validate_param!(p.channels > 0, "The number of channels must be positive.");
    let size = size_of_dims(&[p.batch, p.rows, p.cols, p.channels]);
    if let Err(code) = check_index_range(&[size]) {
        return code.into();
    }

    let dims = ImageDims::new(p.batch, p.rows, p.cols, p.channels);
    let fmt = p.input_format;
    let input = backend.get_mem_object(input, size).as_const();
    let bias = backend.get_mem_object(bias, p.channels).as_const();
    let output = backend.get_mem_object(output, size);
    let event = backend.get_queue().submit("bias_add", wait, |cgh| {
        let inp = input.read_mem(cgh);
        let bias = bias.read_mem(cgh);
        let out = output.write_mem(cgh);
        cgh.parallel_for(size, move |idx| {
            let (_, _, _, ch) = fmt.unflatten(&dims, idx);
            out.set(idx, inp.get(idx) + bias.get(ch));
        });
    });
    Status::ok(event)
}
