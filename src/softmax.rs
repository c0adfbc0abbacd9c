//! Softmax over the channel dimension and its gradient.
//!
//! Both directions keep one value per `(batch, row, col)` position in a
//! caller-provided workspace of [`workspace_size`] elements.

use crate::back::MemoryProvider;
use crate::format::{DataFormat, ImageDims};
use crate::helpers::{check_index_range, size_of_dims};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{Status, StatusCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SoftmaxParams {
    pub batch: usize,
    pub rows: usize,
    pub cols: usize,
    /// Classes the distribution is taken over.
    pub channels: usize,
    pub input_format: DataFormat,
}

impl Default for SoftmaxParams {
    fn default() -> Self {
        Self {
            batch: 1,
            rows: 1,
            cols: 1,
            channels: 0,
            input_format: DataFormat::NHWC,
        }
    }
}

impl SoftmaxParams {
    fn dims(&self) -> ImageDims {
        ImageDims::new(self.batch, self.rows, self.cols, self.channels)
    }

    /// Offset of the first channel at position `pos`, and the step between channels.
    #[inline(always)]
    fn locate(&self, pos: usize) -> (usize, usize) {
        let plane = self.rows * self.cols;
        match self.input_format {
            DataFormat::NHWC => (pos * self.channels, 1),
            DataFormat::NCHW => ((pos / plane) * plane * self.channels + pos % plane, plane),
        }
    }
}

pub fn workspace_size(params: &SoftmaxParams) -> usize {
    size_of_dims(&[params.batch, params.rows, params.cols])
}

fn validate(p: &SoftmaxParams, workspace_len: usize) -> Result<(usize, usize), Status> {
    fn invalid(msg: &str) -> Status {
        log::warn!("invalid parameter: {msg}");
        StatusCode::InvalidParameter.into()
    }
    if p.batch == 0 {
        return Err(invalid("The batch size must be positive."));
    }
    if p.channels == 0 {
        return Err(invalid("The number of channels/classes must be positive."));
    }
    if p.rows == 0 || p.cols == 0 {
        return Err(invalid("The number of rows and columns must be positive."));
    }
    let size = p.dims().size();
    let positions = workspace_size(p);
    check_index_range(&[size_of_dims(&[positions, p.channels])])?;
    if workspace_len < positions {
        log::warn!("softmax workspace of {workspace_len} elements, needs {positions}");
        return Err(StatusCode::InsufficientWorkspace.into());
    }
    Ok((size, positions))
}

/// `output = exp(input - max) / sum(exp(input - max))` over the channels
/// at each position.
pub fn launch_forward<T: Float, B: MemoryProvider>(
    input: B::Pointer<T>,
    workspace: B::Pointer<T>,
    workspace_len: usize,
    output: B::Pointer<T>,
    params: &SoftmaxParams,
    backend: &B,
    wait: &[Event],
) -> Status {
    let (size, positions) = match validate(params, workspace_len) {
        Ok(sizes) => sizes,
        Err(status) => return status,
    };
    let p = *params;
    let channels = p.channels;

    let input = backend.get_mem_object(input, size).as_const();
    let workspace = backend.get_mem_object(workspace, positions);
    let output = backend.get_mem_object(output, size);
    let queue = backend.get_queue();
    let exp = queue.submit("softmax_exp", wait, |cgh| {
        let inp = input.read_mem(cgh);
        let out = output.write_mem(cgh);
        let sums = workspace.write_mem(cgh);
        cgh.parallel_for(positions, move |pos| {
            let (base, step) = p.locate(pos);
            let mut max = T::LOWEST;
            for ch in 0..channels {
                max = max.max(inp.get(base + ch * step));
            }
            let mut sum = T::ZERO;
            for ch in 0..channels {
                let e = (inp.get(base + ch * step) - max).exp();
                out.set(base + ch * step, e);
                sum += e;
            }
            sums.set(pos, sum);
        });
    });
    let event = queue.submit("softmax_div", &[exp], |cgh| {
        let sums = workspace.as_const().read_mem(cgh);
        let out = output.read_write_mem(cgh);
        let dims = p.dims();
        cgh.parallel_for(size, move |idx| {
            let (b, r, c, _) = p.input_format.unflatten(&dims, idx);
            let pos = (b * dims.rows + r) * dims.cols + c;
            out.set(idx, out.get(idx) / sums.get(pos));
        });
    });
    Status::ok(event)
}

/// `input_grad = output * (output_grad - sum(output_grad * output))`, from the
/// forward output.
#[allow(clippy::too_many_arguments)]
pub fn launch_gradient<T: Float, B: MemoryProvider>(
    output_forward: B::Pointer<T>,
    output_grad: B::Pointer<T>,
    workspace: B::Pointer<T>,
    workspace_len: usize,
    input_grad: B::Pointer<T>,
    params: &SoftmaxParams,
    backend: &B,
    wait: &[Event],
) -> Status {
    let (size, positions) = match validate(params, workspace_len) {
        Ok(sizes) => sizes,
        Err(status) => return status,
    };
    let p = *params;
    let channels = p.channels;

    let forward = backend.get_mem_object(output_forward, size).as_const();
    let grad = backend.get_mem_object(output_grad, size).as_const();
    let workspace = backend.get_mem_object(workspace, positions);
    let input_grad = backend.get_mem_object(input_grad, size);
    let queue = backend.get_queue();
    let dot = queue.submit("softmax_grad_dot", wait, |cgh| {
        let y = forward.read_mem(cgh);
        let dy = grad.read_mem(cgh);
        let dots = workspace.write_mem(cgh);
        cgh.parallel_for(positions, move |pos| {
            let (base, step) = p.locate(pos);
            let mut dot = T::ZERO;
            for ch in 0..channels {
                dot += y.get(base + ch * step) * dy.get(base + ch * step);
            }
            dots.set(pos, dot);
        });
    });
    let event = queue.submit("softmax_grad", &[dot], |cgh| {
        let y = forward.read_mem(cgh);
        let dy = grad.read_mem(cgh);
        let dots = workspace.as_const().read_mem(cgh);
        let dx = input_grad.write_mem(cgh);
        let dims = p.dims();
        cgh.parallel_for(size, move |idx| {
            let (b, r, c, _) = p.input_format.unflatten(&dims, idx);
            let pos = (b * dims.rows + r) * dims.cols + c;
            dx.set(idx, y.get(idx) * (dy.get(idx) - dots.get(pos)));
        });
    });
    Status::ok(event)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::back::{Backend, BufferBackend};
    use crate::shape;
    use ndarray::{ArcArray, IxDyn};

    fn softmax_ref(x: &[f64]) -> Vec<f64> {
        let max = x.iter().cloned().fold(f64::MIN, f64::max);
        let sum: f64 = x.iter().map(|v| (v - max).exp()).sum();
        x.iter().map(|v| (v - max).exp() / sum).collect()
    }

    #[test]
    fn test_forward_and_gradient() {
        let b = BufferBackend::host().unwrap();
        // Two positions of three classes, NHWC.
        let data = vec![1., 2., 3., -1., 0., 1000.];
        let params = SoftmaxParams {
            cols: 2,
            channels: 3,
            ..Default::default()
        };
        assert_eq!(workspace_size(&params), 2);
        let (x, ws, y, dy, dx) = (
            b.allocate::<f64>(6).unwrap(),
            b.allocate::<f64>(2).unwrap(),
            b.allocate::<f64>(6).unwrap(),
            b.allocate::<f64>(6).unwrap(),
            b.allocate::<f64>(6).unwrap(),
        );
        let up = b.upload(x.clone(), ArcArray::from_shape_vec(IxDyn(&[6]), data.clone()).unwrap(), &[]);
        let grad = vec![1., 0., 0., 0., 1., 0.];
        let up_dy = b.upload(dy.clone(), ArcArray::from_shape_vec(IxDyn(&[6]), grad.clone()).unwrap(), &[]);

        let fwd = launch_forward::<f64, _>(x, ws.clone(), 2, y.clone(), &params, &b, &[up]);
        assert!(fwd.is_ok());
        let res = b.download(y.clone(), &shape![6], &[fwd.event.clone()]).unwrap();
        let expected: Vec<f64> = data.chunks(3).flat_map(softmax_ref).collect();
        for (r, e) in res.iter().zip(&expected) {
            assert!((r - e).abs() < 1e-12, "{r} != {e}");
        }

        let bwd = launch_gradient::<f64, _>(y, dy, ws, 2, dx.clone(), &params, &b, &[fwd.event, up_dy]);
        assert!(bwd.is_ok());
        let res: Vec<f64> = b.download(dx, &shape![6], &[bwd.event]).unwrap().iter().copied().collect();
        for (pos, chunk) in expected.chunks(3).enumerate() {
            let g = &grad[pos * 3..pos * 3 + 3];
            let dot: f64 = chunk.iter().zip(g).map(|(y, g)| y * g).sum();
            for ch in 0..3 {
                let e = chunk[ch] * (g[ch] - dot);
                assert!((res[pos * 3 + ch] - e).abs() < 1e-12);
            }
        }
    }

    #[test]
    fn test_nchw_matches_nhwc() {
        let b = BufferBackend::host().unwrap();
        // [1, 1, 2, 2] NCHW: channel 0 = [0, 1], channel 1 = [2, 1].
        let params = SoftmaxParams {
            cols: 2,
            channels: 2,
            input_format: DataFormat::NCHW,
            ..Default::default()
        };
        let (x, ws, y) = (
            b.allocate::<f64>(4).unwrap(),
            b.allocate::<f64>(2).unwrap(),
            b.allocate::<f64>(4).unwrap(),
        );
        let up = b.upload(x.clone(), ArcArray::from_shape_vec(IxDyn(&[4]), vec![0., 1., 2., 1.]).unwrap(), &[]);
        let status = launch_forward::<f64, _>(x, ws, 2, y.clone(), &params, &b, &[up]);
        let res = b.download(y, &shape![4], &[status.event]).unwrap();
        let first = softmax_ref(&[0., 2.]);
        let expected = [first[0], 0.5, first[1], 0.5];
        for (r, e) in res.iter().zip(expected) {
            assert!((r - e).abs() < 1e-12, "{r} != {e}");
        }
    }

    #[test]
    fn test_validation() {
        let b = BufferBackend::host().unwrap();
        let ptr = b.allocate::<f32>(4).unwrap();
        let params = SoftmaxParams {
            rows: 2,
            channels: 2,
            ..Default::default()
        };
        let status = launch_forward::<f32, _>(ptr.clone(), ptr.clone(), 1, ptr.clone(), &params, &b, &[]);
        assert_eq!(status.status, StatusCode::InsufficientWorkspace);
        let status = launch_forward::<f32, _>(ptr.clone(), ptr.clone(), 4, ptr, &SoftmaxParams::default(), &b, &[]);
        assert_eq!(status.status, StatusCode::InvalidParameter);
        assert_eq!(b.get_queue().submission_count(), 0);
    }
}
