//! Batch normalization over every channel of an activation tensor.
//!
//! In training mode the statistics of the batch normalize the input and are
//! folded into the running statistics with `momentum`. In frozen mode the
//! given statistics normalize the input unchanged.

use crate::back::Backend;
use crate::format::{DataFormat, ImageDims};
use crate::helpers::{check_index_range, size_of_dims};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{validate_param, Status, StatusCode};
use defer::defer;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BatchNormParams {
    pub batch: usize,
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
    pub is_training: bool,
    /// Added to the variance before its square root.
    pub epsilon: f64,
    /// Weight of the old running statistics when updating them.
    pub momentum: f64,
    pub input_format: DataFormat,
}

impl Default for BatchNormParams {
    fn default() -> Self {
        Self {
            batch: 1,
            rows: 0,
            cols: 0,
            channels: 0,
            is_training: false,
            epsilon: 0.001,
            momentum: 0.9,
            input_format: DataFormat::NHWC,
        }
    }
}

impl BatchNormParams {
    fn dims(&self) -> ImageDims {
        ImageDims::new(self.batch, self.rows, self.cols, self.channels)
    }

    /// Elements normalized together in one channel.
    fn items_per_channel(&self) -> usize {
        self.batch * self.rows * self.cols
    }

    /// Offset of channel `ch` at flattened `(batch, row, col)` position `pos`.
    #[inline(always)]
    fn offset(&self, pos: usize, ch: usize) -> usize {
        let plane = self.rows * self.cols;
        let (b, rc) = (pos / plane, pos % plane);
        self.input_format
            .index(&self.dims(), b, rc / self.cols, rc % self.cols, ch)
    }
}

/// Per-channel mean and variance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats<P> {
    pub mean: P,
    pub variance: P,
}

fn validate(p: &BatchNormParams) -> Status {
    validate_param!(p.batch > 0, "The batch size must be positive.");
    validate_param!(p.rows > 0, "The number of rows must be positive.");
    validate_param!(p.cols > 0, "The number of columns must be positive.");
    validate_param!(p.channels > 0, "The number of channels must be positive.");
    validate_param!(p.epsilon > 0.0, "Epsilon must be positive.");
    validate_param!(
        (0.0..=1.0).contains(&p.momentum),
        "Momentum must be between 0 and 1."
    );
    let size = size_of_dims(&[p.batch, p.rows, p.cols, p.channels]);
    if let Err(code) = check_index_range(&[size]) {
        return code.into();
    }
    Status::default()
}

/// Scratch for one mean and one variance per channel, as `[means..., variances...]`.
fn allocate_stats<T: Float, B: Backend>(backend: &B, channels: usize) -> Result<B::Pointer<T>, Status> {
    backend.allocate::<T>(2 * channels).map_err(|e| {
        log::warn!("batchnorm statistics allocation failed: {e}");
        Status::from(StatusCode::AllocationProblem)
    })
}

/// Normalizes `input` into `output` as `gamma * (x - mean) / sqrt(variance + epsilon) + beta`.
///
/// `running` holds the running statistics. Training updates them in place
/// with the batch statistics; frozen mode normalizes with them.
#[allow(clippy::too_many_arguments)]
pub fn launch_forward<T: Float, B: Backend>(
    input: B::Pointer<T>,
    beta: B::Pointer<T>,
    gamma: B::Pointer<T>,
    running: Stats<B::Pointer<T>>,
    output: B::Pointer<T>,
    params: &BatchNormParams,
    backend: &B,
    wait: &[Event],
) -> Status {
    let status = validate(params);
    if !status.is_ok() {
        return status;
    }
    let p = *params;
    let (channels, items) = (p.channels, p.items_per_channel());
    let size = p.dims().size();

    let scratch = match allocate_stats::<T, B>(backend, channels) {
        Ok(ptr) => ptr,
        Err(status) => return status,
    };
    let _free = defer(|| backend.deallocate(scratch.clone()));

    let input = backend.get_mem_object(input, size).as_const();
    let beta = backend.get_mem_object(beta, channels).as_const();
    let gamma = backend.get_mem_object(gamma, channels).as_const();
    let running_mean = backend.get_mem_object(running.mean, channels);
    let running_variance = backend.get_mem_object(running.variance, channels);
    let stats = backend.get_mem_object(scratch.clone(), 2 * channels);
    let output = backend.get_mem_object(output, size);
    let queue = backend.get_queue();

    let momentum = T::from_f64(p.momentum);
    let stats_event = queue.submit("batchnorm_stats", wait, |cgh| {
        let inp = input.read_mem(cgh);
        let run_mean = running_mean.read_write_mem(cgh);
        let run_var = running_variance.read_write_mem(cgh);
        let out = stats.write_mem(cgh);
        cgh.parallel_for(channels, move |ch| {
            let (mean, variance) = if p.is_training {
                let (mean, variance) = moments(items, |pos| inp.get(p.offset(pos, ch)));
                run_mean.set(ch, momentum * run_mean.get(ch) + (T::ONE - momentum) * mean);
                run_var.set(ch, momentum * run_var.get(ch) + (T::ONE - momentum) * variance);
                (mean, variance)
            } else {
                (run_mean.get(ch), run_var.get(ch))
            };
            out.set(ch, mean);
            out.set(channels + ch, variance);
        });
    });

    let epsilon = T::from_f64(p.epsilon);
    let dims = p.dims();
    let event = queue.submit("batchnorm", &[stats_event], |cgh| {
        let inp = input.read_mem(cgh);
        let beta = beta.read_mem(cgh);
        let gamma = gamma.read_mem(cgh);
        let stats = stats.as_const().read_mem(cgh);
        let out = output.write_mem(cgh);
        cgh.parallel_for(size, move |idx| {
            let (_, _, _, ch) = p.input_format.unflatten(&dims, idx);
            let norm = (inp.get(idx) - stats.get(ch)) / (stats.get(channels + ch) + epsilon).sqrt();
            out.set(idx, gamma.get(ch) * norm + beta.get(ch));
        });
    });
    Status::ok(event)
}

/// Gradients of [`launch_forward`] for the input, `gamma` and `beta`.
///
/// Training recomputes the batch statistics from `input`, and `frozen` must
/// be `None`. Frozen mode needs the statistics the forward pass used.
#[allow(clippy::too_many_arguments)]
pub fn launch_gradient<T: Float, B: Backend>(
    input: B::Pointer<T>,
    gamma: B::Pointer<T>,
    frozen: Option<Stats<B::Pointer<T>>>,
    output_grad: B::Pointer<T>,
    input_grad: B::Pointer<T>,
    gamma_grad: B::Pointer<T>,
    beta_grad: B::Pointer<T>,
    params: &BatchNormParams,
    backend: &B,
    wait: &[Event],
) -> Status {
    let status = validate(params);
    if !status.is_ok() {
        return status;
    }
    validate_param!(
        frozen.is_some() != params.is_training,
        "Frozen statistics are required exactly when not training."
    );
    let p = *params;
    let (channels, items) = (p.channels, p.items_per_channel());
    let size = p.dims().size();

    let scratch = match allocate_stats::<T, B>(backend, channels) {
        Ok(ptr) => ptr,
        Err(status) => return status,
    };
    let _free = defer(|| backend.deallocate(scratch.clone()));

    let input = backend.get_mem_object(input, size).as_const();
    let gamma = backend.get_mem_object(gamma, channels).as_const();
    let frozen = frozen.map(|s| Stats {
        mean: backend.get_mem_object(s.mean, channels).as_const(),
        variance: backend.get_mem_object(s.variance, channels).as_const(),
    });
    let output_grad = backend.get_mem_object(output_grad, size).as_const();
    let input_grad = backend.get_mem_object(input_grad, size);
    let gamma_grad = backend.get_mem_object(gamma_grad, channels);
    let beta_grad = backend.get_mem_object(beta_grad, channels);
    let stats = backend.get_mem_object(scratch.clone(), 2 * channels);
    let queue = backend.get_queue();

    let epsilon = T::from_f64(p.epsilon);
    let reduce_event = queue.submit("batchnorm_grad_reduce", wait, |cgh| {
        let inp = input.read_mem(cgh);
        let dy = output_grad.read_mem(cgh);
        let frozen = frozen
            .as_ref()
            .map(|s| (s.mean.read_mem(cgh), s.variance.read_mem(cgh)));
        let out = stats.write_mem(cgh);
        let d_gamma = gamma_grad.write_mem(cgh);
        let d_beta = beta_grad.write_mem(cgh);
        cgh.parallel_for(channels, move |ch| {
            let (mean, variance) = match &frozen {
                Some((mean, variance)) => (mean.get(ch), variance.get(ch)),
                None => moments(items, |pos| inp.get(p.offset(pos, ch))),
            };
            let inv_std = T::ONE / (variance + epsilon).sqrt();
            let (mut sum_dy, mut sum_dy_norm) = (T::ZERO, T::ZERO);
            for pos in 0..items {
                let at = p.offset(pos, ch);
                let g = dy.get(at);
                sum_dy += g;
                sum_dy_norm += g * (inp.get(at) - mean) * inv_std;
            }
            out.set(ch, mean);
            out.set(channels + ch, variance);
            d_beta.set(ch, sum_dy);
            d_gamma.set(ch, sum_dy_norm);
        });
    });

    let dims = p.dims();
    let count = T::from_usize(items);
    let event = queue.submit("batchnorm_grad", &[reduce_event], |cgh| {
        let inp = input.read_mem(cgh);
        let dy = output_grad.read_mem(cgh);
        let gamma = gamma.read_mem(cgh);
        let stats = stats.as_const().read_mem(cgh);
        let d_gamma = gamma_grad.as_const().read_mem(cgh);
        let d_beta = beta_grad.as_const().read_mem(cgh);
        let dx = input_grad.write_mem(cgh);
        cgh.parallel_for(size, move |idx| {
            let (_, _, _, ch) = p.input_format.unflatten(&dims, idx);
            let inv_std = T::ONE / (stats.get(channels + ch) + epsilon).sqrt();
            let scale = gamma.get(ch) * inv_std;
            let g = dy.get(idx);
            let grad = if p.is_training {
                let norm = (inp.get(idx) - stats.get(ch)) * inv_std;
                scale * (g - d_beta.get(ch) / count - norm * d_gamma.get(ch) / count)
            } else {
                scale * g
            };
            dx.set(idx, grad);
        });
    });
    Status::ok(event)
}

/// Mean and biased variance of `n` values.
#[inline(always)]
fn moments<T: Float>(n: usize, value: impl Fn(usize) -> T) -> (T, T) {
    let count = T::from_usize(n);
    let mut sum = T::ZERO;
    for i in 0..n {
        sum += value(i);
    }
    let mean = sum / count;
    let mut sq = T::ZERO;
    for i in 0..n {
        let d = value(i) - mean;
        sq += d * d;
    }
    (mean, sq / count)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::back::{BufferBackend, MemoryProvider, UsmBackend};
    use crate::shape;
    use ndarray::{ArcArray, IxDyn};

    fn upload<B: Backend>(b: &B, data: Vec<f64>) -> (B::Pointer<f64>, Event) {
        let ptr = b.allocate::<f64>(data.len()).unwrap();
        let ev = b.upload(ptr.clone(), ArcArray::from_shape_vec(IxDyn(&[data.len()]), data).unwrap(), &[]);
        (ptr, ev)
    }

    fn assert_close(res: &[f64], expected: &[f64]) {
        assert_eq!(res.len(), expected.len());
        for (r, e) in res.iter().zip(expected) {
            assert!((r - e).abs() < 1e-9, "{res:?} != {expected:?}");
        }
    }

    // NHWC, one row of four columns, two channels.
    const INPUT: [f64; 8] = [1., 10., 2., 20., 3., 30., 6., 40.];

    fn params(is_training: bool) -> BatchNormParams {
        BatchNormParams {
            rows: 1,
            cols: 4,
            channels: 2,
            is_training,
            ..Default::default()
        }
    }

    #[test]
    fn test_forward_training_updates_running_stats() {
        let b = BufferBackend::host().unwrap();
        let (x, e0) = upload(&b, INPUT.to_vec());
        let (beta, e1) = upload(&b, vec![0.5, -1.]);
        let (gamma, e2) = upload(&b, vec![2., 1.]);
        let (mean, e3) = upload(&b, vec![0., 0.]);
        let (var, e4) = upload(&b, vec![1., 1.]);
        let out = b.allocate::<f64>(8).unwrap();
        let p = params(true);

        let running = Stats {
            mean: mean.clone(),
            variance: var.clone(),
        };
        let status = launch_forward::<f64, _>(x, beta, gamma, running, out.clone(), &p, &b, &[e0, e1, e2, e3, e4]);
        assert!(status.is_ok());

        // Channel 0: mean 3, variance 3.5. Channel 1: mean 25, variance 125.
        let batch = [(3., 3.5), (25., 125.)];
        let expected: Vec<f64> = INPUT
            .iter()
            .enumerate()
            .map(|(i, x)| {
                let ch = i % 2;
                let (m, v) = batch[ch];
                let (beta, gamma) = ([0.5, -1.][ch], [2., 1.][ch]);
                gamma * (x - m) / (v + p.epsilon).sqrt() + beta
            })
            .collect();
        let res = b.download(out, &shape![8], &[status.event.clone()]).unwrap();
        assert_close(res.as_slice().unwrap(), &expected);

        let mean = b.download(mean, &shape![2], &[status.event.clone()]).unwrap();
        assert_close(mean.as_slice().unwrap(), &[0.1 * 3., 0.1 * 25.]);
        let var = b.download(var, &shape![2], &[status.event]).unwrap();
        assert_close(var.as_slice().unwrap(), &[0.9 + 0.1 * 3.5, 0.9 + 0.1 * 125.]);
    }

    #[test]
    fn test_forward_frozen_nchw() {
        let b = UsmBackend::host().unwrap();
        // NCHW: channel 0 is [0, 2], channel 1 is [4, 8].
        let (x, e0) = upload(&b, vec![0., 2., 4., 8.]);
        let (beta, e1) = upload(&b, vec![0., 1.]);
        let (gamma, e2) = upload(&b, vec![1., 1.]);
        let (mean, e3) = upload(&b, vec![1., 6.]);
        let (var, e4) = upload(&b, vec![4., 16.]);
        let out = b.allocate::<f64>(4).unwrap();
        let p = BatchNormParams {
            rows: 1,
            cols: 2,
            channels: 2,
            input_format: DataFormat::NCHW,
            ..Default::default()
        };
        let status = launch_forward::<f64, _>(x, beta, gamma, Stats { mean, variance: var }, out, &p, &b, &[e0, e1, e2, e3, e4]);
        assert!(status.is_ok());

        let s0 = (4. + p.epsilon).sqrt();
        let s1 = (16. + p.epsilon).sqrt();
        let res = b.download(out, &shape![4], &[status.event.clone()]).unwrap();
        assert_close(res.as_slice().unwrap(), &[-1. / s0, 1. / s0, 1. - 2. / s1, 1. + 2. / s1]);
        // Frozen statistics are left untouched.
        let mean = b.download(mean, &shape![2], &[status.event]).unwrap();
        assert_eq!(mean.as_slice().unwrap(), &[1., 6.]);
    }

    #[test]
    fn test_gradient() {
        let b = BufferBackend::host().unwrap();
        let (x, e0) = upload(&b, INPUT.to_vec());
        let (gamma, e1) = upload(&b, vec![2., 1.]);
        let (dy, e2) = upload(&b, vec![1., 0., -1., 1., 0.5, 0., 2., -1.]);
        let dy_host = [1., 0., -1., 1., 0.5, 0., 2., -1.];
        let gamma_host = [2., 1.];
        let eps = 0.001;

        // Host reference per channel.
        let reference = |training: bool, stats: [(f64, f64); 2]| {
            let mut dx = [0.; 8];
            let mut d_gamma = [0.; 2];
            let mut d_beta = [0.; 2];
            for ch in 0..2 {
                let (m, v) = stats[ch];
                let inv = 1. / (v + eps).sqrt();
                let idx: Vec<usize> = (0..4).map(|pos| pos * 2 + ch).collect();
                let sum_dy: f64 = idx.iter().map(|&i| dy_host[i]).sum();
                let sum_dy_norm: f64 = idx.iter().map(|&i| dy_host[i] * (INPUT[i] - m) * inv).sum();
                for &i in &idx {
                    let norm = (INPUT[i] - m) * inv;
                    dx[i] = if training {
                        gamma_host[ch] * inv * (dy_host[i] - sum_dy / 4. - norm * sum_dy_norm / 4.)
                    } else {
                        gamma_host[ch] * inv * dy_host[i]
                    };
                }
                d_gamma[ch] = sum_dy_norm;
                d_beta[ch] = sum_dy;
            }
            (dx, d_gamma, d_beta)
        };

        let run = |frozen: Option<Stats<_>>, p: &BatchNormParams, wait: &[Event]| {
            let (dx, dg, db) = (
                b.allocate::<f64>(8).unwrap(),
                b.allocate::<f64>(2).unwrap(),
                b.allocate::<f64>(2).unwrap(),
            );
            let status = launch_gradient::<f64, _>(
                x.clone(),
                gamma.clone(),
                frozen,
                dy.clone(),
                dx.clone(),
                dg.clone(),
                db.clone(),
                p,
                &b,
                wait,
            );
            assert!(status.is_ok());
            let ev = [status.event];
            (
                b.download(dx, &shape![8], &ev).unwrap(),
                b.download(dg, &shape![2], &ev).unwrap(),
                b.download(db, &shape![2], &ev).unwrap(),
            )
        };

        let (dx, dg, db) = run(None, &params(true), &[e0.clone(), e1.clone(), e2.clone()]);
        let (edx, edg, edb) = reference(true, [(3., 3.5), (25., 125.)]);
        assert_close(dx.as_slice().unwrap(), &edx);
        assert_close(dg.as_slice().unwrap(), &edg);
        assert_close(db.as_slice().unwrap(), &edb);

        let (mean, e3) = upload(&b, vec![2., 20.]);
        let (var, e4) = upload(&b, vec![1., 100.]);
        let frozen = Stats { mean, variance: var };
        let (dx, dg, db) = run(Some(frozen), &params(false), &[e0, e1, e2, e3, e4]);
        let (edx, edg, edb) = reference(false, [(2., 1.), (20., 100.)]);
        assert_close(dx.as_slice().unwrap(), &edx);
        assert_close(dg.as_slice().unwrap(), &edg);
        assert_close(db.as_slice().unwrap(), &edb);
    }

    #[test]
    fn test_validation() {
        let b = BufferBackend::host().unwrap();
        let ptr = b.allocate::<f32>(8).unwrap();
        let stats = Stats {
            mean: ptr.clone(),
            variance: ptr.clone(),
        };
        let invalid = [
            BatchNormParams::default(),
            BatchNormParams {
                epsilon: 0.0,
                ..params(false)
            },
            BatchNormParams {
                momentum: 1.5,
                ..params(true)
            },
        ];
        for p in &invalid {
            let status = launch_forward::<f32, _>(ptr.clone(), ptr.clone(), ptr.clone(), stats.clone(), ptr.clone(), p, &b, &[]);
            assert_eq!(status.status, StatusCode::InvalidParameter, "{p:?}");
        }

        // Training gradients take no frozen statistics.
        let status = launch_gradient::<f32, _>(
            ptr.clone(),
            ptr.clone(),
            Some(stats),
            ptr.clone(),
            ptr.clone(),
            ptr.clone(),
            ptr.clone(),
            &params(true),
            &b,
            &[],
        );
        assert_eq!(status.status, StatusCode::InvalidParameter);
        assert_eq!(b.get_queue().submission_count(), 0);
    }
}
