//! Batched matrix multiply: `out = alpha * op(lhs) · op(rhs) + beta * out`.

use crate::back::MemoryProvider;
use crate::helpers::{check_index_range, size_of_dims};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::status::{validate_param, Status};

/// How the matrices of a batch are laid out relative to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BatchFormat {
    /// Each matrix is contiguous, one after the other.
    #[default]
    Strided,
    /// The batch index is the fastest moving one.
    Interleaved,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatmulParams {
    pub batches: usize,
    pub m: usize,
    pub k: usize,
    pub n: usize,
    pub alpha: f32,
    pub beta: f32,
    pub transpose_lhs: bool,
    pub transpose_rhs: bool,
    pub batch_format: BatchFormat,
}

impl MatmulParams {
    /// `[m, k] · [k, n]`, a single batch, `alpha = 1`, `beta = 0`.
    pub fn new(m: usize, k: usize, n: usize) -> Self {
        Self {
            batches: 1,
            m,
            k,
            n,
            alpha: 1.0,
            beta: 0.0,
            transpose_lhs: false,
            transpose_rhs: false,
            batch_format: BatchFormat::Strided,
        }
    }

    pub fn batched(mut self, batches: usize, format: BatchFormat) -> Self {
        self.batches = batches;
        self.batch_format = format;
        self
    }

    pub fn transposed(mut self, lhs: bool, rhs: bool) -> Self {
        self.transpose_lhs = lhs;
        self.transpose_rhs = rhs;
        self
    }

    pub fn scaled(mut self, alpha: f32, beta: f32) -> Self {
        self.alpha = alpha;
        self.beta = beta;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatmulSizes {
    pub lhs_size: usize,
    pub rhs_size: usize,
    pub output_size: usize,
}

pub fn get_sizes(params: &MatmulParams) -> MatmulSizes {
    let MatmulParams { batches, m, k, n, .. } = *params;
    MatmulSizes {
        lhs_size: size_of_dims(&[batches, m, k]),
        rhs_size: size_of_dims(&[batches, k, n]),
        output_size: size_of_dims(&[batches, m, n]),
    }
}

/// Position of element `(row, col)` of matrix `b` in a batch of
/// `rows x cols` matrices.
#[derive(Debug, Clone, Copy)]
pub(crate) struct MatrixLayout {
    pub rows: usize,
    pub cols: usize,
    pub batches: usize,
    pub transposed: bool,
    pub format: BatchFormat,
}

impl MatrixLayout {
    #[inline(always)]
    pub fn index(&self, b: usize, row: usize, col: usize) -> usize {
        let within = if self.transposed {
            col * self.rows + row
        } else {
            row * self.cols + col
        };
        match self.format {
            BatchFormat::Strided => b * self.rows * self.cols + within,
            BatchFormat::Interleaved => within * self.batches + b,
        }
    }
}

pub fn launch<T: Float, B: MemoryProvider>(
    lhs: B::Pointer<T>,
    rhs: B::Pointer<T>,
    output: B::Pointer<T>,
    params: &MatmulParams,
    backend: &B,
    wait: &[Event],
) -> Status {
    validate_param!(params.batches > 0, "The number of batches must be positive.");
    validate_param!(params.m > 0, "The value of m must be positive.");
    validate_param!(params.k > 0, "The value of k must be positive.");
    validate_param!(params.n > 0, "The value of n must be positive.");
    let sizes = get_sizes(params);
    if let Err(code) = check_index_range(&[sizes.lhs_size, sizes.rhs_size, sizes.output_size]) {
        return code.into();
    }

    let lhs = backend.get_mem_object(lhs, sizes.lhs_size).as_const();
    let rhs = backend.get_mem_object(rhs, sizes.rhs_size).as_const();
    let out = backend.get_mem_object(output, sizes.output_size);
    Status::ok(queue_matmul(backend, lhs, rhs, out, params, wait))
}

pub(crate) fn queue_matmul<T, B, In, Out>(
    backend: &B,
    lhs: In,
    rhs: In,
    out: Out,
    params: &MatmulParams,
    wait: &[Event],
) -> Event
where
    T: Float,
    B: MemoryProvider,
    In: MemObject<T>,
    Out: MutMemObject<T>,
{
    let p = *params;
    let (m, k, n) = (p.m, p.k, p.n);
    let lhs_at = MatrixLayout {
        rows: m,
        cols: k,
        batches: p.batches,
        transposed: p.transpose_lhs,
        format: p.batch_format,
    };
    let rhs_at = MatrixLayout {
        rows: k,
        cols: n,
        batches: p.batches,
        transposed: p.transpose_rhs,
        format: p.batch_format,
    };
    let out_at = MatrixLayout {
        rows: m,
        cols: n,
        batches: p.batches,
        transposed: false,
        format: p.batch_format,
    };
    let alpha = T::from_f64(p.alpha as f64);
    let beta = T::from_f64(p.beta as f64);

    backend.get_queue().submit("matmul", wait, |cgh| {
        if p.alpha == 0.0 && p.beta == 0.0 {
            let out = out.write_mem(cgh);
            cgh.parallel_for(out.len(), move |i| out.set(i, T::ZERO));
            return;
        }
        if p.alpha == 0.0 {
            // Only the scaled output remains.
            let out = out.read_write_mem(cgh);
            cgh.parallel_for(out.len(), move |i| out.set(i, beta * out.get(i)));
            return;
        }
        let lhs = lhs.read_mem(cgh);
        let rhs = rhs.read_mem(cgh);
        if p.beta == 0.0 {
            let out = out.write_mem(cgh);
            cgh.parallel_for(p.batches * m * n, move |idx| {
                let (b, i, j) = (idx / (m * n), idx / n % m, idx % n);
                let mut acc = T::ZERO;
                for l in 0..k {
                    acc += lhs.get(lhs_at.index(b, i, l)) * rhs.get(rhs_at.index(b, l, j));
                }
                out.set(out_at.index(b, i, j), alpha * acc);
            });
        } else {
            let out = out.read_write_mem(cgh);
            cgh.parallel_for(p.batches * m * n, move |idx| {
                let (b, i, j) = (idx / (m * n), idx / n % m, idx % n);
                let mut acc = T::ZERO;
                for l in 0..k {
                    acc += lhs.get(lhs_at.index(b, i, l)) * rhs.get(rhs_at.index(b, l, j));
                }
                let o = out_at.index(b, i, j);
                out.set(o, alpha * acc + beta * out.get(o));
            });
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::back::{Backend, BufferBackend, UsmBackend};
    use crate::shape;
    use crate::status::StatusCode;
    use ndarray::{ArcArray, IxDyn};

    fn upload<B: Backend>(b: &B, data: Vec<f32>) -> (B::Pointer<f32>, Event) {
        let ptr = b.allocate::<f32>(data.len()).unwrap();
        let n = data.len();
        let ev = b.upload(ptr.clone(), ArcArray::from_shape_vec(IxDyn(&[n]), data).unwrap(), &[]);
        (ptr, ev)
    }

    #[test]
    fn test_scalar_matmul() {
        let b = BufferBackend::host().unwrap();
        let (lhs, e1) = upload(&b, vec![2.0]);
        let (rhs, e2) = upload(&b, vec![3.0]);
        let (out, e3) = upload(&b, vec![-1.0]);
        let status = launch::<f32, _>(lhs, rhs, out.clone(), &MatmulParams::new(1, 1, 1), &b, &[e1, e2, e3]);
        assert!(status.is_ok());
        let res = b.download(out, &shape![1], &[status.event]).unwrap();
        assert_eq!(res.as_slice().unwrap(), &[6.0]);
    }

    #[test]
    fn test_transposed_batched_and_beta() {
        let b = UsmBackend::host().unwrap();
        // Two batches of lhs^T with lhs = [[1, 2], [3, 4]] stored as [[1, 3], [2, 4]].
        let (lhs, e1) = upload(&b, vec![1., 3., 2., 4., 1., 0., 0., 1.]);
        let (rhs, e2) = upload(&b, vec![1., 1., 1., 1., 5., 6., 7., 8.]);
        let (out, e3) = upload(&b, vec![1.; 8]);
        let params = MatmulParams::new(2, 2, 2)
            .batched(2, BatchFormat::Strided)
            .transposed(true, false)
            .scaled(1.0, 1.0);
        let status = launch::<f32, _>(lhs, rhs, out, &params, &b, &[e1, e2, e3]);
        let res = b.download(out, &shape![8], &[status.event]).unwrap();
        assert_eq!(res.as_slice().unwrap(), &[4., 4., 8., 8., 6., 7., 8., 9.]);
    }

    #[test]
    fn test_interleaved_matches_strided() {
        let b = BufferBackend::host().unwrap();
        // Batch 0: identity, batch 1: 2 * identity, interleaved.
        let (lhs, e1) = upload(&b, vec![1., 2., 0., 0., 0., 0., 1., 2.]);
        let (rhs, e2) = upload(&b, vec![1., 5., 2., 6., 3., 7., 4., 8.]);
        let out = b.allocate::<f32>(8).unwrap();
        let params = MatmulParams::new(2, 2, 2).batched(2, BatchFormat::Interleaved);
        let status = launch::<f32, _>(lhs, rhs, out.clone(), &params, &b, &[e1, e2]);
        let res = b.download(out, &shape![8], &[status.event]).unwrap();
        assert_eq!(res.as_slice().unwrap(), &[1., 10., 2., 12., 3., 14., 4., 16.]);
    }

    #[test]
    fn test_zero_alpha_only_scales_output() {
        let b = BufferBackend::host().unwrap();
        let (lhs, _) = upload(&b, vec![f32::NAN]);
        let (rhs, _) = upload(&b, vec![f32::NAN]);
        let (out, e) = upload(&b, vec![4.0]);
        let params = MatmulParams::new(1, 1, 1).scaled(0.0, 0.5);
        let status = launch::<f32, _>(lhs, rhs, out.clone(), &params, &b, &[e]);
        let res = b.download(out, &shape![1], &[status.event]).unwrap();
        assert_eq!(res.as_slice().unwrap(), &[2.0]);
    }

    #[test]
    fn test_invalid_sizes_submit_nothing() {
        let b = BufferBackend::host().unwrap();
        let p = b.allocate::<f32>(4).unwrap();
        let before = b.get_queue().submission_count();
        let status = launch::<f32, _>(p.clone(), p.clone(), p, &MatmulParams::new(0, 2, 2), &b, &[]);
        assert_eq!(status.status, StatusCode::InvalidParameter);
        assert!(status.event.is_null());
        assert_eq!(b.get_queue().submission_count(), before);
    }
}
