//! Forward convolution where each work item computes a 2x2 block of outputs
//! for one feature, reusing the input patch the four windows share.

use super::launch::Tensors;
use super::{Chain, Conv2DParams};
use crate::back::{Backend, InternalBackend, MemoryProvider};
use crate::format::{DataFormat, FilterFormat};
use crate::helpers::{queue_scaled, round_ratio_up};
use crate::mem::{Float, MemObject, MutMemObject};

const TILE: usize = 2;
/// Input rows or columns read by two neighbouring 5x5 windows.
const PATCH: usize = 6;

pub(super) fn launch<T: Float, B: Backend>(
    backend: &B,
    t: &Tensors<B::InternalPointer<T>>,
    params: &Conv2DParams,
    chain: &mut Chain,
) {
    let ib = InternalBackend::new(backend);
    let p = *params;
    let (in_dims, out_dims, f_dims) = (p.in_dims(), p.out_dims(), p.filter_dims());
    let out = ib.get_mem_object(t.output.clone(), out_dims.size());
    if p.alpha == 0.0 {
        let event = queue_scaled(backend, "conv2d_tiled", &out, 0.0, p.beta, &chain.deps(), |_| {
            |_: usize| T::ZERO
        });
        chain.push(event);
        return;
    }

    let input = ib.get_mem_object(t.input.clone(), in_dims.size()).as_const();
    let filter = ib.get_mem_object(t.filter.clone(), f_dims.size()).as_const();
    let filt = p.filter_format;
    debug_assert!(matches!(filt, FilterFormat::HWCF | FilterFormat::FHWC));
    let (tile_rows, tile_cols) = (round_ratio_up(p.out_rows, TILE), round_ratio_up(p.out_cols, TILE));
    let patch_rows = (TILE - 1) * p.stride_rows + p.window_rows;
    let patch_cols = (TILE - 1) * p.stride_cols + p.window_cols;
    let (alpha, beta) = (T::from_f64(p.alpha as f64), T::from_f64(p.beta as f64));
    let n = p.batch * tile_rows * tile_cols * p.features;
    let nhwc = DataFormat::NHWC;

    let event = backend.get_queue().submit("conv2d_tiled", &chain.deps(), |cgh| {
        let x = input.read_mem(cgh);
        let w = filter.read_mem(cgh);
        let y = out.read_write_mem(cgh);
        cgh.parallel_for(n, move |idx| {
            let f = idx % p.features;
            let rest = idx / p.features;
            let tc = rest % tile_cols;
            let rest = rest / tile_cols;
            let (b, tr) = (rest / tile_rows, rest % tile_rows);
            let (oh0, ow0) = (tr * TILE, tc * TILE);
            // Patch row `i` is input row `oh0 * stride + i - pad`.
            let row0 = oh0 * p.stride_rows;
            let col0 = ow0 * p.stride_cols;

            let mut acc = [[T::ZERO; TILE]; TILE];
            for c in 0..p.channels {
                let mut patch = [[T::ZERO; PATCH]; PATCH];
                for (i, line) in patch.iter_mut().enumerate().take(patch_rows) {
                    let Some(ih) = (row0 + i).checked_sub(p.pad_rows).filter(|&ih| ih < p.in_rows) else {
                        continue;
                    };
                    for (j, v) in line.iter_mut().enumerate().take(patch_cols) {
                        if let Some(iw) = (col0 + j).checked_sub(p.pad_cols).filter(|&iw| iw < p.in_cols) {
                            *v = x.get(nhwc.index(&in_dims, b, ih, iw, c));
                        }
                    }
                }
                for r in 0..p.window_rows {
                    for s in 0..p.window_cols {
                        let wv = w.get(filt.index(&f_dims, r, s, c, f));
                        for (u, row) in acc.iter_mut().enumerate() {
                            for (v, a) in row.iter_mut().enumerate() {
                                *a += patch[u * p.stride_rows + r][v * p.stride_cols + s] * wv;
                            }
                        }
                    }
                }
            }

            for (u, row) in acc.iter().enumerate() {
                let oh = oh0 + u;
                if oh >= p.out_rows {
                    break;
                }
                for (v, a) in row.iter().enumerate() {
                    let ow = ow0 + v;
                    if ow >= p.out_cols {
                        break;
                    }
                    let at = nhwc.index(&out_dims, b, oh, ow, f);
                    if p.beta == 0.0 {
                        y.set(at, alpha * *a);
                    } else {
                        y.set(at, alpha * *a + beta * y.get(at));
                    }
                }
            }
        });
    });
    chain.push(event);
}
