//! Naive convolution, one work item per output element.
//!
//! Runs every direction in every supported layout and needs no workspace.

use super::launch::Tensors;
use super::{Chain, Conv2DParams, Direction};
use crate::back::{Backend, InternalBackend, MemoryProvider};
use crate::helpers::queue_scaled;
use crate::mem::{Float, MemObject, MutMemObject};

pub(super) fn launch<T: Float, B: Backend>(
    backend: &B,
    direction: Direction,
    t: &Tensors<B::InternalPointer<T>>,
    params: &Conv2DParams,
    chain: &mut Chain,
) {
    let ib = InternalBackend::new(backend);
    let p = *params;
    let (in_dims, out_dims, f_dims) = (p.in_dims(), p.out_dims(), p.filter_dims());
    let (data, filt) = (p.input_format, p.filter_format);
    let (x_size, y_size) = (in_dims.size(), out_dims.size());

    let event = match direction {
        Direction::Forward => {
            let input = ib.get_mem_object(t.input.clone(), x_size).as_const();
            let filter = ib.get_mem_object(t.filter.clone(), f_dims.size()).as_const();
            let out = ib.get_mem_object(t.output.clone(), y_size);
            queue_scaled(backend, "conv2d_direct", &out, p.alpha, p.beta, &chain.deps(), |cgh| {
                let x = input.read_mem(cgh);
                let w = filter.read_mem(cgh);
                move |i: usize| {
                    let (b, oh, ow, f) = data.unflatten(&out_dims, i);
                    let mut acc = T::ZERO;
                    for r in 0..p.window_rows {
                        let Some(ih) = p.in_row(oh, r) else { continue };
                        for s in 0..p.window_cols {
                            let Some(iw) = p.in_col(ow, s) else { continue };
                            for c in 0..p.channels {
                                acc += x.get(data.index(&in_dims, b, ih, iw, c))
                                    * w.get(filt.index(&f_dims, r, s, c, f));
                            }
                        }
                    }
                    acc
                }
            })
        }
        Direction::InputBackprop => {
            let grad = ib.get_mem_object(t.input.clone(), y_size).as_const();
            let filter = ib.get_mem_object(t.filter.clone(), f_dims.size()).as_const();
            let out = ib.get_mem_object(t.output.clone(), x_size);
            queue_scaled(backend, "conv2d_direct_input", &out, p.alpha, p.beta, &chain.deps(), |cgh| {
                let dy = grad.read_mem(cgh);
                let w = filter.read_mem(cgh);
                move |i: usize| {
                    let (b, ih, iw, c) = data.unflatten(&in_dims, i);
                    let mut acc = T::ZERO;
                    for r in 0..p.window_rows {
                        let Some(oh) = p.out_row(ih, r) else { continue };
                        for s in 0..p.window_cols {
                            let Some(ow) = p.out_col(iw, s) else { continue };
                            for f in 0..p.features {
                                acc += dy.get(data.index(&out_dims, b, oh, ow, f))
                                    * w.get(filt.index(&f_dims, r, s, c, f));
                            }
                        }
                    }
                    acc
                }
            })
        }
        Direction::FilterBackprop => {
            let input = ib.get_mem_object(t.input.clone(), x_size).as_const();
            let grad = ib.get_mem_object(t.filter.clone(), y_size).as_const();
            let out = ib.get_mem_object(t.output.clone(), f_dims.size());
            queue_scaled(backend, "conv2d_direct_filter", &out, p.alpha, p.beta, &chain.deps(), |cgh| {
                let x = input.read_mem(cgh);
                let dy = grad.read_mem(cgh);
                move |i: usize| {
                    let (r, s, c, f) = filt.unflatten(&f_dims, i);
                    let mut acc = T::ZERO;
                    for b in 0..p.batch {
                        for oh in 0..p.out_rows {
                            let Some(ih) = p.in_row(oh, r) else { continue };
                            for ow in 0..p.out_cols {
                                let Some(iw) = p.in_col(ow, s) else { continue };
                                acc += x.get(data.index(&in_dims, b, ih, iw, c))
                                    * dy.get(data.index(&out_dims, b, oh, ow, f));
                            }
                        }
                    }
                    acc
                }
            })
        }
    };
    chain.push(event);
}
