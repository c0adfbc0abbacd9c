//! Convolution lowered to matrix multiplies.
//!
//! Each window of the input is unrolled into one row of a matrix, which is
//! then multiplied by the filter. The workspace holds, in order, the
//! transformed filter, the unrolled input and, for strided group
//! convolutions, the per-group output before it is interleaved back into
//! NHWC.

use super::launch::{Scratch, Tensors};
use super::workspace::layout;
use super::{Algorithm, Chain, Conv2DParams, Direction};
use crate::back::{Backend, InternalBackend, MatmulProvider, MemoryProvider};
use crate::format::{DataFormat, FilterFormat};
use crate::helpers::queue_scaled;
use crate::matmul::{BatchFormat, MatmulParams};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;

/// Sizes of the transformed tensors, in elements, for one image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TransformSizes {
    pub input: usize,
    pub filter: usize,
    pub output: usize,
}

/// Number of unrolled rows per image and their length.
fn tile_info(direction: Direction, p: &Conv2DParams) -> (usize, usize) {
    match direction {
        Direction::Forward => (
            p.out_rows * p.out_cols,
            p.window_rows * p.window_cols * p.channels_per_group(),
        ),
        Direction::InputBackprop => (p.in_rows * p.in_cols, p.window_rows * p.window_cols * p.features),
        Direction::FilterBackprop => (p.window_rows * p.window_cols * p.channels, p.out_rows * p.out_cols),
    }
}

fn interleaved_hwcf(p: &Conv2DParams) -> bool {
    p.group_format == BatchFormat::Interleaved && p.filter_format == FilterFormat::HWCF
}

impl TransformSizes {
    pub fn new(direction: Direction, p: &Conv2DParams) -> Self {
        let (tiles, tile_size) = tile_info(direction, p);
        let whole_filter = p.window_rows * p.window_cols * p.channels_per_group() * p.features;
        let filter = match direction {
            Direction::InputBackprop => whole_filter,
            _ if p.groups == 1 || interleaved_hwcf(p) => 0,
            _ if p.group_format == BatchFormat::Strided && p.filter_format == FilterFormat::FHWC => 0,
            _ => whole_filter,
        };
        let output = if direction == Direction::Forward && p.groups > 1 && !interleaved_hwcf(p) {
            p.out_rows * p.out_cols * p.features
        } else {
            0
        };
        Self {
            input: p.groups * tiles * tile_size,
            filter,
            output,
        }
    }
}

/// Depthwise convolutions without a channel multiplier have the same layout
/// in both group formats, and the interleaved one needs no output shuffle.
fn use_interleaved_groups<B: Backend>(backend: &B, p: &Conv2DParams) -> Conv2DParams {
    let mut p = *p;
    if backend.supports_interleaved_matmul()
        && p.groups > 1
        && p.groups == p.channels
        && p.groups == p.features
        && p.group_format == BatchFormat::Strided
        && p.filter_format == FilterFormat::HWCF
    {
        log::debug!("im2col: depthwise groups run interleaved");
        p.group_format = BatchFormat::Interleaved;
    }
    p
}

pub(super) fn launch<T: Float, B: MatmulProvider>(
    backend: &B,
    direction: Direction,
    t: &Tensors<B::InternalPointer<T>>,
    ws: &Scratch<B::InternalPointer<T>>,
    params: &Conv2DParams,
    chain: &mut Chain,
) {
    let p = use_interleaved_groups(backend, params);
    let sizes = TransformSizes::new(direction, &p);
    let images = layout(Algorithm::Im2col, direction, &p).images(ws.size, p.batch);
    log::debug!("im2col {direction:?}: {images} of {} images per pass", p.batch);

    if sizes.filter > 0 {
        let event = filter_transform(backend, direction, t, ws, &p, &chain.deps());
        chain.push(event);
    }
    let mut b0 = 0;
    while b0 < p.batch {
        let mb = images.min(p.batch - b0);
        match direction {
            Direction::Forward => forward(backend, t, ws, &sizes, &p, b0, mb, images, chain),
            Direction::InputBackprop => input_backprop(backend, t, ws, &sizes, &p, b0, mb, chain),
            Direction::FilterBackprop => filter_backprop(backend, t, ws, &sizes, &p, b0, mb, chain),
        }
        b0 += mb;
    }
}

fn filter_transform<T: Float, B: MatmulProvider>(
    backend: &B,
    direction: Direction,
    t: &Tensors<B::InternalPointer<T>>,
    ws: &Scratch<B::InternalPointer<T>>,
    p: &Conv2DParams,
    wait: &[Event],
) -> Event {
    let ib = InternalBackend::new(backend);
    let dims = p.filter_dims();
    let fmt = p.filter_format;
    let filter = ib.get_mem_object(t.filter.clone(), dims.size()).as_const();
    let out = ib.get_mem_object(ws.ptr.clone(), dims.size());
    let (cpg, fpg, features) = (p.channels_per_group(), p.features_per_group(), p.features);
    let tile = p.window_rows * p.window_cols;

    backend.get_queue().submit("im2col_filter", wait, |cgh| {
        let w = filter.read_mem(cgh);
        let ft = out.write_mem(cgh);
        if direction == Direction::InputBackprop {
            // [(r, s, f)][c]
            cgh.parallel_for(dims.size(), move |idx| {
                let c = idx % cpg;
                let rest = idx / cpg;
                let (rs, f) = (rest / features, rest % features);
                let (r, s) = (rs / dims.cols, rs % dims.cols);
                ft.set(idx, w.get(fmt.index(&dims, r, s, c, f)));
            });
        } else {
            // [g][(r, s, c)][fl]
            cgh.parallel_for(dims.size(), move |idx| {
                let fl = idx % fpg;
                let rest = idx / fpg;
                let k = rest % (tile * cpg);
                let g = rest / (tile * cpg);
                let (rs, c) = (k / cpg, k % cpg);
                let (r, s) = (rs / dims.cols, rs % dims.cols);
                ft.set(idx, w.get(fmt.index(&dims, r, s, c, g * fpg + fl)));
            });
        }
    })
}

#[allow(clippy::too_many_arguments)]
fn forward<T: Float, B: MatmulProvider>(
    backend: &B,
    t: &Tensors<B::InternalPointer<T>>,
    ws: &Scratch<B::InternalPointer<T>>,
    sizes: &TransformSizes,
    p: &Conv2DParams,
    b0: usize,
    mb: usize,
    images: usize,
    chain: &mut Chain,
) {
    let ib = InternalBackend::new(backend);
    let (tiles, tile_size) = tile_info(Direction::Forward, p);
    let (in_dims, out_dims) = (p.in_dims(), p.out_dims());
    let in_image = in_dims.size() / p.batch;
    let out_image = out_dims.size() / p.batch;
    let (groups, cpg, fpg) = (p.groups, p.channels_per_group(), p.features_per_group());
    let interleaved = p.group_format == BatchFormat::Interleaved;
    let rows = mb * tiles;

    let unrolled_ptr = ws.ptr.clone() + sizes.filter;
    let input = ib.get_mem_object(t.input.clone() + b0 * in_image, mb * in_image).as_const();
    let unrolled = ib.get_mem_object(unrolled_ptr.clone(), mb * sizes.input);
    let q = *p;
    let event = backend.get_queue().submit("im2col_input", &chain.deps(), |cgh| {
        let x = input.read_mem(cgh);
        let out = unrolled.write_mem(cgh);
        cgh.parallel_for(mb * sizes.input, move |idx| {
            let (g, row, k) = if interleaved {
                (idx % groups, idx / groups / tile_size, idx / groups % tile_size)
            } else {
                (idx / (rows * tile_size), idx / tile_size % rows, idx % tile_size)
            };
            let (b, o) = (row / tiles, row % tiles);
            let (oh, ow) = (o / q.out_cols, o % q.out_cols);
            let (rs, cl) = (k / cpg, k % cpg);
            let (r, s) = (rs / q.window_cols, rs % q.window_cols);
            let ch = if interleaved { cl * groups + g } else { g * cpg + cl };
            let v = match (q.in_row(oh, r), q.in_col(ow, s)) {
                (Some(ih), Some(iw)) => x.get(DataFormat::NHWC.index(&in_dims, b, ih, iw, ch)),
                _ => T::ZERO,
            };
            out.set(idx, v);
        });
    });
    chain.push(event);

    let output = t.output.clone() + b0 * out_image;
    let fhwc = p.filter_format == FilterFormat::FHWC;
    if groups == 1 || interleaved {
        let mm = MatmulParams::new(rows, tile_size, fpg)
            .batched(groups, p.group_format)
            .transposed(false, fhwc)
            .scaled(p.alpha, p.beta);
        let event = backend.matmul(unrolled_ptr, t.filter.clone(), output, &mm, &chain.deps());
        chain.push(event);
        return;
    }

    let filter = if fhwc { t.filter.clone() } else { ws.ptr.clone() };
    let grouped_ptr = ws.ptr.clone() + sizes.filter + images * sizes.input;
    let mm = MatmulParams::new(rows, tile_size, fpg)
        .batched(groups, BatchFormat::Strided)
        .transposed(false, fhwc);
    let event = backend.matmul(unrolled_ptr, filter, grouped_ptr.clone(), &mm, &chain.deps());
    chain.push(event);

    // [g][row][fl] back to [row][g * fpg + fl].
    let features = p.features;
    let grouped = ib.get_mem_object(grouped_ptr, mb * sizes.output).as_const();
    let out = ib.get_mem_object(output, mb * out_image);
    let event = queue_scaled(backend, "im2col_output", &out, p.alpha, p.beta, &chain.deps(), |cgh| {
        let y = grouped.read_mem(cgh);
        move |i: usize| {
            let (row, f) = (i / features, i % features);
            let (g, fl) = (f / fpg, f % fpg);
            y.get((g * rows + row) * fpg + fl)
        }
    });
    chain.push(event);
}

#[allow(clippy::too_many_arguments)]
fn input_backprop<T: Float, B: MatmulProvider>(
    backend: &B,
    t: &Tensors<B::InternalPointer<T>>,
    ws: &Scratch<B::InternalPointer<T>>,
    sizes: &TransformSizes,
    p: &Conv2DParams,
    b0: usize,
    mb: usize,
    chain: &mut Chain,
) {
    let ib = InternalBackend::new(backend);
    let (tiles, tile_size) = tile_info(Direction::InputBackprop, p);
    let (in_dims, out_dims) = (p.in_dims(), p.out_dims());
    let in_image = in_dims.size() / p.batch;
    let out_image = out_dims.size() / p.batch;
    let features = p.features;

    let unrolled_ptr = ws.ptr.clone() + sizes.filter;
    let grad = ib.get_mem_object(t.input.clone() + b0 * out_image, mb * out_image).as_const();
    let unrolled = ib.get_mem_object(unrolled_ptr.clone(), mb * sizes.input);
    let q = *p;
    let event = backend.get_queue().submit("im2col_input", &chain.deps(), |cgh| {
        let dy = grad.read_mem(cgh);
        let out = unrolled.write_mem(cgh);
        cgh.parallel_for(mb * sizes.input, move |idx| {
            let (row, k) = (idx / tile_size, idx % tile_size);
            let (b, i) = (row / tiles, row % tiles);
            let (ih, iw) = (i / q.in_cols, i % q.in_cols);
            let (rs, f) = (k / features, k % features);
            let (r, s) = (rs / q.window_cols, rs % q.window_cols);
            let v = match (q.out_row(ih, r), q.out_col(iw, s)) {
                (Some(oh), Some(ow)) => dy.get(DataFormat::NHWC.index(&out_dims, b, oh, ow, f)),
                _ => T::ZERO,
            };
            out.set(idx, v);
        });
    });
    chain.push(event);

    let mm = MatmulParams::new(mb * tiles, tile_size, p.channels).scaled(p.alpha, p.beta);
    let output = t.output.clone() + b0 * in_image;
    let event = backend.matmul(unrolled_ptr, ws.ptr.clone(), output, &mm, &chain.deps());
    chain.push(event);
}

#[allow(clippy::too_many_arguments)]
fn filter_backprop<T: Float, B: MatmulProvider>(
    backend: &B,
    t: &Tensors<B::InternalPointer<T>>,
    ws: &Scratch<B::InternalPointer<T>>,
    sizes: &TransformSizes,
    p: &Conv2DParams,
    b0: usize,
    mb: usize,
    chain: &mut Chain,
) {
    let ib = InternalBackend::new(backend);
    let (tiles, tile_size) = tile_info(Direction::FilterBackprop, p);
    let (in_dims, out_dims) = (p.in_dims(), p.out_dims());
    let in_image = in_dims.size() / p.batch;
    let out_image = out_dims.size() / p.batch;
    let channels = p.channels;
    let k = mb * tile_size;

    let unrolled_ptr = ws.ptr.clone() + sizes.filter;
    let input = ib.get_mem_object(t.input.clone() + b0 * in_image, mb * in_image).as_const();
    let unrolled = ib.get_mem_object(unrolled_ptr.clone(), tiles * k);
    let q = *p;
    let event = backend.get_queue().submit("im2col_input", &chain.deps(), |cgh| {
        let x = input.read_mem(cgh);
        let out = unrolled.write_mem(cgh);
        // [(r, s, c)][(b, oh, ow)]
        cgh.parallel_for(tiles * k, move |idx| {
            let (tile, col) = (idx / k, idx % k);
            let (rs, c) = (tile / channels, tile % channels);
            let (r, s) = (rs / q.window_cols, rs % q.window_cols);
            let (b, o) = (col / tile_size, col % tile_size);
            let (oh, ow) = (o / q.out_cols, o % q.out_cols);
            let v = match (q.in_row(oh, r), q.in_col(ow, s)) {
                (Some(ih), Some(iw)) => x.get(DataFormat::NHWC.index(&in_dims, b, ih, iw, c)),
                _ => T::ZERO,
            };
            out.set(idx, v);
        });
    });
    chain.push(event);

    // Later passes accumulate onto the earlier ones.
    let beta = if b0 == 0 { p.beta } else { 1.0 };
    let grad = t.filter.clone() + b0 * out_image;
    let event = if p.filter_format == FilterFormat::FHWC {
        let mm = MatmulParams::new(p.features, k, tiles)
            .transposed(true, true)
            .scaled(p.alpha, beta);
        backend.matmul(grad, unrolled_ptr, t.output.clone(), &mm, &chain.deps())
    } else {
        let mm = MatmulParams::new(tiles, k, p.features).scaled(p.alpha, beta);
        backend.matmul(unrolled_ptr, grad, t.output.clone(), &mm, &chain.deps())
    };
    chain.push(event);
}
