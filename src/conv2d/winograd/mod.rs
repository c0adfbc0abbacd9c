//! Winograd convolution for unit stride windows of up to three taps per
//! axis.
//!
//! Filter and input tiles are moved into the transformed domain, where the
//! convolution of one tile becomes `alpha` independent products summed over
//! channels. Those sums are a single batched matrix multiply per minibatch.
//!
//! The workspace holds the transformed filter, then the transformed inputs
//! and finally the products, both sized by the images per pass. The filter
//! gradient uses the first region as the accumulator of the products and the
//! last for the transformed output gradient.

mod transform;

use super::launch::{Scratch, Tensors};
use super::workspace::layout;
use super::{Algorithm, Chain, Conv2DParams, Direction};
use crate::back::{Backend, InternalBackend, MatmulProvider, MemoryProvider};
use crate::format::{DataFormat, ImageDims};
use crate::helpers::{queue_scaled, round_ratio_up};
use crate::matmul::{BatchFormat, MatmulParams};
use crate::mem::{Float, MemObject, MutMemObject};
use crate::runtime::Event;
use transform::Transform;

/// Widest transformed tile, `F(4, 3)`.
const MAX_TILE: usize = 6;

/// Tiling of one convolution: the transform along each axis and the number
/// of tiles per image.
#[derive(Debug, Clone)]
pub(crate) struct TileGeometry {
    rows: Transform,
    cols: Transform,
    tile_rows: usize,
    tile_cols: usize,
    /// Channels of the transformed input.
    src_channels: usize,
    /// Channels of the products.
    dst_channels: usize,
}

impl TileGeometry {
    pub fn new(direction: Direction, p: &Conv2DParams, large: bool) -> Self {
        let (rows, cols) = match direction {
            Direction::FilterBackprop => {
                let r = if large { 3 } else { 2 };
                (Transform::new(p.window_rows, r), Transform::new(p.window_cols, r))
            }
            _ => {
                let m = if large { 4 } else { 2 };
                (Transform::new(m, p.window_rows), Transform::new(m, p.window_cols))
            }
        };
        let (tile_rows, tile_cols) = match direction {
            Direction::Forward => (round_ratio_up(p.out_rows, rows.m), round_ratio_up(p.out_cols, cols.m)),
            Direction::InputBackprop => (round_ratio_up(p.in_rows, rows.m), round_ratio_up(p.in_cols, cols.m)),
            Direction::FilterBackprop => (round_ratio_up(p.out_rows, rows.r), round_ratio_up(p.out_cols, cols.r)),
        };
        let (src_channels, dst_channels) = match direction {
            Direction::InputBackprop => (p.features, p.channels),
            _ => (p.channels, p.features),
        };
        Self {
            rows,
            cols,
            tile_rows,
            tile_cols,
            src_channels,
            dst_channels,
        }
    }

    pub fn alpha(&self) -> usize {
        self.rows.alpha * self.cols.alpha
    }

    pub fn tiles(&self) -> usize {
        self.tile_rows * self.tile_cols
    }

    pub fn filter_transform_size(&self) -> usize {
        self.alpha() * self.src_channels * self.dst_channels
    }

    /// Per image.
    pub fn input_transform_size(&self) -> usize {
        self.alpha() * self.tiles() * self.src_channels
    }

    /// Per image.
    pub fn inter_transform_size(&self) -> usize {
        self.alpha() * self.tiles() * self.dst_channels
    }
}

/// Placement of input tiles over the tensor they are cut from.
#[derive(Debug, Clone, Copy)]
struct Tiling {
    src: ImageDims,
    pad_rows: isize,
    pad_cols: isize,
    step_rows: usize,
    step_cols: usize,
}

pub(super) fn launch<T: Float, B: MatmulProvider>(
    backend: &B,
    direction: Direction,
    large: bool,
    t: &Tensors<B::InternalPointer<T>>,
    ws: &Scratch<B::InternalPointer<T>>,
    p: &Conv2DParams,
    chain: &mut Chain,
) {
    let algorithm = if large { Algorithm::WinogradLarge } else { Algorithm::Winograd };
    let geo = TileGeometry::new(direction, p, large);
    let images = layout(algorithm, direction, p).images(ws.size, p.batch);
    log::debug!(
        "{algorithm} {direction:?}: F({}x{}, {}x{}), {} tiles, {images} of {} images per pass",
        geo.rows.m,
        geo.cols.m,
        geo.rows.r,
        geo.cols.r,
        geo.tiles(),
        p.batch
    );
    match direction {
        Direction::FilterBackprop => filter_backprop(backend, t, ws, &geo, p, images, chain),
        _ => convolve(backend, direction, t, ws, &geo, p, images, chain),
    }
}

#[allow(clippy::too_many_arguments)]
fn convolve<T: Float, B: MatmulProvider>(
    backend: &B,
    direction: Direction,
    t: &Tensors<B::InternalPointer<T>>,
    ws: &Scratch<B::InternalPointer<T>>,
    geo: &TileGeometry,
    p: &Conv2DParams,
    images: usize,
    chain: &mut Chain,
) {
    let ib = InternalBackend::new(backend);
    let flip = direction == Direction::InputBackprop;
    let (src, dst) = if flip { (p.out_dims(), p.in_dims()) } else { (p.in_dims(), p.out_dims()) };
    let (pad_rows, pad_cols) = if flip {
        (
            p.window_rows as isize - 1 - p.pad_rows as isize,
            p.window_cols as isize - 1 - p.pad_cols as isize,
        )
    } else {
        (p.pad_rows as isize, p.pad_cols as isize)
    };
    let tiling = Tiling {
        src,
        pad_rows,
        pad_cols,
        step_rows: geo.rows.m,
        step_cols: geo.cols.m,
    };
    let (src_image, dst_image) = (src.size() / p.batch, dst.size() / p.batch);
    let input_t = ws.ptr.clone() + geo.filter_transform_size();
    let inter = input_t.clone() + images * geo.input_transform_size();

    let event = filter_transform(backend, t.filter.clone(), ws.ptr.clone(), geo, p, flip, &chain.deps());
    chain.push(event);

    let mut b0 = 0;
    while b0 < p.batch {
        let mb = images.min(p.batch - b0);
        let source = ib.get_mem_object(t.input.clone() + b0 * src_image, mb * src_image).as_const();
        let transformed = ib.get_mem_object(input_t.clone(), mb * geo.input_transform_size());
        let event = input_transform(backend, &source, &transformed, geo, tiling, mb, &chain.deps());
        chain.push(event);

        let rows = mb * geo.tiles();
        let mm = MatmulParams::new(rows, geo.src_channels, geo.dst_channels)
            .batched(geo.alpha(), BatchFormat::Strided);
        let event = backend.matmul(input_t.clone(), ws.ptr.clone(), inter.clone(), &mm, &chain.deps());
        chain.push(event);

        let products = ib.get_mem_object(inter.clone(), mb * geo.inter_transform_size()).as_const();
        let out = ib.get_mem_object(t.output.clone() + b0 * dst_image, mb * dst_image);
        let dims = ImageDims::new(mb, dst.rows, dst.cols, dst.channels);
        let (at_r, at_c) = (geo.rows.clone(), geo.cols.clone());
        let (tiles, tile_cols, n) = (geo.tiles(), geo.tile_cols, geo.dst_channels);
        let event = queue_scaled(backend, "winograd_output", &out, p.alpha, p.beta, &chain.deps(), |cgh| {
            let y = products.read_mem(cgh);
            move |i: usize| {
                let (b, oh, ow, f) = DataFormat::NHWC.unflatten(&dims, i);
                let (tr, u) = (oh / at_r.m, oh % at_r.m);
                let (tc, v) = (ow / at_c.m, ow % at_c.m);
                let row = b * tiles + tr * tile_cols + tc;
                let mut acc = 0.0;
                for ar in 0..at_r.alpha {
                    for ac in 0..at_c.alpha {
                        let a = ar * at_c.alpha + ac;
                        acc += at_r.at(u, ar) * at_c.at(v, ac) * y.get((a * rows + row) * n + f).to_f64();
                    }
                }
                T::from_f64(acc)
            }
        });
        chain.push(event);
        b0 += mb;
    }
}

/// `Ft[a][k][n] = (G w Gᵀ)[a]`, with the filter rotated by half a turn and
/// channels swapped with features when `flip` is set.
fn filter_transform<T: Float, B: Backend>(
    backend: &B,
    filter: B::InternalPointer<T>,
    dst: B::InternalPointer<T>,
    geo: &TileGeometry,
    p: &Conv2DParams,
    flip: bool,
    wait: &[Event],
) -> Event {
    let ib = InternalBackend::new(backend);
    let dims = p.filter_dims();
    let fmt = p.filter_format;
    let filter = ib.get_mem_object(filter, dims.size()).as_const();
    let out = ib.get_mem_object(dst, geo.filter_transform_size());
    let (g_r, g_c) = (geo.rows.clone(), geo.cols.clone());
    let (k_n, n_n) = (geo.src_channels, geo.dst_channels);

    backend.get_queue().submit("winograd_filter", wait, |cgh| {
        let w = filter.read_mem(cgh);
        let ft = out.write_mem(cgh);
        cgh.parallel_for(ft.len(), move |idx| {
            let n = idx % n_n;
            let rest = idx / n_n;
            let (a, k) = (rest / k_n, rest % k_n);
            let (ar, ac) = (a / g_c.alpha, a % g_c.alpha);
            let (c, f) = if flip { (n, k) } else { (k, n) };
            let mut acc = 0.0;
            for i in 0..g_r.r {
                for j in 0..g_c.r {
                    let (r, s) = if flip { (g_r.r - 1 - i, g_c.r - 1 - j) } else { (i, j) };
                    acc += g_r.g(ar, i) * g_c.g(ac, j) * w.get(fmt.index(&dims, r, s, c, f)).to_f64();
                }
            }
            ft.set(idx, T::from_f64(acc));
        });
    })
}

/// `It[a][tile][k] = (Bᵀ d B)[a]` for every tile of `mb` images.
fn input_transform<T, B, In, Out>(
    backend: &B,
    source: &In,
    dst: &Out,
    geo: &TileGeometry,
    tiling: Tiling,
    mb: usize,
    wait: &[Event],
) -> Event
where
    T: Float,
    B: MemoryProvider,
    In: MemObject<T>,
    Out: MutMemObject<T>,
{
    let (bt_r, bt_c) = (geo.rows.clone(), geo.cols.clone());
    let (tiles, tile_cols, k_n) = (geo.tiles(), geo.tile_cols, geo.src_channels);
    let rows = mb * tiles;
    let src = tiling.src;

    backend.get_queue().submit("winograd_input", wait, |cgh| {
        let x = source.read_mem(cgh);
        let it = dst.write_mem(cgh);
        cgh.parallel_for(rows * k_n, move |idx| {
            let (row, k) = (idx / k_n, idx % k_n);
            let (b, t) = (row / tiles, row % tiles);
            let (tr, tc) = (t / tile_cols, t % tile_cols);
            let r0 = (tr * tiling.step_rows) as isize - tiling.pad_rows;
            let c0 = (tc * tiling.step_cols) as isize - tiling.pad_cols;

            let mut d = [[0.0f64; MAX_TILE]; MAX_TILE];
            for (i, line) in d.iter_mut().enumerate().take(bt_r.alpha) {
                let ih = r0 + i as isize;
                if ih < 0 || ih >= src.rows as isize {
                    continue;
                }
                for (j, v) in line.iter_mut().enumerate().take(bt_c.alpha) {
                    let iw = c0 + j as isize;
                    if iw >= 0 && iw < src.cols as isize {
                        *v = x.get(DataFormat::NHWC.index(&src, b, ih as usize, iw as usize, k)).to_f64();
                    }
                }
            }

            for ar in 0..bt_r.alpha {
                for ac in 0..bt_c.alpha {
                    let mut acc = 0.0;
                    for (i, line) in d.iter().enumerate().take(bt_r.alpha) {
                        let br = bt_r.bt(ar, i);
                        if br == 0.0 {
                            continue;
                        }
                        for (j, v) in line.iter().enumerate().take(bt_c.alpha) {
                            acc += br * bt_c.bt(ac, j) * v;
                        }
                    }
                    let a = ar * bt_c.alpha + ac;
                    it.set((a * rows + row) * k_n + k, T::from_f64(acc));
                }
            }
        });
    })
}

/// The output gradient plays the part of the filter: every tile of it is
/// correlated with the input window it covers, and the products of all tiles
/// are summed before the single output transform.
#[allow(clippy::too_many_arguments)]
fn filter_backprop<T: Float, B: MatmulProvider>(
    backend: &B,
    t: &Tensors<B::InternalPointer<T>>,
    ws: &Scratch<B::InternalPointer<T>>,
    geo: &TileGeometry,
    p: &Conv2DParams,
    images: usize,
    chain: &mut Chain,
) {
    let ib = InternalBackend::new(backend);
    let (in_dims, out_dims) = (p.in_dims(), p.out_dims());
    let tiling = Tiling {
        src: in_dims,
        pad_rows: p.pad_rows as isize,
        pad_cols: p.pad_cols as isize,
        step_rows: geo.rows.r,
        step_cols: geo.cols.r,
    };
    let (in_image, out_image) = (in_dims.size() / p.batch, out_dims.size() / p.batch);
    let accum = ws.ptr.clone();
    let input_t = accum.clone() + geo.filter_transform_size();
    let grad_t = input_t.clone() + images * geo.input_transform_size();

    let mut b0 = 0;
    while b0 < p.batch {
        let mb = images.min(p.batch - b0);
        let source = ib.get_mem_object(t.input.clone() + b0 * in_image, mb * in_image).as_const();
        let transformed = ib.get_mem_object(input_t.clone(), mb * geo.input_transform_size());
        let event = input_transform(backend, &source, &transformed, geo, tiling, mb, &chain.deps());
        chain.push(event);

        let grad = ib.get_mem_object(t.filter.clone() + b0 * out_image, mb * out_image).as_const();
        let grad_out = ib.get_mem_object(grad_t.clone(), mb * geo.inter_transform_size());
        let dims = ImageDims::new(mb, p.out_rows, p.out_cols, p.features);
        let (g_r, g_c) = (geo.rows.clone(), geo.cols.clone());
        let (tiles, tile_cols, features) = (geo.tiles(), geo.tile_cols, p.features);
        let rows = mb * tiles;
        let event = backend.get_queue().submit("winograd_grad", &chain.deps(), |cgh| {
            let dy = grad.read_mem(cgh);
            let out = grad_out.write_mem(cgh);
            cgh.parallel_for(out.len(), move |idx| {
                let f = idx % features;
                let rest = idx / features;
                let (a, row) = (rest / rows, rest % rows);
                let (ar, ac) = (a / g_c.alpha, a % g_c.alpha);
                let (b, tile) = (row / tiles, row % tiles);
                let (r0, c0) = ((tile / tile_cols) * g_r.r, (tile % tile_cols) * g_c.r);
                let mut acc = 0.0;
                for i in 0..g_r.r {
                    let oh = r0 + i;
                    if oh >= dims.rows {
                        break;
                    }
                    for j in 0..g_c.r {
                        let ow = c0 + j;
                        if ow >= dims.cols {
                            break;
                        }
                        acc += g_r.g(ar, i) * g_c.g(ac, j) * dy.get(DataFormat::NHWC.index(&dims, b, oh, ow, f)).to_f64();
                    }
                }
                out.set(idx, T::from_f64(acc));
            });
        });
        chain.push(event);

        let beta = if b0 == 0 { 0.0 } else { 1.0 };
        let mm = MatmulParams::new(p.channels, rows, p.features)
            .batched(geo.alpha(), BatchFormat::Strided)
            .transposed(true, false)
            .scaled(1.0, beta);
        let event = backend.matmul(input_t.clone(), grad_t.clone(), accum.clone(), &mm, &chain.deps());
        chain.push(event);
        b0 += mb;
    }

    let dims = p.filter_dims();
    let fmt = p.filter_format;
    let sums = ib.get_mem_object(accum, geo.filter_transform_size()).as_const();
    let out = ib.get_mem_object(t.output.clone(), dims.size());
    let (at_r, at_c) = (geo.rows.clone(), geo.cols.clone());
    let (channels, features) = (p.channels, p.features);
    let event = queue_scaled(backend, "winograd_filter_output", &out, p.alpha, p.beta, &chain.deps(), |cgh| {
        let acc_in = sums.read_mem(cgh);
        move |i: usize| {
            let (r, s, c, f) = fmt.unflatten(&dims, i);
            let mut acc = 0.0;
            for ar in 0..at_r.alpha {
                for ac in 0..at_c.alpha {
                    let a = ar * at_c.alpha + ac;
                    acc += at_r.at(r, ar) * at_c.at(s, ac) * acc_in.get((a * channels + c) * features + f).to_f64();
                }
            }
            T::from_f64(acc)
        }
    });
    chain.push(event);
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tile_geometry() {
        let p = Conv2DParams {
            channels: 2,
            features: 3,
            batch: 1,
            in_rows: 5,
            in_cols: 4,
            out_rows: 5,
            out_cols: 4,
            window_rows: 1,
            window_cols: 3,
            pad_cols: 1,
            ..Default::default()
        };
        let g = TileGeometry::new(Direction::Forward, &p, false);
        assert_eq!((g.rows.alpha, g.cols.alpha), (2, 4));
        assert_eq!((g.tile_rows, g.tile_cols), (3, 2));
        assert_eq!(g.filter_transform_size(), 8 * 2 * 3);

        let g = TileGeometry::new(Direction::InputBackprop, &p, false);
        assert_eq!((g.src_channels, g.dst_channels), (3, 2));
        assert_eq!(g.input_transform_size(), 8 * 6 * 3);

        let g = TileGeometry::new(Direction::FilterBackprop, &p, false);
        assert_eq!((g.rows.m, g.rows.r, g.cols.m, g.cols.r), (1, 2, 3, 2));
        assert_eq!((g.tile_rows, g.tile_cols), (3, 2));
        assert!(g.alpha() <= MAX_TILE * MAX_TILE);
    }
}
