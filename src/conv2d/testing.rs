//! Host reference convolution and data helpers for the convolution tests.

use super::{Conv2DParams, ConvType, Direction, Selector};
use crate::back::{Backend, MatmulProvider};
use crate::matmul::BatchFormat;
use crate::mem::Float;
use crate::runtime::Event;
use crate::shape;
use crate::status::StatusCode;
use ndarray::{Array1, ArcArray, IxDyn};
use ndarray_rand::rand_distr::Uniform;
use ndarray_rand::RandomExt;
use once_cell::sync::Lazy;
use rand::rngs::StdRng;
use rand::SeedableRng;

static LOGGER: Lazy<()> = Lazy::new(|| {
    let _ = env_logger::builder().is_test(true).try_init();
});

pub(crate) fn init_logger() {
    Lazy::force(&LOGGER);
}

pub(crate) fn random(n: usize, seed: u64) -> Vec<f64> {
    let mut rng = StdRng::seed_from_u64(seed);
    Array1::random_using(n, Uniform::new(-1.0, 1.0), &mut rng).to_vec()
}

pub(crate) fn upload<T: Float, B: Backend>(b: &B, data: &[f64]) -> (B::Pointer<T>, Event) {
    let ptr = b.allocate::<T>(data.len()).unwrap();
    let values: Vec<T> = data.iter().map(|&v| T::from_f64(v)).collect();
    let arr = ArcArray::from_shape_vec(IxDyn(&[data.len()]), values).unwrap();
    let ev = b.upload(ptr.clone(), arr, &[]);
    (ptr, ev)
}

pub(crate) fn download<T: Float, B: Backend>(b: &B, ptr: B::Pointer<T>, n: usize, wait: &[Event]) -> Vec<f64> {
    let res = b.download(ptr, &shape![n], wait).unwrap();
    res.iter().map(|v| v.to_f64()).collect()
}

pub(crate) fn assert_close(got: &[f64], want: &[f64], tol: f64, what: &str) {
    assert_eq!(got.len(), want.len(), "{what}: length");
    for (i, (g, w)) in got.iter().zip(want).enumerate() {
        assert!(
            (g - w).abs() <= tol * (1.0 + w.abs()),
            "{what}: element {i} is {g}, expected {w}"
        );
    }
}

/// `alpha * conv + beta * init` computed on the host in `f64`.
///
/// `input` and `filter` take the roles they have in a launch in `direction`.
pub(crate) fn reference(direction: Direction, p: &Conv2DParams, input: &[f64], filter: &[f64], init: &[f64]) -> Vec<f64> {
    let (in_dims, out_dims, f_dims) = (p.in_dims(), p.out_dims(), p.filter_dims());
    let (data, filt) = (p.input_format, p.filter_format);
    let (cpg, fpg) = (p.channels_per_group(), p.features_per_group());
    let mut acc = vec![0.0; init.len()];
    for b in 0..p.batch {
        for oh in 0..p.out_rows {
            for ow in 0..p.out_cols {
                for f in 0..p.features {
                    let g = match p.group_format {
                        BatchFormat::Strided => f / fpg,
                        BatchFormat::Interleaved => f % p.groups,
                    };
                    let yi = data.index(&out_dims, b, oh, ow, f);
                    for r in 0..p.window_rows {
                        let Some(ih) = p.in_row(oh, r) else { continue };
                        for s in 0..p.window_cols {
                            let Some(iw) = p.in_col(ow, s) else { continue };
                            for cl in 0..cpg {
                                let ch = match p.group_format {
                                    BatchFormat::Strided => g * cpg + cl,
                                    BatchFormat::Interleaved => cl * p.groups + g,
                                };
                                let xi = data.index(&in_dims, b, ih, iw, ch);
                                let wi = filt.index(&f_dims, r, s, cl, f);
                                match direction {
                                    Direction::Forward => acc[yi] += input[xi] * filter[wi],
                                    Direction::InputBackprop => acc[xi] += input[yi] * filter[wi],
                                    Direction::FilterBackprop => acc[wi] += input[xi] * filter[yi],
                                }
                            }
                        }
                    }
                }
            }
        }
    }
    let (alpha, beta) = (p.alpha as f64, p.beta as f64);
    acc.iter().zip(init).map(|(a, i)| alpha * a + beta * i).collect()
}

/// Runs one launch on freshly uploaded tensors and returns the output.
pub(crate) fn run<T: Float, C: ConvType, B: MatmulProvider>(
    b: &B,
    p: &Conv2DParams,
    selector: &dyn Selector,
    input: &[f64],
    filter: &[f64],
    init: &[f64],
) -> Result<Vec<f64>, StatusCode> {
    let (x, e1) = upload::<T, B>(b, input);
    let (w, e2) = upload::<T, B>(b, filter);
    let (y, e3) = upload::<T, B>(b, init);
    let status = super::launch::<T, C, B>(x, w, y.clone(), p, selector, b, None, 0, &[e1, e2, e3]);
    if !status.is_ok() {
        return Err(status.status);
    }
    Ok(download::<T, B>(b, y, init.len(), &[status.event]))
}

/// Random tensors sized for a launch in direction `C`.
pub(crate) fn tensors<C: ConvType>(p: &Conv2DParams, seed: u64) -> [Vec<f64>; 3] {
    let sizes = super::get_sizes::<C>(p);
    [
        random(sizes.input_size, seed),
        random(sizes.filter_size, seed + 1),
        random(sizes.output_size, seed + 2),
    ]
}
