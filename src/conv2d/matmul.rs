//! 1x1 convolutions with unit stride, where an NHWC image is already a
//! `[pixels, channels]` matrix.

use super::launch::Tensors;
use super::{Chain, Conv2DParams, Direction};
use crate::back::MatmulProvider;
use crate::format::FilterFormat;
use crate::matmul::MatmulParams;
use crate::mem::Float;

pub(super) fn launch<T: Float, B: MatmulProvider>(
    backend: &B,
    direction: Direction,
    t: &Tensors<B::InternalPointer<T>>,
    p: &Conv2DParams,
    chain: &mut Chain,
) {
    let pixels = p.batch * p.in_rows * p.in_cols;
    let fhwc = p.filter_format == FilterFormat::FHWC;
    let (lhs, rhs, mm) = match direction {
        Direction::Forward => (
            t.input.clone(),
            t.filter.clone(),
            MatmulParams::new(pixels, p.channels, p.features).transposed(false, fhwc),
        ),
        Direction::InputBackprop => (
            t.input.clone(),
            t.filter.clone(),
            MatmulParams::new(pixels, p.features, p.channels).transposed(false, !fhwc),
        ),
        Direction::FilterBackprop if fhwc => (
            t.filter.clone(),
            t.input.clone(),
            MatmulParams::new(p.features, pixels, p.channels).transposed(true, false),
        ),
        Direction::FilterBackprop => (
            t.input.clone(),
            t.filter.clone(),
            MatmulParams::new(p.channels, pixels, p.features).transposed(true, false),
        ),
    };
    let mm = mm.scaled(p.alpha, p.beta);
    let event = backend.matmul(lhs, rhs, t.output.clone(), &mm, &chain.deps());
    chain.push(event);
}
