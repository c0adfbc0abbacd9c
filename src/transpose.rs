//! Dimension permutation of a dense row-major tensor.

use crate::back::MemoryProvider;
use crate::helpers::{check_index_range, size_of_dims};
use crate::mem::{DataType, MemObject, MutMemObject};
use crate::runtime::Event;
use crate::shape::Shape;
use crate::status::{validate_param, Status};

pub const MAX_TRANSPOSE_DIMS: usize = 6;

/// Writes `input` with shape `dims` to `output` so that output dimension `i`
/// is input dimension `permutation[i]`.
pub fn launch<T: DataType, B: MemoryProvider>(
    input: B::Pointer<T>,
    output: B::Pointer<T>,
    dims: &[usize],
    permutation: &[usize],
    backend: &B,
    wait: &[Event],
) -> Status {
    validate_param!(!dims.is_empty(), "A tensor must have at least one dimension.");
    validate_param!(
        dims.len() <= MAX_TRANSPOSE_DIMS,
        "Transposes support at most 6 dimensions."
    );
    validate_param!(
        dims.iter().all(|&d| d > 0),
        "All tensor dimensions must be positive."
    );
    validate_param!(
        permutation.len() == dims.len(),
        "The permutation must name every dimension."
    );
    let mut seen = [false; MAX_TRANSPOSE_DIMS];
    for &p in permutation {
        validate_param!(p < dims.len() && !seen[p], "Invalid permutation.");
        seen[p] = true;
    }

    let size = size_of_dims(dims);
    if let Err(code) = check_index_range(&[size]) {
        return code.into();
    }
    let shape = Shape::from(dims);

    let input = backend.get_mem_object(input, size).as_const();
    let output = backend.get_mem_object(output, size);
    Status::ok(queue_transpose(backend, input, output, &shape, permutation, wait))
}

pub(crate) fn queue_transpose<T, B, In, Out>(
    backend: &B,
    input: In,
    output: Out,
    shape: &Shape,
    permutation: &[usize],
    wait: &[Event],
) -> Event
where
    T: DataType,
    B: MemoryProvider,
    In: MemObject<T>,
    Out: MutMemObject<T>,
{
    let in_strides = shape.strides();
    let out_shape = shape.permute(permutation);
    let out_strides = out_shape.strides();
    // Input stride of each output dimension.
    let gather: Vec<usize> = permutation.iter().map(|&p| in_strides[p]).collect();
    let size = shape.prod();

    backend.get_queue().submit("transpose", wait, |cgh| {
        let inp = input.read_mem(cgh);
        let out = output.write_mem(cgh);
        cgh.parallel_for(size, move |idx| {
            let mut rem = idx;
            let mut src = 0;
            for (stride, g) in out_strides.iter().zip(&gather) {
                src += rem / stride * g;
                rem %= stride;
            }
            out.set(idx, inp.get(src));
        });
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::back::{Backend, BufferBackend};
    use crate::shape;
    use crate::status::StatusCode;
    use ndarray::{ArcArray, IxDyn};

    #[test]
    fn test_matches_ndarray_permutation() {
        let b = BufferBackend::host().unwrap();
        let data = ArcArray::from_shape_vec(IxDyn(&[2, 3, 4]), (0..24).map(|v| v as f32).collect())
            .unwrap();
        let inp = b.allocate::<f32>(24).unwrap();
        let out = b.allocate::<f32>(24).unwrap();
        let up = b.upload(inp.clone(), data.clone(), &[]);
        let status = launch::<f32, _>(inp, out.clone(), &[2, 3, 4], &[2, 0, 1], &b, &[up]);
        assert!(status.is_ok());
        let res = b.download(out, &shape![4, 2, 3], &[status.event]).unwrap();
        let expected = data.permuted_axes(IxDyn(&[2, 0, 1]));
        assert_eq!(res, expected);
    }

    #[test]
    fn test_rejects_bad_permutation() {
        let b = BufferBackend::host().unwrap();
        let p = b.allocate::<f32>(6).unwrap();
        let status = launch::<f32, _>(p.clone(), p, &[2, 3], &[1, 1], &b, &[]);
        assert_eq!(status.status, StatusCode::InvalidParameter);
    }

    #[cfg(not(feature = "index64"))]
    #[test]
    fn test_oversized_dims_exceed_index() {
        let b = BufferBackend::host().unwrap();
        let p = b.allocate::<f32>(1).unwrap();
        let before = b.get_queue().submission_count();
        for dims in [[1usize << 16, 1 << 16], [usize::MAX, 3]] {
            let status = launch::<f32, _>(p.clone(), p.clone(), &dims, &[1, 0], &b, &[]);
            assert_eq!(status.status, StatusCode::IndexExceeded, "{dims:?}");
            assert!(status.event.is_null());
        }
        assert_eq!(b.get_queue().submission_count(), before);
    }
}
