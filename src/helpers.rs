//! Small utilities shared by the operation families.

use crate::back::MemoryProvider;
use crate::mem::{Float, MutMemObject};
use crate::runtime::{Event, Handler};
use crate::status::StatusCode;

/// Largest element count a kernel may address.
#[cfg(not(feature = "index64"))]
pub const MAX_INDEX: u64 = i32::MAX as u64;
#[cfg(feature = "index64")]
pub const MAX_INDEX: u64 = i64::MAX as u64;

/// Fails with [`StatusCode::IndexExceeded`] if any size is out of range.
pub fn check_index_range(sizes: &[usize]) -> Result<(), StatusCode> {
    if sizes.iter().any(|&s| s as u64 > MAX_INDEX) {
        log::warn!("tensor sizes {sizes:?} exceed index range {MAX_INDEX}");
        return Err(StatusCode::IndexExceeded);
    }
    Ok(())
}

/// Product that saturates rather than wrapping, so overflow shows up as an
/// out of range size.
pub(crate) fn size_of_dims(dims: &[usize]) -> usize {
    dims.iter().fold(1usize, |acc, &d| acc.saturating_mul(d))
}

pub fn round_ratio_up(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}

pub fn round_up_to_nearest_multiple(x: usize, multiple: usize) -> usize {
    round_ratio_up(x, multiple) * multiple
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaddingMode {
    /// Windows stay inside the input.
    Valid,
    /// Output size is the input size divided by the stride.
    Same,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PaddingAndOutput {
    pub padding: usize,
    pub output: usize,
}

pub fn calculate_padding(
    input: usize,
    window: usize,
    stride: usize,
    mode: PaddingMode,
) -> PaddingAndOutput {
    match mode {
        PaddingMode::Valid => PaddingAndOutput {
            padding: 0,
            output: round_ratio_up((input + 1).saturating_sub(window), stride),
        },
        PaddingMode::Same => {
            let output = round_ratio_up(input, stride);
            let needed = ((output - 1) * stride + window).saturating_sub(input);
            PaddingAndOutput {
                padding: needed / 2,
                output,
            }
        }
    }
}

/// Parameter structs with a sliding window over rows and columns.
pub trait WindowParams: Sized {
    /// `(input, window, stride)` for rows then columns.
    fn window_geometry(&self) -> [(usize, usize, usize); 2];
    fn set_output_and_padding(&mut self, rows: PaddingAndOutput, cols: PaddingAndOutput);
}

/// Fills in output sizes and padding for the given padding mode.
pub fn add_padding_to<P: WindowParams>(mut params: P, mode: PaddingMode) -> P {
    let [(ir, wr, sr), (ic, wc, sc)] = params.window_geometry();
    let rows = calculate_padding(ir, wr, sr, mode);
    let cols = calculate_padding(ic, wc, sc, mode);
    params.set_output_and_padding(rows, cols);
    params
}

/// Whether `output` windows of `window` elements, `stride` apart and starting
/// `pad` elements before the input, agree with an input of `input` elements.
///
/// Every window must overlap the input, and the output may not stop short of
/// the windows that fit inside the padded input.
pub(crate) fn window_fits(input: usize, output: usize, window: usize, stride: usize, pad: usize) -> bool {
    if output == 0 || stride == 0 {
        return false;
    }
    let last = (output - 1).saturating_mul(stride);
    let fewest = (input + 2 * pad)
        .checked_sub(window)
        .map_or(1, |span| span / stride + 1);
    pad < window && last < input + pad && output >= fewest
}

/// Submits a kernel writing `alpha * f(i) + beta * output[i]` to every element
/// of `output`, where `build` registers the reads and returns `f`.
///
/// `f` is never called when `alpha` is zero, and `output` is not read when
/// `beta` is zero.
pub(crate) fn queue_scaled<T, B, Out, K, F>(
    backend: &B,
    label: &'static str,
    output: &Out,
    alpha: f32,
    beta: f32,
    wait: &[Event],
    build: K,
) -> Event
where
    T: Float,
    B: MemoryProvider,
    Out: MutMemObject<T>,
    K: FnOnce(&mut Handler) -> F,
    F: Fn(usize) -> T + Send + Sync + 'static,
{
    let n = output.extent();
    let (a, b) = (T::from_f64(alpha as f64), T::from_f64(beta as f64));
    backend.get_queue().submit(label, wait, |cgh| {
        match (alpha == 0.0, beta == 0.0) {
            (true, true) => {
                let out = output.write_mem(cgh);
                cgh.parallel_for(n, move |i| out.set(i, T::ZERO));
            }
            (true, false) => {
                let out = output.read_write_mem(cgh);
                cgh.parallel_for(n, move |i| out.set(i, b * out.get(i)));
            }
            (false, true) => {
                let f = build(cgh);
                let out = output.write_mem(cgh);
                cgh.parallel_for(n, move |i| out.set(i, a * f(i)));
            }
            (false, false) => {
                let f = build(cgh);
                let out = output.read_write_mem(cgh);
                cgh.parallel_for(n, move |i| out.set(i, a * f(i) + b * out.get(i)));
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_padding() {
        assert_eq!(
            calculate_padding(4, 3, 1, PaddingMode::Valid),
            PaddingAndOutput { padding: 0, output: 2 }
        );
        assert_eq!(
            calculate_padding(4, 3, 1, PaddingMode::Same),
            PaddingAndOutput { padding: 1, output: 4 }
        );
        assert_eq!(
            calculate_padding(7, 3, 2, PaddingMode::Same),
            PaddingAndOutput { padding: 1, output: 4 }
        );
        assert_eq!(
            calculate_padding(8, 1, 3, PaddingMode::Same),
            PaddingAndOutput { padding: 0, output: 3 }
        );
        assert!(check_index_range(&[1 << 20]).is_ok());
        #[cfg(not(feature = "index64"))]
        assert_eq!(check_index_range(&[1 << 31]), Err(StatusCode::IndexExceeded));
    }

    #[test]
    fn test_window_fits() {
        for (input, window, stride) in [(4, 3, 1), (7, 3, 2), (8, 1, 3), (4, 2, 1), (8, 3, 2), (3, 5, 1)] {
            for mode in [PaddingMode::Valid, PaddingMode::Same] {
                let p = calculate_padding(input, window, stride, mode);
                if p.output > 0 {
                    assert!(window_fits(input, p.output, window, stride, p.padding), "{input} {window} {stride} {mode:?}");
                }
            }
        }
        // Output cut short.
        assert!(!window_fits(4, 2, 1, 1, 0));
        // Windows past the end of the input.
        assert!(!window_fits(4, 10, 2, 1, 0));
        assert!(!window_fits(4, 5, 1, 1, 0));
        // Leading window entirely in the padding.
        assert!(!window_fits(4, 6, 1, 1, 1));
        assert!(!window_fits(4, 0, 1, 1, 0));
    }
}
