use super::{ConvType, Direction};
use crate::format::{DataFormat, FilterDims, FilterFormat, ImageDims};
use crate::helpers::{size_of_dims, PaddingAndOutput, WindowParams};
use crate::matmul::BatchFormat;

/// Shape and layout of a 2D convolution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Conv2DParams {
    pub channels: usize,
    pub features: usize,
    pub batch: usize,
    pub in_rows: usize,
    pub in_cols: usize,
    pub window_rows: usize,
    pub window_cols: usize,
    pub stride_rows: usize,
    pub stride_cols: usize,
    pub out_rows: usize,
    pub out_cols: usize,
    pub pad_rows: usize,
    pub pad_cols: usize,
    pub dilation_rows: usize,
    pub dilation_cols: usize,
    /// Channels and features are split into this many independent groups.
    pub groups: usize,
    pub input_format: DataFormat,
    pub filter_format: FilterFormat,
    /// Whether groups are contiguous blocks of channels, or the group index
    /// is the fastest moving part of the channel index.
    pub group_format: BatchFormat,
    pub alpha: f32,
    pub beta: f32,
}

impl Default for Conv2DParams {
    fn default() -> Self {
        Self {
            channels: 0,
            features: 0,
            batch: 1,
            in_rows: 0,
            in_cols: 0,
            window_rows: 0,
            window_cols: 0,
            stride_rows: 1,
            stride_cols: 1,
            out_rows: 0,
            out_cols: 0,
            pad_rows: 0,
            pad_cols: 0,
            dilation_rows: 1,
            dilation_cols: 1,
            groups: 1,
            input_format: DataFormat::NHWC,
            filter_format: FilterFormat::HWCF,
            group_format: BatchFormat::Strided,
            alpha: 1.0,
            beta: 0.0,
        }
    }
}

impl Conv2DParams {
    pub fn channels_per_group(&self) -> usize {
        self.channels / self.groups
    }

    pub fn features_per_group(&self) -> usize {
        self.features / self.groups
    }

    pub(crate) fn in_dims(&self) -> ImageDims {
        ImageDims::new(self.batch, self.in_rows, self.in_cols, self.channels)
    }

    pub(crate) fn out_dims(&self) -> ImageDims {
        ImageDims::new(self.batch, self.out_rows, self.out_cols, self.features)
    }

    pub(crate) fn filter_dims(&self) -> FilterDims {
        FilterDims {
            rows: self.window_rows,
            cols: self.window_cols,
            channels: self.channels_per_group(),
            features: self.features,
        }
    }

    /// Input row read by output row `o` at window row `r`, if inside the image.
    #[inline(always)]
    pub(crate) fn in_row(&self, o: usize, r: usize) -> Option<usize> {
        let i = (o * self.stride_rows + r).checked_sub(self.pad_rows)?;
        (i < self.in_rows).then_some(i)
    }

    #[inline(always)]
    pub(crate) fn in_col(&self, o: usize, c: usize) -> Option<usize> {
        let i = (o * self.stride_cols + c).checked_sub(self.pad_cols)?;
        (i < self.in_cols).then_some(i)
    }

    /// Output row that reads input row `i` at window row `r`, if any.
    #[inline(always)]
    pub(crate) fn out_row(&self, i: usize, r: usize) -> Option<usize> {
        let shifted = (i + self.pad_rows).checked_sub(r)?;
        let o = shifted / self.stride_rows;
        (shifted % self.stride_rows == 0 && o < self.out_rows).then_some(o)
    }

    #[inline(always)]
    pub(crate) fn out_col(&self, i: usize, c: usize) -> Option<usize> {
        let shifted = (i + self.pad_cols).checked_sub(c)?;
        let o = shifted / self.stride_cols;
        (shifted % self.stride_cols == 0 && o < self.out_cols).then_some(o)
    }
}

impl WindowParams for Conv2DParams {
    fn window_geometry(&self) -> [(usize, usize, usize); 2] {
        [
            (self.in_rows, self.window_rows, self.stride_rows),
            (self.in_cols, self.window_cols, self.stride_cols),
        ]
    }

    fn set_output_and_padding(&mut self, rows: PaddingAndOutput, cols: PaddingAndOutput) {
        self.out_rows = rows.output;
        self.pad_rows = rows.padding;
        self.out_cols = cols.output;
        self.pad_cols = cols.padding;
    }
}

/// Element counts of the three tensors passed to a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvSizes {
    pub input_size: usize,
    pub filter_size: usize,
    pub output_size: usize,
}

pub fn get_sizes<C: ConvType>(params: &Conv2DParams) -> ConvSizes {
    let p = params;
    let x = size_of_dims(&[p.batch, p.in_rows, p.in_cols, p.channels]);
    let w = size_of_dims(&[
        p.window_rows,
        p.window_cols,
        p.channels / p.groups.max(1),
        p.features,
    ]);
    let y = size_of_dims(&[p.batch, p.out_rows, p.out_cols, p.features]);
    let (input_size, filter_size, output_size) = match C::DIRECTION {
        Direction::Forward => (x, w, y),
        Direction::InputBackprop => (y, w, x),
        Direction::FilterBackprop => (x, y, w),
    };
    ConvSizes {
        input_size,
        filter_size,
        output_size,
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conv2d::{FilterBackprop, Forward, InputBackprop};
    use crate::helpers::{add_padding_to, PaddingMode};

    #[test]
    fn test_sizes_swap_roles() {
        let p = add_padding_to(
            Conv2DParams {
                channels: 4,
                features: 6,
                batch: 2,
                in_rows: 5,
                in_cols: 5,
                window_rows: 3,
                window_cols: 3,
                groups: 2,
                ..Default::default()
            },
            PaddingMode::Valid,
        );
        let (x, w, y) = (2 * 5 * 5 * 4, 3 * 3 * 2 * 6, 2 * 3 * 3 * 6);
        assert_eq!(
            get_sizes::<Forward>(&p),
            ConvSizes { input_size: x, filter_size: w, output_size: y }
        );
        assert_eq!(
            get_sizes::<InputBackprop>(&p),
            ConvSizes { input_size: y, filter_size: w, output_size: x }
        );
        assert_eq!(
            get_sizes::<FilterBackprop>(&p),
            ConvSizes { input_size: x, filter_size: y, output_size: w }
        );
    }

    #[test]
    fn test_window_index_maps() {
        let p = Conv2DParams {
            in_rows: 5,
            in_cols: 5,
            out_rows: 3,
            out_cols: 3,
            window_rows: 3,
            window_cols: 3,
            stride_rows: 2,
            stride_cols: 2,
            pad_rows: 1,
            pad_cols: 1,
            ..Default::default()
        };
        assert_eq!(p.in_row(0, 0), None);
        assert_eq!(p.in_row(0, 1), Some(0));
        assert_eq!(p.in_row(2, 2), None);
        for o in 0..3 {
            for r in 0..3 {
                if let Some(i) = p.in_row(o, r) {
                    assert_eq!(p.out_row(i, r), Some(o));
                }
            }
        }
        assert_eq!(p.out_row(1, 1), None);
    }
}
