//! Memory layouts of activation and filter tensors.

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DataFormat {
    #[default]
    NHWC,
    NCHW,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FilterFormat {
    /// `[rows, cols, channels, features]`.
    #[default]
    HWCF,
    /// `[features, rows, cols, channels]`.
    FHWC,
    /// `[features, channels, rows, cols]`.
    FCHW,
}

/// Dimensions of an activation tensor, independent of its layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageDims {
    pub batch: usize,
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
}

impl ImageDims {
    pub fn new(batch: usize, rows: usize, cols: usize, channels: usize) -> Self {
        Self {
            batch,
            rows,
            cols,
            channels,
        }
    }

    pub fn size(&self) -> usize {
        self.batch * self.rows * self.cols * self.channels
    }
}

impl DataFormat {
    /// Offset of element `(b, r, c, ch)` in a tensor of shape `dims`.
    #[inline(always)]
    pub fn index(self, dims: &ImageDims, b: usize, r: usize, c: usize, ch: usize) -> usize {
        match self {
            DataFormat::NHWC => ((b * dims.rows + r) * dims.cols + c) * dims.channels + ch,
            DataFormat::NCHW => ((b * dims.channels + ch) * dims.rows + r) * dims.cols + c,
        }
    }

    /// Inverse of [`DataFormat::index`], as `(b, r, c, ch)`.
    #[inline(always)]
    pub fn unflatten(self, dims: &ImageDims, idx: usize) -> (usize, usize, usize, usize) {
        match self {
            DataFormat::NHWC => {
                let ch = idx % dims.channels;
                let rest = idx / dims.channels;
                let c = rest % dims.cols;
                let rest = rest / dims.cols;
                (rest / dims.rows, rest % dims.rows, c, ch)
            }
            DataFormat::NCHW => {
                let c = idx % dims.cols;
                let rest = idx / dims.cols;
                let r = rest % dims.rows;
                let rest = rest / dims.rows;
                (rest / dims.channels, r, c, rest % dims.channels)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FilterDims {
    pub rows: usize,
    pub cols: usize,
    pub channels: usize,
    pub features: usize,
}

impl FilterFormat {
    /// Offset of weight `(r, c, ch, f)`.
    #[inline(always)]
    pub fn index(self, dims: &FilterDims, r: usize, c: usize, ch: usize, f: usize) -> usize {
        match self {
            FilterFormat::HWCF => ((r * dims.cols + c) * dims.channels + ch) * dims.features + f,
            FilterFormat::FHWC => ((f * dims.rows + r) * dims.cols + c) * dims.channels + ch,
            FilterFormat::FCHW => ((f * dims.channels + ch) * dims.rows + r) * dims.cols + c,
        }
    }

    /// Inverse of [`FilterFormat::index`], as `(r, c, ch, f)`.
    #[inline(always)]
    pub fn unflatten(self, dims: &FilterDims, idx: usize) -> (usize, usize, usize, usize) {
        let FilterDims {
            rows,
            cols,
            channels,
            features,
        } = *dims;
        match self {
            FilterFormat::HWCF => {
                let f = idx % features;
                let rest = idx / features;
                let ch = rest % channels;
                let rest = rest / channels;
                (rest / cols, rest % cols, ch, f)
            }
            FilterFormat::FHWC => {
                let ch = idx % channels;
                let rest = idx / channels;
                let c = rest % cols;
                let rest = rest / cols;
                (rest % rows, c, ch, rest / rows)
            }
            FilterFormat::FCHW => {
                let c = idx % cols;
                let rest = idx / cols;
                let r = rest % rows;
                let rest = rest / rows;
                (r, c, rest % channels, rest / channels)
            }
        }
    }
}

impl FilterDims {
    pub fn size(&self) -> usize {
        self.rows * self.cols * self.channels * self.features
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unflatten_inverts_index() {
        let dims = ImageDims::new(2, 3, 4, 5);
        for fmt in [DataFormat::NHWC, DataFormat::NCHW] {
            for idx in 0..dims.size() {
                let (b, r, c, ch) = fmt.unflatten(&dims, idx);
                assert_eq!(fmt.index(&dims, b, r, c, ch), idx, "{fmt:?}");
            }
        }
        let f = FilterDims {
            rows: 3,
            cols: 3,
            channels: 2,
            features: 4,
        };
        for fmt in [FilterFormat::HWCF, FilterFormat::FHWC, FilterFormat::FCHW] {
            for idx in 0..f.size() {
                let (r, c, ch, feat) = fmt.unflatten(&f, idx);
                assert_eq!(fmt.index(&f, r, c, ch, feat), idx, "{fmt:?}");
            }
        }
        assert_eq!(FilterFormat::HWCF.index(&f, 0, 0, 1, 2), 6);
        assert_eq!(FilterFormat::FHWC.index(&f, 0, 0, 1, 2), 37);
        assert_eq!(FilterFormat::FCHW.index(&f, 0, 0, 1, 2), 45);
    }
}
