use super::im2col::TransformSizes;
use super::selector::{Algorithm, Selector};
use super::winograd::TileGeometry;
use super::{Conv2DParams, ConvType, Direction};
use crate::helpers::size_of_dims;

/// Scratch memory, in elements, needed by a convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkspaceSize {
    /// Smallest workspace the algorithm can run with, processing one image
    /// at a time.
    pub required_size: usize,
    /// Workspace that lets the whole batch run at once.
    pub recommended_size: usize,
}

/// Fixed and per-image parts of a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) struct WorkspaceLayout {
    pub fixed: usize,
    pub per_image: usize,
}

impl WorkspaceLayout {
    pub fn size(&self, batch: usize) -> WorkspaceSize {
        WorkspaceSize {
            required_size: self.fixed.saturating_add(self.per_image),
            recommended_size: size_of_dims(&[batch, self.per_image]).saturating_add(self.fixed),
        }
    }

    /// Images a workspace of `size` elements holds at once, capped at `batch`.
    pub fn images(&self, size: usize, batch: usize) -> usize {
        if self.per_image == 0 {
            return batch;
        }
        (size.saturating_sub(self.fixed) / self.per_image).clamp(1, batch)
    }
}

pub(crate) fn layout(algorithm: Algorithm, direction: Direction, p: &Conv2DParams) -> WorkspaceLayout {
    match algorithm {
        Algorithm::Winograd | Algorithm::WinogradLarge => {
            let g = TileGeometry::new(direction, p, algorithm == Algorithm::WinogradLarge);
            WorkspaceLayout {
                fixed: g.filter_transform_size(),
                per_image: g.input_transform_size() + g.inter_transform_size(),
            }
        }
        Algorithm::Im2col => {
            let t = TransformSizes::new(direction, p);
            WorkspaceLayout {
                fixed: t.filter,
                per_image: t.input + t.output,
            }
        }
        Algorithm::Direct | Algorithm::Tiled | Algorithm::Matmul | Algorithm::NotSupported => {
            WorkspaceLayout::default()
        }
    }
}

pub(crate) fn workspace_size(algorithm: Algorithm, direction: Direction, p: &Conv2DParams) -> WorkspaceSize {
    layout(algorithm, direction, p).size(p.batch)
}

/// Workspace for running `params` with the algorithm `selector` picks.
///
/// Zero when that algorithm needs no scratch memory.
pub fn query_workspace_size<C: ConvType>(params: &Conv2DParams, selector: &dyn Selector) -> WorkspaceSize {
    let algorithm = selector.select(C::DIRECTION, params);
    let size = workspace_size(algorithm, C::DIRECTION, params);
    log::debug!("{algorithm} {:?} workspace {size:?}", C::DIRECTION);
    size
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::conv2d::{
        DirectSelector, FilterBackprop, Forward, Im2colSelector, InputBackprop, MatmulSelector,
        WinogradLargeSelector, WinogradSelector,
    };
    use crate::helpers::{add_padding_to, PaddingMode};

    fn params() -> Conv2DParams {
        add_padding_to(
            Conv2DParams {
                channels: 3,
                features: 5,
                batch: 4,
                in_rows: 7,
                in_cols: 6,
                window_rows: 3,
                window_cols: 3,
                ..Default::default()
            },
            PaddingMode::Same,
        )
    }

    #[test]
    fn test_no_workspace_algorithms() {
        let p = params();
        assert_eq!(query_workspace_size::<Forward>(&p, &DirectSelector), WorkspaceSize::default());
        let one = Conv2DParams {
            window_rows: 1,
            window_cols: 1,
            pad_rows: 0,
            pad_cols: 0,
            out_rows: 7,
            out_cols: 6,
            ..p
        };
        assert_eq!(query_workspace_size::<InputBackprop>(&one, &MatmulSelector), WorkspaceSize::default());
    }

    #[test]
    fn test_winograd_sizes() {
        let p = params();
        // 2x2 output tiles over 7x6 outputs, alpha 4x4.
        let tiles = 4 * 3;
        let (input_t, inter, filter_t) = (16 * tiles * 3, 16 * tiles * 5, 16 * 3 * 5);
        assert_eq!(
            query_workspace_size::<Forward>(&p, &WinogradSelector),
            WorkspaceSize {
                required_size: input_t + inter + filter_t,
                recommended_size: 4 * (input_t + inter) + filter_t,
            }
        );
        // 4x4 output tiles, alpha 6x6.
        let tiles = 2 * 2;
        let (input_t, inter, filter_t) = (36 * tiles * 3, 36 * tiles * 5, 36 * 3 * 5);
        assert_eq!(
            query_workspace_size::<Forward>(&p, &WinogradLargeSelector).required_size,
            input_t + inter + filter_t
        );
        // The filter gradient is one 3x3 tile, the output gradient is cut in 2x2 tiles.
        let tiles = 4 * 3;
        let ws = query_workspace_size::<FilterBackprop>(&p, &WinogradSelector);
        assert_eq!(ws.required_size, 16 * tiles * 3 + 16 * tiles * 5 + 16 * 3 * 5);
    }

    #[test]
    fn test_im2col_sizes_and_minibatch() {
        let p = params();
        let input_t = 7 * 6 * 9 * 3;
        let ws = query_workspace_size::<Forward>(&p, &Im2colSelector);
        assert_eq!(ws, WorkspaceSize { required_size: input_t, recommended_size: 4 * input_t });

        let l = layout(Algorithm::Im2col, Direction::Forward, &p);
        assert_eq!(l.images(ws.required_size, p.batch), 1);
        assert_eq!(l.images(ws.recommended_size - 1, p.batch), 3);
        assert_eq!(l.images(usize::MAX, p.batch), 4);

        let grouped = Conv2DParams { channels: 4, features: 6, groups: 2, ..p };
        let t = TransformSizes::new(Direction::Forward, &grouped);
        assert_eq!((t.input, t.filter, t.output), (7 * 6 * 9 * 4, 9 * 4 * 3, 7 * 6 * 6));
        assert_eq!(
            query_workspace_size::<Forward>(&grouped, &Im2colSelector).required_size,
            t.input + t.filter + t.output
        );
    }
}
