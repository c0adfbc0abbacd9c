use super::{Conv2DParams, Direction};
use crate::format::DataFormat;
use crate::runtime::DeviceInfo;
use std::fmt;

/// Interchangeable ways of computing the same convolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Algorithm {
    Direct,
    Tiled,
    Im2col,
    Winograd,
    WinogradLarge,
    Matmul,
    NotSupported,
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Algorithm::Direct => "direct",
            Algorithm::Tiled => "tiled",
            Algorithm::Im2col => "im2col",
            Algorithm::Winograd => "winograd",
            Algorithm::WinogradLarge => "winograd_large",
            Algorithm::Matmul => "matmul",
            Algorithm::NotSupported => "not_supported",
        };
        f.write_str(name)
    }
}

/// Picks the algorithm to run a convolution with.
///
/// Selection is pure: the same parameters and direction always give the same
/// answer.
pub trait Selector: fmt::Debug + Send + Sync {
    fn select(&self, direction: Direction, params: &Conv2DParams) -> Algorithm;

    fn name(&self) -> &'static str;
}

fn plain_nhwc(p: &Conv2DParams) -> bool {
    p.input_format == DataFormat::NHWC && p.groups == 1
}

/// Whether `algorithm` can run `params` in `direction`.
pub(crate) fn is_applicable(algorithm: Algorithm, direction: Direction, p: &Conv2DParams) -> bool {
    match algorithm {
        Algorithm::Direct => p.groups == 1,
        Algorithm::Im2col => p.input_format == DataFormat::NHWC,
        Algorithm::Tiled => {
            let square = p.window_rows == p.window_cols && p.stride_rows == p.stride_cols;
            let supported = matches!(
                (p.window_rows, p.stride_rows),
                (1, 1) | (1, 2) | (3, 1) | (3, 2) | (5, 1)
            );
            direction == Direction::Forward && plain_nhwc(p) && square && supported
        }
        Algorithm::Winograd => {
            let window = matches!((p.window_rows, p.window_cols), (1, 3) | (3, 1) | (3, 3));
            plain_nhwc(p) && window && p.stride_rows == 1 && p.stride_cols == 1
        }
        Algorithm::WinogradLarge => {
            plain_nhwc(p)
                && (p.window_rows, p.window_cols) == (3, 3)
                && p.stride_rows == 1
                && p.stride_cols == 1
        }
        Algorithm::Matmul => {
            plain_nhwc(p)
                && (p.window_rows, p.window_cols) == (1, 1)
                && (p.stride_rows, p.stride_cols) == (1, 1)
                && (p.pad_rows, p.pad_cols) == (0, 0)
                && (p.out_rows, p.out_cols) == (p.in_rows, p.in_cols)
        }
        Algorithm::NotSupported => false,
    }
}

macro_rules! fixed_selector {
    ($(#[$m:meta])* $name:ident, $alg:expr, $label:literal) => {
        $(#[$m])*
        #[derive(Debug, Clone, Copy, Default)]
        pub struct $name;

        impl Selector for $name {
            fn select(&self, direction: Direction, params: &Conv2DParams) -> Algorithm {
                if is_applicable($alg, direction, params) {
                    $alg
                } else {
                    Algorithm::NotSupported
                }
            }

            fn name(&self) -> &'static str {
                $label
            }
        }
    };
}

fixed_selector!(
    /// Always the direct algorithm, the only one for NCHW data.
    DirectSelector,
    Algorithm::Direct,
    "direct"
);
fixed_selector!(
    /// Register-tiled direct forward convolution for 1x1, 3x3 and 5x5 windows.
    TiledSelector,
    Algorithm::Tiled,
    "tiled"
);
fixed_selector!(
    /// Lowering to matrix multiplies through an unrolled input.
    Im2colSelector,
    Algorithm::Im2col,
    "im2col"
);
fixed_selector!(WinogradSelector, Algorithm::Winograd, "winograd");
fixed_selector!(
    /// Winograd with larger output tiles, 3x3 windows only.
    WinogradLargeSelector,
    Algorithm::WinogradLarge,
    "winograd_large"
);
fixed_selector!(
    /// 1x1 convolutions as one matrix multiply.
    MatmulSelector,
    Algorithm::Matmul,
    "matmul"
);

/// Chooses per call based on the parameters and device capabilities.
#[derive(Debug, Clone, Copy)]
pub struct DefaultSelector {
    supports_subgroup: bool,
}

impl DefaultSelector {
    pub fn new(supports_subgroup: bool) -> Self {
        Self { supports_subgroup }
    }
}

impl Selector for DefaultSelector {
    fn select(&self, direction: Direction, p: &Conv2DParams) -> Algorithm {
        if p.input_format == DataFormat::NCHW {
            return Algorithm::Direct;
        }
        if p.groups > 1 {
            return Algorithm::Im2col;
        }
        let candidates = [
            (Algorithm::Matmul, true),
            (
                Algorithm::Winograd,
                self.supports_subgroup && (p.window_rows, p.window_cols) == (3, 3),
            ),
            (Algorithm::Tiled, true),
            (Algorithm::Im2col, p.window_rows * p.window_cols > 1),
        ];
        candidates
            .into_iter()
            .find(|&(alg, preferred)| preferred && is_applicable(alg, direction, p))
            .map_or(Algorithm::Direct, |(alg, _)| alg)
    }

    fn name(&self) -> &'static str {
        "default"
    }
}

/// Selector tuned for the device described by `info`.
pub fn get_default_selector(info: &DeviceInfo) -> Box<dyn Selector> {
    log::debug!("default selector for `{}`, subgroups: {}", info.name, info.supports_subgroup);
    Box::new(DefaultSelector::new(info.supports_subgroup))
}
