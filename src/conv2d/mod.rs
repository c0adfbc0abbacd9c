//! 2D convolution: parameters, algorithm selection, workspace sizing and the
//! dispatcher that launches the selected algorithm.
//!
//! ```ignore
//! let selector = get_default_selector(backend.device_info());
//! let ws = query_workspace_size::<Forward>(&params, selector.as_ref());
//! let status = launch::<f32, Forward, _>(
//!     input, filter, output, &params, selector.as_ref(), &backend, None, 0, &[],
//! );
//! ```

mod direct;
mod im2col;
mod launch;
mod matmul;
mod params;
mod selector;
mod tiled;
mod winograd;
mod workspace;

pub use launch::launch;
pub use params::{get_sizes, Conv2DParams, ConvSizes};
pub use selector::{
    get_default_selector, Algorithm, DefaultSelector, DirectSelector, Im2colSelector,
    MatmulSelector, Selector, TiledSelector, WinogradLargeSelector, WinogradSelector,
};
pub use workspace::{query_workspace_size, WorkspaceSize};

use crate::back::is_usm_backend;
use crate::back::MemoryProvider;
use crate::runtime::Event;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Forward,
    InputBackprop,
    FilterBackprop,
}

/// Type-level [`Direction`].
pub trait ConvType: Send + Sync + 'static {
    const DIRECTION: Direction;
}

/// `output = conv(input, filter)`.
#[derive(Debug)]
pub enum Forward {}
/// Input gradient: `input` holds the output gradient, `output` receives the
/// input gradient.
#[derive(Debug)]
pub enum InputBackprop {}
/// Filter gradient: `filter` holds the output gradient, `output` receives the
/// filter gradient.
#[derive(Debug)]
pub enum FilterBackprop {}

impl ConvType for Forward {
    const DIRECTION: Direction = Direction::Forward;
}

impl ConvType for InputBackprop {
    const DIRECTION: Direction = Direction::InputBackprop;
}

impl ConvType for FilterBackprop {
    const DIRECTION: Direction = Direction::FilterBackprop;
}

/// Orders the kernels of one launch.
///
/// Buffer storage orders them through its own access tracking, so every step
/// only waits on the caller's events. Raw allocations are untracked, and each
/// step waits on the previous one.
pub(crate) struct Chain<'w> {
    wait: &'w [Event],
    last: Event,
    usm: bool,
}

impl<'w> Chain<'w> {
    pub fn new<B: MemoryProvider>(wait: &'w [Event]) -> Self {
        Self {
            wait,
            last: Event::default(),
            usm: is_usm_backend::<B>(),
        }
    }

    pub fn deps(&self) -> Vec<Event> {
        if self.usm && !self.last.is_null() {
            vec![self.last.clone()]
        } else {
            self.wait.to_vec()
        }
    }

    pub fn push(&mut self, event: Event) {
        self.last = event;
    }

    pub fn last(self) -> Event {
        self.last
    }
}

#[cfg(test)]
pub(crate) mod testing;
