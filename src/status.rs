use crate::runtime::Event;

/// Outcome of a launch that the caller may recover from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, thiserror::Error)]
pub enum StatusCode {
    #[error("ok")]
    Ok,
    /// The selector does not support the requested parameters.
    #[error("the selected algorithm cannot run these parameters")]
    InvalidAlgorithm,
    /// An element count does not fit the index type.
    #[error("tensor sizes exceed the addressable index range")]
    IndexExceeded,
    #[error("the provided workspace is smaller than required")]
    InsufficientWorkspace,
    #[error("could not allocate temporary memory")]
    AllocationProblem,
    #[error("invalid parameter")]
    InvalidParameter,
}

impl Default for StatusCode {
    fn default() -> Self {
        StatusCode::Ok
    }
}

/// Status code plus the completion handle of the last submitted kernel.
///
/// For any code other than [`StatusCode::Ok`] the event is the null event and
/// no work has been submitted.
#[derive(Debug, Clone, Default)]
pub struct Status {
    pub event: Event,
    pub status: StatusCode,
}

impl Status {
    pub fn ok(event: Event) -> Self {
        Self {
            event,
            status: StatusCode::Ok,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == StatusCode::Ok
    }

    pub fn into_event(self) -> Event {
        self.event
    }
}

impl From<StatusCode> for Status {
    fn from(status: StatusCode) -> Self {
        Self {
            event: Event::default(),
            status,
        }
    }
}

/// Rejects the launch with [`StatusCode::InvalidParameter`] unless `cond` holds.
macro_rules! validate_param {
    ($cond:expr, $msg:expr $(,)?) => {
        if !($cond) {
            log::warn!("invalid parameter: {}", $msg);
            return $crate::status::Status::from($crate::status::StatusCode::InvalidParameter);
        }
    };
}

pub(crate) use validate_param;
