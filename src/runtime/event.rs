use super::lock;
use crate::error::Error;
use std::fmt;
use std::mem::take;
use std::sync::{Arc, Condvar, Mutex};

/// Execution state of a submitted command group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecStatus {
    Submitted,
    Running,
    Complete,
    Failed,
}

impl ExecStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ExecStatus::Complete | ExecStatus::Failed)
    }
}

type Continuation = Box<dyn FnOnce(Result<(), Error>) + Send>;

struct EventState {
    status: ExecStatus,
    fault: Option<Error>,
    continuations: Vec<Continuation>,
}

struct EventInner {
    id: u64,
    label: &'static str,
    state: Mutex<EventState>,
    done: Condvar,
}

/// Completion handle of one command group.
///
/// The default event is the null event: it refers to no work and is always
/// complete, so it can be placed in any wait list.
#[derive(Clone, Default)]
pub struct Event {
    inner: Option<Arc<EventInner>>,
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.inner {
            None => write!(f, "Event(null)"),
            Some(i) => write!(f, "Event({}#{}, {:?})", i.label, i.id, self.exec_status()),
        }
    }
}

impl Event {
    pub(crate) fn submitted(id: u64, label: &'static str) -> Self {
        Self {
            inner: Some(Arc::new(EventInner {
                id,
                label,
                state: Mutex::new(EventState {
                    status: ExecStatus::Submitted,
                    fault: None,
                    continuations: vec![],
                }),
                done: Condvar::new(),
            })),
        }
    }

    pub fn is_null(&self) -> bool {
        self.inner.is_none()
    }

    /// Queue-local submission number.
    pub fn id(&self) -> Option<u64> {
        self.inner.as_ref().map(|i| i.id)
    }

    pub fn label(&self) -> &'static str {
        self.inner.as_ref().map(|i| i.label).unwrap_or("null")
    }

    pub fn exec_status(&self) -> ExecStatus {
        match &self.inner {
            None => ExecStatus::Complete,
            Some(i) => lock(&i.state).status,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.exec_status() == ExecStatus::Complete
    }

    /// Blocks until the work behind this event has finished.
    ///
    /// Must not be called from inside a kernel running on the same queue.
    pub fn wait(&self) -> Result<(), Error> {
        let Some(inner) = &self.inner else {
            return Ok(());
        };
        let mut state = lock(&inner.state);
        while !state.status.is_terminal() {
            state = inner
                .done
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
        match &state.fault {
            Some(fault) => Err(fault.clone()),
            None => Ok(()),
        }
    }

    /// Waits for every event and reports the first fault.
    pub fn wait_all(events: &[Event]) -> Result<(), Error> {
        let mut first = Ok(());
        for e in events {
            let res = e.wait();
            if first.is_ok() {
                first = res;
            }
        }
        first
    }

    pub(crate) fn same_as(&self, other: &Event) -> bool {
        match (&self.inner, &other.inner) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    pub(crate) fn set_running(&self) {
        if let Some(inner) = &self.inner {
            let mut state = lock(&inner.state);
            if state.status == ExecStatus::Submitted {
                state.status = ExecStatus::Running;
            }
        }
    }

    pub(crate) fn finish(&self, result: Result<(), Error>) {
        let Some(inner) = &self.inner else {
            return;
        };
        let continuations = {
            let mut state = lock(&inner.state);
            state.status = match result {
                Ok(()) => ExecStatus::Complete,
                Err(_) => ExecStatus::Failed,
            };
            state.fault = result.clone().err();
            take(&mut state.continuations)
        };
        inner.done.notify_all();
        for c in continuations {
            c(result.clone());
        }
    }

    /// Runs `f` once the event is terminal, immediately if it already is.
    pub(crate) fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<(), Error>) + Send + 'static,
    {
        let Some(inner) = &self.inner else {
            return f(Ok(()));
        };
        let result = {
            let mut state = lock(&inner.state);
            if !state.status.is_terminal() {
                state.continuations.push(Box::new(f));
                return;
            }
            match &state.fault {
                Some(fault) => Err(fault.clone()),
                None => Ok(()),
            }
        };
        f(result)
    }
}
