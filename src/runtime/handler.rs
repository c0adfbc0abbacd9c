use super::Event;
use crate::error::Error;
use derivative::Derivative;
use rayon::prelude::*;
use std::fmt;

pub(crate) type Kernel = Box<dyn FnOnce() -> Result<(), Error> + Send>;

/// Why a command group waits on another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DepKind {
    /// Named in the caller's wait list.
    WaitList,
    /// Producer/consumer tracking on a shared buffer.
    Memory,
    /// Previous submission on an in-order queue.
    Queue,
}

impl fmt::Display for DepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DepKind::WaitList => write!(f, "wait"),
            DepKind::Memory => write!(f, "mem"),
            DepKind::Queue => write!(f, "order"),
        }
    }
}

/// Builder for one command group: its prerequisites and at most one kernel.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Handler {
    event: Event,
    deps: Vec<(Event, DepKind)>,
    #[derivative(Debug = "ignore")]
    kernel: Option<Kernel>,
}

impl Handler {
    pub(crate) fn new(event: Event) -> Self {
        Self {
            event,
            deps: vec![],
            kernel: None,
        }
    }

    /// Event that will signal completion of this command group.
    pub fn event(&self) -> &Event {
        &self.event
    }

    pub fn depends_on(&mut self, events: &[Event]) {
        for e in events {
            self.require(e.clone(), DepKind::WaitList);
        }
    }

    pub(crate) fn require(&mut self, event: Event, kind: DepKind) {
        if event.is_null() || event.is_complete() || event.same_as(&self.event) {
            return;
        }
        if self.deps.iter().any(|(d, _)| d.same_as(&event)) {
            return;
        }
        self.deps.push((event, kind));
    }

    fn set_kernel(&mut self, kernel: Kernel) {
        assert!(
            self.kernel.is_none(),
            "Command group `{}` already holds a kernel",
            self.event.label()
        );
        self.kernel = Some(kernel);
    }

    pub fn single_task<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.set_kernel(Box::new(move || {
            f();
            Ok(())
        }))
    }

    /// Single task whose failure is reported through the event.
    pub fn try_single_task<F>(&mut self, f: F)
    where
        F: FnOnce() -> Result<(), Error> + Send + 'static,
    {
        self.set_kernel(Box::new(f))
    }

    /// Runs `f` once for every index in `0..range`, in parallel.
    pub fn parallel_for<F>(&mut self, range: usize, f: F)
    where
        F: Fn(usize) + Send + Sync + 'static,
    {
        self.set_kernel(Box::new(move || {
            (0..range).into_par_iter().for_each(|i| f(i));
            Ok(())
        }))
    }

    pub(crate) fn finish(self) -> (Event, Vec<(Event, DepKind)>, Option<Kernel>) {
        (self.event, self.deps, self.kernel)
    }
}
