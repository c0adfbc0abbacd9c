//! Host device runtime.
//!
//! A [`Queue`] executes command groups on a rayon pool. Submission never
//! blocks: a command group is handed to the pool only once its last
//! prerequisite completes, which is tracked through continuations on the
//! prerequisite events.

mod event;
mod handler;
mod trace;

pub use event::{Event, ExecStatus};
pub use handler::{DepKind, Handler};
pub use trace::{QueueTrace, Submission};

use crate::error::{Error, ErrorKind};
use handler::Kernel;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum QueueOrder {
    InOrder,
    #[default]
    OutOfOrder,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    /// Worker threads, rayon's default when `None`.
    pub threads: Option<usize>,
    pub order: QueueOrder,
    /// Record a submission graph, see [`Queue::trace`].
    pub trace: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            name: "portnn".to_string(),
            threads: None,
            order: QueueOrder::OutOfOrder,
            trace: false,
        }
    }
}

/// Capabilities of the device behind a backend.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceInfo {
    pub name: String,
    pub vendor: String,
    pub compute_units: usize,
    pub max_work_group_size: usize,
    pub supports_subgroup: bool,
}

impl DeviceInfo {
    /// The host thread pool of `queue`.
    pub fn host(queue: &Queue) -> Self {
        Self {
            name: format!("{} host", queue.config().name),
            vendor: "portnn".to_string(),
            compute_units: queue.threads(),
            max_work_group_size: 1024,
            supports_subgroup: true,
        }
    }
}

struct QueueInner {
    config: QueueConfig,
    pool: Arc<ThreadPool>,
    next_id: AtomicU64,
    submissions: AtomicUsize,
    last: Mutex<Event>,
    outstanding: Mutex<Vec<Event>>,
    trace: Option<Mutex<QueueTrace>>,
}

/// Handle to a device queue. Clones share the same queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("config", &self.inner.config)
            .field("submissions", &self.submission_count())
            .finish()
    }
}

impl Queue {
    pub fn new(config: QueueConfig) -> Result<Self, Error> {
        let name = config.name.clone();
        let mut builder = ThreadPoolBuilder::new().thread_name(move |i| format!("{name}-{i}"));
        if let Some(threads) = config.threads {
            builder = builder.num_threads(threads);
        }
        let pool = builder
            .build()
            .map_err(|e| Box::new(ErrorKind::ThreadPool(e.to_string())))?;
        log::debug!(
            "queue `{}` up with {} threads, {:?}",
            config.name,
            pool.current_num_threads(),
            config.order
        );

        Ok(Self {
            inner: Arc::new(QueueInner {
                trace: config.trace.then(|| Mutex::new(QueueTrace::default())),
                config,
                pool: Arc::new(pool),
                next_id: AtomicU64::new(1),
                submissions: AtomicUsize::new(0),
                last: Mutex::new(Event::default()),
                outstanding: Mutex::new(vec![]),
            }),
        })
    }

    pub fn host() -> Result<Self, Error> {
        Self::new(QueueConfig::default())
    }

    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    pub fn threads(&self) -> usize {
        self.inner.pool.current_num_threads()
    }

    /// Number of command groups submitted so far.
    pub fn submission_count(&self) -> usize {
        self.inner.submissions.load(Ordering::Acquire)
    }

    pub fn trace(&self) -> Option<QueueTrace> {
        self.inner.trace.as_ref().map(|t| lock(t).clone())
    }

    /// Submits one command group and returns its event without blocking.
    ///
    /// The kernel starts only after every event in `wait_list`, and every
    /// implicit dependency registered by accessors in `build`, is complete.
    pub fn submit<F>(&self, label: &'static str, wait_list: &[Event], build: F) -> Event
    where
        F: FnOnce(&mut Handler),
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut cgh = Handler::new(Event::submitted(id, label));
        cgh.depends_on(wait_list);
        build(&mut cgh);

        let in_order = self.inner.config.order == QueueOrder::InOrder;
        let (event, deps, kernel) = {
            let mut last = lock(&self.inner.last);
            if in_order {
                cgh.require(last.clone(), DepKind::Queue);
            }
            let (event, deps, kernel) = cgh.finish();
            if in_order {
                *last = event.clone();
            }
            (event, deps, kernel)
        };

        self.inner.submissions.fetch_add(1, Ordering::AcqRel);
        if let Some(trace) = &self.inner.trace {
            lock(trace).record(&event, &deps);
        }
        {
            let mut outstanding = lock(&self.inner.outstanding);
            outstanding.retain(|e| !e.exec_status().is_terminal());
            outstanding.push(event.clone());
        }
        log::trace!("submit {event:?} after {} dependencies", deps.len());

        PendingTask::schedule(self.inner.pool.clone(), event.clone(), deps, kernel);
        event
    }

    /// Blocks until everything submitted so far has finished.
    pub fn wait(&self) -> Result<(), Error> {
        let pending = lock(&self.inner.outstanding).clone();
        Event::wait_all(&pending)
    }
}

struct PendingTask {
    event: Event,
    remaining: AtomicUsize,
    fault: Mutex<Option<Error>>,
    kernel: Mutex<Option<Kernel>>,
    pool: Arc<ThreadPool>,
}

impl PendingTask {
    fn schedule(
        pool: Arc<ThreadPool>,
        event: Event,
        deps: Vec<(Event, DepKind)>,
        kernel: Option<Kernel>,
    ) {
        let task = Arc::new(PendingTask {
            event,
            // One extra count keeps the task from launching while
            // continuations are still being attached.
            remaining: AtomicUsize::new(deps.len() + 1),
            fault: Mutex::new(None),
            kernel: Mutex::new(kernel),
            pool,
        });

        for (dep, _) in deps {
            let task = task.clone();
            let dependency = dep.label();
            dep.on_complete(move |res| {
                if res.is_err() {
                    let mut fault = lock(&task.fault);
                    if fault.is_none() {
                        *fault = Some(Box::new(ErrorKind::DependencyFault {
                            kernel: task.event.label(),
                            dependency,
                        }));
                    }
                }
                task.release();
            });
        }
        task.release();
    }

    fn release(self: &Arc<Self>) {
        if self.remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.launch();
        }
    }

    fn launch(&self) {
        if let Some(fault) = lock(&self.fault).take() {
            log::warn!("{fault}");
            self.event.finish(Err(fault));
            return;
        }
        let event = self.event.clone();
        match lock(&self.kernel).take() {
            None => event.finish(Ok(())),
            Some(kernel) => self.pool.spawn(move || run_kernel(event, kernel)),
        }
    }
}

fn run_kernel(event: Event, kernel: Kernel) {
    event.set_running();
    let result = match panic::catch_unwind(AssertUnwindSafe(kernel)) {
        Ok(res) => res,
        Err(payload) => Err(Box::new(ErrorKind::KernelFault {
            kernel: event.label(),
            message: panic_message(payload.as_ref()),
        })),
    };
    if let Err(fault) = &result {
        log::warn!("{fault}");
    }
    event.finish(result);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "kernel panicked".to_string()
    }
}
