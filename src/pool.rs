//! Where executors and continuations run.
//!
//! A [`Pool`] only has to run each submitted [`Job`] at some point, on some
//! thread. Nothing in this crate relies on ordering between jobs.
use crossbeam_channel::{Receiver, Sender};
use std::io;
use std::num::NonZeroUsize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};

/// A unit of work handed to a [`Pool`].
pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted jobs concurrently with the submitter.
///
/// There is no error channel. Whatever a job wants to report, it reports
/// through the promise it settles.
pub trait Pool: Send + Sync {
    fn submit(&self, job: Job);
}

impl<F> Pool for F
where
    F: Fn(Job) + Send + Sync,
{
    fn submit(&self, job: Job) {
        self(job)
    }
}

/// Spawns one OS thread per job. This is the default pool.
#[derive(Debug, Clone, Default)]
pub struct ThreadPerTask {
    name: Option<String>,
}

impl ThreadPerTask {
    pub fn new() -> Self {
        Self::default()
    }

    /// Names every spawned thread `name`.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

impl Pool for ThreadPerTask {
    fn submit(&self, job: Job) {
        let mut builder = thread::Builder::new();
        if let Some(name) = &self.name {
            builder = builder.name(name.clone());
        }
        // The job is shared with the error path so it can still run if the
        // thread can not be spawned.
        let slot = Arc::new(std::sync::Mutex::new(Some(job)));
        let theirs = slot.clone();
        let spawned = builder.spawn(move || {
            let job = theirs.lock().ok().and_then(|mut job| job.take());
            if let Some(job) = job {
                job()
            }
        });
        if let Err(err) = spawned {
            log::error!("failed to spawn thread, running job on the submitting thread: {err}");
            let job = slot.lock().ok().and_then(|mut job| job.take());
            if let Some(job) = job {
                job()
            }
        }
    }
}

/// The process-wide [`ThreadPerTask`] used by constructors that are not
/// given a pool. Created on first use.
pub fn default_pool() -> Arc<dyn Pool> {
    static DEFAULT: OnceLock<Arc<dyn Pool>> = OnceLock::new();
    DEFAULT
        .get_or_init(|| Arc::new(ThreadPerTask::named("promise")))
        .clone()
}

/// Configures and spawns a [`WorkerPool`].
#[derive(Debug, Clone)]
pub struct WorkerPoolBuilder {
    name: Option<String>,
    size: Option<NonZeroUsize>,
}

impl WorkerPoolBuilder {
    /// Worker threads are named `{name}-{index}`.
    #[inline]
    pub fn name(self, name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..self
        }
    }

    /// Number of worker threads. Defaults to the available parallelism.
    #[inline]
    pub fn size(self, size: NonZeroUsize) -> Self {
        Self {
            size: Some(size),
            ..self
        }
    }

    pub fn spawn(self) -> io::Result<WorkerPool> {
        let size = match self.size {
            Some(size) => size,
            None => thread::available_parallelism().unwrap_or(NonZeroUsize::MIN),
        };
        let (sender, receiver) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(size.get());
        for index in 0..size.get() {
            let mut builder = thread::Builder::new();
            if let Some(name) = &self.name {
                builder = builder.name(format!("{name}-{index}"));
            }
            let receiver = receiver.clone();
            handles.push(builder.spawn(move || run_worker(index, receiver))?);
        }
        log::trace!("worker pool started with {size} workers");
        Ok(WorkerPool {
            sender: Some(sender),
            handles,
        })
    }
}

fn run_worker(index: usize, receiver: Receiver<Job>) {
    log::trace!("worker {index} starting");
    for job in receiver {
        // promise jobs contain their own panics; this keeps a raw job from
        // taking the worker down with it
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            log::warn!("worker {index}: a submitted job panicked");
        }
    }
    log::trace!("worker {index} exiting");
}

/// A fixed number of worker threads fed from one shared queue.
///
/// Submitting never blocks. Dropping the pool closes the queue, lets the
/// workers finish what was already submitted and joins them.
///
/// Chains created with [`Promise::then`](crate::Promise::then) never park a
/// worker while their parent is pending, so a single worker is enough to run
/// any chain to completion. The untyped [`simple::Promise`](crate::simple::Promise)
/// does park one worker per pending link.
///
/// # Examples
///
/// ```
/// use promise_chain::{CancelToken, Promise, pool::WorkerPool};
/// use std::num::NonZeroUsize;
/// use std::sync::Arc;
///
/// let pool = Arc::new(
///     WorkerPool::builder()
///         .name("io")
///         .size(NonZeroUsize::new(2).unwrap())
///         .spawn()
///         .expect("failed to spawn workers"),
/// );
/// let promise = Promise::with_pool(
///     |resolver| {
///         resolver.resolve(7);
///     },
///     pool,
/// );
/// assert_eq!(promise.wait(&CancelToken::none()).unwrap(), 7);
/// ```
#[derive(Debug)]
pub struct WorkerPool {
    sender: Option<Sender<Job>>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    #[inline]
    pub fn builder() -> WorkerPoolBuilder {
        WorkerPoolBuilder {
            name: None,
            size: None,
        }
    }

    pub fn size(&self) -> usize {
        self.handles.len()
    }
}

impl Pool for WorkerPool {
    fn submit(&self, job: Job) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Err(rejected) = sender.send(job) {
            // every worker is gone, which only happens if they were killed
            log::error!("worker pool has no live workers, running job on the submitting thread");
            (rejected.into_inner())()
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Close the channel to signal the workers to exit.
        drop(self.sender.take());

        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            // the last handle to the pool may be dropped by one of its own jobs
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                log::error!("worker thread panicked outside of a job");
            }
        }
    }
}
