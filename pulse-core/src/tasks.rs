//! Cross-thread work submission onto the simulation thread.
//!
//! Any thread may [`submit`](TaskQueue::submit) a closure. The simulation thread
//! calls [`drain`](TaskQueue::drain) once at the start of every tick and runs what
//! was queued at that instant. Work submitted from the simulation thread itself
//! runs immediately, so code that does not know which thread it is on can always
//! submit without deadlocking.

use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::sync::atomic::{self, AtomicBool, Ordering};
use std::task::{Context, Poll};
use std::thread::{self, ThreadId};

use crossbeam::queue::SegQueue;
use parking_lot::RwLock;
use tokio::sync::oneshot;

use crate::fault::panic_message;

type Job = Box<dyn FnOnce() + Send>;

/// Why a task produced no value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TaskError {
    /// The task panicked; the message is the panic payload.
    #[error("task panicked: {0}")]
    Panicked(String),
    /// The task was dropped without running.
    #[error("task was abandoned before it ran")]
    Abandoned,
}

/// The eventual result of a submitted task.
///
/// Await it from async code or call [`wait`](Self::wait) from a plain thread.
#[must_use = "a task handle does nothing unless its result is read"]
#[derive(Debug)]
pub struct TaskHandle<T> {
    receiver: oneshot::Receiver<Result<T, TaskError>>,
}

impl<T> TaskHandle<T> {
    fn ready(result: Result<T, TaskError>) -> Self {
        let (sender, receiver) = oneshot::channel();
        // The receiver is alive right here, so this cannot fail.
        let _ = sender.send(result);
        Self { receiver }
    }

    /// Blocks the current thread until the task has run.
    ///
    /// # Panics
    /// Panics if called from inside an async runtime; await the handle there instead.
    pub fn wait(self) -> Result<T, TaskError> {
        self.receiver
            .blocking_recv()
            .unwrap_or(Err(TaskError::Abandoned))
    }

    /// Returns the result if the task has already run.
    pub fn try_take(&mut self) -> Option<Result<T, TaskError>> {
        match self.receiver.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => Some(Err(TaskError::Abandoned)),
        }
    }
}

impl<T> Future for TaskHandle<T> {
    type Output = Result<T, TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.unwrap_or(Err(TaskError::Abandoned)))
    }
}

/// FIFO of work waiting for the simulation thread.
#[derive(Default)]
pub struct TaskQueue {
    pending: SegQueue<Job>,
    owner: RwLock<Option<ThreadId>>,
    stopped: AtomicBool,
}

impl TaskQueue {
    /// Creates an empty queue with no simulation thread bound yet.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the calling thread the simulation thread.
    pub fn bind_current_thread(&self) {
        *self.owner.write() = Some(thread::current().id());
    }

    /// Returns `true` when called from the simulation thread.
    #[must_use]
    pub fn is_simulation_thread(&self) -> bool {
        *self.owner.read() == Some(thread::current().id())
    }

    /// Returns `true` once the server has stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Number of tasks waiting for the next drain.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if no task is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Submits work to run on the simulation thread.
    ///
    /// Runs `work` right away, before returning, when called on the simulation
    /// thread or after the server stopped. Otherwise it is queued for the next drain.
    pub fn submit<F, T>(&self, work: F) -> TaskHandle<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        if self.is_stopped() || self.is_simulation_thread() {
            return TaskHandle::ready(run_task(work));
        }

        let (sender, receiver) = oneshot::channel();
        self.enqueue(Box::new(move || {
            // The submitter may have dropped its handle; the work still ran.
            let _ = sender.send(run_task(work));
        }));
        TaskHandle { receiver }
    }

    fn enqueue(&self, job: Job) {
        self.pending.push(job);
        // Pairs with the fence in `mark_stopped`: either it sees this job or we see the flag.
        atomic::fence(Ordering::SeqCst);
        if self.is_stopped() {
            // The stop drained before this push landed; nothing else will run it.
            self.run_leftovers();
        }
    }

    fn run_leftovers(&self) -> usize {
        let mut ran = 0;
        while let Some(job) = self.pending.pop() {
            job();
            ran += 1;
        }
        ran
    }

    /// Runs every task that was queued when the drain began.
    ///
    /// Tasks submitted by other threads while this runs wait for the next drain.
    /// Returns the number of tasks run.
    pub fn drain(&self) -> usize {
        debug_assert!(
            self.is_simulation_thread(),
            "task queue drained off the simulation thread"
        );

        let snapshot = self.pending.len();
        let mut ran = 0;
        while ran < snapshot {
            let Some(job) = self.pending.pop() else {
                break;
            };
            job();
            ran += 1;
        }
        ran
    }

    /// Switches the queue to synchronous execution and runs whatever is still queued.
    ///
    /// Returns the number of leftover tasks that ran.
    pub fn mark_stopped(&self) -> usize {
        self.stopped.store(true, Ordering::Release);
        atomic::fence(Ordering::SeqCst);
        let ran = self.run_leftovers();
        if ran > 0 {
            log::info!("Ran {ran} task(s) left in the queue at shutdown");
        }
        ran
    }
}

fn run_task<F, T>(work: F) -> Result<T, TaskError>
where
    F: FnOnce() -> T,
{
    panic::catch_unwind(AssertUnwindSafe(work)).map_err(|payload| {
        let message = panic_message(payload.as_ref());
        log::warn!("Error executing task: {message}");
        TaskError::Panicked(message)
    })
}
