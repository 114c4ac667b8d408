//! Schedulable units of background work.
//!
//! A [`Task`] owns one input channel and one [`Worker`]. Its run loop waits
//! for input, bounded by the poll interval, and yields to the scheduler
//! between waits. Each received item is processed to completion before the
//! next one is taken; there is no batching and no preemption mid-item.
//!
//! # Idle/busy state
//!
//! The state lives in a [`TaskStatus`] shared between the worker and any
//! number of observers. The worker publishes transitions with `Release`
//! stores and observers read them with `Acquire` loads, so an observer
//! that sees `Idle` also sees every write the worker made while busy.
//! The outstanding counter is incremented by the sender before an item is
//! queued and decremented by the worker only after it has returned to
//! idle, which keeps "queue empty" and "worker idle" consistent for
//! [`TaskStatus::is_idle`].

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error};

/// One unit of work per input item.
#[async_trait]
pub trait Worker: Send + 'static {
    type Input: Send + 'static;

    async fn process(&mut self, input: Self::Input);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Busy,
}

const IDLE: u8 = 0;
const BUSY: u8 = 1;

#[derive(Debug, Default)]
pub struct TaskStatus {
    state: AtomicU8,
    outstanding: AtomicUsize,
}

impl TaskStatus {
    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            BUSY => TaskState::Busy,
            _ => TaskState::Idle,
        }
    }

    /// Items sent to the task and not yet fully processed.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// True when nothing is queued and no item is being processed.
    pub fn is_idle(&self) -> bool {
        self.outstanding() == 0 && self.state() == TaskState::Idle
    }

    fn set_state(&self, state: TaskState) {
        let raw = match state {
            TaskState::Idle => IDLE,
            TaskState::Busy => BUSY,
        };
        self.state.store(raw, Ordering::Release);
    }

    fn queued(&self) {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
    }

    fn completed(&self) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
    }
}

/// The receiving side: drives a worker from the channel.
pub struct Task<I> {
    id: usize,
    status: Arc<TaskStatus>,
    poll_interval: Duration,
    rx: mpsc::Receiver<I>,
}

/// The sending side, held by whoever dispatches work to the task.
pub struct TaskHandle<I> {
    id: usize,
    status: Arc<TaskStatus>,
    tx: mpsc::Sender<I>,
}

/// Create a task with a bounded input queue of `depth` items.
pub fn channel<I>(id: usize, poll_interval: Duration, depth: usize) -> (TaskHandle<I>, Task<I>) {
    let (tx, rx) = mpsc::channel(depth.max(1));
    let status = Arc::new(TaskStatus::default());
    (
        TaskHandle {
            id,
            status: status.clone(),
            tx,
        },
        Task {
            id,
            status,
            poll_interval,
            rx,
        },
    )
}

impl<I> TaskHandle<I> {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn status(&self) -> &Arc<TaskStatus> {
        &self.status
    }

    /// Queue an item, waiting for room. Returns the item back if the task
    /// has stopped.
    pub async fn send(&self, input: I) -> Result<(), I> {
        self.status.queued();
        match self.tx.send(input).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(input)) => {
                self.status.completed();
                Err(input)
            }
        }
    }
}

impl<I: Send + 'static> Task<I> {
    pub fn id(&self) -> usize {
        self.id
    }

    /// Serve items until every handle is dropped and the queue is drained.
    pub async fn run<W>(mut self, mut worker: W)
    where
        W: Worker<Input = I>,
    {
        debug!(task = self.id, "task started");

        loop {
            tokio::select! {
                received = self.rx.recv() => match received {
                    Some(input) => self.handle(&mut worker, input).await,
                    None => break,
                },
                _ = tokio::time::sleep(self.poll_interval) => {
                    tokio::task::yield_now().await;
                }
            }
        }

        debug!(task = self.id, "task stopped");
    }

    async fn handle<W>(&self, worker: &mut W, input: I)
    where
        W: Worker<Input = I>,
    {
        self.status.set_state(TaskState::Busy);

        let outcome = AssertUnwindSafe(worker.process(input)).catch_unwind().await;
        if let Err(panic) = outcome {
            error!(
                task = self.id,
                "work item panicked: {}",
                panic_message(panic.as_ref())
            );
        }

        self.status.set_state(TaskState::Idle);
        self.status.completed();
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
