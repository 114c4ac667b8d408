//! Worker pool: a fixed set of tasks, each owning one [`FileProcessor`].
//!
//! Submissions go to an idle task when there is one, otherwise round-robin.
//! Each task has its own bounded queue, so a slow document only delays the
//! items queued behind it on the same task.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::config::ProcessingConfig;
use crate::processor::{FileOp, FileProcessor, ProcessorContext};
use crate::store::DocumentStore;
use crate::task::{self, TaskHandle, TaskState};

pub struct Pool {
    handles: Vec<TaskHandle<FileOp>>,
    joins: Vec<JoinHandle<()>>,
    next: AtomicUsize,
    ctx: ProcessorContext,
    poll_interval: Duration,
}

impl Pool {
    /// Spawn the configured number of tasks on the current runtime.
    pub fn start(ctx: ProcessorContext, settings: &ProcessingConfig) -> Self {
        let workers = settings.workers.max(1);
        let mut handles = Vec::with_capacity(workers);
        let mut joins = Vec::with_capacity(workers);

        for id in 0..workers {
            let (handle, task) =
                task::channel(id, settings.poll_interval(), settings.queue_depth);
            let processor = FileProcessor::new(id, ctx.clone());
            joins.push(tokio::spawn(task.run(processor)));
            handles.push(handle);
        }

        info!(workers, queue_depth = settings.queue_depth, "worker pool started");

        Self {
            handles,
            joins,
            next: AtomicUsize::new(0),
            ctx,
            poll_interval: settings.poll_interval(),
        }
    }

    fn pick(&self) -> &TaskHandle<FileOp> {
        self.handles
            .iter()
            .find(|h| h.status().is_idle())
            .unwrap_or_else(|| {
                let i = self.next.fetch_add(1, Ordering::Relaxed) % self.handles.len();
                &self.handles[i]
            })
    }

    pub async fn submit(&self, op: FileOp) -> Result<()> {
        let handle = self.pick();
        debug!(task = handle.id(), "submitting file operation");
        handle
            .send(op)
            .await
            .map_err(|_| anyhow!("task {} has stopped", handle.id()))
    }

    /// Queue a new file for ingestion.
    pub async fn submit_file(&self, path: impl Into<PathBuf>, user_id: i64) -> Result<()> {
        self.submit(FileOp::ingest(path, user_id)).await
    }

    /// Queue an existing document for reprocessing of its pending steps.
    pub async fn submit_document(&self, document_id: i64) -> Result<()> {
        let documents: &dyn DocumentStore = self.ctx.stores.documents.as_ref();
        let Some(doc) = documents.get(document_id).await? else {
            bail!("document not found: {}", document_id);
        };
        self.submit(FileOp::reprocess(doc)).await
    }

    pub fn statuses(&self) -> Vec<TaskState> {
        self.handles.iter().map(|h| h.status().state()).collect()
    }

    /// True when every task is idle with an empty queue.
    pub fn is_idle(&self) -> bool {
        self.handles.iter().all(|h| h.status().is_idle())
    }

    pub async fn wait_idle(&self) {
        while !self.is_idle() {
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Close the queues and wait for every task to drain and stop.
    pub async fn shutdown(self) {
        drop(self.handles);
        for join in self.joins {
            if let Err(e) = join.await {
                error!("worker task ended abnormally: {}", e);
            }
        }
        info!("worker pool stopped");
    }
}
