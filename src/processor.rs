//! File processor: drives documents through the pipeline steps.
//!
//! A [`FileProcessor`] is the [`Worker`] behind each pool task. It accepts
//! a [`FileOp`] naming either a new file to ingest or an existing document
//! to reprocess.
//!
//! # New files
//!
//! ```text
//! open ─► hash ─► duplicate? ─► copy to documents/<hash> ─► create
//!      ─► seed ledger ─► thumbnail ─► parse content ─► apply rules
//! ```
//!
//! A duplicate ends the operation without writing anything. A failed
//! thumbnail halts the run; the document stays with its steps pending.
//!
//! # Reprocessing
//!
//! The ledger's pending steps are executed in order against the stored
//! file. A step whose prerequisite failed earlier in the same run is left
//! pending without being attempted.
//!
//! Every step opens a job through the ledger, appends to its message as it
//! goes, and closes it with the outcome. Step failures are recorded and
//! logged; they never propagate out of the processor. A panic inside a step
//! or an extraction call is caught and recorded as that step's failure.

use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use tokio::fs::File;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, StorageConfig};
use crate::extract::{bounded, is_page_oriented, ExtractError, Extractor};
use crate::hash::hash_file;
use crate::inflight::{FlightKey, InFlight};
use crate::models::{Document, Job, ProcessItem, ProcessStep, NEW_DOCUMENT_STEPS};
use crate::rules::apply_rules;
use crate::store::{DocumentStore, ProcessLedger, RuleStore, Stores};
use crate::task::{panic_message, Worker};

/// A unit of work for the processor. Exactly one of `file` and `document`
/// must be set.
#[derive(Debug, Clone, Default)]
pub struct FileOp {
    pub file: Option<PathBuf>,
    pub user_id: i64,
    pub document: Option<Document>,
}

impl FileOp {
    pub fn ingest(path: impl Into<PathBuf>, user_id: i64) -> Self {
        Self {
            file: Some(path.into()),
            user_id,
            document: None,
        }
    }

    pub fn reprocess(document: Document) -> Self {
        Self {
            file: None,
            user_id: document.user_id,
            document: Some(document),
        }
    }

    fn into_operation(self) -> Result<Operation, &'static str> {
        match (self.file, self.document) {
            (Some(path), None) => Ok(Operation::Ingest {
                path,
                user_id: self.user_id,
            }),
            (None, Some(document)) => Ok(Operation::Reprocess(document)),
            (Some(_), Some(_)) => Err("both a file and a document were given"),
            (None, None) => Err("neither a file nor a document was given"),
        }
    }
}

struct StoredFile {
    path: PathBuf,
    created: bool,
}

enum Operation {
    Ingest { path: PathBuf, user_id: i64 },
    Reprocess(Document),
}

/// Result of a new-file submission.
#[derive(Debug)]
pub enum IngestOutcome {
    Created(Document),
    /// Byte-identical content is already stored as this document.
    Duplicate(i64),
    /// The same content is being ingested by another worker.
    InFlight,
}

/// Everything a processor needs, shared by all workers of a pool.
#[derive(Clone)]
pub struct ProcessorContext {
    pub stores: Stores,
    pub extractor: Arc<dyn Extractor>,
    pub storage: StorageConfig,
    pub raster_extensions: Vec<String>,
    pub step_timeout: Option<Duration>,
    pub in_flight: Arc<InFlight>,
}

impl ProcessorContext {
    pub fn new(config: &Config, stores: Stores, extractor: Arc<dyn Extractor>) -> Self {
        Self {
            stores,
            extractor,
            storage: config.storage.clone(),
            raster_extensions: config.extraction.raster_extensions.clone(),
            step_timeout: config.processing.step_timeout(),
            in_flight: InFlight::new(),
        }
    }
}

pub struct FileProcessor {
    task_id: usize,
    ctx: ProcessorContext,
}

impl FileProcessor {
    pub fn new(task_id: usize, ctx: ProcessorContext) -> Self {
        Self { task_id, ctx }
    }

    fn documents(&self) -> &dyn DocumentStore {
        self.ctx.stores.documents.as_ref()
    }

    fn ledger(&self) -> &dyn ProcessLedger {
        self.ctx.stores.ledger.as_ref()
    }

    fn rules(&self) -> &dyn RuleStore {
        self.ctx.stores.rules.as_ref()
    }

    /// Ingest a new file for `user_id`.
    pub async fn ingest(&self, path: &Path, user_id: i64) -> Result<IngestOutcome> {
        let mut file = File::open(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        let hash = hash_file(&mut file)
            .await
            .with_context(|| format!("Failed to hash {}", path.display()))?;

        let Some(_guard) = self.ctx.in_flight.try_acquire(FlightKey::Hash(hash.clone())) else {
            info!(task = self.task_id, path = %path.display(), "same content already in flight, dropping");
            return Ok(IngestOutcome::InFlight);
        };

        if let Some(existing) = self.documents().get_by_hash(&hash).await? {
            info!(
                task = self.task_id,
                path = %path.display(),
                document = existing.id,
                "duplicate content, skipping"
            );
            return Ok(IngestOutcome::Duplicate(existing.id));
        }

        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| hash.clone());

        let stored = self.store_file(path, &hash).await?;
        let mut doc = Document::new(user_id, &filename, &hash);
        if let Err(e) = self.documents().create(&mut doc).await {
            // Only a copy this call wrote may go; an existing file belongs
            // to whoever created it first.
            if stored.created {
                if let Err(rm) = tokio::fs::remove_file(&stored.path).await {
                    warn!(path = %stored.path.display(), "failed to remove stored copy: {}", rm);
                }
            }
            return Err(e.context(format!("Failed to create document for {}", path.display())));
        }
        info!(task = self.task_id, document = doc.id, hash = %hash, "created document from {}", filename);

        if let Err(e) = self.ledger().add_steps(doc.id, &NEW_DOCUMENT_STEPS).await {
            error!(document = doc.id, "failed to seed pipeline steps: {:#}", e);
        }

        self.drive(&mut doc, &mut file, &NEW_DOCUMENT_STEPS, &[ProcessStep::Thumbnail])
            .await;

        Ok(IngestOutcome::Created(doc))
    }

    /// Run the document's pending steps. Returns the document as it stands
    /// after the run.
    pub async fn reprocess(&self, mut doc: Document) -> Result<Document> {
        let Some(_guard) = self.ctx.in_flight.try_acquire(FlightKey::Document(doc.id)) else {
            info!(task = self.task_id, document = doc.id, "already being processed, dropping");
            return Ok(doc);
        };

        let steps: Vec<ProcessStep> = self
            .ledger()
            .pending_steps(doc.id)
            .await?
            .into_iter()
            .map(|item| item.step)
            .collect();
        if steps.is_empty() {
            debug!(task = self.task_id, document = doc.id, "nothing pending");
            return Ok(doc);
        }

        let path = self.ctx.storage.document_path(&doc.hash);
        let mut file = File::open(&path)
            .await
            .with_context(|| format!("Failed to open stored file {}", path.display()))?;

        self.drive(&mut doc, &mut file, &steps, &[]).await;
        drop(file);

        Ok(doc)
    }

    /// Copy `source` into the documents directory under its hash.
    ///
    /// The target is never replaced. If it already exists, or another
    /// writer links it first, the existing file is kept and reported as not
    /// created by this call.
    async fn store_file(&self, source: &Path, hash: &str) -> Result<StoredFile> {
        let target = self.ctx.storage.document_path(hash);
        if tokio::fs::try_exists(&target).await.unwrap_or(false) {
            debug!(path = %target.display(), "content already stored");
            return Ok(StoredFile {
                path: target,
                created: false,
            });
        }

        let tmp = self
            .ctx
            .storage
            .documents_dir
            .join(format!(".{}.tmp", Uuid::new_v4()));
        tokio::fs::copy(source, &tmp)
            .await
            .with_context(|| format!("Failed to copy {} into storage", source.display()))?;

        let linked = tokio::fs::hard_link(&tmp, &target).await;
        remove_temp(&tmp).await;
        match linked {
            Ok(()) => Ok(StoredFile {
                path: target,
                created: true,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(path = %target.display(), "content stored concurrently");
                Ok(StoredFile {
                    path: target,
                    created: false,
                })
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to move file to {}", target.display()))
            }
        }
    }

    /// Execute `steps` in order. A failure of a step in `halt_on` ends the
    /// run. Returns the steps that failed.
    async fn drive(
        &self,
        doc: &mut Document,
        file: &mut File,
        steps: &[ProcessStep],
        halt_on: &[ProcessStep],
    ) -> Vec<ProcessStep> {
        let mut failed = Vec::new();

        for &step in steps {
            if let Some(pre) = step.prerequisite() {
                if failed.contains(&pre) {
                    warn!(document = doc.id, "not running {}: {} failed", step, pre);
                    continue;
                }
            }

            if !self.run_step(doc, file, step).await {
                failed.push(step);
                if halt_on.contains(&step) {
                    warn!(document = doc.id, "{} failed, halting this run", step);
                    break;
                }
            }
        }

        failed
    }

    async fn run_step(&self, doc: &mut Document, file: &mut File, step: ProcessStep) -> bool {
        let item = ProcessItem::new(doc.id, step);
        let mut job = match self.ledger().start_process_item(&item, step.label()).await {
            Ok(job) => job,
            Err(e) => {
                error!(document = doc.id, step = %step, "failed to start step: {:#}", e);
                return false;
            }
        };

        debug!(task = self.task_id, document = doc.id, step = %step, "running step");
        let handler = async {
            match step {
                ProcessStep::Hash => self.update_hash(doc, file, &mut job).await,
                ProcessStep::Thumbnail => self.generate_thumbnail(doc, &mut job).await,
                ProcessStep::ParseContent => self.parse_content(doc, &mut job).await,
                ProcessStep::ApplyRules => self.classify(doc, &mut job).await,
            }
        };
        let outcome = match AssertUnwindSafe(handler).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(panic) => Err(anyhow!("step panicked: {}", panic_message(panic.as_ref()))),
        };

        let ok = match outcome {
            Ok(()) => {
                job.finish();
                true
            }
            Err(e) => {
                error!(document = doc.id, step = %step, "step failed: {:#}", e);
                job.fail(&format!("{:#}", e));
                false
            }
        };

        self.persist_process(&item, &mut job, ok).await;
        ok
    }

    async fn persist_process(&self, item: &ProcessItem, job: &mut Job, ok: bool) {
        job.stopped_at = Utc::now();
        if let Err(e) = self.ledger().mark_processing_done(item, ok).await {
            error!(document = item.document_id, step = %item.step, "failed to record step outcome: {:#}", e);
        }
        if let Err(e) = self.ledger().update_job(job).await {
            error!(document = item.document_id, job = job.id, "failed to update job: {:#}", e);
        }
    }

    /// Recompute the content hash and move the stored file if it changed.
    ///
    /// The file is linked under the new name first; the old name is only
    /// removed after the document update succeeds.
    async fn update_hash(&self, doc: &mut Document, file: &mut File, job: &mut Job) -> Result<()> {
        let new_hash = hash_file(file).await.context("Failed to hash stored file")?;
        if new_hash == doc.hash {
            job.append("no change");
            return Ok(());
        }

        let old_path = self.ctx.storage.document_path(&doc.hash);
        let new_path = self.ctx.storage.document_path(&new_hash);
        if tokio::fs::try_exists(&new_path).await.unwrap_or(false) {
            bail!("content now matches another stored file {}", new_hash);
        }

        link_or_copy(&old_path, &new_path).await?;

        let old_hash = std::mem::replace(&mut doc.hash, new_hash);
        if let Err(e) = self.documents().update(doc).await {
            let new_hash = std::mem::replace(&mut doc.hash, old_hash);
            if let Err(rm) = tokio::fs::remove_file(&new_path).await {
                warn!(path = %new_path.display(), "failed to remove new link: {}", rm);
            }
            return Err(e.context(format!("Failed to record hash change to {}", new_hash)));
        }

        if let Err(e) = tokio::fs::remove_file(&old_path).await {
            warn!(path = %old_path.display(), "failed to remove old file: {}", e);
        }
        let old_preview = self.ctx.storage.preview_path(&old_hash);
        if tokio::fs::try_exists(&old_preview).await.unwrap_or(false) {
            let new_preview = self.ctx.storage.preview_path(&doc.hash);
            if let Err(e) = tokio::fs::rename(&old_preview, &new_preview).await {
                warn!(path = %old_preview.display(), "failed to move preview: {}", e);
            }
        }

        job.append(&format!("hash changed from {} to {}", old_hash, doc.hash));
        Ok(())
    }

    async fn generate_thumbnail(&self, doc: &Document, job: &mut Job) -> Result<()> {
        let source = self.ctx.storage.document_path(&doc.hash);
        let output = self.ctx.storage.preview_path(&doc.hash);

        bounded(
            self.ctx.step_timeout,
            self.ctx.extractor.thumbnail(&source, &output),
        )
        .await?;

        job.append(&format!("preview written to {}", output.display()));
        Ok(())
    }

    /// Rasterize when needed, then OCR. Each sub-operation gets its own job.
    async fn parse_content(&self, doc: &mut Document, job: &mut Job) -> Result<()> {
        let source = self.ctx.storage.document_path(&doc.hash);

        let raster = if is_page_oriented(Path::new(&doc.filename), &self.ctx.raster_extensions) {
            let output = self.ctx.storage.raster_path(&doc.hash);
            let rendered = self
                .sub_job(doc.id, "rasterize document", async {
                    self.ctx.extractor.rasterize(&source, &output).await
                })
                .await;
            match rendered {
                Ok(image) => Some(image),
                Err(e) => {
                    remove_temp(&output).await;
                    return Err(e).context("rasterization failed");
                }
            }
        } else {
            None
        };

        let image = raster.as_deref().unwrap_or(&source);
        let text = self
            .sub_job(doc.id, "extract text", async {
                self.ctx.extractor.extract_text(image).await
            })
            .await;
        if let Some(raster) = &raster {
            remove_temp(raster).await;
        }
        let text = text.context("text extraction failed")?;

        self.documents()
            .set_content(doc.id, &text)
            .await
            .context("Failed to save extracted content")?;
        doc.content = text;

        job.append(&format!("extracted {} characters", doc.content.chars().count()));
        Ok(())
    }

    async fn classify(&self, doc: &mut Document, job: &mut Job) -> Result<()> {
        let rules = self.rules().rules_for_user(doc.user_id).await?;
        let errors = apply_rules(doc, &rules);
        for e in &errors {
            job.append(&e.to_string());
        }

        self.documents()
            .update(doc)
            .await
            .context("Failed to save classified document")?;

        job.append(&format!(
            "{} rules evaluated, {} failed",
            rules.len(),
            errors.len()
        ));
        Ok(())
    }

    /// Run one extraction call under its own job record.
    async fn sub_job<T, F>(&self, document_id: i64, label: &str, fut: F) -> Result<T, ExtractError>
    where
        F: std::future::Future<Output = Result<T, ExtractError>>,
    {
        let mut job = Job::new(document_id, label);
        if let Err(e) = self.ledger().create_job(document_id, &mut job).await {
            error!(document = document_id, "failed to create job '{}': {:#}", label, e);
        }

        let result = match AssertUnwindSafe(bounded(self.ctx.step_timeout, fut))
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => Err(ExtractError::Panicked(panic_message(panic.as_ref()))),
        };
        match &result {
            Ok(_) => job.finish(),
            Err(e) => job.fail(&e.to_string()),
        }
        job.stopped_at = Utc::now();

        if job.id != 0 {
            if let Err(e) = self.ledger().update_job(&job).await {
                error!(document = document_id, job = job.id, "failed to update job: {:#}", e);
            }
        }
        result
    }
}

async fn link_or_copy(from: &Path, to: &Path) -> Result<()> {
    if tokio::fs::hard_link(from, to).await.is_ok() {
        return Ok(());
    }
    tokio::fs::copy(from, to)
        .await
        .with_context(|| format!("Failed to copy {} to {}", from.display(), to.display()))?;
    Ok(())
}

async fn remove_temp(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), "failed to remove temp file: {}", e),
    }
}

#[async_trait]
impl Worker for FileProcessor {
    type Input = FileOp;

    async fn process(&mut self, op: FileOp) {
        let operation = match op.into_operation() {
            Ok(operation) => operation,
            Err(reason) => {
                warn!(task = self.task_id, "dropping file operation: {}", reason);
                return;
            }
        };

        match operation {
            Operation::Ingest { path, user_id } => {
                if let Err(e) = self.ingest(&path, user_id).await {
                    error!(task = self.task_id, path = %path.display(), "ingestion failed: {:#}", e);
                }
            }
            Operation::Reprocess(doc) => {
                let id = doc.id;
                if let Err(e) = self.reprocess(doc).await {
                    error!(task = self.task_id, document = id, "reprocessing failed: {:#}", e);
                }
            }
        }
    }
}
