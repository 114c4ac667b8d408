//! Pipeline behavior against the in-memory store and a scripted extractor.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use tempfile::TempDir;

use scanshelf::config::{ProcessingConfig, StorageConfig};
use scanshelf::extract::{ExtractError, Extractor};
use scanshelf::hash::hash_bytes;
use scanshelf::inflight::{FlightKey, InFlight};
use scanshelf::models::{Document, JobStatus, ProcessStep, RuleAction, RuleDraft, RuleKind};
use scanshelf::pool::Pool;
use scanshelf::processor::{FileProcessor, IngestOutcome, ProcessorContext};
use scanshelf::store::memory::InMemoryStore;
use scanshelf::store::{DocumentStore, ProcessLedger, RuleStore, Stores};
use scanshelf::task::TaskState;

/// Copies files for thumbnails and rasters; "OCR" returns the image bytes.
#[derive(Default)]
struct ScriptedExtractor {
    fail_thumbnail: AtomicBool,
    panic_thumbnail: AtomicBool,
    fail_rasterize: AtomicBool,
    fail_text: AtomicBool,
    panic_text: AtomicBool,
}

fn failure(program: &str) -> ExtractError {
    ExtractError::Failed {
        program: program.to_string(),
        status: "exit status: 1".to_string(),
        stderr: "scripted failure".to_string(),
    }
}

#[async_trait]
impl Extractor for ScriptedExtractor {
    async fn thumbnail(&self, source: &Path, output: &Path) -> Result<(), ExtractError> {
        if self.panic_thumbnail.load(Ordering::SeqCst) {
            panic!("thumbnailer crashed");
        }
        if self.fail_thumbnail.load(Ordering::SeqCst) {
            return Err(failure("convert"));
        }
        fs::copy(source, output).map_err(|source| ExtractError::Spawn {
            program: "cp".into(),
            source,
        })?;
        Ok(())
    }

    async fn rasterize(&self, source: &Path, output: &Path) -> Result<PathBuf, ExtractError> {
        if self.fail_rasterize.load(Ordering::SeqCst) {
            // Leave a half-written page behind, as a crashing renderer would.
            fs::write(output, "partial").map_err(|source| ExtractError::Spawn {
                program: "convert".into(),
                source,
            })?;
            return Err(failure("convert"));
        }
        fs::copy(source, output).map_err(|source| ExtractError::Spawn {
            program: "cp".into(),
            source,
        })?;
        Ok(output.to_path_buf())
    }

    async fn extract_text(&self, image: &Path) -> Result<String, ExtractError> {
        if self.panic_text.load(Ordering::SeqCst) {
            panic!("ocr engine crashed");
        }
        if self.fail_text.load(Ordering::SeqCst) {
            return Err(failure("tesseract"));
        }
        fs::read_to_string(image).map_err(|source| ExtractError::Spawn {
            program: "cat".into(),
            source,
        })
    }
}

/// Delegates to the in-memory store but can be told to reject writes, or
/// to miss hash lookups the way a second process racing on the same
/// content would.
struct FlakyDocuments {
    inner: Arc<InMemoryStore>,
    reject_creates: AtomicBool,
    reject_updates: AtomicBool,
    hide_hashes: AtomicBool,
}

#[async_trait]
impl DocumentStore for FlakyDocuments {
    async fn create(&self, doc: &mut Document) -> Result<()> {
        if self.reject_creates.load(Ordering::SeqCst) {
            bail!("disk I/O error");
        }
        self.inner.create(doc).await
    }

    async fn update(&self, doc: &Document) -> Result<()> {
        if self.reject_updates.load(Ordering::SeqCst) {
            bail!("database is locked");
        }
        self.inner.update(doc).await
    }

    async fn get(&self, id: i64) -> Result<Option<Document>> {
        self.inner.get(id).await
    }

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Document>> {
        if self.hide_hashes.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.inner.get_by_hash(hash).await
    }

    async fn set_content(&self, id: i64, content: &str) -> Result<()> {
        self.inner.set_content(id, content).await
    }
}

struct Env {
    _tmp: TempDir,
    inbox: PathBuf,
    storage: StorageConfig,
    backend: Arc<InMemoryStore>,
    documents: Arc<FlakyDocuments>,
    extractor: Arc<ScriptedExtractor>,
    ctx: ProcessorContext,
}

fn setup() -> Env {
    let tmp = TempDir::new().unwrap();
    let root = tmp.path();
    let storage = StorageConfig {
        documents_dir: root.join("documents"),
        previews_dir: root.join("previews"),
        tmp_dir: root.join("tmp"),
    };
    storage.ensure_dirs().unwrap();
    let inbox = root.join("inbox");
    fs::create_dir_all(&inbox).unwrap();

    let backend = Arc::new(InMemoryStore::new());
    let documents = Arc::new(FlakyDocuments {
        inner: backend.clone(),
        reject_creates: AtomicBool::new(false),
        reject_updates: AtomicBool::new(false),
        hide_hashes: AtomicBool::new(false),
    });
    let extractor = Arc::new(ScriptedExtractor::default());
    let stores = Stores {
        documents: documents.clone(),
        ledger: backend.clone(),
        rules: backend.clone(),
    };
    let ctx = ProcessorContext {
        stores,
        extractor: extractor.clone(),
        storage: storage.clone(),
        raster_extensions: vec!["pdf".to_string()],
        step_timeout: Some(Duration::from_secs(5)),
        in_flight: InFlight::new(),
    };

    Env {
        _tmp: tmp,
        inbox,
        storage,
        backend,
        documents,
        extractor,
        ctx,
    }
}

fn write_inbox(env: &Env, name: &str, content: &str) -> PathBuf {
    let path = env.inbox.join(name);
    fs::write(&path, content).unwrap();
    path
}

async fn pending(env: &Env, id: i64) -> Vec<ProcessStep> {
    env.backend
        .pending_steps(id)
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.step)
        .collect()
}

async fn ingest(env: &Env, path: &Path) -> Document {
    let processor = FileProcessor::new(0, env.ctx.clone());
    match processor.ingest(path, 1).await.unwrap() {
        IngestOutcome::Created(doc) => doc,
        other => panic!("expected a new document, got {:?}", other),
    }
}

#[tokio::test]
async fn full_run_converges_to_no_pending_steps() {
    let env = setup();
    let path = write_inbox(&env, "invoice.pdf", "invoice-4471 from acme");

    let doc = ingest(&env, &path).await;

    assert!(pending(&env, doc.id).await.is_empty());
    let stored = env.backend.get(doc.id).await.unwrap().unwrap();
    assert_eq!(stored.hash, hash_bytes(b"invoice-4471 from acme"));
    assert_eq!(stored.name, "invoice.pdf");
    assert_eq!(stored.content, "invoice-4471 from acme");

    assert!(env.storage.document_path(&doc.hash).exists());
    assert!(env.storage.preview_path(&doc.hash).exists());
    assert!(!env.storage.raster_path(&doc.hash).exists());

    let jobs = env.backend.jobs_for_document(doc.id).await.unwrap();
    let labels: Vec<&str> = jobs.iter().map(|j| j.message.split(';').next().unwrap()).collect();
    for label in [
        "generate thumbnail",
        "parse content",
        "rasterize document",
        "extract text",
        "apply rules",
    ] {
        assert!(labels.contains(&label), "missing job {label}: {labels:?}");
    }
    assert!(jobs.iter().all(|j| j.status == JobStatus::Finished));
}

#[tokio::test]
async fn identical_content_is_ingested_once() {
    let env = setup();
    let first = write_inbox(&env, "scan-1.png", "same bytes");
    let second = write_inbox(&env, "scan-2.png", "same bytes");

    let doc = ingest(&env, &first).await;
    let processor = FileProcessor::new(0, env.ctx.clone());
    let outcome = processor.ingest(&second, 1).await.unwrap();

    assert!(matches!(outcome, IngestOutcome::Duplicate(id) if id == doc.id));
    assert_eq!(env.backend.document_count(), 1);
}

fn temp_copies(env: &Env) -> Vec<String> {
    fs::read_dir(&env.storage.documents_dir)
        .unwrap()
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".tmp"))
        .collect()
}

#[tokio::test]
async fn racing_ingest_keeps_the_existing_stored_file() {
    let env = setup();
    let first = write_inbox(&env, "scan-1.png", "shared bytes");
    let second = write_inbox(&env, "scan-2.png", "shared bytes");
    let doc = ingest(&env, &first).await;
    let stored = env.storage.document_path(&doc.hash);

    // The second ingester does not see the first document yet.
    env.documents.hide_hashes.store(true, Ordering::SeqCst);
    let processor = FileProcessor::new(1, env.ctx.clone());
    assert!(processor.ingest(&second, 1).await.is_err());

    assert_eq!(env.backend.document_count(), 1);
    assert_eq!(fs::read_to_string(&stored).unwrap(), "shared bytes");
    assert!(temp_copies(&env).is_empty());
}

#[tokio::test]
async fn failed_create_removes_only_its_own_copy() {
    let env = setup();
    env.documents.reject_creates.store(true, Ordering::SeqCst);
    let path = write_inbox(&env, "scan.png", "fresh bytes");

    let processor = FileProcessor::new(0, env.ctx.clone());
    let err = processor.ingest(&path, 1).await.unwrap_err();

    assert!(format!("{:#}", err).contains("disk I/O error"));
    assert_eq!(env.backend.document_count(), 0);
    assert!(!env
        .storage
        .document_path(&hash_bytes(b"fresh bytes"))
        .exists());
    assert!(temp_copies(&env).is_empty());
}

#[tokio::test]
async fn unreadable_file_creates_nothing() {
    let env = setup();
    let processor = FileProcessor::new(0, env.ctx.clone());
    let result = processor.ingest(&env.inbox.join("missing.pdf"), 1).await;

    assert!(result.is_err());
    assert_eq!(env.backend.document_count(), 0);
}

#[tokio::test]
async fn rules_are_applied_after_content_is_parsed() {
    let env = setup();
    env.backend
        .replace_rules(
            1,
            &[
                RuleDraft {
                    kind: RuleKind::Regex,
                    filter: r"invoice-(\d+)".into(),
                    action: RuleAction::Rename,
                },
                RuleDraft {
                    kind: RuleKind::Exact,
                    filter: "ACME".into(),
                    action: RuleAction::AddTag { tag_id: 3 },
                },
            ],
        )
        .await
        .unwrap();
    let path = write_inbox(&env, "invoice.png", "invoice-4471 from acme");

    let doc = ingest(&env, &path).await;

    let stored = env.backend.get(doc.id).await.unwrap().unwrap();
    assert_eq!(stored.name, "4471");
    assert_eq!(stored.tags, vec![3]);
}

#[tokio::test]
async fn thumbnail_failure_halts_run_and_reprocess_recovers() {
    let env = setup();
    env.extractor.fail_thumbnail.store(true, Ordering::SeqCst);
    let path = write_inbox(&env, "receipt.png", "total 12.50");

    let doc = ingest(&env, &path).await;
    assert_eq!(
        pending(&env, doc.id).await,
        vec![
            ProcessStep::Thumbnail,
            ProcessStep::ParseContent,
            ProcessStep::ApplyRules
        ]
    );
    let stored = env.backend.get(doc.id).await.unwrap().unwrap();
    assert!(!stored.has_content());

    env.extractor.fail_thumbnail.store(false, Ordering::SeqCst);
    let processor = FileProcessor::new(0, env.ctx.clone());
    let doc = processor.reprocess(stored).await.unwrap();

    assert!(pending(&env, doc.id).await.is_empty());
    assert_eq!(doc.content, "total 12.50");
}

#[tokio::test]
async fn extraction_failure_keeps_content_step_pending() {
    let env = setup();
    env.extractor.fail_text.store(true, Ordering::SeqCst);
    let path = write_inbox(&env, "letter.pdf", "dear customer");

    let doc = ingest(&env, &path).await;

    assert_eq!(
        pending(&env, doc.id).await,
        vec![ProcessStep::ParseContent, ProcessStep::ApplyRules]
    );
    assert!(!env.backend.is_running(doc.id, ProcessStep::ParseContent));
    assert!(!env.storage.raster_path(&doc.hash).exists());

    let jobs = env.backend.jobs_for_document(doc.id).await.unwrap();
    let ocr = jobs
        .iter()
        .find(|j| j.message.starts_with("extract text"))
        .unwrap();
    assert_eq!(ocr.status, JobStatus::Failure);
    assert!(ocr.message.contains("scripted failure"));
    assert!(jobs.iter().all(|j| !j.message.starts_with("apply rules")));
}

#[tokio::test]
async fn rasterize_failure_skips_text_extraction() {
    let env = setup();
    env.extractor.fail_rasterize.store(true, Ordering::SeqCst);
    let path = write_inbox(&env, "statement.pdf", "balance 310");

    let doc = ingest(&env, &path).await;

    assert_eq!(
        pending(&env, doc.id).await,
        vec![ProcessStep::ParseContent, ProcessStep::ApplyRules]
    );
    assert!(!env.storage.raster_path(&doc.hash).exists());
    let stored = env.backend.get(doc.id).await.unwrap().unwrap();
    assert!(!stored.has_content());

    let jobs = env.backend.jobs_for_document(doc.id).await.unwrap();
    let raster = jobs
        .iter()
        .find(|j| j.message.starts_with("rasterize document"))
        .unwrap();
    assert_eq!(raster.status, JobStatus::Failure);
    assert!(jobs.iter().all(|j| !j.message.starts_with("extract text")));

    let step = jobs
        .iter()
        .find(|j| j.message.starts_with("parse content"))
        .unwrap();
    assert_eq!(step.status, JobStatus::Failure);
    assert!(step.message.contains("rasterization failed"));
}

#[tokio::test]
async fn panicking_thumbnailer_fails_the_step() {
    let env = setup();
    env.extractor.panic_thumbnail.store(true, Ordering::SeqCst);
    let path = write_inbox(&env, "receipt.png", "total 3.20");

    let doc = ingest(&env, &path).await;

    assert_eq!(pending(&env, doc.id).await.first(), Some(&ProcessStep::Thumbnail));
    assert!(!env.backend.is_running(doc.id, ProcessStep::Thumbnail));
    let jobs = env.backend.jobs_for_document(doc.id).await.unwrap();
    let thumb = jobs
        .iter()
        .find(|j| j.message.starts_with("generate thumbnail"))
        .unwrap();
    assert_eq!(thumb.status, JobStatus::Failure);
    assert!(thumb.message.contains("thumbnailer crashed"));
}

#[tokio::test]
async fn unchanged_hash_records_no_change() {
    let env = setup();
    let path = write_inbox(&env, "a.png", "stable");
    let doc = ingest(&env, &path).await;

    env.backend
        .add_steps(doc.id, &[ProcessStep::Hash])
        .await
        .unwrap();
    let processor = FileProcessor::new(0, env.ctx.clone());
    let after = processor.reprocess(doc.clone()).await.unwrap();

    assert_eq!(after.hash, doc.hash);
    assert!(pending(&env, doc.id).await.is_empty());
    let jobs = env.backend.jobs_for_document(doc.id).await.unwrap();
    let hash_job = jobs
        .iter()
        .find(|j| j.message.starts_with("calculate hash"))
        .unwrap();
    assert!(hash_job.message.contains("no change"));
}

#[tokio::test]
async fn changed_hash_moves_the_stored_file() {
    let env = setup();
    let path = write_inbox(&env, "a.png", "original");
    let doc = ingest(&env, &path).await;
    let old_path = env.storage.document_path(&doc.hash);
    fs::write(&old_path, "drifted").unwrap();

    env.backend
        .add_steps(doc.id, &[ProcessStep::Hash])
        .await
        .unwrap();
    let processor = FileProcessor::new(0, env.ctx.clone());
    let after = processor.reprocess(doc.clone()).await.unwrap();

    let new_hash = hash_bytes(b"drifted");
    assert_eq!(after.hash, new_hash);
    assert_eq!(
        env.backend.get(doc.id).await.unwrap().unwrap().hash,
        new_hash
    );
    assert!(!old_path.exists());
    assert_eq!(
        fs::read_to_string(env.storage.document_path(&new_hash)).unwrap(),
        "drifted"
    );
    assert!(env.storage.preview_path(&new_hash).exists());
    assert!(pending(&env, doc.id).await.is_empty());
}

#[tokio::test]
async fn failed_hash_update_keeps_old_location() {
    let env = setup();
    let path = write_inbox(&env, "a.png", "original");
    let doc = ingest(&env, &path).await;
    let old_path = env.storage.document_path(&doc.hash);
    fs::write(&old_path, "drifted").unwrap();

    env.backend
        .add_steps(doc.id, &[ProcessStep::Hash])
        .await
        .unwrap();
    env.documents.reject_updates.store(true, Ordering::SeqCst);
    let processor = FileProcessor::new(0, env.ctx.clone());
    let after = processor.reprocess(doc.clone()).await.unwrap();

    assert_eq!(after.hash, doc.hash);
    assert_eq!(
        env.backend.get(doc.id).await.unwrap().unwrap().hash,
        doc.hash
    );
    assert_eq!(fs::read_to_string(&old_path).unwrap(), "drifted");
    assert!(!env.storage.document_path(&hash_bytes(b"drifted")).exists());
    assert_eq!(pending(&env, doc.id).await, vec![ProcessStep::Hash]);

    let jobs = env.backend.jobs_for_document(doc.id).await.unwrap();
    let hash_job = jobs
        .iter()
        .find(|j| j.message.starts_with("calculate hash"))
        .unwrap();
    assert_eq!(hash_job.status, JobStatus::Failure);
    assert!(hash_job.message.contains("database is locked"));
}

#[tokio::test]
async fn document_in_flight_is_not_reprocessed_twice() {
    let env = setup();
    env.extractor.fail_text.store(true, Ordering::SeqCst);
    let path = write_inbox(&env, "a.png", "content");
    let doc = ingest(&env, &path).await;
    env.extractor.fail_text.store(false, Ordering::SeqCst);

    let guard = env
        .ctx
        .in_flight
        .try_acquire(FlightKey::Document(doc.id))
        .unwrap();
    let processor = FileProcessor::new(1, env.ctx.clone());
    processor.reprocess(doc.clone()).await.unwrap();
    assert_eq!(
        pending(&env, doc.id).await,
        vec![ProcessStep::ParseContent, ProcessStep::ApplyRules]
    );

    drop(guard);
    processor.reprocess(doc.clone()).await.unwrap();
    assert!(pending(&env, doc.id).await.is_empty());
}

fn pool_settings(workers: usize) -> ProcessingConfig {
    ProcessingConfig {
        workers,
        poll_interval_ms: 5,
        queue_depth: 4,
        step_timeout_secs: 5,
        default_user: 1,
    }
}

async fn drain(pool: &Pool) {
    tokio::time::timeout(Duration::from_secs(10), pool.wait_idle())
        .await
        .expect("pool did not go idle");
}

#[tokio::test]
async fn pool_processes_submissions_and_goes_idle() {
    let env = setup();
    let pool = Pool::start(env.ctx.clone(), &pool_settings(2));
    assert_eq!(pool.statuses().len(), 2);

    for (name, body) in [("a.png", "alpha"), ("b.png", "beta"), ("c.png", "gamma")] {
        pool.submit_file(write_inbox(&env, name, body), 1)
            .await
            .unwrap();
    }
    drain(&pool).await;

    assert!(pool.is_idle());
    assert!(pool.statuses().iter().all(|s| *s == TaskState::Idle));
    assert_eq!(env.backend.document_count(), 3);
    pool.shutdown().await;
}

#[tokio::test]
async fn worker_survives_a_panicking_extractor() {
    let env = setup();
    let pool = Pool::start(env.ctx.clone(), &pool_settings(1));

    env.extractor.panic_text.store(true, Ordering::SeqCst);
    pool.submit_file(write_inbox(&env, "first.png", "first"), 1)
        .await
        .unwrap();
    drain(&pool).await;

    env.extractor.panic_text.store(false, Ordering::SeqCst);
    pool.submit_file(write_inbox(&env, "second.png", "second"), 1)
        .await
        .unwrap();
    drain(&pool).await;

    let second = env
        .backend
        .get_by_hash(&hash_bytes(b"second"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.content, "second");
    assert!(pending(&env, second.id).await.is_empty());

    let first = env
        .backend
        .get_by_hash(&hash_bytes(b"first"))
        .await
        .unwrap()
        .unwrap();
    assert!(pending(&env, first.id)
        .await
        .contains(&ProcessStep::ParseContent));
    assert!(!env.backend.is_running(first.id, ProcessStep::ParseContent));
    let jobs = env.backend.jobs_for_document(first.id).await.unwrap();
    assert!(jobs.iter().all(|j| j.status != JobStatus::Awaiting), "{jobs:?}");
    let ocr = jobs
        .iter()
        .find(|j| j.message.starts_with("extract text"))
        .unwrap();
    assert!(ocr.message.contains("ocr engine crashed"));

    pool.submit_document(first.id).await.unwrap();
    drain(&pool).await;
    assert!(pending(&env, first.id).await.is_empty());
    pool.shutdown().await;
}

#[tokio::test]
async fn submitting_unknown_document_fails() {
    let env = setup();
    let pool = Pool::start(env.ctx.clone(), &pool_settings(1));
    assert!(pool.submit_document(404).await.is_err());
    pool.shutdown().await;
}
