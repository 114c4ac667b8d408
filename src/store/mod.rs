//! Storage abstraction for the processing pipeline.
//!
//! The pipeline persists through three collaborator traits:
//!
//! | Trait | Records |
//! |-------|---------|
//! | [`DocumentStore`] | Documents, keyed by id and content hash |
//! | [`ProcessLedger`] | Pending pipeline steps and the job audit trail |
//! | [`RuleStore`] | Per-user ordered classification rules |
//!
//! Each backend ([`sqlite::SqliteStore`], [`memory::InMemoryStore`])
//! implements all three; [`Stores`] hands them to the pipeline as trait
//! objects so either can be swapped in. Implementations are responsible
//! for the consistency of a single call (one transaction per update).

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{Document, Job, ProcessItem, ProcessStep, Rule, RuleDraft};

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Insert a new document and assign its id.
    async fn create(&self, doc: &mut Document) -> Result<()>;

    /// Persist every mutable field, including metadata and tags.
    async fn update(&self, doc: &Document) -> Result<()>;

    async fn get(&self, id: i64) -> Result<Option<Document>>;

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Document>>;

    async fn set_content(&self, id: i64, content: &str) -> Result<()>;
}

#[async_trait]
pub trait ProcessLedger: Send + Sync {
    /// Steps not yet completed for a document, in pipeline order.
    async fn pending_steps(&self, document_id: i64) -> Result<Vec<ProcessItem>>;

    /// Queue steps for a document. Already queued steps are left as they are.
    async fn add_steps(&self, document_id: i64, steps: &[ProcessStep]) -> Result<()>;

    /// Mark the step as running and open an audit job for it.
    async fn start_process_item(&self, item: &ProcessItem, label: &str) -> Result<Job>;

    /// Close out a step. Successful steps leave the pending set; failed
    /// steps stay queued for the next reprocess.
    async fn mark_processing_done(&self, item: &ProcessItem, ok: bool) -> Result<()>;

    /// Insert a free-standing job and assign its id.
    async fn create_job(&self, document_id: i64, job: &mut Job) -> Result<()>;

    async fn update_job(&self, job: &Job) -> Result<()>;

    /// Audit trail for a document, oldest first.
    async fn jobs_for_document(&self, document_id: i64) -> Result<Vec<Job>>;

    /// Queue `step` on every document of `user_id` carrying the metadata
    /// key (and value, when given). Returns the affected document ids.
    async fn queue_documents_by_metadata(
        &self,
        user_id: i64,
        key_id: i64,
        value_id: Option<i64>,
        step: ProcessStep,
    ) -> Result<Vec<i64>>;

    /// Queue `step` on every document of `user_id`. Returns the affected ids.
    async fn queue_user_documents(&self, user_id: i64, step: ProcessStep) -> Result<Vec<i64>>;
}

#[async_trait]
pub trait RuleStore: Send + Sync {
    /// The user's rules in evaluation order. Rows that cannot be decoded
    /// are logged and left out.
    async fn rules_for_user(&self, user_id: i64) -> Result<Vec<Rule>>;

    /// Replace the user's whole rule set, keeping the given order.
    async fn replace_rules(&self, user_id: i64, rules: &[RuleDraft]) -> Result<Vec<Rule>>;
}

/// The storage handles a worker owns.
#[derive(Clone)]
pub struct Stores {
    pub documents: Arc<dyn DocumentStore>,
    pub ledger: Arc<dyn ProcessLedger>,
    pub rules: Arc<dyn RuleStore>,
}

impl Stores {
    /// Use one backend for all three concerns.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: DocumentStore + ProcessLedger + RuleStore + 'static,
    {
        Self {
            documents: backend.clone(),
            ledger: backend.clone(),
            rules: backend,
        }
    }
}
