//! In-memory backend for testing and embedding.
//!
//! Keeps every record behind one `std::sync::RwLock` so each trait call is
//! atomic with respect to the others, like a single SQL transaction.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;

use crate::models::{Document, Job, ProcessItem, ProcessStep, Rule, RuleDraft};

use super::{DocumentStore, ProcessLedger, RuleStore};

struct QueuedStep {
    item: ProcessItem,
    running: bool,
    /// Queued again while running; survives the current run's success.
    requeued: bool,
}

#[derive(Default)]
struct Inner {
    documents: HashMap<i64, Document>,
    next_document_id: i64,
    queue: Vec<QueuedStep>,
    jobs: Vec<Job>,
    next_job_id: i64,
    rules: Vec<Rule>,
    next_rule_id: i64,
}

impl Inner {
    fn enqueue(&mut self, document_id: i64, step: ProcessStep) {
        match self
            .queue
            .iter_mut()
            .find(|q| q.item.document_id == document_id && q.item.step == step)
        {
            Some(queued) => queued.requeued |= queued.running,
            None => self.queue.push(QueuedStep {
                item: ProcessItem::new(document_id, step),
                running: false,
                requeued: false,
            }),
        }
    }

    fn user_document_ids(&self, user_id: i64) -> Vec<i64> {
        let mut ids: Vec<i64> = self
            .documents
            .values()
            .filter(|d| d.user_id == user_id)
            .map(|d| d.id)
            .collect();
        ids.sort_unstable();
        ids
    }
}

/// In-memory store implementing every storage trait.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    pub fn document_count(&self) -> usize {
        self.inner.read().unwrap().documents.len()
    }

    /// Whether the step is currently flagged as running.
    pub fn is_running(&self, document_id: i64, step: ProcessStep) -> bool {
        self.inner
            .read()
            .unwrap()
            .queue
            .iter()
            .any(|q| q.item.document_id == document_id && q.item.step == step && q.running)
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for InMemoryStore {
    async fn create(&self, doc: &mut Document) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner.documents.values().any(|d| d.hash == doc.hash) {
            bail!("document with hash {} already exists", doc.hash);
        }
        inner.next_document_id += 1;
        doc.id = inner.next_document_id;
        inner.documents.insert(doc.id, doc.clone());
        Ok(())
    }

    async fn update(&self, doc: &Document) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        if inner
            .documents
            .values()
            .any(|d| d.id != doc.id && d.hash == doc.hash)
        {
            bail!("document with hash {} already exists", doc.hash);
        }
        match inner.documents.get_mut(&doc.id) {
            Some(stored) => {
                *stored = doc.clone();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("document not found: {}", doc.id),
        }
    }

    async fn get(&self, id: i64) -> Result<Option<Document>> {
        Ok(self.inner.read().unwrap().documents.get(&id).cloned())
    }

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Document>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .documents
            .values()
            .find(|d| d.hash == hash)
            .cloned())
    }

    async fn set_content(&self, id: i64, content: &str) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.documents.get_mut(&id) {
            Some(stored) => {
                stored.content = content.to_string();
                stored.updated_at = Utc::now();
                Ok(())
            }
            None => bail!("document not found: {}", id),
        }
    }
}

#[async_trait]
impl ProcessLedger for InMemoryStore {
    async fn pending_steps(&self, document_id: i64) -> Result<Vec<ProcessItem>> {
        let inner = self.inner.read().unwrap();
        let mut items: Vec<ProcessItem> = inner
            .queue
            .iter()
            .filter(|q| q.item.document_id == document_id)
            .map(|q| q.item.clone())
            .collect();
        items.sort_by(|a, b| a.step.cmp(&b.step).then(a.created_at.cmp(&b.created_at)));
        Ok(items)
    }

    async fn add_steps(&self, document_id: i64, steps: &[ProcessStep]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        for step in steps {
            inner.enqueue(document_id, *step);
        }
        Ok(())
    }

    async fn start_process_item(&self, item: &ProcessItem, label: &str) -> Result<Job> {
        let mut inner = self.inner.write().unwrap();
        inner.enqueue(item.document_id, item.step);
        for queued in inner.queue.iter_mut() {
            if queued.item.document_id == item.document_id && queued.item.step == item.step {
                queued.running = true;
                queued.requeued = false;
            }
        }
        inner.next_job_id += 1;
        let mut job = Job::new(item.document_id, label);
        job.id = inner.next_job_id;
        inner.jobs.push(job.clone());
        Ok(job)
    }

    async fn mark_processing_done(&self, item: &ProcessItem, ok: bool) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let same = |q: &QueuedStep| q.item.document_id == item.document_id && q.item.step == item.step;
        if ok {
            inner.queue.retain(|q| !same(q) || q.requeued);
        }
        for queued in inner.queue.iter_mut() {
            if same(queued) {
                queued.running = false;
                queued.requeued = false;
            }
        }
        Ok(())
    }

    async fn create_job(&self, document_id: i64, job: &mut Job) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        inner.next_job_id += 1;
        job.id = inner.next_job_id;
        job.document_id = document_id;
        inner.jobs.push(job.clone());
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.jobs.iter_mut().find(|j| j.id == job.id) {
            Some(stored) => {
                *stored = job.clone();
                Ok(())
            }
            None => bail!("job not found: {}", job.id),
        }
    }

    async fn jobs_for_document(&self, document_id: i64) -> Result<Vec<Job>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .jobs
            .iter()
            .filter(|j| j.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn queue_documents_by_metadata(
        &self,
        user_id: i64,
        key_id: i64,
        value_id: Option<i64>,
        step: ProcessStep,
    ) -> Result<Vec<i64>> {
        let mut inner = self.inner.write().unwrap();
        let mut ids: Vec<i64> = inner
            .documents
            .values()
            .filter(|d| d.user_id == user_id)
            .filter(|d| {
                d.metadata
                    .iter()
                    .any(|m| m.key_id == key_id && value_id.map_or(true, |v| m.value_id == v))
            })
            .map(|d| d.id)
            .collect();
        ids.sort_unstable();
        for id in &ids {
            inner.enqueue(*id, step);
        }
        Ok(ids)
    }

    async fn queue_user_documents(&self, user_id: i64, step: ProcessStep) -> Result<Vec<i64>> {
        let mut inner = self.inner.write().unwrap();
        let ids = inner.user_document_ids(user_id);
        for id in &ids {
            inner.enqueue(*id, step);
        }
        Ok(ids)
    }
}

#[async_trait]
impl RuleStore for InMemoryStore {
    async fn rules_for_user(&self, user_id: i64) -> Result<Vec<Rule>> {
        let inner = self.inner.read().unwrap();
        Ok(inner
            .rules
            .iter()
            .filter(|r| r.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn replace_rules(&self, user_id: i64, drafts: &[RuleDraft]) -> Result<Vec<Rule>> {
        let mut inner = self.inner.write().unwrap();
        inner.rules.retain(|r| r.user_id != user_id);
        let mut created = Vec::with_capacity(drafts.len());
        for draft in drafts {
            inner.next_rule_id += 1;
            let rule = Rule {
                id: inner.next_rule_id,
                user_id,
                kind: draft.kind,
                filter: draft.filter.clone(),
                action: draft.action.clone(),
            };
            inner.rules.push(rule.clone());
            created.push(rule);
        }
        Ok(created)
    }
}
