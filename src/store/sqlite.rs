//! SQLite-backed storage.
//!
//! Maps each storage trait operation onto the schema created by
//! [`crate::migrate`]. Multi-statement writes run in one transaction.

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::error;

use crate::models::{
    Document, Job, Metadata, ProcessItem, ProcessStep, Rule, RuleAction, RuleDraft, RuleKind,
    UnknownValue,
};

use super::{DocumentStore, ProcessLedger, RuleStore};

/// SQLite implementation of every storage trait.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn load_document(&self, row: SqliteRow) -> Result<Document> {
        let id: i64 = row.get("id");

        let metadata = sqlx::query(
            "SELECT key_id, value_id FROM document_metadata WHERE document_id = ? ORDER BY position ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?
        .iter()
        .map(|r| Metadata {
            key_id: r.get("key_id"),
            value_id: r.get("value_id"),
        })
        .collect();

        let tags = sqlx::query_scalar(
            "SELECT tag_id FROM document_tags WHERE document_id = ? ORDER BY position ASC",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Document {
            id,
            user_id: row.get("user_id"),
            hash: row.get("hash"),
            name: row.get("name"),
            filename: row.get("filename"),
            content: row.get("content"),
            description: row.get("description"),
            date: from_ts(row.get("date")),
            metadata,
            tags,
            created_at: from_ts(row.get("created_at")),
            updated_at: from_ts(row.get("updated_at")),
        })
    }

    async fn fetch_document(&self, clause: &str, bind: DocumentKey<'_>) -> Result<Option<Document>> {
        let sql = format!(
            "SELECT id, user_id, hash, name, filename, content, description, date, created_at, updated_at FROM documents WHERE {}",
            clause
        );
        let query = sqlx::query(&sql);
        let query = match bind {
            DocumentKey::Id(id) => query.bind(id),
            DocumentKey::Hash(hash) => query.bind(hash),
        };
        match query.fetch_optional(&self.pool).await? {
            Some(row) => Ok(Some(self.load_document(row).await?)),
            None => Ok(None),
        }
    }

    /// Queue (document, step) pairs. A pair that is already queued and
    /// currently running is flagged so its completion keeps it pending.
    async fn enqueue(&self, pairs: &[(i64, ProcessStep)]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().timestamp();
        for (document_id, step) in pairs {
            sqlx::query(
                r#"
                INSERT INTO process_queue (document_id, step, step_order, created_at, running)
                VALUES (?, ?, ?, ?, 0)
                ON CONFLICT(document_id, step) DO UPDATE SET
                    requeued = CASE WHEN running = 1 THEN 1 ELSE requeued END
                "#,
            )
            .bind(document_id)
            .bind(step.as_str())
            .bind(step.ordinal())
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

enum DocumentKey<'a> {
    Id(i64),
    Hash(&'a str),
}

fn from_ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn job_from_row(row: &SqliteRow) -> Result<Job, UnknownValue> {
    let status: String = row.get("status");
    Ok(Job {
        id: row.get("id"),
        document_id: row.get("document_id"),
        message: row.get("message"),
        status: status.parse()?,
        started_at: from_ts(row.get("started_at")),
        stopped_at: from_ts(row.get("stopped_at")),
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<Rule, UnknownValue> {
    let kind: String = row.get("kind");
    let action: String = row.get("action");
    Ok(Rule {
        id: row.get("id"),
        user_id: row.get("user_id"),
        kind: kind.parse::<RuleKind>()?,
        filter: row.get("filter"),
        action: RuleAction::from_columns(
            &action,
            row.get("metadata_key_id"),
            row.get("metadata_value_id"),
            row.get("date_format"),
            row.get("tag_id"),
        )?,
    })
}

type ActionColumns = (
    &'static str,
    Option<i64>,
    Option<i64>,
    Option<String>,
    Option<i64>,
);

fn action_columns(action: &RuleAction) -> ActionColumns {
    match action {
        RuleAction::AddMetadata { key_id, value_id } => {
            (action.tag(), Some(*key_id), Some(*value_id), None, None)
        }
        RuleAction::SetDate { format } => (action.tag(), None, None, Some(format.clone()), None),
        RuleAction::AddTag { tag_id } => (action.tag(), None, None, None, Some(*tag_id)),
        RuleAction::Rename | RuleAction::SetDescription => (action.tag(), None, None, None, None),
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn create(&self, doc: &mut Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            INSERT INTO documents (user_id, hash, name, filename, content, description, date, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(doc.user_id)
        .bind(&doc.hash)
        .bind(&doc.name)
        .bind(&doc.filename)
        .bind(&doc.content)
        .bind(&doc.description)
        .bind(doc.date.timestamp())
        .bind(doc.created_at.timestamp())
        .bind(doc.updated_at.timestamp())
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        for (position, m) in doc.metadata.iter().enumerate() {
            sqlx::query(
                "INSERT INTO document_metadata (document_id, position, key_id, value_id) VALUES (?, ?, ?, ?)",
            )
            .bind(id)
            .bind(position as i64)
            .bind(m.key_id)
            .bind(m.value_id)
            .execute(&mut *tx)
            .await?;
        }
        for (position, tag_id) in doc.tags.iter().enumerate() {
            sqlx::query("INSERT INTO document_tags (document_id, position, tag_id) VALUES (?, ?, ?)")
                .bind(id)
                .bind(position as i64)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        doc.id = id;
        Ok(())
    }

    async fn update(&self, doc: &Document) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE documents SET
                hash = ?, name = ?, filename = ?, content = ?, description = ?,
                date = ?, updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(&doc.hash)
        .bind(&doc.name)
        .bind(&doc.filename)
        .bind(&doc.content)
        .bind(&doc.description)
        .bind(doc.date.timestamp())
        .bind(Utc::now().timestamp())
        .bind(doc.id)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            bail!("document not found: {}", doc.id);
        }

        sqlx::query("DELETE FROM document_metadata WHERE document_id = ?")
            .bind(doc.id)
            .execute(&mut *tx)
            .await?;
        for (position, m) in doc.metadata.iter().enumerate() {
            sqlx::query(
                "INSERT INTO document_metadata (document_id, position, key_id, value_id) VALUES (?, ?, ?, ?)",
            )
            .bind(doc.id)
            .bind(position as i64)
            .bind(m.key_id)
            .bind(m.value_id)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query("DELETE FROM document_tags WHERE document_id = ?")
            .bind(doc.id)
            .execute(&mut *tx)
            .await?;
        for (position, tag_id) in doc.tags.iter().enumerate() {
            sqlx::query("INSERT INTO document_tags (document_id, position, tag_id) VALUES (?, ?, ?)")
                .bind(doc.id)
                .bind(position as i64)
                .bind(tag_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get(&self, id: i64) -> Result<Option<Document>> {
        self.fetch_document("id = ?", DocumentKey::Id(id)).await
    }

    async fn get_by_hash(&self, hash: &str) -> Result<Option<Document>> {
        self.fetch_document("hash = ?", DocumentKey::Hash(hash)).await
    }

    async fn set_content(&self, id: i64, content: &str) -> Result<()> {
        let result = sqlx::query("UPDATE documents SET content = ?, updated_at = ? WHERE id = ?")
            .bind(content)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            bail!("document not found: {}", id);
        }
        Ok(())
    }
}

#[async_trait]
impl ProcessLedger for SqliteStore {
    async fn pending_steps(&self, document_id: i64) -> Result<Vec<ProcessItem>> {
        let rows = sqlx::query(
            "SELECT step, created_at FROM process_queue WHERE document_id = ? ORDER BY step_order ASC, created_at ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut items = Vec::with_capacity(rows.len());
        for row in rows {
            let name: String = row.get("step");
            match name.parse::<ProcessStep>() {
                Ok(step) => items.push(ProcessItem {
                    document_id,
                    step,
                    created_at: from_ts(row.get("created_at")),
                }),
                Err(e) => error!(document_id, "data integrity: {}, skipping", e),
            }
        }
        Ok(items)
    }

    async fn add_steps(&self, document_id: i64, steps: &[ProcessStep]) -> Result<()> {
        let pairs: Vec<(i64, ProcessStep)> = steps.iter().map(|s| (document_id, *s)).collect();
        self.enqueue(&pairs).await
    }

    async fn start_process_item(&self, item: &ProcessItem, label: &str) -> Result<Job> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO process_queue (document_id, step, step_order, created_at, running)
            VALUES (?, ?, ?, ?, 1)
            ON CONFLICT(document_id, step) DO UPDATE SET running = 1, requeued = 0
            "#,
        )
        .bind(item.document_id)
        .bind(item.step.as_str())
        .bind(item.step.ordinal())
        .bind(item.created_at.timestamp())
        .execute(&mut *tx)
        .await?;

        let mut job = Job::new(item.document_id, label);
        let result = sqlx::query(
            "INSERT INTO jobs (document_id, message, status, started_at, stopped_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(job.document_id)
        .bind(&job.message)
        .bind(job.status.as_str())
        .bind(job.started_at.timestamp())
        .bind(job.stopped_at.timestamp())
        .execute(&mut *tx)
        .await?;
        job.id = result.last_insert_rowid();

        tx.commit().await?;
        Ok(job)
    }

    async fn mark_processing_done(&self, item: &ProcessItem, ok: bool) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        if ok {
            // A re-queue that arrived mid-run keeps the step pending.
            sqlx::query(
                "DELETE FROM process_queue WHERE document_id = ? AND step = ? AND requeued = 0",
            )
            .bind(item.document_id)
            .bind(item.step.as_str())
            .execute(&mut *tx)
            .await?;
        }
        sqlx::query(
            "UPDATE process_queue SET running = 0, requeued = 0 WHERE document_id = ? AND step = ?",
        )
        .bind(item.document_id)
        .bind(item.step.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn create_job(&self, document_id: i64, job: &mut Job) -> Result<()> {
        job.document_id = document_id;
        let result = sqlx::query(
            "INSERT INTO jobs (document_id, message, status, started_at, stopped_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(&job.message)
        .bind(job.status.as_str())
        .bind(job.started_at.timestamp())
        .bind(job.stopped_at.timestamp())
        .execute(&self.pool)
        .await?;
        job.id = result.last_insert_rowid();
        Ok(())
    }

    async fn update_job(&self, job: &Job) -> Result<()> {
        let result = sqlx::query(
            "UPDATE jobs SET message = ?, status = ?, started_at = ?, stopped_at = ? WHERE id = ?",
        )
        .bind(&job.message)
        .bind(job.status.as_str())
        .bind(job.started_at.timestamp())
        .bind(job.stopped_at.timestamp())
        .bind(job.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            bail!("job not found: {}", job.id);
        }
        Ok(())
    }

    async fn jobs_for_document(&self, document_id: i64) -> Result<Vec<Job>> {
        let rows = sqlx::query(
            "SELECT id, document_id, message, status, started_at, stopped_at FROM jobs WHERE document_id = ? ORDER BY id ASC",
        )
        .bind(document_id)
        .fetch_all(&self.pool)
        .await?;

        let mut jobs = Vec::with_capacity(rows.len());
        for row in &rows {
            match job_from_row(row) {
                Ok(job) => jobs.push(job),
                Err(e) => error!(document_id, "data integrity: {}, skipping job", e),
            }
        }
        Ok(jobs)
    }

    async fn queue_documents_by_metadata(
        &self,
        user_id: i64,
        key_id: i64,
        value_id: Option<i64>,
        step: ProcessStep,
    ) -> Result<Vec<i64>> {
        let ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT DISTINCT d.id FROM documents d
            JOIN document_metadata m ON m.document_id = d.id
            WHERE d.user_id = ? AND m.key_id = ? AND (? IS NULL OR m.value_id = ?)
            ORDER BY d.id ASC
            "#,
        )
        .bind(user_id)
        .bind(key_id)
        .bind(value_id)
        .bind(value_id)
        .fetch_all(&self.pool)
        .await?;

        let pairs: Vec<(i64, ProcessStep)> = ids.iter().map(|id| (*id, step)).collect();
        self.enqueue(&pairs).await?;
        Ok(ids)
    }

    async fn queue_user_documents(&self, user_id: i64, step: ProcessStep) -> Result<Vec<i64>> {
        let ids: Vec<i64> =
            sqlx::query_scalar("SELECT id FROM documents WHERE user_id = ? ORDER BY id ASC")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;

        let pairs: Vec<(i64, ProcessStep)> = ids.iter().map(|id| (*id, step)).collect();
        self.enqueue(&pairs).await?;
        Ok(ids)
    }
}

#[async_trait]
impl RuleStore for SqliteStore {
    async fn rules_for_user(&self, user_id: i64) -> Result<Vec<Rule>> {
        let rows = sqlx::query(
            r#"
            SELECT id, user_id, kind, filter, action, metadata_key_id, metadata_value_id, date_format, tag_id
            FROM rules WHERE user_id = ? ORDER BY rule_order ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        let mut rules = Vec::with_capacity(rows.len());
        for row in &rows {
            match rule_from_row(row) {
                Ok(rule) => rules.push(rule),
                Err(e) => {
                    let id: i64 = row.get("id");
                    error!(rule_id = id, "data integrity: {}, skipping rule", e);
                }
            }
        }
        Ok(rules)
    }

    async fn replace_rules(&self, user_id: i64, drafts: &[RuleDraft]) -> Result<Vec<Rule>> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now().timestamp();

        sqlx::query("DELETE FROM rules WHERE user_id = ?")
            .bind(user_id)
            .execute(&mut *tx)
            .await?;

        let mut created = Vec::with_capacity(drafts.len());
        for (order, draft) in drafts.iter().enumerate() {
            let (tag, key_id, value_id, date_format, tag_id) = action_columns(&draft.action);
            let result = sqlx::query(
                r#"
                INSERT INTO rules (user_id, rule_order, kind, filter, action,
                                   metadata_key_id, metadata_value_id, date_format, tag_id, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(user_id)
            .bind(order as i64)
            .bind(draft.kind.as_str())
            .bind(&draft.filter)
            .bind(tag)
            .bind(key_id)
            .bind(value_id)
            .bind(date_format)
            .bind(tag_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            created.push(Rule {
                id: result.last_insert_rowid(),
                user_id,
                kind: draft.kind,
                filter: draft.filter.clone(),
                action: draft.action.clone(),
            });
        }

        tx.commit().await?;
        Ok(created)
    }
}
