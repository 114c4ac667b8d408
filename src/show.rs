//! Document inspection for `shelf show`.
//!
//! Collects a document, its pending steps and its job audit trail.

use anyhow::{bail, Result};
use serde::Serialize;

use crate::models::{Document, Job, ProcessStep};
use crate::store::Stores;

#[derive(Debug, Clone, Serialize)]
pub struct DocumentReport {
    pub document: Document,
    pub pending: Vec<ProcessStep>,
    pub jobs: Vec<Job>,
}

pub async fn document_report(stores: &Stores, id: i64) -> Result<DocumentReport> {
    let Some(document) = stores.documents.get(id).await? else {
        bail!("document not found: {}", id);
    };
    let pending = stores
        .ledger
        .pending_steps(id)
        .await?
        .into_iter()
        .map(|item| item.step)
        .collect();
    let jobs = stores.ledger.jobs_for_document(id).await?;

    Ok(DocumentReport {
        document,
        pending,
        jobs,
    })
}

/// CLI entry point: prints the report as text or JSON to stdout.
pub async fn run_show(stores: &Stores, id: i64, json: bool) -> Result<()> {
    let report = document_report(stores, id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let doc = &report.document;
    println!("--- Document ---");
    println!("id:          {}", doc.id);
    println!("user:        {}", doc.user_id);
    println!("name:        {}", doc.name);
    println!("filename:    {}", doc.filename);
    println!("hash:        {}", doc.hash);
    println!("date:        {}", format_ts_iso(doc.date));
    println!("created_at:  {}", format_ts_iso(doc.created_at));
    println!("updated_at:  {}", format_ts_iso(doc.updated_at));
    if !doc.metadata.is_empty() {
        let pairs: Vec<String> = doc
            .metadata
            .iter()
            .map(|m| format!("{}={}", m.key_id, m.value_id))
            .collect();
        println!("metadata:    {}", pairs.join(", "));
    }
    if !doc.tags.is_empty() {
        let tags: Vec<String> = doc.tags.iter().map(|t| t.to_string()).collect();
        println!("tags:        {}", tags.join(", "));
    }
    if !doc.description.is_empty() {
        println!("description: {}", doc.description);
    }
    println!();

    if report.pending.is_empty() {
        println!("--- Pending steps: none ---");
    } else {
        let steps: Vec<&str> = report.pending.iter().map(|s| s.as_str()).collect();
        println!("--- Pending steps: {} ---", steps.join(", "));
    }
    println!();

    println!("--- Jobs ({}) ---", report.jobs.len());
    for job in &report.jobs {
        println!(
            "[{}] {:<8} {}  {}",
            job.id,
            job.status.as_str(),
            format_ts_iso(job.started_at),
            job.message
        );
    }
    println!();

    println!("--- Content ---");
    if doc.has_content() {
        println!("{}", doc.content);
    } else {
        println!("(no content yet)");
    }

    Ok(())
}

fn format_ts_iso(ts: chrono::DateTime<chrono::Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::NEW_DOCUMENT_STEPS;
    use crate::store::memory::InMemoryStore;
    use crate::store::{DocumentStore, ProcessLedger};
    use std::sync::Arc;

    #[tokio::test]
    async fn report_includes_ledger_state() {
        let backend = Arc::new(InMemoryStore::new());
        let mut doc = Document::new(1, "scan.pdf", "abc");
        backend.create(&mut doc).await.unwrap();
        backend.add_steps(doc.id, &NEW_DOCUMENT_STEPS).await.unwrap();
        let mut job = Job::new(doc.id, "extract text");
        backend.create_job(doc.id, &mut job).await.unwrap();

        let stores = Stores::from_backend(backend);
        let report = document_report(&stores, doc.id).await.unwrap();
        assert_eq!(report.pending, NEW_DOCUMENT_STEPS.to_vec());
        assert_eq!(report.jobs.len(), 1);

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["document"]["hash"], "abc");
        assert_eq!(json["pending"][0], "thumbnail");
    }

    #[tokio::test]
    async fn missing_document_is_an_error() {
        let stores = Stores::from_backend(Arc::new(InMemoryStore::new()));
        assert!(document_report(&stores, 42).await.is_err());
    }
}
