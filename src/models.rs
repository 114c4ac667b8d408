//! Core data models used throughout scanshelf.
//!
//! These types represent the documents, pipeline ledger records, and
//! classification rules that flow through the processing pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A persisted value that does not map onto any known variant.
///
/// Raised when decoding ledger or rule rows. Treated as a data-integrity
/// problem: the offending row is logged and left out.
#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownValue {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownValue {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// A metadata key/value reference attached to a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Metadata {
    pub key_id: i64,
    pub value_id: i64,
}

/// A scanned document. The long-lived aggregate of the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: i64,
    pub user_id: i64,
    /// Content hash; also the file name under the documents directory.
    pub hash: String,
    pub name: String,
    pub filename: String,
    /// Extracted text. Empty until content parsing succeeds.
    pub content: String,
    pub description: String,
    pub date: DateTime<Utc>,
    pub metadata: Vec<Metadata>,
    pub tags: Vec<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    /// A fresh, not yet persisted document with no content.
    pub fn new(user_id: i64, filename: &str, hash: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            user_id,
            hash: hash.to_string(),
            name: filename.to_string(),
            filename: filename.to_string(),
            content: String::new(),
            description: String::new(),
            date: now,
            metadata: Vec::new(),
            tags: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn has_content(&self) -> bool {
        !self.content.trim().is_empty()
    }
}

/// A pipeline step. Ordering of the variants is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessStep {
    Hash,
    Thumbnail,
    #[serde(rename = "content")]
    ParseContent,
    #[serde(rename = "rules")]
    ApplyRules,
}

/// Steps seeded into the ledger when a new document is created.
/// The hash is computed during ingestion and is never queued for new files.
pub const NEW_DOCUMENT_STEPS: [ProcessStep; 3] = [
    ProcessStep::Thumbnail,
    ProcessStep::ParseContent,
    ProcessStep::ApplyRules,
];

impl ProcessStep {
    pub const ALL: [ProcessStep; 4] = [
        ProcessStep::Hash,
        ProcessStep::Thumbnail,
        ProcessStep::ParseContent,
        ProcessStep::ApplyRules,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessStep::Hash => "hash",
            ProcessStep::Thumbnail => "thumbnail",
            ProcessStep::ParseContent => "content",
            ProcessStep::ApplyRules => "rules",
        }
    }

    /// Position used to order pending steps in the ledger.
    pub fn ordinal(&self) -> i64 {
        *self as i64
    }

    /// Step that must succeed earlier in the same run before this one runs.
    pub fn prerequisite(&self) -> Option<ProcessStep> {
        match self {
            ProcessStep::ApplyRules => Some(ProcessStep::ParseContent),
            _ => None,
        }
    }

    /// Audit label written to the step's job record.
    pub fn label(&self) -> &'static str {
        match self {
            ProcessStep::Hash => "calculate hash",
            ProcessStep::Thumbnail => "generate thumbnail",
            ProcessStep::ParseContent => "parse content",
            ProcessStep::ApplyRules => "apply rules",
        }
    }
}

impl fmt::Display for ProcessStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessStep {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProcessStep::ALL
            .into_iter()
            .find(|step| step.as_str() == s)
            .ok_or_else(|| UnknownValue::new("process step", s))
    }
}

/// One pending (or attempted) pipeline step for a document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessItem {
    pub document_id: i64,
    pub step: ProcessStep,
    pub created_at: DateTime<Utc>,
}

impl ProcessItem {
    pub fn new(document_id: i64, step: ProcessStep) -> Self {
        Self {
            document_id,
            step,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Awaiting,
    Finished,
    Failure,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Awaiting => "awaiting",
            JobStatus::Finished => "finished",
            JobStatus::Failure => "failure",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "awaiting" => Ok(JobStatus::Awaiting),
            "finished" => Ok(JobStatus::Finished),
            "failure" => Ok(JobStatus::Failure),
            other => Err(UnknownValue::new("job status", other)),
        }
    }
}

/// Audit record of one unit of work. Several may exist per step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub document_id: i64,
    pub message: String,
    pub status: JobStatus,
    pub started_at: DateTime<Utc>,
    pub stopped_at: DateTime<Utc>,
}

impl Job {
    pub fn new(document_id: i64, message: &str) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            document_id,
            message: message.to_string(),
            status: JobStatus::Awaiting,
            started_at: now,
            stopped_at: now,
        }
    }

    /// Extend the message narrative; earlier text is kept.
    pub fn append(&mut self, text: &str) {
        if self.message.is_empty() {
            self.message = text.to_string();
        } else {
            self.message.push_str("; ");
            self.message.push_str(text);
        }
    }

    pub fn finish(&mut self) {
        self.status = JobStatus::Finished;
    }

    pub fn fail(&mut self, reason: &str) {
        self.status = JobStatus::Failure;
        self.append(reason);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    Exact,
    Regex,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Exact => "exact",
            RuleKind::Regex => "regex",
        }
    }
}

impl FromStr for RuleKind {
    type Err = UnknownValue;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "exact" => Ok(RuleKind::Exact),
            "regex" => Ok(RuleKind::Regex),
            other => Err(UnknownValue::new("rule type", other)),
        }
    }
}

/// What a matching rule does to the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    AddMetadata { key_id: i64, value_id: i64 },
    Rename,
    SetDate { format: String },
    AddTag { tag_id: i64 },
    SetDescription,
}

impl RuleAction {
    pub fn tag(&self) -> &'static str {
        match self {
            RuleAction::AddMetadata { .. } => "add_metadata",
            RuleAction::Rename => "rename",
            RuleAction::SetDate { .. } => "set_date",
            RuleAction::AddTag { .. } => "add_tag",
            RuleAction::SetDescription => "set_description",
        }
    }

    /// Rebuild an action from its flattened storage columns.
    pub fn from_columns(
        tag: &str,
        key_id: Option<i64>,
        value_id: Option<i64>,
        date_format: Option<String>,
        tag_id: Option<i64>,
    ) -> Result<Self, UnknownValue> {
        let missing = |field: &str| UnknownValue::new("action payload", &format!("{tag}.{field}"));
        match tag {
            "add_metadata" => Ok(RuleAction::AddMetadata {
                key_id: key_id.ok_or_else(|| missing("key_id"))?,
                value_id: value_id.ok_or_else(|| missing("value_id"))?,
            }),
            "rename" => Ok(RuleAction::Rename),
            "set_date" => Ok(RuleAction::SetDate {
                format: date_format.ok_or_else(|| missing("format"))?,
            }),
            "add_tag" => Ok(RuleAction::AddTag {
                tag_id: tag_id.ok_or_else(|| missing("tag_id"))?,
            }),
            "set_description" => Ok(RuleAction::SetDescription),
            other => Err(UnknownValue::new("rule action", other)),
        }
    }
}

/// A user-defined filter plus the action applied on match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub id: i64,
    pub user_id: i64,
    pub kind: RuleKind,
    pub filter: String,
    pub action: RuleAction,
}

/// A rule as authored by a user, before it is assigned an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDraft {
    pub kind: RuleKind,
    pub filter: String,
    #[serde(flatten)]
    pub action: RuleAction,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_names_round_trip_through_storage_form() {
        for step in ProcessStep::ALL {
            assert_eq!(step.as_str().parse::<ProcessStep>().unwrap(), step);
        }
    }

    #[test]
    fn unknown_step_is_rejected() {
        let err = "fts".parse::<ProcessStep>().unwrap_err();
        assert_eq!(err.kind, "process step");
        assert!(err.to_string().contains("fts"));
    }

    #[test]
    fn steps_order_by_pipeline_position() {
        let mut steps = vec![
            ProcessStep::ApplyRules,
            ProcessStep::Hash,
            ProcessStep::ParseContent,
            ProcessStep::Thumbnail,
        ];
        steps.sort();
        assert_eq!(steps, ProcessStep::ALL.to_vec());
    }

    #[test]
    fn job_messages_accumulate() {
        let mut job = Job::new(1, "render page");
        job.fail("convert exited with 1");
        assert_eq!(job.status, JobStatus::Failure);
        assert_eq!(job.message, "render page; convert exited with 1");
    }

    #[test]
    fn action_columns_require_payload() {
        let err = RuleAction::from_columns("add_tag", None, None, None, None).unwrap_err();
        assert!(err.to_string().contains("add_tag.tag_id"));

        let err = RuleAction::from_columns("delete", None, None, None, None).unwrap_err();
        assert_eq!(err.kind, "rule action");
    }
}
