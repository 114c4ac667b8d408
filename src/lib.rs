//! # scanshelf
//!
//! Ingestion and classification pipeline for scanned paper documents.
//!
//! Files are deduplicated by content hash, stored under that hash, and
//! driven through a per-document sequence of steps (thumbnail, text
//! extraction, rule application). Each step's progress lives in a ledger,
//! so a document whose run failed part-way can be re-driven later and only
//! its outstanding steps are attempted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────┐   ┌───────────────┐   ┌──────────┐
//! │ CLI/inbox│──▶│ Pool (tasks) │──▶│ FileProcessor │──▶│  SQLite  │
//! └──────────┘   └──────────────┘   └──────┬────────┘   └──────────┘
//!                                          │
//!                               ┌──────────┴─────────┐
//!                               ▼                    ▼
//!                         ┌───────────┐        ┌───────────┐
//!                         │ Extractor │        │   Rules   │
//!                         │ (convert, │        │ (exact /  │
//!                         │ tesseract)│        │  regex)   │
//!                         └───────────┘        └───────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! shelf init                          # create database and storage dirs
//! shelf ingest ~/scans/invoice.pdf    # ingest one file
//! shelf scan                          # ingest everything in the inbox
//! shelf show 1                        # inspect a document and its jobs
//! shelf reprocess 1                   # retry whatever is still pending
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Documents, pipeline steps, jobs, rules |
//! | [`hash`] | Streaming content hashing |
//! | [`store`] | Storage traits with SQLite and in-memory backends |
//! | [`extract`] | Thumbnail, rasterize and OCR capability |
//! | [`rules`] | Rule matching and actions |
//! | [`task`] | Idle/busy task loop |
//! | [`inflight`] | Single-flight registry |
//! | [`processor`] | The pipeline engine |
//! | [`pool`] | Worker pool |
//! | [`inbox`] | Inbox directory scanning |
//! | [`show`] | Document inspection |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod extract;
pub mod hash;
pub mod inbox;
pub mod inflight;
pub mod migrate;
pub mod models;
pub mod pool;
pub mod processor;
pub mod rules;
pub mod show;
pub mod store;
pub mod task;
