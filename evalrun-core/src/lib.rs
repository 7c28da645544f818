//! # evalrun-core
//!
//! Orchestration core for long-running, multi-stage evaluation runs.
//!
//! A run starts PENDING with one probe unit per (provider, model, scenario).
//! Probe jobs go onto one queue per provider and execute under that
//! provider's concurrency and rate limits. Each reported outcome is counted
//! by the progress ledger, which moves the run through
//! RUNNING and SUMMARIZING to COMPLETED and dispatches the summarize stage.
//! A recovery sweep re-enqueues work for runs whose jobs were lost.
//!
//! ## Feature Flags
//!
//! - `database` (default): PostgreSQL run store, job queue, and provider
//!   limits source via SQLx
//! - `pg-tests`: Postgres-backed integration tests
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use evalrun_core::orchestration::{InMemoryJobQueue, OrchestratorConfig, RunOrchestrator};
//! use evalrun_core::persistence::InMemoryRunStore;
//! use evalrun_core::types::{ProbeJob, ProbeUnit};
//!
//! async fn run() -> evalrun_core::Result<()> {
//!     let orchestrator = RunOrchestrator::builder(OrchestratorConfig::default())
//!         .with_store(Arc::new(InMemoryRunStore::new()))
//!         .with_queue(Arc::new(InMemoryJobQueue::new()))
//!         .build()?;
//!     orchestrator.register_handlers().await?;
//!
//!     let units = vec![ProbeUnit::new("openai", "gpt-4o", "scenario-1")];
//!     let run = orchestrator.create_run(units.clone()).await?;
//!     let jobs: Vec<ProbeJob> = units
//!         .iter()
//!         .map(|unit| ProbeJob::for_unit(run.id, unit))
//!         .collect();
//!     orchestrator.start_run_dispatch(run.id, &jobs).await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod error;
pub mod orchestration;
pub mod persistence;
pub mod types;

pub use error::{OrchestratorError, Result};

/// Embedded schema migrations for the PostgreSQL backend.
#[cfg(feature = "database")]
pub static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations");
