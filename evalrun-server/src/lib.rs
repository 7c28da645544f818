//! Service wiring for the evaluation run orchestrator: configuration
//! loading, Postgres-backed runtime assembly, and worker-process executors.

pub mod infra;
