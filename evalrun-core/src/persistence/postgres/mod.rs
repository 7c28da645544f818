//! PostgreSQL implementations of the storage and queue seams.

mod job_queue;
mod provider_limits;
mod run_store;

pub use job_queue::{ExpiredJobs, PostgresJobQueue};
pub use provider_limits::PostgresProviderLimits;
pub use run_store::PostgresRunStore;

use crate::error::{OrchestratorError, Result};

pub(crate) fn to_db_count(value: u32) -> Result<i32> {
    i32::try_from(value)
        .map_err(|_| OrchestratorError::Internal(format!("count {value} exceeds column range")))
}

pub(crate) fn from_db_count(value: i32) -> u32 {
    u32::try_from(value.max(0)).unwrap_or(0)
}
