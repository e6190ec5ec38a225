//! Job queue interface.
//!
//! The dispatcher only needs two things from the CI job queue: the label sets
//! of every currently queued job, and a fresh runner registration credential.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_reconcile::LabelSet;

use crate::error::DispatchResult;

mod github;
mod mock;

pub use github::{GitHubClient, GitHubConfig};
pub use mock::MockJobQueue;

/// Short-lived credential a new runner uses to register itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationToken {
    pub token: String,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Job queue operations the dispatcher depends on.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Label sets of all jobs currently queued, one entry per job.
    ///
    /// Fails if any page of the listing fails; partial demand is never
    /// returned.
    async fn queued_job_label_sets(&self) -> DispatchResult<Vec<LabelSet>>;

    /// Mint a registration credential for the runner `runner_name`.
    async fn registration_token(&self, runner_name: &str) -> DispatchResult<RegistrationToken>;
}
