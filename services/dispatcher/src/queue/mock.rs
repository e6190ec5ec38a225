//! In-memory job queue for testing and development.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use fleet_reconcile::labels::label_set;
use fleet_reconcile::LabelSet;
use tokio::sync::Mutex;

use super::{JobQueue, RegistrationToken};
use crate::error::{DispatchError, DispatchResult};

/// In-memory [`JobQueue`] holding a fixed list of queued jobs.
#[derive(Default)]
pub struct MockJobQueue {
    jobs: Mutex<Vec<LabelSet>>,
    issued: Mutex<Vec<String>>,
    token_counter: AtomicU64,
    fail_listing: AtomicBool,
    fail_tokens: AtomicBool,
}

impl MockJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue one job requiring `labels`.
    pub async fn push_job(&self, labels: &[&str]) {
        self.jobs.lock().await.push(label_set(labels));
    }

    /// Drop all queued jobs.
    pub async fn clear(&self) {
        self.jobs.lock().await.clear();
    }

    /// Make listing fail.
    pub fn fail_listing(&self, fail: bool) {
        self.fail_listing.store(fail, Ordering::SeqCst);
    }

    /// Make token minting fail.
    pub fn fail_tokens(&self, fail: bool) {
        self.fail_tokens.store(fail, Ordering::SeqCst);
    }

    /// Runner names tokens were minted for, in order.
    pub async fn issued_for(&self) -> Vec<String> {
        self.issued.lock().await.clone()
    }
}

#[async_trait]
impl JobQueue for MockJobQueue {
    async fn queued_job_label_sets(&self) -> DispatchResult<Vec<LabelSet>> {
        if self.fail_listing.load(Ordering::SeqCst) {
            return Err(DispatchError::query("list queued runs", "mock listing failure"));
        }
        Ok(self.jobs.lock().await.clone())
    }

    async fn registration_token(&self, runner_name: &str) -> DispatchResult<RegistrationToken> {
        if self.fail_tokens.load(Ordering::SeqCst) {
            return Err(DispatchError::Api {
                status: 403,
                message: "mock token failure".to_string(),
            });
        }
        self.issued.lock().await.push(runner_name.to_string());
        let n = self.token_counter.fetch_add(1, Ordering::SeqCst);
        Ok(RegistrationToken {
            token: format!("mock-token-{n}"),
            expires_at: None,
        })
    }
}
