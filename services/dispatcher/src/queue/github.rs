//! GitHub Actions job queue client.
//!
//! Demand is read from the repository's queued workflow runs. A run can be
//! queued while only some of its jobs are, so each run's jobs are listed and
//! filtered individually.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use fleet_reconcile::labels::label_set;
use fleet_reconcile::LabelSet;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error};

use super::{JobQueue, RegistrationToken};
use crate::error::{DispatchError, DispatchResult};

const PER_PAGE: usize = 100;
const API_VERSION: &str = "2022-11-28";

/// GitHub API settings.
#[derive(Debug, Clone)]
pub struct GitHubConfig {
    /// API base URL (`https://api.github.com`).
    pub api_url: String,
    pub owner: String,
    pub repo: String,
    pub token: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// GitHub Actions API client.
pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    owner: String,
    repo: String,
    token: String,
}

#[derive(Deserialize)]
struct RunsPage {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    workflow_runs: Vec<WorkflowRun>,
}

#[derive(Deserialize)]
struct WorkflowRun {
    id: u64,
}

#[derive(Deserialize)]
struct JobsPage {
    #[serde(default)]
    total_count: usize,
    #[serde(default)]
    jobs: Vec<WorkflowJob>,
}

#[derive(Deserialize)]
struct WorkflowJob {
    id: u64,
    status: String,
    #[serde(default)]
    labels: Vec<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    #[serde(default)]
    expires_at: Option<DateTime<Utc>>,
}

impl GitHubClient {
    /// Create a new client.
    pub fn new(config: &GitHubConfig) -> DispatchResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("fleet-dispatcher/", env!("CARGO_PKG_VERSION")))
            .build()?;

        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            owner: config.owner.clone(),
            repo: config.repo.clone(),
            token: config.token.clone(),
        })
    }

    fn repo_url(&self, path: &str) -> String {
        format!("{}/repos/{}/{}{}", self.api_url, self.owner, self.repo, path)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header("Accept", "application/vnd.github+json")
            .header("Authorization", format!("Bearer {}", self.token))
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn get_page<T: DeserializeOwned>(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> DispatchResult<T> {
        let response = self
            .authorized(self.client.get(url))
            .query(query)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, url = url, body = %body, "GitHub API request failed");
            return Err(DispatchError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        Ok(response.json().await?)
    }

    /// IDs of all queued workflow runs.
    async fn queued_run_ids(&self) -> DispatchResult<Vec<u64>> {
        let url = self.repo_url("/actions/runs");
        let mut ids = Vec::new();

        for page in 1.. {
            let query = [
                ("status", "queued".to_string()),
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let body: RunsPage = self.get_page(&url, &query).await?;
            let fetched = body.workflow_runs.len();
            ids.extend(body.workflow_runs.into_iter().map(|r| r.id));

            if fetched < PER_PAGE || ids.len() >= body.total_count {
                break;
            }
        }

        Ok(ids)
    }

    /// Label sets of the queued jobs of one run.
    async fn queued_jobs_of_run(&self, run_id: u64) -> DispatchResult<Vec<LabelSet>> {
        let url = self.repo_url(&format!("/actions/runs/{run_id}/jobs"));
        let mut seen = 0;
        let mut label_sets = Vec::new();

        for page in 1.. {
            let query = [
                ("per_page", PER_PAGE.to_string()),
                ("page", page.to_string()),
            ];
            let body: JobsPage = self.get_page(&url, &query).await?;
            let fetched = body.jobs.len();
            seen += fetched;

            for job in body.jobs.into_iter().filter(|j| j.status == "queued") {
                debug!(run_id, job_id = job.id, labels = ?job.labels, "Queued job");
                label_sets.push(label_set(&job.labels));
            }

            if fetched < PER_PAGE || seen >= body.total_count {
                break;
            }
        }

        Ok(label_sets)
    }
}

#[async_trait]
impl JobQueue for GitHubClient {
    async fn queued_job_label_sets(&self) -> DispatchResult<Vec<LabelSet>> {
        let run_ids = self
            .queued_run_ids()
            .await
            .map_err(|e| DispatchError::query("list queued runs", e))?;

        let mut label_sets = Vec::new();
        for run_id in run_ids {
            let jobs = self
                .queued_jobs_of_run(run_id)
                .await
                .map_err(|e| DispatchError::query(format!("list jobs of run {run_id}"), e))?;
            label_sets.extend(jobs);
        }

        Ok(label_sets)
    }

    async fn registration_token(&self, runner_name: &str) -> DispatchResult<RegistrationToken> {
        let url = self.repo_url("/actions/runners/registration-token");
        debug!(runner = runner_name, "Requesting runner registration token");

        let response = self.authorized(self.client.post(&url)).send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            error!(status = %status, body = %body, "Failed to mint registration token");
            return Err(DispatchError::Api {
                status: status.as_u16(),
                message: body,
            });
        }

        let body: TokenResponse = response.json().await?;
        Ok(RegistrationToken {
            token: body.token,
            expires_at: body.expires_at,
        })
    }
}
