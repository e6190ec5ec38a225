//! Configuration for the dispatcher.
//!
//! Loaded once at startup from environment variables and an optional TOML
//! pool file, then passed to every component. Nothing else reads the
//! environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use fleet_reconcile::labels::parse_labels;
use fleet_reconcile::{
    validate_pools, Pool, PoolSpec, DEFAULT_POLL_INTERVAL, DEFAULT_TASK_POLL_INTERVAL,
};
use serde::Deserialize;

use crate::error::{DispatchError, DispatchResult};
use crate::hypervisor::ProxmoxConfig;
use crate::queue::GitHubConfig;

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Hypervisor API connection.
    pub proxmox: ProxmoxConfig,

    /// Job queue API connection.
    pub github: GitHubConfig,

    /// Repository URL runners register against.
    pub repo_url: String,

    /// Local directory backing the snippet storage; `None` uploads instead.
    pub snippets_dir: Option<PathBuf>,

    /// Interval between reconciliation cycles.
    pub poll_interval: Duration,

    /// Interval between task status polls.
    pub task_poll_interval: Duration,

    /// Maximum active runners across all pools, 0 for unbounded.
    pub global_cap: u32,

    /// Runner pools in configuration order.
    pub pools: Vec<Pool>,
}

/// Values a pool inherits for every field it leaves out.
#[derive(Debug, Clone)]
pub struct PoolDefaults {
    pub node: String,
    pub template: String,
    pub labels: Vec<String>,
    pub prefix: String,
    pub vmid_start: u32,
    pub vmid_end: u32,
    pub max_runners: u32,
    pub runner_user: String,
    pub user_data_template: PathBuf,
    pub storage: String,
}

/// Pool file contents.
#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolFile {
    #[serde(default)]
    max_total_runners: Option<u32>,
    #[serde(default)]
    pools: Vec<PoolEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PoolEntry {
    name: String,
    node: Option<String>,
    template: Option<String>,
    labels: Option<LabelsField>,
    prefix: Option<String>,
    vmid_range: Option<[u32; 2]>,
    max_runners: Option<u32>,
    runner_user: Option<String>,
    user_data_template: Option<PathBuf>,
    storage: Option<String>,
}

/// Labels may be written as `"a, b"` or `["a", "b"]`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LabelsField {
    Csv(String),
    List(Vec<String>),
}

impl LabelsField {
    fn into_labels(self) -> Vec<String> {
        match self {
            Self::Csv(raw) => parse_labels(&raw),
            Self::List(list) => list,
        }
    }
}

impl PoolEntry {
    fn resolve(self, defaults: &PoolDefaults) -> PoolSpec {
        let [vmid_start, vmid_end] = self
            .vmid_range
            .unwrap_or([defaults.vmid_start, defaults.vmid_end]);
        let name = self.name.trim().to_string();
        let prefix = self
            .prefix
            .unwrap_or_else(|| format!("{}-{}", defaults.prefix, name));

        PoolSpec {
            node: self.node.unwrap_or_else(|| defaults.node.clone()),
            template: self.template.unwrap_or_else(|| defaults.template.clone()),
            labels: self
                .labels
                .map(LabelsField::into_labels)
                .unwrap_or_else(|| defaults.labels.clone()),
            prefix,
            vmid_start,
            vmid_end,
            max_runners: self.max_runners.unwrap_or(defaults.max_runners),
            runner_user: self
                .runner_user
                .unwrap_or_else(|| defaults.runner_user.clone()),
            user_data_template: self
                .user_data_template
                .unwrap_or_else(|| defaults.user_data_template.clone()),
            storage: self.storage.unwrap_or_else(|| defaults.storage.clone()),
            name,
        }
    }
}

/// Build the pool registry.
///
/// With `pool_file` set, pools come from the TOML document; otherwise one
/// pool named `default` is built from `defaults`. `global_cap_override`
/// takes precedence over the file's `max_total_runners`. Returns the global
/// cap and the validated pools.
pub fn load_pools(
    defaults: &PoolDefaults,
    pool_file: Option<&str>,
    global_cap_override: Option<u32>,
) -> DispatchResult<(u32, Vec<Pool>)> {
    let (file_cap, specs) = match pool_file {
        Some(contents) => {
            let file: PoolFile = toml::from_str(contents)
                .map_err(|e| DispatchError::Configuration(format!("invalid pool file: {e}")))?;
            let specs: Vec<PoolSpec> = file
                .pools
                .into_iter()
                .map(|entry| entry.resolve(defaults))
                .collect();
            (file.max_total_runners, specs)
        }
        None => (
            None,
            vec![PoolSpec {
                name: "default".to_string(),
                node: defaults.node.clone(),
                template: defaults.template.clone(),
                labels: defaults.labels.clone(),
                prefix: defaults.prefix.clone(),
                vmid_start: defaults.vmid_start,
                vmid_end: defaults.vmid_end,
                max_runners: defaults.max_runners,
                runner_user: defaults.runner_user.clone(),
                user_data_template: defaults.user_data_template.clone(),
                storage: defaults.storage.clone(),
            }],
        ),
    };

    let pools = specs
        .into_iter()
        .map(Pool::new)
        .collect::<Result<Vec<_>, _>>()?;
    validate_pools(&pools)?;

    let global_cap = global_cap_override.or(file_cap).unwrap_or(0);
    Ok((global_cap, pools))
}

/// Environment variable reader.
struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// A set, non-empty variable.
    fn get(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.is_empty())
    }

    fn required(&self, name: &str) -> DispatchResult<String> {
        self.get(name).ok_or_else(|| {
            DispatchError::Configuration(format!("missing required env var: {name}"))
        })
    }

    fn or(&self, name: &str, default: &str) -> String {
        self.get(name).unwrap_or_else(|| default.to_string())
    }

    fn parse<T: FromStr>(&self, name: &str) -> DispatchResult<Option<T>> {
        self.get(name)
            .map(|v| {
                v.trim().parse().map_err(|_| {
                    DispatchError::Configuration(format!("{name} must be a number, got {v:?}"))
                })
            })
            .transpose()
    }

    fn flag(&self, name: &str) -> bool {
        self.get(name)
            .map(|v| matches!(v.to_lowercase().as_str(), "1" | "true" | "yes"))
            .unwrap_or(false)
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> DispatchResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> DispatchResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env { lookup };

        let timeout = Duration::from_secs(env.parse("HTTP_TIMEOUT")?.unwrap_or(30));

        let proxmox = ProxmoxConfig {
            url: env.required("PROXMOX_URL")?.trim_end_matches('/').to_string(),
            token_id: env.required("PROXMOX_TOKEN_ID")?,
            token_secret: env.required("PROXMOX_TOKEN_SECRET")?,
            verify_ssl: env.flag("PROXMOX_VERIFY_SSL"),
            timeout,
        };
        let node = env.required("PROXMOX_NODE")?;

        let owner = env.or("REPO_OWNER", "NREL");
        let repo = env.or("REPO_NAME", "EnergyPlus");
        let repo_url = env
            .get("REPO_URL")
            .unwrap_or_else(|| format!("https://github.com/{owner}/{repo}"));
        let github = GitHubConfig {
            api_url: env.or("GITHUB_API_URL", "https://api.github.com"),
            owner,
            repo,
            token: env.required("GITHUB_TOKEN")?,
            timeout,
        };

        // Set-but-empty means "upload through the API".
        let snippets_dir = match (env.lookup)("SNIPPETS_DIR") {
            Some(dir) if dir.is_empty() => None,
            Some(dir) => Some(PathBuf::from(dir)),
            None => Some(PathBuf::from("/opt/dispatcher/snippets")),
        };

        let defaults = PoolDefaults {
            node,
            template: env.or("TEMPLATE_NAME", "ubuntu-2404-runner-template"),
            labels: parse_labels(&env.or("RUNNER_LABELS", "energyplus,linux,x64,ubuntu-24.04")),
            prefix: env.or("RUNNER_NAME_PREFIX", "energyplus-runner"),
            vmid_start: env.parse("RUNNER_ID_START")?.unwrap_or(200),
            vmid_end: env.parse("RUNNER_ID_END")?.unwrap_or(299),
            max_runners: env.parse("RUNNER_MAX")?.unwrap_or(0),
            runner_user: env.or("RUNNER_USER", "ci"),
            user_data_template: PathBuf::from(env.or(
                "USER_DATA_TEMPLATE",
                "runners/ubuntu-2404/cloud-init/runner-user-data.pkrtpl",
            )),
            storage: env.or("PROXMOX_STORAGE", "local"),
        };

        let pool_file = env
            .get("RUNNER_POOLS_FILE")
            .map(|path| {
                std::fs::read_to_string(&path).map_err(|e| {
                    DispatchError::Configuration(format!("cannot read pool file {path}: {e}"))
                })
            })
            .transpose()?;
        let (global_cap, pools) = load_pools(
            &defaults,
            pool_file.as_deref(),
            env.parse("MAX_TOTAL_RUNNERS")?,
        )?;

        Ok(Self {
            proxmox,
            github,
            repo_url,
            snippets_dir,
            poll_interval: env
                .parse("POLL_INTERVAL")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_POLL_INTERVAL),
            task_poll_interval: env
                .parse("TASK_POLL_INTERVAL")?
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TASK_POLL_INTERVAL),
            global_cap,
            pools,
        })
    }
}
