//! Reconciliation loop for sizing the runner fleet.
//!
//! Each cycle runs strictly in order:
//!
//! ```text
//! gather inventory -> reclaim stopped -> collect demand -> plan -> provision
//! ```
//!
//! Gathering inventory and collecting demand are cycle-wide: a failure there
//! aborts the cycle. Reclaim and provisioning failures are scoped to one
//! instance or pool and are logged without stopping the rest of the cycle.
//! Nothing is retried within a cycle; the poll interval is the retry.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_reconcile::{assign_demand, plan, Pool, StartPlan, Vmid};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::bootconfig::SnippetPublisher;
use crate::config::Config;
use crate::error::DispatchResult;
use crate::hypervisor::Hypervisor;
use crate::inventory::{Instance, InstanceStatus, Inventory};
use crate::provisioner::Provisioner;
use crate::queue::JobQueue;
use crate::reclaimer::Reclaimer;
use crate::task::TaskWaiter;

/// Dispatcher loop configuration.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Runner pools in provisioning order.
    pub pools: Vec<Pool>,

    /// Fleet-wide active cap, 0 for unbounded.
    pub global_cap: u32,

    /// Interval between cycles.
    pub poll_interval: Duration,

    /// Interval between task status polls.
    pub task_poll_interval: Duration,

    /// Local snippet directory; `None` uploads through the hypervisor.
    pub snippets_dir: Option<PathBuf>,

    /// Repository runners register against.
    pub repo_url: String,
}

impl From<&Config> for DispatcherConfig {
    fn from(config: &Config) -> Self {
        Self {
            pools: config.pools.clone(),
            global_cap: config.global_cap,
            poll_interval: config.poll_interval,
            task_poll_interval: config.task_poll_interval,
            snippets_dir: config.snippets_dir.clone(),
            repo_url: config.repo_url.clone(),
        }
    }
}

/// What one cycle observed and did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// `(node, vmid)` of reclaimed instances.
    pub reclaimed: Vec<(String, Vmid)>,
    pub reclaim_failures: usize,
    /// Queued jobs seen this cycle.
    pub queued_jobs: usize,
    /// Queued jobs no pool can run.
    pub unmatched_jobs: usize,
    pub planned: StartPlan,
    /// `(pool, vmid)` of runners started this cycle.
    pub started: Vec<(String, Vmid)>,
    /// Pools whose provisioning stopped on an error.
    pub failed_pools: Vec<String>,
}

impl CycleReport {
    /// Runners started for `pool`.
    pub fn started_in(&self, pool: &str) -> usize {
        self.started.iter().filter(|(p, _)| p == pool).count()
    }
}

/// Keeps the runner fleet sized to queued work.
pub struct Dispatcher {
    config: DispatcherConfig,
    hypervisor: Arc<dyn Hypervisor>,
    queue: Arc<dyn JobQueue>,
    reclaimer: Reclaimer,
    provisioner: Provisioner,
}

impl Dispatcher {
    /// Create a dispatcher over the given collaborators.
    pub fn new(
        config: DispatcherConfig,
        hypervisor: Arc<dyn Hypervisor>,
        queue: Arc<dyn JobQueue>,
    ) -> Self {
        let waiter = TaskWaiter::new(Arc::clone(&hypervisor), config.task_poll_interval);
        let reclaimer = Reclaimer::new(Arc::clone(&hypervisor), waiter.clone());
        let publisher = SnippetPublisher::new(
            config.snippets_dir.clone(),
            Arc::clone(&hypervisor),
            waiter.clone(),
        );
        let provisioner = Provisioner::new(
            Arc::clone(&hypervisor),
            Arc::clone(&queue),
            waiter,
            publisher,
            config.repo_url.clone(),
        );

        Self {
            config,
            hypervisor,
            queue,
            reclaimer,
            provisioner,
        }
    }

    /// The validated pool registry, in configuration order.
    pub fn pools(&self) -> &[Pool] {
        &self.config.pools
    }

    /// Run cycles until `shutdown` flips to true.
    ///
    /// Shutdown is observed between cycles; a cycle in progress always
    /// finishes.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            pools = self.config.pools.len(),
            global_cap = self.config.global_cap,
            poll_interval_secs = self.config.poll_interval.as_secs(),
            "Starting dispatcher loop"
        );

        loop {
            if let Err(e) = self.run_cycle().await {
                warn!(reason = e.reason_code(), error = %e, "Cycle aborted, will retry");
            }

            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Dispatcher loop stopped");
    }

    /// Perform one full cycle.
    pub async fn run_cycle(&self) -> DispatchResult<CycleReport> {
        let pools = self.config.pools.as_slice();
        let mut report = CycleReport::default();

        let mut inventory = Inventory::gather(self.hypervisor.as_ref(), pools).await?;
        debug!(instances = inventory.instance_count(), "Gathered inventory");

        let reclaim = self.reclaimer.reclaim_stopped(pools, &mut inventory).await;
        report.reclaimed = reclaim.reclaimed;
        report.reclaim_failures = reclaim.failed;

        for pool in pools {
            for instance in inventory.unsettled(pool) {
                warn!(
                    pool = pool.name(),
                    vmid = %instance.vmid,
                    name = %instance.name,
                    status = %instance.status,
                    "Runner is neither active nor stopped"
                );
            }
        }

        let jobs = self.queue.queued_job_label_sets().await?;
        report.queued_jobs = jobs.len();
        if jobs.is_empty() {
            debug!("No queued jobs");
            return Ok(report);
        }

        let demand = assign_demand(pools, &jobs);
        report.unmatched_jobs = demand.unmatched();
        if demand.unmatched() > 0 {
            warn!(count = demand.unmatched(), "Queued jobs match no pool");
        }

        let active = inventory.active_by_pool(pools);
        let planned = plan(pools, &active, demand.by_pool(), self.config.global_cap);
        debug!(
            queued = jobs.len(),
            demand = demand.total(),
            planned = planned.total(),
            "Planned starts"
        );

        self.provision(&planned, &active, &mut inventory, &mut report)
            .await;
        report.planned = planned;

        info!(
            queued = report.queued_jobs,
            reclaimed = report.reclaimed.len(),
            started = report.started.len(),
            failed_pools = report.failed_pools.len(),
            "Cycle complete"
        );
        Ok(report)
    }

    /// Start the planned runners, pool by pool in configuration order.
    async fn provision(
        &self,
        planned: &StartPlan,
        active: &HashMap<String, u32>,
        inventory: &mut Inventory,
        report: &mut CycleReport,
    ) {
        let global_cap = self.config.global_cap;
        let mut remaining_global = (global_cap > 0)
            .then(|| global_cap.saturating_sub(active.values().sum::<u32>()));
        let mut vmids_by_node: HashMap<String, BTreeSet<Vmid>> = HashMap::new();

        for pool in &self.config.pools {
            let count = planned.get(pool.name());
            if count == 0 {
                continue;
            }

            let existing = vmids_by_node
                .entry(pool.node().to_string())
                .or_insert_with(|| inventory.vmids(pool.node()));

            for _ in 0..count {
                if remaining_global == Some(0) {
                    return;
                }

                match self.provisioner.start(pool, inventory, existing).await {
                    Ok(vmid) => {
                        inventory.insert(Instance {
                            node: pool.node().to_string(),
                            vmid,
                            name: pool.instance_name(vmid),
                            status: InstanceStatus::Running,
                            template: false,
                        });
                        report.started.push((pool.name().to_string(), vmid));
                        remaining_global = remaining_global.map(|r| r - 1);
                    }
                    Err(e) => {
                        error!(
                            pool = pool.name(),
                            node = pool.node(),
                            reason = e.reason_code(),
                            error = %e,
                            "Provisioning failed"
                        );
                        report.failed_pools.push(pool.name().to_string());
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::{HypervisorCall, MockHypervisor, Operation};
    use crate::queue::MockJobQueue;
    use fleet_reconcile::PoolSpec;

    const TEMPLATE: &str = "#cloud-config\nrunner: $runner_name\ntoken: $registration_token\n";

    struct Harness {
        hv: Arc<MockHypervisor>,
        queue: Arc<MockJobQueue>,
        dispatcher: Dispatcher,
        _dir: tempfile::TempDir,
    }

    async fn harness(pools: &[(&str, &[&str], u32, (u32, u32))], global_cap: u32) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("user-data.tpl");
        std::fs::write(&template_path, TEMPLATE).unwrap();

        let pools = pools
            .iter()
            .map(|(name, labels, max, (start, end))| {
                Pool::new(PoolSpec {
                    name: name.to_string(),
                    node: "pve".to_string(),
                    template: "runner-template".to_string(),
                    labels: labels.iter().map(|l| l.to_string()).collect(),
                    prefix: format!("runner-{name}"),
                    vmid_start: *start,
                    vmid_end: *end,
                    max_runners: *max,
                    user_data_template: template_path.clone(),
                    storage: "local".to_string(),
                    runner_user: "ci".to_string(),
                })
                .unwrap()
            })
            .collect();

        let hv = Arc::new(MockHypervisor::new());
        hv.add_template("pve", 9000, "runner-template").await;
        let queue = Arc::new(MockJobQueue::new());
        let config = DispatcherConfig {
            pools,
            global_cap,
            poll_interval: Duration::from_secs(15),
            task_poll_interval: Duration::from_millis(10),
            snippets_dir: None,
            repo_url: "https://github.com/NREL/EnergyPlus".to_string(),
        };
        let dispatcher = Dispatcher::new(config, hv.clone(), queue.clone());

        Harness {
            hv,
            queue,
            dispatcher,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_no_demand_starts_nothing() {
        let h = harness(&[("small", &["linux"], 0, (200, 209))], 0).await;
        let report = h.dispatcher.run_cycle().await.unwrap();
        assert_eq!(report, CycleReport::default());
        assert!(h.queue.issued_for().await.is_empty());
    }

    #[tokio::test]
    async fn test_pool_cap_limits_starts() {
        let h = harness(&[("small", &["linux", "x64"], 2, (200, 209))], 0).await;
        for _ in 0..3 {
            h.queue.push_job(&["linux", "x64"]).await;
        }

        let report = h.dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.planned.get("small"), 2);
        assert_eq!(
            report.started,
            vec![
                ("small".to_string(), Vmid::new(200)),
                ("small".to_string(), Vmid::new(201)),
            ]
        );
    }

    #[tokio::test]
    async fn test_demand_failure_aborts_cycle() {
        let h = harness(&[("small", &["linux"], 0, (200, 209))], 0).await;
        h.hv.add_instance("pve", 204, "runner-small-204", "stopped").await;
        h.queue.fail_listing(true);

        let err = h.dispatcher.run_cycle().await.unwrap_err();
        assert_eq!(err.reason_code(), "transient_query_error");
        // Reclaim precedes demand collection.
        assert!(h
            .hv
            .calls()
            .await
            .contains(&HypervisorCall::Delete { vmid: Vmid::new(204) }));
        assert!(!h
            .hv
            .calls()
            .await
            .iter()
            .any(|c| matches!(c, HypervisorCall::Clone { .. })));
    }

    #[tokio::test]
    async fn test_inventory_failure_aborts_cycle() {
        let h = harness(&[("small", &["linux"], 0, (200, 209))], 0).await;
        h.queue.push_job(&["linux"]).await;
        h.hv.fail_requests(Operation::List).await;

        let err = h.dispatcher.run_cycle().await.unwrap_err();
        assert_eq!(err.reason_code(), "transient_query_error");
        assert!(h.queue.issued_for().await.is_empty());
    }

    #[tokio::test]
    async fn test_reclaimed_vmid_is_reused_same_cycle() {
        let h = harness(&[("small", &["linux"], 0, (200, 201))], 0).await;
        h.hv.add_instance("pve", 200, "runner-small-200", "stopped").await;
        h.hv.add_instance("pve", 201, "runner-small-201", "running").await;
        h.queue.push_job(&["linux"]).await;
        h.queue.push_job(&["linux"]).await;

        let report = h.dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.reclaimed, vec![("pve".to_string(), Vmid::new(200))]);
        assert_eq!(report.started, vec![("small".to_string(), Vmid::new(200))]);
    }

    #[tokio::test]
    async fn test_failed_pool_does_not_block_others() {
        let h = harness(
            &[
                ("small", &["linux"], 0, (200, 200)),
                ("gpu", &["linux", "gpu"], 0, (300, 309)),
            ],
            0,
        )
        .await;
        // Exhaust the small pool's only VMID with a foreign instance.
        h.hv.add_instance("pve", 200, "database", "running").await;
        h.queue.push_job(&["linux"]).await;
        h.queue.push_job(&["linux", "gpu"]).await;

        let report = h.dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.failed_pools, vec!["small".to_string()]);
        assert_eq!(report.started, vec![("gpu".to_string(), Vmid::new(300))]);
    }

    #[tokio::test]
    async fn test_pool_stops_at_first_failure() {
        let h = harness(&[("small", &["linux"], 0, (200, 209))], 0).await;
        h.hv.fail_tasks(Operation::Clone).await;
        for _ in 0..3 {
            h.queue.push_job(&["linux"]).await;
        }

        let report = h.dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.planned.get("small"), 3);
        assert!(report.started.is_empty());
        assert_eq!(report.failed_pools, vec!["small".to_string()]);
        assert_eq!(h.queue.issued_for().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unmatched_jobs_are_counted() {
        let h = harness(&[("small", &["linux"], 0, (200, 209))], 0).await;
        h.queue.push_job(&["windows"]).await;

        let report = h.dispatcher.run_cycle().await.unwrap();
        assert_eq!(report.queued_jobs, 1);
        assert_eq!(report.unmatched_jobs, 1);
        assert!(report.planned.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_stops_on_shutdown() {
        let h = harness(&[("small", &["linux"], 0, (200, 209))], 0).await;
        let (tx, rx) = watch::channel(false);

        let dispatcher = h.dispatcher;
        let handle = tokio::spawn(async move { dispatcher.run(rx).await });

        tokio::time::sleep(Duration::from_secs(40)).await;
        tx.send(true).unwrap();
        handle.await.unwrap();

        let lists = h
            .hv
            .calls()
            .await
            .iter()
            .filter(|c| matches!(c, HypervisorCall::List { .. }))
            .count();
        // Cycles at t=0, 15 and 30.
        assert_eq!(lists, 3);
    }
}
