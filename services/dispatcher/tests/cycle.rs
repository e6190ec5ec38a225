//! Integration tests for full reconciliation cycles.
//!
//! Pools are loaded from a TOML pool file the same way the daemon loads
//! them, and each cycle runs against MockHypervisor and MockJobQueue.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use fleet_dispatcher::config::{load_pools, PoolDefaults};
use fleet_dispatcher::hypervisor::{HypervisorCall, MockHypervisor, Operation};
use fleet_dispatcher::queue::MockJobQueue;
use fleet_dispatcher::{Dispatcher, DispatcherConfig};
use fleet_reconcile::Vmid;
use tempfile::TempDir;

const USER_DATA: &str = "#cloud-config\nruncmd:\n  - ./config.sh --url $repo_url --token $registration_token --name $runner_name --labels \"$runner_labels\"\n";

struct Fixture {
    hv: Arc<MockHypervisor>,
    queue: Arc<MockJobQueue>,
    dispatcher: Dispatcher,
    snippets: PathBuf,
    _dir: TempDir,
}

async fn fixture(pool_file: &str) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let template = dir.path().join("runner-user-data.pkrtpl");
    std::fs::write(&template, USER_DATA).unwrap();
    let snippets = dir.path().join("snippets");

    let defaults = PoolDefaults {
        node: "pve".to_string(),
        template: "ubuntu-2404-runner-template".to_string(),
        labels: vec!["energyplus".to_string(), "linux".to_string()],
        prefix: "energyplus-runner".to_string(),
        vmid_start: 200,
        vmid_end: 299,
        max_runners: 0,
        runner_user: "ci".to_string(),
        user_data_template: template,
        storage: "local".to_string(),
    };
    let (global_cap, pools) = load_pools(&defaults, Some(pool_file), None).unwrap();

    let hv = Arc::new(MockHypervisor::new());
    hv.add_template("pve", 9000, "ubuntu-2404-runner-template")
        .await;
    let queue = Arc::new(MockJobQueue::new());

    let config = DispatcherConfig {
        pools,
        global_cap,
        poll_interval: Duration::from_secs(15),
        task_poll_interval: Duration::from_secs(2),
        snippets_dir: Some(snippets.clone()),
        repo_url: "https://github.com/NREL/EnergyPlus".to_string(),
    };
    let dispatcher = Dispatcher::new(config, hv.clone(), queue.clone());

    Fixture {
        hv,
        queue,
        dispatcher,
        snippets,
        _dir: dir,
    }
}

fn running_vmids(records: &[fleet_dispatcher::hypervisor::InstanceRecord]) -> Vec<u32> {
    records
        .iter()
        .filter(|r| !r.template && r.status == "running")
        .map(|r| r.vmid.get())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_pool_cap_bounds_starts_across_cycles() {
    let f = fixture(
        r#"
        [[pools]]
        name = "small"
        labels = ["linux", "x64"]
        max_runners = 2
        vmid_range = [200, 209]
        "#,
    )
    .await;
    for _ in 0..3 {
        f.queue.push_job(&["linux", "x64"]).await;
    }

    let first = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(first.planned.get("small"), 2);
    assert_eq!(first.started_in("small"), 2);

    // Jobs still queued, pool at cap.
    let second = f.dispatcher.run_cycle().await.unwrap();
    assert!(second.planned.is_empty());
    assert!(second.started.is_empty());

    assert_eq!(running_vmids(&f.hv.instances("pve").await), vec![200, 201]);
}

#[tokio::test(start_paused = true)]
async fn test_job_goes_to_most_specific_pool() {
    let f = fixture(
        r#"
        [[pools]]
        name = "big"
        labels = ["linux", "gpu"]
        vmid_range = [300, 309]

        [[pools]]
        name = "small"
        labels = ["linux"]
        vmid_range = [200, 209]
        "#,
    )
    .await;
    f.queue.push_job(&["linux"]).await;

    let report = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.started, vec![("small".to_string(), Vmid::new(200))]);
    assert!(f
        .hv
        .instances("pve")
        .await
        .iter()
        .any(|r| r.name == "energyplus-runner-small-200"));
}

#[tokio::test(start_paused = true)]
async fn test_global_cap_is_consumed_in_pool_order() {
    let f = fixture(
        r#"
        max_total_runners = 5

        [[pools]]
        name = "a"
        prefix = "runner-a"
        labels = ["linux"]
        vmid_range = [200, 209]

        [[pools]]
        name = "b"
        prefix = "runner-b"
        labels = ["linux", "gpu"]
        vmid_range = [300, 309]
        "#,
    )
    .await;
    for vmid in 200..203 {
        f.hv.add_instance("pve", vmid, &format!("runner-a-{vmid}"), "running")
            .await;
    }
    for _ in 0..7 {
        f.queue.push_job(&["linux"]).await;
    }
    for _ in 0..3 {
        f.queue.push_job(&["gpu"]).await;
    }

    let report = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.planned.get("a"), 2);
    assert_eq!(report.planned.get("b"), 0);
    assert_eq!(
        report.started,
        vec![
            ("a".to_string(), Vmid::new(203)),
            ("a".to_string(), Vmid::new(204)),
        ]
    );
    assert_eq!(running_vmids(&f.hv.instances("pve").await).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_stopped_runner_is_reclaimed() {
    let f = fixture(
        r#"
        [[pools]]
        name = "default"
        prefix = "energyplus-runner"
        "#,
    )
    .await;
    f.hv.add_instance("pve", 204, "energyplus-runner-204", "stopped")
        .await;

    let report = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.reclaimed, vec![("pve".to_string(), Vmid::new(204))]);
    assert!(f
        .hv
        .instances("pve")
        .await
        .iter()
        .all(|r| r.vmid != Vmid::new(204)));

    let calls = f.hv.calls().await;
    let stop = calls
        .iter()
        .position(|c| *c == HypervisorCall::Stop { vmid: Vmid::new(204) });
    let delete = calls
        .iter()
        .position(|c| *c == HypervisorCall::Delete { vmid: Vmid::new(204) });
    assert!(stop < delete);

    // A second pass has nothing left to do.
    let again = f.dispatcher.run_cycle().await.unwrap();
    assert!(again.reclaimed.is_empty());
    assert_eq!(again.reclaim_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_unsupported_regeneration_still_boots() {
    let f = fixture(
        r#"
        [[pools]]
        name = "default"
        prefix = "energyplus-runner"
        labels = "energyplus, linux, x64"
        "#,
    )
    .await;
    f.hv.set_regenerate_unsupported().await;
    f.queue.push_job(&["energyplus", "self-hosted"]).await;

    let report = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.started, vec![("default".to_string(), Vmid::new(200))]);
    assert!(report.failed_pools.is_empty());

    let snippet =
        std::fs::read_to_string(f.snippets.join("energyplus-runner-200.yaml")).unwrap();
    assert!(snippet.contains("--name energyplus-runner-200"));
    assert!(snippet.contains("--labels \"energyplus,linux,x64\""));
    assert!(snippet.contains("--url https://github.com/NREL/EnergyPlus"));
    assert_eq!(
        f.hv.boot_config(200).await.as_deref(),
        Some("user=local:snippets/energyplus-runner-200.yaml")
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_regeneration_stops_the_pool() {
    let f = fixture(
        r#"
        [[pools]]
        name = "default"
        prefix = "energyplus-runner"
        "#,
    )
    .await;
    f.hv.fail_tasks(Operation::RegenerateBootConfig).await;
    f.queue.push_job(&["linux"]).await;
    f.queue.push_job(&["linux"]).await;

    let report = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.planned.get("default"), 2);
    assert!(report.started.is_empty());
    assert_eq!(report.failed_pools, vec!["default".to_string()]);
    assert!(running_vmids(&f.hv.instances("pve").await).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_locked_runner_is_left_alone() {
    let f = fixture(
        r#"
        [[pools]]
        name = "default"
        prefix = "energyplus-runner"
        vmid_range = [200, 201]
        "#,
    )
    .await;
    f.hv.add_instance("pve", 200, "energyplus-runner-200", "stopped")
        .await;
    f.hv.set_lock("pve", 200, "clone").await;
    f.queue.push_job(&["linux"]).await;

    let report = f.dispatcher.run_cycle().await.unwrap();
    assert!(report.reclaimed.is_empty());
    // The locked instance keeps its VMID and does not count as active.
    assert_eq!(report.started, vec![("default".to_string(), Vmid::new(201))]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_tasks_are_awaited() {
    let f = fixture(
        r#"
        [[pools]]
        name = "default"
        prefix = "energyplus-runner"
        "#,
    )
    .await;
    f.hv.set_task_polls(3).await;
    f.queue.push_job(&["linux"]).await;

    let started = tokio::time::Instant::now();
    let report = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.started.len(), 1);

    // Clone, attach, regenerate and start each poll three times at 2s.
    assert!(started.elapsed() >= Duration::from_secs(4 * 3 * 2));
    assert!(f.hv.task_status_queries().await >= 16);
}

#[tokio::test(start_paused = true)]
async fn test_fleet_shrinks_when_queue_drains() {
    let f = fixture(
        r#"
        [[pools]]
        name = "default"
        prefix = "energyplus-runner"
        "#,
    )
    .await;
    f.queue.push_job(&["linux"]).await;
    let first = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(first.started, vec![("default".to_string(), Vmid::new(200))]);

    // The runner took the job, finished and powered itself off.
    f.queue.clear().await;
    f.hv.add_instance("pve", 200, "energyplus-runner-200", "stopped")
        .await;

    let second = f.dispatcher.run_cycle().await.unwrap();
    assert_eq!(second.reclaimed, vec![("pve".to_string(), Vmid::new(200))]);
    assert!(second.started.is_empty());
    assert!(f.hv.instances("pve").await.iter().all(|r| r.template));
}
