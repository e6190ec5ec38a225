//! Runner fleet dispatcher.
//!
//! Keeps a fleet of hypervisor-backed CI runner VMs sized to the work queued
//! in a repository's job queue. Every poll interval the dispatcher reads the
//! hypervisor inventory, deletes runners that finished their job, measures
//! queued demand per pool and clones, configures and boots new runners up to
//! the configured caps.
//!
//! ## Architecture
//!
//! - **Reconciler**: the cycle loop tying everything together
//! - **Reclaimer**: deletes stopped runners
//! - **Provisioner**: clone -> boot-config -> start pipeline for one runner
//! - **Hypervisor**: Proxmox VE API behind a trait (mock for tests)
//! - **Queue**: GitHub Actions API behind a trait (mock for tests)
//!
//! The dispatcher persists nothing. Each cycle starts from a fresh snapshot
//! of the hypervisor and the queue.

pub mod bootconfig;
pub mod config;
pub mod error;
pub mod hypervisor;
pub mod inventory;
pub mod provisioner;
pub mod queue;
pub mod reclaimer;
pub mod reconciler;
pub mod task;

pub use config::Config;
pub use error::{DispatchError, DispatchResult};
pub use reconciler::{CycleReport, Dispatcher, DispatcherConfig};
