//! Lifecycle aggregation and scheduling engine for Frisbee controllers
//!
//! Given the children a parent has created, the engine decides what phase the
//! parent is in and when its next child should be created:
//! - [`classifier`] buckets children by phase
//! - [`calculator`] reduces the buckets to the parent's [`Lifecycle`]
//! - [`expressions`] evaluates metrics/state conditions and alert annotations
//! - [`scheduler`] paces job creation by cron or by event
//! - [`until`] applies Until conditions to groups and names their jobs
//! - [`notifier`] tracks a fixed set of children and pushes phase changes
//! - [`watch`] feeds a notifier from a kube watcher
//! - [`vexec`] runs operator-side actions as tracked virtual jobs
//! - [`alerting`] registers metrics alerts with a dashboard service
//!
//! [`Lifecycle`]: frisbee_common::crd::Lifecycle

pub mod alerting;
pub mod calculator;
pub mod classifier;
pub mod error;
pub mod expressions;
pub mod notifier;
pub mod scheduler;
pub mod status;
pub mod until;
pub mod vexec;
pub mod watch;

#[cfg(test)]
pub(crate) mod testing;

pub use alerting::{AlertingClient, AlertingRegistry, GrafanaClient};
pub use calculator::{grouped_jobs, single_job};
pub use classifier::Classifier;
pub use error::{LifecycleError, Result};
pub use notifier::{Notifier, StatusWriter};
pub use scheduler::{schedule, ScheduleDecision, ScheduleParams};
pub use status::{ChildKind, ChildObject, ChildRef};
pub use until::{calculate_group, job_name, job_spec, GroupCalculation, GroupKind, GroupView};
pub use vexec::{virtual_execution, KubeVirtualObjectStore, VirtualObjectStore};
pub use watch::{filter_by_names, filter_by_parent, watch_children};
