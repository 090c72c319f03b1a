//! Rules shared by grouped resources (Cluster, Cascade)
//!
//! A group renders its template once per instance into a queue of job specs,
//! then creates the queued jobs one by one.

use super::expressions::{ConditionalExpr, SchedulerSpec};
use crate::Error;

/// Number of jobs a group queues at initialization.
///
/// - `instances` wins when set.
/// - Otherwise one job per input.
/// - Otherwise a single job when an Until condition drives the group (the
///   queue is then iterated round-robin until the condition fires).
/// - Otherwise zero, which fails validation.
pub fn queue_length(instances: u32, inputs: usize, until: Option<&ConditionalExpr>) -> usize {
    if instances > 0 {
        return instances as usize;
    }
    if inputs > 0 {
        return inputs;
    }
    if until.is_some_and(|u| !u.is_unconditional()) {
        return 1;
    }
    0
}

/// Validate the generation fields of a grouped resource
pub fn validate_group(
    resource: &str,
    instances: u32,
    inputs: usize,
    until: Option<&ConditionalExpr>,
    schedule: Option<&SchedulerSpec>,
) -> Result<(), Error> {
    if let Some(until) = until {
        until.validate(resource, "spec.until")?;
    }
    if let Some(schedule) = schedule {
        schedule.validate(resource)?;
    }
    if queue_length(instances, inputs, until) == 0 {
        return Err(Error::validation_for_field(
            resource,
            "spec.instances",
            "instances must be positive when neither inputs nor until are set",
        ));
    }
    Ok(())
}
