//! Object names and labels
//!
//! Every object the hook creates is named after the runner pod and carries
//! the `runner-pod=<runner pod>` label, so a later invocation can find and
//! prune it without any other bookkeeping.

use std::collections::BTreeMap;
use uuid::Uuid;

use berth_core::config::Config;

/// Longest name the API server accepts for pods and labels
pub const MAX_NAME_LENGTH: usize = 63;

/// Length of the random suffix of step jobs and secrets
pub const SUFFIX_LENGTH: usize = 8;

/// Name of the job container inside the job pod and step pods
pub const JOB_CONTAINER_NAME: &str = "job";

/// Template containers with this prefix extend an existing container
pub const CONTAINER_EXTENSION_PREFIX: &str = "$";

/// Name of the pod volume backed by the work claim
pub const WORK_VOLUME_NAME: &str = "work";

/// Label key identifying the runner that owns an object
pub const RUNNER_LABEL_KEY: &str = "runner-pod";

/// Label the job controller puts on the pods of a job
pub const JOB_NAME_LABEL_KEY: &str = "job-name";

fn truncate(name: &str, max: usize) -> &str {
    match name.char_indices().nth(max) {
        Some((index, _)) => &name[..index],
        None => name,
    }
}

fn suffix() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(SUFFIX_LENGTH);
    id
}

/// `<runner pod>-workflow`
pub fn job_pod_name(runner_pod: &str) -> String {
    const SUFFIX: &str = "-workflow";
    format!(
        "{}{}",
        truncate(runner_pod, MAX_NAME_LENGTH - SUFFIX.len()),
        SUFFIX
    )
}

/// `<runner pod>-step-<random>`
pub fn step_job_name(runner_pod: &str) -> String {
    const INFIX: &str = "-step-";
    format!(
        "{}{}{}",
        truncate(runner_pod, MAX_NAME_LENGTH - INFIX.len() - SUFFIX_LENGTH),
        INFIX,
        suffix()
    )
}

/// `<runner pod>-secret-<random>`
pub fn secret_name(runner_pod: &str) -> String {
    const INFIX: &str = "-secret-";
    format!(
        "{}{}{}",
        truncate(runner_pod, MAX_NAME_LENGTH - INFIX.len() - SUFFIX_LENGTH),
        INFIX,
        suffix()
    )
}

/// Work volume claim: the configured override or `<runner pod>-work`
pub fn claim_name(config: &Config) -> String {
    config
        .claim_name
        .clone()
        .unwrap_or_else(|| format!("{}-work", config.runner_name))
}

/// Labels attached to every object of the runner
pub fn runner_labels(runner_pod: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(RUNNER_LABEL_KEY.to_string(), runner_pod.to_string())])
}

/// Selector matching every object of the runner
pub fn runner_selector(runner_pod: &str) -> String {
    format!("{}={}", RUNNER_LABEL_KEY, runner_pod)
}

/// Selector matching the pods of a job
pub fn job_selector(job_name: &str) -> String {
    format!("{}={}", JOB_NAME_LABEL_KEY, job_name)
}

/// Turns a service's context name into a valid container name
pub fn service_container_name(context_name: &str) -> String {
    let mapped: String = context_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();
    let name = truncate(mapped.trim_matches('-'), MAX_NAME_LENGTH).trim_end_matches('-');
    if name.is_empty() {
        "service".to_string()
    } else {
        name.to_string()
    }
}
