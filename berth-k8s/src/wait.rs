//! Waiting on pods and jobs
//!
//! All loops back off through [`poll_until`]; none of them busy-waits.

use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::Pod;
use std::time::Duration;
use tracing::{debug, info};

use berth_core::backoff::{Backoff, Step, poll_until};
use berth_core::domain::health::PodPhase;
use berth_core::error::{HookError, Result};

use crate::client::ClusterClient;
use crate::names::{self, JOB_CONTAINER_NAME};

/// Budget for the job controller to create a step job's pod
pub const JOB_POD_DISCOVERY_TIMEOUT: Duration = Duration::from_secs(60);

pub fn pod_phase(pod: &Pod) -> PodPhase {
    PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()))
}

/// Waits for a pod to reach one of `awaited`
///
/// Phases in `backoff_phases` are retried; any other phase is a failure.
pub async fn wait_for_pod_phases(
    client: &dyn ClusterClient,
    pod: &str,
    awaited: &[PodPhase],
    backoff_phases: &[PodPhase],
    budget: Duration,
) -> Result<PodPhase> {
    let what = format!("pod {}", pod);
    poll_until(Backoff::with_budget(budget), &what, || async {
        let current = client
            .get_pod(pod)
            .await?
            .ok_or_else(|| HookError::backend(format!("get pod {}", pod), "pod not found"))?;
        let phase = pod_phase(&current);
        debug!("Pod {} is {}", pod, phase);

        if awaited.contains(&phase) {
            Ok(Step::Done(phase))
        } else if backoff_phases.contains(&phase) {
            Ok(Step::Retry)
        } else {
            Err(HookError::backend(
                format!("wait for pod {}", pod),
                format!("pod is in unexpected phase {}", phase),
            ))
        }
    })
    .await
}

/// Name of the pod the job controller created for `job`
pub async fn find_job_pod(client: &dyn ClusterClient, job: &str) -> Result<String> {
    let selector = names::job_selector(job);
    let what = format!("pod of job {}", job);
    poll_until(
        Backoff::with_budget(JOB_POD_DISCOVERY_TIMEOUT),
        &what,
        || async {
            let pods = client.list_pods(&selector).await?;
            Ok(match pods.into_iter().find_map(|p| p.metadata.name) {
                Some(name) => Step::Done(name),
                None => Step::Retry,
            })
        },
    )
    .await
}

fn is_finished(job: &Job) -> bool {
    job.status
        .as_ref()
        .is_some_and(|s| s.succeeded.unwrap_or(0) > 0 || s.failed.unwrap_or(0) > 0)
}

/// Waits until the job has either succeeded or failed
pub async fn wait_for_job(client: &dyn ClusterClient, job: &str) -> Result<Job> {
    let what = format!("job {}", job);
    let finished = poll_until(Backoff::new(), &what, || async {
        let current = client
            .get_job(job)
            .await?
            .ok_or_else(|| HookError::backend(format!("get job {}", job), "job not found"))?;
        Ok(if is_finished(&current) {
            Step::Done(current)
        } else {
            Step::Retry
        })
    })
    .await?;
    info!("Job {} finished", job);
    Ok(finished)
}

/// Exit code of the step container, 0 when none is reported
pub fn step_exit_code(pod: &Pod) -> i32 {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|statuses| statuses.iter().find(|s| s.name == JOB_CONTAINER_NAME))
        .and_then(|s| s.state.as_ref())
        .and_then(|state| state.terminated.as_ref())
        .map(|terminated| terminated.exit_code)
        .unwrap_or(0)
}
