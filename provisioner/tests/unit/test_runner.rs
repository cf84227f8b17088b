//! Provisioning runner scenarios against a fake target

use std::sync::Arc;
use std::time::Duration;

use fleet_provisioner::errors::ProvisionError;
use fleet_provisioner::models::instance::InstanceStatus;
use fleet_provisioner::provisioning::hub::{ProgressHub, ProgressSink};
use fleet_provisioner::provisioning::orchestrator::{ProvisioningTracker, TrackerOptions};
use fleet_provisioner::provisioning::progress::{ProgressStatus, StepStatus};
use fleet_provisioner::provisioning::runner::{PollBackoff, ProvisioningRunner, RunnerOptions};
use fleet_provisioner::targets::{Endpoint, TargetKind, TargetStatus};

use crate::support::{record, FakeTarget};

fn fast_options() -> RunnerOptions {
    RunnerOptions {
        running_poll_attempts: 3,
        running_poll: PollBackoff {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            multiplier: 2.0,
        },
        health_check_timeout: Duration::from_millis(200),
        health_path: "/health".to_string(),
    }
}

fn runner_with_hub() -> (ProvisioningRunner, Arc<ProgressHub>) {
    let hub = Arc::new(ProgressHub::new(100));
    let sink: Arc<dyn ProgressSink> = hub.clone();
    let tracker = ProvisioningTracker::new(TrackerOptions::default(), sink);
    (ProvisioningRunner::new(tracker, fast_options()).unwrap(), hub)
}

#[tokio::test]
async fn test_serverless_run_walks_catalog_and_skips_channels() {
    let (runner, _hub) = runner_with_hub();
    let target = Arc::new(
        FakeTarget::new(TargetKind::ServerlessContainer, "support bot", 18789).with_endpoint(
            Endpoint {
                host: "127.0.0.1".to_string(),
                port: 9,
                protocol: "http".to_string(),
            },
        ),
    );
    let instance = record("inst-1", TargetKind::ServerlessContainer, InstanceStatus::Pending);

    let outcome = runner.run(&instance, target.clone()).await.unwrap();

    assert_eq!(outcome.progress.status, ProgressStatus::Completed);
    assert_eq!(outcome.endpoint.unwrap().host, "127.0.0.1");
    let statuses: Vec<(String, StepStatus)> = outcome
        .progress
        .steps
        .iter()
        .map(|s| (s.id.clone(), s.status))
        .collect();
    assert_eq!(statuses.len(), 8);
    assert!(statuses[..7].iter().all(|(_, s)| *s == StepStatus::Completed));
    assert_eq!(statuses[7], ("connect_channels".to_string(), StepStatus::Skipped));

    // The unreachable health check degrades the message but never fails the run
    let health = outcome.progress.step("health_check").unwrap();
    assert!(health.message.as_deref().unwrap().contains("degraded"));

    let calls = target.calls();
    let install = calls.iter().position(|c| c == "install").unwrap();
    let configure = calls.iter().position(|c| c == "configure").unwrap();
    let start = calls.iter().position(|c| c == "start").unwrap();
    assert!(install < configure && configure < start);
}

#[tokio::test]
async fn test_failed_step_marks_run_error_and_attaches_logs() {
    let (runner, hub) = runner_with_hub();
    let target = Arc::new(
        FakeTarget::new(TargetKind::LocalService, "support bot", 18789).failing_install("disk full"),
    );
    let instance = record("inst-1", TargetKind::LocalService, InstanceStatus::Pending);

    let err = runner.run(&instance, target.clone()).await.unwrap_err();
    assert!(err.to_string().contains("disk full"));

    let progress = runner.tracker().get_progress("inst-1").unwrap();
    assert_eq!(progress.status, ProgressStatus::Error);
    // Points at the first non-terminal step
    assert_eq!(progress.current_step, "write_config");
    let install = progress.step("install_resources").unwrap();
    assert_eq!(install.status, StepStatus::Error);
    assert!(install.error.as_deref().unwrap().contains("disk full"));
    assert_eq!(progress.step("write_config").unwrap().status, StepStatus::Pending);

    let logs = hub.recent_logs("inst-1");
    assert!(logs.iter().any(|l| l.contains("disk full")));
    assert!(logs.iter().any(|l| l == "listening"));
    assert!(!target.calls().contains(&"configure".to_string()));
}

#[tokio::test]
async fn test_wait_running_polls_until_running() {
    let (runner, _hub) = runner_with_hub();
    let target = Arc::new(
        FakeTarget::new(TargetKind::LocalService, "support bot", 18789).with_statuses(vec![
            TargetStatus::error(18789, "restarting"),
            TargetStatus::stopped(18789),
            TargetStatus::running(18789),
        ]),
    );
    let instance = record("inst-1", TargetKind::LocalService, InstanceStatus::Pending);

    let outcome = runner.run(&instance, target.clone()).await.unwrap();

    let wait = outcome.progress.step("wait_running").unwrap();
    assert_eq!(wait.status, StepStatus::Completed);
    assert!(wait.message.as_deref().unwrap().contains("3 check"));
    // No endpoint is resolvable, so the health check is skipped rather than failed
    let health = outcome.progress.step("health_check").unwrap();
    assert!(health.message.as_deref().unwrap().contains("skipped"));
}

#[tokio::test]
async fn test_wait_running_gives_up_with_timeout_error() {
    let (runner, _hub) = runner_with_hub();
    let target = Arc::new(
        FakeTarget::new(TargetKind::LocalService, "support bot", 18789)
            .with_statuses(vec![TargetStatus::error(18789, "crash loop")]),
    );
    let instance = record("inst-1", TargetKind::LocalService, InstanceStatus::Pending);

    let err = runner.run(&instance, target.clone()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Timeout(_)));
    assert!(err.to_string().contains("crash loop"));
    let polls = target.calls().iter().filter(|c| *c == "get_status").count();
    assert_eq!(polls, 3);
}

#[tokio::test]
async fn test_profile_mismatch_fails_validation() {
    let (runner, _hub) = runner_with_hub();
    let target = Arc::new(FakeTarget::new(TargetKind::LocalService, "another bot", 18789));
    let instance = record("inst-1", TargetKind::LocalService, InstanceStatus::Pending);

    let err = runner.run(&instance, target.clone()).await.unwrap_err();
    assert!(matches!(err, ProvisionError::ValidationError(_)));
    let progress = runner.tracker().get_progress("inst-1").unwrap();
    assert_eq!(
        progress.step("validate_config").unwrap().status,
        StepStatus::Error
    );
    assert!(target.calls().is_empty());
}
