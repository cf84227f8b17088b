//! Provisioning runner
//!
//! Walks an instance's step catalog in order against its deployment target,
//! reporting every transition to the tracker. Steps run sequentially.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use crate::errors::ProvisionError;
use crate::models::instance::InstanceRecord;
use crate::provisioning::catalog::{step_action, StepAction};
use crate::provisioning::orchestrator::ProvisioningTracker;
use crate::provisioning::progress::{ProvisioningProgress, StepStatus};
use crate::settings::ProvisioningSettings;
use crate::targets::{
    ConfigurePayload, DeploymentTarget, Endpoint, InstallOptions, LogQuery, TargetState,
};

/// Target log lines attached to a failed run
const FAILURE_LOG_LINES: usize = 20;

/// Capped exponential delay between "is it running yet" checks
#[derive(Debug, Clone)]
pub struct PollBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for PollBackoff {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl PollBackoff {
    /// Delay after the zero-based `attempt`
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let delay = self.base_delay.as_secs_f64() * factor;
        Duration::from_secs_f64(delay.min(self.max_delay.as_secs_f64()))
    }
}

/// Polling and probing options
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    pub running_poll_attempts: u32,
    pub running_poll: PollBackoff,
    pub health_check_timeout: Duration,
    pub health_path: String,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self::from(&ProvisioningSettings::default())
    }
}

impl From<&ProvisioningSettings> for RunnerOptions {
    fn from(settings: &ProvisioningSettings) -> Self {
        Self {
            running_poll_attempts: settings.running_poll_attempts.max(1),
            running_poll: PollBackoff {
                base_delay: Duration::from_secs(settings.running_poll_base_delay_secs),
                max_delay: Duration::from_secs(settings.running_poll_max_delay_secs),
                ..Default::default()
            },
            health_check_timeout: Duration::from_secs(settings.health_check_timeout_secs),
            health_path: settings.health_path.clone(),
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub endpoint: Option<Endpoint>,
    pub progress: ProvisioningProgress,
}

#[derive(Default)]
struct RunContext {
    endpoint: Option<Endpoint>,
}

pub struct ProvisioningRunner {
    tracker: ProvisioningTracker,
    options: RunnerOptions,
    http: reqwest::Client,
}

impl ProvisioningRunner {
    pub fn new(tracker: ProvisioningTracker, options: RunnerOptions) -> Result<Self, ProvisionError> {
        let http = reqwest::Client::builder()
            .timeout(options.health_check_timeout)
            .build()?;
        Ok(Self {
            tracker,
            options,
            http,
        })
    }

    pub fn tracker(&self) -> &ProvisioningTracker {
        &self.tracker
    }

    /// Run every catalog step for `record` on `target`
    pub async fn run(
        &self,
        record: &InstanceRecord,
        target: Arc<dyn DeploymentTarget>,
    ) -> Result<RunOutcome, ProvisionError> {
        let id = record.id.as_str();
        let progress = self.tracker.start_provisioning(id, target.kind().as_str());
        let mut context = RunContext::default();

        for step in &progress.steps {
            let action = step_action(&step.id);
            if action == StepAction::External {
                debug!("Step {} for {} is handled externally", step.id, id);
                continue;
            }
            if !self.tracker.is_active(id) {
                return Err(ProvisionError::Timeout(format!(
                    "provisioning of {} ended before step {}",
                    id, step.id
                )));
            }

            self.tracker
                .update_step(id, &step.id, StepStatus::InProgress, Some(&step.name));
            self.tracker.log(id, &format!("{}...", step.name));

            match self.execute(action, record, target.as_ref(), &mut context).await {
                Ok(message) => {
                    self.tracker.log(id, &message);
                    self.tracker
                        .update_step(id, &step.id, StepStatus::Completed, Some(&message));
                }
                Err(e) => {
                    error!("Step {} for {} failed: {}", step.id, id, e);
                    self.tracker.log(id, &format!("{} failed: {}", step.name, e));
                    self.attach_target_logs(id, target.as_ref()).await;
                    self.tracker.fail_provisioning(id, &e.to_string());
                    return Err(e);
                }
            }
        }

        self.tracker.complete_provisioning(id);
        let progress = self.tracker.get_progress(id).unwrap_or(progress);
        Ok(RunOutcome {
            endpoint: context.endpoint,
            progress,
        })
    }

    async fn execute(
        &self,
        action: StepAction,
        record: &InstanceRecord,
        target: &dyn DeploymentTarget,
        context: &mut RunContext,
    ) -> Result<String, ProvisionError> {
        match action {
            StepAction::Validate => {
                target.check_profile(&record.profile_name)?;
                if record.port == 0 {
                    return Err(ProvisionError::ValidationError("gateway port is 0".into()));
                }
                Ok(format!("Profile {} on port {}", record.profile_name, record.port))
            }
            StepAction::Install => {
                let result = target
                    .install(&InstallOptions {
                        profile_name: record.profile_name.clone(),
                        port: record.port,
                        version_tag: record.version_tag.clone(),
                    })
                    .await?;
                Ok(result.message)
            }
            StepAction::Configure => {
                let result = target
                    .configure(&ConfigurePayload {
                        profile_name: record.profile_name.clone(),
                        gateway_port: record.port,
                        environment: record.environment.clone(),
                        config: record.config.clone(),
                    })
                    .await?;
                Ok(result.message)
            }
            StepAction::Start => {
                target.start().await?;
                Ok("Gateway started".to_string())
            }
            StepAction::Restart => {
                target.restart().await?;
                Ok("Gateway restarted".to_string())
            }
            StepAction::AwaitRunning => self.await_running(&record.id, target).await,
            StepAction::ResolveEndpoint => {
                let endpoint = target.get_endpoint().await?;
                let message = format!("Gateway reachable at {}", endpoint.url());
                context.endpoint = Some(endpoint);
                Ok(message)
            }
            StepAction::HealthCheck => Ok(self.health_check(target, context).await),
            StepAction::External => Ok(String::new()),
        }
    }

    /// Poll status with backoff until running or attempts run out
    async fn await_running(
        &self,
        instance_id: &str,
        target: &dyn DeploymentTarget,
    ) -> Result<String, ProvisionError> {
        let attempts = self.options.running_poll_attempts;
        let mut last = String::from("no status observed");

        for attempt in 0..attempts {
            match target.get_status().await {
                Ok(status) if status.state == TargetState::Running => {
                    return Ok(format!("Gateway running after {} check(s)", attempt + 1));
                }
                Ok(status) => {
                    last = status
                        .error
                        .unwrap_or_else(|| format!("state {:?}", status.state));
                }
                Err(e) => last = e.to_string(),
            }

            if attempt + 1 < attempts {
                let delay = self.options.running_poll.delay(attempt);
                debug!("{} not running yet ({}), next check in {:?}", instance_id, last, delay);
                tokio::time::sleep(delay).await;
            }
        }

        Err(ProvisionError::Timeout(format!(
            "gateway not running after {} checks: {}",
            attempts, last
        )))
    }

    /// Check gateway health. Never fails the run; the outcome is the message.
    async fn health_check(&self, target: &dyn DeploymentTarget, context: &mut RunContext) -> String {
        let endpoint = match &context.endpoint {
            Some(endpoint) => endpoint.clone(),
            None => match target.get_endpoint().await {
                Ok(endpoint) => {
                    context.endpoint = Some(endpoint.clone());
                    endpoint
                }
                Err(e) => return format!("Health check skipped: {}", e),
            },
        };

        let url = format!("{}{}", endpoint.url(), self.options.health_path);
        match self.http.get(&url).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Gateway healthy at {}", url);
                format!("Gateway healthy at {}", url)
            }
            Ok(response) => format!("Gateway degraded: {} returned {}", url, response.status()),
            Err(e) => format!("Gateway degraded: {} unreachable: {}", url, e),
        }
    }

    async fn attach_target_logs(&self, instance_id: &str, target: &dyn DeploymentTarget) {
        let query = LogQuery {
            lines: Some(FAILURE_LOG_LINES),
            ..Default::default()
        };
        for line in target.get_logs(&query).await {
            self.tracker.log(instance_id, &line);
        }
    }
}
