//! Provisioning progress records
//!
//! Pure state transitions on one run's record. Timers, eviction and
//! publication live in the tracker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::provisioning::catalog;

/// Per-step status. Moves forward only; terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Completed,
    Error,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Completed | StepStatus::Error | StepStatus::Skipped)
    }

    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match (self, next) {
            (StepStatus::Pending, StepStatus::Pending) => false,
            (StepStatus::Pending, _) => true,
            // Repeated in_progress updates refresh the message
            (StepStatus::InProgress, StepStatus::Pending) => false,
            (StepStatus::InProgress, _) => true,
            (_, _) => false,
        }
    }
}

/// Overall run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    InProgress,
    Completed,
    Error,
    Timeout,
}

impl ProgressStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::InProgress)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningStep {
    pub id: String,
    pub name: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvisioningStep {
    pub fn pending(id: &str) -> Self {
        Self {
            id: id.to_string(),
            name: catalog::step_name(id).to_string(),
            status: StepStatus::Pending,
            message: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisioningProgress {
    pub instance_id: String,
    pub status: ProgressStatus,
    pub steps: Vec<ProvisioningStep>,
    pub current_step: String,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProvisioningProgress {
    /// New run with every catalog step pending
    pub fn new(instance_id: &str, backend_kind: &str) -> Self {
        let steps: Vec<ProvisioningStep> = catalog::steps_for(backend_kind)
            .iter()
            .map(|id| ProvisioningStep::pending(id))
            .collect();
        let current_step = steps.first().map(|s| s.id.clone()).unwrap_or_default();

        Self {
            instance_id: instance_id.to_string(),
            status: ProgressStatus::InProgress,
            steps,
            current_step,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn step(&self, step_id: &str) -> Option<&ProvisioningStep> {
        self.steps.iter().find(|s| s.id == step_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Apply one step update. Returns false, leaving the record untouched,
    /// when the run is over, the step is unknown or the move goes backwards.
    pub fn apply_step(&mut self, step_id: &str, status: StepStatus, message: Option<&str>) -> bool {
        if self.is_terminal() {
            return false;
        }
        let step = match self.steps.iter_mut().find(|s| s.id == step_id) {
            Some(step) => step,
            None => return false,
        };
        if !step.status.can_transition_to(status) {
            return false;
        }

        let now = Utc::now();
        step.status = status;
        if let Some(message) = message {
            step.message = Some(message.to_string());
        }

        match status {
            StepStatus::InProgress => {
                step.started_at.get_or_insert(now);
                self.current_step = step_id.to_string();
            }
            StepStatus::Error => {
                step.completed_at = Some(now);
                step.error = message.map(str::to_string);
                self.recompute_current_step();
            }
            StepStatus::Completed | StepStatus::Skipped => {
                step.completed_at = Some(now);
                self.recompute_current_step();
            }
            StepStatus::Pending => {}
        }
        true
    }

    /// Finish successfully; unreached steps become skipped
    pub fn complete(&mut self) -> bool {
        if self.is_terminal() {
            return false;
        }
        let now = Utc::now();
        for step in &mut self.steps {
            match step.status {
                StepStatus::Pending => {
                    step.status = StepStatus::Skipped;
                    step.completed_at = Some(now);
                }
                StepStatus::InProgress => {
                    step.status = StepStatus::Completed;
                    step.completed_at = Some(now);
                }
                _ => {}
            }
        }
        self.status = ProgressStatus::Completed;
        self.completed_at = Some(now);
        self.recompute_current_step();
        true
    }

    /// Finish with an error; running steps carry the same message
    pub fn fail(&mut self, error: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        let now = Utc::now();
        for step in self.steps.iter_mut().filter(|s| s.status == StepStatus::InProgress) {
            step.status = StepStatus::Error;
            step.error = Some(error.to_string());
            step.completed_at = Some(now);
        }
        self.status = ProgressStatus::Error;
        self.error = Some(error.to_string());
        self.completed_at = Some(now);
        self.recompute_current_step();
        true
    }

    /// Give up waiting. Step statuses are left as they are.
    pub fn time_out(&mut self, error: &str) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = ProgressStatus::Timeout;
        self.error = Some(error.to_string());
        self.completed_at = Some(Utc::now());
        true
    }

    /// First non-terminal step, or the last step when all are terminal
    fn recompute_current_step(&mut self) {
        let current = self
            .steps
            .iter()
            .find(|s| !s.status.is_terminal())
            .or_else(|| self.steps.last());
        if let Some(step) = current {
            self.current_step = step.id.clone();
        }
    }
}
