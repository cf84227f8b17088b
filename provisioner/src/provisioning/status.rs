//! Status lookup with fallback to the persisted instance record

use crate::errors::ProvisionError;
use crate::models::instance::{InstanceRecord, InstanceStatus, InstanceStore};
use crate::provisioning::orchestrator::ProvisioningTracker;
use crate::provisioning::progress::{ProgressStatus, ProvisioningProgress, StepStatus};

/// In-memory progress if a run is tracked, otherwise a record synthesized
/// from the stored instance. Covers runs that failed before tracking began.
pub async fn progress_or_fallback(
    tracker: &ProvisioningTracker,
    store: &dyn InstanceStore,
    instance_id: &str,
) -> Result<ProvisioningProgress, ProvisionError> {
    if let Some(progress) = tracker.get_progress(instance_id) {
        return Ok(progress);
    }

    let record = store
        .get_instance(instance_id)
        .await?
        .ok_or_else(|| ProvisionError::NotFound(format!("instance {}", instance_id)))?;
    Ok(fallback_progress(&record))
}

/// Best-effort progress derived from a stored status
pub fn fallback_progress(record: &InstanceRecord) -> ProvisioningProgress {
    let mut progress = ProvisioningProgress::new(&record.id, record.target.as_str());
    progress.started_at = record.updated_at;

    match record.status {
        InstanceStatus::Pending | InstanceStatus::Provisioning => {}
        InstanceStatus::Running | InstanceStatus::Stopped | InstanceStatus::Destroyed => {
            for step in &mut progress.steps {
                step.status = StepStatus::Completed;
            }
            progress.status = ProgressStatus::Completed;
            progress.completed_at = Some(record.updated_at);
        }
        InstanceStatus::Error => {
            let message = record
                .error
                .clone()
                .unwrap_or_else(|| "provisioning failed".to_string());
            if let Some(first) = progress.steps.first_mut() {
                first.status = StepStatus::Error;
                first.error = Some(message.clone());
            }
            progress.status = ProgressStatus::Error;
            progress.error = Some(message);
            progress.completed_at = Some(record.updated_at);
        }
    }

    if let Some(step) = progress
        .steps
        .iter()
        .find(|s| !s.status.is_terminal())
        .or_else(|| progress.steps.last())
    {
        progress.current_step = step.id.clone();
    }
    progress
}
