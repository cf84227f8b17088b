//! Fleet reconciliation worker
//!
//! Periodically compares every stored instance with its desired state:
//! pending instances are provisioned, running ones are checked for drift,
//! stopped or destroyed ones are brought down. One instance failing never
//! stops the rest of the batch.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::errors::ProvisionError;
use crate::models::instance::{DesiredState, InstanceRecord, InstanceStatus, InstanceStore};
use crate::provisioning::runner::{ProvisioningRunner, RunOutcome};
use crate::settings::ReconcilerSettings;
use crate::targets::{TargetFactory, TargetState};

/// Reconciler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// Time between passes
    pub interval: Duration,

    /// Delay before the first pass
    pub initial_delay: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
        }
    }
}

impl From<&ReconcilerSettings> for Options {
    fn from(settings: &ReconcilerSettings) -> Self {
        Self {
            interval: Duration::from_secs(settings.interval_secs),
            initial_delay: Duration::from_secs(settings.initial_delay_secs),
        }
    }
}

/// What one pass did
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    pub started: Vec<String>,
    pub drifted: Vec<String>,
    pub stopped: Vec<String>,
    pub destroyed: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl ReconcileReport {
    pub fn is_idle(&self) -> bool {
        self.started.is_empty()
            && self.drifted.is_empty()
            && self.stopped.is_empty()
            && self.destroyed.is_empty()
            && self.failed.is_empty()
    }
}

/// Marks an instance as having a run in flight until dropped
pub struct InFlightGuard {
    instance_id: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.instance_id);
    }
}

#[derive(Clone)]
pub struct Reconciler {
    store: Arc<dyn InstanceStore>,
    factory: Arc<dyn TargetFactory>,
    runner: Arc<ProvisioningRunner>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        factory: Arc<dyn TargetFactory>,
        runner: Arc<ProvisioningRunner>,
    ) -> Self {
        Self {
            store,
            factory,
            runner,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<dyn InstanceStore> {
        &self.store
    }

    pub fn runner(&self) -> &Arc<ProvisioningRunner> {
        &self.runner
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_in_flight(&self, instance_id: &str) -> bool {
        self.in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(instance_id)
    }

    /// Claim the instance for one run; `None` when a run is already in flight
    pub fn try_claim(&self, instance_id: &str) -> Option<InFlightGuard> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if !in_flight.insert(instance_id.to_string()) {
            return None;
        }
        Some(InFlightGuard {
            instance_id: instance_id.to_string(),
            in_flight: self.in_flight.clone(),
        })
    }

    /// Provision one instance and persist the outcome
    pub async fn provision(&self, record: InstanceRecord) -> Result<RunOutcome, ProvisionError> {
        let guard = self.try_claim(&record.id).ok_or_else(|| {
            ProvisionError::Conflict(format!("instance {} is already provisioning", record.id))
        })?;
        self.provision_claimed(record, guard).await
    }

    /// Provision an instance already claimed with [`Reconciler::try_claim`]
    pub async fn provision_claimed(
        &self,
        record: InstanceRecord,
        _guard: InFlightGuard,
    ) -> Result<RunOutcome, ProvisionError> {
        self.record_status(&record.id, InstanceStatus::Provisioning, None)
            .await?;

        let result = match self.factory.create(&record) {
            Ok(target) => self.runner.run(&record, target).await,
            Err(e) => Err(e),
        };

        match &result {
            Ok(outcome) => {
                info!(
                    "Instance {} running{}",
                    record.id,
                    outcome
                        .endpoint
                        .as_ref()
                        .map(|e| format!(" at {}", e.url()))
                        .unwrap_or_default()
                );
                self.record_status(&record.id, InstanceStatus::Running, None)
                    .await?;
            }
            Err(e) => {
                error!("Provisioning {} failed: {}", record.id, e);
                self.record_status(&record.id, InstanceStatus::Error, Some(e.to_string()))
                    .await?;
            }
        }
        result
    }

    /// Persist a status change. Failures are logged here since most callers
    /// run detached.
    async fn record_status(
        &self,
        instance_id: &str,
        status: InstanceStatus,
        error: Option<String>,
    ) -> Result<(), ProvisionError> {
        self.store
            .update_status(instance_id, status, error)
            .await
            .map_err(|e| {
                error!("Unable to record {} as {:?}: {}", instance_id, status, e);
                e
            })
    }

    /// Claim for a pass-driven action; `None` when a run holds the instance
    fn claim_for_pass(&self, instance_id: &str) -> Option<InFlightGuard> {
        let guard = self.try_claim(instance_id);
        if guard.is_none() {
            debug!("Skipping {}: run in flight", instance_id);
        }
        guard
    }

    /// Spawn a claimed provisioning run
    pub fn spawn_provision(&self, record: InstanceRecord, guard: InFlightGuard) {
        let reconciler = self.clone();
        tokio::spawn(async move {
            let id = record.id.clone();
            if let Err(e) = reconciler.provision_claimed(record, guard).await {
                debug!("Provisioning run for {} ended with: {}", id, e);
            }
        });
    }

    /// One pass over the fleet
    pub async fn reconcile_once(&self) -> Result<ReconcileReport, ProvisionError> {
        let records = self.store.list_instances().await?;
        let mut report = ReconcileReport::default();

        for record in records {
            let id = record.id.clone();
            if let Err(e) = self.reconcile_instance(record, &mut report).await {
                warn!("Reconciling {} failed: {}", id, e);
                report.failed.push((id, e.to_string()));
            }
        }

        Ok(report)
    }

    async fn reconcile_instance(
        &self,
        record: InstanceRecord,
        report: &mut ReconcileReport,
    ) -> Result<(), ProvisionError> {
        match (record.desired, record.status) {
            // A provisioning status with no run in flight was orphaned by a restart
            (DesiredState::Running, InstanceStatus::Pending | InstanceStatus::Provisioning) => {
                let guard = match self.claim_for_pass(&record.id) {
                    Some(guard) => guard,
                    None => return Ok(()),
                };
                report.started.push(record.id.clone());
                self.spawn_provision(record, guard);
            }
            (DesiredState::Running, InstanceStatus::Running) => {
                let _guard = match self.claim_for_pass(&record.id) {
                    Some(guard) => guard,
                    None => return Ok(()),
                };
                let target = self.factory.create(&record)?;
                let status = target.get_status().await?;
                let drift = match status.state {
                    TargetState::NotInstalled => Some("gateway is not installed".to_string()),
                    TargetState::Error => Some(
                        status
                            .error
                            .unwrap_or_else(|| "gateway reported an error".to_string()),
                    ),
                    TargetState::Running | TargetState::Stopped => None,
                };
                if let Some(reason) = drift {
                    warn!("Instance {} drifted: {}", record.id, reason);
                    self.record_status(&record.id, InstanceStatus::Error, Some(reason))
                        .await?;
                    report.drifted.push(record.id);
                }
            }
            (DesiredState::Stopped, InstanceStatus::Running) => {
                let _guard = match self.claim_for_pass(&record.id) {
                    Some(guard) => guard,
                    None => return Ok(()),
                };
                let target = self.factory.create(&record)?;
                target.stop().await?;
                self.record_status(&record.id, InstanceStatus::Stopped, None)
                    .await?;
                report.stopped.push(record.id);
            }
            (DesiredState::Destroyed, status) if status != InstanceStatus::Destroyed => {
                let _guard = match self.claim_for_pass(&record.id) {
                    Some(guard) => guard,
                    None => return Ok(()),
                };
                let target = self.factory.create(&record)?;
                let outcome = target.destroy().await;
                if outcome.is_clean() {
                    self.record_status(&record.id, InstanceStatus::Destroyed, None)
                        .await?;
                    report.destroyed.push(record.id);
                } else {
                    let reason = outcome
                        .failed
                        .iter()
                        .map(|(resource, e)| format!("{}: {}", resource, e))
                        .collect::<Vec<_>>()
                        .join("; ");
                    self.record_status(&record.id, InstanceStatus::Error, Some(reason.clone()))
                        .await?;
                    report.failed.push((record.id, reason));
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// Run the reconciler worker
pub async fn run<S, F>(
    options: &Options,
    reconciler: &Reconciler,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Reconciler worker starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Reconciler worker shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    loop {
        match reconciler.reconcile_once().await {
            Ok(report) if report.is_idle() => debug!("Fleet in desired state"),
            Ok(report) => info!(
                "Reconciled fleet: {} started, {} drifted, {} stopped, {} destroyed, {} failed",
                report.started.len(),
                report.drifted.len(),
                report.stopped.len(),
                report.destroyed.len(),
                report.failed.len()
            ),
            Err(e) => error!("Failed to list instances: {}", e),
        }

        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Reconciler worker shutting down...");
                return;
            }
            _ = sleep_fn(options.interval) => {}
        }
    }
}
