//! Provisioning tracker
//!
//! Owns the in-memory progress record of every instance being provisioned.
//! Each run gets a timeout timer and, once terminal, an eviction timer.
//! Timers are keyed by run id so a timer left over from a replaced run
//! never touches its successor.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::provisioning::hub::{NullSink, ProgressSink};
use crate::provisioning::progress::{ProgressStatus, ProvisioningProgress, StepStatus};
use crate::settings::ProvisioningSettings;
use crate::utils::new_run_id;

/// Timer configuration
#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub timeout: Duration,
    pub completed_retention: Duration,
    pub failed_retention: Duration,
}

impl Default for TrackerOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15 * 60),
            completed_retention: Duration::from_secs(60),
            failed_retention: Duration::from_secs(5 * 60),
        }
    }
}

impl From<&ProvisioningSettings> for TrackerOptions {
    fn from(settings: &ProvisioningSettings) -> Self {
        Self {
            timeout: Duration::from_secs(settings.timeout_secs),
            completed_retention: Duration::from_secs(settings.completed_retention_secs),
            failed_retention: Duration::from_secs(settings.failed_retention_secs),
        }
    }
}

struct Entry {
    progress: ProvisioningProgress,
    run_id: String,
    timeout: Option<AbortHandle>,
    eviction: Option<AbortHandle>,
}

impl Entry {
    fn cancel_timers(&mut self) {
        if let Some(handle) = self.timeout.take() {
            handle.abort();
        }
        if let Some(handle) = self.eviction.take() {
            handle.abort();
        }
    }
}

struct Inner {
    options: TrackerOptions,
    sink: Arc<dyn ProgressSink>,
    entries: Mutex<HashMap<String, Entry>>,
}

/// Cheap to clone; all clones share one map
#[derive(Clone)]
pub struct ProvisioningTracker {
    inner: Arc<Inner>,
}

impl ProvisioningTracker {
    pub fn new(options: TrackerOptions, sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            inner: Arc::new(Inner {
                options,
                sink,
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Tracker that publishes nowhere
    pub fn detached(options: TrackerOptions) -> Self {
        Self::new(options, Arc::new(NullSink))
    }

    pub fn options(&self) -> &TrackerOptions {
        &self.inner.options
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Begin a run with every catalog step pending. Replaces any previous
    /// record for the instance. Must be called within a tokio runtime.
    pub fn start_provisioning(&self, instance_id: &str, backend_kind: &str) -> ProvisioningProgress {
        let progress = ProvisioningProgress::new(instance_id, backend_kind);
        let run_id = new_run_id();
        let timeout = self.spawn_timeout(instance_id, &run_id);

        {
            let mut entries = self.lock();
            if let Some(mut previous) = entries.remove(instance_id) {
                debug!("Replacing provisioning record for {}", instance_id);
                previous.cancel_timers();
            }
            entries.insert(
                instance_id.to_string(),
                Entry {
                    progress: progress.clone(),
                    run_id,
                    timeout: Some(timeout),
                    eviction: None,
                },
            );
        }

        info!(
            "Provisioning {} started ({} steps, backend {})",
            instance_id,
            progress.steps.len(),
            backend_kind
        );
        self.inner.sink.publish_progress(&progress);
        progress
    }

    /// Move one step. Unknown instances or steps, finished runs and
    /// backwards moves are ignored. Returns whether anything changed.
    pub fn update_step(
        &self,
        instance_id: &str,
        step_id: &str,
        status: StepStatus,
        message: Option<&str>,
    ) -> bool {
        let snapshot = {
            let mut entries = self.lock();
            let entry = match entries.get_mut(instance_id) {
                Some(entry) => entry,
                None => return false,
            };
            if !entry.progress.apply_step(step_id, status, message) {
                debug!("Ignored step update {}/{} -> {:?}", instance_id, step_id, status);
                return false;
            }
            entry.progress.clone()
        };

        self.inner.sink.publish_progress(&snapshot);
        true
    }

    /// Mark the run completed. No-op once the run is terminal or evicted.
    pub fn complete_provisioning(&self, instance_id: &str) -> bool {
        self.finish(instance_id, |progress| progress.complete())
    }

    /// Mark the run failed. No-op once the run is terminal or evicted.
    pub fn fail_provisioning(&self, instance_id: &str, error: &str) -> bool {
        self.finish(instance_id, |progress| progress.fail(error))
    }

    fn finish<F>(&self, instance_id: &str, transition: F) -> bool
    where
        F: FnOnce(&mut ProvisioningProgress) -> bool,
    {
        let snapshot = {
            let mut entries = self.lock();
            let entry = match entries.get_mut(instance_id) {
                Some(entry) => entry,
                None => return false,
            };
            if !transition(&mut entry.progress) {
                debug!("Ignored late transition for {}", instance_id);
                return false;
            }
            if let Some(handle) = entry.timeout.take() {
                handle.abort();
            }
            let retention = self.retention_for(entry.progress.status);
            entry.eviction = Some(self.spawn_eviction(instance_id, &entry.run_id, retention));
            entry.progress.clone()
        };

        match snapshot.status {
            ProgressStatus::Completed => info!("Provisioning {} completed", instance_id),
            _ => warn!(
                "Provisioning {} ended with {:?}: {}",
                instance_id,
                snapshot.status,
                snapshot.error.as_deref().unwrap_or_default()
            ),
        }
        self.inner.sink.publish_progress(&snapshot);
        true
    }

    /// Forward a log line to subscribers of the instance
    pub fn log(&self, instance_id: &str, line: &str) {
        self.inner.sink.publish_log(instance_id, line);
    }

    pub fn get_progress(&self, instance_id: &str) -> Option<ProvisioningProgress> {
        self.lock().get(instance_id).map(|e| e.progress.clone())
    }

    /// True while a run for the instance is in progress
    pub fn is_active(&self, instance_id: &str) -> bool {
        self.lock()
            .get(instance_id)
            .is_some_and(|e| !e.progress.is_terminal())
    }

    pub fn active_count(&self) -> usize {
        self.lock()
            .values()
            .filter(|e| !e.progress.is_terminal())
            .count()
    }

    fn retention_for(&self, status: ProgressStatus) -> Duration {
        match status {
            ProgressStatus::Completed => self.inner.options.completed_retention,
            _ => self.inner.options.failed_retention,
        }
    }

    fn spawn_timeout(&self, instance_id: &str, run_id: &str) -> AbortHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let instance_id = instance_id.to_string();
        let run_id = run_id.to_string();
        let timeout = self.inner.options.timeout;

        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = weak.upgrade() {
                ProvisioningTracker { inner }.fire_timeout(&instance_id, &run_id);
            }
        })
        .abort_handle()
    }

    fn fire_timeout(&self, instance_id: &str, run_id: &str) {
        let snapshot = {
            let mut entries = self.lock();
            let entry = match entries.get_mut(instance_id) {
                Some(entry) if entry.run_id == run_id => entry,
                _ => return,
            };
            let message = format!(
                "provisioning did not finish within {}s",
                self.inner.options.timeout.as_secs()
            );
            if !entry.progress.time_out(&message) {
                return;
            }
            entry.timeout = None;
            let retention = self.inner.options.failed_retention;
            entry.eviction = Some(self.spawn_eviction(instance_id, run_id, retention));
            entry.progress.clone()
        };

        warn!("Provisioning {} timed out", instance_id);
        self.inner.sink.publish_progress(&snapshot);
    }

    fn spawn_eviction(&self, instance_id: &str, run_id: &str, after: Duration) -> AbortHandle {
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let instance_id = instance_id.to_string();
        let run_id = run_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if let Some(inner) = weak.upgrade() {
                ProvisioningTracker { inner }.evict(&instance_id, &run_id);
            }
        })
        .abort_handle()
    }

    fn evict(&self, instance_id: &str, run_id: &str) {
        let evicted = {
            let mut entries = self.lock();
            match entries.get(instance_id) {
                Some(entry) if entry.run_id == run_id => entries.remove(instance_id).is_some(),
                _ => false,
            }
        };
        if evicted {
            debug!("Evicted provisioning record for {}", instance_id);
            self.inner.sink.release(instance_id);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let entries = self.entries.get_mut().unwrap_or_else(|e| e.into_inner());
        for entry in entries.values_mut() {
            entry.cancel_timers();
        }
    }
}
