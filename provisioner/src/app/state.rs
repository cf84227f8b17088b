//! Application state management

use std::sync::Arc;

use tracing::{info, warn};

use crate::app::options::AppOptions;
use crate::errors::ProvisionError;
use crate::models::instance::InstanceStore;
use crate::provisioning::hub::{ProgressHub, ProgressSink};
use crate::provisioning::orchestrator::ProvisioningTracker;
use crate::provisioning::runner::ProvisioningRunner;
use crate::targets::TargetFactory;
use crate::workers::reconciler::Reconciler;

/// Main application state
pub struct AppState {
    /// Persisted instance records
    pub store: Arc<dyn InstanceStore>,

    /// Push channel for progress and log events
    pub hub: Arc<ProgressHub>,

    /// In-memory provisioning runs
    pub tracker: ProvisioningTracker,

    /// Provisioning entry point shared by the server and the worker
    pub reconciler: Reconciler,
}

impl AppState {
    /// Initialize application state
    pub fn init(
        options: &AppOptions,
        store: Arc<dyn InstanceStore>,
        factory: Arc<dyn TargetFactory>,
    ) -> Result<Self, ProvisionError> {
        info!("Initializing application state...");

        let hub = Arc::new(ProgressHub::new(options.log_replay_lines));
        let sink: Arc<dyn ProgressSink> = hub.clone();
        let tracker = ProvisioningTracker::new(options.tracker.clone(), sink);
        let runner = Arc::new(ProvisioningRunner::new(
            tracker.clone(),
            options.runner.clone(),
        )?);
        let reconciler = Reconciler::new(store.clone(), factory, runner);

        Ok(Self {
            store,
            hub,
            tracker,
            reconciler,
        })
    }

    /// Shutdown application state
    pub async fn shutdown(&self) -> Result<(), ProvisionError> {
        info!("Shutting down application state...");
        let in_flight = self.reconciler.in_flight_count();
        if in_flight > 0 {
            // The reconciler restarts orphaned runs on the next start
            warn!("{} provisioning run(s) abandoned at shutdown", in_flight);
        }
        Ok(())
    }
}
