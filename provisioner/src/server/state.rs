//! Server state

use std::sync::Arc;

use crate::models::instance::InstanceStore;
use crate::provisioning::hub::ProgressHub;
use crate::provisioning::orchestrator::ProvisioningTracker;
use crate::workers::reconciler::Reconciler;

/// Server state shared across handlers
pub struct ServerState {
    pub store: Arc<dyn InstanceStore>,
    pub tracker: ProvisioningTracker,
    pub hub: Arc<ProgressHub>,
    pub reconciler: Reconciler,
}

impl ServerState {
    pub fn new(
        store: Arc<dyn InstanceStore>,
        tracker: ProvisioningTracker,
        hub: Arc<ProgressHub>,
        reconciler: Reconciler,
    ) -> Self {
        Self {
            store,
            tracker,
            hub,
            reconciler,
        }
    }
}
