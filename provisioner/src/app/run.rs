//! Main application run loop

use std::future::Future;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::app::options::{AppOptions, LifecycleOptions};
use crate::app::state::AppState;
use crate::errors::ProvisionError;
use crate::models::instance::InstanceStore;
use crate::server::serve::serve;
use crate::server::state::ServerState;
use crate::targets::TargetFactory;
use crate::workers::reconciler;

/// Run the fleet provisioner
pub async fn run(
    options: AppOptions,
    store: Arc<dyn InstanceStore>,
    factory: Arc<dyn TargetFactory>,
    shutdown_signal: impl Future<Output = ()> + Send + 'static,
) -> Result<(), ProvisionError> {
    info!("Initializing fleet provisioner...");

    // Create shutdown channel
    let (shutdown_tx, _shutdown_rx): (broadcast::Sender<()>, _) = broadcast::channel(1);
    let mut shutdown_manager = ShutdownManager::new(shutdown_tx.clone(), options.lifecycle.clone());

    if let Err(e) = init(&options, store, factory, shutdown_tx.clone(), &mut shutdown_manager).await {
        error!("Failed to start fleet provisioner: {}", e);
        shutdown_manager.shutdown().await?;
        return Err(e);
    }

    shutdown_signal.await;
    info!("Shutdown signal received, shutting down...");

    drop(shutdown_tx);
    shutdown_manager.shutdown().await
}

// =============================== INITIALIZATION ================================== //

async fn init(
    options: &AppOptions,
    store: Arc<dyn InstanceStore>,
    factory: Arc<dyn TargetFactory>,
    shutdown_tx: broadcast::Sender<()>,
    shutdown_manager: &mut ShutdownManager,
) -> Result<(), ProvisionError> {
    let app_state = Arc::new(AppState::init(options, store, factory)?);
    shutdown_manager.with_app_state(app_state.clone())?;

    if options.enable_server {
        init_server(options, app_state.clone(), shutdown_manager, shutdown_tx.subscribe()).await?;
    }

    if options.enable_reconciler {
        init_reconciler_worker(
            options.reconciler.clone(),
            app_state,
            shutdown_manager,
            shutdown_tx.subscribe(),
        )?;
    }

    Ok(())
}

fn init_reconciler_worker(
    options: reconciler::Options,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ProvisionError> {
    info!("Initializing reconciler worker...");

    let worker = app_state.reconciler.clone();
    let handle = tokio::spawn(async move {
        reconciler::run(
            &options,
            &worker,
            tokio::time::sleep,
            Box::pin(async move {
                let _ = shutdown_rx.recv().await;
            }),
        )
        .await;
    });

    shutdown_manager.with_reconciler_worker_handle(handle)
}

async fn init_server(
    options: &AppOptions,
    app_state: Arc<AppState>,
    shutdown_manager: &mut ShutdownManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ProvisionError> {
    info!("Initializing HTTP server...");

    let server_state = ServerState::new(
        app_state.store.clone(),
        app_state.tracker.clone(),
        app_state.hub.clone(),
        app_state.reconciler.clone(),
    );

    let server_handle = serve(&options.server, Arc::new(server_state), async move {
        let _ = shutdown_rx.recv().await;
    })
    .await?;

    shutdown_manager.with_server_handle(server_handle)
}

// ================================= SHUTDOWN ===================================== //

struct ShutdownManager {
    shutdown_tx: broadcast::Sender<()>,
    lifecycle_options: LifecycleOptions,
    app_state: Option<Arc<AppState>>,
    server_handle: Option<JoinHandle<Result<(), ProvisionError>>>,
    reconciler_worker_handle: Option<JoinHandle<()>>,
}

impl ShutdownManager {
    fn new(shutdown_tx: broadcast::Sender<()>, lifecycle_options: LifecycleOptions) -> Self {
        Self {
            shutdown_tx,
            lifecycle_options,
            app_state: None,
            server_handle: None,
            reconciler_worker_handle: None,
        }
    }

    fn with_app_state(&mut self, state: Arc<AppState>) -> Result<(), ProvisionError> {
        if self.app_state.is_some() {
            return Err(ProvisionError::ShutdownError("app_state already set".to_string()));
        }
        self.app_state = Some(state);
        Ok(())
    }

    fn with_reconciler_worker_handle(&mut self, handle: JoinHandle<()>) -> Result<(), ProvisionError> {
        if self.reconciler_worker_handle.is_some() {
            return Err(ProvisionError::ShutdownError(
                "reconciler_handle already set".to_string(),
            ));
        }
        self.reconciler_worker_handle = Some(handle);
        Ok(())
    }

    fn with_server_handle(
        &mut self,
        handle: JoinHandle<Result<(), ProvisionError>>,
    ) -> Result<(), ProvisionError> {
        if self.server_handle.is_some() {
            return Err(ProvisionError::ShutdownError("server_handle already set".to_string()));
        }
        self.server_handle = Some(handle);
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<(), ProvisionError> {
        let _ = self.shutdown_tx.send(());

        match tokio::time::timeout(self.lifecycle_options.max_shutdown_delay, self.shutdown_impl())
            .await
        {
            Ok(result) => result,
            Err(_) => {
                error!(
                    "Shutdown timed out after {:?}, forcing shutdown...",
                    self.lifecycle_options.max_shutdown_delay
                );
                std::process::exit(1);
            }
        }
    }

    async fn shutdown_impl(&mut self) -> Result<(), ProvisionError> {
        info!("Shutting down fleet provisioner...");

        // 1. Reconciler worker
        if let Some(handle) = self.reconciler_worker_handle.take() {
            handle
                .await
                .map_err(|e| ProvisionError::ShutdownError(e.to_string()))?;
        }

        // 2. Server
        if let Some(handle) = self.server_handle.take() {
            handle
                .await
                .map_err(|e| ProvisionError::ShutdownError(e.to_string()))??;
        }

        // 3. App state
        if let Some(app_state) = self.app_state.take() {
            app_state.shutdown().await?;
        }

        info!("Shutdown complete");
        Ok(())
    }
}
