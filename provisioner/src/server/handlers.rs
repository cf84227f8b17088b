//! HTTP request handlers

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, info, warn};

use crate::errors::ProvisionError;
use crate::models::instance::{DesiredState, InstanceStatus};
use crate::provisioning::catalog::{all_catalogs, CatalogEntry};
use crate::provisioning::hub::{ProgressEvent, ProgressHub};
use crate::provisioning::status::progress_or_fallback;
use crate::server::state::ServerState;
use crate::targets::TargetKind;
use crate::utils::{build_info, BuildInfo, SERVICE_NAME};

/// Error body returned by every failing handler
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ProvisionError {
    fn into_response(self) -> Response {
        let status = match &self {
            ProvisionError::NotFound(_) => StatusCode::NOT_FOUND,
            ProvisionError::Conflict(_) => StatusCode::CONFLICT,
            ProvisionError::ValidationError(_) => StatusCode::BAD_REQUEST,
            ProvisionError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub active_runs: usize,
}

/// Health check handler
pub async fn health_handler(State(state): State<Arc<ServerState>>) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        service: SERVICE_NAME.to_string(),
        version: build_info().version.to_string(),
        active_runs: state.tracker.active_count(),
    })
}

/// Version handler
pub async fn version_handler() -> Json<BuildInfo> {
    Json(build_info())
}

/// Step catalogs per backend kind
pub async fn catalog_handler() -> Json<Vec<CatalogEntry>> {
    Json(all_catalogs())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceSummary {
    pub id: String,
    pub profile_name: String,
    pub target: TargetKind,
    pub status: InstanceStatus,
    pub desired: DesiredState,
    pub provisioning: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Every stored instance with its persisted status
pub async fn instances_handler(
    State(state): State<Arc<ServerState>>,
) -> Result<Json<Vec<InstanceSummary>>, ProvisionError> {
    let records = state.store.list_instances().await?;
    let summaries = records
        .into_iter()
        .map(|record| InstanceSummary {
            provisioning: state.tracker.is_active(&record.id),
            id: record.id,
            profile_name: record.profile_name,
            target: record.target,
            status: record.status,
            desired: record.desired,
            error: record.error,
        })
        .collect();
    Ok(Json(summaries))
}

/// Current progress, falling back to the persisted status
pub async fn progress_handler(
    State(state): State<Arc<ServerState>>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ProvisionError> {
    let progress = progress_or_fallback(&state.tracker, state.store.as_ref(), &instance_id).await?;
    Ok(Json(progress))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionAccepted {
    pub instance_id: String,
    pub status: String,
}

/// Start a provisioning run in the background
pub async fn provision_handler(
    State(state): State<Arc<ServerState>>,
    Path(instance_id): Path<String>,
) -> Result<impl IntoResponse, ProvisionError> {
    let record = state
        .store
        .get_instance(&instance_id)
        .await?
        .ok_or_else(|| ProvisionError::NotFound(format!("instance {}", instance_id)))?;

    let guard = state.reconciler.try_claim(&instance_id).ok_or_else(|| {
        ProvisionError::Conflict(format!("instance {} is already provisioning", instance_id))
    })?;

    info!("Provisioning {} requested", instance_id);
    state.reconciler.spawn_provision(record, guard);

    Ok((
        StatusCode::ACCEPTED,
        Json(ProvisionAccepted {
            instance_id,
            status: "accepted".to_string(),
        }),
    ))
}

/// Server-sent progress stream: current snapshot, buffered log lines, then
/// live events until the run reaches a terminal state
pub async fn events_handler(
    State(state): State<Arc<ServerState>>,
    Path(instance_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ProvisionError> {
    // Subscribe first so nothing published after the snapshot is missed
    let subscription = state.hub.subscribe(&instance_id);
    let snapshot =
        match progress_or_fallback(&state.tracker, state.store.as_ref(), &instance_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                state.hub.unsubscribe(subscription);
                return Err(e);
            }
        };

    // Buffered log lines first, then the current snapshot
    let now = chrono::Utc::now();
    let mut initial: Vec<ProgressEvent> = subscription
        .replay
        .iter()
        .map(|line| ProgressEvent::Log {
            instance_id: instance_id.clone(),
            line: line.clone(),
            timestamp: now,
        })
        .collect();
    initial.push(ProgressEvent::Progress {
        progress: snapshot.clone(),
    });

    let live: BoxStream<'static, ProgressEvent> = if snapshot.is_terminal() {
        state.hub.unsubscribe(subscription);
        stream::empty().boxed()
    } else {
        debug!("Streaming progress for {}", instance_id);
        live_events(LiveEvents {
            receiver: subscription.receiver,
            _topic: TopicGuard {
                hub: state.hub.clone(),
                instance_id,
            },
            finished: false,
        })
        .boxed()
    };

    let events = stream::iter(initial)
        .chain(live)
        .map(|event| Event::default().event(event.name()).json_data(&event));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

/// Prunes the hub topic once the stream is dropped
struct TopicGuard {
    hub: Arc<ProgressHub>,
    instance_id: String,
}

impl Drop for TopicGuard {
    fn drop(&mut self) {
        self.hub.prune(&self.instance_id);
    }
}

// Field order matters: the receiver drops before the guard prunes
struct LiveEvents {
    receiver: broadcast::Receiver<ProgressEvent>,
    _topic: TopicGuard,
    finished: bool,
}

fn live_events(state: LiveEvents) -> impl Stream<Item = ProgressEvent> + Send + 'static {
    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        loop {
            match state.receiver.recv().await {
                Ok(event) => {
                    if let ProgressEvent::Progress { progress } = &event {
                        state.finished = progress.is_terminal();
                    }
                    return Some((event, state));
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Progress subscriber lagged, {} events skipped", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}
