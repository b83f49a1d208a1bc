use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;

use crate::errors::ServeError;
use crate::state::UpdateStateManager;

// Blocks ORD-surface requests while a fetch/swap/warm cycle is in flight,
// so a client never observes a half-updated directory. Only wired into the
// two ORD routes in remote mode - the webhook and status endpoints bypass
// it entirely, and local mode has no state manager to gate on at all.
#[derive(Clone)]
pub struct ReadinessGate {
    state: Arc<UpdateStateManager>,
    timeout: Duration,
}

impl ReadinessGate {
    pub fn new(state: Arc<UpdateStateManager>, timeout: Duration) -> Self {
        Self { state, timeout }
    }
}

pub async fn gate_middleware(
    State(gate): State<ReadinessGate>,
    request: Request,
    next: Next,
) -> Result<Response, ServeError> {
    gate.state
        .wait_for_ready(gate.timeout)
        .await
        .map_err(|_| ServeError::Timeout)?;
    Ok(next.run(request).await)
}
