//! Publisher session
//!
//! Exactly one producer per stream identifier. Inbound data and window
//! markers are appended to the stream's log; a reset request rewinds the
//! log and the session keeps accepting data from the requested window
//! onward. A newer registration for the same identifier fences this
//! session out.

use std::sync::Arc;

use relay_wire::{MessageType, RequestTuple, Tuple, WireError, decode, read_frame};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, info, warn};

use crate::error::ServerError;
use crate::registry::{PublisherRegistration, StreamRegistry};
use crate::report_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PublisherState {
    Registering,
    Active,
    Resetting,
    Closed,
}

fn transition(identifier: &str, state: &mut PublisherState, next: PublisherState) {
    debug!(identifier, from = ?*state, to = ?next, "publisher state");
    *state = next;
}

/// Windowing positions observed on this session.
#[derive(Debug, Default, Clone, Copy)]
struct Progress {
    current_window: Option<u64>,
    last_checkpoint: Option<u64>,
}

/// Drive a publisher connection until it disconnects, errors out or is
/// fenced by a newer registration.
pub(crate) async fn run(
    registry: Arc<StreamRegistry>,
    request: RequestTuple,
    mut reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    max_frame: usize,
) {
    let identifier = request.identifier;
    let mut state = PublisherState::Registering;
    let registration = registry.register_publisher(&identifier);
    transition(&identifier, &mut state, PublisherState::Active);
    info!(
        %identifier,
        epoch = registration.epoch,
        starting_window = request.starting_window_id,
        version = %request.version,
        "publisher session active"
    );

    let mut progress = Progress::default();
    let result = session_loop(
        &registry,
        &registration,
        &identifier,
        &mut state,
        &mut progress,
        &mut reader,
        max_frame,
    )
    .await;

    registry.unregister_publisher(&identifier, registration.epoch);
    transition(&identifier, &mut state, PublisherState::Closed);

    match result {
        Ok(()) => debug!(
            %identifier,
            current_window = progress.current_window,
            last_checkpoint = progress.last_checkpoint,
            "publisher session closed"
        ),
        Err(err @ ServerError::FencedOut { .. }) => {
            // expected during failover; the replacement is already active
            report_error(&mut writer, &err).await;
            debug!(%identifier, "publisher session fenced out");
        }
        Err(err) => {
            report_error(&mut writer, &err).await;
            warn!(%identifier, %err, "publisher session failed");
        }
    }
}

async fn session_loop(
    registry: &StreamRegistry,
    registration: &PublisherRegistration,
    identifier: &str,
    state: &mut PublisherState,
    progress: &mut Progress,
    reader: &mut OwnedReadHalf,
    max_frame: usize,
) -> Result<(), ServerError> {
    loop {
        tokio::select! {
            () = registration.fenced.cancelled() => {
                return Err(ServerError::FencedOut {
                    identifier: identifier.to_string(),
                });
            }
            frame = read_frame(reader, max_frame) => {
                let Some(frame) = frame? else {
                    return Ok(());
                };
                match decode(frame.clone())? {
                    Tuple::NoMessage => {
                        // keepalive: refreshes liveness, never stored
                    }
                    Tuple::Data(_) => {
                        registration.entry.append(registration.epoch, frame)?;
                    }
                    Tuple::BeginWindow(marker) => {
                        registration
                            .entry
                            .append_boundary(registration.epoch, marker.window_id, frame)?;
                        progress.current_window = Some(marker.window_id);
                    }
                    Tuple::EndWindow { .. } => {
                        registration.entry.append(registration.epoch, frame)?;
                    }
                    Tuple::Checkpoint { window_id } => {
                        registration.entry.append(registration.epoch, frame)?;
                        progress.last_checkpoint = Some(window_id);
                        debug!(identifier, window_id, "checkpoint recorded");
                    }
                    Tuple::Request(inner) if inner.request_type == MessageType::ResetRequest => {
                        if inner.identifier != identifier {
                            return Err(ServerError::Wire(WireError::protocol(format!(
                                "reset names stream {} on a session for {identifier}",
                                inner.identifier
                            ))));
                        }
                        transition(identifier, state, PublisherState::Resetting);
                        registry.reset(identifier, inner.starting_window_id)?;
                        progress.current_window = None;
                        transition(identifier, state, PublisherState::Active);
                    }
                    other => {
                        return Err(ServerError::Wire(WireError::protocol(format!(
                            "unexpected {:?} frame from a publisher",
                            other.message_type()
                        ))));
                    }
                }
            }
        }
    }
}
