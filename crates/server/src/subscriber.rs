//! Subscriber session
//!
//! Streams stored frames to one consumer from a resolved starting position.
//! The drain loop suspends on the stream's notifier when it catches up
//! (edge-triggered wake from the publisher's append, never polling) and
//! pauses when the subscriber's outbound queue is saturated, so a slow
//! consumer never forces unbounded server-side buffering.

use std::sync::Arc;

use bytes::Bytes;
use relay_wire::{RequestTuple, Tuple, decode, encode_error, read_frame, write_frame};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::error::ServerError;
use crate::registry::{StreamRegistry, SubscriberRegistration};
use crate::report_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubscriberState {
    Streaming,
    Paused,
}

/// Drive a subscriber connection until it disconnects or its position goes
/// stale.
pub(crate) async fn run(
    registry: Arc<StreamRegistry>,
    request: RequestTuple,
    reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    config: &ServerConfig,
) {
    let identifier = request.identifier;
    let registration = match registry.register_subscriber(&identifier, request.starting_window_id) {
        Ok(registration) => registration,
        Err(err) => {
            warn!(%identifier, %err, "subscriber registration failed");
            report_error(&mut writer, &err).await;
            return;
        }
    };
    info!(
        %identifier,
        cursor = %registration.cursor_id,
        starting_window = request.starting_window_id,
        start = registration.start,
        version = %request.version,
        "subscriber session streaming"
    );

    // writer task: drains the outbound queue onto the socket
    let (frames_tx, mut frames_rx) = mpsc::channel::<Bytes>(config.outbound_queue);
    let writer_task = tokio::spawn(async move {
        while let Some(frame) = frames_rx.recv().await {
            if let Err(err) = write_frame(&mut writer, &frame).await {
                debug!(%err, "subscriber writer stopped");
                break;
            }
        }
    });

    // reader task: only keepalives are legal after registration; EOF or
    // anything unexpected ends the session
    let disconnected = CancellationToken::new();
    let reader_signal = disconnected.clone();
    let max_frame = config.max_frame_size;
    let mut reader = reader;
    let reader_task = tokio::spawn(async move {
        loop {
            match read_frame(&mut reader, max_frame).await {
                Ok(Some(frame)) => match decode(frame) {
                    Ok(Tuple::NoMessage) => {}
                    Ok(other) => {
                        warn!(
                            "unexpected {:?} frame from a subscriber",
                            other.message_type()
                        );
                        break;
                    }
                    Err(err) => {
                        warn!(%err, "undecodable frame from a subscriber");
                        break;
                    }
                },
                Ok(None) | Err(_) => break,
            }
        }
        reader_signal.cancel();
    });

    let result = drain_loop(&registration, &frames_tx, &disconnected, config).await;

    registry.unregister_subscriber(&identifier, registration.cursor_id);
    if let Err(err) = &result {
        // report before the writer task drains out
        let frame = encode_error(err.error_code(), &err.to_string());
        let _ = frames_tx.send(frame).await;
    }
    drop(frames_tx);
    let _ = writer_task.await;
    reader_task.abort();

    match result {
        Ok(()) => debug!(%identifier, cursor = %registration.cursor_id, "subscriber session closed"),
        Err(ServerError::OutboundClosed) => {
            debug!(%identifier, cursor = %registration.cursor_id, "subscriber disconnected mid-delivery");
        }
        Err(err) => warn!(%identifier, cursor = %registration.cursor_id, %err, "subscriber session failed"),
    }
}

async fn drain_loop(
    registration: &SubscriberRegistration,
    frames_tx: &mpsc::Sender<Bytes>,
    disconnected: &CancellationToken,
    config: &ServerConfig,
) -> Result<(), ServerError> {
    let entry = &registration.entry;
    let mut next = registration.start;
    let mut state = SubscriberState::Streaming;

    loop {
        // register the waiter before checking for data so an append between
        // the check and the await is never missed; notify_waiters only
        // reaches waiters that are already enabled
        let notified = entry.data_available().notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        let batch = entry.read_for(registration.cursor_id, next, config.subscriber_batch)?;

        if batch.is_empty() {
            tokio::select! {
                () = &mut notified => continue,
                () = disconnected.cancelled() => return Ok(()),
            }
        }

        for (seq, frame) in batch {
            match frames_tx.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(frame)) => {
                    if state == SubscriberState::Streaming {
                        state = SubscriberState::Paused;
                        debug!(cursor = %registration.cursor_id, at = seq, "subscriber paused on backpressure");
                    }
                    tokio::select! {
                        sent = frames_tx.send(frame) => {
                            sent.map_err(|_| ServerError::OutboundClosed)?;
                        }
                        () = disconnected.cancelled() => return Ok(()),
                    }
                    state = SubscriberState::Streaming;
                }
                Err(TrySendError::Closed(_)) => return Err(ServerError::OutboundClosed),
            }
            next = seq + 1;
        }
        entry.advance_cursor(registration.cursor_id, next);
    }
}
