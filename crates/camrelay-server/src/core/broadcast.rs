use camrelay_proto::{Outbound, ProtoError, StatusBody};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info};
use uuid::Uuid;

use super::registry::{PeerHandle, Registry, StatusEvent};
use crate::app::AppState;

/// Enqueues one message on a peer's writer channel.
///
/// A full queue means the peer is reading too slowly: the message is
/// dropped for that peer only. A closed queue means the session is gone:
/// the peer is detached here instead of waiting for its own cleanup.
pub fn enqueue(
    registry: &Registry,
    handle: &PeerHandle,
    message: Message,
) -> bool {
    match handle.sender.try_send(message) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            debug!(
                "peer send queue full, dropping message: role={}, peer={}",
                handle.role, handle.addr
            );
            false
        }
        Err(TrySendError::Closed(_)) => {
            registry.detach(handle.id);
            false
        }
    }
}

/// Serializes once and fans a message out to every viewer except
/// `exclude`. Per-recipient failures are isolated; the caller never sees
/// them. Returns the number of viewers the message was enqueued for.
pub fn distribute_to_viewers(
    registry: &Registry,
    message: &Outbound,
    exclude: Option<Uuid>,
) -> Result<usize, ProtoError> {
    Ok(distribute_text_to_viewers(registry, message.to_text()?, exclude))
}

/// Raw-text variant used for opaque passthrough (telemetry) and
/// pre-serialized payloads.
pub fn distribute_text_to_viewers(
    registry: &Registry,
    text: String,
    exclude: Option<Uuid>,
) -> usize {
    let mut delivered = 0;
    for handle in registry.viewer_handles(exclude) {
        if enqueue(registry, &handle, Message::Text(text.clone())) {
            delivered += 1;
        }
    }
    delivered
}

/// Frame fan-out: like [`distribute_to_viewers`] but also bumps each
/// recipient's `frames_sent` counter.
pub fn distribute_frame_to_viewers(
    registry: &Registry,
    message: &Outbound,
) -> Result<usize, ProtoError> {
    let text = message.to_text()?;
    let mut delivered = 0;
    for handle in registry.viewer_handles(None) {
        if enqueue(registry, &handle, Message::Text(text.clone())) {
            registry.record_frame_sent(handle.id);
            delivered += 1;
        }
    }
    Ok(delivered)
}

/// Delivers producer link changes from the registry to every viewer, in
/// the order the registry emitted them.
pub async fn run_status_fanout(
    state: AppState,
    mut status_rx: mpsc::UnboundedReceiver<StatusEvent>,
) {
    loop {
        tokio::select! {
            _ = state.shutdown.cancelled() => {
                info!("status fan-out stopping");
                break;
            }
            maybe_event = status_rx.recv() => {
                let Some(event) = maybe_event else {
                    break;
                };

                let message = Outbound::Status(StatusBody::Link {
                    status: event.status,
                    timestamp: event.timestamp,
                });
                if let Err(err) = distribute_to_viewers(&state.registry, &message, None) {
                    debug!("status fan-out encode failed: error={err}");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use camrelay_proto::LinkStatus;
    use tokio::sync::mpsc;

    use super::*;
    use crate::core::registry::Role;

    fn viewer_with_queue(
        registry: &Registry,
        capacity: usize,
    ) -> (PeerHandle, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(capacity);
        let handle = PeerHandle {
            id: Uuid::new_v4(),
            role: Role::Viewer,
            addr: "127.0.0.1:9".parse().expect("addr"),
            sender,
        };
        registry.attach_viewer(handle.clone());
        (handle, receiver)
    }

    #[tokio::test]
    async fn failure_to_one_viewer_does_not_block_the_rest() {
        let (registry, _status_rx) = Registry::new();
        let (_alive, mut alive_rx) = viewer_with_queue(&registry, 8);
        let (dead, dead_rx) = viewer_with_queue(&registry, 8);
        drop(dead_rx);

        let message = Outbound::Status(StatusBody::Link {
            status: LinkStatus::PiConnected,
            timestamp: 1.0,
        });
        let delivered =
            distribute_to_viewers(&registry, &message, None).expect("encode");

        assert_eq!(delivered, 1);
        assert!(alive_rx.try_recv().is_ok());
        // the dead viewer was detached by the failed enqueue
        assert!(registry.detach(dead.id).is_none());
    }

    #[tokio::test]
    async fn full_queue_drops_for_that_peer_without_detaching() {
        let (registry, _status_rx) = Registry::new();
        let (slow, mut slow_rx) = viewer_with_queue(&registry, 1);

        let message = Outbound::Status(StatusBody::Link {
            status: LinkStatus::PiDisconnected,
            timestamp: 2.0,
        });
        assert_eq!(
            distribute_to_viewers(&registry, &message, None).expect("encode"),
            1
        );
        assert_eq!(
            distribute_to_viewers(&registry, &message, None).expect("encode"),
            0
        );

        assert!(slow_rx.try_recv().is_ok());
        assert_eq!(registry.detach(slow.id), Some(Role::Viewer));
    }

    #[tokio::test]
    async fn exclusion_skips_the_named_peer() {
        let (registry, _status_rx) = Registry::new();
        let (excluded, mut excluded_rx) = viewer_with_queue(&registry, 8);
        let (_other, mut other_rx) = viewer_with_queue(&registry, 8);

        let delivered = distribute_text_to_viewers(
            &registry,
            r#"{"type":"telemetry","battery":50}"#.to_string(),
            Some(excluded.id),
        );

        assert_eq!(delivered, 1);
        assert!(excluded_rx.try_recv().is_err());
        assert!(other_rx.try_recv().is_ok());
    }
}
