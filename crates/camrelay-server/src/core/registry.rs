use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Mutex, MutexGuard, PoisonError};

use camrelay_proto::{LinkStatus, ServoControl, ServoState};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tracing::info;
use uuid::Uuid;

use super::unix_time;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Producer,
    Worker,
    Viewer,
}

impl fmt::Display for Role {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        match self {
            Role::Producer => write!(f, "producer"),
            Role::Worker => write!(f, "worker"),
            Role::Viewer => write!(f, "viewer"),
        }
    }
}

/// Send handle for one live peer. Cloning is cheap; the channel feeds the
/// session's writer task, so enqueue order is delivery order for that peer.
#[derive(Debug, Clone)]
pub struct PeerHandle {
    pub id: Uuid,
    pub role: Role,
    pub addr: SocketAddr,
    pub sender: mpsc::Sender<Message>,
}

/// A singleton slot was already occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTaken;

#[derive(Debug)]
pub struct ViewerEntry {
    pub handle: PeerHandle,
    pub client_id: String,
    pub connected_at: f64,
    pub last_active: f64,
    pub frames_sent: u64,
}

/// Producer link change queued for the status fan-out task.
#[derive(Debug, Clone, Copy)]
pub struct StatusEvent {
    pub status: LinkStatus,
    pub timestamp: f64,
}

/// Counts and state answering a viewer `request_status`.
#[derive(Debug, Clone, Copy)]
pub struct StatusSnapshot {
    pub pi_connected: bool,
    pub wsl_connected: bool,
    pub browser_clients: usize,
    pub servo_state: ServoState,
}

#[derive(Default)]
struct RegistryInner {
    producer: Option<PeerHandle>,
    worker: Option<PeerHandle>,
    viewers: HashMap<Uuid, ViewerEntry>,
    servo: ServoState,
}

/// Process-wide connection state: the singleton producer and worker slots,
/// the viewer set, and the servo pose. One lock, no await inside it.
///
/// Producer attach/detach emits a [`StatusEvent`] while the lock is held so
/// viewers observe link changes in registry order; the actual broadcast runs
/// in the fan-out task.
pub struct Registry {
    inner: Mutex<RegistryInner>,
    status_tx: mpsc::UnboundedSender<StatusEvent>,
}

impl Registry {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<StatusEvent>) {
        let (status_tx, status_rx) = mpsc::unbounded_channel();
        let registry = Self {
            inner: Mutex::new(RegistryInner::default()),
            status_tx,
        };
        (registry, status_rx)
    }

    pub fn attach_producer(
        &self,
        handle: PeerHandle,
    ) -> Result<(), SlotTaken> {
        let mut inner = self.lock();
        if inner.producer.is_some() {
            return Err(SlotTaken);
        }

        info!("producer connected: peer={}", handle.addr);
        inner.producer = Some(handle);
        self.emit_status(LinkStatus::PiConnected);
        Ok(())
    }

    pub fn attach_worker(
        &self,
        handle: PeerHandle,
    ) -> Result<(), SlotTaken> {
        let mut inner = self.lock();
        if inner.worker.is_some() {
            return Err(SlotTaken);
        }

        info!("worker connected: peer={}", handle.addr);
        inner.worker = Some(handle);
        Ok(())
    }

    pub fn attach_viewer(
        &self,
        handle: PeerHandle,
    ) -> String {
        let client_id = format!("viewer-{}", handle.id.simple());
        let now = unix_time();
        let entry = ViewerEntry {
            client_id: client_id.clone(),
            connected_at: now,
            last_active: now,
            frames_sent: 0,
            handle,
        };

        let mut inner = self.lock();
        info!(
            "viewer connected: peer={}, client_id={}, viewers={}",
            entry.handle.addr,
            client_id,
            inner.viewers.len() + 1
        );
        inner.viewers.insert(entry.handle.id, entry);
        client_id
    }

    /// Removes the peer from whichever slot it occupies. Idempotent: a
    /// second detach of the same id returns `None` and changes nothing.
    pub fn detach(
        &self,
        id: Uuid,
    ) -> Option<Role> {
        let mut inner = self.lock();

        if inner.producer.as_ref().is_some_and(|handle| handle.id == id) {
            inner.producer = None;
            info!("producer removed");
            self.emit_status(LinkStatus::PiDisconnected);
            return Some(Role::Producer);
        }

        if inner.worker.as_ref().is_some_and(|handle| handle.id == id) {
            inner.worker = None;
            info!("worker removed");
            return Some(Role::Worker);
        }

        if let Some(entry) = inner.viewers.remove(&id) {
            let now = unix_time();
            info!(
                "viewer removed: client_id={}, frames_sent={}, connected_for={:.0}s, idle_for={:.0}s",
                entry.client_id,
                entry.frames_sent,
                now - entry.connected_at,
                now - entry.last_active
            );
            return Some(Role::Viewer);
        }

        None
    }

    pub fn producer(&self) -> Option<PeerHandle> {
        self.lock().producer.clone()
    }

    pub fn worker(&self) -> Option<PeerHandle> {
        self.lock().worker.clone()
    }

    /// Viewer handles for a fan-out, minus the excluded peer.
    pub fn viewer_handles(
        &self,
        exclude: Option<Uuid>,
    ) -> Vec<PeerHandle> {
        self.lock()
            .viewers
            .values()
            .filter(|entry| Some(entry.handle.id) != exclude)
            .map(|entry| entry.handle.clone())
            .collect()
    }

    /// Send handles of every connected peer, for the shutdown broadcast.
    pub fn all_senders(&self) -> Vec<mpsc::Sender<Message>> {
        let inner = self.lock();
        let mut senders: Vec<_> = inner
            .viewers
            .values()
            .map(|entry| entry.handle.sender.clone())
            .collect();
        senders.extend(inner.producer.as_ref().map(|handle| handle.sender.clone()));
        senders.extend(inner.worker.as_ref().map(|handle| handle.sender.clone()));
        senders
    }

    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        inner.producer.is_none() && inner.worker.is_none() && inner.viewers.is_empty()
    }

    pub fn touch_viewer(
        &self,
        id: Uuid,
    ) {
        if let Some(entry) = self.lock().viewers.get_mut(&id) {
            entry.last_active = unix_time();
        }
    }

    pub fn record_frame_sent(
        &self,
        id: Uuid,
    ) {
        if let Some(entry) = self.lock().viewers.get_mut(&id) {
            entry.frames_sent += 1;
        }
    }

    /// Merges a servo request into the pose and returns the new pose with
    /// the producer handle, or `None` when no producer is connected. The
    /// merge and the handle snapshot happen under one lock so the forwarded
    /// `control` always matches the acknowledged state.
    pub fn apply_servo(
        &self,
        request: &ServoControl,
    ) -> Option<(ServoState, PeerHandle)> {
        let mut inner = self.lock();
        let producer = inner.producer.clone()?;
        inner.servo.apply(request);
        Some((inner.servo, producer))
    }

    pub fn status_snapshot(&self) -> StatusSnapshot {
        let inner = self.lock();
        StatusSnapshot {
            pi_connected: inner.producer.is_some(),
            wsl_connected: inner.worker.is_some(),
            browser_clients: inner.viewers.len(),
            servo_state: inner.servo,
        }
    }

    fn emit_status(
        &self,
        status: LinkStatus,
    ) {
        // The receiver only drops at shutdown; a failed send is harmless.
        let _ = self.status_tx.send(StatusEvent { status, timestamp: unix_time() });
    }

    fn lock(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use camrelay_proto::ServoControl;

    use super::*;

    fn test_handle(role: Role) -> (PeerHandle, mpsc::Receiver<Message>) {
        let (sender, receiver) = mpsc::channel(8);
        let handle = PeerHandle {
            id: Uuid::new_v4(),
            role,
            addr: "127.0.0.1:9".parse().expect("addr"),
            sender,
        };
        (handle, receiver)
    }

    #[test]
    fn producer_slot_is_exclusive() {
        let (registry, _status_rx) = Registry::new();
        let (first, _rx1) = test_handle(Role::Producer);
        let (second, _rx2) = test_handle(Role::Producer);
        let first_id = first.id;

        assert!(registry.attach_producer(first).is_ok());
        assert_eq!(registry.attach_producer(second), Err(SlotTaken));

        assert_eq!(registry.detach(first_id), Some(Role::Producer));
        let (third, _rx3) = test_handle(Role::Producer);
        assert!(registry.attach_producer(third).is_ok());
    }

    #[test]
    fn worker_slot_is_exclusive() {
        let (registry, _status_rx) = Registry::new();
        let (first, _rx1) = test_handle(Role::Worker);
        let (second, _rx2) = test_handle(Role::Worker);

        assert!(registry.attach_worker(first).is_ok());
        assert_eq!(registry.attach_worker(second), Err(SlotTaken));
    }

    #[test]
    fn detach_is_idempotent() {
        let (registry, _status_rx) = Registry::new();
        let (viewer, _rx) = test_handle(Role::Viewer);
        let id = viewer.id;
        registry.attach_viewer(viewer);

        assert_eq!(registry.detach(id), Some(Role::Viewer));
        assert_eq!(registry.detach(id), None);
    }

    #[test]
    fn producer_lifecycle_emits_ordered_status_events() {
        let (registry, mut status_rx) = Registry::new();
        let (producer, _rx) = test_handle(Role::Producer);
        let id = producer.id;

        registry.attach_producer(producer).expect("attach");
        registry.detach(id);

        let first = status_rx.try_recv().expect("connected event");
        let second = status_rx.try_recv().expect("disconnected event");
        assert_eq!(first.status, LinkStatus::PiConnected);
        assert_eq!(second.status, LinkStatus::PiDisconnected);
        assert!(status_rx.try_recv().is_err());
    }

    #[test]
    fn worker_lifecycle_is_silent() {
        let (registry, mut status_rx) = Registry::new();
        let (worker, _rx) = test_handle(Role::Worker);
        let id = worker.id;

        registry.attach_worker(worker).expect("attach");
        registry.detach(id);
        assert!(status_rx.try_recv().is_err());
    }

    #[test]
    fn servo_requires_a_producer() {
        let (registry, _status_rx) = Registry::new();
        let request = ServoControl { pan: Some(45), tilt: None, roll: None };
        assert!(registry.apply_servo(&request).is_none());
        assert_eq!(registry.status_snapshot().servo_state, ServoState::default());
    }

    #[test]
    fn servo_merge_is_atomic_with_producer_lookup() {
        let (registry, _status_rx) = Registry::new();
        let (producer, _rx) = test_handle(Role::Producer);
        registry.attach_producer(producer).expect("attach");

        let request = ServoControl { pan: Some(45), tilt: Some(60), roll: None };
        let (state, handle) = registry.apply_servo(&request).expect("producer present");
        assert_eq!(state, ServoState { pan: 45, tilt: 60, roll: 0 });
        assert_eq!(handle.role, Role::Producer);
        assert_eq!(registry.status_snapshot().servo_state, state);
    }

    #[test]
    fn viewer_fanout_excludes_requested_peer() {
        let (registry, _status_rx) = Registry::new();
        let (first, _rx1) = test_handle(Role::Viewer);
        let (second, _rx2) = test_handle(Role::Viewer);
        let excluded = first.id;
        registry.attach_viewer(first);
        registry.attach_viewer(second);

        let handles = registry.viewer_handles(Some(excluded));
        assert_eq!(handles.len(), 1);
        assert_ne!(handles[0].id, excluded);
    }
}
