//! Broadcast hub: the registry of live subscriber sessions and the single
//! control loop that fans inbound uplinks out to them.
//!
//! All registry mutation and every dispatch decision happens inside
//! [`Hub::run`], which is reached only through three channels (register,
//! unregister, inbound message). That single-consumer ownership is the
//! design's correctness mechanism: no locks, no concurrent mutation, and a
//! publish pass always sees a consistent registry snapshot.
//!
//! Delivery is best-effort. Enqueueing onto a session's outbound queue is
//! non-blocking; a session whose queue is full is evicted in the same pass
//! so one stalled subscriber cannot hold up the rest.

mod filter;

pub use filter::SubscriptionFilter;

use std::collections::HashMap;

use log::{debug, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::message::UplinkMessage;

/// Size of the inbound message channel feeding the control loop.
const INBOUND_BUFFER_SIZE: usize = 256;

/// Size of the register/unregister control channels.
const CONTROL_BUFFER_SIZE: usize = 32;

/// Size of the per-session outbound queue.
const OUTBOUND_BUFFER_SIZE: usize = 64;

/// Identity of a session in the registry.
pub type SessionId = Uuid;

/// One subscriber connection as the hub sees it: a filter fixed at
/// construction time and the sending half of its outbound queue.
///
/// The hub owns the `Session` once it is registered; the paired receiver
/// stays with the connection's writer task. Dropping the `Session` (on
/// unregistration or eviction) closes the queue, which happens exactly once
/// because the value lives in the registry until removal.
pub struct Session {
    id: SessionId,
    filter: SubscriptionFilter,
    outbound: mpsc::Sender<String>,
}

impl Session {
    /// Create a session and the receiving half of its outbound queue.
    pub fn new(filter: SubscriptionFilter) -> (Self, mpsc::Receiver<String>) {
        Self::with_queue_capacity(filter, OUTBOUND_BUFFER_SIZE)
    }

    /// Like [`Session::new`] with an explicit outbound queue capacity.
    pub fn with_queue_capacity(
        filter: SubscriptionFilter,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<String>) {
        let (outbound, rx) = mpsc::channel(capacity);
        let session = Self {
            id: Uuid::new_v4(),
            filter,
            outbound,
        };
        (session, rx)
    }

    pub fn id(&self) -> SessionId {
        self.id
    }
}

/// Cloneable entry point to the hub's control loop.
///
/// All three operations are fire-and-forget events; they may await channel
/// capacity when the loop is busy (the accepted backpressure point for the
/// ingestion side) but never wait for the event to be applied.
#[derive(Clone)]
pub struct HubHandle {
    register_tx: mpsc::Sender<Session>,
    unregister_tx: mpsc::Sender<SessionId>,
    inbound_tx: mpsc::Sender<UplinkMessage>,
}

impl HubHandle {
    /// Hand a session to the hub. It becomes eligible for uplinks published
    /// after the loop applies the registration.
    pub async fn register(&self, session: Session) {
        if self.register_tx.send(session).await.is_err() {
            warn!("hub is gone, dropping registration");
        }
    }

    /// Remove a session. Unknown or already-removed ids are a no-op.
    pub async fn unregister(&self, id: SessionId) {
        if self.unregister_tx.send(id).await.is_err() {
            warn!("hub is gone, dropping unregistration");
        }
    }

    /// Feed one uplink into the dispatch loop.
    pub async fn publish(&self, message: UplinkMessage) {
        if self.inbound_tx.send(message).await.is_err() {
            warn!("hub is gone, dropping uplink");
        }
    }
}

/// The registry and its control loop. Constructed once at startup; consumed
/// by [`Hub::run`] on a dedicated task.
pub struct Hub {
    sessions: HashMap<SessionId, Session>,
    register_rx: mpsc::Receiver<Session>,
    unregister_rx: mpsc::Receiver<SessionId>,
    inbound_rx: mpsc::Receiver<UplinkMessage>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        let (register_tx, register_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
        let (unregister_tx, unregister_rx) = mpsc::channel(CONTROL_BUFFER_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_BUFFER_SIZE);
        let hub = Self {
            sessions: HashMap::new(),
            register_rx,
            unregister_rx,
            inbound_rx,
        };
        let handle = HubHandle {
            register_tx,
            unregister_tx,
            inbound_tx,
        };
        (hub, handle)
    }

    /// The control loop. Runs until every [`HubHandle`] is dropped; nothing
    /// a session or message does can make it exit earlier.
    pub async fn run(mut self) {
        info!("broadcast hub started");
        loop {
            tokio::select! {
                Some(session) = self.register_rx.recv() => self.add_session(session),
                Some(id) = self.unregister_rx.recv() => self.remove_session(id),
                Some(message) = self.inbound_rx.recv() => self.broadcast(&message),
                else => break,
            }
        }
        info!("broadcast hub stopped");
    }

    fn add_session(&mut self, session: Session) {
        let id = session.id;
        if self.sessions.contains_key(&id) {
            // Dropping the duplicate closes its queue; the id stays bound
            // to the session registered first.
            warn!("session {id} is already registered, ignoring duplicate");
            return;
        }
        debug!("registered session {id} with filter {:?}", session.filter);
        self.sessions.insert(id, session);
    }

    fn remove_session(&mut self, id: SessionId) {
        if self.sessions.remove(&id).is_some() {
            debug!("unregistered session {id}");
        }
    }

    /// One dispatch pass over the registry snapshot. Sessions that fail to
    /// accept the frame are evicted before the pass returns.
    fn broadcast(&mut self, message: &UplinkMessage) {
        let mut evicted = Vec::new();
        for session in self.sessions.values() {
            if !session.filter.matches(message) {
                continue;
            }
            let frame = match serde_json::to_string(message) {
                Ok(frame) => frame,
                Err(err) => {
                    warn!("skipping session {}: cannot serialize uplink: {err}", session.id);
                    continue;
                }
            };
            match session.outbound.try_send(frame) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!("session {} is not draining its queue, evicting", session.id);
                    evicted.push(session.id);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("session {} queue already closed, evicting", session.id);
                    evicted.push(session.id);
                }
            }
        }
        for id in evicted {
            self.sessions.remove(&id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;
    use tokio::sync::mpsc::error::TryRecvError;

    fn uplink(dev_id: &str) -> UplinkMessage {
        UplinkMessage {
            app_id: "mapper".to_string(),
            dev_id: dev_id.to_string(),
            user_id: String::new(),
            experiment: String::new(),
            payload: Map::new(),
        }
    }

    fn dev_filter(dev_id: &str) -> SubscriptionFilter {
        SubscriptionFilter {
            dev_id: Some(dev_id.to_string()),
            ..Default::default()
        }
    }

    fn recv_dev_id(rx: &mut mpsc::Receiver<String>) -> String {
        let frame = rx.try_recv().expect("expected a delivery");
        let message: UplinkMessage = serde_json::from_str(&frame).unwrap();
        message.dev_id
    }

    #[test]
    fn pinned_and_wildcard_sessions_fan_out() {
        let (mut hub, _handle) = Hub::new();
        let (pinned, mut pinned_rx) = Session::new(dev_filter("dev1"));
        let (wildcard, mut wildcard_rx) = Session::new(SubscriptionFilter::default());
        hub.add_session(pinned);
        hub.add_session(wildcard);

        hub.broadcast(&uplink("dev1"));
        assert_eq!(recv_dev_id(&mut pinned_rx), "dev1");
        assert_eq!(recv_dev_id(&mut wildcard_rx), "dev1");

        hub.broadcast(&uplink("dev2"));
        assert_eq!(recv_dev_id(&mut wildcard_rx), "dev2");
        assert!(matches!(pinned_rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn one_delivery_per_matching_message() {
        let (mut hub, _handle) = Hub::new();
        let (session, mut rx) = Session::new(SubscriptionFilter::default());
        hub.add_session(session);

        hub.broadcast(&uplink("dev1"));
        assert_eq!(recv_dev_id(&mut rx), "dev1");
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Empty)));
    }

    #[test]
    fn slow_session_is_evicted_without_disturbing_others() {
        let (mut hub, _handle) = Hub::new();
        let (slow, mut slow_rx) = Session::with_queue_capacity(SubscriptionFilter::default(), 1);
        let (healthy, mut healthy_rx) = Session::new(SubscriptionFilter::default());
        let slow_id = slow.id();
        hub.add_session(slow);
        hub.add_session(healthy);

        // First uplink fills the slow session's single-slot queue.
        hub.broadcast(&uplink("dev1"));
        assert_eq!(recv_dev_id(&mut healthy_rx), "dev1");

        // Second uplink finds the slow queue full: evict it, deliver to the
        // rest within the same pass.
        hub.broadcast(&uplink("dev2"));
        assert_eq!(recv_dev_id(&mut healthy_rx), "dev2");
        assert!(!hub.sessions.contains_key(&slow_id));

        // The slow subscriber keeps its backlog, then sees the queue close.
        assert_eq!(recv_dev_id(&mut slow_rx), "dev1");
        assert!(matches!(slow_rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn unregister_is_idempotent() {
        let (mut hub, _handle) = Hub::new();
        let (session, mut rx) = Session::new(SubscriptionFilter::default());
        let id = session.id();
        hub.add_session(session);

        hub.remove_session(id);
        hub.remove_session(id);
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn unregister_before_any_publish_closes_the_queue() {
        let (mut hub, _handle) = Hub::new();
        let (session, mut rx) = Session::new(SubscriptionFilter::default());
        let id = session.id();
        hub.add_session(session);
        hub.remove_session(id);

        hub.broadcast(&uplink("dev1"));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn unregistered_session_stays_silent() {
        let (mut hub, _handle) = Hub::new();
        let (session, mut rx) = Session::new(SubscriptionFilter::default());
        let id = session.id();
        hub.add_session(session);

        hub.broadcast(&uplink("dev1"));
        assert_eq!(recv_dev_id(&mut rx), "dev1");

        hub.remove_session(id);
        hub.broadcast(&uplink("dev2"));
        assert!(matches!(rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let (mut hub, _handle) = Hub::new();
        let (session, mut rx) = Session::new(SubscriptionFilter::default());
        let id = session.id();
        hub.add_session(session);

        let (dup_tx, mut dup_rx) = mpsc::channel(OUTBOUND_BUFFER_SIZE);
        hub.add_session(Session {
            id,
            filter: SubscriptionFilter::default(),
            outbound: dup_tx,
        });

        // The original session is still the one receiving deliveries; the
        // duplicate's queue closed when it was dropped.
        hub.broadcast(&uplink("dev1"));
        assert_eq!(recv_dev_id(&mut rx), "dev1");
        assert!(matches!(dup_rx.try_recv(), Err(TryRecvError::Disconnected)));
    }

    #[tokio::test]
    async fn control_loop_registers_and_unregisters() {
        let (hub, handle) = Hub::new();
        tokio::spawn(hub.run());

        let (session, mut rx) = Session::new(dev_filter("dev1"));
        let id = session.id();

        handle.register(session).await;
        // The three event channels are independent; give the loop a moment
        // to apply the registration before racing it with the removal.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        handle.unregister(id).await;

        let closed = tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("queue should close after unregistration");
        assert!(closed.is_none());
    }
}
