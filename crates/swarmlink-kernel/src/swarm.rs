//! Typed swarm, the application-facing view of a channel.
//!
//! A [`SwarmClient`] keeps, for every known peer, its roster record and the
//! last payload of type `T` it sent. Updates arrive as coordinator events
//! and are republished as [`SwarmEvent`]s.

use crate::callbacks::ResponseHandler;
use crate::coordinator::Coordinator;
use crate::error::KernelResult;
use crate::state::CoordinatorEvent;
use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use swarmlink_types::peer::elapsed_between;
use swarmlink_types::{
    CoordinatorConfig, Envelope, Identity, JsonSerializer, PayloadSerializer, RemotePeer,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Envelope name used for swarm payloads.
pub const SWARM_MESSAGE: &str = "SwarmUpdate";

const EVENT_CAPACITY: usize = 1024;

/// Bounds every swarm payload type satisfies.
pub trait SwarmPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> SwarmPayload for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

/// One peer of the swarm and the last payload it sent.
#[derive(Debug, Clone)]
pub struct SwarmEntry<T> {
    pub peer: RemotePeer,
    /// `None` until the peer sends a payload.
    pub payload: Option<T>,
}

#[derive(Debug, Clone)]
pub enum SwarmEvent<T> {
    Added { peer: RemotePeer, payload: Option<T> },
    Changed { peer: RemotePeer, payload: Option<T> },
    Expired { peer: RemotePeer, payload: Option<T> },
    /// A payload arrived.
    Message {
        envelope: Envelope,
        peer: RemotePeer,
        payload: T,
    },
    /// The swarm finished applying a batch of changes.
    Updated,
    /// A message whose payload could not be decoded was dropped.
    Rejected { envelope: Envelope, reason: String },
}

struct Inner<T, S> {
    coordinator: Coordinator,
    serializer: S,
    entries: DashMap<Identity, SwarmEntry<T>>,
    events: broadcast::Sender<SwarmEvent<T>>,
    expiry: Duration,
}

impl<T, S> Inner<T, S>
where
    T: SwarmPayload,
    S: PayloadSerializer,
{
    fn handle(&self, event: CoordinatorEvent) {
        match event {
            CoordinatorEvent::MessageReceived(envelope) => self.on_message(envelope),
            CoordinatorEvent::RosterUpdated(peers) => self.on_roster(peers),
            CoordinatorEvent::Diagnostic(_) | CoordinatorEvent::ResponseReceived(_) => {}
        }
    }

    fn on_message(&self, envelope: Envelope) {
        let payload: T = match envelope.payload_as(&self.serializer) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    from = %envelope.from,
                    envelope = %envelope.name,
                    error = %e,
                    "Dropping message with malformed payload"
                );
                self.publish(SwarmEvent::Rejected {
                    envelope,
                    reason: e.to_string(),
                });
                return;
            }
        };

        let peer = match self.coordinator.find_peer(&envelope.from) {
            Some(mut known) => {
                known.observe(envelope.clone());
                known
            }
            None => RemotePeer::from_envelope(&envelope),
        };
        self.upsert(peer.clone(), Some(payload.clone()));
        self.expire();
        self.publish(SwarmEvent::Message {
            envelope,
            peer,
            payload,
        });
        self.publish(SwarmEvent::Updated);
    }

    fn on_roster(&self, peers: Vec<RemotePeer>) {
        for peer in peers {
            self.upsert(peer, None);
        }
        self.expire();
        self.publish(SwarmEvent::Updated);
    }

    /// Insert or refresh `peer`. A `None` payload keeps the stored one.
    fn upsert(&self, peer: RemotePeer, payload: Option<T>) {
        let event = match self.entries.entry(peer.identity().clone()) {
            Entry::Occupied(mut slot) => {
                let entry = slot.get_mut();
                if peer.last_seen() >= entry.peer.last_seen() {
                    entry.peer = peer;
                }
                if payload.is_some() {
                    entry.payload = payload;
                }
                SwarmEvent::Changed {
                    peer: entry.peer.clone(),
                    payload: entry.payload.clone(),
                }
            }
            Entry::Vacant(slot) => {
                debug!(peer = %peer.identity(), "Swarm peer added");
                slot.insert(SwarmEntry {
                    peer: peer.clone(),
                    payload: payload.clone(),
                });
                SwarmEvent::Added { peer, payload }
            }
        };
        self.publish(event);
    }

    /// Drop entries not heard from within the expiry threshold.
    fn expire(&self) {
        let now = Utc::now();
        let stale: Vec<Identity> = self
            .entries
            .iter()
            .filter(|e| elapsed_between(e.peer.last_seen(), now) > self.expiry)
            .map(|e| e.key().clone())
            .collect();
        for identity in stale {
            if let Some((_, entry)) = self.entries.remove(&identity) {
                debug!(peer = %identity, "Swarm peer expired");
                self.publish(SwarmEvent::Expired {
                    peer: entry.peer,
                    payload: entry.payload,
                });
            }
        }
    }

    fn publish(&self, event: SwarmEvent<T>) {
        let _ = self.events.send(event);
    }
}

/// Typed peer map over one [`Coordinator`].
///
/// The embedding application must call [`update`](Self::update) on a
/// regular cadence; that is what drives host election and heartbeats.
pub struct SwarmClient<T, S = JsonSerializer> {
    inner: Arc<Inner<T, S>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl<T: SwarmPayload> SwarmClient<T, JsonSerializer> {
    pub fn new(config: CoordinatorConfig) -> KernelResult<Self> {
        Self::with_serializer(config, JsonSerializer)
    }
}

impl<T, S> SwarmClient<T, S>
where
    T: SwarmPayload,
    S: PayloadSerializer,
{
    pub fn with_serializer(config: CoordinatorConfig, serializer: S) -> KernelResult<Self> {
        let expiry = config.thresholds().expiry;
        let coordinator = Coordinator::new(config)?;
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                coordinator,
                serializer,
                entries: DashMap::new(),
                events,
                expiry,
            }),
            listener: Mutex::new(None),
        })
    }

    /// Begin sending and receiving.
    pub async fn start(&self) -> bool {
        {
            let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_none() {
                let rx = self.inner.coordinator.subscribe();
                *slot = Some(tokio::spawn(listen(Arc::clone(&self.inner), rx)));
            }
        }
        self.inner.coordinator.start().await
    }

    /// Stop communicating.
    pub async fn shutdown(&self) {
        let task = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.inner.coordinator.shutdown().await;
    }

    pub fn is_running(&self) -> bool {
        let status = self.inner.coordinator.status();
        self.inner.coordinator.is_running() && (status.is_operational || status.is_connected)
    }

    /// Drive the coordinator: host election, heartbeat, callback sweep.
    pub async fn update(&self) {
        self.inner.coordinator.sync().await;
    }

    /// Send `value` to `to`, or to every known peer when `to` is `None`.
    pub async fn send(
        &self,
        value: &T,
        to: Option<&Identity>,
        handler: Option<ResponseHandler>,
    ) -> KernelResult<()> {
        let envelope = Envelope::with_payload(
            SWARM_MESSAGE,
            self.identity(),
            value,
            &self.inner.serializer,
        )?;
        match to {
            Some(to) => self.inner.coordinator.send(envelope, to, handler).await,
            None => self.inner.coordinator.broadcast(envelope, handler).await,
        }
    }

    /// This process's Client identity.
    pub fn identity(&self) -> Identity {
        self.inner.coordinator.client_identity()
    }

    pub fn client_address(&self) -> Option<String> {
        self.inner.coordinator.client_address()
    }

    pub fn host_address(&self) -> Option<String> {
        self.inner.coordinator.host_address()
    }

    pub fn snapshot(&self) -> Vec<SwarmEntry<T>> {
        self.inner
            .entries
            .iter()
            .map(|e| e.value().clone())
            .collect()
    }

    pub fn get(&self, identity: &Identity) -> Option<SwarmEntry<T>> {
        self.inner.entries.get(identity).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent<T>> {
        self.inner.events.subscribe()
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.inner.coordinator
    }
}

impl<T, S> Drop for SwarmClient<T, S> {
    fn drop(&mut self) {
        let slot = self.listener.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

async fn listen<T, S>(inner: Arc<Inner<T, S>>, mut rx: broadcast::Receiver<CoordinatorEvent>)
where
    T: SwarmPayload,
    S: PayloadSerializer,
{
    loop {
        match rx.recv().await {
            Ok(event) => inner.handle(event),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Swarm client fell behind coordinator events");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
