//! Host election, heartbeat and routing for one process.
//!
//! A [`Coordinator`] owns a Host-role and a Client-role transport device.
//! Whichever process binds the channel's Host address first acts as Host
//! and keeps the authoritative roster; everyone else pings it. Inbound
//! device events are consumed by a single dispatch task, and every state
//! change goes through [`ProtocolState`] under one mutex that is never held
//! across an `.await`.

use crate::callbacks::ResponseHandler;
use crate::error::{KernelError, KernelResult};
use crate::state::{CoordinatorEvent, CoordinatorStatus, Effects, HostAction, ProtocolState};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use swarmlink_types::{CoordinatorConfig, Envelope, Identity, RemotePeer, Role};
use swarmlink_wire::{open_devices, DeviceEvent, TransportDevice};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the coordinator event channel.
const EVENT_CAPACITY: usize = 1024;

struct Shared {
    config: CoordinatorConfig,
    host_device: Box<dyn TransportDevice>,
    client_device: Box<dyn TransportDevice>,
    state: Mutex<ProtocolState>,
    events: broadcast::Sender<CoordinatorEvent>,
    inbound: Mutex<Option<mpsc::UnboundedReceiver<DeviceEvent>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Drop for Shared {
    fn drop(&mut self) {
        let slot = self.dispatcher.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

/// Handle to a coordinator. Clones share the same coordinator.
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    /// Build a coordinator and its devices. Nothing is bound until `start`.
    pub fn new(config: CoordinatorConfig) -> KernelResult<Self> {
        config
            .validate()
            .map_err(|e| KernelError::Config(e.to_string()))?;

        let channel = config.channel_name().to_string();
        let pid = std::process::id();
        let host = Identity::host(pid, &channel);
        let client = Identity::client(pid, &channel, &config.instance_id());

        let (tx, rx) = mpsc::unbounded_channel();
        let devices = open_devices(&config, host.clone(), client.clone(), tx)?;

        let mut state = ProtocolState::new(&config, host, client);
        if let Some(address) = devices.host.address() {
            state.set_host_address(address);
        }
        if let Some(address) = devices.client.address() {
            state.set_client_address(address);
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                host_device: devices.host,
                client_device: devices.client,
                state: Mutex::new(state),
                events,
                inbound: Mutex::new(Some(rx)),
                dispatcher: Mutex::new(None),
                running: AtomicBool::new(false),
            }),
        })
    }

    /// Bind the Client endpoint and run the first sync.
    ///
    /// Returns whether the Client endpoint is operational.
    pub async fn start(&self) -> bool {
        self.spawn_dispatcher();

        let outcome = self.shared.client_device.start().await;
        let operational = self.shared.client_device.is_operational();
        {
            let mut state = self.lock();
            if let Some(address) = self.shared.client_device.address() {
                state.set_client_address(address);
            }
            state.set_operational(operational);
        }
        self.shared.running.store(operational, Ordering::SeqCst);

        let client = self.client_identity();
        info!(
            client = %client,
            address = client.address().unwrap_or("-"),
            outcome = ?outcome,
            "Coordinator started"
        );

        if operational {
            self.sync().await;
        }
        operational
    }

    /// Stop both devices and release every pending handler.
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        let effects = self.lock().shutdown();
        self.execute(effects);
        self.shared.client_device.stop().await;
        self.shared.host_device.stop().await;
        info!(client = %self.client_identity(), "Coordinator shut down");
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Make sure a Host exists, becoming it if possible, then ping it.
    ///
    /// Runs at most once per sync interval; extra calls return immediately.
    pub async fn sync(&self) {
        if !self.is_running() {
            return;
        }
        let host = &self.shared.host_device;
        let (started, operational) = (host.is_started(), host.is_operational());
        let plan = self.lock().begin_sync(Utc::now(), started, operational);
        let Some(plan) = plan else {
            return;
        };
        self.execute(plan.effects);

        match plan.action {
            HostAction::Bind => {
                let outcome = host.start().await;
                let effects = self.lock().apply_bind(outcome);
                self.execute(effects);
            }
            HostAction::Demote => {
                warn!(host = %self.host_identity(), "Host listener stopped, demoting");
                host.stop().await;
            }
            HostAction::Keep => {}
        }

        self.ping();
    }

    /// Send a heartbeat to the Host.
    pub fn ping(&self) {
        let effects = self.lock().ping(Utc::now());
        self.execute(effects);
    }

    /// Ask the Host for its roster (throttled).
    pub fn request_roster(&self) {
        let effects = self.lock().request_roster(Utc::now());
        self.execute(effects);
    }

    /// Send `envelope` to `to`. `handler` runs once with the response, or
    /// with an error if none arrives within the callback timeout.
    ///
    /// While no Host has answered recently the send is queued and a sync is
    /// triggered; queued sends go out in order after the next Pong.
    pub async fn send(
        &self,
        envelope: Envelope,
        to: &Identity,
        handler: Option<ResponseHandler>,
    ) -> KernelResult<()> {
        self.ensure_running()?;
        let effects = self
            .lock()
            .send(envelope, to.clone(), handler, Utc::now());
        if self.execute(effects) {
            self.sync().await;
        }
        Ok(())
    }

    /// Send `envelope` to every peer of the current roster.
    pub async fn broadcast(
        &self,
        envelope: Envelope,
        handler: Option<ResponseHandler>,
    ) -> KernelResult<()> {
        self.ensure_running()?;
        let effects = self.lock().broadcast(envelope, handler, Utc::now());
        if self.execute(effects) {
            self.sync().await;
        }
        Ok(())
    }

    pub fn status(&self) -> CoordinatorStatus {
        self.lock().status().clone()
    }

    /// The roster as last received from the Host.
    pub fn roster(&self) -> Vec<RemotePeer> {
        self.lock().client_roster().to_vec()
    }

    /// The roster this process maintains while acting as Host.
    pub fn host_roster(&self) -> Vec<RemotePeer> {
        self.lock().host_roster().to_vec()
    }

    /// Look up `identity` in the client roster.
    pub fn find_peer(&self, identity: &Identity) -> Option<RemotePeer> {
        self.lock().client_roster().get(identity).cloned()
    }

    pub fn host_identity(&self) -> Identity {
        self.lock().host().clone()
    }

    pub fn client_identity(&self) -> Identity {
        self.lock().client().clone()
    }

    pub fn host_address(&self) -> Option<String> {
        self.shared.host_device.address()
    }

    pub fn client_address(&self) -> Option<String> {
        self.shared.client_device.address()
    }

    pub fn is_me(&self, id: &Identity) -> bool {
        self.lock().is_me(id)
    }

    pub fn is_me_as_host(&self, id: &Identity) -> bool {
        self.lock().is_me_as_host(id)
    }

    pub fn is_me_as_client(&self, id: &Identity) -> bool {
        self.lock().is_me_as_client(id)
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.shared.config
    }

    /// Subscribe to coordinator events.
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.shared.events.subscribe()
    }

    pub fn pending_callbacks(&self) -> usize {
        self.lock().pending_callbacks()
    }

    pub fn deferred_len(&self) -> usize {
        self.lock().deferred_len()
    }

    fn lock(&self) -> MutexGuard<'_, ProtocolState> {
        self.shared.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn ensure_running(&self) -> KernelResult<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(KernelError::NotRunning)
        }
    }

    /// Carry out `effects`. Returns whether a sync was requested.
    fn execute(&self, effects: Effects) -> bool {
        for out in effects.sends {
            let device = match out.via {
                Role::Host => &self.shared.host_device,
                Role::Client => &self.shared.client_device,
            };
            device.send(out.envelope, &out.target);
        }
        for event in effects.events {
            let _ = self.shared.events.send(event);
        }
        for completion in effects.completions {
            completion.run();
        }
        effects.trigger_sync
    }

    fn spawn_dispatcher(&self) {
        let Some(rx) = self
            .shared
            .inbound
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        else {
            return;
        };
        let task = tokio::spawn(dispatch_loop(Arc::downgrade(&self.shared), rx));
        *self
            .shared
            .dispatcher
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(task);
    }

    fn handle_device_event(&self, event: DeviceEvent) {
        let effects = match event {
            DeviceEvent::Message(envelope) => self.lock().handle_message(envelope, Utc::now()),
            DeviceEvent::Response(envelope) => {
                let host_started = self.shared.host_device.is_started();
                self.lock()
                    .handle_response(envelope, Utc::now(), host_started)
            }
            DeviceEvent::Fault { role, detail } => {
                let _ = self
                    .shared
                    .events
                    .send(CoordinatorEvent::Diagnostic(format!("{role} device: {detail}")));
                return;
            }
        };
        self.execute(effects);
    }
}

/// Consume device events until every device is gone.
async fn dispatch_loop(shared: Weak<Shared>, mut rx: mpsc::UnboundedReceiver<DeviceEvent>) {
    while let Some(event) = rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        Coordinator { shared }.handle_device_event(event);
    }
    debug!("Coordinator dispatch loop finished");
}
