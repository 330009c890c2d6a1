//! The transport device contract.
//!
//! A device owns one listening endpoint for one [`Identity`]. Inbound frames
//! are decoded into envelopes, stamped on arrival, and pushed onto the
//! device's event channel as [`DeviceEvent::Message`] or
//! [`DeviceEvent::Response`]. Sends are fire-and-forget: failures come back
//! as [`DeviceEvent::Fault`], never as an error to the caller.

use crate::address::{default_local_dir, machine_ipv4, parse_tcp};
use crate::error::{WireError, WireResult};
use crate::frame::read_frame;
use crate::tcp::NetworkDevice;
use async_trait::async_trait;
use chrono::Utc;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use swarmlink_types::{CoordinatorConfig, Envelope, EnvelopeKind, Identity, Role, TransportKind};
use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Result of trying to bind a device's endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// The endpoint is now bound by this device.
    Connected,
    /// Somebody else already holds the endpoint.
    AddressInUse,
    /// Binding failed for another reason.
    Failed,
}

/// Something a device observed.
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    /// A `Message` envelope arrived.
    Message(Envelope),
    /// A `Response` envelope arrived.
    Response(Envelope),
    /// A bind, send or decode problem, for diagnostics only.
    Fault { role: Role, detail: String },
}

#[async_trait]
pub trait TransportDevice: Send + Sync + 'static {
    /// The identity this device listens for.
    fn identity(&self) -> &Identity;

    /// Endpoint address, once it is known.
    ///
    /// Devices that bind an ephemeral port only know it after `start`.
    fn address(&self) -> Option<String>;

    /// Bind the listening endpoint, replacing any previous listener.
    async fn start(&self) -> StartOutcome;

    /// Tear the listener down.
    async fn stop(&self);

    /// Transmit `envelope` to `target` in the background.
    fn send(&self, envelope: Envelope, target: &str);

    fn is_started(&self) -> bool;

    /// Whether the listener is still accepting.
    fn is_operational(&self) -> bool;
}

/// Tuning shared by both transports.
#[derive(Debug, Clone, Copy)]
pub struct DeviceLimits {
    pub max_frame_bytes: u32,
    pub io_timeout: Duration,
}

impl DeviceLimits {
    pub fn from_config(config: &CoordinatorConfig) -> Self {
        Self {
            max_frame_bytes: config.max_frame_bytes,
            io_timeout: config.io_timeout(),
        }
    }
}

/// State common to every device implementation.
pub(crate) struct DeviceCore {
    pub(crate) identity: Identity,
    pub(crate) channel: String,
    pub(crate) events: mpsc::UnboundedSender<DeviceEvent>,
    pub(crate) limits: DeviceLimits,
    listener: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DeviceCore {
    pub(crate) fn new(
        identity: Identity,
        channel: &str,
        events: mpsc::UnboundedSender<DeviceEvent>,
        limits: DeviceLimits,
    ) -> Self {
        Self {
            identity,
            channel: channel.to_string(),
            events,
            limits,
            listener: Mutex::new(None),
            started: AtomicBool::new(false),
        }
    }

    pub(crate) fn role(&self) -> Role {
        self.identity.role()
    }

    pub(crate) fn install_listener(&self, task: JoinHandle<()>) {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(task) {
            old.abort();
        }
        self.started.store(true, Ordering::SeqCst);
    }

    /// Abort the listener and wait until it has released its socket.
    ///
    /// Returns whether a listener was running.
    pub(crate) async fn shutdown_listener(&self) -> bool {
        let task = {
            let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
            slot.take()
        };
        self.started.store(false, Ordering::SeqCst);
        match task {
            Some(task) => {
                task.abort();
                let _ = task.await;
                true
            }
            None => false,
        }
    }

    pub(crate) fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub(crate) fn is_operational(&self) -> bool {
        let slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        slot.as_ref().is_some_and(|task| !task.is_finished())
    }

    pub(crate) fn fault(&self, detail: impl Into<String>) {
        let _ = self.events.send(DeviceEvent::Fault {
            role: self.role(),
            detail: detail.into(),
        });
    }

    /// Serialize `envelope` for transmission, reporting failures as faults.
    pub(crate) fn prepare(&self, envelope: &Envelope) -> Option<Vec<u8>> {
        match envelope.to_json() {
            Ok(body) if body.len() as u64 <= self.limits.max_frame_bytes as u64 => Some(body),
            Ok(body) => {
                let err = WireError::FrameTooLarge {
                    size: body.len() as u64,
                    max: self.limits.max_frame_bytes,
                };
                warn!(envelope = %envelope.name, "Dropping outbound envelope: {err}");
                self.fault(format!("send {}: {err}", envelope.name));
                None
            }
            Err(e) => {
                warn!(envelope = %envelope.name, error = %e, "Failed to encode envelope");
                self.fault(format!("send {}: {e}", envelope.name));
                None
            }
        }
    }
}

/// Read frames from one inbound connection until the peer closes it.
///
/// A connection that stays silent for `limits.io_timeout` is dropped.
pub(crate) async fn serve_connection<S>(
    mut stream: S,
    events: mpsc::UnboundedSender<DeviceEvent>,
    role: Role,
    limits: DeviceLimits,
) where
    S: AsyncRead + Unpin,
{
    loop {
        let read = tokio::time::timeout(
            limits.io_timeout,
            read_frame(&mut stream, limits.max_frame_bytes),
        )
        .await
        .unwrap_or(Err(WireError::Timeout(limits.io_timeout)));
        match read {
            Ok(body) => deliver(&events, role, &body),
            Err(WireError::ConnectionClosed) => break,
            Err(WireError::Timeout(idle)) => {
                debug!(role = %role, idle = ?idle, "Closing idle inbound connection");
                break;
            }
            Err(e) => {
                warn!(role = %role, error = %e, "Inbound connection failed");
                let _ = events.send(DeviceEvent::Fault {
                    role,
                    detail: format!("inbound connection: {e}"),
                });
                break;
            }
        }
    }
}

impl Drop for DeviceCore {
    fn drop(&mut self) {
        let slot = self.listener.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(task) = slot.take() {
            task.abort();
        }
    }
}

/// Decode one inbound frame and deliver it on `events`.
pub(crate) fn deliver(events: &mpsc::UnboundedSender<DeviceEvent>, role: Role, body: &[u8]) {
    match Envelope::from_json(body) {
        Ok(mut envelope) => {
            envelope.mark_received(Utc::now());
            debug!(
                from = %envelope.from.name(),
                name = %envelope.name,
                kind = ?envelope.kind,
                "Frame received"
            );
            let event = match envelope.kind {
                EnvelopeKind::Response => DeviceEvent::Response(envelope),
                EnvelopeKind::Message => DeviceEvent::Message(envelope),
            };
            let _ = events.send(event);
        }
        Err(e) => {
            warn!(role = %role, error = %e, "Discarding undecodable frame");
            let _ = events.send(DeviceEvent::Fault {
                role,
                detail: format!("undecodable frame: {e}"),
            });
        }
    }
}

/// The two devices of one coordinator.
pub struct DevicePair {
    pub host: Box<dyn TransportDevice>,
    pub client: Box<dyn TransportDevice>,
}

/// Build the Host and Client devices described by `config`.
///
/// Both devices report to the same `events` channel.
pub fn open_devices(
    config: &CoordinatorConfig,
    host: Identity,
    client: Identity,
    events: mpsc::UnboundedSender<DeviceEvent>,
) -> WireResult<DevicePair> {
    let channel = config.channel_name();
    let limits = DeviceLimits::from_config(config);

    match config.transport {
        TransportKind::Network => {
            let host_addr = match &config.host_address {
                Some(addr) => parse_tcp(addr)?,
                None => SocketAddr::new(IpAddr::V4(machine_ipv4()), config.host_port),
            };
            // A loopback Host implies a single-machine channel.
            let client_ip = config.bind_ip.unwrap_or_else(|| {
                if host_addr.ip().is_loopback() {
                    host_addr.ip()
                } else {
                    IpAddr::V4(machine_ipv4())
                }
            });
            let client_addr = SocketAddr::new(client_ip, 0);
            Ok(DevicePair {
                host: Box::new(NetworkDevice::new(host, channel, host_addr, events.clone(), limits)),
                client: Box::new(NetworkDevice::new(client, channel, client_addr, events, limits)),
            })
        }
        #[cfg(unix)]
        TransportKind::Local => {
            use crate::ipc::LocalDevice;
            let dir = config.local_dir.clone().unwrap_or_else(default_local_dir);
            Ok(DevicePair {
                host: Box::new(LocalDevice::new(host, channel, &dir, events.clone(), limits)?),
                client: Box::new(LocalDevice::new(client, channel, &dir, events, limits)?),
            })
        }
        #[cfg(not(unix))]
        TransportKind::Local => {
            let _ = default_local_dir;
            Err(WireError::Unsupported(
                "local transport requires Unix domain sockets".to_string(),
            ))
        }
    }
}
