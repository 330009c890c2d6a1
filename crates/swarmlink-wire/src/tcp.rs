//! TCP transport.
//!
//! The Host device binds the channel's well-known socket address; a Client
//! device binds port 0 on its machine address, so its endpoint is only known
//! after `start`. Every outbound envelope uses its own short-lived
//! connection: connect, write one frame, shut down.

use crate::address::{parse_tcp, tcp_endpoint};
use crate::device::{
    serve_connection, DeviceCore, DeviceEvent, DeviceLimits, StartOutcome, TransportDevice,
};
use crate::error::{WireError, WireResult};
use crate::frame::write_frame;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use swarmlink_types::{Envelope, Identity, Role};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct NetworkDevice {
    core: Arc<DeviceCore>,
    bind_addr: SocketAddr,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl NetworkDevice {
    pub fn new(
        identity: Identity,
        channel: &str,
        bind_addr: SocketAddr,
        events: mpsc::UnboundedSender<DeviceEvent>,
        limits: DeviceLimits,
    ) -> Self {
        Self {
            core: Arc::new(DeviceCore::new(identity, channel, events, limits)),
            bind_addr,
            local_addr: Mutex::new(None),
        }
    }

    /// The bound socket address, or the configured one before binding.
    pub fn socket_addr(&self) -> Option<SocketAddr> {
        let bound = *self.local_addr.lock().unwrap_or_else(|e| e.into_inner());
        bound.or_else(|| (self.bind_addr.port() != 0).then_some(self.bind_addr))
    }

    async fn accept_loop(
        listener: TcpListener,
        events: mpsc::UnboundedSender<DeviceEvent>,
        role: Role,
        limits: DeviceLimits,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(role = %role, peer = %addr, "Accepted connection");
                    tokio::spawn(serve_connection(stream, events.clone(), role, limits));
                }
                Err(e) => {
                    warn!(role = %role, error = %e, "Accept failed");
                    let _ = events.send(DeviceEvent::Fault {
                        role,
                        detail: format!("accept: {e}"),
                    });
                    break;
                }
            }
        }
    }

    async fn transmit(addr: SocketAddr, body: Vec<u8>, max: u32) -> WireResult<()> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &body, max).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl TransportDevice for NetworkDevice {
    fn identity(&self) -> &Identity {
        &self.core.identity
    }

    fn address(&self) -> Option<String> {
        self.socket_addr()
            .map(|addr| tcp_endpoint(addr, &self.core.identity, &self.core.channel))
    }

    async fn start(&self) -> StartOutcome {
        self.core.shutdown_listener().await;
        let role = self.core.role();

        let listener = match TcpListener::bind(self.bind_addr).await {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                debug!(role = %role, addr = %self.bind_addr, "Address already in use");
                return StartOutcome::AddressInUse;
            }
            Err(e) => {
                warn!(role = %role, addr = %self.bind_addr, error = %e, "Bind failed");
                self.core.fault(format!("bind {}: {e}", self.bind_addr));
                return StartOutcome::Failed;
            }
        };

        let local = match listener.local_addr() {
            Ok(local) => local,
            Err(e) => {
                self.core.fault(format!("local_addr: {e}"));
                return StartOutcome::Failed;
            }
        };
        *self.local_addr.lock().unwrap_or_else(|e| e.into_inner()) = Some(local);
        info!(role = %role, addr = %local, "TCP device listening");

        let task = tokio::spawn(Self::accept_loop(
            listener,
            self.core.events.clone(),
            self.core.role(),
            self.core.limits,
        ));
        self.core.install_listener(task);
        StartOutcome::Connected
    }

    async fn stop(&self) {
        if self.core.shutdown_listener().await {
            info!(role = %self.core.role(), "TCP device stopped");
        }
    }

    fn send(&self, envelope: Envelope, target: &str) {
        let addr = match parse_tcp(target) {
            Ok(addr) => addr,
            Err(e) => {
                warn!(address = target, error = %e, "Cannot route envelope");
                self.core.fault(format!("send {}: {e}", envelope.name));
                return;
            }
        };
        let Some(body) = self.core.prepare(&envelope) else {
            return;
        };

        let core = Arc::clone(&self.core);
        let name = envelope.name;
        tokio::spawn(async move {
            let limits = core.limits;
            let result = tokio::time::timeout(
                limits.io_timeout,
                Self::transmit(addr, body, limits.max_frame_bytes),
            )
            .await
            .unwrap_or(Err(WireError::Timeout(limits.io_timeout)));
            if let Err(e) = result {
                log_send_failure(core.role(), &name, addr, &e);
                core.fault(format!("send {name} to {addr}: {e}"));
            }
        });
    }

    fn is_started(&self) -> bool {
        self.core.is_started()
    }

    fn is_operational(&self) -> bool {
        self.core.is_operational()
    }
}

fn log_send_failure(role: Role, name: &str, addr: SocketAddr, err: &WireError) {
    // Unreachable peers are routine while a channel is forming.
    match err {
        WireError::Io(_) | WireError::Timeout(_) => {
            debug!(role = %role, envelope = name, peer = %addr, error = %err, "Send failed")
        }
        _ => warn!(role = %role, envelope = name, peer = %addr, error = %err, "Send failed"),
    }
}
