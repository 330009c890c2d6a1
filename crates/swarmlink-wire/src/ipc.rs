//! Local transport over Unix domain sockets.
//!
//! Each endpoint is a socket file under a shared directory, reachable only
//! from this machine. A socket file left behind by a crashed process is
//! detected by a failed connect and replaced. Binding, and any takeover of a
//! stale file, happens under an exclusive lock on a sibling `.lock` file.

use crate::address::{ipc_endpoint, local_socket_path};
use crate::device::{
    serve_connection, DeviceCore, DeviceEvent, DeviceLimits, StartOutcome, TransportDevice,
};
use crate::error::{WireError, WireResult};
use crate::frame::write_frame;
use async_trait::async_trait;
use fs2::FileExt;
use std::fs::OpenOptions;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use swarmlink_types::{Envelope, Identity, Role};
use tokio::io::AsyncWriteExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

enum BindError {
    InUse,
    Failed(String),
}

/// Bind `path` while holding the directory's lock for it.
fn bind_exclusive(path: &Path) -> Result<StdUnixListener, BindError> {
    let lock_path = path.with_extension("lock");
    let lock = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .map_err(|e| BindError::Failed(format!("open {}: {e}", lock_path.display())))?;
    FileExt::lock_exclusive(&lock)
        .map_err(|e| BindError::Failed(format!("lock {}: {e}", lock_path.display())))?;
    let bound = bind_or_reclaim(path);
    let _ = FileExt::unlock(&lock);
    bound
}

/// Bind, taking over a socket file nobody is listening on.
fn bind_or_reclaim(path: &Path) -> Result<StdUnixListener, BindError> {
    match StdUnixListener::bind(path) {
        Ok(listener) => return Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {}
        Err(e) => return Err(BindError::Failed(format!("bind {}: {e}", path.display()))),
    }

    if StdUnixStream::connect(path).is_ok() {
        return Err(BindError::InUse);
    }

    debug!(path = %path.display(), "Reclaiming stale socket");
    let _ = std::fs::remove_file(path);
    match StdUnixListener::bind(path) {
        Ok(listener) => Ok(listener),
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => Err(BindError::InUse),
        Err(e) => Err(BindError::Failed(format!("bind {}: {e}", path.display()))),
    }
}

pub struct LocalDevice {
    core: Arc<DeviceCore>,
    endpoint: String,
    path: PathBuf,
}

impl LocalDevice {
    /// Fails when `dir` is too long to hold a Unix socket.
    pub fn new(
        identity: Identity,
        channel: &str,
        dir: &Path,
        events: mpsc::UnboundedSender<DeviceEvent>,
        limits: DeviceLimits,
    ) -> WireResult<Self> {
        let endpoint = ipc_endpoint(dir, &identity, channel);
        let path = local_socket_path(&endpoint)?;
        Ok(Self {
            core: Arc::new(DeviceCore::new(identity, channel, events, limits)),
            endpoint,
            path,
        })
    }

    /// Filesystem path of this device's socket.
    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    async fn bind(&self) -> Result<UnixListener, StartOutcome> {
        let role = self.core.role();
        if let Some(parent) = self.path.parent() {
            if let Err(e) = tokio::fs::create_dir_all(parent).await {
                warn!(role = %role, path = %parent.display(), error = %e, "Cannot create socket directory");
                self.core.fault(format!("create {}: {e}", parent.display()));
                return Err(StartOutcome::Failed);
            }
        }

        let path = self.path.clone();
        let bound = tokio::task::spawn_blocking(move || bind_exclusive(&path))
            .await
            .unwrap_or_else(|e| Err(BindError::Failed(format!("bind task: {e}"))));
        let listener = match bound {
            Ok(listener) => listener,
            Err(BindError::InUse) => {
                debug!(role = %role, path = %self.path.display(), "Socket already in use");
                return Err(StartOutcome::AddressInUse);
            }
            Err(BindError::Failed(detail)) => {
                warn!(role = %role, %detail, "Bind failed");
                self.core.fault(detail);
                return Err(StartOutcome::Failed);
            }
        };

        let converted = listener
            .set_nonblocking(true)
            .and_then(|()| UnixListener::from_std(listener));
        converted.map_err(|e| {
            self.core.fault(format!("listen {}: {e}", self.path.display()));
            StartOutcome::Failed
        })
    }

    async fn accept_loop(
        listener: UnixListener,
        events: mpsc::UnboundedSender<DeviceEvent>,
        role: Role,
        limits: DeviceLimits,
    ) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
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

    async fn transmit(path: PathBuf, body: Vec<u8>, max: u32) -> WireResult<()> {
        let mut stream = UnixStream::connect(&path).await?;
        write_frame(&mut stream, &body, max).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

#[async_trait]
impl TransportDevice for LocalDevice {
    fn identity(&self) -> &Identity {
        &self.core.identity
    }

    fn address(&self) -> Option<String> {
        Some(self.endpoint.clone())
    }

    async fn start(&self) -> StartOutcome {
        self.core.shutdown_listener().await;
        let listener = match self.bind().await {
            Ok(listener) => listener,
            Err(outcome) => return outcome,
        };
        info!(
            role = %self.core.role(),
            endpoint = %self.endpoint,
            path = %self.path.display(),
            "Local device listening"
        );
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
            let _ = tokio::fs::remove_file(&self.path).await;
            info!(role = %self.core.role(), "Local device stopped");
        }
    }

    fn send(&self, envelope: Envelope, target: &str) {
        let path = match local_socket_path(target) {
            Ok(path) => path,
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
        let target = target.to_string();
        tokio::spawn(async move {
            let limits = core.limits;
            let result = tokio::time::timeout(
                limits.io_timeout,
                Self::transmit(path, body, limits.max_frame_bytes),
            )
            .await
            .unwrap_or(Err(WireError::Timeout(limits.io_timeout)));
            if let Err(e) = result {
                debug!(role = %core.role(), envelope = %name, address = %target, error = %e, "Send failed");
                core.fault(format!("send {name} to {target}: {e}"));
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

impl Drop for LocalDevice {
    fn drop(&mut self) {
        if self.core.is_started() {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const LONG_DIR_LEN: usize = 120;

    fn limits() -> DeviceLimits {
        DeviceLimits {
            max_frame_bytes: 1024 * 1024,
            io_timeout: Duration::from_secs(5),
        }
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<DeviceEvent>) -> DeviceEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for device event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_only_one_host_per_channel() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = LocalDevice::new(Identity::host(1, "Group1"), "Group1", dir.path(), tx.clone(), limits()).unwrap();
        let second = LocalDevice::new(Identity::host(2, "Group1"), "Group1", dir.path(), tx, limits()).unwrap();

        assert_eq!(first.start().await, StartOutcome::Connected);
        assert_eq!(second.start().await, StartOutcome::AddressInUse);
        assert!(first.socket_path().exists());

        first.stop().await;
        assert!(!first.socket_path().exists());
        assert_eq!(second.start().await, StartOutcome::Connected);
        second.stop().await;
    }

    #[tokio::test]
    async fn test_stale_socket_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let device = LocalDevice::new(Identity::host(1, "Group1"), "Group1", dir.path(), tx, limits()).unwrap();

        // A bound std listener that is dropped leaves its socket file behind.
        std::fs::create_dir_all(device.socket_path().parent().unwrap()).unwrap();
        drop(std::os::unix::net::UnixListener::bind(device.socket_path()).unwrap());
        assert!(device.socket_path().exists());

        assert_eq!(device.start().await, StartOutcome::Connected);
        assert!(device.is_operational());
        device.stop().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reclaim_elects_one_host() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        let devices: Vec<Arc<LocalDevice>> = (1..=4)
            .map(|pid| {
                let device = LocalDevice::new(
                    Identity::host(pid, "Group1"),
                    "Group1",
                    dir.path(),
                    tx.clone(),
                    limits(),
                )
                .unwrap();
                Arc::new(device)
            })
            .collect();

        std::fs::create_dir_all(dir.path()).unwrap();
        drop(std::os::unix::net::UnixListener::bind(devices[0].socket_path()).unwrap());

        let tasks: Vec<_> = devices
            .iter()
            .map(|device| {
                let device = Arc::clone(device);
                tokio::spawn(async move { device.start().await })
            })
            .collect();
        let mut connected = 0;
        for task in tasks {
            match task.await.unwrap() {
                StartOutcome::Connected => connected += 1,
                StartOutcome::AddressInUse => {}
                StartOutcome::Failed => panic!("bind failed"),
            }
        }
        assert_eq!(connected, 1);
        for device in &devices {
            device.stop().await;
        }
    }

    #[tokio::test]
    async fn test_long_channel_name_still_binds() {
        let dir = tempfile::tempdir().unwrap();
        let channel = "RaidGroupAlphaBravoCharlie01";
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = LocalDevice::new(
            Identity::client(1, channel, "instance-0042"),
            channel,
            dir.path(),
            tx,
            limits(),
        )
        .unwrap();
        assert!(client.address().unwrap().len() > 100);

        assert_eq!(client.start().await, StartOutcome::Connected);
        assert!(client.is_operational());
        assert_eq!(client.socket_path().parent(), Some(dir.path()));
        client.stop().await;
    }

    #[test]
    fn test_overlong_directory_is_rejected() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let dir = std::env::temp_dir().join("x".repeat(LONG_DIR_LEN));
        let result = LocalDevice::new(Identity::host(1, "Group1"), "Group1", &dir, tx, limits());
        assert!(matches!(result, Err(WireError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn test_response_routed_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let (host_tx, _host_rx) = mpsc::unbounded_channel();
        let (client_tx, mut client_rx) = mpsc::unbounded_channel();
        let host_id = Identity::host(1, "Group1");
        let client_id = Identity::client(1, "Group1", "a");
        let host = LocalDevice::new(host_id.clone(), "Group1", dir.path(), host_tx, limits()).unwrap();
        let client = LocalDevice::new(client_id.clone(), "Group1", dir.path(), client_tx, limits()).unwrap();
        assert_eq!(host.start().await, StartOutcome::Connected);
        assert_eq!(client.start().await, StartOutcome::Connected);

        let request = Envelope::new("Ping", client_id.clone());
        let response = Envelope::response_to(&request, host_id.clone());
        host.send(response, &client.address().unwrap());

        match next_event(&mut client_rx).await {
            DeviceEvent::Response(received) => {
                assert_eq!(received.from, host_id);
                assert_eq!(received.to, Some(client_id));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_send_to_missing_socket_reports_fault() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let client = LocalDevice::new(Identity::client(1, "Group1", "a"), "Group1", dir.path(), tx, limits()).unwrap();
        let target = format!("ipc://{}/nobody", dir.path().display());
        client.send(Envelope::new("Ping", client.identity().clone()), &target);

        match next_event(&mut rx).await {
            DeviceEvent::Fault { role, .. } => assert_eq!(role, Role::Client),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
