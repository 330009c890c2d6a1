//! Endpoint addressing.
//!
//! An endpoint address is `base + prefix + channel + "/" + role + channel`
//! where `prefix` is the identity's channel name for Client identities and
//! empty for the Host. Network bases look like `tcp://10.0.0.4:8081/`, local
//! bases like `ipc:///tmp/swarmlink/`.
//!
//! A local endpoint's socket file is not the endpoint path itself: it is
//! `{dir}/{digest}.sock`, named by a digest of the full endpoint string, so
//! its length does not grow with the channel name.

use crate::error::{WireError, WireResult};
use sha2::{Digest, Sha256};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs, UdpSocket};
use std::path::{Path, PathBuf};
use swarmlink_types::{Identity, Role};

pub const TCP_SCHEME: &str = "tcp://";
pub const IPC_SCHEME: &str = "ipc://";

/// Longest socket path accepted everywhere (`sun_path` is 104 bytes on macOS).
pub const MAX_SOCKET_PATH: usize = 103;

/// Digest bytes used in a socket file name.
const SOCKET_DIGEST_BYTES: usize = 12;

/// The path part of an endpoint, relative to its base.
pub fn endpoint_path(identity: &Identity, channel: &str) -> String {
    let prefix = match identity.role() {
        Role::Client => identity.channel_name(),
        Role::Host => "",
    };
    format!("{prefix}{channel}/{}{channel}", identity.role())
}

pub fn tcp_base(addr: SocketAddr) -> String {
    format!("{TCP_SCHEME}{addr}/")
}

pub fn ipc_base(dir: &Path) -> String {
    let dir = dir.to_string_lossy();
    format!("{IPC_SCHEME}{}/", dir.trim_end_matches('/'))
}

/// Full network endpoint for `identity` listening on `addr`.
pub fn tcp_endpoint(addr: SocketAddr, identity: &Identity, channel: &str) -> String {
    format!("{}{}", tcp_base(addr), endpoint_path(identity, channel))
}

/// Full local endpoint for `identity` under `dir`.
pub fn ipc_endpoint(dir: &Path, identity: &Identity, channel: &str) -> String {
    format!("{}{}", ipc_base(dir), endpoint_path(identity, channel))
}

/// Extract the socket address from a `tcp://host:port/...` endpoint.
///
/// A bare `host:port` is accepted too.
pub fn parse_tcp(address: &str) -> WireResult<SocketAddr> {
    let rest = address.strip_prefix(TCP_SCHEME).unwrap_or(address);
    let authority = rest.split('/').next().unwrap_or_default();
    if let Ok(addr) = authority.parse::<SocketAddr>() {
        return Ok(addr);
    }
    authority
        .to_socket_addrs()
        .map_err(|e| WireError::InvalidAddress(format!("{address}: {e}")))?
        .find(|a| a.is_ipv4())
        .ok_or_else(|| WireError::InvalidAddress(format!("{address}: no IPv4 address")))
}

/// Extract the logical endpoint path from an `ipc://` endpoint.
pub fn parse_ipc(address: &str) -> WireResult<PathBuf> {
    let path = address
        .strip_prefix(IPC_SCHEME)
        .ok_or_else(|| WireError::InvalidAddress(format!("{address}: expected {IPC_SCHEME}")))?;
    if path.is_empty() {
        return Err(WireError::InvalidAddress(format!("{address}: empty path")));
    }
    Ok(PathBuf::from(path))
}

/// Filesystem path of the socket behind an `ipc://` endpoint.
///
/// Fails when the socket directory is too long for a Unix socket path.
pub fn local_socket_path(address: &str) -> WireResult<PathBuf> {
    let logical = parse_ipc(address)?;
    let dir = logical
        .parent()
        .and_then(Path::parent)
        .filter(|dir| !dir.as_os_str().is_empty())
        .ok_or_else(|| WireError::InvalidAddress(format!("{address}: missing endpoint path")))?;
    let digest = Sha256::digest(address.as_bytes());
    let path = dir.join(format!("{}.sock", hex::encode(&digest[..SOCKET_DIGEST_BYTES])));
    let len = path.as_os_str().len();
    if len > MAX_SOCKET_PATH {
        return Err(WireError::InvalidAddress(format!(
            "{address}: socket path {} is {len} bytes, the limit is {MAX_SOCKET_PATH}",
            path.display()
        )));
    }
    Ok(path)
}

/// This machine's routable IPv4 address, falling back to loopback.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
pub fn machine_ipv4() -> Ipv4Addr {
    let route = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(192, 0, 2, 1), 9))?;
        Ok(socket.local_addr()?.ip())
    };
    match route() {
        Ok(IpAddr::V4(ip)) if !ip.is_loopback() && !ip.is_unspecified() => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}

/// Default directory for local sockets.
pub fn default_local_dir() -> PathBuf {
    std::env::temp_dir().join("swarmlink")
}
