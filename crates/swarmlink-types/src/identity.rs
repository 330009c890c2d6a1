//! Node identity.
//!
//! An [`Identity`] names one endpoint of one process: its Host-role listener
//! or its Client-role listener. Two identities are equal when their role,
//! name and channel name agree; the process id and the bound address do not
//! take part, so the Host identity of a channel compares equal in every
//! process that joins it.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Display name shared by every Host identity.
pub const HOST_NAME: &str = "Host";

/// Prefix used for Client names and client channel names.
pub const CLIENT_PREFIX: &str = "Client-";

/// The role an endpoint plays on its channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Role {
    /// The single coordinating endpoint of a channel.
    Host,
    /// Any other participant.
    Client,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Host => write!(f, "Host"),
            Role::Client => write!(f, "Client"),
        }
    }
}

/// Descriptor of one endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Id of the owning process.
    process_id: u32,
    /// `Host`, or `Client-{instance}`.
    name: String,
    /// The channel for a Host; a per-client scope for a Client.
    channel_name: String,
    role: Role,
    /// Endpoint address, filled in once the owning device binds.
    #[serde(default)]
    address: Option<String>,
}

impl Identity {
    /// Create an identity without an address.
    pub fn new(
        process_id: u32,
        name: impl Into<String>,
        channel_name: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            process_id,
            name: name.into(),
            channel_name: channel_name.into(),
            role,
            address: None,
        }
    }

    /// The Host identity of `channel`.
    pub fn host(process_id: u32, channel: &str) -> Self {
        Self::new(process_id, HOST_NAME, channel, Role::Host)
    }

    /// The Client identity of `instance` on `channel`.
    pub fn client(process_id: u32, channel: &str, instance: &str) -> Self {
        Self::new(
            process_id,
            format!("{CLIENT_PREFIX}{instance}"),
            format!("{CLIENT_PREFIX}{channel}{instance}"),
            Role::Client,
        )
    }

    /// Builder-style address assignment.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = Some(address.into());
        self
    }

    /// Id of the process that owns this endpoint.
    pub fn process_id(&self) -> u32 {
        self.process_id
    }

    /// Display name, `Host` or `Client-{instance}`.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Channel scope used to build endpoint paths.
    pub fn channel_name(&self) -> &str {
        &self.channel_name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Endpoint address, `None` until the device binds.
    pub fn address(&self) -> Option<&str> {
        self.address.as_deref()
    }

    /// Record the address the owning device bound to.
    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = Some(address.into());
    }

    pub fn is_host(&self) -> bool {
        self.role == Role::Host
    }
}

impl PartialEq for Identity {
    fn eq(&self, other: &Self) -> bool {
        self.role == other.role
            && self.name == other.name
            && self.channel_name == other.channel_name
    }
}

impl Eq for Identity {}

impl Hash for Identity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.role.hash(state);
        self.name.hash(state);
        self.channel_name.hash(state);
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.role, self.channel_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_address_and_process() {
        let a = Identity::client(100, "Group1", "alpha").with_address("tcp://10.0.0.1:4000/x");
        let b = Identity::client(200, "Group1", "alpha");
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_role_distinguishes_identities() {
        let host = Identity::new(1, "node", "chan", Role::Host);
        let client = Identity::new(1, "node", "chan", Role::Client);
        assert_ne!(host, client);
    }

    #[test]
    fn test_host_identity_shared_across_processes() {
        assert_eq!(Identity::host(1, "Group1"), Identity::host(2, "Group1"));
        assert_ne!(Identity::host(1, "Group1"), Identity::host(1, "Group2"));
    }

    #[test]
    fn test_client_naming() {
        let id = Identity::client(42, "Group1", "42");
        assert_eq!(id.name(), "Client-42");
        assert_eq!(id.channel_name(), "Client-Group142");
        assert_eq!(id.role(), Role::Client);
        assert!(id.address().is_none());
    }

    #[test]
    fn test_serde_keeps_address() {
        let id = Identity::host(7, "Group1").with_address("ipc:///tmp/s/Group1/HostGroup1");
        let json = serde_json::to_string(&id).unwrap();
        assert!(json.contains("channelName"));
        let back: Identity = serde_json::from_str(&json).unwrap();
        assert_eq!(back.address(), id.address());
        assert_eq!(back.process_id(), 7);
    }
}
