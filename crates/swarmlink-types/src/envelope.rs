//! Message envelope: the unit of transmission between endpoints.
//!
//! An envelope carries routing (`from`/`to`), timing, an optional correlation
//! id and an opaque text payload produced by a [`PayloadSerializer`]. The
//! whole envelope is itself serialized as JSON for the wire; framing is the
//! transport's job.

use crate::error::SwarmResult;
use crate::identity::Identity;
use crate::peer::RemotePeer;
use crate::serializer::PayloadSerializer;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Whether an envelope is a request or the answer to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    /// A request, answered with a `Response`.
    #[default]
    Message,
    /// The acknowledgement of a `Message`.
    Response,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    /// Unique envelope id.
    pub id: Uuid,
    /// Short protocol or application name ("Ping", "GetUpdatedClientList", ...).
    pub name: String,
    /// Sending endpoint, carrying its address.
    pub from: Identity,
    /// Set when the envelope is handed to a device.
    pub to: Option<Identity>,
    /// Sender clock when the envelope was transmitted.
    pub sent_at: DateTime<Utc>,
    /// Stamped by the receiving device.
    #[serde(default)]
    pub received_at: Option<DateTime<Utc>>,
    /// `received_at - sent_at`, absent when clocks disagree.
    #[serde(default)]
    pub transmission_time: Option<Duration>,
    /// Request or response.
    #[serde(default)]
    pub kind: EnvelopeKind,
    /// Present when the sender expects a response, and echoed by it.
    #[serde(default)]
    pub correlation_id: Option<Uuid>,
    /// Serialized payload, empty for protocol envelopes.
    #[serde(default)]
    pub payload: String,
}

impl Envelope {
    /// A zero-payload message envelope.
    pub fn new(name: impl Into<String>, from: Identity) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            from,
            to: None,
            sent_at: Utc::now(),
            received_at: None,
            transmission_time: None,
            kind: EnvelopeKind::Message,
            correlation_id: None,
            payload: String::new(),
        }
    }

    /// A message envelope carrying `value`.
    pub fn with_payload<T, S>(
        name: impl Into<String>,
        from: Identity,
        value: &T,
        serializer: &S,
    ) -> SwarmResult<Self>
    where
        T: Serialize,
        S: PayloadSerializer,
    {
        let mut envelope = Self::new(name, from);
        envelope.payload = serializer.serialize(value)?;
        Ok(envelope)
    }

    /// A response to `request`, sent from `from`.
    ///
    /// The response goes back to the request's sender and carries its
    /// correlation id.
    pub fn response_to(request: &Envelope, from: Identity) -> Self {
        let mut envelope = Self::new(request.name.clone(), from);
        envelope.kind = EnvelopeKind::Response;
        envelope.correlation_id = request.correlation_id;
        envelope.to = Some(request.from.clone());
        envelope
    }

    /// Replace the payload with `value`.
    pub fn set_payload<T, S>(&mut self, value: &T, serializer: &S) -> SwarmResult<()>
    where
        T: Serialize,
        S: PayloadSerializer,
    {
        self.payload = serializer.serialize(value)?;
        Ok(())
    }

    /// Decode the payload as `T`.
    pub fn payload_as<T, S>(&self, serializer: &S) -> SwarmResult<T>
    where
        T: DeserializeOwned,
        S: PayloadSerializer,
    {
        serializer.deserialize(&self.payload)
    }

    pub fn has_payload(&self) -> bool {
        !self.payload.is_empty()
    }

    pub fn is_response(&self) -> bool {
        self.kind == EnvelopeKind::Response
    }

    /// Stamp arrival time and transmission duration.
    pub fn mark_received(&mut self, now: DateTime<Utc>) {
        self.received_at = Some(now);
        self.transmission_time = (now - self.sent_at).to_std().ok();
    }

    /// When this envelope was last observed: arrival time, else send time.
    pub fn last_seen(&self) -> DateTime<Utc> {
        self.received_at.unwrap_or(self.sent_at)
    }

    /// Serialize for the wire.
    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Parse a wire body.
    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }
}

/// Payload of every Response envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Acknowledgement {
    /// The endpoint that produced the response.
    pub responder: Identity,
    pub accepted: bool,
    pub text: String,
    /// The responder's full host roster (empty when it is not the Host).
    #[serde(default)]
    pub roster: Vec<RemotePeer>,
}

impl Acknowledgement {
    pub fn accepted(responder: Identity, roster: Vec<RemotePeer>) -> Self {
        Self {
            responder,
            accepted: true,
            text: "Acknowledged".to_string(),
            roster,
        }
    }
}
