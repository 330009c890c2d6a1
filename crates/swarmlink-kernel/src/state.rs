//! Protocol state machine.
//!
//! [`ProtocolState`] holds everything a coordinator knows: connection
//! status, both rosters, pending callbacks and the deferred send queue. It
//! performs no I/O. Every operation takes the current time and returns
//! [`Effects`] (envelopes to transmit, events to publish, handlers to run)
//! for the coordinator to carry out after releasing its lock.

use crate::callbacks::{CallbackKind, CallbackRegistry, Completion, Reply, ResponseHandler};
use crate::error::CallbackError;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Duration;
use swarmlink_types::peer::elapsed_between;
use swarmlink_types::{
    Acknowledgement, CoordinatorConfig, Envelope, Identity, JsonSerializer, LivenessThresholds,
    RemotePeer, Role, Roster,
};
use swarmlink_wire::StartOutcome;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Heartbeat sent from the Client identity to the Host identity.
pub const PING: &str = "Ping";

/// Asks the Host for its roster.
pub const ROSTER_REQUEST: &str = "GetUpdatedClientList";

/// Whether `name` belongs to the coordination protocol itself.
pub fn is_protocol_message(name: &str) -> bool {
    name == PING || name == ROSTER_REQUEST
}

/// Something the coordinator reports to its subscribers.
#[derive(Debug, Clone)]
pub enum CoordinatorEvent {
    /// Human-readable trace of protocol activity.
    Diagnostic(String),
    /// The client roster was replaced by the Host's.
    RosterUpdated(Vec<RemotePeer>),
    /// A non-protocol message arrived for the Client identity.
    MessageReceived(Envelope),
    /// A response addressed to this process arrived.
    ResponseReceived(Envelope),
}

/// Process-local connection status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStatus {
    pub is_connected: bool,
    pub is_host: bool,
    pub is_operational: bool,
    pub last_send: Option<DateTime<Utc>>,
    pub last_response: Option<DateTime<Utc>>,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_host_bind_attempt: Option<DateTime<Utc>>,
    pub last_roster_refresh: Option<DateTime<Utc>>,
}

/// An envelope ready for a device.
#[derive(Debug, Clone)]
pub struct Outbound {
    /// Device that transmits it.
    pub via: Role,
    pub envelope: Envelope,
    pub target: String,
}

/// Work produced by a state transition.
#[derive(Debug, Default)]
pub struct Effects {
    pub sends: Vec<Outbound>,
    pub events: Vec<CoordinatorEvent>,
    pub completions: Vec<Completion>,
    /// A send was deferred and a sync should follow.
    pub trigger_sync: bool,
}

impl Effects {
    fn diagnostic(&mut self, message: impl Into<String>) {
        let message = message.into();
        debug!(diagnostic = %message);
        self.events.push(CoordinatorEvent::Diagnostic(message));
    }

    pub fn merge(&mut self, other: Effects) {
        self.sends.extend(other.sends);
        self.events.extend(other.events);
        self.completions.extend(other.completions);
        self.trigger_sync |= other.trigger_sync;
    }

    pub fn is_empty(&self) -> bool {
        self.sends.is_empty()
            && self.events.is_empty()
            && self.completions.is_empty()
            && !self.trigger_sync
    }
}

/// What `sync` must do with the Host device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostAction {
    Keep,
    /// Try to bind the Host address.
    Bind,
    /// The Host listener died; stop it.
    Demote,
}

#[derive(Debug)]
pub struct SyncPlan {
    pub action: HostAction,
    pub effects: Effects,
}

struct DeferredSend {
    envelope: Envelope,
    /// `None` broadcasts to the roster known at drain time.
    target: Option<Identity>,
    handler: Option<ResponseHandler>,
}

#[derive(Debug, Clone, Copy)]
struct Timing {
    sync_interval: Duration,
    host_port_check_interval: Duration,
    client_list_update_interval: Duration,
    callback_timeout: Duration,
    thresholds: LivenessThresholds,
}

pub struct ProtocolState {
    timing: Timing,
    host: Identity,
    client: Identity,
    status: CoordinatorStatus,
    /// Roster as last received from the Host.
    client_roster: Roster,
    /// Roster maintained while this process is the Host.
    host_roster: Roster,
    callbacks: CallbackRegistry,
    deferred: VecDeque<DeferredSend>,
}

/// True when `last` happened less than `interval` before `now`.
fn within(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    last.is_some_and(|t| elapsed_between(t, now) < interval)
}

/// True when `last` never happened or happened more than `interval` ago.
fn older_than(last: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    last.map_or(true, |t| elapsed_between(t, now) > interval)
}

impl ProtocolState {
    pub fn new(config: &CoordinatorConfig, host: Identity, client: Identity) -> Self {
        Self {
            timing: Timing {
                sync_interval: config.sync_interval(),
                host_port_check_interval: config.host_port_check_interval(),
                client_list_update_interval: config.client_list_update_interval(),
                callback_timeout: config.callback_timeout(),
                thresholds: config.thresholds(),
            },
            host,
            client,
            status: CoordinatorStatus::default(),
            client_roster: Roster::new(),
            host_roster: Roster::new(),
            callbacks: CallbackRegistry::default(),
            deferred: VecDeque::new(),
        }
    }

    pub fn host(&self) -> &Identity {
        &self.host
    }

    pub fn client(&self) -> &Identity {
        &self.client
    }

    pub fn set_host_address(&mut self, address: impl Into<String>) {
        self.host.set_address(address);
    }

    pub fn set_client_address(&mut self, address: impl Into<String>) {
        self.client.set_address(address);
    }

    pub fn status(&self) -> &CoordinatorStatus {
        &self.status
    }

    pub fn set_operational(&mut self, operational: bool) {
        self.status.is_operational = operational;
    }

    pub fn client_roster(&self) -> &Roster {
        &self.client_roster
    }

    pub fn host_roster(&self) -> &Roster {
        &self.host_roster
    }

    pub fn pending_callbacks(&self) -> usize {
        self.callbacks.len()
    }

    pub fn deferred_len(&self) -> usize {
        self.deferred.len()
    }

    pub fn is_me(&self, id: &Identity) -> bool {
        self.is_me_as_host(id) || self.is_me_as_client(id)
    }

    pub fn is_me_as_host(&self, id: &Identity) -> bool {
        id == &self.host
    }

    pub fn is_me_as_client(&self, id: &Identity) -> bool {
        id == &self.client
    }

    /// Start a sync round, unless one ran within the sync interval.
    ///
    /// Sweeps timed-out callbacks and decides what happens to the Host
    /// device. The caller performs the action, reports a bind through
    /// [`apply_bind`](Self::apply_bind), and finishes with [`ping`](Self::ping).
    pub fn begin_sync(
        &mut self,
        now: DateTime<Utc>,
        host_started: bool,
        host_operational: bool,
    ) -> Option<SyncPlan> {
        if within(self.status.last_sync, now, self.timing.sync_interval) {
            return None;
        }
        self.status.last_sync = Some(now);

        let mut effects = self.sweep(now);
        let action = if !host_started {
            if older_than(
                self.status.last_host_bind_attempt,
                now,
                self.timing.host_port_check_interval,
            ) {
                self.status.last_host_bind_attempt = Some(now);
                HostAction::Bind
            } else {
                HostAction::Keep
            }
        } else if !host_operational {
            self.status.is_connected = false;
            self.status.is_host = false;
            effects.diagnostic("Closing Host");
            HostAction::Demote
        } else {
            HostAction::Keep
        };

        Some(SyncPlan { action, effects })
    }

    /// Record the outcome of binding the Host address.
    pub fn apply_bind(&mut self, outcome: StartOutcome) -> Effects {
        let mut effects = Effects::default();
        match outcome {
            StartOutcome::Connected => {
                self.status.is_connected = true;
                self.status.is_host = true;
                self.host_roster = self.client_roster.clone();
                info!(host = %self.host, "Bound Host address, acting as Host");
                effects.diagnostic(format!("{}: acting as Host", self.client.name()));
            }
            StartOutcome::AddressInUse => {
                // Somebody else holds the address, so a Host exists.
                self.status.is_connected = true;
                self.status.is_host = false;
                effects.diagnostic(format!("{}: Host address in use", self.client.name()));
            }
            StartOutcome::Failed => {
                effects.diagnostic(format!("{}: failed to open Host address", self.client.name()));
            }
        }
        effects
    }

    /// Ping the Host from the Client identity.
    pub fn ping(&mut self, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        let mut envelope = Envelope::new(PING, self.client.clone());
        envelope.correlation_id = Some(self.callbacks.register(CallbackKind::Ping, now));
        self.transmit(envelope, None, now, &mut effects);
        effects.diagnostic("Ping...");
        effects
    }

    /// Ask the Host for its roster, at most once per update interval.
    pub fn request_roster(&mut self, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        if within(
            self.status.last_roster_refresh,
            now,
            self.timing.client_list_update_interval,
        ) {
            return effects;
        }
        self.status.last_roster_refresh = Some(now);
        let envelope = Envelope::new(ROSTER_REQUEST, self.client.clone());
        self.transmit(envelope, None, now, &mut effects);
        effects
    }

    /// Send `envelope` to `to`, or defer it while the Host is unconfirmed.
    pub fn send(
        &mut self,
        envelope: Envelope,
        to: Identity,
        handler: Option<ResponseHandler>,
        now: DateTime<Utc>,
    ) -> Effects {
        let mut effects = Effects::default();
        if self.must_defer(now) {
            self.defer(envelope, Some(to), handler, &mut effects);
        } else {
            self.dispatch(envelope, &to, handler, now, &mut effects);
        }
        effects
    }

    /// Send `envelope` to every peer of the client roster.
    pub fn broadcast(
        &mut self,
        envelope: Envelope,
        handler: Option<ResponseHandler>,
        now: DateTime<Utc>,
    ) -> Effects {
        let mut effects = Effects::default();
        if self.must_defer(now) {
            self.defer(envelope, None, handler, &mut effects);
        } else {
            self.dispatch_broadcast(envelope, handler, now, &mut effects);
        }
        effects
    }

    /// Handle a `Message` envelope from either device.
    pub fn handle_message(&mut self, envelope: Envelope, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        let Some(to) = self.addressed_to_me(&envelope, &mut effects) else {
            return effects;
        };
        effects.diagnostic(format!(
            "{} << Received {} from {}",
            to.name(),
            envelope.name,
            envelope.from.name()
        ));

        if to.is_host() && envelope.from != self.host {
            let (added, report) = self
                .host_roster
                .observe(&envelope, now, &self.timing.thresholds);
            if added {
                effects.diagnostic(format!(
                    "{}: Adding new client information - {}",
                    self.host.name(),
                    envelope.from
                ));
            }
            for peer in report.expired {
                effects.diagnostic(format!("{}: Client expired - {}", self.host.name(), peer.identity()));
            }
        } else if !self.status.is_host {
            let pull = self.request_roster(now);
            effects.merge(pull);
        }

        let mut response = Envelope::response_to(&envelope, to.clone());
        let ack = Acknowledgement::accepted(self.client.clone(), self.host_roster.to_vec());
        match response.set_payload(&ack, &JsonSerializer) {
            Ok(()) => {
                let sender = envelope.from.clone();
                self.transmit(response, Some(&sender), now, &mut effects);
            }
            Err(e) => warn!(error = %e, "Failed to encode acknowledgement"),
        }

        if self.is_me_as_client(&to) && !is_protocol_message(&envelope.name) {
            effects.events.push(CoordinatorEvent::MessageReceived(envelope));
        }
        effects
    }

    /// Handle a `Response` envelope.
    ///
    /// `host_started` is the Host device's state, which `is_host` follows
    /// once a Ping is answered.
    pub fn handle_response(
        &mut self,
        envelope: Envelope,
        now: DateTime<Utc>,
        host_started: bool,
    ) -> Effects {
        let mut effects = Effects::default();
        let Some(to) = self.addressed_to_me(&envelope, &mut effects) else {
            return effects;
        };
        self.status.last_response = Some(now);

        let ack: Result<Acknowledgement, _> = envelope.payload_as(&JsonSerializer);
        effects.diagnostic(format!(
            "{} << Received response from {}: {}",
            to.name(),
            envelope.from.name(),
            ack.as_ref().map(|a| a.text.as_str()).unwrap_or("<malformed>")
        ));

        match envelope.from.role() {
            Role::Host => {
                if let Ok(ack) = &ack {
                    if !ack.roster.is_empty() {
                        self.replace_client_roster(ack.roster.clone(), now, &mut effects);
                    }
                }
            }
            Role::Client => {
                let pull = self.request_roster(now);
                effects.merge(pull);
            }
        }

        if let Some(id) = envelope.correlation_id {
            match self.callbacks.take(&id) {
                Some(CallbackKind::Ping) => self.on_pong(&envelope, now, host_started, &mut effects),
                Some(CallbackKind::Handler(handler)) => {
                    let result = match ack {
                        Ok(acknowledgement) => Ok(Reply {
                            envelope: envelope.clone(),
                            acknowledgement,
                        }),
                        Err(e) => Err(CallbackError::Malformed(e.to_string())),
                    };
                    effects.completions.push(Completion::new(handler, result));
                }
                None => {}
            }
        }

        effects.events.push(CoordinatorEvent::ResponseReceived(envelope));
        effects
    }

    /// Release every pending handler with `Shutdown` and reset status.
    pub fn shutdown(&mut self) -> Effects {
        let mut effects = Effects::default();
        for kind in self.callbacks.drain() {
            if let CallbackKind::Handler(handler) = kind {
                effects
                    .completions
                    .push(Completion::new(handler, Err(CallbackError::Shutdown)));
            }
        }
        for deferred in self.deferred.drain(..) {
            if let Some(handler) = deferred.handler {
                effects
                    .completions
                    .push(Completion::new(handler, Err(CallbackError::Shutdown)));
            }
        }
        self.status.is_connected = false;
        self.status.is_host = false;
        self.status.is_operational = false;
        effects
    }

    fn must_defer(&self, now: DateTime<Utc>) -> bool {
        older_than(self.status.last_response, now, self.timing.sync_interval)
    }

    fn defer(
        &mut self,
        envelope: Envelope,
        target: Option<Identity>,
        handler: Option<ResponseHandler>,
        effects: &mut Effects,
    ) {
        debug!(envelope = %envelope.name, queued = self.deferred.len() + 1, "Deferring send");
        self.deferred.push_back(DeferredSend {
            envelope,
            target,
            handler,
        });
        effects.trigger_sync = true;
    }

    fn on_pong(
        &mut self,
        envelope: &Envelope,
        now: DateTime<Utc>,
        host_started: bool,
        effects: &mut Effects,
    ) {
        let transit = envelope
            .transmission_time
            .map(|d| format!("{:.3}s", d.as_secs_f64()))
            .unwrap_or_else(|| "?".to_string());
        effects.diagnostic(format!("Pong.. ({transit})"));

        self.status.is_connected = true;
        self.status.is_host = host_started;
        self.status.last_response = Some(now);

        if !self.deferred.is_empty() {
            effects.diagnostic(format!(
                "{}: Sending Queued Messages ({})",
                self.client.name(),
                self.deferred.len()
            ));
        }
        while self.status.is_connected {
            let Some(deferred) = self.deferred.pop_front() else {
                break;
            };
            match deferred.target {
                Some(to) => self.dispatch(deferred.envelope, &to, deferred.handler, now, effects),
                None => self.dispatch_broadcast(deferred.envelope, deferred.handler, now, effects),
            }
        }
    }

    fn sweep(&mut self, now: DateTime<Utc>) -> Effects {
        let mut effects = Effects::default();
        let timeout = self.timing.callback_timeout;
        let swept = self.callbacks.sweep(now, timeout);
        if !swept.is_empty() {
            effects.diagnostic(format!("Dropped {} unanswered callbacks", swept.len()));
        }
        for kind in swept {
            if let CallbackKind::Handler(handler) = kind {
                effects
                    .completions
                    .push(Completion::new(handler, Err(CallbackError::TimedOut(timeout))));
            }
        }

        if self.status.is_host {
            let report = self.host_roster.sweep(now, &self.timing.thresholds);
            for peer in report.expired {
                effects.diagnostic(format!("{}: Client expired - {}", self.host.name(), peer.identity()));
            }
        }
        effects
    }

    fn replace_client_roster(
        &mut self,
        peers: Vec<RemotePeer>,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        self.client_roster = Roster::from_peers(peers);
        self.status.last_roster_refresh = Some(now);
        effects.diagnostic(format!(
            "{}: Client List Updated ({})",
            self.client.name(),
            self.client_roster.len()
        ));
        effects
            .events
            .push(CoordinatorEvent::RosterUpdated(self.client_roster.to_vec()));
    }

    /// The local identity `envelope` is addressed to, if any.
    fn addressed_to_me(&self, envelope: &Envelope, effects: &mut Effects) -> Option<Identity> {
        let mine = envelope.to.as_ref().and_then(|to| {
            if self.is_me_as_host(to) {
                Some(self.host.clone())
            } else if self.is_me_as_client(to) {
                Some(self.client.clone())
            } else {
                None
            }
        });
        if mine.is_none() {
            let to = envelope
                .to
                .as_ref()
                .map(|t| t.name().to_string())
                .unwrap_or_else(|| "nobody".to_string());
            warn!(to = %to, from = %envelope.from.name(), envelope = %envelope.name, "Discarding envelope addressed to someone else");
            effects.diagnostic(format!(
                "Received an invalid {:?}: addressed to someone other than me - to: {to}, from {}",
                envelope.kind,
                envelope.from.name()
            ));
        }
        mine
    }

    fn dispatch(
        &mut self,
        mut envelope: Envelope,
        to: &Identity,
        handler: Option<ResponseHandler>,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        if let Some(handler) = handler {
            envelope.correlation_id =
                Some(self.callbacks.register(CallbackKind::Handler(handler), now));
        }
        self.transmit(envelope, Some(to), now, effects);
    }

    fn dispatch_broadcast(
        &mut self,
        envelope: Envelope,
        handler: Option<ResponseHandler>,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        let recipients: Vec<Identity> = self
            .client_roster
            .iter()
            .map(|p| p.identity().clone())
            .collect();
        if recipients.is_empty() {
            effects.diagnostic(format!("Broadcast {} has no recipients", envelope.name));
            return;
        }
        for to in recipients {
            let mut copy = envelope.clone();
            copy.id = Uuid::new_v4();
            self.dispatch(copy, &to, handler.clone(), now, effects);
        }
    }

    /// Address and stamp `envelope`; `None` means the Host.
    fn transmit(
        &mut self,
        mut envelope: Envelope,
        to: Option<&Identity>,
        now: DateTime<Utc>,
        effects: &mut Effects,
    ) {
        let receiver = to.cloned().unwrap_or_else(|| self.host.clone());
        let target = to
            .and_then(|t| t.address())
            .or_else(|| self.host.address())
            .map(str::to_string);
        let Some(target) = target else {
            effects.diagnostic(format!("No address for {}", receiver.name()));
            return;
        };

        if envelope.from == self.host {
            envelope.from = self.host.clone();
        } else if envelope.from == self.client {
            envelope.from = self.client.clone();
        }
        envelope.sent_at = now;
        envelope.to = Some(receiver);
        self.status.last_send = Some(now);

        debug!(
            from = %envelope.from.name(),
            to = %envelope.to.as_ref().map(|t| t.name()).unwrap_or_default(),
            envelope = %envelope.name,
            kind = ?envelope.kind,
            "Sending"
        );
        effects.sends.push(Outbound {
            via: envelope.from.role(),
            envelope,
            target,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::handler;
    use std::sync::{Arc, Mutex};

    const CHANNEL: &str = "Group1";

    fn state() -> ProtocolState {
        let host = Identity::host(1, CHANNEL).with_address("ipc:///tmp/t/Group1/HostGroup1");
        let client = Identity::client(1, CHANNEL, "me")
            .with_address("ipc:///tmp/t/Client-Group1meGroup1/ClientGroup1");
        ProtocolState::new(&CoordinatorConfig::default(), host, client)
    }

    fn peer(instance: &str) -> Identity {
        Identity::client(2, CHANNEL, instance).with_address(format!("ipc:///tmp/t/{instance}"))
    }

    fn secs(t: DateTime<Utc>, s: i64) -> DateTime<Utc> {
        t + chrono::Duration::seconds(s)
    }

    /// Arrival of `envelope` at its destination device.
    fn arrive(mut envelope: Envelope, now: DateTime<Utc>) -> Envelope {
        envelope.mark_received(now);
        envelope
    }

    /// Answer `request` the way a Host with `roster` would.
    fn host_response(request: &Envelope, roster: Vec<RemotePeer>) -> Envelope {
        let host = Identity::host(9, CHANNEL);
        let mut response = Envelope::response_to(request, host.clone());
        response
            .set_payload(&Acknowledgement::accepted(host, roster), &JsonSerializer)
            .unwrap();
        response
    }

    /// Ping and receive the Pong at `now`.
    fn pong(state: &mut ProtocolState, now: DateTime<Utc>) -> Effects {
        let ping = state.ping(now).sends.remove(0).envelope;
        state.handle_response(arrive(host_response(&ping, vec![]), now), now, false)
    }

    #[test]
    fn test_sync_runs_once_per_interval() {
        let mut state = state();
        let t0 = Utc::now();

        let plan = state.begin_sync(t0, false, false).unwrap();
        assert_eq!(plan.action, HostAction::Bind);
        assert!(state.begin_sync(t0 + chrono::Duration::milliseconds(999), false, false).is_none());

        // Next round is allowed, but the bind is throttled separately.
        let plan = state.begin_sync(secs(t0, 1), false, false).unwrap();
        assert_eq!(plan.action, HostAction::Keep);
        let plan = state.begin_sync(secs(t0, 11), false, false).unwrap();
        assert_eq!(plan.action, HostAction::Bind);
    }

    #[test]
    fn test_bind_outcomes() {
        let mut state = state();
        state.apply_bind(StartOutcome::AddressInUse);
        assert!(state.status().is_connected);
        assert!(!state.status().is_host);

        state.apply_bind(StartOutcome::Connected);
        assert!(state.status().is_connected);
        assert!(state.status().is_host);

        let mut fresh = super::tests::state();
        let effects = fresh.apply_bind(StartOutcome::Failed);
        assert!(!fresh.status().is_connected);
        assert!(matches!(effects.events[0], CoordinatorEvent::Diagnostic(_)));
    }

    #[test]
    fn test_dead_host_listener_demotes() {
        let mut state = state();
        state.apply_bind(StartOutcome::Connected);
        let plan = state.begin_sync(Utc::now(), true, false).unwrap();
        assert_eq!(plan.action, HostAction::Demote);
        assert!(!state.status().is_connected);
        assert!(!state.status().is_host);
    }

    #[test]
    fn test_ping_targets_host_with_callback() {
        let mut state = state();
        let effects = state.ping(Utc::now());
        assert_eq!(effects.sends.len(), 1);
        let out = &effects.sends[0];
        assert_eq!(out.via, Role::Client);
        assert_eq!(out.target, "ipc:///tmp/t/Group1/HostGroup1");
        assert_eq!(out.envelope.name, PING);
        assert_eq!(out.envelope.to.as_ref(), Some(state.host()));
        assert!(out.envelope.correlation_id.is_some());
        assert!(!out.envelope.has_payload());
        assert_eq!(state.pending_callbacks(), 1);
    }

    #[test]
    fn test_pong_marks_connected_and_follows_host_device() {
        let mut state = state();
        let t0 = Utc::now();
        pong(&mut state, t0);
        assert!(state.status().is_connected);
        assert!(!state.status().is_host);
        assert_eq!(state.status().last_response, Some(t0));
        assert_eq!(state.pending_callbacks(), 0);

        let ping = state.ping(t0).sends.remove(0).envelope;
        state.handle_response(host_response(&ping, vec![]), t0, true);
        assert!(state.status().is_host);
    }

    #[test]
    fn test_deferred_sends_drain_in_order_after_pong() {
        let mut state = state();
        let t0 = Utc::now();
        let me = state.client().clone();

        for name in ["first", "second", "third"] {
            let effects = state.send(Envelope::new(name, me.clone()), peer(name), None, t0);
            assert!(effects.sends.is_empty());
            assert!(effects.trigger_sync);
        }
        assert_eq!(state.deferred_len(), 3);

        let effects = pong(&mut state, t0);
        let names: Vec<&str> = effects.sends.iter().map(|o| o.envelope.name.as_str()).collect();
        assert_eq!(names, ["first", "second", "third"]);
        assert_eq!(effects.sends[1].target, "ipc:///tmp/t/second");
        assert_eq!(state.deferred_len(), 0);

        // Exactly once.
        let effects = pong(&mut state, secs(t0, 1));
        assert!(effects.sends.iter().all(|o| o.envelope.name != "first"));
    }

    #[test]
    fn test_send_while_connected_is_immediate() {
        let mut state = state();
        let t0 = Utc::now();
        pong(&mut state, t0);
        let me = state.client().clone();
        let effects = state.send(Envelope::new("Update", me), peer("a"), None, t0);
        assert_eq!(effects.sends.len(), 1);
        assert!(!effects.trigger_sync);

        // Stale once the sync interval passes without a response.
        let me = state.client().clone();
        let effects = state.send(Envelope::new("Update", me), peer("a"), None, secs(t0, 2));
        assert!(effects.sends.is_empty());
        assert!(effects.trigger_sync);
    }

    #[test]
    fn test_message_to_host_tracks_sender_and_responds() {
        let mut state = state();
        let t0 = Utc::now();
        state.apply_bind(StartOutcome::Connected);

        let sender = peer("a");
        let mut ping = Envelope::new(PING, sender.clone());
        ping.to = Some(Identity::host(2, CHANNEL));
        ping.correlation_id = Some(Uuid::new_v4());
        let effects = state.handle_message(arrive(ping.clone(), t0), t0);

        assert_eq!(state.host_roster().len(), 1);
        assert!(state.host_roster().contains(&sender));

        assert_eq!(effects.sends.len(), 1);
        let out = &effects.sends[0];
        assert_eq!(out.via, Role::Host);
        assert_eq!(out.target, "ipc:///tmp/t/a");
        assert!(out.envelope.is_response());
        assert_eq!(out.envelope.correlation_id, ping.correlation_id);
        let ack: Acknowledgement = out.envelope.payload_as(&JsonSerializer).unwrap();
        assert!(ack.accepted);
        assert_eq!(ack.roster.len(), 1);
        assert!(!effects
            .events
            .iter()
            .any(|e| matches!(e, CoordinatorEvent::MessageReceived(_))));
    }

    #[test]
    fn test_distinct_senders_make_distinct_records() {
        let mut state = state();
        let t0 = Utc::now();
        for (i, name) in ["a", "b", "c", "d"].iter().enumerate() {
            for repeat in 0..3 {
                let now = secs(t0, (i * 3 + repeat) as i64);
                let mut env = Envelope::new(PING, peer(name));
                env.to = Some(state.host().clone());
                state.handle_message(arrive(env, now), now);
            }
        }
        assert_eq!(state.host_roster().len(), 4);
    }

    #[test]
    fn test_silent_peer_expires_from_host_roster() {
        let mut state = state();
        let t0 = Utc::now();
        for (name, at) in [("quiet", t0), ("chatty", secs(t0, 61))] {
            let mut env = Envelope::new(PING, peer(name));
            env.to = Some(state.host().clone());
            state.handle_message(arrive(env, at), at);
        }
        assert!(!state.host_roster().contains(&peer("quiet")));
        assert!(state.host_roster().contains(&peer("chatty")));
    }

    #[test]
    fn test_user_message_to_client_is_published() {
        let mut state = state();
        let t0 = Utc::now();
        let mut env = Envelope::new("SwarmUpdate", peer("a"));
        env.to = Some(state.client().clone());
        let effects = state.handle_message(arrive(env, t0), t0);

        assert!(effects
            .events
            .iter()
            .any(|e| matches!(e, CoordinatorEvent::MessageReceived(m) if m.name == "SwarmUpdate")));
        // Roster pull to the Host plus the acknowledgement to the sender.
        let names: Vec<&str> = effects.sends.iter().map(|o| o.envelope.name.as_str()).collect();
        assert_eq!(names, [ROSTER_REQUEST, "SwarmUpdate"]);
        assert!(effects.sends[1].envelope.is_response());

        // Throttled on the next message.
        let mut env = Envelope::new("SwarmUpdate", peer("a"));
        env.to = Some(state.client().clone());
        let effects = state.handle_message(arrive(env, t0), t0);
        assert_eq!(effects.sends.len(), 1);
    }

    #[test]
    fn test_misaddressed_envelope_is_discarded() {
        let mut state = state();
        let t0 = Utc::now();
        let mut env = Envelope::new("SwarmUpdate", peer("a"));
        env.to = Some(peer("b"));
        let effects = state.handle_message(env.clone(), t0);
        assert!(effects.sends.is_empty());
        assert!(matches!(effects.events.as_slice(), [CoordinatorEvent::Diagnostic(_)]));

        let response = Envelope::response_to(&Envelope::new(PING, peer("b")), Identity::host(3, CHANNEL));
        state.handle_response(response, t0, false);
        assert!(state.status().last_response.is_none());
    }

    #[test]
    fn test_host_roster_replaces_client_roster() {
        let mut state = state();
        let t0 = Utc::now();
        let roster: Vec<RemotePeer> = ["a", "b"]
            .iter()
            .map(|n| RemotePeer::from_envelope(&Envelope::new(PING, peer(n))))
            .collect();
        let ping = state.ping(t0).sends.remove(0).envelope;
        let effects = state.handle_response(host_response(&ping, roster), t0, false);

        assert_eq!(state.client_roster().len(), 2);
        assert!(effects
            .events
            .iter()
            .any(|e| matches!(e, CoordinatorEvent::RosterUpdated(peers) if peers.len() == 2)));

        // An empty roster leaves the current one in place.
        let ping = state.ping(t0).sends.remove(0).envelope;
        state.handle_response(host_response(&ping, vec![]), t0, false);
        assert_eq!(state.client_roster().len(), 2);
    }

    #[test]
    fn test_broadcast_reaches_every_roster_peer() {
        let mut state = state();
        let t0 = Utc::now();
        let roster: Vec<RemotePeer> = ["a", "b", "c"]
            .iter()
            .map(|n| RemotePeer::from_envelope(&Envelope::new(PING, peer(n))))
            .collect();
        let ping = state.ping(t0).sends.remove(0).envelope;
        state.handle_response(host_response(&ping, roster), t0, false);

        let calls = Arc::new(Mutex::new(0));
        let seen = Arc::clone(&calls);
        let me = state.client().clone();
        let effects = state.broadcast(
            Envelope::new("Update", me),
            Some(handler(move |_| *seen.lock().unwrap() += 1)),
            t0,
        );
        assert_eq!(effects.sends.len(), 3);
        assert_eq!(state.pending_callbacks(), 3);

        for out in effects.sends {
            let request = out.envelope;
            let responder = request.to.clone().unwrap();
            let mut response = Envelope::response_to(&request, responder.clone());
            response
                .set_payload(&Acknowledgement::accepted(responder, vec![]), &JsonSerializer)
                .unwrap();
            for completion in state.handle_response(response, t0, false).completions {
                completion.run();
            }
        }
        assert_eq!(*calls.lock().unwrap(), 3);
        assert_eq!(state.pending_callbacks(), 0);
    }

    #[test]
    fn test_unanswered_callback_times_out() {
        let mut state = state();
        let t0 = Utc::now();
        pong(&mut state, t0);

        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        let me = state.client().clone();
        state.send(
            Envelope::new("Update", me),
            peer("a"),
            Some(handler(move |r| *slot.lock().unwrap() = Some(r.map(|_| ())))),
            t0,
        );
        assert_eq!(state.pending_callbacks(), 1);

        let plan = state.begin_sync(secs(t0, 30), true, true).unwrap();
        assert!(plan.effects.completions.is_empty());

        let plan = state.begin_sync(secs(t0, 61), true, true).unwrap();
        assert_eq!(plan.effects.completions.len(), 1);
        for completion in plan.effects.completions {
            completion.run();
        }
        assert_eq!(
            *outcome.lock().unwrap(),
            Some(Err(CallbackError::TimedOut(Duration::from_secs(60))))
        );
        assert_eq!(state.pending_callbacks(), 0);
    }

    #[test]
    fn test_malformed_ack_reaches_handler() {
        let mut state = state();
        let t0 = Utc::now();
        pong(&mut state, t0);

        let outcome = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&outcome);
        let me = state.client().clone();
        let request = state
            .send(
                Envelope::new("Update", me),
                peer("a"),
                Some(handler(move |r| *slot.lock().unwrap() = Some(r.is_err()))),
                t0,
            )
            .sends
            .remove(0)
            .envelope;
        let mut response = Envelope::response_to(&request, peer("a"));
        response.payload = "{not json".to_string();
        for completion in state.handle_response(response, t0, false).completions {
            completion.run();
        }
        assert_eq!(*outcome.lock().unwrap(), Some(true));
    }

    #[test]
    fn test_shutdown_releases_handlers() {
        let mut state = state();
        let t0 = Utc::now();
        let me = state.client().clone();
        let released = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&released);
        let h = handler(move |r| sink.lock().unwrap().push(r.map(|_| ())));

        state.send(Envelope::new("Deferred", me.clone()), peer("a"), Some(h.clone()), t0);
        pong(&mut state, secs(t0, 5));
        // The deferred send drained and now waits on its response.
        assert_eq!(state.pending_callbacks(), 1);
        state.send(Envelope::new("Later", me), peer("b"), Some(h), secs(t0, 60));
        assert_eq!(state.deferred_len(), 1);

        for completion in state.shutdown().completions {
            completion.run();
        }
        assert_eq!(
            *released.lock().unwrap(),
            vec![Err(CallbackError::Shutdown), Err(CallbackError::Shutdown)]
        );
        assert!(!state.status().is_connected);
        assert_eq!(state.deferred_len(), 0);
    }
}
