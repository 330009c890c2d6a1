//! Remote peer records and the roster that holds them.
//!
//! A [`RemotePeer`] is what a Host knows about an endpoint that contacted it:
//! the identity, the last envelope seen, and a liveness state derived from how
//! long ago that envelope arrived. The [`Roster`] keeps exactly one record per
//! identity and applies the Active → Inactive → removed transitions.

use crate::envelope::Envelope;
use crate::identity::Identity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};
use std::time::Duration;

/// Default silence after which a peer is Inactive.
pub const DEFAULT_INACTIVE_THRESHOLD: Duration = Duration::from_secs(10);

/// Default silence after which a peer is dropped.
pub const DEFAULT_EXPIRY_THRESHOLD: Duration = Duration::from_secs(60);

/// Liveness state carried by a roster record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    Active,
    Inactive,
}

/// Classification of a record at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Active,
    Inactive,
    /// Past the expiry threshold; the record must be removed.
    Expired,
}

/// The two silence thresholds that drive liveness.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LivenessThresholds {
    pub inactive: Duration,
    pub expiry: Duration,
}

impl Default for LivenessThresholds {
    fn default() -> Self {
        Self {
            inactive: DEFAULT_INACTIVE_THRESHOLD,
            expiry: DEFAULT_EXPIRY_THRESHOLD,
        }
    }
}

impl LivenessThresholds {
    /// Classify a silence of `elapsed`.
    ///
    /// Both bounds are inclusive: a peer silent for exactly `inactive` is
    /// still Active, and one silent for exactly `expiry` is still Inactive.
    pub fn classify(&self, elapsed: Duration) -> Liveness {
        if elapsed <= self.inactive {
            Liveness::Active
        } else if elapsed <= self.expiry {
            Liveness::Inactive
        } else {
            Liveness::Expired
        }
    }
}

/// Time from `then` to `now`, clamped at zero.
pub fn elapsed_between(then: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (now - then).to_std().unwrap_or(Duration::ZERO)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemotePeer {
    identity: Identity,
    last_envelope: Envelope,
    state: PeerState,
}

impl RemotePeer {
    /// A fresh, Active record.
    pub fn new(identity: Identity, last_envelope: Envelope) -> Self {
        Self {
            identity,
            last_envelope,
            state: PeerState::Active,
        }
    }

    /// A record for the sender of `envelope`.
    pub fn from_envelope(envelope: &Envelope) -> Self {
        Self::new(envelope.from.clone(), envelope.clone())
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn last_envelope(&self) -> &Envelope {
        &self.last_envelope
    }

    pub fn state(&self) -> PeerState {
        self.state
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_envelope.last_seen()
    }

    pub fn is_active(&self) -> bool {
        self.state == PeerState::Active
    }

    /// Record a new envelope from this peer, which makes it Active.
    ///
    /// The identity is replaced too so a changed address is picked up.
    pub fn observe(&mut self, envelope: Envelope) {
        self.identity = envelope.from.clone();
        self.last_envelope = envelope;
        self.state = PeerState::Active;
    }

    /// Recompute the state at `now` and return the classification.
    ///
    /// An `Expired` result leaves the state untouched; removing the record is
    /// the owner's job.
    pub fn refresh(&mut self, now: DateTime<Utc>, thresholds: &LivenessThresholds) -> Liveness {
        let liveness = thresholds.classify(elapsed_between(self.last_seen(), now));
        match liveness {
            Liveness::Active => self.state = PeerState::Active,
            Liveness::Inactive => self.state = PeerState::Inactive,
            Liveness::Expired => {}
        }
        liveness
    }
}

impl PartialEq for RemotePeer {
    fn eq(&self, other: &Self) -> bool {
        self.identity == other.identity
    }
}

impl Eq for RemotePeer {}

impl Hash for RemotePeer {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.identity.hash(state);
    }
}

/// What a sweep changed.
#[derive(Debug, Clone, Default)]
pub struct SweepReport {
    /// Identities that went Active → Inactive.
    pub deactivated: Vec<Identity>,
    /// Records removed for exceeding the expiry threshold.
    pub expired: Vec<RemotePeer>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.deactivated.is_empty() && self.expired.is_empty()
    }
}

/// Ordered list of remote peers, one record per identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Roster {
    peers: Vec<RemotePeer>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build from a list, keeping the last record of any duplicated identity.
    pub fn from_peers(peers: Vec<RemotePeer>) -> Self {
        let mut roster = Self::new();
        for peer in peers {
            match roster.position(&peer.identity) {
                Some(idx) => roster.peers[idx] = peer,
                None => roster.peers.push(peer),
            }
        }
        roster
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn peers(&self) -> &[RemotePeer] {
        &self.peers
    }

    pub fn iter(&self) -> impl Iterator<Item = &RemotePeer> {
        self.peers.iter()
    }

    pub fn to_vec(&self) -> Vec<RemotePeer> {
        self.peers.clone()
    }

    pub fn get(&self, identity: &Identity) -> Option<&RemotePeer> {
        self.peers.iter().find(|p| &p.identity == identity)
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.get(identity).is_some()
    }

    fn position(&self, identity: &Identity) -> Option<usize> {
        self.peers.iter().position(|p| &p.identity == identity)
    }

    /// Record `envelope` from its sender and sweep every other record.
    ///
    /// Returns whether a new record was created, together with the sweep.
    pub fn observe(
        &mut self,
        envelope: &Envelope,
        now: DateTime<Utc>,
        thresholds: &LivenessThresholds,
    ) -> (bool, SweepReport) {
        let sender = envelope.from.clone();
        let added = match self.position(&sender) {
            Some(idx) => {
                self.peers[idx].observe(envelope.clone());
                false
            }
            None => {
                self.peers.push(RemotePeer::from_envelope(envelope));
                true
            }
        };
        let report = self.sweep_except(now, thresholds, Some(&sender));
        (added, report)
    }

    /// Apply liveness transitions to every record.
    pub fn sweep(&mut self, now: DateTime<Utc>, thresholds: &LivenessThresholds) -> SweepReport {
        self.sweep_except(now, thresholds, None)
    }

    fn sweep_except(
        &mut self,
        now: DateTime<Utc>,
        thresholds: &LivenessThresholds,
        skip: Option<&Identity>,
    ) -> SweepReport {
        let mut report = SweepReport::default();
        let mut kept = Vec::with_capacity(self.peers.len());
        for mut peer in self.peers.drain(..) {
            if skip == Some(&peer.identity) {
                kept.push(peer);
                continue;
            }
            let was_active = peer.is_active();
            match peer.refresh(now, thresholds) {
                Liveness::Expired => report.expired.push(peer),
                Liveness::Inactive => {
                    if was_active {
                        report.deactivated.push(peer.identity.clone());
                    }
                    kept.push(peer);
                }
                Liveness::Active => kept.push(peer),
            }
        }
        self.peers = kept;
        report
    }
}

impl From<Vec<RemotePeer>> for Roster {
    fn from(peers: Vec<RemotePeer>) -> Self {
        Self::from_peers(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope_from(instance: &str, at: DateTime<Utc>) -> Envelope {
        let mut env = Envelope::new("Ping", Identity::client(1, "Group1", instance));
        env.sent_at = at;
        env.mark_received(at);
        env
    }

    #[test]
    fn test_classify_bounds_inclusive() {
        let t = LivenessThresholds::default();
        assert_eq!(t.classify(Duration::ZERO), Liveness::Active);
        assert_eq!(t.classify(Duration::from_secs(10)), Liveness::Active);
        assert_eq!(t.classify(Duration::from_millis(10_001)), Liveness::Inactive);
        assert_eq!(t.classify(Duration::from_secs(60)), Liveness::Inactive);
        assert_eq!(t.classify(Duration::from_millis(60_001)), Liveness::Expired);
    }

    #[test]
    fn test_transitions_exactly_at_thresholds() {
        let t0 = Utc::now();
        let thresholds = LivenessThresholds::default();
        let mut roster = Roster::new();
        roster.observe(&envelope_from("a", t0), t0, &thresholds);

        let report = roster.sweep(t0 + chrono::Duration::seconds(10), &thresholds);
        assert!(report.is_empty());
        assert!(roster.peers()[0].is_active());

        let report = roster.sweep(t0 + chrono::Duration::milliseconds(10_001), &thresholds);
        assert_eq!(report.deactivated.len(), 1);
        assert_eq!(roster.peers()[0].state(), PeerState::Inactive);

        let report = roster.sweep(t0 + chrono::Duration::seconds(60), &thresholds);
        assert!(report.is_empty());
        assert_eq!(roster.len(), 1);

        let report = roster.sweep(t0 + chrono::Duration::milliseconds(60_001), &thresholds);
        assert_eq!(report.expired.len(), 1);
        assert!(roster.is_empty());
    }

    #[test]
    fn test_n_distinct_senders_give_n_records() {
        let t0 = Utc::now();
        let thresholds = LivenessThresholds::default();
        let mut roster = Roster::new();
        for round in 0..3 {
            for i in 0..5 {
                let at = t0 + chrono::Duration::seconds(round * 5 + i);
                roster.observe(&envelope_from(&format!("n{i}"), at), at, &thresholds);
            }
        }
        assert_eq!(roster.len(), 5);
    }

    #[test]
    fn test_observe_reactivates_and_sweeps_others() {
        let t0 = Utc::now();
        let thresholds = LivenessThresholds::default();
        let mut roster = Roster::new();
        roster.observe(&envelope_from("old", t0), t0, &thresholds);
        roster.observe(&envelope_from("quiet", t0), t0, &thresholds);

        let t1 = t0 + chrono::Duration::seconds(30);
        let (added, report) = roster.observe(&envelope_from("quiet", t1), t1, &thresholds);
        assert!(!added);
        assert_eq!(report.deactivated, vec![Identity::client(1, "Group1", "old")]);
        assert!(roster.get(&Identity::client(9, "Group1", "quiet")).unwrap().is_active());

        let t2 = t0 + chrono::Duration::seconds(61);
        let (added, report) = roster.observe(&envelope_from("new", t2), t2, &thresholds);
        assert!(added);
        assert_eq!(report.expired.len(), 1);
        assert!(!roster.contains(&Identity::client(1, "Group1", "old")));
        assert_eq!(roster.len(), 2);
    }

    #[test]
    fn test_from_peers_dedups() {
        let t0 = Utc::now();
        let a1 = RemotePeer::from_envelope(&envelope_from("a", t0));
        let a2 = RemotePeer::from_envelope(&envelope_from("a", t0 + chrono::Duration::seconds(1)));
        let b = RemotePeer::from_envelope(&envelope_from("b", t0));
        let roster = Roster::from_peers(vec![a1, b, a2]);
        assert_eq!(roster.len(), 2);
        assert_eq!(roster.peers()[0].last_seen(), t0 + chrono::Duration::seconds(1));
    }

    #[test]
    fn test_roster_serializes_as_list() {
        let t0 = Utc::now();
        let roster = Roster::from_peers(vec![RemotePeer::from_envelope(&envelope_from("a", t0))]);
        let json = serde_json::to_value(&roster).unwrap();
        assert!(json.is_array());
        let back: Roster = serde_json::from_value(json).unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back.peers()[0].state(), PeerState::Active);
    }
}
