//! Pending response callbacks, keyed by correlation id.
//!
//! Every entry is consumed exactly once: by its matching response, by the
//! timeout sweep, or by shutdown.

use crate::error::CallbackError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use swarmlink_types::peer::elapsed_between;
use swarmlink_types::{Acknowledgement, Envelope};
use uuid::Uuid;

/// What a handler receives when its request is answered.
#[derive(Debug, Clone)]
pub struct Reply {
    /// The response envelope as received.
    pub envelope: Envelope,
    pub acknowledgement: Acknowledgement,
}

/// Caller-supplied response handler.
///
/// A broadcast registers the same handler once per recipient, so it may run
/// several times, once per correlation id.
pub type ResponseHandler = Arc<dyn Fn(Result<Reply, CallbackError>) + Send + Sync>;

/// Build a [`ResponseHandler`] from a closure.
pub fn handler<F>(f: F) -> ResponseHandler
where
    F: Fn(Result<Reply, CallbackError>) + Send + Sync + 'static,
{
    Arc::new(f)
}

pub(crate) enum CallbackKind {
    /// The coordinator's own heartbeat.
    Ping,
    Handler(ResponseHandler),
}

impl fmt::Debug for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CallbackKind::Ping => write!(f, "Ping"),
            CallbackKind::Handler(_) => write!(f, "Handler"),
        }
    }
}

#[derive(Debug)]
struct PendingCallback {
    created_at: DateTime<Utc>,
    kind: CallbackKind,
}

#[derive(Debug, Default)]
pub(crate) struct CallbackRegistry {
    pending: HashMap<Uuid, PendingCallback>,
}

impl CallbackRegistry {
    /// Register `kind` under a fresh correlation id.
    pub(crate) fn register(&mut self, kind: CallbackKind, now: DateTime<Utc>) -> Uuid {
        let id = Uuid::new_v4();
        self.pending.insert(id, PendingCallback { created_at: now, kind });
        id
    }

    pub(crate) fn take(&mut self, id: &Uuid) -> Option<CallbackKind> {
        self.pending.remove(id).map(|p| p.kind)
    }

    /// Remove every entry older than `timeout`.
    pub(crate) fn sweep(&mut self, now: DateTime<Utc>, timeout: Duration) -> Vec<CallbackKind> {
        let expired: Vec<Uuid> = self
            .pending
            .iter()
            .filter(|(_, p)| elapsed_between(p.created_at, now) > timeout)
            .map(|(id, _)| *id)
            .collect();
        expired
            .into_iter()
            .filter_map(|id| self.take(&id))
            .collect()
    }

    pub(crate) fn drain(&mut self) -> Vec<CallbackKind> {
        self.pending.drain().map(|(_, p)| p.kind).collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }
}

/// A handler invocation, run by the coordinator once its lock is released.
pub struct Completion {
    handler: ResponseHandler,
    result: Result<Reply, CallbackError>,
}

impl Completion {
    pub(crate) fn new(handler: ResponseHandler, result: Result<Reply, CallbackError>) -> Self {
        Self { handler, result }
    }

    pub fn run(self) {
        (self.handler)(self.result)
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("result", &self.result.as_ref().map(|r| r.envelope.id))
            .finish()
    }
}
