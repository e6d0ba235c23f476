//! Per-connection state: signed-in identity, admission control and the
//! connection-local table of requests awaiting replies.

use super::correlation::PendingReplies;
use super::rate_limit::{Admission, AdmissionControl};
use crate::config::RateLimitPolicy;
use crate::model::{self, Identity};

pub struct Connection {
    pub id: String,
    pub clientagent: Option<String>,
    pub clientversion: Option<String>,
    identity: Option<Identity>,
    credential: Option<String>,
    admission: AdmissionControl,
    pending: PendingReplies,
    closed: bool,
}

impl Connection {
    pub fn new(rate_limit: &RateLimitPolicy) -> Self {
        Self {
            id: model::new_id(),
            clientagent: None,
            clientversion: None,
            identity: None,
            credential: None,
            admission: AdmissionControl::new(rate_limit),
            pending: PendingReplies::new(),
            closed: false,
        }
    }

    /// A connection with no admission limits, for in-process callers.
    pub fn unlimited() -> Self {
        Self::new(&RateLimitPolicy {
            enabled: false,
            ..Default::default()
        })
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    pub fn credential(&self) -> Option<&str> {
        self.credential.as_deref()
    }

    pub fn sign_in(&mut self, identity: Identity, credential: String) {
        tracing::info!(connection = %self.id, user = %identity.username, "signed in");
        self.identity = Some(identity);
        self.credential = Some(credential);
    }

    pub fn pending(&self) -> &PendingReplies {
        &self.pending
    }

    pub fn admit(&mut self) -> Admission {
        self.admission.admit()
    }

    pub fn close(&mut self) {
        if !self.closed {
            tracing::warn!(connection = %self.id, "closing connection");
        }
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
