//! The client end of the connection.
//!
//! [`ClientConnection`] does no I/O of its own. The embedding code asks it for the next request
//! to send, hands it every message that arrives (responses and pushes alike) and calls
//! [`ClientConnection::check_timeouts`] periodically.

use crate::backend::WidgetSet;
use crate::connector_tree::ConnectorTree;
use crate::error::SyncError;
use crate::id::ConnectorId;
use crate::message::{ClientMessage, Notice, ServerMessage};
use crate::rpc::{Invocation, RpcQueue};
use crate::value::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long messages that arrived ahead of a gap are kept waiting for it to fill.
    pub max_suspended: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            max_suspended: Duration::from_millis(5000),
        }
    }
}

/// Where the request cycle currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    CollectingChanges,
    Serializing,
    /// A request has been handed to the transport and no response has been applied yet.
    AwaitingTransport,
    ApplyingResponse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplicationState {
    /// No server message applied yet.
    Initializing,
    Running,
    /// The session is gone; nothing more is sent.
    Stopped,
}

/// What happened to an incoming message.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// Applied, followed by `released` buffered messages whose gap it filled.
    Applied { sync_id: u64, released: usize },
    /// Ahead of the expected id; kept until the gap fills.
    Buffered { sync_id: u64 },
    /// Already seen or superseded.
    Dropped { sync_id: u64 },
    /// An out-of-band error notice.
    Notice(Notice),
    SessionExpired(Notice),
}

struct Suspended {
    message: ServerMessage,
    received: Instant,
}

pub struct ClientConnection {
    config: ClientConfig,
    tree: ConnectorTree,
    queue: RpcQueue,
    phase: Phase,
    state: ApplicationState,
    last_seen: Option<u64>,
    next_client_id: u64,
    csrf_token: String,
    suspended: BTreeMap<u64, Suspended>,
    resync_requested: bool,
    in_flight: Vec<Invocation>,
    errors: Vec<Notice>,
    heartbeat_interval: Option<Duration>,
    last_heartbeat: Option<Instant>,
}

impl ClientConnection {
    pub fn new(widgets: WidgetSet, config: ClientConfig) -> ClientConnection {
        ClientConnection {
            config,
            tree: ConnectorTree::new(widgets),
            queue: RpcQueue::new(),
            phase: Phase::Idle,
            state: ApplicationState::Initializing,
            last_seen: None,
            next_client_id: 0,
            csrf_token: String::new(),
            suspended: BTreeMap::new(),
            resync_requested: false,
            in_flight: Vec::new(),
            errors: Vec::new(),
            heartbeat_interval: None,
            last_heartbeat: None,
        }
    }

    pub fn tree(&self) -> &ConnectorTree {
        &self.tree
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn application_state(&self) -> ApplicationState {
        self.state
    }

    /// The last applied server sync id.
    pub fn last_seen_sync_id(&self) -> Option<u64> {
        self.last_seen
    }

    pub fn has_pending_rpc(&self) -> bool {
        !self.queue.is_empty()
    }

    /// Takes the error notices received so far.
    pub fn take_errors(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.errors)
    }

    /// Queues a ServerRpc invocation for the next request.
    pub fn invoke(&mut self, invocation: Invocation) {
        if self.state == ApplicationState::Stopped {
            debug!(connector = %invocation.connector, "client stopped, dropping invocation");
            return;
        }
        self.queue.push(invocation);
    }

    /// Queues a legacy variable change; only the last value per variable is sent.
    pub fn set_variable(&mut self, connector: &ConnectorId, name: &str, value: impl Into<Value>) {
        if self.state == ApplicationState::Stopped {
            return;
        }
        self.queue.set_variable(connector, name, &value.into());
    }

    /// Asks the server to resend everything with the next request.
    pub fn request_resynchronize(&mut self) {
        self.resync_requested = true;
    }

    /// Builds the next request, if one should be sent now.
    ///
    /// Returns `None` while a request is in flight, after the client stopped, or when there is
    /// nothing to send.
    pub fn next_request(&mut self) -> Option<ClientMessage> {
        if self.state == ApplicationState::Stopped || self.phase != Phase::Idle {
            return None;
        }
        if self.queue.is_empty() && !self.resync_requested {
            return None;
        }

        self.phase = Phase::CollectingChanges;
        let rpc = self.queue.drain();

        self.phase = Phase::Serializing;
        let message = ClientMessage {
            csrf_token: self.csrf_token.clone(),
            sync_id: self.last_seen,
            client_id: self.next_client_id,
            resynchronize: std::mem::take(&mut self.resync_requested),
            rpc: rpc.clone(),
        };
        self.in_flight = rpc;
        self.next_client_id += 1;
        self.phase = Phase::AwaitingTransport;
        debug!(client_id = message.client_id, invocations = message.rpc.len(), "sending request");
        Some(message)
    }

    /// The transport gave up on the in-flight request; its invocations go back to the queue.
    pub fn transport_failed(&mut self) {
        if self.phase != Phase::AwaitingTransport {
            return;
        }
        warn!(client_id = self.next_client_id - 1, "request failed, requeueing");
        let in_flight = std::mem::take(&mut self.in_flight);
        self.queue.requeue_front(in_flight);
        self.next_client_id -= 1;
        self.phase = Phase::Idle;
    }

    /// Handles raw bytes received from the server.
    pub fn receive(&mut self, bytes: &[u8], now: Instant) -> Result<Delivery, SyncError> {
        let message = ServerMessage::from_bytes(bytes)?;
        self.handle_message(message, now)
    }

    /// Handles one server message: a response or a push.
    pub fn handle_message(&mut self, message: ServerMessage, now: Instant) -> Result<Delivery, SyncError> {
        if let Some(notice) = message.meta.session_expired.clone() {
            info!("session expired");
            self.stop();
            return Ok(Delivery::SessionExpired(notice));
        }
        if self.state == ApplicationState::Stopped {
            return Err(SyncError::SessionExpired);
        }

        let sync_id = match message.sync_id {
            Some(sync_id) => sync_id,
            None => {
                let notice = message.meta.app_error.clone().unwrap_or_default();
                self.errors.push(notice.clone());
                if !message.meta.is_async {
                    self.end_request();
                }
                return Ok(Delivery::Notice(notice));
            }
        };

        if let Some(last_seen) = self.last_seen {
            let expected = last_seen + 1;
            if message.resynchronize && sync_id != expected {
                debug!(sync_id, expected, "resynchronizing, resetting expected id");
                self.last_seen = sync_id.checked_sub(1);
                self.suspended = self.suspended.split_off(&sync_id);
            } else if sync_id <= last_seen {
                debug!(sync_id, last_seen, "dropping already seen message");
                if !message.meta.is_async {
                    self.end_request();
                }
                return Ok(Delivery::Dropped { sync_id });
            } else if sync_id > expected {
                warn!(sync_id, expected, "message arrived early, buffering");
                self.suspended.insert(
                    sync_id,
                    Suspended {
                        message,
                        received: now,
                    },
                );
                return Ok(Delivery::Buffered { sync_id });
            }
        }

        self.apply(message)?;

        let mut released = 0;
        while let Some(expected) = self.last_seen.map(|id| id + 1) {
            match self.suspended.remove(&expected) {
                Some(suspended) => {
                    self.apply(suspended.message)?;
                    released += 1;
                }
                None => break,
            }
        }
        Ok(Delivery::Applied { sync_id, released })
    }

    /// True when a heartbeat should be sent at `now`; the embedding code then calls the
    /// server's heartbeat endpoint.
    ///
    /// The first call after the interval is known only starts the clock.
    pub fn heartbeat_due(&mut self, now: Instant) -> bool {
        let interval = match self.heartbeat_interval {
            Some(interval) if self.state == ApplicationState::Running => interval,
            _ => return false,
        };
        match self.last_heartbeat {
            Some(last) if now.saturating_duration_since(last) < interval => false,
            Some(_) => {
                self.last_heartbeat = Some(now);
                true
            }
            None => {
                self.last_heartbeat = Some(now);
                false
            }
        }
    }

    /// Drops buffered messages whose gap did not fill in time and schedules a resynchronization.
    ///
    /// Returns true if anything was dropped.
    pub fn check_timeouts(&mut self, now: Instant) -> bool {
        let oldest = match self.suspended.values().map(|s| s.received).min() {
            Some(oldest) => oldest,
            None => return false,
        };
        if now.duration_since(oldest) < self.config.max_suspended {
            return false;
        }

        warn!(
            buffered = self.suspended.len(),
            "gap in server messages did not fill, resynchronizing"
        );
        let dropped_response = self.suspended.values().any(|s| !s.message.meta.is_async);
        self.suspended.clear();
        self.resync_requested = true;
        if dropped_response {
            self.end_request();
        }
        true
    }

    fn apply(&mut self, message: ServerMessage) -> Result<(), SyncError> {
        let responding = !message.meta.is_async && self.phase == Phase::AwaitingTransport;
        if responding {
            self.phase = Phase::ApplyingResponse;
        }

        let result = self.tree.apply_batch(&message);

        self.last_seen = message.sync_id.or(self.last_seen);
        if let Some(client_id) = message.client_id {
            self.next_client_id = client_id;
        }
        if let Some(token) = &message.meta.csrf_token {
            self.csrf_token = token.clone();
        }
        if let Some(secs) = message.meta.heartbeat_interval {
            self.heartbeat_interval = Some(Duration::from_secs(secs)).filter(|i| !i.is_zero());
        }
        if let Some(notice) = &message.meta.app_error {
            self.errors.push(notice.clone());
        }
        if self.state == ApplicationState::Initializing {
            self.state = ApplicationState::Running;
        }
        if responding {
            self.end_request();
        }

        if let Err(err) = result {
            // the tree may be inconsistent now; ask for everything again
            warn!(%err, "could not apply server message");
            self.resync_requested = true;
            return Err(err);
        }
        Ok(())
    }

    fn end_request(&mut self) {
        if matches!(self.phase, Phase::AwaitingTransport | Phase::ApplyingResponse) {
            self.in_flight.clear();
            self.phase = Phase::Idle;
        }
    }

    fn stop(&mut self) {
        self.state = ApplicationState::Stopped;
        self.phase = Phase::Idle;
        self.queue.drain();
        self.in_flight.clear();
        self.suspended.clear();
    }
}
