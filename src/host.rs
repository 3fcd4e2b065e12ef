use crate::config::Config;
use crate::session::Session;
use crate::tracker::ConnectorTracker;
use crossbeam::channel::{self, Sender};
use crossbeam::select;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vireo_core::{ServerMessage, SyncError};

/// Owns every session of one application and routes requests to them.
#[derive(Debug)]
pub struct Host {
    config: Arc<Config>,
    sessions: RwLock<HashMap<Uuid, Arc<Session>>>,
}

impl Host {
    pub fn new(config: Config) -> Host {
        Host {
            config: Arc::new(config),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Creates a session, builds its initial connector tree with `init` and returns the session
    /// with its bootstrap message.
    pub fn open_session<F>(&self, init: F) -> Result<(Arc<Session>, Vec<u8>), SyncError>
    where
        F: FnOnce(&mut ConnectorTracker) -> Result<(), SyncError>,
    {
        let session = Arc::new(Session::new(self.config.clone()));
        session.access(init)??;
        let bootstrap = session.bootstrap()?;
        self.sessions.write().insert(session.id(), session.clone());
        info!(session = %session.id(), "session opened");
        Ok((session, bootstrap))
    }

    pub fn session(&self, id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }

    pub fn close_session(&self, id: &Uuid) {
        if let Some(session) = self.sessions.write().remove(id) {
            session.expire();
        }
    }

    /// Handles a request for the session `session_id`.
    ///
    /// Failures that end the transaction become user-facing notices: unknown or expired sessions
    /// get the session-expired message, anything else the communication-error message. An empty
    /// vector means there is nothing to respond with.
    pub fn handle_request(&self, session_id: &str, body: &[u8]) -> Result<Vec<u8>, SyncError> {
        let session = Uuid::parse_str(session_id)
            .ok()
            .and_then(|id| self.session(&id));
        let session = match session {
            Some(session) => session,
            None => {
                debug!(session = session_id, "request for unknown session");
                return self.session_expired();
            }
        };

        match session.handle_request(body) {
            Ok(Some(response)) => Ok(response),
            Ok(None) => Ok(Vec::new()),
            Err(SyncError::SessionExpired) => self.session_expired(),
            Err(err) => {
                warn!(session = %session.id(), %err, "request failed");
                ServerMessage::app_error(self.config.system_messages.communication_error.notice()).to_bytes()
            }
        }
    }

    /// Records a heartbeat for `session_id`.
    ///
    /// Returns `None` while the session is alive and the session-expired notice once it is not.
    pub fn heartbeat(&self, session_id: &str) -> Result<Option<Vec<u8>>, SyncError> {
        let session = Uuid::parse_str(session_id)
            .ok()
            .and_then(|id| self.session(&id));
        match session.map(|session| session.heartbeat()) {
            Some(Ok(())) => Ok(None),
            Some(Err(SyncError::SessionExpired)) | None => self.session_expired().map(Some),
            Some(Err(err)) => Err(err),
        }
    }

    fn session_expired(&self) -> Result<Vec<u8>, SyncError> {
        ServerMessage::session_expired(self.config.system_messages.session_expired.notice()).to_bytes()
    }

    /// Expires sessions that have been idle longer than the session timeout at `now`, or whose
    /// client stopped sending heartbeats.
    pub fn expire_idle(&self, now: Instant) -> Vec<Uuid> {
        let timeout = self.config.session_timeout();
        let heartbeat_timeout = self.config.heartbeat_timeout();
        let expired: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write();
            let idle: Vec<Uuid> = sessions
                .values()
                .filter(|s| {
                    s.is_expired()
                        || s.is_idle(now, timeout)
                        || heartbeat_timeout.map_or(false, |t| s.missed_heartbeats(now, t))
                })
                .map(|s| s.id())
                .collect();
            idle.iter().filter_map(|id| sessions.remove(id)).collect()
        };

        // outside the table lock; expiring waits for each session lock
        expired
            .into_iter()
            .map(|session| {
                session.expire();
                session.id()
            })
            .collect()
    }

    /// Runs `expire_idle` every `interval` on a background thread until the returned handle is
    /// dropped (or the host is).
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> Sweeper {
        let (stop, stopped) = channel::bounded::<()>(0);
        let host: Weak<Host> = Arc::downgrade(self);
        let ticker = channel::tick(interval);

        let handle = thread::spawn(move || loop {
            select! {
                recv(ticker) -> _ => match host.upgrade() {
                    Some(host) => {
                        let expired = host.expire_idle(Instant::now());
                        if !expired.is_empty() {
                            debug!(count = expired.len(), "expired idle sessions");
                        }
                    }
                    None => break,
                },
                recv(stopped) -> _ => break,
            }
        });

        Sweeper {
            stop: Some(stop),
            handle: Some(handle),
        }
    }
}

/// Stops the session sweeper when dropped.
#[derive(Debug)]
pub struct Sweeper {
    stop: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("session sweeper panicked");
            }
        }
    }
}
