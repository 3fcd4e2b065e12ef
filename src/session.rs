//! Sessions and the session lock.

use crate::communication::CommunicationManager;
use crate::config::Config;
use crate::push::{PushConnection, PushMode};
use crate::tracker::ConnectorTracker;
use crossbeam::channel::Receiver;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;
use vireo_core::SyncError;

/// Everything guarded by the session lock.
#[derive(Debug)]
pub struct SessionState {
    pub tracker: ConnectorTracker,
    communication: CommunicationManager,
    push: PushConnection,
}

impl SessionState {
    /// Pushes pending changes if the push channel is connected.
    ///
    /// When it is not, the changes stay pending for the next regular request.
    fn push_pending(&mut self) -> Result<bool, SyncError> {
        if !self.push.is_connected() || !self.tracker.has_pending_changes() {
            return Ok(false);
        }
        let message = self.communication.push_message(&mut self.tracker);
        if !self.push.send(message.to_bytes()?) {
            warn!(sync_id = ?message.sync_id, "push channel closed while sending");
            self.communication.push_failed(&mut self.tracker, message);
            return Ok(false);
        }
        Ok(true)
    }
}

/// One user's session: a connector tree behind an exclusive lock.
#[derive(Debug)]
pub struct Session {
    id: Uuid,
    csrf_token: String,
    config: Arc<Config>,
    state: Mutex<SessionState>,
    last_activity: Mutex<Instant>,
    last_heartbeat: Mutex<Instant>,
    expired: AtomicBool,
}

impl Session {
    pub fn new(config: Arc<Config>) -> Session {
        let csrf_token = Uuid::new_v4().to_string();
        let communication = CommunicationManager::new(&config, csrf_token.clone());
        Session {
            id: Uuid::new_v4(),
            csrf_token,
            config,
            state: Mutex::new(SessionState {
                tracker: ConnectorTracker::new(),
                communication,
                push: PushConnection::new(),
            }),
            last_activity: Mutex::new(Instant::now()),
            last_heartbeat: Mutex::new(Instant::now()),
            expired: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    pub fn is_expired(&self) -> bool {
        self.expired.load(Ordering::Acquire)
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }

    /// True if the session has been inactive for longer than `timeout` at `now`.
    pub fn is_idle(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(self.last_activity()) > timeout
    }

    /// True if no heartbeat or request has arrived for longer than `timeout` at `now`.
    pub fn missed_heartbeats(&self, now: Instant, timeout: Duration) -> bool {
        now.saturating_duration_since(*self.last_heartbeat.lock()) > timeout
    }

    fn touch(&self) {
        let now = Instant::now();
        *self.last_activity.lock() = now;
        *self.last_heartbeat.lock() = now;
    }

    /// Records a heartbeat from the client. Does not take the session lock.
    pub fn heartbeat(&self) -> Result<(), SyncError> {
        if self.is_expired() {
            return Err(SyncError::SessionExpired);
        }
        let now = Instant::now();
        *self.last_heartbeat.lock() = now;
        if !self.config.close_idle_sessions {
            *self.last_activity.lock() = now;
        }
        Ok(())
    }

    /// Acquires the session lock, waiting at most the configured lock timeout.
    fn lock(&self) -> Result<MutexGuard<'_, SessionState>, SyncError> {
        if self.is_expired() {
            return Err(SyncError::SessionExpired);
        }
        let guard = self
            .state
            .try_lock_for(self.config.lock_timeout())
            .ok_or(SyncError::LockTimeout)?;
        // it may have expired while we were waiting
        if self.is_expired() {
            return Err(SyncError::SessionExpired);
        }
        Ok(guard)
    }

    /// Runs `f` under the session lock.
    ///
    /// With automatic push, the resulting changes are pushed before the lock is released.
    pub fn access<R>(&self, f: impl FnOnce(&mut ConnectorTracker) -> R) -> Result<R, SyncError> {
        let mut state = self.lock()?;
        let result = f(&mut state.tracker);
        if self.config.push_mode == PushMode::Automatic {
            state.push_pending()?;
        }
        Ok(result)
    }

    /// Pushes pending changes now. Returns true if a message was sent.
    pub fn push(&self) -> Result<bool, SyncError> {
        if !self.config.push_mode.is_enabled() {
            return Ok(false);
        }
        self.lock()?.push_pending()
    }

    /// Opens the push channel; the transport forwards what arrives on the receiver.
    pub fn connect_push(&self) -> Result<Receiver<Vec<u8>>, SyncError> {
        let mut state = self.lock()?;
        debug!(session = %self.id, "push channel opened");
        Ok(state.push.connect())
    }

    pub fn disconnect_push(&self) -> Result<(), SyncError> {
        self.lock()?.push.disconnect();
        Ok(())
    }

    /// The first message for a newly loaded client.
    pub fn bootstrap(&self) -> Result<Vec<u8>, SyncError> {
        let mut state = self.lock()?;
        self.touch();
        let state = &mut *state;
        state.communication.bootstrap(&mut state.tracker).to_bytes()
    }

    /// Handles one client request. Returns the response body, or `None` for an empty request.
    pub fn handle_request(&self, body: &[u8]) -> Result<Option<Vec<u8>>, SyncError> {
        let mut state = self.lock()?;
        self.touch();
        let state = &mut *state;
        match state.communication.handle_request(&mut state.tracker, body)? {
            Some(response) => Ok(Some(response.to_bytes()?)),
            None => Ok(None),
        }
    }

    /// Marks the session expired and releases its push channel.
    ///
    /// Further requests fail with `SessionExpired`.
    pub fn expire(&self) {
        if self.expired.swap(true, Ordering::AcqRel) {
            return;
        }
        info!(session = %self.id, "session expired");
        if let Some(mut state) = self.state.try_lock_for(self.config.lock_timeout()) {
            state.push.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use vireo_core::state::COMPONENT_STATE;
    use vireo_core::{ClientMessage, ServerMessage, Value};

    fn session(push_mode: PushMode) -> Session {
        let session = Session::new(Arc::new(Config {
            push_mode,
            lock_timeout: 50,
            ..Config::default()
        }));
        session
            .access(|tracker| {
                let root = tracker.create("Label", &COMPONENT_STATE)?;
                tracker.set_root(&root)
            })
            .unwrap()
            .unwrap();
        session.bootstrap().unwrap();
        session
    }

    fn set_caption(tracker: &mut ConnectorTracker, caption: &str) {
        let root = tracker.root().cloned().unwrap();
        tracker.get_mut(root.as_str()).unwrap().set("caption", caption).unwrap();
    }

    #[test]
    fn automatic_push_on_access() {
        let session = session(PushMode::Automatic);
        let receiver = session.connect_push().unwrap();

        session.access(|t| set_caption(t, "tick")).unwrap();
        let message = ServerMessage::from_bytes(&receiver.try_recv().unwrap()).unwrap();
        assert!(message.meta.is_async);
        assert_eq!(message.sync_id, Some(1));

        // nothing changed, nothing pushed
        session.access(|_| ()).unwrap();
        assert!(receiver.try_recv().is_err());
    }

    #[test]
    fn manual_push_waits_for_flush() {
        let session = session(PushMode::Manual);
        let receiver = session.connect_push().unwrap();

        session.access(|t| set_caption(t, "tick")).unwrap();
        assert!(receiver.try_recv().is_err());
        assert!(session.push().unwrap());
        assert!(receiver.try_recv().is_ok());
    }

    #[test]
    fn changes_stay_pending_without_connection() {
        let session = session(PushMode::Automatic);
        session.access(|t| set_caption(t, "tick")).unwrap();
        assert!(!session.push().unwrap());
        assert!(session.access(|t| t.has_pending_changes()).unwrap());
    }

    #[test]
    fn lock_wait_is_bounded() {
        let session = Arc::new(session(PushMode::Disabled));
        let holder = session.clone();
        let (locked, release) = (crossbeam::channel::bounded(0), crossbeam::channel::bounded::<()>(0));
        let (locked_tx, locked_rx) = locked;
        let (release_tx, release_rx) = release;

        let thread = thread::spawn(move || {
            holder
                .access(|_| {
                    locked_tx.send(()).unwrap();
                    release_rx.recv().unwrap();
                })
                .unwrap();
        });

        locked_rx.recv().unwrap();
        assert!(matches!(session.access(|_| ()), Err(SyncError::LockTimeout)));
        release_tx.send(()).unwrap();
        thread.join().unwrap();
        assert!(session.access(|_| ()).is_ok());
    }

    #[test]
    fn expired_session_refuses_work() {
        let session = session(PushMode::Disabled);
        session.expire();
        assert!(session.is_expired());
        assert!(matches!(session.access(|_| ()), Err(SyncError::SessionExpired)));
        assert!(matches!(session.handle_request(b"{}"), Err(SyncError::SessionExpired)));
    }

    #[test]
    fn lost_push_is_repainted_on_next_request() {
        let session = session(PushMode::Automatic);
        drop(session.connect_push().unwrap());

        session
            .access(|t| {
                set_caption(t, "tick");
                let root = t.root().cloned().unwrap();
                t.get_mut(root.as_str())
                    .unwrap()
                    .call_client("NoticeRpc", "show", &[Value::from("hi")]);
            })
            .unwrap();

        let body = ClientMessage {
            csrf_token: session.csrf_token().to_string(),
            sync_id: Some(0),
            client_id: 0,
            ..ClientMessage::default()
        };
        let response = session.handle_request(&body.to_bytes().unwrap()).unwrap().unwrap();
        let response = ServerMessage::from_bytes(&response).unwrap();
        assert!(response.resynchronize);
        assert!(response.meta.repaint_all);
        // the undelivered push gave its sync id back
        assert_eq!(response.sync_id, Some(1));
        assert_eq!(response.state.len(), 1);
        assert_eq!(response.rpc.len(), 1);
        assert_eq!(response.rpc[0].method, "show");
    }

    #[test]
    fn heartbeat_keeps_session_from_going_idle() {
        let session = session(PushMode::Disabled);
        let start = Instant::now();
        session.heartbeat().unwrap();
        assert!(session.last_activity() >= start);
        assert!(!session.missed_heartbeats(Instant::now(), Duration::from_secs(1)));

        session.expire();
        assert!(matches!(session.heartbeat(), Err(SyncError::SessionExpired)));
    }
}
