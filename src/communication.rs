//! Server-side request handling and response writing.

use crate::config::Config;
use crate::tracker::ConnectorTracker;
use std::collections::BTreeMap;
use tracing::{debug, error, warn};
use vireo_core::codec::decode_value;
use vireo_core::message::Meta;
use vireo_core::rpc::{merge_variable_changes, Incoming, LEGACY_METHOD};
use vireo_core::{ClientMessage, Invocation, Notice, RpcError, ServerMessage, SyncError, TypeTag, Value};

/// Keeps the sequence numbers of one session and turns requests into responses.
#[derive(Debug)]
pub struct CommunicationManager {
    csrf_token: String,
    xsrf_protection: bool,
    strict_rpc: bool,
    heartbeat_interval: Option<u64>,
    /// Id the next client message must carry.
    expected_client_id: u64,
    /// Sync id of the next server message.
    next_sync_id: u64,
    /// A message was lost on the way to the client; the next response repaints everything.
    resync_pending: bool,
}

impl CommunicationManager {
    pub fn new(config: &Config, csrf_token: String) -> CommunicationManager {
        CommunicationManager {
            csrf_token,
            xsrf_protection: config.xsrf_protection,
            strict_rpc: config.strict_rpc,
            heartbeat_interval: config.heartbeat_interval().map(|interval| interval.as_secs()),
            expected_client_id: 0,
            next_sync_id: 0,
            resync_pending: false,
        }
    }

    pub fn csrf_token(&self) -> &str {
        &self.csrf_token
    }

    pub fn next_sync_id(&self) -> u64 {
        self.next_sync_id
    }

    pub fn expected_client_id(&self) -> u64 {
        self.expected_client_id
    }

    /// The first message for a new client: every connector, the root and the CSRF token.
    pub fn bootstrap(&mut self, tracker: &mut ConnectorTracker) -> ServerMessage {
        tracker.mark_all_uninitialized();
        let mut message = self.write(tracker, false);
        message.meta.heartbeat_interval = self.heartbeat_interval;
        message
    }

    /// Handles one client request and returns the response.
    ///
    /// Returns `None` for an empty body. Errors abort the whole request.
    pub fn handle_request(
        &mut self,
        tracker: &mut ConnectorTracker,
        body: &[u8],
    ) -> Result<Option<ServerMessage>, SyncError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            debug!("ignoring empty request");
            return Ok(None);
        }

        let request = ClientMessage::from_bytes(body)?;
        if self.xsrf_protection && request.csrf_token != self.csrf_token {
            warn!("request with invalid security key");
            return Err(SyncError::InvalidSecurityKey);
        }
        if let Some(seen) = request.sync_id {
            tracker.acknowledge(seen);
        }

        let mut repaint_all = request.resynchronize || std::mem::take(&mut self.resync_pending);
        let mut app_error = None;
        if request.client_id == self.expected_client_id {
            self.expected_client_id += 1;
            app_error = self.handle_invocations(tracker, request.rpc);
        } else {
            // the client may have missed the response to an earlier request
            repaint_all = true;
            if request.client_id < self.expected_client_id {
                debug!(
                    expected = self.expected_client_id,
                    actual = request.client_id,
                    "ignoring duplicate request"
                );
            } else {
                warn!(
                    expected = self.expected_client_id,
                    actual = request.client_id,
                    "unexpected client message id"
                );
            }
        }

        if repaint_all {
            tracker.mark_all_uninitialized();
        }
        let mut response = self.write(tracker, false);
        response.resynchronize = repaint_all;
        response.meta.repaint_all = repaint_all;
        response.meta.app_error = app_error;
        Ok(Some(response))
    }

    /// Collects pending changes into a message for the push channel.
    pub fn push_message(&mut self, tracker: &mut ConnectorTracker) -> ServerMessage {
        self.write(tracker, true)
    }

    /// Takes back a push message that could not be delivered.
    ///
    /// Its ClientRpc calls are queued again and the next response is a full repaint, which the
    /// client accepts in place of the missing sync id.
    pub fn push_failed(&mut self, tracker: &mut ConnectorTracker, message: ServerMessage) {
        if let Some(sync_id) = message.sync_id {
            if sync_id + 1 == self.next_sync_id {
                self.next_sync_id = sync_id;
            }
        }
        tracker.restore_client_rpc(message.rpc);
        tracker.mark_all_uninitialized();
        self.resync_pending = true;
    }

    fn write(&mut self, tracker: &mut ConnectorTracker, is_async: bool) -> ServerMessage {
        let sync_id = self.next_sync_id;
        self.next_sync_id += 1;
        let changes = tracker.collect_changes(sync_id);

        let csrf_token = changes.root.as_ref().map(|_| self.csrf_token.clone());
        debug!(
            sync_id,
            state = changes.state.len(),
            hierarchy = changes.hierarchy.len(),
            rpc = changes.rpc.len(),
            is_async,
            "writing server message"
        );
        ServerMessage {
            sync_id: Some(sync_id),
            // a push must not move the client's request counter
            client_id: if is_async { None } else { Some(self.expected_client_id) },
            resynchronize: false,
            root: changes.root,
            state: changes.state,
            hierarchy: changes.hierarchy,
            rpc: changes.rpc,
            meta: Meta {
                is_async,
                csrf_token,
                ..Meta::default()
            },
        }
    }

    /// Runs the invocations of one request, in order. Returns the notice to surface, if any.
    fn handle_invocations(&self, tracker: &mut ConnectorTracker, rpc: Vec<Invocation>) -> Option<Notice> {
        let mut notice = None;
        for incoming in merge_variable_changes(rpc) {
            let id = incoming.connector().clone();
            if tracker.is_stale(&id) {
                debug!(connector = %id, "ignoring invocation for removed connector");
                continue;
            }
            if !tracker.is_enabled(&id) {
                warn!(connector = %id, "ignoring invocation for disabled connector");
                continue;
            }
            let connector = match tracker.get_mut(id.as_str()) {
                Ok(connector) => connector,
                Err(err) => {
                    warn!(%err, "ignoring invocation");
                    continue;
                }
            };

            let result = match &incoming {
                Incoming::Rpc(invocation) => connector.dispatch(invocation),
                Incoming::Variables { changes, .. } => {
                    decode_variables(changes).and_then(|changes| connector.change_variables(&changes))
                }
            };

            match result {
                Ok(()) => (),
                Err(err @ RpcError::NoHandler { .. })
                | Err(err @ RpcError::NoMethod { .. })
                | Err(err @ RpcError::NotVariableOwner(_)) => {
                    warn!(connector = %id, %err, "no handler for invocation");
                    if self.strict_rpc {
                        notice = Some(Notice {
                            caption: Some("Internal error".into()),
                            message: Some(err.to_string()),
                            url: None,
                        });
                    }
                }
                Err(err @ RpcError::Handler(_)) => error!(connector = %id, %err, "rpc handler failed"),
                Err(err) => warn!(connector = %id, %err, "could not dispatch invocation"),
            }
        }
        notice
    }
}

fn decode_variables(
    changes: &BTreeMap<String, serde_json::Value>,
) -> Result<BTreeMap<String, Value>, RpcError> {
    changes
        .iter()
        .enumerate()
        .map(|(index, (name, json))| {
            decode_value(&TypeTag::Any, json)
                .map(|value| (name.clone(), value))
                .map_err(|reason| RpcError::Coercion {
                    method: LEGACY_METHOD.to_string(),
                    index,
                    reason,
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use vireo_core::state::COMPONENT_STATE;
    use vireo_core::{ConnectorId, RpcInterface};

    struct Fixture {
        tracker: ConnectorTracker,
        comm: CommunicationManager,
        root: ConnectorId,
        field: ConnectorId,
        clicks: Arc<AtomicUsize>,
    }

    fn fixture(config: Config) -> Fixture {
        let mut tracker = ConnectorTracker::new();
        let root = tracker.create("Layout", &COMPONENT_STATE).unwrap();
        let field = tracker.create("TextField", &COMPONENT_STATE).unwrap();
        tracker.set_root(&root).unwrap();
        tracker.add_child(&root, &field).unwrap();

        let clicks = Arc::new(AtomicUsize::new(0));
        let counter = clicks.clone();
        let connector = tracker.get_mut(field.as_str()).unwrap();
        connector.register_rpc(
            RpcInterface::new("ClickRpc")
                .method("click", &[], move |_, _| {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap(),
        );
        connector.on_variables(|c, changes| {
            if let Some(text) = changes.get("text").and_then(Value::as_str) {
                let text = text.to_string();
                c.set("caption", text).map_err(|e| RpcError::Handler(e.to_string()))?;
            }
            Ok(())
        });

        let mut comm = CommunicationManager::new(&config, "token".into());
        comm.bootstrap(&mut tracker);
        Fixture {
            tracker,
            comm,
            root,
            field,
            clicks,
        }
    }

    fn request(client_id: u64, rpc: Vec<Invocation>) -> Vec<u8> {
        ClientMessage {
            csrf_token: "token".into(),
            sync_id: Some(0),
            client_id,
            resynchronize: false,
            rpc,
        }
        .to_bytes()
        .unwrap()
    }

    fn click(f: &Fixture) -> Invocation {
        Invocation::new(f.field.clone(), "ClickRpc", "click", vec![])
    }

    fn handle(f: &mut Fixture, body: &[u8]) -> ServerMessage {
        f.comm.handle_request(&mut f.tracker, body).unwrap().unwrap()
    }

    #[test]
    fn bootstrap_carries_everything() {
        let mut tracker = ConnectorTracker::new();
        let root = tracker.create("Layout", &COMPONENT_STATE).unwrap();
        tracker.set_root(&root).unwrap();
        let mut comm = CommunicationManager::new(&Config::default(), "token".into());

        let message = comm.bootstrap(&mut tracker);
        assert_eq!(message.sync_id, Some(0));
        assert_eq!(message.client_id, Some(0));
        assert_eq!(message.root, Some(root));
        assert_eq!(message.meta.csrf_token.as_deref(), Some("token"));
        assert_eq!(message.state.len(), 1);
    }

    #[test]
    fn sequential_requests_are_processed() {
        let mut f = fixture(Config::default());
        let body = request(0, vec![click(&f)]);
        let response = handle(&mut f, &body);
        assert_eq!(response.sync_id, Some(1));
        assert_eq!(response.client_id, Some(1));
        assert!(!response.resynchronize);
        assert_eq!(f.clicks.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_request_is_ignored_and_repaints() {
        let mut f = fixture(Config::default());
        let body = request(0, vec![click(&f)]);
        handle(&mut f, &body);
        let response = handle(&mut f, &body);

        assert_eq!(f.clicks.load(Ordering::SeqCst), 1);
        assert!(response.resynchronize);
        assert!(response.meta.repaint_all);
        assert_eq!(response.root, Some(f.root.clone()));
        assert_eq!(response.state.len(), 2);
        assert_eq!(response.client_id, Some(1));
    }

    #[test]
    fn request_from_the_future_is_ignored() {
        let mut f = fixture(Config::default());
        let body = request(3, vec![click(&f)]);
        let response = handle(&mut f, &body);
        assert_eq!(f.clicks.load(Ordering::SeqCst), 0);
        assert!(response.resynchronize);
        assert_eq!(f.comm.expected_client_id(), 0);
    }

    #[test]
    fn wrong_token_is_rejected() {
        let mut f = fixture(Config::default());
        let mut message = ClientMessage::from_bytes(&request(0, vec![click(&f)])).unwrap();
        message.csrf_token = "forged".into();
        assert!(matches!(
            f.comm.handle_request(&mut f.tracker, &message.to_bytes().unwrap()),
            Err(SyncError::InvalidSecurityKey)
        ));
        assert_eq!(f.clicks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn empty_and_malformed_bodies() {
        let mut f = fixture(Config::default());
        assert!(f.comm.handle_request(&mut f.tracker, b"  \n").unwrap().is_none());
        assert!(matches!(
            f.comm.handle_request(&mut f.tracker, b"{\"clientId\":"),
            Err(SyncError::MalformedMessage(_))
        ));
        assert_eq!(f.comm.next_sync_id(), 1);
    }

    #[test]
    fn variable_changes_update_state_in_same_cycle() {
        let mut f = fixture(Config::default());
        let field = f.field.clone();
        let body = request(
            0,
            vec![
                Invocation::variable(field.clone(), "text", &Value::from("a")),
                Invocation::variable(field.clone(), "text", &Value::from("ab")),
            ],
        );
        let response = handle(&mut f, &body);
        assert_eq!(response.state.len(), 1);
        assert_eq!(response.state[0].diff, json!({ "caption": "ab" }));
    }

    #[test]
    fn disabled_connectors_ignore_invocations() {
        let mut f = fixture(Config::default());
        let root = f.root.clone();
        f.tracker.get_mut(root.as_str()).unwrap().set("enabled", false).unwrap();
        f.tracker.collect_changes(0);

        let body = request(0, vec![click(&f)]);
        handle(&mut f, &body);
        assert_eq!(f.clicks.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_handler_is_surfaced_when_strict() {
        let body = |f: &Fixture| request(0, vec![Invocation::new(f.field.clone(), "Nope", "nope", vec![])]);

        let mut lenient = fixture(Config::default());
        let b = body(&lenient);
        assert!(handle(&mut lenient, &b).meta.app_error.is_none());

        let mut strict = fixture(Config {
            strict_rpc: true,
            ..Config::default()
        });
        let b = body(&strict);
        assert!(handle(&mut strict, &b).meta.app_error.is_some());
    }

    #[test]
    fn push_does_not_carry_client_id() {
        let mut f = fixture(Config::default());
        let field = f.field.clone();
        f.tracker.get_mut(field.as_str()).unwrap().set("caption", "pushed").unwrap();
        let push = f.comm.push_message(&mut f.tracker);
        assert!(push.meta.is_async);
        assert_eq!(push.client_id, None);
        assert_eq!(push.sync_id, Some(1));
        assert_eq!(push.state.len(), 1);
    }

    #[test]
    fn invocations_run_in_arrival_order() {
        let mut f = fixture(Config::default());
        let log = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
        let slider = f.tracker.create("Slider", &COMPONENT_STATE).unwrap();
        f.tracker.add_child(&f.root, &slider).unwrap();

        let connector = f.tracker.get_mut(slider.as_str()).unwrap();
        let calls = log.clone();
        connector.register_rpc(
            RpcInterface::new("MoveRpc")
                .method("moved", &[TypeTag::Int], move |_, args| {
                    calls.lock().push(format!("moved {}", args[0].as_int().unwrap_or_default()));
                    Ok(())
                })
                .unwrap(),
        );
        let variables = log.clone();
        connector.on_variables(move |_, changes| {
            for (name, value) in changes {
                variables.lock().push(format!("{} = {}", name, value.as_int().unwrap_or_default()));
            }
            Ok(())
        });

        let moved = |n: i64| Invocation::new(slider.clone(), "MoveRpc", "moved", vec![json!(n)]);
        let body = request(
            0,
            vec![
                moved(1),
                Invocation::variable(slider.clone(), "value", &Value::Int(5)),
                Invocation::variable(slider.clone(), "value", &Value::Int(6)),
                moved(2),
                moved(3),
            ],
        );
        handle(&mut f, &body);

        assert_eq!(*log.lock(), vec!["moved 1", "value = 6", "moved 2", "moved 3"]);
    }
}
