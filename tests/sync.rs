//! End-to-end: a server session and a client connection talking through byte buffers.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use vireo::vireo_core::client::{ApplicationState, ClientConfig, Delivery};
use vireo::vireo_core::shared_state;
use vireo::vireo_core::state::{State, COMPONENT_STATE};
use vireo::vireo_core::{
    ClientConnection, Connector, ConnectorId, Invocation, RpcError, RpcInterface, ServerMessage,
    TypeTag, Value, WidgetSet,
};
use vireo::{Config, Host, PushMode, ServerConnector, Session};

shared_state! {
    static MOUSE_DETAILS = "MouseEventDetails" {
        button: TypeTag::Enum(&["left", "middle", "right"]),
        client_x: TypeTag::Int,
        client_y: TypeTag::Int,
        shift_key: TypeTag::Bool,
    }
}

shared_state! {
    static CHECKBOX_STATE = "CheckBoxState" extends COMPONENT_STATE {
        checked: TypeTag::Bool,
    }
}

shared_state! {
    static LAYOUT_STATE = "LayoutState" extends COMPONENT_STATE {
        spacing: TypeTag::Bool => true,
    }
}

static SET_CHECKED: [TypeTag; 2] = [TypeTag::Bool, TypeTag::Record(&MOUSE_DETAILS)];

type Log = Rc<RefCell<Vec<String>>>;

struct Widget {
    id: ConnectorId,
    log: Log,
}

impl Connector for Widget {
    fn init(&mut self, id: &ConnectorId) {
        self.log.borrow_mut().push(format!("init {}", id));
    }

    fn on_state_changed(&mut self, _: &State, changed: &[String]) {
        self.log.borrow_mut().push(format!("state {} {}", self.id, changed.join(",")));
    }

    fn on_children_changed(&mut self, _: &[ConnectorId]) {
        self.log.borrow_mut().push(format!("children {}", self.id));
    }

    fn on_unregister(&mut self) {
        self.log.borrow_mut().push(format!("destroy {}", self.id));
    }
}

struct Ids {
    layout1: ConnectorId,
    layout2: ConnectorId,
    checkbox: ConnectorId,
}

struct App {
    host: Host,
    session: Arc<Session>,
    client: ClientConnection,
    log: Log,
    ids: Ids,
}

fn set_checked(connector: &mut ServerConnector, args: &[Value]) -> Result<(), RpcError> {
    let checked = args[0].as_bool().unwrap_or_default();
    connector
        .set("checked", checked)
        .map_err(|e| RpcError::Handler(e.to_string()))
}

fn app(push_mode: PushMode) -> App {
    let host = Host::new(Config {
        push_mode,
        ..Config::default()
    });

    let mut ids = None;
    let (session, bootstrap) = host
        .open_session(|t| {
            let root = t.create("Layout", &LAYOUT_STATE)?;
            let layout1 = t.create("Layout", &LAYOUT_STATE)?;
            let layout2 = t.create("Layout", &LAYOUT_STATE)?;
            let checkbox = t.create("CheckBox", &CHECKBOX_STATE)?;
            t.set_root(&root)?;
            t.add_child(&root, &layout1)?;
            t.add_child(&root, &layout2)?;
            t.add_child(&layout1, &checkbox)?;
            t.get_mut(checkbox.as_str())?.register_rpc(
                RpcInterface::new("CheckBoxServerRpc")
                    .method("setChecked", &SET_CHECKED, set_checked)
                    .map_err(vireo::vireo_core::SyncError::from)?,
            );
            ids = Some(Ids {
                layout1,
                layout2,
                checkbox,
            });
            Ok(())
        })
        .unwrap();

    let log: Log = Rc::default();
    let mut widgets = WidgetSet::new();
    for (type_name, schema) in [("Layout", &LAYOUT_STATE), ("CheckBox", &CHECKBOX_STATE)] {
        let log = log.clone();
        widgets.register(type_name, schema, move |id| {
            Box::new(Widget {
                id: id.clone(),
                log: log.clone(),
            })
        });
    }
    let mut client = ClientConnection::new(widgets, ClientConfig::default());
    client.receive(&bootstrap, Instant::now()).unwrap();

    App {
        host,
        session,
        client,
        log,
        ids: ids.unwrap(),
    }
}

impl App {
    /// Sends the client's next request and returns the raw response.
    fn send(&mut self) -> Vec<u8> {
        let request = self.client.next_request().expect("nothing to send");
        self.host
            .handle_request(&self.session.id().to_string(), &request.to_bytes().unwrap())
            .unwrap()
    }

    fn round_trip(&mut self) -> Delivery {
        let response = self.send();
        self.client.receive(&response, Instant::now()).unwrap()
    }

    fn count(&self, entry: &str) -> usize {
        self.log.borrow().iter().filter(|l| *l == entry).count()
    }

    fn client_state(&self, id: &ConnectorId) -> &State {
        self.client.tree().state(id.as_str()).unwrap()
    }
}

#[test]
fn bootstrap_builds_client_tree() {
    let app = app(PushMode::Disabled);
    let tree = app.client.tree();
    assert_eq!(tree.len(), 4);
    assert_eq!(tree.parent(app.ids.checkbox.as_str()), Some(&app.ids.layout1));
    assert_eq!(app.client_state(&app.ids.layout1).get_bool("spacing"), Some(true));
    assert_eq!(app.count(&format!("init {}", app.ids.checkbox)), 1);
    assert_eq!(app.client.application_state(), ApplicationState::Running);
}

#[test]
fn state_change_sends_only_the_changed_field() {
    let app = app(PushMode::Automatic);
    let push = app.session.connect_push().unwrap();

    let checkbox = app.ids.checkbox.clone();
    app.session
        .access(|t| t.get_mut(checkbox.as_str()).unwrap().set("checked", true).unwrap())
        .unwrap();

    let message = ServerMessage::from_bytes(&push.try_recv().unwrap()).unwrap();
    assert_eq!(message.state.len(), 1);
    assert_eq!(message.state[0].connector, app.ids.checkbox);
    assert_eq!(message.state[0].diff, serde_json::json!({ "checked": true }));
    assert!(message.hierarchy.is_empty());
}

#[test]
fn server_rpc_result_is_in_the_same_response() {
    let mut app = app(PushMode::Disabled);

    let mut details = State::new(&MOUSE_DETAILS);
    details.set("button", Value::Enum("left".into())).unwrap();
    details.set("client_x", 12).unwrap();
    app.client.invoke(Invocation::with_values(
        app.ids.checkbox.clone(),
        "CheckBoxServerRpc",
        "setChecked",
        &[Value::Bool(true), Value::Record(details)],
    ));

    let response = ServerMessage::from_bytes(&app.send()).unwrap();
    assert_eq!(response.state.len(), 1);
    assert_eq!(response.state[0].diff, serde_json::json!({ "checked": true }));

    app.client.receive(&response.to_bytes().unwrap(), Instant::now()).unwrap();
    assert_eq!(app.client_state(&app.ids.checkbox).get_bool("checked"), Some(true));
    assert_eq!(app.count(&format!("state {} checked", app.ids.checkbox)), 1);
}

#[test]
fn moved_connector_is_initialized_once() {
    let mut app = app(PushMode::Automatic);
    let push = app.session.connect_push().unwrap();

    let (layout1, layout2, checkbox) = (
        app.ids.layout1.clone(),
        app.ids.layout2.clone(),
        app.ids.checkbox.clone(),
    );
    let children_before = app.count(&format!("children {}", layout2));
    app.session
        .access(|t| {
            t.remove_child(&layout1, &checkbox)?;
            t.add_child(&layout2, &checkbox)
        })
        .unwrap()
        .unwrap();

    let bytes = push.try_recv().unwrap();
    assert!(matches!(
        app.client.receive(&bytes, Instant::now()).unwrap(),
        Delivery::Applied { .. }
    ));

    assert_eq!(app.client.tree().parent(checkbox.as_str()), Some(&layout2));
    assert_eq!(app.count(&format!("init {}", checkbox)), 1);
    assert_eq!(app.count(&format!("destroy {}", checkbox)), 0);
    assert_eq!(app.count(&format!("children {}", layout2)), children_before + 1);
    assert!(app.session.access(|t| t.contains(checkbox.as_str())).unwrap());
}

#[test]
fn removed_connector_is_destroyed_on_both_sides() {
    let mut app = app(PushMode::Automatic);
    let push = app.session.connect_push().unwrap();

    let (layout1, checkbox) = (app.ids.layout1.clone(), app.ids.checkbox.clone());
    app.session
        .access(|t| t.remove_child(&layout1, &checkbox).unwrap())
        .unwrap();
    app.client.receive(&push.try_recv().unwrap(), Instant::now()).unwrap();

    assert!(!app.client.tree().contains(checkbox.as_str()));
    assert_eq!(app.count(&format!("destroy {}", checkbox)), 1);

    // an invocation racing the removal is ignored by the server
    app.client.invoke(Invocation::new(
        checkbox.clone(),
        "CheckBoxServerRpc",
        "setChecked",
        vec![serde_json::json!(true), serde_json::json!({})],
    ));
    app.round_trip();
    assert!(!app.session.access(|t| t.contains(checkbox.as_str())).unwrap());
}

#[test]
fn stale_push_after_resynchronize_is_discarded() {
    let mut app = app(PushMode::Manual);
    let push = app.session.connect_push().unwrap();
    let checkbox = app.ids.checkbox.clone();

    app.session
        .access(|t| t.get_mut(checkbox.as_str()).unwrap().set("caption", "pushed").unwrap())
        .unwrap();
    assert!(app.session.push().unwrap());
    let held = push.try_recv().unwrap();

    app.session
        .access(|t| t.get_mut(checkbox.as_str()).unwrap().set("caption", "later").unwrap())
        .unwrap();

    // the response overtakes the push and has to wait for it
    app.client.invoke(Invocation::new(
        checkbox.clone(),
        "CheckBoxServerRpc",
        "setChecked",
        vec![serde_json::json!(false), serde_json::json!({})],
    ));
    assert!(matches!(app.round_trip(), Delivery::Buffered { sync_id: 2 }));

    // the push never shows up, so the client resynchronizes
    assert!(app.client.check_timeouts(Instant::now() + Duration::from_secs(6)));
    assert!(matches!(app.round_trip(), Delivery::Applied { sync_id: 3, .. }));
    assert_eq!(app.client_state(&checkbox).get_str("caption"), Some("later"));

    assert_eq!(
        app.client.receive(&held, Instant::now()).unwrap(),
        Delivery::Dropped { sync_id: 1 }
    );
    assert_eq!(app.client_state(&checkbox).get_str("caption"), Some("later"));
}

#[test]
fn legacy_variables_coalesce_on_the_wire() {
    let mut app = app(PushMode::Disabled);
    let checkbox = app.ids.checkbox.clone();
    app.session
        .access(|t| {
            t.get_mut(checkbox.as_str()).unwrap().on_variables(|c, changes| {
                if let Some(text) = changes.get("text").and_then(Value::as_str) {
                    let text = text.to_string();
                    c.set("description", text)
                        .map_err(|e| RpcError::Handler(e.to_string()))?;
                }
                Ok(())
            })
        })
        .unwrap();

    app.client.set_variable(&checkbox, "text", "h");
    app.client.set_variable(&checkbox, "text", "hi");
    let request = app.client.next_request().unwrap();
    assert_eq!(request.rpc.len(), 1);

    let response = app
        .host
        .handle_request(&app.session.id().to_string(), &request.to_bytes().unwrap())
        .unwrap();
    app.client.receive(&response, Instant::now()).unwrap();
    assert_eq!(app.client_state(&checkbox).get_str("description"), Some("hi"));
}

#[test]
fn expired_session_stops_the_client() {
    let mut app = app(PushMode::Disabled);
    app.host.close_session(&app.session.id());

    app.client.invoke(Invocation::new(app.ids.checkbox.clone(), "FocusRpc", "focus", vec![]));
    assert!(matches!(app.round_trip(), Delivery::SessionExpired(_)));
    assert_eq!(app.client.application_state(), ApplicationState::Stopped);

    app.client.invoke(Invocation::new(app.ids.checkbox.clone(), "FocusRpc", "focus", vec![]));
    assert!(app.client.next_request().is_none());
}
