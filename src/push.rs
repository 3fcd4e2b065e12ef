//! The push channel: server-initiated messages outside any client request.

use crossbeam::channel::{self, Receiver, Sender};
use serde::Deserialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PushMode {
    /// No push channel.
    #[default]
    Disabled,
    /// Changes are pushed when the application calls `Session::push`.
    Manual,
    /// Changes made under `Session::access` are pushed when the lock is released.
    Automatic,
}

impl PushMode {
    pub fn is_enabled(self) -> bool {
        self != PushMode::Disabled
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Uninitialized,
    Connected,
    Disconnected,
}

/// The server end of one client's push channel.
///
/// Messages go out through a channel; the transport holding the receiver forwards them.
/// Dropping the receiver disconnects.
#[derive(Debug)]
pub struct PushConnection {
    state: ConnectionState,
    sender: Option<Sender<Vec<u8>>>,
}

impl Default for PushConnection {
    fn default() -> Self {
        PushConnection {
            state: ConnectionState::Uninitialized,
            sender: None,
        }
    }
}

impl PushConnection {
    pub fn new() -> PushConnection {
        PushConnection::default()
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    /// Opens the channel, replacing any previous connection.
    pub fn connect(&mut self) -> Receiver<Vec<u8>> {
        let (sender, receiver) = channel::unbounded();
        self.sender = Some(sender);
        self.state = ConnectionState::Connected;
        debug!("push connected");
        receiver
    }

    pub fn disconnect(&mut self) {
        if self.sender.take().is_some() {
            debug!("push disconnected");
        }
        if self.state == ConnectionState::Connected {
            self.state = ConnectionState::Disconnected;
        }
    }

    /// Sends one message. Returns false, and disconnects, if the other end is gone.
    pub fn send(&mut self, message: Vec<u8>) -> bool {
        let sent = match &self.sender {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        };
        if !sent {
            self.disconnect();
        }
        sent
    }
}
