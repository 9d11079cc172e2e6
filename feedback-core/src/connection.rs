// Copyright 2025 AgentReplay (https://github.com/agentreplay)
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Session-side half of a duplex client connection.
//!
//! The transport keeps the receiving end and forwards frames to the socket.
//! The session owns the [`Connection`]; it is moved on handoff and never
//! cloned, so at most one session can write to a given client. Dropping it
//! closes the channel, which the transport turns into a socket close.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{FeedbackError, Result};
use crate::protocol::OutboundMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub struct Connection {
    id: ConnectionId,
    outbound: mpsc::UnboundedSender<OutboundMessage>,
}

impl Connection {
    /// Create a connection and the receiver the transport drains.
    pub fn channel() -> (Connection, mpsc::UnboundedReceiver<OutboundMessage>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (
            Connection {
                id: ConnectionId::new(),
                outbound,
            },
            rx,
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn send(&self, message: OutboundMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| FeedbackError::ConnectionClosed(self.id))
    }

    /// True once the transport dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.outbound.is_closed()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_after_transport_gone() {
        let (conn, rx) = Connection::channel();
        drop(rx);
        assert!(conn.is_closed());
        assert!(matches!(
            conn.send(OutboundMessage::error("x")),
            Err(FeedbackError::ConnectionClosed(id)) if id == conn.id()
        ));
    }

    #[tokio::test]
    async fn test_drop_closes_transport_side() {
        let (conn, mut rx) = Connection::channel();
        conn.send(OutboundMessage::error("first")).unwrap();
        drop(conn);
        assert_eq!(rx.recv().await.map(|m| m.kind()), Some("error"));
        assert!(rx.recv().await.is_none());
    }
}
