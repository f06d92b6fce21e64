// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! The wire contract between client and relay. One JSON document per frame,
//! externally tagged; a frame with an unknown tag must fail to decode.

use crate::types::{Event, Operation, ParticipantId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that end the connection. Unlike content errors, none of these are
/// recoverable: they mean the relay and this client disagree about the
/// protocol itself.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// A frame had an unknown tag or a malformed shape.
    #[error("could not decode message: {0}")]
    Decode(#[from] serde_json::Error),
    /// The relay announced a participant id a second time.
    #[error("relay sent a second Connected message")]
    AlreadyConnected,
    /// An edit had to be transformed against unacknowledged local edits
    /// before the relay ever told us who we are.
    #[error("relay sent an edit before assigning a participant id")]
    NotConnected,
    /// The byte stream below the framing failed or was cut.
    #[error("transport failed: {0}")]
    Transport(#[from] std::io::Error),
}

/// A batch of locally-authored operations, based on the last server
/// sequence number this client has seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientEdit {
    pub parent_seq: u64,
    pub client_seq: u64,
    pub operations: Vec<Operation>,
}

/// Everything a client may send to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClientMessage {
    ClientEdit(ClientEdit),
}

/// One sequenced event from the relay. `client_seq` acknowledges all of this
/// client's edits up to and including that number (0 if none yet).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEvent {
    pub seq: u64,
    pub client_seq: u64,
    pub event: Event,
}

/// Everything the relay may send to a client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerMessage {
    Connected { id: ParticipantId },
    Event(ServerEvent),
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }
}

impl ServerMessage {
    pub fn to_json(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::factories::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn client_edit_wire_shape() {
        let message = ClientMessage::ClientEdit(ClientEdit {
            parent_seq: 3,
            client_seq: 1,
            operations: vec![insert(0, "Hello"), delete(5, 7)],
        });
        let json = r#"{"ClientEdit":{"parent_seq":3,"client_seq":1,"operations":[{"Insert":{"pos":0,"content":"Hello"}},{"Delete":{"start":5,"end":7}}]}}"#;
        assert_eq!(message.to_json().unwrap(), json);
        assert_eq!(ClientMessage::from_json(json).unwrap(), message);
    }

    #[test]
    fn connected_wire_shape() {
        let message = ServerMessage::Connected {
            id: ParticipantId(42),
        };
        let json = r#"{"Connected":{"id":42}}"#;
        assert_eq!(message.to_json().unwrap(), json);
        assert_eq!(ServerMessage::from_json(json).unwrap(), message);
    }

    #[test]
    fn server_event_wire_shape() {
        let message = ServerMessage::Event(ServerEvent {
            seq: 7,
            client_seq: 0,
            event: edit_event(2, vec![move_cursor(4)]),
        });
        let json = r#"{"Event":{"seq":7,"client_seq":0,"event":{"Edit":{"author":2,"operations":[{"MoveCursor":{"pos":4}}]}}}}"#;
        assert_eq!(message.to_json().unwrap(), json);
        assert_eq!(ServerMessage::from_json(json).unwrap(), message);
    }

    #[test]
    fn join_and_leave_wire_shapes() {
        let join = ServerMessage::Event(ServerEvent {
            seq: 1,
            client_seq: 0,
            event: Event::Join {
                id: ParticipantId(5),
            },
        });
        assert_eq!(
            join.to_json().unwrap(),
            r#"{"Event":{"seq":1,"client_seq":0,"event":{"Join":{"id":5}}}}"#
        );
        let leave = ServerMessage::Event(ServerEvent {
            seq: 2,
            client_seq: 0,
            event: Event::Leave {
                id: ParticipantId(5),
            },
        });
        assert_eq!(
            leave.to_json().unwrap(),
            r#"{"Event":{"seq":2,"client_seq":0,"event":{"Leave":{"id":5}}}}"#
        );
    }

    #[test]
    fn unknown_tags_fail_to_decode() {
        assert!(ServerMessage::from_json(r#"{"Disconnected":{"id":1}}"#).is_err());
        assert!(ClientMessage::from_json(r#"{"ServerEdit":{"parent_seq":0}}"#).is_err());
        assert!(ServerMessage::from_json("[1,2,3]").is_err());
    }

    #[test]
    fn round_trip_preserves_messages() {
        let messages = vec![
            ServerMessage::Connected {
                id: ParticipantId(1),
            },
            ServerMessage::Event(ServerEvent {
                seq: 9,
                client_seq: 4,
                event: edit_event(1, vec![insert(3, "tö🥕"), delete(0, 1), move_cursor(2)]),
            }),
        ];
        for message in messages {
            let json = message.to_json().unwrap();
            assert_eq!(ServerMessage::from_json(&json).unwrap(), message);
        }
    }
}
