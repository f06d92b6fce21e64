// SPDX-FileCopyrightText: 2025 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2025 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Message framing over whatever byte stream connects us to the relay. The
//! session never sees bytes: [`Connection::start`] turns a stream into a
//! pair of channels carrying whole messages.

use crate::protocol::{ClientMessage, ProtocolError, ServerMessage};
use futures::{SinkExt, StreamExt};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tracing::{debug, error};

impl From<LinesCodecError> for ProtocolError {
    fn from(error: LinesCodecError) -> Self {
        match error {
            LinesCodecError::Io(error) => Self::Transport(error),
            other => Self::Transport(io::Error::new(io::ErrorKind::InvalidData, other.to_string())),
        }
    }
}

/// One newline-delimited JSON message per frame, in both directions.
pub struct Connection<S> {
    framed: Framed<S, LinesCodec>,
}

impl<S: AsyncRead + AsyncWrite + Unpin> Connection<S> {
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, LinesCodec::new()),
        }
    }

    /// Serializes synchronously, then writes the frame.
    pub async fn send(&mut self, message: &ClientMessage) -> Result<(), ProtocolError> {
        let line = message.to_json()?;
        self.framed.send(line).await?;
        Ok(())
    }

    /// The next message from the relay, or None once the stream is closed.
    /// A decode failure is fatal for the connection.
    pub async fn next_message(&mut self) -> Option<Result<ServerMessage, ProtocolError>> {
        match self.framed.next().await {
            None => None,
            Some(Err(error)) => Some(Err(error.into())),
            Some(Ok(line)) => Some(ServerMessage::from_json(&line)),
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> Connection<S> {
    /// Spawns the task that pumps both directions and returns the channel
    /// pair the client side talks to. Dropping the sender, or the relay
    /// closing the stream, ends the task; a protocol error ends it too and
    /// is only logged, because nothing about it is recoverable.
    pub fn start(stream: S) -> (mpsc::Sender<ClientMessage>, mpsc::Receiver<ServerMessage>) {
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(16);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerMessage>(16);

        let mut connection = Self::new(stream);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = outbound_rx.recv() => match outbound {
                        Some(message) => {
                            if let Err(error) = connection.send(&message).await {
                                error!("Failed to send to relay: {error:#}");
                                break;
                            }
                        }
                        None => {
                            debug!("Client side hung up, closing connection");
                            break;
                        }
                    },
                    inbound = connection.next_message() => match inbound {
                        Some(Ok(message)) => {
                            if inbound_tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(error)) => {
                            error!("Connection failed: {error:#}");
                            break;
                        }
                        None => {
                            debug!("Relay closed the connection");
                            break;
                        }
                    },
                }
            }
        });

        (outbound_tx, inbound_rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ClientEdit, ServerEvent};
    use crate::types::factories::*;
    use crate::types::ParticipantId;
    use pretty_assertions::assert_eq;

    fn client_edit(client_seq: u64) -> ClientMessage {
        ClientMessage::ClientEdit(ClientEdit {
            parent_seq: 0,
            client_seq,
            operations: vec![insert(0, "hi")],
        })
    }

    #[tokio::test]
    async fn frames_round_trip_across_a_stream() {
        let (client_stream, relay_stream) = tokio::io::duplex(1024);
        let mut client = Connection::new(client_stream);
        let mut relay = Connection::new(relay_stream);

        client.send(&client_edit(1)).await.unwrap();
        let line = relay.framed.next().await.unwrap().unwrap();
        assert_eq!(ClientMessage::from_json(&line).unwrap(), client_edit(1));

        let message = ServerMessage::Connected {
            id: ParticipantId(3),
        };
        relay.framed.send(message.to_json().unwrap()).await.unwrap();
        assert_eq!(client.next_message().await.unwrap().unwrap(), message);
    }

    #[tokio::test]
    async fn unknown_tag_is_a_decode_error() {
        let (client_stream, relay_stream) = tokio::io::duplex(1024);
        let mut client = Connection::new(client_stream);
        let mut relay = Connection::new(relay_stream);

        relay
            .framed
            .send(r#"{"SelfDestruct":{}}"#.to_string())
            .await
            .unwrap();
        let result = client.next_message().await.unwrap();
        assert!(matches!(result, Err(ProtocolError::Decode(_))));
    }

    #[tokio::test]
    async fn closed_stream_ends_the_message_stream() {
        let (client_stream, relay_stream) = tokio::io::duplex(1024);
        let mut client = Connection::new(client_stream);
        drop(relay_stream);
        assert!(client.next_message().await.is_none());
    }

    #[tokio::test]
    async fn start_bridges_messages_to_channels() {
        let (client_stream, relay_stream) = tokio::io::duplex(1024);
        let (outbound_tx, mut inbound_rx) = Connection::start(client_stream);
        let mut relay = Connection::new(relay_stream);

        let message = ServerMessage::Event(ServerEvent {
            seq: 1,
            client_seq: 0,
            event: edit_event(1, vec![insert(0, "x")]),
        });
        relay.framed.send(message.to_json().unwrap()).await.unwrap();
        assert_eq!(inbound_rx.recv().await.unwrap(), message);

        outbound_tx.send(client_edit(1)).await.unwrap();
        let line = relay.framed.next().await.unwrap().unwrap();
        assert_eq!(ClientMessage::from_json(&line).unwrap(), client_edit(1));
    }
}
