// SPDX-FileCopyrightText: 2024 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2024 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Wires the session and the document into one task. The actor owns both and
//! runs every message to completion before taking the next one, so a
//! received event is always transformed and applied before any further
//! local write gets in.

use crate::connection::Connection;
use crate::document::{Document, EditError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::Session;
use crate::types::{Operation, Snapshot};
use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Messages sent to the task that owns the session and the document.
#[derive(Debug)]
pub enum SessionMessage {
    GetContent {
        response_tx: oneshot::Sender<String>,
    },
    GetSnapshot {
        response_tx: oneshot::Sender<Snapshot>,
    },
    /// The widget's full text and caret after a local change.
    Update { text: String, cursor: usize },
    /// Pre-made operations from a widget that tracks its own deltas.
    Edit { operations: Vec<Operation> },
    FromServer(ServerMessage),
}

/// What the host observes about the shared page.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    /// A relay message, rewritten against local unacknowledged edits and
    /// already applied to the document.
    Message(ServerMessage),
    /// A normalized batch of local operations went out to the relay.
    Change {
        parent_seq: u64,
        operations: Vec<Operation>,
    },
    /// A relay event failed validation; the document was left untouched and
    /// the host may want to reload a fresh snapshot.
    Error(EditError),
}

pub struct SessionActor {
    inbox: mpsc::Receiver<SessionMessage>,
    transport_tx: mpsc::Sender<ClientMessage>,
    notification_tx: mpsc::Sender<Notification>,
    session: Session,
    document: Document,
    flush_scheduled: bool,
}

impl SessionActor {
    #[must_use]
    fn new(
        inbox: mpsc::Receiver<SessionMessage>,
        transport_tx: mpsc::Sender<ClientMessage>,
        notification_tx: mpsc::Sender<Notification>,
        initial_seq: u64,
        snapshot: &Snapshot,
    ) -> Self {
        Self {
            inbox,
            transport_tx,
            notification_tx,
            session: Session::new(initial_seq),
            document: Document::new(initial_seq, snapshot),
            flush_scheduled: false,
        }
    }

    /// Runs until the inbox closes or the connection dies. Local writes mark
    /// a flush; before flushing, everything already queued behind the
    /// triggering message is handled too, so a burst of change notifications
    /// coalesces into a single ClientEdit.
    pub async fn run(&mut self) -> Result<()> {
        while let Some(message) = self.inbox.recv().await {
            self.handle_message(message).await?;
            if self.flush_scheduled {
                while let Ok(queued) = self.inbox.try_recv() {
                    self.handle_message(queued).await?;
                }
                self.flush().await?;
            }
        }
        debug!("Session inbox closed, shutting down");
        Ok(())
    }

    async fn handle_message(&mut self, message: SessionMessage) -> Result<()> {
        match message {
            SessionMessage::GetContent { response_tx } => {
                let _ = response_tx.send(self.document.content());
            }
            SessionMessage::GetSnapshot { response_tx } => {
                let _ = response_tx.send(self.document.snapshot());
            }
            SessionMessage::Update { text, cursor } => {
                let operations = self.document.update(&text, cursor);
                self.write(operations);
            }
            SessionMessage::Edit { operations } => {
                self.write(operations);
            }
            SessionMessage::FromServer(message) => {
                // Protocol errors are fatal for the whole session.
                let transformed = self
                    .session
                    .receive(message)
                    .context("Relay broke the protocol")?;
                match &transformed {
                    ServerMessage::Connected { id } => {
                        self.document.set_local_id(*id);
                    }
                    ServerMessage::Event(server_event) => {
                        if let Err(error) =
                            self.document.apply_event(server_event.seq, &server_event.event)
                        {
                            warn!("Rejected event at seq {}: {error}", server_event.seq);
                            self.notify(Notification::Error(error)).await?;
                            return Ok(());
                        }
                    }
                }
                self.notify(Notification::Message(transformed)).await?;
            }
        }
        Ok(())
    }

    fn write(&mut self, operations: Vec<Operation>) {
        if self.session.enqueue(operations) {
            self.flush_scheduled = true;
        }
    }

    async fn flush(&mut self) -> Result<()> {
        self.flush_scheduled = false;
        if let Some(edit) = self.session.flush() {
            let notification = Notification::Change {
                parent_seq: edit.parent_seq,
                operations: edit.operations.clone(),
            };
            self.transport_tx
                .send(ClientMessage::ClientEdit(edit))
                .await
                .context("Transport task is gone")?;
            self.notify(notification).await?;
        }
        Ok(())
    }

    async fn notify(&self, notification: Notification) -> Result<()> {
        self.notification_tx
            .send(notification)
            .await
            .context("Nobody listens to notifications anymore")
    }
}

/// Handle to a running session task, the host's way into the page.
#[derive(Clone)]
pub struct Client {
    session_tx: mpsc::Sender<SessionMessage>,
}

impl Client {
    /// Starts the session actor on an already-established message channel
    /// pair, e.g. from [`Connection::start`] or an in-memory transport in
    /// tests. Returns the handle and the notification stream.
    #[must_use]
    pub fn start(
        initial_seq: u64,
        snapshot: &Snapshot,
        transport_tx: mpsc::Sender<ClientMessage>,
        mut server_rx: mpsc::Receiver<ServerMessage>,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let (session_tx, session_rx) = mpsc::channel(16);
        let (notification_tx, notification_rx) = mpsc::channel(16);

        let mut actor = SessionActor::new(
            session_rx,
            transport_tx,
            notification_tx,
            initial_seq,
            snapshot,
        );
        tokio::spawn(async move {
            if let Err(error) = actor.run().await {
                warn!("Session ended: {error:#}");
            }
        });

        let forward_tx = session_tx.clone();
        tokio::spawn(async move {
            while let Some(message) = server_rx.recv().await {
                if forward_tx
                    .send(SessionMessage::FromServer(message))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        (Self { session_tx }, notification_rx)
    }

    /// Convenience constructor: frames the given stream and starts the
    /// session on top of it.
    #[must_use]
    pub fn connect<S>(
        stream: S,
        initial_seq: u64,
        snapshot: &Snapshot,
    ) -> (Self, mpsc::Receiver<Notification>)
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (transport_tx, server_rx) = Connection::start(stream);
        Self::start(initial_seq, snapshot, transport_tx, server_rx)
    }

    /// Hands the widget's current text and caret to the session.
    pub async fn update(&self, text: String, cursor: usize) -> Result<()> {
        self.session_tx
            .send(SessionMessage::Update { text, cursor })
            .await
            .context("Session task is gone")
    }

    /// Queues pre-made operations.
    pub async fn edit(&self, operations: Vec<Operation>) -> Result<()> {
        self.session_tx
            .send(SessionMessage::Edit { operations })
            .await
            .context("Session task is gone")
    }

    pub async fn content(&self) -> Result<String> {
        let (response_tx, response_rx) = oneshot::channel();
        self.session_tx
            .send(SessionMessage::GetContent { response_tx })
            .await
            .context("Session task is gone")?;
        response_rx.await.context("Session task dropped the query")
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        let (response_tx, response_rx) = oneshot::channel();
        self.session_tx
            .send(SessionMessage::GetSnapshot { response_tx })
            .await
            .context("Session task is gone")?;
        response_rx.await.context("Session task dropped the query")
    }
}
