// SPDX-FileCopyrightText: 2024 blinry <mail@blinry.org>
// SPDX-FileCopyrightText: 2024 zormit <nt4u@kpvn.de>
//
// SPDX-License-Identifier: AGPL-3.0-or-later

use crate::protocol::{ClientEdit, ProtocolError, ServerMessage};
use crate::types::{Edit, Event, Operation, ParticipantId};
use tracing::{debug, warn};

/// Bookkeeping for one connection to the relay. The session never owns the
/// page text; it owns the operations that are on their way.
///
/// Outbound, operations pass through two stages:
///
/// ```text
///     widget ──> outbox ── flush ──> sent ── ack ──> gone
/// ```
///
/// The outbox holds operations the relay has not seen at all; `flush` turns
/// them into one ClientEdit, normalizing away cursor noise. The sent list
/// holds flushed edits until the relay acknowledges them via the
/// `client_seq` it echoes on its events.
///
/// Inbound, every event is rewritten through the sent list before anyone
/// else sees it: those edits are applied locally but unknown to the relay,
/// so from this replica's point of view the incoming event is concurrent
/// with each of them. Outbox operations are deliberately *not* part of that
/// rewrite: once flushed they carry the post-event sequence number as their
/// parent, which orders them after the event on the relay.
///
/// To keep this testable and sync, the functions here only calculate; the
/// sending and the timing live in the client actor.
#[derive(Debug, Default)]
pub struct Session {
    /// Highest server sequence number observed.
    seq: u64,
    /// Ordinal of the last ClientEdit we produced.
    client_seq: u64,
    participant_id: Option<ParticipantId>,
    /// Flushed but unacknowledged edits, in client_seq order.
    sent: Vec<ClientEdit>,
    /// Operations queued for the next flush.
    outbox: Vec<Operation>,
    /// Last operation of the previously flushed edit, so a redundant cursor
    /// hint right after it can be dropped.
    last_operation: Option<Operation>,
}

impl Session {
    #[must_use]
    pub fn new(initial_seq: u64) -> Self {
        Self {
            seq: initial_seq,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn seq(&self) -> u64 {
        self.seq
    }

    #[must_use]
    pub fn participant_id(&self) -> Option<ParticipantId> {
        self.participant_id
    }

    /// Number of flushed edits the relay has not acknowledged yet.
    #[must_use]
    pub fn unacknowledged(&self) -> usize {
        self.sent.len()
    }

    /// Takes one message from the relay and returns it rewritten for the
    /// content layer. Must be called for every message, in delivery order,
    /// and the result must be applied before the next local write.
    pub fn receive(&mut self, message: ServerMessage) -> Result<ServerMessage, ProtocolError> {
        match message {
            ServerMessage::Connected { id } => {
                if self.participant_id.is_some() {
                    return Err(ProtocolError::AlreadyConnected);
                }
                debug!("Connected as participant {id}");
                self.participant_id = Some(id);
                Ok(ServerMessage::Connected { id })
            }
            ServerMessage::Event(mut server_event) => {
                self.seq = server_event.seq;
                let acknowledged = server_event.client_seq;
                let before = self.sent.len();
                self.sent.retain(|edit| edit.client_seq > acknowledged);
                debug!(
                    "Relay acknowledged {} edit(s), {} still unacknowledged",
                    before - self.sent.len(),
                    self.sent.len()
                );
                if self.sent.len() > 50 {
                    warn!(
                        "{} unacknowledged edits, is the relay falling behind?",
                        self.sent.len()
                    );
                }

                if let Event::Edit(ref mut edit) = server_event.event {
                    if !self.sent.is_empty() {
                        let local_id =
                            self.participant_id.ok_or(ProtocolError::NotConnected)?;
                        for unacknowledged in &self.sent {
                            let concurrent = Event::Edit(Edit {
                                author: local_id,
                                operations: unacknowledged.operations.clone(),
                            });
                            edit.transform(&concurrent);
                        }
                    }
                }

                self.last_operation = None;
                Ok(ServerMessage::Event(server_event))
            }
        }
    }

    /// Queues operations for the next flush. Returns true when a flush needs
    /// to be scheduled, i.e. when these are the first operations since the
    /// outbox was last drained.
    pub fn enqueue(&mut self, operations: Vec<Operation>) -> bool {
        let was_empty = self.outbox.is_empty();
        self.outbox.extend(operations);
        was_empty && !self.outbox.is_empty()
    }

    /// Drains the outbox into a single ClientEdit.
    ///
    /// Content-changing operations always survive. Cursor-only operations
    /// (empty inserts, empty deletes, MoveCursor) are hints: only the newest
    /// one can matter, and even that one is dropped when the operation kept
    /// before it already leaves the cursor at the same place.
    pub fn flush(&mut self) -> Option<ClientEdit> {
        let queued = self.outbox.len();
        let mut last = self.last_operation.take();
        let mut prepared = Vec::with_capacity(queued);
        for (index, operation) in self.outbox.drain(..).enumerate() {
            let keep = if operation.changes_content() {
                true
            } else {
                index + 1 == queued
                    && last.as_ref().map_or(true, |kept| {
                        kept.cursor_position_after() != operation.cursor_position_after()
                    })
            };
            if keep {
                last = Some(operation.clone());
                prepared.push(operation);
            }
        }
        self.last_operation = last;

        if prepared.is_empty() {
            return None;
        }

        self.client_seq += 1;
        let edit = ClientEdit {
            parent_seq: self.seq,
            client_seq: self.client_seq,
            operations: prepared,
        };
        debug!(
            "Flushing edit {} with {} operation(s), based on seq {}",
            edit.client_seq,
            edit.operations.len(),
            edit.parent_seq
        );
        self.sent.push(edit.clone());
        Some(edit)
    }
}
